//! Connection pool and server reputation
//!
//! Connections are checked out for exactly one request and either returned
//! healthy or discarded; discards trigger asynchronous replacement up to
//! the min-idle bound. A rolling window of outcomes per server feeds the
//! down-weight the upload engine uses for backpressure.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use super::nntp::{Credentials, NntpConnection};
use crate::config::WireSection;
use crate::{Error, Result};

/// Connections idle longer than this are closed instead of reused.
const MAX_IDLE: Duration = Duration::from_secs(60);

/// Reputation window length.
const WINDOW: Duration = Duration::from_secs(60);

/// Failure rate above this starts down-weighting the server.
const FAILURE_THRESHOLD: f64 = 0.3;

#[derive(Debug, Default)]
struct Reputation {
    outcomes: VecDeque<(Instant, bool, Duration)>,
}

impl Reputation {
    fn record(&mut self, success: bool, latency: Duration) {
        let now = Instant::now();
        self.outcomes.push_back((now, success, latency));
        while let Some((at, _, _)) = self.outcomes.front() {
            if now.duration_since(*at) > WINDOW {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|(_, ok, _)| !ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    fn down_weight(&self) -> f64 {
        let rate = self.failure_rate();
        if rate <= FAILURE_THRESHOLD {
            0.0
        } else {
            ((rate - FAILURE_THRESHOLD) / (1.0 - FAILURE_THRESHOLD)).clamp(0.0, 1.0)
        }
    }

    fn mean_latency_ms(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let total: u128 = self
            .outcomes
            .iter()
            .map(|(_, _, latency)| latency.as_millis())
            .sum();
        total as f64 / self.outcomes.len() as f64
    }
}

/// Point-in-time health snapshot for one upstream server.
#[derive(Debug, Clone)]
pub struct ServerHealth {
    pub failure_rate: f64,
    pub down_weight: f64,
    pub mean_latency_ms: f64,
    pub idle_connections: usize,
}

pub struct ConnectionPool {
    config: WireSection,
    credentials: Credentials,
    idle: Mutex<Vec<NntpConnection>>,
    permits: Arc<Semaphore>,
    reputation: StdMutex<Reputation>,
}

/// A checked-out connection; holds its concurrency permit until returned.
pub struct PooledConnection {
    pub conn: NntpConnection,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionPool {
    pub fn new(config: WireSection, credentials: Credentials) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.pool.max_active));
        Arc::new(Self {
            config,
            credentials,
            idle: Mutex::new(Vec::new()),
            permits,
            reputation: StdMutex::new(Reputation::default()),
        })
    }

    /// Check a connection out, reusing a fresh idle one when available.
    /// Blocks until a permit frees up, bounded by the connect timeout.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let permit = tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            self.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connection pool exhausted",
            ))
        })?
        .map_err(|_| Error::protocol("connection pool closed"))?;

        loop {
            let candidate = self.idle.lock().await.pop();
            match candidate {
                Some(conn) if conn.is_healthy() && conn.idle_for() < MAX_IDLE => {
                    return Ok(PooledConnection {
                        conn,
                        _permit: permit,
                    });
                }
                Some(mut stale) => {
                    stale.quit().await;
                    continue;
                }
                None => break,
            }
        }

        let conn = NntpConnection::connect(&self.config, &self.credentials).await?;
        Ok(PooledConnection {
            conn,
            _permit: permit,
        })
    }

    /// Return a connection after one request. Healthy connections go back
    /// to the idle stack; unhealthy ones are dropped and replaced in the
    /// background up to min-idle.
    pub async fn release(self: &Arc<Self>, pooled: PooledConnection, healthy: bool) {
        let PooledConnection { mut conn, _permit } = pooled;
        if healthy && conn.is_healthy() {
            self.idle.lock().await.push(conn);
            return;
        }
        conn.quit().await;
        drop(conn);

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let deficit = {
                let idle = pool.idle.lock().await;
                pool.config.pool.min_idle.saturating_sub(idle.len())
            };
            if deficit == 0 {
                return;
            }
            match NntpConnection::connect(&pool.config, &pool.credentials).await {
                Ok(replacement) => pool.idle.lock().await.push(replacement),
                Err(e) => {
                    tracing::warn!("idle replacement connect failed: {}", e);
                }
            }
        });
    }

    pub fn record_outcome(&self, success: bool, latency: Duration) {
        self.reputation
            .lock()
            .expect("reputation lock poisoned")
            .record(success, latency);
    }

    pub fn down_weight(&self) -> f64 {
        self.reputation
            .lock()
            .expect("reputation lock poisoned")
            .down_weight()
    }

    pub async fn health(&self) -> ServerHealth {
        let idle = self.idle.lock().await.len();
        let reputation = self.reputation.lock().expect("reputation lock poisoned");
        ServerHealth {
            failure_rate: reputation.failure_rate(),
            down_weight: reputation.down_weight(),
            mean_latency_ms: reputation.mean_latency_ms(),
            idle_connections: idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reputation_window() {
        let mut rep = Reputation::default();
        for _ in 0..7 {
            rep.record(true, Duration::from_millis(20));
        }
        for _ in 0..3 {
            rep.record(false, Duration::from_millis(500));
        }
        assert!((rep.failure_rate() - 0.3).abs() < 1e-9);
        assert_eq!(rep.down_weight(), 0.0);

        for _ in 0..10 {
            rep.record(false, Duration::from_millis(500));
        }
        assert!(rep.failure_rate() > 0.3);
        assert!(rep.down_weight() > 0.0);
        assert!(rep.down_weight() <= 1.0);
    }

    #[test]
    fn test_healthy_reputation_has_no_weight() {
        let mut rep = Reputation::default();
        rep.record(true, Duration::from_millis(15));
        assert_eq!(rep.down_weight(), 0.0);
        assert!(rep.mean_latency_ms() > 0.0);
    }
}
