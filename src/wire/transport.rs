//! Article transport seam
//!
//! The wire client formats articles (headers, yEnc body, obfuscated
//! fields) and drives retries; the transport moves a finished article to
//! and from a substrate. Production uses the pooled NNTP transport; tests
//! and dry runs use the in-memory one.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{Error, Result};

/// A fully formed article ready to cross the wire.
#[derive(Debug, Clone)]
pub struct Article {
    /// Header name/value pairs in posting order. Must include Message-ID,
    /// Subject, and Newsgroups.
    pub headers: Vec<(String, String)>,
    /// Raw 8-bit body lines without terminators; dot-stuffing is the
    /// transport's job.
    pub body: Vec<Vec<u8>>,
}

impl Article {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.header("Message-ID")
    }

    pub fn set_message_id(&mut self, message_id: &str) {
        for (k, v) in &mut self.headers {
            if k.eq_ignore_ascii_case("Message-ID") {
                *v = message_id.to_string();
                return;
            }
        }
        self.headers
            .push(("Message-ID".to_string(), message_id.to_string()));
    }
}

/// Result of one posting attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    Accepted,
    /// Server refused the message id as already seen; the client
    /// regenerates once before treating it as fatal.
    DuplicateMessageId,
}

#[async_trait]
pub trait ArticleTransport: Send + Sync {
    /// Post one article to its group.
    async fn post(&self, article: &Article) -> Result<PostOutcome>;

    /// Retrieve an article body by group and message id.
    async fn fetch(&self, group: &str, message_id: &str) -> Result<Vec<Vec<u8>>>;

    /// Current down-weight in [0, 1]: 0 = healthy, 1 = fully down-weighted.
    /// Drives upload backpressure.
    fn down_weight(&self) -> f64;
}

/// In-memory substrate: articles keyed by (group, message id). Used by the
/// test suite and by dry-run posting. Supports fault injection so
/// redundancy fallback and retry paths can be exercised.
#[derive(Default)]
pub struct MemoryTransport {
    articles: DashMap<(String, String), Article>,
    /// Message ids that fetch as missing regardless of contents.
    vanished: DashMap<String, ()>,
    /// When set, every post fails transiently (server-busy simulation).
    refuse_posts: std::sync::atomic::AtomicBool,
    /// Posts remaining before the server starts refusing; negative means
    /// unlimited.
    post_budget: std::sync::atomic::AtomicI64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            post_budget: std::sync::atomic::AtomicI64::new(-1),
            ..Self::default()
        }
    }

    pub fn article_count(&self) -> usize {
        self.articles.len()
    }

    pub fn message_ids(&self) -> Vec<String> {
        self.articles
            .iter()
            .map(|entry| entry.key().1.clone())
            .collect()
    }

    /// Simulate articles expiring or never propagating.
    pub fn vanish(&self, message_id: &str) {
        self.vanished.insert(message_id.to_string(), ());
    }

    /// Undo a `vanish`, as when a lagging peer finally carries the article.
    pub fn restore(&self, message_id: &str) {
        self.vanished.remove(message_id);
    }

    pub fn set_refuse_posts(&self, refuse: bool) {
        self.refuse_posts
            .store(refuse, std::sync::atomic::Ordering::SeqCst);
    }

    /// Accept exactly `n` more posts, then refuse transiently. Pass a
    /// negative value to lift the limit.
    pub fn set_post_budget(&self, n: i64) {
        self.post_budget
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// Message ids of stored articles posted under `subject`.
    pub fn message_ids_for_subject(&self, subject: &str) -> Vec<String> {
        self.articles
            .iter()
            .filter(|entry| entry.value().header("Subject") == Some(subject))
            .map(|entry| entry.key().1.clone())
            .collect()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.articles
            .iter()
            .filter_map(|entry| entry.value().header("Subject").map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl ArticleTransport for MemoryTransport {
    async fn post(&self, article: &Article) -> Result<PostOutcome> {
        if self.refuse_posts.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::protocol("441 posting failed (simulated)"));
        }
        loop {
            let budget = self.post_budget.load(std::sync::atomic::Ordering::SeqCst);
            if budget < 0 {
                break;
            }
            if budget == 0 {
                return Err(Error::protocol("441 posting failed (budget exhausted)"));
            }
            if self
                .post_budget
                .compare_exchange(
                    budget,
                    budget - 1,
                    std::sync::atomic::Ordering::SeqCst,
                    std::sync::atomic::Ordering::SeqCst,
                )
                .is_ok()
            {
                break;
            }
        }
        let message_id = article
            .message_id()
            .ok_or_else(|| Error::protocol("article without Message-ID"))?
            .to_string();
        let group = article
            .header("Newsgroups")
            .ok_or_else(|| Error::protocol("article without Newsgroups"))?
            .to_string();

        let key = (group, message_id.clone());
        if self.articles.contains_key(&key)
            || self
                .articles
                .iter()
                .any(|entry| entry.key().1 == message_id)
        {
            return Ok(PostOutcome::DuplicateMessageId);
        }
        self.articles.insert(key, article.clone());
        Ok(PostOutcome::Accepted)
    }

    async fn fetch(&self, group: &str, message_id: &str) -> Result<Vec<Vec<u8>>> {
        if self.vanished.contains_key(message_id) {
            return Err(Error::NotFound(format!("430 no such article {}", message_id)));
        }
        self.articles
            .get(&(group.to_string(), message_id.to_string()))
            .map(|entry| entry.value().body.clone())
            .ok_or_else(|| Error::NotFound(format!("430 no such article {}", message_id)))
    }

    fn down_weight(&self) -> f64 {
        0.0
    }
}
