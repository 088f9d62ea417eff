//! NNTP protocol client
//!
//! Line-based, TLS-wrapped dialect: greeting, AUTHINFO, GROUP, POST, BODY,
//! DATE, QUIT. One connection serves one request at a time; the pool owns
//! checkout discipline. All reads and writes sit under the configured
//! request timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};

use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::transport::{Article, PostOutcome};
use crate::config::WireSection;
use crate::{Error, Result};

/// Decrypted credentials handed in by the engine; never stored here.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub struct NntpConnection {
    stream: BufStream<Box<dyn AsyncStream>>,
    request_timeout: Duration,
    last_used: Instant,
    healthy: bool,
}

/// One parsed status line.
#[derive(Debug, Clone)]
pub struct Response {
    pub code: u16,
    pub text: String,
}

impl NntpConnection {
    /// Establish, greet, and authenticate.
    pub async fn connect(config: &WireSection, credentials: &Credentials) -> Result<Self> {
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let request_timeout = Duration::from_millis(config.request_timeout_ms);

        let tcp = tokio::time::timeout(
            connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {}:{} timed out", config.host, config.port),
            ))
        })??;
        tcp.set_nodelay(true)?;

        let stream: Box<dyn AsyncStream> = if config.tls {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
                .map_err(|e| Error::config(format!("invalid TLS server name: {}", e)))?;
            Box::new(connector.connect(server_name, tcp).await?)
        } else {
            Box::new(tcp)
        };

        let mut conn = Self {
            stream: BufStream::new(stream),
            request_timeout,
            last_used: Instant::now(),
            healthy: true,
        };

        // 200 = posting allowed, 201 = read-only.
        let greeting = conn.read_response().await?;
        if greeting.code != 200 && greeting.code != 201 {
            return Err(Error::protocol(format!(
                "unexpected greeting: {} {}",
                greeting.code, greeting.text
            )));
        }

        if let Some(username) = &credentials.username {
            let response = conn
                .command(&format!("AUTHINFO USER {}", username))
                .await?;
            match response.code {
                281 => {}
                381 => {
                    let password = credentials.password.as_deref().unwrap_or_default();
                    let response = conn
                        .command(&format!("AUTHINFO PASS {}", password))
                        .await?;
                    if response.code != 281 {
                        return Err(Error::Auth(format!(
                            "{} {}",
                            response.code, response.text
                        )));
                    }
                }
                code => return Err(Error::Auth(format!("{} {}", code, response.text))),
            }
        }

        Ok(conn)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<Response> {
        let mut line = String::new();
        let read = tokio::time::timeout(self.request_timeout, self.stream.read_line(&mut line))
            .await
            .map_err(|_| {
                self.healthy = false;
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "response timed out",
                ))
            })?;
        let n = read?;
        if n == 0 {
            self.healthy = false;
            return Err(Error::protocol("connection closed mid-response"));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let (code, text) = trimmed.split_at(trimmed.len().min(3));
        let code: u16 = code
            .parse()
            .map_err(|_| {
                self.healthy = false;
                Error::protocol(format!("malformed status line: {}", trimmed))
            })?;
        self.last_used = Instant::now();
        Ok(Response {
            code,
            text: text.trim_start().to_string(),
        })
    }

    async fn command(&mut self, line: &str) -> Result<Response> {
        self.write_line(line).await?;
        self.stream.flush().await?;
        self.read_response().await
    }

    /// Read a dot-terminated multi-line block of raw 8-bit lines,
    /// un-stuffing leading dots.
    async fn read_block(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut lines = Vec::new();
        loop {
            let mut line: Vec<u8> = Vec::new();
            let read = tokio::time::timeout(
                self.request_timeout,
                self.stream.read_until(b'\n', &mut line),
            )
            .await
            .map_err(|_| {
                self.healthy = false;
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "body read timed out",
                ))
            })?;
            if read? == 0 {
                self.healthy = false;
                return Err(Error::protocol("connection closed mid-body"));
            }
            while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
                line.pop();
            }
            if line == b"." {
                break;
            }
            if line.starts_with(b"..") {
                line.remove(0);
            }
            lines.push(line);
        }
        self.last_used = Instant::now();
        Ok(lines)
    }

    /// Select a group. 211 on success, 411 unknown group.
    pub async fn group(&mut self, group: &str) -> Result<()> {
        let response = self.command(&format!("GROUP {}", group)).await?;
        match response.code {
            211 => Ok(()),
            411 => Err(Error::NotFound(format!("411 no such group {}", group))),
            code => Err(Error::protocol(format!("{} {}", code, response.text))),
        }
    }

    /// Post one article. Dot-stuffs body lines on the way out.
    pub async fn post(&mut self, article: &Article) -> Result<PostOutcome> {
        let response = self.command("POST").await?;
        if response.code != 340 {
            if response.code == 440 {
                return Err(Error::Auth(format!("440 {}", response.text)));
            }
            return Err(Error::protocol(format!(
                "{} {}",
                response.code, response.text
            )));
        }

        for (name, value) in &article.headers {
            self.write_line(&format!("{}: {}", name, value)).await?;
        }
        self.write_line("").await?;
        for line in &article.body {
            if line.first() == Some(&b'.') {
                self.stream.write_all(b".").await?;
            }
            self.stream.write_all(line).await?;
            self.stream.write_all(b"\r\n").await?;
        }
        self.write_line(".").await?;
        self.stream.flush().await?;

        let response = self.read_response().await?;
        match response.code {
            240 => Ok(PostOutcome::Accepted),
            435 => Ok(PostOutcome::DuplicateMessageId),
            441 if response.text.to_ascii_lowercase().contains("dup") => {
                Ok(PostOutcome::DuplicateMessageId)
            }
            441 => Err(Error::protocol(format!("441 {}", response.text))),
            code => Err(Error::protocol(format!("{} {}", code, response.text))),
        }
    }

    /// Fetch an article body by message id within the current group.
    pub async fn body(&mut self, message_id: &str) -> Result<Vec<Vec<u8>>> {
        let response = self.command(&format!("BODY {}", message_id)).await?;
        match response.code {
            222 => self.read_block().await,
            430 => Err(Error::NotFound(format!(
                "430 no such article {}",
                message_id
            ))),
            code => Err(Error::protocol(format!("{} {}", code, response.text))),
        }
    }

    /// Round-trip liveness probe.
    pub async fn ping(&mut self) -> Result<()> {
        let response = self.command("DATE").await?;
        if response.code != 111 {
            self.healthy = false;
            return Err(Error::protocol(format!(
                "{} {}",
                response.code, response.text
            )));
        }
        Ok(())
    }

    pub async fn quit(&mut self) {
        let _ = self.command("QUIT").await;
    }
}
