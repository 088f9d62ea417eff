//! Wire client
//!
//! Serializes segment payloads into posted articles and back: yEnc
//! framing, rotated persona headers, obfuscated subject/message-id
//! placement, transparent multi-part stitching when the substrate's
//! per-article cap is smaller than the segment, duplicate-message-id
//! recovery, and the retry budget. Upper layers see one segment ↔ one
//! logical article.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::headers::Persona;
use super::pool::{ConnectionPool, ServerHealth};
use super::retry::with_retry;
use super::transport::{Article, ArticleTransport, PostOutcome};
use super::yenc;
use crate::config::WireSection;
use crate::crypto::obfuscate;
use crate::types::ArticleRef;
use crate::{Error, Result};

pub struct WireClient {
    transport: Arc<dyn ArticleTransport>,
    config: WireSection,
    groups: Vec<String>,
    group_cursor: AtomicUsize,
    persona: Persona,
}

impl WireClient {
    pub fn new(
        transport: Arc<dyn ArticleTransport>,
        config: WireSection,
        groups: Vec<String>,
    ) -> Self {
        Self {
            transport,
            config,
            groups,
            group_cursor: AtomicUsize::new(0),
            persona: Persona::next_session(),
        }
    }

    /// Round-robin across the configured posting groups.
    fn next_group(&self) -> String {
        let idx = self.group_cursor.fetch_add(1, Ordering::Relaxed);
        self.groups[idx % self.groups.len()].clone()
    }

    fn base_headers(&self, subject: &str, group: &str) -> Vec<(String, String)> {
        vec![
            ("From".to_string(), self.persona.from.to_string()),
            ("Subject".to_string(), subject.to_string()),
            ("Newsgroups".to_string(), group.to_string()),
            (
                "Date".to_string(),
                chrono::Utc::now().to_rfc2822(),
            ),
            (
                "User-Agent".to_string(),
                self.persona.user_agent.to_string(),
            ),
            (
                "Organization".to_string(),
                self.persona.organization.to_string(),
            ),
            ("X-UsenetSync".to_string(), "1.0".to_string()),
        ]
    }

    /// Post one article, regenerating the message id once if the server
    /// reports it as a duplicate. Returns the accepted message id.
    async fn post_article(&self, mut article: Article) -> Result<String> {
        for regenerated in [false, true] {
            article.set_message_id(&obfuscate::message_id()?);
            let attempt = article.clone();
            let transport = Arc::clone(&self.transport);
            let outcome = with_retry(&self.config.retry, false, move || {
                let article = attempt.clone();
                let transport = Arc::clone(&transport);
                async move { transport.post(&article).await }
            })
            .await?;
            match outcome {
                PostOutcome::Accepted => {
                    return Ok(article
                        .message_id()
                        .expect("message id set above")
                        .to_string())
                }
                PostOutcome::DuplicateMessageId if !regenerated => {
                    tracing::warn!("duplicate message-id reported, regenerating");
                }
                PostOutcome::DuplicateMessageId => {
                    return Err(Error::protocol(
                        "server reported duplicate message-id twice",
                    ))
                }
            }
        }
        unreachable!("loop returns on second iteration");
    }

    /// Post an encrypted segment payload under its posted subject. Splits
    /// into stitched multi-part articles when the payload exceeds the
    /// substrate's per-article cap.
    pub async fn post_segment(&self, subject: &str, payload: &[u8]) -> Result<ArticleRef> {
        let group = self.next_group();
        let limit = self.config.article_size_limit.max(1) as usize;

        let mut part_ids = Vec::new();
        if payload.len() <= limit {
            let body = yenc::encode_single(subject, payload);
            let article = Article {
                headers: self.base_headers(subject, &group),
                body,
            };
            part_ids.push(self.post_article(article).await?);
        } else {
            let whole = yenc::whole_crc(payload);
            let chunks: Vec<&[u8]> = payload.chunks(limit).collect();
            let total = chunks.len() as u32;
            for (i, chunk) in chunks.iter().enumerate() {
                let begin = (i * limit) as u64;
                let info = yenc::PartInfo {
                    part: i as u32 + 1,
                    total,
                    begin,
                    end: begin + chunk.len() as u64,
                };
                let whole_crc = (i + 1 == chunks.len()).then_some(whole);
                let body =
                    yenc::encode_part(subject, payload.len() as u64, &info, chunk, whole_crc);
                let article = Article {
                    headers: self.base_headers(subject, &group),
                    body,
                };
                part_ids.push(self.post_article(article).await?);
            }
        }

        Ok(ArticleRef {
            group,
            parts: part_ids,
        })
    }

    /// Retrieve a segment payload: fetch every part, yEnc-decode, verify
    /// CRCs, stitch. A missing article surfaces as `NotFound` after the
    /// retry budget so the caller can fall back across redundancy copies.
    pub async fn fetch_segment(&self, article_ref: &ArticleRef) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        let mut whole_crc = None;
        let multi_part = article_ref.parts.len() > 1;

        for (i, message_id) in article_ref.parts.iter().enumerate() {
            let transport = Arc::clone(&self.transport);
            let group = article_ref.group.clone();
            let message_id_owned = message_id.clone();
            let body = with_retry(&self.config.retry, true, move || {
                let transport = Arc::clone(&transport);
                let group = group.clone();
                let message_id = message_id_owned.clone();
                async move { transport.fetch(&group, &message_id).await }
            })
            .await?;

            let decoded = yenc::decode(&body)?;
            if multi_part {
                match decoded.part {
                    Some(part) if part == i as u32 + 1 => {}
                    other => {
                        return Err(Error::integrity(format!(
                            "part number mismatch: expected {}, got {:?}",
                            i + 1,
                            other
                        )))
                    }
                }
            }
            if decoded.whole_crc.is_some() {
                whole_crc = decoded.whole_crc;
            }
            payload.extend_from_slice(&decoded.data);
        }

        if multi_part {
            let expected =
                whole_crc.ok_or_else(|| Error::integrity("missing whole-message CRC"))?;
            yenc::verify_whole(&payload, expected)?;
        }
        Ok(payload)
    }

    /// Server down-weight for backpressure decisions.
    pub fn down_weight(&self) -> f64 {
        self.transport.down_weight()
    }
}

/// Production transport: the connection pool speaking NNTP.
pub struct NntpTransport {
    pool: Arc<ConnectionPool>,
}

impl NntpTransport {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub async fn server_health(&self) -> ServerHealth {
        self.pool.health().await
    }
}

#[async_trait]
impl ArticleTransport for NntpTransport {
    async fn post(&self, article: &Article) -> Result<PostOutcome> {
        let mut pooled = self.pool.acquire().await?;
        let started = Instant::now();
        let result = pooled.conn.post(article).await;
        let healthy = !matches!(result, Err(Error::Io(_)) | Err(Error::Protocol(_)));
        self.pool.record_outcome(result.is_ok(), started.elapsed());
        self.pool.release(pooled, healthy).await;
        result
    }

    async fn fetch(&self, group: &str, message_id: &str) -> Result<Vec<Vec<u8>>> {
        let mut pooled = self.pool.acquire().await?;
        let started = Instant::now();
        let result = async {
            pooled.conn.group(group).await?;
            pooled.conn.body(message_id).await
        }
        .await;
        // A missing article is a clean outcome, not a sick connection.
        let healthy = matches!(result, Ok(_) | Err(Error::NotFound(_)));
        self.pool
            .record_outcome(healthy, started.elapsed());
        self.pool.release(pooled, healthy).await;
        result
    }

    fn down_weight(&self) -> f64 {
        self.pool.down_weight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::transport::MemoryTransport;

    fn client(transport: Arc<MemoryTransport>) -> WireClient {
        let mut config = WireSection::default();
        config.host = "news.test.invalid".to_string();
        config.retry.base_ms = 1;
        config.retry.cap_ms = 2;
        config.article_size_limit = 2048;
        WireClient::new(
            transport,
            config,
            vec![
                "alt.binaries.one".to_string(),
                "alt.binaries.two".to_string(),
            ],
        )
    }

    #[tokio::test]
    async fn test_single_part_round_trip() {
        let transport = Arc::new(MemoryTransport::new());
        let client = client(Arc::clone(&transport));
        let payload = vec![0x5Au8; 1500];

        let article_ref = client
            .post_segment("RandomSubjectNoMeaning", &payload)
            .await
            .unwrap();
        assert_eq!(article_ref.parts.len(), 1);
        assert_eq!(transport.article_count(), 1);

        let fetched = client.fetch_segment(&article_ref).await.unwrap();
        assert_eq!(fetched, payload);
    }

    #[tokio::test]
    async fn test_multi_part_stitching() {
        let transport = Arc::new(MemoryTransport::new());
        let client = client(Arc::clone(&transport));
        // 5000 bytes over a 2048 cap = 3 parts.
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();

        let article_ref = client
            .post_segment("AnotherOpaqueSubject", &payload)
            .await
            .unwrap();
        assert_eq!(article_ref.parts.len(), 3);
        assert_eq!(transport.article_count(), 3);

        let fetched = client.fetch_segment(&article_ref).await.unwrap();
        assert_eq!(fetched, payload);
    }

    #[tokio::test]
    async fn test_groups_rotate() {
        let transport = Arc::new(MemoryTransport::new());
        let client = client(Arc::clone(&transport));
        let a = client.post_segment("SubjA", b"one").await.unwrap();
        let b = client.post_segment("SubjB", b"two").await.unwrap();
        assert_ne!(a.group, b.group);
    }

    #[tokio::test]
    async fn test_missing_article_surfaces_not_found() {
        let transport = Arc::new(MemoryTransport::new());
        let client = client(Arc::clone(&transport));
        let article_ref = client.post_segment("SubjC", b"payload").await.unwrap();
        transport.vanish(&article_ref.parts[0]);

        let err = client.fetch_segment(&article_ref).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_headers_carry_no_payload_information() {
        let transport = Arc::new(MemoryTransport::new());
        let client = client(Arc::clone(&transport));
        client
            .post_segment("OpaqueSubjectValue123", b"secret payload bytes")
            .await
            .unwrap();

        let subjects = transport.subjects();
        assert_eq!(subjects, vec!["OpaqueSubjectValue123".to_string()]);
    }
}
