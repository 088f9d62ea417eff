//! Schema and migrations
//!
//! One ordered migration list shared by both backends. DDL is written
//! against placeholders for the two spots the dialects disagree on
//! (surrogate primary keys and blob column types); everything else is
//! common SQL. Timestamps are stored as RFC 3339 text.

use super::backend::{Dialect, SqlBackend};
use crate::Result;

struct Migration {
    version: i64,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    statements: &[
        "CREATE TABLE meta (
            key TEXT PRIMARY KEY,
            value {blob} NOT NULL
        )",
        "CREATE TABLE users (
            id {pk},
            user_id TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            public_key {blob} NOT NULL,
            private_key_enc {blob} NOT NULL
        )",
        "CREATE TABLE folders (
            id {pk},
            folder_id TEXT NOT NULL UNIQUE,
            path TEXT NOT NULL,
            version BIGINT NOT NULL,
            status TEXT NOT NULL,
            public_key {blob} NOT NULL,
            private_key_enc {blob} NOT NULL,
            file_count BIGINT NOT NULL DEFAULT 0,
            total_bytes BIGINT NOT NULL DEFAULT 0,
            segment_count BIGINT NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        "CREATE TABLE files (
            id {pk},
            file_id TEXT NOT NULL UNIQUE,
            folder_id TEXT NOT NULL REFERENCES folders(folder_id) ON DELETE CASCADE,
            relative_path TEXT NOT NULL,
            kind TEXT NOT NULL,
            size BIGINT NOT NULL,
            content_hash TEXT NOT NULL,
            version_first_seen BIGINT NOT NULL,
            version_last_seen BIGINT,
            modified_at TEXT NOT NULL,
            error TEXT
        )",
        "CREATE INDEX idx_files_folder_path
            ON files(folder_id, relative_path, version_first_seen)",
        "CREATE INDEX idx_files_folder_current
            ON files(folder_id, version_last_seen)",
        "CREATE TABLE packs (
            id {pk},
            pack_id TEXT NOT NULL UNIQUE,
            folder_id TEXT NOT NULL REFERENCES folders(folder_id) ON DELETE CASCADE,
            version BIGINT NOT NULL
        )",
        "CREATE TABLE pack_members (
            id {pk},
            pack_id TEXT NOT NULL REFERENCES packs(pack_id) ON DELETE CASCADE,
            file_id TEXT NOT NULL,
            offset_in_pack BIGINT NOT NULL,
            length BIGINT NOT NULL
        )",
        "CREATE INDEX idx_pack_members_pack ON pack_members(pack_id)",
        "CREATE TABLE segments (
            id {pk},
            segment_id TEXT NOT NULL UNIQUE,
            folder_id TEXT NOT NULL REFERENCES folders(folder_id) ON DELETE CASCADE,
            version BIGINT NOT NULL,
            owner_kind TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            segment_index BIGINT NOT NULL,
            redundancy_index BIGINT NOT NULL,
            offset_bytes BIGINT NOT NULL,
            length_bytes BIGINT NOT NULL,
            content_hash TEXT NOT NULL,
            payload_hash TEXT NOT NULL DEFAULT '',
            article_ref_enc {blob},
            posted_subject TEXT NOT NULL UNIQUE,
            internal_subject TEXT NOT NULL,
            state TEXT NOT NULL,
            retry_count BIGINT NOT NULL DEFAULT 0
        )",
        "CREATE INDEX idx_segments_folder_version ON segments(folder_id, version)",
        "CREATE INDEX idx_segments_owner ON segments(owner_id, segment_index, redundancy_index)",
        "CREATE TABLE shares (
            id {pk},
            share_id TEXT NOT NULL UNIQUE,
            folder_id TEXT NOT NULL REFERENCES folders(folder_id) ON DELETE CASCADE,
            folder_version BIGINT NOT NULL,
            tier TEXT NOT NULL,
            index_ref_enc {blob} NOT NULL,
            owner_id TEXT NOT NULL,
            auth {blob} NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT,
            revoked BIGINT NOT NULL DEFAULT 0
        )",
        "CREATE TABLE commitments (
            id {pk},
            share_id TEXT NOT NULL REFERENCES shares(share_id) ON DELETE CASCADE,
            commitment {blob} NOT NULL,
            wrapped_key {blob} NOT NULL
        )",
        "CREATE INDEX idx_commitments_share ON commitments(share_id)",
        "CREATE TABLE upload_sessions (
            id {pk},
            session_id TEXT NOT NULL UNIQUE,
            subject_id TEXT NOT NULL,
            destination TEXT,
            total_count BIGINT NOT NULL DEFAULT 0,
            completed_count BIGINT NOT NULL DEFAULT 0,
            failed_count BIGINT NOT NULL DEFAULT 0,
            total_bytes BIGINT NOT NULL DEFAULT 0,
            transferred_bytes BIGINT NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            error_kind TEXT,
            error_message TEXT,
            events {blob},
            started_at TEXT NOT NULL,
            ended_at TEXT
        )",
        "CREATE TABLE download_sessions (
            id {pk},
            session_id TEXT NOT NULL UNIQUE,
            subject_id TEXT NOT NULL,
            destination TEXT,
            total_count BIGINT NOT NULL DEFAULT 0,
            completed_count BIGINT NOT NULL DEFAULT 0,
            failed_count BIGINT NOT NULL DEFAULT 0,
            total_bytes BIGINT NOT NULL DEFAULT 0,
            transferred_bytes BIGINT NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            error_kind TEXT,
            error_message TEXT,
            events {blob},
            started_at TEXT NOT NULL,
            ended_at TEXT
        )",
        "CREATE TABLE upload_queue (
            id {pk},
            session_id TEXT NOT NULL,
            segment_id TEXT NOT NULL REFERENCES segments(segment_id) ON DELETE CASCADE,
            priority BIGINT NOT NULL,
            state TEXT NOT NULL,
            retry_count BIGINT NOT NULL DEFAULT 0,
            not_before TEXT NOT NULL,
            lease_expires_at TEXT,
            worker_id TEXT
        )",
        "CREATE INDEX idx_upload_queue_claim
            ON upload_queue(state, priority, not_before, id)",
        "CREATE INDEX idx_upload_queue_session ON upload_queue(session_id)",
        "CREATE TABLE download_queue (
            id {pk},
            session_id TEXT NOT NULL,
            plan_key TEXT NOT NULL,
            plan_blob {blob} NOT NULL,
            state TEXT NOT NULL,
            retry_count BIGINT NOT NULL DEFAULT 0,
            not_before TEXT NOT NULL,
            lease_expires_at TEXT,
            worker_id TEXT
        )",
        "CREATE INDEX idx_download_queue_claim
            ON download_queue(state, not_before, id)",
        "CREATE INDEX idx_download_queue_session ON download_queue(session_id)",
        "CREATE TABLE server_credentials (
            id {pk},
            host TEXT NOT NULL,
            port BIGINT NOT NULL,
            username_enc {blob},
            password_enc {blob},
            created_at TEXT NOT NULL
        )",
        "CREATE UNIQUE INDEX idx_server_credentials_endpoint
            ON server_credentials(host, port)",
    ],
}];

fn render(sql: &str, dialect: Dialect) -> String {
    let (pk, blob) = match dialect {
        Dialect::Sqlite => ("INTEGER PRIMARY KEY AUTOINCREMENT", "BLOB"),
        Dialect::Postgres => ("BIGSERIAL PRIMARY KEY", "BYTEA"),
    };
    sql.replace("{pk}", pk).replace("{blob}", blob)
}

/// Apply any migrations not yet recorded, each batch in one transaction.
pub async fn apply_migrations(backend: &mut dyn SqlBackend) -> Result<()> {
    let dialect = backend.dialect();
    backend
        .execute(
            &render(
                "CREATE TABLE IF NOT EXISTS migrations (
                    version BIGINT PRIMARY KEY,
                    applied_at TEXT NOT NULL
                )",
                dialect,
            ),
            &[],
        )
        .await?;

    let applied = backend
        .query("SELECT version FROM migrations ORDER BY version", &[])
        .await?
        .iter()
        .map(|row| row.i64(0))
        .collect::<Result<Vec<_>>>()?;

    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }
        tracing::info!(version = migration.version, "applying store migration");
        backend.execute("BEGIN", &[]).await?;
        let mut failed = None;
        for statement in migration.statements {
            if let Err(e) = backend.execute(&render(statement, dialect), &[]).await {
                failed = Some(e);
                break;
            }
        }
        if let Some(e) = failed {
            backend.execute("ROLLBACK", &[]).await.ok();
            return Err(e);
        }
        backend
            .execute(
                "INSERT INTO migrations (version, applied_at) VALUES ($1, $2)",
                &[
                    migration.version.into(),
                    chrono::Utc::now().to_rfc3339().into(),
                ],
            )
            .await?;
        backend.execute("COMMIT", &[]).await?;
    }
    Ok(())
}
