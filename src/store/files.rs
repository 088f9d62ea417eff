//! File-entry repository
//!
//! FileEntries are versioned: `version_first_seen` tags the version that
//! introduced the observation, `version_last_seen` stays null while the
//! path is current and is set when the path disappears. Bulk inserts run
//! in batches inside the caller's transaction.

use super::backend::{Row, Value};
use super::{parse_ts, ts, Tx};
use crate::types::{FileEntry, FileKind};
use crate::Result;

const BATCH: usize = 1000;

const FILE_COLUMNS: &str = "file_id, folder_id, relative_path, kind, size, content_hash,
    version_first_seen, version_last_seen, modified_at, error";

fn file_from_row(row: &Row) -> Result<FileEntry> {
    Ok(FileEntry {
        file_id: row.text(0)?.to_string(),
        folder_id: row.text(1)?.to_string(),
        relative_path: row.text(2)?.to_string(),
        kind: match row.text(3)? {
            "directory" => FileKind::Directory,
            _ => FileKind::File,
        },
        size: row.u64(4)?,
        content_hash: row.text(5)?.to_string(),
        version_first_seen: row.u64(6)?,
        version_last_seen: row.opt_u64(7)?,
        modified_at: parse_ts(row.text(8)?)?,
        error: row.opt_text(9)?.map(str::to_string),
    })
}

fn kind_str(kind: FileKind) -> &'static str {
    match kind {
        FileKind::File => "file",
        FileKind::Directory => "directory",
    }
}

impl Tx<'_> {
    /// Insert new file entries in batches of 1000.
    pub async fn insert_file_entries(&mut self, entries: &[FileEntry]) -> Result<()> {
        for batch in entries.chunks(BATCH) {
            for entry in batch {
                let params: Vec<Value> = vec![
                    entry.file_id.as_str().into(),
                    entry.folder_id.as_str().into(),
                    entry.relative_path.as_str().into(),
                    kind_str(entry.kind).into(),
                    entry.size.into(),
                    entry.content_hash.as_str().into(),
                    entry.version_first_seen.into(),
                    entry.version_last_seen.into(),
                    ts(entry.modified_at).into(),
                    entry.error.as_deref().into(),
                ];
                self.execute(
                    "INSERT INTO files (file_id, folder_id, relative_path, kind, size,
                        content_hash, version_first_seen, version_last_seen, modified_at, error)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                    &params,
                )
                .await?;
            }
        }
        Ok(())
    }

    pub async fn get_file(&mut self, file_id: &str) -> Result<Option<FileEntry>> {
        let sql = format!("SELECT {} FROM files WHERE file_id = $1", FILE_COLUMNS);
        match self.query_opt(&sql, &[file_id.into()]).await? {
            Some(row) => Ok(Some(file_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// The live snapshot: entries whose path still exists, ordered by
    /// relative path so independent runs converge.
    pub async fn current_files(&mut self, folder_id: &str) -> Result<Vec<FileEntry>> {
        let sql = format!(
            "SELECT {} FROM files
             WHERE folder_id = $1 AND version_last_seen IS NULL
             ORDER BY relative_path",
            FILE_COLUMNS
        );
        self.query(&sql, &[folder_id.into()])
            .await?
            .iter()
            .map(file_from_row)
            .collect()
    }

    /// Entries visible at a given historical version.
    pub async fn files_at_version(
        &mut self,
        folder_id: &str,
        version: u64,
    ) -> Result<Vec<FileEntry>> {
        let sql = format!(
            "SELECT {} FROM files
             WHERE folder_id = $1
               AND version_first_seen <= $2
               AND (version_last_seen IS NULL OR version_last_seen >= $3)
             ORDER BY relative_path",
            FILE_COLUMNS
        );
        self.query(&sql, &[folder_id.into(), version.into(), version.into()])
            .await?
            .iter()
            .map(file_from_row)
            .collect()
    }

    /// Entries first observed at exactly `version` (added or modified in
    /// that indexing run); these are the segmentation staging set.
    pub async fn files_first_seen_at(
        &mut self,
        folder_id: &str,
        version: u64,
    ) -> Result<Vec<FileEntry>> {
        let sql = format!(
            "SELECT {} FROM files
             WHERE folder_id = $1 AND version_first_seen = $2
             ORDER BY relative_path",
            FILE_COLUMNS
        );
        self.query(&sql, &[folder_id.into(), version.into()])
            .await?
            .iter()
            .map(file_from_row)
            .collect()
    }

    /// Close out entries whose paths vanished: their last seen version is
    /// the one before the current indexing run.
    pub async fn mark_files_removed(
        &mut self,
        file_ids: &[String],
        last_seen_version: u64,
    ) -> Result<()> {
        for file_id in file_ids {
            self.execute(
                "UPDATE files SET version_last_seen = $1 WHERE file_id = $2",
                &[last_seen_version.into(), file_id.as_str().into()],
            )
            .await?;
        }
        Ok(())
    }

    /// Fetch one page of a version's entries, keyed past `after_path`.
    /// Lets callers walk arbitrarily large folders without materializing
    /// the whole listing; returns fewer than `limit` rows on the last page.
    pub async fn files_at_version_page(
        &mut self,
        folder_id: &str,
        version: u64,
        after_path: Option<&str>,
        limit: u64,
    ) -> Result<Vec<FileEntry>> {
        let sql = format!(
            "SELECT {} FROM files
             WHERE folder_id = $1
               AND version_first_seen <= $2
               AND (version_last_seen IS NULL OR version_last_seen >= $3)
               AND relative_path > $4
             ORDER BY relative_path
             LIMIT {}",
            FILE_COLUMNS, limit
        );
        self.query(
            &sql,
            &[
                folder_id.into(),
                version.into(),
                version.into(),
                after_path.unwrap_or("").into(),
            ],
        )
        .await?
        .iter()
        .map(file_from_row)
        .collect()
    }

    pub async fn set_file_error(&mut self, file_id: &str, message: &str) -> Result<()> {
        self.execute(
            "UPDATE files SET error = $1 WHERE file_id = $2",
            &[message.into(), file_id.into()],
        )
        .await?;
        Ok(())
    }
}
