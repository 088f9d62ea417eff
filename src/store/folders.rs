//! Folder repository

use super::backend::Row;
use super::{parse_ts, ts, Tx};
use crate::types::{Folder, FolderStats, FolderStatus};
use crate::{Error, Result};

const FOLDER_COLUMNS: &str = "folder_id, path, version, status, public_key, private_key_enc,
    file_count, total_bytes, segment_count, created_at, updated_at";

fn folder_from_row(row: &Row) -> Result<Folder> {
    Ok(Folder {
        folder_id: row.text(0)?.to_string(),
        path: row.text(1)?.to_string(),
        version: row.u64(2)?,
        status: FolderStatus::parse(row.text(3)?)?,
        public_key: row.blob(4)?.to_vec(),
        private_key_enc: row.blob(5)?.to_vec(),
        stats: FolderStats {
            file_count: row.u64(6)?,
            total_bytes: row.u64(7)?,
            segment_count: row.u64(8)?,
        },
        created_at: parse_ts(row.text(9)?)?,
        updated_at: parse_ts(row.text(10)?)?,
    })
}

impl Tx<'_> {
    pub async fn insert_folder(&mut self, folder: &Folder) -> Result<()> {
        self.execute(
            "INSERT INTO folders (folder_id, path, version, status, public_key,
                private_key_enc, file_count, total_bytes, segment_count, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            &[
                folder.folder_id.as_str().into(),
                folder.path.as_str().into(),
                folder.version.into(),
                folder.status.as_str().into(),
                folder.public_key.as_slice().into(),
                folder.private_key_enc.as_slice().into(),
                folder.stats.file_count.into(),
                folder.stats.total_bytes.into(),
                folder.stats.segment_count.into(),
                ts(folder.created_at).into(),
                ts(folder.updated_at).into(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_folder(&mut self, folder_id: &str) -> Result<Option<Folder>> {
        let sql = format!(
            "SELECT {} FROM folders WHERE folder_id = $1",
            FOLDER_COLUMNS
        );
        match self.query_opt(&sql, &[folder_id.into()]).await? {
            Some(row) => Ok(Some(folder_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Fetch or fail; most call sites treat a missing folder as a policy
    /// error rather than an optional value.
    pub async fn require_folder(&mut self, folder_id: &str) -> Result<Folder> {
        self.get_folder(folder_id)
            .await?
            .ok_or_else(|| Error::policy(format!("unknown folder: {}", folder_id)))
    }

    pub async fn get_folder_by_path(&mut self, path: &str) -> Result<Option<Folder>> {
        let sql = format!("SELECT {} FROM folders WHERE path = $1", FOLDER_COLUMNS);
        match self.query_opt(&sql, &[path.into()]).await? {
            Some(row) => Ok(Some(folder_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_folders(&mut self) -> Result<Vec<Folder>> {
        let sql = format!("SELECT {} FROM folders ORDER BY folder_id", FOLDER_COLUMNS);
        self.query(&sql, &[])
            .await?
            .iter()
            .map(folder_from_row)
            .collect()
    }

    /// Persist a lifecycle transition after DAG validation.
    pub async fn update_folder_status(
        &mut self,
        folder_id: &str,
        status: FolderStatus,
    ) -> Result<()> {
        self.execute(
            "UPDATE folders SET status = $1, updated_at = $2 WHERE folder_id = $3",
            &[
                status.as_str().into(),
                ts(chrono::Utc::now()).into(),
                folder_id.into(),
            ],
        )
        .await?;
        Ok(())
    }

    /// Atomically advance the version counter and return the new value.
    pub async fn bump_folder_version(&mut self, folder_id: &str) -> Result<u64> {
        self.execute(
            "UPDATE folders SET version = version + 1, updated_at = $1 WHERE folder_id = $2",
            &[ts(chrono::Utc::now()).into(), folder_id.into()],
        )
        .await?;
        let row = self
            .query_opt(
                "SELECT version FROM folders WHERE folder_id = $1",
                &[folder_id.into()],
            )
            .await?
            .ok_or_else(|| Error::storage(format!("unknown folder: {}", folder_id)))?;
        row.u64(0)
    }

    pub async fn update_folder_stats(
        &mut self,
        folder_id: &str,
        stats: FolderStats,
    ) -> Result<()> {
        self.execute(
            "UPDATE folders SET file_count = $1, total_bytes = $2, segment_count = $3,
                updated_at = $4
             WHERE folder_id = $5",
            &[
                stats.file_count.into(),
                stats.total_bytes.into(),
                stats.segment_count.into(),
                ts(chrono::Utc::now()).into(),
                folder_id.into(),
            ],
        )
        .await?;
        Ok(())
    }

    /// Remove a folder; files, segments, packs, shares, and commitments
    /// cascade. Substrate articles are untouched (write-once model).
    pub async fn delete_folder(&mut self, folder_id: &str) -> Result<bool> {
        let affected = self
            .execute(
                "DELETE FROM folders WHERE folder_id = $1",
                &[folder_id.into()],
            )
            .await?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::super::tests::open_temp;
    use crate::types::{Folder, FolderStats, FolderStatus};
    use chrono::Utc;

    pub(crate) fn sample_folder(id: &str) -> Folder {
        Folder {
            folder_id: id.to_string(),
            path: format!("/data/{}", id),
            version: 1,
            status: FolderStatus::Added,
            public_key: vec![1; 32],
            private_key_enc: vec![2; 60],
            stats: FolderStats::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_folder_crud() {
        let (_dir, store) = open_temp().await;
        let mut tx = store.begin().await.unwrap();
        tx.insert_folder(&sample_folder("f1")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let folder = tx.get_folder("f1").await.unwrap().unwrap();
        assert_eq!(folder.version, 1);
        assert_eq!(folder.status, FolderStatus::Added);

        tx.update_folder_status("f1", FolderStatus::Indexing)
            .await
            .unwrap();
        assert_eq!(
            tx.get_folder("f1").await.unwrap().unwrap().status,
            FolderStatus::Indexing
        );

        assert_eq!(tx.bump_folder_version("f1").await.unwrap(), 2);
        assert_eq!(tx.bump_folder_version("f1").await.unwrap(), 3);

        assert!(tx.delete_folder("f1").await.unwrap());
        assert!(tx.get_folder("f1").await.unwrap().is_none());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_folder_id_rejected() {
        let (_dir, store) = open_temp().await;
        let mut tx = store.begin().await.unwrap();
        tx.insert_folder(&sample_folder("f1")).await.unwrap();
        let err = tx.insert_folder(&sample_folder("f1")).await.unwrap_err();
        assert!(err.to_string().contains("unique violation"));
    }
}
