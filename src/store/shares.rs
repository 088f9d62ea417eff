//! Share and commitment repositories

use super::backend::Row;
use super::{parse_ts, ts, Tx};
use crate::types::{Commitment, Share, ShareAuth, ShareTier};
use crate::{Error, Result};

const SHARE_COLUMNS: &str = "share_id, folder_id, folder_version, tier, index_ref_enc,
    owner_id, auth, created_at, expires_at, revoked";

fn share_from_row(row: &Row) -> Result<Share> {
    let auth: ShareAuth = rmp_serde::from_slice(row.blob(6)?)
        .map_err(|e| Error::storage(format!("malformed share auth blob: {}", e)))?;
    Ok(Share {
        share_id: row.text(0)?.to_string(),
        folder_id: row.text(1)?.to_string(),
        folder_version: row.u64(2)?,
        tier: ShareTier::parse(row.text(3)?)?,
        index_ref_enc: row.blob(4)?.to_vec(),
        owner_id: row.text(5)?.to_string(),
        auth,
        created_at: parse_ts(row.text(7)?)?,
        expires_at: row.opt_text(8)?.map(parse_ts).transpose()?,
        revoked: row.bool(9)?,
    })
}

impl Tx<'_> {
    pub async fn insert_share(&mut self, share: &Share) -> Result<()> {
        let auth = rmp_serde::to_vec(&share.auth)
            .map_err(|e| Error::storage(format!("share auth encode: {}", e)))?;
        self.execute(
            "INSERT INTO shares (share_id, folder_id, folder_version, tier, index_ref_enc,
                owner_id, auth, created_at, expires_at, revoked)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            &[
                share.share_id.as_str().into(),
                share.folder_id.as_str().into(),
                share.folder_version.into(),
                share.tier.as_str().into(),
                share.index_ref_enc.as_slice().into(),
                share.owner_id.as_str().into(),
                auth.into(),
                ts(share.created_at).into(),
                share.expires_at.map(ts).into(),
                share.revoked.into(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_share(&mut self, share_id: &str) -> Result<Option<Share>> {
        let sql = format!("SELECT {} FROM shares WHERE share_id = $1", SHARE_COLUMNS);
        match self.query_opt(&sql, &[share_id.into()]).await? {
            Some(row) => Ok(Some(share_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_shares_for_folder(&mut self, folder_id: &str) -> Result<Vec<Share>> {
        let sql = format!(
            "SELECT {} FROM shares WHERE folder_id = $1 ORDER BY created_at",
            SHARE_COLUMNS
        );
        self.query(&sql, &[folder_id.into()])
            .await?
            .iter()
            .map(share_from_row)
            .collect()
    }

    /// Clear the local record. The substrate articles cannot be unpublished;
    /// this only forgets the reference.
    pub async fn revoke_share(&mut self, share_id: &str) -> Result<bool> {
        let affected = self
            .execute(
                "UPDATE shares SET revoked = 1 WHERE share_id = $1",
                &[share_id.into()],
            )
            .await?;
        Ok(affected > 0)
    }

    pub async fn insert_commitments(&mut self, commitments: &[Commitment]) -> Result<()> {
        for c in commitments {
            self.execute(
                "INSERT INTO commitments (share_id, commitment, wrapped_key)
                 VALUES ($1, $2, $3)",
                &[
                    c.share_id.as_str().into(),
                    c.commitment.as_slice().into(),
                    c.wrapped_key.as_slice().into(),
                ],
            )
            .await?;
        }
        Ok(())
    }

    pub async fn get_commitment(
        &mut self,
        share_id: &str,
        commitment: &[u8],
    ) -> Result<Option<Commitment>> {
        let row = self
            .query_opt(
                "SELECT share_id, commitment, wrapped_key FROM commitments
                 WHERE share_id = $1 AND commitment = $2",
                &[share_id.into(), commitment.into()],
            )
            .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(Commitment {
                share_id: row.text(0)?.to_string(),
                commitment: row.blob(1)?.to_vec(),
                wrapped_key: row.blob(2)?.to_vec(),
            })),
        }
    }

    /// Per-user revocation for PRIVATE shares: drop the commitment row and
    /// its wrapped key. Subsequent unwraps for that identity fail.
    pub async fn delete_commitment(&mut self, share_id: &str, commitment: &[u8]) -> Result<bool> {
        let affected = self
            .execute(
                "DELETE FROM commitments WHERE share_id = $1 AND commitment = $2",
                &[share_id.into(), commitment.into()],
            )
            .await?;
        Ok(affected > 0)
    }

    pub async fn count_commitments(&mut self, share_id: &str) -> Result<u64> {
        let row = self
            .query_opt(
                "SELECT COUNT(*) FROM commitments WHERE share_id = $1",
                &[share_id.into()],
            )
            .await?
            .ok_or_else(|| Error::storage("count query returned no row"))?;
        row.u64(0)
    }
}
