//! Substrate endpoint credentials, encrypted at rest
//!
//! The wire layer never reads these directly; the engine decrypts them
//! through the crypto kernel and hands the wire layer plain credentials in
//! memory only.

use super::{ts, Tx};
use crate::Result;

/// Encrypted credential pair for one endpoint.
#[derive(Debug, Clone)]
pub struct ServerCredentials {
    pub host: String,
    pub port: u16,
    pub username_enc: Option<Vec<u8>>,
    pub password_enc: Option<Vec<u8>>,
}

impl Tx<'_> {
    pub async fn upsert_server_credentials(&mut self, creds: &ServerCredentials) -> Result<()> {
        self.execute(
            "INSERT INTO server_credentials (host, port, username_enc, password_enc, created_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (host, port) DO UPDATE
             SET username_enc = excluded.username_enc, password_enc = excluded.password_enc",
            &[
                creds.host.as_str().into(),
                (creds.port as u32).into(),
                creds.username_enc.as_deref().into(),
                creds.password_enc.as_deref().into(),
                ts(chrono::Utc::now()).into(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_server_credentials(
        &mut self,
        host: &str,
        port: u16,
    ) -> Result<Option<ServerCredentials>> {
        let row = self
            .query_opt(
                "SELECT host, port, username_enc, password_enc FROM server_credentials
                 WHERE host = $1 AND port = $2",
                &[host.into(), (port as u32).into()],
            )
            .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(ServerCredentials {
                host: row.text(0)?.to_string(),
                port: row.i64(1)? as u16,
                username_enc: row.opt_blob(2)?.map(<[u8]>::to_vec),
                password_enc: row.opt_blob(3)?.map(<[u8]>::to_vec),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::open_temp;
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_fetch() {
        let (_dir, store) = open_temp().await;
        let mut tx = store.begin().await.unwrap();
        tx.upsert_server_credentials(&ServerCredentials {
            host: "news.example.net".into(),
            port: 563,
            username_enc: Some(vec![1; 40]),
            password_enc: Some(vec![2; 40]),
        })
        .await
        .unwrap();

        // Overwrite replaces in place.
        tx.upsert_server_credentials(&ServerCredentials {
            host: "news.example.net".into(),
            port: 563,
            username_enc: Some(vec![3; 40]),
            password_enc: None,
        })
        .await
        .unwrap();

        let creds = tx
            .get_server_credentials("news.example.net", 563)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(creds.username_enc, Some(vec![3; 40]));
        assert_eq!(creds.password_enc, None);
        assert!(tx
            .get_server_credentials("other.example.net", 563)
            .await
            .unwrap()
            .is_none());
        tx.commit().await.unwrap();
    }
}
