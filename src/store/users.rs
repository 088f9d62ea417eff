//! User repository
//!
//! Exactly one user row exists per store; creation is first-run-only and
//! the identifier is permanent.

use super::backend::unique_violation;
use super::{parse_ts, ts, Tx};
use crate::types::User;
use crate::Result;

impl Tx<'_> {
    /// Insert the operator row. Fails with a unique violation if a user
    /// already exists.
    pub async fn insert_user(&mut self, user: &User) -> Result<()> {
        if self.get_user().await?.is_some() {
            return Err(unique_violation("user already initialized"));
        }
        self.execute(
            "INSERT INTO users (user_id, display_name, created_at, public_key, private_key_enc)
             VALUES ($1, $2, $3, $4, $5)",
            &[
                user.user_id.as_str().into(),
                user.display_name.as_str().into(),
                ts(user.created_at).into(),
                user.public_key.as_slice().into(),
                user.private_key_enc.as_slice().into(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_user(&mut self) -> Result<Option<User>> {
        let row = self
            .query_opt(
                "SELECT user_id, display_name, created_at, public_key, private_key_enc
                 FROM users LIMIT 1",
                &[],
            )
            .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(User {
                user_id: row.text(0)?.to_string(),
                display_name: row.text(1)?.to_string(),
                created_at: parse_ts(row.text(2)?)?,
                public_key: row.blob(3)?.to_vec(),
                private_key_enc: row.blob(4)?.to_vec(),
            })),
        }
    }

    /// Display name is the only mutable user field.
    pub async fn rename_user(&mut self, display_name: &str) -> Result<()> {
        self.execute(
            "UPDATE users SET display_name = $1",
            &[display_name.into()],
        )
        .await?;
        Ok(())
    }
}
