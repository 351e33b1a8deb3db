//! Small JSON values keyed by name.

use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::AdminStore;

impl AdminStore {
    /// Store `value` under `key`
    pub async fn set_kv<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        sqlx::query("INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(json)
            .execute(&self.pool)
            .await
            .map_err(Error::Sqlx)?;
        Ok(())
    }

    /// Value under `key`, if any
    pub async fn get_kv<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let json: Option<String> = sqlx::query_scalar("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Sqlx)?;
        json.map(|j| serde_json::from_str(&j))
            .transpose()
            .map_err(Error::from)
    }
}
