// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

pub mod backend;
pub mod peer;
pub mod server;
pub mod user;

use std::str::FromStr;

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use uuid::Uuid;
use wiresmith_types::EntityKind;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{0}")]
    Duplicate(String),

    #[error("{kind:?} {id} not found")]
    NotFound { kind: EntityKind, id: Uuid },

    #[error("{kind:?} {id} was modified concurrently")]
    VersionConflict { kind: EntityKind, id: Uuid },

    #[error("key encryption/decryption failed")]
    KeyEncryption,

    #[error("password hashing failed")]
    PasswordHash,

    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Single-connection in-memory database, kept alive for the pool's lifetime.
pub async fn memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Message of a unique-constraint violation, if `err` is one.
fn unique_violation(err: &sqlx::Error) -> Option<&str> {
    match err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => Some(db_err.message()),
        _ => None,
    }
}

/// Map a unique violation on `column` (as `table.column`) to a duplicate error.
fn map_unique(err: sqlx::Error, rules: &[(&str, &str)]) -> StoreError {
    if let Some(message) = unique_violation(&err) {
        for (column, what) in rules {
            if message.contains(column) {
                return StoreError::Duplicate((*what).to_string());
            }
        }
    }
    StoreError::Database(err)
}

/// `LIKE` pattern matching `needle` anywhere, with wildcards escaped.
fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn to_u16(value: Option<i64>, field: &str) -> Result<Option<u16>> {
    value
        .map(|v| u16::try_from(v).map_err(|_| StoreError::Corrupt(format!("{field}={v}"))))
        .transpose()
}

/// Store for backends, servers and peers. Secrets are sealed with AES-256-GCM
/// before they reach the database.
#[derive(Debug, Clone)]
pub struct WgStore {
    pool: SqlitePool,
    encryption_key: [u8; 32],
}

impl WgStore {
    pub fn new(pool: SqlitePool, encryption_key: [u8; 32]) -> Self {
        Self {
            pool,
            encryption_key,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key)
            .map_err(|_| StoreError::KeyEncryption)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| StoreError::KeyEncryption)?;
        Ok((ciphertext, nonce.to_vec()))
    }

    fn decrypt(&self, ciphertext: &[u8], nonce_bytes: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key)
            .map_err(|_| StoreError::KeyEncryption)?;
        let nonce =
            Nonce::from_exact_iter(nonce_bytes.iter().copied()).ok_or(StoreError::KeyEncryption)?;
        cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| StoreError::KeyEncryption)
    }

    fn encrypt_str(&self, plaintext: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        self.encrypt(plaintext.as_bytes())
    }

    fn decrypt_str(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<String> {
        let bytes = self.decrypt(ciphertext, nonce)?;
        String::from_utf8(bytes).map_err(|_| StoreError::KeyEncryption)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub const TEST_KEY: [u8; 32] = [7u8; 32];

    pub async fn store() -> WgStore {
        let pool = memory_pool().await.unwrap();
        migrate(&pool).await.unwrap();
        WgStore::new(pool, TEST_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[tokio::test]
    async fn encryption_round_trip_uses_fresh_nonces() {
        let store = test_support::store().await;
        let (a, nonce_a) = store.encrypt_str("secret").unwrap();
        let (b, nonce_b) = store.encrypt_str("secret").unwrap();
        assert_ne!(nonce_a, nonce_b);
        assert_ne!(a, b);
        assert_eq!(store.decrypt_str(&a, &nonce_a).unwrap(), "secret");
    }

    #[tokio::test]
    async fn wrong_key_fails_to_decrypt() {
        let store = test_support::store().await;
        let (ciphertext, nonce) = store.encrypt_str("secret").unwrap();
        let other = WgStore::new(store.pool().clone(), [9u8; 32]);
        assert!(matches!(
            other.decrypt_str(&ciphertext, &nonce),
            Err(StoreError::KeyEncryption)
        ));
    }

    #[test_case("wg", "%wg%"; "plain")]
    #[test_case("10%", "%10\\%%"; "percent")]
    #[test_case("a_b", "%a\\_b%"; "underscore")]
    fn like_patterns(input: &str, expected: &str) {
        assert_eq!(like_pattern(input), expected);
    }
}
