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

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;
use wiresmith_types::{EntityKind, User};

use super::{Result, StoreError, like_pattern, map_unique};

const UNIQUE_RULES: &[(&str, &str)] = &[("users.email", "email already taken")];

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    password_hash: String,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            password_hash: row.password_hash,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|_| StoreError::PasswordHash)
}

#[derive(Debug, Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self))]
    pub async fn is_empty(&self) -> Result<bool> {
        let row: (bool,) = sqlx::query_as("SELECT NOT EXISTS (SELECT 1 FROM users)")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    #[tracing::instrument(skip(self, password))]
    pub async fn create(&self, email: &str, password: &str) -> Result<User> {
        let password_hash = hash_password(password)?;
        let now = Utc::now();

        sqlx::query_as::<_, UserRow>(
            "INSERT INTO users (id, email, password_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(password_hash)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map(User::from)
        .map_err(|e| map_unique(e, UNIQUE_RULES))
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(User::from))
    }

    pub async fn require(&self, id: Uuid) -> Result<User> {
        self.get(id).await?.ok_or(StoreError::NotFound {
            kind: EntityKind::User,
            id,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE email = ?1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(User::from))
    }

    #[tracing::instrument(skip(self))]
    pub async fn list(&self, search: Option<&str>) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT * FROM users
             WHERE ?1 IS NULL OR email LIKE ?1 ESCAPE '\\'
             ORDER BY email",
        )
        .bind(search.map(like_pattern))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    #[tracing::instrument(skip(self))]
    pub async fn update_email(&self, id: Uuid, email: &str) -> Result<User> {
        sqlx::query_as::<_, UserRow>(
            "UPDATE users SET email = ?2, updated_at = ?3 WHERE id = ?1 RETURNING *",
        )
        .bind(id)
        .bind(email)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_unique(e, UNIQUE_RULES))?
        .map(User::from)
        .ok_or(StoreError::NotFound {
            kind: EntityKind::User,
            id,
        })
    }

    #[tracing::instrument(skip(self, password))]
    pub async fn update_password(&self, id: Uuid, password: &str) -> Result<User> {
        let password_hash = hash_password(password)?;
        sqlx::query_as::<_, UserRow>(
            "UPDATE users SET password_hash = ?2, updated_at = ?3 WHERE id = ?1 RETURNING *",
        )
        .bind(id)
        .bind(password_hash)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?
        .map(User::from)
        .ok_or(StoreError::NotFound {
            kind: EntityKind::User,
            id,
        })
    }

    /// Remove a user. Attribution columns referencing it are nulled by the
    /// schema.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<User> {
        sqlx::query_as::<_, UserRow>("DELETE FROM users WHERE id = ?1 RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(User::from)
            .ok_or(StoreError::NotFound {
                kind: EntityKind::User,
                id,
            })
    }

    /// The user matching `email` and `password`, if any.
    #[tracing::instrument(skip(self, password))]
    pub async fn verify_password(&self, email: &str, password: &str) -> Result<Option<User>> {
        let Some(user) = self.get_by_email(email).await? else {
            return Ok(None);
        };

        let parsed = PasswordHash::new(&user.password_hash)
            .map_err(|_| StoreError::Corrupt(format!("password hash of user {}", user.id)))?;
        let ok = Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok();
        Ok(ok.then_some(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::backend::NewBackendRecord;
    use crate::db::test_support::store;

    #[tokio::test]
    async fn create_and_verify() {
        let store = store().await;
        let users = UserStore::new(store.pool().clone());
        assert!(users.is_empty().await.unwrap());

        let user = users.create("ops@example.com", "correct horse").await.unwrap();
        assert!(!users.is_empty().await.unwrap());
        assert_ne!(user.password_hash, "correct horse");

        assert!(users
            .verify_password("ops@example.com", "correct horse")
            .await
            .unwrap()
            .is_some());
        assert!(users
            .verify_password("ops@example.com", "wrong")
            .await
            .unwrap()
            .is_none());
        assert!(users
            .verify_password("nobody@example.com", "correct horse")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn email_is_case_insensitively_unique() {
        let store = store().await;
        let users = UserStore::new(store.pool().clone());
        users.create("ops@example.com", "pw").await.unwrap();
        let err = users.create("OPS@example.com", "pw").await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn password_change_invalidates_old_one() {
        let store = store().await;
        let users = UserStore::new(store.pool().clone());
        let user = users.create("ops@example.com", "old").await.unwrap();
        users.update_password(user.id, "new").await.unwrap();
        assert!(users.verify_password("ops@example.com", "old").await.unwrap().is_none());
        assert!(users.verify_password("ops@example.com", "new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn deleting_user_clears_attribution() {
        let store = store().await;
        let users = UserStore::new(store.pool().clone());
        let user = users.create("ops@example.com", "pw").await.unwrap();
        let backend = store
            .insert_backend(
                &NewBackendRecord {
                    name: "local".into(),
                    description: String::new(),
                    url: "linux://".into(),
                    enabled: true,
                },
                Some(user.id),
            )
            .await
            .unwrap();
        assert_eq!(backend.attribution.created_by, Some(user.id));

        users.delete(user.id).await.unwrap();
        let backend = store.require_backend(backend.id).await.unwrap();
        assert_eq!(backend.attribution.created_by, None);
        assert_eq!(backend.attribution.updated_by, None);
    }
}
