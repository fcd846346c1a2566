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

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;
use wiresmith_types::model::Attribution;
use wiresmith_types::{EntityKind, Hook, Peer, Server, ServerState};

use super::peer::PeerRow;
use super::{Result, StoreError, WgStore, like_pattern, map_unique, to_u16};

const UNIQUE_RULES: &[(&str, &str)] = &[
    ("servers.name", "server name already used on this backend"),
    ("servers.public_key", "server public key already in use"),
];

#[derive(Debug, sqlx::FromRow)]
pub(super) struct ServerRow {
    id: Uuid,
    backend_id: Uuid,
    name: String,
    description: String,
    address: String,
    listen_port: Option<i64>,
    dns: Json<Vec<String>>,
    mtu: Option<i64>,
    firewall_mark: Option<i64>,
    enabled: bool,
    state: String,
    public_key: String,
    private_key_enc: Vec<u8>,
    private_key_nonce: Vec<u8>,
    hooks: Json<Vec<Hook>>,
    created_by: Option<Uuid>,
    updated_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl WgStore {
    pub(super) fn server_from_row(&self, row: ServerRow) -> Result<Server> {
        let state = ServerState::parse(&row.state)
            .ok_or_else(|| StoreError::Corrupt(format!("server state {:?}", row.state)))?;
        let firewall_mark = row
            .firewall_mark
            .map(|m| u32::try_from(m).map_err(|_| StoreError::Corrupt(format!("firewall_mark={m}"))))
            .transpose()?;

        Ok(Server {
            id: row.id,
            backend_id: row.backend_id,
            name: row.name,
            description: row.description,
            address: row.address,
            listen_port: to_u16(row.listen_port, "listen_port")?,
            dns: row.dns.0,
            mtu: to_u16(row.mtu, "mtu")?,
            firewall_mark,
            enabled: row.enabled,
            state,
            public_key: row.public_key,
            private_key: self.decrypt_str(&row.private_key_enc, &row.private_key_nonce)?,
            hooks: row.hooks.0,
            attribution: Attribution {
                created_by: row.created_by,
                updated_by: row.updated_by,
                created_at: row.created_at,
                updated_at: row.updated_at,
            },
            version: row.version,
        })
    }

    /// Persist a new server. The id and state of `server` are kept; version
    /// and attribution are assigned here.
    #[tracing::instrument(skip(self, server), fields(name = %server.name, backend = %server.backend_id))]
    pub async fn insert_server(&self, server: &Server, actor: Option<Uuid>) -> Result<Server> {
        let (key_enc, key_nonce) = self.encrypt_str(&server.private_key)?;
        let now = Utc::now();

        let row = sqlx::query_as::<_, ServerRow>(
            "INSERT INTO servers (id, backend_id, name, description, address, listen_port, dns, mtu,
                                  firewall_mark, enabled, state, public_key, private_key_enc,
                                  private_key_nonce, hooks, created_by, updated_by,
                                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16, ?17, ?17)
             RETURNING *",
        )
        .bind(server.id)
        .bind(server.backend_id)
        .bind(&server.name)
        .bind(&server.description)
        .bind(&server.address)
        .bind(server.listen_port.map(i64::from))
        .bind(Json(&server.dns))
        .bind(server.mtu.map(i64::from))
        .bind(server.firewall_mark.map(i64::from))
        .bind(server.enabled)
        .bind(server.state.as_str())
        .bind(&server.public_key)
        .bind(key_enc)
        .bind(key_nonce)
        .bind(Json(&server.hooks))
        .bind(actor)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique(e, UNIQUE_RULES))?;

        self.server_from_row(row)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_server(&self, id: Uuid) -> Result<Option<Server>> {
        sqlx::query_as::<_, ServerRow>("SELECT * FROM servers WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| self.server_from_row(row))
            .transpose()
    }

    pub async fn require_server(&self, id: Uuid) -> Result<Server> {
        self.get_server(id).await?.ok_or(StoreError::NotFound {
            kind: EntityKind::Server,
            id,
        })
    }

    /// Servers, optionally limited to one backend and to those whose name,
    /// description or address contains `search`.
    #[tracing::instrument(skip(self))]
    pub async fn list_servers(
        &self,
        backend_id: Option<Uuid>,
        search: Option<&str>,
    ) -> Result<Vec<Server>> {
        let rows = sqlx::query_as::<_, ServerRow>(
            "SELECT * FROM servers
             WHERE (?1 IS NULL OR backend_id = ?1)
               AND (?2 IS NULL
                    OR name LIKE ?2 ESCAPE '\\'
                    OR description LIKE ?2 ESCAPE '\\'
                    OR address LIKE ?2 ESCAPE '\\')
             ORDER BY name",
        )
        .bind(backend_id)
        .bind(search.map(like_pattern))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| self.server_from_row(row))
            .collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn count_enabled_servers(&self, backend_id: Uuid) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM servers WHERE backend_id = ?1 AND enabled = 1")
                .bind(backend_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    /// Write back declared fields of `server`. State is left untouched, see
    /// [`WgStore::set_server_state`].
    #[tracing::instrument(skip(self, server), fields(id = %server.id, version = server.version))]
    pub async fn update_server(&self, server: &Server, actor: Option<Uuid>) -> Result<Server> {
        let (key_enc, key_nonce) = self.encrypt_str(&server.private_key)?;

        let row = sqlx::query_as::<_, ServerRow>(
            "UPDATE servers
             SET description = ?2, address = ?3, listen_port = ?4, dns = ?5, mtu = ?6,
                 firewall_mark = ?7, enabled = ?8, public_key = ?9, private_key_enc = ?10,
                 private_key_nonce = ?11, hooks = ?12, updated_by = ?13, updated_at = ?14,
                 version = version + 1
             WHERE id = ?1 AND version = ?15
             RETURNING *",
        )
        .bind(server.id)
        .bind(&server.description)
        .bind(&server.address)
        .bind(server.listen_port.map(i64::from))
        .bind(Json(&server.dns))
        .bind(server.mtu.map(i64::from))
        .bind(server.firewall_mark.map(i64::from))
        .bind(server.enabled)
        .bind(&server.public_key)
        .bind(key_enc)
        .bind(key_nonce)
        .bind(Json(&server.hooks))
        .bind(actor)
        .bind(Utc::now())
        .bind(server.version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_unique(e, UNIQUE_RULES))?;

        match row {
            Some(row) => self.server_from_row(row),
            None => {
                self.require_server(server.id).await?;
                Err(StoreError::VersionConflict {
                    kind: EntityKind::Server,
                    id: server.id,
                })
            }
        }
    }

    /// Record an observed state. Observations do not bump the version, so
    /// they never invalidate a concurrent declared-field edit.
    #[tracing::instrument(skip(self))]
    pub async fn set_server_state(&self, id: Uuid, state: ServerState) -> Result<Server> {
        let row = sqlx::query_as::<_, ServerRow>(
            "UPDATE servers SET state = ?2 WHERE id = ?1 RETURNING *",
        )
        .bind(id)
        .bind(state.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound {
            kind: EntityKind::Server,
            id,
        })?;

        self.server_from_row(row)
    }

    /// Delete a server and its peers, returning both.
    #[tracing::instrument(skip(self))]
    pub async fn delete_server(&self, id: Uuid) -> Result<(Server, Vec<Peer>)> {
        let mut tx = self.pool.begin().await?;

        let server_row = sqlx::query_as::<_, ServerRow>("SELECT * FROM servers WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound {
                kind: EntityKind::Server,
                id,
            })?;

        let peer_rows =
            sqlx::query_as::<_, PeerRow>("SELECT * FROM peers WHERE server_id = ?1 ORDER BY name")
                .bind(id)
                .fetch_all(&mut *tx)
                .await?;

        sqlx::query("DELETE FROM servers WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let server = self.server_from_row(server_row)?;
        let peers = peer_rows
            .into_iter()
            .map(|row| self.peer_from_row(row))
            .collect::<Result<Vec<_>>>()?;
        Ok((server, peers))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::Utc;
    use uuid::Uuid;
    use wiresmith_types::model::Attribution;
    use wiresmith_types::{Server, ServerState};

    use crate::keys::generate_key_pair;

    pub fn server(backend_id: Uuid, name: &str) -> Server {
        let pair = generate_key_pair();
        let now = Utc::now();
        Server {
            id: Uuid::new_v4(),
            backend_id,
            name: name.into(),
            description: String::new(),
            address: "10.0.0.1/24".into(),
            listen_port: Some(51820),
            dns: vec!["10.0.0.1".into()],
            mtu: None,
            firewall_mark: None,
            enabled: true,
            state: ServerState::Stopped,
            public_key: pair.public_key,
            private_key: pair.private_key,
            hooks: vec![],
            attribution: Attribution {
                created_by: None,
                updated_by: None,
                created_at: now,
                updated_at: now,
            },
            version: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::backend::NewBackendRecord;
    use crate::db::test_support::store;

    async fn backend(store: &WgStore) -> Uuid {
        store
            .insert_backend(
                &NewBackendRecord {
                    name: "local".into(),
                    description: String::new(),
                    url: "linux://".into(),
                    enabled: true,
                },
                None,
            )
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn private_key_survives_encryption() {
        let store = store().await;
        let backend_id = backend(&store).await;
        let draft = fixtures::server(backend_id, "wg0");
        let created = store.insert_server(&draft, None).await.unwrap();
        assert_eq!(created.private_key, draft.private_key);
        assert_eq!(created.dns, vec!["10.0.0.1".to_string()]);

        let raw: (Vec<u8>,) = sqlx::query_as("SELECT private_key_enc FROM servers WHERE id = ?1")
            .bind(created.id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_ne!(raw.0, draft.private_key.as_bytes());
    }

    #[tokio::test]
    async fn names_are_unique_per_backend() {
        let store = store().await;
        let backend_id = backend(&store).await;
        store
            .insert_server(&fixtures::server(backend_id, "wg0"), None)
            .await
            .unwrap();
        let err = store
            .insert_server(&fixtures::server(backend_id, "wg0"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(msg) if msg.contains("name")));
    }

    #[tokio::test]
    async fn state_changes_keep_version() {
        let store = store().await;
        let backend_id = backend(&store).await;
        let created = store
            .insert_server(&fixtures::server(backend_id, "wg0"), None)
            .await
            .unwrap();
        let running = store
            .set_server_state(created.id, ServerState::Running)
            .await
            .unwrap();
        assert_eq!(running.state, ServerState::Running);
        assert_eq!(running.version, created.version);

        let mut edit = created;
        edit.description = "edited".into();
        let updated = store.update_server(&edit, None).await.unwrap();
        assert_eq!(updated.state, ServerState::Running);
        assert_eq!(updated.version, 2);
    }

    #[tokio::test]
    async fn search_and_backend_filter() {
        let store = store().await;
        let backend_id = backend(&store).await;
        let mut office = fixtures::server(backend_id, "office");
        office.address = "192.168.50.1/24".into();
        store.insert_server(&office, None).await.unwrap();
        store
            .insert_server(&fixtures::server(backend_id, "lab"), None)
            .await
            .unwrap();

        assert_eq!(store.list_servers(Some(backend_id), None).await.unwrap().len(), 2);
        assert_eq!(store.list_servers(None, Some("192.168")).await.unwrap().len(), 1);
        assert!(store.list_servers(Some(Uuid::new_v4()), None).await.unwrap().is_empty());
        assert_eq!(store.count_enabled_servers(backend_id).await.unwrap(), 2);
    }
}
