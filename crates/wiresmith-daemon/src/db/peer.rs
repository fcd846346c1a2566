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
use wiresmith_types::interface::PeerStats;
use wiresmith_types::model::Attribution;
use wiresmith_types::{EntityKind, Hook, Peer};

use super::{Result, StoreError, WgStore, like_pattern, map_unique, to_u16};

const UNIQUE_RULES: &[(&str, &str)] = &[
    ("peers.name", "peer name already used on this server"),
    ("peers.public_key", "public key already used by another peer on this server"),
];

#[derive(Debug, sqlx::FromRow)]
pub(super) struct PeerRow {
    id: Uuid,
    server_id: Uuid,
    name: String,
    description: String,
    public_key: String,
    preshared_key_enc: Option<Vec<u8>>,
    preshared_key_nonce: Option<Vec<u8>>,
    endpoint: Option<String>,
    allowed_ips: Json<Vec<String>>,
    persistent_keepalive: i64,
    hooks: Json<Vec<Hook>>,
    stats: Json<PeerStats>,
    created_by: Option<Uuid>,
    updated_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl WgStore {
    pub(super) fn peer_from_row(&self, row: PeerRow) -> Result<Peer> {
        let preshared_key = match (row.preshared_key_enc, row.preshared_key_nonce) {
            (Some(enc), Some(nonce)) => Some(self.decrypt_str(&enc, &nonce)?),
            (None, None) => None,
            _ => return Err(StoreError::Corrupt(format!("peer {} preshared key", row.id))),
        };

        Ok(Peer {
            id: row.id,
            server_id: row.server_id,
            name: row.name,
            description: row.description,
            public_key: row.public_key,
            preshared_key,
            endpoint: row.endpoint,
            allowed_ips: row.allowed_ips.0,
            persistent_keepalive: to_u16(Some(row.persistent_keepalive), "persistent_keepalive")?
                .unwrap_or_default(),
            hooks: row.hooks.0,
            stats: row.stats.0,
            attribution: Attribution {
                created_by: row.created_by,
                updated_by: row.updated_by,
                created_at: row.created_at,
                updated_at: row.updated_at,
            },
            version: row.version,
        })
    }

    fn seal_psk(&self, psk: Option<&str>) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
        match psk {
            Some(psk) => {
                let (enc, nonce) = self.encrypt_str(psk)?;
                Ok((Some(enc), Some(nonce)))
            }
            None => Ok((None, None)),
        }
    }

    #[tracing::instrument(skip(self, peer), fields(name = %peer.name, server = %peer.server_id))]
    pub async fn insert_peer(&self, peer: &Peer, actor: Option<Uuid>) -> Result<Peer> {
        let (psk_enc, psk_nonce) = self.seal_psk(peer.preshared_key.as_deref())?;
        let now = Utc::now();

        let row = sqlx::query_as::<_, PeerRow>(
            "INSERT INTO peers (id, server_id, name, description, public_key, preshared_key_enc,
                                preshared_key_nonce, endpoint, allowed_ips, persistent_keepalive,
                                hooks, stats, created_by, updated_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13, ?14, ?14)
             RETURNING *",
        )
        .bind(peer.id)
        .bind(peer.server_id)
        .bind(&peer.name)
        .bind(&peer.description)
        .bind(&peer.public_key)
        .bind(psk_enc)
        .bind(psk_nonce)
        .bind(&peer.endpoint)
        .bind(Json(&peer.allowed_ips))
        .bind(i64::from(peer.persistent_keepalive))
        .bind(Json(&peer.hooks))
        .bind(Json(&peer.stats))
        .bind(actor)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique(e, UNIQUE_RULES))?;

        self.peer_from_row(row)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_peer(&self, id: Uuid) -> Result<Option<Peer>> {
        sqlx::query_as::<_, PeerRow>("SELECT * FROM peers WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| self.peer_from_row(row))
            .transpose()
    }

    pub async fn require_peer(&self, id: Uuid) -> Result<Peer> {
        self.get_peer(id).await?.ok_or(StoreError::NotFound {
            kind: EntityKind::Peer,
            id,
        })
    }

    /// Peers of one server, optionally filtered by a substring of name,
    /// description or public key.
    #[tracing::instrument(skip(self))]
    pub async fn list_peers(&self, server_id: Uuid, search: Option<&str>) -> Result<Vec<Peer>> {
        let rows = sqlx::query_as::<_, PeerRow>(
            "SELECT * FROM peers
             WHERE server_id = ?1
               AND (?2 IS NULL
                    OR name LIKE ?2 ESCAPE '\\'
                    OR description LIKE ?2 ESCAPE '\\'
                    OR public_key LIKE ?2 ESCAPE '\\')
             ORDER BY name",
        )
        .bind(server_id)
        .bind(search.map(like_pattern))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.peer_from_row(row)).collect()
    }

    #[tracing::instrument(skip(self, peer), fields(id = %peer.id, version = peer.version))]
    pub async fn update_peer(&self, peer: &Peer, actor: Option<Uuid>) -> Result<Peer> {
        let (psk_enc, psk_nonce) = self.seal_psk(peer.preshared_key.as_deref())?;

        let row = sqlx::query_as::<_, PeerRow>(
            "UPDATE peers
             SET name = ?2, description = ?3, public_key = ?4, preshared_key_enc = ?5,
                 preshared_key_nonce = ?6, endpoint = ?7, allowed_ips = ?8,
                 persistent_keepalive = ?9, hooks = ?10, updated_by = ?11, updated_at = ?12,
                 version = version + 1
             WHERE id = ?1 AND version = ?13
             RETURNING *",
        )
        .bind(peer.id)
        .bind(&peer.name)
        .bind(&peer.description)
        .bind(&peer.public_key)
        .bind(psk_enc)
        .bind(psk_nonce)
        .bind(&peer.endpoint)
        .bind(Json(&peer.allowed_ips))
        .bind(i64::from(peer.persistent_keepalive))
        .bind(Json(&peer.hooks))
        .bind(actor)
        .bind(Utc::now())
        .bind(peer.version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_unique(e, UNIQUE_RULES))?;

        match row {
            Some(row) => self.peer_from_row(row),
            None => {
                self.require_peer(peer.id).await?;
                Err(StoreError::VersionConflict {
                    kind: EntityKind::Peer,
                    id: peer.id,
                })
            }
        }
    }

    /// Store observed counters for the peers of `server_id`, matched by
    /// public key. Returns the peers whose stats changed.
    #[tracing::instrument(skip(self, observed), fields(count = observed.len()))]
    pub async fn record_peer_stats(
        &self,
        server_id: Uuid,
        observed: &[(String, PeerStats)],
    ) -> Result<Vec<Peer>> {
        let mut tx = self.pool.begin().await?;
        let mut changed = Vec::new();

        for (public_key, stats) in observed {
            let row = sqlx::query_as::<_, PeerRow>(
                "UPDATE peers SET stats = ?3
                 WHERE server_id = ?1 AND public_key = ?2 AND stats <> ?3
                 RETURNING *",
            )
            .bind(server_id)
            .bind(public_key)
            .bind(Json(stats))
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = row {
                changed.push(row);
            }
        }

        tx.commit().await?;
        changed.into_iter().map(|row| self.peer_from_row(row)).collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_peer(&self, id: Uuid) -> Result<Peer> {
        let row = sqlx::query_as::<_, PeerRow>("DELETE FROM peers WHERE id = ?1 RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound {
                kind: EntityKind::Peer,
                id,
            })?;

        self.peer_from_row(row)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::Utc;
    use uuid::Uuid;
    use wiresmith_types::Peer;
    use wiresmith_types::interface::PeerStats;
    use wiresmith_types::model::Attribution;

    use crate::keys::generate_key_pair;

    pub fn peer(server_id: Uuid, name: &str) -> Peer {
        let now = Utc::now();
        Peer {
            id: Uuid::new_v4(),
            server_id,
            name: name.into(),
            description: String::new(),
            public_key: generate_key_pair().public_key,
            preshared_key: None,
            endpoint: None,
            allowed_ips: vec!["10.0.0.2/32".into()],
            persistent_keepalive: 25,
            hooks: vec![],
            stats: PeerStats::default(),
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
    use crate::db::server;
    use crate::db::test_support::store;
    use crate::keys::generate_preshared_key;

    async fn server_id(store: &WgStore) -> Uuid {
        let backend = store
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
            .unwrap();
        store
            .insert_server(&server::fixtures::server(backend.id, "wg0"), None)
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn preshared_key_round_trips() {
        let store = store().await;
        let server_id = server_id(&store).await;
        let mut draft = fixtures::peer(server_id, "laptop");
        draft.preshared_key = Some(generate_preshared_key());

        let created = store.insert_peer(&draft, None).await.unwrap();
        assert_eq!(created.preshared_key, draft.preshared_key);
        assert!(created.has_preshared_key());
    }

    #[tokio::test]
    async fn public_key_unique_within_server() {
        let store = store().await;
        let server_id = server_id(&store).await;
        let first = store
            .insert_peer(&fixtures::peer(server_id, "a"), None)
            .await
            .unwrap();

        let mut clash = fixtures::peer(server_id, "b");
        clash.public_key = first.public_key.clone();
        let err = store.insert_peer(&clash, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(msg) if msg.contains("public key")));
    }

    #[tokio::test]
    async fn stats_only_report_changes() {
        let store = store().await;
        let server_id = server_id(&store).await;
        let peer = store
            .insert_peer(&fixtures::peer(server_id, "phone"), None)
            .await
            .unwrap();

        let stats = PeerStats {
            rx_bytes: 1024,
            tx_bytes: 2048,
            ..PeerStats::default()
        };
        let observed = vec![(peer.public_key.clone(), stats.clone())];

        let changed = store.record_peer_stats(server_id, &observed).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].stats, stats);
        assert_eq!(changed[0].version, peer.version);

        let again = store.record_peer_stats(server_id, &observed).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn deleting_server_cascades() {
        let store = store().await;
        let server_id = server_id(&store).await;
        for name in ["a", "b", "c"] {
            store
                .insert_peer(&fixtures::peer(server_id, name), None)
                .await
                .unwrap();
        }

        let (_, peers) = store.delete_server(server_id).await.unwrap();
        assert_eq!(peers.len(), 3);
        assert!(store.list_peers(server_id, None).await.unwrap().is_empty());
    }
}
