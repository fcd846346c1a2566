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

//! Adoption of WireGuard interfaces that already exist on a backend.

use tracing::{info, warn};
use uuid::Uuid;
use wiresmith_types::interface::{ForeignServer, PeerStats};
use wiresmith_types::{ChangeAction, Entity, Peer, Server, ServerState};

use super::{Actor, Engine, new_attribution, validate};
use crate::driver::DriverError;
use crate::error::{CoreError, Outcome};
use crate::keys::{canonical_public_key, public_key_from_private};

impl Engine {
    /// Interfaces on the backend that no server manages yet.
    #[tracing::instrument(skip(self))]
    pub async fn discover(&self, backend_id: Uuid) -> Result<Vec<ForeignServer>, CoreError> {
        let backend = self.store.require_backend(backend_id).await?;
        let known: Vec<String> = self
            .store
            .list_servers(Some(backend_id), None)
            .await?
            .into_iter()
            .map(|s| s.name)
            .collect();

        let driver = self.registry.driver_for(&backend).await?;
        let timeout = self.settings.driver_timeout;
        let found = tokio::time::timeout(timeout, driver.discover(&known))
            .await
            .unwrap_or(Err(DriverError::Timeout(timeout)))
            .map_err(|e| CoreError::from_driver(&backend.name, "discovery", e))?;
        info!(backend = %backend.name, count = found.len(), "discovered interfaces");
        Ok(found)
    }

    /// Take over `interface` as a managed server with its peers. The server
    /// is recorded Running when the interface is up.
    #[tracing::instrument(skip(self))]
    pub async fn import_server(
        &self,
        backend_id: Uuid,
        interface: &str,
        actor: Actor,
    ) -> Result<Outcome<Server>, CoreError> {
        let foreign = self
            .discover(backend_id)
            .await?
            .into_iter()
            .find(|f| f.name == interface)
            .ok_or_else(|| {
                CoreError::validation(format!("no unmanaged interface {interface} on backend"))
            })?;
        validate::server_name(&foreign.name)?;

        let private_key = foreign.private_key.clone().ok_or_else(|| {
            CoreError::validation(format!("private key of {interface} is not readable"))
        })?;
        let public_key = public_key_from_private(&private_key)?;
        let address = foreign
            .address
            .clone()
            .ok_or_else(|| CoreError::validation(format!("{interface} has no address")))?;

        let server = Server {
            id: Uuid::new_v4(),
            backend_id,
            name: foreign.name.clone(),
            description: String::new(),
            address,
            listen_port: foreign.listen_port,
            dns: foreign.dns.clone(),
            mtu: foreign.mtu,
            firewall_mark: foreign.firewall_mark,
            enabled: true,
            state: if foreign.up {
                ServerState::Running
            } else {
                ServerState::Stopped
            },
            public_key,
            private_key,
            hooks: Vec::new(),
            attribution: new_attribution(actor),
            version: 0,
        };
        let server = self.store.insert_server(&server, actor).await?;
        self.publish(ChangeAction::Created, Entity::Server(server.clone()), actor);

        let mut taken: Vec<String> = Vec::with_capacity(foreign.peers.len());
        for (index, imported) in foreign.peers.into_iter().enumerate() {
            let public_key = match canonical_public_key(&imported.config.public_key) {
                Ok(key) => key,
                Err(e) => {
                    warn!(interface, error = %e, "skipping peer with unusable key");
                    continue;
                }
            };
            let base = imported
                .name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| format!("Peer #{}", index + 1));
            let name = validate::unique_name(&base, &taken);
            taken.push(name.clone());

            let peer = Peer {
                id: Uuid::new_v4(),
                server_id: server.id,
                name,
                description: String::new(),
                public_key,
                preshared_key: imported.config.preshared_key,
                endpoint: imported.config.endpoint,
                allowed_ips: imported.config.allowed_ips,
                persistent_keepalive: imported.config.persistent_keepalive,
                hooks: Vec::new(),
                stats: PeerStats::default(),
                attribution: new_attribution(actor),
                version: 0,
            };
            let peer = self.store.insert_peer(&peer, actor).await?;
            self.publish(ChangeAction::Created, Entity::Peer(peer), actor);
        }

        info!(server = %server.name, peers = taken.len(), state = %server.state, "interface imported");
        Ok(Outcome::new(server))
    }
}

#[cfg(test)]
mod tests {
    use wiresmith_types::interface::{ForeignPeer, PeerConfig};

    use super::super::BackendInput;
    use super::super::test_support::engine;
    use super::*;
    use crate::keys::generate_key_pair;

    fn foreign_peer(name: Option<&str>) -> ForeignPeer {
        ForeignPeer {
            name: name.map(str::to_string),
            config: PeerConfig {
                public_key: generate_key_pair().public_key,
                preshared_key: None,
                endpoint: Some("198.51.100.7:51820".into()),
                allowed_ips: vec!["10.8.0.2/32".into()],
                persistent_keepalive: 0,
            },
        }
    }

    fn foreign(name: &str, up: bool, peers: Vec<ForeignPeer>) -> ForeignServer {
        ForeignServer {
            name: name.into(),
            private_key: Some(generate_key_pair().private_key),
            public_key: None,
            address: Some("10.8.0.1/24".into()),
            listen_port: Some(51821),
            mtu: None,
            firewall_mark: None,
            dns: vec![],
            up,
            peers,
        }
    }

    async fn backend(engine: &Engine) -> Uuid {
        engine
            .create_backend(
                BackendInput {
                    name: "remote".into(),
                    description: String::new(),
                    url: "ssh://root@10.0.0.5".into(),
                    enabled: true,
                },
                None,
            )
            .await
            .unwrap()
            .value
            .backend
            .id
    }

    #[tokio::test]
    async fn import_names_peers_and_keeps_state() {
        let (engine, driver) = engine().await;
        let backend_id = backend(&engine).await;
        driver.foreign.lock().unwrap().push(foreign(
            "wg7",
            true,
            vec![
                foreign_peer(None),
                foreign_peer(Some("laptop")),
                foreign_peer(Some("laptop")),
            ],
        ));

        let server = engine.import_server(backend_id, "wg7", None).await.unwrap().value;
        assert_eq!(server.state, ServerState::Running);
        assert_eq!(server.listen_port, Some(51821));

        let names: Vec<String> = engine
            .list_peers(server.id, None)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Peer #1", "laptop", "laptop (2)"]);

        assert!(engine.discover(backend_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_key_blocks_import() {
        let (engine, driver) = engine().await;
        let backend_id = backend(&engine).await;
        let mut hidden = foreign("wg3", false, vec![]);
        hidden.private_key = None;
        driver.foreign.lock().unwrap().push(hidden);

        assert!(matches!(
            engine.import_server(backend_id, "wg3", None).await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            engine.import_server(backend_id, "wg9", None).await,
            Err(CoreError::Validation(_))
        ));
        assert!(engine.list_servers(Some(backend_id), None).await.unwrap().is_empty());
    }
}
