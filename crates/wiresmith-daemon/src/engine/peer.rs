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

use serde::Deserialize;
use tracing::info;
use uuid::Uuid;
use wiresmith_types::interface::PeerStats;
use wiresmith_types::{ChangeAction, Entity, Hook, HookTrigger, Peer, Server};

use super::{Actor, Engine, new_attribution, validate, with_version_retry};
use crate::error::{CoreError, Outcome};
use crate::hooks::HookContext;
use crate::keys::{canonical_public_key, generate_preshared_key, parse_key};
use crate::reconcile::peer_config;

#[derive(Debug, Clone, Deserialize)]
pub struct PeerInput {
    pub server_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub public_key: String,
    pub preshared_key: Option<String>,
    /// Generate a preshared key when none is given.
    #[serde(default)]
    pub generate_preshared_key: bool,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub persistent_keepalive: u16,
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub public_key: Option<String>,
    /// `Some(None)` removes the preshared key.
    pub preshared_key: Option<Option<String>>,
    pub endpoint: Option<Option<String>>,
    pub allowed_ips: Option<Vec<String>>,
    pub persistent_keepalive: Option<u16>,
    pub hooks: Option<Vec<Hook>>,
}

fn check_declared(peer: &Peer, server: &Server) -> Result<(), CoreError> {
    validate::peer_name(&peer.name)?;
    validate::description(&peer.description)?;
    if let Some(endpoint) = &peer.endpoint {
        validate::endpoint(endpoint)?;
    }
    validate::allowed_ips(&peer.allowed_ips)?;
    validate::hooks(&peer.hooks, true)?;
    if peer.public_key == server.public_key {
        return Err(CoreError::validation(format!(
            "peer {} uses the public key of server {}",
            peer.name, server.name
        )));
    }
    Ok(())
}

fn normalize_psk(psk: Option<&str>) -> Result<Option<String>, CoreError> {
    match psk.map(str::trim).filter(|p| !p.is_empty()) {
        Some(psk) => {
            parse_key(psk)?;
            Ok(Some(psk.to_string()))
        }
        None => Ok(None),
    }
}

fn normalize_endpoint(endpoint: Option<&str>) -> Option<String> {
    endpoint
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
}

impl Engine {
    #[tracing::instrument(skip(self, input), fields(name = %input.name, server = %input.server_id))]
    pub async fn create_peer(&self, input: PeerInput, actor: Actor) -> Result<Outcome<Peer>, CoreError> {
        let public_key = canonical_public_key(&input.public_key)?;
        let preshared_key = match normalize_psk(input.preshared_key.as_deref())? {
            None if input.generate_preshared_key => Some(generate_preshared_key()),
            psk => psk,
        };

        let peer = Peer {
            id: Uuid::new_v4(),
            server_id: input.server_id,
            name: input.name.trim().to_string(),
            description: input.description,
            public_key,
            preshared_key,
            endpoint: normalize_endpoint(input.endpoint.as_deref()),
            allowed_ips: input.allowed_ips,
            persistent_keepalive: input.persistent_keepalive,
            hooks: input.hooks,
            stats: PeerStats::default(),
            attribution: new_attribution(actor),
            version: 0,
        };
        let server = self.store.require_server(peer.server_id).await?;
        check_declared(&peer, &server)?;

        let peer = self.store.insert_peer(&peer, actor).await?;
        info!(id = %peer.id, "peer created");

        let mut warnings = self
            .reconciler
            .hooks()
            .run(&peer.hooks, &HookContext::for_peer(&server, &peer, HookTrigger::Create))
            .await;
        self.publish(ChangeAction::Created, Entity::Peer(peer.clone()), actor);
        warnings.extend(self.reconciler.peers_changed(server.id, actor).await);
        Ok(Outcome::with_warnings(peer, warnings))
    }

    pub async fn get_peer(&self, id: Uuid) -> Result<Peer, CoreError> {
        Ok(self.store.require_peer(id).await?)
    }

    pub async fn list_peers(&self, server_id: Uuid, search: Option<&str>) -> Result<Vec<Peer>, CoreError> {
        self.store.require_server(server_id).await?;
        Ok(self.store.list_peers(server_id, search).await?)
    }

    async fn update_peer_once(
        &self,
        id: Uuid,
        patch: &PeerPatch,
        actor: Actor,
    ) -> Result<(Server, Peer, Peer), CoreError> {
        let current = self.store.require_peer(id).await?;
        let server = self.store.require_server(current.server_id).await?;
        let mut next = current.clone();

        if let Some(name) = &patch.name {
            next.name = name.trim().to_string();
        }
        if let Some(description) = &patch.description {
            next.description = description.clone();
        }
        if let Some(public_key) = &patch.public_key {
            next.public_key = canonical_public_key(public_key)?;
        }
        if let Some(psk) = &patch.preshared_key {
            next.preshared_key = normalize_psk(psk.as_deref())?;
        }
        if let Some(endpoint) = &patch.endpoint {
            next.endpoint = normalize_endpoint(endpoint.as_deref());
        }
        if let Some(allowed_ips) = &patch.allowed_ips {
            next.allowed_ips = allowed_ips.clone();
        }
        if let Some(keepalive) = patch.persistent_keepalive {
            next.persistent_keepalive = keepalive;
        }
        if let Some(hooks) = &patch.hooks {
            next.hooks = hooks.clone();
        }
        check_declared(&next, &server)?;

        let updated = self.store.update_peer(&next, actor).await?;
        Ok((server, current, updated))
    }

    #[tracing::instrument(skip(self, patch))]
    pub async fn update_peer(
        &self,
        id: Uuid,
        patch: PeerPatch,
        actor: Actor,
    ) -> Result<Outcome<Peer>, CoreError> {
        let patch = &patch;
        let (server, before, peer) =
            with_version_retry(|| async move { self.update_peer_once(id, patch, actor).await })
                .await?;
        info!(peer = %peer.name, server = %server.name, "peer updated");

        let mut warnings = self
            .reconciler
            .hooks()
            .run(&peer.hooks, &HookContext::for_peer(&server, &peer, HookTrigger::Update))
            .await;
        self.publish(ChangeAction::Updated, Entity::Peer(peer.clone()), actor);
        if peer_config(&before) != peer_config(&peer) {
            warnings.extend(self.reconciler.peers_changed(server.id, actor).await);
        }
        Ok(Outcome::with_warnings(peer, warnings))
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_peer(&self, id: Uuid, actor: Actor) -> Result<Outcome<Peer>, CoreError> {
        let peer = self.store.require_peer(id).await?;
        let server = self.store.require_server(peer.server_id).await?;
        let peer = self.store.delete_peer(id).await?;
        info!(peer = %peer.name, server = %server.name, "peer deleted");

        let mut warnings = self
            .reconciler
            .hooks()
            .run(&peer.hooks, &HookContext::for_peer(&server, &peer, HookTrigger::Delete))
            .await;
        self.publish(ChangeAction::Deleted, Entity::Peer(peer.clone()), actor);
        warnings.extend(self.reconciler.peers_changed(server.id, actor).await);
        Ok(Outcome::with_warnings(peer, warnings))
    }
}

#[cfg(test)]
mod tests {
    use wiresmith_types::ServerState;

    use super::super::test_support::engine;
    use super::super::{BackendInput, ServerInput};
    use super::*;
    use crate::error::Warning;
    use crate::keys::generate_key_pair;

    async fn server(engine: &Engine) -> Server {
        let backend_id = engine
            .create_backend(
                BackendInput {
                    name: "local".into(),
                    description: String::new(),
                    url: "linux://".into(),
                    enabled: true,
                },
                None,
            )
            .await
            .unwrap()
            .value
            .backend
            .id;
        engine
            .create_server(
                ServerInput {
                    backend_id,
                    name: "wg0".into(),
                    description: String::new(),
                    address: "10.0.0.1/24".into(),
                    listen_port: Some(51820),
                    dns: vec![],
                    mtu: None,
                    firewall_mark: None,
                    enabled: true,
                    private_key: None,
                    hooks: vec![],
                },
                None,
            )
            .await
            .unwrap()
            .value
    }

    fn input(server_id: Uuid, name: &str) -> PeerInput {
        PeerInput {
            server_id,
            name: name.into(),
            description: String::new(),
            public_key: generate_key_pair().public_key,
            preshared_key: None,
            generate_preshared_key: false,
            endpoint: None,
            allowed_ips: vec!["10.0.0.2/32".into()],
            persistent_keepalive: 25,
            hooks: vec![],
        }
    }

    #[tokio::test]
    async fn stopped_server_keeps_peers_declared_only() {
        let (engine, driver) = engine().await;
        let server = server(&engine).await;
        let outcome = engine.create_peer(input(server.id, "laptop"), None).await.unwrap();
        assert!(outcome.warnings.is_empty());
        assert!(driver.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn running_server_gets_peer_synced() {
        let (engine, driver) = engine().await;
        let server = server(&engine).await;
        engine.start_server(server.id, None).await.unwrap();

        let peer = engine.create_peer(input(server.id, "laptop"), None).await.unwrap().value;
        assert_eq!(driver.up.lock().unwrap()["wg0"].len(), 1);

        engine
            .update_peer(
                peer.id,
                PeerPatch {
                    allowed_ips: Some(vec!["10.0.0.2/32".into(), "192.168.5.0/24".into()]),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(driver.up.lock().unwrap()["wg0"][0].allowed_ips.len(), 2);

        engine.delete_peer(peer.id, None).await.unwrap();
        assert!(driver.up.lock().unwrap()["wg0"].is_empty());
    }

    #[tokio::test]
    async fn failed_sync_keeps_the_peer_and_warns() {
        let (engine, driver) = engine().await;
        let server = server(&engine).await;
        engine.start_server(server.id, None).await.unwrap();
        *driver.fail_sync.lock().unwrap() = true;

        let outcome = engine.create_peer(input(server.id, "laptop"), None).await.unwrap();
        assert!(matches!(outcome.warnings[..], [Warning::LiveSyncFailed { .. }]));
        assert!(engine.get_peer(outcome.value.id).await.is_ok());
        assert_eq!(
            engine.get_server(server.id).await.unwrap().state,
            ServerState::Degraded
        );
    }

    #[tokio::test]
    async fn metadata_edit_skips_sync() {
        let (engine, driver) = engine().await;
        let server = server(&engine).await;
        engine.start_server(server.id, None).await.unwrap();
        let peer = engine.create_peer(input(server.id, "laptop"), None).await.unwrap().value;
        driver.calls.lock().unwrap().clear();

        engine
            .update_peer(
                peer.id,
                PeerPatch {
                    description: Some("work laptop".into()),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert!(driver.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn key_rules() {
        let (engine, _) = engine().await;
        let server = server(&engine).await;

        let mut own_key = input(server.id, "loop");
        own_key.public_key = server.public_key.clone();
        assert!(matches!(
            engine.create_peer(own_key, None).await,
            Err(CoreError::Validation(_))
        ));

        let mut bad = input(server.id, "bad");
        bad.public_key = "AAAA".into();
        assert!(matches!(
            engine.create_peer(bad, None).await,
            Err(CoreError::InvalidKey(_))
        ));

        let first = input(server.id, "one");
        let mut second = input(server.id, "two");
        second.public_key = first.public_key.clone();
        engine.create_peer(first, None).await.unwrap();
        assert!(matches!(
            engine.create_peer(second, None).await,
            Err(CoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn preshared_key_generation_and_removal() {
        let (engine, _) = engine().await;
        let server = server(&engine).await;
        let mut with_psk = input(server.id, "phone");
        with_psk.generate_preshared_key = true;
        let peer = engine.create_peer(with_psk, None).await.unwrap().value;
        assert!(peer.has_preshared_key());

        let peer = engine
            .update_peer(
                peer.id,
                PeerPatch {
                    preshared_key: Some(None),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap()
            .value;
        assert!(!peer.has_preshared_key());
    }

    #[tokio::test]
    async fn invalid_endpoint_rejected() {
        let (engine, _) = engine().await;
        let server = server(&engine).await;
        let mut peer = input(server.id, "remote");
        peer.endpoint = Some("no-port".into());
        assert!(matches!(
            engine.create_peer(peer, None).await,
            Err(CoreError::Validation(_))
        ));
    }
}
