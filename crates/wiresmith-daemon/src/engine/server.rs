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
use tracing::{info, warn};
use uuid::Uuid;
use wiresmith_types::{ChangeAction, Entity, Hook, HookTrigger, Server, ServerState};

use super::{Actor, Engine, new_attribution, validate, with_version_retry};
use crate::error::{CoreError, Outcome, Warning};
use crate::hooks::HookContext;
use crate::keys::{generate_key_pair, public_key_from_private};
use crate::reconcile::ChangeClass;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInput {
    pub backend_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub address: String,
    pub listen_port: Option<u16>,
    #[serde(default)]
    pub dns: Vec<String>,
    pub mtu: Option<u16>,
    pub firewall_mark: Option<u32>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Generated when absent.
    pub private_key: Option<String>,
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

fn default_true() -> bool {
    true
}

/// Partial update of a server's declared fields. The name and backend are
/// fixed once created. Nested options clear a value with `Some(None)`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerPatch {
    pub description: Option<String>,
    pub address: Option<String>,
    pub listen_port: Option<Option<u16>>,
    pub dns: Option<Vec<String>>,
    pub mtu: Option<Option<u16>>,
    pub firewall_mark: Option<Option<u32>>,
    pub enabled: Option<bool>,
    pub private_key: Option<String>,
    pub hooks: Option<Vec<Hook>>,
}

/// MTU 0 means "driver default".
fn normalize_mtu(mtu: Option<u16>) -> Option<u16> {
    mtu.filter(|m| *m != 0)
}

fn check_declared(server: &Server) -> Result<(), CoreError> {
    validate::description(&server.description)?;
    validate::address(&server.address)?;
    validate::mtu(server.mtu)?;
    validate::dns(&server.dns)?;
    validate::hooks(&server.hooks, false)
}

impl Engine {
    #[tracing::instrument(skip(self, input), fields(name = %input.name, backend = %input.backend_id))]
    pub async fn create_server(
        &self,
        input: ServerInput,
        actor: Actor,
    ) -> Result<Outcome<Server>, CoreError> {
        validate::server_name(&input.name)?;
        let (private_key, public_key) = match input.private_key {
            Some(private_key) => {
                let private_key = private_key.trim().to_string();
                let public_key = public_key_from_private(&private_key)?;
                (private_key, public_key)
            }
            None => {
                let pair = generate_key_pair();
                (pair.private_key, pair.public_key)
            }
        };

        let server = Server {
            id: Uuid::new_v4(),
            backend_id: input.backend_id,
            name: input.name,
            description: input.description,
            address: input.address.trim().to_string(),
            listen_port: input.listen_port,
            dns: input.dns,
            mtu: normalize_mtu(input.mtu),
            firewall_mark: input.firewall_mark,
            enabled: input.enabled,
            state: ServerState::Stopped,
            public_key,
            private_key,
            hooks: input.hooks,
            attribution: new_attribution(actor),
            version: 0,
        };
        check_declared(&server)?;
        self.store.require_backend(server.backend_id).await?;

        let server = self.store.insert_server(&server, actor).await?;
        info!(id = %server.id, "server created");

        let warnings = self
            .reconciler
            .hooks()
            .run(&server.hooks, &HookContext::for_server(&server, HookTrigger::Create))
            .await;
        self.publish(ChangeAction::Created, Entity::Server(server.clone()), actor);
        Ok(Outcome::with_warnings(server, warnings))
    }

    pub async fn get_server(&self, id: Uuid) -> Result<Server, CoreError> {
        Ok(self.store.require_server(id).await?)
    }

    pub async fn list_servers(
        &self,
        backend_id: Option<Uuid>,
        search: Option<&str>,
    ) -> Result<Vec<Server>, CoreError> {
        Ok(self.store.list_servers(backend_id, search).await?)
    }

    async fn update_server_once(
        &self,
        id: Uuid,
        patch: &ServerPatch,
        actor: Actor,
    ) -> Result<(Server, Server), CoreError> {
        let current = self.store.require_server(id).await?;
        let mut next = current.clone();

        if let Some(description) = &patch.description {
            next.description = description.clone();
        }
        if let Some(address) = &patch.address {
            next.address = address.trim().to_string();
        }
        if let Some(port) = patch.listen_port {
            next.listen_port = port;
        }
        if let Some(dns) = &patch.dns {
            next.dns = dns.clone();
        }
        if let Some(mtu) = patch.mtu {
            next.mtu = normalize_mtu(mtu);
        }
        if let Some(mark) = patch.firewall_mark {
            next.firewall_mark = mark;
        }
        if let Some(enabled) = patch.enabled {
            next.enabled = enabled;
        }
        if let Some(hooks) = &patch.hooks {
            next.hooks = hooks.clone();
        }
        if let Some(private_key) = &patch.private_key {
            let private_key = private_key.trim();
            next.public_key = public_key_from_private(private_key)?;
            next.private_key = private_key.to_string();
        }
        check_declared(&next)?;

        let updated = self.store.update_server(&next, actor).await?;
        Ok((current, updated))
    }

    /// Commit an edit, then carry it to the live interface. Disabling a
    /// live server stops it. Live failures come back as warnings.
    #[tracing::instrument(skip(self, patch))]
    pub async fn update_server(
        &self,
        id: Uuid,
        patch: ServerPatch,
        actor: Actor,
    ) -> Result<Outcome<Server>, CoreError> {
        let patch = &patch;
        let (before, after) =
            with_version_retry(|| async move { self.update_server_once(id, patch, actor).await })
                .await?;
        let class = ChangeClass::between(&before, &after);
        info!(server = %after.name, ?class, "server updated");
        self.publish(ChangeAction::Updated, Entity::Server(after.clone()), actor);

        let mut warnings = self
            .reconciler
            .hooks()
            .run(&after.hooks, &HookContext::for_server(&after, HookTrigger::Update))
            .await;

        let live = matches!(after.state, ServerState::Running | ServerState::Degraded);
        if before.enabled && !after.enabled && live {
            match self.reconciler.stop(id, actor).await {
                Ok(outcome) => warnings.extend(outcome.warnings),
                Err(e) => {
                    warn!(server = %after.name, error = %e, "stopping disabled server failed");
                    warnings.push(Warning::live_sync(&format!("server {}", after.name), &e));
                }
            }
        } else {
            warnings.extend(self.reconciler.server_changed(&before, class, actor).await);
        }

        let server = self.store.require_server(id).await?;
        Ok(Outcome::with_warnings(server, warnings))
    }

    /// Bring the interface down if needed and delete the server with its
    /// peers. Publishes DELETED for every peer, then for the server.
    #[tracing::instrument(skip(self))]
    pub async fn delete_server(&self, id: Uuid, actor: Actor) -> Result<Outcome<Server>, CoreError> {
        let guard = self.reconciler.lock(id).await;
        let server = self.store.require_server(id).await?;
        let mut warnings = self.reconciler.teardown(&server).await;
        let (server, peers) = self.store.delete_server(id).await?;
        drop(guard);
        self.reconciler.forget(id);

        warnings.extend(
            self.reconciler
                .hooks()
                .run(&server.hooks, &HookContext::for_server(&server, HookTrigger::Delete))
                .await,
        );
        info!(server = %server.name, peers = peers.len(), "server deleted");
        for peer in peers {
            self.publish(ChangeAction::Deleted, Entity::Peer(peer), actor);
        }
        self.publish(ChangeAction::Deleted, Entity::Server(server.clone()), actor);
        Ok(Outcome::with_warnings(server, warnings))
    }

    pub async fn start_server(&self, id: Uuid, actor: Actor) -> Result<Outcome<Server>, CoreError> {
        self.reconciler.start(id, actor).await
    }

    pub async fn stop_server(&self, id: Uuid, actor: Actor) -> Result<Outcome<Server>, CoreError> {
        self.reconciler.stop(id, actor).await
    }

    /// Re-push the declared configuration. A degraded server is started
    /// again; a stopped one is left alone.
    #[tracing::instrument(skip(self))]
    pub async fn sync_server(&self, id: Uuid, actor: Actor) -> Result<Outcome<Server>, CoreError> {
        let server = self.store.require_server(id).await?;
        match server.state {
            ServerState::Degraded => self.reconciler.start(id, actor).await,
            ServerState::Running => {
                let warnings = self
                    .reconciler
                    .server_changed(&server, ChangeClass::Reapply, actor)
                    .await;
                let server = self.store.require_server(id).await?;
                Ok(Outcome::with_warnings(server, warnings))
            }
            _ => Ok(Outcome::new(server)),
        }
    }

    pub async fn refresh_server_stats(&self, id: Uuid) -> Result<(), CoreError> {
        self.reconciler.refresh_stats(id).await
    }
}
