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

//! Drives backend drivers so live interfaces match the store.
//!
//! Every operation touching one server's live interface runs under that
//! server's lock. Different servers reconcile in parallel.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wiresmith_types::interface::{InterfaceConfig, PeerConfig, PeerStats};
use wiresmith_types::{
    Backend, ChangeAction, Entity, EntityKind, HookTrigger, Peer, Server, ServerState,
};

use crate::config::EngineSettings;
use crate::db::WgStore;
use crate::driver::{Driver, DriverError};
use crate::error::{CoreError, Outcome, Warning};
use crate::events::EventBus;
use crate::hooks::{HookContext, HookExecutor};
use crate::registry::DriverRegistry;

/// How much of a running interface an edit invalidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeClass {
    /// Description, hooks, enabled flag: nothing live to touch.
    Metadata,
    /// Port, MTU, fwmark, DNS: `up` applies them in place.
    Reapply,
    /// Address or key material: down and up again.
    Restart,
}

impl ChangeClass {
    pub fn between(before: &Server, after: &Server) -> Self {
        if before.address != after.address || before.private_key != after.private_key {
            Self::Restart
        } else if before.listen_port != after.listen_port
            || before.mtu != after.mtu
            || before.firewall_mark != after.firewall_mark
            || before.dns != after.dns
        {
            Self::Reapply
        } else {
            Self::Metadata
        }
    }
}

pub fn interface_config(server: &Server) -> InterfaceConfig {
    InterfaceConfig {
        name: server.name.clone(),
        private_key: server.private_key.clone(),
        address: server.address.clone(),
        listen_port: server.listen_port,
        mtu: server.mtu,
        firewall_mark: server.firewall_mark,
        dns: server.dns.clone(),
    }
}

pub fn peer_config(peer: &Peer) -> PeerConfig {
    PeerConfig {
        public_key: peer.public_key.clone(),
        preshared_key: peer.preshared_key.clone(),
        endpoint: peer.endpoint.clone(),
        allowed_ips: peer.allowed_ips.clone(),
        persistent_keepalive: peer.persistent_keepalive,
    }
}

pub struct Reconciler {
    store: WgStore,
    registry: Arc<DriverRegistry>,
    hooks: HookExecutor,
    events: Arc<EventBus>,
    settings: EngineSettings,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl Reconciler {
    pub fn new(
        store: WgStore,
        registry: Arc<DriverRegistry>,
        events: Arc<EventBus>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            registry,
            hooks: HookExecutor::new(settings.hook_timeout, settings.hook_concurrency),
            events,
            settings,
            locks: DashMap::new(),
        }
    }

    pub fn hooks(&self) -> &HookExecutor {
        &self.hooks
    }

    /// Serialize live operations on one server.
    pub async fn lock(&self, server_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(server_id).or_default().clone();
        lock.lock_owned().await
    }

    pub fn forget(&self, server_id: Uuid) {
        self.locks.remove(&server_id);
    }

    /// Run a driver call under the configured timeout. A timeout counts as
    /// the backend being unavailable.
    async fn call<T>(
        &self,
        backend: &Backend,
        target: &str,
        fut: impl Future<Output = Result<T, DriverError>>,
    ) -> Result<T, CoreError> {
        let result = match tokio::time::timeout(self.settings.driver_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(self.settings.driver_timeout)),
        };
        result.map_err(|e| CoreError::from_driver(&backend.name, target, e))
    }

    async fn driver(&self, server: &Server) -> Result<(Backend, Arc<dyn Driver>), CoreError> {
        let backend = self.store.require_backend(server.backend_id).await?;
        let driver = self.registry.driver_for(&backend).await?;
        Ok((backend, driver))
    }

    async fn set_state(
        &self,
        server: &Server,
        state: ServerState,
        action: ChangeAction,
        actor: Option<Uuid>,
    ) -> Result<Server, CoreError> {
        let updated = self.store.set_server_state(server.id, state).await?;
        self.events
            .publish(action, Entity::Server(updated.clone()), actor);
        Ok(updated)
    }

    async fn mark_degraded(&self, server: &Server, actor: Option<Uuid>) {
        if server.state == ServerState::Degraded {
            return;
        }
        warn!(server = %server.name, "marking server degraded");
        if let Err(e) = self
            .set_state(server, ServerState::Degraded, ChangeAction::Updated, actor)
            .await
        {
            error!(server = %server.name, error = %e, "failed to record degraded state");
        }
    }

    async fn record_stats(&self, server: &Server, observed: &[(String, PeerStats)]) {
        match self.store.record_peer_stats(server.id, observed).await {
            Ok(changed) => {
                for peer in changed {
                    self.events
                        .publish(ChangeAction::StatsUpdated, Entity::Peer(peer), None);
                }
            }
            Err(e) => warn!(server = %server.name, error = %e, "failed to store peer stats"),
        }
    }

    /// Up plus a full peer sync.
    async fn apply(&self, server: &Server) -> Result<(), CoreError> {
        let target = format!("server {}", server.name);
        let (backend, driver) = self.driver(server).await?;

        let config = interface_config(server);
        let observed = self.call(&backend, &target, driver.up(&config)).await?;
        if !observed.up {
            return Err(CoreError::from_driver(
                &backend.name,
                &target,
                DriverError::Interface(format!("{} did not come up", server.name)),
            ));
        }

        let peers = self.store.list_peers(server.id, None).await?;
        let desired: Vec<PeerConfig> = peers.iter().map(peer_config).collect();
        let live = self
            .call(&backend, &target, driver.sync_peers(&server.name, &desired))
            .await?;

        let stats: Vec<_> = live
            .into_iter()
            .map(|p| (p.public_key, p.stats))
            .collect();
        self.record_stats(server, &stats).await;
        Ok(())
    }

    async fn start_locked(
        &self,
        server: Server,
        actor: Option<Uuid>,
    ) -> Result<Outcome<Server>, CoreError> {
        if !matches!(server.state, ServerState::Stopped | ServerState::Degraded) {
            return Err(CoreError::InvalidState {
                server: server.name.clone(),
                state: server.state,
                operation: "start",
            });
        }
        if !server.enabled {
            return Err(CoreError::validation(format!(
                "server {} is disabled",
                server.name
            )));
        }
        let backend = self.store.require_backend(server.backend_id).await?;
        if !backend.enabled {
            return Err(CoreError::validation(format!(
                "backend {} is disabled",
                backend.name
            )));
        }

        info!(server = %server.name, backend = %backend.name, "starting server");
        let server = self.store.set_server_state(server.id, ServerState::Starting).await?;
        let warnings = self
            .hooks
            .run(&server.hooks, &HookContext::for_server(&server, HookTrigger::PreStart))
            .await;

        if let Err(e) = self.apply(&server).await {
            error!(server = %server.name, error = %e, "start failed");
            self.mark_degraded(&server, actor).await;
            return Err(e);
        }

        let server = self
            .set_state(&server, ServerState::Running, ChangeAction::Started, actor)
            .await?;
        info!(server = %server.name, "server running");
        Ok(Outcome::with_warnings(server, warnings))
    }

    async fn stop_locked(
        &self,
        server: Server,
        actor: Option<Uuid>,
    ) -> Result<Outcome<Server>, CoreError> {
        if !matches!(server.state, ServerState::Running | ServerState::Degraded) {
            return Err(CoreError::InvalidState {
                server: server.name.clone(),
                state: server.state,
                operation: "stop",
            });
        }

        info!(server = %server.name, "stopping server");
        let server = self.store.set_server_state(server.id, ServerState::Stopping).await?;
        let warnings = self
            .hooks
            .run(&server.hooks, &HookContext::for_server(&server, HookTrigger::PreStop))
            .await;

        let target = format!("server {}", server.name);
        let down = async {
            let (backend, driver) = self.driver(&server).await?;
            self.call(&backend, &target, driver.down(&server.name)).await
        };
        if let Err(e) = down.await {
            error!(server = %server.name, error = %e, "stop failed");
            self.mark_degraded(&server, actor).await;
            return Err(e);
        }

        let server = self
            .set_state(&server, ServerState::Stopped, ChangeAction::Stopped, actor)
            .await?;
        info!(server = %server.name, "server stopped");
        Ok(Outcome::with_warnings(server, warnings))
    }

    #[tracing::instrument(skip(self))]
    pub async fn start(
        &self,
        server_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<Outcome<Server>, CoreError> {
        let guard = self.lock(server_id).await;
        let server = self.store.require_server(server_id).await?;
        let outcome = self.start_locked(server, actor).await?;
        drop(guard);
        Ok(self.after_transition(outcome, HookTrigger::Start).await)
    }

    #[tracing::instrument(skip(self))]
    pub async fn stop(
        &self,
        server_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<Outcome<Server>, CoreError> {
        let guard = self.lock(server_id).await;
        let server = self.store.require_server(server_id).await?;
        let outcome = self.stop_locked(server, actor).await?;
        drop(guard);
        Ok(self.after_transition(outcome, HookTrigger::Stop).await)
    }

    /// Post-transition hooks run outside the server lock.
    async fn after_transition(
        &self,
        mut outcome: Outcome<Server>,
        trigger: HookTrigger,
    ) -> Outcome<Server> {
        let ctx = HookContext::for_server(&outcome.value, trigger);
        outcome
            .warnings
            .extend(self.hooks.run(&outcome.value.hooks, &ctx).await);
        outcome
    }

    /// Push the stored peer set of a running server to its interface.
    /// Failures become warnings: the store already holds the change.
    #[tracing::instrument(skip(self))]
    pub async fn peers_changed(&self, server_id: Uuid, actor: Option<Uuid>) -> Vec<Warning> {
        let _guard = self.lock(server_id).await;
        let server = match self.store.require_server(server_id).await {
            Ok(server) => server,
            Err(e) => {
                warn!(%server_id, error = %e, "server vanished before peer sync");
                return Vec::new();
            }
        };
        if !server.running() {
            debug!(server = %server.name, state = %server.state, "not running, peers stay declared only");
            return Vec::new();
        }

        let target = format!("server {}", server.name);
        let sync = async {
            let (backend, driver) = self.driver(&server).await?;
            let peers = self.store.list_peers(server.id, None).await?;
            let desired: Vec<PeerConfig> = peers.iter().map(peer_config).collect();
            self.call(&backend, &target, driver.sync_peers(&server.name, &desired))
                .await
        };

        match sync.await {
            Ok(live) => {
                let stats: Vec<_> = live.into_iter().map(|p| (p.public_key, p.stats)).collect();
                self.record_stats(&server, &stats).await;
                Vec::new()
            }
            Err(e) => {
                warn!(server = %server.name, error = %e, "peer sync failed");
                if is_drift(&e) {
                    self.mark_degraded(&server, actor).await;
                }
                vec![Warning::live_sync(&target, &e)]
            }
        }
    }

    /// Carry an edit of a running server to its interface.
    #[tracing::instrument(skip(self, before), fields(server = %before.name))]
    pub async fn server_changed(
        &self,
        before: &Server,
        class: ChangeClass,
        actor: Option<Uuid>,
    ) -> Vec<Warning> {
        if class == ChangeClass::Metadata {
            return Vec::new();
        }
        let _guard = self.lock(before.id).await;
        let server = match self.store.require_server(before.id).await {
            Ok(server) => server,
            Err(_) => return Vec::new(),
        };
        if !server.running() {
            return Vec::new();
        }

        let target = format!("server {}", server.name);
        info!(?class, "applying server change to live interface");
        let result = async {
            if class == ChangeClass::Restart {
                let (backend, driver) = self.driver(&server).await?;
                self.call(&backend, &target, driver.down(&server.name)).await?;
            }
            self.apply(&server).await
        }
        .await;

        match result {
            Ok(()) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "live update failed");
                self.mark_degraded(&server, actor).await;
                vec![Warning::live_sync(&target, &e)]
            }
        }
    }

    /// Bring the interface of a server about to be deleted down. Best effort.
    pub async fn teardown(&self, server: &Server) -> Vec<Warning> {
        if server.state == ServerState::Stopped {
            return Vec::new();
        }
        let target = format!("server {}", server.name);
        let down = async {
            let (backend, driver) = self.driver(server).await?;
            self.call(&backend, &target, driver.down(&server.name)).await
        };
        match down.await {
            Ok(()) => Vec::new(),
            Err(e) => {
                warn!(server = %server.name, error = %e, "teardown failed");
                vec![Warning::live_sync(&target, &e)]
            }
        }
    }

    /// Read counters for a running server and publish STATS_UPDATED for the
    /// peers whose counters moved.
    #[tracing::instrument(skip(self))]
    pub async fn refresh_stats(&self, server_id: Uuid) -> Result<(), CoreError> {
        let _guard = self.lock(server_id).await;
        let server = self.store.require_server(server_id).await?;
        if !server.running() {
            return Ok(());
        }
        let target = format!("server {}", server.name);
        let (backend, driver) = self.driver(&server).await?;
        match self
            .call(&backend, &target, driver.read_stats(&server.name))
            .await
        {
            Ok(stats) => {
                if !stats.interface.up {
                    warn!(server = %server.name, "interface reported down");
                    self.mark_degraded(&server, None).await;
                }
                self.record_stats(&server, &stats.peers).await;
                Ok(())
            }
            Err(e) => {
                if is_drift(&e) {
                    self.mark_degraded(&server, None).await;
                }
                Err(e)
            }
        }
    }

    /// Refresh stats of every running server.
    pub async fn sweep(&self) {
        if self.settings.stats_only_with_subscribers
            && !self.events.has_subscribers(EntityKind::Server)
            && !self.events.has_subscribers(EntityKind::Peer)
        {
            debug!("no subscribers, skipping stats sweep");
            return;
        }
        let servers = match self.store.list_servers(None, None).await {
            Ok(servers) => servers,
            Err(e) => {
                error!(error = %e, "stats sweep could not list servers");
                return;
            }
        };

        let running: Vec<&Server> = servers.iter().filter(|s| s.running()).collect();
        debug!(count = running.len(), "stats sweep");
        let refreshes = running.iter().map(|s| self.refresh_stats(s.id));
        for (server, result) in running.iter().zip(futures::future::join_all(refreshes).await) {
            if let Err(e) = result {
                warn!(server = %server.name, error = %e, "stats refresh failed");
            }
        }
    }

    /// Startup pass. Interrupted transitions become Degraded; with
    /// `restore_on_startup`, servers recorded as Running are re-applied.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<(), CoreError> {
        let servers = self.store.list_servers(None, None).await?;
        let mut restored = 0usize;

        for server in servers {
            let _guard = self.lock(server.id).await;
            if server.state.is_transitional() {
                warn!(server = %server.name, state = %server.state, "interrupted transition");
                self.mark_degraded(&server, None).await;
                continue;
            }
            if server.state != ServerState::Running || !self.settings.restore_on_startup {
                continue;
            }
            let backend = match self.store.require_backend(server.backend_id).await {
                Ok(backend) => backend,
                Err(e) => {
                    error!(server = %server.name, error = %e, "backend lookup failed");
                    self.mark_degraded(&server, None).await;
                    continue;
                }
            };
            if !server.enabled || !backend.enabled {
                warn!(server = %server.name, "running server is disabled, not restoring");
                self.mark_degraded(&server, None).await;
                continue;
            }
            match self.apply(&server).await {
                Ok(()) => {
                    restored += 1;
                    info!(server = %server.name, "restored server");
                }
                Err(e) => {
                    error!(server = %server.name, error = %e, "restore failed");
                    self.mark_degraded(&server, None).await;
                }
            }
        }

        info!(restored, "recovery complete");
        Ok(())
    }
}

fn is_drift(err: &CoreError) -> bool {
    match err {
        CoreError::BackendUnavailable { .. } => true,
        CoreError::Driver { source, .. } => source.is_drift(),
        _ => false,
    }
}
