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

//! Management facade: validated CRUD over backends, servers, peers and
//! users, lifecycle operations, discovery and change subscriptions.
//!
//! Every mutation commits to the store first, then reconciles live state,
//! then publishes. Callers pass the acting user as [`Actor`].

mod backend;
mod import;
mod peer;
mod server;
pub mod validate;

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;
use wiresmith_types::model::{Attribution, AvailableBackend};
use wiresmith_types::{ChangeAction, Entity, User};

pub use backend::{BackendInput, BackendPatch};
pub use peer::{PeerInput, PeerPatch};
pub use server::{ServerInput, ServerPatch};

use crate::config::EngineSettings;
use crate::db::user::UserStore;
use crate::db::{StoreError, WgStore};
use crate::error::CoreError;
use crate::events::{EventBus, EventFilter, Subscription};
use crate::reconcile::Reconciler;
use crate::registry::{DriverFactory, DriverRegistry};

/// User a mutation is attributed to. `None` for system actions.
pub type Actor = Option<Uuid>;

const VERSION_RETRIES: usize = 3;
const MIN_PASSWORD_LEN: usize = 8;

pub struct Engine {
    store: WgStore,
    users: UserStore,
    registry: Arc<DriverRegistry>,
    events: Arc<EventBus>,
    reconciler: Reconciler,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        pool: SqlitePool,
        encryption_key: [u8; 32],
        factory: Arc<dyn DriverFactory>,
        settings: EngineSettings,
    ) -> Self {
        let store = WgStore::new(pool.clone(), encryption_key);
        let registry = Arc::new(DriverRegistry::new(factory, settings.driver_timeout));
        let events = Arc::new(EventBus::new(settings.event_queue_capacity));
        let reconciler =
            Reconciler::new(store.clone(), registry.clone(), events.clone(), settings.clone());
        Self {
            store,
            users: UserStore::new(pool),
            registry,
            events,
            reconciler,
            settings,
        }
    }

    pub fn store(&self) -> &WgStore {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.events.subscribe(filter)
    }

    pub fn unsubscribe(&self, subscription_id: u64) {
        self.events.unsubscribe(subscription_id);
    }

    fn publish(&self, action: ChangeAction, entity: Entity, actor: Actor) {
        self.events.publish(action, entity, actor);
    }

    /// Every driver kind with whether it runs here and is already claimed.
    pub async fn list_available(&self) -> Result<Vec<AvailableBackend>, CoreError> {
        let backends = self.store.list_backends(None).await?;
        Ok(self.registry.list_available(&backends))
    }

    /// Startup reconciliation, see [`Reconciler::recover`].
    pub async fn recover(&self) -> Result<(), CoreError> {
        self.reconciler.recover().await
    }

    pub async fn sweep(&self) {
        self.reconciler.sweep().await;
    }

    pub async fn shutdown(&self) {
        self.registry.close_all().await;
        info!("engine shut down");
    }

    // -- Users --

    pub async fn create_user(
        &self,
        email: &str,
        password: &str,
        actor: Actor,
    ) -> Result<User, CoreError> {
        validate_email(email)?;
        validate_password(password)?;
        let user = self.users.create(email.trim(), password).await?;
        self.publish(ChangeAction::Created, Entity::User(user.clone()), actor);
        Ok(user)
    }

    pub async fn get_user(&self, id: Uuid) -> Result<User, CoreError> {
        Ok(self.users.require(id).await?)
    }

    pub async fn list_users(&self, search: Option<&str>) -> Result<Vec<User>, CoreError> {
        Ok(self.users.list(search).await?)
    }

    pub async fn update_user_email(
        &self,
        id: Uuid,
        email: &str,
        actor: Actor,
    ) -> Result<User, CoreError> {
        validate_email(email)?;
        let user = self.users.update_email(id, email.trim()).await?;
        self.publish(ChangeAction::Updated, Entity::User(user.clone()), actor);
        Ok(user)
    }

    pub async fn update_user_password(
        &self,
        id: Uuid,
        password: &str,
        actor: Actor,
    ) -> Result<User, CoreError> {
        validate_password(password)?;
        let user = self.users.update_password(id, password).await?;
        self.publish(ChangeAction::Updated, Entity::User(user.clone()), actor);
        Ok(user)
    }

    pub async fn delete_user(&self, id: Uuid, actor: Actor) -> Result<User, CoreError> {
        let user = self.users.delete(id).await?;
        self.publish(ChangeAction::Deleted, Entity::User(user.clone()), actor);
        Ok(user)
    }

    /// The user owning `email` if `password` matches.
    pub async fn verify_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<User>, CoreError> {
        Ok(self.users.verify_password(email.trim(), password).await?)
    }

    /// Create the first user when none exist yet. Returns whether one was made.
    pub async fn bootstrap_user(&self, email: &str, password: &str) -> Result<bool, CoreError> {
        if !self.users.is_empty().await? {
            debug!("users present, skipping bootstrap");
            return Ok(false);
        }
        let user = self.create_user(email, password, None).await?;
        info!(email = %user.email, "created initial user");
        Ok(true)
    }
}

fn validate_email(email: &str) -> Result<(), CoreError> {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && email.len() <= 254 => {
            Ok(())
        }
        _ => Err(CoreError::validation(format!("invalid email {email:?}"))),
    }
}

fn validate_password(password: &str) -> Result<(), CoreError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(CoreError::validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// Placeholder bookkeeping for an entity about to be inserted. The store
/// assigns the persisted timestamps.
fn new_attribution(actor: Actor) -> Attribution {
    let now = Utc::now();
    Attribution {
        created_by: actor,
        updated_by: actor,
        created_at: now,
        updated_at: now,
    }
}

/// Re-run a read-modify-write until it lands on a current version.
async fn with_version_retry<T, F, Fut>(mut attempt: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let mut tries = 0;
    loop {
        match attempt().await {
            Err(CoreError::Store(StoreError::VersionConflict { kind, id }))
                if tries + 1 < VERSION_RETRIES =>
            {
                tries += 1;
                debug!(?kind, %id, tries, "version conflict, retrying");
            }
            Err(CoreError::Store(StoreError::VersionConflict { kind, id })) => {
                return Err(CoreError::Conflict(format!(
                    "{kind:?} {id} is being modified concurrently"
                )));
            }
            other => return other,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use wiresmith_types::interface::{
        DeviceStats, ForeignServer, InterfaceConfig, InterfaceStats, ObservedInterface,
        ObservedPeer, PeerConfig,
    };
    use wiresmith_types::{BackendKind, BackendUrl};

    use super::*;
    use crate::db::test_support::TEST_KEY;
    use crate::db::{memory_pool, migrate};
    use crate::driver::{Capabilities, Driver, DriverError};

    /// In-memory driver recording the interfaces it was asked to hold.
    #[derive(Default)]
    pub struct FakeDriver {
        pub up: Mutex<HashMap<String, Vec<PeerConfig>>>,
        pub calls: Mutex<Vec<String>>,
        pub fail_sync: Mutex<bool>,
        pub foreign: Mutex<Vec<ForeignServer>>,
    }

    #[async_trait]
    impl Driver for FakeDriver {
        fn kind(&self) -> BackendKind {
            BackendKind::Linux
        }

        async fn capabilities(&self) -> Capabilities {
            Capabilities { supported: true }
        }

        async fn probe(&self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn up(&self, config: &InterfaceConfig) -> Result<ObservedInterface, DriverError> {
            self.calls.lock().unwrap().push(format!("up {}", config.name));
            self.up.lock().unwrap().entry(config.name.clone()).or_default();
            Ok(ObservedInterface {
                name: config.name.clone(),
                up: true,
                public_key: None,
                listen_port: config.listen_port,
            })
        }

        async fn down(&self, name: &str) -> Result<(), DriverError> {
            self.calls.lock().unwrap().push(format!("down {name}"));
            self.up.lock().unwrap().remove(name);
            Ok(())
        }

        async fn sync_peers(
            &self,
            name: &str,
            desired: &[PeerConfig],
        ) -> Result<Vec<ObservedPeer>, DriverError> {
            self.calls.lock().unwrap().push(format!("sync {name} {}", desired.len()));
            if *self.fail_sync.lock().unwrap() {
                return Err(DriverError::Unavailable("link down".into()));
            }
            match self.up.lock().unwrap().get_mut(name) {
                Some(peers) => *peers = desired.to_vec(),
                None => return Err(DriverError::InterfaceNotFound(name.into())),
            }
            Ok(Vec::new())
        }

        async fn read_stats(&self, name: &str) -> Result<DeviceStats, DriverError> {
            if !self.up.lock().unwrap().contains_key(name) {
                return Err(DriverError::InterfaceNotFound(name.into()));
            }
            Ok(DeviceStats {
                interface: InterfaceStats {
                    name: name.into(),
                    up: true,
                    ..Default::default()
                },
                peers: Vec::new(),
            })
        }

        async fn discover(&self, known: &[String]) -> Result<Vec<ForeignServer>, DriverError> {
            Ok(self
                .foreign
                .lock()
                .unwrap()
                .iter()
                .filter(|f| !known.contains(&f.name))
                .cloned()
                .collect())
        }
    }

    pub struct FakeFactory(pub Arc<FakeDriver>);

    impl DriverFactory for FakeFactory {
        fn supported(&self, _kind: BackendKind) -> bool {
            true
        }

        fn create(
            &self,
            _url: &BackendUrl,
            _timeout: Duration,
        ) -> Result<Arc<dyn Driver>, DriverError> {
            Ok(self.0.clone())
        }
    }

    pub async fn engine() -> (Engine, Arc<FakeDriver>) {
        let pool = memory_pool().await.unwrap();
        migrate(&pool).await.unwrap();
        let driver = Arc::new(FakeDriver::default());
        let engine = Engine::new(
            pool,
            TEST_KEY,
            Arc::new(FakeFactory(driver.clone())),
            EngineSettings::default(),
        );
        (engine, driver)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::engine;
    use super::*;

    #[tokio::test]
    async fn bootstrap_only_when_empty() {
        let (engine, _) = engine().await;
        assert!(engine.bootstrap_user("admin@example.com", "correct horse").await.unwrap());
        assert!(!engine.bootstrap_user("other@example.com", "correct horse").await.unwrap());
        assert!(engine
            .verify_credentials("admin@example.com", "correct horse")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn user_validation() {
        let (engine, _) = engine().await;
        assert!(matches!(
            engine.create_user("nope", "long enough", None).await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            engine.create_user("a@example.com", "short", None).await,
            Err(CoreError::Validation(_))
        ));
        engine.create_user("a@example.com", "long enough", None).await.unwrap();
        assert!(matches!(
            engine.create_user("a@example.com", "long enough", None).await,
            Err(CoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn version_retry_gives_up_with_conflict() {
        let id = Uuid::new_v4();
        let mut attempts = 0;
        let result: Result<(), CoreError> = with_version_retry(|| {
            attempts += 1;
            async move {
                Err(CoreError::Store(StoreError::VersionConflict {
                    kind: wiresmith_types::EntityKind::Server,
                    id,
                }))
            }
        })
        .await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));
        assert_eq!(attempts, VERSION_RETRIES);
    }
}
