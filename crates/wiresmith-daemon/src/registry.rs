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

//! Backend registry: driver selection by URL scheme, one cached driver per
//! backend, and the one-registration-per-target rule.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;
use wiresmith_types::model::AvailableBackend;
use wiresmith_types::{Backend, BackendKind, BackendUrl, parse_backend_url};

use crate::driver::command::{LocalRunner, SshRunner};
use crate::driver::networkmanager::NetworkManagerDriver;
use crate::driver::routeros::RouterOsDriver;
use crate::driver::wgquick::WgQuickDriver;
use crate::driver::{Driver, DriverError};
use crate::error::CoreError;

const DEFAULT_CONFIG_DIR: &str = "/etc/wireguard";

/// Builds drivers from parsed backend URLs.
pub trait DriverFactory: Send + Sync {
    /// Whether `kind` is compiled in and usable on this host.
    fn supported(&self, kind: BackendKind) -> bool;

    fn create(&self, url: &BackendUrl, timeout: Duration) -> Result<Arc<dyn Driver>, DriverError>;
}

/// The drivers shipped with the daemon.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinDrivers;

impl DriverFactory for BuiltinDrivers {
    fn supported(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::Linux | BackendKind::NetworkManager => cfg!(target_os = "linux"),
            BackendKind::Darwin => cfg!(target_os = "macos"),
            BackendKind::Exec | BackendKind::Ssh => cfg!(unix),
            BackendKind::RouterOs => true,
        }
    }

    fn create(&self, url: &BackendUrl, timeout: Duration) -> Result<Arc<dyn Driver>, DriverError> {
        if !self.supported(url.kind) {
            return Err(DriverError::Unsupported);
        }
        let config_dir = url.path.as_deref().unwrap_or(DEFAULT_CONFIG_DIR);

        let driver: Arc<dyn Driver> = match url.kind {
            #[cfg(target_os = "linux")]
            BackendKind::Linux => Arc::new(crate::driver::linux::LinuxDriver::new()),
            #[cfg(not(target_os = "linux"))]
            BackendKind::Linux => return Err(DriverError::Unsupported),
            BackendKind::NetworkManager => {
                Arc::new(NetworkManagerDriver::new(Arc::new(LocalRunner::new(false))))
            }
            BackendKind::Darwin => Arc::new(WgQuickDriver::new(
                BackendKind::Darwin,
                Arc::new(LocalRunner::new(false)),
                DEFAULT_CONFIG_DIR,
            )),
            BackendKind::Exec => Arc::new(WgQuickDriver::new(
                BackendKind::Exec,
                Arc::new(LocalRunner::new(url.sudo)),
                config_dir,
            )),
            BackendKind::Ssh => {
                let host = url.bare_host().ok_or_else(|| {
                    DriverError::Url(wiresmith_types::UrlError::MissingHost { scheme: "ssh" })
                })?;
                let runner = SshRunner::new(
                    host,
                    url.port.unwrap_or(22),
                    url.user.clone().unwrap_or_else(|| "root".to_string()),
                    url.sudo,
                );
                Arc::new(WgQuickDriver::new(BackendKind::Ssh, Arc::new(runner), config_dir))
            }
            BackendKind::RouterOs => Arc::new(RouterOsDriver::new(url, timeout)?),
        };
        Ok(driver)
    }
}

struct CachedDriver {
    url: String,
    driver: Arc<dyn Driver>,
}

pub struct DriverRegistry {
    factory: Arc<dyn DriverFactory>,
    timeout: Duration,
    drivers: DashMap<Uuid, CachedDriver>,
}

impl DriverRegistry {
    pub fn new(factory: Arc<dyn DriverFactory>, timeout: Duration) -> Self {
        Self {
            factory,
            timeout,
            drivers: DashMap::new(),
        }
    }

    pub fn supported(&self, kind: BackendKind) -> bool {
        self.factory.supported(kind)
    }

    /// Build a driver that is not cached, for probing a URL before it is saved.
    pub fn build(&self, url: &BackendUrl) -> Result<Arc<dyn Driver>, DriverError> {
        self.factory.create(url, self.timeout)
    }

    /// The driver for `backend`, rebuilt when its URL changed since last use.
    pub async fn driver_for(&self, backend: &Backend) -> Result<Arc<dyn Driver>, CoreError> {
        if let Some(cached) = self.drivers.get(&backend.id) {
            if cached.url == backend.url {
                return Ok(cached.driver.clone());
            }
        }

        let url = parse_backend_url(&backend.url)?;
        let driver = self
            .build(&url)
            .map_err(|e| CoreError::from_driver(&backend.name, "driver setup", e))?;
        debug!(backend = %backend.name, url = %url.masked(), "driver created");

        let previous = self.drivers.insert(
            backend.id,
            CachedDriver {
                url: backend.url.clone(),
                driver: driver.clone(),
            },
        );
        if let Some(previous) = previous {
            info!(backend = %backend.name, "backend url changed, replacing driver");
            previous.driver.close().await;
        }
        Ok(driver)
    }

    /// Drop and close the cached driver of a backend.
    pub async fn evict(&self, backend_id: Uuid) {
        if let Some((_, cached)) = self.drivers.remove(&backend_id) {
            cached.driver.close().await;
            debug!(%backend_id, "driver evicted");
        }
    }

    /// Check that `candidate` may be saved next to `others`, which must not
    /// include the backend being updated.
    pub fn validate_registration(
        &self,
        candidate: &BackendUrl,
        enabled: bool,
        others: &[Backend],
    ) -> Result<(), CoreError> {
        if !enabled {
            return Ok(());
        }
        if !self.supported(candidate.kind) {
            return Err(CoreError::validation(format!(
                "{} backends are not supported on this host",
                candidate.kind
            )));
        }

        let key = candidate.target_key();
        for other in others.iter().filter(|b| b.enabled) {
            let Ok(url) = parse_backend_url(&other.url) else {
                continue;
            };
            if candidate.kind.is_singleton() && url.kind == candidate.kind {
                return Err(CoreError::Conflict(format!(
                    "an enabled {} backend already exists: {}",
                    candidate.kind, other.name
                )));
            }
            if url.target_key() == key {
                return Err(CoreError::Conflict(format!(
                    "backend {} already manages {}",
                    other.name,
                    candidate.masked()
                )));
            }
        }
        Ok(())
    }

    /// Whether `backend` currently holds the registration for its target.
    pub fn registered(&self, backend: &Backend) -> bool {
        backend.enabled
            && backend
                .kind()
                .is_some_and(|kind| self.supported(kind))
    }

    pub fn list_available(&self, backends: &[Backend]) -> Vec<AvailableBackend> {
        BackendKind::ALL
            .into_iter()
            .map(|kind| AvailableBackend {
                kind,
                supported: self.supported(kind),
                registered: backends
                    .iter()
                    .any(|b| b.kind() == Some(kind) && self.registered(b)),
            })
            .collect()
    }

    pub async fn close_all(&self) {
        let ids: Vec<Uuid> = self.drivers.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.evict(id).await;
        }
    }
}
