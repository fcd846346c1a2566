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

//! Domain entities tracked by the engine.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend_url::mask_backend_url;
use crate::interface::PeerStats;

/// Who created and last touched an entity, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    /// User that created the entity, if still present.
    pub created_by: Option<Uuid>,
    /// User that performed the last update, if still present.
    pub updated_by: Option<Uuid>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

/// The driver family a backend URL selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local kernel module driven over netlink.
    Linux,
    /// Local `wg-quick` on macOS.
    Darwin,
    /// Local NetworkManager connection profiles.
    NetworkManager,
    /// Local `wg`/`wg-quick` commands with a config directory.
    Exec,
    /// Remote `wg`/`wg-quick` over ssh.
    Ssh,
    /// MikroTik RouterOS REST API.
    RouterOs,
}

impl BackendKind {
    /// Every kind, in display order.
    pub const ALL: [BackendKind; 6] = [
        BackendKind::Linux,
        BackendKind::Darwin,
        BackendKind::NetworkManager,
        BackendKind::Exec,
        BackendKind::Ssh,
        BackendKind::RouterOs,
    ];

    /// URL scheme selecting this kind.
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Darwin => "darwin",
            Self::NetworkManager => "networkmanager",
            Self::Exec => "exec",
            Self::Ssh => "ssh",
            Self::RouterOs => "routeros",
        }
    }

    /// Look a kind up by URL scheme (case-insensitive).
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.scheme().eq_ignore_ascii_case(scheme))
    }

    /// Local control planes of which only one enabled backend may exist per host.
    pub fn is_singleton(self) -> bool {
        matches!(self, Self::Linux | Self::Darwin | Self::NetworkManager)
    }

    /// Whether the kind reaches a different machine.
    pub fn is_remote(self) -> bool {
        matches!(self, Self::Ssh | Self::RouterOs)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// A configured connection to a WireGuard control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    /// Unique identifier.
    pub id: Uuid,
    /// Unique display name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Connection URL. May carry a password; use [`Backend::redacted`] before
    /// handing the entity to anything that displays or logs it.
    pub url: String,
    /// Whether servers on this backend may be started.
    pub enabled: bool,
    /// Creation/update bookkeeping.
    pub attribution: Attribution,
    /// Optimistic concurrency counter.
    pub version: i64,
}

impl Backend {
    /// The URL scheme's driver kind, if the stored URL is well formed.
    pub fn kind(&self) -> Option<BackendKind> {
        let scheme = self.url.split_once("://").map(|(s, _)| s)?;
        BackendKind::from_scheme(scheme)
    }

    /// Copy with the URL credential replaced by the redaction marker.
    pub fn redacted(&self) -> Self {
        Self {
            url: mask_backend_url(&self.url),
            ..self.clone()
        }
    }
}

/// Backend plus the flags the engine computes instead of storing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStatus {
    /// The backend, URL already masked.
    pub backend: Backend,
    /// The driver kind can operate on this host right now.
    pub supported: bool,
    /// The backend holds the registration for its physical target.
    pub registered: bool,
}

/// One row of the available-backends listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableBackend {
    /// Driver kind.
    pub kind: BackendKind,
    /// Compiled in and usable on this host.
    pub supported: bool,
    /// An enabled backend of this kind already exists.
    pub registered: bool,
}

/// Lifecycle state of a server's live interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Interface is down.
    Stopped,
    /// A start is in flight.
    Starting,
    /// Driver last confirmed the interface up.
    Running,
    /// A stop is in flight.
    Stopping,
    /// Driver reported an inconsistent or unreachable state.
    Degraded,
}

impl ServerState {
    /// Stable lowercase name, also used as the stored column value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Degraded => "degraded",
        }
    }

    /// Inverse of [`ServerState::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(Self::Stopped),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "degraded" => Some(Self::Degraded),
            _ => None,
        }
    }

    /// Starting or Stopping.
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle points a hook can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookTrigger {
    /// Entity was created.
    Create,
    /// Entity was updated.
    Update,
    /// Entity was deleted.
    Delete,
    /// Server is about to be brought up.
    PreStart,
    /// Server came up.
    Start,
    /// Server is about to be brought down.
    PreStop,
    /// Server went down.
    Stop,
}

impl HookTrigger {
    /// Value exported to hook processes as `WG_HOOK_ACTION`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::PreStart => "pre_start",
            Self::Start => "start",
            Self::PreStop => "pre_stop",
            Self::Stop => "stop",
        }
    }

    /// Triggers meaningful for peers.
    pub fn applies_to_peer(self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Delete)
    }
}

/// A shell command run at selected lifecycle points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    /// Command passed to `sh -c`. `%i` expands to the interface name.
    pub command: String,
    /// Points at which the command fires.
    pub triggers: BTreeSet<HookTrigger>,
}

impl Hook {
    /// Whether the hook fires on `trigger`.
    pub fn fires_on(&self, trigger: HookTrigger) -> bool {
        self.triggers.contains(&trigger)
    }
}

/// A managed WireGuard interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning backend.
    pub backend_id: Uuid,
    /// Interface name, immutable after creation.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Interface address in CIDR notation.
    pub address: String,
    /// Listen port; `None` lets the driver pick.
    pub listen_port: Option<u16>,
    /// DNS servers handed to wg-quick style backends.
    pub dns: Vec<String>,
    /// Interface MTU; `None` keeps the driver default.
    pub mtu: Option<u16>,
    /// fwmark applied to outgoing packets.
    pub firewall_mark: Option<u32>,
    /// Whether the server may be started.
    pub enabled: bool,
    /// Observed lifecycle state.
    pub state: ServerState,
    /// Base64 public key derived from the private key.
    pub public_key: String,
    /// Base64 private key. Never serialized outward.
    #[serde(skip_serializing, default)]
    pub private_key: String,
    /// Hooks in declaration order.
    pub hooks: Vec<Hook>,
    /// Creation/update bookkeeping.
    pub attribution: Attribution,
    /// Optimistic concurrency counter.
    pub version: i64,
}

impl Server {
    /// Whether the driver last confirmed the interface up.
    pub fn running(&self) -> bool {
        self.state == ServerState::Running
    }
}

/// A remote WireGuard endpoint allowed on a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning server.
    pub server_id: Uuid,
    /// Display name, unique within the server.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Base64 public key, unique within the server.
    pub public_key: String,
    /// Write-only preshared key.
    #[serde(skip_serializing, default)]
    pub preshared_key: Option<String>,
    /// `host:port` the server dials; `None` for dial-in peers.
    pub endpoint: Option<String>,
    /// Allowed IPs in CIDR notation, never empty.
    pub allowed_ips: Vec<String>,
    /// Keepalive interval in seconds, 0 disables.
    pub persistent_keepalive: u16,
    /// Hooks in declaration order.
    pub hooks: Vec<Hook>,
    /// Last observed counters, refreshed from the driver.
    pub stats: PeerStats,
    /// Creation/update bookkeeping.
    pub attribution: Attribution,
    /// Optimistic concurrency counter.
    pub version: i64,
}

impl Peer {
    /// Whether a preshared key is configured, without exposing it.
    pub fn has_preshared_key(&self) -> bool {
        self.preshared_key.is_some()
    }
}

/// An operator account. Mutations are attributed to users by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier.
    pub id: Uuid,
    /// Unique login email.
    pub email: String,
    /// Argon2 PHC string.
    #[serde(skip)]
    pub password_hash: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}
