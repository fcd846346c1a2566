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

//! Declared and observed interface state exchanged with drivers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Everything a driver needs to bring an interface up.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Interface name.
    pub name: String,
    /// Base64 private key.
    pub private_key: String,
    /// Interface address in CIDR notation.
    pub address: String,
    /// Listen port; `None` lets the kernel pick.
    pub listen_port: Option<u16>,
    /// MTU override.
    pub mtu: Option<u16>,
    /// fwmark for outgoing packets.
    pub firewall_mark: Option<u32>,
    /// DNS servers, honoured by wg-quick style drivers only.
    pub dns: Vec<String>,
}

impl fmt::Debug for InterfaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceConfig")
            .field("name", &self.name)
            .field("private_key", &"<redacted>")
            .field("address", &self.address)
            .field("listen_port", &self.listen_port)
            .field("mtu", &self.mtu)
            .field("firewall_mark", &self.firewall_mark)
            .field("dns", &self.dns)
            .finish()
    }
}

/// Desired state of one peer on a live interface.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Base64 public key, the identity used for diffing.
    pub public_key: String,
    /// Base64 preshared key.
    pub preshared_key: Option<String>,
    /// `host:port` to dial.
    pub endpoint: Option<String>,
    /// Allowed IPs in CIDR notation.
    pub allowed_ips: Vec<String>,
    /// Keepalive seconds, 0 disables.
    pub persistent_keepalive: u16,
}

impl fmt::Debug for PeerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConfig")
            .field("public_key", &self.public_key)
            .field("preshared_key", &self.preshared_key.as_ref().map(|_| "<redacted>"))
            .field("endpoint", &self.endpoint)
            .field("allowed_ips", &self.allowed_ips)
            .field("persistent_keepalive", &self.persistent_keepalive)
            .finish()
    }
}

/// Counters and handshake data for one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerStats {
    /// Endpoint the peer was last seen at.
    pub endpoint: Option<String>,
    /// Most recent completed handshake.
    pub last_handshake: Option<DateTime<Utc>>,
    /// Bytes received from the peer.
    pub rx_bytes: u64,
    /// Bytes sent to the peer.
    pub tx_bytes: u64,
    /// WireGuard protocol version, when the control plane reports it.
    pub protocol_version: Option<u32>,
}

/// A peer as the control plane currently has it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedPeer {
    /// Base64 public key.
    pub public_key: String,
    /// Base64 preshared key, if the control plane reports one.
    #[serde(skip_serializing, default)]
    pub preshared_key: Option<String>,
    /// Configured endpoint.
    pub endpoint: Option<String>,
    /// Allowed IPs in CIDR notation.
    pub allowed_ips: Vec<String>,
    /// Keepalive seconds, 0 when off.
    pub persistent_keepalive: u16,
    /// Counters.
    pub stats: PeerStats,
}

impl fmt::Debug for ObservedPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservedPeer")
            .field("public_key", &self.public_key)
            .field("endpoint", &self.endpoint)
            .field("allowed_ips", &self.allowed_ips)
            .field("persistent_keepalive", &self.persistent_keepalive)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Interface state reported back after `up`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedInterface {
    /// Interface name.
    pub name: String,
    /// Link is up.
    pub up: bool,
    /// Public key the interface runs with.
    pub public_key: Option<String>,
    /// Actual listen port, useful when the driver picked one.
    pub listen_port: Option<u16>,
}

/// Interface-level counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceStats {
    /// Interface name.
    pub name: String,
    /// Link is up.
    pub up: bool,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Bytes sent.
    pub tx_bytes: u64,
}

/// Stats snapshot for a whole interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    /// Interface counters.
    pub interface: InterfaceStats,
    /// Per-peer counters keyed by public key.
    pub peers: Vec<(String, PeerStats)>,
}

/// A peer found on an unmanaged interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignPeer {
    /// Name recovered from config comments, if any.
    pub name: Option<String>,
    /// Peer settings.
    pub config: PeerConfig,
}

/// A WireGuard interface present on a backend but not managed yet.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignServer {
    /// Interface name.
    pub name: String,
    /// Base64 private key, when readable.
    #[serde(skip_serializing, default)]
    pub private_key: Option<String>,
    /// Base64 public key.
    pub public_key: Option<String>,
    /// First interface address in CIDR notation.
    pub address: Option<String>,
    /// Listen port.
    pub listen_port: Option<u16>,
    /// MTU.
    pub mtu: Option<u16>,
    /// fwmark.
    pub firewall_mark: Option<u32>,
    /// DNS servers.
    pub dns: Vec<String>,
    /// Link is up.
    pub up: bool,
    /// Peers configured on the interface.
    pub peers: Vec<ForeignPeer>,
}

impl fmt::Debug for ForeignServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignServer")
            .field("name", &self.name)
            .field("public_key", &self.public_key)
            .field("address", &self.address)
            .field("listen_port", &self.listen_port)
            .field("up", &self.up)
            .field("peers", &self.peers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_keys() {
        let cfg = InterfaceConfig {
            name: "wg0".into(),
            private_key: "cHJpdmF0ZQ==".into(),
            address: "10.0.0.1/24".into(),
            listen_port: None,
            mtu: None,
            firewall_mark: None,
            dns: vec![],
        };
        assert!(!format!("{cfg:?}").contains("cHJpdmF0ZQ=="));

        let peer = PeerConfig {
            public_key: "pub".into(),
            preshared_key: Some("c2VjcmV0".into()),
            endpoint: None,
            allowed_ips: vec!["10.0.0.2/32".into()],
            persistent_keepalive: 0,
        };
        assert!(!format!("{peer:?}").contains("c2VjcmV0"));
    }
}
