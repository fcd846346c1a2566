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

//! Backend drivers: one implementation of [`Driver`] per control plane.

pub mod command;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod networkmanager;
pub mod routeros;
pub mod wg;
pub mod wgquick;

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::Serialize;
use thiserror::Error;
use wiresmith_types::interface::{
    DeviceStats, ForeignServer, InterfaceConfig, ObservedInterface, ObservedPeer, PeerConfig,
};
use wiresmith_types::{BackendKind, UrlError};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("backend unreachable: {0}")]
    Unavailable(String),

    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("not supported on this platform")]
    Unsupported,

    #[error("interface {0} not found")]
    InterfaceNotFound(String),

    #[error("`{program}` exited with status {code:?}: {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unexpected output: {0}")]
    Parse(String),

    #[error("wireguard interface error: {0}")]
    Interface(String),

    #[error("failed to decode base64 key: {0}")]
    KeyDecode(#[from] base64::DecodeError),

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("IP address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("CIDR parse error: {0}")]
    CidrParse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error(transparent)]
    Url(#[from] UrlError),
}

impl DriverError {
    /// Transport-level trouble: the target could not be reached or refused
    /// our credentials. Such failures leave live state unknown.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) => true,
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            Self::Api { status, .. } => matches!(status, 401 | 403),
            _ => false,
        }
    }

    /// The live interface disagrees with what the store believes.
    pub fn is_drift(&self) -> bool {
        self.is_unavailable() || matches!(self, Self::InterfaceNotFound(_))
    }
}

/// Whether a driver can operate in the current environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub supported: bool,
}

/// Operations every backend supports. Calls may block on network I/O; the
/// caller bounds them with a timeout.
#[async_trait]
pub trait Driver: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn capabilities(&self) -> Capabilities;

    /// Cheap reachability check used when registering a backend.
    async fn probe(&self) -> Result<(), DriverError>;

    /// Create or reconfigure `config.name` and bring it up. Peers are left
    /// as they are. Calling twice with the same config changes nothing.
    async fn up(&self, config: &InterfaceConfig) -> Result<ObservedInterface, DriverError>;

    /// Tear the interface down. A missing interface is not an error.
    async fn down(&self, name: &str) -> Result<(), DriverError>;

    /// Make the live peer set equal `desired`, keyed by public key.
    async fn sync_peers(
        &self,
        name: &str,
        desired: &[PeerConfig],
    ) -> Result<Vec<ObservedPeer>, DriverError>;

    async fn read_stats(&self, name: &str) -> Result<DeviceStats, DriverError>;

    /// Interfaces on the target whose names are not in `known`.
    async fn discover(&self, known: &[String]) -> Result<Vec<ForeignServer>, DriverError>;

    /// Release connections held by the driver.
    async fn close(&self) {}
}

// -- Helper utilities --

pub fn decode_key(b64: &str) -> Result<[u8; 32], DriverError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD.decode(b64.trim())?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| DriverError::InvalidKeyLength(len))
}

pub fn encode_key(key: &[u8; 32]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(key)
}

pub fn parse_cidr(s: &str) -> Result<(IpAddr, u8), DriverError> {
    let (addr_str, prefix_str) = s
        .trim()
        .split_once('/')
        .ok_or_else(|| DriverError::CidrParse(s.to_string()))?;
    let addr: IpAddr = addr_str.parse()?;
    let prefix: u8 = prefix_str
        .parse()
        .map_err(|_| DriverError::CidrParse(s.to_string()))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(DriverError::CidrParse(s.to_string()));
    }
    Ok((addr, prefix))
}

/// Parse an interface address, defaulting to a host prefix when none is given.
pub fn parse_address(s: &str) -> Result<(IpAddr, u8), DriverError> {
    if s.contains('/') {
        parse_cidr(s)
    } else {
        let addr: IpAddr = s.trim().parse()?;
        Ok((addr, if addr.is_ipv4() { 32 } else { 128 }))
    }
}

/// Canonical form of an allowed-IP entry: network address plus prefix.
fn normalize_network(s: &str) -> String {
    match s.trim().parse::<IpNetwork>() {
        Ok(net) => match IpNetwork::new(net.network(), net.prefix()) {
            Ok(canon) => canon.to_string(),
            Err(_) => s.trim().to_string(),
        },
        Err(_) => s.trim().to_string(),
    }
}

fn network_set(ips: &[String]) -> BTreeSet<String> {
    ips.iter().map(|s| normalize_network(s)).collect()
}

/// A declared endpoint matches what the interface reports. Hostnames are
/// resolved by the backend, so only their port can be compared.
fn endpoint_matches(desired: Option<&str>, observed: Option<&str>) -> bool {
    let Some(desired) = desired else {
        return true;
    };
    let Some(observed) = observed else {
        return false;
    };
    match (desired.parse::<SocketAddr>(), observed.parse::<SocketAddr>()) {
        (Ok(d), Ok(o)) => d == o,
        _ => match (desired.rsplit_once(':'), observed.rsplit_once(':')) {
            (Some((_, dp)), Some((_, op))) => dp == op,
            _ => desired == observed,
        },
    }
}

/// Whether an observed peer already carries the desired configuration.
pub fn peer_matches(desired: &PeerConfig, observed: &ObservedPeer) -> bool {
    desired.preshared_key == observed.preshared_key
        && desired.persistent_keepalive == observed.persistent_keepalive
        && network_set(&desired.allowed_ips) == network_set(&observed.allowed_ips)
        && endpoint_matches(desired.endpoint.as_deref(), observed.endpoint.as_deref())
}

/// Mutations needed to turn the live peer set into the desired one.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PeerPlan {
    pub add: Vec<PeerConfig>,
    pub update: Vec<PeerConfig>,
    pub remove: Vec<String>,
}

impl PeerPlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.update.is_empty() && self.remove.is_empty()
    }
}

pub fn plan_peer_sync(current: &[ObservedPeer], desired: &[PeerConfig]) -> PeerPlan {
    let live: HashMap<&str, &ObservedPeer> = current
        .iter()
        .map(|p| (p.public_key.as_str(), p))
        .collect();
    let wanted: BTreeSet<&str> = desired.iter().map(|p| p.public_key.as_str()).collect();

    let mut plan = PeerPlan::default();
    for peer in desired {
        match live.get(peer.public_key.as_str()) {
            None => plan.add.push(peer.clone()),
            Some(observed) if !peer_matches(peer, observed) => plan.update.push(peer.clone()),
            Some(_) => {}
        }
    }
    plan.remove = current
        .iter()
        .filter(|p| !wanted.contains(p.public_key.as_str()))
        .map(|p| p.public_key.clone())
        .collect();
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use wiresmith_types::interface::PeerStats;

    fn desired(key: &str, ips: &[&str], endpoint: Option<&str>) -> PeerConfig {
        PeerConfig {
            public_key: key.into(),
            preshared_key: None,
            endpoint: endpoint.map(str::to_string),
            allowed_ips: ips.iter().map(|s| s.to_string()).collect(),
            persistent_keepalive: 25,
        }
    }

    fn observed(cfg: &PeerConfig) -> ObservedPeer {
        ObservedPeer {
            public_key: cfg.public_key.clone(),
            preshared_key: cfg.preshared_key.clone(),
            endpoint: cfg.endpoint.clone(),
            allowed_ips: cfg.allowed_ips.clone(),
            persistent_keepalive: cfg.persistent_keepalive,
            stats: PeerStats::default(),
        }
    }

    #[test]
    fn unchanged_set_needs_no_mutations() {
        let want = vec![
            desired("a", &["10.0.0.2/32"], None),
            desired("b", &["10.0.0.3/32", "fd00::3/128"], Some("198.51.100.7:51820")),
        ];
        let live: Vec<_> = want.iter().map(observed).collect();
        assert!(plan_peer_sync(&live, &want).is_empty());
    }

    #[test]
    fn adds_updates_and_removes() {
        let keep = desired("keep", &["10.0.0.2/32"], None);
        let mut changed = desired("changed", &["10.0.0.3/32"], None);
        let live = vec![observed(&keep), observed(&changed), observed(&desired("gone", &["10.0.0.9/32"], None))];
        changed.persistent_keepalive = 0;
        let fresh = desired("new", &["10.0.0.4/32"], None);

        let plan = plan_peer_sync(&live, &[keep, changed.clone(), fresh.clone()]);
        assert_eq!(plan.add, vec![fresh]);
        assert_eq!(plan.update, vec![changed]);
        assert_eq!(plan.remove, vec!["gone".to_string()]);
    }

    #[test]
    fn allowed_ips_compare_as_networks() {
        let want = desired("a", &["10.0.0.0/24", "10.1.0.5/32"], None);
        let mut live = observed(&want);
        live.allowed_ips = vec!["10.1.0.5/32".into(), "10.0.0.7/24".into()];
        assert!(peer_matches(&want, &live));
    }

    #[test]
    fn roaming_endpoint_ignored_for_dial_in_peers() {
        let want = desired("a", &["10.0.0.2/32"], None);
        let mut live = observed(&want);
        live.endpoint = Some("203.0.113.9:40000".into());
        assert!(peer_matches(&want, &live));
    }

    #[test_case(Some("vpn.example.com:51820"), Some("192.0.2.1:51820"), true; "hostname same port")]
    #[test_case(Some("vpn.example.com:51820"), Some("192.0.2.1:51821"), false; "hostname other port")]
    #[test_case(Some("192.0.2.1:51820"), Some("192.0.2.2:51820"), false; "different address")]
    #[test_case(Some("[2001:db8::1]:51820"), Some("[2001:db8::1]:51820"), true; "ipv6")]
    #[test_case(Some("192.0.2.1:51820"), None, false; "not yet set")]
    fn endpoints(desired: Option<&str>, observed: Option<&str>, expected: bool) {
        assert_eq!(endpoint_matches(desired, observed), expected);
    }

    #[test_case("10.0.0.1/24", true; "v4")]
    #[test_case("fd00::1/64", true; "v6")]
    #[test_case("10.0.0.1/33", false; "prefix too long")]
    #[test_case("10.0.0.1", false; "missing prefix")]
    #[test_case("nonsense/8", false; "bad address")]
    fn cidrs(input: &str, ok: bool) {
        assert_eq!(parse_cidr(input).is_ok(), ok);
    }

    #[test]
    fn bare_address_gets_host_prefix() {
        assert_eq!(parse_address("10.0.0.1").unwrap().1, 32);
        assert_eq!(parse_address("fd00::1").unwrap().1, 128);
    }

    #[test]
    fn key_decoding() {
        let key = [3u8; 32];
        assert_eq!(decode_key(&encode_key(&key)).unwrap(), key);
        assert!(matches!(decode_key("YWJj"), Err(DriverError::InvalidKeyLength(3))));
    }
}
