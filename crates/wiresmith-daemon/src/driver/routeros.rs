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

//! MikroTik RouterOS v7 REST API backend.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use wiresmith_types::interface::{
    DeviceStats, ForeignPeer, ForeignServer, InterfaceConfig, InterfaceStats, ObservedInterface,
    ObservedPeer, PeerConfig, PeerStats,
};
use wiresmith_types::{BackendKind, BackendUrl};

use super::wg::split_list;
use super::{Capabilities, Driver, DriverError, PeerPlan, plan_peer_sync};

const WIREGUARD: &str = "interface/wireguard";
const PEERS: &str = "interface/wireguard/peers";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RosInterface {
    #[serde(rename = ".id")]
    id: String,
    name: String,
    #[serde(default)]
    listen_port: Option<String>,
    #[serde(default)]
    mtu: Option<String>,
    #[serde(default)]
    private_key: Option<String>,
    #[serde(default)]
    public_key: Option<String>,
    #[serde(default)]
    running: Option<String>,
    #[serde(default)]
    disabled: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RosPeer {
    #[serde(rename = ".id")]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    comment: Option<String>,
    public_key: String,
    #[serde(default)]
    preshared_key: Option<String>,
    #[serde(default)]
    endpoint_address: Option<String>,
    #[serde(default)]
    endpoint_port: Option<String>,
    #[serde(default)]
    current_endpoint_address: Option<String>,
    #[serde(default)]
    current_endpoint_port: Option<String>,
    #[serde(default)]
    allowed_address: Option<String>,
    #[serde(default)]
    persistent_keepalive: Option<String>,
    #[serde(default)]
    rx: Option<String>,
    #[serde(default)]
    tx: Option<String>,
    #[serde(default)]
    last_handshake: Option<String>,
    #[serde(default)]
    dynamic: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RosAddress {
    #[serde(rename = ".id")]
    id: String,
    address: String,
    #[serde(default)]
    dynamic: Option<String>,
}

fn flag(value: &Option<String>) -> bool {
    value.as_deref() == Some("true")
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|v| !v.is_empty()).map(str::to_string)
}

/// Parse RouterOS durations: `1w2d3h4m5s`, `250ms` or `hh:mm:ss`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if value.contains(':') {
        let mut secs = 0u64;
        for part in value.split(':') {
            secs = secs * 60 + part.parse::<u64>().ok()?;
        }
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: u64 = digits.parse().ok()?;
        digits.clear();
        total += match c {
            'w' => Duration::from_secs(n * 7 * 86_400),
            'd' => Duration::from_secs(n * 86_400),
            'h' => Duration::from_secs(n * 3_600),
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Duration::from_millis(n)
            }
            'm' => Duration::from_secs(n * 60),
            's' => Duration::from_secs(n),
            _ => return None,
        };
    }
    if !digits.is_empty() {
        total += Duration::from_secs(digits.parse().ok()?);
    }
    Some(total)
}

/// Static addresses to delete and wanted addresses to add. Router-assigned
/// dynamic entries (IPv6 link-local) are never touched.
fn plan_addresses<'a>(
    have: &'a [RosAddress],
    want: &BTreeSet<&'a str>,
) -> (Vec<&'a RosAddress>, Vec<&'a str>) {
    let stale = have
        .iter()
        .filter(|a| !flag(&a.dynamic) && !want.contains(a.address.as_str()))
        .collect();
    let missing = want
        .iter()
        .filter(|w| !have.iter().any(|h| h.address == **w))
        .copied()
        .collect();
    (stale, missing)
}

/// Plan against static peers only. A desired key that the router already
/// holds as a dynamic peer is left alone rather than added twice.
fn plan_router_peers(live: &[RosPeer], desired: &[PeerConfig]) -> PeerPlan {
    let (dynamic, fixed): (Vec<&RosPeer>, Vec<&RosPeer>) =
        live.iter().partition(|p| flag(&p.dynamic));
    let observed: Vec<ObservedPeer> = fixed.iter().map(|p| p.observed()).collect();
    let mut plan = plan_peer_sync(&observed, desired);
    plan.add
        .retain(|peer| !dynamic.iter().any(|d| d.public_key == peer.public_key));
    plan
}

/// Split `host:port` (IPv6 hosts in brackets) into address and port.
fn split_endpoint(endpoint: &str) -> Result<(String, String), DriverError> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| DriverError::Parse(format!("endpoint {endpoint:?}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port.to_string()))
}

fn join_endpoint(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

impl RosPeer {
    fn observed(&self) -> ObservedPeer {
        let endpoint = match (non_empty(&self.endpoint_address), non_empty(&self.endpoint_port)) {
            (Some(host), Some(port)) => Some(join_endpoint(&host, &port)),
            _ => None,
        };
        let current = match (
            non_empty(&self.current_endpoint_address),
            non_empty(&self.current_endpoint_port),
        ) {
            (Some(host), Some(port)) => Some(join_endpoint(&host, &port)),
            _ => None,
        };
        let last_handshake = self
            .last_handshake
            .as_deref()
            .and_then(parse_duration)
            .and_then(|ago| chrono::Duration::from_std(ago).ok())
            .map(|ago| Utc::now() - ago);

        ObservedPeer {
            public_key: self.public_key.clone(),
            preshared_key: non_empty(&self.preshared_key),
            endpoint,
            allowed_ips: self
                .allowed_address
                .as_deref()
                .map(split_list)
                .unwrap_or_default(),
            persistent_keepalive: self
                .persistent_keepalive
                .as_deref()
                .and_then(parse_duration)
                .map(|d| u16::try_from(d.as_secs()).unwrap_or(u16::MAX))
                .unwrap_or(0),
            stats: PeerStats {
                endpoint: current,
                last_handshake,
                rx_bytes: self.rx.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0),
                tx_bytes: self.tx.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0),
                protocol_version: None,
            },
        }
    }

    fn display_name(&self) -> Option<String> {
        non_empty(&self.name).or_else(|| non_empty(&self.comment))
    }
}

fn peer_body(interface: &str, peer: &PeerConfig) -> Result<Value, DriverError> {
    let mut body = Map::new();
    body.insert("interface".into(), json!(interface));
    body.insert("public-key".into(), json!(peer.public_key));
    body.insert("allowed-address".into(), json!(peer.allowed_ips.join(",")));
    body.insert(
        "persistent-keepalive".into(),
        json!(format!("{}s", peer.persistent_keepalive)),
    );
    body.insert(
        "preshared-key".into(),
        json!(peer.preshared_key.clone().unwrap_or_default()),
    );
    match peer.endpoint.as_deref() {
        Some(endpoint) => {
            let (host, port) = split_endpoint(endpoint)?;
            body.insert("endpoint-address".into(), json!(host));
            body.insert("endpoint-port".into(), json!(port));
        }
        None => {
            body.insert("endpoint-address".into(), json!(""));
            body.insert("endpoint-port".into(), json!("0"));
        }
    }
    Ok(Value::Object(body))
}

pub struct RouterOsDriver {
    client: Client,
    base: String,
    user: String,
    password: String,
}

impl RouterOsDriver {
    pub fn new(url: &BackendUrl, timeout: Duration) -> Result<Self, DriverError> {
        let host = url.host.as_deref().ok_or_else(|| {
            DriverError::Url(wiresmith_types::UrlError::MissingHost {
                scheme: url.kind.scheme(),
            })
        })?;
        let client = Client::builder()
            .danger_accept_invalid_certs(url.insecure_skip_verify)
            .timeout(timeout)
            .build()?;
        let path = url.path.as_deref().unwrap_or("/rest").trim_end_matches('/');

        Ok(Self {
            client,
            base: format!("https://{host}:{}{path}", url.port.unwrap_or(443)),
            user: url.user.clone().unwrap_or_else(|| "admin".to_string()),
            password: url
                .password
                .as_ref()
                .map(|p| p.expose().to_string())
                .unwrap_or_default(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, DriverError> {
        let url = format!("{}/{path}", self.base);
        debug!(%method, path, "routeros request");

        let mut req = self
            .client
            .request(method, &url)
            .basic_auth(&self.user, Some(&self.password));
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            warn!(status, path, "routeros returned an error");
            return Err(DriverError::Api { status, body });
        }
        let text = resp.text().await?;
        let text = if text.trim().is_empty() { "null" } else { &text };
        serde_json::from_str(text).map_err(|e| DriverError::Parse(format!("{path}: {e}")))
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<(), DriverError> {
        self.call::<Value>(method, path, body).await.map(|_| ())
    }

    async fn interfaces(&self) -> Result<Vec<RosInterface>, DriverError> {
        self.call(Method::GET, WIREGUARD, None).await
    }

    async fn interface(&self, name: &str) -> Result<Option<RosInterface>, DriverError> {
        Ok(self.interfaces().await?.into_iter().find(|i| i.name == name))
    }

    async fn require_interface(&self, name: &str) -> Result<RosInterface, DriverError> {
        self.interface(name)
            .await?
            .ok_or_else(|| DriverError::InterfaceNotFound(name.to_string()))
    }

    async fn all_peers(&self, name: &str) -> Result<Vec<RosPeer>, DriverError> {
        self.call(Method::GET, &format!("{PEERS}?interface={}", urlencoding::encode(name)), None)
            .await
    }

    async fn peers(&self, name: &str) -> Result<Vec<RosPeer>, DriverError> {
        let all = self.all_peers(name).await?;
        Ok(all.into_iter().filter(|p| !flag(&p.dynamic)).collect())
    }

    async fn addresses(&self, family: &str, name: &str) -> Result<Vec<RosAddress>, DriverError> {
        self.call(
            Method::GET,
            &format!("{family}/address?interface={}", urlencoding::encode(name)),
            None,
        )
        .await
    }

    /// Make the addresses on `name` exactly `wanted`.
    async fn sync_addresses(&self, name: &str, wanted: &[String]) -> Result<(), DriverError> {
        for family in ["ip", "ipv6"] {
            let is_v6 = family == "ipv6";
            let want: BTreeSet<&str> = wanted
                .iter()
                .map(String::as_str)
                .filter(|a| a.contains(':') == is_v6)
                .collect();
            let have = self.addresses(family, name).await?;
            let (stale, missing) = plan_addresses(&have, &want);

            for addr in stale {
                self.send(Method::DELETE, &format!("{family}/address/{}", addr.id), None)
                    .await?;
            }
            for addr in missing {
                let body = json!({ "address": addr, "interface": name });
                self.send(Method::PUT, &format!("{family}/address"), Some(&body))
                    .await?;
                debug!(interface = name, address = addr, "added address");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for RouterOsDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::RouterOs
    }

    async fn capabilities(&self) -> Capabilities {
        Capabilities { supported: true }
    }

    async fn probe(&self) -> Result<(), DriverError> {
        let resource: Value = self.call(Method::GET, "system/resource", None).await?;
        debug!(
            version = resource.get("version").and_then(serde_json::Value::as_str).unwrap_or("?"),
            "routeros reachable"
        );
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(interface = %config.name))]
    async fn up(&self, config: &InterfaceConfig) -> Result<ObservedInterface, DriverError> {
        let mut body = Map::new();
        body.insert("private-key".into(), json!(config.private_key));
        body.insert("disabled".into(), json!("false"));
        if let Some(port) = config.listen_port {
            body.insert("listen-port".into(), json!(port.to_string()));
        }
        if let Some(mtu) = config.mtu {
            body.insert("mtu".into(), json!(mtu.to_string()));
        }

        match self.interface(&config.name).await? {
            Some(existing) => {
                let matches = existing.private_key.as_deref() == Some(config.private_key.as_str())
                    && !flag(&existing.disabled)
                    && config
                        .listen_port
                        .is_none_or(|p| existing.listen_port.as_deref() == Some(p.to_string().as_str()))
                    && config
                        .mtu
                        .is_none_or(|m| existing.mtu.as_deref() == Some(m.to_string().as_str()));
                if !matches {
                    self.send(
                        Method::PATCH,
                        &format!("{WIREGUARD}/{}", existing.id),
                        Some(&Value::Object(body)),
                    )
                    .await?;
                    info!("updated routeros interface");
                }
            }
            None => {
                body.insert("name".into(), json!(config.name));
                self.send(Method::PUT, WIREGUARD, Some(&Value::Object(body)))
                    .await?;
                info!("created routeros interface");
            }
        }

        self.sync_addresses(&config.name, &split_list(&config.address))
            .await?;

        let iface = self.require_interface(&config.name).await?;
        Ok(ObservedInterface {
            name: iface.name,
            up: !flag(&iface.disabled),
            public_key: non_empty(&iface.public_key),
            listen_port: iface.listen_port.as_deref().and_then(|p| p.parse().ok()),
        })
    }

    /// Disables the interface; configuration and peers stay on the router.
    async fn down(&self, name: &str) -> Result<(), DriverError> {
        let Some(iface) = self.interface(name).await? else {
            return Ok(());
        };
        if flag(&iface.disabled) {
            return Ok(());
        }
        self.send(
            Method::PATCH,
            &format!("{WIREGUARD}/{}", iface.id),
            Some(&json!({ "disabled": "true" })),
        )
        .await?;
        info!(interface = name, "disabled routeros interface");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(interface = name, desired = desired.len()))]
    async fn sync_peers(
        &self,
        name: &str,
        desired: &[PeerConfig],
    ) -> Result<Vec<ObservedPeer>, DriverError> {
        self.require_interface(name).await?;
        let live = self.all_peers(name).await?;
        let plan = plan_router_peers(&live, desired);
        if plan.is_empty() {
            return Ok(live
                .iter()
                .filter(|p| !flag(&p.dynamic))
                .map(RosPeer::observed)
                .collect());
        }

        let id_of = |key: &str| {
            live.iter()
                .find(|p| p.public_key == key && !flag(&p.dynamic))
                .map(|p| p.id.clone())
        };
        for key in &plan.remove {
            if let Some(id) = id_of(key) {
                self.send(Method::DELETE, &format!("{PEERS}/{id}"), None).await?;
            }
        }
        for peer in &plan.update {
            if let Some(id) = id_of(&peer.public_key) {
                let body = peer_body(name, peer)?;
                self.send(Method::PATCH, &format!("{PEERS}/{id}"), Some(&body))
                    .await?;
            }
        }
        for peer in &plan.add {
            let body = peer_body(name, peer)?;
            self.send(Method::PUT, PEERS, Some(&body)).await?;
        }
        debug!(
            added = plan.add.len(),
            updated = plan.update.len(),
            removed = plan.remove.len(),
            "applied peer changes"
        );

        Ok(self.peers(name).await?.iter().map(RosPeer::observed).collect())
    }

    async fn read_stats(&self, name: &str) -> Result<DeviceStats, DriverError> {
        let iface = self.require_interface(name).await?;
        let peers: Vec<(String, PeerStats)> = self
            .peers(name)
            .await?
            .iter()
            .map(|p| {
                let observed = p.observed();
                (observed.public_key, observed.stats)
            })
            .collect();
        Ok(DeviceStats {
            interface: InterfaceStats {
                name: name.to_string(),
                up: flag(&iface.running) && !flag(&iface.disabled),
                rx_bytes: peers.iter().map(|(_, s)| s.rx_bytes).sum(),
                tx_bytes: peers.iter().map(|(_, s)| s.tx_bytes).sum(),
            },
            peers,
        })
    }

    async fn discover(&self, known: &[String]) -> Result<Vec<ForeignServer>, DriverError> {
        let mut found = Vec::new();
        for iface in self.interfaces().await? {
            if known.contains(&iface.name) {
                continue;
            }
            let mut addresses: Vec<String> = Vec::new();
            for family in ["ip", "ipv6"] {
                addresses.extend(
                    self.addresses(family, &iface.name)
                        .await?
                        .into_iter()
                        .filter(|a| !flag(&a.dynamic))
                        .map(|a| a.address),
                );
            }
            let peers = self
                .peers(&iface.name)
                .await?
                .iter()
                .map(|p| {
                    let observed = p.observed();
                    ForeignPeer {
                        name: p.display_name(),
                        config: PeerConfig {
                            public_key: observed.public_key,
                            preshared_key: observed.preshared_key,
                            endpoint: observed.endpoint,
                            allowed_ips: observed.allowed_ips,
                            persistent_keepalive: observed.persistent_keepalive,
                        },
                    }
                })
                .collect();

            found.push(ForeignServer {
                name: iface.name.clone(),
                private_key: non_empty(&iface.private_key),
                public_key: non_empty(&iface.public_key),
                address: (!addresses.is_empty()).then(|| addresses.join(",")),
                listen_port: iface.listen_port.as_deref().and_then(|p| p.parse().ok()),
                mtu: iface.mtu.as_deref().and_then(|m| m.parse().ok()),
                firewall_mark: None,
                dns: Vec::new(),
                up: flag(&iface.running) && !flag(&iface.disabled),
                peers,
            });
        }
        Ok(found)
    }
}
