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

//! The `wg` command line tool and the wg-quick configuration format.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use wiresmith_types::interface::{
    DeviceStats, InterfaceConfig, InterfaceStats, ObservedPeer, PeerConfig, PeerStats,
};

use super::command::CommandRunner;
use super::{DriverError, PeerPlan};

const NONE: &str = "(none)";

/// One interface as reported by `wg show all dump`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpInterface {
    pub name: String,
    pub private_key: Option<String>,
    pub public_key: Option<String>,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    pub peers: Vec<ObservedPeer>,
}

impl DumpInterface {
    pub fn stats(&self) -> DeviceStats {
        let peers: Vec<(String, PeerStats)> = self
            .peers
            .iter()
            .map(|p| (p.public_key.clone(), p.stats.clone()))
            .collect();
        DeviceStats {
            interface: InterfaceStats {
                name: self.name.clone(),
                up: true,
                rx_bytes: peers.iter().map(|(_, s)| s.rx_bytes).sum(),
                tx_bytes: peers.iter().map(|(_, s)| s.tx_bytes).sum(),
            },
            peers,
        }
    }
}

fn optional(field: &str) -> Option<String> {
    (field != NONE && !field.is_empty()).then(|| field.to_string())
}

fn number<T: std::str::FromStr>(field: &str, what: &str) -> Result<T, DriverError> {
    field
        .parse()
        .map_err(|_| DriverError::Parse(format!("{what}: {field:?}")))
}

pub(super) fn fwmark(field: &str) -> Result<Option<u32>, DriverError> {
    if field == "off" || field == "0" {
        return Ok(None);
    }
    let parsed = match field.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => field.parse().ok(),
    };
    parsed
        .map(Some)
        .ok_or_else(|| DriverError::Parse(format!("fwmark: {field:?}")))
}

/// Parse `wg show all dump`: tab separated, interface lines have five
/// columns and peer lines nine.
pub fn parse_dump(output: &str) -> Result<Vec<DumpInterface>, DriverError> {
    let mut interfaces: Vec<DumpInterface> = Vec::new();

    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let cols: Vec<&str> = line.split('\t').collect();
        match cols.len() {
            5 => interfaces.push(DumpInterface {
                name: cols[0].to_string(),
                private_key: optional(cols[1]),
                public_key: optional(cols[2]),
                listen_port: match number::<u16>(cols[3], "listen port")? {
                    0 => None,
                    port => Some(port),
                },
                fwmark: fwmark(cols[4])?,
                peers: Vec::new(),
            }),
            9 => {
                let iface = interfaces
                    .iter_mut()
                    .rev()
                    .find(|i| i.name == cols[0])
                    .ok_or_else(|| DriverError::Parse(format!("peer before interface: {line}")))?;
                let handshake: i64 = number(cols[5], "latest handshake")?;
                iface.peers.push(ObservedPeer {
                    public_key: cols[1].to_string(),
                    preshared_key: optional(cols[2]),
                    endpoint: optional(cols[3]),
                    allowed_ips: optional(cols[4])
                        .map(|ips| ips.split(',').map(|s| s.trim().to_string()).collect())
                        .unwrap_or_default(),
                    persistent_keepalive: match cols[8] {
                        "off" => 0,
                        v => number(v, "persistent keepalive")?,
                    },
                    stats: PeerStats {
                        endpoint: optional(cols[3]),
                        last_handshake: (handshake > 0)
                            .then(|| DateTime::<Utc>::from_timestamp(handshake, 0))
                            .flatten(),
                        rx_bytes: number(cols[6], "rx bytes")?,
                        tx_bytes: number(cols[7], "tx bytes")?,
                        protocol_version: None,
                    },
                });
            }
            n => return Err(DriverError::Parse(format!("{n} columns in dump line"))),
        }
    }

    Ok(interfaces)
}

/// Thin wrapper over `wg` run through a [`CommandRunner`].
#[derive(Clone)]
pub struct WgCli {
    runner: Arc<dyn CommandRunner>,
}

impl WgCli {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub async fn version(&self) -> Result<String, DriverError> {
        self.runner
            .run("wg", &["--version"], None)
            .await
            .map(|s| s.trim().to_string())
    }

    pub async fn interfaces(&self) -> Result<Vec<String>, DriverError> {
        let out = self.runner.run("wg", &["show", "interfaces"], None).await?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }

    pub async fn dump(&self) -> Result<Vec<DumpInterface>, DriverError> {
        let out = self.runner.run("wg", &["show", "all", "dump"], None).await?;
        parse_dump(&out)
    }

    pub async fn device(&self, name: &str) -> Result<Option<DumpInterface>, DriverError> {
        Ok(self.dump().await?.into_iter().find(|d| d.name == name))
    }

    async fn set_peer(&self, iface: &str, peer: &PeerConfig) -> Result<(), DriverError> {
        let keepalive = peer.persistent_keepalive.to_string();
        let allowed = peer.allowed_ips.join(",");
        let mut args = vec![
            "set",
            iface,
            "peer",
            peer.public_key.as_str(),
            "preshared-key",
            if peer.preshared_key.is_some() {
                "/dev/stdin"
            } else {
                "/dev/null"
            },
            "persistent-keepalive",
            if peer.persistent_keepalive == 0 {
                "off"
            } else {
                keepalive.as_str()
            },
            "allowed-ips",
            allowed.as_str(),
        ];
        if let Some(endpoint) = peer.endpoint.as_deref() {
            args.extend(["endpoint", endpoint]);
        }
        let stdin = peer.preshared_key.as_deref().map(str::as_bytes);
        self.runner.run("wg", &args, stdin).await?;
        Ok(())
    }

    async fn remove_peer(&self, iface: &str, public_key: &str) -> Result<(), DriverError> {
        self.runner
            .run("wg", &["set", iface, "peer", public_key, "remove"], None)
            .await?;
        Ok(())
    }

    pub async fn apply(&self, iface: &str, plan: &PeerPlan) -> Result<(), DriverError> {
        for key in &plan.remove {
            self.remove_peer(iface, key).await?;
        }
        for peer in plan.add.iter().chain(&plan.update) {
            self.set_peer(iface, peer).await?;
        }
        debug!(
            interface = iface,
            added = plan.add.len(),
            updated = plan.update.len(),
            removed = plan.remove.len(),
            "applied peer changes"
        );
        Ok(())
    }
}

/// A peer section, with the display name some tools leave in a comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfPeer {
    pub name: Option<String>,
    pub config: PeerConfig,
}

/// A parsed wg-quick configuration file. Interface keys this crate does not
/// manage (`PostUp`, `Table`, ...) are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WgQuickConf {
    pub private_key: Option<String>,
    pub address: Vec<String>,
    pub listen_port: Option<u16>,
    pub mtu: Option<u16>,
    pub fwmark: Option<u32>,
    pub dns: Vec<String>,
    pub extra: Vec<(String, String)>,
    pub peers: Vec<ConfPeer>,
}

pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn name_comment(line: &str) -> Option<String> {
    let body = line.trim_start_matches(['#', ';']).trim();
    let (key, value) = body.split_once(['=', ':'])?;
    let key = key.trim();
    (key.eq_ignore_ascii_case("name") || key.eq_ignore_ascii_case("client") || key.eq_ignore_ascii_case("peer"))
        .then(|| value.trim().to_string())
        .filter(|v| !v.is_empty())
}

enum Section {
    None,
    Interface,
    Peer,
}

impl WgQuickConf {
    pub fn parse(text: &str) -> Result<Self, DriverError> {
        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        let mut conf = WgQuickConf::default();
        let mut section = Section::None;
        let mut pending_name: Option<String> = None;

        for (i, line) in lines.iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            if line.starts_with('#') || line.starts_with(';') {
                if let Some(name) = name_comment(line) {
                    let next = lines[i + 1..].iter().find(|l| !l.is_empty());
                    let precedes_peer = next.is_some_and(|l| l.eq_ignore_ascii_case("[peer]"));
                    match (&section, conf.peers.last_mut()) {
                        (Section::Peer, Some(peer)) if !precedes_peer && peer.name.is_none() => {
                            peer.name = Some(name)
                        }
                        _ => pending_name = Some(name),
                    }
                }
                continue;
            }
            if line.eq_ignore_ascii_case("[interface]") {
                section = Section::Interface;
                continue;
            }
            if line.eq_ignore_ascii_case("[peer]") {
                section = Section::Peer;
                conf.peers.push(ConfPeer {
                    name: pending_name.take(),
                    config: PeerConfig {
                        public_key: String::new(),
                        preshared_key: None,
                        endpoint: None,
                        allowed_ips: Vec::new(),
                        persistent_keepalive: 0,
                    },
                });
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| DriverError::Parse(format!("line {}: {line:?}", i + 1)))?;

            match section {
                Section::Interface => match key.to_ascii_lowercase().as_str() {
                    "privatekey" => conf.private_key = Some(value.to_string()),
                    "address" => conf.address.extend(split_list(value)),
                    "listenport" => conf.listen_port = Some(number(value, "ListenPort")?),
                    "mtu" => conf.mtu = Some(number(value, "MTU")?),
                    "fwmark" => conf.fwmark = fwmark(value)?,
                    "dns" => conf.dns.extend(split_list(value)),
                    _ => conf.extra.push((key.to_string(), value.to_string())),
                },
                Section::Peer => {
                    let Some(peer) = conf.peers.last_mut() else {
                        continue;
                    };
                    let cfg = &mut peer.config;
                    match key.to_ascii_lowercase().as_str() {
                        "publickey" => cfg.public_key = value.to_string(),
                        "presharedkey" => cfg.preshared_key = Some(value.to_string()),
                        "endpoint" => cfg.endpoint = Some(value.to_string()),
                        "allowedips" => cfg.allowed_ips.extend(split_list(value)),
                        "persistentkeepalive" => {
                            cfg.persistent_keepalive = match value {
                                "off" => 0,
                                v => number(v, "PersistentKeepalive")?,
                            }
                        }
                        _ => {}
                    }
                }
                Section::None => {
                    return Err(DriverError::Parse(format!(
                        "line {}: key outside of a section",
                        i + 1
                    )));
                }
            }
        }

        Ok(conf)
    }

    /// Replace the interface section with `config`, keeping unmanaged keys.
    pub fn set_interface(&mut self, config: &InterfaceConfig) {
        self.private_key = Some(config.private_key.clone());
        self.address = split_list(&config.address);
        self.listen_port = config.listen_port;
        self.mtu = config.mtu;
        self.fwmark = config.firewall_mark;
        self.dns = config.dns.clone();
    }

    /// Replace all peers, carrying names over by public key.
    pub fn set_peers(&mut self, peers: &[PeerConfig]) {
        let names: Vec<(String, Option<String>)> = self
            .peers
            .drain(..)
            .map(|p| (p.config.public_key, p.name))
            .collect();
        self.peers = peers
            .iter()
            .map(|cfg| ConfPeer {
                name: names
                    .iter()
                    .find(|(k, _)| *k == cfg.public_key)
                    .and_then(|(_, n)| n.clone()),
                config: cfg.clone(),
            })
            .collect();
    }

    /// Interface section only, with peers ignored. Used to tell whether a
    /// running interface needs a restart.
    pub fn interface_matches(&self, other: &WgQuickConf) -> bool {
        self.private_key == other.private_key
            && self.address == other.address
            && self.listen_port == other.listen_port
            && self.mtu == other.mtu
            && self.fwmark == other.fwmark
            && self.dns == other.dns
            && self.extra == other.extra
    }

    pub fn render(&self) -> String {
        let mut out = String::from("[Interface]\n");
        if let Some(key) = &self.private_key {
            let _ = writeln!(out, "PrivateKey = {key}");
        }
        if !self.address.is_empty() {
            let _ = writeln!(out, "Address = {}", self.address.join(", "));
        }
        if let Some(port) = self.listen_port {
            let _ = writeln!(out, "ListenPort = {port}");
        }
        if let Some(mtu) = self.mtu {
            let _ = writeln!(out, "MTU = {mtu}");
        }
        if let Some(mark) = self.fwmark {
            let _ = writeln!(out, "FwMark = {mark}");
        }
        if !self.dns.is_empty() {
            let _ = writeln!(out, "DNS = {}", self.dns.join(", "));
        }
        for (key, value) in &self.extra {
            let _ = writeln!(out, "{key} = {value}");
        }

        for peer in &self.peers {
            out.push('\n');
            out.push_str("[Peer]\n");
            if let Some(name) = &peer.name {
                let _ = writeln!(out, "# Name = {name}");
            }
            let cfg = &peer.config;
            let _ = writeln!(out, "PublicKey = {}", cfg.public_key);
            if let Some(psk) = &cfg.preshared_key {
                let _ = writeln!(out, "PresharedKey = {psk}");
            }
            if let Some(endpoint) = &cfg.endpoint {
                let _ = writeln!(out, "Endpoint = {endpoint}");
            }
            let _ = writeln!(out, "AllowedIPs = {}", cfg.allowed_ips.join(", "));
            if cfg.persistent_keepalive > 0 {
                let _ = writeln!(out, "PersistentKeepalive = {}", cfg.persistent_keepalive);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::command::testing::ScriptedRunner;

    const DUMP: &str = "wg0\tcHJpdmF0ZQ==\tcHVibGlj\t51820\toff\n\
        wg0\tcGVlcjE=\t(none)\t192.0.2.1:51820\t10.0.0.2/32,fd00::2/128\t1700000000\t100\t200\t25\n\
        wg0\tcGVlcjI=\tcHNr\t(none)\t10.0.0.3/32\t0\t0\t0\toff\n\
        wg1\t(none)\tcHViMg==\t0\t0x2a\n";

    #[test]
    fn parses_all_dump() {
        let ifaces = parse_dump(DUMP).unwrap();
        assert_eq!(ifaces.len(), 2);

        let wg0 = &ifaces[0];
        assert_eq!(wg0.listen_port, Some(51820));
        assert_eq!(wg0.fwmark, None);
        assert_eq!(wg0.peers.len(), 2);

        let first = &wg0.peers[0];
        assert_eq!(first.allowed_ips, vec!["10.0.0.2/32", "fd00::2/128"]);
        assert_eq!(first.persistent_keepalive, 25);
        assert_eq!(first.stats.rx_bytes, 100);
        assert_eq!(first.stats.last_handshake.unwrap().timestamp(), 1_700_000_000);

        let second = &wg0.peers[1];
        assert_eq!(second.preshared_key.as_deref(), Some("cHNr"));
        assert_eq!(second.endpoint, None);
        assert_eq!(second.stats.last_handshake, None);
        assert_eq!(second.persistent_keepalive, 0);

        let wg1 = &ifaces[1];
        assert_eq!(wg1.private_key, None);
        assert_eq!(wg1.listen_port, None);
        assert_eq!(wg1.fwmark, Some(42));

        let stats = wg0.stats();
        assert_eq!(stats.interface.rx_bytes, 100);
        assert_eq!(stats.interface.tx_bytes, 200);
    }

    #[test]
    fn rejects_garbage_dump() {
        assert!(parse_dump("wg0\tonly\tthree").is_err());
        assert!(parse_dump("wg9\tk\t(none)\t(none)\t(none)\t0\t0\t0\toff").is_err());
    }

    const CONF: &str = "\
[Interface]
PrivateKey = cHJpdmF0ZQ==
Address = 10.0.0.1/24, fd00::1/64
ListenPort = 51820
MTU = 1420
DNS = 1.1.1.1
PostUp = iptables -A FORWARD -i %i -j ACCEPT

# Name = laptop
[Peer]
PublicKey = cGVlcjE=
AllowedIPs = 10.0.0.2/32

[Peer]
# Name = phone
PublicKey = cGVlcjI=
PresharedKey = cHNr
Endpoint = vpn.example.com:51820
AllowedIPs = 10.0.0.3/32
PersistentKeepalive = 25

[Peer]
PublicKey = cGVlcjM=
AllowedIPs = 10.0.0.4/32
";

    #[test]
    fn parses_names_and_keeps_unmanaged_keys() {
        let conf = WgQuickConf::parse(CONF).unwrap();
        assert_eq!(conf.address, vec!["10.0.0.1/24", "fd00::1/64"]);
        assert_eq!(conf.mtu, Some(1420));
        assert_eq!(conf.extra.len(), 1);
        assert_eq!(conf.peers.len(), 3);
        assert_eq!(conf.peers[0].name.as_deref(), Some("laptop"));
        assert_eq!(conf.peers[1].name.as_deref(), Some("phone"));
        assert_eq!(conf.peers[1].config.persistent_keepalive, 25);
        assert_eq!(conf.peers[2].name, None);
    }

    #[test]
    fn render_then_parse_is_stable() {
        let conf = WgQuickConf::parse(CONF).unwrap();
        let reparsed = WgQuickConf::parse(&conf.render()).unwrap();
        assert_eq!(conf, reparsed);
    }

    #[test]
    fn set_peers_keeps_known_names() {
        let mut conf = WgQuickConf::parse(CONF).unwrap();
        let phone = conf.peers[1].config.clone();
        conf.set_peers(&[phone]);
        assert_eq!(conf.peers.len(), 1);
        assert_eq!(conf.peers[0].name.as_deref(), Some("phone"));
    }

    #[test]
    fn key_outside_section_is_rejected() {
        assert!(WgQuickConf::parse("PrivateKey = abc\n").is_err());
    }

    #[tokio::test]
    async fn apply_removes_then_sets() {
        let runner = Arc::new(ScriptedRunner::default());
        let wg = WgCli::new(runner.clone());
        let plan = PeerPlan {
            add: vec![PeerConfig {
                public_key: "bmV3".into(),
                preshared_key: Some("c2VjcmV0".into()),
                endpoint: Some("192.0.2.1:51820".into()),
                allowed_ips: vec!["10.0.0.5/32".into()],
                persistent_keepalive: 0,
            }],
            update: vec![],
            remove: vec!["b2xk".into()],
        };
        wg.apply("wg0", &plan).await.unwrap();

        let commands = runner.commands();
        assert_eq!(commands[0], "wg set wg0 peer b2xk remove");
        assert_eq!(
            commands[1],
            "wg set wg0 peer bmV3 preshared-key /dev/stdin persistent-keepalive off \
             allowed-ips 10.0.0.5/32 endpoint 192.0.2.1:51820"
        );
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[1].2.as_deref(), Some("c2VjcmV0"));
    }
}
