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

//! NetworkManager backend, driven through `nmcli`.
//!
//! Profiles are created by importing a rendered wg-quick file so keys never
//! appear on a command line. Peers are applied to the live device with `wg`
//! and are not written into the profile; the store re-applies them whenever
//! the interface is brought up.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wiresmith_types::BackendKind;
use wiresmith_types::interface::{
    DeviceStats, ForeignPeer, ForeignServer, InterfaceConfig, ObservedInterface, ObservedPeer,
    PeerConfig,
};

use super::command::CommandRunner;
use super::wg::{WgCli, WgQuickConf, fwmark, split_list};
use super::{Capabilities, Driver, DriverError, plan_peer_sync};
use crate::keys::public_key_from_private;

const PROFILE_FIELDS: &str =
    "wireguard.listen-port,wireguard.fwmark,wireguard.mtu,ipv4.addresses,ipv6.addresses,ipv4.dns";

/// Non-secret profile settings compared to decide whether `up` has work to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ProfileSnapshot {
    listen_port: Option<u16>,
    fwmark: Option<u32>,
    mtu: Option<u16>,
    addresses: BTreeSet<String>,
    dns: BTreeSet<String>,
}

impl ProfileSnapshot {
    fn desired(config: &InterfaceConfig) -> Self {
        Self {
            listen_port: config.listen_port,
            fwmark: config.firewall_mark,
            mtu: config.mtu,
            addresses: split_list(&config.address).into_iter().collect(),
            dns: config.dns.iter().cloned().collect(),
        }
    }

    /// Parse `nmcli -g` output for [`PROFILE_FIELDS`], one value per line.
    fn parse(output: &str) -> Result<Self, DriverError> {
        let values: Vec<String> = output
            .lines()
            .map(|l| l.replace("\\:", ":").trim().to_string())
            .collect();
        if values.len() < 6 {
            return Err(DriverError::Parse(format!(
                "expected 6 profile values, got {}",
                values.len()
            )));
        }
        let nonzero = |v: &str| -> Result<Option<u16>, DriverError> {
            match v {
                "" | "0" | "auto" => Ok(None),
                v => v
                    .parse()
                    .map(Some)
                    .map_err(|_| DriverError::Parse(format!("profile value {v:?}"))),
            }
        };
        let mut addresses: BTreeSet<String> = split_list(&values[3]).into_iter().collect();
        addresses.extend(split_list(&values[4]));
        Ok(Self {
            listen_port: nonzero(&values[0])?,
            fwmark: if values[1].is_empty() {
                None
            } else {
                fwmark(&values[1])?
            },
            mtu: nonzero(&values[2])?,
            addresses,
            dns: split_list(&values[5]).into_iter().collect(),
        })
    }
}

pub struct NetworkManagerDriver {
    runner: Arc<dyn CommandRunner>,
    wg: WgCli,
}

impl NetworkManagerDriver {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            wg: WgCli::new(runner.clone()),
            runner,
        }
    }

    async fn nmcli(&self, args: &[&str]) -> Result<String, DriverError> {
        self.runner.run("nmcli", args, None).await
    }

    async fn wireguard_profiles(&self) -> Result<Vec<String>, DriverError> {
        let out = self
            .nmcli(&["-t", "-f", "NAME,TYPE", "connection", "show"])
            .await?;
        Ok(out
            .lines()
            .filter_map(|l| l.rsplit_once(':'))
            .filter(|(_, kind)| *kind == "wireguard")
            .map(|(name, _)| name.replace("\\:", ":"))
            .collect())
    }

    async fn snapshot(&self, name: &str) -> Result<ProfileSnapshot, DriverError> {
        let out = self
            .nmcli(&["-g", PROFILE_FIELDS, "connection", "show", "id", name])
            .await?;
        ProfileSnapshot::parse(&out)
    }

    /// Write a wg-quick file named after the interface into a private
    /// directory and import it as a new profile.
    async fn import(&self, config: &InterfaceConfig) -> Result<(), DriverError> {
        let mut conf = WgQuickConf::default();
        conf.set_interface(config);

        let dir = std::env::temp_dir().join(format!("wiresmith-{}", Uuid::new_v4()));
        tokio::fs::DirBuilder::new().mode(0o700).create(&dir).await?;
        let path: PathBuf = dir.join(format!("{}.conf", config.name));

        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
                .await?;
            file.write_all(conf.render().as_bytes()).await?;
            file.flush().await?;
            drop(file);

            let path_str = path.to_string_lossy();
            self.nmcli(&["connection", "import", "type", "wireguard", "file", &path_str])
                .await
                .map(|_| ())
        }
        .await;

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(dir = %dir.display(), error = %e, "failed to remove staging directory");
        }
        result
    }

    async fn is_active(&self, name: &str) -> Result<bool, DriverError> {
        let out = self
            .nmcli(&["-t", "-f", "NAME", "connection", "show", "--active"])
            .await?;
        Ok(out.lines().any(|l| l.replace("\\:", ":") == name))
    }

    async fn live_peers(&self, name: &str) -> Result<Vec<ObservedPeer>, DriverError> {
        self.wg
            .device(name)
            .await?
            .map(|d| d.peers)
            .ok_or_else(|| DriverError::InterfaceNotFound(name.to_string()))
    }
}

#[async_trait]
impl Driver for NetworkManagerDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::NetworkManager
    }

    async fn capabilities(&self) -> Capabilities {
        if !cfg!(target_os = "linux") {
            return Capabilities { supported: false };
        }
        let supported = self.nmcli(&["--version"]).await.is_ok() && self.wg.version().await.is_ok();
        Capabilities { supported }
    }

    async fn probe(&self) -> Result<(), DriverError> {
        let status = self.nmcli(&["-t", "-f", "STATE", "general", "status"]).await?;
        debug!(state = status.trim(), "networkmanager reachable");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(interface = %config.name))]
    async fn up(&self, config: &InterfaceConfig) -> Result<ObservedInterface, DriverError> {
        let exists = self.wireguard_profiles().await?.contains(&config.name);
        let desired_key = public_key_from_private(&config.private_key)
            .map_err(|e| DriverError::Interface(e.to_string()))?;

        let current = if exists {
            let snapshot = self.snapshot(&config.name).await?;
            let live_key = self
                .wg
                .device(&config.name)
                .await?
                .and_then(|d| d.public_key);
            Some((snapshot, live_key))
        } else {
            None
        };

        let unchanged = current.as_ref().is_some_and(|(snapshot, live_key)| {
            *snapshot == ProfileSnapshot::desired(config)
                && live_key.as_deref() == Some(desired_key.as_str())
        });

        if unchanged && self.is_active(&config.name).await? {
            debug!("profile already active with this config");
        } else {
            if exists {
                info!("replacing networkmanager profile");
                self.nmcli(&["connection", "delete", "id", &config.name]).await?;
            }
            self.import(config).await?;
            self.nmcli(&["connection", "up", "id", &config.name]).await?;
            info!("networkmanager profile active");
        }

        let device = self
            .wg
            .device(&config.name)
            .await?
            .ok_or_else(|| DriverError::InterfaceNotFound(config.name.clone()))?;
        Ok(ObservedInterface {
            name: config.name.clone(),
            up: true,
            public_key: device.public_key,
            listen_port: device.listen_port,
        })
    }

    async fn down(&self, name: &str) -> Result<(), DriverError> {
        if !self.wireguard_profiles().await?.iter().any(|p| p == name) {
            debug!(interface = name, "no profile, already down");
            return Ok(());
        }
        self.nmcli(&["connection", "delete", "id", name]).await?;
        info!(interface = name, "networkmanager profile removed");
        Ok(())
    }

    async fn sync_peers(
        &self,
        name: &str,
        desired: &[PeerConfig],
    ) -> Result<Vec<ObservedPeer>, DriverError> {
        let current = self.live_peers(name).await?;
        let plan = plan_peer_sync(&current, desired);
        if plan.is_empty() {
            return Ok(current);
        }
        self.wg.apply(name, &plan).await?;
        self.live_peers(name).await
    }

    async fn read_stats(&self, name: &str) -> Result<DeviceStats, DriverError> {
        self.wg
            .device(name)
            .await?
            .map(|d| d.stats())
            .ok_or_else(|| DriverError::InterfaceNotFound(name.to_string()))
    }

    async fn discover(&self, known: &[String]) -> Result<Vec<ForeignServer>, DriverError> {
        let profiles = self.wireguard_profiles().await?;
        let dump = self.wg.dump().await?;

        let mut names: BTreeSet<String> = profiles.iter().cloned().collect();
        names.extend(dump.iter().map(|d| d.name.clone()));
        names.retain(|n| !known.contains(n));

        let mut found = Vec::with_capacity(names.len());
        for name in names {
            let device = dump.iter().find(|d| d.name == name);
            let (snapshot, private_key) = if profiles.contains(&name) {
                let key = self
                    .nmcli(&["-s", "-g", "wireguard.private-key", "connection", "show", "id", &name])
                    .await?;
                let key = key.trim();
                (
                    self.snapshot(&name).await?,
                    (!key.is_empty()).then(|| key.to_string()),
                )
            } else {
                (ProfileSnapshot::default(), device.and_then(|d| d.private_key.clone()))
            };

            let public_key = device
                .and_then(|d| d.public_key.clone())
                .or_else(|| private_key.as_deref().and_then(|k| public_key_from_private(k).ok()));

            found.push(ForeignServer {
                name: name.clone(),
                private_key,
                public_key,
                address: (!snapshot.addresses.is_empty())
                    .then(|| snapshot.addresses.iter().cloned().collect::<Vec<_>>().join(",")),
                listen_port: device.and_then(|d| d.listen_port).or(snapshot.listen_port),
                mtu: snapshot.mtu,
                firewall_mark: device.and_then(|d| d.fwmark).or(snapshot.fwmark),
                dns: snapshot.dns.into_iter().collect(),
                up: device.is_some(),
                peers: device
                    .map(|d| {
                        d.peers
                            .iter()
                            .map(|p| ForeignPeer {
                                name: None,
                                config: PeerConfig {
                                    public_key: p.public_key.clone(),
                                    preshared_key: p.preshared_key.clone(),
                                    endpoint: p.endpoint.clone(),
                                    allowed_ips: p.allowed_ips.clone(),
                                    persistent_keepalive: p.persistent_keepalive,
                                },
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            });
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::command::testing::ScriptedRunner;

    #[test]
    fn snapshot_parses_escaped_values() {
        let out = "51820\n0x2a\n1420\n10.0.0.1/24\nfd00\\:\\:1/64\n1.1.1.1,8.8.8.8\n";
        let snapshot = ProfileSnapshot::parse(out).unwrap();
        assert_eq!(snapshot.listen_port, Some(51820));
        assert_eq!(snapshot.fwmark, Some(42));
        assert_eq!(snapshot.mtu, Some(1420));
        assert!(snapshot.addresses.contains("fd00::1/64"));
        assert_eq!(snapshot.dns.len(), 2);
    }

    #[test]
    fn snapshot_defaults_compare_equal_to_unset_fields() {
        let out = "0\n0\n0\n10.0.0.1/24\n\n\n";
        let config = InterfaceConfig {
            name: "wg0".into(),
            private_key: String::new(),
            address: "10.0.0.1/24".into(),
            listen_port: None,
            mtu: None,
            firewall_mark: None,
            dns: vec![],
        };
        assert_eq!(ProfileSnapshot::parse(out).unwrap(), ProfileSnapshot::desired(&config));
    }

    #[tokio::test]
    async fn down_without_profile_is_a_no_op() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.reply("Wired connection 1:802-3-ethernet\nwg1:wireguard\n");
        let driver = NetworkManagerDriver::new(runner.clone());
        driver.down("wg0").await.unwrap();
        assert_eq!(runner.commands().len(), 1);
    }

    #[tokio::test]
    async fn down_deletes_profile() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.reply("wg0:wireguard\n").reply("");
        let driver = NetworkManagerDriver::new(runner.clone());
        driver.down("wg0").await.unwrap();
        assert_eq!(runner.commands()[1], "nmcli connection delete id wg0");
    }
}
