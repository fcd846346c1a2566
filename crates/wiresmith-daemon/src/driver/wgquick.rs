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

//! Driver for hosts managed through wg-quick configuration files: the local
//! `exec` and `darwin` backends and remote `ssh` backends.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use wiresmith_types::BackendKind;
use wiresmith_types::interface::{
    DeviceStats, ForeignPeer, ForeignServer, InterfaceConfig, ObservedInterface, ObservedPeer,
    PeerConfig,
};

use super::command::CommandRunner;
use super::wg::{DumpInterface, WgCli, WgQuickConf};
use super::{Capabilities, Driver, DriverError, plan_peer_sync};
use crate::keys::public_key_from_private;

const READ_SCRIPT: &str = r#"if [ -f "$1" ]; then cat "$1"; else exit 3; fi"#;
const WRITE_SCRIPT: &str = r#"umask 077 && cat > "$1""#;
const LIST_SCRIPT: &str =
    r#"for f in "$1"/*.conf; do [ -e "$f" ] && basename "$f" .conf; done; true"#;
const MISSING_FILE: i32 = 3;

/// wg-quick on macOS names the utun device in this directory.
const DARWIN_NAME_DIR: &str = "/var/run/wireguard";

pub struct WgQuickDriver {
    kind: BackendKind,
    runner: Arc<dyn CommandRunner>,
    wg: WgCli,
    config_dir: String,
}

impl WgQuickDriver {
    pub fn new(kind: BackendKind, runner: Arc<dyn CommandRunner>, config_dir: &str) -> Self {
        Self {
            kind,
            wg: WgCli::new(runner.clone()),
            runner,
            config_dir: config_dir.trim_end_matches('/').to_string(),
        }
    }

    fn conf_path(&self, name: &str) -> String {
        format!("{}/{name}.conf", self.config_dir)
    }

    async fn read_conf(&self, name: &str) -> Result<Option<WgQuickConf>, DriverError> {
        let path = self.conf_path(name);
        match self
            .runner
            .run("sh", &["-c", READ_SCRIPT, "wiresmith", &path], None)
            .await
        {
            Ok(text) => WgQuickConf::parse(&text).map(Some),
            Err(DriverError::Command {
                code: Some(MISSING_FILE),
                ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_conf(&self, name: &str, conf: &WgQuickConf) -> Result<(), DriverError> {
        let path = self.conf_path(name);
        let text = conf.render();
        self.runner
            .run(
                "sh",
                &["-c", WRITE_SCRIPT, "wiresmith", &path],
                Some(text.as_bytes()),
            )
            .await?;
        debug!(path, "wrote wg-quick config");
        Ok(())
    }

    async fn conf_names(&self) -> Result<Vec<String>, DriverError> {
        let out = self
            .runner
            .run("sh", &["-c", LIST_SCRIPT, "wiresmith", &self.config_dir], None)
            .await?;
        Ok(out.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect())
    }

    /// Kernel-visible device name of a running interface.
    async fn live_name(&self, name: &str) -> Result<Option<String>, DriverError> {
        let device = if self.kind == BackendKind::Darwin {
            let path = format!("{DARWIN_NAME_DIR}/{name}.name");
            match self
                .runner
                .run("sh", &["-c", READ_SCRIPT, "wiresmith", &path], None)
                .await
            {
                Ok(out) => out.trim().to_string(),
                Err(DriverError::Command {
                    code: Some(MISSING_FILE),
                    ..
                }) => return Ok(None),
                Err(e) => return Err(e),
            }
        } else {
            name.to_string()
        };
        let live = self.wg.interfaces().await?;
        Ok(live.contains(&device).then_some(device))
    }

    async fn wg_quick(&self, action: &str, name: &str) -> Result<(), DriverError> {
        let path = self.conf_path(name);
        info!(interface = name, action, host = %self.runner.describe(), "running wg-quick");
        self.runner.run("wg-quick", &[action, &path], None).await?;
        Ok(())
    }

    async fn live_device(&self, name: &str) -> Result<DumpInterface, DriverError> {
        let live = self
            .live_name(name)
            .await?
            .ok_or_else(|| DriverError::InterfaceNotFound(name.to_string()))?;
        self.wg
            .device(&live)
            .await?
            .ok_or_else(|| DriverError::InterfaceNotFound(name.to_string()))
    }

    async fn foreign_server(
        &self,
        name: &str,
        dump: &[DumpInterface],
    ) -> Result<ForeignServer, DriverError> {
        let conf = self.read_conf(name).await?.unwrap_or_default();
        let live = self.live_name(name).await?;
        let device = live
            .as_deref()
            .and_then(|l| dump.iter().find(|d| d.name == l));

        let private_key = conf
            .private_key
            .clone()
            .or_else(|| device.and_then(|d| d.private_key.clone()));
        let public_key = device
            .and_then(|d| d.public_key.clone())
            .or_else(|| private_key.as_deref().and_then(|k| public_key_from_private(k).ok()));

        let mut peers: Vec<ForeignPeer> = conf
            .peers
            .iter()
            .map(|p| ForeignPeer {
                name: p.name.clone(),
                config: p.config.clone(),
            })
            .collect();
        if let Some(device) = device {
            let listed: BTreeSet<String> =
                peers.iter().map(|p| p.config.public_key.clone()).collect();
            peers.extend(
                device
                    .peers
                    .iter()
                    .filter(|p| !listed.contains(&p.public_key))
                    .map(|p| ForeignPeer {
                        name: None,
                        config: PeerConfig {
                            public_key: p.public_key.clone(),
                            preshared_key: p.preshared_key.clone(),
                            endpoint: p.endpoint.clone(),
                            allowed_ips: p.allowed_ips.clone(),
                            persistent_keepalive: p.persistent_keepalive,
                        },
                    }),
            );
        }

        Ok(ForeignServer {
            name: name.to_string(),
            private_key,
            public_key,
            address: (!conf.address.is_empty()).then(|| conf.address.join(",")),
            listen_port: device.and_then(|d| d.listen_port).or(conf.listen_port),
            mtu: conf.mtu,
            firewall_mark: device.and_then(|d| d.fwmark).or(conf.fwmark),
            dns: conf.dns,
            up: live.is_some(),
            peers,
        })
    }
}

#[async_trait]
impl Driver for WgQuickDriver {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn capabilities(&self) -> Capabilities {
        if self.kind == BackendKind::Darwin && !cfg!(target_os = "macos") {
            return Capabilities { supported: false };
        }
        let supported = self
            .runner
            .run("sh", &["-c", "command -v wg && command -v wg-quick"], None)
            .await
            .is_ok();
        Capabilities { supported }
    }

    async fn probe(&self) -> Result<(), DriverError> {
        let version = self.wg.version().await?;
        debug!(host = %self.runner.describe(), version, "probe ok");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(interface = %config.name))]
    async fn up(&self, config: &InterfaceConfig) -> Result<ObservedInterface, DriverError> {
        let existing = self.read_conf(&config.name).await?;
        let mut conf = existing.clone().unwrap_or_default();
        conf.set_interface(config);

        let unchanged = existing
            .as_ref()
            .is_some_and(|e| e.interface_matches(&conf));
        if !unchanged {
            self.write_conf(&config.name, &conf).await?;
        }

        match self.live_name(&config.name).await? {
            Some(_) if unchanged => debug!("interface already up with this config"),
            Some(_) => {
                self.wg_quick("down", &config.name).await?;
                self.wg_quick("up", &config.name).await?;
            }
            None => self.wg_quick("up", &config.name).await?,
        }

        let device = self.live_device(&config.name).await?;
        Ok(ObservedInterface {
            name: config.name.clone(),
            up: true,
            public_key: device.public_key,
            listen_port: device.listen_port,
        })
    }

    async fn down(&self, name: &str) -> Result<(), DriverError> {
        if self.live_name(name).await?.is_none() {
            debug!(interface = name, "interface already down");
            return Ok(());
        }
        self.wg_quick("down", name).await
    }

    #[tracing::instrument(skip_all, fields(interface = name, desired = desired.len()))]
    async fn sync_peers(
        &self,
        name: &str,
        desired: &[PeerConfig],
    ) -> Result<Vec<ObservedPeer>, DriverError> {
        let existing = self
            .read_conf(name)
            .await?
            .ok_or_else(|| DriverError::InterfaceNotFound(name.to_string()))?;
        let mut conf = existing.clone();
        conf.set_peers(desired);
        if conf != existing {
            self.write_conf(name, &conf).await?;
        }

        let device = self.live_device(name).await?;
        let plan = plan_peer_sync(&device.peers, desired);
        if plan.is_empty() {
            return Ok(device.peers);
        }
        self.wg.apply(&device.name, &plan).await?;
        Ok(self.live_device(name).await?.peers)
    }

    async fn read_stats(&self, name: &str) -> Result<DeviceStats, DriverError> {
        let mut stats = self.live_device(name).await?.stats();
        stats.interface.name = name.to_string();
        Ok(stats)
    }

    async fn discover(&self, known: &[String]) -> Result<Vec<ForeignServer>, DriverError> {
        let mut names: BTreeSet<String> = self.conf_names().await?.into_iter().collect();
        if self.kind != BackendKind::Darwin {
            names.extend(self.wg.interfaces().await?);
        }
        names.retain(|n| !known.contains(n));

        let dump = self.wg.dump().await?;
        let mut found = Vec::with_capacity(names.len());
        for name in names {
            found.push(self.foreign_server(&name, &dump).await?);
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::driver::command::LocalRunner;
    use crate::driver::command::testing::ScriptedRunner;

    fn interface() -> InterfaceConfig {
        InterfaceConfig {
            name: "wg0".into(),
            private_key: "cHJpdmF0ZQ==".into(),
            address: "10.0.0.1/24".into(),
            listen_port: Some(51820),
            mtu: None,
            firewall_mark: None,
            dns: vec![],
        }
    }

    fn rendered() -> String {
        let mut conf = WgQuickConf::default();
        conf.set_interface(&interface());
        conf.render()
    }

    const DUMP: &str = "wg0\tcHJpdmF0ZQ==\tcHVibGlj\t51820\toff\n";

    #[tokio::test]
    async fn first_up_writes_config_and_starts() {
        let runner = Arc::new(ScriptedRunner::default());
        runner
            .fail(MISSING_FILE, "")
            .reply("")
            .reply("")
            .reply("")
            .reply("wg0\n")
            .reply(DUMP);
        let driver = WgQuickDriver::new(BackendKind::Exec, runner.clone(), "/etc/wireguard/");

        let observed = driver.up(&interface()).await.unwrap();
        assert!(observed.up);
        assert_eq!(observed.listen_port, Some(51820));

        let commands = runner.commands();
        assert!(commands.contains(&"wg-quick up /etc/wireguard/wg0.conf".to_string()));
        let calls = runner.calls.lock().unwrap();
        let written = calls[1].2.as_deref().unwrap();
        assert!(written.contains("ListenPort = 51820"));
    }

    #[tokio::test]
    async fn second_up_with_same_config_is_a_no_op() {
        let runner = Arc::new(ScriptedRunner::default());
        runner
            .reply(&rendered())
            .reply("wg0\n")
            .reply("wg0\n")
            .reply(DUMP);
        let driver = WgQuickDriver::new(BackendKind::Exec, runner.clone(), "/etc/wireguard");

        driver.up(&interface()).await.unwrap();
        let commands = runner.commands();
        assert!(commands.iter().all(|c| !c.starts_with("wg-quick")), "{commands:?}");
        assert!(commands.iter().all(|c| !c.contains("umask")), "{commands:?}");
    }

    #[tokio::test]
    async fn changed_port_restarts_running_interface() {
        let runner = Arc::new(ScriptedRunner::default());
        runner
            .reply(&rendered())
            .reply("")
            .reply("wg0\n")
            .reply("")
            .reply("")
            .reply("wg0\n")
            .reply(DUMP);
        let driver = WgQuickDriver::new(BackendKind::Exec, runner.clone(), "/etc/wireguard");

        let mut changed = interface();
        changed.listen_port = Some(51821);
        driver.up(&changed).await.unwrap();

        let commands = runner.commands();
        let down = commands.iter().position(|c| c.starts_with("wg-quick down"));
        let up = commands.iter().position(|c| c.starts_with("wg-quick up"));
        assert!(down.is_some() && up.is_some() && down < up, "{commands:?}");
    }

    #[tokio::test]
    async fn down_on_missing_interface_is_ok() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.reply("wg1\n");
        let driver = WgQuickDriver::new(BackendKind::Ssh, runner.clone(), "/etc/wireguard");
        driver.down("wg0").await.unwrap();
        assert_eq!(runner.commands(), vec!["wg show interfaces"]);
    }

    #[tokio::test]
    async fn config_files_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap();
        let driver = WgQuickDriver::new(BackendKind::Exec, Arc::new(LocalRunner::new(false)), dir_str);

        assert!(driver.read_conf("wg0").await.unwrap().is_none());

        let mut conf = WgQuickConf::default();
        conf.set_interface(&interface());
        driver.write_conf("wg0", &conf).await.unwrap();
        driver.write_conf("wg1", &conf).await.unwrap();

        assert_eq!(driver.read_conf("wg0").await.unwrap(), Some(conf));
        assert_eq!(driver.conf_names().await.unwrap(), vec!["wg0", "wg1"]);

        let mode = std::fs::metadata(dir.path().join("wg0.conf"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o077, 0);
    }

    #[tokio::test]
    async fn empty_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let driver = WgQuickDriver::new(
            BackendKind::Exec,
            Arc::new(LocalRunner::new(false)),
            dir.path().to_str().unwrap(),
        );
        assert!(driver.conf_names().await.unwrap().is_empty());
    }
}
