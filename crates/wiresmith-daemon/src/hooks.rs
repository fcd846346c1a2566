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

//! Lifecycle hooks: user shell commands run around state transitions.
//!
//! Hooks observe transitions, they never gate them. Every matching hook runs
//! as its own `sh -c` process, several at a time, and each failure becomes a
//! [`Warning`] on the triggering operation.

use std::process::Stdio;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};
use wiresmith_types::{Hook, HookTrigger, Peer, Server};

use crate::error::Warning;

const STDERR_LIMIT: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookFailure {
    #[error("exited with status {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("killed after {0:?}")]
    Timeout(Duration),

    #[error("failed to spawn: {0}")]
    Spawn(String),
}

/// Environment and naming for one hook invocation.
#[derive(Debug, Clone)]
pub struct HookContext {
    interface: String,
    target: String,
    trigger: HookTrigger,
    env: Vec<(&'static str, String)>,
}

impl HookContext {
    pub fn for_server(server: &Server, trigger: HookTrigger) -> Self {
        let mut env = server_env(server);
        env.push(("WG_HOOK_ACTION", trigger.as_str().to_string()));
        Self {
            interface: server.name.clone(),
            target: format!("server {}", server.name),
            trigger,
            env,
        }
    }

    pub fn for_peer(server: &Server, peer: &Peer, trigger: HookTrigger) -> Self {
        let mut env = server_env(server);
        env.extend([
            ("WG_PEER_NAME", peer.name.clone()),
            ("WG_PEER_PUBLIC_KEY", peer.public_key.clone()),
            ("WG_PEER_ENDPOINT", peer.endpoint.clone().unwrap_or_default()),
            ("WG_PEER_ALLOWED_IPS", peer.allowed_ips.join(",")),
            (
                "WG_PEER_PERSISTENT_KEEPALIVE",
                peer.persistent_keepalive.to_string(),
            ),
            ("WG_HOOK_ACTION", trigger.as_str().to_string()),
        ]);
        Self {
            interface: server.name.clone(),
            target: format!("peer {} on {}", peer.name, server.name),
            trigger,
            env,
        }
    }

    pub fn trigger(&self) -> HookTrigger {
        self.trigger
    }

    fn expand(&self, command: &str) -> String {
        command.replace("%i", &self.interface)
    }
}

fn server_env(server: &Server) -> Vec<(&'static str, String)> {
    let opt = |v: Option<String>| v.unwrap_or_default();
    vec![
        ("WG_SERVER_NAME", server.name.clone()),
        ("WG_SERVER_DESCRIPTION", server.description.clone()),
        ("WG_SERVER_PUBLIC_KEY", server.public_key.clone()),
        ("WG_SERVER_LISTEN_PORT", opt(server.listen_port.map(|p| p.to_string()))),
        ("WG_SERVER_FIREWALL_MARK", opt(server.firewall_mark.map(|m| m.to_string()))),
        ("WG_SERVER_ADDRESS", server.address.clone()),
        ("WG_SERVER_DNS", server.dns.join(",")),
        ("WG_SERVER_MTU", opt(server.mtu.map(|m| m.to_string()))),
    ]
}

#[derive(Debug, Clone)]
pub struct HookExecutor {
    timeout: Duration,
    concurrency: usize,
}

impl HookExecutor {
    pub fn new(timeout: Duration, concurrency: usize) -> Self {
        Self {
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// Run every hook in `hooks` that fires on the context's trigger.
    #[tracing::instrument(skip_all, fields(target = %ctx.target, trigger = ctx.trigger.as_str()))]
    pub async fn run(&self, hooks: &[Hook], ctx: &HookContext) -> Vec<Warning> {
        let selected: Vec<&Hook> = hooks.iter().filter(|h| h.fires_on(ctx.trigger)).collect();
        if selected.is_empty() {
            return Vec::new();
        }
        debug!(count = selected.len(), "running hooks");

        futures::stream::iter(selected)
            .map(|hook| async move {
                self.run_one(&hook.command, ctx)
                    .await
                    .err()
                    .map(|failure| {
                        warn!(command = %hook.command, error = %failure, "hook failed");
                        Warning::HookFailed {
                            target: ctx.target.clone(),
                            command: hook.command.clone(),
                            reason: failure.to_string(),
                        }
                    })
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|w| async move { w })
            .collect()
            .await
    }

    async fn run_one(&self, command: &str, ctx: &HookContext) -> Result<(), HookFailure> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(ctx.expand(command))
            .envs(ctx.env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HookFailure::Spawn(e.to_string()))?;

        // Dropping the output future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| HookFailure::Timeout(self.timeout))?
            .map_err(|e| HookFailure::Spawn(e.to_string()))?;

        if output.status.success() {
            debug!(command, "hook succeeded");
            return Ok(());
        }

        let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.len() > STDERR_LIMIT {
            let mut cut = STDERR_LIMIT;
            while !stderr.is_char_boundary(cut) {
                cut -= 1;
            }
            stderr.truncate(cut);
        }
        Err(HookFailure::Exit {
            code: output.status.code(),
            stderr,
        })
    }
}
