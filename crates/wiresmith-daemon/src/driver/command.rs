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

//! Running `wg`, `wg-quick` and friends locally or on a remote host.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use super::DriverError;

const SSH_CONNECT_TIMEOUT_SECS: u32 = 10;

/// Executes a program and returns its stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<String, DriverError>;

    /// Where commands run, for log lines.
    fn describe(&self) -> String;
}

/// Quote `arg` for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,@%+".contains(&b))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

async fn execute(
    mut cmd: Command,
    label: &str,
    stdin: Option<&[u8]>,
) -> Result<std::process::Output, DriverError> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DriverError::Command {
                program: label.to_string(),
                code: None,
                stderr: "command not found".into(),
            }
        } else {
            DriverError::Io(e)
        }
    })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).await?;
        pipe.shutdown().await?;
    }

    Ok(child.wait_with_output().await?)
}

fn command_error(program: &str, output: &std::process::Output) -> DriverError {
    DriverError::Command {
        program: program.to_string(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

/// Runs commands on this machine, optionally through `sudo -n`.
#[derive(Debug, Clone, Default)]
pub struct LocalRunner {
    sudo: bool,
}

impl LocalRunner {
    pub fn new(sudo: bool) -> Self {
        Self { sudo }
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<String, DriverError> {
        let mut cmd = if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(program);
            cmd
        } else {
            Command::new(program)
        };
        cmd.args(args);
        trace!(program, ?args, sudo = self.sudo, "running local command");

        let output = execute(cmd, program, stdin).await?;
        if !output.status.success() {
            return Err(command_error(program, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}

/// Runs commands on a remote host through the system `ssh` client.
/// Authentication is non-interactive: keys or an agent must be set up.
#[derive(Debug, Clone)]
pub struct SshRunner {
    host: String,
    port: u16,
    user: String,
    sudo: bool,
}

impl SshRunner {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, sudo: bool) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            sudo,
        }
    }

    fn remote_command(&self, program: &str, args: &[&str]) -> String {
        let mut parts = Vec::with_capacity(args.len() + 3);
        if self.sudo {
            parts.push("sudo".to_string());
            parts.push("-n".to_string());
        }
        parts.push(shell_quote(program));
        parts.extend(args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<String, DriverError> {
        let remote = self.remote_command(program, args);
        let mut cmd = Command::new("ssh");
        cmd.args([
            "-o",
            "BatchMode=yes",
            "-o",
            &format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}"),
            "-p",
            &self.port.to_string(),
            &format!("{}@{}", self.user, self.host),
            "--",
            &remote,
        ]);
        debug!(target_host = %self.host, program, "running remote command");

        let output = execute(cmd, "ssh", stdin).await?;
        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            // ssh reserves 255 for its own failures: connect, auth, host key.
            Some(255) => Err(DriverError::Unavailable(format!(
                "ssh {}@{}:{}: {}",
                self.user,
                self.host,
                self.port,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            _ => Err(command_error(program, &output)),
        }
    }

    fn describe(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Records invocations and answers from a queue of canned replies.
    #[derive(Default)]
    pub struct ScriptedRunner {
        pub calls: Mutex<Vec<(String, Vec<String>, Option<String>)>>,
        replies: Mutex<VecDeque<Result<String, (i32, String)>>>,
    }

    impl ScriptedRunner {
        pub fn reply(&self, stdout: &str) -> &Self {
            self.replies.lock().unwrap().push_back(Ok(stdout.to_string()));
            self
        }

        pub fn fail(&self, code: i32, stderr: &str) -> &Self {
            self.replies
                .lock()
                .unwrap()
                .push_back(Err((code, stderr.to_string())));
            self
        }

        pub fn commands(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(p, a, _)| std::iter::once(p.clone()).chain(a.iter().cloned()).collect::<Vec<_>>().join(" "))
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            program: &str,
            args: &[&str],
            stdin: Option<&[u8]>,
        ) -> Result<String, DriverError> {
            self.calls.lock().unwrap().push((
                program.to_string(),
                args.iter().map(|a| a.to_string()).collect(),
                stdin.map(|s| String::from_utf8_lossy(s).into_owned()),
            ));
            match self.replies.lock().unwrap().pop_front() {
                Some(Ok(out)) => Ok(out),
                Some(Err((code, stderr))) => Err(DriverError::Command {
                    program: program.to_string(),
                    code: Some(code),
                    stderr,
                }),
                None => Ok(String::new()),
            }
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }
}
