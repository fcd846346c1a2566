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

//! Input checks run before anything reaches the store or a driver.

use std::net::IpAddr;

use wiresmith_types::Hook;

use crate::driver::wg::split_list;
use crate::driver::{parse_address, parse_cidr};
use crate::error::CoreError;

const MAX_BACKEND_NAME: usize = 64;
const MAX_INTERFACE_NAME: usize = 15;
const MAX_PEER_NAME: usize = 64;
const MAX_DESCRIPTION: usize = 255;
const MTU_RANGE: std::ops::RangeInclusive<u16> = 1280..=1500;

type Result<T = ()> = std::result::Result<T, CoreError>;

fn name_chars(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

pub fn backend_name(name: &str) -> Result {
    if name.is_empty() || name.len() > MAX_BACKEND_NAME || !name_chars(name) {
        return Err(CoreError::validation(format!(
            "backend name {name:?} must be 1-{MAX_BACKEND_NAME} letters, digits, '.', '-' or '_'"
        )));
    }
    Ok(())
}

pub fn server_name(name: &str) -> Result {
    if name.is_empty() || name.len() > MAX_INTERFACE_NAME || !name_chars(name) {
        return Err(CoreError::validation(format!(
            "server name {name:?} must be 1-{MAX_INTERFACE_NAME} letters, digits, '.', '-' or '_'"
        )));
    }
    Ok(())
}

pub fn peer_name(name: &str) -> Result {
    let len = name.chars().count();
    if name.trim().is_empty() || len > MAX_PEER_NAME {
        return Err(CoreError::validation(format!(
            "peer name must be 1-{MAX_PEER_NAME} characters"
        )));
    }
    Ok(())
}

pub fn description(text: &str) -> Result {
    if text.chars().count() > MAX_DESCRIPTION {
        return Err(CoreError::validation(format!(
            "description longer than {MAX_DESCRIPTION} characters"
        )));
    }
    Ok(())
}

/// Comma-separated interface addresses, at least one.
pub fn address(value: &str) -> Result {
    let parts = split_list(value);
    if parts.is_empty() {
        return Err(CoreError::validation("server needs at least one address"));
    }
    for part in parts {
        parse_address(&part)
            .map_err(|_| CoreError::validation(format!("invalid address {part:?}")))?;
    }
    Ok(())
}

pub fn mtu(mtu: Option<u16>) -> Result {
    match mtu {
        Some(m) if !MTU_RANGE.contains(&m) => Err(CoreError::validation(format!(
            "mtu {m} outside {}..={}",
            MTU_RANGE.start(),
            MTU_RANGE.end()
        ))),
        _ => Ok(()),
    }
}

pub fn dns(servers: &[String]) -> Result {
    for server in servers {
        server
            .parse::<IpAddr>()
            .map_err(|_| CoreError::validation(format!("invalid dns server {server:?}")))?;
    }
    Ok(())
}

pub fn hooks(hooks: &[Hook], for_peer: bool) -> Result {
    for hook in hooks {
        let command = hook.command.trim();
        if command.is_empty() || command.contains('\n') {
            return Err(CoreError::validation(
                "hook command must be a single non-empty line",
            ));
        }
        if hook.triggers.is_empty() {
            return Err(CoreError::validation(format!(
                "hook {command:?} has no triggers"
            )));
        }
        if for_peer {
            if let Some(t) = hook.triggers.iter().find(|t| !t.applies_to_peer()) {
                return Err(CoreError::validation(format!(
                    "peer hooks cannot fire on {}",
                    t.as_str()
                )));
            }
        }
    }
    Ok(())
}

/// `host:port`, IPv6 hosts in brackets.
pub fn endpoint(value: &str) -> Result {
    let invalid = || CoreError::validation(format!("endpoint {value:?} must be host:port"));
    let (host, port) = value.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 || host.is_empty() {
        return Err(invalid());
    }
    if let Some(inner) = host.strip_prefix('[') {
        let inner = inner.strip_suffix(']').ok_or_else(invalid)?;
        inner.parse::<std::net::Ipv6Addr>().map_err(|_| invalid())?;
    } else if host.contains(':') {
        return Err(invalid());
    }
    Ok(())
}

pub fn allowed_ips(ips: &[String]) -> Result {
    if ips.is_empty() {
        return Err(CoreError::validation("peer needs at least one allowed IP"));
    }
    for ip in ips {
        parse_cidr(ip).map_err(|_| CoreError::validation(format!("invalid allowed IP {ip:?}")))?;
    }
    Ok(())
}

/// `base`, or `base (n)` for the first n >= 2 not in `taken`.
pub fn unique_name(base: &str, taken: &[String]) -> String {
    if !taken.iter().any(|t| t == base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{base} ({n})"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}
