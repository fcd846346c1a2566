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

//! Kernel WireGuard over generic netlink, addresses and links over rtnetlink.

use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use rtnetlink::packet_route::address::{AddressAttribute, AddressMessage};
use tracing::{debug, info};
use wireguard_uapi::{DeviceInterface, RouteSocket, WgSocket, get, set};
use wiresmith_types::BackendKind;
use wiresmith_types::interface::{
    DeviceStats, ForeignPeer, ForeignServer, InterfaceConfig, InterfaceStats, ObservedInterface,
    ObservedPeer, PeerConfig, PeerStats,
};

use super::wg::split_list;
use super::{
    Capabilities, Driver, DriverError, PeerPlan, decode_key, encode_key, parse_address,
    parse_cidr, plan_peer_sync,
};

fn iface_err(e: impl Display) -> DriverError {
    DriverError::Interface(e.to_string())
}

fn route_socket() -> Result<RouteSocket, DriverError> {
    RouteSocket::connect().map_err(iface_err)
}

fn wg_socket() -> Result<WgSocket, DriverError> {
    WgSocket::connect().map_err(iface_err)
}

fn device_exists(name: &str) -> Result<bool, DriverError> {
    let existing = route_socket()?.list_device_names().map_err(iface_err)?;
    Ok(existing.iter().any(|n| n == name))
}

fn get_device(name: &str) -> Result<get::Device, DriverError> {
    if !device_exists(name)? {
        return Err(DriverError::InterfaceNotFound(name.to_string()));
    }
    wg_socket()?
        .get_device(DeviceInterface::from_name(name))
        .map_err(iface_err)
}

fn observed_peer(peer: &get::Peer) -> ObservedPeer {
    let last_handshake = (!peer.last_handshake_time.is_zero())
        .then(|| DateTime::<Utc>::from(UNIX_EPOCH + peer.last_handshake_time));
    let endpoint = peer.endpoint.map(|e| e.to_string());
    ObservedPeer {
        public_key: encode_key(&peer.public_key),
        preshared_key: (peer.preshared_key != [0u8; 32]).then(|| encode_key(&peer.preshared_key)),
        endpoint: endpoint.clone(),
        allowed_ips: peer
            .allowed_ips
            .iter()
            .map(|a| format!("{}/{}", a.ipaddr, a.cidr_mask))
            .collect(),
        persistent_keepalive: peer.persistent_keepalive_interval,
        stats: PeerStats {
            endpoint,
            last_handshake,
            rx_bytes: peer.rx_bytes,
            tx_bytes: peer.tx_bytes,
            protocol_version: Some(peer.protocol_version),
        },
    }
}

/// Owned peer data the borrowed `set::Peer` builders point into.
struct PeerOwned {
    pub_key: [u8; 32],
    preshared_key: [u8; 32],
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<(IpAddr, u8)>,
    persistent_keepalive: u16,
}

async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr, DriverError> {
    if let Ok(addr) = endpoint.parse() {
        return Ok(addr);
    }
    tokio::net::lookup_host(endpoint)
        .await?
        .next()
        .ok_or_else(|| DriverError::Parse(format!("endpoint {endpoint} did not resolve")))
}

async fn owned_peer(peer: &PeerConfig) -> Result<PeerOwned, DriverError> {
    let endpoint = match peer.endpoint.as_deref() {
        Some(ep) => Some(resolve_endpoint(ep).await?),
        None => None,
    };
    Ok(PeerOwned {
        pub_key: decode_key(&peer.public_key)?,
        preshared_key: match peer.preshared_key.as_deref() {
            Some(psk) => decode_key(psk)?,
            None => [0u8; 32],
        },
        endpoint,
        allowed_ips: peer
            .allowed_ips
            .iter()
            .map(|ip| parse_cidr(ip))
            .collect::<Result<_, _>>()?,
        persistent_keepalive: peer.persistent_keepalive,
    })
}

fn apply_plan(name: &str, plan: &PeerPlan, owned: &[PeerOwned]) -> Result<(), DriverError> {
    let removed: Vec<[u8; 32]> = plan
        .remove
        .iter()
        .map(|k| decode_key(k))
        .collect::<Result<_, _>>()?;

    let mut peers: Vec<set::Peer<'_>> = removed
        .iter()
        .map(|key| set::Peer::from_public_key(key).flags(vec![set::WgPeerF::RemoveMe]))
        .collect();

    for p in owned {
        let mut peer = set::Peer::from_public_key(&p.pub_key)
            .flags(vec![set::WgPeerF::ReplaceAllowedIps])
            .preshared_key(&p.preshared_key)
            .persistent_keepalive_interval(p.persistent_keepalive);

        if let Some(ref ep) = p.endpoint {
            peer = peer.endpoint(ep);
        }

        let allowed: Vec<set::AllowedIp<'_>> = p
            .allowed_ips
            .iter()
            .map(|(addr, cidr)| {
                let mut aip = set::AllowedIp::from_ipaddr(addr);
                aip.cidr_mask = Some(*cidr);
                aip
            })
            .collect();
        peers.push(peer.allowed_ips(allowed));
    }

    let dev = set::Device::from_ifname(name).peers(peers);
    wg_socket()?.set_device(dev).map_err(iface_err)?;
    Ok(())
}

/// Resolve interface name to its index via rtnetlink.
async fn get_link_index(handle: &rtnetlink::Handle, name: &str) -> Result<u32, DriverError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    let link = links
        .try_next()
        .await
        .map_err(iface_err)?
        .ok_or_else(|| DriverError::InterfaceNotFound(name.to_string()))?;
    Ok(link.header.index)
}

/// Port to program on the device. Zero asks the kernel for a random port and
/// clears one left over from an earlier configuration.
fn requested_port(config: &InterfaceConfig) -> u16 {
    config.listen_port.unwrap_or(0)
}

fn rtnl() -> Result<rtnetlink::Handle, DriverError> {
    let (conn, handle, _) = rtnetlink::new_connection()?;
    tokio::spawn(conn);
    Ok(handle)
}

fn message_address(msg: &AddressMessage) -> Option<(IpAddr, u8)> {
    msg.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Address(addr) => Some((*addr, msg.header.prefix_len)),
        _ => None,
    })
}

async fn link_addresses(
    handle: &rtnetlink::Handle,
    index: u32,
) -> Result<Vec<AddressMessage>, DriverError> {
    handle
        .address()
        .get()
        .set_link_index_filter(index)
        .execute()
        .try_collect()
        .await
        .map_err(iface_err)
}

/// Make the addresses on the link exactly `wanted`, leaving matching ones in place.
async fn sync_addresses(name: &str, wanted: &[(IpAddr, u8)]) -> Result<(), DriverError> {
    let handle = rtnl()?;
    let index = get_link_index(&handle, name).await?;
    let existing = link_addresses(&handle, index).await?;

    let mut present = Vec::new();
    for msg in existing {
        match message_address(&msg) {
            Some(addr) if wanted.contains(&addr) => present.push(addr),
            _ => {
                handle.address().del(msg).execute().await.map_err(iface_err)?;
            }
        }
    }

    for (addr, prefix) in wanted.iter().filter(|a| !present.contains(a)) {
        handle
            .address()
            .add(index, *addr, *prefix)
            .execute()
            .await
            .map_err(iface_err)?;
        info!(interface = name, %addr, prefix, "assigned address via netlink");
    }
    Ok(())
}

async fn set_link_up(name: &str, mtu: Option<u16>) -> Result<(), DriverError> {
    let handle = rtnl()?;
    let index = get_link_index(&handle, name).await?;

    let mut builder = rtnetlink::LinkUnspec::new_with_index(index).up();
    if let Some(mtu) = mtu {
        builder = builder.mtu(u32::from(mtu));
    }
    handle
        .link()
        .set(builder.build())
        .execute()
        .await
        .map_err(iface_err)?;

    debug!(interface = name, ?mtu, "set link up via netlink");
    Ok(())
}

pub struct LinuxDriver;

impl LinuxDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinuxDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for LinuxDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Linux
    }

    async fn capabilities(&self) -> Capabilities {
        Capabilities {
            supported: WgSocket::connect().is_ok(),
        }
    }

    async fn probe(&self) -> Result<(), DriverError> {
        route_socket()?;
        wg_socket().map_err(|e| DriverError::Unavailable(e.to_string()))?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(interface = %config.name))]
    async fn up(&self, config: &InterfaceConfig) -> Result<ObservedInterface, DriverError> {
        let addresses: Vec<(IpAddr, u8)> = split_list(&config.address)
            .iter()
            .map(|a| parse_address(a))
            .collect::<Result<_, _>>()?;
        let private_key = decode_key(&config.private_key)?;

        if !device_exists(&config.name)? {
            info!("creating wireguard interface");
            route_socket()?.add_device(&config.name).map_err(iface_err)?;
        }

        let dev = set::Device::from_ifname(&config.name)
            .private_key(&private_key)
            .fwmark(config.firewall_mark.unwrap_or(0))
            .listen_port(requested_port(config));
        wg_socket()?.set_device(dev).map_err(iface_err)?;

        sync_addresses(&config.name, &addresses).await?;
        set_link_up(&config.name, config.mtu).await?;

        let device = get_device(&config.name)?;
        info!(listen_port = device.listen_port, "interface up");
        Ok(ObservedInterface {
            name: device.ifname,
            up: true,
            public_key: device.public_key.as_ref().map(encode_key),
            listen_port: Some(device.listen_port),
        })
    }

    async fn down(&self, name: &str) -> Result<(), DriverError> {
        if device_exists(name)? {
            info!(interface = name, "removing interface");
            route_socket()?.del_device(name).map_err(iface_err)?;
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(interface = name, desired = desired.len()))]
    async fn sync_peers(
        &self,
        name: &str,
        desired: &[PeerConfig],
    ) -> Result<Vec<ObservedPeer>, DriverError> {
        let current: Vec<ObservedPeer> = get_device(name)?.peers.iter().map(observed_peer).collect();
        let plan = plan_peer_sync(&current, desired);
        if plan.is_empty() {
            return Ok(current);
        }

        let mut owned = Vec::with_capacity(plan.add.len() + plan.update.len());
        for peer in plan.add.iter().chain(&plan.update) {
            owned.push(owned_peer(peer).await?);
        }
        apply_plan(name, &plan, &owned)?;
        debug!(
            added = plan.add.len(),
            updated = plan.update.len(),
            removed = plan.remove.len(),
            "applied peer changes"
        );

        Ok(get_device(name)?.peers.iter().map(observed_peer).collect())
    }

    async fn read_stats(&self, name: &str) -> Result<DeviceStats, DriverError> {
        let device = get_device(name)?;
        let peers: Vec<(String, PeerStats)> = device
            .peers
            .iter()
            .map(|p| {
                let observed = observed_peer(p);
                (observed.public_key, observed.stats)
            })
            .collect();
        Ok(DeviceStats {
            interface: InterfaceStats {
                name: device.ifname,
                up: true,
                rx_bytes: peers.iter().map(|(_, s)| s.rx_bytes).sum(),
                tx_bytes: peers.iter().map(|(_, s)| s.tx_bytes).sum(),
            },
            peers,
        })
    }

    async fn discover(&self, known: &[String]) -> Result<Vec<ForeignServer>, DriverError> {
        let names = route_socket()?.list_device_names().map_err(iface_err)?;
        let handle = rtnl()?;
        let mut found = Vec::new();

        for name in names.into_iter().filter(|n| !known.contains(n)) {
            let device = get_device(&name)?;
            let index = get_link_index(&handle, &name).await?;
            let addresses: Vec<String> = link_addresses(&handle, index)
                .await?
                .iter()
                .filter_map(message_address)
                .map(|(addr, prefix)| format!("{addr}/{prefix}"))
                .collect();

            found.push(ForeignServer {
                private_key: device.private_key.as_ref().map(encode_key),
                public_key: device.public_key.as_ref().map(encode_key),
                address: (!addresses.is_empty()).then(|| addresses.join(",")),
                listen_port: Some(device.listen_port).filter(|p| *p != 0),
                mtu: None,
                firewall_mark: Some(device.fwmark).filter(|m| *m != 0),
                dns: Vec::new(),
                up: true,
                peers: device
                    .peers
                    .iter()
                    .map(|p| {
                        let observed = observed_peer(p);
                        ForeignPeer {
                            name: None,
                            config: PeerConfig {
                                public_key: observed.public_key,
                                preshared_key: observed.preshared_key,
                                endpoint: observed.endpoint,
                                allowed_ips: observed.allowed_ips,
                                persistent_keepalive: observed.persistent_keepalive,
                            },
                        }
                    })
                    .collect(),
                name,
            });
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_messages_carry_prefix() {
        let mut msg = AddressMessage::default();
        msg.header.prefix_len = 24;
        msg.attributes
            .push(AddressAttribute::Address("10.0.0.1".parse().unwrap()));
        assert_eq!(
            message_address(&msg),
            Some(("10.0.0.1".parse().unwrap(), 24))
        );
        assert_eq!(message_address(&AddressMessage::default()), None);
    }

    #[test]
    fn dropped_listen_port_resets_to_kernel_choice() {
        let mut config = InterfaceConfig {
            name: "wg0".into(),
            private_key: String::new(),
            address: "10.0.0.1/24".into(),
            listen_port: Some(51820),
            mtu: None,
            firewall_mark: None,
            dns: Vec::new(),
        };
        assert_eq!(requested_port(&config), 51820);

        config.listen_port = None;
        assert_eq!(requested_port(&config), 0);
    }

    #[tokio::test]
    async fn literal_endpoints_skip_resolution() {
        let addr = resolve_endpoint("[2001:db8::1]:51820").await.unwrap();
        assert_eq!(addr.port(), 51820);
    }
}
