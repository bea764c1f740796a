//! Linux implementations of the tunnel drivers and the interface table
//!
//! Both backends open their packet device through `tun-tap`. The native
//! backend additionally stamps its [`DeviceId`] on the link alias
//! (`IFLA_IFALIAS`) and programs addresses and routes over rtnetlink.

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnetwork::Ipv4Network;
use netlink_packet_route::address::AddressMessage;
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::route::{RouteAttribute, RouteHeader, RouteMessage};
use netlink_packet_route::AddressFamily;
use rtnetlink::{Handle, LinkUnspec, RouteMessageBuilder};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info};
use tun_tap::{Iface, Mode};

use super::command::{CommandDialect, SystemCommandRunner};
use super::legacy::{LegacyTun, UserModeDriver};
use super::native::{InterfaceTable, IpInterface, KernelDevice, KernelDriver, NativeTun, RouteData};
use super::{DeviceConfig, PacketDevice, VirtualInterface};
use crate::device_id::DeviceId;
use crate::error::{TunError, TunResult};

const RESOLVED_DESTINATION: &str = "org.freedesktop.resolve1";
const RESOLVED_PATH: &str = "/org/freedesktop/resolve1";
const RESOLVED_MANAGER: &str = "org.freedesktop.resolve1.Manager";

/// Legacy backend on the host: tun-tap device plus iproute2 commands
pub fn legacy_interface(config: DeviceConfig) -> TunResult<Box<dyn VirtualInterface>> {
    Ok(Box::new(LegacyTun::new(
        config,
        Box::new(TunTapDriver),
        SystemCommandRunner::new(),
        CommandDialect::for_platform(),
    )))
}

/// Native backend on the host: creates the kernel device right away
pub async fn native_interface(config: DeviceConfig) -> TunResult<Box<dyn VirtualInterface>> {
    let table = NetlinkTable::connect()?;
    let driver = TunTapKernelDriver::new(table.handle().clone());
    let tun = NativeTun::new(config, &driver, table).await?;
    Ok(Box::new(tun))
}

/// A TUN device without packet information headers
pub struct TunTapDevice {
    iface: Iface,
}

impl PacketDevice for TunTapDevice {
    fn name(&self) -> &str {
        self.iface.name()
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.iface.recv(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.iface.send(buf)
    }
}

/// User-mode driver backed by `/dev/net/tun`
#[derive(Debug, Default, Clone, Copy)]
pub struct TunTapDriver;

impl UserModeDriver for TunTapDriver {
    fn create(&self, requested_name: &str) -> io::Result<Box<dyn PacketDevice>> {
        let iface = Iface::without_packet_info(requested_name, Mode::Tun)?;
        debug!("Opened tun device {} (requested {})", iface.name(), requested_name);
        Ok(Box::new(TunTapDevice { iface }))
    }
}

/// A TUN device known by interface index
pub struct KernelTunDevice {
    inner: TunTapDevice,
    if_index: u32,
}

impl PacketDevice for KernelTunDevice {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.recv(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.send(buf)
    }
}

impl KernelDevice for KernelTunDevice {
    fn if_index(&self) -> u32 {
        self.if_index
    }
}

/// Kernel driver that binds each device to its identity through the link alias
pub struct TunTapKernelDriver {
    handle: Handle,
}

impl TunTapKernelDriver {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Delete links that still carry `id` in their alias
    async fn remove_stale(&self, id: &DeviceId) -> TunResult<()> {
        let alias = id.to_string();
        let mut stale = Vec::new();

        let mut links = self.handle.link().get().execute();
        while let Some(link) = links.try_next().await? {
            if link_alias(&link) == Some(alias.as_str()) {
                stale.push((link.header.index, link_name(&link).unwrap_or_default().to_string()));
            }
        }

        for (index, name) in stale {
            info!("Removing stale device {} (index {}) with identity {}", name, index, alias);
            self.handle.link().del(index).execute().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl KernelDriver for TunTapKernelDriver {
    async fn create(&self, name: &str, id: DeviceId, mtu: u32) -> TunResult<Box<dyn KernelDevice>> {
        self.remove_stale(&id).await?;

        let iface = Iface::without_packet_info(name, Mode::Tun)?;
        let if_index = link_index(iface.name())?;

        let mut message = LinkUnspec::new_with_index(if_index).mtu(mtu).up().build();
        message.attributes.push(LinkAttribute::IfAlias(id.to_string()));
        self.handle.link().set(message).execute().await?;

        info!("Created kernel device {} (index {}) with identity {}", iface.name(), if_index, id);
        Ok(Box::new(KernelTunDevice {
            inner: TunTapDevice { iface },
            if_index,
        }))
    }
}

/// Interface and route tables over rtnetlink, DNS through systemd-resolved
pub struct NetlinkTable {
    handle: Handle,
}

impl NetlinkTable {
    /// Open a netlink connection and drive it on the current tokio runtime
    pub fn connect() -> TunResult<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| TunError::Netlink(format!("Failed to create rtnetlink connection: {}", e)))?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn link(&self, if_index: u32) -> TunResult<LinkMessage> {
        self.handle
            .link()
            .get()
            .match_index(if_index)
            .execute()
            .try_next()
            .await?
            .ok_or_else(|| TunError::Netlink(format!("no link with index {}", if_index)))
    }

    async fn ipv4_addresses(&self, if_index: u32) -> TunResult<Vec<AddressMessage>> {
        let messages: Vec<AddressMessage> = self
            .handle
            .address()
            .get()
            .set_link_index_filter(if_index)
            .execute()
            .try_collect()
            .await?;
        Ok(messages
            .into_iter()
            .filter(|m| m.header.family == AddressFamily::Inet)
            .collect())
    }

    async fn ipv4_routes(&self, if_index: u32) -> TunResult<Vec<RouteMessage>> {
        let messages: Vec<RouteMessage> = self
            .handle
            .route()
            .get(RouteMessageBuilder::<Ipv4Addr>::new().build())
            .execute()
            .try_collect()
            .await?;
        Ok(messages
            .into_iter()
            .filter(|m| m.header.table == RouteHeader::RT_TABLE_MAIN)
            .filter(|m| m.attributes.iter().any(|a| matches!(a, RouteAttribute::Oif(i) if *i == if_index)))
            .collect())
    }
}

#[async_trait]
impl InterfaceTable for NetlinkTable {
    async fn set_ip_addresses(&self, if_index: u32, addresses: &[Ipv4Network]) -> TunResult<()> {
        self.flush_ip_addresses(if_index).await?;
        for address in addresses {
            debug!("Adding address {} to index {}", address, if_index);
            self.handle
                .address()
                .add(if_index, IpAddr::V4(address.ip()), address.prefix())
                .execute()
                .await?;
        }
        Ok(())
    }

    async fn add_routes(&self, if_index: u32, routes: &[RouteData]) -> TunResult<()> {
        for route in routes {
            debug!(
                "Adding route {} via {} metric {} on index {}",
                route.destination, route.next_hop, route.metric, if_index
            );
            let message = RouteMessageBuilder::<Ipv4Addr>::new()
                .destination_prefix(route.destination.network(), route.destination.prefix())
                .gateway(route.next_hop)
                .output_interface(if_index)
                .priority(route.metric)
                .build();
            self.handle.route().add(message).execute().await?;
        }
        Ok(())
    }

    async fn ip_interface(&self, if_index: u32) -> TunResult<IpInterface> {
        let link = self.link(if_index).await?;
        let mtu = link
            .attributes
            .iter()
            .find_map(|a| match a {
                LinkAttribute::Mtu(mtu) => Some(*mtu),
                _ => None,
            })
            .unwrap_or_default();

        // Linux has no per-interface metric; routes without a priority use 0
        Ok(IpInterface { mtu, use_automatic_metric: true, metric: 0 })
    }

    async fn set_ip_interface(&self, if_index: u32, properties: &IpInterface) -> TunResult<()> {
        debug!("Setting MTU {} on index {}", properties.mtu, if_index);
        let message = LinkUnspec::new_with_index(if_index).mtu(properties.mtu).build();
        self.handle.link().set(message).execute().await?;

        // No per-link metric exists on Linux, so a pinned metric is only
        // logged. Routes added without a priority already sit at metric 0.
        if !properties.use_automatic_metric {
            debug!("Interface metric pinned to {} on index {}", properties.metric, if_index);
        }
        Ok(())
    }

    async fn flush_routes(&self, if_index: u32) -> TunResult<()> {
        for route in self.ipv4_routes(if_index).await? {
            self.handle.route().del(route).execute().await?;
        }
        Ok(())
    }

    async fn flush_ip_addresses(&self, if_index: u32) -> TunResult<()> {
        for address in self.ipv4_addresses(if_index).await? {
            self.handle.address().del(address).execute().await?;
        }
        Ok(())
    }

    async fn flush_dns(&self, if_index: u32) -> TunResult<()> {
        let ifindex = i32::try_from(if_index)
            .map_err(|_| TunError::InvalidParameter(format!("interface index {} out of range", if_index)))?;

        let connection = zbus::Connection::system().await?;
        connection
            .call_method(
                Some(RESOLVED_DESTINATION),
                RESOLVED_PATH,
                Some(RESOLVED_MANAGER),
                "RevertLink",
                &ifindex,
            )
            .await?;
        Ok(())
    }
}

fn link_index(name: &str) -> TunResult<u32> {
    use std::ffi::CString;

    let c_name = CString::new(name)
        .map_err(|_| TunError::InvalidParameter(format!("interface name {:?} contains NUL", name)))?;

    // SAFETY: c_name is a valid NUL-terminated string for the duration of the call
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(TunError::InterfaceLookup {
            name: name.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(index)
}

fn link_alias(link: &LinkMessage) -> Option<&str> {
    link.attributes.iter().find_map(|a| match a {
        LinkAttribute::IfAlias(alias) => Some(alias.as_str()),
        _ => None,
    })
}

fn link_name(link: &LinkMessage) -> Option<&str> {
    link.attributes.iter().find_map(|a| match a {
        LinkAttribute::IfName(name) => Some(name.as_str()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(index: u32, name: &str, alias: Option<&str>) -> LinkMessage {
        let mut message = LinkMessage::default();
        message.header.index = index;
        message.attributes.push(LinkAttribute::IfName(name.to_string()));
        if let Some(alias) = alias {
            message.attributes.push(LinkAttribute::IfAlias(alias.to_string()));
        }
        message
    }

    #[test]
    fn test_link_alias_lookup() {
        let id = DeviceId::from_device_name("meshtun1").to_string();
        let stamped = link(7, "meshtun1", Some(&id));
        let plain = link(2, "eth0", None);

        assert_eq!(link_alias(&stamped), Some(id.as_str()));
        assert_eq!(link_name(&stamped), Some("meshtun1"));
        assert_eq!(link_alias(&plain), None);
    }

    #[test]
    fn test_link_index_of_loopback() {
        assert!(link_index("lo").unwrap() > 0);
        let err = link_index("meshtun-none").unwrap_err();
        assert!(err.to_string().starts_with("failed to find interface named meshtun-none"));
    }
}
