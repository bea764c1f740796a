//! Virtual interface contract and backend selection
//!
//! Two driver models satisfy [`VirtualInterface`]:
//!
//! - [`legacy::LegacyTun`]: a user-mode packet driver configured by running
//!   external network tools
//! - [`native::NativeTun`]: a kernel device with a stable identity configured
//!   directly through the interface and route tables
//!
//! [`create_interface`] picks one at runtime.

pub mod command;
pub mod legacy;
pub mod native;

#[cfg(target_os = "linux")]
pub mod linux;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::Path;
use tracing::{debug, info};

use crate::config::TunSettings;
use crate::error::{TunError, TunResult};
use crate::routes::Route;

/// Character device the kernel exposes for TUN/TAP allocation
pub const TUN_DEVICE_NODE: &str = "/dev/net/tun";

/// A configured tunnel device handed to the forwarding loop
///
/// `read` and `write` block on the underlying device. Calling them before
/// `activate` (or after `close`) fails with `io::ErrorKind::NotConnected`.
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Create the OS device and program address, MTU and routes.
    ///
    /// Activation is one-shot. A failing step leaves the earlier ones applied.
    async fn activate(&mut self) -> TunResult<()>;

    /// The node's address and prefix as configured, host bits kept
    fn cidr_net(&self) -> Ipv4Network;

    /// Name the OS assigned to the device; the requested name until activation
    fn device_name(&self) -> &str;

    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Write a full packet, dropping the byte count
    fn write_raw(&self, buf: &[u8]) -> io::Result<()> {
        self.write(buf).map(|_| ())
    }

    /// Release the OS device. Closing a never-activated interface is a no-op.
    async fn close(&mut self) -> TunResult<()>;

    /// Open an extra packet queue on the same device
    fn new_multi_queue_reader(&self) -> TunResult<Box<dyn PacketQueue>>;
}

/// An open packet handle produced by a driver
pub trait PacketDevice: Send + Sync {
    /// Name the OS gave the device
    fn name(&self) -> &str;

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Release the handle
    fn close(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}

/// Additional reader/writer over a multi-queue device
pub trait PacketQueue: io::Read + io::Write + Send {}

/// Everything a backend needs to build a device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    /// Requested device name; the OS may pick another one
    pub name: String,
    /// Node address and prefix from the certificate
    pub cidr: Ipv4Network,
    pub mtu: u32,
    /// Additional routes installed through the device
    pub unsafe_routes: Vec<Route>,
    /// Transmit queue length hint
    pub tx_queue_len: u32,
}

impl DeviceConfig {
    pub fn from_settings(settings: &TunSettings, cidr: Ipv4Network, unsafe_routes: Vec<Route>) -> Self {
        Self {
            name: settings.dev.clone(),
            cidr,
            mtu: settings.mtu,
            unsafe_routes,
            tx_queue_len: settings.tx_queue,
        }
    }
}

/// Which backend brings the device up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Pick from what the host offers
    #[default]
    Auto,
    /// User-mode driver plus external commands
    Legacy,
    /// Kernel driver plus direct table access
    Native,
}

impl DriverKind {
    /// Native when the TUN node and a netlink route socket are usable, legacy
    /// otherwise
    pub fn detect() -> Self {
        if Path::new(TUN_DEVICE_NODE).exists() && netlink_available() {
            DriverKind::Native
        } else {
            DriverKind::Legacy
        }
    }

    /// Replace `Auto` with the detected backend
    pub fn resolve(self) -> Self {
        match self {
            DriverKind::Auto => {
                let detected = Self::detect();
                debug!("Detected {} tunnel driver", detected);
                detected
            }
            other => other,
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverKind::Auto => "auto",
            DriverKind::Legacy => "legacy",
            DriverKind::Native => "native",
        };
        f.write_str(name)
    }
}

#[cfg(target_os = "linux")]
fn netlink_available() -> bool {
    use netlink_sys::{protocols::NETLINK_ROUTE, Socket};

    Socket::new(NETLINK_ROUTE).is_ok()
}

#[cfg(not(target_os = "linux"))]
fn netlink_available() -> bool {
    false
}

/// Build the interface for `kind` on this platform. Nothing is configured
/// until [`VirtualInterface::activate`] runs, except that the native backend
/// creates its kernel device here.
pub async fn create_interface(kind: DriverKind, config: DeviceConfig) -> TunResult<Box<dyn VirtualInterface>> {
    let kind = kind.resolve();
    info!("Creating {} tunnel device {} for {}", kind, config.name, config.cidr);

    #[cfg(target_os = "linux")]
    let interface = match kind {
        DriverKind::Legacy => linux::legacy_interface(config),
        DriverKind::Native => linux::native_interface(config).await,
        DriverKind::Auto => Err(TunError::NotSupported("no tunnel driver detected".to_string())),
    };

    #[cfg(not(target_os = "linux"))]
    let interface = {
        drop(config);
        Err(TunError::NotSupported(format!("no {} tunnel driver for this platform", kind)))
    };

    interface
}

pub(crate) fn not_connected(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, format!("device {} is not active", name))
}
