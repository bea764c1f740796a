//! meshtun - tunnel device management for mesh overlay nodes
//!
//! Provides:
//! - Validation of the operator's route lists against the certificate network
//! - A virtual interface contract with two backends (legacy user-mode driver
//!   configured by external tools, native kernel device configured over
//!   netlink)
//! - Stable device identities for kernel devices
//!
//! ```no_run
//! use libmeshtun::{config::ConfigTree, routes};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigTree::load("/etc/meshtun/node.toml")?;
//! let network = "10.0.0.1/24".parse()?;
//! let safe = routes::parse_routes(&config, &network)?;
//! let extra = routes::parse_unsafe_routes(&config, &network, 1300)?;
//! # let _ = (safe, extra);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod validation;
pub mod config;
pub mod routes;
pub mod device_id;
pub mod tun;

// Re-export commonly used types
pub use error::{TunError, TunResult};
pub use config::{ConfigTree, TunSettings, DEFAULT_MTU};
pub use routes::{ip_within, parse_cidr, parse_routes, parse_unsafe_routes, Route, RouteError};
pub use device_id::DeviceId;
pub use tun::{create_interface, DeviceConfig, DriverKind, PacketDevice, VirtualInterface};
