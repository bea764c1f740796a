//! Error types for meshtun

use crate::routes::RouteError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Command execution failed
    #[error("Command '{cmd}' failed{}: {stderr}", exit_code_suffix(.code))]
    CommandFailed { cmd: String, code: Option<i32>, stderr: String },

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Route list rejected by the parser
    #[error(transparent)]
    Routes(#[from] RouteError),

    /// Not supported on this platform
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Capability the backend family does not provide
    #[error("{0}")]
    NotImplemented(String),

    /// rtnetlink request failed
    #[error("netlink: {0}")]
    Netlink(String),

    /// D-Bus call failed
    #[error("D-Bus: {0}")]
    Dbus(String),

    /// The packet driver could not create the device
    #[error("Activate failed: {0}")]
    DriverOpen(#[source] io::Error),

    /// An external configuration command failed during activation
    #[error("failed to run '{program}' to {step}: {source}")]
    ConfigCommand {
        program: String,
        step: &'static str,
        #[source]
        source: Box<TunError>,
    },

    /// The OS did not report an index for the device
    #[error("failed to find interface named {name}: {source}")]
    InterfaceLookup {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A route-add command failed
    #[error("failed to add the unsafe_route {cidr}: {source}")]
    RouteInstall {
        cidr: String,
        #[source]
        source: Box<TunError>,
    },

    /// A native table operation failed
    #[error("failed to {step}: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<TunError>,
    },
}

impl TunError {
    /// Wrap `self` with the name of the activation step that produced it.
    pub fn during(self, step: &'static str) -> Self {
        TunError::Step { step, source: Box::new(self) }
    }
}

impl From<serde_json::Error> for TunError {
    fn from(error: serde_json::Error) -> Self {
        TunError::Config(error.to_string())
    }
}

#[cfg(target_os = "linux")]
impl From<rtnetlink::Error> for TunError {
    fn from(error: rtnetlink::Error) -> Self {
        TunError::Netlink(error.to_string())
    }
}

#[cfg(target_os = "linux")]
impl From<zbus::Error> for TunError {
    fn from(error: zbus::Error) -> Self {
        TunError::Dbus(error.to_string())
    }
}

pub type TunResult<T> = Result<T, TunError>;

fn exit_code_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with code {}", code),
        None => String::new(),
    }
}
