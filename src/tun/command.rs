//! External network configuration commands
//!
//! The legacy backend configures its device by running the platform's network
//! tools. [`CommandDialect`] builds the argument lists; [`CommandRunner`]
//! executes them so activation can be tested without touching the host.

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::fmt;
use std::io;
use tokio::process::Command;
use tracing::debug;

use crate::error::{TunError, TunResult};
use crate::routes::Route;
use crate::validation;

const NETSH: &str = r"C:\Windows\System32\netsh.exe";
const ROUTE_EXE: &str = r"C:\Windows\System32\route.exe";
const IP: &str = "ip";

/// One external program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl PlatformCommand {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Program name without directory or `.exe` suffix
    pub fn program_name(&self) -> &str {
        let base = self.program.rsplit(['\\', '/']).next().unwrap_or(&self.program);
        base.strip_suffix(".exe").unwrap_or(base)
    }
}

impl fmt::Display for PlatformCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Executes platform commands and answers interface index lookups
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion; a non-zero exit is an error
    async fn run(&self, command: &PlatformCommand) -> TunResult<()>;

    /// OS interface index for a device name
    fn interface_index(&self, name: &str) -> io::Result<u32>;
}

/// Runs commands on the host with `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, command: &PlatformCommand) -> TunResult<()> {
        let cmd_str = command.to_string();
        debug!("Running {}", cmd_str);

        let output = Command::new(&command.program)
            .args(&command.args)
            .output()
            .await
            .map_err(|e| TunError::CommandFailed {
                cmd: cmd_str.clone(),
                code: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TunError::CommandFailed {
                cmd: cmd_str,
                code: output.status.code(),
                stderr: validation::sanitize_error_message(&stderr),
            });
        }

        Ok(())
    }

    fn interface_index(&self, name: &str) -> io::Result<u32> {
        interface_index(name)
    }
}

#[cfg(unix)]
fn interface_index(name: &str) -> io::Result<u32> {
    use std::ffi::CString;

    let c_name = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name contains NUL"))?;

    // SAFETY: c_name is a valid NUL-terminated string for the duration of the call
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(index)
}

#[cfg(not(unix))]
fn interface_index(name: &str) -> io::Result<u32> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("no interface index lookup for {} on this platform", name),
    ))
}

/// Syntax of the host's network tools
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandDialect {
    /// `netsh.exe` and `route.exe`
    Netsh,
    /// `ip` from iproute2
    Iproute2,
}

impl CommandDialect {
    /// The dialect the current platform speaks
    pub fn for_platform() -> Self {
        if cfg!(windows) {
            CommandDialect::Netsh
        } else {
            CommandDialect::Iproute2
        }
    }

    /// Reject device names the tools would misread. netsh quotes nothing we
    /// pass, so only iproute2 names are checked.
    pub fn check_device_name(&self, name: &str) -> TunResult<()> {
        match self {
            CommandDialect::Netsh => Ok(()),
            CommandDialect::Iproute2 => validation::validate_interface_name(name),
        }
    }

    /// Static IPv4 address with the prefix mask and no gateway
    pub fn set_address(&self, device: &str, cidr: &Ipv4Network) -> PlatformCommand {
        match self {
            CommandDialect::Netsh => PlatformCommand::new(
                NETSH,
                [
                    "interface".to_string(),
                    "ipv4".to_string(),
                    "set".to_string(),
                    "address".to_string(),
                    format!("name={}", device),
                    "source=static".to_string(),
                    format!("addr={}", cidr.ip()),
                    format!("mask={}", cidr.mask()),
                    "gateway=none".to_string(),
                ],
            ),
            CommandDialect::Iproute2 => PlatformCommand::new(
                IP,
                [
                    "addr".to_string(),
                    "replace".to_string(),
                    format!("{}/{}", cidr.ip(), cidr.prefix()),
                    "dev".to_string(),
                    device.to_string(),
                ],
            ),
        }
    }

    /// Interface MTU. iproute2 also applies the queue length and brings the link up.
    pub fn set_mtu(&self, device: &str, mtu: u32, tx_queue_len: u32) -> PlatformCommand {
        match self {
            CommandDialect::Netsh => PlatformCommand::new(
                NETSH,
                [
                    "interface".to_string(),
                    "ipv4".to_string(),
                    "set".to_string(),
                    "interface".to_string(),
                    device.to_string(),
                    format!("mtu={}", mtu),
                ],
            ),
            CommandDialect::Iproute2 => PlatformCommand::new(
                IP,
                [
                    "link".to_string(),
                    "set".to_string(),
                    "dev".to_string(),
                    device.to_string(),
                    "mtu".to_string(),
                    mtu.to_string(),
                    "txqueuelen".to_string(),
                    tx_queue_len.to_string(),
                    "up".to_string(),
                ],
            ),
        }
    }

    /// Route through the device towards the route's next hop
    pub fn add_route(&self, device: &str, if_index: u32, route: &Route) -> TunResult<PlatformCommand> {
        let via = route.via.ok_or_else(|| {
            TunError::InvalidParameter(format!("route {} has no next hop", route.cidr))
        })?;

        let command = match self {
            CommandDialect::Netsh => PlatformCommand::new(
                ROUTE_EXE,
                [
                    "add".to_string(),
                    route.cidr.to_string(),
                    via.to_string(),
                    "IF".to_string(),
                    if_index.to_string(),
                    "METRIC".to_string(),
                    route.metric.to_string(),
                ],
            ),
            CommandDialect::Iproute2 => PlatformCommand::new(
                IP,
                [
                    "route".to_string(),
                    "add".to_string(),
                    route.cidr.to_string(),
                    "via".to_string(),
                    via.to_string(),
                    "dev".to_string(),
                    device.to_string(),
                    "metric".to_string(),
                    route.metric.to_string(),
                ],
            ),
        };
        Ok(command)
    }
}
