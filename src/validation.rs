//! Input validation and sanitization
//!
//! Guards the values that end up as arguments of external network commands

use crate::error::{TunError, TunResult};

/// Maximum length for interface names (Linux kernel limit is 15)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Smallest MTU accepted for any route or device
pub const MIN_MTU: i64 = 500;

/// Largest MTU a tunnel device can carry
pub const MAX_MTU: i64 = 65535;

/// Maximum length for command output embedded in errors
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Validate interface name to prevent command injection
///
/// Interface names must be alphanumeric with optional dashes and underscores,
/// and no longer than 15 characters (Linux kernel limit). A trailing `%d`
/// is allowed so the kernel can pick the unit number.
pub fn validate_interface_name(name: &str) -> TunResult<()> {
    if name.is_empty() {
        return Err(TunError::InvalidParameter(
            "Interface name cannot be empty".to_string()
        ));
    }

    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(TunError::InvalidParameter(
            format!("Interface name too long (max {} characters)", MAX_INTERFACE_NAME_LEN)
        ));
    }

    let stem = name.strip_suffix("%d").unwrap_or(name);

    // Only allow alphanumeric, dash, underscore
    for c in stem.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            return Err(TunError::InvalidParameter(
                format!("Invalid interface name '{}': contains invalid character '{}'", name, c)
            ));
        }
    }

    // Don't allow names starting with dash (could be interpreted as option)
    if name.starts_with('-') {
        return Err(TunError::InvalidParameter(
            "Interface name cannot start with dash".to_string()
        ));
    }

    Ok(())
}

/// Validate a device MTU
pub fn validate_mtu(mtu: u32) -> TunResult<()> {
    let mtu = i64::from(mtu);
    if mtu < MIN_MTU {
        return Err(TunError::InvalidParameter(
            format!("MTU must be at least {} bytes", MIN_MTU)
        ));
    }
    if mtu > MAX_MTU {
        return Err(TunError::InvalidParameter(
            format!("MTU cannot exceed {} bytes", MAX_MTU)
        ));
    }
    Ok(())
}

/// Trim command output before it is embedded in an error
pub fn sanitize_error_message(stderr: &str) -> String {
    let mut sanitized = stderr.trim().to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str("... (truncated)");
    }

    sanitized
}
