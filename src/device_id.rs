//! Stable device identity for kernel-mode tunnel devices
//!
//! The identifier is derived from the logical device name so a restarted node
//! finds and replaces its own device instead of leaving an orphan behind.

use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Fixed label hashed in front of the device name
pub const DEVICE_ID_LABEL: &str = "Fixed meshtun device identity v1";

/// 128-bit device identifier, stored in RFC 4122 byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Derive the identifier for `name`: the first 16 bytes of
    /// SHA-256(`DEVICE_ID_LABEL` || `name`), in digest order.
    pub fn from_device_name(name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DEVICE_ID_LABEL.as_bytes());
        hasher.update(name.as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}
