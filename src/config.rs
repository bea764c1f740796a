//! Configuration management for meshtun
//!
//! The route parser works on a generic tree so it can report the exact shape
//! of whatever the operator wrote. Typed settings are read out of the same tree.

use crate::error::{TunError, TunResult};
use crate::tun::DriverKind;
use crate::validation;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Parsed configuration tree addressed by dotted keys (`tun.routes`)
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigTree {
    settings: Value,
}

impl ConfigTree {
    /// Wrap an already parsed tree
    pub fn new(settings: Value) -> Self {
        Self { settings }
    }

    /// A tree with no keys
    pub fn empty() -> Self {
        Self::new(Value::Object(Map::new()))
    }

    /// Load a configuration file; `.json` files are read as JSON, everything else as TOML
    pub fn load<P: AsRef<Path>>(path: P) -> TunResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| TunError::Config(format!("Failed to read config {}: {}", path.display(), e)))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    pub fn from_toml_str(content: &str) -> TunResult<Self> {
        toml::from_str::<Value>(content)
            .map(Self::new)
            .map_err(|e| TunError::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn from_json_str(content: &str) -> TunResult<Self> {
        serde_json::from_str::<Value>(content)
            .map(Self::new)
            .map_err(|e| TunError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Look up a dotted key. Returns `None` when any segment is missing.
    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('.')
            .try_fold(&self.settings, |node, segment| node.as_object()?.get(segment))
    }

    /// Set a dotted key, creating intermediate maps and replacing non-map nodes on the way
    pub fn set(&mut self, key: &str, value: Value) {
        let mut segments: Vec<&str> = key.split('.').collect();
        let Some(last) = segments.pop() else {
            return;
        };

        let mut node = &mut self.settings;
        for segment in segments {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let Some(map) = node.as_object_mut() else {
                return;
            };
            node = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }

        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        if let Some(map) = node.as_object_mut() {
            map.insert(last.to_string(), value);
        }
    }
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self::empty()
    }
}

/// Device settings read from the `tun` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunSettings {
    /// Requested device name
    #[serde(default = "default_dev")]
    pub dev: String,
    /// Device MTU, also the default for additional routes without one
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    /// Transmit queue length hint
    #[serde(default = "default_tx_queue")]
    pub tx_queue: u32,
    /// Which backend to bring the device up with
    #[serde(default)]
    pub driver: DriverKind,
}

/// MTU used for the device and for additional routes that do not set one
pub const DEFAULT_MTU: u32 = 1300;

fn default_dev() -> String {
    "meshtun1".to_string()
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

fn default_tx_queue() -> u32 {
    500
}

impl Default for TunSettings {
    fn default() -> Self {
        Self {
            dev: default_dev(),
            mtu: default_mtu(),
            tx_queue: default_tx_queue(),
            driver: DriverKind::default(),
        }
    }
}

impl TunSettings {
    /// Read the `tun` section, falling back to defaults for anything missing
    pub fn from_config(config: &ConfigTree) -> TunResult<Self> {
        let settings = match config.get("tun") {
            None | Some(Value::Null) => Self::default(),
            Some(section) => serde_json::from_value::<Self>(section.clone())
                .map_err(|e| TunError::Config(format!("Failed to parse tun settings: {}", e)))?,
        };

        validation::validate_mtu(settings.mtu)
            .map_err(|e| TunError::Config(format!("tun.mtu: {}", e)))?;

        Ok(settings)
    }
}
