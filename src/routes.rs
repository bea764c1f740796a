//! Route list parsing and validation
//!
//! Two route categories are read from the configuration tree:
//!
//! - `tun.routes`: routes that must stay inside the network attached to the
//!   node certificate. Traffic for them goes through the encrypted overlay.
//! - `tun.unsafe_routes`: routes to destinations outside that network, reached
//!   through an explicit next hop. They must never cover the certificate
//!   network, otherwise overlay traffic would leave the tunnel.
//!
//! Parsing stops at the first bad entry and returns exactly one error. Error
//! messages are part of the operator contract and are kept stable.

use crate::validation::MIN_MTU;
use ipnetwork::Ipv4Network;
use serde::Serialize;
use serde_json::{Map, Value};
use std::net::Ipv4Addr;
use thiserror::Error;

use crate::config::ConfigTree;

const ROUTES_KEY: &str = "tun.routes";
const UNSAFE_ROUTES_KEY: &str = "tun.unsafe_routes";

/// Largest metric the OS route tables accept
pub const MAX_METRIC: i64 = i32::MAX as i64;

/// A validated route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    /// Destination, host bits cleared
    pub cidr: Ipv4Network,
    pub mtu: u32,
    pub metric: u32,
    /// Next hop; only set on additional (unsafe) routes
    pub via: Option<Ipv4Addr>,
}

impl Route {
    /// True when the route covers the whole IPv4 space
    pub fn is_default(&self) -> bool {
        self.cidr.prefix() == 0
    }
}

/// Configuration errors raised while reading a route list
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("{key} is not an array")]
    NotAnArray { key: &'static str },

    #[error("entry {index} in {key} is invalid")]
    InvalidEntry { key: &'static str, index: usize },

    #[error("entry {index}.{field} in {key} is not present")]
    NotPresent { key: &'static str, index: usize, field: &'static str },

    #[error("entry {index}.{field} in {key} is not a string: found {found}")]
    NotAString { key: &'static str, index: usize, field: &'static str, found: &'static str },

    #[error("entry {index}.{field} in {key} is not an integer: {reason}")]
    NotAnInteger { key: &'static str, index: usize, field: &'static str, reason: String },

    #[error("entry {index}.{field} in {key} is not in range (0-{max}) : {value}")]
    OutOfRange { key: &'static str, index: usize, field: &'static str, max: i64, value: i128 },

    #[error("entry {index}.mtu in {key} is below 500: {mtu}")]
    MtuTooLow { key: &'static str, index: usize, mtu: i64 },

    #[error("entry {index}.{field} in {key} failed to parse: {reason}")]
    CidrParse { key: &'static str, index: usize, field: &'static str, reason: CidrParseError },

    #[error("entry {index}.{field} in {key} failed to parse address: {value}")]
    AddressParse { key: &'static str, index: usize, field: &'static str, value: String },

    #[error("entry {index}.route in {key} is not contained within the network attached to the certificate; route: {route}, network: {network}")]
    NotContained { key: &'static str, index: usize, route: Ipv4Network, network: Ipv4Network },

    #[error("entry {index}.route in {key} is contained within the network attached to the certificate; route: {route}, network: {network}")]
    Contained { key: &'static str, index: usize, route: Ipv4Network, network: Ipv4Network },
}

/// A CIDR string that could not be read
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid CIDR address: {0}")]
pub struct CidrParseError(pub String);

/// Parse `addr/len` into a network with the host bits cleared.
///
/// A bare address without a prefix length is rejected, as are IPv6 networks.
pub fn parse_cidr(s: &str) -> Result<Ipv4Network, CidrParseError> {
    let err = || CidrParseError(s.to_string());

    let (addr, prefix) = s.split_once('/').ok_or_else(err)?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err());
    }

    let addr: Ipv4Addr = addr.parse().map_err(|_| err())?;
    let prefix: u8 = prefix.parse().map_err(|_| err())?;
    let network = Ipv4Network::new(addr, prefix).map_err(|_| err())?;

    Ipv4Network::new(network.network(), prefix).map_err(|_| err())
}

/// Whether every address of `inner` lies inside `outer`
pub fn ip_within(outer: &Ipv4Network, inner: &Ipv4Network) -> bool {
    outer.contains(inner.network()) && outer.contains(inner.broadcast())
}

/// Read and validate `tun.routes`.
///
/// Every entry needs `mtu` and `route`, and the route must sit inside `network`.
pub fn parse_routes(config: &ConfigTree, network: &Ipv4Network) -> Result<Vec<Route>, RouteError> {
    let key = ROUTES_KEY;
    let Some(entries) = route_entries(config, key)? else {
        return Ok(Vec::new());
    };
    let network = masked(network);

    entries
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            let entry = Entry::new(key, i + 1, raw)?;

            let mtu = entry.mtu(None)?;
            let cidr = entry.route()?;

            if !ip_within(&network, &cidr) {
                return Err(RouteError::NotContained { key, index: entry.index, route: cidr, network });
            }

            Ok(Route { cidr, mtu, metric: 0, via: None })
        })
        .collect()
}

/// Read and validate `tun.unsafe_routes`.
///
/// Entries need `via` and `route`; `mtu` falls back to `default_mtu` and
/// `metric` to 0. The route must not be contained in `network`.
pub fn parse_unsafe_routes(
    config: &ConfigTree,
    network: &Ipv4Network,
    default_mtu: u32,
) -> Result<Vec<Route>, RouteError> {
    let key = UNSAFE_ROUTES_KEY;
    let Some(entries) = route_entries(config, key)? else {
        return Ok(Vec::new());
    };
    let network = masked(network);

    entries
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            let entry = Entry::new(key, i + 1, raw)?;

            let via = entry.via()?;
            let mtu = entry.mtu(Some(default_mtu))?;
            let metric = entry.metric()?;
            let cidr = entry.route()?;

            if ip_within(&network, &cidr) {
                return Err(RouteError::Contained { key, index: entry.index, route: cidr, network });
            }

            Ok(Route { cidr, mtu, metric, via: Some(via) })
        })
        .collect()
}

fn route_entries<'a>(config: &'a ConfigTree, key: &'static str) -> Result<Option<&'a Vec<Value>>, RouteError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(entries)) => Ok(Some(entries)),
        Some(_) => Err(RouteError::NotAnArray { key }),
    }
}

fn masked(network: &Ipv4Network) -> Ipv4Network {
    Ipv4Network::new(network.network(), network.prefix()).unwrap_or(*network)
}

/// Name used in errors for the kind of value found in the tree
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

/// Text form of a scalar the way an operator would have typed it
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One mapping of a route list, with its 1-based position
struct Entry<'a> {
    key: &'static str,
    index: usize,
    fields: &'a Map<String, Value>,
}

impl<'a> Entry<'a> {
    fn new(key: &'static str, index: usize, raw: &'a Value) -> Result<Self, RouteError> {
        match raw {
            Value::Object(fields) => Ok(Self { key, index, fields }),
            _ => Err(RouteError::InvalidEntry { key, index }),
        }
    }

    fn required(&self, field: &'static str) -> Result<&'a Value, RouteError> {
        self.fields
            .get(field)
            .ok_or(RouteError::NotPresent { key: self.key, index: self.index, field })
    }

    /// `mtu` as an integer or a string holding one. `default` makes it optional.
    fn mtu(&self, default: Option<u32>) -> Result<u32, RouteError> {
        let mtu = match (self.fields.get("mtu"), default) {
            (Some(raw), _) => self.integer("mtu", raw)?,
            (None, Some(default)) => i64::from(default),
            (None, None) => return Err(RouteError::NotPresent { key: self.key, index: self.index, field: "mtu" }),
        };

        if mtu < MIN_MTU {
            return Err(RouteError::MtuTooLow { key: self.key, index: self.index, mtu });
        }

        u32::try_from(mtu).map_err(|e| RouteError::NotAnInteger {
            key: self.key,
            index: self.index,
            field: "mtu",
            reason: e.to_string(),
        })
    }

    /// `metric` must be a plain integer, not a string
    fn metric(&self) -> Result<u32, RouteError> {
        let Some(raw) = self.fields.get("metric") else {
            return Ok(0);
        };

        // integers past i64::MAX only fit u64
        let metric = raw
            .as_i64()
            .map(i128::from)
            .or_else(|| raw.as_u64().map(i128::from))
            .ok_or_else(|| RouteError::NotAnInteger {
                key: self.key,
                index: self.index,
                field: "metric",
                reason: format!("found {}", type_name(raw)),
            })?;

        if !(0..=i128::from(MAX_METRIC)).contains(&metric) {
            return Err(RouteError::OutOfRange {
                key: self.key,
                index: self.index,
                field: "metric",
                max: MAX_METRIC,
                value: metric,
            });
        }

        Ok(metric as u32)
    }

    fn via(&self) -> Result<Ipv4Addr, RouteError> {
        let raw = self.required("via")?;
        let Value::String(via) = raw else {
            return Err(RouteError::NotAString {
                key: self.key,
                index: self.index,
                field: "via",
                found: type_name(raw),
            });
        };

        via.parse().map_err(|_| RouteError::AddressParse {
            key: self.key,
            index: self.index,
            field: "via",
            value: via.clone(),
        })
    }

    fn route(&self) -> Result<Ipv4Network, RouteError> {
        let raw = self.required("route")?;
        parse_cidr(&render(raw)).map_err(|reason| RouteError::CidrParse {
            key: self.key,
            index: self.index,
            field: "route",
            reason,
        })
    }

    fn integer(&self, field: &'static str, raw: &Value) -> Result<i64, RouteError> {
        if let Some(n) = raw.as_i64() {
            return Ok(n);
        }

        render(raw).trim().parse::<i64>().map_err(|e| RouteError::NotAnInteger {
            key: self.key,
            index: self.index,
            field,
            reason: e.to_string(),
        })
    }
}
