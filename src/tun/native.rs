//! Native backend: kernel device with a stable identity
//!
//! The device is created when the backend is built and addressed by its
//! interface index from then on. Addresses, routes and interface properties
//! go straight to the OS tables through [`InterfaceTable`].

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::io;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

use super::{not_connected, DeviceConfig, PacketDevice, PacketQueue, VirtualInterface};
use crate::device_id::DeviceId;
use crate::error::{TunError, TunResult};
use crate::routes::Route;

/// One route handed to the table in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteData {
    pub destination: Ipv4Network,
    pub next_hop: Ipv4Addr,
    pub metric: u32,
}

/// Per-interface IPv4 properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpInterface {
    pub mtu: u32,
    /// Let the OS derive the interface metric from link speed
    pub use_automatic_metric: bool,
    pub metric: u32,
}

/// Direct access to the OS interface and route tables
#[async_trait]
pub trait InterfaceTable: Send + Sync {
    /// Replace the interface's IPv4 addresses with `addresses`
    async fn set_ip_addresses(&self, if_index: u32, addresses: &[Ipv4Network]) -> TunResult<()>;

    async fn add_routes(&self, if_index: u32, routes: &[RouteData]) -> TunResult<()>;

    async fn ip_interface(&self, if_index: u32) -> TunResult<IpInterface>;

    async fn set_ip_interface(&self, if_index: u32, properties: &IpInterface) -> TunResult<()>;

    async fn flush_routes(&self, if_index: u32) -> TunResult<()>;

    async fn flush_ip_addresses(&self, if_index: u32) -> TunResult<()>;

    async fn flush_dns(&self, if_index: u32) -> TunResult<()>;
}

/// An open kernel device
pub trait KernelDevice: PacketDevice {
    fn if_index(&self) -> u32;
}

/// Creates kernel devices bound to a device identity
#[async_trait]
pub trait KernelDriver: Send + Sync {
    /// Create the device, replacing one left behind under the same identity
    async fn create(&self, name: &str, id: DeviceId, mtu: u32) -> TunResult<Box<dyn KernelDevice>>;
}

pub struct NativeTun<T: InterfaceTable> {
    device_name: String,
    device_id: DeviceId,
    cidr: Ipv4Network,
    mtu: u32,
    unsafe_routes: Vec<Route>,
    table: T,
    device: Option<Box<dyn KernelDevice>>,
}

impl<T: InterfaceTable> NativeTun<T> {
    /// Derive the identity from `config.name` and create the kernel device
    pub async fn new(config: DeviceConfig, driver: &dyn KernelDriver, table: T) -> TunResult<Self> {
        let device_id = DeviceId::from_device_name(&config.name);
        debug!("Creating kernel device {} with identity {}", config.name, device_id);

        let device = driver
            .create(&config.name, device_id, config.mtu)
            .await
            .map_err(|e| e.during("create TUN device"))?;

        Ok(Self {
            device_name: device.name().to_string(),
            device_id,
            cidr: config.cidr,
            mtu: config.mtu,
            unsafe_routes: config.unsafe_routes,
            table,
            device: Some(device),
        })
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn if_index(&self) -> Option<u32> {
        self.device.as_ref().map(|d| d.if_index())
    }

    fn device(&self) -> io::Result<&dyn KernelDevice> {
        self.device
            .as_deref()
            .ok_or_else(|| not_connected(&self.device_name))
    }

    /// Route batch for the additional routes, plus whether one is a default route
    fn route_batch(&self) -> (Vec<RouteData>, bool) {
        let mut found_default = false;
        let routes = self
            .unsafe_routes
            .iter()
            .filter_map(|route| {
                let next_hop = route.via?;
                found_default |= route.is_default();
                Some(RouteData {
                    destination: route.cidr,
                    next_hop,
                    metric: route.metric,
                })
            })
            .collect();
        (routes, found_default)
    }
}

#[async_trait]
impl<T: InterfaceTable> VirtualInterface for NativeTun<T> {
    async fn activate(&mut self) -> TunResult<()> {
        let if_index = self.device()?.if_index();

        self.table
            .set_ip_addresses(if_index, &[self.cidr])
            .await
            .map_err(|e| e.during("set address"))?;

        let (routes, found_default) = self.route_batch();
        self.table
            .add_routes(if_index, &routes)
            .await
            .map_err(|e| e.during("add routes"))?;

        let mut properties = self
            .table
            .ip_interface(if_index)
            .await
            .map_err(|e| e.during("get ip interface"))?;

        properties.mtu = self.mtu;
        if found_default {
            // keep the tunnel's default route ahead of the physical uplink
            properties.use_automatic_metric = false;
            properties.metric = 0;
        }

        self.table
            .set_ip_interface(if_index, &properties)
            .await
            .map_err(|e| e.during("set ip interface"))?;

        info!(
            "Activated {} (index {}) with {} ({} additional routes)",
            self.device_name,
            if_index,
            self.cidr,
            routes.len()
        );
        Ok(())
    }

    fn cidr_net(&self) -> Ipv4Network {
        self.cidr
    }

    fn device_name(&self) -> &str {
        &self.device_name
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.device()?.recv(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.device()?.send(buf)
    }

    async fn close(&mut self) -> TunResult<()> {
        let Some(device) = self.device.take() else {
            return Ok(());
        };
        let if_index = device.if_index();

        // IPv6 state is never configured, so only IPv4 is flushed
        if let Err(e) = self.table.flush_routes(if_index).await {
            warn!("Failed to flush routes on {}: {}", self.device_name, e);
        }
        if let Err(e) = self.table.flush_ip_addresses(if_index).await {
            warn!("Failed to flush addresses on {}: {}", self.device_name, e);
        }
        if let Err(e) = self.table.flush_dns(if_index).await {
            warn!("Failed to flush DNS on {}: {}", self.device_name, e);
        }

        info!("Closing {}", self.device_name);
        device.close()?;
        Ok(())
    }

    fn new_multi_queue_reader(&self) -> TunResult<Box<dyn PacketQueue>> {
        Err(TunError::NotImplemented("multiqueue not implemented for native tun".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Calls = Arc<Mutex<Vec<String>>>;

    struct StubDevice {
        name: String,
        index: u32,
        calls: Calls,
        close_error: bool,
    }

    impl PacketDevice for StubDevice {
        fn name(&self) -> &str {
            &self.name
        }

        fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn send(&self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn close(self: Box<Self>) -> io::Result<()> {
            self.calls.lock().unwrap().push("close".to_string());
            if self.close_error {
                return Err(io::Error::new(io::ErrorKind::Other, "handle already released"));
            }
            Ok(())
        }
    }

    impl KernelDevice for StubDevice {
        fn if_index(&self) -> u32 {
            self.index
        }
    }

    struct StubDriver {
        calls: Calls,
        close_error: bool,
    }

    #[async_trait]
    impl KernelDriver for StubDriver {
        async fn create(&self, name: &str, id: DeviceId, mtu: u32) -> TunResult<Box<dyn KernelDevice>> {
            self.calls.lock().unwrap().push(format!("create {} {} {}", name, id, mtu));
            Ok(Box::new(StubDevice {
                name: name.to_string(),
                index: 12,
                calls: self.calls.clone(),
                close_error: self.close_error,
            }))
        }
    }

    #[derive(Default)]
    struct StubTable {
        calls: Calls,
        committed: Arc<Mutex<Option<IpInterface>>>,
        routes: Arc<Mutex<Vec<RouteData>>>,
        fail: Option<&'static str>,
    }

    impl StubTable {
        fn record(&self, op: &'static str, if_index: u32) -> TunResult<()> {
            self.calls.lock().unwrap().push(format!("{} {}", op, if_index));
            if self.fail == Some(op) || self.fail == Some("all") {
                return Err(TunError::Netlink("Operation not permitted".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl InterfaceTable for StubTable {
        async fn set_ip_addresses(&self, if_index: u32, _addresses: &[Ipv4Network]) -> TunResult<()> {
            self.record("set_ip_addresses", if_index)
        }

        async fn add_routes(&self, if_index: u32, routes: &[RouteData]) -> TunResult<()> {
            self.record("add_routes", if_index)?;
            self.routes.lock().unwrap().extend_from_slice(routes);
            Ok(())
        }

        async fn ip_interface(&self, if_index: u32) -> TunResult<IpInterface> {
            self.record("ip_interface", if_index)?;
            Ok(IpInterface { mtu: 1500, use_automatic_metric: true, metric: 25 })
        }

        async fn set_ip_interface(&self, if_index: u32, properties: &IpInterface) -> TunResult<()> {
            self.record("set_ip_interface", if_index)?;
            *self.committed.lock().unwrap() = Some(properties.clone());
            Ok(())
        }

        async fn flush_routes(&self, if_index: u32) -> TunResult<()> {
            self.record("flush_routes", if_index)
        }

        async fn flush_ip_addresses(&self, if_index: u32) -> TunResult<()> {
            self.record("flush_ip_addresses", if_index)
        }

        async fn flush_dns(&self, if_index: u32) -> TunResult<()> {
            self.record("flush_dns", if_index)
        }
    }

    fn route(cidr: &str, metric: u32) -> Route {
        Route {
            cidr: cidr.parse().unwrap(),
            mtu: 1300,
            metric,
            via: Some(Ipv4Addr::new(10, 0, 0, 5)),
        }
    }

    fn config(routes: Vec<Route>) -> DeviceConfig {
        DeviceConfig {
            name: "meshtun1".to_string(),
            cidr: "10.0.0.1/24".parse().unwrap(),
            mtu: 1300,
            unsafe_routes: routes,
            tx_queue_len: 500,
        }
    }

    async fn build(routes: Vec<Route>, table: StubTable) -> (NativeTun<StubTable>, Calls) {
        let calls = table.calls.clone();
        let driver = StubDriver { calls: calls.clone(), close_error: false };
        let tun = NativeTun::new(config(routes), &driver, table).await.unwrap();
        (tun, calls)
    }

    #[tokio::test]
    async fn test_new_creates_device_with_identity() {
        let (tun, calls) = build(Vec::new(), StubTable::default()).await;
        let id = DeviceId::from_device_name("meshtun1");

        assert_eq!(tun.device_id(), id);
        assert_eq!(tun.if_index(), Some(12));
        assert_eq!(calls.lock().unwrap().as_slice(), [format!("create meshtun1 {} 1300", id)]);
    }

    #[tokio::test]
    async fn test_activate_order_and_properties() {
        let table = StubTable::default();
        let committed = table.committed.clone();
        let installed = table.routes.clone();
        let (mut tun, calls) = build(vec![route("1.0.0.0/8", 100)], table).await;
        calls.lock().unwrap().clear();

        tun.activate().await.unwrap();

        assert_eq!(
            calls.lock().unwrap().as_slice(),
            ["set_ip_addresses 12", "add_routes 12", "ip_interface 12", "set_ip_interface 12"]
        );
        assert_eq!(
            installed.lock().unwrap().as_slice(),
            [RouteData {
                destination: "1.0.0.0/8".parse().unwrap(),
                next_hop: Ipv4Addr::new(10, 0, 0, 5),
                metric: 100,
            }]
        );
        // no default route: metric left to the OS
        assert_eq!(
            committed.lock().unwrap().clone(),
            Some(IpInterface { mtu: 1300, use_automatic_metric: true, metric: 25 })
        );
    }

    #[tokio::test]
    async fn test_default_route_pins_metric() {
        let table = StubTable::default();
        let committed = table.committed.clone();
        let (mut tun, _calls) = build(vec![route("0.0.0.0/0", 0), route("1.0.0.0/8", 0)], table).await;

        tun.activate().await.unwrap();

        assert_eq!(
            committed.lock().unwrap().clone(),
            Some(IpInterface { mtu: 1300, use_automatic_metric: false, metric: 0 })
        );
    }

    #[tokio::test]
    async fn test_activate_step_errors() {
        let cases = [
            ("set_ip_addresses", "failed to set address: netlink: Operation not permitted"),
            ("add_routes", "failed to add routes: netlink: Operation not permitted"),
            ("ip_interface", "failed to get ip interface: netlink: Operation not permitted"),
            ("set_ip_interface", "failed to set ip interface: netlink: Operation not permitted"),
        ];

        for (op, message) in cases {
            let table = StubTable { fail: Some(op), ..StubTable::default() };
            let (mut tun, calls) = build(vec![route("1.0.0.0/8", 0)], table).await;

            let err = tun.activate().await.unwrap_err();
            assert_eq!(err.to_string(), message);
            assert_eq!(calls.lock().unwrap().last().unwrap(), &format!("{} 12", op));
        }
    }

    #[tokio::test]
    async fn test_close_flushes_in_order_and_swallows_errors() {
        let table = StubTable { fail: Some("all"), ..StubTable::default() };
        let (mut tun, calls) = build(Vec::new(), table).await;
        calls.lock().unwrap().clear();

        tun.close().await.unwrap();

        assert_eq!(
            calls.lock().unwrap().as_slice(),
            ["flush_routes 12", "flush_ip_addresses 12", "flush_dns 12", "close"]
        );
        assert_eq!(tun.if_index(), None);

        // second close is a no-op
        tun.close().await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), 4);
    }

    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_close_warns_once_per_failed_flush() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || LogBuffer(sink.clone()))
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let table = StubTable { fail: Some("all"), ..StubTable::default() };
        let (mut tun, _calls) = build(Vec::new(), table).await;
        tun.close().await.unwrap();

        let output = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        let warnings: Vec<&str> = output.lines().filter(|line| line.contains("WARN")).collect();
        assert_eq!(warnings.len(), 3, "{}", output);
        assert!(warnings[0].contains("Failed to flush routes on meshtun1: netlink: Operation not permitted"));
        assert!(warnings[1].contains("Failed to flush addresses on meshtun1"));
        assert!(warnings[2].contains("Failed to flush DNS on meshtun1"));
    }

    #[tokio::test]
    async fn test_close_returns_handle_error() {
        let table = StubTable::default();
        let calls = table.calls.clone();
        let driver = StubDriver { calls: calls.clone(), close_error: true };
        let mut tun = NativeTun::new(config(Vec::new()), &driver, table).await.unwrap();

        let err = tun.close().await.unwrap_err();
        assert_eq!(err.to_string(), "IO error: handle already released");
    }

    #[tokio::test]
    async fn test_closed_device_rejects_io() {
        let (mut tun, _calls) = build(Vec::new(), StubTable::default()).await;
        assert_eq!(tun.write(&[1, 2, 3]).unwrap(), 3);

        tun.close().await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(tun.read(&mut buf).unwrap_err().kind(), io::ErrorKind::NotConnected);
        assert!(tun.activate().await.is_err());
    }

    #[tokio::test]
    async fn test_multi_queue_not_implemented() {
        let (tun, _calls) = build(Vec::new(), StubTable::default()).await;
        let err = tun.new_multi_queue_reader().err().unwrap();
        assert_eq!(err.to_string(), "multiqueue not implemented for native tun");
    }
}
