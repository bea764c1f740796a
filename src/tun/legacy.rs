//! Legacy backend: user-mode packet driver configured by external commands

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::io;
use tracing::{debug, info};

use super::command::{CommandDialect, CommandRunner};
use super::{not_connected, DeviceConfig, PacketDevice, PacketQueue, VirtualInterface};
use crate::error::{TunError, TunResult};
use crate::routes::Route;

/// Opens packet devices for the legacy backend
pub trait UserModeDriver: Send + Sync {
    /// Create a device; the OS may pick a different name than `requested_name`
    fn create(&self, requested_name: &str) -> io::Result<Box<dyn PacketDevice>>;
}

pub struct LegacyTun<R: CommandRunner> {
    requested_name: String,
    device_name: String,
    cidr: Ipv4Network,
    mtu: u32,
    tx_queue_len: u32,
    unsafe_routes: Vec<Route>,
    driver: Box<dyn UserModeDriver>,
    runner: R,
    dialect: CommandDialect,
    device: Option<Box<dyn PacketDevice>>,
}

impl<R: CommandRunner> LegacyTun<R> {
    /// Record the configuration; nothing touches the OS until `activate`
    pub fn new(config: DeviceConfig, driver: Box<dyn UserModeDriver>, runner: R, dialect: CommandDialect) -> Self {
        Self {
            device_name: config.name.clone(),
            requested_name: config.name,
            cidr: config.cidr,
            mtu: config.mtu,
            tx_queue_len: config.tx_queue_len,
            unsafe_routes: config.unsafe_routes,
            driver,
            runner,
            dialect,
            device: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.device.is_some()
    }

    fn device(&self) -> io::Result<&dyn PacketDevice> {
        self.device
            .as_deref()
            .ok_or_else(|| not_connected(&self.device_name))
    }
}

#[async_trait]
impl<R: CommandRunner> VirtualInterface for LegacyTun<R> {
    async fn activate(&mut self) -> TunResult<()> {
        let device = self.driver.create(&self.requested_name).map_err(TunError::DriverOpen)?;
        self.device_name = device.name().to_string();
        self.device = Some(device);
        let name = self.device_name.clone();
        self.dialect.check_device_name(&name)?;

        let command = self.dialect.set_address(&name, &self.cidr);
        debug!("Setting address on {}: {}", name, command);
        self.runner.run(&command).await.map_err(|e| TunError::ConfigCommand {
            program: command.program_name().to_string(),
            step: "set address",
            source: Box::new(e),
        })?;

        let command = self.dialect.set_mtu(&name, self.mtu, self.tx_queue_len);
        debug!("Setting MTU on {}: {}", name, command);
        self.runner.run(&command).await.map_err(|e| TunError::ConfigCommand {
            program: command.program_name().to_string(),
            step: "set MTU",
            source: Box::new(e),
        })?;

        let if_index = self
            .runner
            .interface_index(&name)
            .map_err(|e| TunError::InterfaceLookup { name: name.clone(), source: e })?;

        for route in &self.unsafe_routes {
            let installed = match self.dialect.add_route(&name, if_index, route) {
                Ok(command) => {
                    debug!("Adding route via {}: {}", name, command);
                    self.runner.run(&command).await
                }
                Err(e) => Err(e),
            };
            installed.map_err(|e| TunError::RouteInstall {
                cidr: route.cidr.to_string(),
                source: Box::new(e),
            })?;
        }

        info!(
            "Activated {} with {} ({} additional routes)",
            name,
            self.cidr,
            self.unsafe_routes.len()
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
        match self.device.take() {
            Some(device) => {
                debug!("Closing {}", self.device_name);
                device.close()?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn new_multi_queue_reader(&self) -> TunResult<Box<dyn PacketQueue>> {
        Err(TunError::NotImplemented("multiqueue not implemented for legacy tun".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tun::command::{MockCommandRunner, PlatformCommand};
    use mockall::predicate::*;
    use mockall::Sequence;
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    struct LoopDevice {
        name: String,
        packets: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl PacketDevice for LoopDevice {
        fn name(&self) -> &str {
            &self.name
        }

        fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let packet = self.packets.lock().unwrap().pop().unwrap_or_default();
            buf[..packet.len()].copy_from_slice(&packet);
            Ok(packet.len())
        }

        fn send(&self, buf: &[u8]) -> io::Result<usize> {
            self.packets.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }
    }

    /// Hands out devices under a fixed OS name, or fails like a missing driver
    struct RenamingDriver {
        os_name: Option<&'static str>,
        packets: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl RenamingDriver {
        fn named(os_name: &'static str) -> Self {
            Self { os_name: Some(os_name), packets: Arc::default() }
        }
    }

    impl UserModeDriver for RenamingDriver {
        fn create(&self, _requested_name: &str) -> io::Result<Box<dyn PacketDevice>> {
            match self.os_name {
                Some(name) => Ok(Box::new(LoopDevice { name: name.to_string(), packets: self.packets.clone() })),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "driver not installed")),
            }
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

    fn route(cidr: &str, metric: u32) -> Route {
        Route {
            cidr: cidr.parse().unwrap(),
            mtu: 1300,
            metric,
            via: Some(Ipv4Addr::new(10, 0, 0, 5)),
        }
    }

    fn args_start(command: &PlatformCommand, prefix: &[&str]) -> bool {
        command.args.len() >= prefix.len() && command.args.iter().zip(prefix).all(|(a, b)| a == b)
    }

    fn failed(cmd: &str) -> TunError {
        TunError::CommandFailed { cmd: cmd.to_string(), code: Some(2), stderr: "RTNETLINK answers: File exists".to_string() }
    }

    #[tokio::test]
    async fn test_activate_runs_steps_in_order() {
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();

        runner
            .expect_run()
            .withf(|c| args_start(c, &["addr", "replace", "10.0.0.1/24", "dev", "mesh7"]))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        runner
            .expect_run()
            .withf(|c| args_start(c, &["link", "set", "dev", "mesh7", "mtu", "1300"]))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        runner
            .expect_interface_index()
            .with(eq("mesh7"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(9));
        runner
            .expect_run()
            .withf(|c| args_start(c, &["route", "add", "1.0.0.0/8", "via", "10.0.0.5", "dev", "mesh7", "metric", "100"]))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        runner
            .expect_run()
            .withf(|c| args_start(c, &["route", "add", "192.168.0.0/16"]))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let routes = vec![route("1.0.0.0/8", 100), route("192.168.0.0/16", 0)];
        let mut tun = LegacyTun::new(
            config(routes),
            Box::new(RenamingDriver::named("mesh7")),
            runner,
            CommandDialect::Iproute2,
        );

        assert_eq!(tun.device_name(), "meshtun1");
        tun.activate().await.unwrap();
        assert_eq!(tun.device_name(), "mesh7");
        assert_eq!(tun.cidr_net().to_string(), "10.0.0.1/24");
        assert!(tun.is_active());
    }

    #[tokio::test]
    async fn test_driver_failure() {
        let runner = MockCommandRunner::new();
        let driver = RenamingDriver { os_name: None, packets: Arc::default() };
        let mut tun = LegacyTun::new(config(Vec::new()), Box::new(driver), runner, CommandDialect::Iproute2);

        let err = tun.activate().await.unwrap_err();
        assert_eq!(err.to_string(), "Activate failed: driver not installed");
        assert!(!tun.is_active());
    }

    #[tokio::test]
    async fn test_address_failure_stops_activation() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .times(1)
            .returning(|c| Err(failed(&c.to_string())));
        runner.expect_interface_index().never();

        let mut tun = LegacyTun::new(
            config(vec![route("1.0.0.0/8", 0)]),
            Box::new(RenamingDriver::named("meshtun1")),
            runner,
            CommandDialect::Iproute2,
        );

        let err = tun.activate().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to run 'ip' to set address: Command 'ip addr replace 10.0.0.1/24 dev meshtun1' failed with code 2: RTNETLINK answers: File exists"
        );
    }

    #[tokio::test]
    async fn test_mtu_failure_names_program() {
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        runner
            .expect_run()
            .withf(|c| args_start(c, &["interface", "ipv4", "set", "address"]))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        runner
            .expect_run()
            .withf(|c| args_start(c, &["interface", "ipv4", "set", "interface", "Ethernet 3", "mtu=1300"]))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|c| Err(failed(&c.to_string())));

        let mut tun = LegacyTun::new(
            config(Vec::new()),
            Box::new(RenamingDriver::named("Ethernet 3")),
            runner,
            CommandDialect::Netsh,
        );

        let err = tun.activate().await.unwrap_err();
        assert!(err.to_string().starts_with("failed to run 'netsh' to set MTU: "), "{}", err);
    }

    #[tokio::test]
    async fn test_interface_lookup_failure() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(2).returning(|_| Ok(()));
        runner
            .expect_interface_index()
            .returning(|_| Err(io::Error::new(io::ErrorKind::NotFound, "No such device")));

        let mut tun = LegacyTun::new(
            config(Vec::new()),
            Box::new(RenamingDriver::named("meshtun1")),
            runner,
            CommandDialect::Iproute2,
        );

        let err = tun.activate().await.unwrap_err();
        assert_eq!(err.to_string(), "failed to find interface named meshtun1: No such device");
    }

    #[tokio::test]
    async fn test_route_failure_keeps_earlier_routes() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|c| !c.args.iter().any(|a| a == "172.16.0.0/12" || a == "192.168.0.0/16"))
            .times(3)
            .returning(|_| Ok(()));
        runner
            .expect_run()
            .withf(|c| args_start(c, &["route", "add", "172.16.0.0/12"]))
            .times(1)
            .returning(|c| Err(failed(&c.to_string())));
        runner.expect_interface_index().returning(|_| Ok(4));

        let routes = vec![route("1.0.0.0/8", 0), route("172.16.0.0/12", 0), route("192.168.0.0/16", 0)];
        let mut tun = LegacyTun::new(
            config(routes),
            Box::new(RenamingDriver::named("meshtun1")),
            runner,
            CommandDialect::Iproute2,
        );

        let err = tun.activate().await.unwrap_err();
        assert!(
            err.to_string().starts_with("failed to add the unsafe_route 172.16.0.0/12: "),
            "{}",
            err
        );
        // no rollback: the device stays open for the caller to close
        assert!(tun.is_active());
        tun.close().await.unwrap();
        assert!(!tun.is_active());
    }

    #[tokio::test]
    async fn test_read_write_lifecycle() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| Ok(()));
        runner.expect_interface_index().returning(|_| Ok(1));

        let mut tun = LegacyTun::new(
            config(Vec::new()),
            Box::new(RenamingDriver::named("meshtun1")),
            runner,
            CommandDialect::Iproute2,
        );

        let mut buf = [0u8; 64];
        assert_eq!(tun.read(&mut buf).unwrap_err().kind(), io::ErrorKind::NotConnected);
        assert_eq!(tun.write(b"x").unwrap_err().kind(), io::ErrorKind::NotConnected);

        tun.activate().await.unwrap();
        tun.write_raw(&[0x45, 0, 0, 20]).unwrap();
        assert_eq!(tun.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[0x45, 0, 0, 20]);

        tun.close().await.unwrap();
        assert_eq!(tun.write(b"x").unwrap_err().kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_close_without_activate() {
        let runner = MockCommandRunner::new();
        let mut tun = LegacyTun::new(
            config(Vec::new()),
            Box::new(RenamingDriver::named("meshtun1")),
            runner,
            CommandDialect::Iproute2,
        );
        tun.close().await.unwrap();
        tun.close().await.unwrap();
    }

    #[test]
    fn test_multi_queue_not_implemented() {
        let tun = LegacyTun::new(
            config(Vec::new()),
            Box::new(RenamingDriver::named("meshtun1")),
            MockCommandRunner::new(),
            CommandDialect::Netsh,
        );
        let err = tun.new_multi_queue_reader().err().unwrap();
        assert!(matches!(err, TunError::NotImplemented(_)));
        assert_eq!(err.to_string(), "multiqueue not implemented for legacy tun");
    }
}
