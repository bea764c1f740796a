//! meshtun - tunnel device tool for mesh overlay nodes
//!
//! # Usage
//!
//! ```bash
//! # Validate the route lists of a node configuration
//! meshtun check --config /etc/meshtun/node.toml --network 10.0.0.1/24
//!
//! # Bring the device up and hold it until SIGINT/SIGTERM (requires root)
//! sudo meshtun up --config /etc/meshtun/node.toml --network 10.0.0.1/24
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use ipnetwork::Ipv4Network;
use libmeshtun::config::{ConfigTree, TunSettings};
use libmeshtun::routes::{self, Route};
use libmeshtun::tun::{create_interface, DeviceConfig, DriverKind};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "meshtun")]
#[command(version)]
#[command(about = "Route validation and tunnel device management for mesh overlay nodes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate tun.routes and tun.unsafe_routes and print them as JSON
    Check(NodeArgs),

    /// Create and configure the tunnel device, then hold it until interrupted
    Up {
        #[command(flatten)]
        node: NodeArgs,

        /// Override tun.driver (auto, legacy, native)
        #[arg(long, value_parser = parse_driver)]
        driver: Option<DriverKind>,
    },
}

#[derive(clap::Args)]
struct NodeArgs {
    /// Node configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long)]
    config: PathBuf,

    /// Address and prefix attached to the node certificate, e.g. 10.0.0.1/24
    #[arg(short, long)]
    network: Ipv4Network,
}

/// Everything read from the node configuration
struct Node {
    settings: TunSettings,
    routes: Vec<Route>,
    unsafe_routes: Vec<Route>,
}

#[derive(Serialize)]
struct RouteReport<'a> {
    device: &'a str,
    mtu: u32,
    routes: &'a [Route],
    unsafe_routes: &'a [Route],
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Check(node) => handle_check(node),
        Commands::Up { node, driver } => handle_up(node, *driver).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.verbose { "debug" } else { &cli.log_level };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("meshtun={},libmeshtun={}", log_level, log_level)));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

fn parse_driver(value: &str) -> Result<DriverKind, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("unknown driver '{}' (expected auto, legacy or native)", value))
}

fn load_node(args: &NodeArgs) -> anyhow::Result<Node> {
    let config = ConfigTree::load(&args.config)?;
    let settings = TunSettings::from_config(&config)?;
    let routes = routes::parse_routes(&config, &args.network)?;
    let unsafe_routes = routes::parse_unsafe_routes(&config, &args.network, settings.mtu)?;

    info!(
        "Loaded {}: {} routes, {} unsafe routes",
        args.config.display(),
        routes.len(),
        unsafe_routes.len()
    );
    Ok(Node { settings, routes, unsafe_routes })
}

fn handle_check(args: &NodeArgs) -> anyhow::Result<()> {
    let node = load_node(args)?;
    let report = RouteReport {
        device: &node.settings.dev,
        mtu: node.settings.mtu,
        routes: &node.routes,
        unsafe_routes: &node.unsafe_routes,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn handle_up(args: &NodeArgs, driver: Option<DriverKind>) -> anyhow::Result<()> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: getuid has no preconditions
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            warn!("Not running as root - device creation will likely fail");
        }
    }

    let node = load_node(args)?;
    let kind = driver.unwrap_or(node.settings.driver);
    let config = DeviceConfig::from_settings(&node.settings, args.network, node.unsafe_routes);

    let mut interface = create_interface(kind, config).await?;

    if let Err(e) = interface.activate().await {
        if let Err(close_err) = interface.close().await {
            warn!("Failed to close {} after activation error: {}", interface.device_name(), close_err);
        }
        return Err(e.into());
    }

    info!(
        "{} is up with {} ({} safe routes handled by the overlay)",
        interface.device_name(),
        interface.cidr_net(),
        node.routes.len()
    );
    println!("{}", interface.device_name());

    wait_for_shutdown().await?;

    interface.close().await?;
    info!("Tunnel device closed");
    Ok(())
}

/// Block until SIGINT or SIGTERM
async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, closing tunnel device"),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), closing tunnel device"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, closing tunnel device");
    }

    Ok(())
}
