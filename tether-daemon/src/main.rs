//! tether daemon: accepts bridge connections over TCP/VSOCK and serves
//! multiplexed service requests.

mod config;

use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tether::{AuthConfig, Hub, HubConfig, ServiceHooks, ServiceRouter};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{DaemonConfig, ListenAddr, parse_listen};

#[derive(Debug, Parser)]
#[command(name = "tetherd", version, about = "Device bridge daemon")]
struct Cli {
    /// Path to a JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address (`tcp:<port>` or `vsock:<port>`); repeatable,
    /// overrides the configuration file.
    #[arg(long)]
    listen: Vec<String>,

    /// Deny privileged services regardless of configuration.
    #[arg(long)]
    restricted: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if !cli.listen.is_empty() {
        config.listen.clone_from(&cli.listen);
    }
    let restricted = config.restricted || cli.restricted;

    let addrs: Vec<ListenAddr> = config
        .listen
        .iter()
        .map(|spec| parse_listen(spec).map_err(anyhow::Error::msg))
        .collect::<Result<_>>()?;

    let mut router = ServiceRouter::new(ServiceHooks::default());
    if restricted {
        info!("restricted mode: privileged services are denied");
        router = router.with_admission(Box::new(|_| false));
    }

    let hub = Hub::new(
        HubConfig {
            banner: config.banner_config(),
            auth: AuthConfig {
                required: config.auth_required,
                ..AuthConfig::default()
            },
        },
        router,
    );
    let handle = hub.handle();

    for addr in addrs {
        match addr {
            ListenAddr::Tcp(port) => {
                tether::backends::tcp::spawn_listener(handle.clone(), port)
                    .with_context(|| format!("starting listener on {addr}"))?;
            }
            #[cfg(target_os = "linux")]
            ListenAddr::Vsock(port) => {
                tether::backends::vsock::spawn_listener(handle.clone(), port)
                    .with_context(|| format!("starting listener on {addr}"))?;
            }
            #[cfg(not(target_os = "linux"))]
            ListenAddr::Vsock(_) => {
                tracing::warn!(%addr, "vsock is only available on linux, skipping");
            }
        }
    }

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("installing signal handlers")?;
    let shutdown_handle = handle.clone();
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "shutting down");
            shutdown_handle.shutdown();
        }
    });

    info!("daemon started");
    hub.run();
    Ok(())
}
