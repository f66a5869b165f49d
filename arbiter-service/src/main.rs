// SPDX-License-Identifier: GPL-3.0-only

//! Disk Arbiter daemon
//!
//! Discovers block devices from sysfs, probes and mounts them according to
//! policy, and shuts down on SIGINT or, when configured, after going idle.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use arbiter_contracts::Authorizer;
use arbiter_service::auth::{GroupAuthorizer, PolkitAuthorizer};
use arbiter_service::config::DEFAULT_CONFIG_PATH;
use arbiter_service::{
    ConfigStore, EngineParts, EventLoop, LoopHandle, Overrides, ProbeCandidate, ProbeSequencer,
};
use arbiter_sys::{BlkidPlugin, LinuxHost, SysfsDiscovery};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Parser)]
#[command(name = "disk-arbiterd", version, about = "Disk lifecycle daemon")]
struct Cli {
    /// Preference file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Directory automatic mount points are created under
    #[arg(long)]
    mount_base: Option<PathBuf>,

    /// Exit once idle for the configured timeout
    #[arg(long)]
    exit_on_idle: bool,

    /// Root of the sysfs tree to discover devices from
    #[arg(long, default_value = "/sys")]
    sys_root: PathBuf,
}

/// Filesystem kinds compiled into this build, in probe order.
fn enabled_kinds() -> Vec<&'static str> {
    let mut kinds = Vec::new();
    #[cfg(feature = "fs-ext4")]
    kinds.push("ext4");
    #[cfg(feature = "fs-xfs")]
    kinds.push("xfs");
    #[cfg(feature = "fs-btrfs")]
    kinds.push("btrfs");
    #[cfg(feature = "fs-vfat")]
    kinds.push("vfat");
    #[cfg(feature = "fs-ntfs")]
    kinds.push("ntfs");
    #[cfg(feature = "fs-exfat")]
    kinds.push("exfat");
    kinds
}

fn build_sequencer() -> ProbeSequencer {
    let supported = BlkidPlugin::detect_supported(&enabled_kinds());
    let candidates: Vec<ProbeCandidate> = BlkidPlugin::family(supported)
        .into_iter()
        .enumerate()
        .map(|(priority, plugin)| ProbeCandidate::new(Arc::new(plugin), priority as u32))
        .collect();
    ProbeSequencer::new(candidates)
}

async fn build_authorizer() -> Arc<dyn Authorizer> {
    match PolkitAuthorizer::connect().await {
        Ok(polkit) => Arc::new(polkit),
        Err(e) => {
            tracing::warn!(
                "Polkit unavailable ({}), only root may act on other users' disks",
                e
            );
            Arc::new(GroupAuthorizer::default())
        }
    }
}

fn spawn_discovery(handle: LoopHandle, mut discovery: SysfsDiscovery, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let polled = tokio::task::spawn_blocking(move || {
                let events = discovery.poll();
                (discovery, events)
            })
            .await;
            let (returned, events) = match polled {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Device discovery task failed: {}", e);
                    return;
                }
            };
            discovery = returned;

            match events {
                Ok(events) => {
                    for event in events {
                        handle.apply(event);
                    }
                }
                Err(e) => tracing::warn!("Device scan failed: {}", e),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("disk_arbiterd=info,arbiter_service=info,arbiter_sys=info,warn")
        }))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tracing::info!("Starting Disk Arbiter v{}", env!("CARGO_PKG_VERSION"));

    if unsafe { libc::geteuid() } != 0 {
        tracing::error!("Disk Arbiter must run as root");
        anyhow::bail!("Service must run with root privileges");
    }

    let overrides = Overrides {
        mount_base: cli.mount_base,
        exit_on_idle: cli.exit_on_idle.then_some(true),
    };
    let config = ConfigStore::open(&cli.config, overrides)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let preferences = config.preferences().clone();

    let sequencer = build_sequencer();
    if sequencer.is_empty() {
        tracing::warn!("No filesystem tools found, nothing will be mounted");
    }

    let parts = EngineParts {
        config,
        sequencer,
        host: Arc::new(LinuxHost::new()),
        authorizer: build_authorizer().await,
    };
    let (event_loop, handle) = EventLoop::new(parts);

    let discovery = SysfsDiscovery::new(&cli.sys_root, preferences.settle());
    spawn_discovery(handle.clone(), discovery, preferences.poll_interval());
    tracing::info!(
        "Watching {} every {:?}",
        cli.sys_root.display(),
        preferences.poll_interval()
    );

    let shutdown = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        shutdown.shutdown();
    });

    event_loop.run().await;
    tracing::info!("Disk Arbiter shutting down");
    Ok(())
}
