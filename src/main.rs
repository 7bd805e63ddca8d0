use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;

mod config;
mod cursor;
mod device;
mod error;
mod flow;
mod graceful;
mod inject;
mod mutator;
mod nfqueue_handler;
mod relay;
mod strategy;
mod tls;

use config::{Config, DeviceConfig, MutatorConfig};
use device::CaptureDevice;
use graceful::GracefulShutdown;
use mutator::PacketMutator;
use relay::RelayServer;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let config_path = if args.len() > 1 {
        &args[1]
    } else {
        "config.json"
    };

    let config = Config::load(config_path).unwrap_or_else(|e| {
        log::warn!("Failed to load {}: {:#}, using defaults", config_path, e);
        Config::default()
    });

    let chain = strategy::from_config(&config.obfuscation);
    log::info!("=================================================");
    log::info!("sni-shield {}", env!("CARGO_PKG_VERSION"));
    log::info!("Configuration: {}", config_path);
    log::info!("Mode: {:?}", config.mode);
    log::info!("Strategy: {}", chain.describe());
    log::info!("=================================================");

    let shutdown = Arc::new(GracefulShutdown::new());

    let shutdown_handler = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                log::info!("Received SIGINT, initiating graceful shutdown...");
                shutdown_handler.initiate_shutdown();
            }
            Err(err) => {
                log::error!("Failed to listen for SIGINT: {}", err);
            }
        }
    });

    let mut tasks = tokio::task::JoinSet::new();

    if config.mode.runs_relay() {
        let listen_addr = config.relay.listen_addr;
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("binding relay listener on {}", listen_addr))?;
        log::info!("✓ Relay ready on {}", listen_addr);

        let relay = Arc::new(RelayServer::new(config.relay.clone(), Arc::new(chain), shutdown.clone()));
        tasks.spawn(relay.serve(listener));
    }

    if config.mode.runs_mutator() {
        let mutator_config = config.mutator.clone();
        let obfuscation = config.obfuscation.clone();

        tasks.spawn_blocking(move || {
            let mut device = open_device(&mutator_config.device)?;
            log::info!("✓ Packet mutator attached to {:?}", mutator_config.device);
            let mut mutator = PacketMutator::from_config(
                &mutator_config,
                Box::new(strategy::from_config(&obfuscation)),
            );
            run_mutator(&mut mutator, device.as_mut(), &mutator_config)
        });
    }

    tokio::select! {
        _ = shutdown.wait_for_shutdown() => {
            let remaining = shutdown.graceful_close_all(GracefulShutdown::default_deadline()).await;
            if remaining > 0 {
                log::warn!("{} relay connections cut at shutdown", remaining);
            }
        }
        Some(finished) = tasks.join_next() => {
            finished.context("task panicked")??;
        }
    }

    log::info!("Stopped");
    if config.mode.runs_mutator() {
        // a capture read blocks its thread until the next packet
        std::process::exit(0);
    }
    Ok(())
}

fn open_device(device: &DeviceConfig) -> Result<Box<dyn CaptureDevice>> {
    match device {
        #[cfg(target_os = "linux")]
        DeviceConfig::Tun { name } => {
            let tun = device::TunDevice::attach(name)
                .with_context(|| format!("attaching to TUN interface {}", name))?;
            Ok(Box::new(tun))
        }
        #[cfg(not(target_os = "linux"))]
        DeviceConfig::Tun { name } => {
            anyhow::bail!("TUN interface {} is only supported on Linux", name)
        }
        DeviceConfig::Nfqueue { queue_num } => {
            let queue = nfqueue_handler::NfqueueDevice::open(*queue_num)
                .with_context(|| format!("binding NFQUEUE {}", queue_num))?;
            Ok(Box::new(queue))
        }
    }
}

fn run_mutator(
    mutator: &mut PacketMutator,
    device: &mut dyn CaptureDevice,
    config: &MutatorConfig,
) -> Result<()> {
    let result = mutator.run(device);
    let stats = mutator.stats();
    log::info!(
        "Packet mutator stopped after {} packets ({} rewritten, {} rejected, {} of {} flows open)",
        stats.packets,
        stats.rewritten,
        stats.rejected,
        mutator.flows().len(),
        config.max_flows
    );
    result.context("capture device failed")
}
