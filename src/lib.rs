pub mod config;
pub mod coordinator;
pub mod crc;
pub mod error;
pub mod inverter;
pub mod options;
pub mod prelude;
pub mod utils;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::coordinator::ChannelData;
use crate::options::Command;
use crate::prelude::*;

use std::io::Write;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

fn init_logging(loglevel: &str) {
    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(loglevel))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    if let Err(e) = result {
        eprintln!("Failed to initialise logging: {}", e);
    }
}

pub async fn app(options: Options) -> Result<()> {
    let config = Config::new(options.config_file.clone())?;
    init_logging(config.loglevel());

    info!(
        "isolar-bridge {} starting with config file: {}",
        CARGO_PKG_VERSION, options.config_file
    );
    config.print_summary();

    let inverter = Inverter::new(config.inverter())?;

    match options.command() {
        Command::Run => run(config, inverter, options.runtime).await,
        Command::ScanRegisters { start, count } => {
            info!("scanning {} registers from {}", count, start);
            let readings = inverter.scan_registers(start, count).await;
            inverter.disconnect().await;
            println!("{}", serde_json::to_string_pretty(&readings?)?);
            Ok(())
        }
        Command::ScanDevices { start, end } => {
            info!("probing unit ids {}..={}", start, end);
            let probes = inverter.scan_device_ids(start..=end).await;
            inverter.disconnect().await;
            println!("{}", serde_json::to_string_pretty(&probes)?);
            Ok(())
        }
    }
}

async fn run(config: Config, inverter: Inverter, runtime: Option<u64>) -> Result<()> {
    let coordinator = Coordinator::new(config.poll().clone(), inverter);

    let mut receiver = coordinator.subscribe();
    let publisher = tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(ChannelData::Snapshot(snapshot)) => match serde_json::to_string(&snapshot) {
                    Ok(json) => println!("{}", json),
                    Err(e) => error!("cannot serialize snapshot: {}", e),
                },
                Ok(ChannelData::Stale) => warn!("inverter data is stale"),
                Ok(ChannelData::Shutdown) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(n)) => warn!("publisher lagged, {} messages lost", n),
            }
        }
    });

    let poller = coordinator.clone();
    let coordinator_handle = tokio::spawn(async move { poller.start().await });

    match runtime {
        Some(secs) => {
            tokio::select! {
                r = tokio::signal::ctrl_c() => r?,
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!("runtime of {}s reached", secs);
                }
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    info!("Shutdown signal received, stopping...");
    coordinator.stop();

    if let Err(e) = coordinator_handle.await? {
        error!("Coordinator task failed: {}", e);
    }
    if let Err(e) = publisher.await {
        error!("Error waiting for publisher task: {}", e);
    }

    coordinator.stats.lock().map_err(|_| anyhow!("stats lock poisoned"))?.print_summary();
    info!("Application shutdown complete");

    Ok(())
}
