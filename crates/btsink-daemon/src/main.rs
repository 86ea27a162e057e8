//! btsink - Bluetooth audio receiver daemon.

mod cli;
mod config;
mod console;
mod policy;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::Args;
use config::DaemonConfig;

fn setup_logging(args: &Args) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let Some(path) = &args.log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(args.debug)
            .init();
        return Ok(None);
    };

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Logging to {:?}", path);
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logging before anything else; the guard flushes the file on exit.
    let _guard = setup_logging(&args)?;

    let config = DaemonConfig::from_args(&args)?;
    info!("Starting btsink as \"{}\"", config.device_name);

    daemon::run(config).await?;

    info!("btsink exiting");
    Ok(())
}

#[cfg(target_os = "linux")]
mod daemon {
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use btsink_audio::{AudioController, SystemRunner};
    use btsink_bluetooth::{
        register_agent, BluetoothAdapter, ConnectionMonitor, DeviceManager, DeviceRegistry,
        JsonFileStore, LinkTracker, PairingAgent, Reconnector,
    };
    use tracing::{info, warn};

    use crate::config::DaemonConfig;
    use crate::console::{spawn_console, Console};
    use crate::policy::spawn_headless_policy;

    pub async fn run(config: DaemonConfig) -> Result<()> {
        let policy = config.reconnect.policy();
        let store = Arc::new(JsonFileStore::new(config.state_file.clone()));
        let registry = match DeviceRegistry::load(store.clone(), policy.clone()).await {
            Ok(registry) => registry,
            Err(e) => {
                warn!(
                    "Could not load {} ({}), starting with no known devices",
                    config.state_file.display(),
                    e
                );
                DeviceRegistry::new(store, policy)
            }
        };
        let registry = Arc::new(registry);

        let runner = SystemRunner::new().with_timeout(config.audio.command_timeout());
        let audio = AudioController::start(Arc::new(runner), config.audio.clone());
        report_audio(&audio).await;

        let adapter = BluetoothAdapter::new(config.adapter.as_deref())
            .await
            .context("Failed to open Bluetooth adapter")?;
        if let Err(e) = adapter.prepare(&config.device_name).await {
            warn!("Adapter setup incomplete: {}", e);
        }
        match adapter.address().await {
            Ok(address) => info!("Using adapter {}", address),
            Err(e) => warn!("{}", e),
        }

        let agent = PairingAgent::new(config.agent.clone(), registry.clone());
        let decisions = spawn_headless_policy(&agent, config.headless.auto_accept);
        let registration = register_agent(adapter.session(), agent.clone())
            .await
            .context("Failed to register pairing agent")?;

        let reconnector = Arc::new(Reconnector::new(registry.clone(), Arc::new(adapter.clone())));
        let tracker =
            LinkTracker::new(registry.clone(), reconnector.clone()).with_agent(agent.clone());
        let monitor = match ConnectionMonitor::start(adapter.clone(), tracker).await {
            Ok(monitor) => Some(monitor),
            Err(e) => {
                warn!("Connection monitoring disabled: {}", e);
                None
            }
        };

        let console = config.headless.console.then(|| {
            let devices = Arc::new(DeviceManager::new(
                registry.clone(),
                reconnector.clone(),
                Arc::new(adapter.clone()),
            ));
            info!("Console enabled, type help for commands");
            spawn_console(Console::new(agent.clone(), devices, audio.clone()))
        });

        info!("Ready, waiting for devices (Ctrl-C to stop)");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Shutting down");

        registration.unregister().await;
        reconnector.shutdown().await;
        if let Some(monitor) = monitor {
            monitor.stop();
        }
        decisions.abort();
        if let Some(console) = console {
            console.abort();
        }
        if let Err(e) = adapter.release().await {
            warn!("Failed to release adapter: {}", e);
        }
        Ok(())
    }

    async fn report_audio(audio: &AudioController) {
        let Some(kind) = audio.backend_kind().await else {
            warn!("No audio control plane found, audio control disabled");
            return;
        };
        info!("Audio control plane: {}", kind);

        match audio.default_sink().await {
            Ok(Some(sink)) => info!(
                "Default sink: {} ({}%{})",
                sink.display_name(),
                sink.volume_percent,
                if sink.muted { ", muted" } else { "" }
            ),
            Ok(None) => info!("No default sink"),
            Err(e) => warn!("Failed to query sinks: {}", e),
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod daemon {
    use crate::config::DaemonConfig;

    pub async fn run(_config: DaemonConfig) -> anyhow::Result<()> {
        anyhow::bail!("btsink needs BlueZ and only runs on Linux")
    }
}
