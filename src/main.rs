mod assembler;
mod clock;
mod compensator;
mod config;
mod filter;
mod fix;
mod gps_worker;
mod measurement;
mod nmea;
mod pps;
mod ring_buffer;
mod serial;
mod sync_state;
mod watchdog;

use anyhow::{Context, Result};
use config::{Config, LoggingConfig};
use gps_worker::GpsWorker;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    // La configuration fournit le niveau de log : elle est chargée en premier
    let config_path = get_config_path();
    let (config, created) = load_or_create_config(&config_path)?;

    init_logging(&config.logging)?;

    info!("GPS clock sync v{}", env!("CARGO_PKG_VERSION"));
    info!("System clock discipline from GPS $GPRMC and PPS");

    if created {
        warn!("Configuration file not found: {}", config_path.display());
        info!("Example configuration created at {}", config_path.display());
    } else {
        info!("Loaded configuration from {}", config_path.display());
    }

    // Afficher la configuration
    info!("Configuration:");
    info!("  Serial port: {} @ {} baud", config.serial.port, config.serial.baud_rate);
    info!("  PPS device: {}", config.pps.device);
    info!("  Sync period: {} s", config.sync.sync_period);
    info!("  Drift window: {} s", config.sync.drift_measurement_period);
    info!("  Poll interval: {} ms", config.sync.poll_interval_ms);

    // Gérer Ctrl+C
    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown_requested);

    ctrlc::set_handler(move || {
        warn!("Ctrl+C received, stopping...");
        shutdown_clone.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let mut worker = GpsWorker::new(Duration::from_millis(config.sync.poll_interval_ms));
    worker
        .start(&config)
        .context("Failed to start GPS I/O thread")?;

    info!("Press Ctrl+C to stop");

    while !shutdown_requested.load(Ordering::SeqCst) {
        if !worker.is_running() {
            warn!("GPS I/O thread is no longer running");
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    worker.stop();
    info!("GPS clock sync stopped");
    Ok(())
}

/// Initialise le système de logging
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("Failed to create log filter")?;

    // Copie optionnelle des logs dans un fichier, sans couleurs
    let file_layer = match &logging.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            Some(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(())
}

/// Obtient le chemin du fichier de configuration
fn get_config_path() -> PathBuf {
    // Vérifier les arguments de ligne de commande
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        return PathBuf::from(&args[1]);
    }

    PathBuf::from("/etc/gps-clock-sync/config.toml")
}

/// Charge la configuration ou crée un fichier exemple.
/// Le booléen indique si l'exemple vient d'être créé.
fn load_or_create_config(path: &PathBuf) -> Result<(Config, bool)> {
    if path.exists() {
        return Ok((Config::from_file(path)?, false));
    }

    // Créer le répertoire parent si nécessaire
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }
    }

    // Créer une config exemple
    Config::create_example_config(path)
        .context("Failed to create example config")?;

    // Charger la config créée
    Ok((Config::from_file(path)?, true))
}
