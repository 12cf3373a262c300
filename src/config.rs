use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use anyhow::{Context, Result};

/// Configuration du service de synchronisation d'horloge
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// Port série du récepteur GPS
    #[serde(default)]
    pub serial: SerialConfig,

    /// Driver PPS du noyau
    #[serde(default)]
    pub pps: PpsConfig,

    /// Cadencement de la synchronisation
    #[serde(default)]
    pub sync: SyncConfig,

    /// Configuration des logs
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SerialConfig {
    /// Port série du récepteur (ex: "/dev/ttyS0")
    #[serde(default = "default_serial_port")]
    pub port: String,

    /// Baud rate (4800 pour le récepteur Garmin en NMEA 0183)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PpsConfig {
    /// Fichier spécial du driver PPS
    #[serde(default = "default_pps_device")]
    pub device: String,

    /// Commande de chargement du module noyau, lancée avant l'ouverture
    pub install_command: Option<String>,

    /// Commande de déchargement du module noyau, lancée à l'arrêt
    pub remove_command: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Intervalle entre deux synchronisations UTC (secondes)
    #[serde(default = "default_sync_period")]
    pub sync_period: u64,

    /// Durée d'une fenêtre de mesure de dérive (secondes)
    #[serde(default = "default_drift_measurement_period")]
    pub drift_measurement_period: u64,

    /// Délai entre deux commandes d'initialisation du récepteur (secondes)
    #[serde(default = "default_init_step_delay")]
    pub init_step_delay: u64,

    /// Stabilisation après le premier fix (secondes)
    #[serde(default = "default_first_fix_settle")]
    pub first_fix_settle: u64,

    /// Stabilisation après la mise à l'heure (secondes)
    #[serde(default = "default_time_set_settle")]
    pub time_set_settle: u64,

    /// Période de scrutation du thread GPS (millisecondes)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Commande qui recopie l'heure système dans l'horloge matérielle
    #[serde(default = "default_hwclock_command")]
    pub hwclock_command: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Niveau de log: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Fichier de log (vide = stdout uniquement)
    pub log_file: Option<String>,
}

// Fonctions par défaut pour serde
fn default_serial_port() -> String { "/dev/ttyS0".to_string() }
fn default_baud_rate() -> u32 { 4800 }
fn default_pps_device() -> String { "/dev/gps_pps".to_string() }
fn default_sync_period() -> u64 { 3600 }
fn default_drift_measurement_period() -> u64 { 30 }
fn default_init_step_delay() -> u64 { 2 }
fn default_first_fix_settle() -> u64 { 60 }
fn default_time_set_settle() -> u64 { 5 }
fn default_poll_interval_ms() -> u64 { 9 }
fn default_hwclock_command() -> String { "hwclock --systohc".to_string() }
fn default_log_level() -> String { "info".to_string() }

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
        }
    }
}

impl Default for PpsConfig {
    fn default() -> Self {
        PpsConfig {
            device: default_pps_device(),
            install_command: None,
            remove_command: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            sync_period: default_sync_period(),
            drift_measurement_period: default_drift_measurement_period(),
            init_step_delay: default_init_step_delay(),
            first_fix_settle: default_first_fix_settle(),
            time_set_settle: default_time_set_settle(),
            poll_interval_ms: default_poll_interval_ms(),
            hwclock_command: default_hwclock_command(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            log_file: None,
        }
    }
}

impl Config {
    /// Charge la configuration depuis un fichier TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&content)
            .context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Sauvegarde la configuration dans un fichier TOML
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path.as_ref(), content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Valide la configuration
    fn validate(&self) -> Result<()> {
        if self.serial.port.is_empty() {
            anyhow::bail!("Invalid serial port: must not be empty");
        }
        if self.serial.baud_rate == 0 {
            anyhow::bail!("Invalid baud rate: must be greater than 0");
        }
        if self.pps.device.is_empty() {
            anyhow::bail!("Invalid PPS device: must not be empty");
        }

        if self.sync.sync_period == 0 {
            anyhow::bail!("Invalid sync period: must be greater than 0");
        }
        if self.sync.drift_measurement_period == 0 {
            anyhow::bail!("Invalid drift measurement period: must be greater than 0");
        }
        if self.sync.poll_interval_ms == 0 {
            anyhow::bail!("Invalid poll interval: must be greater than 0");
        }

        Ok(())
    }

    /// Crée un fichier de configuration exemple
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let example_config = Config {
            serial: SerialConfig::default(),
            pps: PpsConfig {
                device: default_pps_device(),
                install_command: Some("/sbin/insmod /lib/modules/gps_pps.ko".to_string()),
                remove_command: Some("/sbin/rmmod gps_pps".to_string()),
            },
            sync: SyncConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                log_file: Some("/var/log/gps-clock-sync.log".to_string()),
            },
        };

        example_config.to_file(path)
    }
}
