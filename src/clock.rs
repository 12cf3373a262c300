use crate::compensator::ClockAdjustment;
use std::process::Command;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ClockError {
    #[error("adjtimex() failed: {0}")]
    Adjtimex(#[source] std::io::Error),

    #[error("Hardware clock command '{command}' could not be run: {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Hardware clock command '{command}' exited with {status}")]
    CommandFailed { command: String, status: String },

    #[error("No hardware clock command configured")]
    NoCommand,

    #[error("Clock rate adjustment is not supported on this platform")]
    #[cfg_attr(target_os = "linux", allow(dead_code))]
    Unsupported,
}

/// Réglage de la vitesse de l'horloge système et sauvegarde dans l'horloge matérielle
pub trait ClockControl: Send {
    /// Applique `tick` et `freq` (voir adjtimex(2))
    fn apply(&mut self, adjustment: ClockAdjustment) -> Result<(), ClockError>;

    /// Recopie l'heure système dans l'horloge matérielle (RTC)
    fn persist_hardware_clock(&mut self) -> Result<(), ClockError>;
}

/// Horloge système Linux pilotée par adjtimex
pub struct SystemClockControl {
    hwclock_command: String,
}

impl SystemClockControl {
    pub fn new(hwclock_command: &str) -> Self {
        SystemClockControl {
            hwclock_command: hwclock_command.to_string(),
        }
    }

    #[cfg(target_os = "linux")]
    fn adjtimex(params: &mut libc::timex) -> Result<(), ClockError> {
        // SAFETY: `params` est une structure timex valide et exclusive
        let ret = unsafe { libc::adjtimex(params as *mut libc::timex) };
        if ret < 0 {
            return Err(ClockError::Adjtimex(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// Lance une commande shell simple (programme + arguments séparés par des espaces)
pub fn run_command(command: &str) -> Result<(), ClockError> {
    let mut parts = command.split_whitespace();
    let program = parts.next().ok_or(ClockError::NoCommand)?;

    let status = Command::new(program)
        .args(parts)
        .status()
        .map_err(|source| ClockError::CommandSpawn {
            command: command.to_string(),
            source,
        })?;

    if !status.success() {
        return Err(ClockError::CommandFailed {
            command: command.to_string(),
            status: status.to_string(),
        });
    }
    Ok(())
}

impl ClockControl for SystemClockControl {
    #[cfg(target_os = "linux")]
    fn apply(&mut self, adjustment: ClockAdjustment) -> Result<(), ClockError> {
        // SAFETY: timex est une structure C sans invariant, zéro est valide
        let mut params: libc::timex = unsafe { std::mem::zeroed() };

        // Lecture seule d'abord, pour conserver les autres paramètres
        params.modes = 0;
        Self::adjtimex(&mut params)?;

        params.tick = adjustment.tick as _;
        params.freq = adjustment.freq as _;
        params.modes = (libc::ADJ_FREQUENCY | libc::ADJ_TICK) as _;
        Self::adjtimex(&mut params)?;

        debug!(
            "Clock rate set: tick={}, freq={}",
            adjustment.tick, adjustment.freq
        );
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn apply(&mut self, _adjustment: ClockAdjustment) -> Result<(), ClockError> {
        Err(ClockError::Unsupported)
    }

    fn persist_hardware_clock(&mut self) -> Result<(), ClockError> {
        run_command(&self.hwclock_command)?;
        debug!("Hardware clock set from system time");
        Ok(())
    }
}

/// Horloge factice qui mémorise les réglages demandés
#[cfg(test)]
#[derive(Clone, Default)]
pub struct RecordingClock {
    pub applied: std::sync::Arc<std::sync::Mutex<Vec<ClockAdjustment>>>,
    pub persisted: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl RecordingClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Vec<ClockAdjustment> {
        self.applied.lock().unwrap().clone()
    }

    pub fn persist_count(&self) -> usize {
        self.persisted.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl ClockControl for RecordingClock {
    fn apply(&mut self, adjustment: ClockAdjustment) -> Result<(), ClockError> {
        self.applied.lock().unwrap().push(adjustment);
        Ok(())
    }

    fn persist_hardware_clock(&mut self) -> Result<(), ClockError> {
        self.persisted
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
