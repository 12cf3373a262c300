/*!
Thread d'entrées/sorties GPS

Un seul thread scrute le port série toutes les 9 ms : il assemble et décode
les trames NMEA, tient à jour le fix et l'alimentation du récepteur, fait
avancer la machine d'états de synchronisation et exécute les effets qu'elle
demande sur le driver PPS, le port série et l'horloge système.

Tout l'état du thread vit dans [`GpsIo`], possédé par ce thread seul. Seuls
les indicateurs de démarrage et d'arrêt de [`GpsWorker`] sont partagés, en
atomiques.
*/

use crate::assembler::SentenceAssembler;
use crate::clock::{run_command, ClockControl, SystemClockControl};
use crate::compensator::ClockAdjustment;
use crate::config::Config;
use crate::fix::{FixHandler, FixState};
use crate::measurement::{DriftMeasurer, ErrorMeasurer, MeasurementInvalid};
use crate::nmea::{parse_sentence, GPRMC_TAG, INIT_COMMANDS};
use crate::pps::{GpsPpsDevice, PpsClient, PpsDriver, PpsError, PpsStatus};
use crate::ring_buffer::{ByteQueue, SentenceQueue, BYTE_QUEUE_CAPACITY, SENTENCE_QUEUE_CAPACITY};
use crate::serial::{GpsSerialPort, SerialError, SerialLink};
use crate::sync_state::{transition, Effect, SyncInputs, SyncPhase, SyncState, SyncTimings};
use crate::watchdog::{self, PowerMonitor};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Délai maximal d'attente du démarrage du thread
pub const START_TIMEOUT: Duration = Duration::from_secs(5);

const STATUS_POLL: Duration = Duration::from_millis(10);

/// Taille du tampon de lecture série d'un cycle
const READ_CHUNK: usize = 1024;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("GPS PPS driver initialization failed: {0}")]
    Pps(#[from] PpsError),

    #[error("GPS serial port initialization failed: {0}")]
    Serial(#[from] SerialError),

    #[error("GPS I/O thread failed to initialize")]
    InitFailed,

    #[error("GPS I/O thread did not start within {0:?}")]
    StartTimeout(Duration),

    #[error("Could not spawn GPS I/O thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Contexte du thread GPS
pub struct GpsIo {
    serial: Box<dyn SerialLink>,
    pps: PpsClient,
    clock: Box<dyn ClockControl>,
    remove_command: Option<String>,

    bytes: ByteQueue,
    sentences: SentenceQueue,
    assembler: SentenceAssembler,
    read_buf: Vec<u8>,

    fix: FixState,
    fix_handler: FixHandler,
    drift: DriftMeasurer,
    error: ErrorMeasurer,
    power: PowerMonitor,

    state: SyncState,
    drift_result: Option<Result<f64, MeasurementInvalid>>,
}

impl GpsIo {
    /// Assemble le contexte et remet l'horloge système à sa vitesse nominale.
    ///
    /// `remove_command` est lancée par [`GpsIo::shutdown`] pour décharger le
    /// driver PPS.
    pub fn new(
        serial: Box<dyn SerialLink>,
        driver: Box<dyn PpsDriver>,
        clock: Box<dyn ClockControl>,
        timings: SyncTimings,
        remove_command: Option<String>,
    ) -> Self {
        let mut io = GpsIo {
            serial,
            pps: PpsClient::new(driver),
            clock,
            remove_command,
            bytes: ByteQueue::new(BYTE_QUEUE_CAPACITY),
            sentences: SentenceQueue::new(SENTENCE_QUEUE_CAPACITY),
            assembler: SentenceAssembler::new(),
            read_buf: vec![0; READ_CHUNK],
            fix: FixState::new(),
            fix_handler: FixHandler::new(),
            drift: DriftMeasurer::new(),
            error: ErrorMeasurer::new(),
            power: PowerMonitor::new(),
            state: SyncState::new(timings),
            drift_result: None,
        };
        io.reset_compensation();
        io
    }

    /// Ouvre le driver PPS et le port série décrits par la configuration
    pub fn open(config: &Config) -> Result<Self, WorkerError> {
        if let Some(command) = &config.pps.install_command {
            info!("Installing GPS PPS driver: {}", command);
            if let Err(e) = run_command(command) {
                warn!("GPS PPS driver install command failed: {}", e);
            }
        }

        let opened = GpsPpsDevice::open(&config.pps.device)
            .map_err(WorkerError::from)
            .and_then(|driver| {
                let serial = GpsSerialPort::open(&config.serial.port, config.serial.baud_rate)?;
                Ok((driver, serial))
            });

        let (driver, serial) = match opened {
            Ok(links) => links,
            Err(e) => {
                remove_driver(config.pps.remove_command.as_deref());
                return Err(e);
            }
        };
        info!("Opened {} and {}", config.pps.device, config.serial.port);

        let clock = SystemClockControl::new(&config.sync.hwclock_command);
        Ok(GpsIo::new(
            Box::new(serial),
            Box::new(driver),
            Box::new(clock),
            SyncTimings::from_config(&config.sync),
            config.pps.remove_command.clone(),
        ))
    }

    /// Remet l'horloge système à sa vitesse nominale
    fn reset_compensation(&mut self) {
        if let Err(e) = self.clock.apply(ClockAdjustment::default()) {
            warn!("Could not reset system clock rate: {}", e);
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.state.phase()
    }

    /// Un cycle de scrutation.
    ///
    /// `now` est un compteur monotone en secondes, `wall_time` l'heure UTC
    /// courante utilisée seulement pour le statut publié.
    pub fn tick(&mut self, now: u64, wall_time: i64) {
        self.read_serial(now);
        self.assembler.drain(&mut self.bytes, &mut self.sentences);
        self.handle_sentences(now);

        watchdog::check_fix(&mut self.fix, now);
        let receiver_power = self.power.check(now);
        self.drift.observe_fix(self.fix.has_fix);

        let inputs = SyncInputs {
            now,
            wall_time,
            receiver_power,
            has_fix: self.fix.has_fix,
            time_set_done: self.fix_handler.time_set_done(),
            drift_result: self.drift_result.take(),
            error_result: self.error.take_result(),
        };

        let (state, effects) = transition(self.state.clone(), &inputs);
        self.state = state;

        for effect in effects {
            self.execute(effect);
        }
    }

    fn read_serial(&mut self, now: u64) {
        let n = match self.serial.read_available(&mut self.read_buf) {
            Ok(n) => n,
            Err(e) => {
                warn!("Serial read failed: {}", e);
                return;
            }
        };
        if n == 0 {
            return;
        }

        self.power.note_traffic(now);
        if let Err(e) = self.bytes.enqueue(&self.read_buf[..n]) {
            debug!("GPS byte queue flushed: {}", e);
        }
    }

    fn handle_sentences(&mut self, now: u64) {
        while let Some(sentence) = self.sentences.pop() {
            let fields = parse_sentence(sentence.as_bytes());
            if fields.tag() != GPRMC_TAG {
                debug!("Ignoring sentence {}", sentence.display());
                continue;
            }
            self.fix_handler.handle_gprmc(
                &fields,
                now,
                &mut self.fix,
                &mut self.pps,
                &mut self.error,
            );
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::FlushQueues => {
                if !self.bytes.is_empty() || !self.sentences.is_empty() {
                    debug!(
                        "Flushing {} queued bytes and {} queued sentences",
                        self.bytes.len(),
                        self.sentences.len()
                    );
                }
                self.bytes.flush();
                self.sentences.flush();
                self.assembler.reset();
            }
            Effect::SendInit(index) => {
                let Some(command) = INIT_COMMANDS.get(index) else {
                    error!("No GPS init command #{}", index);
                    return;
                };
                debug!("Sending GPS init command #{}", index + 1);
                if let Err(e) = self.serial.write_all(command) {
                    warn!("Could not send GPS init command #{}: {}", index + 1, e);
                }
            }
            Effect::ClearFix => self.fix.has_fix = false,
            Effect::AbortDrift => self.drift.abort(&mut self.pps),
            Effect::StartDrift => self.drift.start(&mut self.pps),
            Effect::FinishDrift => self.drift_result = Some(self.drift.stop(&mut self.pps)),
            Effect::RequestTimeSet => self.fix_handler.request_time_set(),
            Effect::StartError => self.error.start(),
            Effect::ApplyCompensation(adjustment) => {
                info!(
                    "Applying clock compensation: {:.9} s/s (tick={}, freq={})",
                    adjustment.rate(),
                    adjustment.tick,
                    adjustment.freq
                );
                if let Err(e) = self.clock.apply(adjustment) {
                    warn!("Could not set system clock rate: {}", e);
                }
            }
            Effect::PersistHardwareClock => {
                if let Err(e) = self.clock.persist_hardware_clock() {
                    warn!("Could not set hardware clock: {}", e);
                }
            }
            Effect::StartPseudoPps => {
                self.pps.start_pseudo_pps();
            }
            Effect::PublishStatus {
                time_of_last_sync,
                error,
            } => {
                let status = PpsStatus::new(
                    time_of_last_sync,
                    error,
                    &self.fix.latitude,
                    &self.fix.longitude,
                );
                self.pps.publish_status(&status);
            }
        }
    }

    /// Ferme le port série (configuration restaurée), le driver PPS, puis
    /// décharge le driver
    pub fn shutdown(mut self) {
        info!(
            "GPS I/O stopping in phase {:?}, {} invalid fragments discarded",
            self.phase(),
            self.assembler.discarded()
        );
        self.serial.close();
        let remove_command = self.remove_command.take();
        drop(self);
        remove_driver(remove_command.as_deref());
    }
}

fn remove_driver(command: Option<&str>) {
    if let Some(command) = command {
        info!("Removing GPS PPS driver: {}", command);
        if let Err(e) = run_command(command) {
            warn!("GPS PPS driver remove command failed: {}", e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum WorkerStatus {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Failed = 3,
}

impl WorkerStatus {
    fn load(status: &AtomicU8) -> Self {
        match status.load(Ordering::SeqCst) {
            1 => WorkerStatus::Starting,
            2 => WorkerStatus::Running,
            3 => WorkerStatus::Failed,
            _ => WorkerStatus::Stopped,
        }
    }

    fn store(self, status: &AtomicU8) {
        status.store(self as u8, Ordering::SeqCst);
    }
}

/// Gestion du cycle de vie du thread GPS
pub struct GpsWorker {
    poll_interval: Duration,
    status: Arc<AtomicU8>,
    stop_requested: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl GpsWorker {
    pub fn new(poll_interval: Duration) -> Self {
        GpsWorker {
            poll_interval,
            status: Arc::new(AtomicU8::new(WorkerStatus::Stopped as u8)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Vrai tant que le thread tourne ; faux après un arrêt ou un échec
    pub fn is_running(&self) -> bool {
        WorkerStatus::load(&self.status) == WorkerStatus::Running
    }

    /// Démarre le thread sur le matériel décrit par la configuration
    pub fn start(&mut self, config: &Config) -> Result<(), WorkerError> {
        let config = config.clone();
        self.start_with(move || GpsIo::open(&config))
    }

    /// Démarre le thread avec un contexte construit par `open` dans le thread,
    /// et attend qu'il soit prêt
    pub fn start_with<F>(&mut self, open: F) -> Result<(), WorkerError>
    where
        F: FnOnce() -> Result<GpsIo, WorkerError> + Send + 'static,
    {
        info!("Starting GPS I/O thread");
        WorkerStatus::Starting.store(&self.status);
        self.stop_requested.store(false, Ordering::SeqCst);

        let status = Arc::clone(&self.status);
        let stop_requested = Arc::clone(&self.stop_requested);
        let poll_interval = self.poll_interval;

        let handle = std::thread::Builder::new()
            .name("gps-io".to_string())
            .spawn(move || {
                let mut io = match open() {
                    Ok(io) => io,
                    Err(e) => {
                        error!("GPS I/O initialization failed: {}", e);
                        WorkerStatus::Failed.store(&status);
                        return;
                    }
                };
                WorkerStatus::Running.store(&status);
                info!("GPS I/O thread running");

                let started = Instant::now();
                while !stop_requested.load(Ordering::SeqCst) {
                    io.tick(started.elapsed().as_secs(), chrono::Utc::now().timestamp());
                    std::thread::sleep(poll_interval);
                }

                io.shutdown();
                WorkerStatus::Stopped.store(&status);
                info!("GPS I/O thread terminated");
            })
            .map_err(WorkerError::Spawn)?;
        self.handle = Some(handle);

        let deadline = Instant::now() + START_TIMEOUT;
        loop {
            match WorkerStatus::load(&self.status) {
                WorkerStatus::Running => return Ok(()),
                WorkerStatus::Failed => {
                    self.join();
                    return Err(WorkerError::InitFailed);
                }
                _ => {}
            }
            if Instant::now() > deadline {
                // Le thread s'arrêtera de lui-même s'il finit par démarrer
                self.stop_requested.store(true, Ordering::SeqCst);
                return Err(WorkerError::StartTimeout(START_TIMEOUT));
            }
            std::thread::sleep(STATUS_POLL);
        }
    }

    /// Demande l'arrêt et attend la fin du démontage
    pub fn stop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        info!("Stopping GPS I/O thread");
        self.stop_requested.store(true, Ordering::SeqCst);

        while WorkerStatus::load(&self.status) == WorkerStatus::Running {
            std::thread::sleep(STATUS_POLL);
        }
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("GPS I/O thread panicked");
            }
        }
    }
}

impl Drop for GpsWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RecordingClock;
    use crate::pps::{DriftMeasurement, PpsRequest, SimulatedPps, Timeval};
    use crate::serial::ScriptedSerial;

    const FIX_RMC: &[u8] =
        b"$GPRMC,134724,A,4217.6448,N,08342.6906,W,001.0,231.8,180510,006.6,W*7F\r\n";
    const UTC: i64 = 1_274_190_444;

    struct Rig {
        serial: ScriptedSerial,
        pps: SimulatedPps,
        clock: RecordingClock,
        io: GpsIo,
    }

    impl Rig {
        fn new() -> Self {
            let serial = ScriptedSerial::new();
            let pps = SimulatedPps::new();
            let clock = RecordingClock::new();
            pps.with(|s| {
                s.drift = DriftMeasurement {
                    begin_sys_time: Timeval::new(1_000, 0),
                    end_sys_time: Timeval::new(1_030, 300),
                    gps_seconds: 30,
                };
                s.time_at_last_pulse = Timeval::new(UTC, 3_000);
            });
            let io = GpsIo::new(
                Box::new(serial.clone()),
                Box::new(pps.clone()),
                Box::new(clock.clone()),
                SyncTimings::default(),
                None,
            );
            Rig { serial, pps, clock, io }
        }

        /// Un cycle par seconde, une trame $GPRMC par seconde
        fn run_with_fix(&mut self, from: u64, until_phase: SyncPhase, max_secs: u64) -> u64 {
            for now in from..from + max_secs {
                if self.io.phase() == until_phase {
                    return now;
                }
                self.serial.push_input(FIX_RMC);
                self.io.tick(now, UTC + now as i64);
            }
            from + max_secs
        }
    }

    #[test]
    fn test_idle_without_receiver_traffic() {
        let mut rig = Rig::new();
        for now in 0..20 {
            rig.io.tick(now, UTC);
        }
        assert_eq!(rig.io.phase(), SyncPhase::WaitForPower);
        assert!(rig.serial.written().is_empty());
    }

    #[test]
    fn test_full_sync_cycle() {
        let mut rig = Rig::new();
        let now = rig.run_with_fix(0, SyncPhase::WaitForNextSync, 600);
        assert_eq!(rig.io.phase(), SyncPhase::WaitForNextSync);

        let expected: Vec<u8> = INIT_COMMANDS.concat();
        assert_eq!(rig.serial.written(), expected);

        assert_eq!(rig.pps.count(PpsRequest::SetTime), 1);
        assert_eq!(rig.pps.with(|s| s.time_set), Some(Timeval::from_secs(UTC + 1)));
        assert_eq!(rig.pps.count(PpsRequest::StartPseudoPps), 1);
        assert_eq!(rig.pps.count(PpsRequest::GetDrift), 5);

        let applied = rig.clock.applied();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0], ClockAdjustment::default());
        let comp = rig.io.state.compensation();
        assert!((comp.drift_rate - 1e-5).abs() < 1e-9);
        assert!((comp.error - 0.003).abs() < 1e-9);
        assert_eq!(applied[1], ClockAdjustment::from_rate(comp.total_rate()));
        assert_eq!(rig.clock.persist_count(), 1);

        let status = rig.pps.with(|s| s.status.clone()).unwrap();
        assert_eq!(status.error, "0.003000");
        assert_eq!(status.latitude, "4217.6448");
        assert_eq!(status.longitude, "-08342.6906");
        assert_eq!(status.time_of_last_sync, UTC + now as i64 - 1);
    }

    #[test]
    fn test_receiver_power_loss_restarts_sequence() {
        let mut rig = Rig::new();
        let now = rig.run_with_fix(0, SyncPhase::MeasureDrift, 200);
        assert_eq!(rig.io.phase(), SyncPhase::MeasureDrift);

        // Plus aucun octet : alimentation perdue après 5 s
        for t in now..now + 7 {
            rig.io.tick(t, UTC);
        }
        assert_eq!(rig.io.phase(), SyncPhase::WaitForPower);
        assert!(!rig.io.fix.has_fix);

        let before = rig.serial.written().len();
        rig.run_with_fix(now + 7, SyncPhase::Init1, 3);
        let after = rig.serial.written();
        assert_eq!(&after[before..], INIT_COMMANDS[0]);
    }

    #[test]
    fn test_serial_read_error_counts_as_silence() {
        let mut rig = Rig::new();
        rig.serial.state.lock().unwrap().fail_reads = true;
        rig.serial.push_input(FIX_RMC);
        rig.io.tick(0, UTC);
        assert_eq!(rig.io.phase(), SyncPhase::WaitForPower);
        assert!(!rig.io.fix.has_fix);
    }

    #[test]
    fn test_worker_start_and_stop() {
        let rig = Rig::new();
        let serial = rig.serial.clone();
        let io = rig.io;

        let mut worker = GpsWorker::new(Duration::from_millis(1));
        worker.start_with(move || Ok(io)).unwrap();
        assert!(worker.is_running());

        worker.stop();
        assert!(!worker.is_running());
        assert!(serial.is_closed());
    }

    #[test]
    fn test_worker_init_failure_is_reported() {
        let mut worker = GpsWorker::new(Duration::from_millis(1));
        let result = worker.start_with(|| Err(WorkerError::Pps(PpsError::Unsupported)));
        assert!(matches!(result, Err(WorkerError::InitFailed)));
        assert!(!worker.is_running());
    }

    #[test]
    fn test_open_missing_device_fails() {
        let mut config = Config::default();
        config.pps.device = "/nonexistent/gps_pps".to_string();
        assert!(matches!(GpsIo::open(&config), Err(WorkerError::Pps(_))));
    }

    fn marker_path(tag: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "gps-clock-sync-{}-{}",
            std::process::id(),
            tag
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn test_new_context_resets_clock_rate() {
        let rig = Rig::new();
        assert_eq!(
            rig.clock.applied(),
            vec![ClockAdjustment { tick: 10_000, freq: 0 }]
        );
        assert_eq!(rig.clock.persist_count(), 0);
    }

    #[test]
    fn test_failed_open_still_removes_driver() {
        let installed = marker_path("installed");
        let removed = marker_path("removed");

        let mut config = Config::default();
        config.pps.device = "/nonexistent/gps_pps".to_string();
        config.pps.install_command = Some(format!("touch {}", installed.display()));
        config.pps.remove_command = Some(format!("touch {}", removed.display()));

        assert!(matches!(GpsIo::open(&config), Err(WorkerError::Pps(_))));
        assert!(installed.exists());
        assert!(removed.exists());

        let _ = std::fs::remove_file(&installed);
        let _ = std::fs::remove_file(&removed);
    }

    #[test]
    fn test_shutdown_closes_port_and_removes_driver() {
        let removed = marker_path("shutdown");
        let serial = ScriptedSerial::new();
        let io = GpsIo::new(
            Box::new(serial.clone()),
            Box::new(SimulatedPps::new()),
            Box::new(RecordingClock::new()),
            SyncTimings::default(),
            Some(format!("touch {}", removed.display())),
        );

        assert!(!removed.exists());
        io.shutdown();
        assert!(serial.is_closed());
        assert!(removed.exists());

        let _ = std::fs::remove_file(&removed);
    }
}
