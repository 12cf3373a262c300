/*!
Interface avec le driver PPS (`/dev/gps_pps`)

Le driver noyau horodate chaque front PPS du récepteur GPS. Il est piloté par
sept requêtes ioctl : mesure de dérive (start/stop/get), mise à l'heure au
prochain front, lecture de l'heure système au dernier front, génération d'un
pseudo-PPS et publication d'un statut lisible dans `/proc/gps_pps`.

Le trait [`PpsDriver`] décrit ce contrat ; [`GpsPpsDevice`] l'implémente par
ioctl et [`PpsClient`] journalise les échecs sans jamais réessayer.
*/

use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Taille des chaînes du statut publié (terminateur compris)
pub const STATUS_STRING_SIZE: usize = 32;

/// Requêtes de contrôle acceptées par le driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PpsRequest {
    StartDrift,
    StopDrift,
    GetDrift,
    SetTime,
    GetTime,
    StartPseudoPps,
    SetStatus,
}

impl PpsRequest {
    /// Numéro ioctl de la requête
    fn number(self) -> u32 {
        match self {
            PpsRequest::StartDrift => 1,
            PpsRequest::StopDrift => 2,
            PpsRequest::GetDrift => 3,
            PpsRequest::SetTime => 4,
            PpsRequest::GetTime => 5,
            PpsRequest::StartPseudoPps => 6,
            PpsRequest::SetStatus => 7,
        }
    }
}

impl fmt::Display for PpsRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PpsRequest::StartDrift => "GPS_PPS_IOC_START_DRIFT",
            PpsRequest::StopDrift => "GPS_PPS_IOC_STOP_DRIFT",
            PpsRequest::GetDrift => "GPS_PPS_IOC_GET_DRIFT",
            PpsRequest::SetTime => "GPS_PPS_IOC_SET_TIME",
            PpsRequest::GetTime => "GPS_PPS_IOC_GET_TIME",
            PpsRequest::StartPseudoPps => "GPS_PPS_IOC_START_PSEUDO_PPS",
            PpsRequest::SetStatus => "GPS_PPS_IOC_SET_PROC_STATUS",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum PpsError {
    #[error("Could not open the GPS PPS driver {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ioctl {request} failed: {source}")]
    Request {
        request: PpsRequest,
        #[source]
        source: std::io::Error,
    },

    #[error("GPS PPS driver is not supported on this platform")]
    #[cfg_attr(target_os = "linux", allow(dead_code))]
    Unsupported,
}

/// Heure système en secondes + microsecondes (équivalent `struct timeval`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeval {
    pub sec: i64,
    pub usec: i64,
}

impl Timeval {
    pub fn new(sec: i64, usec: i64) -> Self {
        Timeval { sec, usec }
    }

    pub fn from_secs(sec: i64) -> Self {
        Timeval { sec, usec: 0 }
    }
}

/// Résultat brut d'une mesure de dérive, produit par le driver à l'arrêt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriftMeasurement {
    /// Heure système au premier front PPS de la mesure
    pub begin_sys_time: Timeval,
    /// Heure système au dernier front PPS de la mesure
    pub end_sys_time: Timeval,
    /// Nombre de secondes GPS (fronts PPS) entre les deux
    pub gps_seconds: u32,
}

/// Statut exporté pour les autres processus via `/proc/gps_pps`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PpsStatus {
    /// Heure de la dernière synchronisation UTC (secondes depuis 1970)
    pub time_of_last_sync: i64,
    /// Erreur de l'horloge système à la dernière synchronisation
    pub error: String,
    pub latitude: String,
    pub longitude: String,
}

impl PpsStatus {
    pub fn new(time_of_last_sync: i64, error_secs: f64, latitude: &str, longitude: &str) -> Self {
        // Le noyau ne formate pas les flottants : l'erreur est passée en texte
        PpsStatus {
            time_of_last_sync,
            error: format!("{:.6}", error_secs),
            latitude: latitude.to_string(),
            longitude: longitude.to_string(),
        }
    }
}

/// Contrat de contrôle du driver PPS
pub trait PpsDriver: Send {
    fn start_drift(&mut self) -> Result<(), PpsError>;

    fn stop_drift(&mut self) -> Result<(), PpsError>;

    fn get_drift(&mut self) -> Result<DriftMeasurement, PpsError>;

    /// Demande au driver de régler l'heure système à `time` au prochain front PPS
    fn set_time_at_next_pulse(&mut self, time: Timeval) -> Result<(), PpsError>;

    /// Heure système mémorisée au dernier front PPS
    fn get_time_at_last_pulse(&mut self) -> Result<Timeval, PpsError>;

    fn start_pseudo_pps(&mut self) -> Result<(), PpsError>;

    fn publish_status(&mut self, status: &PpsStatus) -> Result<(), PpsError>;
}

/// Copie `s` dans un tampon C terminé par NUL, tronqué si nécessaire
fn to_c_string(s: &str) -> [libc::c_char; STATUS_STRING_SIZE] {
    let mut out = [0 as libc::c_char; STATUS_STRING_SIZE];
    for (dst, src) in out.iter_mut().zip(s.bytes().take(STATUS_STRING_SIZE - 1)) {
        *dst = src as libc::c_char;
    }
    out
}

#[repr(C)]
struct RawDriftMeasurement {
    begin_sys_time: libc::timeval,
    end_sys_time: libc::timeval,
    gps_seconds: u32,
}

#[repr(C)]
struct RawPpsStatus {
    time_of_last_sync: libc::c_int,
    error: [libc::c_char; STATUS_STRING_SIZE],
    latitude: [libc::c_char; STATUS_STRING_SIZE],
    longitude: [libc::c_char; STATUS_STRING_SIZE],
}

const GPS_PPS_IOC_MAGIC: u32 = 0xD7;

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

/// Encodage Linux des numéros ioctl (`_IO`, `_IOR`, `_IOW`)
const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | (GPS_PPS_IOC_MAGIC << 8) | nr
}

fn request_code(request: PpsRequest) -> u32 {
    let nr = request.number();
    match request {
        PpsRequest::StartDrift | PpsRequest::StopDrift | PpsRequest::StartPseudoPps => {
            ioc(IOC_NONE, nr, 0)
        }
        PpsRequest::GetDrift => ioc(IOC_READ, nr, std::mem::size_of::<RawDriftMeasurement>()),
        PpsRequest::SetTime => ioc(IOC_WRITE, nr, std::mem::size_of::<libc::timeval>()),
        PpsRequest::GetTime => ioc(IOC_READ, nr, std::mem::size_of::<libc::timeval>()),
        PpsRequest::SetStatus => ioc(IOC_WRITE, nr, std::mem::size_of::<RawPpsStatus>()),
    }
}

fn to_timeval(t: Timeval) -> libc::timeval {
    libc::timeval {
        tv_sec: t.sec as _,
        tv_usec: t.usec as _,
    }
}

fn from_timeval(t: &libc::timeval) -> Timeval {
    Timeval::new(t.tv_sec as i64, t.tv_usec as i64)
}

/// Driver PPS noyau accédé par ioctl
pub struct GpsPpsDevice {
    file: std::fs::File,
}

impl GpsPpsDevice {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PpsError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|source| PpsError::Open {
                path: path.as_ref().display().to_string(),
                source,
            })?;

        debug!("GPS PPS driver opened: {}", path.as_ref().display());
        Ok(GpsPpsDevice { file })
    }

    #[cfg(target_os = "linux")]
    fn ioctl<T>(&self, request: PpsRequest, arg: *mut T) -> Result<(), PpsError> {
        use std::os::unix::io::AsRawFd;

        let code = request_code(request);
        // SAFETY: `arg` est nul ou pointe vers une structure #[repr(C)] de la
        // taille encodée dans `code`, valide pendant tout l'appel.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), code as _, arg) };
        if ret < 0 {
            return Err(PpsError::Request {
                request,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn ioctl<T>(&self, _request: PpsRequest, _arg: *mut T) -> Result<(), PpsError> {
        let _ = &self.file;
        Err(PpsError::Unsupported)
    }

    fn ioctl_none(&self, request: PpsRequest) -> Result<(), PpsError> {
        self.ioctl(request, std::ptr::null_mut::<libc::c_void>())
    }
}

impl PpsDriver for GpsPpsDevice {
    fn start_drift(&mut self) -> Result<(), PpsError> {
        self.ioctl_none(PpsRequest::StartDrift)
    }

    fn stop_drift(&mut self) -> Result<(), PpsError> {
        self.ioctl_none(PpsRequest::StopDrift)
    }

    fn get_drift(&mut self) -> Result<DriftMeasurement, PpsError> {
        let zero = to_timeval(Timeval::default());
        let mut raw = RawDriftMeasurement {
            begin_sys_time: zero,
            end_sys_time: zero,
            gps_seconds: 0,
        };
        self.ioctl(PpsRequest::GetDrift, &mut raw as *mut RawDriftMeasurement)?;

        Ok(DriftMeasurement {
            begin_sys_time: from_timeval(&raw.begin_sys_time),
            end_sys_time: from_timeval(&raw.end_sys_time),
            gps_seconds: raw.gps_seconds,
        })
    }

    fn set_time_at_next_pulse(&mut self, time: Timeval) -> Result<(), PpsError> {
        let mut raw = to_timeval(time);
        self.ioctl(PpsRequest::SetTime, &mut raw as *mut libc::timeval)
    }

    fn get_time_at_last_pulse(&mut self) -> Result<Timeval, PpsError> {
        let mut raw = to_timeval(Timeval::default());
        self.ioctl(PpsRequest::GetTime, &mut raw as *mut libc::timeval)?;
        Ok(from_timeval(&raw))
    }

    fn start_pseudo_pps(&mut self) -> Result<(), PpsError> {
        self.ioctl_none(PpsRequest::StartPseudoPps)
    }

    fn publish_status(&mut self, status: &PpsStatus) -> Result<(), PpsError> {
        let mut raw = RawPpsStatus {
            time_of_last_sync: status.time_of_last_sync as libc::c_int,
            error: to_c_string(&status.error),
            latitude: to_c_string(&status.latitude),
            longitude: to_c_string(&status.longitude),
        };
        self.ioctl(PpsRequest::SetStatus, &mut raw as *mut RawPpsStatus)
    }
}

/// Adaptateur qui émet les requêtes et journalise chaque échec.
///
/// Aucune requête n'est réessayée : ce sont les temporisations de la machine
/// d'états qui rythment les nouvelles tentatives.
pub struct PpsClient {
    driver: Box<dyn PpsDriver>,
}

impl PpsClient {
    pub fn new(driver: Box<dyn PpsDriver>) -> Self {
        PpsClient { driver }
    }

    fn report<T>(result: Result<T, PpsError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    pub fn start_drift(&mut self) -> bool {
        Self::report(self.driver.start_drift()).is_some()
    }

    pub fn stop_drift(&mut self) -> bool {
        Self::report(self.driver.stop_drift()).is_some()
    }

    pub fn get_drift(&mut self) -> Option<DriftMeasurement> {
        Self::report(self.driver.get_drift())
    }

    pub fn set_time_at_next_pulse(&mut self, time: Timeval) -> bool {
        Self::report(self.driver.set_time_at_next_pulse(time)).is_some()
    }

    pub fn get_time_at_last_pulse(&mut self) -> Option<Timeval> {
        Self::report(self.driver.get_time_at_last_pulse())
    }

    pub fn start_pseudo_pps(&mut self) -> bool {
        Self::report(self.driver.start_pseudo_pps()).is_some()
    }

    pub fn publish_status(&mut self, status: &PpsStatus) -> bool {
        Self::report(self.driver.publish_status(status)).is_some()
    }
}

/// Driver PPS simulé, partagé avec le test pour inspection
#[cfg(test)]
#[derive(Clone, Default)]
pub struct SimulatedPps {
    pub state: std::sync::Arc<std::sync::Mutex<SimulatedPpsState>>,
}

#[cfg(test)]
#[derive(Default)]
pub struct SimulatedPpsState {
    pub requests: Vec<PpsRequest>,
    pub failing: std::collections::HashSet<PpsRequest>,
    pub drift: DriftMeasurement,
    pub time_at_last_pulse: Timeval,
    pub time_set: Option<Timeval>,
    pub status: Option<PpsStatus>,
    pub drift_running: bool,
}

#[cfg(test)]
impl SimulatedPps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SimulatedPpsState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn count(&self, request: PpsRequest) -> usize {
        self.with(|s| s.requests.iter().filter(|r| **r == request).count())
    }

    fn record(&self, request: PpsRequest) -> Result<(), PpsError> {
        self.with(|s| {
            s.requests.push(request);
            if s.failing.contains(&request) {
                Err(PpsError::Request {
                    request,
                    source: std::io::Error::from_raw_os_error(libc::EIO),
                })
            } else {
                Ok(())
            }
        })
    }
}

#[cfg(test)]
impl PpsDriver for SimulatedPps {
    fn start_drift(&mut self) -> Result<(), PpsError> {
        self.record(PpsRequest::StartDrift)?;
        self.with(|s| s.drift_running = true);
        Ok(())
    }

    fn stop_drift(&mut self) -> Result<(), PpsError> {
        self.record(PpsRequest::StopDrift)?;
        self.with(|s| s.drift_running = false);
        Ok(())
    }

    fn get_drift(&mut self) -> Result<DriftMeasurement, PpsError> {
        self.record(PpsRequest::GetDrift)?;
        Ok(self.with(|s| s.drift))
    }

    fn set_time_at_next_pulse(&mut self, time: Timeval) -> Result<(), PpsError> {
        self.record(PpsRequest::SetTime)?;
        self.with(|s| s.time_set = Some(time));
        Ok(())
    }

    fn get_time_at_last_pulse(&mut self) -> Result<Timeval, PpsError> {
        self.record(PpsRequest::GetTime)?;
        Ok(self.with(|s| s.time_at_last_pulse))
    }

    fn start_pseudo_pps(&mut self) -> Result<(), PpsError> {
        self.record(PpsRequest::StartPseudoPps)
    }

    fn publish_status(&mut self, status: &PpsStatus) -> Result<(), PpsError> {
        self.record(PpsRequest::SetStatus)?;
        self.with(|s| s.status = Some(status.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_numbers() {
        assert_eq!(request_code(PpsRequest::StartDrift), 0xD701);
        assert_eq!(request_code(PpsRequest::StopDrift), 0xD702);
        assert_eq!(request_code(PpsRequest::StartPseudoPps), 0xD706);

        let get_time = request_code(PpsRequest::GetTime);
        assert_eq!(get_time >> 30, IOC_READ);
        assert_eq!((get_time >> 16) & 0x3FFF, std::mem::size_of::<libc::timeval>() as u32);
        assert_eq!(get_time & 0xFFFF, 0xD705);

        let set_status = request_code(PpsRequest::SetStatus);
        assert_eq!(set_status >> 30, IOC_WRITE);
        assert_eq!(set_status & 0xFF, 7);
    }

    #[test]
    fn test_status_strings_are_truncated() {
        let long = "x".repeat(100);
        let c = to_c_string(&long);
        assert_eq!(c[STATUS_STRING_SIZE - 1], 0);
        assert_eq!(c[0], b'x' as libc::c_char);

        let short = to_c_string("-4217.6448");
        assert_eq!(short[0], b'-' as libc::c_char);
        assert_eq!(short[10], 0);
    }

    #[test]
    fn test_status_error_formatting() {
        let status = PpsStatus::new(1_274_190_444, -0.0125, "4217.6448", "-08342.6906");
        assert_eq!(status.error, "-0.012500");
        assert_eq!(status.longitude, "-08342.6906");
    }

    #[test]
    fn test_client_reports_failures() {
        let sim = SimulatedPps::new();
        sim.with(|s| {
            s.failing.insert(PpsRequest::GetTime);
        });
        let mut client = PpsClient::new(Box::new(sim.clone()));

        assert!(client.start_drift());
        assert_eq!(client.get_time_at_last_pulse(), None);
        assert_eq!(sim.count(PpsRequest::GetTime), 1);
        assert_eq!(sim.count(PpsRequest::StartDrift), 1);
    }

    #[test]
    fn test_request_names() {
        assert_eq!(PpsRequest::SetTime.to_string(), "GPS_PPS_IOC_SET_TIME");
        assert_eq!(PpsRequest::SetStatus.to_string(), "GPS_PPS_IOC_SET_PROC_STATUS");
    }
}
