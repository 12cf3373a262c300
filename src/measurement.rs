use crate::pps::{DriftMeasurement, PpsClient, Timeval};
use thiserror::Error;
use tracing::debug;

/// Écart maximal toléré entre durée système et durée GPS d'une fenêtre (s)
const MAX_WINDOW_DRIFT_SECS: f64 = 0.5;

/// Raisons pour lesquelles une mesure est rejetée et recommencée
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum MeasurementInvalid {
    #[error("measurement window too short (sys {sys_elapsed:.6}s, gps {gps_seconds}s)")]
    TooShort { sys_elapsed: f64, gps_seconds: u32 },

    #[error("drift of {drift_secs:.6}s during window is not plausible")]
    ExcessiveDrift { drift_secs: f64 },

    #[error("GPS fix lost during measurement window")]
    LostFix,

    #[error("PPS driver did not return a measurement")]
    DriverFailure,
}

/// Secondes écoulées de `x` à `y` (positif si `x` < `y`)
pub fn elapsed_secs(x: Timeval, y: Timeval) -> f64 {
    const MILLION: f64 = 1_000_000.0;

    let x_usecs = x.sec as f64 * MILLION + x.usec as f64;
    let y_usecs = y.sec as f64 * MILLION + y.usec as f64;
    (y_usecs - x_usecs) / MILLION
}

/// Taux de dérive de l'horloge système en s/s, positif si elle avance sur UTC
pub fn calc_drift_rate(meas: &DriftMeasurement) -> Result<f64, MeasurementInvalid> {
    let sys_elapsed = elapsed_secs(meas.begin_sys_time, meas.end_sys_time);
    let utc_secs = meas.gps_seconds as f64;
    let drift_secs = sys_elapsed - utc_secs;

    if sys_elapsed < 1.0 || utc_secs < 1.0 {
        return Err(MeasurementInvalid::TooShort {
            sys_elapsed,
            gps_seconds: meas.gps_seconds,
        });
    }
    if drift_secs.abs() > MAX_WINDOW_DRIFT_SECS {
        return Err(MeasurementInvalid::ExcessiveDrift { drift_secs });
    }

    Ok(drift_secs / utc_secs)
}

/// Pilote une fenêtre de mesure de dérive auprès du driver PPS
#[derive(Debug, Default)]
pub struct DriftMeasurer {
    measuring: bool,
    lost_fix: bool,
}

impl DriftMeasurer {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn is_measuring(&self) -> bool {
        self.measuring
    }

    pub fn start(&mut self, pps: &mut PpsClient) {
        debug!("Starting system clock drift rate measurement");
        pps.start_drift();
        self.measuring = true;
        self.lost_fix = false;
    }

    /// Arrête une éventuelle mesure en cours sans en lire le résultat
    pub fn abort(&mut self, pps: &mut PpsClient) {
        pps.stop_drift();
        self.measuring = false;
    }

    /// Appelé à chaque cycle pendant la fenêtre : mémorise toute perte du fix
    pub fn observe_fix(&mut self, has_fix: bool) {
        if self.measuring && !has_fix {
            self.lost_fix = true;
        }
    }

    /// Arrête la mesure, lit le résultat du driver et calcule le taux
    pub fn stop(&mut self, pps: &mut PpsClient) -> Result<f64, MeasurementInvalid> {
        debug!("Stopping system clock drift measurement");
        pps.stop_drift();
        self.measuring = false;

        let meas = pps.get_drift().ok_or(MeasurementInvalid::DriverFailure)?;
        debug!(
            "Drift window: begin={}.{:06} end={}.{:06} gps_seconds={}",
            meas.begin_sys_time.sec,
            meas.begin_sys_time.usec,
            meas.end_sys_time.sec,
            meas.end_sys_time.usec,
            meas.gps_seconds
        );

        let rate = calc_drift_rate(&meas)?;
        if self.lost_fix {
            return Err(MeasurementInvalid::LostFix);
        }
        Ok(rate)
    }
}

/// Mesure de l'erreur de l'horloge système au front PPS.
///
/// La mesure est complétée par le traitement de la prochaine trame `$GPRMC`
/// valide, qui compare l'heure système au dernier front à l'heure UTC annoncée.
#[derive(Debug, Default)]
pub struct ErrorMeasurer {
    pending: bool,
    result: Option<f64>,
}

impl ErrorMeasurer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.pending = true;
        self.result = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Enregistre `erreur = heure_système_au_PPS - utc`
    pub fn complete(&mut self, sys_time_at_pps: Timeval, utc_secs: i64) {
        let error = elapsed_secs(Timeval::from_secs(utc_secs), sys_time_at_pps);
        debug!("System time error measured: {:.6}s", error);
        self.result = Some(error);
        self.pending = false;
    }

    /// Résultat disponible, consommé une seule fois
    pub fn take_result(&mut self) -> Option<f64> {
        self.result.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pps::{PpsRequest, SimulatedPps};

    fn window(sys_elapsed_usecs: i64, gps_seconds: u32) -> DriftMeasurement {
        let begin = Timeval::new(1_000, 250_000);
        let end_usecs = 250_000 + sys_elapsed_usecs;
        DriftMeasurement {
            begin_sys_time: begin,
            end_sys_time: Timeval::new(1_000 + end_usecs / 1_000_000, end_usecs % 1_000_000),
            gps_seconds,
        }
    }

    #[test]
    fn test_calc_drift_rate_accepts_small_drift() {
        let rate = calc_drift_rate(&window(30_002_000, 30)).unwrap();
        assert!((rate - 0.0000667).abs() < 1e-7, "rate={rate}");
    }

    #[test]
    fn test_calc_drift_rate_rejects_zero_gps_seconds() {
        assert!(matches!(
            calc_drift_rate(&window(30_000_000, 0)),
            Err(MeasurementInvalid::TooShort { .. })
        ));
    }

    #[test]
    fn test_calc_drift_rate_rejects_short_sys_window() {
        assert!(calc_drift_rate(&window(500_000, 1)).is_err());
    }

    #[test]
    fn test_calc_drift_rate_rejects_large_drift() {
        assert!(matches!(
            calc_drift_rate(&window(30_600_000, 30)),
            Err(MeasurementInvalid::ExcessiveDrift { .. })
        ));
        // Horloge en retard : taux négatif
        let slow = calc_drift_rate(&window(29_997_000, 30)).unwrap();
        assert!(slow < 0.0);
    }

    #[test]
    fn test_elapsed_secs_sign() {
        let a = Timeval::new(10, 900_000);
        let b = Timeval::new(11, 100_000);
        assert!((elapsed_secs(a, b) - 0.2).abs() < 1e-9);
        assert!((elapsed_secs(b, a) + 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_lost_fix_invalidates_window() {
        let sim = SimulatedPps::new();
        sim.with(|s| s.drift = window(30_001_000, 30));
        let mut pps = PpsClient::new(Box::new(sim.clone()));
        let mut drift = DriftMeasurer::new();

        drift.start(&mut pps);
        drift.observe_fix(true);
        drift.observe_fix(false);
        drift.observe_fix(true);
        assert_eq!(drift.stop(&mut pps), Err(MeasurementInvalid::LostFix));

        // Une nouvelle fenêtre repart sans l'historique
        drift.start(&mut pps);
        drift.observe_fix(true);
        assert!(drift.stop(&mut pps).is_ok());
        assert_eq!(sim.count(PpsRequest::StartDrift), 2);
        assert_eq!(sim.count(PpsRequest::StopDrift), 2);
        assert_eq!(sim.count(PpsRequest::GetDrift), 2);
    }

    #[test]
    fn test_driver_failure_invalidates_window() {
        let sim = SimulatedPps::new();
        sim.with(|s| {
            s.failing.insert(PpsRequest::GetDrift);
        });
        let mut pps = PpsClient::new(Box::new(sim));
        let mut drift = DriftMeasurer::new();

        drift.start(&mut pps);
        assert_eq!(drift.stop(&mut pps), Err(MeasurementInvalid::DriverFailure));
        assert!(!drift.is_measuring());
    }

    #[test]
    fn test_error_measurement() {
        let mut error = ErrorMeasurer::new();
        assert_eq!(error.take_result(), None);

        error.start();
        assert!(error.is_pending());
        error.complete(Timeval::new(1_274_190_444, 12_500), 1_274_190_444);
        assert!(!error.is_pending());

        let value = error.take_result().unwrap();
        assert!((value - 0.0125).abs() < 1e-9);
        assert_eq!(error.take_result(), None);
    }
}
