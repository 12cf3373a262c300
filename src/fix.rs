use crate::measurement::ErrorMeasurer;
use crate::nmea::{convert_to_secs, NmeaFields};
use crate::pps::{PpsClient, Timeval};
use tracing::{debug, info, warn};

// Indices des champs d'une trame $GPRMC
const UTC_TIME: usize = 1;
const STATUS: usize = 2;
const LAT: usize = 3;
const LAT_N_S: usize = 4;
const LONG: usize = 5;
const LONG_E_W: usize = 6;
const UTC_DATE: usize = 9;

/// Dernier état connu du fix GPS
#[derive(Debug, Clone, PartialEq)]
pub struct FixState {
    pub has_fix: bool,
    /// Instant (secondes monotones) de la dernière trame valide
    pub last_fix_time: u64,
    /// Latitude en degrés-minutes, préfixée de `-` au sud
    pub latitude: String,
    /// Longitude en degrés-minutes, préfixée de `-` à l'ouest
    pub longitude: String,
}

impl FixState {
    pub fn new() -> Self {
        FixState {
            has_fix: false,
            last_fix_time: 0,
            latitude: "0.0".to_string(),
            longitude: "0.0".to_string(),
        }
    }
}

impl Default for FixState {
    fn default() -> Self {
        Self::new()
    }
}

/// Traitement des trames `$GPRMC`
///
/// Porte aussi la demande unique de mise à l'heure : elle est transmise au
/// driver PPS lors de la première trame valide qui suit la demande.
#[derive(Debug, Default)]
pub struct FixHandler {
    time_set_pending: bool,
    time_set_done: bool,
}

impl FixHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Demande une mise à l'heure au prochain front PPS
    pub fn request_time_set(&mut self) {
        self.time_set_pending = true;
        self.time_set_done = false;
    }

    pub fn time_set_done(&self) -> bool {
        self.time_set_done
    }

    pub fn handle_gprmc(
        &mut self,
        f: &NmeaFields,
        now: u64,
        fix: &mut FixState,
        pps: &mut PpsClient,
        error: &mut ErrorMeasurer,
    ) {
        if f.get(STATUS) != "A" {
            debug!("No GPS position fix (status: {:?})", f.get(STATUS));
            return;
        }

        if !fix.has_fix {
            info!("Acquired GPS position fix");
        }
        fix.has_fix = true;
        fix.last_fix_time = now;

        let utc = convert_to_secs(f.get(UTC_DATE), f.get(UTC_TIME));
        if utc.is_none() {
            warn!(
                "Unusable $GPRMC date/time: {:?} {:?}",
                f.get(UTC_DATE),
                f.get(UTC_TIME)
            );
        }

        if let Some(utc) = utc {
            if self.time_set_pending {
                self.set_sys_time(utc, pps);
            }
            if error.is_pending() {
                if let Some(sys_time) = pps.get_time_at_last_pulse() {
                    error.complete(sys_time, utc);
                }
            }
        }

        fix.latitude = signed_coordinate(f.get(LAT), f.get(LAT_N_S) == "S");
        fix.longitude = signed_coordinate(f.get(LONG), f.get(LONG_E_W) == "W");
    }

    /// La trame annonce l'heure du front PPS précédent et arrive environ
    /// 670 ms après lui : le driver réglera l'heure au front suivant, soit
    /// `utc + 1`.
    fn set_sys_time(&mut self, utc: i64, pps: &mut PpsClient) {
        pps.set_time_at_next_pulse(Timeval::from_secs(utc + 1));
        self.time_set_pending = false;
        self.time_set_done = true;
        info!("System time set to UTC at next PPS ({})", utc + 1);
    }
}

fn signed_coordinate(value: &str, negative: bool) -> String {
    if negative {
        format!("-{}", value)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmea::parse_sentence;
    use crate::pps::{PpsRequest, SimulatedPps};

    const FIX_RMC: &[u8] =
        b"$GPRMC,134724,A,4217.6448,N,08342.6906,W,001.0,231.8,180510,006.6,W*7F\r\n";
    const NO_FIX_RMC: &[u8] = b"$GPRMC,135251,V,4217.6331,S,08342.6643,E,,,180510,006.6,W*60\r\n";
    const UTC_2010_05_18_13_47_24: i64 = 1_274_190_444;

    struct Harness {
        sim: SimulatedPps,
        pps: PpsClient,
        handler: FixHandler,
        fix: FixState,
        error: ErrorMeasurer,
    }

    impl Harness {
        fn new() -> Self {
            let sim = SimulatedPps::new();
            Harness {
                pps: PpsClient::new(Box::new(sim.clone())),
                sim,
                handler: FixHandler::new(),
                fix: FixState::new(),
                error: ErrorMeasurer::new(),
            }
        }

        fn feed(&mut self, sentence: &[u8], now: u64) {
            let fields = parse_sentence(sentence);
            self.handler
                .handle_gprmc(&fields, now, &mut self.fix, &mut self.pps, &mut self.error);
        }
    }

    #[test]
    fn test_valid_fix_updates_position() {
        let mut h = Harness::new();
        h.feed(FIX_RMC, 42);

        assert!(h.fix.has_fix);
        assert_eq!(h.fix.last_fix_time, 42);
        assert_eq!(h.fix.latitude, "4217.6448");
        assert_eq!(h.fix.longitude, "-08342.6906");
    }

    #[test]
    fn test_invalid_fix_leaves_state_untouched() {
        let mut h = Harness::new();
        h.feed(FIX_RMC, 42);
        let before = h.fix.clone();

        h.feed(NO_FIX_RMC, 43);
        assert_eq!(h.fix, before);

        let mut fresh = Harness::new();
        fresh.feed(NO_FIX_RMC, 1);
        assert!(!fresh.fix.has_fix);
        assert_eq!(fresh.fix.latitude, "0.0");
    }

    #[test]
    fn test_southern_eastern_hemisphere() {
        let mut h = Harness::new();
        h.feed(
            b"$GPRMC,134724,A,3351.1200,S,15112.5000,E,,,180510,,*00\r\n",
            1,
        );
        assert_eq!(h.fix.latitude, "-3351.1200");
        assert_eq!(h.fix.longitude, "15112.5000");
    }

    #[test]
    fn test_time_set_targets_next_second() {
        let mut h = Harness::new();
        h.feed(FIX_RMC, 1);
        assert_eq!(h.sim.count(PpsRequest::SetTime), 0);

        h.handler.request_time_set();
        assert!(!h.handler.time_set_done());
        h.feed(FIX_RMC, 2);

        assert!(h.handler.time_set_done());
        let target = h.sim.with(|s| s.time_set);
        assert_eq!(target, Some(Timeval::from_secs(UTC_2010_05_18_13_47_24 + 1)));

        // Une seule mise à l'heure par demande
        h.feed(FIX_RMC, 3);
        assert_eq!(h.sim.count(PpsRequest::SetTime), 1);
    }

    #[test]
    fn test_time_set_waits_for_valid_fix() {
        let mut h = Harness::new();
        h.handler.request_time_set();
        h.feed(NO_FIX_RMC, 1);
        assert!(!h.handler.time_set_done());
        assert_eq!(h.sim.count(PpsRequest::SetTime), 0);
    }

    #[test]
    fn test_error_measurement_completes_on_fix() {
        let mut h = Harness::new();
        h.sim
            .with(|s| s.time_at_last_pulse = Timeval::new(UTC_2010_05_18_13_47_24, 3_000));

        h.error.start();
        h.feed(FIX_RMC, 1);

        assert!(!h.error.is_pending());
        let error = h.error.take_result().unwrap();
        assert!((error - 0.003).abs() < 1e-9);
    }

    #[test]
    fn test_error_measurement_retries_after_driver_failure() {
        let mut h = Harness::new();
        h.sim.with(|s| {
            s.failing.insert(PpsRequest::GetTime);
        });

        h.error.start();
        h.feed(FIX_RMC, 1);
        assert!(h.error.is_pending());

        h.sim.with(|s| {
            s.failing.clear();
            s.time_at_last_pulse = Timeval::new(UTC_2010_05_18_13_47_24 - 1, 999_000);
        });
        h.feed(FIX_RMC, 2);
        let error = h.error.take_result().unwrap();
        assert!((error + 0.001).abs() < 1e-9);
    }
}
