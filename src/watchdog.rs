use crate::fix::FixState;
use tracing::info;

/// Délai sans fix valide avant de considérer le fix perdu (s)
pub const FIX_TIMEOUT_SECS: u64 = 2;

/// Délai sans octet série avant de considérer le récepteur éteint (s)
pub const POWER_TIMEOUT_SECS: u64 = 5;

/// Efface `has_fix` si aucune trame `$GPRMC` valide n'est arrivée récemment
pub fn check_fix(fix: &mut FixState, now: u64) {
    if !fix.has_fix {
        return;
    }
    if now > fix.last_fix_time + FIX_TIMEOUT_SECS {
        fix.has_fix = false;
        info!("Lost GPS position fix");
    }
}

/// Détection de l'alimentation du récepteur par l'activité du port série
#[derive(Debug, Default)]
pub struct PowerMonitor {
    receiver_power: bool,
    deadline: u64,
}

impl PowerMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Des octets viennent d'arriver : le récepteur est alimenté
    pub fn note_traffic(&mut self, now: u64) {
        if !self.receiver_power {
            info!("GPS receiver power is on");
        }
        self.receiver_power = true;
        self.deadline = now + POWER_TIMEOUT_SECS;
    }

    /// Retombe à « éteint » après `POWER_TIMEOUT_SECS` sans trafic
    pub fn check(&mut self, now: u64) -> bool {
        if self.receiver_power && now > self.deadline {
            self.receiver_power = false;
            info!("GPS receiver power is off");
        }
        self.receiver_power
    }
}
