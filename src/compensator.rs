use tracing::info;

/// Valeur nominale de `tick` pour adjtimex (µs par tick à USER_HZ = 100)
pub const NOMINAL_TICK: i64 = 10_000;

/// Un incrément de `tick` modifie la vitesse de l'horloge de 100 ppm
const PPM_PER_TICK: i64 = 100;

/// `freq` d'adjtimex est exprimé en ppm avec 16 bits de partie fractionnaire
const FREQ_SCALE: i64 = 65_536;

/// État de compensation de l'horloge système, conservé d'un cycle à l'autre
#[derive(Debug, Clone, PartialEq)]
pub struct ClockCompensation {
    /// Taux de dérive mesuré au dernier cycle (s/s)
    pub drift_rate: f64,
    /// Erreur de l'horloge mesurée au dernier cycle (s)
    pub error: f64,
    /// Compensation de la dérive systématique (s/s)
    pub drift_comp_rate: f64,
    /// Compensation qui annule l'erreur d'ici la prochaine synchro (s/s)
    pub error_comp_rate: f64,
    /// Secondes jusqu'à la prochaine synchronisation UTC
    pub sync_period: u64,
}

impl ClockCompensation {
    pub fn new(sync_period: u64) -> Self {
        ClockCompensation {
            drift_rate: 0.0,
            error: 0.0,
            drift_comp_rate: 0.0,
            error_comp_rate: 0.0,
            sync_period,
        }
    }

    /// Recalcule les taux de compensation à partir de `drift_rate` et `error`.
    ///
    /// La dérive mesurée inclut la compensation d'erreur appliquée pendant la
    /// période précédente ; seul le reste est de la dérive systématique
    /// résiduelle, retirée de la compensation cumulée.
    pub fn update(&mut self) {
        info!("Updating clock compensation:");
        info!("  sys time error =          {:.6} s", self.error);
        info!("  sys time drift rate =     {:.9} s/s", self.drift_rate);
        info!("  old drift comp rate =     {:.9} s/s", self.drift_comp_rate);
        info!("  old error comp rate =     {:.9} s/s", self.error_comp_rate);

        let residual_sys_drift_rate = self.drift_rate - self.error_comp_rate;
        self.drift_comp_rate -= residual_sys_drift_rate;
        self.error_comp_rate = -(self.error / self.sync_period as f64);

        info!("  residual sys drift rate = {:.9} s/s", residual_sys_drift_rate);
        info!("  new drift comp rate =     {:.9} s/s", self.drift_comp_rate);
        info!("  new error comp rate =     {:.9} s/s", self.error_comp_rate);
        info!("  time sync period =        {} s", self.sync_period);
    }

    pub fn total_rate(&self) -> f64 {
        self.drift_comp_rate + self.error_comp_rate
    }
}

/// Paramètres `tick`/`freq` d'adjtimex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockAdjustment {
    pub tick: i64,
    pub freq: i64,
}

impl ClockAdjustment {
    /// Convertit un taux de compensation (s/s) en `tick`/`freq`.
    ///
    /// Les centaines de ppm entières vont dans `tick`, le reste dans `freq`.
    /// Un taux positif accélère l'horloge.
    pub fn from_rate(comp_rate: f64) -> Self {
        let sign: i64 = if comp_rate >= 0.0 { 1 } else { -1 };
        let ppm = (comp_rate * 1_000_000.0).abs() as i64;

        // Le reste dans `freq` est compris entre 0 et 100 ppm inclus
        let steps = (ppm - 1).max(0) / PPM_PER_TICK;
        let ppm = ppm - steps * PPM_PER_TICK;

        ClockAdjustment {
            tick: NOMINAL_TICK + sign * steps,
            freq: ppm * FREQ_SCALE * sign,
        }
    }

    /// Taux (s/s) effectivement appliqué, à la troncature près
    pub fn rate(&self) -> f64 {
        let ppm = (self.tick - NOMINAL_TICK) * PPM_PER_TICK;
        (ppm as f64 + self.freq as f64 / FREQ_SCALE as f64) / 1_000_000.0
    }
}

impl Default for ClockAdjustment {
    fn default() -> Self {
        ClockAdjustment::from_rate(0.0)
    }
}
