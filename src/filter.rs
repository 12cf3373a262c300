/// Nombre d'échantillons consécutifs exigés par le filtre
pub const FILTER_SIZE: usize = 5;

/// Écart maximal entre deux taux de dérive voisins (s/s)
pub const DRIFT_VAR_LIMIT: f64 = 0.000_020;

/// Écart maximal entre deux erreurs voisines (s)
pub const ERROR_VAR_LIMIT: f64 = 0.005_000;

/// Filtre de rejet des mesures aberrantes.
///
/// Une valeur n'est acceptée qu'une fois `FILTER_SIZE` échantillons
/// enregistrés depuis la dernière réinitialisation, et seulement si chaque
/// paire de cases voisines diffère d'au plus `tolerance`. Cela élimine les
/// lectures erronées occasionnelles du driver.
#[derive(Debug, Clone)]
pub struct OutlierFilter {
    samples: [f64; FILTER_SIZE],
    index: usize,
    count: usize,
    tolerance: f64,
}

impl OutlierFilter {
    pub fn new(tolerance: f64) -> Self {
        OutlierFilter {
            samples: [0.0; FILTER_SIZE],
            index: 0,
            count: 0,
            tolerance,
        }
    }

    /// Filtre des taux de dérive
    pub fn drift() -> Self {
        Self::new(DRIFT_VAR_LIMIT)
    }

    /// Filtre des erreurs d'horloge
    pub fn error() -> Self {
        Self::new(ERROR_VAR_LIMIT)
    }

    /// Relance l'accumulation ; le contenu des cases est conservé
    pub fn reset(&mut self) {
        self.index = 0;
        self.count = 0;
    }

    pub fn is_full(&self) -> bool {
        self.count == FILTER_SIZE
    }

    /// Enregistre `sample` (en écrasant le plus ancien) et indique si la
    /// fenêtre complète est suffisamment stable
    pub fn accept(&mut self, sample: f64) -> bool {
        self.samples[self.index] = sample;
        self.index = (self.index + 1) % FILTER_SIZE;
        if self.count < FILTER_SIZE {
            self.count += 1;
        }

        if !self.is_full() {
            return false;
        }

        self.samples
            .windows(2)
            .all(|pair| (pair[0] - pair[1]).abs() <= self.tolerance)
    }

    /// Moyenne des `FILTER_SIZE` cases (significative une fois le filtre plein)
    pub fn average(&self) -> f64 {
        self.samples.iter().sum::<f64>() / FILTER_SIZE as f64
    }
}
