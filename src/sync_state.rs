/*!
Machine d'états de synchronisation de l'horloge système

Séquence : détection de l'alimentation du récepteur, envoi des quatre
commandes d'initialisation, attente du premier fix, mise à l'heure unique,
puis cycles périodiques mesure de dérive → mesure d'erreur → compensation.

La transition est une fonction pure : elle reçoit l'état et les entrées du
cycle, et retourne le nouvel état avec la liste des effets que le thread GPS
doit exécuter (requêtes au driver PPS, écritures série, réglage d'horloge).
Le résultat d'une mesure de dérive arrêtée par l'effet `FinishDrift` revient
dans les entrées du cycle suivant.
*/

use crate::compensator::{ClockAdjustment, ClockCompensation};
use crate::config::SyncConfig;
use crate::filter::OutlierFilter;
use crate::measurement::MeasurementInvalid;
use crate::nmea::INIT_COMMANDS;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    WaitForPower,
    Init1,
    Init2,
    Init3,
    WaitForFirstFix,
    Settle1,
    SetSystemTime,
    Settle2,
    MeasureDrift,
    MeasureError,
    WaitForNextSync,
}

/// Durées des différentes étapes (secondes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTimings {
    pub init_step_delay: u64,
    pub first_fix_settle: u64,
    pub time_set_settle: u64,
    pub drift_window: u64,
    pub sync_period: u64,
}

impl SyncTimings {
    pub fn from_config(config: &SyncConfig) -> Self {
        SyncTimings {
            init_step_delay: config.init_step_delay,
            first_fix_settle: config.first_fix_settle,
            time_set_settle: config.time_set_settle,
            drift_window: config.drift_measurement_period,
            sync_period: config.sync_period,
        }
    }
}

impl Default for SyncTimings {
    fn default() -> Self {
        SyncTimings {
            init_step_delay: 2,
            // Le délai entre PPS et trame $GPRMC met du temps à se stabiliser
            // autour de 600 ms après le premier fix
            first_fix_settle: 60,
            time_set_settle: 5,
            drift_window: 30,
            sync_period: 3600,
        }
    }
}

/// Entrées d'un cycle de la machine d'états
#[derive(Debug, Clone, Default)]
pub struct SyncInputs {
    /// Secondes monotones depuis le démarrage du thread
    pub now: u64,
    /// Heure UTC courante (secondes depuis 1970), pour le statut publié
    pub wall_time: i64,
    pub receiver_power: bool,
    pub has_fix: bool,
    /// La mise à l'heure demandée a été transmise au driver
    pub time_set_done: bool,
    /// Résultat de la mesure de dérive arrêtée au cycle précédent
    pub drift_result: Option<Result<f64, MeasurementInvalid>>,
    /// Erreur d'horloge mesurée depuis le cycle précédent
    pub error_result: Option<f64>,
}

/// Actions demandées par la machine d'états
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Vide les files d'octets et de trames
    FlushQueues,
    /// Envoie la commande d'initialisation d'indice donné au récepteur
    SendInit(usize),
    ClearFix,
    /// Arrête une éventuelle mesure de dérive en cours, sans la lire
    AbortDrift,
    StartDrift,
    /// Arrête la mesure de dérive et en calcule le taux
    FinishDrift,
    RequestTimeSet,
    StartError,
    ApplyCompensation(ClockAdjustment),
    PersistHardwareClock,
    StartPseudoPps,
    PublishStatus { time_of_last_sync: i64, error: f64 },
}

/// État complet de la synchronisation, possédé par le thread GPS
#[derive(Debug, Clone)]
pub struct SyncState {
    phase: SyncPhase,
    deadline: u64,
    system_time_set: bool,
    pseudo_pps_running: bool,
    awaiting_drift_result: bool,
    drift_filter: OutlierFilter,
    error_filter: OutlierFilter,
    compensation: ClockCompensation,
    timings: SyncTimings,
}

impl SyncState {
    pub fn new(timings: SyncTimings) -> Self {
        SyncState {
            phase: SyncPhase::WaitForPower,
            deadline: 0,
            system_time_set: false,
            pseudo_pps_running: false,
            awaiting_drift_result: false,
            drift_filter: OutlierFilter::drift(),
            error_filter: OutlierFilter::error(),
            compensation: ClockCompensation::new(timings.sync_period),
            timings,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    #[cfg(test)]
    pub fn compensation(&self) -> &ClockCompensation {
        &self.compensation
    }

    fn expired(&self, now: u64) -> bool {
        now > self.deadline
    }

    fn send_init(&mut self, index: usize, now: u64, effects: &mut Vec<Effect>) {
        effects.push(Effect::SendInit(index));
        self.deadline = now + self.timings.init_step_delay;
    }

    /// Ouvre une nouvelle fenêtre de dérive depuis une phase d'attente
    fn enter_measure_drift(&mut self, now: u64, effects: &mut Vec<Effect>) {
        effects.push(Effect::AbortDrift);
        effects.push(Effect::StartDrift);
        self.drift_filter.reset();
        self.awaiting_drift_result = false;
        self.deadline = now + self.timings.drift_window;
        self.phase = SyncPhase::MeasureDrift;
    }

    fn restart_drift_window(&mut self, now: u64, effects: &mut Vec<Effect>) {
        effects.push(Effect::StartDrift);
        self.deadline = now + self.timings.drift_window;
    }

    fn measure_drift(&mut self, inputs: &SyncInputs, effects: &mut Vec<Effect>) {
        if !self.awaiting_drift_result {
            if self.expired(inputs.now) {
                effects.push(Effect::FinishDrift);
                self.awaiting_drift_result = true;
            }
            return;
        }

        let result = match inputs.drift_result {
            Some(result) => result,
            None => return,
        };
        self.awaiting_drift_result = false;

        match result {
            Ok(rate) if self.drift_filter.accept(rate) => {
                self.compensation.drift_rate = self.drift_filter.average();
                info!(
                    "Drift rate is {:.9} s/s ({:.3} msec/hr)",
                    self.compensation.drift_rate,
                    self.compensation.drift_rate * 3600.0 * 1000.0
                );
                effects.push(Effect::StartError);
                self.error_filter.reset();
                self.phase = SyncPhase::MeasureError;
            }
            Ok(rate) => {
                debug!("Drift rate {:.9} s/s not yet accepted by filter", rate);
                self.restart_drift_window(inputs.now, effects);
            }
            Err(e) => {
                warn!("Drift measurement rejected: {}", e);
                self.restart_drift_window(inputs.now, effects);
            }
        }
    }

    fn measure_error(&mut self, inputs: &SyncInputs, effects: &mut Vec<Effect>) {
        let error = match inputs.error_result {
            Some(error) => error,
            None => return,
        };

        if !self.error_filter.accept(error) {
            debug!("System time error {:.6} s not yet accepted by filter", error);
            effects.push(Effect::StartError);
            return;
        }

        self.compensation.error = self.error_filter.average();
        info!("System time error is {:.6} s", self.compensation.error);
        self.compensation.update();

        let adjustment = ClockAdjustment::from_rate(self.compensation.total_rate());
        effects.push(Effect::ApplyCompensation(adjustment));
        if !self.pseudo_pps_running {
            effects.push(Effect::StartPseudoPps);
            self.pseudo_pps_running = true;
        }
        effects.push(Effect::PersistHardwareClock);
        effects.push(Effect::PublishStatus {
            time_of_last_sync: inputs.wall_time,
            error: self.compensation.error,
        });

        self.deadline = inputs.now + self.compensation.sync_period;
        self.phase = SyncPhase::WaitForNextSync;
    }
}

/// Avance la machine d'états d'un cycle
pub fn transition(mut state: SyncState, inputs: &SyncInputs) -> (SyncState, Vec<Effect>) {
    let mut effects = Vec::new();
    let previous = state.phase;
    let now = inputs.now;

    if !inputs.receiver_power {
        state.phase = SyncPhase::WaitForPower;
    }

    match state.phase {
        SyncPhase::WaitForPower => {
            if inputs.receiver_power {
                effects.push(Effect::FlushQueues);
                state.send_init(0, now, &mut effects);
                state.phase = SyncPhase::Init1;
            }
        }
        SyncPhase::Init1 => {
            if state.expired(now) {
                state.send_init(1, now, &mut effects);
                state.phase = SyncPhase::Init2;
            }
        }
        SyncPhase::Init2 => {
            if state.expired(now) {
                state.send_init(2, now, &mut effects);
                state.phase = SyncPhase::Init3;
            }
        }
        SyncPhase::Init3 => {
            if state.expired(now) {
                state.send_init(INIT_COMMANDS.len() - 1, now, &mut effects);
                effects.push(Effect::ClearFix);
                state.phase = SyncPhase::WaitForFirstFix;
            }
        }
        SyncPhase::WaitForFirstFix => {
            if state.expired(now) && inputs.has_fix {
                state.deadline = now + state.timings.first_fix_settle;
                state.phase = SyncPhase::Settle1;
            }
        }
        SyncPhase::Settle1 => {
            if state.expired(now) {
                if !state.system_time_set {
                    // L'heure système n'est réglée qu'une fois, ensuite seule
                    // la vitesse de l'horloge est ajustée
                    state.system_time_set = true;
                    effects.push(Effect::RequestTimeSet);
                    state.phase = SyncPhase::SetSystemTime;
                } else {
                    state.enter_measure_drift(now, &mut effects);
                }
            }
        }
        SyncPhase::SetSystemTime => {
            if inputs.time_set_done {
                state.deadline = now + state.timings.time_set_settle;
                state.phase = SyncPhase::Settle2;
            }
        }
        SyncPhase::Settle2 => {
            if state.expired(now) {
                state.enter_measure_drift(now, &mut effects);
            }
        }
        SyncPhase::MeasureDrift => state.measure_drift(inputs, &mut effects),
        SyncPhase::MeasureError => state.measure_error(inputs, &mut effects),
        SyncPhase::WaitForNextSync => {
            if state.expired(now) {
                state.phase = SyncPhase::WaitForFirstFix;
            }
        }
    }

    if state.phase != previous {
        info!("Sync phase: {:?} -> {:?}", previous, state.phase);
    }

    (state, effects)
}
