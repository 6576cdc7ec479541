// sched/galactic.rs — first-order prediction feedback.
//
// Every tracked metric is a Galactic pair (value, tangent): a point and
// its first derivative, predicting value + tangent * horizon. Quantum-end
// observations EMA-update the tangents; scheduling decisions turn the
// prediction error into a momentum-smoothed priority-delta accumulator.
// Whole units leaving the accumulator become priority deltas.

use crate::fixed::Fx;

/// EMA weight for tangents and the prediction-error trace.
pub const ALPHA: Fx = Fx::from_ratio(1, 10);
/// Tangent dead zone; flatter than this means "do not chase".
pub const EPSILON: Fx = Fx::from_ratio(1, 100);
/// Relative error under which a prediction counts as accurate.
pub const ACCURATE_REL_ERR: Fx = Fx::from_ratio(1, 5);
/// Quanta observed before tangents are trusted.
pub const WARMUP_QUANTA: u64 = 10;
/// Momentum factor for the delta velocity.
pub const MOMENTUM: Fx = Fx::from_ratio(9, 10);
/// Largest single priority adjustment.
pub const MAX_DELTA: i64 = 4;
/// Decisions to skip after emitting a delta.
pub const COOLDOWN_DECISIONS: u32 = 5;

pub const LEARNING_RATE_INITIAL: Fx = Fx::from_ratio(1, 10);
pub const LEARNING_RATE_MIN: Fx = Fx::from_ratio(1, 1000);
pub const LEARNING_RATE_MAX: Fx = Fx::from_ratio(1, 2);
/// Samples required before the learning rate adapts.
pub const ADAPT_MIN_SAMPLES: u64 = 100;

/// A value and its first derivative; a 2-element tangent space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Galactic {
    pub value: Fx,
    pub tangent: Fx,
}

impl Galactic {
    pub const fn new(value: Fx) -> Galactic {
        Galactic {
            value,
            tangent: Fx::ZERO,
        }
    }

    #[inline]
    pub fn predict(&self, horizon: Fx) -> Fx {
        self.value + self.tangent * horizon
    }

    #[inline]
    pub fn add(&self, other: &Galactic) -> Galactic {
        Galactic {
            value: self.value + other.value,
            tangent: self.tangent + other.tangent,
        }
    }

    #[inline]
    pub fn scale(&self, k: Fx) -> Galactic {
        Galactic {
            value: self.value * k,
            tangent: self.tangent * k,
        }
    }

    /// Warmup pins the value; afterwards the tangent follows the EMA of
    /// the observed step and the value snaps to the observation.
    fn observe(&mut self, observed: Fx, warm: bool) {
        if warm {
            self.tangent = ALPHA * (observed - self.value) + (Fx::ONE - ALPHA) * self.tangent;
        }
        self.value = observed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadClass {
    CpuBound,
    IoBound,
    Balanced,
}

/// Per-strand prediction state.
#[derive(Debug, Clone)]
pub struct GalacticStats {
    pub exec_time: Galactic,
    pub cpu_usage: Galactic,
    pub wait_time: Galactic,
    pub response_time: Galactic,

    pub learning_rate: Fx,
    pub velocity: Fx,
    pub accumulator: Fx,
    pub cooldown: u32,

    pub samples: u64,
    pub prediction_count: u64,
    pub accurate_predictions: u64,
    pub last_prediction: Fx,
    has_prediction: bool,
    /// EMA of relative prediction error.
    pub prediction_error: Fx,
}

impl GalacticStats {
    pub fn new() -> GalacticStats {
        GalacticStats {
            exec_time: Galactic::new(Fx::ZERO),
            cpu_usage: Galactic::new(Fx::ZERO),
            wait_time: Galactic::new(Fx::ZERO),
            response_time: Galactic::new(Fx::ZERO),
            learning_rate: LEARNING_RATE_INITIAL,
            velocity: Fx::ZERO,
            accumulator: Fx::ZERO,
            cooldown: 0,
            samples: 0,
            prediction_count: 0,
            accurate_predictions: 0,
            last_prediction: Fx::ZERO,
            has_prediction: false,
            prediction_error: Fx::ZERO,
        }
    }

    /// Feed one finished quantum: `actual` ticks executed of a
    /// `quantum`-tick slice, plus observed wait and response ticks.
    pub fn quantum_end(&mut self, actual: u64, quantum: u64, waited: u64, response: u64) {
        let actual_fx = Fx::from_int(actual as i64);

        // score the outstanding prediction first
        if self.has_prediction && actual > 0 {
            let rel_err = (self.last_prediction - actual_fx).abs() / actual_fx;
            self.prediction_error =
                ALPHA * rel_err + (Fx::ONE - ALPHA) * self.prediction_error;
            self.prediction_count += 1;
            if rel_err <= ACCURATE_REL_ERR {
                self.accurate_predictions += 1;
            }
            self.has_prediction = false;
        }

        let warm = self.samples >= WARMUP_QUANTA;
        let cpu = if quantum > 0 {
            Fx::from_ratio(actual as i64, quantum as i64)
        } else {
            Fx::ZERO
        };
        self.exec_time.observe(actual_fx, warm);
        self.cpu_usage.observe(cpu, warm);
        self.wait_time.observe(Fx::from_int(waited as i64), warm);
        self.response_time.observe(Fx::from_int(response as i64), warm);
        self.samples += 1;
    }

    /// One scheduling decision. Returns the emitted priority delta, zero
    /// while cooling down, flat, or accumulating below one unit.
    pub fn compute_priority_delta(&mut self, target: Fx, horizon: Fx) -> i64 {
        if self.cooldown > 0 {
            self.cooldown -= 1;
            return 0;
        }
        let tangent = self.exec_time.tangent;
        if tangent.abs() < EPSILON {
            return 0;
        }

        let predicted = self.exec_time.predict(horizon);
        self.last_prediction = predicted;
        self.has_prediction = true;

        let error = predicted - target;
        let raw = -(self.learning_rate * error * Fx::from_int(tangent.signum()));
        self.velocity = MOMENTUM * self.velocity + (Fx::ONE - MOMENTUM) * raw;
        self.accumulator += self.velocity;

        if self.accumulator.abs() < Fx::ONE {
            return 0;
        }
        let sign = self.accumulator.signum();
        let whole = self.accumulator.abs().floor().min(MAX_DELTA);
        let delta = sign * whole;
        self.accumulator -= Fx::from_int(delta);
        self.cooldown = COOLDOWN_DECISIONS;
        delta
    }

    pub fn accuracy(&self) -> Fx {
        if self.prediction_count == 0 {
            return Fx::ZERO;
        }
        Fx::from_ratio(
            self.accurate_predictions as i64,
            self.prediction_count as i64,
        )
    }

    /// After enough samples: shrink the rate when the model is trusted,
    /// push it when the model keeps missing.
    pub fn adapt_learning_rate(&mut self) {
        if self.prediction_count < ADAPT_MIN_SAMPLES {
            return;
        }
        let accuracy = self.accuracy();
        if accuracy > Fx::from_ratio(9, 10) {
            self.learning_rate = self.learning_rate * Fx::from_ratio(9, 10);
        } else if accuracy < Fx::from_ratio(3, 5) {
            self.learning_rate = self.learning_rate + self.learning_rate * Fx::from_ratio(1, 10);
        }
        self.learning_rate = self.learning_rate.clamp(LEARNING_RATE_MIN, LEARNING_RATE_MAX);
    }

    pub fn converged(&self) -> bool {
        self.exec_time.tangent.abs() < EPSILON
            && self.accumulator.abs() < Fx::from_ratio(1, 10)
            && self.accuracy() > Fx::from_ratio(9, 10)
    }

    pub fn classify(&self) -> WorkloadClass {
        let cpu = self.cpu_usage.value;
        let neg_eps = -EPSILON;
        if cpu >= Fx::from_ratio(4, 5) && self.cpu_usage.tangent >= neg_eps {
            WorkloadClass::CpuBound
        } else if cpu <= Fx::from_ratio(3, 10) && self.wait_time.tangent >= neg_eps {
            WorkloadClass::IoBound
        } else {
            WorkloadClass::Balanced
        }
    }
}

impl Default for GalacticStats {
    fn default() -> Self {
        GalacticStats::new()
    }
}
