//! Import setpoint shaping: PV subtraction, floor, clamp, and a dP/dt
//! ramp referenced to the last setpoint the inverter actually accepted.
//! A throttled or deduped write must not advance the baseline, otherwise
//! the ramp teleports past values the device never held.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct SetpointLimits {
    pub min_import_w: f64,
    pub max_charge_w: f64,
    pub max_ramp_rate_w_per_s: f64,
}

#[derive(Debug)]
pub struct SetpointShaper {
    last_accepted_w: f64,
    last_accepted_at: Option<Instant>,
}

impl SetpointShaper {
    pub fn new() -> Self {
        Self {
            last_accepted_w: 0.0,
            last_accepted_at: None,
        }
    }

    pub fn last_accepted_w(&self) -> f64 {
        self.last_accepted_w
    }

    /// Shape a raw import target into the value to write this tick.
    ///
    /// `raw_target_w` is the demanded import after PV subtraction and any
    /// task cap. `default_dt` stands in for the elapsed time before the
    /// first accepted write (one tick period).
    pub fn shape(
        &self,
        raw_target_w: f64,
        limits: SetpointLimits,
        now: Instant,
        default_dt: Duration,
    ) -> f64 {
        let mut target = raw_target_w;
        if target < limits.min_import_w {
            target = limits.min_import_w;
        }
        target = target.clamp(0.0, limits.max_charge_w);

        let dt = self
            .last_accepted_at
            .map(|at| now.duration_since(at))
            .unwrap_or(default_dt)
            .as_secs_f64();
        let max_delta = limits.max_ramp_rate_w_per_s * dt;
        let delta = target - self.last_accepted_w;
        let shaped = if delta.abs() <= max_delta {
            target
        } else {
            self.last_accepted_w + max_delta * delta.signum()
        };
        shaped.clamp(0.0, limits.max_charge_w)
    }

    /// Record a setpoint the write guard and transport both accepted.
    pub fn record_accepted(&mut self, value_w: f64, at: Instant) {
        self.last_accepted_w = value_w;
        self.last_accepted_at = Some(at);
    }

    /// Leaving Import-AC: the next entry ramps up from zero again.
    pub fn reset(&mut self, at: Instant) {
        self.last_accepted_w = 0.0;
        self.last_accepted_at = Some(at);
    }
}

impl Default for SetpointShaper {
    fn default() -> Self {
        Self::new()
    }
}
