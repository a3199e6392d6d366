use serde::{Deserialize, Serialize};
use validator::Validate;

use super::settings::Settings;

/// Per-battery configuration, keyed by `consus_id` in the store and
/// replaced atomically on config updates.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EdgeBatteryConfig {
    #[validate(length(min = 1))]
    pub consus_id: String,
    #[validate(length(min = 1))]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub max_charge_w: Option<f64>,
    #[serde(default)]
    #[validate(range(min = 1.0))]
    pub max_ramp_rate_w_per_s: Option<f64>,
    #[serde(default)]
    pub pv_enabled: bool,
    #[serde(default)]
    pub capacity_wh: Option<f64>,
    #[serde(default)]
    pub reserve_soc_percent: Option<f64>,
    #[serde(default)]
    pub max_soc_percent: Option<f64>,
}

fn default_port() -> u16 {
    15002
}

fn default_unit_id() -> u8 {
    1
}

impl EdgeBatteryConfig {
    /// Battery-level limits take precedence over the deployment-wide
    /// settings.
    pub fn effective_max_charge_w(&self, settings: &Settings) -> f64 {
        self.max_charge_w.unwrap_or(settings.max_charge_w)
    }

    pub fn effective_ramp_rate(&self, settings: &Settings) -> f64 {
        self.max_ramp_rate_w_per_s
            .unwrap_or(settings.max_ramp_rate_w_per_s)
    }
}
