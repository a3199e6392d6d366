//! Deployment-wide settings, hot-reloadable over the config bus. Inbound
//! documents are schema-checked before they replace the live copy; a
//! rejected document leaves the prior settings in place.

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Wall-clock charging window in site local time, inclusive of `start`
/// and exclusive of `end`. `start > end` means the window wraps midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheapWindow {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl CheapWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }
}

/// `HH:MM` on the wire, with `HH:MM:SS` tolerated on input.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeStatus {
    Active,
    Paused,
    Inactive,
}

impl Default for EdgeStatus {
    fn default() -> Self {
        EdgeStatus::Inactive
    }
}

/// Closed-loop trim of the meter bias, applied only in Auto mode.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AutoBiasTrim {
    pub enable: bool,
    pub target_w: f64,
    #[validate(range(min = 0.0))]
    pub deadband_w: f64,
    #[validate(range(min = 1.0))]
    pub step_w: f64,
    pub min_w: f64,
    pub max_w: f64,
}

impl Default for AutoBiasTrim {
    fn default() -> Self {
        Self {
            enable: false,
            target_w: 0.0,
            deadband_w: 30.0,
            step_w: 10.0,
            min_w: -500.0,
            max_w: 500.0,
        }
    }
}

/// Separate day/night bias values; until enabled the single
/// `meter_bias_w` applies in both regimes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasSplit {
    pub enable: bool,
    pub bias_day_w: f64,
    pub bias_night_w: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct WriteGuardSettings {
    #[validate(range(min = 0.0, max = 10.0))]
    pub per_reg_min_s: f64,
    #[validate(range(min = 1, max = 100))]
    pub global_writes_per_s: u32,
    #[validate(range(min = 0.0, max = 600.0))]
    pub dedupe_staleness_s: f64,
}

impl Default for WriteGuardSettings {
    fn default() -> Self {
        Self {
            per_reg_min_s: 0.25,
            global_writes_per_s: 5,
            dedupe_staleness_s: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Settings {
    pub edge_status: EdgeStatus,
    /// Site timezone for cheap-window evaluation.
    pub timezone: Tz,
    /// Global fallback window; a battery's task windows take precedence.
    pub cheap_window: Option<CheapWindow>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub target_soc_percent: f64,
    #[validate(range(min = 0.0))]
    pub import_charge_power_w: f64,
    #[validate(range(min = 0.0))]
    pub min_import_w: f64,
    #[validate(range(min = 0.0))]
    pub export_cap_w: f64,
    pub external_meter: bool,
    #[validate(range(min = -500.0, max = 500.0))]
    pub meter_bias_w: f64,
    pub bias_split: BiasSplit,
    #[validate(range(min = 0.0))]
    pub max_charge_w: f64,
    #[validate(range(min = 1.0))]
    pub max_ramp_rate_w_per_s: f64,
    pub pv_enabled: bool,
    #[validate(nested)]
    pub auto_bias_trim: AutoBiasTrim,
    #[validate(nested)]
    pub write_guard: WriteGuardSettings,
    pub remote_comm_loss_time_s: Option<u16>,
    #[validate(range(min = 1.0, max = 600.0))]
    pub posting_interval_s: f64,
    #[validate(range(min = 1.0, max = 3600.0))]
    pub alert_batch_interval_s: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            edge_status: EdgeStatus::Inactive,
            timezone: chrono_tz::Europe::London,
            cheap_window: None,
            target_soc_percent: 100.0,
            import_charge_power_w: 3400.0,
            min_import_w: 0.0,
            export_cap_w: 0.0,
            external_meter: true,
            meter_bias_w: -50.0,
            bias_split: BiasSplit::default(),
            max_charge_w: 5000.0,
            max_ramp_rate_w_per_s: 500.0,
            pv_enabled: false,
            auto_bias_trim: AutoBiasTrim::default(),
            write_guard: WriteGuardSettings::default(),
            remote_comm_loss_time_s: None,
            posting_interval_s: 10.0,
            alert_batch_interval_s: 45.0,
        }
    }
}

impl Settings {
    /// Base bias for the current regime; the split only applies once
    /// enabled.
    pub fn base_bias_w(&self, in_cheap_window: bool) -> f64 {
        if self.bias_split.enable {
            if in_cheap_window {
                self.bias_split.bias_night_w
            } else {
                self.bias_split.bias_day_w
            }
        } else {
            self.meter_bias_w
        }
    }
}

/// Backend endpoints, fixed at bootstrap for the life of the process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Endpoints {
    pub ingest_url: String,
    pub health_url: String,
}
