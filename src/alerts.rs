//! Alert wire types posted to `/blob/health`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertState {
    Active,
    Cleared,
}

/// Operating context captured at the moment of a transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertContext {
    pub mode: Option<String>,
    pub soc: Option<f64>,
    pub grid_w: Option<f64>,
    pub pv_w: Option<f64>,
    pub bias_w: Option<f64>,
}

/// One entry of the short telemetry ring attached to CRITICAL events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentTelemetry {
    pub ts: DateTime<Utc>,
    pub soc: Option<f64>,
    pub grid_w: Option<f64>,
    pub pv_w: Option<f64>,
    pub mode: Option<String>,
    pub bias_w: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub site_id: String,
    pub consus_id: String,
    pub ts: DateTime<Utc>,
    pub severity: Severity,
    pub code: String,
    pub state: AlertState,
    /// Stable per (code, active interval); re-entries get a fresh id.
    pub event_id: String,
    /// Monotone across re-entries of the same code.
    pub count: u32,
    pub context: AlertContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_telemetry: Option<Vec<RecentTelemetry>>,
}
