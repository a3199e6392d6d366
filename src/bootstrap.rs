//! Bootstrap client: pulls the initial edge state and register map from
//! the backend, and runs the operator-initiated validation checks.

use crate::registers::RegisterMapDoc;
use crate::state::{EdgeBatteryConfig, Endpoints, Settings, TaskDoc};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};
use validator::Validate;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Response of `GET /edge/init`.
#[derive(Debug, Deserialize)]
pub struct EdgeInitPayload {
    pub settings: Settings,
    #[serde(default)]
    pub battery_configs: HashMap<String, EdgeBatteryConfig>,
    #[serde(default)]
    pub tasks: Vec<TaskDoc>,
    pub register_map: RegisterMapDoc,
    pub endpoints: Endpoints,
}

#[derive(Debug, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Per-battery result of the field-bus connectivity probe.
#[derive(Debug, Serialize)]
pub struct ModbusProbeResult {
    pub consus_id: String,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct BootstrapClient {
    client: reqwest::Client,
    base_url: String,
    group_id: String,
}

impl BootstrapClient {
    pub fn new(base_url: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            group_id: group_id.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Fetch the initial state. Failure here is fatal for the process.
    pub async fn fetch_init(&self) -> Result<EdgeInitPayload> {
        let url = format!("{}?group_id={}", self.url("/edge/init"), self.group_id);
        info!(%url, "fetching bootstrap state");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("bootstrap request failed")?
            .error_for_status()
            .context("bootstrap returned an error status")?;
        let payload: EdgeInitPayload = response
            .json()
            .await
            .context("bootstrap payload did not parse")?;
        payload
            .settings
            .validate()
            .context("bootstrap settings failed validation")?;
        for config in payload.battery_configs.values() {
            config
                .validate()
                .context("bootstrap battery config failed validation")?;
        }
        info!(
            batteries = payload.battery_configs.len(),
            tasks = payload.tasks.len(),
            registers = payload.register_map.read_registers.len()
                + payload.register_map.write_registers.len(),
            "bootstrap state loaded"
        );
        Ok(payload)
    }

    /// Operator sanity check: ship the current state for backend-side
    /// validation.
    pub async fn validate_state<T: Serialize>(&self, state: &T) -> Result<ValidationReport> {
        let response = self
            .client
            .post(self.url("/edge/validate-state"))
            .json(state)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// TCP-probe every battery's transport endpoint and report the
    /// results to the backend. Read-level plausibility stays with the
    /// controller, which owns the bus.
    pub async fn validate_modbus(
        &self,
        configs: &HashMap<String, EdgeBatteryConfig>,
    ) -> Result<Vec<ModbusProbeResult>> {
        let mut results = Vec::new();
        for (consus_id, cfg) in configs {
            results.push(probe_battery(consus_id, cfg).await);
        }
        let body = serde_json::json!({
            "test_timestamp": Utc::now(),
            "results": &results,
        });
        if let Err(e) = self
            .client
            .post(self.url("/edge/validate-modbus"))
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            warn!(error = %e, "failed to report modbus probe results");
        }
        Ok(results)
    }
}

async fn probe_battery(consus_id: &str, cfg: &EdgeBatteryConfig) -> ModbusProbeResult {
    let target = format!("{}:{}", cfg.host, cfg.port);
    let started = std::time::Instant::now();
    let attempt = tokio::time::timeout(
        TCP_PROBE_TIMEOUT,
        tokio::net::TcpStream::connect(&target),
    )
    .await;
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    match attempt {
        Ok(Ok(_)) => {
            info!(consus_id, %target, latency_ms, "modbus endpoint reachable");
            ModbusProbeResult {
                consus_id: consus_id.to_string(),
                reachable: true,
                latency_ms: Some(latency_ms),
                error: None,
            }
        }
        Ok(Err(e)) => ModbusProbeResult {
            consus_id: consus_id.to_string(),
            reachable: false,
            latency_ms: Some(latency_ms),
            error: Some(e.to_string()),
        },
        Err(_) => ModbusProbeResult {
            consus_id: consus_id.to_string(),
            reachable: false,
            latency_ms: None,
            error: Some(format!("tcp probe timed out after {TCP_PROBE_TIMEOUT:?}")),
        },
    }
}
