//! One battery unit: aggregates a telemetry sample from the inverter's
//! register space. Individual registers that fail to read come back as
//! `None` and are counted as comms faults; only a dead transport fails
//! the whole read.

use crate::fieldbus::{FieldBus, FieldBusError, WriteGuardStats};
use crate::state::EdgeBatteryConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const PV_STRING_REGISTERS: &[&str] = &["pv1_power", "pv2_power", "pv3_power", "pv4_power"];
const MPPT_REGISTERS: &[&str] = &[
    "mppt1_power",
    "mppt2_power",
    "mppt3_power",
    "mppt4_power",
    "mppt5_power",
];

/// Health-register snapshot carried inside every telemetry sample; the
/// health monitor evaluates its state machines from this, so the bus is
/// only read once per tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthFlags {
    pub ems_check_status: Option<u16>,
    pub bms_warning_bits: Option<u16>,
    pub bms_alarm_bits: Option<u16>,
    pub bms_soh_percent: Option<f64>,
    pub arc_fault: Option<u16>,
    pub parallel_comm_status: Option<u16>,
    pub meter_path: Option<u16>,
    pub int_meter_comm: Option<u16>,
    pub ext_meter_comm: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub soc: Option<f64>,
    /// BMS-side SOC, cross-checked against the inverter's figure.
    pub soc_bms: Option<f64>,
    pub grid_w: Option<f64>,
    pub pv_total_w: f64,
    pub pv_strings_w: Vec<Option<f64>>,
    pub mppts_w: Vec<Option<f64>>,
    pub ct2_w: Option<f64>,
    pub battery_v: Option<f64>,
    pub battery_i: Option<f64>,
    pub battery_w: Option<f64>,
    pub ems_mode: Option<u16>,
    pub app_mode: Option<u16>,
    pub health: HealthFlags,
    pub comms_faults: u32,
    pub writes: WriteGuardStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Immutable once created; lives until batched for posting or evicted
/// from the critical ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub consus_id: String,
    pub timestamp: DateTime<Utc>,
    pub mode: String,
    pub payload: TelemetryPayload,
}

impl TelemetrySample {
    pub fn error_sample(consus_id: &str, error: String) -> Self {
        Self {
            consus_id: consus_id.to_string(),
            timestamp: Utc::now(),
            mode: "error".to_string(),
            payload: TelemetryPayload {
                error: Some(error),
                ..Default::default()
            },
        }
    }
}

pub struct BatteryUnit {
    fieldbus: FieldBus,
}

impl BatteryUnit {
    pub fn new(fieldbus: FieldBus) -> Self {
        Self { fieldbus }
    }

    pub fn consus_id(&self) -> &str {
        self.fieldbus.consus_id()
    }

    pub fn fieldbus(&self) -> &FieldBus {
        &self.fieldbus
    }

    async fn try_read(&self, name: &str, faults: &mut u32) -> Option<f64> {
        match self.fieldbus.read_by_name(name).await {
            Ok(v) => Some(v),
            Err(e) => {
                *faults += 1;
                warn!(
                    consus_id = %self.consus_id(),
                    register = name,
                    error = %e,
                    "register read skipped"
                );
                None
            }
        }
    }

    async fn try_word(&self, name: &str, faults: &mut u32) -> Option<u16> {
        self.try_read(name, faults).await.map(|v| v as u16)
    }

    /// Read one full telemetry sample.
    ///
    /// Fails only if the grid-meter read fails at the transport level,
    /// which marks the tick as failed upstream. Everything after that is
    /// best-effort: a missing register becomes `None` plus a comms-fault
    /// count.
    pub async fn read_telemetry(
        &self,
        cfg: &EdgeBatteryConfig,
    ) -> Result<TelemetrySample, FieldBusError> {
        let mut faults = 0u32;
        let grid_w = self.fieldbus.read_by_name("meter_total_active_power").await?;

        let soc = self.try_read("battery_soc", &mut faults).await;
        let soc_bms = self.try_read("bms_soc", &mut faults).await;
        let battery_v = self.try_read("battery_voltage", &mut faults).await;
        let battery_i = self.try_read("battery_current", &mut faults).await;
        let battery_w = self.try_read("battery_power", &mut faults).await;
        let app_mode = self.try_word("app_mode_display", &mut faults).await;
        let ems_mode = self.try_word("ems_mode_display", &mut faults).await;

        let mut pv_strings_w = Vec::new();
        let mut mppts_w = Vec::new();
        let mut ct2_w = None;
        if cfg.pv_enabled {
            for name in PV_STRING_REGISTERS {
                pv_strings_w.push(self.try_read(name, &mut faults).await);
            }
            for name in MPPT_REGISTERS {
                mppts_w.push(self.try_read(name, &mut faults).await);
            }
            ct2_w = self.try_read("ct2_active_power", &mut faults).await;
        }

        let pv_total_w = if cfg.pv_enabled {
            pv_strings_w
                .iter()
                .chain(mppts_w.iter())
                .filter_map(|v| *v)
                .sum::<f64>()
                + ct2_w.unwrap_or(0.0)
        } else {
            0.0
        };

        let health = HealthFlags {
            ems_check_status: self.try_word("ems_check_status", &mut faults).await,
            bms_warning_bits: self.try_word("bms_warning_bits", &mut faults).await,
            bms_alarm_bits: self.try_word("bms_alarm_bits", &mut faults).await,
            bms_soh_percent: self.try_read("bms_soh_percent", &mut faults).await,
            arc_fault: self.try_word("arc_fault", &mut faults).await,
            parallel_comm_status: self.try_word("parallel_comm_status", &mut faults).await,
            meter_path: self.try_word("meter_path", &mut faults).await,
            int_meter_comm: self.try_word("int_meter_comm", &mut faults).await,
            ext_meter_comm: self.try_word("ext_meter_comm", &mut faults).await,
        };

        if let (Some(a), Some(b)) = (soc, soc_bms) {
            if (a - b).abs() > 10.0 {
                debug!(
                    consus_id = %self.consus_id(),
                    inverter_soc = a,
                    bms_soc = b,
                    "soc cross-check divergence"
                );
            }
        }

        Ok(TelemetrySample {
            consus_id: self.consus_id().to_string(),
            timestamp: Utc::now(),
            mode: String::new(),
            payload: TelemetryPayload {
                soc,
                soc_bms,
                grid_w: Some(grid_w),
                pv_total_w,
                pv_strings_w,
                mppts_w,
                ct2_w,
                battery_v,
                battery_i,
                battery_w,
                ems_mode,
                app_mode,
                health,
                comms_faults: faults,
                writes: self.fieldbus.guard_stats(),
                error: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fieldbus::{SimBus, WriteGuard, WriteGuardPolicy};
    use crate::registers::RegisterMap;
    use std::sync::Arc;

    fn unit(bus: Arc<SimBus>) -> BatteryUnit {
        BatteryUnit::new(FieldBus::new(
            "consus-1",
            bus,
            Arc::new(RegisterMap::goodwe_et()),
            Arc::new(WriteGuard::new(WriteGuardPolicy::default())),
        ))
    }

    fn cfg(pv: bool) -> EdgeBatteryConfig {
        serde_json::from_value(serde_json::json!({
            "consus_id": "consus-1",
            "host": "10.0.0.5",
            "pv_enabled": pv,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn pv_total_sums_strings_mppt_and_ct2() {
        let bus = Arc::new(SimBus::new());
        bus.set_signed(36025, 120);
        bus.set(37007, 55);
        bus.set(35103, 200); // pv1
        bus.set(35107, 150); // pv2
        bus.set(35337, 30); // mppt1
        bus.set_signed(36045, 20); // ct2
        let sample = unit(bus).read_telemetry(&cfg(true)).await.unwrap();
        assert_eq!(sample.payload.pv_total_w, 400.0);
        assert_eq!(sample.payload.soc, Some(55.0));
        assert_eq!(sample.payload.grid_w, Some(120.0));
    }

    #[tokio::test]
    async fn pv_disabled_skips_pv_registers_entirely() {
        let bus = Arc::new(SimBus::new());
        bus.set(35103, 999);
        let sample = unit(bus).read_telemetry(&cfg(false)).await.unwrap();
        assert_eq!(sample.payload.pv_total_w, 0.0);
        assert!(sample.payload.pv_strings_w.is_empty());
    }

    #[tokio::test]
    async fn transport_failure_fails_the_read() {
        let bus = Arc::new(SimBus::new());
        bus.fail_reads(true);
        assert!(unit(bus).read_telemetry(&cfg(false)).await.is_err());
    }

    #[tokio::test]
    async fn health_flags_ride_along() {
        let bus = Arc::new(SimBus::new());
        bus.set(40008, 1);
        bus.set(39896, 0x0002);
        let sample = unit(bus).read_telemetry(&cfg(false)).await.unwrap();
        assert_eq!(sample.payload.health.ems_check_status, Some(1));
        assert_eq!(sample.payload.health.bms_alarm_bits, Some(2));
    }
}
