//! Health supervision for one battery. The monitor evaluates the health
//! flags carried in each telemetry sample through per-code debounced
//! state machines, emits alert events on transitions, and publishes the
//! FAULT_SAFE disjunction of the critical codes into a last-write-wins
//! intent cell consumed by the controller.
//!
//! Scans are co-scheduled on the controller tick so the field-bus
//! transport stays exclusively owned by the controller task.

use crate::alerts::{AlertContext, AlertEvent, AlertState, RecentTelemetry, Severity};
use crate::battery::TelemetrySample;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Consecutive polls a raw condition must persist before a transition.
const DEBOUNCE_POLLS: u8 = 2;
/// Commissioning normally settles within the first few ticks; only a
/// sustained failure is worth an alert.
const COMMISSIONING_DEBOUNCE_POLLS: u8 = 10;
const STALE_TELEMETRY_AFTER: Duration = Duration::from_secs(3);
const EXPECTED_PARALLEL_COMM: u16 = 1;
/// Ring depth at a 1 Hz scan rate, roughly the last ten seconds.
const TELEMETRY_RING_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertCode {
    EmsFault,
    BmsAlarm,
    ArcFault,
    BmsWarning,
    ParallelComm,
    MeterCommsLoss,
    StaleTelemetry,
    CommissioningDrift,
}

impl AlertCode {
    pub const ALL: [AlertCode; 8] = [
        AlertCode::EmsFault,
        AlertCode::BmsAlarm,
        AlertCode::ArcFault,
        AlertCode::BmsWarning,
        AlertCode::ParallelComm,
        AlertCode::MeterCommsLoss,
        AlertCode::StaleTelemetry,
        AlertCode::CommissioningDrift,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCode::EmsFault => "EMS_FAULT",
            AlertCode::BmsAlarm => "BMS_ALARM",
            AlertCode::ArcFault => "ARC_FAULT",
            AlertCode::BmsWarning => "BMS_WARNING",
            AlertCode::ParallelComm => "PARALLEL_COMM",
            AlertCode::MeterCommsLoss => "METER_COMMS_LOSS",
            AlertCode::StaleTelemetry => "STALE_TELEMETRY",
            AlertCode::CommissioningDrift => "COMMISSIONING_DRIFT",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            AlertCode::EmsFault | AlertCode::BmsAlarm | AlertCode::ArcFault => Severity::Critical,
            _ => Severity::Warning,
        }
    }

    fn debounce(&self) -> u8 {
        match self {
            AlertCode::CommissioningDrift => COMMISSIONING_DEBOUNCE_POLLS,
            _ => DEBOUNCE_POLLS,
        }
    }
}

/// Fault-safe posture demanded of the controller. Last write wins; the
/// controller reads the cell at the top of every tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultSafeIntent {
    pub active: bool,
    pub source_code: Option<&'static str>,
    pub since: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct CodeState {
    active: bool,
    streak_raw: u8,
    streak_clear: u8,
    event_id: Option<String>,
    count: u32,
    since: Option<DateTime<Utc>>,
}

pub struct HealthMonitor {
    site_id: String,
    consus_id: String,
    states: [CodeState; AlertCode::ALL.len()],
    ring: VecDeque<RecentTelemetry>,
    last_good_read: Option<Instant>,
    intent_tx: watch::Sender<FaultSafeIntent>,
}

impl HealthMonitor {
    pub fn new(
        site_id: impl Into<String>,
        consus_id: impl Into<String>,
    ) -> (Self, watch::Receiver<FaultSafeIntent>) {
        let (intent_tx, intent_rx) = watch::channel(FaultSafeIntent::default());
        (
            Self {
                site_id: site_id.into(),
                consus_id: consus_id.into(),
                states: Default::default(),
                ring: VecDeque::with_capacity(TELEMETRY_RING_LEN),
                last_good_read: None,
                intent_tx,
            },
            intent_rx,
        )
    }

    /// Evaluate one scan. Returns the alert transitions this scan caused,
    /// ready for the poster.
    pub fn observe(
        &mut self,
        sample: &TelemetrySample,
        read_ok: bool,
        commissioned: bool,
        now: Instant,
    ) -> Vec<AlertEvent> {
        if read_ok {
            self.last_good_read = Some(now);
        }

        self.ring.push_back(RecentTelemetry {
            ts: sample.timestamp,
            soc: sample.payload.soc,
            grid_w: sample.payload.grid_w,
            pv_w: Some(sample.payload.pv_total_w),
            mode: sample.payload.app_mode.map(|m| m.to_string()),
            bias_w: None,
        });
        while self.ring.len() > TELEMETRY_RING_LEN {
            self.ring.pop_front();
        }

        let flags = &sample.payload.health;
        let stale = match self.last_good_read {
            Some(at) => now.duration_since(at) > STALE_TELEMETRY_AFTER,
            None => false,
        };

        let mut events = Vec::new();
        for code in AlertCode::ALL {
            let raw = match code {
                AlertCode::EmsFault => {
                    matches!(flags.ems_check_status, Some(status) if status != 1)
                }
                AlertCode::BmsAlarm => matches!(flags.bms_alarm_bits, Some(bits) if bits != 0),
                AlertCode::ArcFault => matches!(flags.arc_fault, Some(v) if v != 0),
                AlertCode::BmsWarning => {
                    matches!(flags.bms_warning_bits, Some(bits) if bits != 0)
                }
                AlertCode::ParallelComm => {
                    matches!(flags.parallel_comm_status, Some(v) if v != EXPECTED_PARALLEL_COMM)
                }
                AlertCode::MeterCommsLoss => {
                    flags.int_meter_comm == Some(0) && flags.ext_meter_comm == Some(0)
                }
                AlertCode::StaleTelemetry => stale,
                AlertCode::CommissioningDrift => !commissioned,
            };
            if let Some(event) = self.step(code, raw, sample) {
                events.push(event);
            }
        }

        self.publish_intent();
        events
    }

    fn step(&mut self, code: AlertCode, raw: bool, sample: &TelemetrySample) -> Option<AlertEvent> {
        let state = &mut self.states[Self::index(code)];
        if raw {
            state.streak_clear = 0;
            state.streak_raw = state.streak_raw.saturating_add(1);
            if !state.active && state.streak_raw >= code.debounce() {
                state.active = true;
                state.count += 1;
                let since = sample.timestamp;
                state.since = Some(since);
                state.event_id = Some(Self::event_id(&self.consus_id, code, since));
                warn!(
                    consus_id = %self.consus_id,
                    code = code.as_str(),
                    count = state.count,
                    "alert active"
                );
                return Some(self.build_event(code, AlertState::Active, sample));
            }
        } else {
            state.streak_raw = 0;
            state.streak_clear = state.streak_clear.saturating_add(1);
            if state.active && state.streak_clear >= code.debounce() {
                state.active = false;
                info!(consus_id = %self.consus_id, code = code.as_str(), "alert cleared");
                let event = self.build_event(code, AlertState::Cleared, sample);
                let state = &mut self.states[Self::index(code)];
                state.event_id = None;
                state.since = None;
                return Some(event);
            }
        }
        None
    }

    fn build_event(&self, code: AlertCode, state: AlertState, sample: &TelemetrySample) -> AlertEvent {
        let code_state = &self.states[Self::index(code)];
        let recent = (code.severity() == Severity::Critical && state == AlertState::Active)
            .then(|| self.ring.iter().cloned().collect());
        AlertEvent {
            site_id: self.site_id.clone(),
            consus_id: self.consus_id.clone(),
            ts: sample.timestamp,
            severity: code.severity(),
            code: code.as_str().to_string(),
            state,
            event_id: code_state.event_id.clone().unwrap_or_default(),
            count: code_state.count,
            context: AlertContext {
                mode: Some(sample.mode.clone()),
                soc: sample.payload.soc,
                grid_w: sample.payload.grid_w,
                pv_w: Some(sample.payload.pv_total_w),
                bias_w: None,
            },
            recent_telemetry: recent,
        }
    }

    /// FAULT_SAFE is the OR of the critical-active states.
    fn publish_intent(&self) {
        let critical = AlertCode::ALL
            .iter()
            .filter(|c| c.severity() == Severity::Critical)
            .find(|c| self.states[Self::index(**c)].active);
        let intent = match critical {
            Some(code) => {
                let state = &self.states[Self::index(*code)];
                FaultSafeIntent {
                    active: true,
                    source_code: Some(code.as_str()),
                    since: state.since,
                    reason: Some(format!("{} active", code.as_str())),
                }
            }
            None => FaultSafeIntent::default(),
        };
        self.intent_tx.send_if_modified(|current| {
            if *current != intent {
                *current = intent;
                true
            } else {
                false
            }
        });
    }

    fn event_id(consus_id: &str, code: AlertCode, since: DateTime<Utc>) -> String {
        let base = format!("{consus_id}:{}:{}", code.as_str(), since.timestamp());
        Uuid::new_v5(&Uuid::NAMESPACE_OID, base.as_bytes())
            .simple()
            .to_string()
    }

    fn index(code: AlertCode) -> usize {
        // `ALL` lists the variants in declaration order.
        code as usize
    }
}
