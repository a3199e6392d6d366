//! Per-battery control loop: snapshot the edge state, read telemetry,
//! run the health scan, let the EMS drive the device, then hand the
//! sample and any alert transitions to the poster. One cooperative task
//! per battery; the field-bus transport is owned here and nowhere else.

use crate::battery::{BatteryUnit, TelemetrySample};
use crate::ems::{ControlInput, EmsManager, RecommissionFlag};
use crate::health::{FaultSafeIntent, HealthMonitor};
use crate::poster::PosterHandle;
use crate::state::{EdgeStateStore, EdgeStatus};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

pub struct BatteryController {
    consus_id: String,
    unit: BatteryUnit,
    ems: EmsManager,
    health: HealthMonitor,
    intent_rx: watch::Receiver<FaultSafeIntent>,
    store: Arc<EdgeStateStore>,
    poster: PosterHandle,
    tick: Duration,
    last_mode_label: String,
}

impl BatteryController {
    pub fn new(
        site_id: &str,
        unit: BatteryUnit,
        store: Arc<EdgeStateStore>,
        poster: PosterHandle,
        tick: Duration,
    ) -> Self {
        let consus_id = unit.consus_id().to_string();
        let (health, intent_rx) = HealthMonitor::new(site_id, consus_id.as_str());
        Self {
            ems: EmsManager::new(consus_id.as_str()),
            consus_id,
            unit,
            health,
            intent_rx,
            store,
            poster,
            tick,
            last_mode_label: "idle".to_string(),
        }
    }

    pub fn consus_id(&self) -> &str {
        &self.consus_id
    }

    pub fn recommission_flag(&self) -> RecommissionFlag {
        self.ems.recommission_flag()
    }

    /// Tick until shutdown. Overruns are not queued: a late tick fires
    /// immediately and missed periods collapse into one.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(consus_id = %self.consus_id, period = ?self.tick, "controller started");
        loop {
            tokio::select! {
                _ = interval.tick() => self.run_once().await,
                _ = shutdown.changed() => break,
            }
        }
        // Leave the device in a safe posture before releasing the bus.
        self.ems.shutdown(self.unit.fieldbus()).await;
        self.unit.fieldbus().close().await;
        info!(consus_id = %self.consus_id, "controller stopped");
    }

    pub async fn run_once(&mut self) {
        let snapshot = self.store.snapshot().await;
        let Some(cfg) = snapshot.battery_configs.get(&self.consus_id).cloned() else {
            warn!(consus_id = %self.consus_id, "no battery config in snapshot; tick skipped");
            return;
        };
        let settings = snapshot.settings.clone();
        let idle = settings.edge_status != EdgeStatus::Active;
        let now = Instant::now();
        let now_local = Utc::now().with_timezone(&settings.timezone);

        let (mut sample, read_ok) = match self.unit.read_telemetry(&cfg).await {
            Ok(sample) => (sample, true),
            Err(e) => {
                warn!(consus_id = %self.consus_id, error = %e, "telemetry read failed");
                (
                    TelemetrySample::error_sample(&self.consus_id, e.to_string()),
                    false,
                )
            }
        };
        if read_ok {
            sample.mode = self.last_mode_label.clone();
        }

        // Health scan first so a fresh intent shapes this very tick.
        let events = self
            .health
            .observe(&sample, read_ok, self.ems.commissioned(), now);
        let fault_safe = self.intent_rx.borrow().active;

        if read_ok {
            let task = snapshot.tasks.task_for(&self.consus_id, now_local.date_naive());
            let input = ControlInput {
                settings: &settings,
                cfg: &cfg,
                task,
                telemetry: &sample.payload,
                fault_safe,
                idle,
                now_time: now_local.time(),
                now,
                tick: self.tick,
            };
            let applied = self.ems.apply(self.unit.fieldbus(), input).await;
            match applied {
                Ok(outcome) => {
                    self.last_mode_label = outcome.mode_label.to_string();
                    sample.mode = self.last_mode_label.clone();
                }
                Err(e) => {
                    warn!(consus_id = %self.consus_id, error = %e, "ems apply failed; tick marked failed");
                    sample.mode = "error".to_string();
                    sample.payload.error = Some(e.to_string());
                }
            }
        }

        sample.payload.writes = self.unit.fieldbus().guard_stats();
        self.poster.enqueue_telemetry(sample);
        for event in events {
            self.poster.enqueue_alert(event);
        }
    }
}
