//! EMS command selection for one inverter: commissioning, the per-tick
//! mode decision (Auto vs Import-AC), setpoint shaping and the meter-bias
//! trim. The manager never talks to the bus directly for reads; it acts
//! on the telemetry the controller already holds and issues writes
//! through the guarded field bus.

pub mod setpoint;
pub mod window;

pub use setpoint::{SetpointLimits, SetpointShaper};

use crate::battery::TelemetryPayload;
use crate::fieldbus::{DropCause, FieldBus, FieldBusError, WriteOutcome};
use crate::state::{EdgeBatteryConfig, Settings, TaskEntry};
use chrono::NaiveTime;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

pub const AUTO_MODE: u16 = 0x0001;
pub const IMPORT_AC_MODE: u16 = 0x0004;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmsMode {
    Auto,
    ImportAc,
}

/// Operator request to redo the commissioning writes, set from the
/// config-bus dispatcher and consumed on the next tick.
#[derive(Clone, Default)]
pub struct RecommissionFlag(Arc<AtomicBool>);

impl RecommissionFlag {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Everything the manager needs for one tick's decision.
pub struct ControlInput<'a> {
    pub settings: &'a Settings,
    pub cfg: &'a EdgeBatteryConfig,
    pub task: Option<&'a TaskEntry>,
    pub telemetry: &'a TelemetryPayload,
    pub fault_safe: bool,
    pub idle: bool,
    pub now_time: NaiveTime,
    pub now: Instant,
    pub tick: Duration,
}

#[derive(Debug, Clone)]
pub struct EmsOutcome {
    pub mode: EmsMode,
    pub mode_label: &'static str,
    pub setpoint_w: f64,
    pub bias_w: Option<f64>,
    pub in_window: bool,
}

pub struct EmsManager {
    consus_id: String,
    recommission: RecommissionFlag,
    commission_done: HashSet<&'static str>,
    commissioned: bool,
    shaper: SetpointShaper,
    /// Last mode write the device took; `None` until the first one lands.
    commanded_mode: Option<u16>,
    /// Exit sequencing: setpoint has been zeroed, the Auto mode write is
    /// still due on a following tick.
    pending_exit: bool,
    /// Last bias value the device took.
    bias_w: Option<f64>,
    last_in_window: Option<bool>,
}

impl EmsManager {
    pub fn new(consus_id: impl Into<String>) -> Self {
        Self {
            consus_id: consus_id.into(),
            recommission: RecommissionFlag::default(),
            commission_done: HashSet::new(),
            commissioned: false,
            shaper: SetpointShaper::new(),
            commanded_mode: None,
            pending_exit: false,
            bias_w: None,
            last_in_window: None,
        }
    }

    pub fn recommission_flag(&self) -> RecommissionFlag {
        self.recommission.clone()
    }

    pub fn commissioned(&self) -> bool {
        self.commissioned
    }

    /// Commissioning writes, retried until each has landed. A write the
    /// guard deduped counts as landed: the device already holds the value.
    async fn commission(&mut self, fb: &FieldBus, settings: &Settings) {
        let mut plan: Vec<(&'static str, f64)> = vec![
            ("manufacturer_code", 2.0),
            ("feed_power_enable", 1.0),
            ("export_power_cap", settings.export_cap_w),
            ("meter_target_power_offset", settings.meter_bias_w),
        ];
        if settings.external_meter {
            plan.push(("external_meter_enable", 1.0));
        }
        if let Some(secs) = settings.remote_comm_loss_time_s {
            plan.push(("remote_comm_loss_time", secs as f64));
        }

        for (name, value) in plan.iter() {
            if self.commission_done.contains(name) {
                continue;
            }
            match fb.write_by_name(name, *value).await {
                Ok(WriteOutcome::Applied) | Ok(WriteOutcome::Dropped(DropCause::Dedup)) => {
                    self.commission_done.insert(name);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        consus_id = %self.consus_id,
                        register = name,
                        error = %e,
                        "commissioning write failed; will retry"
                    );
                }
            }
        }

        if plan.iter().all(|(name, _)| self.commission_done.contains(name)) {
            self.commissioned = true;
            self.bias_w = Some(settings.meter_bias_w);
            info!(
                consus_id = %self.consus_id,
                export_cap_w = settings.export_cap_w,
                "ems commissioning complete"
            );
        }
    }

    /// Drive the device for one tick. Transport errors bubble up and mark
    /// the tick failed; guard drops are normal outcomes retried next tick.
    pub async fn apply(
        &mut self,
        fb: &FieldBus,
        input: ControlInput<'_>,
    ) -> Result<EmsOutcome, FieldBusError> {
        if self.recommission.take() {
            info!(consus_id = %self.consus_id, "recommissioning requested");
            self.commission_done.clear();
            self.commissioned = false;
        }
        if !self.commissioned {
            self.commission(fb, input.settings).await;
        }

        let windows = match input.task {
            Some(task) if !task.windows.is_empty() => task.windows.clone(),
            _ => input.settings.cheap_window.into_iter().collect(),
        };
        let in_window = window::in_any_window(input.now_time, &windows);
        let soc = input.telemetry.soc.or(input.telemetry.soc_bms);

        let wants_import = !input.fault_safe
            && !input.idle
            && in_window
            && soc.is_some_and(|soc| soc < input.settings.target_soc_percent);

        let outcome = if wants_import {
            self.apply_import(fb, &input, in_window).await?
        } else {
            let label = if input.fault_safe {
                "fault_safe"
            } else if input.idle {
                "idle"
            } else {
                "auto"
            };
            self.apply_auto(fb, &input, in_window, label).await?
        };

        self.last_in_window = Some(in_window);
        Ok(outcome)
    }

    async fn apply_import(
        &mut self,
        fb: &FieldBus,
        input: &ControlInput<'_>,
        in_window: bool,
    ) -> Result<EmsOutcome, FieldBusError> {
        self.pending_exit = false;

        if self.commanded_mode != Some(IMPORT_AC_MODE) {
            let wrote = fb
                .write_by_name("ems_power_mode", IMPORT_AC_MODE as f64)
                .await?;
            if wrote.applied() {
                info!(consus_id = %self.consus_id, "ems mode -> import-ac");
                self.commanded_mode = Some(IMPORT_AC_MODE);
            } else {
                // Mode write throttled: do not push a positive setpoint
                // at a device still in Auto. Retry next tick.
                return Ok(EmsOutcome {
                    mode: EmsMode::ImportAc,
                    mode_label: "import_ac",
                    setpoint_w: self.shaper.last_accepted_w(),
                    bias_w: self.bias_w,
                    in_window,
                });
            }
        }

        let pv_w = if input.cfg.pv_enabled {
            input.telemetry.pv_total_w
        } else {
            0.0
        };
        let mut raw = input.settings.import_charge_power_w - pv_w;
        if let Some(cap) = input.task.and_then(|t| t.max_import_limit_w) {
            raw = raw.min(cap);
        }

        let limits = SetpointLimits {
            min_import_w: input.settings.min_import_w,
            max_charge_w: input.cfg.effective_max_charge_w(input.settings),
            max_ramp_rate_w_per_s: input.cfg.effective_ramp_rate(input.settings),
        };
        let shaped = self.shaper.shape(raw, limits, input.now, input.tick);

        if !(0.0..=limits.max_charge_w).contains(&shaped) {
            // The shaper's contract was broken; take the safe posture
            // instead of writing the value.
            error!(
                consus_id = %self.consus_id,
                setpoint_w = shaped,
                max_charge_w = limits.max_charge_w,
                "shaped setpoint escaped its clamp"
            );
            return self.apply_auto(fb, input, in_window, "fault_safe").await;
        }

        let wrote = fb.write_by_name("ems_power_set", shaped).await?;
        if wrote.applied() {
            self.shaper.record_accepted(shaped, input.now);
        }

        Ok(EmsOutcome {
            mode: EmsMode::ImportAc,
            mode_label: "import_ac",
            setpoint_w: shaped,
            bias_w: self.bias_w,
            in_window,
        })
    }

    async fn apply_auto(
        &mut self,
        fb: &FieldBus,
        input: &ControlInput<'_>,
        in_window: bool,
        label: &'static str,
    ) -> Result<EmsOutcome, FieldBusError> {
        // Leaving Import-AC takes two ticks: zero the setpoint first, the
        // mode write follows once the zero has landed.
        if self.commanded_mode == Some(IMPORT_AC_MODE) && !self.pending_exit {
            let wrote = fb.write_by_name("ems_power_set", 0.0).await?;
            if wrote.applied() {
                self.pending_exit = true;
                self.shaper.reset(input.now);
                info!(consus_id = %self.consus_id, "import exit: setpoint zeroed");
            }
            return Ok(EmsOutcome {
                mode: EmsMode::Auto,
                mode_label: label,
                setpoint_w: 0.0,
                bias_w: self.bias_w,
                in_window,
            });
        }

        if self.commanded_mode != Some(AUTO_MODE) {
            let wrote = fb.write_by_name("ems_power_mode", AUTO_MODE as f64).await?;
            if wrote.applied() {
                info!(consus_id = %self.consus_id, "ems mode -> auto");
                self.commanded_mode = Some(AUTO_MODE);
                self.pending_exit = false;
            }
        }

        if self.commanded_mode == Some(AUTO_MODE) {
            // Keep the idle posture asserted; the guard dedupes repeats.
            fb.write_by_name("ems_power_set", 0.0).await?;
            fb.write_by_name("export_power_cap", input.settings.export_cap_w)
                .await?;
            self.maintain_bias(fb, input, in_window, label).await?;
        }

        Ok(EmsOutcome {
            mode: EmsMode::Auto,
            mode_label: label,
            setpoint_w: 0.0,
            bias_w: self.bias_w,
            in_window,
        })
    }

    /// Bias upkeep in Auto: reassert the regime base when the day/night
    /// split flips, and apply at most one trim step per tick when the
    /// trim loop is enabled.
    async fn maintain_bias(
        &mut self,
        fb: &FieldBus,
        input: &ControlInput<'_>,
        in_window: bool,
        label: &'static str,
    ) -> Result<(), FieldBusError> {
        let settings = input.settings;
        let base = settings.base_bias_w(in_window);

        let regime_flipped = settings.bias_split.enable
            && self.last_in_window.is_some_and(|was| was != in_window);
        let mut desired = match self.bias_w {
            Some(current) if !regime_flipped => current,
            _ => base,
        };

        let trim = &settings.auto_bias_trim;
        if trim.enable && label == "auto" {
            if let Some(grid_w) = input.telemetry.grid_w {
                let residual = grid_w - trim.target_w;
                if residual.abs() > trim.deadband_w {
                    let step = if residual > 0.0 { -trim.step_w } else { trim.step_w };
                    desired = (desired + step).clamp(trim.min_w, trim.max_w);
                }
            }
        }

        if self.bias_w != Some(desired) {
            let wrote = fb.write_by_name("meter_target_power_offset", desired).await?;
            if wrote.applied() {
                info!(
                    consus_id = %self.consus_id,
                    bias_w = desired,
                    "meter bias updated"
                );
                self.bias_w = Some(desired);
            }
        }
        Ok(())
    }

    /// Shutdown posture: if the device was last commanded into Import-AC,
    /// zero the setpoint and restore Auto before the task exits.
    pub async fn shutdown(&mut self, fb: &FieldBus) {
        if self.commanded_mode == Some(IMPORT_AC_MODE) || self.pending_exit {
            if let Err(e) = fb.write_by_name("ems_power_set", 0.0).await {
                warn!(consus_id = %self.consus_id, error = %e, "shutdown setpoint write failed");
            }
            if let Err(e) = fb.write_by_name("ems_power_mode", AUTO_MODE as f64).await {
                warn!(consus_id = %self.consus_id, error = %e, "shutdown mode write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fieldbus::{SimBus, WriteGuard, WriteGuardPolicy};
    use crate::registers::RegisterMap;
    use crate::state::CheapWindow;

    const REG_MODE: u16 = 47511;
    const REG_SET: u16 = 47512;
    const REG_CAP: u16 = 47510;
    const REG_BIAS: u16 = 47120;

    struct Rig {
        bus: Arc<SimBus>,
        fb: FieldBus,
        ems: EmsManager,
        settings: Settings,
        cfg: EdgeBatteryConfig,
        now: Instant,
    }

    impl Rig {
        fn new() -> Self {
            let bus = Arc::new(SimBus::new());
            let fb = FieldBus::new(
                "consus-1",
                bus.clone(),
                Arc::new(RegisterMap::goodwe_et()),
                Arc::new(WriteGuard::new(WriteGuardPolicy::default())),
            );
            let mut settings = Settings::default();
            settings.cheap_window = Some(CheapWindow::new(
                NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(5, 0, 0).unwrap(),
            ));
            settings.target_soc_percent = 80.0;
            settings.import_charge_power_w = 3000.0;
            settings.min_import_w = 200.0;
            settings.max_charge_w = 5000.0;
            settings.max_ramp_rate_w_per_s = 500.0;
            settings.pv_enabled = true;
            let cfg: EdgeBatteryConfig = serde_json::from_value(serde_json::json!({
                "consus_id": "consus-1",
                "host": "10.0.0.5",
                "pv_enabled": true,
            }))
            .unwrap();
            Self {
                bus,
                fb,
                ems: EmsManager::new("consus-1"),
                settings,
                cfg,
                now: Instant::now(),
            }
        }

        async fn tick(
            &mut self,
            time: (u32, u32),
            soc: f64,
            pv_w: f64,
            grid_w: f64,
            fault_safe: bool,
        ) -> EmsOutcome {
            let telemetry = TelemetryPayload {
                soc: Some(soc),
                grid_w: Some(grid_w),
                pv_total_w: pv_w,
                ..Default::default()
            };
            let input = ControlInput {
                settings: &self.settings,
                cfg: &self.cfg,
                task: None,
                telemetry: &telemetry,
                fault_safe,
                idle: false,
                now_time: NaiveTime::from_hms_opt(time.0, time.1, 0).unwrap(),
                now: self.now,
                tick: Duration::from_secs(1),
            };
            let out = self.ems.apply(&self.fb, input).await.unwrap();
            self.now += Duration::from_secs(1);
            tokio::time::advance(Duration::from_secs(1)).await;
            out
        }

        /// Run ticks until commissioning has settled, then clear the journal.
        async fn commission(&mut self) {
            for _ in 0..3 {
                self.tick((12, 0), 50.0, 0.0, 0.0, false).await;
                if self.ems.commissioned() {
                    break;
                }
            }
            assert!(self.ems.commissioned());
            self.bus.take_writes();
        }
    }

    fn writes_to(journal: &[(u16, u16)], reg: u16) -> Vec<u16> {
        journal.iter().filter(|(a, _)| *a == reg).map(|(_, v)| *v).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn night_charge_enters_import_and_ramps() {
        let mut rig = Rig::new();
        rig.commission().await;

        // 02:00, SOC below target, 400 W of PV: target is 2600 W but the
        // first accepted write ramps from zero.
        let out = rig.tick((2, 0), 50.0, 400.0, 0.0, false).await;
        assert_eq!(out.mode, EmsMode::ImportAc);
        assert_eq!(out.setpoint_w, 500.0);
        let journal = rig.bus.take_writes();
        assert_eq!(writes_to(&journal, REG_MODE), vec![IMPORT_AC_MODE]);
        assert_eq!(writes_to(&journal, REG_SET), vec![500]);

        // Successive ticks climb by the ramp budget up to the target.
        let mut setpoints = Vec::new();
        for _ in 0..5 {
            let out = rig.tick((2, 0), 50.0, 400.0, 0.0, false).await;
            setpoints.push(out.setpoint_w);
        }
        assert_eq!(setpoints, vec![1000.0, 1500.0, 2000.0, 2500.0, 2600.0]);
        assert_eq!(rig.bus.get(REG_SET), Some(2600));
    }

    #[tokio::test(start_paused = true)]
    async fn daytime_runs_auto_with_zero_setpoint_and_cap() {
        let mut rig = Rig::new();
        rig.settings.auto_bias_trim.enable = true;
        rig.settings.auto_bias_trim.target_w = 0.0;
        rig.settings.auto_bias_trim.deadband_w = 100.0;
        rig.settings.auto_bias_trim.step_w = 20.0;
        rig.commission().await;

        let out = rig.tick((13, 0), 40.0, 0.0, 150.0, false).await;
        assert_eq!(out.mode, EmsMode::Auto);
        assert_eq!(out.setpoint_w, 0.0);
        let journal = rig.bus.take_writes();
        assert_eq!(writes_to(&journal, REG_MODE), vec![AUTO_MODE]);
        assert_eq!(writes_to(&journal, REG_SET), vec![0]);
        // Cap was asserted at commissioning; within the dedupe window the
        // reassert is suppressed, so the register still holds the value.
        assert_eq!(rig.bus.get(REG_CAP), Some(0));
        // Grid 150 W over a 0 W target with 100 W deadband: one -20 W step.
        assert_eq!(writes_to(&journal, REG_BIAS), vec![(-70i16) as u16]);
    }

    #[tokio::test(start_paused = true)]
    async fn fault_safe_mid_charge_zeroes_then_swaps_mode() {
        let mut rig = Rig::new();
        rig.commission().await;

        for _ in 0..4 {
            rig.tick((2, 0), 50.0, 400.0, 0.0, false).await;
        }
        rig.bus.take_writes();

        // Fault intent active: same tick the setpoint is zeroed...
        let out = rig.tick((2, 0), 50.0, 400.0, 0.0, true).await;
        assert_eq!(out.mode_label, "fault_safe");
        let journal = rig.bus.take_writes();
        assert_eq!(writes_to(&journal, REG_SET), vec![0]);
        assert!(writes_to(&journal, REG_MODE).is_empty());

        // ...and the mode write follows on the next tick.
        rig.tick((2, 0), 50.0, 400.0, 0.0, true).await;
        let journal = rig.bus.take_writes();
        assert_eq!(writes_to(&journal, REG_MODE), vec![AUTO_MODE]);

        // While the intent stays active no import writes appear.
        let out = rig.tick((2, 0), 50.0, 400.0, 0.0, true).await;
        assert_eq!(out.mode, EmsMode::Auto);
        let journal = rig.bus.take_writes();
        assert!(writes_to(&journal, REG_MODE).iter().all(|m| *m != IMPORT_AC_MODE));
        assert!(writes_to(&journal, REG_SET).iter().all(|v| *v == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn target_reached_runs_exit_sequence() {
        let mut rig = Rig::new();
        rig.commission().await;

        for _ in 0..3 {
            rig.tick((2, 0), 50.0, 0.0, 0.0, false).await;
        }
        rig.bus.take_writes();

        // SOC hits the 80 % target: setpoint zero this tick.
        rig.tick((2, 0), 80.0, 0.0, 0.0, false).await;
        let journal = rig.bus.take_writes();
        assert_eq!(writes_to(&journal, REG_SET), vec![0]);
        assert!(writes_to(&journal, REG_MODE).is_empty());

        // Mode write on the next tick.
        rig.tick((2, 0), 80.0, 0.0, 0.0, false).await;
        let journal = rig.bus.take_writes();
        assert_eq!(writes_to(&journal, REG_MODE), vec![AUTO_MODE]);
    }

    #[tokio::test(start_paused = true)]
    async fn pv_covering_demand_floors_at_min_import() {
        let mut rig = Rig::new();
        rig.commission().await;

        // PV 2900 of a 3000 W target leaves 100 W, floored to 200 W.
        let out = rig.tick((2, 0), 50.0, 2900.0, 0.0, false).await;
        assert_eq!(out.setpoint_w, 200.0);
    }

    #[tokio::test(start_paused = true)]
    async fn import_respects_task_cap() {
        let mut rig = Rig::new();
        rig.commission().await;

        let task = TaskEntry {
            task_code: "t-1".into(),
            windows: vec![CheapWindow::new(
                NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
            )],
            max_import_limit_w: Some(400.0),
            override_: false,
            revision: 1,
            updated_at: chrono::Utc::now(),
        };
        let telemetry = TelemetryPayload {
            soc: Some(50.0),
            grid_w: Some(0.0),
            ..Default::default()
        };
        let input = ControlInput {
            settings: &rig.settings,
            cfg: &rig.cfg,
            task: Some(&task),
            telemetry: &telemetry,
            fault_safe: false,
            idle: false,
            now_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            now: rig.now,
            tick: Duration::from_secs(1),
        };
        let out = rig.ems.apply(&rig.fb, input).await.unwrap();
        assert_eq!(out.mode, EmsMode::ImportAc);
        assert_eq!(out.setpoint_w, 400.0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_edge_holds_auto_zero() {
        let mut rig = Rig::new();
        rig.commission().await;

        let telemetry = TelemetryPayload {
            soc: Some(50.0),
            ..Default::default()
        };
        let input = ControlInput {
            settings: &rig.settings,
            cfg: &rig.cfg,
            task: None,
            telemetry: &telemetry,
            fault_safe: false,
            idle: true,
            now_time: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            now: rig.now,
            tick: Duration::from_secs(1),
        };
        let out = rig.ems.apply(&rig.fb, input).await.unwrap();
        assert_eq!(out.mode, EmsMode::Auto);
        assert_eq!(out.mode_label, "idle");
        assert_eq!(out.setpoint_w, 0.0);
    }
}
