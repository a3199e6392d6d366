//! End-to-end controller scenarios over the in-memory register bus:
//! charge-window entry, fault-safe sequencing, stale-telemetry fallback
//! and config round-trips, all under a paused clock.

use chrono::NaiveTime;
use lanzone_edge::alerts::{AlertEvent, AlertState, Severity};
use lanzone_edge::battery::{BatteryUnit, TelemetrySample};
use lanzone_edge::controller::BatteryController;
use lanzone_edge::fieldbus::{FieldBus, SimBus, WriteGuard, WriteGuardPolicy};
use lanzone_edge::poster::PosterHandle;
use lanzone_edge::registers::RegisterMap;
use lanzone_edge::state::{
    CheapWindow, EdgeBatteryConfig, EdgeStateStore, EdgeStatus, Endpoints, Settings, TaskBook,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const REG_MODE: u16 = 47511;
const REG_SET: u16 = 47512;
const AUTO: u16 = 0x0001;
const IMPORT_AC: u16 = 0x0004;

fn full_day_window() -> CheapWindow {
    CheapWindow::new(
        NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
    )
}

fn settings(window: Option<CheapWindow>) -> Settings {
    let mut settings = Settings::default();
    settings.edge_status = EdgeStatus::Active;
    settings.cheap_window = window;
    settings.target_soc_percent = 80.0;
    settings.import_charge_power_w = 3000.0;
    settings.min_import_w = 200.0;
    settings.max_charge_w = 5000.0;
    settings.max_ramp_rate_w_per_s = 500.0;
    settings
}

struct Rig {
    bus: Arc<SimBus>,
    store: Arc<EdgeStateStore>,
    controller: BatteryController,
    telemetry_rx: mpsc::Receiver<TelemetrySample>,
    alert_rx: mpsc::Receiver<AlertEvent>,
}

impl Rig {
    fn new(settings: Settings) -> Self {
        let bus = Arc::new(SimBus::new());
        // A healthy inverter at 50 % SOC.
        bus.set(37007, 50);
        bus.set(40008, 1);
        bus.set(36066, 1);
        bus.set(50092, 1);
        bus.set(50094, 1);

        let cfg: EdgeBatteryConfig = serde_json::from_value(serde_json::json!({
            "consus_id": "consus-1",
            "host": "10.0.0.5",
        }))
        .unwrap();
        let mut configs = HashMap::new();
        configs.insert("consus-1".to_string(), cfg);

        let store = Arc::new(EdgeStateStore::new(
            settings,
            configs,
            TaskBook::new(),
            Endpoints::default(),
        ));
        let fieldbus = FieldBus::new(
            "consus-1",
            bus.clone(),
            Arc::new(RegisterMap::goodwe_et()),
            Arc::new(WriteGuard::new(WriteGuardPolicy::default())),
        );
        let (poster, telemetry_rx, alert_rx) = PosterHandle::channel();
        let controller = BatteryController::new(
            "lanzone-1",
            BatteryUnit::new(fieldbus),
            store.clone(),
            poster,
            Duration::from_secs(1),
        );
        Self {
            bus,
            store,
            controller,
            telemetry_rx,
            alert_rx,
        }
    }

    async fn tick(&mut self) {
        self.controller.run_once().await;
        tokio::time::advance(Duration::from_secs(1)).await;
    }

    async fn ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.tick().await;
        }
    }

    fn modes(&mut self) -> Vec<String> {
        let mut modes = Vec::new();
        while let Ok(sample) = self.telemetry_rx.try_recv() {
            modes.push(sample.mode);
        }
        modes
    }

    fn alerts(&mut self) -> Vec<AlertEvent> {
        let mut alerts = Vec::new();
        while let Ok(event) = self.alert_rx.try_recv() {
            alerts.push(event);
        }
        alerts
    }
}

fn writes_to(journal: &[(u16, u16)], reg: u16) -> Vec<u16> {
    journal.iter().filter(|(a, _)| *a == reg).map(|(_, v)| *v).collect()
}

#[tokio::test(start_paused = true)]
async fn charge_window_drives_import_mode_with_ramped_setpoint() {
    let mut rig = Rig::new(settings(Some(full_day_window())));

    // First tick commissions; the mode/setpoint writes land from the
    // second tick and ramp at 500 W/s toward the 3 kW import target.
    rig.ticks(8).await;

    let journal = rig.bus.take_writes();
    assert_eq!(writes_to(&journal, REG_MODE), vec![IMPORT_AC]);
    assert_eq!(
        writes_to(&journal, REG_SET),
        vec![500, 1000, 1500, 2000, 2500, 3000]
    );
    assert!(rig.modes().iter().skip(1).all(|m| m == "import_ac"));
}

#[tokio::test(start_paused = true)]
async fn bms_alarm_forces_fault_safe_exit_and_critical_alert() {
    let mut rig = Rig::new(settings(Some(full_day_window())));
    rig.ticks(3).await;
    rig.bus.take_writes();

    // Alarm bits appear; two polls of debounce, then the same tick the
    // intent activates the setpoint is zeroed, mode follows next tick.
    rig.bus.set(39896, 0x0004);
    rig.ticks(2).await;
    let journal = rig.bus.take_writes();
    let sets = writes_to(&journal, REG_SET);
    assert_eq!(sets.last(), Some(&0));
    assert!(writes_to(&journal, REG_MODE).is_empty());

    rig.tick().await;
    let journal = rig.bus.take_writes();
    assert_eq!(writes_to(&journal, REG_MODE), vec![AUTO]);

    // While the intent is active nothing commands Import-AC again.
    rig.ticks(3).await;
    let journal = rig.bus.take_writes();
    assert!(writes_to(&journal, REG_MODE).iter().all(|m| *m != IMPORT_AC));
    assert!(writes_to(&journal, REG_SET).iter().all(|v| *v == 0));

    let alerts = rig.alerts();
    let critical: Vec<_> = alerts
        .iter()
        .filter(|a| a.severity == Severity::Critical)
        .collect();
    assert_eq!(critical.len(), 1);
    let alarm = critical[0];
    assert_eq!(alarm.code, "BMS_ALARM");
    assert_eq!(alarm.state, AlertState::Active);
    assert!(alarm.recent_telemetry.as_ref().is_some_and(|r| !r.is_empty()));
    assert!(rig.modes().contains(&"fault_safe".to_string()));
}

#[tokio::test(start_paused = true)]
async fn alarm_clearance_returns_to_import() {
    let mut rig = Rig::new(settings(Some(full_day_window())));
    rig.ticks(2).await;
    rig.bus.set(39896, 1);
    rig.ticks(4).await;

    rig.bus.set(39896, 0);
    rig.ticks(4).await;

    let alerts = rig.alerts();
    assert!(alerts
        .iter()
        .any(|a| a.code == "BMS_ALARM" && a.state == AlertState::Cleared));
    // Back under Import-AC once the intent clears.
    let journal = rig.bus.take_writes();
    assert!(writes_to(&journal, REG_MODE).contains(&IMPORT_AC));
}

#[tokio::test(start_paused = true)]
async fn failed_reads_stop_control_writes_and_raise_stale_warning() {
    let mut rig = Rig::new(settings(None));
    rig.ticks(2).await;
    rig.bus.take_writes();

    rig.bus.fail_reads(true);
    rig.ticks(6).await;

    // No control writes while the transport is down.
    assert!(rig.bus.take_writes().is_empty());
    let alerts = rig.alerts();
    let stale: Vec<_> = alerts.iter().filter(|a| a.code == "STALE_TELEMETRY").collect();
    assert!(!stale.is_empty());
    assert_eq!(stale[0].severity, Severity::Warning);
    assert_eq!(stale[0].state, AlertState::Active);

    // Error-marked samples flow to the poster throughout.
    assert!(rig.modes().iter().any(|m| m == "error"));
}

#[tokio::test(start_paused = true)]
async fn settings_update_is_visible_on_the_next_tick() {
    let mut idle = settings(Some(full_day_window()));
    idle.edge_status = EdgeStatus::Paused;
    let mut rig = Rig::new(idle);
    rig.ticks(2).await;
    assert!(rig.modes().iter().all(|m| m == "idle"));

    rig.store.replace_settings(settings(Some(full_day_window()))).await;
    rig.ticks(2).await;
    let modes = rig.modes();
    assert_eq!(modes.last().map(String::as_str), Some("import_ac"));

    let journal = rig.bus.take_writes();
    assert!(writes_to(&journal, REG_MODE).contains(&IMPORT_AC));
}

#[tokio::test(start_paused = true)]
async fn soc_at_target_never_enters_import() {
    let mut rig = Rig::new(settings(Some(full_day_window())));
    rig.bus.set(37007, 80);
    rig.ticks(4).await;

    let journal = rig.bus.take_writes();
    assert!(writes_to(&journal, REG_MODE).iter().all(|m| *m == AUTO));
    assert!(writes_to(&journal, REG_SET).iter().all(|v| *v == 0));
}
