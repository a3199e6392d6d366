use anyhow::Result;
use lanzone_edge::battery::BatteryUnit;
use lanzone_edge::bootstrap::BootstrapClient;
use lanzone_edge::bus;
use lanzone_edge::config::{
    BootConfig, EXIT_BOOTSTRAP_FAILED, EXIT_CONFIG_INVALID, EXIT_FIELDBUS_MISCONFIGURED, EXIT_OK,
};
use lanzone_edge::controller::BatteryController;
use lanzone_edge::fieldbus::{FieldBus, ModbusTransport, WriteGuard, WriteGuardPolicy};
use lanzone_edge::poster::BackendPoster;
use lanzone_edge::registers::RegisterMap;
use lanzone_edge::state::{EdgeStateStore, TaskBook};
use lanzone_edge::telemetry::{init_tracing, shutdown_signal};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    let config = match BootConfig::load(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };
    init_tracing(&config.log_level);

    match run(config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "fatal");
            ExitCode::from(EXIT_BOOTSTRAP_FAILED)
        }
    }
}

async fn run(config: BootConfig) -> Result<u8> {
    info!(group_id = %config.group_id, "starting lanzone edge controller");

    let bootstrap = BootstrapClient::new(config.bootstrap_url.clone(), config.group_id.clone());
    let init = match bootstrap.fetch_init().await {
        Ok(init) => init,
        Err(e) => {
            error!(error = %format!("{e:#}"), "bootstrap failed");
            return Ok(EXIT_BOOTSTRAP_FAILED);
        }
    };

    let register_map = Arc::new(RegisterMap::from_doc(init.register_map));
    let missing = register_map.missing_required();
    if !missing.is_empty() {
        error!(?missing, "register map lacks required write registers");
        return Ok(EXIT_FIELDBUS_MISCONFIGURED);
    }

    let guard = Arc::new(WriteGuard::new(WriteGuardPolicy {
        per_reg_min: Duration::from_secs_f64(init.settings.write_guard.per_reg_min_s),
        dedupe_staleness: Duration::from_secs_f64(init.settings.write_guard.dedupe_staleness_s),
        global_writes_per_s: init.settings.write_guard.global_writes_per_s,
    }));

    let (poster, poster_handle) = BackendPoster::new(
        &init.endpoints,
        Duration::from_secs_f64(init.settings.posting_interval_s),
        Duration::from_secs_f64(init.settings.alert_batch_interval_s),
    );

    let mut tasks = TaskBook::new();
    let now = chrono::Utc::now();
    for doc in &init.tasks {
        tasks.absorb(doc, now);
    }
    let battery_configs = init.battery_configs.clone();
    let store = Arc::new(EdgeStateStore::new(
        init.settings,
        init.battery_configs,
        tasks,
        init.endpoints,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    handles.push(tokio::spawn(poster.run(shutdown_rx.clone())));

    // Controllers own their transports exclusively; the set of batteries
    // is fixed at bootstrap (adding one means restarting the process).
    let mut recommission_flags = Vec::new();
    for (consus_id, cfg) in &battery_configs {
        let addr: SocketAddr = match format!("{}:{}", cfg.host, cfg.port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                error!(consus_id = %consus_id, host = %cfg.host, port = cfg.port, error = %e,
                    "battery transport endpoint invalid");
                return Ok(EXIT_FIELDBUS_MISCONFIGURED);
            }
        };
        let transport = Arc::new(ModbusTransport::new(addr, cfg.unit_id));
        let fieldbus =
            FieldBus::new(consus_id.as_str(), transport, register_map.clone(), guard.clone());
        let controller = BatteryController::new(
            &config.group_id,
            BatteryUnit::new(fieldbus),
            store.clone(),
            poster_handle.clone(),
            config.tick_period(),
        );
        recommission_flags.push(controller.recommission_flag());
        handles.push(tokio::spawn(controller.run(shutdown_rx.clone())));
    }
    if battery_configs.is_empty() {
        warn!("bootstrap supplied no batteries; running config listener only");
    }

    // The config-bus transport is provided by the embedding deployment;
    // payloads from `lanzone/{group_id}/updates` are fed into this
    // channel and applied by the dispatcher, the store's only writer.
    let (bus_tx, bus_rx) = mpsc::channel::<Vec<u8>>(64);
    info!(topic = %bus::topic(&config.group_id), "config-bus dispatcher listening");
    handles.push(tokio::spawn(bus::run_dispatcher(
        store.clone(),
        bus_rx,
        recommission_flags,
    )));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    // Closing the bus channel lets the dispatcher drain and exit.
    drop(bus_tx);

    // Each loop finishes its in-flight tick and flushes within the grace
    // period; anything still running after that is abandoned.
    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("shutdown grace period expired with tasks still running");
    }

    info!("shutdown complete");
    Ok(EXIT_OK)
}
