//! Live edge state: settings, battery configs and the task book, fed by
//! the config-bus dispatcher and read by every controller tick.
//!
//! Writers replace whole documents behind `Arc`s; readers take a snapshot
//! that clones those `Arc`s under a short read lock, so a tick always
//! sees a consistent set and never a partial merge.

pub mod battery_config;
pub mod settings;
pub mod task;

pub use battery_config::EdgeBatteryConfig;
pub use settings::{
    AutoBiasTrim, BiasSplit, CheapWindow, EdgeStatus, Endpoints, Settings, WriteGuardSettings,
};
pub use task::{TaskBook, TaskDoc, TaskEntry, TaskKind};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

struct Shared {
    settings: Arc<Settings>,
    battery_configs: Arc<HashMap<String, EdgeBatteryConfig>>,
    tasks: Arc<TaskBook>,
    endpoints: Arc<Endpoints>,
}

/// Consistent view of the edge state as of one instant.
#[derive(Clone)]
pub struct EdgeSnapshot {
    pub settings: Arc<Settings>,
    pub battery_configs: Arc<HashMap<String, EdgeBatteryConfig>>,
    pub tasks: Arc<TaskBook>,
    pub endpoints: Arc<Endpoints>,
}

pub struct EdgeStateStore {
    inner: RwLock<Shared>,
}

impl EdgeStateStore {
    pub fn new(
        settings: Settings,
        battery_configs: HashMap<String, EdgeBatteryConfig>,
        tasks: TaskBook,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            inner: RwLock::new(Shared {
                settings: Arc::new(settings),
                battery_configs: Arc::new(battery_configs),
                tasks: Arc::new(tasks),
                endpoints: Arc::new(endpoints),
            }),
        }
    }

    pub async fn snapshot(&self) -> EdgeSnapshot {
        let shared = self.inner.read().await;
        EdgeSnapshot {
            settings: shared.settings.clone(),
            battery_configs: shared.battery_configs.clone(),
            tasks: shared.tasks.clone(),
            endpoints: shared.endpoints.clone(),
        }
    }

    pub async fn replace_settings(&self, settings: Settings) {
        let mut shared = self.inner.write().await;
        shared.settings = Arc::new(settings);
        info!("settings replaced");
    }

    pub async fn replace_battery_configs(&self, configs: HashMap<String, EdgeBatteryConfig>) {
        let mut shared = self.inner.write().await;
        shared.battery_configs = Arc::new(configs);
        info!("battery configs replaced");
    }

    /// Tasks merge day-by-day rather than replacing wholesale, so a push
    /// for tomorrow does not discard today's schedule.
    pub async fn absorb_tasks(&self, docs: &[TaskDoc]) {
        let mut shared = self.inner.write().await;
        let mut book = (*shared.tasks).clone();
        let now = Utc::now();
        for doc in docs {
            book.absorb(doc, now);
        }
        shared.tasks = Arc::new(book);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> EdgeStateStore {
        EdgeStateStore::new(
            Settings::default(),
            HashMap::new(),
            TaskBook::new(),
            Endpoints::default(),
        )
    }

    #[tokio::test]
    async fn snapshot_is_stable_across_later_updates() {
        let store = store();
        let before = store.snapshot().await;

        let mut updated = Settings::default();
        updated.target_soc_percent = 80.0;
        store.replace_settings(updated).await;

        // The earlier snapshot is untouched; a new one sees the update.
        assert_eq!(before.settings.target_soc_percent, 100.0);
        assert_eq!(store.snapshot().await.settings.target_soc_percent, 80.0);
    }

    #[tokio::test]
    async fn settings_update_lands_in_next_snapshot() {
        let store = store();
        let mut s = Settings::default();
        s.edge_status = EdgeStatus::Active;
        s.import_charge_power_w = 3000.0;
        store.replace_settings(s).await;

        let snap = store.snapshot().await;
        assert_eq!(snap.settings.edge_status, EdgeStatus::Active);
        assert_eq!(snap.settings.import_charge_power_w, 3000.0);
    }
}
