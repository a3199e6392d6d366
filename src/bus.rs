//! Config-bus dispatcher. The broker transport is an external
//! collaborator that delivers raw JSON payloads from
//! `lanzone/{group_id}/updates` into an in-process channel; this module
//! validates each document and applies it to the edge state store as
//! whole-key replacement. An invalid document is rejected outright and
//! the prior state is retained.

use crate::ems::RecommissionFlag;
use crate::state::{EdgeBatteryConfig, EdgeStateStore, Settings, TaskDoc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use validator::Validate;

pub fn topic(group_id: &str) -> String {
    format!("lanzone/{group_id}/updates")
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("payload is not a json object")]
    NotAnObject,
    #[error("invalid '{key}' document: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("document carries no recognized keys")]
    Empty,
}

/// One validated update, ready to apply.
#[derive(Debug)]
pub enum ConfigUpdate {
    Settings(Box<Settings>),
    BatteryConfigs(HashMap<String, EdgeBatteryConfig>),
    Tasks(Vec<TaskDoc>),
    ValidateModbus,
}

/// Parse and validate a raw bus payload. All present keys must validate
/// before anything is applied; unknown top-level keys are ignored.
pub fn parse_update(raw: &[u8]) -> Result<Vec<ConfigUpdate>, UpdateError> {
    let doc: Value = serde_json::from_slice(raw).map_err(|e| UpdateError::Invalid {
        key: "payload",
        reason: e.to_string(),
    })?;
    let obj = doc.as_object().ok_or(UpdateError::NotAnObject)?;

    let mut updates = Vec::new();

    if let Some(value) = obj.get("settings") {
        let settings: Settings =
            serde_json::from_value(value.clone()).map_err(|e| UpdateError::Invalid {
                key: "settings",
                reason: e.to_string(),
            })?;
        settings.validate().map_err(|e| UpdateError::Invalid {
            key: "settings",
            reason: e.to_string(),
        })?;
        updates.push(ConfigUpdate::Settings(Box::new(settings)));
    }

    if let Some(value) = obj.get("battery_configs") {
        let configs: HashMap<String, EdgeBatteryConfig> = serde_json::from_value(value.clone())
            .map_err(|e| UpdateError::Invalid {
                key: "battery_configs",
                reason: e.to_string(),
            })?;
        for config in configs.values() {
            config.validate().map_err(|e| UpdateError::Invalid {
                key: "battery_configs",
                reason: e.to_string(),
            })?;
        }
        updates.push(ConfigUpdate::BatteryConfigs(configs));
    }

    if let Some(value) = obj.get("tasks") {
        let tasks: Vec<TaskDoc> =
            serde_json::from_value(value.clone()).map_err(|e| UpdateError::Invalid {
                key: "tasks",
                reason: e.to_string(),
            })?;
        updates.push(ConfigUpdate::Tasks(tasks));
    }

    if obj.contains_key("validate_modbus") {
        updates.push(ConfigUpdate::ValidateModbus);
    }

    if updates.is_empty() {
        return Err(UpdateError::Empty);
    }
    Ok(updates)
}

/// Single writer for the edge state store: consume payloads until the
/// channel closes, applying valid documents and dropping invalid ones.
pub async fn run_dispatcher(
    store: Arc<EdgeStateStore>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    recommission: Vec<RecommissionFlag>,
) {
    info!("config-bus dispatcher started");
    while let Some(raw) = rx.recv().await {
        match parse_update(&raw) {
            Ok(updates) => {
                for update in updates {
                    apply_update(&store, update, &recommission).await;
                }
            }
            Err(e) => warn!(error = %e, "config update rejected; prior state retained"),
        }
    }
    info!("config-bus dispatcher stopped");
}

async fn apply_update(
    store: &EdgeStateStore,
    update: ConfigUpdate,
    recommission: &[RecommissionFlag],
) {
    match update {
        ConfigUpdate::Settings(settings) => {
            store.replace_settings(*settings).await;
        }
        ConfigUpdate::BatteryConfigs(configs) => {
            store.replace_battery_configs(configs).await;
        }
        ConfigUpdate::Tasks(docs) => {
            store.absorb_tasks(&docs).await;
            info!(count = docs.len(), "task documents absorbed");
        }
        ConfigUpdate::ValidateModbus => {
            info!("validate-modbus requested; scheduling recommission");
            for flag in recommission {
                flag.request();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EdgeStatus, Endpoints, TaskBook};

    #[test]
    fn topic_embeds_group_id() {
        assert_eq!(topic("lanzone-7"), "lanzone/lanzone-7/updates");
    }

    #[test]
    fn settings_update_parses() {
        let raw = br#"{"settings": {"edge_status": "active", "target_soc_percent": 85}}"#;
        let updates = parse_update(raw).unwrap();
        assert!(matches!(
            &updates[..],
            [ConfigUpdate::Settings(s)] if s.edge_status == EdgeStatus::Active
        ));
    }

    #[test]
    fn invalid_settings_reject_whole_document() {
        // Out-of-range bias fails schema validation.
        let raw = br#"{"settings": {"meter_bias_w": 10000}}"#;
        assert!(matches!(
            parse_update(raw),
            Err(UpdateError::Invalid { key: "settings", .. })
        ));
    }

    #[test]
    fn unknown_top_level_keys_are_ignored() {
        let raw = br#"{"settings": {}, "shiny_new_feature": true}"#;
        assert_eq!(parse_update(raw).unwrap().len(), 1);
    }

    #[test]
    fn document_with_only_unknown_keys_is_rejected() {
        assert!(matches!(
            parse_update(br#"{"shiny_new_feature": true}"#),
            Err(UpdateError::Empty)
        ));
    }

    #[tokio::test]
    async fn dispatcher_applies_settings_and_retains_on_invalid() {
        let store = Arc::new(EdgeStateStore::new(
            Settings::default(),
            HashMap::new(),
            TaskBook::new(),
            Endpoints::default(),
        ));
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(run_dispatcher(store.clone(), rx, Vec::new()));

        tx.send(br#"{"settings": {"edge_status": "active"}}"#.to_vec())
            .await
            .unwrap();
        tx.send(br#"{"settings": {"edge_status": "warp-speed"}}"#.to_vec())
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        // The valid update applied; the invalid one left it in place.
        let snap = store.snapshot().await;
        assert_eq!(snap.settings.edge_status, EdgeStatus::Active);
    }

    #[tokio::test]
    async fn validate_modbus_raises_recommission_flags() {
        let store = Arc::new(EdgeStateStore::new(
            Settings::default(),
            HashMap::new(),
            TaskBook::new(),
            Endpoints::default(),
        ));
        let flag = RecommissionFlag::default();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(run_dispatcher(store, rx, vec![flag.clone()]));
        tx.send(br#"{"validate_modbus": {}}"#.to_vec()).await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert!(flag.take());
    }
}
