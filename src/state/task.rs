//! Charge-window tasks. A battery either has a static task (same window
//! every day) or day-keyed dynamic tasks; the book keeps only today and
//! tomorrow for the dynamic kind and resolves conflicting pushes by
//! override flag, then revision, then update time.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

use super::settings::CheapWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Static,
    Dynamic,
}

/// Wire shape of a task document pushed over the config bus or delivered
/// at bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDoc {
    pub consus_id: String,
    pub task_type: TaskKind,
    #[serde(default)]
    pub task_code: Option<String>,
    #[serde(default)]
    pub service_day: Option<NaiveDate>,
    #[serde(default)]
    pub charge_windows: Vec<CheapWindow>,
    #[serde(default)]
    pub max_import_limit_w: Option<f64>,
    #[serde(default, rename = "override")]
    pub override_: bool,
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub task_code: String,
    pub windows: Vec<CheapWindow>,
    pub max_import_limit_w: Option<f64>,
    pub override_: bool,
    pub revision: u32,
    pub updated_at: DateTime<Utc>,
}

impl TaskEntry {
    fn from_doc(doc: &TaskDoc, now: DateTime<Utc>) -> Self {
        Self {
            task_code: doc
                .task_code
                .clone()
                .unwrap_or_else(|| format!("task-{}", doc.consus_id)),
            windows: doc.charge_windows.clone(),
            max_import_limit_w: doc.max_import_limit_w,
            override_: doc.override_,
            revision: doc.revision,
            updated_at: doc.updated_at.unwrap_or(now),
        }
    }

    /// Conflict resolution for two entries covering the same slot.
    fn supersedes(&self, existing: &TaskEntry) -> bool {
        if self.override_ != existing.override_ {
            return self.override_;
        }
        if self.revision != existing.revision {
            return self.revision > existing.revision;
        }
        self.updated_at > existing.updated_at
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskBook {
    dynamic: HashMap<String, BTreeMap<NaiveDate, TaskEntry>>,
    fixed: HashMap<String, TaskEntry>,
}

impl TaskBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb a pushed task document. Invalid documents are dropped with
    /// the prior book retained.
    pub fn absorb(&mut self, doc: &TaskDoc, now: DateTime<Utc>) {
        let entry = TaskEntry::from_doc(doc, now);
        match doc.task_type {
            TaskKind::Static => {
                match self.fixed.get(&doc.consus_id) {
                    Some(existing) if !entry.supersedes(existing) => {
                        info!(consus_id = %doc.consus_id, "ignored superseded static task");
                    }
                    _ => {
                        info!(consus_id = %doc.consus_id, task_code = %entry.task_code, "static task set");
                        self.fixed.insert(doc.consus_id.clone(), entry);
                    }
                }
            }
            TaskKind::Dynamic => {
                let Some(day) = doc.service_day else {
                    warn!(consus_id = %doc.consus_id, "dynamic task missing service_day; rejected");
                    return;
                };
                let per_day = self.dynamic.entry(doc.consus_id.clone()).or_default();
                match per_day.get(&day) {
                    Some(existing) if !entry.supersedes(existing) => {
                        info!(consus_id = %doc.consus_id, %day, "ignored superseded dynamic task");
                    }
                    _ => {
                        info!(
                            consus_id = %doc.consus_id,
                            %day,
                            windows = entry.windows.len(),
                            "dynamic task set"
                        );
                        per_day.insert(day, entry);
                    }
                }
            }
        }
        self.gc(now.date_naive());
    }

    /// Resolve the task in force for a battery on a given day: the day's
    /// dynamic task if present, otherwise the static one.
    pub fn task_for(&self, consus_id: &str, day: NaiveDate) -> Option<&TaskEntry> {
        self.dynamic
            .get(consus_id)
            .and_then(|per_day| per_day.get(&day))
            .or_else(|| self.fixed.get(consus_id))
    }

    /// Charge windows in force for a battery on a given day.
    pub fn charge_windows(&self, consus_id: &str, day: NaiveDate) -> Vec<CheapWindow> {
        self.task_for(consus_id, day)
            .map(|t| t.windows.clone())
            .unwrap_or_default()
    }

    /// Keep only today's and tomorrow's dynamic entries.
    fn gc(&mut self, today: NaiveDate) {
        let tomorrow = today.succ_opt().unwrap_or(today);
        self.dynamic.retain(|_, per_day| {
            per_day.retain(|day, _| *day == today || *day == tomorrow);
            !per_day.is_empty()
        });
    }
}
