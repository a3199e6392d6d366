//! Write discipline for the field bus: duplicate suppression, a minimum
//! interval per register and a global per-second budget. Every attempt is
//! either granted, dropped with an explicit cause, or (after a grant)
//! reported as a transport error; nothing is queued and nothing is lost
//! silently.
//!
//! The mutex guards ledger inspection and budget accounting only; the bus
//! write itself happens outside it, between [`WriteGuard::admit`] and
//! [`WriteGuard::confirm`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Tunable policy; defaults follow the deployed values.
#[derive(Debug, Clone, Copy)]
pub struct WriteGuardPolicy {
    pub per_reg_min: Duration,
    pub dedupe_staleness: Duration,
    pub global_writes_per_s: u32,
}

impl Default for WriteGuardPolicy {
    fn default() -> Self {
        Self {
            per_reg_min: Duration::from_millis(250),
            dedupe_staleness: Duration::from_secs(30),
            global_writes_per_s: 5,
        }
    }
}

/// Why a write attempt was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    Dedup,
    ThrottlePerReg,
    ThrottleGlobal,
}

/// Decision counters, exposed through telemetry.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WriteGuardStats {
    pub writes_ok: u64,
    pub writes_dedup: u64,
    pub writes_throttle_per_reg: u64,
    pub writes_throttle_global: u64,
    pub writes_error: u64,
}

/// Grant token returned by [`WriteGuard::admit`]. The caller performs the
/// bus write and then settles the permit with `confirm` or `fail`.
#[derive(Debug)]
pub struct Permit {
    key: (String, u16),
    value: u16,
}

#[derive(Debug)]
pub enum Admission {
    Granted(Permit),
    Dropped(DropCause),
}

struct LedgerEntry {
    value: u16,
    written_at: Instant,
}

struct Inner {
    ledger: HashMap<(String, u16), LedgerEntry>,
    window_start: Instant,
    window_used: u32,
    stats: WriteGuardStats,
}

/// Process-wide guard; drivers for every battery share one instance, with
/// ledger entries keyed by `(device, register)`.
pub struct WriteGuard {
    policy: WriteGuardPolicy,
    inner: Mutex<Inner>,
}

impl WriteGuard {
    pub fn new(policy: WriteGuardPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Inner {
                ledger: HashMap::new(),
                window_start: Instant::now(),
                window_used: 0,
                stats: WriteGuardStats::default(),
            }),
        }
    }

    pub fn admit(&self, device: &str, address: u16, value: u16) -> Admission {
        self.admit_at(device, address, value, Instant::now())
    }

    /// Checks run in order: per-register interval, global budget, dedupe.
    /// The budget is charged for every attempt that clears the interval
    /// check, so a duplicate storm surfaces as throttling once the
    /// second's budget is spent.
    pub fn admit_at(&self, device: &str, address: u16, value: u16, now: Instant) -> Admission {
        let mut inner = self.inner.lock().unwrap();

        if now.duration_since(inner.window_start) >= Duration::from_secs(1) {
            inner.window_start = now;
            inner.window_used = 0;
        }

        let key = (device.to_string(), address);
        if let Some(entry) = inner.ledger.get(&key) {
            if now.duration_since(entry.written_at) < self.policy.per_reg_min {
                inner.stats.writes_throttle_per_reg += 1;
                debug!(device, address, "write throttled: per-register interval");
                return Admission::Dropped(DropCause::ThrottlePerReg);
            }
        }

        if inner.window_used >= self.policy.global_writes_per_s {
            inner.stats.writes_throttle_global += 1;
            debug!(device, address, "write throttled: global rate");
            return Admission::Dropped(DropCause::ThrottleGlobal);
        }
        inner.window_used += 1;

        if let Some(entry) = inner.ledger.get(&key) {
            if entry.value == value
                && now.duration_since(entry.written_at) < self.policy.dedupe_staleness
            {
                inner.stats.writes_dedup += 1;
                debug!(device, address, value, "write suppressed: duplicate");
                return Admission::Dropped(DropCause::Dedup);
            }
        }

        Admission::Granted(Permit { key, value })
    }

    pub fn confirm(&self, permit: Permit) {
        self.confirm_at(permit, Instant::now())
    }

    pub fn confirm_at(&self, permit: Permit, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        inner.ledger.insert(
            permit.key,
            LedgerEntry {
                value: permit.value,
                written_at: now,
            },
        );
        inner.stats.writes_ok += 1;
    }

    /// The write reached the bus but the transport reported failure; the
    /// ledger is left untouched so the next attempt is not deduped
    /// against a value the device never took.
    pub fn fail(&self, _permit: Permit) {
        self.inner.lock().unwrap().stats.writes_error += 1;
    }

    pub fn stats(&self) -> WriteGuardStats {
        self.inner.lock().unwrap().stats
    }
}
