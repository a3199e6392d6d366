//! Typed access to one inverter: read and write registers by name, with
//! scaling applied at the map boundary and every write filtered through
//! the shared [`WriteGuard`].

use super::transport::{BusError, RegisterBus};
use super::write_guard::{Admission, DropCause, WriteGuard, WriteGuardStats};
use crate::registers::{Access, RegisterMap, RegisterMapError};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FieldBusError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Map(#[from] RegisterMapError),
}

/// Fate of a guarded write: applied to the bus, or dropped by policy.
/// Transport failures surface as errors instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    Dropped(DropCause),
}

impl WriteOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied)
    }
}

pub struct FieldBus {
    consus_id: String,
    bus: Arc<dyn RegisterBus>,
    map: Arc<RegisterMap>,
    guard: Arc<WriteGuard>,
}

impl FieldBus {
    pub fn new(
        consus_id: impl Into<String>,
        bus: Arc<dyn RegisterBus>,
        map: Arc<RegisterMap>,
        guard: Arc<WriteGuard>,
    ) -> Self {
        Self {
            consus_id: consus_id.into(),
            bus,
            map,
            guard,
        }
    }

    pub fn consus_id(&self) -> &str {
        &self.consus_id
    }

    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    /// Read a register by name, returning the scaled physical value.
    pub async fn read_by_name(&self, name: &str) -> Result<f64, FieldBusError> {
        let desc = self.map.lookup(name)?;
        let words = self
            .bus
            .read_registers(desc.address, desc.words as u16)
            .await?;
        Ok(desc.decode(&words))
    }

    /// Write a physical value to a register by name. The guard decides
    /// whether the write reaches the bus; a drop is a normal outcome the
    /// caller may retry next tick.
    pub async fn write_by_name(
        &self,
        name: &str,
        physical: f64,
    ) -> Result<WriteOutcome, FieldBusError> {
        let desc = self.map.lookup(name)?;
        if desc.access != Access::Rw {
            return Err(RegisterMapError::ReadOnly(name.to_string()).into());
        }
        let word = desc.encode(physical)?;

        match self.guard.admit(&self.consus_id, desc.address, word) {
            Admission::Dropped(cause) => Ok(WriteOutcome::Dropped(cause)),
            Admission::Granted(permit) => match self.bus.write_register(desc.address, word).await {
                Ok(()) => {
                    self.guard.confirm(permit);
                    debug!(
                        consus_id = %self.consus_id,
                        register = name,
                        value = physical,
                        "register written"
                    );
                    Ok(WriteOutcome::Applied)
                }
                Err(e) => {
                    self.guard.fail(permit);
                    Err(e.into())
                }
            },
        }
    }

    pub async fn close(&self) {
        self.bus.close().await;
    }

    pub fn guard_stats(&self) -> WriteGuardStats {
        self.guard.stats()
    }
}
