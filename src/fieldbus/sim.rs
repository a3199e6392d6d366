//! In-memory register bus. Backs the test suite and the commissioning
//! dry-runs; behaves like a well-behaved inverter that remembers every
//! write.

use super::transport::{BusError, RegisterBus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct SimBus {
    registers: Mutex<HashMap<u16, u16>>,
    journal: Mutex<Vec<(u16, u16)>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, address: u16, value: u16) {
        self.registers.lock().unwrap().insert(address, value);
    }

    pub fn set_signed(&self, address: u16, value: i16) {
        self.set(address, value as u16);
    }

    pub fn get(&self, address: u16) -> Option<u16> {
        self.registers.lock().unwrap().get(&address).copied()
    }

    /// Drain the write journal: every `(address, value)` pair applied
    /// since the last call, in order.
    pub fn take_writes(&self) -> Vec<(u16, u16)> {
        std::mem::take(&mut *self.journal.lock().unwrap())
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RegisterBus for SimBus {
    async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, BusError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BusError::Transport("simulated read failure".into()));
        }
        let regs = self.registers.lock().unwrap();
        Ok((0..count)
            .map(|i| regs.get(&(address + i)).copied().unwrap_or(0))
            .collect())
    }

    async fn write_register(&self, address: u16, value: u16) -> Result<(), BusError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BusError::Transport("simulated write failure".into()));
        }
        self.registers.lock().unwrap().insert(address, value);
        self.journal.lock().unwrap().push((address, value));
        Ok(())
    }

    async fn close(&self) {}
}
