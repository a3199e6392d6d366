//! Transport seam between the driver and the wire. The production
//! implementation speaks Modbus/TCP through `tokio-modbus`; tests drive
//! the same trait against [`crate::fieldbus::SimBus`].

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::*;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("device exception code {0}")]
    DeviceException(u8),
}

/// Raw register access. One implementation per transport; the device is
/// owned exclusively by its battery's controller task.
#[async_trait]
pub trait RegisterBus: Send + Sync {
    async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, BusError>;
    async fn write_register(&self, address: u16, value: u16) -> Result<(), BusError>;
    async fn close(&self);
}

#[derive(Debug, Clone, Copy)]
enum BusOp {
    Read { address: u16, count: u16 },
    Write { address: u16, value: u16 },
}

/// Modbus/TCP transport for one inverter.
///
/// The connection is established lazily and dropped on any I/O failure;
/// the next operation attempts a single reconnect after a short backoff.
/// Repeated failure surfaces to the caller, which treats the tick as
/// failed and retries on the next one.
pub struct ModbusTransport {
    addr: SocketAddr,
    slave: Slave,
    op_timeout: Duration,
    reconnect_backoff: Duration,
    ctx: Mutex<Option<Context>>,
}

impl ModbusTransport {
    pub fn new(addr: SocketAddr, unit_id: u8) -> Self {
        Self {
            addr,
            slave: Slave(unit_id),
            op_timeout: Duration::from_secs(1),
            reconnect_backoff: Duration::from_millis(250),
            ctx: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Context, BusError> {
        let mut ctx = tcp::connect(self.addr)
            .await
            .map_err(|e| BusError::Transport(format!("connect {}: {e}", self.addr)))?;
        ctx.set_slave(self.slave);
        debug!(addr = %self.addr, "field bus connected");
        Ok(ctx)
    }

    async fn exec(&self, op: BusOp) -> Result<Vec<u16>, BusError> {
        let mut guard = self.ctx.lock().await;
        for attempt in 0..2u8 {
            if guard.is_none() {
                if attempt > 0 {
                    tokio::time::sleep(self.reconnect_backoff).await;
                }
                *guard = Some(self.connect().await?);
            }
            let Some(ctx) = guard.as_mut() else {
                continue;
            };
            let io = async {
                match op {
                    BusOp::Read { address, count } => {
                        ctx.read_holding_registers(address, count).await
                    }
                    BusOp::Write { address, value } => ctx
                        .write_single_register(address, value)
                        .await
                        .map(|_| Vec::new()),
                }
            };
            let result = tokio::time::timeout(self.op_timeout, io).await;
            match result {
                Ok(Ok(words)) => return Ok(words),
                Ok(Err(e)) => {
                    warn!(addr = %self.addr, error = %e, "field bus i/o error");
                    *guard = None;
                    if attempt > 0 {
                        return Err(BusError::Transport(e.to_string()));
                    }
                }
                Err(_) => {
                    *guard = None;
                    return Err(BusError::Timeout(self.op_timeout));
                }
            }
        }
        Err(BusError::Transport("reconnect failed".into()))
    }
}

#[async_trait]
impl RegisterBus for ModbusTransport {
    async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, BusError> {
        self.exec(BusOp::Read { address, count }).await
    }

    async fn write_register(&self, address: u16, value: u16) -> Result<(), BusError> {
        self.exec(BusOp::Write { address, value }).await.map(|_| ())
    }

    async fn close(&self) {
        let mut guard = self.ctx.lock().await;
        if guard.take().is_some() {
            debug!(addr = %self.addr, "field bus closed");
        }
    }
}
