pub mod driver;
pub mod sim;
pub mod transport;
pub mod write_guard;

pub use driver::{FieldBus, FieldBusError, WriteOutcome};
pub use sim::SimBus;
pub use transport::{BusError, ModbusTransport, RegisterBus};
pub use write_guard::{DropCause, WriteGuard, WriteGuardPolicy, WriteGuardStats};
