//! # Voltage RTU - Modbus RTU master/slave engine
//!
//! Async Modbus RTU over serial lines whose baud rate can change between
//! transactions. One [`Transport`] wraps a serial port; an [`RtuMaster`]
//! and an [`RtuServer`] (the slave side) can be bound to it, and every
//! transaction on it goes through a FIFO [`TransactionScheduler`].
//!
//! ## Features
//!
//! - **Master and slave**: request/response transactions with timeouts, and a
//!   background slave engine serving named register blocks
//! - **Shared transport**: baud rate and line settings changed at runtime,
//!   applied between transactions
//! - **Ordered access**: concurrent callers complete in submission order
//! - **Pluggable links**: `tokio-serial` ports (feature `rtu`) or an
//!   in-process [`LoopbackLink`] for self tests
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Master | Slave |
//! |------|----------|--------|-------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ```rust
//! use voltage_rtu::{
//!     BlockKind, LoopbackLink, ModbusFunction, ModbusResult, RtuMaster, RtuServer, SerialConfig,
//!     Transport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     // Two ports joined by a wire: one slave, one master
//!     let (com1, com2) = LoopbackLink::pair("COM1", "COM2");
//!     let slave_port = Transport::new(com1, SerialConfig::new("COM1", 9600));
//!     let master_port = Transport::new(com2, SerialConfig::new("COM2", 9600));
//!     slave_port.open().await?;
//!     master_port.open().await?;
//!
//!     let mut server = RtuServer::new(slave_port);
//!     let slave = server.add_slave(0x66)?;
//!     slave.add_block("test", BlockKind::HoldingRegisters, 0, 10)?;
//!     slave.set_values("test", 0, &[7, 1, 5])?;
//!     server.start()?;
//!
//!     let master = RtuMaster::new(master_port);
//!     let values = master
//!         .execute(0x66, ModbusFunction::ReadHoldingRegisters, 0, 3)
//!         .await?;
//!     assert_eq!(values, vec![7, 1, 5]);
//!
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants
pub mod constants;

/// Stack-allocated PDU and PDU builders
pub mod pdu;

/// Function codes, requests and responses
pub mod protocol;

/// RTU framing and CRC-16
pub mod frame;

/// Serial links and the shared transport
pub mod transport;

/// FIFO bus access
pub mod scheduler;

/// Injectable packet and transaction logging
pub mod logging;

// ============================================================================
// Engines
// ============================================================================

/// Named register blocks per slave address
pub mod store;

/// Slave engine
pub mod server;

/// Master engine
pub mod master;

/// Typed client trait over the master engine
pub mod client;

/// Device-specific protocol limits
pub mod device_limits;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime ===
pub use tokio;

// === Engines ===
pub use client::ModbusClient;
pub use master::{MasterConfig, RtuMaster};
pub use server::{RtuServer, ServerConfig, ServerState, ServerStats};

// === Error handling ===
pub use error::{FrameErrorKind, ModbusError, ModbusResult};

// === Core types ===
pub use frame::RtuFrame;
pub use protocol::{
    ModbusException, ModbusFunction, ModbusRequest, ModbusResponse, SlaveId, TransactionState,
};
pub use store::{BlockKind, RegisterBlock, SlaveHandle, SlaveStore};

// === Transport ===
pub use scheduler::{BusPermit, BusRole, TransactionScheduler};
pub use transport::{
    DataBits, LineSettings, LoopbackLink, Parity, SerialConfig, SerialLink, StopBits, Transport,
    TransportStats,
};

#[cfg(feature = "rtu")]
pub use transport::SerialPortLink;

// === Device limits ===
pub use device_limits::DeviceLimits;

// === Protocol limits (commonly needed constants) ===
pub use constants::{
    MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_RTU_FRAME_SIZE, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};

// === Logging ===
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};

// === PDU (advanced usage) ===
pub use pdu::{ModbusPdu, PduBuilder};

#[doc(hidden)]
pub use device_limits::{
    DEFAULT_INTER_REQUEST_DELAY_MS, DEFAULT_MAX_READ_COILS, DEFAULT_MAX_READ_REGISTERS,
    DEFAULT_MAX_WRITE_COILS, DEFAULT_MAX_WRITE_REGISTERS,
};

/// Default master response timeout (5 seconds)
pub use master::DEFAULT_TIMEOUT_MS;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage RTU v{} - Modbus RTU master/slave engine", VERSION)
}
