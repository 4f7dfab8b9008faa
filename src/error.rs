//! # Error Types
//!
//! A single error enum covers every failure the engines can report. Transport
//! and frame errors come from the byte layer, `Timeout` and `Exception` from
//! master transactions, and the remaining variants from configuration and the
//! register store.
//!
//! | Variant | Raised by |
//! |---------|-----------|
//! | `Transport` | I/O failure, use of a closed port, bad line settings |
//! | `Frame` | short frame (`Malformed`) or failed checksum (`CrcMismatch`) |
//! | `Timeout` | master waited past its deadline |
//! | `Exception` | slave answered with an exception response |
//! | `OutOfRange` | block access past the block length |
//! | `DuplicateBlock` | block name already registered |

use std::fmt;
use std::io;

use thiserror::Error;

/// Result alias used throughout the crate
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Why a frame was rejected by the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameErrorKind {
    /// Too short or structurally inconsistent
    Malformed,
    /// Checksum trailer does not match the frame body
    CrcMismatch,
}

impl fmt::Display for FrameErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameErrorKind::Malformed => write!(f, "malformed"),
            FrameErrorKind::CrcMismatch => write!(f, "crc mismatch"),
        }
    }
}

/// Errors produced by the transport, codec, store and engines
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModbusError {
    /// Underlying serial channel failed or is unusable
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Frame rejected by the codec
    #[error("Frame error ({kind}): {message}")]
    Frame {
        kind: FrameErrorKind,
        message: String,
    },

    /// No complete response before the deadline
    #[error("Timeout after {timeout_ms}ms during {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Slave returned an exception response
    #[error("Modbus exception: function=0x{function:02X}, code=0x{code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Response or request violates the protocol
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Function code not supported
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Argument or payload value not acceptable
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Configuration rejected
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Block access past the end of the block
    #[error("Out of range: block '{block}' offset {offset} count {count} exceeds length {length}")]
    OutOfRange {
        block: String,
        offset: usize,
        count: usize,
        length: usize,
    },

    /// No block of the addressed table covers the whole range
    #[error("No {table} block covers address {address} count {count}")]
    AddressNotMapped {
        table: String,
        address: u16,
        count: u16,
    },

    /// Block name already registered for this slave
    #[error("Duplicate block: '{name}'")]
    DuplicateBlock { name: String },

    /// No block with this name
    #[error("Unknown block: '{name}'")]
    UnknownBlock { name: String },

    /// Address range collides with an existing block of the same kind
    #[error("Block '{name}' overlaps existing block '{existing}'")]
    OverlappingBlock { name: String, existing: String },

    /// Slave address already registered on this engine
    #[error("Duplicate slave address: {slave_id}")]
    DuplicateSlave { slave_id: u8 },

    /// Slave address not registered on this engine
    #[error("Unknown slave address: {slave_id}")]
    UnknownSlave { slave_id: u8 },

    /// Operation not permitted in the current engine state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },
}

impl ModbusError {
    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        ModbusError::Transport {
            message: message.into(),
        }
    }

    /// Create a malformed-frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        ModbusError::Frame {
            kind: FrameErrorKind::Malformed,
            message: message.into(),
        }
    }

    /// Create a checksum error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        ModbusError::Frame {
            kind: FrameErrorKind::CrcMismatch,
            message: format!("expected 0x{:04X}, got 0x{:04X}", expected, actual),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        ModbusError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an exception error from the raw function and exception codes
    pub fn exception(function: u8, code: u8) -> Self {
        ModbusError::Exception {
            function: function & 0x7F,
            code,
            message: exception_description(code).to_string(),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        ModbusError::Protocol {
            message: message.into(),
        }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        ModbusError::InvalidFunction { code }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        ModbusError::InvalidData {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        ModbusError::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        ModbusError::InvalidState {
            message: message.into(),
        }
    }

    /// Returns `true` for timeouts
    pub fn is_timeout(&self) -> bool {
        matches!(self, ModbusError::Timeout { .. })
    }

    /// Returns `true` for codec rejections
    pub fn is_frame_error(&self) -> bool {
        matches!(self, ModbusError::Frame { .. })
    }

    /// Frame kind, if this is a codec rejection
    pub fn frame_kind(&self) -> Option<FrameErrorKind> {
        match self {
            ModbusError::Frame { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Exception code carried by an exception response
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            ModbusError::Exception { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the same request may succeed if issued again.
    ///
    /// Only line noise and missed deadlines count. Transport failures need
    /// the port reopened or reconfigured first, and exceptions and argument
    /// errors repeat deterministically. Nothing in this crate retries on its
    /// own.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ModbusError::Timeout { .. } | ModbusError::Frame { .. })
    }
}

impl From<io::Error> for ModbusError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ModbusError::timeout(err.to_string(), 0),
            _ => ModbusError::transport(err.to_string()),
        }
    }
}

#[cfg(feature = "rtu")]
impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        ModbusError::transport(format!("serial port: {}", err))
    }
}

/// Human-readable name of a Modbus exception code
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Server Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Server Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_strips_high_bit() {
        let err = ModbusError::exception(0x83, 0x02);
        match &err {
            ModbusError::Exception {
                function,
                code,
                message,
            } => {
                assert_eq!(*function, 0x03);
                assert_eq!(*code, 0x02);
                assert_eq!(message, "Illegal Data Address");
            }
            other => panic!("unexpected variant: {:?}", other),
        }
        assert_eq!(err.exception_code(), Some(0x02));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_frame_kinds() {
        let malformed = ModbusError::frame("too short");
        assert_eq!(malformed.frame_kind(), Some(FrameErrorKind::Malformed));

        let crc = ModbusError::crc_mismatch(0x0A84, 0x0000);
        assert_eq!(crc.frame_kind(), Some(FrameErrorKind::CrcMismatch));
        assert!(crc.is_recoverable());
        assert!(crc.to_string().contains("crc mismatch"));
    }

    #[test]
    fn test_io_error_conversion() {
        let err: ModbusError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, ModbusError::Transport { .. }));
        assert!(!err.is_recoverable());

        let err: ModbusError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_display() {
        let err = ModbusError::timeout("read response", 5000);
        assert_eq!(err.to_string(), "Timeout after 5000ms during read response");

        let err = ModbusError::OutOfRange {
            block: "test".into(),
            offset: 8,
            count: 5,
            length: 10,
        };
        assert!(err.to_string().contains("'test'"));
    }
}
