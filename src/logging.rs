//! # Transaction Logging
//!
//! Engines never print. Verbose output (request/response summaries and raw
//! packet hex dumps) goes through an injectable [`CallbackLogger`], which by
//! default forwards to `tracing`. Applications that want the output elsewhere
//! pass their own [`LogCallback`].
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use voltage_rtu::{CallbackLogger, LogLevel, LoggingMode};
//!
//! let lines = Arc::new(Mutex::new(Vec::new()));
//! let sink = lines.clone();
//! let logger = CallbackLogger::new(
//!     Arc::new(move |_level: LogLevel, msg: &str| sink.lock().unwrap().push(msg.to_string())),
//!     LoggingMode::Verbose,
//! );
//! logger.log_packet("TX", 0x01, &[0x01, 0x03]);
//! assert_eq!(lines.lock().unwrap().len(), 1);
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::frame::format_hex;
use crate::pdu::ModbusPdu;
use crate::protocol::SlaveId;

/// Severity attached to each log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        };
        f.write_str(s)
    }
}

/// How much the logger emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingMode {
    /// Nothing
    Disabled,
    /// Request/response summaries
    #[default]
    Normal,
    /// Summaries plus raw packet hex dumps
    Verbose,
}

/// Sink for log lines
pub type LogCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger injected into the master and slave engines
#[derive(Clone)]
pub struct CallbackLogger {
    callback: LogCallback,
    mode: LoggingMode,
}

impl fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::tracing(LoggingMode::Normal)
    }
}

impl CallbackLogger {
    pub fn new(callback: LogCallback, mode: LoggingMode) -> Self {
        Self { callback, mode }
    }

    /// Logger forwarding to `tracing` at the matching level
    pub fn tracing(mode: LoggingMode) -> Self {
        Self::new(Arc::new(forward_to_tracing), mode)
    }

    /// Verbose `tracing` logger
    pub fn verbose() -> Self {
        Self::tracing(LoggingMode::Verbose)
    }

    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    /// Toggle raw packet dumps
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.mode = if enabled {
            LoggingMode::Verbose
        } else {
            LoggingMode::Normal
        };
    }

    pub fn is_verbose(&self) -> bool {
        self.mode == LoggingMode::Verbose
    }

    /// Emit a line unless disabled
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.mode != LoggingMode::Disabled {
            (self.callback)(level, message);
        }
    }

    pub fn log_request(
        &self,
        slave_id: SlaveId,
        function_code: u8,
        address: u16,
        quantity: u16,
        data: &[u8],
    ) {
        if self.mode == LoggingMode::Disabled {
            return;
        }
        let mut line = format!(
            "-> slave={} fc=0x{:02X} ({}) addr={} qty={}",
            slave_id,
            function_code,
            ModbusPdu::function_code_description(function_code),
            address,
            quantity
        );
        if !data.is_empty() {
            line.push_str(&format!(" data=[{}]", format_hex(data)));
        }
        self.log(LogLevel::Info, &line);
    }

    pub fn log_response(&self, slave_id: SlaveId, function_code: u8, data: &[u8]) {
        if self.mode == LoggingMode::Disabled {
            return;
        }
        let level = if function_code & 0x80 != 0 {
            LogLevel::Warn
        } else {
            LogLevel::Info
        };
        self.log(
            level,
            &format!(
                "<- slave={} fc=0x{:02X} data=[{}]",
                slave_id,
                function_code,
                format_hex(data)
            ),
        );
    }

    /// Raw packet dump, verbose mode only
    pub fn log_packet(&self, direction: &str, slave_id: SlaveId, packet: &[u8]) {
        if self.is_verbose() {
            self.log(
                LogLevel::Debug,
                &format!("[RTU] {} slave:{} {}", direction, slave_id, format_hex(packet)),
            );
        }
    }
}

fn forward_to_tracing(level: LogLevel, message: &str) {
    match level {
        LogLevel::Error => error!("{}", message),
        LogLevel::Warn => warn!("{}", message),
        LogLevel::Info => info!("{}", message),
        LogLevel::Debug => debug!("{}", message),
        LogLevel::Trace => trace!("{}", message),
    }
}
