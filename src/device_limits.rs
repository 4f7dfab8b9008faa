//! # Device Limits
//!
//! Many field devices accept fewer items per request than the protocol
//! allows, and some need a pause between requests. The master checks every
//! request against the limits of the device it is talking to before anything
//! goes on the wire.
//!
//! | Operation | Protocol maximum |
//! |-----------|------------------|
//! | Read Holding/Input Registers (FC03/04) | 125 |
//! | Read Coils/Discrete Inputs (FC01/02) | 2000 |
//! | Write Multiple Registers (FC16) | 123 |
//! | Write Multiple Coils (FC15) | 1968 |

use std::time::Duration;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::ModbusFunction;

pub const DEFAULT_MAX_READ_REGISTERS: u16 = 125;
pub const DEFAULT_MAX_WRITE_REGISTERS: u16 = 123;
pub const DEFAULT_MAX_READ_COILS: u16 = 2000;
pub const DEFAULT_MAX_WRITE_COILS: u16 = 1968;
pub const DEFAULT_INTER_REQUEST_DELAY_MS: u64 = 0;

/// Per-device quantity caps and pacing for one master.
///
/// ```rust
/// use voltage_rtu::{DeviceLimits, ModbusFunction};
///
/// // A sensor that answers at most 16 registers and needs 20ms between polls
/// let limits = DeviceLimits::new()
///     .with_max_read_registers(16)
///     .with_inter_request_delay_ms(20);
///
/// assert!(limits.check(ModbusFunction::ReadInputRegisters, 16).is_ok());
/// assert!(limits.check(ModbusFunction::ReadInputRegisters, 17).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// FC03/FC04 registers per request
    pub max_read_registers: u16,
    /// FC10 registers per request
    pub max_write_registers: u16,
    /// FC01/FC02 bits per request
    pub max_read_coils: u16,
    /// FC0F coils per request
    pub max_write_coils: u16,
    /// Pause after each transaction before the bus is released (milliseconds)
    pub inter_request_delay_ms: u64,
}

impl DeviceLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_read_registers(mut self, count: u16) -> Self {
        self.max_read_registers = count;
        self
    }

    pub fn with_max_write_registers(mut self, count: u16) -> Self {
        self.max_write_registers = count;
        self
    }

    pub fn with_max_read_coils(mut self, count: u16) -> Self {
        self.max_read_coils = count;
        self
    }

    pub fn with_max_write_coils(mut self, count: u16) -> Self {
        self.max_write_coils = count;
        self
    }

    pub fn with_inter_request_delay_ms(mut self, delay_ms: u64) -> Self {
        self.inter_request_delay_ms = delay_ms;
        self
    }

    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_millis(self.inter_request_delay_ms)
    }

    /// Largest quantity this device accepts for `function`
    pub fn max_quantity(&self, function: ModbusFunction) -> u16 {
        match function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => self.max_read_coils,
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                self.max_read_registers
            }
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => 1,
            ModbusFunction::WriteMultipleCoils => self.max_write_coils,
            ModbusFunction::WriteMultipleRegisters => self.max_write_registers,
        }
    }

    /// Reject a request quantity the device cannot handle
    pub fn check(&self, function: ModbusFunction, quantity: u16) -> ModbusResult<()> {
        let max = self.max_quantity(function);
        if quantity > max {
            return Err(ModbusError::invalid_data(format!(
                "{} quantity {} exceeds device limit {}",
                function, quantity, max
            )));
        }
        Ok(())
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_read_registers: DEFAULT_MAX_READ_REGISTERS,
            max_write_registers: DEFAULT_MAX_WRITE_REGISTERS,
            max_read_coils: DEFAULT_MAX_READ_COILS,
            max_write_coils: DEFAULT_MAX_WRITE_COILS,
            inter_request_delay_ms: DEFAULT_INTER_REQUEST_DELAY_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_match_protocol() {
        let limits = DeviceLimits::default();
        for function in [
            ModbusFunction::ReadCoils,
            ModbusFunction::ReadHoldingRegisters,
            ModbusFunction::WriteMultipleCoils,
            ModbusFunction::WriteMultipleRegisters,
        ] {
            assert_eq!(limits.max_quantity(function), function.max_quantity());
        }
        assert_eq!(limits.inter_request_delay(), Duration::ZERO);
    }

    #[test]
    fn test_each_cap_applies_to_its_functions() {
        let limits = DeviceLimits::new()
            .with_max_read_registers(16)
            .with_max_write_registers(8)
            .with_max_read_coils(100)
            .with_max_write_coils(4);

        assert!(limits.check(ModbusFunction::ReadInputRegisters, 16).is_ok());
        assert!(matches!(
            limits.check(ModbusFunction::ReadHoldingRegisters, 17),
            Err(ModbusError::InvalidData { .. })
        ));
        assert!(limits.check(ModbusFunction::WriteMultipleRegisters, 8).is_ok());
        assert!(limits.check(ModbusFunction::WriteMultipleRegisters, 9).is_err());
        assert!(limits.check(ModbusFunction::ReadDiscreteInputs, 100).is_ok());
        assert!(limits.check(ModbusFunction::ReadCoils, 101).is_err());
        assert!(limits.check(ModbusFunction::WriteMultipleCoils, 5).is_err());
        assert!(limits.check(ModbusFunction::WriteSingleCoil, 1).is_ok());
        assert!(limits.check(ModbusFunction::WriteSingleRegister, 2).is_err());
    }

    #[test]
    fn test_inter_request_delay() {
        let limits = DeviceLimits::new().with_inter_request_delay_ms(25);
        assert_eq!(limits.inter_request_delay(), Duration::from_millis(25));
    }
}
