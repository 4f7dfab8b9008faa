//! Modbus RTU protocol constants
//!
//! - Maximum ADU size: 256 bytes on a serial line, leaving 253 for the PDU
//! - Register/coil limits are calculated to fit within the PDU size constraint
//! - Silent interval timing follows the 3.5 character rule

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum RTU frame size: address + PDU + CRC
pub const MAX_RTU_FRAME_SIZE: usize = 1 + MAX_PDU_SIZE + 2;

/// Shortest frame the codec accepts: address + function code + CRC
pub const MIN_RTU_FRAME_LEN: usize = 4;

/// Length of the CRC trailer
pub const CRC_LEN: usize = 2;

// ============================================================================
// Addressing
// ============================================================================

/// Broadcast address (not answered by slaves)
pub const BROADCAST_ADDRESS: u8 = 0;

/// Lowest unicast slave address
pub const MIN_SLAVE_ADDRESS: u8 = 1;

/// Highest unicast slave address
pub const MAX_SLAVE_ADDRESS: u8 = 247;

// ============================================================================
// RTU Timing
// ============================================================================

/// Bits per character on the wire: start + 8 data + parity/stop + stop
pub const BITS_PER_CHAR: u64 = 11;

/// Baud rate above which the silent interval is fixed
pub const FIXED_GAP_BAUD_THRESHOLD: u32 = 19_200;

/// Fixed silent interval above the threshold baud rate (microseconds)
pub const FIXED_FRAME_GAP_US: u64 = 1_750;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04 (Read Holding/Input Registers)
///
/// Calculation for response PDU:
/// - Function Code: 1 byte
/// - Byte Count: 1 byte
/// - Register Data: N × 2 bytes
/// - Total: 1 + 1 + (N × 2) ≤ 253
/// - Therefore: N ≤ (253 - 2) / 2 = 125.5 → 125 registers
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum number of registers for FC16 (Write Multiple Registers)
///
/// Calculation for request PDU:
/// - Function Code: 1 byte
/// - Starting Address: 2 bytes
/// - Quantity of Registers: 2 bytes
/// - Byte Count: 1 byte
/// - Register Values: N × 2 bytes
/// - Total: 1 + 2 + 2 + 1 + (N × 2) ≤ 253
/// - Therefore: N ≤ (253 - 6) / 2 = 123.5 → 123 registers
pub const MAX_WRITE_REGISTERS: usize = 123;

// ============================================================================
// Coil Operation Limits
// ============================================================================

/// Maximum number of coils for FC01/FC02 (Read Coils/Discrete Inputs)
///
/// Calculation for response PDU:
/// - Function Code: 1 byte
/// - Byte Count: 1 byte
/// - Coil Data: ceil(N / 8) bytes
/// - Total: 1 + 1 + ceil(N / 8) ≤ 253
/// - Therefore: ceil(N / 8) ≤ 251, N ≤ 251 × 8 = 2008
/// - Protocol allows: N ≤ 2000 (rounded for practical use)
pub const MAX_READ_COILS: usize = 2000;

/// Maximum number of coils for FC15 (Write Multiple Coils)
///
/// Calculation for request PDU:
/// - Function Code: 1 byte
/// - Starting Address: 2 bytes
/// - Quantity of Outputs: 2 bytes
/// - Byte Count: 1 byte
/// - Coil Values: ceil(N / 8) bytes
/// - Total: 1 + 2 + 2 + 1 + ceil(N / 8) ≤ 253
/// - Therefore: ceil(N / 8) ≤ 247, N ≤ 247 × 8 = 1976
/// - Protocol allows: N ≤ 1968 (0x7B0, conservative practical limit)
pub const MAX_WRITE_COILS: usize = 1968;

// ============================================================================
// Coil Wire Values
// ============================================================================

/// Coil ON as written by FC05
pub const COIL_ON: u16 = 0xFF00;

/// Coil OFF as written by FC05
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Coils (FC15)
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

// ============================================================================
// Modbus Exception Codes
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Server Device Failure
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;

/// Acknowledge
pub const EXCEPTION_ACKNOWLEDGE: u8 = 0x05;

/// Server Device Busy
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;

/// Memory Parity Error
pub const EXCEPTION_MEMORY_PARITY_ERROR: u8 = 0x08;

/// Gateway Path Unavailable
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;

/// Gateway Target Device Failed to Respond
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MAX_PDU_SIZE, 253);
        assert_eq!(MAX_RTU_FRAME_SIZE, 256);
        assert_eq!(MIN_RTU_FRAME_LEN, 1 + 1 + CRC_LEN);
    }

    #[test]
    fn test_coil_wire_values() {
        assert_eq!(COIL_ON.to_be_bytes(), [0xFF, 0x00]);
        assert_eq!(COIL_OFF.to_be_bytes(), [0x00, 0x00]);
        assert_eq!(FC_READ_HOLDING_REGISTERS | EXCEPTION_FLAG, 0x83);
    }

    #[test]
    fn test_register_limits() {
        // Verify read register limit calculation
        let read_pdu_size = 1 + 1 + (MAX_READ_REGISTERS * 2);
        assert!(read_pdu_size <= MAX_PDU_SIZE);
        assert_eq!(MAX_READ_REGISTERS, 125);

        // Verify write register limit calculation
        let write_pdu_size = 1 + 2 + 2 + 1 + (MAX_WRITE_REGISTERS * 2);
        assert!(write_pdu_size <= MAX_PDU_SIZE);
        assert_eq!(MAX_WRITE_REGISTERS, 123);
    }

    #[test]
    fn test_coil_limits() {
        // Verify read coil limit
        let read_coil_bytes = MAX_READ_COILS.div_ceil(8);
        let read_coil_pdu = 1 + 1 + read_coil_bytes;
        assert!(read_coil_pdu <= MAX_PDU_SIZE);
        assert_eq!(MAX_READ_COILS, 2000);

        // Verify write coil limit
        let write_coil_bytes = MAX_WRITE_COILS.div_ceil(8);
        let write_coil_pdu = 1 + 2 + 2 + 1 + write_coil_bytes;
        assert!(write_coil_pdu <= MAX_PDU_SIZE);
        assert_eq!(MAX_WRITE_COILS, 1968);
    }
}
