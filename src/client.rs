//! Typed Modbus client interface
//!
//! [`ModbusClient`] offers one method per function code on top of
//! [`RtuMaster::execute_request`], with a semantic alias for each:
//!
//! | Function Code | Primary Name | Semantic Alias |
//! |---------------|--------------|----------------|
//! | 0x01 | `read_01()` | `read_coils()` |
//! | 0x02 | `read_02()` | `read_discrete_inputs()` |
//! | 0x03 | `read_03()` | `read_holding_registers()` |
//! | 0x04 | `read_04()` | `read_input_registers()` |
//! | 0x05 | `write_05()` | `write_single_coil()` |
//! | 0x06 | `write_06()` | `write_single_register()` |
//! | 0x0F | `write_0f()` | `write_multiple_coils()` |
//! | 0x10 | `write_10()` | `write_multiple_registers()` |
//!
//! ```rust,no_run
//! use voltage_rtu::{ModbusClient, ModbusResult, RtuMaster, SerialConfig, Transport};
//! # #[cfg(feature = "rtu")]
//! # async fn example() -> ModbusResult<()> {
//! let transport = Transport::serial(SerialConfig::new("/dev/ttyUSB0", 9600));
//! transport.open().await?;
//!
//! let mut master = RtuMaster::new(transport);
//! let registers = master.read_03(1, 0, 10).await?;
//! println!("Registers: {:?}", registers);
//!
//! master.write_05(1, 0, true).await?;
//! master.close().await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;

use crate::error::ModbusResult;
use crate::master::RtuMaster;
use crate::protocol::{ModbusFunction, ModbusRequest, SlaveId};
use crate::transport::{SerialLink, TransportStats};

/// Async interface for the standard Modbus data access functions.
///
/// Quantities are checked against the protocol limits and the master's
/// [`DeviceLimits`](crate::DeviceLimits) before anything is sent:
///
/// | Operation | Limit |
/// |-----------|-------|
/// | Read Coils / Discrete Inputs | 2000 |
/// | Read Holding / Input Registers | 125 |
/// | Write Multiple Coils | 1968 |
/// | Write Multiple Registers | 123 |
pub trait ModbusClient: Send + Sync {
    /// Read coils (0x01)
    fn read_01(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send;

    /// Read discrete inputs (0x02)
    fn read_02(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send;

    /// Read holding registers (0x03)
    fn read_03(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send;

    /// Read input registers (0x04)
    fn read_04(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send;

    /// Write single coil (0x05); `true` is sent as 0xFF00
    fn write_05(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: bool,
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write single register (0x06)
    fn write_06(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: u16,
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write multiple coils (0x0F)
    fn write_0f(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[bool],
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write multiple registers (0x10)
    fn write_10(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Whether the underlying port is open
    fn is_connected(&self) -> bool;

    /// Close the underlying port
    fn close(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Counters of the underlying transport
    fn get_stats(&self) -> TransportStats;

    // ===== Semantic name aliases =====

    #[inline]
    fn read_coils(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send {
        self.read_01(slave_id, address, quantity)
    }

    #[inline]
    fn read_discrete_inputs(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send {
        self.read_02(slave_id, address, quantity)
    }

    #[inline]
    fn read_holding_registers(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send {
        self.read_03(slave_id, address, quantity)
    }

    #[inline]
    fn read_input_registers(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send {
        self.read_04(slave_id, address, quantity)
    }

    #[inline]
    fn write_single_coil(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: bool,
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_05(slave_id, address, value)
    }

    #[inline]
    fn write_single_register(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: u16,
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_06(slave_id, address, value)
    }

    #[inline]
    fn write_multiple_coils(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[bool],
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_0f(slave_id, address, values)
    }

    #[inline]
    fn write_multiple_registers(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_10(slave_id, address, values)
    }
}

impl<L: SerialLink> ModbusClient for RtuMaster<L> {
    async fn read_01(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        let request = ModbusRequest::new_read(slave_id, ModbusFunction::ReadCoils, address, quantity);
        let response = self.execute_request(request, self.timeout()).await?;
        let bits = response.parse_bits()?;
        Ok(bits.into_iter().take(quantity as usize).collect())
    }

    async fn read_02(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        let request =
            ModbusRequest::new_read(slave_id, ModbusFunction::ReadDiscreteInputs, address, quantity);
        let response = self.execute_request(request, self.timeout()).await?;
        let bits = response.parse_bits()?;
        Ok(bits.into_iter().take(quantity as usize).collect())
    }

    async fn read_03(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        let request =
            ModbusRequest::new_read(slave_id, ModbusFunction::ReadHoldingRegisters, address, quantity);
        self.execute_request(request, self.timeout())
            .await?
            .parse_registers()
    }

    async fn read_04(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        let request =
            ModbusRequest::new_read(slave_id, ModbusFunction::ReadInputRegisters, address, quantity);
        self.execute_request(request, self.timeout())
            .await?
            .parse_registers()
    }

    async fn write_05(&mut self, slave_id: SlaveId, address: u16, value: bool) -> ModbusResult<()> {
        let request = ModbusRequest::new_write_coil(slave_id, address, value);
        self.execute_request(request, self.timeout()).await?;
        Ok(())
    }

    async fn write_06(&mut self, slave_id: SlaveId, address: u16, value: u16) -> ModbusResult<()> {
        let request = ModbusRequest::new_write_register(slave_id, address, value);
        self.execute_request(request, self.timeout()).await?;
        Ok(())
    }

    async fn write_0f(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        let request = ModbusRequest::new_write_coils(slave_id, address, values);
        self.execute_request(request, self.timeout()).await?;
        Ok(())
    }

    async fn write_10(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        let request = ModbusRequest::new_write_registers(slave_id, address, values);
        self.execute_request(request, self.timeout()).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.transport().is_open()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.transport().close().await
    }

    fn get_stats(&self) -> TransportStats {
        self.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModbusError;
    use crate::server::RtuServer;
    use crate::store::BlockKind;
    use crate::transport::{LoopbackLink, SerialConfig, Transport};

    async fn setup() -> (RtuMaster<LoopbackLink>, RtuServer<LoopbackLink>) {
        let (a, b) = LoopbackLink::pair("COM1", "COM2");
        let slave_port = Transport::new(a, SerialConfig::new("COM1", 9600));
        let master_port = Transport::new(b, SerialConfig::new("COM2", 9600));
        slave_port.open().await.unwrap();
        master_port.open().await.unwrap();

        let mut server = RtuServer::new(slave_port);
        let slave = server.add_slave(3).unwrap();
        slave.add_block("coils", BlockKind::Coils, 0, 16).unwrap();
        slave.add_block("inputs", BlockKind::DiscreteInputs, 0, 8).unwrap();
        slave.add_block("holding", BlockKind::HoldingRegisters, 100, 8).unwrap();
        slave.add_block("input", BlockKind::InputRegisters, 0, 4).unwrap();
        slave.set_values("input", 0, &[281, 0, 0, 42]).unwrap();
        slave
            .set_coils("inputs", 0, &[true, false, true, true])
            .unwrap();
        server.start().unwrap();

        (RtuMaster::new(master_port), server)
    }

    #[tokio::test(start_paused = true)]
    async fn test_coil_round_trip() {
        let (mut master, mut server) = setup().await;

        master.write_single_coil(3, 2, true).await.unwrap();
        master
            .write_multiple_coils(3, 8, &[true, true, false, true])
            .await
            .unwrap();

        let coils = master.read_coils(3, 0, 12).await.unwrap();
        let mut expected = vec![false; 12];
        for i in [2, 8, 9, 11] {
            expected[i] = true;
        }
        assert_eq!(coils, expected);

        let inputs = master.read_02(3, 0, 4).await.unwrap();
        assert_eq!(inputs, vec![true, false, true, true]);

        server.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_round_trip() {
        let (mut master, mut server) = setup().await;

        master.write_06(3, 100, 0x1234).await.unwrap();
        master.write_10(3, 101, &[1, 2, 3]).await.unwrap();
        assert_eq!(
            master.read_holding_registers(3, 100, 4).await.unwrap(),
            vec![0x1234, 1, 2, 3]
        );
        assert_eq!(master.read_input_registers(3, 0, 4).await.unwrap(), vec![281, 0, 0, 42]);

        let slave = server.get_slave(3).unwrap();
        assert_eq!(slave.get_values("holding", 0, 4).unwrap(), vec![0x1234, 1, 2, 3]);

        server.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_to_input_table_is_rejected() {
        let (mut master, mut server) = setup().await;

        // Holding registers start at 100; address 0 is unmapped
        let err = master.write_06(3, 0, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::Exception { code: 0x02, .. }));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_close() {
        let (mut master, mut server) = setup().await;
        server.stop().await.unwrap();

        assert!(master.is_connected());
        master.close().await.unwrap();
        assert!(!master.is_connected());
        assert!(master.read_03(3, 100, 1).await.is_err());
        assert_eq!(master.get_stats().requests_sent, 0);
    }
}
