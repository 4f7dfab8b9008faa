//! # RTU Master Engine
//!
//! [`RtuMaster`] runs request/response transactions against slaves on a
//! [`Transport`]. Every transaction holds the transport's bus permit from the
//! moment the request is written until the response is matched or the
//! deadline passes, so concurrent callers complete in submission order.
//!
//! One transaction:
//!
//! 1. validate the request and check it against [`DeviceLimits`]
//! 2. wait for the bus, then for the silent interval since the last byte
//! 3. flush stale input and write the request frame
//! 4. read until a frame from the addressed slave completes or time runs out
//! 5. check the response shape, then pause for the inter-request delay
//!
//! Frames from other addresses are skipped while waiting. Bytes that follow
//! the matched response are handed back to the transport for its next
//! reader, usually a slave engine on a shared port. Sharing one port between
//! master and slave stays best effort: the flush in step 3 also discards a
//! remote request that arrives just before the master writes.

use std::time::Duration;

use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::constants::MAX_RTU_FRAME_SIZE;
use crate::device_limits::DeviceLimits;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{decode, response_frame_len, FrameLen, RtuFrame};
use crate::logging::{CallbackLogger, LoggingMode};
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId, TransactionState};
use crate::scheduler::BusRole;
use crate::transport::{SerialLink, Transport, TransportStats};

/// Default response timeout (milliseconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Master settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterConfig {
    /// Response timeout used by [`RtuMaster::execute`]
    pub timeout: Duration,
    pub limits: DeviceLimits,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            limits: DeviceLimits::default(),
        }
    }
}

impl MasterConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Modbus RTU master bound to one transport.
///
/// Cloning shares the transport; clones issued from different tasks are
/// still served one transaction at a time.
pub struct RtuMaster<L: SerialLink> {
    transport: Transport<L>,
    config: MasterConfig,
    logger: Option<CallbackLogger>,
}

impl<L: SerialLink> Clone for RtuMaster<L> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            config: self.config,
            logger: self.logger.clone(),
        }
    }
}

impl<L: SerialLink> RtuMaster<L> {
    pub fn new(transport: Transport<L>) -> Self {
        Self::with_config(transport, MasterConfig::default())
    }

    pub fn with_config(transport: Transport<L>, config: MasterConfig) -> Self {
        Self {
            transport,
            config,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn transport(&self) -> &Transport<L> {
        &self.transport
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    pub fn set_limits(&mut self, limits: DeviceLimits) {
        self.config.limits = limits;
    }

    /// Toggle raw packet dumps; installs a tracing logger if none is set
    pub fn set_verbose(&mut self, verbose: bool) {
        match &mut self.logger {
            Some(logger) => logger.set_packet_logging(verbose),
            None if verbose => self.logger = Some(CallbackLogger::tracing(LoggingMode::Verbose)),
            None => {}
        }
    }

    pub fn stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Run one transaction with the configured timeout.
    ///
    /// Reads return the values read (bits as 0/1). Single writes take the
    /// value in `quantity_or_value` (any nonzero coil value means ON) and
    /// return the echoed `[address, value]`. Multiple writes need a value
    /// list; build them with [`ModbusRequest`] and use
    /// [`RtuMaster::execute_request`].
    pub async fn execute(
        &self,
        slave_id: SlaveId,
        function: ModbusFunction,
        address: u16,
        quantity_or_value: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.execute_with_timeout(slave_id, function, address, quantity_or_value, self.config.timeout)
            .await
    }

    pub async fn execute_with_timeout(
        &self,
        slave_id: SlaveId,
        function: ModbusFunction,
        address: u16,
        quantity_or_value: u16,
        timeout: Duration,
    ) -> ModbusResult<Vec<u16>> {
        let request = match function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters => {
                ModbusRequest::new_read(slave_id, function, address, quantity_or_value)
            }
            ModbusFunction::WriteSingleCoil => {
                ModbusRequest::new_write_coil(slave_id, address, quantity_or_value != 0)
            }
            ModbusFunction::WriteSingleRegister => {
                ModbusRequest::new_write_register(slave_id, address, quantity_or_value)
            }
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                return Err(ModbusError::invalid_data(format!(
                    "{} needs a value list",
                    function
                )));
            }
        };

        let quantity = request.quantity;
        let response = self.execute_request(request, timeout).await?;
        response_values(function, quantity, &response)
    }

    /// Run one transaction and return the checked response.
    ///
    /// Exception responses are returned as [`ModbusError::Exception`].
    pub async fn execute_request(
        &self,
        request: ModbusRequest,
        timeout: Duration,
    ) -> ModbusResult<ModbusResponse> {
        request.validate()?;
        self.config.limits.check(request.function, request.quantity)?;
        let frame = RtuFrame::from_request(&request)?.encode();

        let mut state = TransactionState::Created;
        let permit = self.transport.scheduler().acquire(BusRole::Master).await;
        trace!(
            "Transaction #{} for slave {} {}",
            permit.ticket(),
            request.slave_id,
            request.function
        );

        if let Some(logger) = &self.logger {
            logger.log_request(
                request.slave_id,
                request.function.to_u8(),
                request.address,
                request.quantity,
                &request.data,
            );
        }

        let result = self.transact(&request, &frame, timeout, &mut state).await;

        match &result {
            Ok(response) => {
                self.transport.record(|s| s.responses_received += 1);
                if let Some(logger) = &self.logger {
                    logger.log_response(
                        response.slave_id,
                        response.wire_function_code(),
                        response.data(),
                    );
                }
                advance(&mut state, TransactionState::Completed);
            }
            Err(e) => {
                if e.is_timeout() {
                    self.transport.record(|s| s.timeouts += 1);
                } else if e.exception_code().is_none() {
                    self.transport.record(|s| s.errors += 1);
                }
                debug!("Slave {} {} failed: {}", request.slave_id, request.function, e);
                advance(&mut state, TransactionState::Failed);
            }
        }

        let delay = self.config.limits.inter_request_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        drop(permit);
        result
    }

    async fn transact(
        &self,
        request: &ModbusRequest,
        frame: &[u8],
        timeout: Duration,
        state: &mut TransactionState,
    ) -> ModbusResult<ModbusResponse> {
        self.transport.wait_frame_gap().await;
        self.transport.clear_input().await?;

        if let Some(logger) = &self.logger {
            logger.log_packet("TX", request.slave_id, frame);
        }
        self.transport.write(frame).await?;
        self.transport.record(|s| s.requests_sent += 1);
        advance(state, TransactionState::Sent);

        advance(state, TransactionState::AwaitingResponse);
        let deadline = Instant::now() + timeout;
        let reply = self.await_response(request.slave_id, deadline, timeout).await?;
        if let Some(logger) = &self.logger {
            logger.log_packet("RX", reply.address, &reply.encode());
        }
        check_response(request, reply)
    }

    /// Read until a frame from `slave_id` completes or `deadline` passes
    async fn await_response(
        &self,
        slave_id: SlaveId,
        deadline: Instant,
        timeout: Duration,
    ) -> ModbusResult<RtuFrame> {
        let mut buf = BytesMut::with_capacity(MAX_RTU_FRAME_SIZE);
        loop {
            let complete = match response_frame_len(&buf) {
                FrameLen::Known(n) if n > MAX_RTU_FRAME_SIZE => {
                    return Err(ModbusError::frame(format!(
                        "Response declares {} bytes, limit is {}",
                        n, MAX_RTU_FRAME_SIZE
                    )));
                }
                FrameLen::Known(n) if buf.len() >= n => Some(buf.split_to(n)),
                FrameLen::Indeterminate => self.await_silence(&mut buf, deadline).await?,
                FrameLen::Known(_) | FrameLen::Incomplete => None,
            };

            if let Some(bytes) = complete {
                let frame = decode(&bytes)?;
                if frame.address == slave_id {
                    // Whatever followed the response belongs to the next reader
                    self.transport.unread(&buf);
                    return Ok(frame);
                }
                debug!(
                    "Skipping frame from slave {} while waiting for slave {}",
                    frame.address, slave_id
                );
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(timeout_error(slave_id, buf.len(), timeout));
            }
            let room = MAX_RTU_FRAME_SIZE.saturating_sub(buf.len()).max(1);
            let chunk = self.transport.read(room, deadline - now).await?;
            buf.extend_from_slice(&chunk);
        }
    }

    /// A frame of unknown layout ends at the first silent interval
    async fn await_silence(
        &self,
        buf: &mut BytesMut,
        deadline: Instant,
    ) -> ModbusResult<Option<BytesMut>> {
        let wait = self
            .transport
            .frame_gap()
            .min(deadline.saturating_duration_since(Instant::now()));
        let room = MAX_RTU_FRAME_SIZE.saturating_sub(buf.len());
        if wait.is_zero() || room == 0 {
            return Ok(Some(buf.split()));
        }
        let more = self.transport.read(room, wait).await?;
        if more.is_empty() {
            return Ok(Some(buf.split()));
        }
        buf.extend_from_slice(&more);
        Ok(None)
    }
}

fn advance(state: &mut TransactionState, next: TransactionState) {
    trace!("Transaction {:?} -> {:?}", state, next);
    *state = next;
}

fn timeout_error(slave_id: SlaveId, received: usize, timeout: Duration) -> ModbusError {
    let timeout_ms = timeout.as_millis() as u64;
    if received == 0 {
        ModbusError::timeout(format!("response from slave {}", slave_id), timeout_ms)
    } else {
        warn!("Incomplete response from slave {}: {} bytes", slave_id, received);
        ModbusError::timeout(
            format!("response from slave {} ({} bytes incomplete)", slave_id, received),
            timeout_ms,
        )
    }
}

/// Match a received frame against the request it answers
fn check_response(request: &ModbusRequest, frame: RtuFrame) -> ModbusResult<ModbusResponse> {
    let expected_fc = request.function.to_u8();
    if frame.function_code & 0x7F != expected_fc {
        return Err(ModbusError::protocol(format!(
            "Function code mismatch: sent 0x{:02X}, received 0x{:02X}",
            expected_fc, frame.function_code
        )));
    }

    let response = ModbusResponse::from_parts(frame.address, frame.function_code, &frame.payload)?;
    if let Some(err) = response.get_exception() {
        return Err(err);
    }

    match request.function {
        ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
            let expected = (request.quantity as usize).div_ceil(8);
            let got = response.parse_bits()?.len() / 8;
            if got != expected {
                return Err(ModbusError::protocol(format!(
                    "Expected {} data bytes for {} bits, got {}",
                    expected, request.quantity, got
                )));
            }
        }
        ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
            let got = response.parse_registers()?.len();
            if got != request.quantity as usize {
                return Err(ModbusError::protocol(format!(
                    "Expected {} registers, got {}",
                    request.quantity, got
                )));
            }
        }
        ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
            let echo = response.parse_write_echo()?;
            let sent = (request.address, request.single_value().unwrap_or_default());
            if echo != sent {
                return Err(ModbusError::protocol(format!(
                    "Write echo {:?} does not match request {:?}",
                    echo, sent
                )));
            }
        }
        ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
            let echo = response.parse_write_echo()?;
            if echo != (request.address, request.quantity) {
                return Err(ModbusError::protocol(format!(
                    "Write echo {:?} does not match address {} quantity {}",
                    echo, request.address, request.quantity
                )));
            }
        }
    }

    Ok(response)
}

/// Flatten a checked response into 16-bit values
fn response_values(
    function: ModbusFunction,
    quantity: u16,
    response: &ModbusResponse,
) -> ModbusResult<Vec<u16>> {
    match function {
        ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => Ok(response
            .parse_bits()?
            .into_iter()
            .take(quantity as usize)
            .map(u16::from)
            .collect()),
        ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
            response.parse_registers()
        }
        _ => {
            let (address, value) = response.parse_write_echo()?;
            Ok(vec![address, value])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode;
    use crate::transport::{LoopbackLink, SerialConfig};

    async fn master_and_wire() -> (RtuMaster<LoopbackLink>, Transport<LoopbackLink>) {
        let (a, b) = LoopbackLink::pair("M", "S");
        let master = Transport::new(a, SerialConfig::new("M", 9600));
        let wire = Transport::new(b, SerialConfig::new("S", 9600));
        master.open().await.unwrap();
        wire.open().await.unwrap();
        (RtuMaster::new(master), wire)
    }

    /// Answer the next request on `wire` with `reply`
    fn respond_once(wire: Transport<LoopbackLink>, reply: Vec<u8>) -> tokio::task::JoinHandle<Vec<u8>> {
        tokio::spawn(async move {
            let request = wire.read(256, Duration::from_secs(10)).await.unwrap();
            wire.write(&reply).await.unwrap();
            request
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_bytes_after_response_are_handed_back() {
        let (master, wire) = master_and_wire().await;
        let trailing = encode(0x05, 0x03, &[0x00, 0x00, 0x00, 0x02]);
        let mut reply = encode(0x11, 0x03, &[0x02, 0x00, 0x2A]);
        reply.extend_from_slice(&trailing);
        let peer = respond_once(wire, reply);

        let values = master
            .execute(0x11, ModbusFunction::ReadHoldingRegisters, 0, 1)
            .await
            .unwrap();
        assert_eq!(values, vec![42]);
        peer.await.unwrap();

        let rest = master
            .transport()
            .read(256, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(rest, trailing);
    }

    #[test]
    fn test_default_config() {
        let config = MasterConfig::default();
        assert_eq!(config.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert_eq!(config.limits, DeviceLimits::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_holding_registers() {
        let (master, wire) = master_and_wire().await;
        let reply = encode(0x11, 0x03, &[0x04, 0x00, 0x07, 0x00, 0x01]);
        let peer = respond_once(wire, reply);

        let values = master
            .execute(0x11, ModbusFunction::ReadHoldingRegisters, 0x006B, 2)
            .await
            .unwrap();
        assert_eq!(values, vec![7, 1]);

        let request = peer.await.unwrap();
        assert_eq!(request, encode(0x11, 0x03, &[0x00, 0x6B, 0x00, 0x02]));
        assert_eq!(master.stats().requests_sent, 1);
        assert_eq!(master.stats().responses_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exception_response() {
        let (master, wire) = master_and_wire().await;
        let _peer = respond_once(wire, encode(0x01, 0x84, &[0x02]));

        let err = master
            .execute(0x01, ModbusFunction::ReadInputRegisters, 0, 1)
            .await
            .unwrap_err();
        assert_eq!(err.exception_code(), Some(0x02));
        assert!(!err.is_recoverable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_crc_failure_is_frame_error() {
        let (master, wire) = master_and_wire().await;
        let mut reply = encode(0x01, 0x06, &[0x00, 0x01, 0x00, 0x03]);
        reply[5] ^= 0x01;
        let _peer = respond_once(wire, reply);

        let err = master
            .execute(0x01, ModbusFunction::WriteSingleRegister, 1, 3)
            .await
            .unwrap_err();
        assert_eq!(err.frame_kind(), Some(crate::error::FrameErrorKind::CrcMismatch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_echo_mismatch() {
        let (master, wire) = master_and_wire().await;
        let _peer = respond_once(wire, encode(0x01, 0x06, &[0x00, 0x01, 0x00, 0x04]));

        let err = master
            .execute(0x01, ModbusFunction::WriteSingleRegister, 1, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Protocol { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts() {
        let (mut master, _wire) = master_and_wire().await;
        master.set_timeout(Duration::from_millis(200));

        let err = master
            .execute(0x05, ModbusFunction::ReadCoils, 0, 8)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(master.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_rejects_invalid_requests_before_sending() {
        let (master, _wire) = master_and_wire().await;
        assert!(master
            .execute(0, ModbusFunction::ReadHoldingRegisters, 0, 1)
            .await
            .is_err());
        assert!(master
            .execute(1, ModbusFunction::ReadHoldingRegisters, 0, 126)
            .await
            .is_err());
        assert!(master
            .execute(1, ModbusFunction::WriteMultipleRegisters, 0, 1)
            .await
            .is_err());
        assert_eq!(master.stats().requests_sent, 0);
    }

    #[tokio::test]
    async fn test_device_limits_enforced() {
        let (master, _wire) = master_and_wire().await;
        let mut master = master;
        master.set_limits(DeviceLimits::new().with_max_read_registers(4));
        let err = master
            .execute(1, ModbusFunction::ReadHoldingRegisters, 0, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::InvalidData { .. }));
    }
}
