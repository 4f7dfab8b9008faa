//! # RTU Slave Engine
//!
//! [`RtuServer`] answers master requests for one or more slave addresses
//! from a background task. Each address owns a [`SlaveStore`](crate::store::SlaveStore) reached
//! through the [`SlaveHandle`] returned by [`RtuServer::add_slave`].
//!
//! ## Lifecycle
//!
//! ```text
//! Stopped --start()--> Listening --stop()--> Stopped
//!                          |
//!                          +-- transport closed --> Stopped
//! ```
//!
//! ## Frame handling
//!
//! | Received | Action |
//! |----------|--------|
//! | bad CRC, truncated frame | dropped silently |
//! | address not registered, broadcast | dropped silently |
//! | request the store cannot serve | exception response |
//! | valid request | normal response |
//! | several frames in one read | each handled in turn |
//!
//! The listener holds the transport's bus permit from the first received
//! byte until its response is written, so it never interleaves with a
//! master sharing the same transport.
//!
//! ```rust
//! use voltage_rtu::server::RtuServer;
//! use voltage_rtu::store::BlockKind;
//! use voltage_rtu::transport::{LoopbackLink, SerialConfig, Transport};
//!
//! # #[tokio::main]
//! # async fn main() -> voltage_rtu::ModbusResult<()> {
//! let (port1, _port2) = LoopbackLink::pair("COM1", "COM2");
//! let transport = Transport::new(port1, SerialConfig::new("COM1", 9600));
//! transport.open().await?;
//!
//! let mut server = RtuServer::new(transport);
//! let slave = server.add_slave(0x66)?;
//! slave.add_block("test", BlockKind::HoldingRegisters, 0, 10)?;
//! slave.set_values("test", 0, &[7, 1, 5])?;
//!
//! server.start()?;
//! assert!(server.is_listening());
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::constants::{BROADCAST_ADDRESS, MAX_RTU_FRAME_SIZE, MAX_SLAVE_ADDRESS, MIN_SLAVE_ADDRESS};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{decode, encode, request_frame_len, FrameLen};
use crate::logging::CallbackLogger;
use crate::pdu::{ModbusPdu, PduBuilder};
use crate::protocol::{ModbusException, ModbusFunction, ModbusRequest, SlaveId};
use crate::scheduler::BusRole;
use crate::store::{coil_from_wire, BlockKind, SlaveHandle};
use crate::transport::{SerialLink, Transport};

/// Default wait for the first byte of a request before yielding the bus
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 20;

/// Default wait for the rest of a frame whose length is already known
pub const DEFAULT_INTER_BYTE_TIMEOUT_MS: u64 = 50;

/// Listener tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// How long one receive attempt holds the bus while the line is idle
    pub poll_interval: Duration,
    /// How long to wait for the remainder of a frame of known length
    pub inter_byte_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            inter_byte_timeout: Duration::from_millis(DEFAULT_INTER_BYTE_TIMEOUT_MS),
        }
    }
}

impl ServerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_inter_byte_timeout(mut self, timeout: Duration) -> Self {
        self.inter_byte_timeout = timeout;
        self
    }
}

/// Slave engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Listening,
}

/// Listener counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub started_at: Option<DateTime<Utc>>,
    /// Frames that passed the CRC check
    pub frames_received: u64,
    /// Normal responses written
    pub responses_sent: u64,
    /// Exception responses written
    pub exceptions_sent: u64,
    /// Frames rejected by the codec or cut short
    pub frames_dropped: u64,
    /// Valid frames for an address this engine does not serve
    pub frames_ignored: u64,
}

impl ServerStats {
    pub fn uptime(&self) -> Option<chrono::Duration> {
        self.started_at.map(|t| Utc::now() - t)
    }
}

type SlaveMap = Arc<RwLock<HashMap<SlaveId, SlaveHandle>>>;

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Modbus RTU slave engine bound to one transport
pub struct RtuServer<L: SerialLink> {
    transport: Transport<L>,
    config: ServerConfig,
    slaves: SlaveMap,
    stats: Arc<StdMutex<ServerStats>>,
    logger: Option<CallbackLogger>,
    running: Option<Running>,
}

impl<L: SerialLink> RtuServer<L> {
    pub fn new(transport: Transport<L>) -> Self {
        Self::with_config(transport, ServerConfig::default())
    }

    pub fn with_config(transport: Transport<L>, config: ServerConfig) -> Self {
        Self {
            transport,
            config,
            slaves: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(StdMutex::new(ServerStats::default())),
            logger: None,
            running: None,
        }
    }

    /// Log every request and response through `logger`; applies from the
    /// next `start()`
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn transport(&self) -> &Transport<L> {
        &self.transport
    }

    /// Register a slave address and return the handle to its blocks.
    ///
    /// Addresses may be added while listening.
    pub fn add_slave(&self, slave_id: SlaveId) -> ModbusResult<SlaveHandle> {
        if !(MIN_SLAVE_ADDRESS..=MAX_SLAVE_ADDRESS).contains(&slave_id) {
            return Err(ModbusError::invalid_data(format!(
                "Slave address {} outside {}..={}",
                slave_id, MIN_SLAVE_ADDRESS, MAX_SLAVE_ADDRESS
            )));
        }
        let mut slaves = write_map(&self.slaves);
        if slaves.contains_key(&slave_id) {
            return Err(ModbusError::DuplicateSlave { slave_id });
        }
        let handle = SlaveHandle::new(slave_id);
        slaves.insert(slave_id, handle.clone());
        info!("Slave {} registered on {}", slave_id, self.transport.name());
        Ok(handle)
    }

    pub fn remove_slave(&self, slave_id: SlaveId) -> ModbusResult<SlaveHandle> {
        write_map(&self.slaves)
            .remove(&slave_id)
            .ok_or(ModbusError::UnknownSlave { slave_id })
    }

    pub fn get_slave(&self, slave_id: SlaveId) -> Option<SlaveHandle> {
        read_map(&self.slaves).get(&slave_id).cloned()
    }

    /// Registered addresses, ascending
    pub fn slave_ids(&self) -> Vec<SlaveId> {
        let mut ids: Vec<SlaveId> = read_map(&self.slaves).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Spawn the listener. Fails if already listening or the transport is closed.
    pub fn start(&mut self) -> ModbusResult<()> {
        if self.is_listening() {
            return Err(ModbusError::invalid_state("Slave engine already listening"));
        }
        if !self.transport.is_open() {
            return Err(ModbusError::transport(format!(
                "{} is closed",
                self.transport.name()
            )));
        }

        lock_stats(&self.stats).started_at = Some(Utc::now());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let listener = Listener {
            transport: self.transport.clone(),
            config: self.config,
            dispatcher: Dispatcher {
                slaves: self.slaves.clone(),
                stats: self.stats.clone(),
                logger: self.logger.clone(),
            },
        };
        let task = tokio::spawn(listener.run(shutdown_rx));
        self.running = Some(Running { shutdown, task });
        Ok(())
    }

    /// Stop the listener and wait for it to finish; no-op when stopped
    pub async fn stop(&mut self) -> ModbusResult<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let _ = running.shutdown.send(true);
        if let Err(e) = running.task.await {
            if e.is_panic() {
                error!("Slave listener panicked: {}", e);
                return Err(ModbusError::invalid_state("Slave listener panicked"));
            }
        }
        Ok(())
    }

    pub fn state(&self) -> ServerState {
        match &self.running {
            Some(running) if !running.task.is_finished() => ServerState::Listening,
            _ => ServerState::Stopped,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.state() == ServerState::Listening
    }

    pub fn stats(&self) -> ServerStats {
        lock_stats(&self.stats).clone()
    }

    /// Answer one raw frame as the listener would; `None` means no reply
    pub fn process_frame(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        Dispatcher {
            slaves: self.slaves.clone(),
            stats: self.stats.clone(),
            logger: self.logger.clone(),
        }
        .process_frame(bytes)
    }
}

impl<L: SerialLink> Drop for RtuServer<L> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
            running.task.abort();
        }
    }
}

// ============================================================================
// Listener task
// ============================================================================

struct Listener<L: SerialLink> {
    transport: Transport<L>,
    config: ServerConfig,
    dispatcher: Dispatcher,
}

impl<L: SerialLink> Listener<L> {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Slave engine listening on {}", self.transport.name());
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!("Shutdown signal received for slave engine");
                    break;
                }
                outcome = self.serve_once() => {
                    if let Err(e) = outcome {
                        if !self.transport.is_open() {
                            info!("{} closed, slave engine stopping", self.transport.name());
                            break;
                        }
                        warn!("Slave engine I/O error on {}: {}", self.transport.name(), e);
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
            }
        }
        info!("Slave engine on {} stopped", self.transport.name());
    }

    /// One receive attempt; holds the bus until any response is written
    async fn serve_once(&self) -> ModbusResult<()> {
        let _permit = self.transport.scheduler().acquire(BusRole::Slave).await;

        let first = self
            .transport
            .read(MAX_RTU_FRAME_SIZE, self.config.poll_interval)
            .await?;
        if first.is_empty() {
            return Ok(());
        }

        let Some(frame) = self.assemble(BytesMut::from(&first[..])).await? else {
            return Ok(());
        };

        if let Some(reply) = self.dispatcher.process_frame(&frame) {
            self.transport.wait_frame_gap().await;
            self.transport.write(&reply).await?;
        }
        Ok(())
    }

    /// Collect the rest of a request frame.
    ///
    /// Known layouts complete at their predicted length; anything else ends
    /// at the first silent interval. A frame cut short is dropped.
    async fn assemble(&self, mut buf: BytesMut) -> ModbusResult<Option<Vec<u8>>> {
        loop {
            let expected = request_frame_len(&buf);
            let wait = match expected {
                FrameLen::Known(n) if n > MAX_RTU_FRAME_SIZE => {
                    debug!("Request declares {} bytes, dropping", n);
                    self.dispatcher.count_dropped();
                    self.transport.clear_input().await?;
                    return Ok(None);
                }
                FrameLen::Known(n) if buf.len() >= n => {
                    let frame = buf.split_to(n);
                    if !buf.is_empty() {
                        // Back-to-back frames from one read; serve the rest next
                        trace!("Holding {} bytes after frame", buf.len());
                        self.transport.unread(&buf);
                    }
                    return Ok(Some(frame.to_vec()));
                }
                FrameLen::Known(_) | FrameLen::Incomplete => self.config.inter_byte_timeout,
                FrameLen::Indeterminate => self.transport.frame_gap(),
            };

            let room = MAX_RTU_FRAME_SIZE.saturating_sub(buf.len());
            let more = if room == 0 {
                Vec::new()
            } else {
                self.transport.read(room, wait).await?
            };

            if more.is_empty() {
                return match expected {
                    FrameLen::Indeterminate => Ok(Some(buf.to_vec())),
                    _ => {
                        debug!("Partial request of {} bytes discarded", buf.len());
                        self.dispatcher.count_dropped();
                        Ok(None)
                    }
                };
            }
            buf.extend_from_slice(&more);
        }
    }
}

// ============================================================================
// Request dispatch
// ============================================================================

#[derive(Clone)]
struct Dispatcher {
    slaves: SlaveMap,
    stats: Arc<StdMutex<ServerStats>>,
    logger: Option<CallbackLogger>,
}

impl Dispatcher {
    fn process_frame(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let frame = match decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Dropping frame: {}", e);
                self.count_dropped();
                return None;
            }
        };
        lock_stats(&self.stats).frames_received += 1;

        if frame.address == BROADCAST_ADDRESS {
            trace!("Ignoring broadcast frame");
            lock_stats(&self.stats).frames_ignored += 1;
            return None;
        }
        let Some(handle) = read_map(&self.slaves).get(&frame.address).cloned() else {
            trace!("Ignoring frame for slave {}", frame.address);
            lock_stats(&self.stats).frames_ignored += 1;
            return None;
        };

        if let Some(logger) = &self.logger {
            logger.log_packet("RX", frame.address, bytes);
        }

        let mut pdu = Vec::with_capacity(1 + frame.payload.len());
        pdu.push(frame.function_code);
        pdu.extend_from_slice(&frame.payload);

        let response = match serve_request(&handle, &pdu) {
            Ok(response) => {
                lock_stats(&self.stats).responses_sent += 1;
                response
            }
            Err(e) => {
                let exception = ModbusException::from(&e);
                debug!(
                    "Slave {} fc=0x{:02X}: {} -> exception {:?}",
                    frame.address, frame.function_code, e, exception
                );
                match PduBuilder::build_exception(frame.function_code, exception.code()) {
                    Ok(pdu) => {
                        lock_stats(&self.stats).exceptions_sent += 1;
                        pdu
                    }
                    Err(e) => {
                        error!("Failed to build exception response: {}", e);
                        return None;
                    }
                }
            }
        };

        let fc = response.function_code().unwrap_or(frame.function_code);
        let reply = encode(frame.address, fc, response.body());
        if let Some(logger) = &self.logger {
            logger.log_response(frame.address, fc, response.body());
            logger.log_packet("TX", frame.address, &reply);
        }
        Some(reply)
    }

    fn count_dropped(&self) {
        lock_stats(&self.stats).frames_dropped += 1;
    }
}

/// Execute one request PDU against a slave's store
fn serve_request(handle: &SlaveHandle, pdu: &[u8]) -> ModbusResult<ModbusPdu> {
    let request = ModbusRequest::from_pdu(handle.slave_id(), pdu)?;
    request.validate()?;

    let function = request.function;
    let kind = BlockKind::for_function(function);
    match function {
        ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
            let bits: Vec<bool> = handle
                .read_store()
                .read(kind, request.address, request.quantity)?
                .into_iter()
                .map(|v| v != 0)
                .collect();
            PduBuilder::build_read_bits_response(function, &bits)
        }
        ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
            let values = handle
                .read_store()
                .read(kind, request.address, request.quantity)?;
            PduBuilder::build_read_registers_response(function, &values)
        }
        ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
            let value = request
                .single_value()
                .ok_or_else(|| ModbusError::invalid_data("Missing write value"))?;
            let cell = if function == ModbusFunction::WriteSingleCoil {
                u16::from(coil_from_wire(value)?)
            } else {
                value
            };
            handle.write_store().write(kind, request.address, &[cell])?;
            PduBuilder::build_write_response(function, request.address, value)
        }
        ModbusFunction::WriteMultipleCoils => {
            let cells: Vec<u16> = request.coil_values().into_iter().map(u16::from).collect();
            handle.write_store().write(kind, request.address, &cells)?;
            PduBuilder::build_write_response(function, request.address, request.quantity)
        }
        ModbusFunction::WriteMultipleRegisters => {
            let cells = request.register_values();
            handle.write_store().write(kind, request.address, &cells)?;
            PduBuilder::build_write_response(function, request.address, request.quantity)
        }
    }
}

fn read_map(
    map: &SlaveMap,
) -> std::sync::RwLockReadGuard<'_, HashMap<SlaveId, SlaveHandle>> {
    map.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_map(
    map: &SlaveMap,
) -> std::sync::RwLockWriteGuard<'_, HashMap<SlaveId, SlaveHandle>> {
    map.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock_stats(stats: &StdMutex<ServerStats>) -> std::sync::MutexGuard<'_, ServerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{crc16, decode};
    use crate::transport::{LoopbackLink, SerialConfig};

    fn server() -> RtuServer<LoopbackLink> {
        let (a, _b) = LoopbackLink::pair("A", "B");
        RtuServer::new(Transport::new(a, SerialConfig::new("A", 9600)))
    }

    fn request(slave: u8, fc: u8, body: &[u8]) -> Vec<u8> {
        encode(slave, fc, body)
    }

    #[test]
    fn test_add_slave_rules() {
        let server = server();
        server.add_slave(0x66).unwrap();
        assert_eq!(
            server.add_slave(0x66).unwrap_err(),
            ModbusError::DuplicateSlave { slave_id: 0x66 }
        );
        assert!(server.add_slave(0).is_err());
        assert!(server.add_slave(248).is_err());
        server.add_slave(1).unwrap();
        assert_eq!(server.slave_ids(), vec![1, 0x66]);

        server.remove_slave(1).unwrap();
        assert!(server.get_slave(1).is_none());
        assert!(matches!(
            server.remove_slave(1),
            Err(ModbusError::UnknownSlave { slave_id: 1 })
        ));
    }

    #[test]
    fn test_read_holding_registers() {
        let server = server();
        let slave = server.add_slave(0x66).unwrap();
        slave.add_block("test", BlockKind::HoldingRegisters, 0, 10).unwrap();
        slave.set_values("test", 0, &[7, 1, 5]).unwrap();

        let reply = server
            .process_frame(&request(0x66, 0x03, &[0x00, 0x00, 0x00, 0x03]))
            .unwrap();
        let frame = decode(&reply).unwrap();
        assert_eq!(frame.address, 0x66);
        assert_eq!(frame.function_code, 0x03);
        assert_eq!(frame.payload, vec![0x06, 0x00, 0x07, 0x00, 0x01, 0x00, 0x05]);
        assert_eq!(server.stats().responses_sent, 1);
    }

    #[test]
    fn test_bad_crc_dropped_silently() {
        let server = server();
        let slave = server.add_slave(1).unwrap();
        slave.add_block("h", BlockKind::HoldingRegisters, 0, 4).unwrap();

        let mut bytes = request(1, 0x03, &[0x00, 0x00, 0x00, 0x01]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(server.process_frame(&bytes).is_none());
        assert!(server.process_frame(&[0x01, 0x03]).is_none());
        assert_eq!(server.stats().frames_dropped, 2);
    }

    #[test]
    fn test_other_address_ignored() {
        let server = server();
        server.add_slave(1).unwrap();
        assert!(server
            .process_frame(&request(2, 0x03, &[0x00, 0x00, 0x00, 0x01]))
            .is_none());
        assert!(server
            .process_frame(&request(0, 0x06, &[0x00, 0x00, 0x00, 0x01]))
            .is_none());
        assert_eq!(server.stats().frames_ignored, 2);
    }

    #[test]
    fn test_out_of_range_read_is_exception() {
        let server = server();
        let slave = server.add_slave(1).unwrap();
        slave.add_block("h", BlockKind::HoldingRegisters, 0, 10).unwrap();

        let reply = server
            .process_frame(&request(1, 0x03, &[0x00, 0x08, 0x00, 0x05]))
            .unwrap();
        assert_eq!(reply.len(), 5);
        assert_eq!(&reply[..3], &[0x01, 0x83, 0x02]);
        assert_eq!(crc16(&reply[..3]).to_le_bytes(), [reply[3], reply[4]]);
        assert_eq!(server.stats().exceptions_sent, 1);
    }

    #[test]
    fn test_unsupported_function_is_exception() {
        let server = server();
        server.add_slave(1).unwrap();
        let reply = server
            .process_frame(&request(1, 0x2B, &[0x0E, 0x01, 0x00, 0x00]))
            .unwrap();
        assert_eq!(&reply[..3], &[0x01, 0xAB, 0x01]);
    }

    #[test]
    fn test_write_single_coil() {
        let server = server();
        let slave = server.add_slave(1).unwrap();
        slave.add_block("relay", BlockKind::Coils, 0, 4).unwrap();

        let on = request(1, 0x05, &[0x00, 0x02, 0xFF, 0x00]);
        let reply = server.process_frame(&on).unwrap();
        assert_eq!(reply, on);
        assert_eq!(
            slave.get_coils("relay", 0, 4).unwrap(),
            vec![false, false, true, false]
        );

        let bad = request(1, 0x05, &[0x00, 0x02, 0x12, 0x34]);
        let reply = server.process_frame(&bad).unwrap();
        assert_eq!(&reply[..3], &[0x01, 0x85, 0x03]);
        assert!(slave.get_coils("relay", 2, 1).unwrap()[0]);
    }

    #[test]
    fn test_write_multiple_registers() {
        let server = server();
        let slave = server.add_slave(7).unwrap();
        slave.add_block("h", BlockKind::HoldingRegisters, 100, 4).unwrap();

        let reply = server
            .process_frame(&request(
                7,
                0x10,
                &[0x00, 0x65, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02],
            ))
            .unwrap();
        let frame = decode(&reply).unwrap();
        assert_eq!(frame.payload, vec![0x00, 0x65, 0x00, 0x02]);
        assert_eq!(slave.get_values("h", 0, 4).unwrap(), vec![0, 10, 258, 0]);
    }

    #[test]
    fn test_read_only_tables_reject_writes() {
        let server = server();
        let slave = server.add_slave(1).unwrap();
        slave.add_block("in", BlockKind::InputRegisters, 0, 4).unwrap();

        // FC06 targets holding registers; no such block exists here
        let reply = server
            .process_frame(&request(1, 0x06, &[0x00, 0x00, 0x00, 0x01]))
            .unwrap();
        assert_eq!(&reply[..3], &[0x01, 0x86, 0x02]);
    }

    #[tokio::test]
    async fn test_start_requires_open_transport() {
        let mut server = server();
        assert!(matches!(
            server.start(),
            Err(ModbusError::Transport { .. })
        ));
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let mut server = server();
        server.transport().open().await.unwrap();
        server.start().unwrap();
        assert_eq!(server.state(), ServerState::Listening);
        assert!(server.start().is_err());
        assert!(server.stats().started_at.is_some());

        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        server.stop().await.unwrap();
    }
}
