//! # Serial Transport
//!
//! Byte-oriented duplex channel with a mutable line configuration. The
//! transport knows nothing about frames; the master and slave engines do the
//! framing on top of [`Transport::read`] and [`Transport::write`].
//!
//! ## Layers
//!
//! | Type | Role |
//! |------|------|
//! | [`SerialLink`] | driver boundary: open, reconfigure, read, write, close |
//! | [`SerialPortLink`] | `tokio-serial` port (feature `rtu`) |
//! | [`LoopbackLink`] | in-process wire between two ends, for tests and demos |
//! | [`Transport`] | shared handle: config, scheduler, silent interval, stats |
//!
//! A `Transport` is cheap to clone. Clones share the link, the configuration
//! and the [`TransactionScheduler`], so a master and a slave engine bound to
//! clones of one transport see every baud change immediately and never
//! interleave their bus activity.
//!
//! ## Example
//!
//! ```rust
//! use voltage_rtu::transport::{LoopbackLink, SerialConfig, Transport};
//!
//! # #[tokio::main]
//! # async fn main() -> voltage_rtu::ModbusResult<()> {
//! let (a, b) = LoopbackLink::pair("COM1", "COM2");
//! let port1 = Transport::new(a, SerialConfig::new("COM1", 115200));
//! let port2 = Transport::new(b, SerialConfig::new("COM2", 115200));
//! port1.open().await?;
//! port2.open().await?;
//!
//! port1.set_baud_rate(9600).await?;
//! assert_eq!(port1.config().baud_rate, 9600);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::constants::{BITS_PER_CHAR, FIXED_FRAME_GAP_US, FIXED_GAP_BAUD_THRESHOLD};
use crate::error::{ModbusError, ModbusResult};
use crate::scheduler::{BusRole, TransactionScheduler};

// ============================================================================
// Line configuration
// ============================================================================

/// Character size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

impl DataBits {
    pub fn bits(self) -> u8 {
        match self {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

/// Port identity and line settings
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SerialConfig {
    /// Device path or port name, e.g. `/dev/ttyWCH0` or `COM3`
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl SerialConfig {
    /// 8N1 at the given baud rate
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_data_bits(mut self, data_bits: DataBits) -> Self {
        self.data_bits = data_bits;
        self
    }

    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    /// Apply compact line settings such as `"8N1"` or `"8E2"`
    pub fn with_line_settings(mut self, settings: &str) -> ModbusResult<Self> {
        let parsed: LineSettings = settings.parse()?;
        self.data_bits = parsed.data_bits;
        self.parity = parsed.parity;
        self.stop_bits = parsed.stop_bits;
        Ok(self)
    }

    /// Line settings without the port name
    pub fn line_settings(&self) -> LineSettings {
        LineSettings {
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            parity: self.parity,
            stop_bits: self.stop_bits,
        }
    }

    /// Settings a port cannot be opened with are a transport error
    pub fn validate(&self) -> ModbusResult<()> {
        if self.port.is_empty() {
            return Err(ModbusError::transport("Port name is empty"));
        }
        if self.baud_rate == 0 {
            return Err(ModbusError::transport(format!(
                "Invalid baud rate {} for {}",
                self.baud_rate, self.port
            )));
        }
        Ok(())
    }

    /// Minimum silence between frames at this baud rate
    pub fn frame_gap(&self) -> Duration {
        frame_gap(self.baud_rate)
    }
}

/// Silent interval of 3.5 character times, fixed at 1.75 ms above 19200 baud
pub fn frame_gap(baud_rate: u32) -> Duration {
    if baud_rate == 0 || baud_rate > FIXED_GAP_BAUD_THRESHOLD {
        return Duration::from_micros(FIXED_FRAME_GAP_US);
    }
    let char_time_us = BITS_PER_CHAR * 1_000_000 / baud_rate as u64;
    Duration::from_micros(char_time_us * 35 / 10)
}

/// Baud rate and character format as seen on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl fmt::Display for LineSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        };
        let stop = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        write!(
            f,
            "{} {}{}{}",
            self.baud_rate,
            self.data_bits.bits(),
            parity,
            stop
        )
    }
}

/// Parses the character format part, e.g. `"8N1"`; baud rate is left at 0
impl FromStr for LineSettings {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chars: Vec<char> = s.trim().chars().collect();
        let [d, p, st] = chars.as_slice() else {
            return Err(ModbusError::configuration(format!(
                "Line settings '{}' must look like 8N1",
                s
            )));
        };
        let data_bits = match d {
            '5' => DataBits::Five,
            '6' => DataBits::Six,
            '7' => DataBits::Seven,
            '8' => DataBits::Eight,
            _ => return Err(ModbusError::configuration(format!("Invalid data bits '{}'", d))),
        };
        let parity = match p.to_ascii_uppercase() {
            'N' => Parity::None,
            'O' => Parity::Odd,
            'E' => Parity::Even,
            _ => return Err(ModbusError::configuration(format!("Invalid parity '{}'", p))),
        };
        let stop_bits = match st {
            '1' => StopBits::One,
            '2' => StopBits::Two,
            _ => return Err(ModbusError::configuration(format!("Invalid stop bits '{}'", st))),
        };
        Ok(LineSettings {
            baud_rate: 0,
            data_bits,
            parity,
            stop_bits,
        })
    }
}

// ============================================================================
// Driver boundary
// ============================================================================

/// Byte channel underneath a [`Transport`].
///
/// `read` waits until at least one byte is available and must be cancel
/// safe: the transport wraps it in a timeout.
pub trait SerialLink: Send + 'static {
    fn open(&mut self, config: &SerialConfig)
        -> impl Future<Output = ModbusResult<()>> + Send;

    /// Apply new line settings to an open link
    fn reconfigure(
        &mut self,
        config: &SerialConfig,
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// `Ok(0)` for a non-empty `buf` means the port went away
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = ModbusResult<usize>> + Send;

    fn write(&mut self, data: &[u8]) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Drop any received but unread bytes
    fn clear_input(&mut self) -> ModbusResult<()>;

    fn close(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    fn is_open(&self) -> bool;
}

// ============================================================================
// Loopback link
// ============================================================================

struct WireChunk {
    settings: LineSettings,
    bytes: Vec<u8>,
}

/// One end of an in-process serial wire.
///
/// Bytes written on one end arrive on the other. When the two ends use
/// different line settings the receiver sees garbage: every byte is mangled
/// and the last byte of each burst is lost, as with a real baud mismatch.
pub struct LoopbackLink {
    name: String,
    tx: mpsc::UnboundedSender<WireChunk>,
    rx: mpsc::UnboundedReceiver<WireChunk>,
    pending: BytesMut,
    settings: Option<LineSettings>,
}

impl LoopbackLink {
    /// Two ends of one wire
    pub fn pair(a: impl Into<String>, b: impl Into<String>) -> (Self, Self) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let end_a = Self {
            name: a.into(),
            tx: tx_ab,
            rx: rx_ba,
            pending: BytesMut::new(),
            settings: None,
        };
        let end_b = Self {
            name: b.into(),
            tx: tx_ba,
            rx: rx_ab,
            pending: BytesMut::new(),
            settings: None,
        };
        (end_a, end_b)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn settings(&self) -> ModbusResult<LineSettings> {
        self.settings
            .ok_or_else(|| ModbusError::transport(format!("{} is not open", self.name)))
    }

    fn garble(bytes: Vec<u8>) -> Vec<u8> {
        let keep = bytes.len().saturating_sub(1);
        bytes
            .into_iter()
            .take(keep)
            .map(|b| b.rotate_left(3) ^ 0x5A)
            .collect()
    }
}

impl SerialLink for LoopbackLink {
    async fn open(&mut self, config: &SerialConfig) -> ModbusResult<()> {
        self.settings = Some(config.line_settings());
        self.pending.clear();
        Ok(())
    }

    async fn reconfigure(&mut self, config: &SerialConfig) -> ModbusResult<()> {
        self.settings()?;
        self.settings = Some(config.line_settings());
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> ModbusResult<usize> {
        let local = self.settings()?;
        while self.pending.is_empty() {
            let Some(chunk) = self.rx.recv().await else {
                // Peer end dropped: the line stays silent.
                std::future::pending::<()>().await;
                continue;
            };
            if chunk.settings == local {
                self.pending.extend_from_slice(&chunk.bytes);
            } else {
                self.pending.extend_from_slice(&Self::garble(chunk.bytes));
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }

    async fn write(&mut self, data: &[u8]) -> ModbusResult<()> {
        let settings = self.settings()?;
        // A missing peer swallows the bytes, like an unterminated line.
        let _ = self.tx.send(WireChunk {
            settings,
            bytes: data.to_vec(),
        });
        Ok(())
    }

    fn clear_input(&mut self) -> ModbusResult<()> {
        self.pending.clear();
        while self.rx.try_recv().is_ok() {}
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.settings = None;
        self.pending.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.settings.is_some()
    }
}

// ============================================================================
// Serial port link
// ============================================================================

#[cfg(feature = "rtu")]
pub use serial::SerialPortLink;

#[cfg(feature = "rtu")]
mod serial {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_serial::{ClearBuffer, SerialPort, SerialStream};

    use super::{DataBits, Parity, SerialConfig, SerialLink, StopBits};
    use crate::error::{ModbusError, ModbusResult};

    impl From<DataBits> for tokio_serial::DataBits {
        fn from(bits: DataBits) -> Self {
            match bits {
                DataBits::Five => tokio_serial::DataBits::Five,
                DataBits::Six => tokio_serial::DataBits::Six,
                DataBits::Seven => tokio_serial::DataBits::Seven,
                DataBits::Eight => tokio_serial::DataBits::Eight,
            }
        }
    }

    impl From<Parity> for tokio_serial::Parity {
        fn from(parity: Parity) -> Self {
            match parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Odd => tokio_serial::Parity::Odd,
                Parity::Even => tokio_serial::Parity::Even,
            }
        }
    }

    impl From<StopBits> for tokio_serial::StopBits {
        fn from(bits: StopBits) -> Self {
            match bits {
                StopBits::One => tokio_serial::StopBits::One,
                StopBits::Two => tokio_serial::StopBits::Two,
            }
        }
    }

    /// Serial port opened through `tokio-serial`
    #[derive(Default)]
    pub struct SerialPortLink {
        stream: Option<SerialStream>,
    }

    impl SerialPortLink {
        pub fn new() -> Self {
            Self::default()
        }

        fn stream(&mut self) -> ModbusResult<&mut SerialStream> {
            self.stream
                .as_mut()
                .ok_or_else(|| ModbusError::transport("Serial port is not open"))
        }
    }

    impl SerialLink for SerialPortLink {
        async fn open(&mut self, config: &SerialConfig) -> ModbusResult<()> {
            let builder = tokio_serial::new(&config.port, config.baud_rate)
                .data_bits(config.data_bits.into())
                .parity(config.parity.into())
                .stop_bits(config.stop_bits.into());
            self.stream = Some(SerialStream::open(&builder)?);
            Ok(())
        }

        async fn reconfigure(&mut self, config: &SerialConfig) -> ModbusResult<()> {
            let stream = self.stream()?;
            stream.set_baud_rate(config.baud_rate)?;
            stream.set_data_bits(config.data_bits.into())?;
            stream.set_parity(config.parity.into())?;
            stream.set_stop_bits(config.stop_bits.into())?;
            Ok(())
        }

        async fn read(&mut self, buf: &mut [u8]) -> ModbusResult<usize> {
            let n = self.stream()?.read(buf).await?;
            Ok(n)
        }

        async fn write(&mut self, data: &[u8]) -> ModbusResult<()> {
            let stream = self.stream()?;
            stream.write_all(data).await?;
            stream.flush().await?;
            Ok(())
        }

        fn clear_input(&mut self) -> ModbusResult<()> {
            self.stream()?.clear(ClearBuffer::Input)?;
            Ok(())
        }

        async fn close(&mut self) -> ModbusResult<()> {
            self.stream = None;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.stream.is_some()
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Counters kept per transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

struct TransportShared<L> {
    link: Mutex<L>,
    config: StdMutex<SerialConfig>,
    open: AtomicBool,
    scheduler: TransactionScheduler,
    stats: StdMutex<TransportStats>,
    last_activity: StdMutex<Option<Instant>>,
    /// Bytes read past the end of a frame, served before the link
    held_back: StdMutex<BytesMut>,
}

/// Shared handle to one serial line
pub struct Transport<L> {
    shared: Arc<TransportShared<L>>,
}

impl<L> Clone for Transport<L> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<L: SerialLink> fmt::Debug for Transport<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.config())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "rtu")]
impl Transport<SerialPortLink> {
    /// Transport over a real serial port (not yet opened)
    pub fn serial(config: SerialConfig) -> Self {
        Self::new(SerialPortLink::new(), config)
    }
}

impl<L: SerialLink> Transport<L> {
    /// Wrap a link; call [`Transport::open`] before use
    pub fn new(link: L, config: SerialConfig) -> Self {
        Self {
            shared: Arc::new(TransportShared {
                link: Mutex::new(link),
                config: StdMutex::new(config),
                open: AtomicBool::new(false),
                scheduler: TransactionScheduler::new(),
                stats: StdMutex::new(TransportStats::default()),
                last_activity: StdMutex::new(None),
                held_back: StdMutex::new(BytesMut::new()),
            }),
        }
    }

    /// Open the link with the current configuration; no-op when already open
    pub async fn open(&self) -> ModbusResult<()> {
        let config = self.config();
        config.validate()?;
        let mut link = self.shared.link.lock().await;
        if link.is_open() {
            return Ok(());
        }
        link.open(&config).await?;
        self.shared.open.store(true, Ordering::SeqCst);
        info!("Opened {} at {}", config.port, config.line_settings());
        Ok(())
    }

    /// Close the link once any in-flight transaction has finished
    pub async fn close(&self) -> ModbusResult<()> {
        let _permit = self.shared.scheduler.acquire(BusRole::Config).await;
        let mut link = self.shared.link.lock().await;
        self.shared.open.store(false, Ordering::SeqCst);
        lock(&self.shared.held_back).clear();
        if link.is_open() {
            link.close().await?;
            info!("Closed {}", self.name());
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Current line configuration
    pub fn config(&self) -> SerialConfig {
        lock(&self.shared.config).clone()
    }

    pub fn name(&self) -> String {
        lock(&self.shared.config).port.clone()
    }

    pub fn baud_rate(&self) -> u32 {
        lock(&self.shared.config).baud_rate
    }

    /// Replace the line configuration.
    ///
    /// Waits for the bus, so the change lands between transactions and is
    /// seen by every engine sharing this transport.
    pub async fn set_config(&self, config: SerialConfig) -> ModbusResult<()> {
        config.validate()?;
        let _permit = self.shared.scheduler.acquire(BusRole::Config).await;
        let mut link = self.shared.link.lock().await;
        if link.is_open() {
            link.reconfigure(&config).await?;
            link.clear_input()?;
        }
        debug!("{} reconfigured to {}", config.port, config.line_settings());
        *lock(&self.shared.config) = config;
        Ok(())
    }

    /// Change only the baud rate
    pub async fn set_baud_rate(&self, baud_rate: u32) -> ModbusResult<()> {
        let config = self.config().with_baud_rate(baud_rate);
        self.set_config(config).await
    }

    /// Scheduler serializing bus access on this transport
    pub fn scheduler(&self) -> &TransactionScheduler {
        &self.shared.scheduler
    }

    /// Read up to `max_bytes`, waiting at most `timeout` for the first byte.
    ///
    /// Bytes handed back with [`Transport::unread`] come first. Returns an
    /// empty buffer when nothing arrived in time.
    pub async fn read(&self, max_bytes: usize, timeout: Duration) -> ModbusResult<Vec<u8>> {
        let mut link = self.shared.link.lock().await;
        if !link.is_open() {
            return Err(ModbusError::transport(format!("{} is closed", self.name())));
        }

        {
            let mut held = lock(&self.shared.held_back);
            if !held.is_empty() {
                let n = max_bytes.min(held.len());
                return Ok(held.split_to(n).to_vec());
            }
        }

        let mut buf = vec![0u8; max_bytes];
        match tokio::time::timeout(timeout, link.read(&mut buf)).await {
            Ok(Ok(0)) if max_bytes > 0 => {
                warn!("{} returned end of stream", self.name());
                self.record(|s| s.errors += 1);
                Err(ModbusError::transport(format!("{} port closed", self.name())))
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                if n > 0 {
                    self.touch();
                    self.record(|s| s.bytes_received += n as u64);
                }
                Ok(buf)
            }
            Ok(Err(e)) => {
                warn!("{} read failed: {}", self.name(), e);
                self.record(|s| s.errors += 1);
                Err(e)
            }
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Write all bytes
    pub async fn write(&self, bytes: &[u8]) -> ModbusResult<()> {
        let mut link = self.shared.link.lock().await;
        if !link.is_open() {
            return Err(ModbusError::transport(format!("{} is closed", self.name())));
        }
        if let Err(e) = link.write(bytes).await {
            warn!("{} write failed: {}", self.name(), e);
            self.record(|s| s.errors += 1);
            return Err(e);
        }
        self.touch();
        self.record(|s| s.bytes_sent += bytes.len() as u64);
        Ok(())
    }

    /// Put bytes back in front of the input; the next reads return them first
    pub fn unread(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut held = lock(&self.shared.held_back);
        let mut front = BytesMut::with_capacity(bytes.len() + held.len());
        front.extend_from_slice(bytes);
        front.extend_from_slice(&held);
        *held = front;
    }

    /// Discard unread input, including bytes handed back with `unread`
    pub async fn clear_input(&self) -> ModbusResult<()> {
        let mut link = self.shared.link.lock().await;
        lock(&self.shared.held_back).clear();
        if link.is_open() {
            link.clear_input()?;
        }
        Ok(())
    }

    /// Silent interval for the current baud rate
    pub fn frame_gap(&self) -> Duration {
        frame_gap(self.baud_rate())
    }

    /// Sleep until the silent interval since the last byte has elapsed
    pub async fn wait_frame_gap(&self) {
        let last = *lock(&self.shared.last_activity);
        if let Some(last) = last {
            tokio::time::sleep_until(last + self.frame_gap()).await;
        }
    }

    /// Time of the last byte sent or received
    pub fn last_activity(&self) -> Option<Instant> {
        *lock(&self.shared.last_activity)
    }

    pub fn stats(&self) -> TransportStats {
        lock(&self.shared.stats).clone()
    }

    pub(crate) fn record(&self, update: impl FnOnce(&mut TransportStats)) {
        update(&mut lock(&self.shared.stats));
    }

    fn touch(&self) {
        *lock(&self.shared.last_activity) = Some(Instant::now());
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
