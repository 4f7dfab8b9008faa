//! Voltage RTU Demo
//!
//! Runs a master and a slave engine against each other over an in-process
//! serial wire, or against real ports when built with the `rtu` feature.
//!
//! Usage:
//!   rtu-demo self-test --count 5
//!   rtu-demo sensor-relay --cycles 3 --threshold 28
//!   RUST_LOG=debug rtu-demo -v self-test

use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use voltage_rtu::{
    BlockKind, CallbackLogger, LoggingMode, LoopbackLink, ModbusFunction, ModbusResult, RtuMaster,
    RtuServer, SerialConfig, SerialLink, Transport,
};

/// Modbus RTU master/slave demo
#[derive(Parser)]
#[command(name = "rtu-demo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Dump every frame on the wire
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Slave on one port, master on the other, reading the slave's registers
    SelfTest {
        /// Number of read cycles
        #[arg(short, long, default_value_t = 5)]
        count: u16,

        /// Line speed for both ports
        #[arg(short, long, default_value_t = 115_200)]
        baud: u32,

        /// Slave port (real serial port, needs the `rtu` feature)
        #[arg(long, requires = "master_port")]
        slave_port: Option<String>,

        /// Master port (real serial port, needs the `rtu` feature)
        #[arg(long, requires = "slave_port")]
        master_port: Option<String>,

        /// Pause between cycles (milliseconds)
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },

    /// Poll a temperature sensor at 9600 baud and drive a relay at 115200 baud
    SensorRelay {
        /// Number of poll cycles
        #[arg(short, long, default_value_t = 3)]
        cycles: u32,

        /// Relay opens above this temperature (°C)
        #[arg(short, long, default_value_t = 28.0)]
        threshold: f64,

        /// Pause between steps (milliseconds)
        #[arg(long, default_value_t = 3000)]
        interval_ms: u64,
    },
}

const SLAVE_ADDR: u8 = 0x66;
const SENSOR_ADDR: u8 = 0x02;
const RELAY_ADDR: u8 = 0x01;
const SENSOR_BAUD: u32 = 9600;
const RELAY_BAUD: u32 = 115_200;

fn init_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn logger(verbose: bool) -> CallbackLogger {
    CallbackLogger::tracing(if verbose {
        LoggingMode::Verbose
    } else {
        LoggingMode::Normal
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    info!("{}", voltage_rtu::info());

    match cli.command {
        Commands::SelfTest {
            count,
            baud,
            slave_port,
            master_port,
            interval_ms,
        } => {
            let interval = Duration::from_millis(interval_ms);
            match (slave_port, master_port) {
                (Some(slave_port), Some(master_port)) => {
                    run_self_test_on_ports(slave_port, master_port, baud, count, interval, cli.verbose)
                        .await?
                }
                _ => {
                    let (com1, com2) = LoopbackLink::pair("COM1", "COM2");
                    let slave = Transport::new(com1, SerialConfig::new("COM1", baud));
                    let master = Transport::new(com2, SerialConfig::new("COM2", baud));
                    self_test(slave, master, count, interval, cli.verbose).await?
                }
            }
        }
        Commands::SensorRelay {
            cycles,
            threshold,
            interval_ms,
        } => {
            sensor_relay(cycles, threshold, Duration::from_millis(interval_ms), cli.verbose).await?
        }
    }
    Ok(())
}

#[cfg(feature = "rtu")]
async fn run_self_test_on_ports(
    slave_port: String,
    master_port: String,
    baud: u32,
    count: u16,
    interval: Duration,
    verbose: bool,
) -> ModbusResult<()> {
    let slave = Transport::serial(SerialConfig::new(slave_port, baud));
    let master = Transport::serial(SerialConfig::new(master_port, baud));
    self_test(slave, master, count, interval, verbose).await
}

#[cfg(not(feature = "rtu"))]
async fn run_self_test_on_ports(
    _slave_port: String,
    _master_port: String,
    _baud: u32,
    _count: u16,
    _interval: Duration,
    _verbose: bool,
) -> ModbusResult<()> {
    Err(voltage_rtu::ModbusError::configuration(
        "serial ports need the `rtu` feature",
    ))
}

async fn self_test<L: SerialLink>(
    slave_port: Transport<L>,
    master_port: Transport<L>,
    count: u16,
    interval: Duration,
    verbose: bool,
) -> ModbusResult<()> {
    info!("Initializing the slave on {}", slave_port.name());
    slave_port.open().await?;
    let mut server = RtuServer::new(slave_port).with_logger(logger(verbose));
    let slave = server.add_slave(SLAVE_ADDR)?;
    slave.add_block("test", BlockKind::HoldingRegisters, 0, 10)?;

    let values = [7, 1, 5];
    slave.set_values("test", 0, &values)?;
    if slave.get_values("test", 0, values.len())? != values {
        warn!("Failed to set the slave register values");
    }
    server.start()?;

    info!("Initializing the master on {}", master_port.name());
    master_port.open().await?;
    let master = RtuMaster::new(master_port).with_logger(logger(verbose));

    let mut passed = 0;
    for cycle in 1..=count {
        let expected = [9, 9, cycle, 9, 9];
        slave.set_values("test", 0, &expected)?;
        info!("Slave test value: {}", cycle);

        match master
            .execute(SLAVE_ADDR, ModbusFunction::ReadHoldingRegisters, 0, expected.len() as u16)
            .await
        {
            Ok(data) if data == expected => {
                info!("Master read {:?}", data);
                passed += 1;
            }
            Ok(data) => warn!("Master read {:?}, expected {:?}", data, expected),
            Err(e) => error!("Master read failed: {}", e),
        }
        tokio::time::sleep(interval).await;
    }

    server.stop().await?;
    info!("Self test finished: {}/{} cycles passed", passed, count);
    info!("Master stats: {:?}", master.stats());
    info!("Slave stats: {:?}", server.stats());
    Ok(())
}

/// Sensor at 9600 baud and relay at 115200 baud on one bus.
///
/// Over the loopback wire the field side is a single slave engine serving
/// both addresses; it follows the master's baud rate.
async fn sensor_relay(
    cycles: u32,
    threshold: f64,
    interval: Duration,
    verbose: bool,
) -> ModbusResult<()> {
    let (field, bus) = LoopbackLink::pair("FIELD", "CH1");
    let field = Transport::new(field, SerialConfig::new("FIELD", SENSOR_BAUD));
    let bus = Transport::new(bus, SerialConfig::new("CH1", RELAY_BAUD));
    field.open().await?;
    bus.open().await?;

    let mut server = RtuServer::new(field.clone());
    let sensor = server.add_slave(SENSOR_ADDR)?;
    sensor.add_block("readings", BlockKind::InputRegisters, 0, 4)?;
    let relay = server.add_slave(RELAY_ADDR)?;
    relay.add_block("relay", BlockKind::Coils, 0, 1)?;
    server.start()?;

    let mut master = RtuMaster::new(bus.clone()).with_logger(logger(verbose));
    master.set_timeout(Duration::from_secs(5));

    for cycle in 0..cycles {
        // Simulated reading in tenths of a degree: 26.5, 28.0, 29.5, ...
        sensor.set_values("readings", 1, &[265 + 15 * (cycle as u16 % 4)])?;

        bus.set_baud_rate(SENSOR_BAUD).await?;
        field.set_baud_rate(SENSOR_BAUD).await?;
        let temperature = match master
            .execute(SENSOR_ADDR, ModbusFunction::ReadInputRegisters, 1, 1)
            .await
        {
            Ok(data) => f64::from(data[0]) / 10.0,
            Err(e) => {
                error!("Sensor read failed: {}", e);
                tokio::time::sleep(interval).await;
                continue;
            }
        };
        info!("temperature = {:.1}", temperature);
        tokio::time::sleep(interval).await;

        bus.set_baud_rate(RELAY_BAUD).await?;
        field.set_baud_rate(RELAY_BAUD).await?;
        let closed = temperature <= threshold;
        match master
            .execute(RELAY_ADDR, ModbusFunction::WriteSingleCoil, 0, u16::from(closed))
            .await
        {
            Ok(_) => info!("relay {}", if closed { "closed" } else { "open" }),
            Err(e) => error!("Relay write failed: {}", e),
        }
        tokio::time::sleep(interval).await;
    }

    server.stop().await?;
    Ok(())
}
