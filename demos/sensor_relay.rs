//! Temperature sensor and relay on one RS-485 bus at different baud rates.
//!
//! The sensor (address 0x02, 9600 baud) reports tenths of a degree in input
//! register 1. The relay (address 0x01, 115200 baud) is coil 0. The port is
//! switched between the two rates before each transaction; the relay opens
//! while the temperature is above the threshold.
//!
//! Usage: cargo run --example sensor_relay --features rtu -- /dev/ttyUSB0

use std::time::Duration;

use voltage_rtu::{ModbusFunction, RtuMaster, SerialConfig, Transport};

const ADDR_SENSOR: u8 = 0x02;
const ADDR_RELAY: u8 = 0x01;
const THRESHOLD: f64 = 28.0;
const SENSOR_BAUD: u32 = 9600;
const RELAY_BAUD: u32 = 115_200;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let port = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    println!("Make sure the sensor and relay are wired to {} and configured as below.\n", port);

    let transport = Transport::serial(SerialConfig::new(port, RELAY_BAUD));
    transport.open().await?;
    println!("port = {}", transport.name());

    let mut master = RtuMaster::new(transport.clone());
    master.set_timeout(Duration::from_secs(5));
    master.set_verbose(true);

    loop {
        transport.set_baud_rate(SENSOR_BAUD).await?;
        // 02 04 00 01 00 01 60 39
        let temperature = match master
            .execute(ADDR_SENSOR, ModbusFunction::ReadInputRegisters, 1, 1)
            .await
        {
            Ok(data) => f64::from(data[0]) / 10.0,
            Err(e) => {
                println!("sensor: {}", e);
                tokio::time::sleep(Duration::from_secs(3)).await;
                continue;
            }
        };
        println!("temperature = {:.1}", temperature);
        tokio::time::sleep(Duration::from_secs(3)).await;

        transport.set_baud_rate(RELAY_BAUD).await?;
        // 01 05 00 00 FF 00 (closed) or 01 05 00 00 00 00 (open)
        let closed = temperature <= THRESHOLD;
        if let Err(e) = master
            .execute(ADDR_RELAY, ModbusFunction::WriteSingleCoil, 0, u16::from(closed))
            .await
        {
            println!("relay: {}", e);
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
    }
}
