//! Self test: one port acts as slave 0x66, the other as master.
//!
//! The slave publishes `[9, 9, n, 9, 9]` in a holding block and the master
//! reads it back every second. Runs over an in-process wire; swap the
//! `LoopbackLink` pair for `Transport::serial(..)` on two wired ports.
//!
//! Usage: cargo run --example self_test

use std::time::Duration;

use voltage_rtu::{
    BlockKind, LoopbackLink, ModbusFunction, ModbusResult, RtuMaster, RtuServer, SerialConfig,
    Transport,
};

#[tokio::main]
async fn main() -> ModbusResult<()> {
    println!("Self test: slave on PORT_1, master on PORT_2\n");

    let slave_addr = 0x66;
    let baud = 115_200;
    let (port1, port2) = LoopbackLink::pair("PORT_1", "PORT_2");

    println!("Initializing the slave port...");
    let slave_port = Transport::new(port1, SerialConfig::new("PORT_1", baud));
    slave_port.open().await?;
    let mut server = RtuServer::new(slave_port);
    let slave = server.add_slave(slave_addr)?;
    slave.add_block("test", BlockKind::HoldingRegisters, 0, 10)?;
    slave.set_values("test", 0, &[7, 1, 5])?;
    println!("  slave values: {:?}", slave.get_values("test", 0, 3)?);
    server.start()?;

    println!("Initializing the master port...");
    let master_port = Transport::new(port2, SerialConfig::new("PORT_2", baud));
    master_port.open().await?;
    let mut master = RtuMaster::new(master_port);
    master.set_timeout(Duration::from_secs(5));
    master.set_verbose(true);

    for test_count in 1..=5u16 {
        let values = [9, 9, test_count, 9, 9];
        slave.set_values("test", 0, &values)?;
        println!("Slave test value: {}", test_count);

        let data = master
            .execute(slave_addr, ModbusFunction::ReadHoldingRegisters, 0, values.len() as u16)
            .await?;
        println!("Master reads: {:?}\n", data);

        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    server.stop().await?;
    println!("Transport stats: {:?}", master.stats());
    Ok(())
}
