#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_rtu::frame::{crc16, decode};
use voltage_rtu::{BlockKind, LoopbackLink, RtuServer, SerialConfig, Transport};

fuzz_target!(|data: &[u8]| {
    let (port, _peer) = LoopbackLink::pair("FUZZ", "PEER");
    let server = RtuServer::new(Transport::new(port, SerialConfig::new("FUZZ", 9600)));
    let slave = server.add_slave(1).unwrap();
    slave.add_block("c", BlockKind::Coils, 0, 64).unwrap();
    slave.add_block("d", BlockKind::DiscreteInputs, 0, 64).unwrap();
    slave.add_block("h", BlockKind::HoldingRegisters, 0, 64).unwrap();
    slave.add_block("i", BlockKind::InputRegisters, 0, 64).unwrap();

    // Give every input a valid checksum so the dispatcher is reached
    let mut frame = vec![1];
    frame.extend_from_slice(data);
    frame.extend_from_slice(&crc16(&frame).to_le_bytes());

    if let Some(reply) = server.process_frame(&frame) {
        let reply = decode(&reply).unwrap();
        assert_eq!(reply.address, 1);
    }
});
