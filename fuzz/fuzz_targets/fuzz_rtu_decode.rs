#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_rtu::frame::{decode, request_frame_len, response_frame_len, FrameLen};
use voltage_rtu::ModbusResponse;

fuzz_target!(|data: &[u8]| {
    for len in [request_frame_len(data), response_frame_len(data)] {
        if let FrameLen::Known(n) = len {
            assert!(n >= 5);
        }
    }

    if let Ok(frame) = decode(data) {
        assert_eq!(frame.encode(), data);
        if let Ok(response) =
            ModbusResponse::from_parts(frame.address, frame.function_code, &frame.payload)
        {
            let _ = response.parse_registers();
            let _ = response.parse_bits();
            let _ = response.parse_write_echo();
        }
    }
});
