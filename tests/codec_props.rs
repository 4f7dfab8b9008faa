//! Property tests for the RTU frame codec.

use proptest::prelude::*;
use voltage_rtu::frame::{crc16, decode, encode, request_frame_len, FrameLen};
use voltage_rtu::FrameErrorKind;

proptest! {
    #[test]
    fn decode_inverts_encode(
        address in any::<u8>(),
        function in any::<u8>(),
        payload in proptest::collection::vec(any::<u8>(), 0..252),
    ) {
        let bytes = encode(address, function, &payload);
        prop_assert_eq!(bytes.len(), payload.len() + 4);

        let frame = decode(&bytes).unwrap();
        prop_assert_eq!(frame.address, address);
        prop_assert_eq!(frame.function_code, function);
        prop_assert_eq!(frame.payload, payload);
    }

    #[test]
    fn single_bit_flip_is_crc_mismatch(
        address in 1u8..=247,
        function in prop::sample::select(vec![0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x0F, 0x10]),
        payload in proptest::collection::vec(any::<u8>(), 1..64),
        bit in any::<prop::sample::Index>(),
    ) {
        let mut bytes = encode(address, function, &payload);
        let bit = bit.index(payload.len() * 8);
        bytes[2 + bit / 8] ^= 1 << (bit % 8);

        let err = decode(&bytes).unwrap_err();
        prop_assert_eq!(err.frame_kind(), Some(FrameErrorKind::CrcMismatch));
    }

    #[test]
    fn crc_trailer_is_little_endian(data in proptest::collection::vec(any::<u8>(), 2..64)) {
        let bytes = encode(data[0], data[1], &data[2..]);
        let crc = crc16(&data);
        prop_assert_eq!(bytes[bytes.len() - 2], (crc & 0xFF) as u8);
        prop_assert_eq!(bytes[bytes.len() - 1], (crc >> 8) as u8);
    }

    #[test]
    fn fixed_requests_have_known_length(
        address in 1u8..=247,
        function in 0x01u8..=0x06,
        start in any::<u16>(),
        value in any::<u16>(),
    ) {
        let mut body = start.to_be_bytes().to_vec();
        body.extend_from_slice(&value.to_be_bytes());
        let bytes = encode(address, function, &body);
        prop_assert_eq!(request_frame_len(&bytes), FrameLen::Known(bytes.len()));
    }
}

#[test]
fn short_input_is_malformed() {
    for len in 0..4 {
        let err = decode(&vec![0x01; len]).unwrap_err();
        assert_eq!(err.frame_kind(), Some(FrameErrorKind::Malformed));
    }
}
