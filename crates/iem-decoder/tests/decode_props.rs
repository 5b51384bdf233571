#![cfg(not(target_arch = "wasm32"))]

use iem_decoder::{decode, DecodeError, DecodeMode, MAX_INST_LEN};
use proptest::prelude::*;

fn decode_inputs() -> impl Strategy<Value = (DecodeMode, Vec<u8>)> {
    let mode = prop_oneof![
        Just(DecodeMode::Bits16),
        Just(DecodeMode::Bits32),
        Just(DecodeMode::Bits64)
    ];
    (mode, proptest::collection::vec(any::<u8>(), 0..=20))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 4096,
        .. ProptestConfig::default()
    })]

    #[test]
    fn decode_never_panics_and_respects_length_limit((mode, bytes) in decode_inputs()) {
        match decode(&bytes, mode) {
            Ok(inst) => {
                prop_assert!(inst.length >= 1);
                prop_assert!(inst.length as usize <= MAX_INST_LEN);
                prop_assert!(inst.length as usize <= bytes.len());
            }
            Err(DecodeError::UnexpectedEof) => {
                prop_assert!(bytes.len() < MAX_INST_LEN, "eof with {} bytes", bytes.len());
            }
            Err(DecodeError::TooLong | DecodeError::Invalid) => {}
        }
    }

    #[test]
    fn trailing_bytes_do_not_change_the_decode((mode, bytes) in decode_inputs(), tail in proptest::collection::vec(any::<u8>(), 1..8)) {
        if let Ok(inst) = decode(&bytes, mode) {
            let mut extended = bytes[..inst.length as usize].to_vec();
            extended.extend_from_slice(&tail);
            prop_assert_eq!(decode(&extended, mode), Ok(inst));
        }
    }
}
