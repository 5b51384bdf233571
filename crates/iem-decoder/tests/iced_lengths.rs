#![cfg(not(target_arch = "wasm32"))]

mod common;

use common::XorShift64;
use iced_x86::{Decoder, DecoderOptions};
use iem_decoder::{decode, DecodeMode, InstClass};

/// One-byte opcodes whose semantics the recompiler models. Length and
/// validity must agree with a reference decoder for all of them.
const MODELLED_PRIMARY: &[u8] = &[
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x20, 0x21, 0x22,
    0x23, 0x24, 0x25, 0x28, 0x29, 0x2A, 0x2B, 0x2C, 0x2D, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35,
    0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 0x50, 0x53, 0x58, 0x5D, 0x68, 0x6A, 0x70, 0x74, 0x7F,
    0x80, 0x81, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89, 0x8A, 0x8B, 0x8D, 0x90, 0xB0, 0xB7,
    0xB8, 0xBF, 0xC2, 0xC3, 0xC6, 0xC7, 0xCC, 0xCD, 0xE2, 0xE8, 0xE9, 0xEB, 0xF4, 0xF6, 0xF7,
    0xF8, 0xFA, 0xFB, 0xFC, 0xFE, 0xFF,
];

const MODELLED_SECONDARY: &[u8] = &[0x80, 0x84, 0x8F, 0xA2, 0xB6, 0xB7, 0xBE, 0xBF];

fn iced_len(bitness: u32, bytes: &[u8]) -> Option<usize> {
    let mut decoder = Decoder::with_ip(bitness, bytes, 0, DecoderOptions::NONE);
    let inst = decoder.decode();
    (!inst.is_invalid()).then(|| inst.len())
}

fn check(mode: DecodeMode, bytes: &[u8]) -> bool {
    let Ok(ours) = decode(bytes, mode) else {
        return false;
    };
    if ours.class == InstClass::Unsupported {
        return false;
    }
    let theirs = iced_len(mode.bitness(), bytes);
    assert_eq!(
        Some(ours.length as usize),
        theirs,
        "mode={mode:?} bytes={:02x?} class={:?}",
        &bytes[..ours.length as usize],
        ours.class
    );
    true
}

#[test]
fn modelled_opcode_lengths_match_iced() {
    let mut rng = XorShift64(0x1E3D_5EED_0000_0001);
    let mut compared = 0usize;
    for mode in [DecodeMode::Bits16, DecodeMode::Bits32, DecodeMode::Bits64] {
        for &op in MODELLED_PRIMARY {
            for _ in 0..64 {
                let mut bytes = [0u8; 15];
                rng.fill(&mut bytes);
                bytes[0] = op;
                if check(mode, &bytes) {
                    compared += 1;
                }
            }
        }
        for &op in MODELLED_SECONDARY {
            for _ in 0..64 {
                let mut bytes = [0u8; 15];
                rng.fill(&mut bytes);
                bytes[0] = 0x0F;
                bytes[1] = op;
                if check(mode, &bytes) {
                    compared += 1;
                }
            }
        }
    }
    assert!(compared > 10_000, "only {compared} encodings compared");
}

#[test]
fn prefixed_forms_match_iced() {
    let cases: &[(DecodeMode, &[u8])] = &[
        (DecodeMode::Bits32, &[0x66, 0x05, 0x34, 0x12]),
        (DecodeMode::Bits16, &[0x66, 0xB8, 1, 2, 3, 4]),
        (DecodeMode::Bits16, &[0x67, 0x8B, 0x44, 0x24, 0x08]),
        (DecodeMode::Bits64, &[0x48, 0x81, 0xC1, 1, 0, 0, 0]),
        (DecodeMode::Bits64, &[0x49, 0xBF, 1, 2, 3, 4, 5, 6, 7, 8]),
        (DecodeMode::Bits64, &[0x0F, 0x85, 0x10, 0, 0, 0]),
        (DecodeMode::Bits64, &[0x41, 0x8B, 0x84, 0x24, 0, 1, 0, 0]),
        (DecodeMode::Bits32, &[0xF0, 0x83, 0x00, 0x01]),
        (DecodeMode::Bits64, &[0x64, 0x48, 0x8B, 0x04, 0x25, 0x28, 0, 0, 0]),
    ];
    for (mode, bytes) in cases {
        assert!(check(*mode, bytes), "{mode:?} {bytes:02x?} not modelled");
    }
}
