use iem_decoder::{
    decode, AddressSize, DecodeMode, InstClass, MemOperand, OperandSize, RmOperand, SegmentReg,
};

fn mem(bytes: &[u8], mode: DecodeMode) -> MemOperand {
    match decode(bytes, mode).expect("decode").rm {
        Some(RmOperand::Mem(m)) => m,
        other => panic!("expected memory operand, got {other:?}"),
    }
}

#[test]
fn decodes_rip_relative_memory_operand() {
    // 48 8B 05 78 56 34 12 => mov rax, [rip+0x12345678]
    let m = mem(&[0x48, 0x8B, 0x05, 0x78, 0x56, 0x34, 0x12], DecodeMode::Bits64);
    assert!(m.rip_relative);
    assert_eq!(m.base, None);
    assert_eq!(m.disp, 0x12345678);
}

#[test]
fn disp32_without_base_is_absolute_outside_long_mode() {
    // 8B 05 78 56 34 12 => mov eax, [0x12345678]
    let m = mem(&[0x8B, 0x05, 0x78, 0x56, 0x34, 0x12], DecodeMode::Bits32);
    assert!(!m.rip_relative);
    assert_eq!(m.base, None);
    assert_eq!(m.disp, 0x12345678);
}

#[test]
fn decodes_sib_scaled_index() {
    // 48 8B 84 8B 78 56 34 12 => mov rax, [rbx+rcx*4+0x12345678]
    let m = mem(&[0x48, 0x8B, 0x84, 0x8B, 0x78, 0x56, 0x34, 0x12], DecodeMode::Bits64);
    assert_eq!(m.base, Some(3));
    assert_eq!(m.index, Some(1));
    assert_eq!(m.scale, 4);
    assert_eq!(m.disp, 0x12345678);
}

#[test]
fn sib_index_four_means_no_index() {
    // 8B 04 24 => mov eax, [esp]
    let m = mem(&[0x8B, 0x04, 0x24], DecodeMode::Bits32);
    assert_eq!(m.base, Some(4));
    assert_eq!(m.index, None);
    assert_eq!(m.segment, SegmentReg::Ss);
}

#[test]
fn rex_x_extends_sib_index() {
    // 42 8B 04 20 => mov eax, [rax+r12]
    let m = mem(&[0x42, 0x8B, 0x04, 0x20], DecodeMode::Bits64);
    assert_eq!(m.base, Some(0));
    assert_eq!(m.index, Some(12));
}

#[test]
fn sixteen_bit_forms() {
    // 8B 07 => mov ax, [bx]
    let m = mem(&[0x8B, 0x07], DecodeMode::Bits16);
    assert_eq!(m.base, Some(3));
    assert_eq!(m.index, None);
    assert_eq!(m.segment, SegmentReg::Ds);

    // 8B 06 34 12 => mov ax, [0x1234]
    let m = mem(&[0x8B, 0x06, 0x34, 0x12], DecodeMode::Bits16);
    assert_eq!(m.base, None);
    assert_eq!(m.disp, 0x1234);

    // 8B 42 FE => mov ax, [bp+si-2]
    let m = mem(&[0x8B, 0x42, 0xFE], DecodeMode::Bits16);
    assert_eq!((m.base, m.index, m.disp), (Some(5), Some(6), -2));
    assert_eq!(m.segment, SegmentReg::Ss);
}

#[test]
fn address_size_override_switches_modrm_form() {
    // 67 8B 07 in 32-bit mode => mov eax, [bx]
    let inst = decode(&[0x67, 0x8B, 0x07], DecodeMode::Bits32).expect("decode");
    assert_eq!(inst.address_size, AddressSize::Bits16);
    assert_eq!(inst.length, 3);
}

#[test]
fn group_opcodes_resolve_from_modrm_reg() {
    // FF C1 => inc ecx; FF E0 => jmp eax; FF 10 => call [eax]
    assert_eq!(decode(&[0xFF, 0xC1], DecodeMode::Bits32).unwrap().class, InstClass::IncDecRm);
    assert_eq!(decode(&[0xFF, 0xE0], DecodeMode::Bits32).unwrap().class, InstClass::JmpRm);
    let call = decode(&[0xFF, 0x10], DecodeMode::Bits64).unwrap();
    assert_eq!(call.class, InstClass::CallRm);
    assert_eq!(call.operand_size, OperandSize::Bits64);

    // F7 /0 carries an immediate, F7 /2 (NOT) does not.
    assert_eq!(decode(&[0xF7, 0xC0, 1, 0, 0, 0], DecodeMode::Bits32).unwrap().length, 6);
    assert_eq!(decode(&[0xF7, 0xD0], DecodeMode::Bits32).unwrap().length, 2);
}

#[test]
fn immediates_follow_operand_size() {
    // B8 imm32 / 66 B8 imm16 / 48 B8 imm64
    let a = decode(&[0xB8, 1, 0, 0, 0], DecodeMode::Bits32).unwrap();
    assert_eq!((a.length, a.imm), (5, 1));
    let b = decode(&[0x66, 0xB8, 0x34, 0x12], DecodeMode::Bits32).unwrap();
    assert_eq!((b.length, b.imm), (4, 0x1234));
    let c = decode(&[0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8], DecodeMode::Bits64).unwrap();
    assert_eq!((c.length, c.imm), (10, 0x0807_0605_0403_0201));

    // Sign extension of the group-1 imm8 form.
    let d = decode(&[0x83, 0xC0, 0xFF], DecodeMode::Bits32).unwrap();
    assert_eq!(d.imm_sext(), -1);
}

#[test]
fn far_pointer_immediates() {
    // EA 00 7C 00 00 => jmp 0000:7C00
    let inst = decode(&[0xEA, 0x00, 0x7C, 0x00, 0x00], DecodeMode::Bits16).unwrap();
    assert_eq!(inst.class, InstClass::FarJmp);
    assert_eq!((inst.imm, inst.imm2, inst.length), (0x7C00, 0, 5));
}
