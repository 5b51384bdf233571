use iem_decoder::{AluOp, Cond, OperandSize};

use crate::state::{FLAG_AF, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};

fn sign_bit(size: OperandSize) -> u64 {
    1u64 << (size.bits() - 1)
}

fn parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

fn set(rflags: &mut u64, mask: u64, val: bool) {
    if val {
        *rflags |= mask;
    } else {
        *rflags &= !mask;
    }
}

pub fn sub_with_flags(rflags: &mut u64, dest: u64, src: u64, borrow_in: bool, size: OperandSize) -> u64 {
    let mask = size.mask();
    let dest = dest & mask;
    let src = src & mask;
    let borrow = borrow_in as u64;
    let src2 = src.wrapping_add(borrow) & mask;
    let subtrahend = (src as u128) + (borrow as u128);
    let result = (dest as u128).wrapping_sub(subtrahend) as u64 & mask;

    let sb = sign_bit(size);
    set(rflags, FLAG_CF, (dest as u128) < subtrahend);
    set(rflags, FLAG_ZF, result == 0);
    set(rflags, FLAG_SF, (result & sb) != 0);
    set(rflags, FLAG_OF, ((dest ^ src2) & (dest ^ result) & sb) != 0);
    set(rflags, FLAG_AF, ((dest ^ src2 ^ result) & 0x10) != 0);
    set(rflags, FLAG_PF, parity(result as u8));

    result
}

pub fn add_with_flags(rflags: &mut u64, dest: u64, src: u64, carry_in: bool, size: OperandSize) -> u64 {
    let mask = size.mask();
    let dest = dest & mask;
    let src = src & mask;
    let full = (dest as u128) + (src as u128) + (carry_in as u128);
    let result = (full as u64) & mask;

    let sb = sign_bit(size);
    set(rflags, FLAG_CF, full > mask as u128);
    set(rflags, FLAG_ZF, result == 0);
    set(rflags, FLAG_SF, (result & sb) != 0);
    set(rflags, FLAG_OF, ((dest ^ result) & (src ^ result) & sb) != 0);
    set(rflags, FLAG_AF, ((dest ^ src ^ result) & 0x10) != 0);
    set(rflags, FLAG_PF, parity(result as u8));

    result
}

pub fn logic_with_flags(rflags: &mut u64, result: u64, size: OperandSize) -> u64 {
    let result = result & size.mask();

    set(rflags, FLAG_CF, false);
    set(rflags, FLAG_OF, false);
    // AF is architecturally undefined; clear it like most hardware does.
    set(rflags, FLAG_AF, false);

    let sb = sign_bit(size);
    set(rflags, FLAG_ZF, result == 0);
    set(rflags, FLAG_SF, (result & sb) != 0);
    set(rflags, FLAG_PF, parity(result as u8));

    result
}

/// The eight classic two-operand ALU ops. `CMP` returns the (discarded) difference.
pub fn alu(op: AluOp, rflags: &mut u64, dest: u64, src: u64, size: OperandSize) -> u64 {
    let cf = *rflags & FLAG_CF != 0;
    match op {
        AluOp::Add => add_with_flags(rflags, dest, src, false, size),
        AluOp::Adc => add_with_flags(rflags, dest, src, cf, size),
        AluOp::Sub | AluOp::Cmp => sub_with_flags(rflags, dest, src, false, size),
        AluOp::Sbb => sub_with_flags(rflags, dest, src, cf, size),
        AluOp::And => logic_with_flags(rflags, dest & src, size),
        AluOp::Or => logic_with_flags(rflags, dest | src, size),
        AluOp::Xor => logic_with_flags(rflags, dest ^ src, size),
    }
}

/// `INC`/`DEC`: like `ADD`/`SUB` with 1 but CF is preserved.
pub fn inc_dec(rflags: &mut u64, val: u64, dec: bool, size: OperandSize) -> u64 {
    let cf = *rflags & FLAG_CF;
    let result = if dec {
        sub_with_flags(rflags, val, 1, false, size)
    } else {
        add_with_flags(rflags, val, 1, false, size)
    };
    *rflags = (*rflags & !FLAG_CF) | cf;
    result
}

pub fn eval_cond(rflags: u64, cond: Cond) -> bool {
    let cf = rflags & FLAG_CF != 0;
    let zf = rflags & FLAG_ZF != 0;
    let sf = rflags & FLAG_SF != 0;
    let of = rflags & FLAG_OF != 0;
    let pf = rflags & FLAG_PF != 0;
    match cond {
        Cond::O => of,
        Cond::No => !of,
        Cond::B => cf,
        Cond::Ae => !cf,
        Cond::E => zf,
        Cond::Ne => !zf,
        Cond::Be => cf || zf,
        Cond::A => !cf && !zf,
        Cond::S => sf,
        Cond::Ns => !sf,
        Cond::P => pf,
        Cond::Np => !pf,
        Cond::L => sf != of,
        Cond::Ge => sf == of,
        Cond::Le => zf || sf != of,
        Cond::G => !zf && sf == of,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sets_carry_and_overflow() {
        let mut fl = 0;
        assert_eq!(add_with_flags(&mut fl, 0xFF, 1, false, OperandSize::Bits8), 0);
        assert!(fl & FLAG_CF != 0 && fl & FLAG_ZF != 0);
        let mut fl = 0;
        add_with_flags(&mut fl, 0x7FFF_FFFF, 1, false, OperandSize::Bits32);
        assert!(fl & FLAG_OF != 0 && fl & FLAG_SF != 0);
    }

    #[test]
    fn inc_preserves_carry() {
        let mut fl = FLAG_CF;
        assert_eq!(inc_dec(&mut fl, 0xFFFF, false, OperandSize::Bits16), 0);
        assert!(fl & FLAG_CF != 0);
        assert!(fl & FLAG_ZF != 0);
    }

    #[test]
    fn conditions() {
        assert!(eval_cond(FLAG_ZF, Cond::E));
        assert!(eval_cond(FLAG_SF, Cond::L));
        assert!(eval_cond(FLAG_SF | FLAG_OF, Cond::Ge));
        assert!(!eval_cond(FLAG_CF, Cond::A));
    }
}
