//! Arithmetic and logic.
//!
//! Every operation is written once and parameterised by [`Width`]: the
//! width supplies the mask, the sign bit and the maximum value. Operands
//! are masked to the width on entry, results are masked on exit.

use crate::cpu::isa::Width;
use crate::cpu::registers::{Flag, Flags};

#[inline]
fn set_value_flags(flags: &mut Flags, width: Width, result: u32) {
    flags.set(Flag::Zero, result == 0);
    flags.set(Flag::Sign, width.is_negative(result));
}

/// Zero, Carry and Sign from the result; Overflow is always cleared.
#[inline]
fn set_arith_flags(flags: &mut Flags, width: Width, result: u32, carry: bool) {
    set_value_flags(flags, width, result);
    flags.set(Flag::Carry, carry);
    flags.set(Flag::Overflow, false);
}

pub fn add(flags: &mut Flags, width: Width, a: u32, b: u32) -> u32 {
    let wide = (a & width.mask()) as u64 + (b & width.mask()) as u64;
    let result = width.truncate(wide);
    set_arith_flags(flags, width, result, wide > width.mask() as u64);
    result
}

pub fn sub(flags: &mut Flags, width: Width, a: u32, b: u32) -> u32 {
    let (a, b) = (a & width.mask(), b & width.mask());
    let result = a.wrapping_sub(b) & width.mask();
    set_arith_flags(flags, width, result, a < b);
    result
}

pub fn mul(flags: &mut Flags, width: Width, a: u32, b: u32) -> u32 {
    let wide = (a & width.mask()) as u64 * (b & width.mask()) as u64;
    let result = width.truncate(wide);
    set_arith_flags(flags, width, result, wide > width.mask() as u64);
    result
}

/// Unsigned division. A zero divisor saturates to all-ones and sets Carry.
pub fn div(flags: &mut Flags, width: Width, a: u32, b: u32) -> u32 {
    div_rem(flags, width, a, b).0
}

/// Unsigned division with remainder. A zero divisor gives an all-ones
/// quotient, a zero remainder and Carry.
pub fn div_rem(flags: &mut Flags, width: Width, a: u32, b: u32) -> (u32, u32) {
    let (a, b) = (a & width.mask(), b & width.mask());
    let (quotient, remainder, carry) = match b {
        0 => (width.mask(), 0, true),
        _ => (a / b, a % b, false),
    };
    set_arith_flags(flags, width, quotient, carry);
    (quotient, remainder)
}

/// Signed (truncating) division with remainder.
///
/// Returns `None` for a zero divisor without touching the flags; the caller
/// reports the error. `MIN / -1` wraps.
pub fn sdiv_rem(flags: &mut Flags, width: Width, a: u32, b: u32) -> Option<(u32, u32)> {
    let divisor = width.sign_extend(b);
    if divisor == 0 {
        return None;
    }
    let dividend = width.sign_extend(a);
    let quotient = dividend.wrapping_div(divisor) as u32 & width.mask();
    let remainder = dividend.wrapping_rem(divisor) as u32 & width.mask();
    set_arith_flags(flags, width, quotient, false);
    Some((quotient, remainder))
}

/// Set all eight flags from `a - b` without producing a result.
pub fn compare(flags: &mut Flags, width: Width, a: u32, b: u32) {
    let (a, b) = (a & width.mask(), b & width.mask());
    let diff = a.wrapping_sub(b) & width.mask();
    let sign = width.sign_bit();

    flags.set(Flag::Zero, a == b);
    flags.set(Flag::Carry, a < b);
    flags.set(Flag::Sign, diff & sign != 0);
    flags.set(Flag::Overflow, false);
    // PO is the negation of signed overflow on a - b, kept in this form.
    flags.set(Flag::Parity, !((a ^ b) & sign != 0) || ((a ^ diff) & sign == 0));
    flags.set(Flag::Equal, a == b);
    flags.set(Flag::Greater, a > b);
    flags.set(Flag::Less, a < b);
}

/// Float compare with IEEE ordering. Overflow and PO are always cleared;
/// any comparison involving NaN is false.
pub fn compare_float(flags: &mut Flags, a: f32, b: f32) {
    flags.set(Flag::Zero, a == b);
    flags.set(Flag::Carry, a < b);
    flags.set(Flag::Sign, a - b < 0.0);
    flags.set(Flag::Overflow, false);
    flags.set(Flag::Parity, false);
    flags.set(Flag::Equal, a == b);
    flags.set(Flag::Greater, a > b);
    flags.set(Flag::Less, a < b);
}

#[inline]
pub fn nand(width: Width, a: u32, b: u32) -> u32 {
    !(a & b) & width.mask()
}

#[inline]
pub fn xnor(width: Width, a: u32, b: u32) -> u32 {
    !(a ^ b) & width.mask()
}

#[inline]
pub fn imply(width: Width, a: u32, b: u32) -> u32 {
    (!a | b) & width.mask()
}

/// Round to nearest and clamp into `0..=width.mask()`.
/// Returns the value and whether it had to be clamped. NaN clamps to 0.
fn saturate(width: Width, value: f32) -> (u32, bool) {
    let rounded = value.round() as f64;
    if rounded.is_nan() {
        (0, true)
    } else if rounded < 0.0 {
        (0, true)
    } else if rounded > width.mask() as f64 {
        (width.mask(), true)
    } else {
        (rounded as u32, false)
    }
}

/// Narrowing float load: store the rounded value, or the nearest bound with
/// Overflow set when it does not fit. No other flag changes.
pub fn float_to_int(flags: &mut Flags, width: Width, value: f32) -> u32 {
    let (result, clamped) = saturate(width, value);
    flags.set(Flag::Overflow, clamped);
    result
}

/// `r += f` / `r -= f` with an integer destination.
///
/// The magnitude of `f` is rounded and saturated to the width; whether it is
/// added or subtracted depends on the operation and the sign of `f`. The
/// integer result saturates at `0` and `width.mask()` instead of wrapping,
/// and Overflow reports any saturation.
pub fn add_float(flags: &mut Flags, width: Width, a: u32, value: f32, subtract: bool) -> u32 {
    let a = a & width.mask();
    let magnitude = if value.is_nan() { 0.0 } else { value.abs() };
    let (amount, clamped) = saturate(width, magnitude);
    let adding = (value >= 0.0 || value.is_nan()) != subtract;

    let (result, saturated) = if adding {
        let sum = a as u64 + amount as u64;
        if sum > width.mask() as u64 {
            (width.mask(), true)
        } else {
            (sum as u32, false)
        }
    } else if amount > a {
        (0, true)
    } else {
        (a - amount, false)
    };

    set_value_flags(flags, width, result);
    flags.set(Flag::Carry, false);
    flags.set(Flag::Overflow, clamped || saturated);
    result
}
