// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Interpretation of numeric literal text.
//!
//! The lexer hands numeric literals through as written; the meaning depends
//! on the expecting instruction. Integer literals accept both the signed and
//! unsigned range of their width and produce bit patterns. Float literals
//! cover decimal and hexadecimal forms plus the symbolic `inf`, `nan`, and
//! `nan:0x…` forms (which arrive as keywords).

// Splits an optional sign off a literal.
fn split_sign(text: &str) -> (bool, &str) {
    match text.as_bytes().first() {
        Some(b'+') => (false, &text[1..]),
        Some(b'-') => (true, &text[1..]),
        _ => (false, text),
    }
}

// Parses a digit string (underscore separators allowed) in the given radix.
// Saturates at u128::MAX, which is far outside any accepted range.
fn parse_digits(text: &str, radix: u32) -> Option<u128> {
    let mut value: u128 = 0;
    let mut any = false;
    for c in text.chars() {
        if c == '_' {
            continue;
        }
        let digit = c.to_digit(radix)?;
        any = true;
        value = value
            .saturating_mul(u128::from(radix))
            .saturating_add(u128::from(digit));
    }
    any.then_some(value)
}

// Parses an integer literal into (negative, magnitude).
fn parse_int(text: &str) -> Option<(bool, u128)> {
    let (negative, text) = split_sign(text);
    let magnitude = match text.strip_prefix("0x") {
        Some(hex) => parse_digits(hex, 16)?,
        None => parse_digits(text, 10)?,
    };
    Some((negative, magnitude))
}

/// An unsigned index or count.
pub(super) fn parse_u32(text: &str) -> Option<u32> {
    match parse_int(text)? {
        (false, magnitude) => u32::try_from(magnitude).ok(),
        (true, _) => None,
    }
}

/// An `i32` immediate: anything in `[-2^31, 2^32)`, as a bit pattern.
pub(super) fn parse_i32(text: &str) -> Option<u32> {
    let (negative, magnitude) = parse_int(text)?;
    if negative {
        (magnitude <= 1 << 31).then(|| (magnitude as u32).wrapping_neg())
    } else {
        u32::try_from(magnitude).ok()
    }
}

/// An `i64` immediate: anything in `[-2^63, 2^64)`, as a bit pattern.
pub(super) fn parse_i64(text: &str) -> Option<u64> {
    let (negative, magnitude) = parse_int(text)?;
    if negative {
        (magnitude <= 1 << 63).then(|| (magnitude as u64).wrapping_neg())
    } else {
        u64::try_from(magnitude).ok()
    }
}

// Float parsing is generic over the two widths via a handful of constants.
trait FloatBits: Copy {
    const EXPONENT_MASK: u64;
    const SIGN_MASK: u64;
    const SIGNIFICAND_BITS: u32;
    const CANONICAL_NAN: u64;

    fn from_parts(mantissa: u128, exponent: i32) -> u64;
    fn from_decimal(text: &str) -> Option<u64>;
    fn infinity() -> u64;
}

impl FloatBits for f32 {
    const EXPONENT_MASK: u64 = 0x7f80_0000;
    const SIGN_MASK: u64 = 0x8000_0000;
    const SIGNIFICAND_BITS: u32 = 23;
    const CANONICAL_NAN: u64 = crate::num::CANONICAL_NAN_32 as u64;

    fn from_parts(mantissa: u128, exponent: i32) -> u64 {
        // Converting the mantissa rounds once; scaling by a power of two is
        // exact.
        let value = (mantissa as f32) * (exponent as f32).exp2();
        u64::from(value.to_bits())
    }

    fn from_decimal(text: &str) -> Option<u64> {
        text.parse::<f32>().ok().map(|v| u64::from(v.to_bits()))
    }

    fn infinity() -> u64 {
        u64::from(f32::INFINITY.to_bits())
    }
}

impl FloatBits for f64 {
    const EXPONENT_MASK: u64 = 0x7ff0_0000_0000_0000;
    const SIGN_MASK: u64 = 0x8000_0000_0000_0000;
    const SIGNIFICAND_BITS: u32 = 52;
    const CANONICAL_NAN: u64 = crate::num::CANONICAL_NAN_64;

    fn from_parts(mantissa: u128, exponent: i32) -> u64 {
        let value = (mantissa as f64) * (f64::from(exponent)).exp2();
        value.to_bits()
    }

    fn from_decimal(text: &str) -> Option<u64> {
        text.parse::<f64>().ok().map(f64::to_bits)
    }

    fn infinity() -> u64 {
        f64::INFINITY.to_bits()
    }
}

// Parses a hexadecimal float body (no sign, no 0x prefix):
// hexdigits ['.' hexdigits?] [('p'|'P') [sign] decdigits]
fn parse_hex_float<F: FloatBits>(text: &str) -> Option<u64> {
    let (body, exp) = match text.find(['p', 'P']) {
        Some(split) => {
            let exp_text = &text[split + 1..];
            let (negative, digits) = split_sign(exp_text);
            let exp = i32::try_from(parse_digits(digits, 10)?).ok()?;
            (&text[..split], if negative { -exp } else { exp })
        }
        None => (text, 0),
    };

    let (int_part, frac_part) = match body.find('.') {
        Some(split) => (&body[..split], &body[split + 1..]),
        None => (body, ""),
    };

    let mut mantissa: u128 = 0;
    let mut seen_digit = false;
    let mut extra_int_digits: i32 = 0;
    for c in int_part.chars() {
        if c == '_' {
            continue;
        }
        let digit = c.to_digit(16)?;
        seen_digit = true;
        if mantissa >> 120 != 0 {
            // Mantissa is saturated; account for magnitude only. Far beyond
            // f64 precision anyway.
            extra_int_digits += 1;
        } else {
            mantissa = (mantissa << 4) | u128::from(digit);
        }
    }
    let mut frac_digits: i32 = 0;
    for c in frac_part.chars() {
        if c == '_' {
            continue;
        }
        let digit = c.to_digit(16)?;
        seen_digit = true;
        if mantissa >> 120 == 0 {
            mantissa = (mantissa << 4) | u128::from(digit);
            frac_digits += 1;
        }
    }
    if !seen_digit {
        return None;
    }

    let exponent = exp + 4 * (extra_int_digits - frac_digits);
    Some(F::from_parts(mantissa, exponent))
}

fn parse_float<F: FloatBits>(text: &str) -> Option<u64> {
    let (negative, body) = split_sign(text);
    let bits = match body {
        "inf" => F::infinity(),
        "nan" => F::CANONICAL_NAN,
        _ => {
            if let Some(payload_text) = body.strip_prefix("nan:0x") {
                let payload = parse_digits(payload_text, 16)?;
                let payload = u64::try_from(payload).ok()?;
                if payload == 0 || payload >> F::SIGNIFICAND_BITS != 0 {
                    return None;
                }
                F::EXPONENT_MASK | payload
            } else if let Some(hex) = body.strip_prefix("0x") {
                parse_hex_float::<F>(hex)?
            } else {
                // Rust's float grammar covers the decimal forms except for a
                // dot directly before the exponent or at the end. It also
                // accepts spellings like "NaN" that the text format does not,
                // so require a leading digit.
                if !body.starts_with(|c: char| c.is_ascii_digit()) {
                    return None;
                }
                let normalized: String = body.replace('_', "");
                let normalized = normalized
                    .strip_suffix('.')
                    .map_or_else(|| normalized.replace(".e", "e").replace(".E", "E"), str::to_string);
                F::from_decimal(&normalized)?
            }
        }
    };
    Some(if negative { bits | F::SIGN_MASK } else { bits })
}

/// An `f32` immediate, as a bit pattern.
pub(super) fn parse_f32(text: &str) -> Option<u32> {
    parse_float::<f32>(text).map(|bits| bits as u32)
}

/// An `f64` immediate, as a bit pattern.
pub(super) fn parse_f64(text: &str) -> Option<u64> {
    parse_float::<f64>(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers() {
        assert_eq!(parse_u32("42"), Some(42));
        assert_eq!(parse_u32("0x2a"), Some(42));
        assert_eq!(parse_u32("4_2"), Some(42));
        assert_eq!(parse_u32("-1"), None);
        assert_eq!(parse_u32("4294967295"), Some(u32::MAX));
        assert_eq!(parse_u32("4294967296"), None);
    }

    #[test]
    fn i32_signed_and_unsigned_ranges() {
        assert_eq!(parse_i32("-1"), Some(u32::MAX));
        assert_eq!(parse_i32("-2147483648"), Some(0x8000_0000));
        assert_eq!(parse_i32("-2147483649"), None);
        assert_eq!(parse_i32("4294967295"), Some(u32::MAX));
        assert_eq!(parse_i32("4294967296"), None);
        assert_eq!(parse_i32("+17"), Some(17));
        assert_eq!(parse_i32("0xffff_ffff"), Some(u32::MAX));
    }

    #[test]
    fn i64_ranges() {
        assert_eq!(parse_i64("-9223372036854775808"), Some(0x8000_0000_0000_0000));
        assert_eq!(parse_i64("18446744073709551615"), Some(u64::MAX));
        assert_eq!(parse_i64("18446744073709551616"), None);
    }

    #[test]
    fn decimal_floats() {
        assert_eq!(parse_f32("1.5"), Some(1.5f32.to_bits()));
        assert_eq!(parse_f32("-2.5e3"), Some((-2500.0f32).to_bits()));
        assert_eq!(parse_f32("4."), Some(4.0f32.to_bits()));
        assert_eq!(parse_f64("1e1"), Some(10.0f64.to_bits()));
        assert_eq!(parse_f64("0.1"), Some(0.1f64.to_bits()));
    }

    #[test]
    fn hex_floats() {
        assert_eq!(parse_f32("0x1p0"), Some(1.0f32.to_bits()));
        assert_eq!(parse_f32("0x1.8p1"), Some(3.0f32.to_bits()));
        assert_eq!(parse_f64("0x1p-1"), Some(0.5f64.to_bits()));
        assert_eq!(parse_f64("0xff"), Some(255.0f64.to_bits()));
        assert_eq!(parse_f64("0x1p1023"), Some((2.0f64).powi(1023).to_bits()));
    }

    #[test]
    fn symbolic_floats() {
        assert_eq!(parse_f32("inf"), Some(f32::INFINITY.to_bits()));
        assert_eq!(parse_f32("-inf"), Some(f32::NEG_INFINITY.to_bits()));
        assert_eq!(parse_f32("nan"), Some(crate::num::CANONICAL_NAN_32));
        assert_eq!(parse_f32("nan:0x1"), Some(0x7f80_0001));
        assert_eq!(parse_f32("-nan:0x1"), Some(0xff80_0001));
        assert_eq!(parse_f32("nan:0x0"), None);
        assert_eq!(
            parse_f64("nan"),
            Some(crate::num::CANONICAL_NAN_64)
        );
    }
}
