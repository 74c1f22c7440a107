//! NEWDECIMAL column decoding.
//!
//! MySQL packs decimals in base-10⁹ groups of four big-endian bytes, with
//! partial groups at either end compressed into the smallest byte width
//! that fits. The sign lives in the top bit of the first byte and a
//! negative value is stored with every byte complemented.

use crate::error::{Error, Result};

const DIGITS_PER_GROUP: usize = 9;
const GROUP_BYTES: usize = 4;

/// Byte width of a partial group holding `digits` decimal digits.
const COMPRESSED_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

/// Total byte width of a decimal with the given precision and scale.
pub fn binary_size(precision: usize, scale: usize) -> usize {
    let integral = precision - scale;
    (integral / DIGITS_PER_GROUP) * GROUP_BYTES
        + COMPRESSED_BYTES[integral % DIGITS_PER_GROUP]
        + (scale / DIGITS_PER_GROUP) * GROUP_BYTES
        + COMPRESSED_BYTES[scale % DIGITS_PER_GROUP]
}

/// Decode a decimal value. Returns the canonical textual form and the
/// number of bytes consumed.
///
/// The textual form is sign-preserving with exactly `scale` fractional
/// digits; a zero integral part renders as a single `0`.
pub fn decode_decimal(data: &[u8], precision: usize, scale: usize) -> Result<(String, usize)> {
    if precision == 0 || precision > 65 || scale > 30 || scale > precision {
        return Err(Error::decode(format!(
            "invalid decimal dimensions: precision {precision}, scale {scale}"
        )));
    }

    let integral = precision - scale;
    let int_groups = integral / DIGITS_PER_GROUP;
    let int_leftover = integral % DIGITS_PER_GROUP;
    let frac_groups = scale / DIGITS_PER_GROUP;
    let frac_leftover = scale % DIGITS_PER_GROUP;

    let size = binary_size(precision, scale);
    if data.len() < size {
        return Err(Error::decode(format!(
            "decimal truncated: need {size} bytes, have {}",
            data.len()
        )));
    }

    let mut bytes = data[..size].to_vec();
    // Sign bit is stored flipped; a clear top bit means negative, and a
    // negative value additionally has every byte complemented.
    let negative = bytes[0] & 0x80 == 0;
    bytes[0] ^= 0x80;
    if negative {
        for b in bytes.iter_mut() {
            *b = !*b;
        }
    }

    let mut pos = 0;
    let mut read_group = |width: usize| -> u32 {
        let mut v = 0u32;
        for &b in &bytes[pos..pos + width] {
            v = (v << 8) | b as u32;
        }
        pos += width;
        v
    };

    let mut out = String::with_capacity(precision + 2);
    if negative {
        out.push('-');
    }

    let mut int_part = String::new();
    let leftover = read_group(COMPRESSED_BYTES[int_leftover]);
    if leftover > 0 {
        int_part.push_str(&leftover.to_string());
    }
    for _ in 0..int_groups {
        let group = read_group(GROUP_BYTES);
        if int_part.is_empty() {
            if group > 0 {
                int_part.push_str(&group.to_string());
            }
        } else {
            int_part.push_str(&format!("{group:09}"));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }
    out.push_str(&int_part);

    if scale > 0 {
        out.push('.');
        for _ in 0..frac_groups {
            let group = read_group(GROUP_BYTES);
            out.push_str(&format!("{group:09}"));
        }
        if frac_leftover > 0 {
            let group = read_group(COMPRESSED_BYTES[frac_leftover]);
            out.push_str(&format!("{group:0width$}", width = frac_leftover));
        }
    }

    Ok((out, size))
}
