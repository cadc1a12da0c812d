//! Lenient reply scanning.
//!
//! Instrument replies are parsed the way the C drivers did it (`atoi`, `atof`,
//! `sscanf("%d,%lf")`): leading whitespace is skipped, the longest numeric prefix is
//! used, and a reply with no numeric prefix reads as zero. None of these fail.

fn numeric_prefix(s: &str, allow_fraction: bool) -> &str {
    let s = s.trim_start();
    let b = s.as_bytes();
    let mut i = 0;
    if matches!(b.first(), Some(b'+' | b'-')) {
        i += 1;
    }
    let int_start = i;
    while i < b.len() && b[i].is_ascii_digit() {
        i += 1;
    }
    let mut mantissa_digits = i - int_start;
    if allow_fraction {
        if i < b.len() && b[i] == b'.' {
            let frac_start = i + 1;
            let mut j = frac_start;
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
            mantissa_digits += j - frac_start;
            if mantissa_digits > 0 {
                i = j;
            }
        }
        if mantissa_digits > 0 && i < b.len() && matches!(b[i], b'e' | b'E') {
            let mut j = i + 1;
            if matches!(b.get(j), Some(b'+' | b'-')) {
                j += 1;
            }
            let exp_start = j;
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
            if j > exp_start {
                i = j;
            }
        }
    }
    if mantissa_digits == 0 {
        return "";
    }
    &s[..i]
}

/// `atoi`: leading integer, saturating at the `i64` range.
#[must_use]
pub fn leading_int(s: &str) -> i64 {
    let p = numeric_prefix(s, false);
    if p.is_empty() {
        return 0;
    }
    p.parse::<i64>().unwrap_or_else(|_| {
        if p.starts_with('-') {
            i64::MIN
        } else {
            i64::MAX
        }
    })
}

/// `atof`: leading decimal or exponent literal.
#[must_use]
pub fn leading_float(s: &str) -> f64 {
    let p = numeric_prefix(s, true);
    // "1." and ".5" are valid C literals and Rust accepts both
    p.parse::<f64>().unwrap_or(0.0)
}

/// A `'0'`/`'1'` string read MSB first: `"1010"` is `0b1010`.
///
/// Every character occupies a bit position; anything other than `'1'` is a zero.
/// Positions beyond bit 31 are dropped.
#[must_use]
pub fn bit_string(s: &str) -> u32 {
    let s = s.trim();
    let len = s.chars().count();
    s.chars().enumerate().fold(0u32, |acc, (i, c)| {
        let pos = len - 1 - i;
        if c == '1' && pos < 32 {
            acc | (1u32 << pos)
        } else {
            acc
        }
    })
}

/// `sscanf("%d,%lf")` on replies like `"1,+0.000001000000"`. Missing parts read as zero.
#[must_use]
pub fn int_float_pair(s: &str) -> (i64, f64) {
    let (first, rest) = s.split_once(',').unwrap_or((s, ""));
    (leading_int(first), leading_float(rest))
}
