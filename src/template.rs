//! printf-style request templates.
//!
//! Instrument command tables are written with C conversion specs (`"set:rate %4.4d"`,
//! `"DLAY 2,%d,%e"`) and the devices expect the exact text a C `sprintf` would
//! produce, so rendering follows C semantics rather than Rust's `format!` rules:
//! integer precision means minimum digits, `%e` always has a signed two-digit
//! exponent, and the `0` flag pads after the sign.

use std::fmt;

use crate::error::MuxError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Flags {
    left: bool,
    plus: bool,
    space: bool,
    zero: bool,
    alt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConvKind {
    Signed,
    Unsigned,
    Hex { upper: bool },
    Fixed { upper: bool },
    Exp { upper: bool },
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Conversion {
    flags: Flags,
    width: Option<usize>,
    precision: Option<usize>,
    kind: ConvKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Slot(Conversion),
}

/// One argument substituted into a template slot. Mismatched kinds are coerced
/// the way an instrument operator would expect (a float in a `%d` slot is truncated,
/// a number in a `%s` slot is printed).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg<'a> {
    Int(i64),
    Float(f64),
    Text(&'a str),
}

/// A parsed request template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    pieces: Vec<Piece>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, MuxError> {
        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            if chars.peek() == Some(&'%') {
                chars.next();
                literal.push('%');
                continue;
            }

            let mut flags = Flags::default();
            while let Some(&f) = chars.peek() {
                match f {
                    '-' => flags.left = true,
                    '+' => flags.plus = true,
                    ' ' => flags.space = true,
                    '0' => flags.zero = true,
                    '#' => flags.alt = true,
                    _ => break,
                }
                chars.next();
            }
            let width = take_number(&mut chars);
            let precision = if chars.peek() == Some(&'.') {
                chars.next();
                Some(take_number(&mut chars).unwrap_or(0))
            } else {
                None
            };
            // length modifiers carry no meaning once values are 64-bit
            while matches!(chars.peek(), Some('l' | 'h' | 'L' | 'z')) {
                chars.next();
            }
            let kind = match chars.next() {
                Some('d' | 'i') => ConvKind::Signed,
                Some('u') => ConvKind::Unsigned,
                Some('x') => ConvKind::Hex { upper: false },
                Some('X') => ConvKind::Hex { upper: true },
                Some('f') => ConvKind::Fixed { upper: false },
                Some('F') => ConvKind::Fixed { upper: true },
                Some('e') => ConvKind::Exp { upper: false },
                Some('E') => ConvKind::Exp { upper: true },
                Some('s') => ConvKind::Text,
                Some(other) => {
                    return Err(MuxError::Definition(format!(
                        "template {source:?}: unsupported conversion %{other}"
                    )))
                }
                None => {
                    return Err(MuxError::Definition(format!(
                        "template {source:?}: dangling %"
                    )))
                }
            };
            if !literal.is_empty() {
                pieces.push(Piece::Literal(std::mem::take(&mut literal)));
            }
            pieces.push(Piece::Slot(Conversion {
                flags,
                width,
                precision,
                kind,
            }));
        }
        if !literal.is_empty() {
            pieces.push(Piece::Literal(literal));
        }
        Ok(Self {
            source: source.to_string(),
            pieces,
        })
    }

    /// Number of substitution slots.
    #[must_use]
    pub fn slots(&self) -> usize {
        self.pieces
            .iter()
            .filter(|p| matches!(p, Piece::Slot(_)))
            .count()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Literal text before the first slot, e.g. `"set:rate "` for `"set:rate %4.4d"`.
    #[must_use]
    pub fn prefix(&self) -> &str {
        match self.pieces.first() {
            Some(Piece::Literal(s)) => s,
            _ => "",
        }
    }

    pub fn render(&self, args: &[Arg<'_>]) -> Result<String, MuxError> {
        if args.len() != self.slots() {
            return Err(MuxError::InvalidValue(format!(
                "template {:?} takes {} value(s), got {}",
                self.source,
                self.slots(),
                args.len()
            )));
        }
        let mut out = String::new();
        let mut args = args.iter();
        for piece in &self.pieces {
            match piece {
                Piece::Literal(s) => out.push_str(s),
                Piece::Slot(conv) => {
                    // counted above
                    if let Some(arg) = args.next() {
                        out.push_str(&conv.render(*arg));
                    }
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<usize> {
    let mut n: Option<usize> = None;
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        chars.next();
        n = Some(n.unwrap_or(0).saturating_mul(10).saturating_add(d as usize));
    }
    n
}

impl Arg<'_> {
    fn as_i64(self) -> i64 {
        match self {
            Arg::Int(v) => v,
            // `as` saturates and maps NaN to 0
            Arg::Float(v) => v.trunc() as i64,
            Arg::Text(s) => crate::scan::leading_int(s),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Arg::Int(v) => v as f64,
            Arg::Float(v) => v,
            Arg::Text(s) => crate::scan::leading_float(s),
        }
    }
}

impl Conversion {
    fn render(&self, arg: Arg<'_>) -> String {
        match self.kind {
            ConvKind::Signed => {
                let v = arg.as_i64();
                let digits = self.int_digits(v.unsigned_abs().to_string(), v == 0);
                self.pad(self.sign(v < 0), &digits, self.precision.is_none())
            }
            ConvKind::Unsigned => {
                let v = arg.as_i64() as u64;
                let digits = self.int_digits(v.to_string(), v == 0);
                self.pad("", &digits, self.precision.is_none())
            }
            ConvKind::Hex { upper } => {
                let v = arg.as_i64() as u64;
                let raw = if upper { format!("{v:X}") } else { format!("{v:x}") };
                let digits = self.int_digits(raw, v == 0);
                let prefix = match (self.flags.alt && v != 0, upper) {
                    (true, false) => "0x",
                    (true, true) => "0X",
                    (false, _) => "",
                };
                self.pad(prefix, &digits, self.precision.is_none())
            }
            ConvKind::Fixed { upper } => {
                let v = arg.as_f64();
                if !v.is_finite() {
                    return self.non_finite(v, upper);
                }
                let p = self.precision.unwrap_or(6);
                let mut digits = format!("{:.*}", p, v.abs());
                if self.flags.alt && p == 0 {
                    digits.push('.');
                }
                self.pad(self.sign(v.is_sign_negative()), &digits, true)
            }
            ConvKind::Exp { upper } => {
                let v = arg.as_f64();
                if !v.is_finite() {
                    return self.non_finite(v, upper);
                }
                let p = self.precision.unwrap_or(6);
                let digits = c_exponent(v.abs(), p, self.flags.alt, upper);
                self.pad(self.sign(v.is_sign_negative()), &digits, true)
            }
            ConvKind::Text => {
                let s = match arg {
                    Arg::Text(s) => s.to_string(),
                    Arg::Int(v) => v.to_string(),
                    Arg::Float(v) => v.to_string(),
                };
                let s: String = match self.precision {
                    Some(p) => s.chars().take(p).collect(),
                    None => s,
                };
                self.pad("", &s, false)
            }
        }
    }

    fn sign(&self, negative: bool) -> &'static str {
        if negative {
            "-"
        } else if self.flags.plus {
            "+"
        } else if self.flags.space {
            " "
        } else {
            ""
        }
    }

    // integer precision is a minimum digit count; "%.0d" of zero prints nothing
    fn int_digits(&self, raw: String, is_zero: bool) -> String {
        match self.precision {
            Some(0) if is_zero => String::new(),
            Some(p) if raw.len() < p => format!("{}{raw}", "0".repeat(p - raw.len())),
            _ => raw,
        }
    }

    fn non_finite(&self, v: f64, upper: bool) -> String {
        let body = match (v.is_nan(), upper) {
            (true, false) => "nan",
            (true, true) => "NAN",
            (false, false) => "inf",
            (false, true) => "INF",
        };
        self.pad(self.sign(v.is_sign_negative() && !v.is_nan()), body, false)
    }

    fn pad(&self, sign: &str, body: &str, zero_allowed: bool) -> String {
        let len = sign.chars().count() + body.chars().count();
        let width = self.width.unwrap_or(0);
        if width <= len {
            return format!("{sign}{body}");
        }
        let fill = width - len;
        if self.flags.left {
            format!("{sign}{body}{}", " ".repeat(fill))
        } else if self.flags.zero && zero_allowed {
            format!("{sign}{}{body}", "0".repeat(fill))
        } else {
            format!("{}{sign}{body}", " ".repeat(fill))
        }
    }
}

/// `d.ddddde±XX` as printed by C for a non-negative finite value.
fn c_exponent(v: f64, precision: usize, alt: bool, upper: bool) -> String {
    let rust = format!("{:.*e}", precision, v);
    let (mantissa, exp) = rust.split_once('e').unwrap_or((rust.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let mut mantissa = mantissa.to_string();
    if alt && precision == 0 {
        mantissa.push('.');
    }
    let e = if upper { 'E' } else { 'e' };
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{mantissa}{e}{sign}{:02}", exp.unsigned_abs())
}
