//! Reply decoding and write rendering.
//!
//! A reply is decoded once, according to the descriptor's [`ReadKind`], into a
//! [`Reading`]. The caller's requested representation is then produced through
//! [`FromReading`], so every (kind, representation) pair is an exhaustive match
//! instead of a per-descriptor function slot.

use crate::command::{CommandDescriptor, ReadKind, WriteKind};
use crate::command_table::CommandTable;
use crate::error::MuxError;
use crate::scan;
use crate::template::Arg;

/// Text returned by a `status_text` read when the code is not in the status list.
pub const UNKNOWN_STATUS_TEXT: &str = "*ERR*";

/// A decoded reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// Sink reads: zero or empty in every representation.
    Empty,
    Int(i64),
    Bits(u32),
    Float(f64),
    Text(String),
    /// `"ref,delay"` pair, as returned by delay-channel queries.
    Pair { reference: i64, delay: f64 },
}

/// A value supplied by a caller for a write.
#[derive(Debug, Clone, PartialEq)]
pub enum Setting {
    Int(i64),
    Bits(u32),
    Float(f64),
    Text(String),
}

impl Setting {
    fn as_arg(&self) -> Arg<'_> {
        match self {
            Self::Int(v) => Arg::Int(*v),
            Self::Bits(v) => Arg::Int(i64::from(*v)),
            Self::Float(v) => Arg::Float(*v),
            Self::Text(s) => Arg::Text(s),
        }
    }
}

/// Port-side state a decode may read or update.
pub(crate) struct DecodeContext<'a> {
    pub table: &'a CommandTable,
    pub identity: &'a str,
    pub last_status: &'a mut i64,
}

/// Decode `reply` for a descriptor of kind `kind`.
pub(crate) fn decode(kind: ReadKind, reply: &str, ctx: &mut DecodeContext<'_>) -> Reading {
    match kind {
        ReadKind::Sink => Reading::Empty,
        ReadKind::Int => Reading::Int(scan::leading_int(reply)),
        ReadKind::Bits => Reading::Bits(scan::bit_string(reply)),
        ReadKind::Float => Reading::Float(scan::leading_float(reply)),
        ReadKind::Text => Reading::Text(reply.to_string()),
        ReadKind::Ident => Reading::Text(ctx.identity.to_string()),
        ReadKind::StatusText => {
            let code = scan::leading_int(reply);
            match ctx.table.status_message(code) {
                Some(msg) => {
                    *ctx.last_status = code;
                    Reading::Text(msg.to_string())
                }
                None => {
                    *ctx.last_status = 0;
                    Reading::Text(UNKNOWN_STATUS_TEXT.to_string())
                }
            }
        }
        ReadKind::StatusCode => Reading::Int(*ctx.last_status),
        ReadKind::ChannelRef => Reading::Int(scan::int_float_pair(reply).0),
        ReadKind::ChannelDelay => {
            let (reference, delay) = scan::int_float_pair(reply);
            Reading::Pair { reference, delay }
        }
        ReadKind::Measured => {
            let (status, value) = scan::int_float_pair(reply);
            *ctx.last_status = status;
            Reading::Float(value)
        }
    }
}

/// Render the request for a write. `current` is the `"ref,delay"` pair read just
/// before, required by the pair-editing kinds.
pub(crate) fn render_write(
    desc: &CommandDescriptor,
    value: &Setting,
    current: Option<(i64, f64)>,
) -> Result<String, MuxError> {
    let Some(template) = desc.write_template.as_ref() else {
        return Err(MuxError::Definition(format!(
            "command {} has no write template",
            desc.channel_id
        )));
    };
    let pair = || {
        current.ok_or_else(|| {
            MuxError::InvalidValue(format!(
                "command {} needs the current reference/delay pair",
                desc.channel_id
            ))
        })
    };
    match desc.write_kind {
        WriteKind::Sink | WriteKind::CommandOnly => template.render(&[]),
        WriteKind::Int | WriteKind::Float | WriteKind::Text => template.render(&[value.as_arg()]),
        WriteKind::ChannelRef => {
            let (_, delay) = pair()?;
            template.render(&[value.as_arg(), Arg::Float(delay)])
        }
        WriteKind::ChannelDelay => {
            let (reference, _) = pair()?;
            template.render(&[Arg::Int(reference), value.as_arg()])
        }
    }
}

/// Conversion from a decoded reply into a caller's representation.
pub trait FromReading: Sized {
    fn from_reading(reading: &Reading, table: &CommandTable) -> Self;
}

impl FromReading for i32 {
    fn from_reading(reading: &Reading, _table: &CommandTable) -> Self {
        let wide = match reading {
            Reading::Empty => 0,
            Reading::Int(v) => *v,
            Reading::Bits(v) => i64::from(*v),
            Reading::Float(v) => v.trunc() as i64,
            Reading::Text(s) => scan::leading_int(s),
            Reading::Pair { reference, .. } => *reference,
        };
        wide.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
    }
}

impl FromReading for u32 {
    fn from_reading(reading: &Reading, _table: &CommandTable) -> Self {
        match reading {
            Reading::Empty => 0,
            // stored into an unsigned 32-bit field, as atoi did
            Reading::Int(v) | Reading::Pair { reference: v, .. } => *v as u32,
            Reading::Bits(v) => *v,
            Reading::Float(v) => *v as u32,
            Reading::Text(s) => scan::leading_int(s) as u32,
        }
    }
}

impl FromReading for f64 {
    fn from_reading(reading: &Reading, _table: &CommandTable) -> Self {
        match reading {
            Reading::Empty => 0.0,
            Reading::Int(v) => *v as f64,
            Reading::Bits(v) => f64::from(*v),
            Reading::Float(v) => *v,
            Reading::Text(s) => scan::leading_float(s),
            Reading::Pair { delay, .. } => *delay,
        }
    }
}

impl FromReading for String {
    fn from_reading(reading: &Reading, table: &CommandTable) -> Self {
        match reading {
            Reading::Empty => Self::new(),
            Reading::Int(v) => v.to_string(),
            Reading::Bits(v) => v.to_string(),
            Reading::Float(v) => v.to_string(),
            Reading::Text(s) => s.clone(),
            Reading::Pair { reference, delay } => {
                format!("{} + {delay:.12}", table.reference_name(*reference))
            }
        }
    }
}

/// Cut `s` to at most `max` bytes without splitting a character.
#[must_use]
pub fn truncate_text(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}
