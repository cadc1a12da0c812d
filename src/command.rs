use serde::{Deserialize, Serialize};

use crate::template::Template;

/// How a reply is turned into a value. Names match the `read_kind` strings used in
/// command-table TOML files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadKind {
    /// No conversion; reads yield zero or an empty string.
    #[default]
    Sink,
    /// Decimal integer (`atoi`).
    Int,
    /// `'0'`/`'1'` string, most significant bit first.
    Bits,
    /// Decimal or exponent float (`atof`).
    Float,
    /// Reply copied verbatim.
    Text,
    /// The identity string cached at start-up.
    Ident,
    /// Numeric device error code translated through the table's status list.
    StatusText,
    /// The code remembered by the last `status_text` read. Never touches the link.
    StatusCode,
    /// Reference output of a `"ref,delay"` reply.
    ChannelRef,
    /// Delay of a `"ref,delay"` reply.
    ChannelDelay,
    /// Gauge reading `"status,value"`: yields the value and remembers the status
    /// for `status_code` reads.
    Measured,
}

/// How a value is sent to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    /// Writes are accepted and dropped.
    #[default]
    Sink,
    Int,
    Float,
    Text,
    /// Fixed command; the value is ignored.
    CommandOnly,
    /// Replace the reference of a `"ref,delay"` pair, keeping the delay.
    ChannelRef,
    /// Replace the delay of a `"ref,delay"` pair, keeping the reference.
    ChannelDelay,
}

impl ReadKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sink => "sink",
            Self::Int => "int",
            Self::Bits => "bits",
            Self::Float => "float",
            Self::Text => "text",
            Self::Ident => "ident",
            Self::StatusText => "status_text",
            Self::StatusCode => "status_code",
            Self::ChannelRef => "channel_ref",
            Self::ChannelDelay => "channel_delay",
            Self::Measured => "measured",
        }
    }

    /// Kinds that produce a value without a request on the link.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Sink | Self::StatusCode)
    }
}

impl WriteKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sink => "sink",
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::CommandOnly => "command_only",
            Self::ChannelRef => "channel_ref",
            Self::ChannelDelay => "channel_delay",
        }
    }

    /// Number of template slots this kind fills.
    #[must_use]
    pub const fn slots(&self) -> usize {
        match self {
            Self::Sink | Self::CommandOnly => 0,
            Self::Int | Self::Float | Self::Text => 1,
            Self::ChannelRef | Self::ChannelDelay => 2,
        }
    }

    /// Kinds that read the current `"ref,delay"` pair before writing.
    #[must_use]
    pub const fn needs_current_pair(&self) -> bool {
        matches!(self, Self::ChannelRef | Self::ChannelDelay)
    }
}

/// How the device acknowledges a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Acknowledge {
    /// Write-then-read; the reply must be `OK` (any case).
    #[default]
    Ok,
    /// Write only; nothing is read back.
    None,
    /// Every request is answered with `<ACK>` (or `<NAK>`), after which a bare
    /// `<ENQ>` fetches the data line (Pfeiffer gauge controllers).
    Enquiry,
}

/// One entry of a command table. Immutable once the table is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub channel_id: i32,
    /// Physical output index on the instrument (delay channel, output pair); informational.
    pub output: u32,
    pub read_request: Option<String>,
    pub read_kind: ReadKind,
    pub write_template: Option<Template>,
    pub write_kind: WriteKind,
    pub description: String,
}

impl CommandDescriptor {
    /// True when a read produces its value without touching the link.
    #[must_use]
    pub fn is_read_sink(&self) -> bool {
        self.read_request.is_none()
    }

    #[must_use]
    pub fn is_write_sink(&self) -> bool {
        self.write_kind == WriteKind::Sink
    }
}
