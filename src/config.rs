use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::command_table::InstrumentInfo;
use crate::error::MuxError;
use crate::toml_helpers::describe_toml_error;

/// Default reply buffer size in bytes.
pub const DEFAULT_REPLY_CAPACITY: usize = 100;
/// Settling time applied after every exchange, successful or not.
pub const DEFAULT_TURNAROUND_MS: u64 = 100;
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;

/// Per-link settings. Every field has a default so partial TOML files and
/// sparse environments both work.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Timeout for one write-then-read exchange.
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Fixed inter-transaction delay.
    pub turnaround_ms: u64,
    /// Maximum reply length; longer replies are cut and reported with `EomReason::Count`.
    pub reply_capacity: usize,
    pub output_eos: String,
    pub input_eos: String,
    pub log_payloads: bool,
    pub dump_on_error: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            turnaround_ms: DEFAULT_TURNAROUND_MS,
            reply_capacity: DEFAULT_REPLY_CAPACITY,
            output_eos: "\n".to_string(),
            input_eos: "\r\n".to_string(),
            log_payloads: false,
            dump_on_error: true,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v == "1").unwrap_or(default)
}

// "\r\n" written literally in an environment variable
fn unescape_eos(s: &str) -> String {
    s.replace("\\r", "\r").replace("\\n", "\n")
}

impl LinkConfig {
    /// Build a config from `INSTMUX_*` environment variables, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            timeout_ms: env_or("INSTMUX_TIMEOUT_MS", d.timeout_ms),
            connect_timeout_ms: env_or("INSTMUX_CONNECT_TIMEOUT_MS", d.connect_timeout_ms),
            turnaround_ms: env_or("INSTMUX_TURNAROUND_MS", d.turnaround_ms),
            reply_capacity: env_or("INSTMUX_REPLY_CAPACITY", d.reply_capacity),
            output_eos: std::env::var("INSTMUX_OUTPUT_EOS")
                .map(|s| unescape_eos(&s))
                .unwrap_or(d.output_eos),
            input_eos: std::env::var("INSTMUX_INPUT_EOS")
                .map(|s| unescape_eos(&s))
                .unwrap_or(d.input_eos),
            log_payloads: env_flag("INSTMUX_LOG_PAYLOADS", d.log_payloads),
            dump_on_error: env_flag("INSTMUX_DUMP_ON_ERROR", d.dump_on_error),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, MuxError> {
        toml::from_str(s).map_err(|e| MuxError::Definition(describe_toml_error("link config", s, &e)))
    }

    pub fn from_path(path: &Path) -> Result<Self, MuxError> {
        let s = fs::read_to_string(path)
            .map_err(|e| MuxError::Definition(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&s)
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }
    #[must_use]
    pub const fn with_turnaround(mut self, turnaround: Duration) -> Self {
        self.turnaround_ms = turnaround.as_millis() as u64;
        self
    }
    #[must_use]
    pub const fn with_reply_capacity(mut self, capacity: usize) -> Self {
        self.reply_capacity = capacity;
        self
    }
    #[must_use]
    pub fn with_terminators(mut self, output: impl Into<String>, input: impl Into<String>) -> Self {
        self.output_eos = output.into();
        self.input_eos = input.into();
        self
    }
    #[must_use]
    pub const fn with_log_payloads(mut self, on: bool) -> Self {
        self.log_payloads = on;
        self
    }

    /// Apply an instrument's timing and terminator overrides.
    #[must_use]
    pub fn with_instrument(mut self, inst: &InstrumentInfo) -> Self {
        if let Some(ms) = inst.timeout_ms {
            self.timeout_ms = ms;
        }
        if let Some(ms) = inst.turnaround_ms {
            self.turnaround_ms = ms;
        }
        if let Some(eos) = &inst.output_eos {
            self.output_eos = eos.clone();
        }
        if let Some(eos) = &inst.input_eos {
            self.input_eos = eos.clone();
        }
        self
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    #[must_use]
    pub const fn turnaround(&self) -> Duration {
        Duration::from_millis(self.turnaround_ms)
    }
}
