use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::command::{Acknowledge, CommandDescriptor, ReadKind, WriteKind};
use crate::error::MuxError;
use crate::template::Template;
use crate::toml_helpers::describe_toml_error;

/// Built-in tables, embedded at compile time. `build.rs` checks them for duplicate ids.
pub const BUILTIN_TABLES: &[(&str, &str)] = &[
    ("coherent_sdg", include_str!("tables/coherent_sdg.toml")),
    ("dg645", include_str!("tables/dg645.toml")),
    ("tpg261", include_str!("tables/tpg261.toml")),
];

static COHERENT_SDG: OnceCell<Arc<CommandTable>> = OnceCell::new();
static DG645: OnceCell<Arc<CommandTable>> = OnceCell::new();
static TPG261: OnceCell<Arc<CommandTable>> = OnceCell::new();

#[derive(Debug, Deserialize)]
struct TableFile {
    instrument: InstrumentRaw,
    #[serde(rename = "command", default)]
    commands: Vec<CommandRaw>,
    #[serde(rename = "status", default)]
    statuses: Vec<StatusMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstrumentRaw {
    name: String,
    #[serde(default)]
    identify: String,
    identity: Option<String>,
    #[serde(default)]
    acknowledge: Acknowledge,
    #[serde(default)]
    startup: Vec<String>,
    #[serde(default)]
    reference_names: Vec<String>,
    timeout_ms: Option<u64>,
    turnaround_ms: Option<u64>,
    output_eos: Option<String>,
    input_eos: Option<String>,
}

// Empty strings mean "not supported".
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandRaw {
    id: i32,
    #[serde(default)]
    output: u32,
    #[serde(default)]
    read: String,
    #[serde(default)]
    read_kind: ReadKind,
    #[serde(default)]
    write: String,
    #[serde(default)]
    write_kind: WriteKind,
    description: String,
}

/// Instrument-wide protocol facts shared by every command of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentInfo {
    pub name: String,
    /// Identification request sent once when a link is opened. Empty skips identification.
    pub identify: String,
    /// Fixed identity label; when absent the identification reply is used.
    pub identity_label: Option<String>,
    pub acknowledge: Acknowledge,
    /// Commands sent, unacknowledged, after a successful identification.
    pub startup: Vec<String>,
    /// Display names for the reference index of `"ref,delay"` replies.
    pub reference_names: Vec<String>,
    /// Overrides for the link's exchange timeout and inter-transaction delay.
    pub timeout_ms: Option<u64>,
    pub turnaround_ms: Option<u64>,
    /// Overrides for the link's line terminators.
    pub output_eos: Option<String>,
    pub input_eos: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StatusMessage {
    pub code: i64,
    pub message: String,
}

/// A validated, immutable command table.
#[derive(Debug, Clone)]
pub struct CommandTable {
    instrument: InstrumentInfo,
    commands: Vec<CommandDescriptor>,
    statuses: Vec<StatusMessage>,
}

impl CommandTable {
    /// Parse and validate a table from TOML text.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, MuxError> {
        let file: TableFile = toml::from_str(s)
            .map_err(|e| MuxError::Definition(describe_toml_error("command table", s, &e)))?;
        Self::from_file(file)
    }

    pub fn from_path(path: &Path) -> Result<Self, MuxError> {
        let s = fs::read_to_string(path)
            .map_err(|e| MuxError::Definition(format!("read {}: {e}", path.display())))?;
        s.parse::<Self>()
    }

    /// The Coherent SDG table, parsed on first use.
    pub fn coherent_sdg() -> Result<Arc<Self>, MuxError> {
        COHERENT_SDG
            .get_or_try_init(|| Self::from_str(BUILTIN_TABLES[0].1).map(Arc::new))
            .cloned()
    }

    /// The SRS DG645 table, parsed on first use.
    pub fn dg645() -> Result<Arc<Self>, MuxError> {
        DG645
            .get_or_try_init(|| Self::from_str(BUILTIN_TABLES[1].1).map(Arc::new))
            .cloned()
    }

    /// The Pfeiffer TPG261 gauge controller table, parsed on first use.
    pub fn tpg261() -> Result<Arc<Self>, MuxError> {
        TPG261
            .get_or_try_init(|| Self::from_str(BUILTIN_TABLES[2].1).map(Arc::new))
            .cloned()
    }

    /// Look up a built-in table by its short name (`coherent_sdg`, `dg645`, `tpg261`).
    pub fn builtin(name: &str) -> Result<Arc<Self>, MuxError> {
        match name {
            "coherent_sdg" | "sdg" => Self::coherent_sdg(),
            "dg645" => Self::dg645(),
            "tpg261" => Self::tpg261(),
            other => Err(MuxError::Definition(format!("no built-in table named {other:?}"))),
        }
    }

    fn from_file(file: TableFile) -> Result<Self, MuxError> {
        let inst = file.instrument;
        if inst.name.trim().is_empty() {
            return Err(MuxError::Definition("instrument name empty".into()));
        }
        let instrument = InstrumentInfo {
            name: inst.name,
            identify: inst.identify,
            identity_label: inst.identity.filter(|s| !s.is_empty()),
            acknowledge: inst.acknowledge,
            startup: inst.startup,
            reference_names: inst.reference_names,
            timeout_ms: inst.timeout_ms,
            turnaround_ms: inst.turnaround_ms,
            output_eos: inst.output_eos,
            input_eos: inst.input_eos,
        };

        let mut ids = HashSet::new();
        let mut commands = Vec::with_capacity(file.commands.len());
        for raw in file.commands {
            if !ids.insert(raw.id) {
                return Err(MuxError::Definition(format!(
                    "duplicate command id: {id}",
                    id = raw.id
                )));
            }
            commands.push(build_descriptor(raw)?);
        }

        let mut codes = HashSet::new();
        for st in &file.statuses {
            if !codes.insert(st.code) {
                return Err(MuxError::Definition(format!(
                    "duplicate status code: {code}",
                    code = st.code
                )));
            }
        }

        Ok(Self {
            instrument,
            commands,
            statuses: file.statuses,
        })
    }

    /// Linear scan by channel id.
    #[must_use]
    pub fn find(&self, channel_id: i32) -> Option<&CommandDescriptor> {
        self.commands.iter().find(|c| c.channel_id == channel_id)
    }

    /// Index of the descriptor for `channel_id`, used as a stable key for reference counts.
    #[must_use]
    pub fn position(&self, channel_id: i32) -> Option<usize> {
        self.commands.iter().position(|c| c.channel_id == channel_id)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&CommandDescriptor> {
        self.commands.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandDescriptor> {
        self.commands.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    #[must_use]
    pub const fn instrument(&self) -> &InstrumentInfo {
        &self.instrument
    }

    #[must_use]
    pub fn statuses(&self) -> &[StatusMessage] {
        &self.statuses
    }

    #[must_use]
    pub fn status_message(&self, code: i64) -> Option<&str> {
        self.statuses
            .iter()
            .find(|s| s.code == code)
            .map(|s| s.message.as_str())
    }

    /// Name of a reference output, falling back to its index.
    #[must_use]
    pub fn reference_name(&self, index: i64) -> String {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.instrument.reference_names.get(i))
            .cloned()
            .unwrap_or_else(|| index.to_string())
    }
}

impl std::str::FromStr for CommandTable {
    type Err = MuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str(s)
    }
}

fn build_descriptor(raw: CommandRaw) -> Result<CommandDescriptor, MuxError> {
    let id = raw.id;
    let fail = |msg: String| MuxError::Definition(format!("command {id}: {msg}"));

    let read_request = Some(raw.read).filter(|s| !s.is_empty());
    match (&read_request, raw.read_kind.is_local()) {
        (None, false) => {
            return Err(fail(format!(
                "read_kind {} needs a read request",
                raw.read_kind.as_str()
            )))
        }
        (Some(r), true) => {
            return Err(fail(format!(
                "read_kind {} never sends a request, but read = {r:?}",
                raw.read_kind.as_str()
            )))
        }
        _ => {}
    }

    let write_template = if raw.write.is_empty() {
        None
    } else {
        Some(Template::parse(&raw.write)?)
    };
    match (&write_template, raw.write_kind) {
        (None, WriteKind::Sink) => {}
        (None, kind) => {
            return Err(fail(format!(
                "write_kind {} needs a write template",
                kind.as_str()
            )))
        }
        (Some(t), WriteKind::Sink) => {
            return Err(fail(format!("write template {t} given with write_kind sink")))
        }
        (Some(t), kind) => {
            if t.slots() != kind.slots() {
                return Err(fail(format!(
                    "write_kind {} fills {} slot(s) but {:?} has {}",
                    kind.as_str(),
                    kind.slots(),
                    t.as_str(),
                    t.slots()
                )));
            }
        }
    }
    if raw.write_kind.needs_current_pair() && read_request.is_none() {
        return Err(fail(format!(
            "write_kind {} reads the current pair and needs a read request",
            raw.write_kind.as_str()
        )));
    }

    Ok(CommandDescriptor {
        channel_id: id,
        output: raw.output,
        read_request,
        read_kind: raw.read_kind,
        write_template,
        write_kind: raw.write_kind,
        description: raw.description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "[instrument]\nname = \"T\"\nidentify = \"*IDN?\"\n";

    fn table(body: &str) -> Result<CommandTable, MuxError> {
        format!("{HEADER}{body}").parse()
    }

    #[test]
    fn builtin_tables_load() {
        let sdg = CommandTable::coherent_sdg().expect("sdg");
        assert_eq!(sdg.len(), 13);
        assert_eq!(sdg.instrument().acknowledge, Acknowledge::Ok);
        let dg = CommandTable::dg645().expect("dg645");
        assert_eq!(dg.instrument().acknowledge, Acknowledge::None);
        assert_eq!(dg.status_message(110), Some("Illegal Command"));
        assert_eq!(dg.reference_name(2), "A");
        assert_eq!(dg.reference_name(42), "42");
        let tpg = CommandTable::tpg261().expect("tpg261");
        assert_eq!(tpg.instrument().acknowledge, Acknowledge::Enquiry);
        assert_eq!(tpg.instrument().output_eos.as_deref(), Some("\r"));
        assert_eq!(tpg.find(1).map(|c| c.read_kind), Some(ReadKind::Measured));
    }

    #[test]
    fn builtin_ids_are_unique() {
        for (name, _) in BUILTIN_TABLES {
            let t = CommandTable::builtin(name).expect("builtin");
            let mut seen = HashSet::new();
            for c in t.iter() {
                assert!(seen.insert(c.channel_id), "{name}: duplicate {}", c.channel_id);
                assert!(std::ptr::eq(t.find(c.channel_id).expect("find"), c));
            }
        }
    }

    #[test]
    fn duplicate_id_rejected() {
        let body = r#"
[[command]]
id = 1
description = "a"
[[command]]
id = 1
description = "b"
"#;
        let err = table(body).unwrap_err();
        assert!(err.to_string().contains("duplicate command id: 1"), "{err}");
    }

    #[test]
    fn read_kind_without_request_rejected() {
        let body = "[[command]]\nid = 1\nread_kind = \"int\"\ndescription = \"x\"\n";
        assert!(matches!(table(body), Err(MuxError::Definition(_))));
    }

    #[test]
    fn slot_count_must_match_kind() {
        let body = "[[command]]\nid = 1\nwrite = \"set %d,%d\"\nwrite_kind = \"int\"\ndescription = \"x\"\n";
        let err = table(body).unwrap_err();
        assert!(err.to_string().contains("fills 1 slot"), "{err}");
    }

    #[test]
    fn pair_writes_need_read_request() {
        let body = "[[command]]\nid = 1\nwrite = \"DLAY 2,%d,%e\"\nwrite_kind = \"channel_delay\"\ndescription = \"x\"\n";
        assert!(matches!(table(body), Err(MuxError::Definition(_))));
    }

    #[test]
    fn unknown_field_reports_position() {
        let body = "[[command]]\nid = 1\ndescription = \"x\"\nbogus = 2\n";
        let err = table(body).unwrap_err().to_string();
        assert!(err.contains("command table parse error at"), "{err}");
    }

    #[test]
    fn find_misses_cleanly() {
        let sdg = CommandTable::coherent_sdg().expect("sdg");
        assert!(sdg.find(999).is_none());
        assert_eq!(sdg.position(8), Some(8));
    }
}
