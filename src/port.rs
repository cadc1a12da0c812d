use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use serde::Serialize;

use crate::channel::ChannelHandle;
use crate::command::{Acknowledge, CommandDescriptor};
use crate::command_table::CommandTable;
use crate::conversion::{decode, render_write, DecodeContext, Reading, Setting};
use crate::engine::{CounterSnapshot, LinkState, SharedLink};
use crate::error::MuxError;
use crate::scan;

/// Identity recorded when the identification exchange fails.
pub const COMM_FAILED: &str = "*COMM FAILED*";

#[derive(Debug, Default)]
struct Bindings {
    /// Indexed like the command table.
    refs: Vec<u32>,
    active_channels: u64,
    active_bindings: u64,
}

/// One instrument (link name plus address), shared by every channel bound to it.
///
/// Instruments on the same physical link share its [`SharedLink`]; the link's access
/// lock is held for a whole logical operation: request formatting, the exchange(s)
/// and reply conversion.
#[derive(Debug)]
pub struct InstrumentPort {
    address: i32,
    identity: String,
    initialized: bool,
    table: Arc<CommandTable>,
    link: Arc<SharedLink>,
    /// Code remembered by the last `status_text` or `measured` read. Only changed
    /// under the link's access lock.
    last_status: AtomicI64,
    bindings: StdMutex<Bindings>,
}

/// Serialisable view of a port for tooling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortSnapshot {
    pub name: String,
    pub address: i32,
    pub endpoint: String,
    pub instrument: String,
    pub identity: String,
    pub initialized: bool,
    pub counters: CounterSnapshot,
    pub active_channels: u64,
    pub active_bindings: u64,
    pub commands: usize,
    pub status_codes: usize,
    pub references: Vec<ReferenceCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceCount {
    pub channel_id: i32,
    pub description: String,
    pub refs: u32,
}

impl InstrumentPort {
    /// Identify the instrument at `address` on a connected link and run its
    /// start-up commands.
    ///
    /// A failed identification or start-up command leaves the port uninitialized:
    /// its identity is [`COMM_FAILED`] when identification failed, and every read or
    /// write on it reports [`MuxError::NotInitialized`].
    pub async fn open(address: i32, link: Arc<SharedLink>, table: Arc<CommandTable>) -> Arc<Self> {
        let (identity, initialized) = {
            let mut state = link.lock().await;
            Self::start_up(link.name(), &table, &mut state).await
        };
        if initialized {
            tracing::info!(port = %link.name(), address, identity = %identity, "instrument ready");
        }

        Arc::new(Self {
            address,
            identity,
            initialized,
            bindings: StdMutex::new(Bindings {
                refs: vec![0; table.len()],
                ..Bindings::default()
            }),
            table,
            link,
            last_status: AtomicI64::new(0),
        })
    }

    async fn start_up(name: &str, table: &CommandTable, state: &mut LinkState) -> (String, bool) {
        let inst = table.instrument();
        let identity = if inst.identify.is_empty() {
            inst.identity_label.clone().unwrap_or_else(|| inst.name.clone())
        } else {
            match state.query(&inst.identify, inst.acknowledge).await {
                Ok(reply) => inst
                    .identity_label
                    .clone()
                    .unwrap_or_else(|| reply.trim().to_string()),
                Err(e) => {
                    tracing::error!(port = %name, error = %e, "failure to acquire identification");
                    return (COMM_FAILED.to_string(), false);
                }
            }
        };

        for cmd in &inst.startup {
            let res = Self::send_command(state, inst.acknowledge, cmd).await;
            if let Err(e) = res {
                tracing::error!(port = %name, command = %cmd, error = %e, "start-up command failed");
                return (identity, false);
            }
        }
        (identity, true)
    }

    /// Write `request` and check the instrument accepted it.
    async fn send_command(
        state: &mut LinkState,
        ack: Acknowledge,
        request: &str,
    ) -> Result<(), MuxError> {
        match ack {
            Acknowledge::None => state.send_only(request).await,
            Acknowledge::Ok => {
                let reply = state.exchange(request).await?;
                if reply.eq_ignore_ascii_case("OK") {
                    Ok(())
                } else {
                    Err(MuxError::DeviceRejected { reply })
                }
            }
            // the data line after <ENQ> echoes the new setting
            Acknowledge::Enquiry => state.query(request, ack).await.map(|_| ()),
        }
    }

    /// Name of the link this instrument sits on.
    #[must_use]
    pub fn name(&self) -> &str {
        self.link.name()
    }

    #[must_use]
    pub const fn address(&self) -> i32 {
        self.address
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[must_use]
    pub fn table(&self) -> &Arc<CommandTable> {
        &self.table
    }

    #[must_use]
    pub fn link(&self) -> &Arc<SharedLink> {
        &self.link
    }

    /// Counters of the underlying link, shared with every address on it.
    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.link.counters()
    }

    fn bindings(&self) -> MutexGuard<'_, Bindings> {
        // counters only; a poisoned guard still holds consistent integers
        self.bindings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Attach a caller to `channel_id`.
    pub fn bind(self: &Arc<Self>, channel_id: i32) -> Result<ChannelHandle, MuxError> {
        let index = self
            .table
            .position(channel_id)
            .ok_or(MuxError::UnknownChannel(channel_id))?;
        {
            let mut b = self.bindings();
            b.refs[index] += 1;
            b.active_channels += 1;
            b.active_bindings += 1;
        }
        tracing::debug!(port = %self.name(), address = self.address, channel_id, "bound");
        Ok(ChannelHandle::new(Arc::clone(self), index))
    }

    pub(crate) fn release(&self, index: usize) {
        let mut b = self.bindings();
        if let Some(r) = b.refs.get_mut(index) {
            *r = r.saturating_sub(1);
        }
        b.active_channels = b.active_channels.saturating_sub(1);
    }

    /// Current reference count of the descriptor for `channel_id`.
    #[must_use]
    pub fn references(&self, channel_id: i32) -> Option<u32> {
        let index = self.table.position(channel_id)?;
        self.bindings().refs.get(index).copied()
    }

    pub(crate) fn descriptor(&self, index: usize) -> Result<&CommandDescriptor, MuxError> {
        self.table
            .get(index)
            .ok_or_else(|| MuxError::InvalidValue(format!("no descriptor at index {index}")))
    }

    /// Read and decode the value behind descriptor `index`.
    pub(crate) async fn read(&self, index: usize) -> Result<Reading, MuxError> {
        if !self.initialized {
            return Err(MuxError::NotInitialized);
        }
        let desc = self.descriptor(index)?;

        let ack = self.table.instrument().acknowledge;
        let mut state = self.link.lock().await;
        let reply = match desc.read_request.as_deref() {
            Some(request) => state.query(request, ack).await?,
            None => String::new(),
        };
        let mut last_status = self.last_status.load(Ordering::Relaxed);
        let mut ctx = DecodeContext {
            table: &self.table,
            identity: &self.identity,
            last_status: &mut last_status,
        };
        let reading = decode(desc.read_kind, &reply, &mut ctx);
        self.last_status.store(last_status, Ordering::Relaxed);
        drop(state);
        Ok(reading)
    }

    /// Render and send a write for descriptor `index`.
    pub(crate) async fn write(&self, index: usize, value: Setting) -> Result<(), MuxError> {
        if !self.initialized {
            return Err(MuxError::NotInitialized);
        }
        let desc = self.descriptor(index)?;

        let ack = self.table.instrument().acknowledge;
        let mut state = self.link.lock().await;
        if desc.is_write_sink() {
            return Ok(());
        }

        // pair edits read the current "ref,delay" under the same lock hold
        let current = match (desc.write_kind.needs_current_pair(), desc.read_request.as_deref()) {
            (true, Some(request)) => Some(scan::int_float_pair(&state.query(request, ack).await?)),
            _ => None,
        };
        let request = render_write(desc, &value, current)?;

        Self::send_command(&mut state, ack, &request)
            .await
            .inspect_err(|e| {
                if let MuxError::DeviceRejected { reply } = e {
                    tracing::warn!(port = %self.name(), request = %request, reply = %reply, "device rejected write");
                }
            })
    }

    #[must_use]
    pub fn snapshot(&self) -> PortSnapshot {
        let b = self.bindings();
        let references = self
            .table
            .iter()
            .zip(&b.refs)
            .filter(|(_, r)| **r > 0)
            .map(|(c, r)| ReferenceCount {
                channel_id: c.channel_id,
                description: c.description.clone(),
                refs: *r,
            })
            .collect();
        PortSnapshot {
            name: self.name().to_string(),
            address: self.address,
            endpoint: self.link.endpoint().to_string(),
            instrument: self.table.instrument().name.clone(),
            identity: self.identity.clone(),
            initialized: self.initialized,
            counters: self.link.counters(),
            active_channels: b.active_channels,
            active_bindings: b.active_bindings,
            commands: self.table.len(),
            status_codes: self.table.statuses().len(),
            references,
        }
    }

    pub fn report_json(&self) -> Result<String, MuxError> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    /// Human-readable diagnostics. Verbosity 0 prints the summary, 1 adds
    /// per-command reference counts, 2 adds link settings.
    #[must_use]
    pub fn report(&self, verbosity: u8) -> String {
        let s = self.snapshot();
        let mut out = String::new();
        let _ = writeln!(out, "    {} address {}", s.identity, s.address);
        let _ = writeln!(
            out,
            "    bindings {} channels {} drops {} writeReads {} writeOnlys {}",
            s.active_bindings,
            s.active_channels,
            s.counters.connection_drops,
            s.counters.completed_exchanges,
            s.counters.write_onlys
        );
        let _ = writeln!(
            out,
            "    support {} initialized",
            if s.initialized { "IS" } else { "IS NOT" }
        );
        let _ = writeln!(out, "    port \"{}\" link \"{}\"", s.name, s.endpoint);
        let _ = writeln!(
            out,
            "    total # of commands {}, # of status codes {}",
            s.commands, s.status_codes
        );
        if verbosity >= 1 {
            for r in &s.references {
                let _ = writeln!(out, "    {} refs for \"{}\" command", r.refs, r.description);
            }
        }
        if verbosity >= 2 {
            // settings are only readable under the lock; skip them while an exchange runs
            if let Some(state) = self.link.try_lock() {
                let c = state.config();
                let _ = writeln!(
                    out,
                    "    timeout {} ms turnaround {} ms reply capacity {} connected {}",
                    c.timeout_ms,
                    c.turnaround_ms,
                    c.reply_capacity,
                    state.transport().is_connected()
                );
            }
        }
        out
    }
}
