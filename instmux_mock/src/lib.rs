//! Mock ASCII instrument.
//!
//! Answers the protocol described by an instmux command table: the identification
//! request returns a configurable identity, writes are remembered and replayed on the
//! paired read request, and anything unknown is answered with `ERR` (or ignored, for
//! instruments that never acknowledge). Enquiry instruments get `<ACK>`/`<NAK>` and
//! hand out the data line on the following `<ENQ>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use instmux::{Acknowledge, CommandTable, ReadKind, WriteKind};
use instmux::engine::{ACK, ENQ, NAK};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

const REPLY_EOS: &str = "\r\n";
const ENQ_BYTE: u8 = 0x05;

/// What a request line amounts to, before the acknowledge mode shapes the reply.
enum Answer {
    Data(String),
    /// Write accepted; carries the value written.
    Accepted(String),
    Refused,
}

#[derive(Debug, Clone)]
struct WriteRule {
    /// Literal text before the first slot, or the whole command for fixed commands.
    prefix: String,
    fixed: bool,
    /// Read request whose reply a write updates.
    read: Option<String>,
}

#[derive(Debug)]
struct Profile {
    identify: String,
    acknowledge: Acknowledge,
    writes: Vec<WriteRule>,
}

#[derive(Debug)]
struct Inner {
    profile: Profile,
    identity: Mutex<String>,
    values: Mutex<HashMap<String, String>>,
    requests: Mutex<Vec<String>>,
    /// Data line held back for the next `<ENQ>`.
    pending: Mutex<Option<String>>,
    drop_next: AtomicUsize,
    reject_next: AtomicUsize,
}

/// A mock instrument server. Clones share state.
#[derive(Debug, Clone)]
pub struct MockServer {
    inner: Arc<Inner>,
}

fn default_reply(kind: ReadKind, identity: &str) -> String {
    match kind {
        ReadKind::Int | ReadKind::StatusText | ReadKind::StatusCode => "0".to_string(),
        ReadKind::Bits => "0000".to_string(),
        ReadKind::Float => "0.0".to_string(),
        ReadKind::Measured => "0,+0.0000E+00".to_string(),
        ReadKind::Ident => identity.to_string(),
        ReadKind::ChannelRef | ReadKind::ChannelDelay => "0,+0.000000000000".to_string(),
        ReadKind::Sink | ReadKind::Text => String::new(),
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl MockServer {
    pub fn coherent_sdg() -> anyhow::Result<Self> {
        Ok(Self::from_table(&*CommandTable::coherent_sdg()?))
    }

    pub fn dg645() -> anyhow::Result<Self> {
        Ok(Self::from_table(&*CommandTable::dg645()?))
    }

    pub fn tpg261() -> anyhow::Result<Self> {
        Ok(Self::from_table(&*CommandTable::tpg261()?))
    }

    /// Mock whatever instrument `src` (command-table TOML) describes.
    pub fn from_table_toml(src: &str) -> anyhow::Result<Self> {
        let table: CommandTable = src.parse().context("parse command table")?;
        Ok(Self::from_table(&table))
    }

    fn from_table(table: &CommandTable) -> Self {
        let inst = table.instrument();
        let identity = inst
            .identity_label
            .clone()
            .unwrap_or_else(|| format!("{},mock", inst.name));

        let mut values = HashMap::new();
        let mut writes = Vec::new();
        for c in table.iter() {
            if let Some(read) = &c.read_request {
                values
                    .entry(read.clone())
                    .or_insert_with(|| default_reply(c.read_kind, &identity));
            }
            if let Some(t) = &c.write_template {
                let fixed = c.write_kind == WriteKind::CommandOnly || t.slots() == 0;
                writes.push(WriteRule {
                    prefix: if fixed { t.as_str().to_string() } else { t.prefix().to_string() },
                    fixed,
                    read: c.read_request.clone(),
                });
            }
        }
        // longest prefix wins ("set:del:c1 " before "set:")
        writes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Self {
            inner: Arc::new(Inner {
                profile: Profile {
                    identify: inst.identify.clone(),
                    acknowledge: inst.acknowledge,
                    writes,
                },
                identity: Mutex::new(identity),
                values: Mutex::new(values),
                requests: Mutex::new(Vec::new()),
                pending: Mutex::new(None),
                drop_next: AtomicUsize::new(0),
                reject_next: AtomicUsize::new(0),
            }),
        }
    }

    /// Replace the identity returned for the identification request.
    #[must_use]
    pub fn with_identity(self, identity: impl Into<String>) -> Self {
        *lock(&self.inner.identity) = identity.into();
        self
    }

    /// Preset the reply to a read request.
    pub fn set_value(&self, read_request: &str, reply: impl Into<String>) {
        lock(&self.inner.values).insert(read_request.to_string(), reply.into());
    }

    #[must_use]
    pub fn value(&self, read_request: &str) -> Option<String> {
        lock(&self.inner.values).get(read_request).cloned()
    }

    /// Every request line received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        lock(&self.inner.requests).clone()
    }

    /// Close the connection instead of answering the next `n` requests.
    pub fn drop_next(&self, n: usize) {
        self.inner.drop_next.store(n, Ordering::SeqCst);
    }

    /// Answer the next `n` writes with `ERR`.
    pub fn reject_next(&self, n: usize) {
        self.inner.reject_next.store(n, Ordering::SeqCst);
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Handle one request line. `None` means no reply is sent.
    #[must_use]
    pub fn respond(&self, line: &str) -> Option<String> {
        lock(&self.inner.requests).push(line.to_string());

        match self.inner.profile.acknowledge {
            Acknowledge::Enquiry if line == ENQ => lock(&self.inner.pending).take(),
            Acknowledge::Enquiry => {
                let (reply, pending) = match self.answer(line) {
                    Answer::Data(v) | Answer::Accepted(v) => (ACK, Some(v)),
                    Answer::Refused => (NAK, None),
                };
                *lock(&self.inner.pending) = pending;
                Some(reply.to_string())
            }
            Acknowledge::Ok => Some(match self.answer(line) {
                Answer::Data(v) => v,
                Answer::Accepted(_) => "OK".to_string(),
                Answer::Refused => "ERR".to_string(),
            }),
            Acknowledge::None => match self.answer(line) {
                Answer::Data(v) => Some(v),
                Answer::Accepted(_) | Answer::Refused => None,
            },
        }
    }

    fn answer(&self, line: &str) -> Answer {
        let p = &self.inner.profile;
        if !p.identify.is_empty() && line == p.identify {
            return Answer::Data(lock(&self.inner.identity).clone());
        }
        if let Some(v) = lock(&self.inner.values).get(line) {
            return Answer::Data(v.clone());
        }

        let rule = p.writes.iter().find(|w| {
            if w.fixed {
                line == w.prefix
            } else {
                line.starts_with(&w.prefix)
            }
        });
        let Some(rule) = rule else {
            tracing::debug!(request = %line, "unknown command");
            return Answer::Refused;
        };
        if Self::take_one(&self.inner.reject_next) {
            return Answer::Refused;
        }
        if rule.fixed {
            return Answer::Accepted(String::new());
        }
        let value = line[rule.prefix.len()..].to_string();
        if let Some(read) = &rule.read {
            lock(&self.inner.values).insert(read.clone(), value.clone());
        }
        Answer::Accepted(value)
    }

    /// Serve connections from `listener` until it fails.
    pub async fn run_listener_on(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (sock, peer) = listener.accept().await.context("accept")?;
            tracing::debug!(%peer, "client connected");
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.serve(sock).await {
                    tracing::debug!(%peer, error = %e, "connection ended");
                }
            });
        }
    }

    /// Bind `addr` and serve.
    pub async fn run(&self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        tracing::info!(addr = %listener.local_addr()?, "mock instrument listening");
        self.run_listener_on(listener).await
    }

    /// Requests end at CR or LF; a bare `<ENQ>` byte is a request on its own.
    async fn serve(&self, sock: TcpStream) -> anyhow::Result<()> {
        let (mut rd, mut wr) = sock.into_split();
        let mut buf = [0u8; 256];
        let mut line = Vec::new();
        loop {
            let n = rd.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            for &b in &buf[..n] {
                let request = match b {
                    b'\r' | b'\n' if line.is_empty() => continue,
                    b'\r' | b'\n' => String::from_utf8_lossy(&std::mem::take(&mut line)).into_owned(),
                    ENQ_BYTE => ENQ.to_string(),
                    _ => {
                        line.push(b);
                        continue;
                    }
                };
                if !self.handle(&request, &mut wr).await? {
                    return Ok(());
                }
            }
        }
    }

    /// Answer one request. `false` closes the connection.
    async fn handle(&self, request: &str, wr: &mut OwnedWriteHalf) -> anyhow::Result<bool> {
        if Self::take_one(&self.inner.drop_next) {
            lock(&self.inner.requests).push(request.to_string());
            tracing::debug!(request = %request, "dropping connection");
            return Ok(false);
        }
        if let Some(reply) = self.respond(request) {
            wr.write_all(reply.as_bytes()).await?;
            wr.write_all(REPLY_EOS.as_bytes()).await?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_are_replayed_on_reads() {
        let m = MockServer::coherent_sdg().expect("sdg");
        assert_eq!(m.respond("set:del:c1 0012.3").as_deref(), Some("OK"));
        assert_eq!(m.respond("read:del:c1?").as_deref(), Some("0012.3"));
        assert_eq!(m.respond("set:rate 0100").as_deref(), Some("OK"));
        assert_eq!(m.respond("read:rate?").as_deref(), Some("0100"));
    }

    #[test]
    fn unknown_commands_are_rejected() {
        let m = MockServer::coherent_sdg().expect("sdg");
        assert_eq!(m.respond("bogus").as_deref(), Some("ERR"));
        m.reject_next(1);
        assert_eq!(m.respond("man:trig").as_deref(), Some("ERR"));
        assert_eq!(m.respond("man:trig").as_deref(), Some("OK"));
    }

    #[test]
    fn write_only_instrument_stays_silent() {
        let m = MockServer::dg645().expect("dg645").with_identity("SRS,DG645,mock");
        assert_eq!(m.respond("*IDN?").as_deref(), Some("SRS,DG645,mock"));
        assert_eq!(m.respond("*CLS"), None);
        assert_eq!(m.respond("DLAY 2,0,1.000000e-06"), None);
        assert_eq!(m.respond("DLAY?2").as_deref(), Some("0,1.000000e-06"));
    }

    #[test]
    fn enquiry_instrument_answers_on_enq() {
        let m = MockServer::tpg261().expect("tpg261");
        assert_eq!(m.respond("TID").as_deref(), Some(ACK));
        assert_eq!(m.respond(ENQ).as_deref(), Some("Pfeiffer TPG261,mock"));
        assert_eq!(m.respond(ENQ), None);

        m.set_value("PR1", "0,8.3400E-03");
        assert_eq!(m.respond("PR1").as_deref(), Some(ACK));
        assert_eq!(m.respond(ENQ).as_deref(), Some("0,8.3400E-03"));

        assert_eq!(m.respond("UNI,2").as_deref(), Some(ACK));
        assert_eq!(m.respond(ENQ).as_deref(), Some("2"));
        assert_eq!(m.value("UNI").as_deref(), Some("2"));

        assert_eq!(m.respond("XYZ").as_deref(), Some(NAK));
        assert_eq!(m.respond(ENQ), None);
    }
}
