//! In-process scripted transport.
//!
//! `LoopbackLink` stands in for a socket or serial line in tests and demos. Clones
//! share state, so a test keeps one clone to script replies and inspect the event log
//! while the port owns another.
//!
//! Not meant for long-running links: the event log keeps only the latest
//! [`EVENT_LOG_CAPACITY`] events.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::LinkConfig;
use crate::error::MuxError;
use crate::transport::{EomReason, RawReply};

/// Events kept by a [`LoopbackLink`]; older ones are dropped first.
pub const EVENT_LOG_CAPACITY: usize = 1024;

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// One scripted outcome, consumed by the next exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scripted {
    Reply(String),
    /// Report only this many request bytes as written.
    ShortWrite(usize),
    /// Fail the exchange with a transport error.
    Fail(String),
}

/// What happened on the link, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connect,
    Disconnect,
    Sent(String),
}

#[derive(Default)]
struct LoopbackState {
    connected: bool,
    script: VecDeque<Scripted>,
    responder: Option<Responder>,
    events: VecDeque<LinkEvent>,
    failing_connects: usize,
    latency: Duration,
    overlaps: usize,
}

impl LoopbackState {
    fn record(&mut self, event: LinkEvent) {
        if self.events.len() == EVENT_LOG_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

#[derive(Clone, Default)]
pub struct LoopbackLink {
    state: Arc<Mutex<LoopbackState>>,
    busy: Arc<AtomicBool>,
}

impl fmt::Debug for LoopbackLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.lock();
        f.debug_struct("LoopbackLink")
            .field("connected", &st.connected)
            .field("scripted", &st.script.len())
            .field("events", &st.events.len())
            .finish()
    }
}

impl LoopbackLink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request through `f`. `None` means the device stays silent.
    #[must_use]
    pub fn with_responder<F>(self, f: F) -> Self
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        self.lock().responder = Some(Box::new(f));
        self
    }

    /// Hold each exchange for `latency`, widening the window in which overlapping
    /// exchanges would be caught.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    // A panic while holding the lock only happens inside a responder; keep going
    // with whatever state it left.
    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.lock().script.push_back(Scripted::Reply(reply.into()));
    }

    pub fn push_short_write(&self, written: usize) {
        self.lock().script.push_back(Scripted::ShortWrite(written));
    }

    pub fn push_failure(&self, msg: impl Into<String>) {
        self.lock().script.push_back(Scripted::Fail(msg.into()));
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.lock().failing_connects = n;
    }

    /// Retained events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<LinkEvent> {
        self.lock().events.iter().cloned().collect()
    }

    /// Retained requests, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                LinkEvent::Sent(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn count(&self, event: &LinkEvent) -> usize {
        self.lock().events.iter().filter(|e| *e == event).count()
    }

    /// Number of exchanges that started while another was still in progress.
    #[must_use]
    pub fn overlaps(&self) -> usize {
        self.lock().overlaps
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub(crate) fn connect(&self) -> Result<(), MuxError> {
        let mut st = self.lock();
        st.record(LinkEvent::Connect);
        if st.failing_connects > 0 {
            st.failing_connects -= 1;
            st.connected = false;
            return Err(MuxError::TransportFailure("loopback connect refused".into()));
        }
        st.connected = true;
        Ok(())
    }

    pub(crate) fn disconnect(&self) {
        let mut st = self.lock();
        st.record(LinkEvent::Disconnect);
        st.connected = false;
    }

    fn enter(&self, out: &str) -> Result<Duration, MuxError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.lock().overlaps += 1;
        }
        let mut st = self.lock();
        st.record(LinkEvent::Sent(out.to_string()));
        if !st.connected {
            self.busy.store(false, Ordering::SeqCst);
            return Err(MuxError::TransportFailure("not connected".into()));
        }
        Ok(st.latency)
    }

    async fn leave(&self, latency: Duration) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.busy.store(false, Ordering::SeqCst);
    }

    pub(crate) async fn write_read(&self, out: &str, cfg: &LinkConfig) -> Result<RawReply, MuxError> {
        let latency = self.enter(out)?;
        let outcome = {
            let mut st = self.lock();
            match st.script.pop_front() {
                Some(s) => Some(s),
                None => st
                    .responder
                    .as_mut()
                    .and_then(|f| f(out))
                    .map(Scripted::Reply),
            }
        };
        self.leave(latency).await;

        match outcome {
            Some(Scripted::Reply(mut data)) => {
                let eom = if data.len() > cfg.reply_capacity {
                    let mut end = cfg.reply_capacity;
                    while !data.is_char_boundary(end) {
                        end -= 1;
                    }
                    data.truncate(end);
                    EomReason::Count
                } else {
                    EomReason::Eos
                };
                Ok(RawReply {
                    written: out.len(),
                    data,
                    eom,
                })
            }
            Some(Scripted::ShortWrite(written)) => Ok(RawReply {
                written,
                data: String::new(),
                eom: EomReason::End,
            }),
            Some(Scripted::Fail(msg)) => Err(MuxError::TransportFailure(msg)),
            None => Err(MuxError::TransportFailure(format!(
                "read timed out after {} ms",
                cfg.timeout_ms
            ))),
        }
    }

    pub(crate) async fn write(&self, out: &str) -> Result<usize, MuxError> {
        let latency = self.enter(out)?;
        let outcome = {
            let mut st = self.lock();
            // replies stay queued for the next write_read; faults apply here
            match st.script.front() {
                Some(Scripted::ShortWrite(_) | Scripted::Fail(_)) => st.script.pop_front(),
                _ => {
                    if let Some(f) = st.responder.as_mut() {
                        let _ = f(out);
                    }
                    None
                }
            }
        };
        self.leave(latency).await;

        match outcome {
            Some(Scripted::ShortWrite(n)) => Ok(n),
            Some(Scripted::Fail(msg)) => Err(MuxError::TransportFailure(msg)),
            _ => Ok(out.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn script_runs_before_responder() {
        let link = LoopbackLink::new().with_responder(|req| Some(format!("echo {req}")));
        link.connect().expect("connect");
        link.push_reply("first");
        let cfg = LinkConfig::default();
        assert_eq!(link.write_read("a", &cfg).await.expect("a").data, "first");
        assert_eq!(link.write_read("b", &cfg).await.expect("b").data, "echo b");
        assert_eq!(link.sent(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn write_only_leaves_replies_queued() {
        let link = LoopbackLink::new();
        link.connect().expect("connect");
        link.push_reply("kept");
        let cfg = LinkConfig::default();
        assert_eq!(link.write("*CLS").await.expect("write"), 4);
        assert_eq!(link.write_read("x", &cfg).await.expect("x").data, "kept");
    }

    #[tokio::test]
    async fn disconnected_link_refuses_exchanges() {
        let link = LoopbackLink::new();
        let err = link.write_read("x", &LinkConfig::default()).await.unwrap_err();
        assert!(err.is_link_failure());
        link.fail_next_connects(1);
        assert!(link.connect().is_err());
        assert!(link.connect().is_ok());
    }

    #[tokio::test]
    async fn event_log_keeps_latest_events() {
        let link = LoopbackLink::new();
        link.connect().expect("connect");
        for i in 0..EVENT_LOG_CAPACITY + 10 {
            link.write(&format!("w{i}")).await.expect("write");
        }
        let events = link.events();
        assert_eq!(events.len(), EVENT_LOG_CAPACITY);
        assert_eq!(events[0], LinkEvent::Sent("w10".into()));
        assert_eq!(link.count(&LinkEvent::Connect), 0);
    }

    #[tokio::test]
    async fn long_replies_are_cut_at_capacity() {
        let link = LoopbackLink::new();
        link.connect().expect("connect");
        link.push_reply("0123456789");
        let cfg = LinkConfig::default().with_reply_capacity(4);
        let r = link.write_read("x", &cfg).await.expect("x");
        assert_eq!((r.data.as_str(), r.eom), ("0123", EomReason::Count));
    }
}
