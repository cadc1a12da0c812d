//! The write-then-read transaction engine.
//!
//! Every exchange on a link goes through [`LinkState::exchange`],
//! [`LinkState::query`] or [`LinkState::send_only`], called with the link's access
//! lock held. A failed exchange (transport error or short write) bumps
//! `connection_drops`, pulses the link with one disconnect/connect and is reported
//! without a retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex as TokioMutex, MutexGuard};

use crate::command::Acknowledge;
use crate::config::LinkConfig;
use crate::error::MuxError;
use crate::transport::{printable, Transport};

/// Positive acknowledgement of an enquiry-protocol command.
pub const ACK: &str = "\u{6}";
/// Negative acknowledgement of an enquiry-protocol command.
pub const NAK: &str = "\u{15}";
/// Request for the data of the last acknowledged command. Sent without a terminator.
pub const ENQ: &str = "\u{5}";

/// Per-link instrumentation. Only written while the access lock is held, so reports
/// can read it without taking the lock.
#[derive(Debug, Default)]
pub struct LinkCounters {
    connection_drops: AtomicU64,
    completed_exchanges: AtomicU64,
    write_onlys: AtomicU64,
}

/// Point-in-time copy of [`LinkCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub connection_drops: u64,
    pub completed_exchanges: u64,
    pub write_onlys: u64,
}

impl LinkCounters {
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            connection_drops: self.connection_drops.load(Ordering::Relaxed),
            completed_exchanges: self.completed_exchanges.load(Ordering::Relaxed),
            write_onlys: self.write_onlys.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// One physical link. Every instrument address on it shares the transport and the
/// access lock, so at most one exchange is in flight per link.
#[derive(Debug)]
pub struct SharedLink {
    name: String,
    endpoint: String,
    state: TokioMutex<LinkState>,
    counters: Arc<LinkCounters>,
}

impl SharedLink {
    /// Connect `transport`. An unreachable endpoint is an error and creates nothing.
    pub async fn connect(
        name: impl Into<String>,
        transport: Transport,
        config: LinkConfig,
    ) -> Result<Arc<Self>, MuxError> {
        let name = name.into();
        let counters = Arc::new(LinkCounters::default());
        let endpoint = transport.describe();
        let mut state = LinkState::new(name.clone(), transport, config, counters.clone());

        state.connect().await.map_err(|e| {
            tracing::error!(link = %name, endpoint = %endpoint, error = %e, "connect failed");
            e
        })?;
        tracing::debug!(link = %name, endpoint = %endpoint, "connected");

        Ok(Arc::new(Self {
            name,
            endpoint,
            state: TokioMutex::new(state),
            counters,
        }))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Short endpoint label, e.g. `tcp 10.0.0.5:4001`.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Take the access lock. Held for a whole logical operation.
    pub async fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().await
    }

    /// The lock, unless an exchange currently holds it.
    #[must_use]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, LinkState>> {
        self.state.try_lock().ok()
    }
}

/// Everything guarded by a link's access lock.
#[derive(Debug)]
pub struct LinkState {
    port: String,
    transport: Transport,
    config: LinkConfig,
    counters: Arc<LinkCounters>,
}

impl LinkState {
    pub(crate) fn new(
        port: impl Into<String>,
        transport: Transport,
        config: LinkConfig,
        counters: Arc<LinkCounters>,
    ) -> Self {
        Self {
            port: port.into(),
            transport,
            config,
            counters,
        }
    }

    #[must_use]
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub(crate) async fn connect(&mut self) -> Result<(), MuxError> {
        self.transport.connect(&self.config).await
    }

    /// Write `request`, read one reply line.
    ///
    /// The turnaround delay is applied before returning on both outcomes.
    pub async fn exchange(&mut self, request: &str) -> Result<String, MuxError> {
        self.exchange_framed(request, true).await
    }

    /// Run one request according to the instrument's acknowledgement protocol and
    /// return its data reply.
    ///
    /// With [`Acknowledge::Enquiry`] the request must be answered with [`ACK`]; the
    /// data is then fetched with a bare [`ENQ`] in the same lock hold. Any other
    /// first reply is a [`MuxError::DeviceRejected`].
    pub async fn query(&mut self, request: &str, ack: Acknowledge) -> Result<String, MuxError> {
        match ack {
            Acknowledge::Ok | Acknowledge::None => self.exchange(request).await,
            Acknowledge::Enquiry => {
                let reply = self.exchange(request).await?;
                if reply != ACK {
                    tracing::warn!(port = %self.port, request, reply = %printable(reply.as_bytes()), "command not acknowledged");
                    return Err(MuxError::DeviceRejected { reply });
                }
                self.exchange_framed(ENQ, false).await
            }
        }
    }

    async fn exchange_framed(&mut self, request: &str, terminate: bool) -> Result<String, MuxError> {
        let requested = request.len();
        let result = match self
            .transport
            .write_read(request, terminate, &self.config)
            .await
        {
            Ok(reply) if reply.written != requested => Err(MuxError::TransportWriteShort {
                requested,
                written: reply.written,
            }),
            other => other,
        };

        let result = match result {
            Ok(reply) => {
                LinkCounters::bump(&self.counters.completed_exchanges);
                tracing::trace!(
                    port = %self.port,
                    request = %printable(request.as_bytes()),
                    reply = %printable(reply.data.as_bytes()),
                    eom = ?reply.eom,
                    "writeRead"
                );
                Ok(reply.data)
            }
            Err(e) => {
                self.recover("writeRead", request, &e).await;
                Err(e)
            }
        };

        tokio::time::sleep(self.config.turnaround()).await;
        result
    }

    /// Write `request` without reading a reply, for instruments that never acknowledge.
    pub async fn send_only(&mut self, request: &str) -> Result<(), MuxError> {
        let requested = request.len();
        let result = match self.transport.write(request, &self.config).await {
            Ok(written) if written != requested => {
                Err(MuxError::TransportWriteShort { requested, written })
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                LinkCounters::bump(&self.counters.write_onlys);
                tracing::trace!(port = %self.port, request, "writeOnly");
                Ok(())
            }
            Err(e) => {
                self.recover("writeOnly", request, &e).await;
                Err(e)
            }
        }
    }

    // One disconnect/connect pulse. A failed reconnect leaves the link down; the next
    // exchange then fails fast and pulses again.
    async fn recover(&mut self, op: &str, request: &str, err: &MuxError) {
        LinkCounters::bump(&self.counters.connection_drops);

        self.transport.disconnect();
        if let Err(ce) = self.transport.connect(&self.config).await {
            tracing::warn!(port = %self.port, error = %ce, "reconnect failed");
        }

        tracing::error!(port = %self.port, request = %printable(request.as_bytes()), error = %err, "{op} failed");
        if self.config.dump_on_error {
            log::error!(
                "[instmux ERROR] port={} link={} wrote=\"{}\"",
                self.port,
                self.transport.describe(),
                printable(request.as_bytes())
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LinkEvent, LoopbackLink};
    use std::time::Duration;

    async fn state(link: &LoopbackLink) -> (LinkState, Arc<LinkCounters>) {
        let counters = Arc::new(LinkCounters::default());
        let cfg = LinkConfig::default().with_turnaround(Duration::ZERO);
        let mut st = LinkState::new("t", Transport::Loopback(link.clone()), cfg, counters.clone());
        st.connect().await.expect("connect");
        (st, counters)
    }

    #[tokio::test]
    async fn success_counts_exchange() {
        let link = LoopbackLink::new();
        let (mut st, counters) = state(&link).await;
        link.push_reply("42");
        assert_eq!(st.exchange("read:rate?").await.expect("exchange"), "42");
        assert_eq!(counters.snapshot().completed_exchanges, 1);
        assert_eq!(counters.snapshot().connection_drops, 0);
    }

    #[tokio::test]
    async fn failure_pulses_link_once() {
        let link = LoopbackLink::new();
        let (mut st, counters) = state(&link).await;
        link.push_failure("boom");
        let err = st.exchange("read:rate?").await.unwrap_err();
        assert!(matches!(err, MuxError::TransportFailure(_)));
        assert_eq!(counters.snapshot().connection_drops, 1);
        assert_eq!(link.count(&LinkEvent::Disconnect), 1);
        assert_eq!(link.count(&LinkEvent::Connect), 2);
        assert!(st.transport().is_connected());
    }

    #[tokio::test]
    async fn short_write_only_counts_as_drop() {
        let link = LoopbackLink::new();
        let (mut st, counters) = state(&link).await;
        link.push_short_write(2);
        let err = st.send_only("*CLS").await.unwrap_err();
        assert!(matches!(
            err,
            MuxError::TransportWriteShort {
                requested: 4,
                written: 2
            }
        ));
        let c = counters.snapshot();
        assert_eq!((c.connection_drops, c.write_onlys), (1, 0));
        st.send_only("*CLS").await.expect("second write");
        assert_eq!(counters.snapshot().write_onlys, 1);
    }

    #[tokio::test]
    async fn failed_reconnect_leaves_link_down() {
        let link = LoopbackLink::new();
        let (mut st, _) = state(&link).await;
        link.push_failure("gone");
        link.fail_next_connects(1);
        assert!(st.exchange("x").await.is_err());
        assert!(!st.transport().is_connected());
        // next exchange fails fast and its pulse brings the link back
        assert!(st.exchange("x").await.is_err());
        assert!(st.transport().is_connected());
    }

    #[tokio::test]
    async fn enquiry_fetches_data_after_ack() {
        let link = LoopbackLink::new();
        let (mut st, counters) = state(&link).await;
        link.push_reply(ACK);
        link.push_reply("0,+1.2000E-03");
        let data = st.query("PR1", Acknowledge::Enquiry).await.expect("query");
        assert_eq!(data, "0,+1.2000E-03");
        assert_eq!(link.sent(), vec!["PR1".to_string(), ENQ.to_string()]);
        assert_eq!(counters.snapshot().completed_exchanges, 2);
    }

    #[tokio::test]
    async fn enquiry_nak_is_rejected_without_pulse() {
        let link = LoopbackLink::new();
        let (mut st, counters) = state(&link).await;
        link.push_reply(NAK);
        let err = st.query("XYZ", Acknowledge::Enquiry).await.unwrap_err();
        assert!(matches!(&err, MuxError::DeviceRejected { reply } if reply == NAK), "{err}");
        assert_eq!(link.sent(), vec!["XYZ".to_string()]);
        assert_eq!(counters.snapshot().connection_drops, 0);
    }

    #[tokio::test]
    async fn shared_link_connect_failure_creates_nothing() {
        let link = LoopbackLink::new();
        link.fail_next_connects(1);
        let err = SharedLink::connect("t", Transport::Loopback(link.clone()), LinkConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::TransportFailure(_)), "{err}");
        let shared = SharedLink::connect("t", Transport::Loopback(link), LinkConfig::default())
            .await
            .expect("second attempt");
        assert_eq!(shared.endpoint(), "loopback");
        assert!(shared.try_lock().is_some());
    }
}
