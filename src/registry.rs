use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, RwLock};

use tokio::sync::OnceCell;

use crate::channel::ChannelHandle;
use crate::command_table::CommandTable;
use crate::config::LinkConfig;
use crate::engine::SharedLink;
use crate::error::MuxError;
use crate::loopback::LoopbackLink;
use crate::port::{InstrumentPort, PortSnapshot};
use crate::transport::Transport;

/// Where a named physical link lives.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// TCP socket, `host:port`.
    Tcp(String),
    #[cfg(feature = "serial")]
    Serial { path: String, baud: u32 },
    Loopback(LoopbackLink),
}

impl Endpoint {
    #[must_use]
    pub fn tcp(host: impl AsRef<str>, port: u16) -> Self {
        Self::Tcp(format!("{}:{port}", host.as_ref()))
    }

    #[cfg(feature = "serial")]
    #[must_use]
    pub fn serial(path: impl Into<String>, baud: u32) -> Self {
        Self::Serial {
            path: path.into(),
            baud,
        }
    }

    fn transport(&self) -> Transport {
        match self {
            Self::Tcp(addr) => Transport::tcp(addr.clone()),
            #[cfg(feature = "serial")]
            Self::Serial { path, baud } => Transport::serial(path.clone(), *baud),
            Self::Loopback(link) => Transport::Loopback(link.clone()),
        }
    }
}

type LinkCell = Arc<OnceCell<Arc<SharedLink>>>;
type PortCell = Arc<OnceCell<Arc<InstrumentPort>>>;

#[derive(Debug, Clone)]
struct Registration {
    endpoint: Endpoint,
    table: Arc<CommandTable>,
    config: LinkConfig,
    /// Connected once, then shared by every address on the link.
    link: LinkCell,
}

/// Configuration-time registry of physical links and the ports opened on them.
///
/// Each registered name owns one transport and one access lock. Ports are keyed by
/// link name and address, opened on first bind on top of that shared link, and
/// reused by later binds. Opening runs outside the registry's map lock; concurrent
/// binds to the same key wait on that key only.
#[derive(Debug, Default)]
pub struct PortRegistry {
    links: RwLock<HashMap<String, Registration>>,
    ports: StdMutex<HashMap<(String, i32), PortCell>>,
}

impl PortRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a physical link and the command table of the instrument behind it.
    pub fn register(
        &self,
        name: impl Into<String>,
        endpoint: Endpoint,
        table: Arc<CommandTable>,
        config: LinkConfig,
    ) -> Result<(), MuxError> {
        let name = name.into();
        let mut links = self
            .links
            .write()
            .map_err(|_| MuxError::Definition("link registry poisoned".into()))?;
        if links.contains_key(&name) {
            return Err(MuxError::AlreadyRegistered(name));
        }
        tracing::debug!(link = %name, instrument = %table.instrument().name, "registered");
        links.insert(
            name,
            Registration {
                endpoint,
                table,
                config,
                link: LinkCell::default(),
            },
        );
        Ok(())
    }

    fn registration(&self, name: &str) -> Result<Registration, MuxError> {
        self.links
            .read()
            .map_err(|_| MuxError::Definition("link registry poisoned".into()))?
            .get(name)
            .cloned()
            .ok_or_else(|| MuxError::UnknownPort(name.to_string()))
    }

    fn ports(&self) -> MutexGuard<'_, HashMap<(String, i32), PortCell>> {
        // held only for lookups and inserts, never across an await
        self.ports
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Attach to `channel_id` on the instrument at `name`/`address`, opening the port
    /// on first use. An unknown channel fails before any port is opened.
    pub async fn bind(
        &self,
        name: &str,
        address: i32,
        channel_id: i32,
    ) -> Result<ChannelHandle, MuxError> {
        let reg = self.registration(name)?;
        if reg.table.find(channel_id).is_none() {
            return Err(MuxError::UnknownChannel(channel_id));
        }

        let cell = Arc::clone(
            self.ports()
                .entry((name.to_string(), address))
                .or_default(),
        );
        let port = cell
            .get_or_try_init(|| async {
                let link = reg
                    .link
                    .get_or_try_init(|| {
                        let config = reg.config.clone().with_instrument(reg.table.instrument());
                        SharedLink::connect(name, reg.endpoint.transport(), config)
                    })
                    .await?;
                Ok::<_, MuxError>(
                    InstrumentPort::open(address, Arc::clone(link), Arc::clone(&reg.table)).await,
                )
            })
            .await?;
        port.bind(channel_id)
    }

    /// The port already opened for `name`/`address`, if any.
    #[must_use]
    pub fn port(&self, name: &str, address: i32) -> Option<Arc<InstrumentPort>> {
        self.ports()
            .get(&(name.to_string(), address))
            .and_then(|cell| cell.get().cloned())
    }

    /// Number of opened ports. Ports still opening are not counted.
    #[must_use]
    pub fn port_count(&self) -> usize {
        self.ports().values().filter(|cell| cell.initialized()).count()
    }

    fn opened(&self) -> Vec<Arc<InstrumentPort>> {
        let mut ports: Vec<_> = self.ports().values().filter_map(|c| c.get().cloned()).collect();
        ports.sort_by(|a, b| (a.name(), a.address()).cmp(&(b.name(), b.address())));
        ports
    }

    /// Snapshots of every open port, ordered by name then address.
    #[must_use]
    pub fn snapshots(&self) -> Vec<PortSnapshot> {
        self.opened().iter().map(|p| p.snapshot()).collect()
    }

    /// Reports for every open port, each under a header line.
    #[must_use]
    pub fn report(&self, verbosity: u8) -> String {
        let mut out = String::new();
        for p in self.opened() {
            out.push_str(&format!("{} ({})\n", p.name(), p.table().instrument().name));
            out.push_str(&p.report(verbosity));
        }
        out
    }
}
