#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::doc_markdown,
    clippy::too_long_first_doc_paragraph
)]

//! instmux
//!
//! instmux shares one line-oriented ASCII instrument link (TCP socket or serial
//! line) between many logical channels. Each channel is bound to an entry of a
//! command table that says how to request, write and parse one instrument
//! parameter; every exchange on a link is serialized behind one lock, and a failed
//! exchange pulses the link with a disconnect/connect before the error is returned.
//!
//! Main pieces:
//! - TOML command tables (`CommandTable`), with built-in tables for the Coherent SDG
//!   and SRS DG645 delay generators and the Pfeiffer TPG261 gauge controller
//! - the transaction engine (`engine`) and its transports (TCP, serial, loopback)
//! - typed read/write adapters on `ChannelHandle`
//! - a mock instrument for tests (separate crate `instmux_mock`)
//!
//! ```no_run
//! use instmux::{CommandTable, Endpoint, LinkConfig, PortRegistry};
//!
//! # async fn demo() -> Result<(), instmux::MuxError> {
//! let registry = PortRegistry::new();
//! registry.register(
//!     "sdg",
//!     Endpoint::tcp("127.0.0.1", 4001),
//!     CommandTable::coherent_sdg()?,
//!     LinkConfig::from_env(),
//! )?;
//! let delay = registry.bind("sdg", 0, 8).await?;
//! delay.write_float(100.0).await?;
//! println!("{}", delay.read_float().await?);
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod command;
pub mod command_table;
pub mod config;
pub mod conversion;
pub mod engine;
pub mod error;
pub mod loopback;
pub mod port;
pub mod registry;
pub mod scan;
pub mod template;
pub mod toml_helpers;
pub mod transport;

pub use channel::ChannelHandle;
pub use command::{Acknowledge, CommandDescriptor, ReadKind, WriteKind};
pub use command_table::CommandTable;
pub use config::LinkConfig;
pub use engine::SharedLink;
pub use error::MuxError;
pub use loopback::LoopbackLink;
pub use port::{InstrumentPort, PortSnapshot};
pub use registry::{Endpoint, PortRegistry};

/// Parse every built-in command table now instead of on first use.
///
/// Lets an application surface a broken embedded table at start-up.
pub fn preload_builtin_tables() -> Result<(), MuxError> {
    for (name, _) in command_table::BUILTIN_TABLES {
        CommandTable::builtin(name)?;
    }
    Ok(())
}
