use std::fmt;
use std::sync::Arc;

use crate::command::CommandDescriptor;
use crate::conversion::{truncate_text, FromReading, Setting};
use crate::error::MuxError;
use crate::port::InstrumentPort;

/// A caller's attachment to one command of one port.
///
/// Dropping the handle (or calling [`ChannelHandle::unbind`]) decrements the
/// descriptor's reference count exactly once.
pub struct ChannelHandle {
    port: Arc<InstrumentPort>,
    index: usize,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("port", &self.port.name())
            .field("channel_id", &self.channel_id())
            .finish()
    }
}

impl ChannelHandle {
    pub(crate) fn new(port: Arc<InstrumentPort>, index: usize) -> Self {
        Self { port, index }
    }

    #[must_use]
    pub fn port(&self) -> &Arc<InstrumentPort> {
        &self.port
    }

    /// The bound descriptor. Handles are only created for indices of the port's table.
    #[must_use]
    pub fn descriptor(&self) -> Option<&CommandDescriptor> {
        self.port.table().get(self.index)
    }

    #[must_use]
    pub fn channel_id(&self) -> i32 {
        self.descriptor().map_or(-1, |d| d.channel_id)
    }

    /// Read in any representation implementing [`FromReading`].
    pub async fn read<T: FromReading>(&self) -> Result<T, MuxError> {
        let reading = self.port.read(self.index).await?;
        Ok(T::from_reading(&reading, self.port.table()))
    }

    pub async fn read_int(&self) -> Result<i32, MuxError> {
        self.read::<i32>().await
    }

    /// Read a bit field and apply `mask`.
    pub async fn read_bits(&self, mask: u32) -> Result<u32, MuxError> {
        Ok(self.read::<u32>().await? & mask)
    }

    pub async fn read_float(&self) -> Result<f64, MuxError> {
        self.read::<f64>().await
    }

    /// Read text, cut to at most `max_len` bytes.
    pub async fn read_text(&self, max_len: usize) -> Result<String, MuxError> {
        Ok(truncate_text(self.read::<String>().await?, max_len))
    }

    pub async fn write_int(&self, value: i32) -> Result<(), MuxError> {
        self.port.write(self.index, Setting::Int(i64::from(value))).await
    }

    pub async fn write_bits(&self, value: u32) -> Result<(), MuxError> {
        self.port.write(self.index, Setting::Bits(value)).await
    }

    pub async fn write_float(&self, value: f64) -> Result<(), MuxError> {
        self.port.write(self.index, Setting::Float(value)).await
    }

    pub async fn write_text(&self, value: &str) -> Result<(), MuxError> {
        self.port.write(self.index, Setting::Text(value.to_string())).await
    }

    /// Detach from the channel.
    pub fn unbind(self) {
        tracing::debug!(port = %self.port.name(), channel_id = self.channel_id(), "unbound");
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.port.release(self.index);
    }
}
