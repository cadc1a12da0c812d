use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout as tokio_timeout;

use crate::config::LinkConfig;
use crate::error::MuxError;
use crate::loopback::LoopbackLink;

/// Why a reply ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EomReason {
    /// Input terminator seen.
    Eos,
    /// Reply capacity reached before a terminator.
    Count,
    /// Peer closed the stream after sending a partial line.
    End,
    /// No terminator is configured and the reply stopped arriving.
    Timeout,
}

/// Result of one write-then-read on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReply {
    /// Request bytes written, excluding the output terminator.
    pub written: usize,
    pub data: String,
    pub eom: EomReason,
}

/// Endpoint implementations. One variant per physical link type.
#[derive(Debug)]
pub enum Transport {
    Tcp(TcpLink),
    #[cfg(feature = "serial")]
    Serial(SerialLink),
    Loopback(LoopbackLink),
}

pub(crate) fn printable(b: &[u8]) -> String {
    String::from_utf8_lossy(b).escape_debug().to_string()
}

// I/O errors belong to the link, not to the caller's file system.
fn io_failure(what: &str, e: &std::io::Error) -> MuxError {
    MuxError::TransportFailure(format!("{what} failed: {e}"))
}

fn timeout_error(what: &str, after: Duration) -> MuxError {
    MuxError::TransportFailure(format!("{what} timed out after {} ms", after.as_millis()))
}

impl Transport {
    #[must_use]
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::Tcp(TcpLink::new(addr))
    }

    #[cfg(feature = "serial")]
    #[must_use]
    pub fn serial(path: impl Into<String>, baud: u32) -> Self {
        Self::Serial(SerialLink::new(path, baud))
    }

    pub async fn connect(&mut self, cfg: &LinkConfig) -> Result<(), MuxError> {
        match self {
            Self::Tcp(l) => l.connect(cfg).await,
            #[cfg(feature = "serial")]
            Self::Serial(l) => l.connect(),
            Self::Loopback(l) => l.connect(),
        }
    }

    pub fn disconnect(&mut self) {
        match self {
            Self::Tcp(l) => l.disconnect(),
            #[cfg(feature = "serial")]
            Self::Serial(l) => l.disconnect(),
            Self::Loopback(l) => l.disconnect(),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        match self {
            Self::Tcp(l) => l.stream.is_some(),
            #[cfg(feature = "serial")]
            Self::Serial(l) => l.stream.is_some(),
            Self::Loopback(l) => l.is_connected(),
        }
    }

    /// Send one request and read one reply line. `terminate` appends the output
    /// terminator; enquiry bytes go out bare.
    pub async fn write_read(
        &mut self,
        out: &str,
        terminate: bool,
        cfg: &LinkConfig,
    ) -> Result<RawReply, MuxError> {
        match self {
            Self::Tcp(l) => {
                let stream = l.stream.as_mut().ok_or_else(not_connected)?;
                // stale bytes from an earlier, abandoned reply
                l.pending.clear();
                let written = write_line(stream, out, terminate, cfg).await?;
                let (data, eom) = read_line(stream, &mut l.pending, cfg).await?;
                Ok(RawReply { written, data, eom })
            }
            #[cfg(feature = "serial")]
            Self::Serial(l) => {
                let stream = l.stream.as_mut().ok_or_else(not_connected)?;
                l.pending.clear();
                let written = write_line(stream, out, terminate, cfg).await?;
                let (data, eom) = read_line(stream, &mut l.pending, cfg).await?;
                Ok(RawReply { written, data, eom })
            }
            Self::Loopback(l) => l.write_read(out, cfg).await,
        }
    }

    /// Send one request line without reading a reply. Returns the request bytes written.
    pub async fn write(&mut self, out: &str, cfg: &LinkConfig) -> Result<usize, MuxError> {
        match self {
            Self::Tcp(l) => {
                let stream = l.stream.as_mut().ok_or_else(not_connected)?;
                write_line(stream, out, true, cfg).await
            }
            #[cfg(feature = "serial")]
            Self::Serial(l) => {
                let stream = l.stream.as_mut().ok_or_else(not_connected)?;
                write_line(stream, out, true, cfg).await
            }
            Self::Loopback(l) => l.write(out).await,
        }
    }

    /// Short endpoint label for reports.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Tcp(l) => format!("tcp {}", l.addr),
            #[cfg(feature = "serial")]
            Self::Serial(l) => format!("serial {} @{}", l.path, l.baud),
            Self::Loopback(_) => "loopback".to_string(),
        }
    }
}

fn not_connected() -> MuxError {
    MuxError::TransportFailure("not connected".into())
}

async fn write_line<W: AsyncWrite + Unpin>(
    w: &mut W,
    out: &str,
    terminate: bool,
    cfg: &LinkConfig,
) -> Result<usize, MuxError> {
    let mut payload = Vec::with_capacity(out.len() + cfg.output_eos.len());
    payload.extend_from_slice(out.as_bytes());
    if terminate {
        payload.extend_from_slice(cfg.output_eos.as_bytes());
    }

    let dur = cfg.timeout();
    match tokio_timeout(dur, write_flush(w, &payload)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(io_failure("write", &e)),
        Err(_) => return Err(timeout_error("write", dur)),
    }
    if cfg.log_payloads {
        log::debug!("[instmux send] {}", printable(&payload));
    }
    Ok(out.len())
}

async fn write_flush<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> std::io::Result<()> {
    w.write_all(payload).await?;
    w.flush().await
}

async fn fill_line<R: AsyncRead + Unpin>(
    r: &mut R,
    pending: &mut Vec<u8>,
    eos: &[u8],
    cap: usize,
) -> Result<(Vec<u8>, EomReason), MuxError> {
    let mut tmp = [0u8; 512];
    loop {
        if !eos.is_empty() {
            if let Some(pos) = pending.windows(eos.len()).position(|w| w == eos) {
                if pos <= cap {
                    let line: Vec<u8> = pending.drain(..pos).collect();
                    pending.drain(..eos.len());
                    return Ok((line, EomReason::Eos));
                }
            }
        }
        if pending.len() >= cap {
            let line: Vec<u8> = pending.drain(..cap).collect();
            return Ok((line, EomReason::Count));
        }
        let n = r.read(&mut tmp).await.map_err(|e| io_failure("read", &e))?;
        if n == 0 {
            if pending.is_empty() {
                return Err(MuxError::TransportFailure("connection closed by peer".into()));
            }
            let line = std::mem::take(pending);
            return Ok((line, EomReason::End));
        }
        pending.extend_from_slice(&tmp[..n]);
    }
}

/// Read until the input terminator or `reply_capacity` bytes. Bytes after the
/// terminator stay in `pending`.
async fn read_line<R: AsyncRead + Unpin>(
    r: &mut R,
    pending: &mut Vec<u8>,
    cfg: &LinkConfig,
) -> Result<(String, EomReason), MuxError> {
    let eos = cfg.input_eos.as_bytes();
    let cap = cfg.reply_capacity;
    let dur = cfg.timeout();

    let res = tokio_timeout(dur, fill_line(r, pending, eos, cap)).await;

    let (line, eom) = match res {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => return Err(e),
        // without a terminator the end of a reply is only visible as silence
        Err(_) if eos.is_empty() && !pending.is_empty() => {
            let line = std::mem::take(pending);
            (line, EomReason::Timeout)
        }
        Err(_) => return Err(timeout_error("read", dur)),
    };
    if cfg.log_payloads {
        log::debug!("[instmux recv] {} ({eom:?})", printable(&line));
    }
    Ok((String::from_utf8_lossy(&line).into_owned(), eom))
}

/// TCP socket link (`host:port`).
#[derive(Debug)]
pub struct TcpLink {
    addr: String,
    stream: Option<TcpStream>,
    pending: Vec<u8>,
}

impl TcpLink {
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
            pending: Vec::new(),
        }
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&mut self, cfg: &LinkConfig) -> Result<(), MuxError> {
        self.disconnect();
        let addrs = lookup_host(self.addr.as_str())
            .await
            .map_err(|e| MuxError::TransportFailure(format!("bad address {}: {e}", self.addr)))?;

        let mut last_err = None;
        for remote in addrs {
            match tokio_timeout(cfg.connect_timeout(), TcpStream::connect(remote)).await {
                Ok(Ok(s)) => {
                    // line-oriented request/response; don't batch small writes
                    let _ = s.set_nodelay(true);
                    self.stream = Some(s);
                    log::debug!("[instmux] connected to {remote}");
                    return Ok(());
                }
                Ok(Err(e)) => last_err = Some(e.to_string()),
                Err(_) => last_err = Some("connect timeout".to_string()),
            }
        }
        Err(MuxError::TransportFailure(format!(
            "connect {} failed: {}",
            self.addr,
            last_err.unwrap_or_else(|| "no addresses".to_string())
        )))
    }

    fn disconnect(&mut self) {
        self.stream = None;
        self.pending.clear();
    }
}

/// Serial line link.
#[cfg(feature = "serial")]
#[derive(Debug)]
pub struct SerialLink {
    path: String,
    baud: u32,
    stream: Option<tokio_serial::SerialStream>,
    pending: Vec<u8>,
}

#[cfg(feature = "serial")]
impl SerialLink {
    #[must_use]
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
            stream: None,
            pending: Vec::new(),
        }
    }

    fn connect(&mut self) -> Result<(), MuxError> {
        use tokio_serial::SerialPortBuilderExt;

        self.disconnect();
        let port = tokio_serial::new(self.path.as_str(), self.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| MuxError::TransportFailure(format!("open {}: {e}", self.path)))?;
        self.stream = Some(port);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stream = None;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LinkConfig {
        LinkConfig::default()
            .with_timeout(Duration::from_millis(200))
            .with_reply_capacity(8)
    }

    #[tokio::test]
    async fn read_line_splits_on_terminator() {
        let (mut a, mut b) = tokio::io::duplex(64);
        b.write_all(b"OK\r\nnext\r\n").await.expect("write");
        let mut pending = Vec::new();
        let (line, eom) = read_line(&mut a, &mut pending, &cfg()).await.expect("line");
        assert_eq!((line.as_str(), eom), ("OK", EomReason::Eos));
        let (line, _) = read_line(&mut a, &mut pending, &cfg()).await.expect("line");
        assert_eq!(line, "next");
    }

    #[tokio::test]
    async fn read_line_stops_at_capacity() {
        let (mut a, mut b) = tokio::io::duplex(64);
        b.write_all(b"0123456789\r\n").await.expect("write");
        let mut pending = Vec::new();
        let (line, eom) = read_line(&mut a, &mut pending, &cfg()).await.expect("line");
        assert_eq!((line.as_str(), eom), ("01234567", EomReason::Count));
    }

    #[tokio::test]
    async fn read_line_times_out() {
        let (mut a, _b) = tokio::io::duplex(64);
        let mut pending = Vec::new();
        let err = read_line(&mut a, &mut pending, &cfg()).await.unwrap_err();
        assert!(err.is_link_failure(), "{err}");
    }

    #[tokio::test]
    async fn write_line_appends_terminator() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let n = write_line(&mut a, "*IDN?", true, &cfg()).await.expect("write");
        assert_eq!(n, 5);
        let mut buf = [0u8; 6];
        b.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"*IDN?\n");
    }

    #[tokio::test]
    async fn enquiry_goes_out_bare() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_line(&mut a, "\u{5}", false, &cfg()).await.expect("write");
        drop(a);
        let mut buf = Vec::new();
        b.read_to_end(&mut buf).await.expect("read");
        assert_eq!(buf, vec![5u8]);
    }

    #[tokio::test]
    async fn unterminated_reply_ends_on_silence() {
        let (mut a, mut b) = tokio::io::duplex(64);
        b.write_all(b"12.5").await.expect("write");
        let cfg = cfg().with_terminators("\n", "");
        let mut pending = Vec::new();
        let (line, eom) = read_line(&mut a, &mut pending, &cfg).await.expect("partial reply");
        assert_eq!((line.as_str(), eom), ("12.5", EomReason::Timeout));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn io_errors_are_transport_failures() {
        let (mut a, b) = tokio::io::duplex(8);
        drop(b);
        let err = write_line(&mut a, "*IDN?", true, &cfg()).await.unwrap_err();
        assert!(matches!(err, MuxError::TransportFailure(_)), "{err}");
    }

    #[tokio::test]
    async fn tcp_connect_refused_is_transport_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let mut t = Transport::tcp(addr.to_string());
        let err = t.connect(&cfg()).await.unwrap_err();
        assert!(matches!(err, MuxError::TransportFailure(_)), "{err}");
        assert!(!t.is_connected());
    }
}
