//! Stream endpoints: plain TCP, TLS, or any connected byte stream

use crate::tls::{server_name, TlsClientConfig};
use crate::{guarded, BoxedIo, DebugLog, Io, Peer, Relay, RelayError, RelayResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustls::pki_types::ServerName;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default read size per message
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

enum Dialer {
    Tcp {
        addr: String,
    },
    Tls {
        addr: String,
        server_name: ServerName<'static>,
        connector: TlsConnector,
    },
}

impl Dialer {
    async fn dial(&self) -> RelayResult<BoxedIo> {
        match self {
            Dialer::Tcp { addr } => {
                let tcp = TcpStream::connect(addr.as_str()).await?;
                tcp.set_nodelay(true)?;
                Ok(Box::new(tcp))
            }
            Dialer::Tls {
                addr,
                server_name,
                connector,
            } => {
                let tcp = TcpStream::connect(addr.as_str()).await?;
                tcp.set_nodelay(true)?;
                let tls = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(|e| RelayError::Tls(format!("TLS handshake failed: {}", e)))?;
                Ok(Box::new(tls))
            }
        }
    }

    fn addr(&self) -> &str {
        match self {
            Dialer::Tcp { addr } | Dialer::Tls { addr, .. } => addr,
        }
    }
}

/// Byte-stream endpoint. Each `recv_msg` returns whatever one read produced,
/// up to the configured buffer size.
pub struct StreamRelay {
    dialer: Option<Dialer>,
    reader: Mutex<Option<ReadHalf<BoxedIo>>>,
    writer: Mutex<Option<WriteHalf<BoxedIo>>>,
    timeout: Duration,
    buffer_size: usize,
    shutdown: CancellationToken,
    debug: DebugLog,
}

impl std::fmt::Debug for StreamRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRelay")
            .field("addr", &self.dialer.as_ref().map(|d| d.addr()))
            .field("timeout", &self.timeout)
            .field("closed", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl StreamRelay {
    fn build(dialer: Option<Dialer>, io: Option<BoxedIo>, timeout: Duration) -> Self {
        let (reader, writer) = match io {
            Some(io) => {
                let (r, w) = tokio::io::split(io);
                (Some(r), Some(w))
            }
            None => (None, None),
        };

        Self {
            dialer,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            timeout,
            buffer_size: DEFAULT_BUFFER_SIZE,
            shutdown: CancellationToken::new(),
            debug: DebugLog::new(),
        }
    }

    /// Plain TCP client for `addr` (`host:port`); call [`Relay::connect`]
    pub fn tcp(addr: impl Into<String>, timeout: Duration) -> Self {
        Self::build(Some(Dialer::Tcp { addr: addr.into() }), None, timeout)
    }

    /// TLS client for `addr` (`host:port`), verifying the host part
    pub fn tls(
        addr: impl Into<String>,
        config: &TlsClientConfig,
        timeout: Duration,
    ) -> RelayResult<Self> {
        let addr = addr.into();
        let host = host_part(&addr)?;
        let dialer = Dialer::Tls {
            server_name: server_name(host)?,
            connector: config.build_connector()?,
            addr,
        };
        Ok(Self::build(Some(dialer), None, timeout))
    }

    /// Wrap an already connected stream (accepted socket, TLS session, ...)
    pub fn from_stream(stream: impl Io + 'static, timeout: Duration) -> Self {
        Self::build(None, Some(Box::new(stream)), timeout)
    }

    /// Bytes read per message
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }
}

/// Host portion of `host:port`, with IPv6 brackets removed
pub(crate) fn host_part(addr: &str) -> RelayResult<&str> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| RelayError::InvalidAddress(addr.to_string()))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(RelayError::InvalidAddress(addr.to_string()));
    }
    Ok(host.trim_start_matches('[').trim_end_matches(']'))
}

#[async_trait]
impl Relay for StreamRelay {
    async fn connect(&self) -> RelayResult<()> {
        let Some(dialer) = &self.dialer else {
            return Ok(());
        };

        let io = guarded(&self.shutdown, self.timeout, dialer.dial()).await?;
        debug!("Connected stream relay to {}", dialer.addr());

        let (r, w) = tokio::io::split(io);
        *self.reader.lock().await = Some(r);
        *self.writer.lock().await = Some(w);
        Ok(())
    }

    fn close(&self) {
        self.shutdown.cancel();
        // Drop the halves now unless a pump holds them; it releases them
        // when its cancelled call returns.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }

    async fn send_msg(&self, data: &[u8]) -> RelayResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(RelayError::ConnectionClosed);
        }
        self.debug.log_data(data, "send");

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(RelayError::NotConnected)?;

        guarded(&self.shutdown, self.timeout, async {
            writer.write_all(data).await?;
            writer.flush().await?;
            Ok(())
        })
        .await
    }

    async fn recv_msg(&self) -> RelayResult<(Bytes, Option<Peer>)> {
        if self.shutdown.is_cancelled() {
            return Err(RelayError::ConnectionClosed);
        }

        let mut reader = self.reader.lock().await;
        let reader = reader.as_mut().ok_or(RelayError::NotConnected)?;

        let mut buf = BytesMut::zeroed(self.buffer_size);
        let n = guarded(&self.shutdown, self.timeout, async {
            Ok(reader.read(&mut buf).await?)
        })
        .await?;

        if n == 0 {
            return Err(RelayError::ConnectionClosed);
        }
        buf.truncate(n);
        self.debug.log_data(&buf, "recv");
        Ok((buf.freeze(), None))
    }

    fn enable_debug_logs(&self, enabled: bool, correlation_id: &str) {
        self.debug.enable(enabled, correlation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_part() {
        assert_eq!(host_part("example.com:443").unwrap(), "example.com");
        assert_eq!(host_part("10.0.0.1:80").unwrap(), "10.0.0.1");
        assert_eq!(host_part("[::1]:8443").unwrap(), "::1");
        assert!(host_part("example.com").is_err());
        assert!(host_part(":443").is_err());
        assert!(host_part("example.com:http").is_err());
    }

    #[tokio::test]
    async fn test_tls_rejects_bad_address() {
        let result = StreamRelay::tls("no-port", &TlsClientConfig::default(), Duration::from_secs(1));
        assert!(matches!(result, Err(RelayError::InvalidAddress(_))));
    }
}
