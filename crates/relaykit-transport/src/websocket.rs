//! WebSocket endpoint
//!
//! Each relay message travels as one binary WebSocket message. Text messages
//! are accepted as payload too; control frames never reach the engine.

use crate::tls::{server_name, TlsClientConfig};
use crate::{guarded, BoxedIo, DebugLog, Io, Peer, Relay, RelayError, RelayResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

type WsStream = WebSocketStream<BoxedIo>;

struct WsDialer {
    url: Url,
    addr: String,
    tls: Option<TlsConnector>,
}

impl WsDialer {
    fn parse(url: &str, tls: &TlsClientConfig) -> RelayResult<Self> {
        let url =
            Url::parse(url).map_err(|e| RelayError::InvalidAddress(format!("{}: {}", url, e)))?;
        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(RelayError::InvalidAddress(format!(
                    "unsupported scheme {}",
                    other
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| RelayError::InvalidAddress(format!("{} has no host", url)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| RelayError::InvalidAddress(format!("{} has no port", url)))?;
        let addr = match url.host() {
            Some(url::Host::Ipv6(ip)) => format!("[{}]:{}", ip, port),
            _ => format!("{}:{}", host, port),
        };

        Ok(Self {
            tls: if secure {
                Some(tls.build_connector()?)
            } else {
                None
            },
            addr,
            url,
        })
    }

    async fn dial(&self) -> RelayResult<WsStream> {
        let tcp = TcpStream::connect(self.addr.as_str()).await?;
        tcp.set_nodelay(true)?;

        let io: BoxedIo = match &self.tls {
            Some(connector) => {
                let host = self.url.host_str().unwrap_or_default();
                let host = host.trim_start_matches('[').trim_end_matches(']');
                let tls = connector
                    .connect(server_name(host)?, tcp)
                    .await
                    .map_err(|e| RelayError::Tls(format!("TLS handshake failed: {}", e)))?;
                Box::new(tls)
            }
            None => Box::new(tcp),
        };

        let (ws, _response) = tokio_tungstenite::client_async(self.url.as_str(), io)
            .await
            .map_err(|e| RelayError::WebSocket(format!("Handshake failed: {}", e)))?;
        Ok(ws)
    }
}

/// Message endpoint over a WebSocket connection
pub struct WebSocketRelay {
    dialer: Option<WsDialer>,
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    source: Mutex<Option<SplitStream<WsStream>>>,
    timeout: Duration,
    shutdown: CancellationToken,
    debug: DebugLog,
}

impl std::fmt::Debug for WebSocketRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketRelay")
            .field("url", &self.dialer.as_ref().map(|d| d.url.as_str()))
            .field("timeout", &self.timeout)
            .field("closed", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl WebSocketRelay {
    fn build(dialer: Option<WsDialer>, ws: Option<WsStream>, timeout: Duration) -> Self {
        let (sink, source) = match ws {
            Some(ws) => {
                let (sink, source) = ws.split();
                (Some(sink), Some(source))
            }
            None => (None, None),
        };

        Self {
            dialer,
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            timeout,
            shutdown: CancellationToken::new(),
            debug: DebugLog::new(),
        }
    }

    /// Client for a `ws://` or `wss://` URL; call [`Relay::connect`]
    pub fn dial(url: &str, tls: &TlsClientConfig, timeout: Duration) -> RelayResult<Self> {
        Ok(Self::build(Some(WsDialer::parse(url, tls)?), None, timeout))
    }

    /// Run the server handshake on an accepted stream
    pub async fn accept(stream: impl Io + 'static, timeout: Duration) -> RelayResult<Self> {
        let io: BoxedIo = Box::new(stream);
        let ws = tokio::time::timeout(timeout, tokio_tungstenite::accept_async(io))
            .await
            .map_err(|_| RelayError::Timeout)?
            .map_err(|e| RelayError::WebSocket(format!("Handshake failed: {}", e)))?;
        Ok(Self::build(None, Some(ws), timeout))
    }

    /// Run the client handshake for `url` over an existing stream
    pub async fn client_over(
        url: &str,
        stream: impl Io + 'static,
        timeout: Duration,
    ) -> RelayResult<Self> {
        let io: BoxedIo = Box::new(stream);
        let (ws, _response) =
            tokio::time::timeout(timeout, tokio_tungstenite::client_async(url, io))
                .await
                .map_err(|_| RelayError::Timeout)?
                .map_err(|e| RelayError::WebSocket(format!("Handshake failed: {}", e)))?;
        Ok(Self::build(None, Some(ws), timeout))
    }
}

#[async_trait]
impl Relay for WebSocketRelay {
    async fn connect(&self) -> RelayResult<()> {
        let Some(dialer) = &self.dialer else {
            return Ok(());
        };

        let ws = guarded(&self.shutdown, self.timeout, dialer.dial()).await?;
        debug!("WebSocket connection established to {}", dialer.url);

        let (sink, source) = ws.split();
        *self.sink.lock().await = Some(sink);
        *self.source.lock().await = Some(source);
        Ok(())
    }

    fn close(&self) {
        self.shutdown.cancel();
        if let Ok(mut sink) = self.sink.try_lock() {
            sink.take();
        }
        if let Ok(mut source) = self.source.try_lock() {
            source.take();
        }
    }

    async fn send_msg(&self, data: &[u8]) -> RelayResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(RelayError::ConnectionClosed);
        }
        self.debug.log_data(data, "send");

        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(RelayError::NotConnected)?;

        guarded(&self.shutdown, self.timeout, async {
            sink.send(Message::Binary(data.to_vec()))
                .await
                .map_err(|e| RelayError::WebSocket(e.to_string()))
        })
        .await
    }

    async fn recv_msg(&self) -> RelayResult<(Bytes, Option<Peer>)> {
        if self.shutdown.is_cancelled() {
            return Err(RelayError::ConnectionClosed);
        }

        let mut source = self.source.lock().await;
        let source = source.as_mut().ok_or(RelayError::NotConnected)?;

        let data = guarded(&self.shutdown, self.timeout, async {
            loop {
                match source.next().await {
                    Some(Ok(Message::Binary(data))) => return Ok(Bytes::from(data)),
                    Some(Ok(Message::Text(text))) => return Ok(Bytes::from(text.into_bytes())),
                    Some(Ok(Message::Close(frame))) => {
                        debug!("WebSocket closed by peer: {:?}", frame);
                        return Err(RelayError::ConnectionClosed);
                    }
                    Some(Ok(other)) => {
                        trace!("Skipping WebSocket control message: {:?}", other);
                    }
                    Some(Err(e)) => return Err(RelayError::WebSocket(e.to_string())),
                    None => return Err(RelayError::ConnectionClosed),
                }
            }
        })
        .await?;

        self.debug.log_data(&data, "recv");
        Ok((data, None))
    }

    fn enable_debug_logs(&self, enabled: bool, correlation_id: &str) {
        self.debug.enable(enabled, correlation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_urls() {
        let tls = TlsClientConfig::default();

        let d = WsDialer::parse("ws://example.com/tunnel", &tls).unwrap();
        assert_eq!(d.addr, "example.com:80");
        assert!(d.tls.is_none());

        let d = WsDialer::parse("wss://example.com:8443/tunnel", &tls).unwrap();
        assert_eq!(d.addr, "example.com:8443");
        assert!(d.tls.is_some());

        let d = WsDialer::parse("ws://[::1]:9000/", &tls).unwrap();
        assert_eq!(d.addr, "[::1]:9000");
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        let tls = TlsClientConfig::default();
        assert!(matches!(
            WsDialer::parse("http://example.com/", &tls),
            Err(RelayError::InvalidAddress(_))
        ));
        assert!(WsDialer::parse("not a url", &tls).is_err());
    }
}
