//! Transports carrying JSON frames to and from a backend
//!
//! A transport moves whole text frames; it knows nothing about the JSON
//! inside them. Implementations:
//! - [`WsTransport`]: one message per WebSocket text frame, what the backend
//!   serves by default
//! - [`LineTransport`]: newline-delimited frames over any async byte stream
//! - [`ChannelTransport`]: an in-memory pair, used to host a backend in the
//!   same process

use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, trace, warn};

/// Upper bound for a single inbound frame
const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// A bidirectional frame channel to a backend.
///
/// `recv_text` must be cancel-safe: callers race it against a timer.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Transmit a single frame
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Wait for the next frame; `None` once the peer closed the connection
    async fn recv_text(&mut self) -> Result<Option<String>>;

    /// Close the connection
    async fn close(&mut self) -> Result<()>;

    /// Check if connected
    fn is_connected(&self) -> bool;
}

/// Newline-delimited frames over an async byte stream
pub struct LineTransport<S> {
    framed: Framed<S, LinesCodec>,
    connected: bool,
}

impl<S> LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already connected stream
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)),
            connected: true,
        }
    }
}

impl LineTransport<TcpStream> {
    /// Connect to a backend over TCP
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Transport(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        debug!("Connected to backend at {}", addr);
        Ok(Self::new(stream))
    }
}

#[async_trait::async_trait]
impl<S> Transport for LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_text(&mut self, text: String) -> Result<()> {
        if !self.connected {
            return Err(Error::ConnectionClosed);
        }
        trace!("-> {}", text);
        self.framed.send(text).await?;
        Ok(())
    }

    async fn recv_text(&mut self) -> Result<Option<String>> {
        match self.framed.next().await {
            Some(Ok(line)) => {
                trace!("<- {}", line);
                Ok(Some(line))
            }
            Some(Err(e)) => Err(e.into()),
            None => {
                self.connected = false;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.connected {
            self.connected = false;
            SinkExt::<String>::close(&mut self.framed).await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// JSON messages carried in WebSocket frames
pub struct WsTransport<S> {
    stream: WebSocketStream<S>,
    connected: bool,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a stream that already completed the handshake
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self {
            stream,
            connected: true,
        }
    }
}

impl WsTransport<MaybeTlsStream<TcpStream>> {
    /// Open a WebSocket to `url`, e.g. `ws://127.0.0.1:8000/ws1.ws`
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::Transport(format!("Failed to connect to {}: {}", url, e)))?;
        debug!("Connected to backend at {} ({})", url, response.status());
        Ok(Self::new(stream))
    }
}

#[async_trait::async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_text(&mut self, text: String) -> Result<()> {
        if !self.connected {
            return Err(Error::ConnectionClosed);
        }
        trace!("-> {}", text);
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv_text(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    trace!("<- {}", text);
                    return Ok(Some(text));
                }
                Some(Ok(Message::Binary(data))) => {
                    let text = String::from_utf8(data)
                        .map_err(|e| Error::Transport(format!("Binary frame is not UTF-8: {}", e)))?;
                    trace!("<- {}", text);
                    return Ok(Some(text));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("WebSocket closed by backend: {:?}", frame);
                    self.connected = false;
                    return Ok(None);
                }
                // Pings are answered by the stream itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket error: {}", e);
                    self.connected = false;
                    return Err(e.into());
                }
                None => {
                    self.connected = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.connected {
            self.connected = false;
            self.stream.close(None).await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// One end of an in-memory frame channel
pub struct ChannelTransport {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

/// Create two connected in-memory transports
pub fn channel_pair() -> (ChannelTransport, ChannelTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        ChannelTransport { tx: Some(a_tx), rx: b_rx },
        ChannelTransport { tx: Some(b_tx), rx: a_rx },
    )
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::ConnectionClosed)?;
        trace!("-> {}", text);
        tx.send(text).map_err(|_| Error::ConnectionClosed)
    }

    async fn recv_text(&mut self) -> Result<Option<String>> {
        let frame = self.rx.recv().await;
        if let Some(text) = &frame {
            trace!("<- {}", text);
        }
        Ok(frame)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        self.rx.close();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.tx.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }
}

/// Opens fresh transports; used for the first connection and every reconnect
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

/// Connects to a backend over TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub address: String,
    pub connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let transport = tokio::time::timeout(self.connect_timeout, LineTransport::connect(&self.address))
            .await
            .map_err(|_| Error::Timeout {
                millis: self.connect_timeout.as_millis() as u64,
            })??;
        Ok(Box::new(transport))
    }
}

/// Connects to a backend's WebSocket endpoint
#[derive(Debug, Clone)]
pub struct WsConnector {
    pub url: String,
    pub connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let transport = tokio::time::timeout(self.connect_timeout, WsTransport::connect(&self.url))
            .await
            .map_err(|_| Error::Timeout {
                millis: self.connect_timeout.as_millis() as u64,
            })??;
        Ok(Box::new(transport))
    }
}

/// Any closure producing transports is a connector
#[async_trait::async_trait]
impl<F> Connector for F
where
    F: Fn() -> Result<Box<dyn Transport>> + Send + Sync,
{
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        (self)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_channel_pair_round_trip() {
        let (mut client, mut server) = channel_pair();
        client.send_text("{\"a\":1}".to_string()).await.unwrap();
        assert_eq!(server.recv_text().await.unwrap().as_deref(), Some("{\"a\":1}"));

        server.send_text("{\"b\":2}".to_string()).await.unwrap();
        assert_eq!(client.recv_text().await.unwrap().as_deref(), Some("{\"b\":2}"));
    }

    #[tokio::test]
    async fn test_channel_close_ends_peer_stream() {
        let (mut client, mut server) = channel_pair();
        server.close().await.unwrap();
        assert!(!server.is_connected());
        assert_eq!(client.recv_text().await.unwrap(), None);
        assert!(client.send_text("x".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_line_transport_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = LineTransport::new(stream);
            let frame = transport.recv_text().await.unwrap().unwrap();
            transport.send_text(format!("echo:{}", frame)).await.unwrap();
        });

        let connector = TcpConnector::new(addr, Duration::from_secs(2));
        let mut client = connector.connect().await.unwrap();
        client.send_text("hello".to_string()).await.unwrap();
        assert_eq!(client.recv_text().await.unwrap().as_deref(), Some("echo:hello"));

        server.await.unwrap();
        assert_eq!(client.recv_text().await.unwrap(), None);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_ws_transport_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws1.ws", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            socket.send(Message::Ping(b"alive".to_vec())).await.unwrap();
            while let Some(Ok(message)) = socket.next().await {
                match message {
                    Message::Text(text) => {
                        socket.send(Message::Text(format!("echo:{}", text))).await.unwrap();
                        socket.send(Message::Binary(b"{\"b\":2}".to_vec())).await.unwrap();
                        socket.close(None).await.unwrap();
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        let connector = WsConnector::new(url, Duration::from_secs(2));
        let mut client = connector.connect().await.unwrap();
        client.send_text("hello".to_string()).await.unwrap();
        assert_eq!(client.recv_text().await.unwrap().as_deref(), Some("echo:hello"));
        assert_eq!(client.recv_text().await.unwrap().as_deref(), Some("{\"b\":2}"));
        assert_eq!(client.recv_text().await.unwrap(), None);
        assert!(!client.is_connected());
        assert!(client.send_text("late".to_string()).await.is_err());

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_ws_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws1.ws", listener.local_addr().unwrap());
        drop(listener);

        let connector = WsConnector::new(url, Duration::from_secs(2));
        assert!(matches!(connector.connect().await, Err(Error::Transport(_))));
    }
}
