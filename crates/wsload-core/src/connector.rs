use crate::error::{ConnectError, TransportError};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What an open connection can hand back to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Any data frame; content is not inspected
    Message,
    /// Peer closed the connection
    Closed,
}

/// Opens connections to the target. The session applies the connect timeout.
pub trait Connector: Send + Sync {
    fn name(&self) -> &'static str;

    fn connect<'a>(
        &'a self,
        url: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn Connection>, ConnectError>>;
}

/// One open, exclusively owned WebSocket connection.
///
/// `next_event` must be cancel-safe: the session polls it alongside its send
/// timer and cancellation token.
pub trait Connection: Send {
    fn send(&mut self, text: String) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Next inbound event. `None` means the stream ended without a close frame.
    fn next_event(&mut self) -> BoxFuture<'_, Option<Result<Inbound, TransportError>>>;

    fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// Real transport over tokio-tungstenite, `ws://` and `wss://` (rustls with
/// webpki roots).
#[derive(Debug)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        // Fails only if a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for WsConnector {
    fn name(&self) -> &'static str {
        "ws"
    }

    fn connect<'a>(
        &'a self,
        url: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn Connection>, ConnectError>> {
        Box::pin(async move {
            match connect_async(url).await {
                Ok((stream, response)) => {
                    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
                        return Err(ConnectError::Status(response.status().as_u16()));
                    }
                    Ok(Box::new(WsConnection { stream }) as Box<dyn Connection>)
                }
                Err(tungstenite::Error::Http(response)) => {
                    Err(ConnectError::Status(response.status().as_u16()))
                }
                Err(e) => Err(ConnectError::Transport(e.to_string())),
            }
        })
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connection for WsConnection {
    fn send(&mut self, text: String) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.stream
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| TransportError::Send(e.to_string()))
        })
    }

    fn next_event(&mut self) -> BoxFuture<'_, Option<Result<Inbound, TransportError>>> {
        Box::pin(async move {
            loop {
                return match self.stream.next().await? {
                    Ok(Message::Text(_)) | Ok(Message::Binary(_)) => Some(Ok(Inbound::Message)),
                    Ok(Message::Close(frame)) => {
                        debug!("Peer closed: {:?}", frame);
                        Some(Ok(Inbound::Closed))
                    }
                    // Pings are answered by tungstenite on the next write/flush.
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                        continue
                    }
                    Err(tungstenite::Error::ConnectionClosed) => Some(Ok(Inbound::Closed)),
                    Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
                };
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            match self.stream.close(None).await {
                Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
                Err(e) => Err(TransportError::Close(e.to_string())),
            }
        })
    }
}

/// Behaviour knobs for [`MockConnector`].
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Simulated handshake time
    pub connect_delay: Duration,
    /// Handshake status; anything but 101 fails the connect
    pub status: u16,
    /// Echo every sent message back as an inbound message
    pub echo: bool,
    /// Fail the Nth send (1-based) with a transport error
    pub fail_on_send: Option<u64>,
    /// Peer sends a close frame after the Nth send (1-based)
    pub close_after_send: Option<u64>,
    /// Time the close handshake takes
    pub close_delay: Duration,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            connect_delay: Duration::ZERO,
            status: 101,
            echo: true,
            fail_on_send: None,
            close_after_send: None,
            close_delay: Duration::ZERO,
        }
    }
}

/// In-process connector for tests and dry runs (no network).
pub struct MockConnector {
    behavior: MockBehavior,
    connects: AtomicU64,
}

impl MockConnector {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            connects: AtomicU64::new(0),
        }
    }

    /// Echo server that accepts immediately.
    pub fn echo() -> Self {
        Self::new(MockBehavior::default())
    }

    /// Number of connect calls made so far.
    pub fn connect_calls(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }
}

impl Connector for MockConnector {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn connect<'a>(
        &'a self,
        _url: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn Connection>, ConnectError>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::Relaxed);
            if !self.behavior.connect_delay.is_zero() {
                sleep(self.behavior.connect_delay).await;
            }
            if self.behavior.status != 101 {
                return Err(ConnectError::Status(self.behavior.status));
            }

            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            Ok(Box::new(MockConnection {
                behavior: self.behavior.clone(),
                sends: 0,
                inbound_tx,
                inbound_rx,
            }) as Box<dyn Connection>)
        })
    }
}

struct MockConnection {
    behavior: MockBehavior,
    sends: u64,
    inbound_tx: mpsc::UnboundedSender<Result<Inbound, TransportError>>,
    inbound_rx: mpsc::UnboundedReceiver<Result<Inbound, TransportError>>,
}

impl Connection for MockConnection {
    fn send(&mut self, _text: String) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.sends += 1;
            if self.behavior.fail_on_send == Some(self.sends) {
                return Err(TransportError::Send("connection reset by peer".to_string()));
            }
            if self.behavior.echo {
                let _ = self.inbound_tx.send(Ok(Inbound::Message));
            }
            if self.behavior.close_after_send == Some(self.sends) {
                let _ = self.inbound_tx.send(Ok(Inbound::Closed));
            }
            Ok(())
        })
    }

    fn next_event(&mut self) -> BoxFuture<'_, Option<Result<Inbound, TransportError>>> {
        // The connection holds its own sender, so this pends until something is echoed.
        Box::pin(async move { self.inbound_rx.recv().await })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if !self.behavior.close_delay.is_zero() {
                sleep(self.behavior.close_delay).await;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_echo() {
        let connector = MockConnector::echo();
        let mut conn = connector.connect("ws://mock").await.unwrap();

        conn.send("hello".to_string()).await.unwrap();
        assert_eq!(conn.next_event().await.unwrap().unwrap(), Inbound::Message);
        conn.close().await.unwrap();
        assert_eq!(connector.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_rejects_non_101() {
        let connector = MockConnector::new(MockBehavior {
            status: 500,
            ..MockBehavior::default()
        });

        match connector.connect("ws://mock").await {
            Err(ConnectError::Status(500)) => {}
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("connect should fail"),
        }
    }

    #[tokio::test]
    async fn test_mock_fails_nth_send() {
        let connector = MockConnector::new(MockBehavior {
            fail_on_send: Some(2),
            ..MockBehavior::default()
        });
        let mut conn = connector.connect("ws://mock").await.unwrap();

        assert!(conn.send("a".to_string()).await.is_ok());
        assert!(matches!(
            conn.send("b".to_string()).await,
            Err(TransportError::Send(_))
        ));
    }

    #[tokio::test]
    async fn test_wss_reaches_tls_handshake() {
        // Plain TCP listener: the TLS handshake fails, but only after the
        // connector has accepted the scheme.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let result = WsConnector::new()
            .connect(&format!("wss://127.0.0.1:{port}/ws"))
            .await;
        match result {
            Err(ConnectError::Transport(msg)) => {
                assert!(!msg.contains("not compiled"), "TLS unavailable: {msg}")
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("handshake against a plain socket should fail"),
        }
    }

    #[tokio::test]
    async fn test_ws_connector_refused() {
        // Nothing listens on port 1.
        let result = WsConnector::new().connect("ws://127.0.0.1:1/ws").await;
        assert!(matches!(result, Err(ConnectError::Transport(_))));
    }
}
