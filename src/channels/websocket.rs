//! WebSocket-backed [`RealtimeChannel`], available with the default
//! `transport-websocket` feature.
//!
//! The engine speaks newline-free JSON text frames; this adapter maps each
//! frame onto one WebSocket text message via `tokio-tungstenite`. Control
//! traffic (ping/pong, close handshake) stays inside the adapter: the
//! channel loop only ever sees complete text frames. `ws://` and `wss://`
//! both work, TLS is negotiated by
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! When the engine reports `ConnectionStatus::Lost`, re-dial with
//! [`WebSocketChannel::connect_with_retry`] and hand the fresh channel to a
//! new `SessionSync::connect` call.
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), thirty_sync::SyncError> {
//! use std::time::Duration;
//! use thirty_sync::WebSocketChannel;
//!
//! let channel = WebSocketChannel::connect_with_retry(
//!     "wss://realtime.example/socket",
//!     5,
//!     Duration::from_millis(250),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::channel::RealtimeChannel;
use crate::error::SyncError;

/// The stream type produced by [`tokio_tungstenite::connect_async`].
///
/// Public so callers with custom TLS or header requirements can dial
/// themselves and wrap the result with [`WebSocketChannel::from_stream`].
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`RealtimeChannel`] over a WebSocket connection.
///
/// `recv` is cancel-safe: tungstenite's read half buffers partial frames
/// internally, so dropping an in-flight `recv` inside `tokio::select!`
/// loses nothing.
#[derive(Debug)]
pub struct WebSocketChannel {
    stream: WsStream,
    closed: bool,
}

fn dial_error(e: WsError) -> SyncError {
    match e {
        WsError::Io(io) => SyncError::Io(io),
        other => SyncError::Io(std::io::Error::other(other)),
    }
}

impl WebSocketChannel {
    /// Dial `url` and complete the WebSocket handshake.
    ///
    /// # Errors
    ///
    /// [`SyncError::Io`] when the URL does not parse, the host is
    /// unreachable, or the upgrade is rejected.
    pub async fn connect(url: &str) -> Result<Self, SyncError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(dial_error)?;
        tracing::debug!(url, "websocket channel open");
        Ok(Self {
            stream,
            closed: false,
        })
    }

    /// Like [`connect`](Self::connect), but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// [`SyncError::Timeout`] when the deadline passes mid-handshake,
    /// otherwise whatever [`connect`](Self::connect) returned.
    pub async fn connect_with_timeout(url: &str, timeout: Duration) -> Result<Self, SyncError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| SyncError::Timeout)?
    }

    /// Dial with up to `attempts` tries, doubling the delay between tries
    /// starting from `first_backoff`.
    ///
    /// Intended for the reconnect path: once the engine parks in
    /// `ConnectionStatus::Lost`, call this and pass the fresh channel to a
    /// new `SessionSync::connect`.
    ///
    /// # Errors
    ///
    /// The error of the final attempt. `attempts` is clamped to at least 1.
    pub async fn connect_with_retry(
        url: &str,
        attempts: u32,
        first_backoff: Duration,
    ) -> Result<Self, SyncError> {
        let tries = attempts.max(1);
        let mut backoff = first_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::connect(url).await {
                Ok(channel) => return Ok(channel),
                Err(e) if attempt >= tries => return Err(e),
                Err(e) => {
                    tracing::debug!(url, attempt, error = %e, "dial failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    /// Wrap an already-established stream (custom TLS, proxies, extra
    /// handshake headers).
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

#[async_trait]
impl RealtimeChannel for WebSocketChannel {
    async fn send(&mut self, frame: String) -> Result<(), SyncError> {
        if self.closed {
            return Err(SyncError::ChannelClosed);
        }
        self.stream
            .send(Message::text(frame))
            .await
            .map_err(|e| SyncError::ChannelSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, SyncError>> {
        while let Some(item) = self.stream.next().await {
            let message = match item {
                Ok(message) => message,
                Err(e) => return Some(Err(SyncError::ChannelReceive(e.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(reason) => {
                    tracing::debug!(
                        code = ?reason.as_ref().map(|f| f.code),
                        "service closed the websocket"
                    );
                    return None;
                }
                // Pings are answered by tungstenite's write half; pongs and
                // raw frames carry nothing the engine wants.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                Message::Binary(payload) => {
                    tracing::warn!(len = payload.len(), "dropping binary frame");
                }
            }
        }
        None
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| SyncError::ChannelSend(e.to_string()))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    use crate::model::SessionCode;
    use crate::protocol::{ClientFrame, ServerFrame};

    type ServerWs = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    /// Serve one WebSocket connection on an ephemeral port, returning the
    /// URL to dial.
    async fn serve_once<F, Fut>(handler: F) -> String
    where
        F: FnOnce(ServerWs) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });
        format!("ws://{addr}")
    }

    fn subscribed_json() -> String {
        let frame = ServerFrame::Subscribed {
            session_code: SessionCode::new("AB12").unwrap(),
        };
        serde_json::to_string(&frame).unwrap()
    }

    #[test]
    fn channel_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketChannel>();
    }

    #[tokio::test]
    async fn delivers_service_frames_in_order() {
        let url = serve_once(|mut ws| async move {
            ws.send(Message::text(subscribed_json())).await.unwrap();
            let roster = ServerFrame::PresenceSync {
                participants: vec![],
            };
            ws.send(Message::text(serde_json::to_string(&roster).unwrap()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut channel = WebSocketChannel::connect(&url).await.unwrap();

        let first: ServerFrame =
            serde_json::from_str(&channel.recv().await.unwrap().unwrap()).unwrap();
        assert!(matches!(first, ServerFrame::Subscribed { .. }));
        let second: ServerFrame =
            serde_json::from_str(&channel.recv().await.unwrap().unwrap()).unwrap();
        assert!(matches!(second, ServerFrame::PresenceSync { .. }));

        // The close handshake surfaces as end-of-stream.
        assert!(channel.recv().await.is_none());
    }

    #[tokio::test]
    async fn control_and_binary_frames_never_surface() {
        let url = serve_once(|mut ws| async move {
            ws.send(Message::Ping(vec![1].into())).await.unwrap();
            ws.send(Message::Binary(vec![0x00, 0x01].into()))
                .await
                .unwrap();
            ws.send(Message::text(subscribed_json())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut channel = WebSocketChannel::connect(&url).await.unwrap();

        // The first frame the channel yields is the real one.
        let frame: ServerFrame =
            serde_json::from_str(&channel.recv().await.unwrap().unwrap()).unwrap();
        assert!(matches!(frame, ServerFrame::Subscribed { .. }));
    }

    #[tokio::test]
    async fn sends_engine_frames_as_text() {
        let url = serve_once(|mut ws| async move {
            // Echo the first text frame back to the client.
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut channel = WebSocketChannel::connect(&url).await.unwrap();
        let unsubscribe = serde_json::to_string(&ClientFrame::Unsubscribe).unwrap();
        channel.send(unsubscribe).await.unwrap();

        let echoed: ClientFrame =
            serde_json::from_str(&channel.recv().await.unwrap().unwrap()).unwrap();
        assert_eq!(echoed, ClientFrame::Unsubscribe);
    }

    #[tokio::test]
    async fn send_after_close_reports_channel_closed() {
        let url = serve_once(|mut ws| async move {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut channel = WebSocketChannel::connect(&url).await.unwrap();
        channel.close().await.unwrap();
        // Close again: the flag makes it a no-op.
        channel.close().await.unwrap();

        let err = channel
            .send(subscribed_json())
            .await
            .expect_err("closed channel must refuse writes");
        assert!(matches!(err, SyncError::ChannelClosed));
    }

    #[tokio::test]
    async fn from_stream_wraps_an_existing_connection() {
        let url = serve_once(|mut ws| async move {
            ws.send(Message::text(subscribed_json())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let (stream, _response) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let mut channel = WebSocketChannel::from_stream(stream);

        let frame: ServerFrame =
            serde_json::from_str(&channel.recv().await.unwrap().unwrap()).unwrap();
        assert!(matches!(frame, ServerFrame::Subscribed { .. }));
    }

    #[tokio::test]
    async fn connect_rejects_a_malformed_url() {
        let err = WebSocketChannel::connect("not-a-url").await.unwrap_err();
        assert!(matches!(err, SyncError::Io(_)));
    }

    #[tokio::test]
    async fn connect_with_timeout_gives_up_on_a_silent_listener() {
        // Accept the TCP connection but never answer the upgrade, so the
        // handshake stalls and the deadline is what ends it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let _socket = listener.accept().await;
            std::future::pending::<()>().await;
        });

        let result = WebSocketChannel::connect_with_timeout(
            &format!("ws://{addr}"),
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(result.unwrap_err(), SyncError::Timeout));
        hold.abort();
    }

    #[tokio::test]
    async fn connect_with_retry_returns_the_last_dial_error() {
        let result = WebSocketChannel::connect_with_retry(
            "ws://127.0.0.1:1",
            3,
            Duration::from_millis(1),
        )
        .await;
        assert!(matches!(result.unwrap_err(), SyncError::Io(_)));
    }

    #[tokio::test]
    async fn connect_with_retry_stops_at_the_first_success() {
        let url = serve_once(|mut ws| async move {
            ws.send(Message::text(subscribed_json())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut channel = WebSocketChannel::connect_with_retry(&url, 3, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(channel.recv().await.unwrap().is_ok());
    }
}
