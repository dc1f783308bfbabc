//! Socket transport: one I/O task per connection, torn down by aborting it.

use async_trait::async_trait;
use dicefeed_core::FeedError;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// What the I/O task reports back, tagged with its generation by [`EventSink`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// Text or binary payload.
    Frame(Vec<u8>),
    Pong,
    Closed(String),
}

/// Frames the session writes to the socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping(Vec<u8>),
}

/// Reporting channel handed to a transport when it is opened.
#[derive(Clone, Debug)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the session is gone.
    pub fn frame(&self, payload: Vec<u8>) -> bool {
        self.emit(TransportEvent::Frame(payload))
    }

    pub fn pong(&self) -> bool {
        self.emit(TransportEvent::Pong)
    }

    pub fn closed(&self, reason: impl Into<String>) -> bool {
        self.emit(TransportEvent::Closed(reason.into()))
    }

    fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// A live transport. Dropping it tears the connection down.
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

impl TransportHandle {
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>, task: JoinHandle<()>) -> Self {
        Self { outbound, task }
    }

    /// Queue a frame. Returns `false` if the I/O task has already ended.
    pub fn send(&self, frame: Outbound) -> bool {
        self.outbound.send(frame).is_ok()
    }

    /// Abort the I/O task, which drops the socket without a close handshake.
    pub fn teardown(self) {
        drop(self);
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Opens transports. The returned handle's I/O task reports through `sink`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &SecretString, sink: EventSink) -> Result<TransportHandle, FeedError>;
}

/// `socket_url?token=<token>`, with the token URL-encoded.
pub fn socket_url(base: &str, token: &SecretString) -> Result<SecretString, FeedError> {
    let url = reqwest::Url::parse_with_params(base, &[("token", token.expose_secret())])
        .map_err(|e| FeedError::Transport(format!("invalid socket url: {e}")))?;
    Ok(SecretString::from(String::from(url)))
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &SecretString, sink: EventSink) -> Result<TransportHandle, FeedError> {
        let (ws, _) = connect_async(url.expose_secret())
            .await
            .map_err(|e| FeedError::Transport(format!("connect: {e}")))?;

        let (outbound, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let generation = sink.generation();

        let task = tokio::spawn(async move {
            let (mut ws_tx, mut ws_rx) = ws.split();
            loop {
                tokio::select! {
                    out = out_rx.recv() => {
                        let Some(out) = out else { break };
                        let msg = match out {
                            Outbound::Text(text) => Message::Text(text.into()),
                            Outbound::Ping(payload) => Message::Ping(payload.into()),
                        };
                        if let Err(e) = ws_tx.send(msg).await {
                            let _ = sink.closed(format!("send: {e}"));
                            break;
                        }
                    }
                    msg = ws_rx.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let _ = sink.frame(text.as_bytes().to_vec());
                            }
                            Some(Ok(Message::Binary(bytes))) => {
                                let _ = sink.frame(bytes.to_vec());
                            }
                            Some(Ok(Message::Pong(_))) => {
                                let _ = sink.pong();
                            }
                            Some(Ok(Message::Close(frame))) => {
                                let reason = frame
                                    .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                                    .unwrap_or_else(|| "closed without frame".into());
                                let _ = sink.closed(reason);
                                break;
                            }
                            // Pings are answered by tungstenite itself.
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(generation, error = %e, "socket error");
                                let _ = sink.closed(e.to_string());
                                break;
                            }
                            None => {
                                let _ = sink.closed("stream ended");
                                break;
                            }
                        }
                    }
                }
            }
            debug!(generation, "transport task finished");
        });

        Ok(TransportHandle::new(outbound, task))
    }
}
