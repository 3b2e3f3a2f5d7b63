//! Per-attempt socket task and the transport seam.
//!
//! Each connection attempt runs one task that owns the WebSocket. The
//! controller talks to it only through a [`SocketHandle`]; the task reports
//! back through the controller's inbox, stamping every event with its attempt.

use crate::controller::Inbox;
use facefeed_core::{encode_command, AttemptId, ClientCommand, CodecError};
use futures_util::future::{self, BoxFuture};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("encode: {0}")]
    Encode(#[from] CodecError),
    #[error("socket closed")]
    Closed,
}

/// A message read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(usize),
    Close { code: Option<u16>, reason: String },
}

pub type WireSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type WireStream = Pin<Box<dyn Stream<Item = Result<WireMessage, TransportError>> + Send>>;
/// Write and read halves of one connection.
pub type WirePair = (WireSink, WireStream);

/// Opens the duplex connection for one attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<WirePair, TransportError>>;
}

/// [`Connector`] backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<WirePair, TransportError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws, response) = tokio_tungstenite::connect_async(url.as_str()).await?;
            tracing::debug!(
                url = %url,
                status = %response.status(),
                "websocket handshake complete"
            );

            let (sink, stream) = ws.split();
            let sink = sink
                .with(|text: String| {
                    future::ready(Ok::<_, tungstenite::Error>(Message::Text(text)))
                })
                .sink_map_err(TransportError::from);
            let stream = stream.filter_map(|item| {
                future::ready(match item {
                    Ok(Message::Text(text)) => Some(Ok(WireMessage::Text(text))),
                    Ok(Message::Binary(data)) => Some(Ok(WireMessage::Binary(data.len()))),
                    Ok(Message::Close(frame)) => Some(Ok(match frame {
                        Some(frame) => WireMessage::Close {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.into_owned(),
                        },
                        None => WireMessage::Close {
                            code: None,
                            reason: String::new(),
                        },
                    })),
                    // ping/pong are answered by tungstenite itself
                    Ok(_) => None,
                    Err(err) => Some(Err(TransportError::from(err))),
                })
            });

            Ok((Box::pin(sink) as WireSink, Box::pin(stream) as WireStream))
        })
    }
}

/// What the socket task reports to the controller.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    /// Transport-level handshake finished. Not yet protocol-ready.
    Opened,
    Text(String),
    Binary(usize),
    Closed { code: Option<u16>, reason: String },
    /// The connection never came up.
    Failed(String),
}

enum Outbound {
    Text(String),
    Shutdown,
}

/// The controller's only handle on an attempt's socket.
pub(crate) struct SocketHandle {
    pub(crate) attempt: AttemptId,
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
    /// Owned by the socket task: set once the handshake completes, cleared
    /// when the task stops reading.
    open: Arc<AtomicBool>,
}

impl SocketHandle {
    /// Spawn the socket task for `attempt`. Connecting starts immediately.
    pub(crate) fn spawn(
        connector: Arc<dyn Connector>,
        url: String,
        attempt: AttemptId,
        inbox: mpsc::UnboundedSender<Inbox>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_socket(
            connector,
            url,
            attempt.clone(),
            open.clone(),
            outbound_rx,
            inbox,
        ));
        Self {
            attempt,
            outbound: outbound_tx,
            task,
            open,
        }
    }

    /// Whether the wire is up right now, whether or not the controller has
    /// seen the `Opened` event yet.
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queue a command for the wire. Fails only if the socket task is gone.
    pub(crate) fn send(&self, command: ClientCommand) -> Result<(), TransportError> {
        let text = encode_command(command)?;
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    /// Close the local socket: ask the task to close its sink, wait up to
    /// `wait` for it to finish, then abort it.
    pub(crate) async fn close_local(&mut self, wait: Duration) {
        let _ = self.outbound.send(Outbound::Shutdown);
        if tokio::time::timeout(wait, &mut self.task).await.is_err() {
            tracing::debug!(attempt = %self.attempt, "socket task still closing; aborting");
            self.task.abort();
        }
        self.open.store(false, Ordering::Release);
    }
}

async fn run_socket(
    connector: Arc<dyn Connector>,
    url: String,
    attempt: AttemptId,
    open: Arc<AtomicBool>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inbox: mpsc::UnboundedSender<Inbox>,
) {
    let report = |event: TransportEvent| {
        let _ = inbox.send(Inbox::Transport {
            attempt: attempt.clone(),
            event,
        });
    };

    let connected = tokio::select! {
        result = connector.connect(&url) => result,
        _ = shutdown_requested(&mut outbound) => {
            tracing::debug!(%attempt, "socket shut down before handshake completed");
            return;
        }
    };

    let (mut sink, mut stream) = match connected {
        Ok(pair) => pair,
        Err(err) => {
            tracing::warn!(%attempt, error = %err, "websocket connect failed");
            report(TransportEvent::Failed(err.to_string()));
            return;
        }
    };
    // Visible to the controller before it dequeues `Opened`.
    open.store(true, Ordering::Release);
    report(TransportEvent::Opened);

    let ended = pump(&attempt, &mut sink, &mut stream, &mut outbound, &report).await;
    open.store(false, Ordering::Release);
    if let Some(event) = ended {
        report(event);
    }
}

/// Move traffic until either side closes. Returns the closing event to
/// report, or `None` when the controller asked for the shutdown.
async fn pump(
    attempt: &AttemptId,
    sink: &mut WireSink,
    stream: &mut WireStream,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    report: &impl Fn(TransportEvent),
) -> Option<TransportEvent> {
    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Text(text)) => {
                    if let Err(err) = sink.send(text).await {
                        tracing::warn!(%attempt, error = %err, "websocket send failed");
                    }
                }
                Some(Outbound::Shutdown) | None => {
                    if let Err(err) = sink.close().await {
                        tracing::debug!(%attempt, error = %err, "websocket close failed");
                    }
                    return None;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WireMessage::Text(text))) => report(TransportEvent::Text(text)),
                Some(Ok(WireMessage::Binary(len))) => report(TransportEvent::Binary(len)),
                Some(Ok(WireMessage::Close { code, reason })) => {
                    return Some(TransportEvent::Closed { code, reason });
                }
                Some(Err(err)) => {
                    return Some(TransportEvent::Closed {
                        code: None,
                        reason: err.to_string(),
                    });
                }
                None => {
                    return Some(TransportEvent::Closed {
                        code: None,
                        reason: String::new(),
                    });
                }
            },
        }
    }
}

/// Resolves once the controller asks for shutdown. Nothing is sent before the
/// socket opens, so any text queued this early is dropped.
async fn shutdown_requested(outbound: &mut mpsc::UnboundedReceiver<Outbound>) {
    loop {
        match outbound.recv().await {
            Some(Outbound::Shutdown) | None => return,
            Some(Outbound::Text(_)) => {
                tracing::warn!("dropping message queued before the socket opened");
            }
        }
    }
}
