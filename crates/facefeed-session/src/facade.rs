//! Public session handle.
//!
//! A [`Session`] is a thin handle to a task that owns the [`Controller`].
//! Requests go over an mpsc channel with a oneshot reply, so every state
//! change happens on that one task.

use crate::config::SessionConfig;
use crate::controller::{Controller, Inbox, SessionSnapshot};
use crate::correlator::PendingCapture;
use crate::error::SessionError;
use crate::events::{self, SessionEvents};
use crate::socket::{Connector, WsConnector};
use facefeed_core::{AttemptId, ClientId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const COMMAND_BUFFER: usize = 8;

enum Command {
    Open {
        reply: oneshot::Sender<Result<AttemptId, SessionError>>,
    },
    Capture {
        reply: oneshot::Sender<Result<PendingCapture, SessionError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Dispose,
}

/// Owner's handle to one live-feed session.
///
/// Dropping the handle disposes the session: nothing is delivered to the
/// owner afterwards and the socket is closed in the background. Use
/// [`Session::dispose`] to wait for that teardown.
pub struct Session {
    client_id: ClientId,
    tx: mpsc::Sender<Command>,
    disposed: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Session {
    /// Start a session backed by a real WebSocket. Must be called inside a
    /// Tokio runtime. No connection is made until [`Session::open`].
    pub fn spawn(config: SessionConfig) -> (Session, SessionEvents) {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    pub fn with_connector(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> (Session, SessionEvents) {
        let client_id = ClientId::generate();
        let disposed = Arc::new(AtomicBool::new(false));
        let (sink, events) = events::channel(config.frame_buffer, disposed.clone());
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);

        tracing::info!(client = %client_id, service = %config.service_url, "session created");
        let controller = Controller::new(
            config,
            connector,
            client_id.clone(),
            inbox_tx,
            sink,
            disposed.clone(),
        );
        let task = tokio::spawn(run(controller, rx, inbox_rx));

        (
            Session {
                client_id,
                tx,
                disposed,
                task: Some(task),
            },
            events,
        )
    }

    /// Client identifier, fixed for the session's lifetime.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Begin a new connection attempt. Resolves once the socket is being
    /// opened; watch the event stream for `Connected`.
    pub async fn open(&self) -> Result<AttemptId, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Open { reply }).await?;
        rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Ask the service to search the current frame. The returned future
    /// resolves exactly once: with the result, or as abandoned.
    pub async fn capture(&self) -> Result<PendingCapture, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Capture { reply }).await?;
        rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Close the current attempt. Idempotent; never fails on transport errors.
    pub async fn close(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Close { reply }).await?;
        rx.await.map_err(|_| SessionError::ChannelClosed)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| SessionError::ChannelClosed)
    }

    /// Dispose the session and wait for its socket to be torn down.
    pub async fn dispose(mut self) {
        self.disposed.store(true, Ordering::Release);
        let _ = self.tx.send(Command::Dispose).await;
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!(
                    client = %self.client_id,
                    error = %err,
                    "session task ended abnormally"
                );
            }
        }
    }

    async fn request(&self, command: Command) -> Result<(), SessionError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(SessionError::ChannelClosed);
        }
        self.tx
            .send(command)
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.task.is_none() {
            return;
        }
        // The flag silences the controller at once; the command wakes the
        // task so it can tear down the socket.
        self.disposed.store(true, Ordering::Release);
        let _ = self.tx.try_send(Command::Dispose);
        tracing::debug!(client = %self.client_id, "session handle dropped");
    }
}

async fn run(
    mut controller: Controller,
    mut commands: mpsc::Receiver<Command>,
    mut inbox: mpsc::UnboundedReceiver<Inbox>,
) {
    while !controller.is_disposed() {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(Command::Open { reply }) => {
                    let _ = reply.send(controller.open().await);
                }
                Some(Command::Capture { reply }) => {
                    let _ = reply.send(controller.capture());
                }
                Some(Command::Close { reply }) => {
                    controller.close().await;
                    let _ = reply.send(());
                }
                Some(Command::Snapshot { reply }) => {
                    let _ = reply.send(controller.snapshot());
                }
                Some(Command::Dispose) | None => break,
            },
            Some(message) = inbox.recv() => controller.handle(message).await,
        }
    }
    controller.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{AbandonReason, CaptureOutcome};
    use crate::controller::SessionState;
    use crate::events::SessionEvent;
    use crate::testing::FakeConnector;
    use facefeed_core::MatchDescriptor;
    use serde_json::json;

    async fn wait_for(
        events: &mut SessionEvents,
        wanted: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        loop {
            let event = events.next().await.expect("session ended");
            if wanted(&event) {
                return event;
            }
        }
    }

    async fn connected_session(
        config: SessionConfig,
    ) -> (Session, SessionEvents, Arc<FakeConnector>) {
        let connector = FakeConnector::new();
        let (session, mut events) = Session::with_connector(config, connector.clone());
        let attempt = session.open().await.unwrap();
        // The socket task reports the transport open before reading anything.
        connector
            .socket((attempt.number - 1) as usize)
            .await
            .push(json!({"event": "connected"}));
        wait_for(&mut events, |e| matches!(e, SessionEvent::Connected { .. })).await;
        (session, events, connector)
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_then_result() {
        let (session, mut events, connector) = connected_session(SessionConfig::default()).await;
        let socket = connector.socket(0).await;

        let pending = session.capture().await.unwrap();
        socket.push(json!({
            "event": "search_result",
            "success": true,
            "matches": [{"path": "/gallery/1.jpg"}, {"path": "/gallery/2.jpg"}]
        }));

        let expected = CaptureOutcome::Matched(vec![
            MatchDescriptor {
                path: "/gallery/1.jpg".into(),
            },
            MatchDescriptor {
                path: "/gallery/2.jpg".into(),
            },
        ]);
        assert_eq!(pending.await, expected);
        let resolved =
            wait_for(&mut events, |e| matches!(e, SessionEvent::CaptureResolved { .. })).await;
        assert!(matches!(
            resolved,
            SessionEvent::CaptureResolved { outcome, .. } if outcome == expected
        ));
        assert_eq!(
            session.snapshot().await.unwrap().state,
            SessionState::Connected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_abandons_capture_and_reopen_uses_next_attempt() {
        let (session, mut events, connector) = connected_session(SessionConfig::default()).await;
        let socket = connector.socket(0).await;
        let pending = session.capture().await.unwrap();
        let first = pending.attempt().clone();

        session.close().await.unwrap();
        assert_eq!(
            pending.await,
            CaptureOutcome::Abandoned(AbandonReason::Closed)
        );
        assert_eq!(
            socket.sent(),
            vec![
                r#"{"action":"capture"}"#.to_string(),
                r#"{"action":"close"}"#.to_string()
            ]
        );
        assert!(socket.is_closed());
        wait_for(&mut events, |e| matches!(e, SessionEvent::Closed { .. })).await;

        let second = session.open().await.unwrap();
        assert_eq!(second.number, first.number + 1);
        assert_eq!(second.client, first.client);
        assert_eq!(&second.client, session.client_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_before_connected() {
        let connector = FakeConnector::new();
        let (session, _events) = Session::with_connector(SessionConfig::default(), connector);
        assert!(matches!(
            session.capture().await,
            Err(SessionError::NotReady(SessionState::Idle))
        ));
        session.open().await.unwrap();
        assert!(matches!(
            session.capture().await,
            Err(SessionError::NotReady(SessionState::Connecting))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_abandons_capture_silently() {
        let (session, mut events, connector) = connected_session(SessionConfig::default()).await;
        let socket = connector.socket(0).await;
        let pending = session.capture().await.unwrap();

        session.dispose().await;

        assert_eq!(
            pending.await,
            CaptureOutcome::Abandoned(AbandonReason::Disposed)
        );
        assert!(socket.sent().contains(&r#"{"action":"close"}"#.to_string()));
        assert!(socket.is_closed());
        // Only what was emitted before disposal is left, then the stream ends.
        while let Some(event) = events.next().await {
            assert!(!matches!(
                event,
                SessionEvent::Closed { .. } | SessionEvent::CaptureResolved { .. }
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_tears_down_socket() {
        let (session, mut events, connector) = connected_session(SessionConfig::default()).await;
        let socket = connector.socket(0).await;
        drop(session);

        // The stream ends once the session task has finished its teardown.
        while events.next().await.is_some() {}
        assert!(socket.is_closed());
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_tracks_feed() {
        let (session, mut events, connector) = connected_session(SessionConfig::default()).await;
        let socket = connector.socket(0).await;
        for faces in [0, 1, 2] {
            socket.push(json!({
                "event": "frame",
                "image": "AAAA",
                "faces_detected": faces,
                "fps": 12.5
            }));
        }
        wait_for(&mut events, |e| {
            matches!(e, SessionEvent::Frame { sequence: 3, .. })
        })
        .await;

        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.frames_received, 3);
        assert_eq!(snapshot.faces_detected, 2);
        assert_eq!(snapshot.fps, Some(12.5));
        assert_eq!(snapshot.retries_used, 0);
        assert_eq!(snapshot.attempt.map(|a| a.number), Some(1));
    }
}
