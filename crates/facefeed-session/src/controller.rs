//! Connection lifecycle controller.
//!
//! Owns every piece of session state and runs inside the session task, so
//! handlers never interleave. Transport events and timers arrive stamped with
//! the attempt they belong to and are dropped unless that attempt is current.

use crate::cleanup::cleanup;
use crate::config::SessionConfig;
use crate::correlator::{AbandonReason, CaptureCorrelator, CaptureOutcome, PendingCapture};
use crate::error::SessionError;
use crate::events::{EventSink, SessionEvent};
use crate::socket::{Connector, SocketHandle, TransportEvent};
use facefeed_core::{
    decode_event, AttemptId, ClientCommand, ClientId, CodecError, ReconnectPolicy, RetryDecision,
    ServiceEvent, Termination,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Log every Nth frame.
const FRAME_LOG_INTERVAL: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Capturing,
    Closed,
    Errored,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Capturing => write!(f, "capturing"),
            SessionState::Closed => write!(f, "closed"),
            SessionState::Errored => write!(f, "errored"),
        }
    }
}

/// Point-in-time view of a session, for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Most recent attempt, if any was made.
    pub attempt: Option<AttemptId>,
    pub frames_received: u64,
    pub faces_detected: u32,
    pub fps: Option<f64>,
    pub retries_used: u32,
    pub dropped_frames: u64,
}

/// Internal events for the controller, each stamped with its attempt.
#[derive(Debug)]
pub(crate) enum Inbox {
    Transport {
        attempt: AttemptId,
        event: TransportEvent,
    },
    ConnectTimeout(AttemptId),
    RetryDue(AttemptId),
}

pub(crate) struct Controller {
    config: SessionConfig,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    client_id: ClientId,
    state: SessionState,
    attempt_number: u32,
    /// The current attempt's socket. `Some` only while connecting or connected.
    socket: Option<SocketHandle>,
    connect_timer: Option<JoinHandle<()>>,
    correlator: CaptureCorrelator,
    retries_used: u32,
    frames_received: u64,
    faces_detected: u32,
    fps: Option<f64>,
    inbox: mpsc::UnboundedSender<Inbox>,
    events: EventSink,
    disposed: Arc<AtomicBool>,
}

impl Controller {
    pub(crate) fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        client_id: ClientId,
        inbox: mpsc::UnboundedSender<Inbox>,
        events: EventSink,
        disposed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            policy: config.reconnect_policy(),
            config,
            connector,
            client_id,
            state: SessionState::Idle,
            attempt_number: 0,
            socket: None,
            connect_timer: None,
            correlator: CaptureCorrelator::default(),
            retries_used: 0,
            frames_received: 0,
            faces_detected: 0,
            fps: None,
            inbox,
            events,
            disposed,
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            attempt: (self.attempt_number > 0)
                .then(|| AttemptId::new(self.client_id.clone(), self.attempt_number)),
            frames_received: self.frames_received,
            faces_detected: self.faces_detected,
            fps: self.fps,
            retries_used: self.retries_used,
            dropped_frames: self.events.dropped_frames(),
        }
    }

    fn current_attempt(&self) -> Option<&AttemptId> {
        self.socket.as_ref().map(|socket| &socket.attempt)
    }

    fn is_current(&self, attempt: &AttemptId) -> bool {
        self.current_attempt() == Some(attempt)
    }

    /// Start a new connection attempt.
    pub(crate) async fn open(&mut self) -> Result<AttemptId, SessionError> {
        match self.state {
            SessionState::Idle | SessionState::Closed | SessionState::Errored => {}
            state => return Err(SessionError::AlreadyActive(state)),
        }

        let had_previous = self.attempt_number > 0;
        self.attempt_number += 1;
        let attempt = AttemptId::new(self.client_id.clone(), self.attempt_number);
        tracing::info!(%attempt, "starting connection attempt");

        // The previous socket must be fully gone before the next one exists.
        self.cancel_connect_timer();
        cleanup(&mut self.socket, self.config.close_grace).await;
        if had_previous {
            tokio::time::sleep(self.config.reopen_grace).await;
        }

        self.frames_received = 0;
        self.faces_detected = 0;
        self.fps = None;

        let url = match self.config.endpoint_for(&attempt) {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!(%attempt, error = %err, "cannot build feed endpoint");
                self.state = SessionState::Errored;
                let decision = self
                    .policy
                    .decide(Termination::TransportFailure, self.retries_used);
                self.events.status(SessionEvent::Terminated {
                    attempt,
                    termination: Termination::TransportFailure,
                    message: err.to_string(),
                    decision,
                });
                return Err(SessionError::InvalidEndpoint(err));
            }
        };

        tracing::info!(%attempt, url = %url, "opening feed socket");
        self.socket = Some(SocketHandle::spawn(
            self.connector.clone(),
            url,
            attempt.clone(),
            self.inbox.clone(),
        ));
        self.arm_connect_timer(attempt.clone());
        self.state = SessionState::Connecting;
        self.events.status(SessionEvent::Connecting {
            attempt: attempt.clone(),
        });
        Ok(attempt)
    }

    /// Close the session. Safe to call in any state, any number of times.
    pub(crate) async fn close(&mut self) {
        if self.state == SessionState::Closed && self.socket.is_none() {
            tracing::debug!(client = %self.client_id, "close: already closed");
            return;
        }

        let attempt = self.current_attempt().cloned();
        self.cancel_connect_timer();
        self.abandon_capture(AbandonReason::Closed);
        cleanup(&mut self.socket, self.config.close_grace).await;
        self.state = SessionState::Closed;

        tracing::info!(client = %self.client_id, attempt = self.attempt_number, "session closed");
        self.events.status(SessionEvent::Closed { attempt });
    }

    /// Send a capture request on the current attempt.
    pub(crate) fn capture(&mut self) -> Result<PendingCapture, SessionError> {
        let attempt = match (self.state, self.current_attempt()) {
            (SessionState::Connected, Some(attempt)) => attempt.clone(),
            (SessionState::Capturing, Some(attempt)) => {
                return Err(SessionError::AlreadyCapturing(attempt.clone()))
            }
            (state, _) => return Err(SessionError::NotReady(state)),
        };
        if self.correlator.is_pending() {
            return Err(SessionError::AlreadyCapturing(attempt));
        }
        if self.config.require_face_for_capture && self.faces_detected == 0 {
            return Err(SessionError::NoFaceInView);
        }

        if let Some(socket) = self.socket.as_ref() {
            socket.send(ClientCommand::Capture)?;
        }
        let pending = self
            .correlator
            .begin(attempt.clone())
            .ok_or_else(|| SessionError::AlreadyCapturing(attempt.clone()))?;
        self.state = SessionState::Capturing;
        tracing::info!(%attempt, "capture requested");
        Ok(pending)
    }

    /// Handle one internal event. Everything from a superseded attempt, or
    /// after disposal, is dropped here.
    pub(crate) async fn handle(&mut self, message: Inbox) {
        if self.is_disposed() {
            tracing::trace!(?message, "session disposed; dropping event");
            return;
        }
        match message {
            Inbox::Transport { attempt, event } => self.on_transport(attempt, event).await,
            Inbox::ConnectTimeout(attempt) => self.on_connect_timeout(attempt).await,
            Inbox::RetryDue(attempt) => self.on_retry_due(attempt).await,
        }
    }

    async fn on_transport(&mut self, attempt: AttemptId, event: TransportEvent) {
        if !self.is_current(&attempt) {
            tracing::trace!(%attempt, ?event, "dropping event from stale socket");
            return;
        }

        match event {
            TransportEvent::Opened => {
                tracing::info!(%attempt, "socket open; waiting for connected event");
            }
            TransportEvent::Text(text) => match decode_event(&text) {
                Ok(event) => {
                    tracing::trace!(%attempt, event = event.name(), "service event");
                    self.on_service_event(attempt, event).await;
                }
                Err(err) => {
                    tracing::warn!(%attempt, error = %err, "discarding malformed message");
                }
            },
            TransportEvent::Binary(len) => {
                let err = CodecError::Binary { len };
                tracing::warn!(%attempt, error = %err, "discarding malformed message");
            }
            TransportEvent::Closed { code, reason } => {
                tracing::info!(
                    %attempt,
                    ?code,
                    reason = %reason,
                    frames = self.frames_received,
                    "socket closed"
                );
                let (termination, message) = if self.frames_received == 0 {
                    (
                        Termination::ClosedBeforeFeed,
                        "connection closed before receiving camera feed".to_string(),
                    )
                } else {
                    (
                        Termination::ClosedMidStream,
                        format!(
                            "connection closed after {} frames",
                            self.frames_received
                        ),
                    )
                };
                self.terminate(attempt, termination, message).await;
            }
            TransportEvent::Failed(reason) => {
                // Never connected, so no frame can have arrived.
                self.terminate(
                    attempt,
                    Termination::ClosedBeforeFeed,
                    format!("connection failed: {reason}"),
                )
                .await;
            }
        }
    }

    async fn on_service_event(&mut self, attempt: AttemptId, event: ServiceEvent) {
        match event {
            ServiceEvent::Connected => {
                if self.state != SessionState::Connecting {
                    tracing::debug!(
                        %attempt,
                        state = %self.state,
                        "ignoring repeated connected event"
                    );
                    return;
                }
                self.cancel_connect_timer();
                self.state = SessionState::Connected;
                tracing::info!(%attempt, "feed connected");
                self.events.status(SessionEvent::Connected { attempt });
            }
            ServiceEvent::Frame(tick) => {
                if !matches!(
                    self.state,
                    SessionState::Connected | SessionState::Capturing
                ) {
                    tracing::debug!(
                        %attempt,
                        state = %self.state,
                        "dropping frame received before connected"
                    );
                    return;
                }
                self.frames_received += 1;
                if self.frames_received == 1 || self.frames_received % FRAME_LOG_INTERVAL == 0 {
                    tracing::debug!(
                        %attempt,
                        frame = self.frames_received,
                        faces = tick.faces_detected,
                        fps = ?tick.fps,
                        "received frame"
                    );
                }
                self.faces_detected = tick.faces_detected;
                if tick.fps.is_some() {
                    self.fps = tick.fps;
                }
                self.events.frame(SessionEvent::Frame {
                    attempt,
                    sequence: self.frames_received,
                    tick,
                });
            }
            ServiceEvent::Error { message } => {
                tracing::warn!(%attempt, message = %message, "service reported error");
                self.terminate(attempt, Termination::ExplicitError, message)
                    .await;
            }
            ServiceEvent::SearchResult(result) => match self.correlator.resolve(&attempt, result) {
                Some(outcome) => {
                    self.state = SessionState::Connected;
                    match &outcome {
                        CaptureOutcome::Matched(matches) => {
                            tracing::info!(%attempt, matches = matches.len(), "capture matched");
                        }
                        other => {
                            tracing::info!(%attempt, outcome = ?other, "capture resolved");
                        }
                    }
                    self.events
                        .status(SessionEvent::CaptureResolved { attempt, outcome });
                }
                None => {
                    tracing::warn!(%attempt, "search result with no capture in flight; ignoring");
                }
            },
        }
    }

    async fn on_connect_timeout(&mut self, attempt: AttemptId) {
        if !self.is_current(&attempt) || self.state != SessionState::Connecting {
            tracing::trace!(%attempt, "stale connect timeout");
            return;
        }
        self.connect_timer = None;
        tracing::warn!(
            %attempt,
            timeout_ms = self.config.connect_timeout.as_millis() as u64,
            "no connected event before timeout"
        );
        self.terminate(
            attempt,
            Termination::Timeout,
            "connection timeout".to_string(),
        )
        .await;
    }

    async fn on_retry_due(&mut self, attempt: AttemptId) {
        if attempt.number != self.attempt_number || self.state != SessionState::Errored {
            tracing::debug!(%attempt, state = %self.state, "retry superseded");
            return;
        }
        tracing::info!(
            %attempt,
            retry = self.retries_used,
            max = self.policy.max_retries,
            "retrying connection"
        );
        if let Err(err) = self.open().await {
            tracing::warn!(%attempt, error = %err, "automatic retry could not open");
        }
    }

    /// End the current attempt: abandon any capture, tear the socket down,
    /// then let the policy decide about a retry.
    async fn terminate(&mut self, attempt: AttemptId, termination: Termination, message: String) {
        self.cancel_connect_timer();
        self.state = SessionState::Errored;
        self.abandon_capture(AbandonReason::Terminated(termination));
        cleanup(&mut self.socket, self.config.close_grace).await;

        let decision = self.policy.decide(termination, self.retries_used);
        match decision {
            RetryDecision::Retry { after, retry } => {
                self.retries_used = retry;
                tracing::info!(
                    %attempt,
                    %termination,
                    retry,
                    max = self.policy.max_retries,
                    delay_ms = after.as_millis() as u64,
                    "scheduling automatic retry"
                );
                self.schedule_retry(attempt.clone(), after);
            }
            RetryDecision::GiveUp(reason) => {
                tracing::warn!(
                    %attempt,
                    %termination,
                    ?reason,
                    message = %message,
                    "connection attempt ended"
                );
            }
        }

        self.events.status(SessionEvent::Terminated {
            attempt,
            termination,
            message,
            decision,
        });
    }

    fn abandon_capture(&mut self, reason: AbandonReason) {
        if let Some((attempt, outcome)) = self.correlator.abandon(reason) {
            tracing::info!(%attempt, ?reason, "capture abandoned");
            self.events
                .status(SessionEvent::CaptureResolved { attempt, outcome });
        }
    }

    fn arm_connect_timer(&mut self, attempt: AttemptId) {
        let inbox = self.inbox.clone();
        let timeout = self.config.connect_timeout;
        self.connect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = inbox.send(Inbox::ConnectTimeout(attempt));
        }));
    }

    fn cancel_connect_timer(&mut self) {
        if let Some(timer) = self.connect_timer.take() {
            timer.abort();
        }
    }

    fn schedule_retry(&self, attempt: AttemptId, after: Duration) {
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inbox.send(Inbox::RetryDue(attempt));
        });
    }

    /// Final teardown when the owner disposes the session.
    pub(crate) async fn shutdown(&mut self) {
        self.cancel_connect_timer();
        self.abandon_capture(AbandonReason::Disposed);
        cleanup(&mut self.socket, self.config.close_grace).await;
        self.state = SessionState::Closed;
        tracing::info!(
            client = %self.client_id,
            attempts = self.attempt_number,
            "session disposed"
        );
    }
}
