//! Cleanup sequence for an attempt's socket:
//! close notification → flush grace → local close → handle cleared.

use crate::socket::SocketHandle;
use facefeed_core::ClientCommand;
use std::time::Duration;

/// Tear down the socket in `slot`, if any. Never fails; transport errors are
/// logged and swallowed since the socket is discarded either way.
///
/// Callers about to open a new attempt must await this first.
pub(crate) async fn cleanup(slot: &mut Option<SocketHandle>, grace: Duration) {
    let Some(handle) = slot.as_mut() else {
        return;
    };
    tracing::debug!(
        attempt = %handle.attempt,
        open = handle.is_open(),
        "cleaning up socket"
    );

    if handle.is_open() {
        match handle.send(ClientCommand::Close) {
            Ok(()) => {
                tracing::info!(attempt = %handle.attempt, "sent close notification");
                tokio::time::sleep(grace).await;
            }
            Err(err) => {
                tracing::warn!(
                    attempt = %handle.attempt,
                    error = %err,
                    "failed to send close notification"
                );
            }
        }
    }

    handle.close_local(grace).await;
    *slot = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Inbox;
    use crate::socket::TransportEvent;
    use crate::testing::FakeConnector;
    use facefeed_core::{AttemptId, ClientId};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    const GRACE: Duration = Duration::from_millis(100);

    async fn spawn_open(
        connector: &Arc<FakeConnector>,
    ) -> (Option<SocketHandle>, mpsc::UnboundedReceiver<Inbox>) {
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel();
        let attempt = AttemptId::new(ClientId::from("c"), 1);
        let handle = SocketHandle::spawn(
            connector.clone(),
            "ws://test/live-feed/c-1".into(),
            attempt,
            inbox_tx,
        );
        assert!(matches!(
            inbox_rx.recv().await,
            Some(Inbox::Transport {
                event: TransportEvent::Opened,
                ..
            })
        ));
        (Some(handle), inbox_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_empty_slot_is_noop() {
        let mut slot: Option<SocketHandle> = None;
        cleanup(&mut slot, GRACE).await;
        assert!(slot.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_notifies_then_closes() {
        let connector = FakeConnector::new();
        let (mut slot, _inbox) = spawn_open(&connector).await;
        let socket = connector.socket(0).await;

        let started = tokio::time::Instant::now();
        cleanup(&mut slot, GRACE).await;

        assert!(slot.is_none());
        assert_eq!(socket.sent(), vec![r#"{"action":"close"}"#.to_string()]);
        assert!(socket.is_closed());
        assert!(started.elapsed() >= GRACE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_skips_notification_before_handshake() {
        let connector = FakeConnector::new();
        let (inbox_tx, _inbox) = mpsc::unbounded_channel();
        let mut slot = Some(SocketHandle::spawn(
            connector.clone(),
            "ws://test/live-feed/c-1".into(),
            AttemptId::new(ClientId::from("c"), 1),
            inbox_tx,
        ));
        // The socket task has not run yet, so the wire cannot be open.
        assert!(slot.as_ref().is_some_and(|handle| !handle.is_open()));

        cleanup(&mut slot, GRACE).await;

        assert!(slot.is_none());
        assert!(connector.socket(0).await.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_sees_open_wire_before_opened_is_handled() {
        let connector = FakeConnector::new();
        let (inbox_tx, _inbox) = mpsc::unbounded_channel();
        let mut slot = Some(SocketHandle::spawn(
            connector.clone(),
            "ws://test/live-feed/c-1".into(),
            AttemptId::new(ClientId::from("c"), 1),
            inbox_tx,
        ));
        let socket = connector.socket(0).await;
        tokio::task::yield_now().await;
        // `Opened` sits unread in the inbox; the handle already knows.
        assert!(slot.as_ref().is_some_and(SocketHandle::is_open));

        cleanup(&mut slot, GRACE).await;

        assert_eq!(socket.sent(), vec![r#"{"action":"close"}"#.to_string()]);
        assert!(socket.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_after_remote_close() {
        let connector = FakeConnector::new();
        let (mut slot, mut inbox) = spawn_open(&connector).await;
        let socket = connector.socket(0).await;

        // Remote hangs up; the task clears the open flag on its way out.
        socket.close_remote(1000, "bye");
        assert!(matches!(
            inbox.recv().await,
            Some(Inbox::Transport {
                event: TransportEvent::Closed { .. },
                ..
            })
        ));
        assert!(slot.as_ref().is_some_and(|handle| !handle.is_open()));

        cleanup(&mut slot, GRACE).await;
        assert!(slot.is_none());
        assert!(socket.sent().is_empty());
    }
}
