//! In-memory [`Connector`] for driving the controller without a network.
//!
//! Every `connect` call is recorded, refused or not, so tests index sockets
//! by connect order.

use crate::socket::{Connector, TransportError, WireMessage, WirePair, WireSink, WireStream};
use futures_util::future::BoxFuture;
use futures_util::Sink;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Notify};

struct SocketState {
    url: String,
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
    prior_closed: bool,
    inbound: mpsc::UnboundedSender<Result<WireMessage, TransportError>>,
}

/// Test-side view of one connect call.
#[derive(Clone)]
pub(crate) struct FakeSocket(Arc<SocketState>);

impl FakeSocket {
    pub(crate) fn url(&self) -> &str {
        &self.0.url
    }

    /// Texts the client wrote, in order.
    pub(crate) fn sent(&self) -> Vec<String> {
        self.0.sent.lock().unwrap().clone()
    }

    /// True once either side closed, or the client dropped its sink.
    pub(crate) fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    /// Whether every earlier socket was already closed when this one connected.
    pub(crate) fn prior_sockets_closed(&self) -> bool {
        self.0.prior_closed
    }

    pub(crate) fn push_text(&self, text: impl Into<String>) {
        let _ = self.0.inbound.send(Ok(WireMessage::Text(text.into())));
    }

    pub(crate) fn push(&self, value: serde_json::Value) {
        self.push_text(value.to_string());
    }

    pub(crate) fn close_remote(&self, code: u16, reason: &str) {
        self.0.closed.store(true, Ordering::SeqCst);
        let _ = self.0.inbound.send(Ok(WireMessage::Close {
            code: Some(code),
            reason: reason.to_string(),
        }));
    }
}

#[derive(Default)]
struct Inner {
    sockets: Vec<FakeSocket>,
    refuse_all: bool,
    refuse_next: usize,
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl FakeConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse every connect from now on.
    pub(crate) fn refuse_all(&self) {
        self.inner.lock().unwrap().refuse_all = true;
    }

    /// Refuse the next `n` connects.
    pub(crate) fn refuse_next(&self, n: usize) {
        self.inner.lock().unwrap().refuse_next = n;
    }

    pub(crate) fn connects(&self) -> usize {
        self.inner.lock().unwrap().sockets.len()
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .sockets
            .iter()
            .map(|s| s.url().to_string())
            .collect()
    }

    /// Wait for the `index`th connect call.
    pub(crate) async fn socket(&self, index: usize) -> FakeSocket {
        loop {
            let notified = self.notify.notified();
            if let Some(socket) = self.inner.lock().unwrap().sockets.get(index) {
                return socket.clone();
            }
            notified.await;
        }
    }
}

impl Connector for FakeConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<WirePair, TransportError>> {
        let mut inner = self.inner.lock().unwrap();
        let refused = if inner.refuse_all {
            true
        } else if inner.refuse_next > 0 {
            inner.refuse_next -= 1;
            true
        } else {
            false
        };

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let state = Arc::new(SocketState {
            url: url.to_string(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(refused),
            prior_closed: inner.sockets.iter().all(FakeSocket::is_closed),
            inbound: inbound_tx,
        });
        inner.sockets.push(FakeSocket(state.clone()));
        drop(inner);
        self.notify.notify_waiters();

        if refused {
            return Box::pin(async { Err(TransportError::Connect("connection refused".into())) });
        }

        let sink: WireSink = Box::pin(FakeSink(state));
        let stream: WireStream = Box::pin(futures_util::stream::unfold(
            inbound_rx,
            |mut rx| async move { rx.recv().await.map(|item| (item, rx)) },
        ));
        Box::pin(async move { Ok((sink, stream)) })
    }
}

struct FakeSink(Arc<SocketState>);

impl Sink<String> for FakeSink {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: String) -> Result<(), Self::Error> {
        if self.0.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.0.sent.lock().unwrap().push(item);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.0.closed.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

impl Drop for FakeSink {
    fn drop(&mut self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }
}
