//! In-process signaler pair.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Hook, Signaler};
use crate::error::{Result, TandemError};
use crate::observable::Observable;

type Inbox = mpsc::UnboundedSender<Result<Value>>;

/// Signaler that delivers envelopes to a linked in-process peer.
///
/// Envelopes are encoded to JSON text on send and parsed on delivery, so
/// anything that would not survive a real wire does not survive here either.
pub struct LocalSignaler {
    inbox_tx: Inbox,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Result<Value>>>>,
    peer: Mutex<Option<Inbox>>,
    ready: Observable<bool>,
    hooks: Mutex<Vec<Hook>>,
}

impl LocalSignaler {
    fn new() -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            peer: Mutex::new(None),
            ready: Observable::new(true),
            hooks: Mutex::new(Vec::new()),
        })
    }

    /// Two linked signalers, both ready
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Self::new();
        let b = Self::new();
        *lock(&a.peer) = Some(b.inbox_tx.clone());
        *lock(&b.peer) = Some(a.inbox_tx.clone());
        (a, b)
    }

    /// Deliver `message` to this signaler as if the peer had sent it
    pub fn inject(&self, message: Value) {
        let _ = self.inbox_tx.send(Ok(message));
    }

    /// Fail this signaler's inbound stream
    pub fn fail(&self, reason: &str) {
        let _ = self
            .inbox_tx
            .send(Err(TandemError::Signaling(reason.to_string())));
    }

    /// Open or close the ready gate
    pub fn set_ready(&self, ready: bool) {
        self.ready.set(ready);
    }

    /// Unlink from the peer; later sends fail
    pub fn disconnect(&self) {
        lock(&self.peer).take();
    }

    /// Hooks invoked so far, in order
    pub fn hooks(&self) -> Vec<Hook> {
        lock(&self.hooks).clone()
    }
}

impl Signaler for LocalSignaler {
    fn send(&self, message: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let text = serde_json::to_string(&message)?;
            let peer = lock(&self.peer).clone().ok_or_else(|| {
                TandemError::Signaling("local signaler is not linked".to_string())
            })?;

            let decoded = serde_json::from_str(&text).map_err(TandemError::from);
            peer.send(decoded)
                .map_err(|_| TandemError::Signaling("peer signaler dropped".to_string()))
        })
    }

    fn messages(&self) -> Option<BoxStream<'static, Result<Value>>> {
        let rx = lock(&self.inbox_rx).take()?;
        let messages = stream::unfold(rx, |mut rx| async move {
            let message = rx.recv().await?;
            Some((message, rx))
        });
        Some(messages.boxed())
    }

    fn ready(&self) -> BoxFuture<'_, ()> {
        let ready = self.ready.wait_for(true);
        Box::pin(async move {
            ready.await;
        })
    }

    fn hook(&self, hook: Hook) -> BoxFuture<'_, Result<()>> {
        lock(&self.hooks).push(hook);
        if hook == Hook::Close {
            self.ready.set(false);
        }
        Box::pin(async { Ok(()) })
    }
}

impl std::fmt::Debug for LocalSignaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSignaler")
            .field("ready", &self.ready.get())
            .field("linked", &lock(&self.peer).is_some())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
