//! Publish/subscribe event emitter.
//!
//! Components hold an [`Emitter`] rather than inheriting emitter behavior, and
//! expose it through [`EventSource`].

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

struct EmitterInner<E> {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<E>>,
    /// Events published while nobody listened (buffered emitters only)
    backlog: VecDeque<E>,
    buffer_unobserved: bool,
}

/// Multi-subscriber event emitter.
///
/// A *buffered* emitter keeps events published while it has no subscribers
/// and hands them to the next subscriber, preserving order.
pub struct Emitter<E> {
    inner: Arc<Mutex<EmitterInner<E>>>,
}

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Clone + Send + 'static> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Emitter")
            .field("subscribers", &inner.subscribers.len())
            .field("backlog", &inner.backlog.len())
            .finish()
    }
}

impl<E: Clone + Send + 'static> Emitter<E> {
    /// Emitter that drops events nobody subscribed to
    pub fn new() -> Self {
        Self::with_buffering(false)
    }

    /// Emitter that queues events until the first subscriber arrives
    pub fn buffered() -> Self {
        Self::with_buffering(true)
    }

    fn with_buffering(buffer_unobserved: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EmitterInner {
                next_id: 0,
                subscribers: HashMap::new(),
                backlog: VecDeque::new(),
                buffer_unobserved,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EmitterInner<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to events. Dropping the subscription unsubscribes.
    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        while let Some(event) = inner.backlog.pop_front() {
            let _ = tx.send(event);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, tx);

        Subscription {
            emitter: self.clone(),
            id,
            rx,
        }
    }

    /// Remove a subscriber by id
    pub fn unsubscribe(&self, id: u64) {
        self.lock().subscribers.remove(&id);
    }

    /// Publish an event to every subscriber
    pub fn publish(&self, event: E) {
        let mut inner = self.lock();
        inner.subscribers.retain(|_, tx| !tx.is_closed());

        if inner.subscribers.is_empty() {
            if inner.buffer_unobserved {
                inner.backlog.push_back(event);
            }
            return;
        }

        inner
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Whether anybody is listening
    pub fn has_subscribers(&self) -> bool {
        let mut inner = self.lock();
        inner.subscribers.retain(|_, tx| !tx.is_closed());
        !inner.subscribers.is_empty()
    }
}

/// Stream of events from an [`Emitter`].
pub struct Subscription<E> {
    emitter: Emitter<E>,
    id: u64,
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    /// Subscriber id, usable with [`Emitter::unsubscribe`]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next event
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Receive an event if one is already queued
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

impl<E> Stream for Subscription<E> {
    type Item = E;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        self.rx.poll_recv(cx)
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.emitter
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .remove(&self.id);
    }
}

/// A component that publishes events through an owned [`Emitter`].
pub trait EventSource {
    /// Event type
    type Event: Clone + Send + 'static;

    /// The component's emitter
    fn emitter(&self) -> &Emitter<Self::Event>;

    /// Subscribe to the component's events
    fn subscribe(&self) -> Subscription<Self::Event> {
        self.emitter().subscribe()
    }

    /// Drop a subscription by id
    fn unsubscribe(&self, id: u64) {
        self.emitter().unsubscribe(id);
    }
}
