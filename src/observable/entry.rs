//! Watched value with predicate listeners.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

enum Sink<T> {
    /// Fire once when the predicate becomes true
    Once(Option<oneshot::Sender<T>>),
    /// Fire once on the next set, regardless of predicate
    Changed(Option<oneshot::Sender<T>>),
    /// Report every truth transition
    Transitions(mpsc::UnboundedSender<bool>),
}

struct Listener<T> {
    predicate: Predicate<T>,
    matched: bool,
    sink: Sink<T>,
}

impl<T: Clone> Listener<T> {
    /// Re-evaluate against a new value. Returns false when the listener is spent.
    fn notify(&mut self, value: &T) -> bool {
        if let Sink::Changed(tx) = &mut self.sink {
            if let Some(tx) = tx.take() {
                let _ = tx.send(value.clone());
            }
            return false;
        }

        let now = (self.predicate)(value);
        if now == self.matched {
            return true;
        }
        self.matched = now;

        match &mut self.sink {
            Sink::Once(tx) => {
                if !now {
                    return true;
                }
                if let Some(tx) = tx.take() {
                    let _ = tx.send(value.clone());
                }
                false
            },
            Sink::Transitions(tx) => tx.send(now).is_ok(),
            Sink::Changed(_) => false,
        }
    }
}

struct Inner<T> {
    value: T,
    next_id: u64,
    listeners: HashMap<u64, Listener<T>>,
}

/// Single-writer, multi-reader watched value.
///
/// Cloning yields another handle to the same cell.
pub struct Observable<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Default + Clone + Send + 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Observable")
            .field("value", &inner.value)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Observable<T> {
    /// Create a new observable holding `value`
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                value,
                next_id: 0,
                listeners: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current value
    pub fn get(&self) -> T {
        self.lock().value.clone()
    }

    /// Borrow the current value
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.lock().value)
    }

    /// Replace the value and notify listeners whose predicate flipped.
    pub fn set(&self, value: T) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.value = value;
        let value = &inner.value;
        inner.listeners.retain(|_, listener| listener.notify(value));
    }

    /// Mutate the value in place, then notify like [`set`](Self::set).
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        f(&mut inner.value);
        let value = &inner.value;
        inner.listeners.retain(|_, listener| listener.notify(value));
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn register(&self, predicate: Predicate<T>, matched: bool, sink: Sink<T>) -> u64 {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.insert(
            id,
            Listener {
                predicate,
                matched,
                sink,
            },
        );
        id
    }

    fn unregister(&self, id: u64) {
        self.lock().listeners.remove(&id);
    }

    /// Resolve the first time `predicate` holds, checking the current value first.
    pub fn wait<F>(&self, predicate: F) -> Wait<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        if predicate(&inner.value) {
            return Wait {
                observable: self.clone(),
                id: None,
                state: WaitState::Ready(Some(inner.value.clone())),
            };
        }

        let (tx, rx) = oneshot::channel();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.insert(
            id,
            Listener {
                predicate: Box::new(predicate),
                matched: false,
                sink: Sink::Once(Some(tx)),
            },
        );
        drop(inner);

        Wait {
            observable: self.clone(),
            id: Some(id),
            state: WaitState::Pending(rx),
        }
    }

    /// Resolve the first time `predicate` evaluates true on a later `set`.
    ///
    /// The current value is not checked.
    pub fn wait_next<F>(&self, predicate: F) -> Wait<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = self.register(Box::new(predicate), false, Sink::Once(Some(tx)));
        Wait {
            observable: self.clone(),
            id: Some(id),
            state: WaitState::Pending(rx),
        }
    }

    /// Resolve when the value equals `expected`
    pub fn wait_for(&self, expected: T) -> Wait<T>
    where
        T: PartialEq + Sync,
    {
        self.wait(move |value| *value == expected)
    }

    /// Resolve on the next `set`, whatever the value.
    pub fn changed(&self) -> Changed<T> {
        let (tx, rx) = oneshot::channel();
        let id = self.register(Box::new(|_| true), false, Sink::Changed(Some(tx)));
        Changed {
            inner: Wait {
                observable: self.clone(),
                id: Some(id),
                state: WaitState::Pending(rx),
            },
        }
    }

    /// Stream of truth transitions of `predicate`.
    ///
    /// The stream yields only when the predicate flips; [`Transitions::initial`]
    /// holds the truth value at registration time.
    pub fn observe<F>(&self, predicate: F) -> Transitions<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let initial = predicate(&inner.value);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.insert(
            id,
            Listener {
                predicate: Box::new(predicate),
                matched: initial,
                sink: Sink::Transitions(tx),
            },
        );
        drop(inner);

        Transitions {
            observable: self.clone(),
            id,
            initial,
            rx,
        }
    }
}

impl<T: Clone + Send + 'static> Observable<T>
where
    T: PartialEq,
{
    /// Set only if the value differs. Returns whether it changed.
    pub fn replace(&self, value: T) -> bool {
        let changed = self.lock().value != value;
        if changed {
            self.set(value);
        }
        changed
    }
}

enum WaitState<T> {
    Ready(Option<T>),
    Pending(oneshot::Receiver<T>),
}

/// Future returned by [`Observable::wait`]. Dropping it cancels the wait.
pub struct Wait<T: Clone + Send + 'static> {
    observable: Observable<T>,
    id: Option<u64>,
    state: WaitState<T>,
}

// The held value is never pinned
impl<T: Clone + Send + 'static> Unpin for Wait<T> {}

impl<T: Clone + Send + 'static> Wait<T> {
    /// Cancel the wait and deregister its listener.
    pub fn cancel(mut self) {
        if let Some(id) = self.id.take() {
            self.observable.unregister(id);
        }
    }
}

impl<T: Clone + Send + 'static> Future for Wait<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        match &mut this.state {
            WaitState::Ready(value) => match value.take() {
                Some(value) => Poll::Ready(value),
                None => Poll::Ready(this.observable.get()),
            },
            WaitState::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(value)) => {
                    this.id = None;
                    Poll::Ready(value)
                },
                // Listener already gone; report what the cell holds now
                Poll::Ready(Err(_)) => {
                    this.id = None;
                    Poll::Ready(this.observable.get())
                },
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Wait<T> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.observable.unregister(id);
        }
    }
}

/// Future returned by [`Observable::changed`].
pub struct Changed<T: Clone + Send + 'static> {
    inner: Wait<T>,
}

impl<T: Clone + Send + 'static> Changed<T> {
    /// Cancel the wait and deregister its listener.
    pub fn cancel(self) {
        self.inner.cancel();
    }
}

impl<T: Clone + Send + 'static> Future for Changed<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

/// Stream of predicate truth transitions. Dropping it deregisters the listener.
pub struct Transitions<T: Clone + Send + 'static> {
    observable: Observable<T>,
    id: u64,
    initial: bool,
    rx: mpsc::UnboundedReceiver<bool>,
}

impl<T: Clone + Send + 'static> Transitions<T> {
    /// Predicate truth at registration time
    pub fn initial(&self) -> bool {
        self.initial
    }

    /// Next transition
    pub async fn next_transition(&mut self) -> Option<bool> {
        self.rx.recv().await
    }
}

impl<T: Clone + Send + 'static> Stream for Transitions<T> {
    type Item = bool;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<bool>> {
        self.rx.poll_recv(cx)
    }
}

impl<T: Clone + Send + 'static> Drop for Transitions<T> {
    fn drop(&mut self) {
        self.observable.unregister(self.id);
    }
}
