//! Per-type routing over a [`Signaler`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Hook, Signaler};
use crate::error::{Result, TandemError};
use crate::observable::Observable;

#[derive(Default)]
struct Routes {
    handlers: HashMap<String, mpsc::UnboundedSender<Value>>,
    /// Envelopes that arrived before a handler for their type
    backlog: HashMap<String, VecDeque<Value>>,
}

impl Routes {
    fn dispatch(&mut self, kind: String, message: Value) {
        let message = match self.handlers.get(&kind) {
            Some(tx) => match tx.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => {
                    self.handlers.remove(&kind);
                    message
                },
            },
            None => message,
        };

        tracing::debug!(kind = %kind, "queueing signal until a handler registers");
        self.backlog.entry(kind).or_default().push_back(message);
    }
}

/// Routes inbound envelopes by `type` and gates outbound ones on readiness.
///
/// Envelopes whose type has no registered handler are queued and delivered,
/// in arrival order, to the first handler that registers for that type.
pub struct SignalManager {
    signaler: Arc<dyn Signaler>,
    routes: Arc<Mutex<Routes>>,
    failure: Observable<Option<String>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SignalManager {
    /// Start routing the signaler's inbound envelopes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(signaler: Arc<dyn Signaler>) -> Self {
        let routes = Arc::new(Mutex::new(Routes::default()));
        let failure = Observable::new(None);

        let pump = match signaler.messages() {
            Some(messages) => Some(tokio::spawn(Self::pump(
                messages,
                Arc::clone(&routes),
                failure.clone(),
            ))),
            None => {
                failure.set(Some("signaler message stream already taken".to_string()));
                None
            },
        };

        Self {
            signaler,
            routes,
            failure,
            pump: Mutex::new(pump),
        }
    }

    async fn pump(
        mut messages: futures::stream::BoxStream<'static, Result<Value>>,
        routes: Arc<Mutex<Routes>>,
        failure: Observable<Option<String>>,
    ) {
        while let Some(message) = messages.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!("signaler failed: {}", e);
                    let reason = match e {
                        TandemError::Signaling(reason) => reason,
                        other => other.to_string(),
                    };
                    failure.set(Some(reason));
                    return;
                },
            };

            let Some(kind) = message.get("type").and_then(Value::as_str).map(str::to_string)
            else {
                tracing::warn!("dropping signal without a type field: {}", message);
                continue;
            };

            lock(&routes).dispatch(kind, message);
        }

        tracing::debug!("signaler message stream ended");
    }

    /// Register the handler for `kind`.
    ///
    /// Queued envelopes of that type are delivered first. Registering again
    /// replaces the previous handler.
    pub fn receive(&self, kind: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = lock(&self.routes);

        if let Some(queued) = routes.backlog.remove(kind) {
            for message in queued {
                let _ = tx.send(message);
            }
        }
        routes.handlers.insert(kind.to_string(), tx);

        rx
    }

    /// Number of queued envelopes of `kind`
    pub fn pending(&self, kind: &str) -> usize {
        lock(&self.routes).backlog.get(kind).map_or(0, VecDeque::len)
    }

    /// Serialize and send an envelope
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        self.send_raw(serde_json::to_value(message)?).await
    }

    /// Send a raw envelope once the signaler is ready.
    ///
    /// Fails with [`TandemError::InvalidEnvelope`] if the envelope has no
    /// `type` field.
    pub async fn send_raw(&self, message: Value) -> Result<()> {
        if message.get("type").is_none() {
            return Err(TandemError::InvalidEnvelope(
                "message to send has no \"type\" field".to_string(),
            ));
        }

        self.signaler.ready().await;
        self.signaler.send(message).await
    }

    /// Invoke a signaler lifecycle hook
    pub async fn call_hook(&self, hook: Hook) -> Result<()> {
        tracing::debug!(hook = %hook, "calling signaler hook");
        self.signaler.hook(hook).await
    }

    /// Resolve once the signaler is ready
    pub async fn ready(&self) {
        self.signaler.ready().await;
    }

    /// Fatal signaling failure, if one happened
    pub fn failure(&self) -> Observable<Option<String>> {
        self.failure.clone()
    }

    /// Stop routing and drop every handler and queued envelope
    pub fn clear(&self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        let mut routes = lock(&self.routes);
        routes.handlers.clear();
        routes.backlog.clear();
    }
}

impl Drop for SignalManager {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for SignalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes = lock(&self.routes);
        f.debug_struct("SignalManager")
            .field("handlers", &routes.handlers.keys().collect::<Vec<_>>())
            .field("queued", &routes.backlog.values().map(VecDeque::len).sum::<usize>())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::LocalSignaler;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_queues_until_handler_registers() {
        let (a, b) = LocalSignaler::pair();
        let manager = SignalManager::new(b);

        a.send(json!({"type": "role", "seed": 1.0})).await.unwrap();
        a.send(json!({"type": "role", "seed": 2.0})).await.unwrap();

        timeout(Duration::from_secs(1), async {
            while manager.pending("role") < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let mut roles = manager.receive("role");
        assert_eq!(roles.recv().await.unwrap()["seed"], 1.0);
        assert_eq!(roles.recv().await.unwrap()["seed"], 2.0);
        assert_eq!(manager.pending("role"), 0);
    }

    #[tokio::test]
    async fn test_send_raw_requires_type() {
        let (a, _b) = LocalSignaler::pair();
        let manager = SignalManager::new(a);
        let err = manager.send_raw(json!({"seed": 1.0})).await.unwrap_err();
        assert!(matches!(err, TandemError::InvalidEnvelope(_)));
    }

    #[tokio::test]
    async fn test_send_waits_for_ready() {
        let (a, b) = LocalSignaler::pair();
        a.set_ready(false);
        let manager = Arc::new(SignalManager::new(a.clone()));
        let mut inbox = b.messages().unwrap();

        let sender = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.send_raw(json!({"type": "role", "seed": 3.0})).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sender.is_finished());

        a.set_ready(true);
        sender.await.unwrap().unwrap();
        let got = inbox.next().await.unwrap().unwrap();
        assert_eq!(got["seed"], 3.0);
    }

    #[tokio::test]
    async fn test_signaler_error_sets_failure() {
        let (_a, b) = LocalSignaler::pair();
        let manager = SignalManager::new(b.clone());
        let failure = manager.failure();

        b.fail("socket reset");
        let message = timeout(Duration::from_secs(1), failure.wait(Option::is_some))
            .await
            .unwrap();
        assert_eq!(message.as_deref(), Some("socket reset"));
    }
}
