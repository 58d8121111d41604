//! State shared by both ends of a transaction.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::eta::{format_bytes, ProgressTracker};
use super::{Metadata, Report, Termination, TransactionEvent, TransactionState};
use crate::config::TransferConfig;
use crate::error::{Result, TandemError};
use crate::observable::{Emitter, EventSource, Observable};
use crate::socket::{Control, Socket};

/// Wall clock with paused time cut out
#[derive(Debug)]
struct PauseClock {
    base: Instant,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

impl PauseClock {
    fn new() -> Self {
        Self {
            base: Instant::now(),
            paused_at: None,
            paused_total: Duration::ZERO,
        }
    }

    /// Active time elapsed at `at`
    fn active(&self, at: Instant) -> Duration {
        at.saturating_duration_since(self.base)
            .saturating_sub(self.paused_total)
    }

    /// Active time elapsed now, frozen while paused
    fn now(&self) -> Duration {
        self.active(self.paused_at.unwrap_or_else(Instant::now))
    }
}

/// Transaction state: metadata, counters, flags and progress estimation.
///
/// Owned jointly by a [`TransactionReader`](super::TransactionReader) or
/// [`TransactionWriter`](super::TransactionWriter) and its background task.
pub struct Transaction {
    socket: Socket,
    metadata: Metadata,
    size: Option<u64>,
    config: TransferConfig,
    processed: Observable<u64>,
    paused: Observable<bool>,
    state: Observable<TransactionState>,
    termination: Mutex<Option<Termination>>,
    clock: Mutex<PauseClock>,
    tracker: Mutex<Option<ProgressTracker>>,
    events: Emitter<TransactionEvent>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl Transaction {
    pub(crate) fn new(socket: Socket, metadata: Metadata, config: TransferConfig) -> Arc<Self> {
        let size = metadata.get("size").and_then(Value::as_u64);

        let transaction = Arc::new(Self {
            socket,
            metadata,
            size,
            config,
            processed: Observable::new(0),
            paused: Observable::new(false),
            state: Observable::new(TransactionState::Active),
            termination: Mutex::new(None),
            clock: Mutex::new(PauseClock::new()),
            tracker: Mutex::new(None),
            events: Emitter::new(),
            reporter: Mutex::new(None),
        });

        let reporter = tokio::spawn(report_loop(Arc::downgrade(&transaction)));
        *lock(&transaction.reporter) = Some(reporter);
        transaction
    }

    /// Socket label
    pub fn label(&self) -> &str {
        self.socket.label()
    }

    /// Metadata sent by the writer
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Declared size in bytes
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// The transaction's socket
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub(crate) fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Bytes processed so far
    pub fn processed(&self) -> u64 {
        self.processed.get()
    }

    /// Watch the processed counter
    pub fn watch_processed(&self) -> Observable<u64> {
        self.processed.clone()
    }

    /// Whether this side is paused
    pub fn is_paused(&self) -> bool {
        self.paused.get()
    }

    /// Watch the paused flag
    pub fn watch_paused(&self) -> Observable<bool> {
        self.paused.clone()
    }

    /// Current state
    pub fn state(&self) -> TransactionState {
        self.state.get()
    }

    /// Watch the state
    pub fn watch_state(&self) -> Observable<TransactionState> {
        self.state.clone()
    }

    /// Resolve once the transaction reaches a terminal state
    pub async fn finished(&self) -> TransactionState {
        self.state.wait(TransactionState::is_terminal).await
    }

    /// How the transaction ended, if it did not complete
    pub fn termination(&self) -> Option<Termination> {
        lock(&self.termination).clone()
    }

    /// Error for a transaction that ended without completing
    pub fn error(&self) -> Option<TandemError> {
        self.termination().map(|t| t.to_error(self.label()))
    }

    /// `processed / size`, or NaN without a declared size
    pub fn progress(&self) -> f64 {
        match self.size {
            Some(0) => 1.0,
            Some(size) => self.processed() as f64 / size as f64,
            None => f64::NAN,
        }
    }

    /// Seconds remaining, rounded; NaN before the estimator has started
    pub fn eta(&self) -> f64 {
        let tracker = lock(&self.tracker);
        let Some(tracker) = tracker.as_ref() else {
            return f64::NAN;
        };

        if !self.is_paused() && Some(self.processed()) == self.size {
            return 0.0;
        }

        tracker.estimate(lock(&self.clock).now()).round()
    }

    /// Human readable rate; zero while paused
    pub fn speed(&self) -> String {
        let rate = match lock(&self.tracker).as_ref() {
            Some(tracker) if !self.is_paused() => tracker.rate(),
            _ => 0.0,
        };
        format!("{}/s", format_bytes(rate))
    }

    /// Snapshot of the current progress
    pub fn report(&self) -> Report {
        Report {
            processed: self.processed(),
            progress: self.progress(),
            eta: self.eta(),
            speed: self.speed(),
        }
    }

    /// Pause this side and tell the peer
    pub async fn pause(&self) -> Result<()> {
        if self.mark_paused() {
            self.socket.write_event(Control::Pause, Value::Null).await?;
        }
        Ok(())
    }

    /// Resume this side and tell the peer
    pub async fn resume(&self) -> Result<()> {
        if self.mark_resumed() {
            self.socket.write_event(Control::Resume, Value::Null).await?;
        }
        Ok(())
    }

    pub(crate) fn add_processed(&self, bytes: u64) -> u64 {
        let mut total = 0;
        self.processed.update(|processed| {
            *processed += bytes;
            total = *processed;
        });
        total
    }

    /// Set the paused flag. Returns false if already paused or finished.
    pub(crate) fn mark_paused(&self) -> bool {
        if self.state().is_terminal() || self.paused.get() {
            return false;
        }

        lock(&self.clock).paused_at = Some(Instant::now());
        self.paused.set(true);
        self.transition(TransactionState::Paused);
        tracing::debug!(label = %self.label(), "transaction paused");
        true
    }

    /// Clear the paused flag. Returns false if not paused or finished.
    pub(crate) fn mark_resumed(&self) -> bool {
        if self.state().is_terminal() || !self.paused.get() {
            return false;
        }

        {
            let mut clock = lock(&self.clock);
            if let Some(paused_at) = clock.paused_at.take() {
                clock.paused_total += paused_at.elapsed();
            }
        }
        self.paused.set(false);
        self.transition(TransactionState::Active);
        tracing::debug!(label = %self.label(), "transaction resumed");
        true
    }

    /// Move to a terminal state. Returns false if already finished.
    pub(crate) fn finish(&self, termination: Option<Termination>) -> bool {
        let state = termination
            .as_ref()
            .map_or(TransactionState::Done, Termination::state);

        {
            let mut current = lock(&self.termination);
            if self.state().is_terminal() {
                return false;
            }
            *current = termination;
            self.transition(state);
        }

        self.stop_report();

        match state {
            TransactionState::Done => {
                tracing::info!(label = %self.label(), processed = self.processed(), "transaction done");
            },
            _ => {
                tracing::warn!(label = %self.label(), state = ?state, "transaction ended early");
            },
        }
        true
    }

    /// Terminal states are never left
    fn transition(&self, state: TransactionState) {
        let mut changed = false;
        self.state.update(|current| {
            if !current.is_terminal() && *current != state {
                *current = state;
                changed = true;
            }
        });
        if changed {
            self.events.publish(TransactionEvent::State(state));
        }
    }

    fn start_tracking(&self) {
        let start = lock(&self.clock).now();
        let min = self.processed() as f64;
        let max = self.size.unwrap_or(0) as f64;
        *lock(&self.tracker) = Some(ProgressTracker::new(
            min,
            max,
            self.config.history_time_constant_secs,
            start,
        ));
    }

    fn sample(&self) {
        let at = lock(&self.clock).now();
        if let Some(tracker) = lock(&self.tracker).as_mut() {
            tracker.report(self.processed() as f64, at);
        }
    }

    fn stop_report(&self) {
        if let Some(reporter) = lock(&self.reporter).take() {
            reporter.abort();
        }
    }
}

impl EventSource for Transaction {
    type Event = TransactionEvent;

    fn emitter(&self) -> &Emitter<TransactionEvent> {
        &self.events
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.stop_report();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("label", &self.label())
            .field("size", &self.size)
            .field("processed", &self.processed())
            .field("state", &self.state())
            .finish()
    }
}

/// Seed the estimator on the first processed change, then report periodically.
async fn report_loop(transaction: Weak<Transaction>) {
    let (processed, state, size, config) = {
        let Some(tx) = transaction.upgrade() else {
            return;
        };
        (tx.watch_processed(), tx.watch_state(), tx.size, tx.config.clone())
    };

    if size.is_none() {
        tracing::warn!("transaction metadata has no numeric size; progress tracking disabled");
        return;
    }

    tokio::select! {
        _ = processed.changed() => {},
        _ = state.wait(TransactionState::is_terminal) => return,
    }

    // The first samples only measure how fast the channel buffer fills
    tokio::time::sleep(Duration::from_millis(config.rate_warmup_ms)).await;

    match transaction.upgrade() {
        Some(tx) if !tx.state().is_terminal() => tx.start_tracking(),
        _ => return,
    }

    let period = Duration::from_millis(config.report_interval_ms.max(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        ticker.tick().await;
        let Some(tx) = transaction.upgrade() else {
            return;
        };
        if tx.state().is_terminal() {
            return;
        }
        if tx.is_paused() {
            continue;
        }

        tx.sample();
        let report = tx.report();
        tracing::debug!(
            label = %tx.label(),
            processed = report.processed,
            eta = report.eta,
            speed = %report.speed,
            "transaction progress"
        );
        tx.events.publish(TransactionEvent::Report(report));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::Socket;
    use crate::transaction::sized;
    use crate::transport::memory::MemoryChannel;
    use crate::transport::DataChannel;

    fn transaction(size: u64) -> Arc<Transaction> {
        let (a, _b) = MemoryChannel::open_pair("t");
        let socket = Socket::new(a as Arc<dyn DataChannel>, "t").unwrap();
        Transaction::new(socket, sized(size), TransferConfig::default())
    }

    #[tokio::test]
    async fn test_pause_is_idempotent() {
        let tx = transaction(100);
        assert!(tx.mark_paused());
        assert!(!tx.mark_paused());
        assert_eq!(tx.state(), TransactionState::Paused);
        assert!(tx.mark_resumed());
        assert!(!tx.mark_resumed());
        assert_eq!(tx.state(), TransactionState::Active);
    }

    #[tokio::test]
    async fn test_finish_is_terminal_once() {
        let tx = transaction(100);
        assert!(tx.finish(Some(Termination::Canceled("why".into()))));
        assert!(!tx.finish(None));
        assert_eq!(tx.state(), TransactionState::Canceled);
        assert!(!tx.mark_paused());
        assert!(tx.error().unwrap().to_string().contains("why"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_after_warmup() {
        let tx = transaction(10_000);
        let mut events = tx.subscribe();

        let producer = tokio::spawn({
            let tx = Arc::clone(&tx);
            async move {
                for _ in 0..90 {
                    tx.add_processed(100);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        });

        let report = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(TransactionEvent::Report(report)) if report.eta.is_finite() => {
                        break report
                    },
                    Some(_) => continue,
                    None => panic!("event stream ended"),
                }
            }
        })
        .await
        .unwrap();

        assert!(report.processed >= 1000);
        assert!(report.progress > 0.0 && report.progress < 1.0);
        assert!(report.speed.ends_with("/s"));
        producer.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_eta_freezes_and_speed_zero_while_paused() {
        let tx = transaction(10_000);
        tx.add_processed(1);
        tokio::time::sleep(Duration::from_millis(1001)).await;
        for _ in 0..4 {
            tx.add_processed(1000);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        tx.mark_paused();
        let frozen = tx.eta();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(tx.eta(), frozen);
        assert_eq!(tx.speed(), "0 B/s");
    }
}
