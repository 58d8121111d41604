//! Receiving end of a transaction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

use super::shared::Transaction;
use super::{Metadata, Termination, TransactionState};
use crate::config::TransferConfig;
use crate::error::{Result, TandemError};
use crate::observable::{EventSource, Subscription};
use crate::socket::{Control, ControlEvent, Message, Socket, SocketEvent};

const STOP_REASON: &str = "stop() called by receiver";

/// Chunks received but not yet read
struct ReadQueue {
    chunks: Mutex<VecDeque<Bytes>>,
    queued: crate::observable::Observable<usize>,
    high_water_mark: usize,
    buffer_full_informed: AtomicBool,
}

impl ReadQueue {
    fn push(&self, chunk: Bytes) -> usize {
        let len = chunk.len();
        lock(&self.chunks).push_back(chunk);
        let mut total = 0;
        self.queued.update(|queued| {
            *queued += len;
            total = *queued;
        });
        total
    }

    fn pop(&self) -> Option<(Bytes, usize)> {
        let chunk = lock(&self.chunks).pop_front()?;
        let len = chunk.len();
        let mut total = 0;
        self.queued.update(|queued| {
            *queued = queued.saturating_sub(len);
            total = *queued;
        });
        Some((chunk, total))
    }
}

/// Reading end of a transaction.
///
/// Chunks are queued as they arrive. When the queue grows past its
/// high-water mark the writer is told `buffer-full`; once reads bring it back
/// under the mark the writer is told `pull`.
pub struct TransactionReader {
    transaction: Arc<Transaction>,
    queue: Arc<ReadQueue>,
    pump: JoinHandle<()>,
}

impl TransactionReader {
    /// Wait for the writer's metadata on `socket` and acknowledge it.
    pub async fn open(socket: Socket, config: TransferConfig) -> Result<Self> {
        let mut events = socket.subscribe();

        let metadata = loop {
            match events.recv().await {
                Some(SocketEvent::Control(ControlEvent {
                    control: Control::Metadata,
                    payload,
                })) => break parse_metadata(payload)?,
                Some(SocketEvent::Closed { .. }) | None => {
                    return Err(TandemError::SocketClosed(socket.label().to_string()))
                },
                Some(other) => {
                    tracing::debug!(label = %socket.label(), ?other, "ignoring event before metadata");
                },
            }
        };

        let queue = Arc::new(ReadQueue {
            chunks: Mutex::new(VecDeque::new()),
            queued: crate::observable::Observable::new(0),
            high_water_mark: config.reader_high_water_mark,
            buffer_full_informed: AtomicBool::new(false),
        });
        let transaction = Transaction::new(socket.clone(), metadata, config);
        let pump = tokio::spawn(pump(events, Arc::clone(&transaction), Arc::clone(&queue)));

        socket
            .write_event(Control::TransactionReady, Value::Null)
            .await?;
        tracing::debug!(label = %socket.label(), size = ?transaction.size(), "transaction reader ready");

        // No data will ever arrive for an empty transaction
        if transaction.size() == Some(0) {
            transaction.finish(None);
            socket.close();
        }

        Ok(Self {
            transaction,
            queue,
            pump,
        })
    }

    /// Shared transaction state
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Socket label
    pub fn label(&self) -> &str {
        self.transaction.label()
    }

    /// Metadata sent by the writer
    pub fn metadata(&self) -> &Metadata {
        self.transaction.metadata()
    }

    /// Bytes received so far
    pub fn processed(&self) -> u64 {
        self.transaction.processed()
    }

    /// Current state
    pub fn state(&self) -> TransactionState {
        self.transaction.state()
    }

    /// Bytes received but not yet read
    pub fn queued(&self) -> usize {
        self.queue.queued.get()
    }

    /// Subscribe to progress reports and state changes
    pub fn subscribe(&self) -> Subscription<super::TransactionEvent> {
        self.transaction.subscribe()
    }

    /// Pause the transfer and tell the writer
    pub async fn pause(&self) -> Result<()> {
        self.transaction.pause().await
    }

    /// Resume the transfer and tell the writer
    pub async fn resume(&self) -> Result<()> {
        self.transaction.resume().await
    }

    /// Read the next chunk; `None` once every byte has been read.
    pub async fn read(&self) -> Result<Option<Bytes>> {
        let state = self.transaction.watch_state();

        loop {
            if let Some(error) = self.transaction.error() {
                return Err(error);
            }

            if let Some((chunk, queued)) = self.queue.pop() {
                if queued < self.queue.high_water_mark
                    && !self.transaction.state().is_terminal()
                    && self.queue.buffer_full_informed.swap(false, Ordering::SeqCst)
                {
                    tracing::debug!(label = %self.label(), queued, "reader queue has room, sending pull");
                    if let Err(e) = self
                        .transaction
                        .socket()
                        .write_event(Control::Pull, Value::Null)
                        .await
                    {
                        tracing::warn!(label = %self.label(), "failed to send pull: {}", e);
                    }
                }
                return Ok(Some(chunk));
            }

            if state.get() == TransactionState::Done {
                return Ok(None);
            }

            tokio::select! {
                _ = self.queue.queued.wait(|queued| *queued > 0) => {},
                _ = state.wait(TransactionState::is_terminal) => {},
            }
        }
    }

    /// Read everything into one buffer
    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        while let Some(chunk) = self.read().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    /// Copy every chunk into `sink`; returns the number of bytes written
    pub async fn pipe_to<W>(&self, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0;
        while let Some(chunk) = self.read().await? {
            if let Err(e) = sink.write_all(&chunk).await {
                self.cancel(&e.to_string()).await?;
                return Err(e.into());
            }
            written += chunk.len() as u64;
        }
        sink.flush().await?;
        Ok(written)
    }

    /// Stream of chunks, ending after the last byte or the first error
    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes>> {
        stream::unfold(Some(self), |reader| async move {
            let reader = reader?;
            match reader.read().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }

    /// Cancel the transfer; the writer fails with `reason`
    pub async fn cancel(&self, reason: &str) -> Result<()> {
        if !self
            .transaction
            .finish(Some(Termination::Canceled(reason.to_string())))
        {
            return Ok(());
        }
        tracing::warn!(label = %self.label(), reason, "transaction canceled by receiver");
        self.transaction
            .socket()
            .write_event(Control::Cancel, Value::String(reason.to_string()))
            .await
    }

    /// Cancel with a fixed reason
    pub async fn stop(&self) -> Result<()> {
        self.cancel(STOP_REASON).await
    }
}

impl Drop for TransactionReader {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl std::fmt::Debug for TransactionReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionReader")
            .field("transaction", &self.transaction)
            .field("queued", &self.queued())
            .finish()
    }
}

fn parse_metadata(payload: Value) -> Result<Metadata> {
    match payload {
        Value::Object(metadata) => Ok(metadata),
        Value::Null => Ok(Metadata::new()),
        other => Err(TandemError::Protocol(format!(
            "transaction metadata must be an object, got {}",
            other
        ))),
    }
}

async fn pump(
    mut events: Subscription<SocketEvent>,
    transaction: Arc<Transaction>,
    queue: Arc<ReadQueue>,
) {
    let socket = transaction.socket().clone();

    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Message(Message::Binary(chunk)) => {
                if transaction.state().is_terminal() {
                    continue;
                }

                let len = chunk.len() as u64;
                let queued = queue.push(chunk);
                let processed = transaction.add_processed(len);

                if queued > queue.high_water_mark
                    && !queue.buffer_full_informed.swap(true, Ordering::SeqCst)
                {
                    tracing::debug!(label = %socket.label(), queued, "reader queue full, sending buffer-full");
                    if let Err(e) = socket.write_event(Control::BufferFull, Value::Null).await {
                        tracing::warn!(label = %socket.label(), "failed to send buffer-full: {}", e);
                    }
                }

                if Some(processed) == transaction.size() {
                    transaction.finish(None);
                    socket.close();
                }
            },
            SocketEvent::Message(Message::Json(value)) => {
                tracing::debug!(label = %socket.label(), %value, "ignoring JSON data on transaction socket");
            },
            SocketEvent::Control(event) => match event.control {
                Control::Pause => {
                    transaction.mark_paused();
                },
                Control::Resume => {
                    transaction.mark_resumed();
                },
                Control::Abort => {
                    let name = event.payload["name"].as_str().unwrap_or("Error").to_string();
                    let message = match &event.payload {
                        Value::String(message) => message.clone(),
                        payload => payload["message"].as_str().unwrap_or_default().to_string(),
                    };
                    tracing::warn!(label = %socket.label(), %name, %message, "transaction aborted by sender");
                    transaction.finish(Some(Termination::Aborted { name, message }));
                    socket.close();
                },
                other => {
                    tracing::debug!(label = %socket.label(), event = %other, "ignoring control event");
                },
            },
            SocketEvent::Closed { by_remote } => {
                if transaction.state().is_terminal() {
                    break;
                }
                if transaction.size().is_none() && by_remote {
                    // Without a declared size the writer closing is the end of data
                    transaction.finish(None);
                } else {
                    transaction.finish(Some(Termination::ClosedUnexpectedly));
                }
                break;
            },
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
