//! Sending end of a transaction.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use super::chunk::ChunkProducer;
use super::shared::Transaction;
use super::{Metadata, Termination, TransactionState};
use crate::config::TransferConfig;
use crate::error::{Result, TandemError};
use crate::observable::{wait_all, EventSource, Observable, Subscription};
use crate::socket::{Control, ControlEvent, Socket, SocketEvent};

const STOP_NAME: &str = "AbortError";
const STOP_MESSAGE: &str = "stop() called by sender";

/// Writing end of a transaction.
///
/// Input is re-chunked to the configured chunk size. Each chunk waits until
/// this side is not paused and the reader has not reported `buffer-full`.
pub struct TransactionWriter {
    transaction: Arc<Transaction>,
    readable_buffer_full: Observable<bool>,
    chunker: AsyncMutex<ChunkProducer>,
    pump: JoinHandle<()>,
}

impl TransactionWriter {
    /// Send `metadata` on `socket` and wait for the reader to acknowledge.
    pub async fn open(socket: Socket, metadata: Metadata, config: TransferConfig) -> Result<Self> {
        let mut events = socket.subscribe();

        socket
            .write_event(Control::Metadata, Value::Object(metadata.clone()))
            .await?;

        loop {
            match events.recv().await {
                Some(SocketEvent::Control(ControlEvent {
                    control: Control::TransactionReady,
                    ..
                })) => break,
                Some(SocketEvent::Closed { .. }) | None => {
                    return Err(TandemError::SocketClosed(socket.label().to_string()))
                },
                Some(other) => {
                    tracing::debug!(label = %socket.label(), ?other, "ignoring event before ready");
                },
            }
        }

        let chunker = ChunkProducer::new(config.chunk_size);
        let readable_buffer_full = Observable::new(false);
        let transaction = Transaction::new(socket, metadata, config);
        let pump = tokio::spawn(pump(
            events,
            Arc::clone(&transaction),
            readable_buffer_full.clone(),
        ));

        tracing::debug!(label = %transaction.label(), size = ?transaction.size(), "transaction writer ready");

        Ok(Self {
            transaction,
            readable_buffer_full,
            chunker: AsyncMutex::new(chunker),
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

    /// Bytes sent so far
    pub fn processed(&self) -> u64 {
        self.transaction.processed()
    }

    /// Current state
    pub fn state(&self) -> TransactionState {
        self.transaction.state()
    }

    /// Whether the reader has reported a full queue
    pub fn is_remote_buffer_full(&self) -> bool {
        self.readable_buffer_full.get()
    }

    /// Subscribe to progress reports and state changes
    pub fn subscribe(&self) -> Subscription<super::TransactionEvent> {
        self.transaction.subscribe()
    }

    /// Pause the transfer and tell the reader
    pub async fn pause(&self) -> Result<()> {
        self.transaction.pause().await
    }

    /// Resume the transfer and tell the reader
    pub async fn resume(&self) -> Result<()> {
        self.transaction.resume().await
    }

    /// Queue `data`; full chunks are sent before this returns.
    ///
    /// Fails with [`TandemError::Protocol`] if `data` would take the
    /// transaction past its declared size; nothing is queued in that case.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let mut chunker = self.chunker.lock().await;
        self.check_open()?;

        let data = data.into();
        if let Some(size) = self.transaction.size() {
            let queued = chunker.buffered() as u64 + data.len() as u64;
            if self.transaction.processed() + queued > size {
                return Err(TandemError::Protocol(format!(
                    "write of {} bytes exceeds declared size {} of {}",
                    data.len(),
                    size,
                    self.label()
                )));
            }
        }

        for chunk in chunker.push(data) {
            self.send_chunk(chunk).await?;
        }
        Ok(())
    }

    /// Send the remainder and complete the transaction.
    ///
    /// Without a declared size the socket is closed so the reader knows the
    /// data has ended. With one, fewer bytes than declared is an error and the
    /// transaction stays open. Finishing a transaction that already completed
    /// is a no-op.
    pub async fn finish(&self) -> Result<()> {
        let mut chunker = self.chunker.lock().await;
        if self.transaction.state() == TransactionState::Done {
            return Ok(());
        }
        self.check_open()?;

        if let Some(chunk) = chunker.flush() {
            self.send_chunk(chunk).await?;
        }

        if let Some(size) = self.transaction.size() {
            let processed = self.transaction.processed();
            if processed != size {
                tracing::warn!(label = %self.label(), processed, size, "finish before declared size was written");
                return Err(TandemError::Protocol(format!(
                    "transaction {} finished after {} of {} bytes",
                    self.label(),
                    processed,
                    size
                )));
            }
        }

        self.transaction.finish(None);
        if self.transaction.size().is_none() {
            self.transaction.socket().close();
        }
        Ok(())
    }

    /// Abort with an error; the reader fails with `name` and `message`.
    pub async fn abort(&self, name: &str, message: &str) -> Result<()> {
        let termination = Termination::Aborted {
            name: name.to_string(),
            message: message.to_string(),
        };
        if !self.transaction.finish(Some(termination)) {
            return Ok(());
        }
        tracing::warn!(label = %self.label(), name, message, "transaction aborted by sender");
        self.transaction
            .socket()
            .write_event(Control::Abort, json!({ "name": name, "message": message }))
            .await
    }

    /// Abort with a fixed error
    pub async fn stop(&self) -> Result<()> {
        self.abort(STOP_NAME, STOP_MESSAGE).await
    }

    /// Copy `source` to the reader and finish; returns the bytes read.
    ///
    /// A read error, or a source that does not match the declared size,
    /// aborts the transaction before being returned.
    pub async fn pipe_from<R>(&self, source: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = vec![0u8; self.transaction.config().chunk_size.max(1)];
        let mut total = 0u64;

        loop {
            let read = match source.read(&mut buffer).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) => {
                    self.abort("Error", &e.to_string()).await?;
                    return Err(e.into());
                },
            };
            if let Err(e) = self.write(Bytes::copy_from_slice(&buffer[..read])).await {
                return Err(self.abort_on_mismatch(e).await);
            }
            total += read as u64;
        }

        if let Err(e) = self.finish().await {
            return Err(self.abort_on_mismatch(e).await);
        }
        Ok(total)
    }

    async fn abort_on_mismatch(&self, error: TandemError) -> TandemError {
        if let TandemError::Protocol(message) = &error {
            if let Err(e) = self.abort("RangeError", message).await {
                tracing::warn!(label = %self.label(), "failed to send abort: {}", e);
            }
        }
        error
    }

    async fn send_chunk(&self, chunk: Bytes) -> Result<()> {
        let state = self.transaction.watch_state();
        let gate = wait_all(vec![
            self.transaction.watch_paused().condition(|paused| !paused),
            self.readable_buffer_full.condition(|full| !full),
        ]);

        tokio::select! {
            _ = gate => {},
            _ = state.wait(TransactionState::is_terminal) => {},
        }
        self.check_open()?;

        let len = chunk.len() as u64;
        if let Err(e) = self.transaction.socket().write_binary(chunk).await {
            return Err(self.transaction.error().unwrap_or(e));
        }
        self.transaction.add_processed(len);
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if let Some(error) = self.transaction.error() {
            return Err(error);
        }
        if self.transaction.state().is_terminal() {
            return Err(TandemError::Protocol(format!(
                "transaction {} already finished",
                self.label()
            )));
        }
        Ok(())
    }
}

impl Drop for TransactionWriter {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl std::fmt::Debug for TransactionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionWriter")
            .field("transaction", &self.transaction)
            .field("remote_buffer_full", &self.is_remote_buffer_full())
            .finish()
    }
}

async fn pump(
    mut events: Subscription<SocketEvent>,
    transaction: Arc<Transaction>,
    readable_buffer_full: Observable<bool>,
) {
    let socket = transaction.socket().clone();

    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Control(event) => match event.control {
                Control::Cancel => {
                    let reason = match event.payload {
                        Value::String(reason) => reason,
                        Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    tracing::warn!(label = %socket.label(), %reason, "transaction canceled by receiver");
                    transaction.finish(Some(Termination::Canceled(reason)));
                    socket.close();
                },
                Control::Pause => {
                    transaction.mark_paused();
                },
                Control::Resume => {
                    transaction.mark_resumed();
                },
                Control::BufferFull => {
                    tracing::debug!(label = %socket.label(), "reader buffer full");
                    readable_buffer_full.set(true);
                },
                Control::Pull => {
                    tracing::debug!(label = %socket.label(), "reader pulled");
                    readable_buffer_full.set(false);
                },
                other => {
                    tracing::debug!(label = %socket.label(), event = %other, "ignoring control event");
                },
            },
            SocketEvent::Message(_) => {
                tracing::debug!(label = %socket.label(), "ignoring data on writer socket");
            },
            SocketEvent::Closed { .. } => {
                if transaction.state().is_terminal() {
                    break;
                }
                match transaction.size() {
                    Some(size) if transaction.processed() == size => {
                        transaction.finish(None);
                    },
                    _ => {
                        transaction.finish(Some(Termination::ClosedUnexpectedly));
                    },
                }
                break;
            },
        }
    }
}
