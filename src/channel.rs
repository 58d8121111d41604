//! Bidirectional channel with file transfers.
//!
//! A [`Channel`] is a negotiated [`Socket`] plus a convention for moving
//! large payloads off it: [`Channel::send_file`] announces a fresh
//! transaction label with the `__transaction` control event, then streams
//! the payload through a dedicated transaction. The receiving channel opens
//! the matching reader and publishes it as [`ChannelEvent::Transaction`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;

use crate::engine::WeakEngine;
use crate::error::{Result, TandemError};
use crate::observable::{Emitter, EventSource, Subscription};
use crate::socket::{Control, ControlEvent, Message, Socket, SocketEvent};
use crate::transaction::{Metadata, TransactionReader, TransactionWriter};

/// Event published by a [`Channel`]
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Application message
    Message(Message),
    /// The remote peer started a file transfer
    Transaction(Arc<TransactionReader>),
}

/// Bidirectional message channel.
pub struct Channel {
    socket: Socket,
    engine: WeakEngine,
    files_sent: AtomicUsize,
    events: Emitter<ChannelEvent>,
    pump: JoinHandle<()>,
}

impl Channel {
    pub(crate) fn new(socket: Socket, engine: WeakEngine) -> Self {
        let events = Emitter::buffered();
        let pump = tokio::spawn(pump(socket.clone(), engine.clone(), events.clone()));
        tracing::debug!(label = %socket.label(), "channel created");

        Self {
            socket,
            engine,
            files_sent: AtomicUsize::new(0),
            events,
            pump,
        }
    }

    /// Channel label
    pub fn label(&self) -> &str {
        self.socket.label()
    }

    /// Underlying socket
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Send a message
    pub async fn send(&self, message: Message) -> Result<()> {
        self.socket.write(message).await
    }

    /// Send a JSON-serializable value
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        self.socket.write_json(value).await
    }

    /// Send a binary message
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.socket.write_binary(data).await
    }

    /// Announce a file transfer and open its writer.
    ///
    /// Resolves once the remote channel has opened the reader.
    pub async fn open_file(&self, metadata: Metadata) -> Result<TransactionWriter> {
        let engine = self.engine.upgrade().ok_or(TandemError::Closed)?;
        let index = self.files_sent.fetch_add(1, Ordering::SeqCst);
        let label = format!("{}/file-{}", self.label(), index);

        tracing::debug!(channel = %self.label(), transaction = %label, "announcing file transfer");
        self.socket
            .write_event(Control::Transaction, Value::String(label.clone()))
            .await?;

        engine.writable(Some(&label), metadata).await
    }

    /// Send everything `source` yields as a file; returns the bytes sent
    pub async fn send_file<R>(&self, metadata: Metadata, source: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let writer = self.open_file(metadata).await?;
        writer.pipe_from(source).await
    }

    /// Close the channel
    pub fn close(&self) {
        self.socket.close();
    }
}

impl EventSource for Channel {
    type Event = ChannelEvent;

    fn emitter(&self) -> &Emitter<ChannelEvent> {
        &self.events
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.label())
            .field("files_sent", &self.files_sent.load(Ordering::SeqCst))
            .finish()
    }
}

async fn pump(socket: Socket, engine: WeakEngine, events: Emitter<ChannelEvent>) {
    let mut inbound: Subscription<SocketEvent> = socket.subscribe();

    while let Some(event) = inbound.recv().await {
        match event {
            SocketEvent::Message(message) => events.publish(ChannelEvent::Message(message)),
            SocketEvent::Control(ControlEvent {
                control: Control::Transaction,
                payload: Value::String(label),
            }) => {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                let events = events.clone();
                tokio::spawn(async move {
                    match engine.readable(&label).await {
                        Ok(reader) => events.publish(ChannelEvent::Transaction(Arc::new(reader))),
                        Err(e) => tracing::warn!(transaction = %label, "failed to open file transfer: {}", e),
                    }
                });
            },
            SocketEvent::Control(event) => {
                tracing::debug!(label = %socket.label(), event = %event.control, "ignoring control event");
            },
            SocketEvent::Closed { by_remote } => {
                tracing::debug!(label = %socket.label(), by_remote, "channel closed");
                break;
            },
        }
    }
}
