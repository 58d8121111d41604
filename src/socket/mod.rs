//! Labeled, event-capable socket over one data channel.
//!
//! A [`Socket`] owns its data channel exclusively. It decodes every inbound
//! wire message once into a [`Frame`] and republishes it as a
//! [`SocketEvent`]; control events and data are never both emitted for the
//! same message.
//!
//! # Backpressure
//!
//! Binary writes larger than [`MAX_PAYLOAD_SIZE`] are rejected. When the
//! channel's buffered amount plus the payload would exceed
//! [`HIGH_WATER_MARK`], the write parks until the channel reports its buffer
//! drained below `HIGH_WATER_MARK - len`:
//!
//! ```text
//! write(len) ──► buffered + len <= HWM ? ──yes──► send
//!                      │ no
//!                      ▼
//!         low threshold = HWM - len, ready = false
//!                      │
//!          wait BufferedAmountLow (or close)
//!                      │
//!                      └──────────► re-check
//! ```

pub mod frame;

pub use frame::{Control, ControlEvent, Frame, Message, CUSTOM_EVENT_MARKER};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::{Result, TandemError};
use crate::observable::{Emitter, EventSource, Observable};
use crate::transport::{ChannelEvent, ChannelReadyState, DataChannel};

/// Largest binary payload a single write accepts (10 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Buffered-amount ceiling for binary writes (10 MiB)
pub const HIGH_WATER_MARK: usize = MAX_PAYLOAD_SIZE;

/// Socket lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Waiting for the data channel to open
    Connecting,
    /// Usable
    Open,
    /// Closed, locally or by the remote peer
    Closed,
}

/// Event published by a socket
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// Application data
    Message(Message),
    /// Control event
    Control(ControlEvent),
    /// The socket closed
    Closed {
        /// Whether the remote peer closed it
        by_remote: bool,
    },
}

#[derive(Clone)]
struct Shared {
    label: Arc<str>,
    state: Observable<SocketState>,
    received: Observable<bool>,
    ready: Observable<bool>,
    /// Bumped on every BufferedAmountLow
    drained: Observable<u64>,
    closed_locally: Arc<AtomicBool>,
    closed_by_remote: Arc<AtomicBool>,
    events: Emitter<SocketEvent>,
}

struct SocketInner {
    shared: Shared,
    channel: Arc<dyn DataChannel>,
    write_lock: tokio::sync::Mutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take() {
            pump.abort();
        }
        if self.shared.state.get() != SocketState::Closed {
            self.shared.closed_locally.store(true, Ordering::SeqCst);
            self.channel.close();
        }
    }
}

/// Socket over one data channel. Cloning yields another handle to it.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Socket {
    /// Wrap a channel this side created.
    ///
    /// Events published before anyone subscribes are kept for the first
    /// subscriber.
    pub fn new(channel: Arc<dyn DataChannel>, label: impl Into<String>) -> Result<Self> {
        Self::wrap(channel, label.into(), false)
    }

    /// Wrap a channel the remote peer created, acknowledging it with
    /// `__received` once the channel is open.
    pub fn accept(channel: Arc<dyn DataChannel>, label: impl Into<String>) -> Result<Self> {
        Self::wrap(channel, label.into(), true)
    }

    fn wrap(channel: Arc<dyn DataChannel>, label: String, acknowledge: bool) -> Result<Self> {
        let events = channel.take_events().ok_or_else(|| {
            TandemError::Transport(format!(
                "Data channel '{}' is already owned by a socket",
                channel.label()
            ))
        })?;

        let initial = match channel.ready_state() {
            ChannelReadyState::Connecting => SocketState::Connecting,
            ChannelReadyState::Open => SocketState::Open,
            ChannelReadyState::Closing | ChannelReadyState::Closed => SocketState::Closed,
        };

        let shared = Shared {
            label: Arc::from(label.as_str()),
            state: Observable::new(initial),
            received: Observable::new(false),
            ready: Observable::new(true),
            drained: Observable::new(0),
            closed_locally: Arc::new(AtomicBool::new(false)),
            closed_by_remote: Arc::new(AtomicBool::new(false)),
            events: Emitter::buffered(),
        };

        tracing::debug!(
            label = %label,
            channel = %channel.label(),
            acknowledge,
            "socket created"
        );

        let pump = tokio::spawn(pump(events, Arc::clone(&channel), shared.clone(), acknowledge));

        Ok(Self {
            inner: Arc::new(SocketInner {
                shared,
                channel,
                write_lock: tokio::sync::Mutex::new(()),
                pump: Mutex::new(Some(pump)),
            }),
        })
    }

    /// Socket label
    pub fn label(&self) -> &str {
        &self.inner.shared.label
    }

    /// Transport label of the underlying channel
    pub fn channel_label(&self) -> &str {
        self.inner.channel.label()
    }

    /// Transport id of the underlying channel
    pub fn channel_id(&self) -> u16 {
        self.inner.channel.id()
    }

    /// Current state
    pub fn state(&self) -> SocketState {
        self.inner.shared.state.get()
    }

    /// Whether the socket has closed
    pub fn is_closed(&self) -> bool {
        self.state() == SocketState::Closed
    }

    /// Whether the remote peer closed the socket
    pub fn closed_by_remote(&self) -> bool {
        self.inner.shared.closed_by_remote.load(Ordering::SeqCst)
    }

    /// `false` while a binary write is parked on buffer drain
    pub fn ready(&self) -> Observable<bool> {
        self.inner.shared.ready.clone()
    }

    /// Bytes queued on the underlying channel
    pub fn buffered_amount(&self) -> usize {
        self.inner.channel.buffered_amount()
    }

    /// Resolve once the channel is open
    pub async fn wait_open(&self) -> Result<()> {
        let state = self
            .inner
            .shared
            .state
            .wait(|state| *state != SocketState::Connecting)
            .await;

        if state == SocketState::Closed {
            return Err(self.closed_error());
        }
        Ok(())
    }

    /// Resolve once the remote side has acknowledged this socket
    pub async fn wait_received(&self) -> Result<()> {
        let shared = &self.inner.shared;
        tokio::select! {
            _ = shared.received.wait_for(true) => Ok(()),
            _ = shared.state.wait_for(SocketState::Closed) => Err(self.closed_error()),
        }
    }

    /// Resolve once the socket closes; yields whether the remote closed it
    pub async fn closed(&self) -> bool {
        self.inner.shared.state.wait_for(SocketState::Closed).await;
        self.closed_by_remote()
    }

    /// Write application data
    pub async fn write(&self, message: Message) -> Result<()> {
        self.send_frame(Frame::Data(message)).await
    }

    /// Write a binary payload
    pub async fn write_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.write(Message::Binary(data.into())).await
    }

    /// Write a JSON-serializable value
    pub async fn write_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        self.write(Message::Json(serde_json::to_value(value)?)).await
    }

    /// Write a control event
    pub async fn write_event(&self, control: Control, payload: Value) -> Result<()> {
        self.send_frame(Frame::Control(ControlEvent::new(control, payload)))
            .await
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        let binary_len = frame.binary_len();
        if let Some(size) = binary_len {
            if size > MAX_PAYLOAD_SIZE {
                return Err(TandemError::PayloadTooLarge {
                    size,
                    max: MAX_PAYLOAD_SIZE,
                });
            }
        }

        let wire = frame.encode()?;
        self.wait_open().await?;

        let _guard = self.inner.write_lock.lock().await;
        if let Some(size) = binary_len {
            self.wait_for_room(size).await?;
        }
        if self.is_closed() {
            return Err(self.closed_error());
        }

        self.inner.channel.send(wire)
    }

    async fn wait_for_room(&self, size: usize) -> Result<()> {
        let channel = &self.inner.channel;
        let shared = &self.inner.shared;

        while channel.buffered_amount() + size > HIGH_WATER_MARK {
            shared.ready.set(false);
            channel.set_buffered_amount_low_threshold(HIGH_WATER_MARK - size);

            // Register before re-checking so a drain in between is not lost
            let generation = shared.drained.get();
            let drained = shared.drained.wait(move |g| *g != generation);
            if channel.buffered_amount() + size <= HIGH_WATER_MARK {
                drained.cancel();
                break;
            }

            tracing::debug!(
                label = %shared.label,
                buffered = channel.buffered_amount(),
                size,
                "waiting for channel buffer to drain"
            );

            tokio::select! {
                _ = drained => {},
                _ = shared.state.wait_for(SocketState::Closed) => {
                    shared.ready.set(true);
                    return Err(self.closed_error());
                },
            }
        }

        channel.set_buffered_amount_low_threshold(0);
        shared.ready.set(true);
        Ok(())
    }

    /// Close the socket and its channel
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.inner.shared.closed_locally.store(true, Ordering::SeqCst);
        self.inner.channel.close();
    }

    fn closed_error(&self) -> TandemError {
        TandemError::SocketClosed(self.label().to_string())
    }
}

impl EventSource for Socket {
    type Event = SocketEvent;

    fn emitter(&self) -> &Emitter<SocketEvent> {
        &self.inner.shared.events
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("label", &self.label())
            .field("channel", &self.channel_label())
            .field("state", &self.state())
            .finish()
    }
}

async fn pump(
    mut events: BoxStream<'static, ChannelEvent>,
    channel: Arc<dyn DataChannel>,
    shared: Shared,
    acknowledge: bool,
) {
    let mut acknowledged = false;
    let acknowledge_now = |acknowledged: &mut bool| {
        if !acknowledge || *acknowledged {
            return;
        }
        *acknowledged = true;
        let frame = Frame::Control(ControlEvent::new(Control::Received, Value::Null));
        match frame.encode().and_then(|wire| channel.send(wire)) {
            Ok(()) => tracing::debug!(label = %shared.label, "socket acknowledged"),
            Err(e) => tracing::warn!(label = %shared.label, "failed to acknowledge socket: {}", e),
        }
    };

    if shared.state.get() == SocketState::Open {
        acknowledge_now(&mut acknowledged);
    }

    while let Some(event) = events.next().await {
        match event {
            ChannelEvent::Open => {
                shared.state.replace(SocketState::Open);
                acknowledge_now(&mut acknowledged);
            },
            ChannelEvent::Message(wire) => match Frame::decode(wire) {
                Ok(Frame::Data(message)) => shared.events.publish(SocketEvent::Message(message)),
                Ok(Frame::Control(event)) if event.control == Control::Received => {
                    shared.received.set(true);
                },
                Ok(Frame::Control(event)) => shared.events.publish(SocketEvent::Control(event)),
                Err(e) => {
                    tracing::warn!(label = %shared.label, "dropping undecodable frame: {}", e);
                },
            },
            ChannelEvent::BufferedAmountLow => shared.drained.update(|g| *g += 1),
            ChannelEvent::Closed => break,
        }
    }

    let by_remote = !shared.closed_locally.load(Ordering::SeqCst);
    shared.closed_by_remote.store(by_remote, Ordering::SeqCst);
    shared.state.set(SocketState::Closed);
    shared.ready.set(true);
    tracing::debug!(label = %shared.label, by_remote, "socket closed");
    shared.events.publish(SocketEvent::Closed { by_remote });
}
