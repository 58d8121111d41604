//! # Tandem - peer-to-peer session layer
//!
//! Tandem turns one WebRTC-style peer connection into a session two peers can
//! build on without a central server for data. It solves three problems:
//!
//! - **Role agreement**: the two peers agree on polite/impolite roles over a
//!   pluggable signaler, then negotiate with the "perfect negotiation" pattern
//!   so simultaneous offers never deadlock.
//! - **Multiplexing**: any number of labeled [`Socket`]s share the connection,
//!   each carrying data and in-band control events on one data channel.
//! - **Bulk transfer**: [`TransactionWriter`] / [`TransactionReader`] pairs
//!   move large payloads in fixed-size chunks with two-level backpressure,
//!   bilateral pause/resume, cancellation and live ETA estimation.
//!
//! ## Architecture
//!
//! ```text
//!            Signaler (external)                 PeerConnection (external)
//!                  │                                      │
//!           ┌──────┴───────┐                              │
//!           │ SignalManager│                              │
//!           └──────┬───────┘                              │
//!                  ▼                                      ▼
//!           ┌─────────────────────────────────────────────────┐
//!           │  Engine: roles, offer/answer, ICE restart       │
//!           └──────┬──────────────────┬───────────────┬───────┘
//!                  ▼                  ▼               ▼
//!               Socket             Channel       Transaction{Reader,Writer}
//!          (framing, drain)    (messages, files)  (chunks, pause, ETA)
//! ```
//!
//! Every component synchronizes through [`observable`]: single-writer value
//! cells with predicate waits, and an emitter for events.
//!
//! ## Wire Formats
//!
//! | Plane          | Frame                                                          |
//! |----------------|----------------------------------------------------------------|
//! | Signaling      | `{"type":"role"\|"description"\|"icecandidate", ...}`          |
//! | Socket data    | binary, or JSON text without the control marker                |
//! | Socket control | `{"_channelEngineCustomEvent":true,"event":..,"payload":..}`   |
//!
//! ### Transaction Handshake
//!
//! ```text
//! writer ── metadata {size} ──────────► reader
//! writer ◄───────── __transaction-ready ─ reader
//! writer ── binary chunks ────────────► reader   (done when processed == size)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tandem::config::EngineConfig;
//! use tandem::signal::LocalSignaler;
//! use tandem::transaction::sized;
//! use tandem::transport::memory::MemoryPeer;
//! use tandem::transport::{PeerConnection, RtcConfiguration};
//! use tandem::Engine;
//!
//! let (sig_a, sig_b) = LocalSignaler::pair();
//! let (pc_a, pc_b) = MemoryPeer::pair();
//!
//! let a = Engine::new(sig_a, &move |_: &RtcConfiguration| Ok::<_, tandem::TandemError>(pc_a.clone() as Arc<dyn PeerConnection>), EngineConfig::default())?;
//! let b = Engine::new(sig_b, &move |_: &RtcConfiguration| Ok::<_, tandem::TandemError>(pc_b.clone() as Arc<dyn PeerConnection>), EngineConfig::default())?;
//!
//! let (writer, reader) = tokio::try_join!(
//!     a.writable(Some("upload"), sized(5)),
//!     b.readable("upload"),
//! )?;
//! writer.write(&b"hello"[..]).await?;
//! writer.finish().await?;
//! assert_eq!(reader.read_to_end().await?, b"hello");
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: Role assignment, negotiation, reconnection and factories
//! - [`socket`]: Framing and transport-level backpressure
//! - [`channel`]: Bidirectional messages with file promotion
//! - [`transaction`]: Chunked, flow-controlled transfers with progress
//! - [`signal`]: Signaler interface, routing and an in-process signaler
//! - [`transport`]: Peer connection interface and an in-process transport
//! - [`observable`]: Observable values, joins and emitters
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod observable;
pub mod signal;
pub mod socket;
pub mod transaction;
pub mod transport;

// Re-exports for convenience
pub use channel::{Channel, ChannelEvent};
pub use config::{Config, EngineConfig, TransferConfig};
pub use engine::{ConnectionState, Engine, EngineEvent, Role};
pub use error::{Result, TandemError};
pub use observable::{wait_all, Emitter, EventSource, Observable, Subscription};
pub use signal::{Hook, LocalSignaler, SignalEnvelope, SignalManager, Signaler};
pub use socket::{Control, ControlEvent, Message, Socket, SocketEvent, SocketState};
pub use transaction::{
    Metadata, Report, Termination, Transaction, TransactionEvent, TransactionReader,
    TransactionState, TransactionWriter,
};
pub use transport::{Connector, DataChannel, PeerConnection};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
