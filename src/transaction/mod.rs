//! Unidirectional, flow-controlled transfers over one [`Socket`].
//!
//! [`Socket`]: crate::socket::Socket

pub mod chunk;
pub mod eta;
mod reader;
mod shared;
mod writer;

pub use chunk::ChunkProducer;
pub use eta::{format_bytes, ProgressTracker};
pub use reader::TransactionReader;
pub use shared::Transaction;
pub use writer::TransactionWriter;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::TandemError;

/// Writer chunk size (200 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 200 * 1024;

/// Reader queue high-water mark (10 MiB)
pub const READER_HIGH_WATER_MARK: usize = 10 * 1024 * 1024;

/// Arbitrary transaction metadata; `size` (bytes) enables progress tracking.
pub type Metadata = Map<String, Value>;

/// Build metadata declaring `size`
pub fn sized(size: u64) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("size".to_string(), Value::from(size));
    metadata
}

/// Transaction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    /// Transferring
    Active,
    /// Paused by either side
    Paused,
    /// All bytes transferred
    Done,
    /// Canceled by the reader
    Canceled,
    /// Aborted by the writer
    Aborted,
    /// The socket closed before completion
    Failed,
}

impl TransactionState {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Canceled | Self::Aborted | Self::Failed)
    }
}

/// Why a transaction ended without completing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Reader canceled with a reason
    Canceled(String),
    /// Writer aborted with an error
    Aborted {
        /// Error name
        name: String,
        /// Error message
        message: String,
    },
    /// The socket closed early
    ClosedUnexpectedly,
}

impl Termination {
    /// Terminal state this termination leads to
    pub fn state(&self) -> TransactionState {
        match self {
            Self::Canceled(_) => TransactionState::Canceled,
            Self::Aborted { .. } => TransactionState::Aborted,
            Self::ClosedUnexpectedly => TransactionState::Failed,
        }
    }

    /// Error surfaced on the affected stream
    pub fn to_error(&self, label: &str) -> TandemError {
        match self {
            Self::Canceled(reason) => TandemError::Canceled(reason.clone()),
            Self::Aborted { name, message } => TandemError::Aborted {
                name: name.clone(),
                message: message.clone(),
            },
            Self::ClosedUnexpectedly => TandemError::ClosedUnexpectedly(label.to_string()),
        }
    }
}

/// Periodic progress snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    /// Bytes processed
    pub processed: u64,
    /// `processed / size`
    pub progress: f64,
    /// Seconds remaining (rounded)
    pub eta: f64,
    /// Human readable rate, e.g. "1.5 MB/s"
    pub speed: String,
}

/// Event published by a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionEvent {
    /// Progress report
    Report(Report),
    /// State transition
    State(TransactionState),
}
