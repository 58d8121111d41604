//! Signaling.
//!
//! Negotiation envelopes travel over an external [`Signaler`] before (and
//! while) the direct transport exists. The engine never talks to the signaler
//! directly; it goes through a [`SignalManager`], which gates sends on the
//! signaler's readiness and queues inbound envelopes per `type` until a
//! handler registers.
//!
//! # Envelopes
//!
//! ```text
//! {"type":"role","seed":0.42}
//! {"type":"description","description":{"type":"offer","sdp":"..."}}
//! {"type":"icecandidate","candidate":{"candidate":"...","sdpMid":"0"}}
//! {"type":"icecandidate","candidate":null}
//! ```

pub mod local;
pub mod manager;

pub use local::LocalSignaler;
pub use manager::SignalManager;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::transport::{IceCandidate, SessionDescription};

/// Envelope type tag for role seeds
pub const ROLE: &str = "role";
/// Envelope type tag for session descriptions
pub const DESCRIPTION: &str = "description";
/// Envelope type tag for ICE candidates
pub const ICE_CANDIDATE: &str = "icecandidate";

/// Negotiation envelope, routed by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalEnvelope {
    /// Role-assignment seed
    Role {
        /// Random seed; the larger seed becomes polite
        seed: f64,
    },
    /// Offer or answer
    Description {
        /// Session description
        description: SessionDescription,
    },
    /// ICE candidate; `None` marks end of candidates
    #[serde(rename = "icecandidate")]
    IceCandidate {
        /// Candidate
        candidate: Option<IceCandidate>,
    },
}

impl SignalEnvelope {
    /// The envelope's `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Role { .. } => ROLE,
            Self::Description { .. } => DESCRIPTION,
            Self::IceCandidate { .. } => ICE_CANDIDATE,
        }
    }
}

/// Signaler lifecycle hook, invoked at the matching connection transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// Negotiation is starting
    Start,
    /// Transport connected
    Connected,
    /// Transport disconnected
    Disconnected,
    /// Transport failed
    Failed,
    /// Engine closed
    Close,
}

impl Hook {
    /// Hook name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Close => "close",
        }
    }
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// External signaling channel.
///
/// Implementations deliver every envelope sent by the remote peer on the
/// stream returned by [`messages`](Signaler::messages), in send order. An
/// `Err` item on that stream is a fatal signaling failure.
pub trait Signaler: Send + Sync {
    /// Send an envelope to the remote peer
    fn send(&self, message: Value) -> BoxFuture<'_, Result<()>>;

    /// Take the inbound envelope stream. Yields `None` after the first call.
    fn messages(&self) -> Option<BoxStream<'static, Result<Value>>>;

    /// Resolve once sends are safe
    fn ready(&self) -> BoxFuture<'_, ()>;

    /// Lifecycle hook; the default does nothing
    fn hook(&self, hook: Hook) -> BoxFuture<'_, Result<()>> {
        let _ = hook;
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_envelope_wire_format() {
        let json = serde_json::to_value(SignalEnvelope::Role { seed: 10.0 }).unwrap();
        assert_eq!(json, json!({"type": "role", "seed": 10.0}));
    }

    #[test]
    fn test_null_candidate_round_trips() {
        let envelope: SignalEnvelope =
            serde_json::from_value(json!({"type": "icecandidate", "candidate": null})).unwrap();
        assert_eq!(envelope, SignalEnvelope::IceCandidate { candidate: None });
        assert_eq!(envelope.kind(), ICE_CANDIDATE);
    }

    #[test]
    fn test_description_envelope_nests_sdp_type() {
        let envelope = SignalEnvelope::Description {
            description: SessionDescription::answer("v=0"),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "description");
        assert_eq!(json["description"]["type"], "answer");
    }
}
