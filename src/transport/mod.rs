//! Transport layer abstraction.
//!
//! The engine drives a WebRTC-style peer connection but never implements one.
//! ICE, DTLS and SCTP live behind two traits:
//!
//! - [`PeerConnection`]: offer/answer and candidate plumbing, connection state,
//!   data channel creation, ICE restart and per-channel stats.
//! - [`DataChannel`]: one reliable, ordered, message-oriented channel with a
//!   buffered-amount counter.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                 Engine                   │
//! │         (Transport-Agnostic)            │
//! └──────────────────┬──────────────────────┘
//!                    │ Connector
//!          ┌────────┴────────┐
//!          ▼                 ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │  MemoryPeer     │ │  (WebRTC stack) │
//! │  (in-process)   │ │   external      │
//! └─────────────────┘ └─────────────────┘
//! ```
//!
//! [`memory`] provides an in-process pair used by tests and the demo binary.

pub mod memory;

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Public STUN server always offered to the transport
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// SDP description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Provisional answer
    Pranswer,
    /// Final answer
    Answer,
    /// Rollback of a local offer
    Rollback,
}

/// Session description, opaque to the engine apart from its type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type
    #[serde(rename = "type")]
    pub kind: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Check if this is an offer
    pub fn is_offer(&self) -> bool {
        self.kind == SdpType::Offer
    }
}

/// ICE candidate as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Signaling state of the peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No exchange in progress
    Stable,
    /// Local offer applied, waiting for answer
    HaveLocalOffer,
    /// Remote offer applied, answer not yet created
    HaveRemoteOffer,
    /// Local provisional answer applied
    HaveLocalPranswer,
    /// Remote provisional answer applied
    HaveRemotePranswer,
    /// Connection closed
    Closed,
}

/// Connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    /// Created, nothing attempted
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Connected
    Connected,
    /// Temporarily lost
    Disconnected,
    /// ICE failed
    Failed,
    /// Closed
    Closed,
}

/// Data channel ready state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelReadyState {
    /// Not open yet
    Connecting,
    /// Open for sending
    Open,
    /// Close requested
    Closing,
    /// Closed
    Closed,
}

/// Raw message on a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Binary payload
    Binary(Bytes),
    /// Text payload
    Text(String),
}

impl WireMessage {
    /// Payload size in bytes
    pub fn len(&self) -> usize {
        match self {
            Self::Binary(data) => data.len(),
            Self::Text(text) => text.len(),
        }
    }

    /// Check if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Data channel notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Channel opened
    Open,
    /// Message received
    Message(WireMessage),
    /// Buffered amount dropped to the low threshold
    BufferedAmountLow,
    /// Channel closed (locally or remotely)
    Closed,
}

/// Peer connection notification
pub enum PeerEvent {
    /// Local negotiation is needed
    NegotiationNeeded,
    /// Local ICE candidate gathered; `None` marks end of candidates
    IceCandidate(Option<IceCandidate>),
    /// Connection state changed
    ConnectionStateChange(PeerConnectionState),
    /// Remote side opened a data channel
    DataChannel(Arc<dyn DataChannel>),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NegotiationNeeded => write!(f, "NegotiationNeeded"),
            Self::IceCandidate(candidate) => f.debug_tuple("IceCandidate").field(candidate).finish(),
            Self::ConnectionStateChange(state) => {
                f.debug_tuple("ConnectionStateChange").field(state).finish()
            },
            Self::DataChannel(channel) => f.debug_tuple("DataChannel").field(&channel.label()).finish(),
        }
    }
}

/// ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Server entry without credentials
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

/// Configuration handed to the transport when the engine creates it
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcConfiguration {
    /// ICE servers
    pub ice_servers: Vec<IceServer>,
}

/// Per-channel transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Channel label
    pub label: String,
    /// Channel id
    pub id: u16,
    /// Messages sent
    pub messages_sent: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// One reliable, ordered data channel.
pub trait DataChannel: Send + Sync {
    /// Transport label
    fn label(&self) -> &str;

    /// Transport channel id
    fn id(&self) -> u16;

    /// Current ready state
    fn ready_state(&self) -> ChannelReadyState;

    /// Bytes queued but not yet sent
    fn buffered_amount(&self) -> usize;

    /// Threshold for [`ChannelEvent::BufferedAmountLow`]
    fn set_buffered_amount_low_threshold(&self, threshold: usize);

    /// Queue a message for sending
    fn send(&self, message: WireMessage) -> Result<()>;

    /// Close the channel
    fn close(&self);

    /// Take the event stream. Yields `None` after the first call.
    fn take_events(&self) -> Option<BoxStream<'static, ChannelEvent>>;
}

/// WebRTC-style peer connection.
pub trait PeerConnection: Send + Sync {
    /// Create a data channel with the given label
    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    /// Create and apply an offer or answer, depending on signaling state
    fn set_local_description(&self) -> BoxFuture<'_, Result<SessionDescription>>;

    /// Currently applied local description
    fn local_description(&self) -> Option<SessionDescription>;

    /// Apply a remote description
    fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> BoxFuture<'_, Result<()>>;

    /// Add a remote ICE candidate; `None` marks end of candidates
    fn add_ice_candidate(&self, candidate: Option<IceCandidate>) -> BoxFuture<'_, Result<()>>;

    /// Current signaling state
    fn signaling_state(&self) -> SignalingState;

    /// Current connection state
    fn connection_state(&self) -> PeerConnectionState;

    /// Restart ICE negotiation
    fn restart_ice(&self);

    /// Close the connection
    fn close(&self);

    /// Take the event stream. Yields `None` after the first call.
    fn take_events(&self) -> Option<BoxStream<'static, PeerEvent>>;

    /// Stats for the channel with the given id
    fn stats(&self, channel_id: u16) -> BoxFuture<'_, Result<Option<ChannelStats>>>;
}

/// Creates the peer connection the engine will own.
pub trait Connector: Send + Sync {
    /// Create a peer connection for `config`
    fn connect(&self, config: &RtcConfiguration) -> Result<Arc<dyn PeerConnection>>;
}

impl<F> Connector for F
where
    F: Fn(&RtcConfiguration) -> Result<Arc<dyn PeerConnection>> + Send + Sync,
{
    fn connect(&self, config: &RtcConfiguration) -> Result<Arc<dyn PeerConnection>> {
        self(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_wire_format() {
        let desc = SessionDescription::offer("v=0");
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0");
        assert!(desc.is_offer());
    }

    #[test]
    fn test_candidate_wire_format() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_none());
    }

    #[test]
    fn test_wire_message_len() {
        assert_eq!(WireMessage::Binary(Bytes::from_static(b"abc")).len(), 3);
        assert!(WireMessage::Text(String::new()).is_empty());
    }
}
