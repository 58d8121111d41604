//! In-process transport.
//!
//! [`MemoryPeer::pair`] returns two linked peer connections that follow the
//! browser's offer/answer state machine closely enough for perfect negotiation
//! to matter: offers collide, polite peers roll back implicitly, candidates are
//! rejected before a remote description exists, and data channels opened
//! before the first exchange are announced once it completes.
//!
//! [`MemoryChannel::pair`] returns two linked data channels with a real
//! buffered-amount counter: bytes stay "buffered" until the remote end's event
//! stream yields them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use super::{
    ChannelEvent, ChannelReadyState, ChannelStats, DataChannel, IceCandidate, PeerConnection,
    PeerConnectionState, PeerEvent, RtcConfiguration, SdpType, SessionDescription,
    SignalingState, WireMessage,
};
use crate::error::{Result, TandemError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Delivery {
    Event(ChannelEvent),
    Message {
        message: WireMessage,
        from: Weak<MemoryChannel>,
    },
}

/// One end of an in-process data channel.
pub struct MemoryChannel {
    me: Weak<MemoryChannel>,
    label: String,
    id: u16,
    state: Mutex<ChannelReadyState>,
    events_tx: mpsc::UnboundedSender<Delivery>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    remote: Mutex<Weak<MemoryChannel>>,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    stats: Mutex<ChannelStats>,
}

impl MemoryChannel {
    fn new(label: &str, id: u16) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            label: label.to_string(),
            id,
            state: Mutex::new(ChannelReadyState::Connecting),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            remote: Mutex::new(Weak::new()),
            buffered: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
            stats: Mutex::new(ChannelStats {
                label: label.to_string(),
                id,
                ..Default::default()
            }),
        })
    }

    /// Two linked ends, both still connecting
    pub fn pair(label: &str, id: u16) -> (Arc<Self>, Arc<Self>) {
        let a = Self::new(label, id);
        let b = Self::new(label, id);
        *lock(&a.remote) = Arc::downgrade(&b);
        *lock(&b.remote) = Arc::downgrade(&a);
        (a, b)
    }

    /// Two linked ends, already open
    pub fn open_pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let (a, b) = Self::pair(label, 0);
        a.open();
        b.open();
        (a, b)
    }

    /// Mark this end open
    pub fn open(&self) {
        let mut state = lock(&self.state);
        if *state == ChannelReadyState::Connecting {
            *state = ChannelReadyState::Open;
            let _ = self.events_tx.send(Delivery::Event(ChannelEvent::Open));
        }
    }

    /// Transport statistics for this end
    pub fn channel_stats(&self) -> ChannelStats {
        lock(&self.stats).clone()
    }

    fn acknowledge(&self, len: usize) {
        let before = self.buffered.fetch_sub(len, Ordering::SeqCst);
        let after = before.saturating_sub(len);
        let threshold = self.low_threshold.load(Ordering::SeqCst);
        if before > threshold && after <= threshold {
            let _ = self
                .events_tx
                .send(Delivery::Event(ChannelEvent::BufferedAmountLow));
        }
    }

    fn record_received(&self, message: &WireMessage) {
        let mut stats = lock(&self.stats);
        stats.messages_received += 1;
        stats.bytes_received += message.len() as u64;
    }

    fn mark_closed(&self) -> bool {
        let mut state = lock(&self.state);
        if *state == ChannelReadyState::Closed {
            return false;
        }
        *state = ChannelReadyState::Closed;
        let _ = self.events_tx.send(Delivery::Event(ChannelEvent::Closed));
        true
    }
}

impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn id(&self) -> u16 {
        self.id
    }

    fn ready_state(&self) -> ChannelReadyState {
        *lock(&self.state)
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.low_threshold.store(threshold, Ordering::SeqCst);
    }

    fn send(&self, message: WireMessage) -> Result<()> {
        if self.ready_state() != ChannelReadyState::Open {
            return Err(TandemError::Transport(format!(
                "Data channel '{}' is not open",
                self.label
            )));
        }

        let remote = lock(&self.remote).upgrade().ok_or_else(|| {
            TandemError::Transport(format!("Data channel '{}' has no remote end", self.label))
        })?;

        let len = message.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        {
            let mut stats = lock(&self.stats);
            stats.messages_sent += 1;
            stats.bytes_sent += len as u64;
        }

        let delivery = Delivery::Message {
            message,
            from: self.me.clone(),
        };
        if remote.events_tx.send(delivery).is_err() {
            self.acknowledge(len);
        }
        Ok(())
    }

    fn close(&self) {
        if !self.mark_closed() {
            return;
        }
        if let Some(remote) = lock(&self.remote).upgrade() {
            remote.mark_closed();
        }
    }

    fn take_events(&self) -> Option<BoxStream<'static, ChannelEvent>> {
        let rx = lock(&self.events_rx).take()?;
        let me = self.me.clone();

        let events = stream::unfold(rx, move |mut rx| {
            let me = me.clone();
            async move {
                let event = match rx.recv().await? {
                    Delivery::Event(event) => event,
                    Delivery::Message { message, from } => {
                        if let Some(me) = me.upgrade() {
                            me.record_received(&message);
                        }
                        if let Some(sender) = from.upgrade() {
                            sender.acknowledge(message.len());
                        }
                        ChannelEvent::Message(message)
                    },
                };
                Some((event, rx))
            }
        });

        Some(events.boxed())
    }
}

struct PeerState {
    signaling: SignalingState,
    connection: PeerConnectionState,
    local: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    negotiation_pending: bool,
    /// Channels created before the first completed exchange
    pending: Vec<(Arc<MemoryChannel>, Arc<MemoryChannel>)>,
    channels: HashMap<u16, Arc<MemoryChannel>>,
    next_channel_id: u16,
    version: u64,
}

/// In-process peer connection.
pub struct MemoryPeer {
    me: Weak<MemoryPeer>,
    name: String,
    remote: Mutex<Weak<MemoryPeer>>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    state: Mutex<PeerState>,
    restarts: AtomicUsize,
    configuration: Mutex<RtcConfiguration>,
}

impl MemoryPeer {
    fn new(name: &str, first_channel_id: u16) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: name.to_string(),
            remote: Mutex::new(Weak::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            state: Mutex::new(PeerState {
                signaling: SignalingState::Stable,
                connection: PeerConnectionState::New,
                local: None,
                remote_description: None,
                negotiation_pending: false,
                pending: Vec::new(),
                channels: HashMap::new(),
                next_channel_id: first_channel_id,
                version: 0,
            }),
            restarts: AtomicUsize::new(0),
            configuration: Mutex::new(RtcConfiguration::default()),
        })
    }

    /// Two linked peers
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Self::new("a", 0);
        let b = Self::new("b", 1);
        *lock(&a.remote) = Arc::downgrade(&b);
        *lock(&b.remote) = Arc::downgrade(&a);
        (a, b)
    }

    /// Record the configuration the engine asked for
    pub fn configure(&self, config: &RtcConfiguration) {
        *lock(&self.configuration) = config.clone();
    }

    /// Configuration last passed to [`configure`](Self::configure)
    pub fn configuration(&self) -> RtcConfiguration {
        lock(&self.configuration).clone()
    }

    /// Number of `restart_ice` calls
    pub fn restart_count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Report a connection state as if ICE had changed it
    pub fn force_connection_state(&self, state: PeerConnectionState) {
        lock(&self.state).connection = state;
        let _ = self
            .events_tx
            .send(PeerEvent::ConnectionStateChange(state));
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_connection(&self, state: &mut PeerState, next: PeerConnectionState) -> bool {
        if state.connection == next {
            return false;
        }
        state.connection = next;
        true
    }

    fn candidate(&self, version: u64) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                version,
                9000 + version
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: Some(self.name.clone()),
        }
    }

    /// Offer/answer finished: connect and announce queued channels
    fn complete_exchange(&self) {
        let (changed, pending) = {
            let mut state = lock(&self.state);
            let changed = self.set_connection(&mut state, PeerConnectionState::Connected);
            (changed, std::mem::take(&mut state.pending))
        };

        if changed {
            tracing::debug!(peer = %self.name, "memory transport connected");
            self.emit(PeerEvent::ConnectionStateChange(PeerConnectionState::Connected));
        }

        for (local, remote_end) in pending {
            self.announce(&local, remote_end);
        }
    }

    fn announce(&self, local: &Arc<MemoryChannel>, remote_end: Arc<MemoryChannel>) {
        let Some(remote) = lock(&self.remote).upgrade() else {
            return;
        };
        lock(&remote.state)
            .channels
            .insert(remote_end.id, Arc::clone(&remote_end));
        remote.emit(PeerEvent::DataChannel(remote_end.clone() as Arc<dyn DataChannel>));
        local.open();
        remote_end.open();
    }
}

impl PeerConnection for MemoryPeer {
    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let mut state = lock(&self.state);
        if state.connection == PeerConnectionState::Closed {
            return Err(TandemError::Transport("Peer connection is closed".to_string()));
        }

        let id = state.next_channel_id;
        state.next_channel_id = state.next_channel_id.wrapping_add(2);
        let (local, remote_end) = MemoryChannel::pair(label, id);
        state.channels.insert(id, Arc::clone(&local));

        if state.connection == PeerConnectionState::Connected {
            drop(state);
            self.announce(&local, remote_end);
            return Ok(local);
        }

        state.pending.push((Arc::clone(&local), remote_end));
        let first_negotiation = !state.negotiation_pending
            && state.signaling == SignalingState::Stable
            && state.local.is_none();
        if first_negotiation {
            state.negotiation_pending = true;
        }
        drop(state);

        if first_negotiation {
            self.emit(PeerEvent::NegotiationNeeded);
        }
        Ok(local)
    }

    fn set_local_description(&self) -> BoxFuture<'_, Result<SessionDescription>> {
        Box::pin(async move {
            let mut complete = false;
            let mut connecting = false;
            let (description, version) = {
                let mut state = lock(&self.state);
                match state.signaling {
                    SignalingState::HaveRemoteOffer => {
                        state.version += 1;
                        let answer = SessionDescription::answer(format!(
                            "v=0 o={} {} answer",
                            self.name, state.version
                        ));
                        state.local = Some(answer.clone());
                        state.signaling = SignalingState::Stable;
                        complete = true;
                        (answer, state.version)
                    },
                    SignalingState::Stable => {
                        state.version += 1;
                        let offer = SessionDescription::offer(format!(
                            "v=0 o={} {} offer",
                            self.name, state.version
                        ));
                        state.local = Some(offer.clone());
                        state.signaling = SignalingState::HaveLocalOffer;
                        state.negotiation_pending = false;
                        if state.connection == PeerConnectionState::New {
                            connecting =
                                self.set_connection(&mut state, PeerConnectionState::Connecting);
                        }
                        (offer, state.version)
                    },
                    SignalingState::HaveLocalOffer => match state.local.clone() {
                        Some(offer) => (offer, state.version),
                        None => {
                            return Err(TandemError::Negotiation(
                                "Local offer missing".to_string(),
                            ))
                        },
                    },
                    other => {
                        return Err(TandemError::Negotiation(format!(
                            "Cannot set local description in state {:?}",
                            other
                        )))
                    },
                }
            };

            if connecting {
                self.emit(PeerEvent::ConnectionStateChange(PeerConnectionState::Connecting));
            }
            self.emit(PeerEvent::IceCandidate(Some(self.candidate(version))));
            self.emit(PeerEvent::IceCandidate(None));

            if complete {
                self.complete_exchange();
            }
            Ok(description)
        })
    }

    fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut complete = false;
            let mut connecting = false;
            {
                let mut state = lock(&self.state);
                match description.kind {
                    SdpType::Offer => {
                        match state.signaling {
                            SignalingState::Stable | SignalingState::HaveRemoteOffer => {},
                            SignalingState::HaveLocalOffer => {
                                tracing::debug!(peer = %self.name, "implicit rollback of local offer");
                                state.local = None;
                            },
                            other => {
                                return Err(TandemError::Negotiation(format!(
                                    "Cannot apply remote offer in state {:?}",
                                    other
                                )))
                            },
                        }
                        state.signaling = SignalingState::HaveRemoteOffer;
                        if state.connection == PeerConnectionState::New {
                            connecting =
                                self.set_connection(&mut state, PeerConnectionState::Connecting);
                        }
                    },
                    SdpType::Answer | SdpType::Pranswer => {
                        if state.signaling != SignalingState::HaveLocalOffer {
                            return Err(TandemError::Negotiation(format!(
                                "Cannot apply remote answer in state {:?}",
                                state.signaling
                            )));
                        }
                        state.signaling = SignalingState::Stable;
                        complete = true;
                    },
                    SdpType::Rollback => {
                        if state.signaling == SignalingState::HaveLocalOffer {
                            state.local = None;
                        }
                        state.signaling = SignalingState::Stable;
                    },
                }
                state.remote_description = Some(description);
            }

            if connecting {
                self.emit(PeerEvent::ConnectionStateChange(PeerConnectionState::Connecting));
            }
            if complete {
                self.complete_exchange();
            }
            Ok(())
        })
    }

    fn add_ice_candidate(&self, candidate: Option<IceCandidate>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let state = lock(&self.state);
            if candidate.is_some() && state.remote_description.is_none() {
                return Err(TandemError::Transport(
                    "Cannot add ICE candidate without a remote description".to_string(),
                ));
            }
            Ok(())
        })
    }

    fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    fn connection_state(&self) -> PeerConnectionState {
        lock(&self.state).connection
    }

    fn restart_ice(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(peer = %self.name, "memory transport ICE restart");
        self.emit(PeerEvent::NegotiationNeeded);
    }

    fn close(&self) {
        let channels: Vec<Arc<MemoryChannel>> = {
            let mut state = lock(&self.state);
            state.connection = PeerConnectionState::Closed;
            state.signaling = SignalingState::Closed;
            state.pending.clear();
            state.channels.values().cloned().collect()
        };

        for channel in channels {
            channel.close();
        }

        if let Some(remote) = lock(&self.remote).upgrade() {
            if remote.connection_state() != PeerConnectionState::Closed {
                remote.force_connection_state(PeerConnectionState::Disconnected);
            }
        }
    }

    fn take_events(&self) -> Option<BoxStream<'static, PeerEvent>> {
        let rx = lock(&self.events_rx).take()?;
        let events = stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await?;
            Some((event, rx))
        });
        Some(events.boxed())
    }

    fn stats(&self, channel_id: u16) -> BoxFuture<'_, Result<Option<crate::transport::ChannelStats>>> {
        Box::pin(async move {
            Ok(lock(&self.state)
                .channels
                .get(&channel_id)
                .map(|channel| channel.channel_stats()))
        })
    }
}

impl std::fmt::Debug for MemoryPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPeer")
            .field("name", &self.name)
            .field("connection", &self.connection_state())
            .field("signaling", &self.signaling_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_channel_pair_delivers_in_order() {
        let (a, b) = MemoryChannel::open_pair("chat");
        let mut events = b.take_events().unwrap();
        assert_eq!(events.next().await, Some(ChannelEvent::Open));

        a.send(WireMessage::Text("one".into())).unwrap();
        a.send(WireMessage::Binary(Bytes::from_static(b"two"))).unwrap();
        assert_eq!(a.buffered_amount(), 6);

        assert_eq!(
            events.next().await,
            Some(ChannelEvent::Message(WireMessage::Text("one".into())))
        );
        assert_eq!(
            events.next().await,
            Some(ChannelEvent::Message(WireMessage::Binary(Bytes::from_static(b"two"))))
        );
        assert_eq!(a.buffered_amount(), 0);
        assert!(b.take_events().is_none());
    }

    #[tokio::test]
    async fn test_buffered_amount_low_fires_on_drain() {
        let (a, b) = MemoryChannel::open_pair("bulk");
        let mut sender_events = a.take_events().unwrap();
        let mut receiver_events = b.take_events().unwrap();
        assert_eq!(sender_events.next().await, Some(ChannelEvent::Open));
        assert_eq!(receiver_events.next().await, Some(ChannelEvent::Open));

        a.set_buffered_amount_low_threshold(4);
        a.send(WireMessage::Binary(Bytes::from(vec![0u8; 8]))).unwrap();
        receiver_events.next().await;

        assert_eq!(sender_events.next().await, Some(ChannelEvent::BufferedAmountLow));
    }

    #[tokio::test]
    async fn test_send_on_closed_channel_fails() {
        let (a, b) = MemoryChannel::open_pair("x");
        b.close();
        assert_eq!(a.ready_state(), ChannelReadyState::Closed);
        assert!(a.send(WireMessage::Text("late".into())).is_err());
    }

    #[tokio::test]
    async fn test_offer_answer_connects_and_announces_channels() {
        let (a, b) = MemoryPeer::pair();
        let mut b_events = b.take_events().unwrap();

        a.create_data_channel("first").unwrap();
        let offer = a.set_local_description().await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);

        b.set_remote_description(offer).await.unwrap();
        let answer = b.set_local_description().await.unwrap();
        assert_eq!(answer.kind, SdpType::Answer);
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.connection_state(), PeerConnectionState::Connected);
        assert_eq!(b.connection_state(), PeerConnectionState::Connected);

        let mut announced = None;
        while let Some(event) = b_events.next().await {
            if let PeerEvent::DataChannel(channel) = event {
                announced = Some(channel);
                break;
            }
        }
        assert_eq!(announced.unwrap().label(), "first");
    }

    #[tokio::test]
    async fn test_candidate_without_remote_description_fails() {
        let (a, _b) = MemoryPeer::pair();
        let candidate = a.candidate(1);
        assert!(a.add_ice_candidate(Some(candidate)).await.is_err());
        assert!(a.add_ice_candidate(None).await.is_ok());
    }
}
