//! Negotiation engine.
//!
//! An [`Engine`] owns one peer connection and drives it through the
//! "perfect negotiation" pattern:
//!
//! 1. **Role assignment.** Both peers send a random seed over the signaler.
//!    The strictly larger seed is polite, equal seeds re-roll. A peer that
//!    already holds a role and receives a seed resets and re-rolls, so a
//!    restarted peer converges with one that kept its state.
//! 2. **Offer/answer.** Whenever the transport asks for negotiation the
//!    engine marks itself as making an offer and sends its local description.
//!    On an incoming offer that collides with local negotiation the impolite
//!    peer ignores it; the polite peer rolls back and answers.
//! 3. **Reconnection.** On `failed` the engine restarts ICE, first waiting
//!    for the host to report the network online when configured to.
//!
//! # Connection states
//!
//! ```text
//!  inactive ──connect()──► connecting ──► connected ◄──┐
//!                               │             │        │ ICE restart
//!                               ▼             ▼        │
//!                          disconnected     failed ────┘
//!
//!  any ──close()──► closed
//! ```
//!
//! # Channels
//!
//! | Call                       | Transport label        | Remote side                   |
//! |----------------------------|------------------------|-------------------------------|
//! | `socket(Some(label))`      | `label`                | matching `socket(Some(label))`|
//! | `socket(None)`             | `@socket/<uuid>`       | [`Engine::sockets`]           |
//! | `writable(None, metadata)` | `@transaction/<uuid>`  | [`Engine::readables`]         |
//!
//! For negotiated labels the impolite peer creates the transport channel and
//! the polite peer waits for it to arrive.

mod role;

pub use role::Role;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::Channel;
use crate::config::{Config, EngineConfig, TransferConfig};
use crate::error::{Result, TandemError};
use crate::observable::{Emitter, EventSource, Observable, Subscription};
use crate::signal::{
    Hook, SignalEnvelope, SignalManager, Signaler, DESCRIPTION, ICE_CANDIDATE, ROLE,
};
use crate::socket::Socket;
use crate::transaction::{Metadata, TransactionReader, TransactionWriter};
use crate::transport::{
    ChannelStats, Connector, DataChannel, PeerConnection, PeerConnectionState, PeerEvent,
    SignalingState,
};

/// Transport label of the channel that kicks off the first negotiation
pub const INITIATOR_LABEL: &str = "@initiator";

/// Transport label prefix of unnegotiated sockets
pub const SOCKET_PREFIX: &str = "@socket/";

/// Transport label prefix of unnegotiated transactions
pub const TRANSACTION_PREFIX: &str = "@transaction/";

/// Engine connection state.
///
/// Mirrors the transport's state plus `Inactive` (before negotiation) and
/// `Closed` (after [`Engine::close`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Negotiation has not started
    Inactive,
    /// Negotiating
    Connecting,
    /// Transport connected
    Connected,
    /// Transport lost connectivity
    Disconnected,
    /// Transport failed; ICE will be restarted
    Failed,
    /// Engine closed
    Closed,
}

impl ConnectionState {
    fn from_transport(state: PeerConnectionState) -> Self {
        match state {
            PeerConnectionState::New | PeerConnectionState::Connecting => Self::Connecting,
            PeerConnectionState::Connected => Self::Connected,
            PeerConnectionState::Disconnected => Self::Disconnected,
            PeerConnectionState::Failed => Self::Failed,
            PeerConnectionState::Closed => Self::Closed,
        }
    }

    /// State name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }

    fn hook(&self) -> Option<Hook> {
        match self {
            Self::Connected => Some(Hook::Connected),
            Self::Disconnected => Some(Hook::Disconnected),
            Self::Failed => Some(Hook::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event published by an [`Engine`]
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Connection state changed
    Connection(ConnectionState),
    /// Role assigned
    Role(Role),
    /// Non-fatal negotiation error, or the fatal signaling error that closed the engine
    Error(String),
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    transfer: TransferConfig,
    pc: Arc<dyn PeerConnection>,
    signals: SignalManager,
    connection: Observable<ConnectionState>,
    role: Observable<Option<Role>>,
    online: Observable<bool>,
    seed: Mutex<Option<f64>>,
    making_offer: AtomicBool,
    ignore_offer: AtomicBool,
    started: AtomicBool,
    closing: AtomicBool,
    /// Set once ICE has been restarted for the current failure
    ice_restarted: AtomicBool,
    /// Negotiated channels created by the remote peer, by label
    data_channels: Observable<HashMap<String, Arc<dyn DataChannel>>>,
    initiator: Mutex<Option<Arc<dyn DataChannel>>>,
    inbound_sockets: Emitter<Socket>,
    inbound_transactions: Emitter<Arc<TransactionReader>>,
    events: Emitter<EngineEvent>,
    fatal: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Peer-to-peer session over one peer connection.
///
/// Cloning yields another handle to the same engine. Must be created inside a
/// tokio runtime.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Non-owning engine handle for background tasks
#[derive(Clone)]
pub(crate) struct WeakEngine(Weak<EngineInner>);

impl WeakEngine {
    pub(crate) fn upgrade(&self) -> Option<Engine> {
        self.0.upgrade().map(|inner| Engine { inner })
    }
}

impl Engine {
    /// Create an engine with default transfer settings.
    ///
    /// Starts negotiation right away when `config.auto_connect` is set.
    pub fn new(
        signaler: Arc<dyn Signaler>,
        connector: &dyn Connector,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::with_config(
            signaler,
            connector,
            Config {
                engine: config,
                transfer: TransferConfig::default(),
            },
        )
    }

    /// Create an engine from a full configuration
    pub fn with_config(
        signaler: Arc<dyn Signaler>,
        connector: &dyn Connector,
        config: Config,
    ) -> Result<Self> {
        let pc = connector.connect(&config.engine.rtc_configuration())?;

        let engine = Self {
            inner: Arc::new(EngineInner {
                config: config.engine,
                transfer: config.transfer,
                pc,
                signals: SignalManager::new(signaler),
                connection: Observable::new(ConnectionState::Inactive),
                role: Observable::new(None),
                online: Observable::new(true),
                seed: Mutex::new(None),
                making_offer: AtomicBool::new(false),
                ignore_offer: AtomicBool::new(false),
                started: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                ice_restarted: AtomicBool::new(false),
                data_channels: Observable::new(HashMap::new()),
                initiator: Mutex::new(None),
                inbound_sockets: Emitter::buffered(),
                inbound_transactions: Emitter::buffered(),
                events: Emitter::new(),
                fatal: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        if engine.inner.config.auto_connect {
            engine.start()?;
        }
        Ok(engine)
    }

    pub(crate) fn downgrade(&self) -> WeakEngine {
        WeakEngine(Arc::downgrade(&self.inner))
    }

    /// Start negotiation; later calls do nothing
    fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let peer_events = self.inner.pc.take_events().ok_or_else(|| {
            TandemError::Transport("peer connection events are already taken".to_string())
        })?;
        let roles = self.inner.signals.receive(ROLE);
        let descriptions = self.inner.signals.receive(DESCRIPTION);
        let candidates = self.inner.signals.receive(ICE_CANDIDATE);

        tracing::info!(fixed_role = ?self.inner.config.role, "starting negotiation");
        self.inner.set_connection(ConnectionState::Connecting);

        let weak = Arc::downgrade(&self.inner);
        self.inner.track(tokio::spawn(peer_loop(weak.clone(), peer_events)));
        self.inner.track(tokio::spawn(signal_loop(
            weak,
            SignalInbox {
                roles,
                descriptions,
                candidates,
            },
            self.inner.signals.failure(),
        )));
        Ok(())
    }

    /// Connect, or reconnect after a failure.
    ///
    /// Starts negotiation when inactive and restarts ICE when failed. Resolves
    /// once the connection reaches `connected`.
    pub async fn connect(&self) -> Result<()> {
        match self.inner.connection.get() {
            ConnectionState::Closed => return Err(self.inner.closed_error()),
            ConnectionState::Failed => self.inner.restart_ice(),
            ConnectionState::Inactive => self.start()?,
            _ => {},
        }

        let state = self
            .inner
            .connection
            .wait(|state| matches!(state, ConnectionState::Connected | ConnectionState::Closed))
            .await;
        if state == ConnectionState::Closed {
            return Err(self.inner.closed_error());
        }
        Ok(())
    }

    /// Current connection state
    pub fn connection(&self) -> ConnectionState {
        self.inner.connection.get()
    }

    /// Watch the connection state
    pub fn watch_connection(&self) -> Observable<ConnectionState> {
        self.inner.connection.clone()
    }

    /// Assigned role, if any
    pub fn role(&self) -> Option<Role> {
        self.inner.role.get()
    }

    /// Watch the role
    pub fn watch_role(&self) -> Observable<Option<Role>> {
        self.inner.role.clone()
    }

    /// Tell the engine whether the host network is reachable.
    ///
    /// ICE restarts wait for `true` when `wait_online_on_reconnection` is set.
    pub fn set_online(&self, online: bool) {
        if self.inner.online.replace(online) {
            tracing::info!(online, "network reachability changed");
        }
    }

    /// Whether the host network is reported reachable
    pub fn is_online(&self) -> bool {
        self.inner.online.get()
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Transfer configuration used for transactions
    pub fn transfer_config(&self) -> &TransferConfig {
        &self.inner.transfer
    }

    /// Open a socket.
    ///
    /// With a label both peers must call `socket(Some(label))`. Without one a
    /// fresh channel is opened and the remote peer receives it on
    /// [`sockets`](Self::sockets). Resolves once the remote side holds the socket.
    pub async fn socket(&self, label: Option<&str>) -> Result<Socket> {
        match label {
            Some(label) => self.negotiated_socket(label).await,
            None => {
                let socket = self.unnegotiated_socket(SOCKET_PREFIX)?;
                self.until_closed(socket.wait_received()).await??;
                Ok(socket)
            },
        }
    }

    /// Inbound unnegotiated sockets
    pub fn sockets(&self) -> Subscription<Socket> {
        self.inner.inbound_sockets.subscribe()
    }

    /// Open the reading end of the transaction labeled `label`
    pub async fn readable(&self, label: &str) -> Result<TransactionReader> {
        let socket = self.negotiated_socket(label).await?;
        self.until_closed(TransactionReader::open(socket, self.inner.transfer.clone()))
            .await?
    }

    /// Inbound unnegotiated transactions, already acknowledged
    pub fn readables(&self) -> Subscription<Arc<TransactionReader>> {
        self.inner.inbound_transactions.subscribe()
    }

    /// Open the writing end of a transaction.
    ///
    /// Resolves once the reader has acknowledged `metadata`. Without a label
    /// the remote peer receives the reader on [`readables`](Self::readables).
    pub async fn writable(&self, label: Option<&str>, metadata: Metadata) -> Result<TransactionWriter> {
        let socket = match label {
            Some(label) => self.negotiated_socket(label).await?,
            None => self.unnegotiated_socket(TRANSACTION_PREFIX)?,
        };
        self.until_closed(TransactionWriter::open(
            socket,
            metadata,
            self.inner.transfer.clone(),
        ))
        .await?
    }

    /// Open a bidirectional channel labeled `label`
    pub async fn channel(&self, label: &str) -> Result<Channel> {
        let socket = self.negotiated_socket(label).await?;
        Ok(Channel::new(socket, self.downgrade()))
    }

    /// Transport statistics for `socket`'s channel
    pub async fn stats(&self, socket: &Socket) -> Result<Option<ChannelStats>> {
        self.inner.pc.stats(socket.channel_id()).await
    }

    /// Close the engine, its peer connection and every channel
    pub async fn close(&self) {
        self.inner.close().await;
    }

    async fn negotiated_socket(&self, label: &str) -> Result<Socket> {
        if label.starts_with('@') {
            return Err(TandemError::Protocol(format!(
                "socket label '{}' is reserved; labels may not start with '@'",
                label
            )));
        }

        let role = self
            .until_closed(self.inner.role.wait(Option::is_some))
            .await?
            .ok_or_else(|| TandemError::Negotiation("role is not assigned".to_string()))?;

        match role {
            Role::Impolite => {
                let channel = self.inner.pc.create_data_channel(label)?;
                let socket = Socket::new(channel, label)?;
                self.until_closed(socket.wait_received()).await??;
                Ok(socket)
            },
            Role::Polite => {
                let channel = self.wait_channel(label).await?;
                Socket::accept(channel, label)
            },
        }
    }

    fn unnegotiated_socket(&self, prefix: &str) -> Result<Socket> {
        let id = uuid::Uuid::new_v4().to_string();
        let channel = self
            .inner
            .pc
            .create_data_channel(&format!("{}{}", prefix, id))?;
        Socket::new(channel, id)
    }

    /// Take the remote-created channel labeled `label`, waiting for it
    async fn wait_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let wanted = label.to_string();
        self.until_closed(
            self.inner
                .data_channels
                .wait(move |channels| channels.contains_key(&wanted)),
        )
        .await?;

        let mut channel = None;
        self.inner.data_channels.update(|channels| {
            channel = channels.remove(label);
        });
        channel.ok_or_else(|| {
            TandemError::Protocol(format!("data channel '{}' was taken by another socket", label))
        })
    }

    /// Run `future` unless the engine closes first
    fn until_closed<'a, F>(&'a self, future: F) -> impl Future<Output = Result<F::Output>> + Send + 'a
    where
        F: Future + Send + 'a,
        F::Output: Send,
    {
        async move {
            let closed = self.inner.connection.wait_for(ConnectionState::Closed);
            tokio::select! {
                output = future => Ok(output),
                _ = closed => Err(self.inner.closed_error()),
            }
        }
    }
}

impl EventSource for Engine {
    type Event = EngineEvent;

    fn emitter(&self) -> &Emitter<EngineEvent> {
        &self.inner.events
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("connection", &self.connection())
            .field("role", &self.role())
            .field("online", &self.is_online())
            .finish()
    }
}

impl EngineInner {
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    fn closed_error(&self) -> TandemError {
        match lock(&self.fatal).clone() {
            Some(message) => TandemError::Signaling(message),
            None => TandemError::Closed,
        }
    }

    fn set_connection(&self, state: ConnectionState) {
        if self.connection.replace(state) {
            tracing::info!(state = %state, "connection state changed");
            self.events.publish(EngineEvent::Connection(state));
        }
    }

    fn report_error(&self, error: &TandemError) {
        tracing::warn!("negotiation error: {}", error);
        self.events.publish(EngineEvent::Error(error.to_string()));
    }

    async fn handle(&self, result: Result<()>) {
        match result {
            Ok(()) => {},
            Err(TandemError::Signaling(message)) => self.fail(message).await,
            Err(e) => self.report_error(&e),
        }
    }

    /// Fatal signaling failure: surface it and close the session
    async fn fail(&self, message: String) {
        if self.connection.get() == ConnectionState::Closed {
            return;
        }

        *lock(&self.fatal) = Some(message.clone());
        if self.events.has_subscribers() {
            self.events.publish(EngineEvent::Error(message));
        } else {
            tracing::error!(%message, "fatal signaling error, closing engine");
        }
        self.close().await;
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        self.set_connection(ConnectionState::Closed);
        if let Err(e) = self.signals.call_hook(Hook::Close).await {
            tracing::warn!("signaler close hook failed: {}", e);
        }
        self.pc.close();
        self.signals.clear();

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }
        tracing::info!("engine closed");
    }

    /// Restart ICE at most once per failure
    fn restart_ice(&self) {
        if self.ice_restarted.swap(true, Ordering::SeqCst) {
            tracing::debug!("ICE restart already underway");
            return;
        }
        tracing::info!("restarting ICE");
        self.pc.restart_ice();
    }

    async fn send_seed(&self) -> Result<f64> {
        let seed: f64 = rand::random();
        *lock(&self.seed) = Some(seed);
        tracing::debug!(seed, "sending role seed");
        self.signals.send(&SignalEnvelope::Role { seed }).await?;
        Ok(seed)
    }

    fn assign_role(&self, role: Role) {
        self.role.set(Some(role));
        tracing::info!(role = %role, "role assigned");
        self.events.publish(EngineEvent::Role(role));

        if role == Role::Impolite {
            self.create_initiator();
        }
    }

    /// The impolite peer opens a channel so the transport asks for negotiation
    fn create_initiator(&self) {
        let mut initiator = lock(&self.initiator);
        if initiator.is_some() {
            return;
        }
        match self.pc.create_data_channel(INITIATOR_LABEL) {
            Ok(channel) => *initiator = Some(channel),
            Err(e) => {
                drop(initiator);
                self.report_error(&e);
            },
        }
    }

    async fn on_role(&self, message: Value) -> Result<()> {
        if let Some(role) = self.config.role {
            tracing::debug!(role = %role, "role is fixed, ignoring role message");
            return Ok(());
        }

        let remote = match serde_json::from_value::<SignalEnvelope>(message) {
            Ok(SignalEnvelope::Role { seed }) => seed,
            _ => {
                tracing::warn!("dropping malformed role message");
                return Ok(());
            },
        };
        tracing::debug!(seed = remote, "received role seed");

        if self.role.get().is_some() {
            tracing::info!("peer restarted role assignment, re-rolling");
            self.role.set(None);
            self.send_seed().await?;
        }

        let local = *lock(&self.seed);
        let local = match local {
            Some(seed) => seed,
            None => self.send_seed().await?,
        };

        match Role::decide(local, remote) {
            Some(role) => self.assign_role(role),
            None => {
                tracing::debug!(seed = local, "role seeds collided, re-rolling");
                self.send_seed().await?;
            },
        }
        Ok(())
    }

    async fn send_offer(&self) -> Result<()> {
        self.making_offer.store(true, Ordering::SeqCst);
        let result = async {
            let description = self.pc.set_local_description().await?;
            tracing::debug!(kind = ?description.kind, "sending local description");
            self.signals
                .send(&SignalEnvelope::Description { description })
                .await
        }
        .await;
        self.making_offer.store(false, Ordering::SeqCst);
        result
    }

    async fn on_description(&self, message: Value) -> Result<()> {
        let description = match serde_json::from_value::<SignalEnvelope>(message) {
            Ok(SignalEnvelope::Description { description }) => description,
            _ => {
                tracing::warn!("dropping malformed description message");
                return Ok(());
            },
        };

        let polite = self.role.get().is_some_and(|role| role.is_polite());
        let making_offer = self.making_offer.load(Ordering::SeqCst);
        let signaling = self.pc.signaling_state();
        let collision =
            description.is_offer() && (making_offer || signaling != SignalingState::Stable);
        let ignore = !polite && collision;
        self.ignore_offer.store(ignore, Ordering::SeqCst);

        if collision {
            tracing::debug!(making_offer, signaling = ?signaling, polite, "offer collision");
        }
        if ignore {
            tracing::info!("ignoring colliding offer");
            return Ok(());
        }

        let is_offer = description.is_offer();
        self.pc.set_remote_description(description).await?;
        if is_offer {
            let answer = self.pc.set_local_description().await?;
            tracing::debug!("sending answer");
            self.signals
                .send(&SignalEnvelope::Description {
                    description: answer,
                })
                .await?;
        }
        Ok(())
    }

    async fn on_candidate(&self, message: Value) -> Result<()> {
        let candidate = match serde_json::from_value::<SignalEnvelope>(message) {
            Ok(SignalEnvelope::IceCandidate { candidate }) => candidate,
            _ => {
                tracing::warn!("dropping malformed candidate message");
                return Ok(());
            },
        };

        if let Err(e) = self.pc.add_ice_candidate(candidate).await {
            if !self.ignore_offer.load(Ordering::SeqCst) {
                return Err(e);
            }
            tracing::debug!("ignoring candidate of an ignored offer: {}", e);
        }
        Ok(())
    }

    async fn on_transport_state(self: &Arc<Self>, state: PeerConnectionState) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }

        let state = ConnectionState::from_transport(state);
        if state != ConnectionState::Failed {
            self.ice_restarted.store(false, Ordering::SeqCst);
        }
        self.set_connection(state);

        if let Some(hook) = state.hook() {
            if let Err(e) = self.signals.call_hook(hook).await {
                tracing::warn!(hook = %hook, "signaler hook failed: {}", e);
            }
        }

        if state == ConnectionState::Failed {
            self.track(tokio::spawn(reconnect(Arc::downgrade(self))));
        }
    }

    fn route_channel(&self, channel: Arc<dyn DataChannel>) {
        let label = channel.label().to_string();
        tracing::debug!(label = %label, "incoming data channel");

        if label == INITIATOR_LABEL {
            *lock(&self.initiator) = Some(channel);
            return;
        }

        if let Some(id) = label.strip_prefix(SOCKET_PREFIX) {
            match Socket::accept(channel, id) {
                Ok(socket) => self.inbound_sockets.publish(socket),
                Err(e) => self.report_error(&e),
            }
            return;
        }

        if let Some(id) = label.strip_prefix(TRANSACTION_PREFIX) {
            let socket = match Socket::accept(channel, id) {
                Ok(socket) => socket,
                Err(e) => {
                    self.report_error(&e);
                    return;
                },
            };
            let transfer = self.transfer.clone();
            let inbound = self.inbound_transactions.clone();
            self.track(tokio::spawn(async move {
                match TransactionReader::open(socket, transfer).await {
                    Ok(reader) => inbound.publish(Arc::new(reader)),
                    Err(e) => tracing::warn!("inbound transaction failed to open: {}", e),
                }
            }));
            return;
        }

        self.data_channels.update(|channels| {
            channels.insert(label, channel);
        });
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if !self.closing.load(Ordering::SeqCst) {
            self.pc.close();
        }
    }
}

struct SignalInbox {
    roles: mpsc::UnboundedReceiver<Value>,
    descriptions: mpsc::UnboundedReceiver<Value>,
    candidates: mpsc::UnboundedReceiver<Value>,
}

enum Inbound {
    Failed(String),
    Role(Value),
    Description(Value),
    Candidate(Value),
}

/// Transport events: offers, outgoing candidates, state and inbound channels
async fn peer_loop(engine: Weak<EngineInner>, mut events: BoxStream<'static, PeerEvent>) {
    while let Some(event) = events.next().await {
        let Some(inner) = engine.upgrade() else {
            break;
        };

        match event {
            PeerEvent::NegotiationNeeded => {
                let result = inner.send_offer().await;
                inner.handle(result).await;
            },
            PeerEvent::IceCandidate(candidate) => {
                let result = inner
                    .signals
                    .send(&SignalEnvelope::IceCandidate { candidate })
                    .await;
                inner.handle(result).await;
            },
            PeerEvent::ConnectionStateChange(state) => inner.on_transport_state(state).await,
            PeerEvent::DataChannel(channel) => inner.route_channel(channel),
        }
    }
    tracing::debug!("peer connection event stream ended");
}

/// Signaling: role assignment, then descriptions and candidates.
///
/// Role messages are drained before descriptions, and descriptions before
/// candidates, so a description is never applied under a stale role.
async fn signal_loop(
    engine: Weak<EngineInner>,
    mut inbox: SignalInbox,
    failure: Observable<Option<String>>,
) {
    {
        let Some(inner) = engine.upgrade() else {
            return;
        };
        if let Err(e) = inner.signals.call_hook(Hook::Start).await {
            tracing::warn!("signaler start hook failed: {}", e);
        }
        let result = match inner.config.role {
            Some(role) => {
                inner.assign_role(role);
                Ok(())
            },
            None => inner.send_seed().await.map(|_| ()),
        };
        inner.handle(result).await;
    }

    loop {
        let failed = failure.wait(Option::is_some);
        let inbound = tokio::select! {
            biased;
            message = failed => Inbound::Failed(message.unwrap_or_default()),
            Some(message) = inbox.roles.recv() => Inbound::Role(message),
            Some(message) = inbox.descriptions.recv() => Inbound::Description(message),
            Some(message) = inbox.candidates.recv() => Inbound::Candidate(message),
        };

        let Some(inner) = engine.upgrade() else {
            break;
        };

        let result = match inbound {
            Inbound::Failed(message) => {
                inner.fail(message).await;
                break;
            },
            Inbound::Role(message) => inner.on_role(message).await,
            Inbound::Description(message) => inner.on_description(message).await,
            Inbound::Candidate(message) => inner.on_candidate(message).await,
        };
        inner.handle(result).await;
    }
}

/// Restart ICE after a failure, once the network is back if configured
async fn reconnect(engine: Weak<EngineInner>) {
    let (online, connection, wait_online) = {
        let Some(inner) = engine.upgrade() else {
            return;
        };
        (
            inner.online.clone(),
            inner.connection.clone(),
            inner.config.wait_online_on_reconnection,
        )
    };

    if wait_online && !online.get() {
        tracing::info!("waiting for the network before restarting ICE");
        tokio::select! {
            _ = online.wait_for(true) => {},
            _ = connection.wait_for(ConnectionState::Closed) => {
                tracing::debug!("engine closed while waiting for the network");
                return;
            },
        }
    }

    let Some(inner) = engine.upgrade() else {
        return;
    };
    if inner.connection.get() == ConnectionState::Failed {
        inner.restart_ice();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
