//! Session coordinator
//!
//! Owns one transport session and one ranging session and drives the
//! handshake between them: once a transport peer connects the local
//! discovery token is sent, the peer's token configures ranging, and
//! ranging updates are republished as [`SessionSnapshot`]s.
//!
//! All state lives in a single actor task. Transport and ranging callbacks,
//! as well as `start()` and `stop()`, are posted into one unbounded queue.
//! Callbacks are stamped with the epoch of the sessions that emitted them and
//! `start()` with the stop generation. `stop()` bumps both before it returns,
//! so late callbacks are discarded and a handler still awaiting a sub-session
//! tears down what it started instead of mutating state. Failures bump only
//! the epoch, leaving a queued `start()` valid.

use crate::ranging::{RangingEvent, RangingEventSink, RangingSession};
use crate::state::{SessionState, STATUS_SESSION_ERROR, STATUS_TRANSPORT_ERROR, STATUS_UNSUPPORTED};
use crate::token::{decode_token, encode_token, DiscoveryToken};
use crate::transport::{TransportEvent, TransportEventSink, TransportSession};
use crate::{
    ErrorContext, FailureReason, LocatorError, PeerIdentity, PeerLinkState, Result, SessionSnapshot,
};
use shared::config::CoordinatorConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tunables for a coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Transitions buffered per `transitions()` subscriber before it lags
    pub snapshot_buffer: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self { snapshot_buffer: 64 }
    }
}

impl From<&CoordinatorConfig> for CoordinatorOptions {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            snapshot_buffer: config.snapshot_buffer.max(1),
        }
    }
}

#[derive(Debug)]
enum Input {
    /// Stamped with the stop generation current when `start()` was called
    Start { generation: u64 },
    Stop,
    Transport { epoch: u64, event: TransportEvent },
    Ranging { epoch: u64, event: RangingEvent },
    Shutdown,
}

/// Session a handler works for; stale once either counter moves on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket {
    epoch: u64,
    generation: u64,
}

/// Handle to a running coordinator actor
///
/// Dropping the handle shuts the actor down and tears down both sessions.
pub struct SessionCoordinator {
    tx: mpsc::UnboundedSender<Input>,
    epoch: Arc<AtomicU64>,
    generation: Arc<AtomicU64>,
    snapshots: watch::Receiver<SessionSnapshot>,
    transitions: broadcast::Sender<SessionSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl SessionCoordinator {
    /// Spawn the coordinator actor; must be called inside a tokio runtime
    pub fn new(
        transport: Box<dyn TransportSession>,
        ranging: Box<dyn RangingSession>,
        options: CoordinatorOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));
        let generation = Arc::new(AtomicU64::new(0));
        let (watch_tx, snapshots) = watch::channel(SessionSnapshot::idle());
        let (transitions, _) = broadcast::channel(options.snapshot_buffer.max(1));

        let actor = Actor {
            transport,
            ranging,
            transport_running: false,
            ranging_running: false,
            local_token: None,
            state: SessionState::new(),
            epoch: Arc::clone(&epoch),
            generation: Arc::clone(&generation),
            tx: tx.clone(),
            watch: watch_tx,
            transitions: transitions.clone(),
        };

        let task = tokio::spawn(actor.run(rx));

        Self {
            tx,
            epoch,
            generation,
            snapshots,
            transitions,
            task: Some(task),
        }
    }

    /// Begin searching for a peer; a no-op while a session is already active
    pub fn start(&self) -> Result<()> {
        let generation = self.generation.load(Ordering::SeqCst);
        self.post(Input::Start { generation })
    }

    /// Tear everything down and return to Idle
    ///
    /// Events already in flight from the current sessions, and handlers
    /// still awaiting a sub-session, change nothing from the moment this
    /// returns.
    pub fn stop(&self) -> Result<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.post(Input::Stop)
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Latest-value view, suitable for fixed-rate sampling
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Every published transition, in order
    pub fn transitions(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.transitions.subscribe()
    }

    /// Stop both sessions and wait for the actor to exit
    pub async fn shutdown(mut self) {
        let _ = self.post(Input::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Coordinator task ended abnormally: {}", e);
            }
        }
    }

    fn post(&self, input: Input) -> Result<()> {
        self.tx.send(input).map_err(|_| LocatorError::ChannelClosed)
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.post(Input::Shutdown);
        }
    }
}

/// Errors from ranging calls surface as ranging failures whatever their kind
fn ranging_failure(error: LocatorError) -> LocatorError {
    match error {
        LocatorError::UnsupportedDevice | LocatorError::RangingInvalidated(_) => error,
        other => LocatorError::RangingInvalidated(other.to_string()),
    }
}

struct Actor {
    transport: Box<dyn TransportSession>,
    ranging: Box<dyn RangingSession>,
    transport_running: bool,
    ranging_running: bool,
    local_token: Option<DiscoveryToken>,
    state: SessionState,
    epoch: Arc<AtomicU64>,
    generation: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<Input>,
    watch: watch::Sender<SessionSnapshot>,
    transitions: broadcast::Sender<SessionSnapshot>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Input>) {
        debug!("Session coordinator started");

        while let Some(input) = rx.recv().await {
            match input {
                Input::Shutdown => break,
                Input::Start { generation } => {
                    if generation != self.generation.load(Ordering::SeqCst) {
                        debug!(generation, "Dropping start superseded by a later stop");
                        continue;
                    }
                    self.handle_start(generation).await;
                }
                Input::Stop => self.handle_stop().await,
                Input::Transport { epoch, event } => {
                    if self.is_stale(epoch) {
                        debug!(epoch, event = ?event, "Dropping stale transport event");
                        continue;
                    }
                    let ticket = self.ticket();
                    self.handle_transport(ticket, event).await;
                }
                Input::Ranging { epoch, event } => {
                    if self.is_stale(epoch) {
                        debug!(epoch, event = ?event, "Dropping stale ranging event");
                        continue;
                    }
                    self.handle_ranging(event).await;
                }
            }
        }

        self.teardown().await;
        debug!("Session coordinator stopped");
    }

    fn ticket(&self) -> Ticket {
        Ticket {
            epoch: self.epoch.load(Ordering::SeqCst),
            generation: self.generation.load(Ordering::SeqCst),
        }
    }

    fn is_stale(&self, epoch: u64) -> bool {
        epoch != self.epoch.load(Ordering::SeqCst)
    }

    fn is_current(&self, ticket: Ticket) -> bool {
        self.ticket() == ticket
    }

    /// Undo what a handler started if `stop()` overtook it while it awaited
    async fn abandon_if_stale(&mut self, ticket: Ticket) -> bool {
        if self.is_current(ticket) {
            return false;
        }
        debug!("Handler overtaken by stop, tearing down");
        self.teardown().await;
        true
    }

    fn publish(&self) {
        let snapshot = self.state.snapshot().clone();
        info!(
            state = %snapshot.state,
            status = %snapshot.status,
            peer = ?snapshot.peer.as_ref().map(|p| p.display_name()),
            "Session state changed"
        );
        self.watch.send_replace(snapshot.clone());
        // No subscribers is fine
        let _ = self.transitions.send(snapshot);
    }

    fn context(&self) -> ErrorContext {
        let mut context = ErrorContext::new().with_epoch(self.epoch.load(Ordering::SeqCst));
        if let Some(session_id) = self.state.session_id() {
            context = context.with_session_id(session_id);
        }
        if let Some(peer) = self.state.peer() {
            context = context.with_peer(peer.to_string());
        }
        context
    }

    fn transport_sink(&self, epoch: u64) -> TransportEventSink {
        let tx = self.tx.clone();
        TransportEventSink::new(move |event| tx.send(Input::Transport { epoch, event }).is_ok())
    }

    fn ranging_sink(&self, epoch: u64) -> RangingEventSink {
        let tx = self.tx.clone();
        RangingEventSink::new(move |event| tx.send(Input::Ranging { epoch, event }).is_ok())
    }

    async fn handle_start(&mut self, generation: u64) {
        if self.state.state().is_active() {
            debug!(state = %self.state.state(), "Start ignored, session already active");
            return;
        }

        // Leftovers from a Lost or Failed session
        self.teardown().await;

        let ticket = Ticket {
            epoch: self.epoch.fetch_add(1, Ordering::SeqCst) + 1,
            generation,
        };
        if !self.is_current(ticket) {
            debug!("Start superseded by a later stop");
            return;
        }

        if !self.ranging.is_supported() {
            self.fail(LocatorError::UnsupportedDevice).await;
            return;
        }

        let sink = self.ranging_sink(ticket.epoch);
        let initialized = self.ranging.initialize(sink).await;
        if let Ok(token) = &initialized {
            debug!(token = %token.fingerprint(), "Local discovery token ready");
            self.local_token = Some(token.clone());
            self.ranging_running = true;
        }
        if self.abandon_if_stale(ticket).await {
            return;
        }
        if let Err(e) = initialized {
            self.fail(ranging_failure(e)).await;
            return;
        }

        let session_id = Uuid::new_v4();
        if self.state.begin_search(session_id) {
            info!(%session_id, "Locator session started");
            self.publish();
        }

        let sink = self.transport_sink(ticket.epoch);
        let started = self.transport.start(sink).await;
        if started.is_ok() {
            self.transport_running = true;
        }
        if self.abandon_if_stale(ticket).await {
            return;
        }
        if let Err(e) = started {
            self.fail(LocatorError::TransportFailure(e.to_string())).await;
        }
    }

    async fn handle_stop(&mut self) {
        self.teardown().await;
        if self.state.reset() {
            info!("Locator session stopped");
            self.publish();
        }
    }

    async fn handle_transport(&mut self, ticket: Ticket, event: TransportEvent) {
        match event {
            TransportEvent::PeerFound(peer) => {
                debug!(peer = %peer, "Peer found");
            }
            TransportEvent::PeerLost(peer) => {
                debug!(peer = %peer, "Peer lost");
            }
            TransportEvent::LinkStateChanged { peer, state } => {
                self.handle_link_state(ticket, peer, state).await;
            }
            TransportEvent::DataReceived { peer, payload } => {
                self.handle_payload(ticket, peer, payload).await;
            }
            TransportEvent::InvitationTimedOut(peer) => {
                let error = LocatorError::ConnectionTimeout(peer.to_string());
                error.log_with_context(&self.context().with_info("invitation not accepted"));
                if self.state.peer() == Some(&peer) && self.state.resume_search() {
                    self.publish();
                }
            }
            TransportEvent::Failed { reason } => {
                self.fail(LocatorError::TransportFailure(reason)).await;
            }
        }
    }

    async fn handle_link_state(&mut self, ticket: Ticket, peer: PeerIdentity, state: PeerLinkState) {
        debug!(peer = %peer, link = %state, "Transport link state changed");

        match state {
            PeerLinkState::Connecting => {
                if self.state.connecting(&peer) {
                    self.publish();
                }
            }
            PeerLinkState::Connected => {
                if !self.state.transport_connected(&peer) {
                    debug!(peer = %peer, "Ignoring additional peer");
                    return;
                }
                self.publish();
                self.send_local_token(ticket, &peer).await;
            }
            PeerLinkState::NotConnected => {
                if self.state.state().is_ranging() && self.state.peer() == Some(&peer) {
                    // Ranging carries on without the link; only a removal ends it
                    info!(peer = %peer, "Transport link dropped while ranging");
                    return;
                }
                if self.state.link_down(&peer) {
                    self.publish();
                }
            }
        }
    }

    async fn send_local_token(&mut self, ticket: Ticket, peer: &PeerIdentity) {
        let Some(token) = self.local_token.clone() else {
            self.fail(LocatorError::RangingNotReady("no local discovery token".to_string()))
                .await;
            return;
        };

        let sent = match encode_token(&token) {
            Ok(payload) => self.transport.send(peer, &payload).await,
            Err(e) => Err(e),
        };
        if self.abandon_if_stale(ticket).await {
            return;
        }

        match sent {
            Ok(()) => info!(peer = %peer, "Sent local discovery token"),
            Err(e) => {
                e.log_with_context(&self.context().with_info("sending discovery token"));
                self.fail(LocatorError::TransportFailure(e.to_string())).await;
            }
        }
    }

    async fn handle_payload(&mut self, ticket: Ticket, peer: PeerIdentity, payload: Vec<u8>) {
        if !self.state.awaiting_token_from(&peer) {
            debug!(peer = %peer, bytes = payload.len(), "Ignoring unexpected payload");
            return;
        }

        let token = match decode_token(&payload) {
            Ok(token) => token,
            Err(e) => {
                e.log_with_context(&self.context().with_info("discarding malformed token payload"));
                return;
            }
        };

        info!(peer = %peer, token = %token.fingerprint(), "Received peer discovery token");
        if self.state.token_exchanged() {
            self.publish();
        }

        let configured = self.ranging.configure(token).await;
        if self.abandon_if_stale(ticket).await {
            return;
        }

        match configured {
            Ok(()) => {
                if self.state.ranging() {
                    self.publish();
                }
            }
            Err(e) => self.fail(ranging_failure(e)).await,
        }
    }

    async fn handle_ranging(&mut self, event: RangingEvent) {
        match event {
            RangingEvent::Updated(objects) => {
                if self.state.apply_update(&objects) {
                    if let Some(measurement) = &self.state.snapshot().measurement {
                        debug!(
                            distance = ?measurement.distance,
                            direction = ?measurement.direction,
                            "Measurement updated"
                        );
                    }
                    self.publish();
                }
            }
            RangingEvent::Removed { reason } => {
                if self.state.lost(reason) {
                    warn!(%reason, "Ranging counterpart removed");
                    self.publish();
                    self.stop_ranging().await;
                }
            }
            RangingEvent::Suspended => {
                if self.state.suspend() {
                    self.publish();
                }
            }
            RangingEvent::SuspensionEnded => {
                if self.state.resume() {
                    self.publish();
                }
            }
            RangingEvent::Invalidated { error } => {
                self.fail(LocatorError::RangingInvalidated(error)).await;
            }
        }
    }

    /// Publish a Failed snapshot, then tear down both sessions
    async fn fail(&mut self, error: LocatorError) {
        error.log_with_context(&self.context());

        // Nothing from the failing sessions may land after this
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let (reason, status) = match &error {
            LocatorError::UnsupportedDevice => (FailureReason::UnsupportedDevice, STATUS_UNSUPPORTED),
            LocatorError::RangingInvalidated(details) | LocatorError::RangingNotReady(details) => (
                FailureReason::RangingInvalidated(details.clone()),
                STATUS_SESSION_ERROR,
            ),
            LocatorError::TransportFailure(details) => (
                FailureReason::TransportFailure(details.clone()),
                STATUS_TRANSPORT_ERROR,
            ),
            other => (
                FailureReason::TransportFailure(other.to_string()),
                STATUS_TRANSPORT_ERROR,
            ),
        };

        if self.state.fail(reason, status, error.user_message()) {
            self.publish();
        }
        self.teardown().await;
    }

    async fn stop_ranging(&mut self) {
        if !self.ranging_running {
            return;
        }
        self.ranging_running = false;
        self.local_token = None;
        if let Err(e) = self.ranging.invalidate().await {
            e.log_with_context(&self.context().with_info("invalidating ranging session"));
        }
    }

    async fn teardown(&mut self) {
        self.stop_ranging().await;

        if self.transport_running {
            self.transport_running = false;
            if let Err(e) = self.transport.stop().await {
                e.log_with_context(&self.context().with_info("stopping transport session"));
            }
        }
    }
}
