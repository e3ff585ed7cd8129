//! Peer discovery and message transport
//!
//! A [`TransportSession`] advertises and browses under [`SERVICE_NAME`],
//! connects to the first peer it finds and delivers opaque payloads to and
//! from that peer. Everything it observes is reported through a
//! [`TransportEventSink`].

pub mod connection;
pub mod lan;
pub mod mdns;
pub mod memory;

use crate::{PeerIdentity, PeerLinkState, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use lan::LanTransport;
pub use memory::MemoryTransport;

/// Service identifier shared by every instance of the locator
pub const SERVICE_NAME: &str = "airtag-locate";

/// How long an invitation may stay unanswered before the peer is considered not found
pub const INVITATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Events emitted by a transport session
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A peer advertising the same service was discovered
    PeerFound(PeerIdentity),
    /// A previously discovered peer stopped advertising
    PeerLost(PeerIdentity),
    LinkStateChanged {
        peer: PeerIdentity,
        state: PeerLinkState,
    },
    DataReceived {
        peer: PeerIdentity,
        payload: Vec<u8>,
    },
    /// An invitation went unanswered within [`INVITATION_TIMEOUT`]
    InvitationTimedOut(PeerIdentity),
    /// Advertising or browsing broke down; the session is unusable
    Failed { reason: String },
}

/// Listener handed to a transport session; never blocks the caller
#[derive(Clone)]
pub struct TransportEventSink {
    deliver: Arc<dyn Fn(TransportEvent) -> bool + Send + Sync>,
}

impl TransportEventSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(TransportEvent) -> bool + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(move |event| tx.send(event).is_ok()), rx)
    }

    /// Deliver an event; `false` once the listener is gone
    pub fn emit(&self, event: TransportEvent) -> bool {
        (self.deliver)(event)
    }
}

impl std::fmt::Debug for TransportEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEventSink").finish_non_exhaustive()
    }
}

/// Local wireless discovery and reliable messaging
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Identity this device advertises to peers
    fn local_peer(&self) -> &PeerIdentity;

    /// Start advertising and browsing; no-op if already started
    async fn start(&mut self, sink: TransportEventSink) -> Result<()>;

    /// Stop advertising and browsing and drop any link; idempotent
    async fn stop(&mut self) -> Result<()>;

    /// Send a payload to a connected peer
    async fn send(&self, peer: &PeerIdentity, payload: &[u8]) -> Result<()>;

    fn is_running(&self) -> bool;
}
