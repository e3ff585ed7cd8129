//! Spatial ranging abstraction
//!
//! A [`RangingSession`] ranges against exactly one counterpart token and
//! reports measurements and lifecycle changes through a [`RangingEventSink`].

pub mod simulated;

use crate::token::DiscoveryToken;
use crate::{RemovalReason, Result, Vector3};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use simulated::SimulatedRanging;

/// One ranged object as reported by the sensor
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyObject {
    /// Meters, absent if the sensor cannot resolve distance right now
    pub distance: Option<f32>,
    /// Absent if the sensor cannot resolve direction right now
    pub direction: Option<Vector3>,
}

impl NearbyObject {
    pub fn new(distance: Option<f32>, direction: Option<Vector3>) -> Self {
        Self { distance, direction }
    }
}

/// Events emitted by a ranging session
#[derive(Debug, Clone, PartialEq)]
pub enum RangingEvent {
    /// Zero or more objects were updated; only the first is tracked
    Updated(Vec<NearbyObject>),
    /// The counterpart is no longer being ranged
    Removed { reason: RemovalReason },
    Suspended,
    SuspensionEnded,
    /// Fatal; the session cannot resume
    Invalidated { error: String },
}

/// Listener handed to a ranging session; never blocks the caller
#[derive(Clone)]
pub struct RangingEventSink {
    deliver: Arc<dyn Fn(RangingEvent) -> bool + Send + Sync>,
}

impl RangingEventSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(RangingEvent) -> bool + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Sink backed by an unbounded channel, for standalone use
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RangingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(move |event| tx.send(event).is_ok()), rx)
    }

    /// Deliver an event; `false` once the listener is gone
    pub fn emit(&self, event: RangingEvent) -> bool {
        (self.deliver)(event)
    }
}

impl std::fmt::Debug for RangingEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangingEventSink").finish_non_exhaustive()
    }
}

/// Device spatial-ranging capability
#[async_trait]
pub trait RangingSession: Send + Sync {
    /// Whether the device has ranging hardware at all
    fn is_supported(&self) -> bool;

    /// Initialise the session and return this device's discovery token
    async fn initialize(&mut self, sink: RangingEventSink) -> Result<DiscoveryToken>;

    /// Token produced by the last successful `initialize`
    fn local_discovery_token(&self) -> Option<DiscoveryToken>;

    /// Start ranging against the peer's token
    async fn configure(&mut self, peer_token: DiscoveryToken) -> Result<()>;

    /// Stop ranging and release the session; idempotent
    async fn invalidate(&mut self) -> Result<()>;
}
