//! Session state machine
//!
//! Pure transition logic behind the coordinator. Every method checks that the
//! transition is legal from the current state and returns `false` without
//! touching anything when it is not, so callers can publish only on change.

use crate::ranging::NearbyObject;
use crate::{ConnectionState, FailureReason, Measurement, PeerIdentity, RemovalReason, SessionSnapshot};
use chrono::Utc;
use uuid::Uuid;

pub const STATUS_NOT_CONNECTED: &str = "Not connected";
pub const STATUS_SEARCHING: &str = "Searching for nearby device...";
pub const STATUS_UNSUPPORTED: &str = "Spatial ranging not supported";
pub const STATUS_SUSPENDED: &str = "Session suspended";
pub const STATUS_RESUMED: &str = "Session resumed";
pub const STATUS_SESSION_ERROR: &str = "Session error";
pub const STATUS_TRANSPORT_ERROR: &str = "Connection error";

/// Merge one ranged object into the previous measurement
///
/// Fields the sensor did not resolve keep their previous value. Negative or
/// non-finite distances and degenerate directions count as unresolved.
/// Returns `None` when nothing is known at all.
pub fn merge_measurement(previous: Option<&Measurement>, object: &NearbyObject) -> Option<Measurement> {
    let distance = object
        .distance
        .filter(|d| d.is_finite() && *d >= 0.0)
        .or_else(|| previous.and_then(|m| m.distance));

    let direction = object
        .direction
        .and_then(|d| d.normalized())
        .or_else(|| previous.and_then(|m| m.direction));

    if distance.is_none() && direction.is_none() {
        return None;
    }

    Some(Measurement {
        distance,
        direction,
        updated_at: Utc::now(),
    })
}

/// Mutable session state owned by the coordinator
#[derive(Debug, Clone)]
pub struct SessionState {
    snapshot: SessionSnapshot,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            snapshot: SessionSnapshot::idle(),
        }
    }

    pub fn snapshot(&self) -> &SessionSnapshot {
        &self.snapshot
    }

    pub fn state(&self) -> &ConnectionState {
        &self.snapshot.state
    }

    pub fn peer(&self) -> Option<&PeerIdentity> {
        self.snapshot.peer.as_ref()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.snapshot.session_id
    }

    fn is_active_peer(&self, peer: &PeerIdentity) -> bool {
        self.snapshot.peer.as_ref() == Some(peer)
    }

    fn enter(&mut self, state: ConnectionState, status: impl Into<String>) {
        // Measurements only survive while ranging or paused
        if !state.is_ranging() {
            self.snapshot.measurement = None;
        }
        self.snapshot.state = state;
        self.snapshot.status = status.into();
        self.snapshot.updated_at = Utc::now();
    }

    /// Idle/Lost/Failed → Advertising/Browsing for a fresh session
    pub fn begin_search(&mut self, session_id: Uuid) -> bool {
        if self.snapshot.state.is_active() {
            return false;
        }
        self.snapshot.session_id = Some(session_id);
        self.snapshot.peer = None;
        self.snapshot.error_message = None;
        self.enter(ConnectionState::AdvertisingBrowsing, STATUS_SEARCHING);
        true
    }

    /// Connecting/TransportConnected/TokenExchanged → Advertising/Browsing
    pub fn resume_search(&mut self) -> bool {
        if !matches!(
            self.snapshot.state,
            ConnectionState::Connecting | ConnectionState::TransportConnected | ConnectionState::TokenExchanged
        ) {
            return false;
        }
        self.snapshot.peer = None;
        self.enter(ConnectionState::AdvertisingBrowsing, STATUS_SEARCHING);
        true
    }

    pub fn connecting(&mut self, peer: &PeerIdentity) -> bool {
        if self.snapshot.state != ConnectionState::AdvertisingBrowsing {
            return false;
        }
        self.snapshot.peer = Some(peer.clone());
        self.enter(ConnectionState::Connecting, format!("Connecting to {}...", peer));
        true
    }

    /// A link to `peer` came up; only the first peer is taken
    pub fn transport_connected(&mut self, peer: &PeerIdentity) -> bool {
        let accepts = match self.snapshot.state {
            ConnectionState::AdvertisingBrowsing => true,
            ConnectionState::Connecting => self.is_active_peer(peer),
            _ => false,
        };
        if !accepts {
            return false;
        }
        self.snapshot.peer = Some(peer.clone());
        self.enter(ConnectionState::TransportConnected, format!("Connected to {}", peer));
        true
    }

    /// Whether a payload from `peer` should be read as its discovery token
    pub fn awaiting_token_from(&self, peer: &PeerIdentity) -> bool {
        self.snapshot.state == ConnectionState::TransportConnected && self.is_active_peer(peer)
    }

    pub fn token_exchanged(&mut self) -> bool {
        if self.snapshot.state != ConnectionState::TransportConnected {
            return false;
        }
        let status = match &self.snapshot.peer {
            Some(peer) => format!("Received token from {}", peer),
            None => "Received token".to_string(),
        };
        self.enter(ConnectionState::TokenExchanged, status);
        true
    }

    pub fn ranging(&mut self) -> bool {
        if self.snapshot.state != ConnectionState::TokenExchanged {
            return false;
        }
        let status = match &self.snapshot.peer {
            Some(peer) => format!("Tracking {}", peer),
            None => "Tracking".to_string(),
        };
        self.enter(ConnectionState::Ranging, status);
        true
    }

    /// Apply the first ranged object of an update
    pub fn apply_update(&mut self, objects: &[NearbyObject]) -> bool {
        if self.snapshot.state != ConnectionState::Ranging {
            return false;
        }
        let Some(object) = objects.first() else {
            return false;
        };
        let Some(merged) = merge_measurement(self.snapshot.measurement.as_ref(), object) else {
            return false;
        };
        self.snapshot.measurement = Some(merged);
        self.snapshot.updated_at = Utc::now();
        true
    }

    pub fn suspend(&mut self) -> bool {
        if self.snapshot.state != ConnectionState::Ranging {
            return false;
        }
        self.enter(ConnectionState::Suspended, STATUS_SUSPENDED);
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.snapshot.state != ConnectionState::Suspended {
            return false;
        }
        self.enter(ConnectionState::Ranging, STATUS_RESUMED);
        true
    }

    /// Ranging counterpart removed; the transport link may still be up
    pub fn lost(&mut self, reason: RemovalReason) -> bool {
        if !matches!(
            self.snapshot.state,
            ConnectionState::TransportConnected
                | ConnectionState::TokenExchanged
                | ConnectionState::Ranging
                | ConnectionState::Suspended
        ) {
            return false;
        }
        self.enter(ConnectionState::Lost, reason.status_message());
        true
    }

    /// Transport link to `peer` went down while ranging continues
    pub fn link_down(&mut self, peer: &PeerIdentity) -> bool {
        if !self.is_active_peer(peer) {
            return false;
        }
        match self.snapshot.state {
            ConnectionState::Connecting | ConnectionState::TransportConnected | ConnectionState::TokenExchanged => {
                self.resume_search()
            }
            ConnectionState::Lost => {
                self.snapshot.peer = None;
                self.snapshot.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Enter Failed; a repeat of the current failure changes nothing
    pub fn fail(&mut self, reason: FailureReason, status: &str, message: String) -> bool {
        if self.snapshot.state == ConnectionState::Failed(reason.clone()) {
            return false;
        }
        self.snapshot.error_message = Some(message);
        self.enter(ConnectionState::Failed(reason), status);
        true
    }

    /// Back to Idle after an explicit stop
    pub fn reset(&mut self) -> bool {
        if self.snapshot.state == ConnectionState::Idle {
            return false;
        }
        self.snapshot = SessionSnapshot::idle();
        true
    }
}
