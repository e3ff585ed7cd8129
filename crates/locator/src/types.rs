use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Mul};
use uuid::Uuid;

/// Stable display name of a transport peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self(display_name.into())
    }

    pub fn display_name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Vector in device-local space (x right, y up, -z forward)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const ZERO: Vector3 = Vector3::new(0.0, 0.0, 0.0);
    pub const UP: Vector3 = Vector3::new(0.0, 1.0, 0.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Unit vector in the same direction, `None` for zero or non-finite input
    pub fn normalized(&self) -> Option<Vector3> {
        let length = self.length();
        if !self.is_finite() || !length.is_finite() || length <= f32::EPSILON {
            return None;
        }
        Some(Vector3::new(self.x / length, self.y / length, self.z / length))
    }
}

impl Add for Vector3 {
    type Output = Vector3;

    fn add(self, rhs: Vector3) -> Vector3 {
        Vector3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Mul<f32> for Vector3 {
    type Output = Vector3;

    fn mul(self, rhs: f32) -> Vector3 {
        Vector3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Latest known position of the ranged peer
///
/// Either field may still be unknown when the sensor has only resolved one
/// dimension so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Distance in meters, never negative
    pub distance: Option<f32>,
    /// Unit vector pointing at the peer
    pub direction: Option<Vector3>,
    pub updated_at: DateTime<Utc>,
}

/// Why the ranging subsystem stopped tracking the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalReason {
    Timeout,
    PeerEnded,
    Unknown,
}

impl RemovalReason {
    pub fn status_message(&self) -> &'static str {
        match self {
            RemovalReason::Timeout => "Lost connection (timeout)",
            RemovalReason::PeerEnded => "Peer ended session",
            RemovalReason::Unknown => "Lost connection",
        }
    }
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalReason::Timeout => write!(f, "timeout"),
            RemovalReason::PeerEnded => write!(f, "peer_ended"),
            RemovalReason::Unknown => write!(f, "unknown"),
        }
    }
}

/// Cause of a terminal failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    UnsupportedDevice,
    TransportFailure(String),
    RangingInvalidated(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::UnsupportedDevice => write!(f, "unsupported device"),
            FailureReason::TransportFailure(reason) => write!(f, "transport failure: {}", reason),
            FailureReason::RangingInvalidated(reason) => write!(f, "ranging invalidated: {}", reason),
        }
    }
}

/// Lifecycle state of a locator session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    AdvertisingBrowsing,
    Connecting,
    TransportConnected,
    TokenExchanged,
    Ranging,
    Suspended,
    Lost,
    Failed(FailureReason),
}

impl ConnectionState {
    /// Sub-sessions are running in this state
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            ConnectionState::Idle | ConnectionState::Lost | ConnectionState::Failed(_)
        )
    }

    /// A ranging counterpart is configured (possibly paused)
    pub fn is_ranging(&self) -> bool {
        matches!(self, ConnectionState::Ranging | ConnectionState::Suspended)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "Idle"),
            ConnectionState::AdvertisingBrowsing => write!(f, "Advertising/Browsing"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::TransportConnected => write!(f, "TransportConnected"),
            ConnectionState::TokenExchanged => write!(f, "TokenExchanged"),
            ConnectionState::Ranging => write!(f, "Ranging"),
            ConnectionState::Suspended => write!(f, "Suspended"),
            ConnectionState::Lost => write!(f, "Lost"),
            ConnectionState::Failed(reason) => write!(f, "Failed ({})", reason),
        }
    }
}

/// Link states reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerLinkState {
    Connecting,
    Connected,
    NotConnected,
}

impl fmt::Display for PeerLinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerLinkState::Connecting => write!(f, "connecting"),
            PeerLinkState::Connected => write!(f, "connected"),
            PeerLinkState::NotConnected => write!(f, "not connected"),
        }
    }
}

/// Published view of the coordinator, pushed on every transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Identifier of the current start() generation
    pub session_id: Option<Uuid>,
    pub state: ConnectionState,
    pub peer: Option<PeerIdentity>,
    pub measurement: Option<Measurement>,
    pub status: String,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn idle() -> Self {
        Self {
            session_id: None,
            state: ConnectionState::Idle,
            peer: None,
            measurement: None,
            status: crate::state::STATUS_NOT_CONNECTED.to_string(),
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    /// Distance in meters if the peer is currently being ranged
    pub fn distance(&self) -> Option<f32> {
        self.measurement.as_ref().and_then(|m| m.distance)
    }

    pub fn direction(&self) -> Option<Vector3> {
        self.measurement.as_ref().and_then(|m| m.direction)
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_direction() {
        let v = Vector3::new(0.0, 3.0, -4.0).normalized().unwrap();
        assert!((v.length() - 1.0).abs() < 1e-6);
        assert!((v.y - 0.6).abs() < 1e-6);
        assert!((v.z + 0.8).abs() < 1e-6);

        assert!(Vector3::ZERO.normalized().is_none());
        assert!(Vector3::new(f32::NAN, 0.0, 1.0).normalized().is_none());
    }

    #[test]
    fn test_removal_reasons_have_distinct_status() {
        let messages = [
            RemovalReason::Timeout.status_message(),
            RemovalReason::PeerEnded.status_message(),
            RemovalReason::Unknown.status_message(),
        ];
        assert_ne!(messages[0], messages[1]);
        assert_ne!(messages[1], messages[2]);
        assert_ne!(messages[0], messages[2]);
    }

    #[test]
    fn test_state_activity() {
        assert!(!ConnectionState::Idle.is_active());
        assert!(!ConnectionState::Lost.is_active());
        assert!(!ConnectionState::Failed(FailureReason::UnsupportedDevice).is_active());
        assert!(ConnectionState::AdvertisingBrowsing.is_active());
        assert!(ConnectionState::Suspended.is_active());
        assert!(ConnectionState::Suspended.is_ranging());
        assert!(!ConnectionState::TokenExchanged.is_ranging());
    }

    #[test]
    fn test_idle_snapshot() {
        let snapshot = SessionSnapshot::idle();
        assert_eq!(snapshot.state, ConnectionState::Idle);
        assert_eq!(snapshot.status, "Not connected");
        assert!(snapshot.distance().is_none());
        assert!(snapshot.error_message.is_none());
    }
}
