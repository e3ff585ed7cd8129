// Placement of the AR marker and the fixed-rate feed the presentation layer samples

use crate::{ConnectionState, Measurement, SessionSnapshot, Vector3};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Presentation refresh cadence
pub const FRAME_RATE_HZ: u32 = 30;

/// Height of the distance label above the marker, in meters
pub const LABEL_OFFSET_M: f32 = 0.15;

/// Where to draw the marker and its label, in device-local space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayPlacement {
    pub position: Vector3,
    pub label_position: Vector3,
    pub distance: f32,
}

impl OverlayPlacement {
    /// Only possible once both distance and direction are known
    pub fn from_measurement(measurement: &Measurement) -> Option<Self> {
        let distance = measurement.distance?;
        let direction = measurement.direction?;

        let position = direction * distance;
        Some(Self {
            position,
            label_position: position + Vector3::UP * LABEL_OFFSET_M,
            distance,
        })
    }

    pub fn from_snapshot(snapshot: &SessionSnapshot) -> Option<Self> {
        if !snapshot.state.is_ranging() {
            return None;
        }
        snapshot.measurement.as_ref().and_then(Self::from_measurement)
    }

    /// Text shown on the label, e.g. "2.13 m"
    pub fn label(&self) -> String {
        format!("{:.2} m", self.distance)
    }
}

/// One presentation frame
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayFrame {
    pub state: ConnectionState,
    pub status: String,
    pub error_message: Option<String>,
    pub placement: Option<OverlayPlacement>,
}

impl From<&SessionSnapshot> for OverlayFrame {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            state: snapshot.state.clone(),
            status: snapshot.status.clone(),
            error_message: snapshot.error_message.clone(),
            placement: OverlayPlacement::from_snapshot(snapshot),
        }
    }
}

/// Samples the latest snapshot at a fixed rate, independent of update arrival
pub struct OverlayFeed {
    snapshots: watch::Receiver<SessionSnapshot>,
    ticker: Interval,
}

impl OverlayFeed {
    pub fn new(snapshots: watch::Receiver<SessionSnapshot>) -> Self {
        Self::with_period(snapshots, Duration::from_secs(1) / FRAME_RATE_HZ)
    }

    pub fn with_period(snapshots: watch::Receiver<SessionSnapshot>, period: Duration) -> Self {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { snapshots, ticker }
    }

    /// Wait for the next frame tick and return the frame to render
    pub async fn next_frame(&mut self) -> OverlayFrame {
        self.ticker.tick().await;
        OverlayFrame::from(&*self.snapshots.borrow())
    }
}
