// Simulated ranging backend for devices without ranging hardware access

use super::{NearbyObject, RangingEvent, RangingEventSink, RangingSession};
use crate::token::DiscoveryToken;
use crate::{LocatorError, Result, Vector3};
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default period between measurement updates
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(500);

const TOKEN_LEN: usize = 32;
const BASE_DISTANCE_M: f32 = 2.0;
const DISTANCE_JITTER_M: f32 = 0.5;
const MAX_ANGLE_RAD: f32 = 0.2;

/// Ranging session that reports a peer hovering about two meters in front of the user
pub struct SimulatedRanging {
    supported: bool,
    update_interval: Duration,
    local_token: Option<DiscoveryToken>,
    sink: Option<RangingEventSink>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SimulatedRanging {
    pub fn new() -> Self {
        Self::with_settings(true, DEFAULT_UPDATE_INTERVAL)
    }

    pub fn with_settings(supported: bool, update_interval: Duration) -> Self {
        Self {
            supported,
            update_interval,
            local_token: None,
            sink: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Whether measurement updates are currently being produced
    pub fn is_ranging(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    fn stop_updates(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.cancel = CancellationToken::new();
    }
}

impl Default for SimulatedRanging {
    fn default() -> Self {
        Self::new()
    }
}

/// One sample in front of the user with a little jitter
pub fn simulated_sample<R: Rng + ?Sized>(rng: &mut R) -> NearbyObject {
    let distance = BASE_DISTANCE_M + rng.gen_range(-DISTANCE_JITTER_M..=DISTANCE_JITTER_M);
    let angle: f32 = rng.gen_range(-MAX_ANGLE_RAD..=MAX_ANGLE_RAD);

    NearbyObject::new(
        Some(distance),
        Some(Vector3::new(angle.sin(), 0.0, -angle.cos())),
    )
}

#[async_trait]
impl RangingSession for SimulatedRanging {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn initialize(&mut self, sink: RangingEventSink) -> Result<DiscoveryToken> {
        if !self.supported {
            return Err(LocatorError::UnsupportedDevice);
        }

        self.stop_updates();

        let mut bytes = vec![0u8; TOKEN_LEN];
        rand::thread_rng().fill(bytes.as_mut_slice());
        let token = DiscoveryToken::from_bytes(bytes)?;

        info!(token = %token.fingerprint(), "Simulated ranging session initialized");
        self.local_token = Some(token.clone());
        self.sink = Some(sink);
        Ok(token)
    }

    fn local_discovery_token(&self) -> Option<DiscoveryToken> {
        self.local_token.clone()
    }

    async fn configure(&mut self, peer_token: DiscoveryToken) -> Result<()> {
        let sink = self
            .sink
            .clone()
            .ok_or_else(|| LocatorError::RangingNotReady("session not initialized".to_string()))?;

        if self.local_token.as_ref() == Some(&peer_token) {
            return Err(LocatorError::RangingNotReady(
                "cannot range against our own token".to_string(),
            ));
        }

        self.stop_updates();

        info!(peer_token = %peer_token.fingerprint(), "Simulated ranging configured");

        let cancel = self.cancel.clone();
        let period = self.update_interval;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let sample = simulated_sample(&mut rand::thread_rng());
                        if !sink.emit(RangingEvent::Updated(vec![sample])) {
                            debug!("Ranging listener gone, stopping simulated updates");
                            break;
                        }
                    }
                }
            }
        }));

        Ok(())
    }

    async fn invalidate(&mut self) -> Result<()> {
        if self.local_token.is_none() && self.task.is_none() {
            return Ok(());
        }

        debug!("Invalidating simulated ranging session");
        self.stop_updates();
        self.sink = None;
        self.local_token = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_stay_in_front_of_user() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let sample = simulated_sample(&mut rng);
            let distance = sample.distance.unwrap();
            let direction = sample.direction.unwrap();

            assert!((1.5..=2.5).contains(&distance));
            assert!((direction.length() - 1.0).abs() < 1e-5);
            assert!(direction.z < 0.0);
            assert_eq!(direction.y, 0.0);
        }
    }

    #[tokio::test]
    async fn test_unsupported_device_refuses_to_initialize() {
        let mut ranging = SimulatedRanging::with_settings(false, DEFAULT_UPDATE_INTERVAL);
        let (sink, _rx) = RangingEventSink::channel();

        assert!(!ranging.is_supported());
        assert!(matches!(
            ranging.initialize(sink).await,
            Err(LocatorError::UnsupportedDevice)
        ));
        assert!(ranging.local_discovery_token().is_none());
    }

    #[tokio::test]
    async fn test_configure_requires_initialize() {
        let mut ranging = SimulatedRanging::new();
        let peer = DiscoveryToken::from_bytes(vec![9u8; 32]).unwrap();

        assert!(matches!(
            ranging.configure(peer).await,
            Err(LocatorError::RangingNotReady(_))
        ));
    }

    #[tokio::test]
    async fn test_updates_flow_after_configure() {
        let mut ranging = SimulatedRanging::with_settings(true, Duration::from_millis(10));
        let (sink, mut rx) = RangingEventSink::channel();

        let token = ranging.initialize(sink).await.unwrap();
        assert_eq!(ranging.local_discovery_token(), Some(token));

        let peer = DiscoveryToken::from_bytes(vec![9u8; 32]).unwrap();
        ranging.configure(peer).await.unwrap();
        assert!(ranging.is_ranging());

        match rx.recv().await {
            Some(RangingEvent::Updated(objects)) => assert_eq!(objects.len(), 1),
            other => panic!("unexpected event: {:?}", other),
        }

        tokio_test::assert_ok!(ranging.invalidate().await);
        assert!(!ranging.is_ranging());
        assert!(ranging.local_discovery_token().is_none());

        // Idempotent
        tokio_test::assert_ok!(ranging.invalidate().await);
    }
}
