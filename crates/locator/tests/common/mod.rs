// Scripted transport and ranging sessions for coordinator tests

#![allow(dead_code)]

use async_trait::async_trait;
use locator::{
    DiscoveryToken, LocatorError, PeerIdentity, RangingEvent, RangingEventSink, RangingSession,
    Result, SessionSnapshot, TransportEvent, TransportEventSink, TransportSession,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(2);

pub fn local_token() -> DiscoveryToken {
    DiscoveryToken::from_bytes(vec![0xA1; 32]).unwrap()
}

pub fn peer_token() -> DiscoveryToken {
    DiscoveryToken::from_bytes(vec![0xB2; 32]).unwrap()
}

/// Sleep for a scripted delay, if any
async fn delay(millis: &AtomicU64) {
    let millis = millis.load(Ordering::SeqCst);
    if millis > 0 {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Next published transition
pub async fn next_snapshot(rx: &mut broadcast::Receiver<SessionSnapshot>) -> SessionSnapshot {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no transition published in time")
        .expect("transition stream closed")
}

/// Assert nothing further is published for a short while
pub async fn assert_quiet(rx: &mut broadcast::Receiver<SessionSnapshot>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        rx.try_recv().is_err(),
        "unexpected transition was published"
    );
}

#[derive(Default)]
pub struct TransportControls {
    sink: Mutex<Option<TransportEventSink>>,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_send: AtomicBool,
    /// Time `start` takes before it returns
    pub start_delay_ms: AtomicU64,
    sent: Mutex<Vec<(PeerIdentity, Vec<u8>)>>,
}

impl TransportControls {
    pub fn emit(&self, event: TransportEvent) {
        let sink = self.sink.lock().unwrap().clone();
        sink.expect("transport not started").emit(event);
    }

    /// Sink handed over by the most recent start, still usable after stop
    pub fn last_sink(&self) -> Option<TransportEventSink> {
        self.sink.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<(PeerIdentity, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub async fn wait_started(&self, calls: usize) {
        wait_until(|| self.start_calls.load(Ordering::SeqCst) >= calls).await;
    }

    pub async fn wait_sent(&self, count: usize) {
        wait_until(|| self.sent.lock().unwrap().len() >= count).await;
    }

    pub async fn wait_stopped(&self, calls: usize) {
        wait_until(|| self.stop_calls.load(Ordering::SeqCst) >= calls).await;
    }
}

pub struct FakeTransport {
    local: PeerIdentity,
    running: bool,
    controls: Arc<TransportControls>,
}

impl FakeTransport {
    pub fn new(name: &str) -> (Self, Arc<TransportControls>) {
        let controls = Arc::new(TransportControls::default());
        (
            Self {
                local: PeerIdentity::new(name),
                running: false,
                controls: Arc::clone(&controls),
            },
            controls,
        )
    }
}

#[async_trait]
impl TransportSession for FakeTransport {
    fn local_peer(&self) -> &PeerIdentity {
        &self.local
    }

    async fn start(&mut self, sink: TransportEventSink) -> Result<()> {
        self.controls.start_calls.fetch_add(1, Ordering::SeqCst);
        delay(&self.controls.start_delay_ms).await;
        if self.controls.fail_start.load(Ordering::SeqCst) {
            return Err(LocatorError::PermissionDenied("local network access".to_string()));
        }
        *self.controls.sink.lock().unwrap() = Some(sink);
        self.running = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.controls.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.running = false;
        Ok(())
    }

    async fn send(&self, peer: &PeerIdentity, payload: &[u8]) -> Result<()> {
        if self.controls.fail_send.load(Ordering::SeqCst) {
            return Err(LocatorError::NetworkError("link reset".to_string()));
        }
        self.controls
            .sent
            .lock()
            .unwrap()
            .push((peer.clone(), payload.to_vec()));
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

pub struct RangingControls {
    pub supported: AtomicBool,
    pub fail_configure: AtomicBool,
    pub fail_initialize: AtomicBool,
    /// Time `configure` takes before it returns
    pub configure_delay_ms: AtomicU64,
    pub initialize_calls: AtomicUsize,
    pub configure_calls: AtomicUsize,
    pub invalidate_calls: AtomicUsize,
    sink: Mutex<Option<RangingEventSink>>,
    configured: Mutex<Vec<DiscoveryToken>>,
}

impl RangingControls {
    pub fn emit(&self, event: RangingEvent) {
        let sink = self.sink.lock().unwrap().clone();
        sink.expect("ranging not initialized").emit(event);
    }

    pub fn configured(&self) -> Vec<DiscoveryToken> {
        self.configured.lock().unwrap().clone()
    }

    pub async fn wait_configuring(&self, calls: usize) {
        wait_until(|| self.configure_calls.load(Ordering::SeqCst) >= calls).await;
    }

    pub async fn wait_invalidated(&self, calls: usize) {
        wait_until(|| self.invalidate_calls.load(Ordering::SeqCst) >= calls).await;
    }
}

pub struct FakeRanging {
    token: Option<DiscoveryToken>,
    controls: Arc<RangingControls>,
}

impl FakeRanging {
    pub fn new() -> (Self, Arc<RangingControls>) {
        Self::with_support(true)
    }

    pub fn with_support(supported: bool) -> (Self, Arc<RangingControls>) {
        let controls = Arc::new(RangingControls {
            supported: AtomicBool::new(supported),
            fail_configure: AtomicBool::new(false),
            fail_initialize: AtomicBool::new(false),
            configure_delay_ms: AtomicU64::new(0),
            initialize_calls: AtomicUsize::new(0),
            configure_calls: AtomicUsize::new(0),
            invalidate_calls: AtomicUsize::new(0),
            sink: Mutex::new(None),
            configured: Mutex::new(Vec::new()),
        });
        (
            Self {
                token: None,
                controls: Arc::clone(&controls),
            },
            controls,
        )
    }
}

#[async_trait]
impl RangingSession for FakeRanging {
    fn is_supported(&self) -> bool {
        self.controls.supported.load(Ordering::SeqCst)
    }

    async fn initialize(&mut self, sink: RangingEventSink) -> Result<DiscoveryToken> {
        self.controls.initialize_calls.fetch_add(1, Ordering::SeqCst);
        if self.controls.fail_initialize.load(Ordering::SeqCst) {
            return Err(LocatorError::TokenDeserialization("corrupt token store".to_string()));
        }
        *self.controls.sink.lock().unwrap() = Some(sink);
        self.token = Some(local_token());
        Ok(local_token())
    }

    fn local_discovery_token(&self) -> Option<DiscoveryToken> {
        self.token.clone()
    }

    async fn configure(&mut self, peer_token: DiscoveryToken) -> Result<()> {
        self.controls.configure_calls.fetch_add(1, Ordering::SeqCst);
        delay(&self.controls.configure_delay_ms).await;
        if self.controls.fail_configure.load(Ordering::SeqCst) {
            return Err(LocatorError::RangingNotReady("sensor busy".to_string()));
        }
        self.controls.configured.lock().unwrap().push(peer_token);
        Ok(())
    }

    async fn invalidate(&mut self) -> Result<()> {
        self.controls.invalidate_calls.fetch_add(1, Ordering::SeqCst);
        self.token = None;
        Ok(())
    }
}
