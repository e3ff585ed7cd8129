// LAN transport: mDNS discovery plus encrypted TCP links

use super::connection::{establish, LinkReader, LinkWriter, RemoteHello, Role};
use super::mdns::{BrowseEvent, DiscoveredService, ServiceAdvertiser, ServiceBrowser};
use super::{TransportEvent, TransportEventSink, TransportSession, INVITATION_TIMEOUT};
use crate::{ErrorContext, LocatorError, PeerIdentity, PeerLinkState, Result};
use async_trait::async_trait;
use mdns_sd::ServiceDaemon;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Transport over the local network
///
/// Only the side with the smaller instance id dials, so two devices that
/// discover each other at the same time still end up with a single link.
pub struct LanTransport {
    local: PeerIdentity,
    instance_id: String,
    listen_port: u16,
    invitation_timeout: Duration,
    session: Option<Session>,
}

struct Session {
    shared: Arc<Shared>,
    advertiser: ServiceAdvertiser,
    browser: ServiceBrowser,
    local_addr: SocketAddr,
    // Declared last so the daemon outlives the advertiser and browser
    _daemon: DaemonGuard,
}

/// Shuts the mDNS daemon down when dropped, including on a failed start
struct DaemonGuard {
    daemon: ServiceDaemon,
}

impl DaemonGuard {
    fn new(daemon: ServiceDaemon) -> Self {
        Self { daemon }
    }

    fn handle(&self) -> ServiceDaemon {
        self.daemon.clone()
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            debug!("mDNS daemon shutdown: {}", e);
        }
    }
}

struct ActiveLink {
    id: u64,
    peer: PeerIdentity,
    writer: LinkWriter<TcpStream>,
}

/// State reachable from the background tasks of one started session
struct Shared {
    local: PeerIdentity,
    instance_id: String,
    invitation_timeout: Duration,
    sink: TransportEventSink,
    cancel: CancellationToken,
    link: Mutex<Option<ActiveLink>>,
    dialing: AtomicBool,
    next_link_id: AtomicU64,
}

impl LanTransport {
    pub fn new(display_name: impl Into<String>, listen_port: u16) -> Self {
        Self {
            local: PeerIdentity::new(display_name),
            instance_id: Uuid::new_v4().simple().to_string(),
            listen_port,
            invitation_timeout: INVITATION_TIMEOUT,
            session: None,
        }
    }

    pub fn with_invitation_timeout(mut self, timeout: Duration) -> Self {
        self.invitation_timeout = timeout;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Address the link listener is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session.as_ref().map(|s| s.local_addr)
    }
}

/// Whether we are the side expected to dial `remote_instance`
fn should_invite(local_instance: &str, remote_instance: &str) -> bool {
    local_instance < remote_instance
}

impl Shared {
    fn new(
        local: PeerIdentity,
        instance_id: String,
        invitation_timeout: Duration,
        sink: TransportEventSink,
    ) -> Self {
        Self {
            local,
            instance_id,
            invitation_timeout,
            sink,
            cancel: CancellationToken::new(),
            link: Mutex::new(None),
            dialing: AtomicBool::new(false),
            next_link_id: AtomicU64::new(1),
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.sink.emit(event);
    }

    fn link_state(&self, peer: &PeerIdentity, state: PeerLinkState) {
        self.emit(TransportEvent::LinkStateChanged {
            peer: peer.clone(),
            state,
        });
    }

    async fn has_link(&self) -> bool {
        self.link.lock().await.is_some()
    }

    fn on_browse_event(self: &Arc<Self>, event: BrowseEvent) {
        match event {
            BrowseEvent::Resolved(service) => {
                info!(peer = %service.peer, "Discovered nearby locator");
                self.emit(TransportEvent::PeerFound(service.peer.clone()));

                if !should_invite(&self.instance_id, &service.instance_id) {
                    debug!(peer = %service.peer, "Waiting for peer to invite us");
                    return;
                }

                let shared = Arc::clone(self);
                tokio::spawn(async move { shared.invite(service).await });
            }
            BrowseEvent::Removed(service) => {
                info!(peer = %service.peer, "Nearby locator went away");
                self.emit(TransportEvent::PeerLost(service.peer));
            }
        }
    }

    /// Dial a discovered peer, bounded by the invitation timeout
    async fn invite(self: Arc<Self>, service: DiscoveredService) {
        if self.has_link().await || self.dialing.swap(true, Ordering::SeqCst) {
            debug!(peer = %service.peer, "Already linked or dialing, not inviting");
            return;
        }

        info!(peer = %service.peer, "Inviting peer");
        self.link_state(&service.peer, PeerLinkState::Connecting);

        let attempt = tokio::time::timeout(self.invitation_timeout, self.dial(&service)).await;
        self.dialing.store(false, Ordering::SeqCst);

        match attempt {
            Ok(Ok((hello, reader, writer))) => {
                self.install_link(hello, reader, writer).await;
            }
            Ok(Err(e)) => {
                e.log_with_context(
                    &ErrorContext::new()
                        .with_peer(service.peer.to_string())
                        .with_info("invitation failed"),
                );
                self.link_state(&service.peer, PeerLinkState::NotConnected);
            }
            Err(_) => {
                warn!(peer = %service.peer, timeout = ?self.invitation_timeout, "Invitation timed out");
                self.emit(TransportEvent::InvitationTimedOut(service.peer));
            }
        }
    }

    async fn dial(
        &self,
        service: &DiscoveredService,
    ) -> Result<(RemoteHello, LinkReader<TcpStream>, LinkWriter<TcpStream>)> {
        let mut last_error = LocatorError::PeerNotFound(service.peer.to_string());

        for addr in &service.addresses {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return establish(stream, Role::Initiator, &self.local, &self.instance_id).await;
                }
                Err(e) => {
                    debug!(%addr, "Connect failed: {}", e);
                    last_error = e.into();
                }
            }
        }

        Err(last_error)
    }

    /// Auto-accept an incoming link unless one is already up
    async fn accept(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if self.has_link().await {
            debug!(%addr, "Refusing second link");
            return;
        }

        let handshake = establish(stream, Role::Responder, &self.local, &self.instance_id);
        match tokio::time::timeout(self.invitation_timeout, handshake).await {
            Ok(Ok((hello, reader, writer))) => {
                info!(peer = %hello.peer, %addr, "Accepted invitation");
                self.link_state(&hello.peer, PeerLinkState::Connecting);
                self.install_link(hello, reader, writer).await;
            }
            Ok(Err(e)) => {
                e.log_with_context(&ErrorContext::new().with_info(format!("incoming link from {}", addr)));
            }
            Err(_) => {
                warn!(%addr, "Incoming handshake timed out");
            }
        }
    }

    async fn install_link(
        self: Arc<Self>,
        hello: RemoteHello,
        mut reader: LinkReader<TcpStream>,
        mut writer: LinkWriter<TcpStream>,
    ) {
        let id = self.next_link_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut slot = self.link.lock().await;
            if slot.is_some() || self.cancel.is_cancelled() {
                debug!(peer = %hello.peer, "Discarding surplus link");
                let _ = writer.close().await;
                return;
            }
            *slot = Some(ActiveLink {
                id,
                peer: hello.peer.clone(),
                writer,
            });
        }

        info!(peer = %hello.peer, "Link established");
        self.link_state(&hello.peer, PeerLinkState::Connected);

        let shared = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    received = reader.recv() => received,
                };

                match received {
                    Ok(Some(payload)) => {
                        debug!(peer = %hello.peer, bytes = payload.len(), "Payload received");
                        shared.emit(TransportEvent::DataReceived {
                            peer: hello.peer.clone(),
                            payload,
                        });
                    }
                    Ok(None) => {
                        info!(peer = %hello.peer, "Peer closed the link");
                        break;
                    }
                    Err(e) => {
                        e.log_with_context(&ErrorContext::new().with_peer(hello.peer.to_string()));
                        break;
                    }
                }
            }

            let mut slot = shared.link.lock().await;
            if slot.as_ref().map(|link| link.id) == Some(id) {
                *slot = None;
                drop(slot);
                shared.link_state(&hello.peer, PeerLinkState::NotConnected);
            }
        });
    }

    async fn send(&self, peer: &PeerIdentity, payload: &[u8]) -> Result<()> {
        let mut slot = self.link.lock().await;
        match slot.as_mut() {
            Some(link) if link.peer == *peer => link.writer.send(payload).await,
            _ => Err(LocatorError::PeerNotFound(peer.to_string())),
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
        if let Some(mut link) = self.link.lock().await.take() {
            if let Err(e) = link.writer.close().await {
                debug!(peer = %link.peer, "Closing link: {}", e);
            }
        }
    }
}

#[async_trait]
impl TransportSession for LanTransport {
    fn local_peer(&self) -> &PeerIdentity {
        &self.local
    }

    async fn start(&mut self, sink: TransportEventSink) -> Result<()> {
        if self.session.is_some() {
            debug!("LAN transport already started");
            return Ok(());
        }

        let listener = TcpListener::bind(("0.0.0.0", self.listen_port)).await?;
        let local_addr = listener.local_addr()?;

        let daemon = DaemonGuard::new(ServiceDaemon::new()?);
        let advertiser = ServiceAdvertiser::new(
            daemon.handle(),
            self.instance_id.clone(),
            self.local.display_name().to_string(),
        );
        let browser = ServiceBrowser::new(daemon.handle(), self.instance_id.clone());

        let shared = Arc::new(Shared::new(
            self.local.clone(),
            self.instance_id.clone(),
            self.invitation_timeout,
            sink,
        ));

        advertiser.start(local_addr.port()).await?;

        let on_browse = Arc::clone(&shared);
        if let Err(e) = browser.start(move |event| on_browse.on_browse_event(event)).await {
            let _ = advertiser.stop().await;
            return Err(e);
        }

        let acceptor = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = acceptor.cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(Arc::clone(&acceptor).accept(stream, addr));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        acceptor.emit(TransportEvent::Failed {
                            reason: format!("listener failed: {}", e),
                        });
                        break;
                    }
                }
            }
            debug!("Accept loop terminated");
        });

        info!(peer = %self.local, %local_addr, "LAN transport advertising and browsing");

        self.session = Some(Session {
            shared,
            advertiser,
            browser,
            local_addr,
            _daemon: daemon,
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        info!(peer = %self.local, "Stopping LAN transport");
        session.shared.close().await;

        if let Err(e) = session.browser.stop().await {
            debug!("Browser stop: {}", e);
        }
        if let Err(e) = session.advertiser.stop().await {
            debug!("Advertiser stop: {}", e);
        }
        drop(session);

        Ok(())
    }

    async fn send(&self, peer: &PeerIdentity, payload: &[u8]) -> Result<()> {
        match &self.session {
            Some(session) => session.shared.send(peer, payload).await,
            None => Err(LocatorError::PeerNotFound(peer.to_string())),
        }
    }

    fn is_running(&self) -> bool {
        self.session.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mdns::SERVICE_TYPE;

    fn shared(name: &str, instance: &str) -> (Arc<Shared>, tokio::sync::mpsc::UnboundedReceiver<TransportEvent>) {
        let (sink, rx) = TransportEventSink::channel();
        (
            Arc::new(Shared::new(
                PeerIdentity::new(name),
                instance.to_string(),
                INVITATION_TIMEOUT,
                sink,
            )),
            rx,
        )
    }

    #[test]
    fn test_only_one_side_invites() {
        assert!(should_invite("a1", "b2"));
        assert!(!should_invite("b2", "a1"));
        assert!(!should_invite("same", "same"));
    }

    #[tokio::test]
    async fn test_invite_accept_and_exchange_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (alpha, mut alpha_rx) = shared("alpha", "a");
        let (beta, mut beta_rx) = shared("beta", "b");

        let acceptor = Arc::clone(&beta);
        tokio::spawn(async move {
            let (stream, from) = listener.accept().await.unwrap();
            acceptor.accept(stream, from).await;
        });

        Arc::clone(&alpha)
            .invite(DiscoveredService {
                instance_id: "b".to_string(),
                peer: PeerIdentity::new("beta"),
                addresses: vec![addr],
            })
            .await;

        assert!(matches!(
            alpha_rx.recv().await,
            Some(TransportEvent::LinkStateChanged { state: PeerLinkState::Connecting, .. })
        ));
        assert_eq!(
            alpha_rx.recv().await,
            Some(TransportEvent::LinkStateChanged {
                peer: PeerIdentity::new("beta"),
                state: PeerLinkState::Connected
            })
        );

        assert!(matches!(
            beta_rx.recv().await,
            Some(TransportEvent::LinkStateChanged { state: PeerLinkState::Connecting, .. })
        ));
        assert!(matches!(
            beta_rx.recv().await,
            Some(TransportEvent::LinkStateChanged { state: PeerLinkState::Connected, .. })
        ));

        alpha.send(&PeerIdentity::new("beta"), b"token").await.unwrap();
        assert_eq!(
            beta_rx.recv().await,
            Some(TransportEvent::DataReceived {
                peer: PeerIdentity::new("alpha"),
                payload: b"token".to_vec()
            })
        );

        alpha.close().await;
        assert_eq!(
            beta_rx.recv().await,
            Some(TransportEvent::LinkStateChanged {
                peer: PeerIdentity::new("alpha"),
                state: PeerLinkState::NotConnected
            })
        );
    }

    #[tokio::test]
    async fn test_dropped_guard_shuts_daemon_down() {
        // Hosts without multicast cannot run a daemon at all
        let Ok(daemon) = ServiceDaemon::new() else {
            return;
        };
        let guard = DaemonGuard::new(daemon.clone());
        assert!(guard.handle().browse(SERVICE_TYPE).is_ok());

        drop(guard);

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            while daemon.browse(SERVICE_TYPE).is_ok() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(closed.is_ok(), "daemon still accepting commands after drop");
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let (alpha, _rx) = shared("alpha", "a");
        assert!(matches!(
            alpha.send(&PeerIdentity::new("nobody"), b"x").await,
            Err(LocatorError::PeerNotFound(_))
        ));
    }
}
