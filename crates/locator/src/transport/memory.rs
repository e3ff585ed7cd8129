// In-process transport pair, used by simulations and tests

use super::{TransportEvent, TransportEventSink, TransportSession, INVITATION_TIMEOUT};
use crate::{LocatorError, PeerIdentity, PeerLinkState, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct Endpoint {
    peer: PeerIdentity,
    running: bool,
    accepts_invitations: bool,
    sink: Option<TransportEventSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkPhase {
    Down,
    Inviting { inviter: usize, generation: u64 },
    Up,
}

#[derive(Debug)]
struct Medium {
    endpoints: [Endpoint; 2],
    link: LinkPhase,
    generation: u64,
}

type Outbox = Vec<(TransportEventSink, TransportEvent)>;

impl Medium {
    fn queue(&self, outbox: &mut Outbox, side: usize, event: TransportEvent) {
        if let Some(sink) = &self.endpoints[side].sink {
            outbox.push((sink.clone(), event));
        }
    }

    fn link_state(&self, outbox: &mut Outbox, side: usize, state: PeerLinkState) {
        let peer = self.endpoints[1 - side].peer.clone();
        self.queue(outbox, side, TransportEvent::LinkStateChanged { peer, state });
    }
}

fn deliver(outbox: Outbox) {
    for (sink, event) in outbox {
        sink.emit(event);
    }
}

/// One side of a paired in-memory transport
///
/// The side that starts second finds the other already advertising and sends
/// the invitation, mirroring the invite-first-found policy of the LAN transport.
pub struct MemoryTransport {
    side: usize,
    local: PeerIdentity,
    medium: Arc<Mutex<Medium>>,
    invitation_timeout: Duration,
}

impl MemoryTransport {
    /// Create two transports that can only see each other
    pub fn pair(first: impl Into<String>, second: impl Into<String>) -> (Self, Self) {
        let first = PeerIdentity::new(first);
        let second = PeerIdentity::new(second);

        let endpoint = |peer: &PeerIdentity| Endpoint {
            peer: peer.clone(),
            running: false,
            accepts_invitations: true,
            sink: None,
        };

        let medium = Arc::new(Mutex::new(Medium {
            endpoints: [endpoint(&first), endpoint(&second)],
            link: LinkPhase::Down,
            generation: 0,
        }));

        (
            Self {
                side: 0,
                local: first,
                medium: Arc::clone(&medium),
                invitation_timeout: INVITATION_TIMEOUT,
            },
            Self {
                side: 1,
                local: second,
                medium,
                invitation_timeout: INVITATION_TIMEOUT,
            },
        )
    }

    pub fn with_invitation_timeout(mut self, timeout: Duration) -> Self {
        self.invitation_timeout = timeout;
        self
    }

    /// Refuse (or accept again) incoming invitations, leaving them unanswered
    pub fn set_accepts_invitations(&self, accepts: bool) {
        self.lock().endpoints[self.side].accepts_invitations = accepts;
    }

    /// Drop an established link as if the radio went away
    pub fn drop_link(&self) {
        let mut outbox = Outbox::new();
        {
            let mut medium = self.lock();
            if medium.link != LinkPhase::Up {
                return;
            }
            medium.link = LinkPhase::Down;
            medium.link_state(&mut outbox, 0, PeerLinkState::NotConnected);
            medium.link_state(&mut outbox, 1, PeerLinkState::NotConnected);
        }
        warn!(peer = %self.local, "In-memory link dropped");
        deliver(outbox);
    }

    pub fn is_connected(&self) -> bool {
        self.lock().link == LinkPhase::Up
    }

    fn lock(&self) -> MutexGuard<'_, Medium> {
        // A poisoned medium only means a test panicked mid-update
        self.medium.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_invitation_timer(&self, generation: u64) {
        let medium = Arc::clone(&self.medium);
        let inviter = self.side;
        let timeout = self.invitation_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let mut outbox = Outbox::new();
            {
                let mut medium = medium.lock().unwrap_or_else(|p| p.into_inner());
                if medium.link != (LinkPhase::Inviting { inviter, generation }) {
                    return;
                }
                medium.link = LinkPhase::Down;
                let peer = medium.endpoints[1 - inviter].peer.clone();
                debug!(peer = %peer, "In-memory invitation timed out");
                medium.queue(&mut outbox, inviter, TransportEvent::InvitationTimedOut(peer));
            }
            deliver(outbox);
        });
    }
}

#[async_trait]
impl TransportSession for MemoryTransport {
    fn local_peer(&self) -> &PeerIdentity {
        &self.local
    }

    async fn start(&mut self, sink: TransportEventSink) -> Result<()> {
        let mut outbox = Outbox::new();
        let mut pending_invitation = None;
        {
            let mut medium = self.lock();
            let me = self.side;
            let other = 1 - me;

            if medium.endpoints[me].running {
                debug!(peer = %self.local, "In-memory transport already started");
                return Ok(());
            }

            medium.endpoints[me].running = true;
            medium.endpoints[me].sink = Some(sink);
            info!(peer = %self.local, "In-memory transport advertising and browsing");

            if medium.endpoints[other].running {
                let other_peer = medium.endpoints[other].peer.clone();
                medium.queue(&mut outbox, me, TransportEvent::PeerFound(other_peer));
                medium.queue(
                    &mut outbox,
                    other,
                    TransportEvent::PeerFound(self.local.clone()),
                );

                if medium.link == LinkPhase::Down {
                    medium.link_state(&mut outbox, me, PeerLinkState::Connecting);

                    if medium.endpoints[other].accepts_invitations {
                        medium.link = LinkPhase::Up;
                        medium.link_state(&mut outbox, other, PeerLinkState::Connecting);
                        medium.link_state(&mut outbox, me, PeerLinkState::Connected);
                        medium.link_state(&mut outbox, other, PeerLinkState::Connected);
                    } else {
                        medium.generation += 1;
                        let generation = medium.generation;
                        medium.link = LinkPhase::Inviting {
                            inviter: me,
                            generation,
                        };
                        pending_invitation = Some(generation);
                    }
                }
            }
        }

        deliver(outbox);
        if let Some(generation) = pending_invitation {
            self.spawn_invitation_timer(generation);
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let mut outbox = Outbox::new();
        {
            let mut medium = self.lock();
            let me = self.side;
            let other = 1 - me;

            if !medium.endpoints[me].running {
                return Ok(());
            }

            if medium.link == LinkPhase::Up {
                medium.link_state(&mut outbox, other, PeerLinkState::NotConnected);
            }
            if medium.endpoints[other].running {
                medium.queue(
                    &mut outbox,
                    other,
                    TransportEvent::PeerLost(self.local.clone()),
                );
            }

            medium.link = LinkPhase::Down;
            medium.endpoints[me].running = false;
            medium.endpoints[me].sink = None;
        }

        info!(peer = %self.local, "In-memory transport stopped");
        deliver(outbox);
        Ok(())
    }

    async fn send(&self, peer: &PeerIdentity, payload: &[u8]) -> Result<()> {
        let mut outbox = Outbox::new();
        {
            let medium = self.lock();
            let other = 1 - self.side;

            if medium.link != LinkPhase::Up || medium.endpoints[other].peer != *peer {
                return Err(LocatorError::PeerNotFound(peer.to_string()));
            }

            medium.queue(
                &mut outbox,
                other,
                TransportEvent::DataReceived {
                    peer: self.local.clone(),
                    payload: payload.to_vec(),
                },
            );
        }

        debug!(peer = %peer, bytes = payload.len(), "In-memory payload sent");
        deliver(outbox);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.lock().endpoints[self.side].running
    }
}
