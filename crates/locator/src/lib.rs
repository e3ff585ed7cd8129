pub mod coordinator;
pub mod error;
pub mod overlay;
pub mod ranging;
pub mod state;
pub mod token;
pub mod transport;
pub mod types;

pub use coordinator::{CoordinatorOptions, SessionCoordinator};
pub use error::{ErrorCategory, ErrorContext, LocatorError, Result};
pub use overlay::{OverlayFeed, OverlayFrame, OverlayPlacement};
pub use ranging::{NearbyObject, RangingEvent, RangingEventSink, RangingSession, SimulatedRanging};
pub use state::SessionState;
pub use token::DiscoveryToken;
pub use transport::{
    LanTransport, MemoryTransport, TransportEvent, TransportEventSink, TransportSession,
};
pub use types::*;
