// mDNS advertising and browsing for the LAN transport

use super::SERVICE_NAME;
use crate::{LocatorError, PeerIdentity, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SERVICE_TYPE: &str = "_airtag-locate._tcp.local.";
pub const PROTOCOL_VERSION: &str = "1";

const INSTANCE_PREFIX: &str = "locate-";
const TXT_NAME: &str = "name";
const TXT_INSTANCE: &str = "instance";
const TXT_VERSION: &str = "version";

/// A peer resolved from its mDNS record
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredService {
    pub instance_id: String,
    pub peer: PeerIdentity,
    pub addresses: Vec<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BrowseEvent {
    Resolved(DiscoveredService),
    Removed(DiscoveredService),
}

/// Broadcasts this device under the locator service type
pub struct ServiceAdvertiser {
    daemon: ServiceDaemon,
    fullname: Arc<RwLock<Option<String>>>,
    instance_id: String,
    display_name: String,
}

impl ServiceAdvertiser {
    pub fn new(daemon: ServiceDaemon, instance_id: String, display_name: String) -> Self {
        Self {
            daemon,
            fullname: Arc::new(RwLock::new(None)),
            instance_id,
            display_name,
        }
    }

    /// Start advertising the listener on `port`
    pub async fn start(&self, port: u16) -> Result<()> {
        let mut fullname = self.fullname.write().await;

        if fullname.is_some() {
            warn!("mDNS advertisement already active");
            return Ok(());
        }

        info!(service = SERVICE_NAME, name = %self.display_name, port, "Starting mDNS advertisement");

        let instance_name = format!("{}{}", INSTANCE_PREFIX, self.instance_id);
        let host_name = format!("{}.local.", instance_name);

        let mut properties = HashMap::new();
        properties.insert(TXT_NAME.to_string(), self.display_name.clone());
        properties.insert(TXT_INSTANCE.to_string(), self.instance_id.clone());
        properties.insert(TXT_VERSION.to_string(), PROTOCOL_VERSION.to_string());

        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            &instance_name,
            &host_name,
            "",
            port,
            Some(properties),
        )
        .map_err(|e| LocatorError::TransportFailure(format!("Failed to create service info: {}", e)))?
        .enable_addr_auto();

        let registered_name = service_info.get_fullname().to_string();
        self.daemon
            .register(service_info)
            .map_err(|e| LocatorError::TransportFailure(format!("Failed to register mDNS service: {}", e)))?;

        *fullname = Some(registered_name);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let mut fullname = self.fullname.write().await;

        if let Some(name) = fullname.take() {
            info!("Stopping mDNS advertisement");
            self.daemon
                .unregister(&name)
                .map_err(|e| LocatorError::TransportFailure(format!("Failed to unregister mDNS service: {}", e)))?;
        } else {
            debug!("No active mDNS advertisement to stop");
        }

        Ok(())
    }
}

/// Watches for other devices advertising the locator service
pub struct ServiceBrowser {
    daemon: ServiceDaemon,
    own_instance: String,
    known: Arc<RwLock<HashMap<String, DiscoveredService>>>,
    cancel: Arc<RwLock<Option<CancellationToken>>>,
}

impl ServiceBrowser {
    pub fn new(daemon: ServiceDaemon, own_instance: String) -> Self {
        Self {
            daemon,
            own_instance,
            known: Arc::new(RwLock::new(HashMap::new())),
            cancel: Arc::new(RwLock::new(None)),
        }
    }

    /// Start browsing; `on_event` runs on the browse task for every change
    pub async fn start<F>(&self, on_event: F) -> Result<()>
    where
        F: Fn(BrowseEvent) + Send + Sync + 'static,
    {
        let mut cancel_slot = self.cancel.write().await;

        if cancel_slot.is_some() {
            warn!("mDNS browser already running");
            return Ok(());
        }

        info!(service_type = SERVICE_TYPE, "Starting mDNS browser");

        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| LocatorError::TransportFailure(format!("Failed to browse mDNS services: {}", e)))?;

        let cancel = CancellationToken::new();
        *cancel_slot = Some(cancel.clone());
        drop(cancel_slot);

        let known = Arc::clone(&self.known);
        let own_instance = self.own_instance.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = receiver.recv_async() => match event {
                        Ok(event) => event,
                        Err(_) => break,
                    },
                };

                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        debug!("mDNS service resolved: {}", info.get_fullname());

                        let Some(service) = parse_service_info(&info) else {
                            continue;
                        };
                        if service.instance_id == own_instance {
                            continue;
                        }

                        let previous = known
                            .write()
                            .await
                            .insert(service.instance_id.clone(), service.clone());
                        if previous.as_ref() != Some(&service) {
                            on_event(BrowseEvent::Resolved(service));
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        debug!("mDNS service removed: {}", fullname);

                        if let Some(instance_id) = extract_instance_id(&fullname) {
                            if let Some(service) = known.write().await.remove(&instance_id) {
                                on_event(BrowseEvent::Removed(service));
                            }
                        }
                    }
                    ServiceEvent::SearchStarted(_) | ServiceEvent::SearchStopped(_) => {}
                    other => {
                        debug!("Unhandled mDNS event: {:?}", other);
                    }
                }
            }

            debug!("mDNS browse loop terminated");
        });

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let Some(cancel) = self.cancel.write().await.take() else {
            debug!("mDNS browser not running");
            return Ok(());
        };

        info!("Stopping mDNS browser");
        cancel.cancel();
        if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
            debug!("stop_browse: {}", e);
        }
        self.known.write().await.clear();
        Ok(())
    }
}

/// Parse a resolved record, rejecting foreign or incompatible instances
fn parse_service_info(info: &ServiceInfo) -> Option<DiscoveredService> {
    let display_name = info.get_property_val_str(TXT_NAME)?.to_string();
    let instance_id = info.get_property_val_str(TXT_INSTANCE)?.to_string();

    match info.get_property_val_str(TXT_VERSION) {
        Some(PROTOCOL_VERSION) => {}
        version => {
            warn!(
                peer = %display_name,
                "Ignoring peer with incompatible protocol version {:?} (expected {})",
                version,
                PROTOCOL_VERSION
            );
            return None;
        }
    }

    let port = info.get_port();
    let addresses = info
        .get_addresses()
        .iter()
        .map(|addr| SocketAddr::new(IpAddr::from(*addr), port))
        .collect::<Vec<_>>();

    if addresses.is_empty() {
        debug!(peer = %display_name, "Resolved peer has no addresses yet");
        return None;
    }

    Some(DiscoveredService {
        instance_id,
        peer: PeerIdentity::new(display_name),
        addresses,
    })
}

/// Fullname format: "locate-{instance}._airtag-locate._tcp.local."
fn extract_instance_id(fullname: &str) -> Option<String> {
    fullname
        .strip_suffix(SERVICE_TYPE)?
        .strip_suffix('.')?
        .strip_prefix(INSTANCE_PREFIX)
        .map(str::to_string)
}
