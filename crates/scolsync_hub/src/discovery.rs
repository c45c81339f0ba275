//! Zero-configuration discovery of peer instances on the LAN.

use crate::error::{HubError, HubResult};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::watch;

/// The mDNS service type all scolsync instances advertise.
pub const SERVICE_TYPE: &str = "_scolsync._tcp.local.";

/// Protocol version published in the TXT record.
pub const PROTOCOL_VERSION: &str = "1";

/// Discovery configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Service type to advertise and browse.
    pub service_type: String,
    /// Human-readable instance name, unique on the segment.
    pub instance_name: String,
    /// TCP port of this instance's hub.
    pub port: u16,
}

impl DiscoveryConfig {
    /// Creates a configuration for an instance.
    pub fn new(instance_name: impl Into<String>, port: u16) -> Self {
        Self {
            service_type: SERVICE_TYPE.into(),
            instance_name: instance_name.into(),
            port,
        }
    }
}

/// An instance seen on the LAN. Ephemeral; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    /// Advertised instance name.
    pub name: String,
    /// First resolved address.
    pub address: String,
    /// Advertised hub port.
    pub port: u16,
    /// Advertised host name.
    pub hostname: String,
}

/// The running discovery service.
///
/// Owns the mDNS daemon, the advertisement, and the browse task; observers
/// watch [`Discovery::peers`] and are notified on every add/remove, with no
/// polling. Dropping the handle (or calling [`Discovery::stop`]) tears
/// everything down.
pub struct Discovery {
    daemon: ServiceDaemon,
    peers_rx: watch::Receiver<Vec<Peer>>,
    fullname: String,
    browse_task: tokio::task::JoinHandle<()>,
}

impl Discovery {
    /// Publishes this instance and starts browsing for peers.
    pub fn start(config: DiscoveryConfig) -> HubResult<Self> {
        let daemon =
            ServiceDaemon::new().map_err(|e| HubError::Discovery(e.to_string()))?;

        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "scolsync-host".to_string());

        let service = ServiceInfo::new(
            &config.service_type,
            &config.instance_name,
            &format!("{host}.local."),
            "",
            config.port,
            &[("version", PROTOCOL_VERSION)][..],
        )
        .map_err(|e| HubError::Discovery(e.to_string()))?
        .enable_addr_auto();
        let fullname = service.get_fullname().to_string();

        daemon
            .register(service)
            .map_err(|e| HubError::Discovery(e.to_string()))?;
        tracing::info!(
            instance = %config.instance_name,
            port = config.port,
            "published mDNS advertisement"
        );

        let receiver = daemon
            .browse(&config.service_type)
            .map_err(|e| HubError::Discovery(e.to_string()))?;

        let (peers_tx, peers_rx) = watch::channel(Vec::new());
        let own_fullname = fullname.clone();
        let browse_task = tokio::spawn(async move {
            let mut seen: HashMap<String, Peer> = HashMap::new();
            while let Ok(event) = receiver.recv_async().await {
                if let Some(changed) = apply_event(&mut seen, &own_fullname, event) {
                    tracing::info!(peers = seen.len(), change = changed, "peer set updated");
                    let mut peers: Vec<Peer> = seen.values().cloned().collect();
                    peers.sort_by(|a, b| a.name.cmp(&b.name));
                    if peers_tx.send(peers).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Self {
            daemon,
            peers_rx,
            fullname,
            browse_task,
        })
    }

    /// A watch over the live peer set; observers see every add/remove.
    pub fn peers(&self) -> watch::Receiver<Vec<Peer>> {
        self.peers_rx.clone()
    }

    /// Snapshot of the current peer set.
    pub fn current_peers(&self) -> Vec<Peer> {
        self.peers_rx.borrow().clone()
    }

    /// Withdraws the advertisement and stops browsing.
    pub fn stop(self) {
        let _ = self.daemon.unregister(&self.fullname);
        let _ = self.daemon.shutdown();
        self.browse_task.abort();
        tracing::info!("discovery stopped");
    }
}

/// Applies one browse event to the peer map.
///
/// Returns the kind of change when the set changed, `None` otherwise. Our
/// own advertisement echoes back during browsing and is ignored.
fn apply_event(
    peers: &mut HashMap<String, Peer>,
    own_fullname: &str,
    event: ServiceEvent,
) -> Option<&'static str> {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            let fullname = info.get_fullname().to_string();
            if fullname == own_fullname {
                return None;
            }
            let address = info
                .get_addresses()
                .iter()
                .next()
                .map(|a| a.to_string())
                .unwrap_or_default();
            let peer = Peer {
                name: instance_label(&fullname),
                address,
                port: info.get_port(),
                hostname: info.get_hostname().to_string(),
            };
            peers.insert(fullname, peer);
            Some("up")
        }
        ServiceEvent::ServiceRemoved(_ty, fullname) => {
            if peers.remove(&fullname).is_some() {
                Some("down")
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Extracts the instance label from an mDNS full name
/// (`Salle A._scolsync._tcp.local.` → `Salle A`).
fn instance_label(fullname: &str) -> String {
    fullname
        .split_once("._")
        .map(|(label, _)| label.to_string())
        .unwrap_or_else(|| fullname.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_label_strips_service_suffix() {
        assert_eq!(
            instance_label("Salle A._scolsync._tcp.local."),
            "Salle A"
        );
        assert_eq!(instance_label("bare"), "bare");
    }

    #[test]
    fn config_defaults() {
        let config = DiscoveryConfig::new("Salle A", 4123);
        assert_eq!(config.service_type, SERVICE_TYPE);
        assert_eq!(config.port, 4123);
    }

    #[test]
    fn removal_of_unknown_peer_is_silent() {
        let mut peers = HashMap::new();
        let change = apply_event(
            &mut peers,
            "me._scolsync._tcp.local.",
            ServiceEvent::ServiceRemoved(
                SERVICE_TYPE.to_string(),
                "ghost._scolsync._tcp.local.".to_string(),
            ),
        );
        assert_eq!(change, None);
        assert!(peers.is_empty());
    }

    #[test]
    fn search_events_do_not_touch_the_peer_set() {
        let mut peers = HashMap::new();
        let change = apply_event(
            &mut peers,
            "me._scolsync._tcp.local.",
            ServiceEvent::SearchStarted(SERVICE_TYPE.to_string()),
        );
        assert_eq!(change, None);
    }
}
