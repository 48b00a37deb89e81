use crate::bus::ServiceBus;
use crate::config::NodeConfig;
use crate::discovery::{DiscoveryBeacon, NodeIdentity};
use crate::protocol::BusEvent;
use crate::registry::ServiceRegistry;
use crate::store::RegistryStore;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const NODE_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// One running mesh participant: discovery beacon, publish endpoint, and
/// service registry wired together. Discovery of a peer automatically
/// subscribes to that peer's bus, so registries converge without any
/// explicit join step.
pub struct MeshNode {
    config: NodeConfig,
    registry: Arc<ServiceRegistry>,
    bus: ServiceBus,
    node_events: broadcast::Sender<NodeIdentity>,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshNode {
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        let bus = ServiceBus::new();
        let (pub_addr, serve_task) = bus
            .serve(&format!("0.0.0.0:{}", config.pub_port))
            .await?;
        info!("bus publish endpoint on {}", pub_addr);

        // A broken database never blocks mesh participation.
        let store = match &config.db_path {
            Some(path) => match RegistryStore::open(path) {
                Ok(store) => Some(store),
                Err(e) => {
                    warn!("registry store at {} unavailable: {}", path.display(), e);
                    None
                }
            },
            None => None,
        };

        // Advertise the port the bus actually bound, which differs from the
        // configured one when pub_port is 0.
        let (beacon, mut discovered) = build_beacon(&config, pub_addr.port());

        let registry = Arc::new(ServiceRegistry::new(
            config.node_id.clone(),
            Duration::from_secs(config.heartbeat_interval_secs),
            bus.clone(),
            store,
            beacon.known_nodes(),
        ));

        let (events_tx, events_rx) = mpsc::channel(256);
        let mut tasks = vec![serve_task];
        tasks.extend(registry.spawn_loops(events_rx));
        tasks.extend(beacon.spawn().await?);

        let (node_events, _) = broadcast::channel(NODE_EVENT_CAPACITY);
        let announce = node_events.clone();
        let subscribe_bus = bus.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(identity) = discovered.recv().await {
                subscribe_bus.subscribe_to_peer(&identity.host, identity.pub_port, events_tx.clone());
                let _ = announce.send(identity);
            }
        }));

        info!(
            "mesh node {} ({}) started",
            config.node_name, config.node_id
        );
        Ok(Self {
            config,
            registry,
            bus,
            node_events,
            tasks,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<ServiceRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn bus(&self) -> &ServiceBus {
        &self.bus
    }

    /// Newly discovered peers, one event per first sighting.
    pub fn subscribe_nodes(&self) -> broadcast::Receiver<NodeIdentity> {
        self.node_events.subscribe()
    }

    /// Every local and merged remote service change.
    pub fn subscribe_services(&self) -> broadcast::Receiver<BusEvent> {
        self.registry.subscribe_changes()
    }

    /// Cooperative shutdown: broadcast unregisters for every local service,
    /// then stop all loops.
    pub fn shutdown(&self) {
        self.registry.unregister_all();
        for task in &self.tasks {
            task.abort();
        }
        info!("mesh node {} stopped", self.config.node_name);
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn build_beacon(
    config: &NodeConfig,
    pub_port: u16,
) -> (DiscoveryBeacon, mpsc::Receiver<NodeIdentity>) {
    DiscoveryBeacon::new(
        config.node_id.clone(),
        config.node_name.clone(),
        config.host.clone(),
        pub_port,
        config.announce_port,
        config.broadcast_addr.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn beacon_advertises_the_bound_publish_port() {
        let config = NodeConfig {
            pub_port: 0,
            ..NodeConfig::default()
        };

        let bus = ServiceBus::new();
        let (pub_addr, _serve_task) = bus.serve("127.0.0.1:0").await.unwrap();
        assert_ne!(pub_addr.port(), 0);

        let (beacon, _discovered) = build_beacon(&config, pub_addr.port());
        assert_eq!(beacon.announcement().pub_port, pub_addr.port());
    }
}
