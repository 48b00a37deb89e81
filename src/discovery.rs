use crate::clock::wall_clock;
use crate::protocol::Announcement;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How often each node announces itself to the subnet.
pub const BEACON_PERIOD_SECS: u64 = 5;

const RECV_BUFFER_SIZE: usize = 2048;

/// A peer sighted on the announce port. Never explicitly deleted; consumers
/// age entries out by `last_seen` (the registry's TTL does this for
/// services, node rows just go stale).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub name: String,
    pub host: String,
    pub announce_port: u16,
    pub pub_port: u16,
    pub last_seen: f64,
}

pub type SharedNodes = Arc<Mutex<HashMap<String, NodeIdentity>>>;

fn lock_nodes(nodes: &SharedNodes) -> MutexGuard<'_, HashMap<String, NodeIdentity>> {
    nodes.lock().unwrap_or_else(|e| e.into_inner())
}

/// UDP self-announcement beacon. Broadcasts this node's identity every
/// [`BEACON_PERIOD_SECS`] and maintains the live `known_nodes` table from
/// peer broadcasts. First sightings are handed to the discovery channel;
/// repeat sightings only refresh `last_seen`.
pub struct DiscoveryBeacon {
    node_id: String,
    node_name: String,
    host: String,
    pub_port: u16,
    announce_port: u16,
    broadcast_addr: String,
    known: SharedNodes,
    discovered: mpsc::Sender<NodeIdentity>,
}

impl DiscoveryBeacon {
    pub fn new(
        node_id: String,
        node_name: String,
        host: String,
        pub_port: u16,
        announce_port: u16,
        broadcast_addr: String,
    ) -> (Self, mpsc::Receiver<NodeIdentity>) {
        let (discovered, discovered_rx) = mpsc::channel(64);
        let beacon = Self {
            node_id,
            node_name,
            host,
            pub_port,
            announce_port,
            broadcast_addr,
            known: Arc::new(Mutex::new(HashMap::new())),
            discovered,
        };
        (beacon, discovered_rx)
    }

    /// Shared handle to the known-nodes table, for registry accessors.
    pub fn known_nodes(&self) -> SharedNodes {
        Arc::clone(&self.known)
    }

    pub(crate) fn announcement(&self) -> Announcement {
        Announcement {
            node_id: self.node_id.clone(),
            node_name: self.node_name.clone(),
            host: self.host.clone(),
            pub_port: self.pub_port,
            timestamp: wall_clock(),
        }
    }

    /// Fold one received announcement into the known-nodes table.
    /// Returns the new identity on first sighting, `None` for self-originated
    /// packets and repeat sightings (which only refresh `last_seen`).
    pub fn observe(&self, announcement: Announcement) -> Option<NodeIdentity> {
        if announcement.node_id == self.node_id {
            return None;
        }

        let mut known = lock_nodes(&self.known);
        let now = wall_clock();
        if let Some(existing) = known.get_mut(&announcement.node_id) {
            existing.last_seen = now;
            existing.name = announcement.node_name;
            existing.host = announcement.host;
            existing.pub_port = announcement.pub_port;
            return None;
        }

        let identity = NodeIdentity {
            node_id: announcement.node_id.clone(),
            name: announcement.node_name,
            host: announcement.host,
            announce_port: self.announce_port,
            pub_port: announcement.pub_port,
            last_seen: now,
        };
        known.insert(announcement.node_id, identity.clone());
        Some(identity)
    }

    /// Start the broadcast and listen loops. The listen socket binds the
    /// well-known announce port; the broadcast socket is ephemeral.
    pub async fn spawn(self) -> std::io::Result<Vec<JoinHandle<()>>> {
        let listen_socket = UdpSocket::bind(("0.0.0.0", self.announce_port)).await?;
        let send_socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        send_socket.set_broadcast(true)?;

        let target = format!("{}:{}", self.broadcast_addr, self.announce_port);
        let beacon = Arc::new(self);

        let broadcaster = Arc::clone(&beacon);
        let broadcast_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(BEACON_PERIOD_SECS));
            loop {
                interval.tick().await;
                match broadcaster.announcement().encode() {
                    Ok(payload) => {
                        if let Err(e) = send_socket.send_to(payload.as_bytes(), &target).await {
                            warn!("discovery broadcast failed: {}", e);
                        }
                    }
                    Err(e) => warn!("discovery announcement encode failed: {}", e),
                }
            }
        });

        let listener = Arc::clone(&beacon);
        let listen_task = tokio::spawn(async move {
            let mut buf = [0u8; RECV_BUFFER_SIZE];
            loop {
                match listen_socket.recv_from(&mut buf).await {
                    Ok((len, from)) => match Announcement::decode(&buf[..len]) {
                        Ok(announcement) => {
                            if let Some(identity) = listener.observe(announcement) {
                                info!(
                                    "discovered node {} ({}) at {}",
                                    identity.name, identity.node_id, identity.host
                                );
                                if listener.discovered.send(identity).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) => warn!("malformed announcement from {}: {}", from, e),
                    },
                    Err(e) => {
                        warn!("discovery receive error: {}", e);
                    }
                }
            }
        });

        Ok(vec![broadcast_task, listen_task])
    }
}
