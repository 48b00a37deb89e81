use crate::clock::{wall_clock, TransportSnapshot};
use crate::protocol::{Datagram, StateReply, TransportCommand, MAX_DATAGRAM_SIZE};
use crate::registry::{ServiceRegistry, ServiceType};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default agent control port, used when `add_agent` gets no explicit port.
pub const DEFAULT_AGENT_PORT: u16 = 9752;

/// One roster entry per agent, keyed `host:port`. State is whatever the last
/// attributed reply carried; replies are unauthenticated and never
/// guaranteed fresh.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentEntry {
    pub host: String,
    pub port: u16,
    pub display_name: String,
    pub node_id: Option<String>,
    pub last_state: Option<TransportSnapshot>,
    pub reachable: bool,
}

impl AgentEntry {
    fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

type Roster = Arc<Mutex<HashMap<String, AgentEntry>>>;

fn lock_roster(roster: &Roster) -> MutexGuard<'_, HashMap<String, AgentEntry>> {
    roster.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fans identical scheduled commands out to a roster of agents. Sends are
/// independent and fire-and-forget: a per-agent failure is logged and the
/// fan-out continues; there is no retry, no delivery confirmation, and no
/// rollback if only some agents receive a command.
pub struct TransportCoordinator {
    socket: Arc<UdpSocket>,
    roster: Roster,
    local_addr: SocketAddr,
    listener: JoinHandle<()>,
}

impl TransportCoordinator {
    /// Bind an ephemeral UDP socket for sending commands and receiving
    /// `/transport/state` replies.
    pub async fn bind() -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let local_addr = socket.local_addr()?;
        let roster: Roster = Arc::new(Mutex::new(HashMap::new()));

        let listener = tokio::spawn(run_reply_listener(Arc::clone(&socket), Arc::clone(&roster)));

        Ok(Self {
            socket,
            roster,
            local_addr,
            listener,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Idempotent: re-adding `host:port` refreshes the display name and
    /// keeps any previously learned state.
    pub fn add_agent(&self, host: &str, port: Option<u16>, display_name: Option<&str>) {
        let entry = AgentEntry {
            host: host.to_string(),
            port: port.unwrap_or(DEFAULT_AGENT_PORT),
            display_name: display_name.unwrap_or(host).to_string(),
            node_id: None,
            last_state: None,
            reachable: false,
        };
        let key = entry.key();

        let mut roster = lock_roster(&self.roster);
        match roster.get_mut(&key) {
            Some(existing) => {
                existing.display_name = entry.display_name;
            }
            None => {
                info!("added agent {} ({})", key, entry.display_name);
                roster.insert(key, entry);
            }
        }
    }

    /// Populate the roster from the registry's transport services. Only
    /// records carrying an endpoint can be added; the rest are skipped with
    /// a warning. Returns how many entries were added or refreshed.
    pub fn add_registered_agents(&self, registry: &ServiceRegistry) -> usize {
        let mut added = 0;
        for record in registry.get_services_by_type(ServiceType::Transport) {
            let Some(host) = &record.endpoint else {
                warn!("transport service {} has no endpoint, skipped", record.key());
                continue;
            };
            self.add_agent(host, record.port, Some(&record.service_name));
            added += 1;
        }
        added
    }

    pub fn remove_agent(&self, host: &str, port: Option<u16>) -> bool {
        let key = format!("{}:{}", host, port.unwrap_or(DEFAULT_AGENT_PORT));
        lock_roster(&self.roster).remove(&key).is_some()
    }

    pub fn clear_agents(&self) {
        lock_roster(&self.roster).clear();
    }

    pub fn agents(&self) -> Vec<AgentEntry> {
        let mut agents: Vec<AgentEntry> = lock_roster(&self.roster).values().cloned().collect();
        agents.sort_by(|a, b| a.key().cmp(&b.key()));
        agents
    }

    /// Schedule a synchronized start `pre_roll_seconds` from now on every
    /// agent. Returns how many sends succeeded.
    pub async fn start_all(&self, pre_roll_seconds: f64) -> usize {
        let target = wall_clock() + pre_roll_seconds;
        self.fan_out(TransportCommand::Start {
            target_time: Some(target),
        })
        .await
    }

    /// `pre_roll_seconds > 0` schedules the stop; zero sends an immediate
    /// stop with no timestamp argument.
    pub async fn stop_all(&self, pre_roll_seconds: f64) -> usize {
        let target_time = if pre_roll_seconds > 0.0 {
            Some(wall_clock() + pre_roll_seconds)
        } else {
            None
        };
        self.fan_out(TransportCommand::Stop { target_time }).await
    }

    pub async fn locate_all(&self, frame: u64) -> usize {
        self.fan_out(TransportCommand::Locate { frame }).await
    }

    pub async fn locate_and_start_all(&self, frame: u64, pre_roll_seconds: f64) -> usize {
        let target_time = wall_clock() + pre_roll_seconds;
        self.fan_out(TransportCommand::LocateStart { frame, target_time })
            .await
    }

    /// Broadcast a query; replies arrive asynchronously on the listener and
    /// update roster entries as they come in.
    pub async fn query_all(&self) -> usize {
        self.fan_out(TransportCommand::Query).await
    }

    async fn fan_out(&self, command: TransportCommand) -> usize {
        let payload = match command.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("command encode failed: {}", e);
                return 0;
            }
        };

        let targets: Vec<(String, String)> = lock_roster(&self.roster)
            .values()
            .map(|entry| (entry.key(), format!("{}:{}", entry.host, entry.port)))
            .collect();

        let mut sent = 0;
        for (key, addr) in targets {
            match self.socket.send_to(payload.as_bytes(), &addr).await {
                Ok(_) => {
                    debug!("sent {} to {}", command.to_datagram().address, addr);
                    sent += 1;
                }
                Err(e) => {
                    warn!("send to agent {} failed: {}", key, e);
                    if let Some(entry) = lock_roster(&self.roster).get_mut(&key) {
                        entry.reachable = false;
                    }
                }
            }
        }
        sent
    }

    pub fn shutdown(&self) {
        self.listener.abort();
    }
}

impl Drop for TransportCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Receive `/transport/state` replies and attribute each to a single roster
/// entry: by the `node_id` the reply carries, or failing that by the
/// sender's address (which then teaches us that entry's node id).
async fn run_reply_listener(socket: Arc<UdpSocket>, roster: Roster) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE + 1];
    loop {
        let (len, sender) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("reply listener receive error: {}", e);
                continue;
            }
        };

        let reply = match Datagram::decode(&buf[..len]).and_then(|d| StateReply::from_datagram(&d))
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!("unrecognized reply from {}: {}", sender, e);
                continue;
            }
        };

        apply_reply(&roster, &reply, sender);
    }
}

fn apply_reply(roster: &Roster, reply: &StateReply, sender: SocketAddr) {
    let snapshot = TransportSnapshot {
        state: reply.state,
        frame: reply.frame,
        timestamp: reply.timestamp,
    };

    let mut roster = lock_roster(roster);
    let key = roster
        .iter()
        .find(|(_, entry)| entry.node_id.as_deref() == Some(reply.node_id.as_str()))
        .or_else(|| {
            roster
                .iter()
                .find(|(_, entry)| entry.node_id.is_none() && agent_matches_sender(entry, sender))
        })
        .map(|(key, _)| key.clone());

    let Some(entry) = key.and_then(|key| roster.get_mut(&key)) else {
        warn!(
            "state reply from unrostered agent {} ({})",
            reply.node_id, sender
        );
        return;
    };

    entry.node_id = Some(reply.node_id.clone());
    entry.last_state = Some(snapshot);
    entry.reachable = true;
    debug!(
        "agent {} reported {} at frame {}",
        entry.display_name,
        reply.state.as_str(),
        reply.frame
    );
}

fn agent_matches_sender(entry: &AgentEntry, sender: SocketAddr) -> bool {
    match format!("{}:{}", entry.host, entry.port).parse::<SocketAddr>() {
        Ok(addr) => addr.ip() == sender.ip(),
        // Hostname entries can't be compared without a lookup; accept the
        // node_id binding on first reply instead.
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TransportState;

    fn entry(host: &str, port: u16) -> AgentEntry {
        AgentEntry {
            host: host.to_string(),
            port,
            display_name: host.to_string(),
            node_id: None,
            last_state: None,
            reachable: false,
        }
    }

    fn reply(node_id: &str) -> StateReply {
        StateReply {
            state: TransportState::Rolling,
            frame: 48_000,
            timestamp: 100.0,
            node_id: node_id.to_string(),
        }
    }

    #[test]
    fn reply_attributes_to_matching_node_id_only() {
        let roster: Roster = Arc::new(Mutex::new(HashMap::new()));
        {
            let mut guard = lock_roster(&roster);
            let mut a = entry("10.0.0.1", 9752);
            a.node_id = Some("node-a".to_string());
            let mut b = entry("10.0.0.2", 9752);
            b.node_id = Some("node-b".to_string());
            guard.insert(a.key(), a);
            guard.insert(b.key(), b);
        }

        let sender: SocketAddr = "10.0.0.1:9752".parse().unwrap();
        apply_reply(&roster, &reply("node-b"), sender);

        let guard = lock_roster(&roster);
        assert!(guard["10.0.0.1:9752"].last_state.is_none());
        let b = &guard["10.0.0.2:9752"];
        assert!(b.reachable);
        assert_eq!(b.last_state.unwrap().frame, 48_000);
    }

    #[test]
    fn node_id_match_wins_over_address_fallback() {
        let roster: Roster = Arc::new(Mutex::new(HashMap::new()));
        {
            let mut guard = lock_roster(&roster);
            // Unbound entry whose address matches the sender.
            let a = entry("10.0.0.1", 9752);
            // Entry already bound to the replying node, at a different address.
            let mut b = entry("10.0.0.2", 9752);
            b.node_id = Some("node-b".to_string());
            guard.insert(a.key(), a);
            guard.insert(b.key(), b);
        }

        let sender: SocketAddr = "10.0.0.1:9752".parse().unwrap();
        apply_reply(&roster, &reply("node-b"), sender);

        let guard = lock_roster(&roster);
        assert!(guard["10.0.0.1:9752"].node_id.is_none());
        assert!(guard["10.0.0.1:9752"].last_state.is_none());
        assert_eq!(guard["10.0.0.2:9752"].last_state.unwrap().frame, 48_000);
    }

    #[tokio::test]
    async fn roster_fills_from_registry_transport_services() {
        use crate::bus::ServiceBus;
        use crate::registry::{ServiceRecord, ServiceRegistry};
        use std::time::Duration;

        let registry = ServiceRegistry::new(
            "self".to_string(),
            Duration::from_secs(10),
            ServiceBus::new(),
            None,
            Arc::new(Mutex::new(HashMap::new())),
        );
        let mut with_endpoint = ServiceRecord::new(ServiceType::Transport, "stage-left");
        with_endpoint.endpoint = Some("192.168.1.10".to_string());
        with_endpoint.port = Some(9800);
        registry.register_service(with_endpoint).unwrap();
        // No endpoint: not routable, skipped.
        registry
            .register_service(ServiceRecord::new(ServiceType::Transport, "unroutable"))
            .unwrap();

        let coordinator = TransportCoordinator::bind().await.unwrap();
        assert_eq!(coordinator.add_registered_agents(&registry), 1);

        let agents = coordinator.agents();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].host, "192.168.1.10");
        assert_eq!(agents[0].port, 9800);
        assert_eq!(agents[0].display_name, "stage-left");
    }

    #[test]
    fn first_reply_binds_node_id_by_sender_address() {
        let roster: Roster = Arc::new(Mutex::new(HashMap::new()));
        {
            let mut guard = lock_roster(&roster);
            let a = entry("10.0.0.1", 9752);
            guard.insert(a.key(), a);
        }

        let sender: SocketAddr = "10.0.0.1:9752".parse().unwrap();
        apply_reply(&roster, &reply("node-a"), sender);

        let guard = lock_roster(&roster);
        let a = &guard["10.0.0.1:9752"];
        assert_eq!(a.node_id.as_deref(), Some("node-a"));
        assert_eq!(a.last_state.unwrap().state, TransportState::Rolling);
    }
}
