use crate::bus::ServiceBus;
use crate::clock::wall_clock;
use crate::discovery::{NodeIdentity, SharedNodes};
use crate::protocol::{BusAction, BusEvent, ProtocolError};
use crate::store::{RegistryStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default interval between liveness re-announcements of local services.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;

/// The cleanup sweep runs on its own fixed period, independent of the
/// heartbeat interval.
pub const CLEANUP_PERIOD_SECS: u64 = 60;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("unknown service: {0}")]
    UnknownService(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Transport,
    Video,
    Chat,
    Deploy,
    Gui,
    Other,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Transport => "transport",
            ServiceType::Video => "video",
            ServiceType::Chat => "chat",
            ServiceType::Deploy => "deploy",
            ServiceType::Gui => "gui",
            ServiceType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "transport" => ServiceType::Transport,
            "video" => ServiceType::Video,
            "chat" => ServiceType::Chat,
            "deploy" => ServiceType::Deploy,
            "gui" => ServiceType::Gui,
            _ => ServiceType::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Available,
    Busy,
    Unavailable,
    Maintenance,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Available => "available",
            ServiceStatus::Busy => "busy",
            ServiceStatus::Unavailable => "unavailable",
            ServiceStatus::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "available" => ServiceStatus::Available,
            "busy" => ServiceStatus::Busy,
            "maintenance" => ServiceStatus::Maintenance,
            _ => ServiceStatus::Unavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl ServiceHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceHealth::Healthy => "healthy",
            ServiceHealth::Degraded => "degraded",
            ServiceHealth::Unhealthy => "unhealthy",
            ServiceHealth::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "healthy" => ServiceHealth::Healthy,
            "degraded" => ServiceHealth::Degraded,
            "unhealthy" => ServiceHealth::Unhealthy,
            _ => ServiceHealth::Unknown,
        }
    }
}

/// One service offered by one node. Unique key is
/// `(node_id, service_type, service_name)`; the owning node is authoritative
/// and peers hold only cached, TTL-expired copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub node_id: String,
    pub service_type: ServiceType,
    pub service_name: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    pub protocol: String,
    #[serde(default)]
    pub capabilities: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub status: ServiceStatus,
    pub health: ServiceHealth,
    #[serde(default)]
    pub last_heartbeat: f64,
}

impl ServiceRecord {
    pub fn new(service_type: ServiceType, service_name: &str) -> Self {
        Self {
            node_id: String::new(),
            service_type,
            service_name: service_name.to_string(),
            endpoint: None,
            port: None,
            protocol: "udp".to_string(),
            capabilities: HashMap::new(),
            metadata: HashMap::new(),
            status: ServiceStatus::Available,
            health: ServiceHealth::Unknown,
            last_heartbeat: 0.0,
        }
    }

    /// Cache key within one node's record set.
    pub fn key(&self) -> String {
        format!("{}/{}", self.service_type.as_str(), self.service_name)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub registered: u32,
    pub unregistered: u32,
    pub heartbeats_sent: u32,
    pub remote_events_merged: u32,
    pub records_expired: u32,
}

type LocalServices = Mutex<HashMap<String, ServiceRecord>>;
type ClusterServices = Mutex<HashMap<String, HashMap<String, ServiceRecord>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-memory service registry with optional durable store. Local services
/// are authoritative and republished every heartbeat interval; remote
/// services are cached per node and marked unavailable once their heartbeat
/// exceeds twice that interval.
pub struct ServiceRegistry {
    node_id: String,
    heartbeat_interval: Duration,
    local: LocalServices,
    cluster: ClusterServices,
    known_nodes: SharedNodes,
    bus: ServiceBus,
    store: Option<Mutex<RegistryStore>>,
    changes: broadcast::Sender<BusEvent>,
    stats: Mutex<RegistryStats>,
}

impl ServiceRegistry {
    pub fn new(
        node_id: String,
        heartbeat_interval: Duration,
        bus: ServiceBus,
        store: Option<RegistryStore>,
        known_nodes: SharedNodes,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let registry = Self {
            node_id,
            heartbeat_interval,
            local: Mutex::new(HashMap::new()),
            cluster: Mutex::new(HashMap::new()),
            known_nodes,
            bus,
            store: store.map(Mutex::new),
            changes,
            stats: Mutex::new(RegistryStats::default()),
        };
        registry.seed_from_store();
        registry
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Service-change feed for presentation layers: every local mutation and
    /// every merged remote event.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<BusEvent> {
        self.changes.subscribe()
    }

    pub fn stats(&self) -> RegistryStats {
        *lock(&self.stats)
    }

    /// Restore persisted rows: our own rows become local authoritative
    /// records again, everyone else's seed the cluster cache.
    fn seed_from_store(&self) {
        let Some(store) = &self.store else { return };
        let records = match lock(store).load_all() {
            Ok(records) => records,
            Err(e) => {
                warn!("registry store seed failed: {}", e);
                return;
            }
        };
        if records.is_empty() {
            return;
        }

        let mut local = lock(&self.local);
        let mut cluster = lock(&self.cluster);
        let mut seeded = 0usize;
        for record in records {
            if record.node_id == self.node_id {
                local.insert(record.key(), record);
            } else {
                cluster
                    .entry(record.node_id.clone())
                    .or_default()
                    .insert(record.key(), record);
            }
            seeded += 1;
        }
        info!("seeded {} services from store", seeded);
    }

    fn persist(&self, record: &ServiceRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = lock(store).upsert(record) {
                // In-memory state stays authoritative; persistence is
                // best-effort only.
                warn!("registry persist failed for {}: {}", record.key(), e);
            }
        }
    }

    fn delete_persisted(&self, record: &ServiceRecord) {
        if let Some(store) = &self.store {
            if let Err(e) =
                lock(store).delete(&record.node_id, record.service_type, &record.service_name)
            {
                warn!("registry store delete failed for {}: {}", record.key(), e);
            }
        }
    }

    fn announce(&self, action: BusAction, record: &ServiceRecord) -> Result<(), RegistryError> {
        let event = BusEvent {
            action,
            service: record.clone(),
            timestamp: wall_clock(),
        };
        self.bus.publish(&event)?;
        let _ = self.changes.send(event);
        Ok(())
    }

    /// Insert or update one of this node's own services and announce it.
    /// Registering the same `(type, name)` twice keeps exactly one record
    /// with the latest field values.
    pub fn register_service(&self, mut record: ServiceRecord) -> Result<(), RegistryError> {
        record.node_id = self.node_id.clone();
        record.last_heartbeat = wall_clock();

        lock(&self.local).insert(record.key(), record.clone());
        self.persist(&record);
        self.announce(BusAction::Registered, &record)?;
        lock(&self.stats).registered += 1;
        info!("registered service {}", record.key());
        Ok(())
    }

    /// Mark a local service unavailable, persist that, announce the removal,
    /// then drop both the local entry and its persisted row. Returns how many
    /// records matched the name.
    pub fn unregister_service(&self, service_name: &str) -> Result<usize, RegistryError> {
        let matching: Vec<ServiceRecord> = lock(&self.local)
            .values()
            .filter(|r| r.service_name == service_name)
            .cloned()
            .collect();

        for mut record in matching.iter().cloned() {
            record.status = ServiceStatus::Unavailable;
            self.persist(&record);
            self.announce(BusAction::Unregistered, &record)?;
            lock(&self.local).remove(&record.key());
            self.delete_persisted(&record);
            lock(&self.stats).unregistered += 1;
            info!("unregistered service {}", record.key());
        }
        Ok(matching.len())
    }

    /// Best-effort unregister broadcast for every local service, used during
    /// cooperative shutdown.
    pub fn unregister_all(&self) {
        let names: Vec<String> = lock(&self.local)
            .values()
            .map(|r| r.service_name.clone())
            .collect();
        for name in names {
            if let Err(e) = self.unregister_service(&name) {
                warn!("shutdown unregister of {} failed: {}", name, e);
            }
        }
    }

    pub fn update_health(
        &self,
        service_name: &str,
        health: ServiceHealth,
    ) -> Result<(), RegistryError> {
        let updated: Vec<ServiceRecord> = {
            let mut local = lock(&self.local);
            let mut updated = Vec::new();
            for record in local.values_mut() {
                if record.service_name == service_name {
                    record.health = health;
                    record.last_heartbeat = wall_clock();
                    updated.push(record.clone());
                }
            }
            updated
        };
        if updated.is_empty() {
            return Err(RegistryError::UnknownService(service_name.to_string()));
        }
        for record in &updated {
            self.persist(record);
            self.announce(BusAction::HealthUpdate, record)?;
        }
        Ok(())
    }

    /// Merge one event received from a peer's bus into the cluster cache.
    /// The owning node is authoritative: we only cache, refresh, and remove.
    pub fn apply_remote_event(&self, event: BusEvent) {
        if event.service.node_id == self.node_id {
            // Own events echoed back through a peer loop are not remote state.
            return;
        }

        let node_id = event.service.node_id.clone();
        let key = event.service.key();
        match event.action {
            BusAction::Unregistered => {
                let mut cluster = lock(&self.cluster);
                if let Some(services) = cluster.get_mut(&node_id) {
                    services.remove(&key);
                }
                debug!("remote service {} unregistered by {}", key, node_id);
            }
            _ => {
                let mut record = event.service.clone();
                record.last_heartbeat = wall_clock();
                lock(&self.cluster)
                    .entry(node_id)
                    .or_default()
                    .insert(key, record);
            }
        }
        lock(&self.stats).remote_events_merged += 1;
        let _ = self.changes.send(event);
    }

    /// One heartbeat pass: republish and repersist every local service
    /// unchanged, refreshing remote TTL clocks.
    pub fn heartbeat_once(&self) {
        let records: Vec<ServiceRecord> = {
            let mut local = lock(&self.local);
            let now = wall_clock();
            for record in local.values_mut() {
                record.last_heartbeat = now;
            }
            local.values().cloned().collect()
        };

        for record in &records {
            self.persist(record);
            if let Err(e) = self.announce(BusAction::Heartbeat, record) {
                warn!("heartbeat publish failed for {}: {}", record.key(), e);
            }
        }
        lock(&self.stats).heartbeats_sent += records.len() as u32;
    }

    /// One cleanup pass at time `now`: any cached or persisted service whose
    /// heartbeat is older than `2 x heartbeat_interval` is marked
    /// unavailable.
    pub fn cleanup_once(&self, now: f64) {
        let ttl = self.heartbeat_interval.as_secs_f64() * 2.0;
        let mut expired = 0u32;

        {
            let mut cluster = lock(&self.cluster);
            for services in cluster.values_mut() {
                for record in services.values_mut() {
                    if now - record.last_heartbeat > ttl
                        && record.status != ServiceStatus::Unavailable
                    {
                        record.status = ServiceStatus::Unavailable;
                        expired += 1;
                    }
                }
            }
        }

        if let Some(store) = &self.store {
            match lock(store).expire_stale(ttl, now) {
                Ok(count) => expired = expired.max(count as u32),
                Err(e) => warn!("registry store cleanup failed: {}", e),
            }
        }

        if expired > 0 {
            info!("marked {} stale services unavailable", expired);
            lock(&self.stats).records_expired += expired;
        }
    }

    /// All known services, local and cached remote. Pure cache read.
    pub fn get_all_services(&self) -> Vec<ServiceRecord> {
        let mut services: Vec<ServiceRecord> = lock(&self.local).values().cloned().collect();
        for node_services in lock(&self.cluster).values() {
            services.extend(node_services.values().cloned());
        }
        services
    }

    pub fn get_services_by_type(&self, service_type: ServiceType) -> Vec<ServiceRecord> {
        self.get_all_services()
            .into_iter()
            .filter(|r| r.service_type == service_type)
            .collect()
    }

    /// Peers currently in the discovery table. Pure cache read.
    pub fn get_known_nodes(&self) -> Vec<NodeIdentity> {
        self.known_nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Start the heartbeat loop, the cleanup loop, and the remote-event
    /// merge loop.
    pub fn spawn_loops(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<BusEvent>,
    ) -> Vec<JoinHandle<()>> {
        let heartbeat = Arc::clone(self);
        let heartbeat_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(heartbeat.heartbeat_interval).await;
                heartbeat.heartbeat_once();
            }
        });

        let cleanup = Arc::clone(self);
        let cleanup_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(CLEANUP_PERIOD_SECS)).await;
                cleanup.cleanup_once(wall_clock());
            }
        });

        let merge = Arc::clone(self);
        let merge_task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                merge.apply_remote_event(event);
            }
        });

        vec![heartbeat_task, cleanup_task, merge_task]
    }
}
