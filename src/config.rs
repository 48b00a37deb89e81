use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_ANNOUNCE_PORT: u16 = 9750;
pub const DEFAULT_PUB_PORT: u16 = 9751;

/// Per-node runtime configuration. Every field has a workable default so a
/// bare `NodeConfig::default()` joins the mesh on the standard ports with a
/// generated identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable unique node identity. Generated fresh when absent, which is
    /// fine for ephemeral nodes but loses store seeding across restarts.
    pub node_id: String,
    pub node_name: String,
    /// Address peers should reach this node at.
    pub host: String,
    pub announce_port: u16,
    pub pub_port: u16,
    pub agent_port: u16,
    pub heartbeat_interval_secs: u64,
    pub broadcast_addr: String,
    /// Registry database path. `None` disables persistence entirely.
    pub db_path: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            node_name: default_node_name(),
            host: "127.0.0.1".to_string(),
            announce_port: DEFAULT_ANNOUNCE_PORT,
            pub_port: DEFAULT_PUB_PORT,
            agent_port: crate::coordinator::DEFAULT_AGENT_PORT,
            heartbeat_interval_secs: crate::registry::DEFAULT_HEARTBEAT_INTERVAL_SECS,
            broadcast_addr: "255.255.255.255".to_string(),
            db_path: None,
        }
    }
}

fn default_node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "stagelink-node".to_string())
}
