use stagelink::bus::ServiceBus;
use stagelink::clock::wall_clock;
use stagelink::config::NodeConfig;
use stagelink::node::MeshNode;
use stagelink::registry::{ServiceHealth, ServiceRecord, ServiceRegistry, ServiceStatus, ServiceType};
use stagelink::store::RegistryStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("stagelink-test-{}.db", uuid::Uuid::new_v4()))
}

fn registry_with_store(node_id: &str, store: RegistryStore) -> ServiceRegistry {
    ServiceRegistry::new(
        node_id.to_string(),
        Duration::from_secs(10),
        ServiceBus::new(),
        Some(store),
        Arc::new(Mutex::new(HashMap::new())),
    )
}

#[test]
fn registrations_survive_a_registry_restart() {
    let path = temp_db_path();

    {
        let registry = registry_with_store("node-a", RegistryStore::open(&path).unwrap());
        let mut record = ServiceRecord::new(ServiceType::Transport, "transport-agent");
        record.port = Some(9752);
        record
            .capabilities
            .insert("sample_rate".to_string(), serde_json::json!(48_000));
        registry.register_service(record).unwrap();
    }

    // Fresh registry on the same database: own rows come back authoritative.
    let restarted = registry_with_store("node-a", RegistryStore::open(&path).unwrap());
    let services = restarted.get_all_services();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].service_name, "transport-agent");
    assert_eq!(services[0].port, Some(9752));
    assert_eq!(
        services[0].capabilities["sample_rate"],
        serde_json::json!(48_000)
    );

    std::fs::remove_file(&path).ok();
}

#[test]
fn other_nodes_rows_seed_the_cluster_cache() {
    let path = temp_db_path();

    {
        let store = RegistryStore::open(&path).unwrap();
        let mut foreign = ServiceRecord::new(ServiceType::Video, "player");
        foreign.node_id = "node-b".to_string();
        foreign.last_heartbeat = wall_clock();
        store.upsert(&foreign).unwrap();
    }

    let registry = registry_with_store("node-a", RegistryStore::open(&path).unwrap());
    let services = registry.get_all_services();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].node_id, "node-b");

    // Cached, not owned: a heartbeat pass republishes nothing for it.
    registry.heartbeat_once();
    assert_eq!(registry.stats().heartbeats_sent, 0);

    std::fs::remove_file(&path).ok();
}

#[test]
fn cleanup_expires_stale_rows_in_the_store_too() {
    let path = temp_db_path();
    let now = wall_clock();

    {
        let store = RegistryStore::open(&path).unwrap();
        let mut stale = ServiceRecord::new(ServiceType::Deploy, "updater");
        stale.node_id = "node-b".to_string();
        stale.last_heartbeat = now - 120.0;
        store.upsert(&stale).unwrap();
    }

    let registry = registry_with_store("node-a", RegistryStore::open(&path).unwrap());
    registry.cleanup_once(now);

    let rows = RegistryStore::open(&path).unwrap().load_all().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ServiceStatus::Unavailable);

    std::fs::remove_file(&path).ok();
}

#[test]
fn unregister_removes_the_persisted_row() {
    let path = temp_db_path();

    {
        let registry = registry_with_store("node-a", RegistryStore::open(&path).unwrap());
        registry
            .register_service(ServiceRecord::new(ServiceType::Transport, "agent"))
            .unwrap();
        registry.unregister_service("agent").unwrap();
    }

    // A restart must not resurrect the unregistered service.
    let rows = RegistryStore::open(&path).unwrap().load_all().unwrap();
    assert!(rows.is_empty());
    let restarted = registry_with_store("node-a", RegistryStore::open(&path).unwrap());
    assert!(restarted.get_all_services().is_empty());

    std::fs::remove_file(&path).ok();
}

#[test]
fn health_updates_are_persisted() {
    let path = temp_db_path();

    {
        let registry = registry_with_store("node-a", RegistryStore::open(&path).unwrap());
        registry
            .register_service(ServiceRecord::new(ServiceType::Transport, "agent"))
            .unwrap();
        registry
            .update_health("agent", ServiceHealth::Degraded)
            .unwrap();
    }

    let rows = RegistryStore::open(&path).unwrap().load_all().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].health, ServiceHealth::Degraded);

    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn mesh_node_starts_registers_and_shuts_down() {
    // Ephemeral ports so parallel test runs never collide.
    let config = NodeConfig {
        node_name: "test-node".to_string(),
        announce_port: 0,
        pub_port: 0,
        ..NodeConfig::default()
    };
    let node = MeshNode::start(config).await.unwrap();

    node.registry()
        .register_service(ServiceRecord::new(ServiceType::Transport, "transport-agent"))
        .unwrap();
    assert_eq!(node.registry().get_all_services().len(), 1);
    assert!(node.registry().get_known_nodes().is_empty());

    node.shutdown();
    assert!(node.registry().get_all_services().is_empty());
}
