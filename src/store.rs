use crate::registry::{ServiceHealth, ServiceRecord, ServiceStatus, ServiceType};
use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("blob encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS services (
    node_id        TEXT NOT NULL,
    service_type   TEXT NOT NULL,
    service_name   TEXT NOT NULL,
    endpoint       TEXT,
    port           INTEGER,
    protocol       TEXT NOT NULL,
    capabilities   TEXT NOT NULL,
    metadata       TEXT NOT NULL,
    status         TEXT NOT NULL,
    health         TEXT NOT NULL,
    last_heartbeat REAL NOT NULL,
    PRIMARY KEY (node_id, service_type, service_name)
);
";

/// Durable copy of the service registry. Persistence is best-effort: the
/// in-memory registry stays authoritative and keeps operating when any of
/// these calls fail. Rows survive restarts and seed newly started nodes.
pub struct RegistryStore {
    conn: Connection,
}

impl RegistryStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn upsert(&self, record: &ServiceRecord) -> Result<(), StoreError> {
        let capabilities = serde_json::to_string(&record.capabilities)?;
        let metadata = serde_json::to_string(&record.metadata)?;
        self.conn.execute(
            "INSERT INTO services
                (node_id, service_type, service_name, endpoint, port, protocol,
                 capabilities, metadata, status, health, last_heartbeat)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT (node_id, service_type, service_name) DO UPDATE SET
                endpoint = excluded.endpoint,
                port = excluded.port,
                protocol = excluded.protocol,
                capabilities = excluded.capabilities,
                metadata = excluded.metadata,
                status = excluded.status,
                health = excluded.health,
                last_heartbeat = excluded.last_heartbeat",
            params![
                record.node_id,
                record.service_type.as_str(),
                record.service_name,
                record.endpoint,
                record.port.map(i64::from),
                record.protocol,
                capabilities,
                metadata,
                record.status.as_str(),
                record.health.as_str(),
                record.last_heartbeat,
            ],
        )?;
        Ok(())
    }

    pub fn delete(
        &self,
        node_id: &str,
        service_type: ServiceType,
        service_name: &str,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "DELETE FROM services
             WHERE node_id = ?1 AND service_type = ?2 AND service_name = ?3",
            params![node_id, service_type.as_str(), service_name],
        )?;
        Ok(changed > 0)
    }

    /// Mark every row whose heartbeat is older than `ttl_secs` unavailable.
    /// Returns the number of rows expired.
    pub fn expire_stale(&self, ttl_secs: f64, now: f64) -> Result<usize, StoreError> {
        let changed = self.conn.execute(
            "UPDATE services SET status = ?1
             WHERE ?2 - last_heartbeat > ?3 AND status != ?1",
            params![ServiceStatus::Unavailable.as_str(), now, ttl_secs],
        )?;
        Ok(changed)
    }

    pub fn load_all(&self) -> Result<Vec<ServiceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT node_id, service_type, service_name, endpoint, port, protocol,
                    capabilities, metadata, status, health, last_heartbeat
             FROM services",
        )?;
        let rows = stmt.query_map([], |row| {
            let service_type: String = row.get(1)?;
            let capabilities: String = row.get(6)?;
            let metadata: String = row.get(7)?;
            let status: String = row.get(8)?;
            let health: String = row.get(9)?;
            Ok(ServiceRecord {
                node_id: row.get(0)?,
                service_type: ServiceType::parse(&service_type),
                service_name: row.get(2)?,
                endpoint: row.get(3)?,
                port: row.get::<_, Option<i64>>(4)?.map(|p| p as u16),
                protocol: row.get(5)?,
                capabilities: serde_json::from_str(&capabilities).unwrap_or_default(),
                metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                status: ServiceStatus::parse(&status),
                health: ServiceHealth::parse(&health),
                last_heartbeat: row.get(10)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(node_id: &str, name: &str, heartbeat: f64) -> ServiceRecord {
        let mut record = ServiceRecord::new(ServiceType::Transport, name);
        record.node_id = node_id.to_string();
        record.endpoint = Some("192.168.1.10".to_string());
        record.port = Some(9752);
        record.capabilities.insert("sample_rate".to_string(), json!(48_000));
        record.metadata.insert("room".to_string(), json!("control"));
        record.last_heartbeat = heartbeat;
        record
    }

    #[test]
    fn upsert_round_trips_blobs() {
        let store = RegistryStore::open_in_memory().unwrap();
        let original = record("n1", "transport-agent", 100.0);
        store.upsert(&original).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], original);
    }

    #[test]
    fn upsert_is_idempotent_on_key() {
        let store = RegistryStore::open_in_memory().unwrap();
        store.upsert(&record("n1", "transport-agent", 100.0)).unwrap();

        let mut updated = record("n1", "transport-agent", 200.0);
        updated.health = ServiceHealth::Degraded;
        store.upsert(&updated).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].health, ServiceHealth::Degraded);
        assert_eq!(loaded[0].last_heartbeat, 200.0);
    }

    #[test]
    fn expire_stale_marks_only_old_rows() {
        let store = RegistryStore::open_in_memory().unwrap();
        store.upsert(&record("n1", "fresh", 95.0)).unwrap();
        store.upsert(&record("n2", "stale", 50.0)).unwrap();

        // TTL of 20s at t=100: only the t=50 heartbeat is past it.
        let expired = store.expire_stale(20.0, 100.0).unwrap();
        assert_eq!(expired, 1);

        let loaded = store.load_all().unwrap();
        let stale = loaded.iter().find(|r| r.service_name == "stale").unwrap();
        let fresh = loaded.iter().find(|r| r.service_name == "fresh").unwrap();
        assert_eq!(stale.status, ServiceStatus::Unavailable);
        assert_eq!(fresh.status, ServiceStatus::Available);
    }

    #[test]
    fn delete_removes_exactly_one_key() {
        let store = RegistryStore::open_in_memory().unwrap();
        store.upsert(&record("n1", "a", 100.0)).unwrap();
        store.upsert(&record("n1", "b", 100.0)).unwrap();

        assert!(store.delete("n1", ServiceType::Transport, "a").unwrap());
        assert!(!store.delete("n1", ServiceType::Transport, "a").unwrap());
        assert_eq!(store.load_all().unwrap().len(), 1);
    }
}
