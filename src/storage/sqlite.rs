//! SQLite-backed flow storage.
//!
//! Persistent variant behind the same `FlowStorage` contract as the
//! in-memory store. Flow bodies and side-car sections are kept as one JSON
//! document per row; the columns that exist serve lookup and eviction.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

use crate::models::flow::{Flow, FlowCompletion};
use crate::models::stats::FlowStats;
use crate::storage::FlowStorage;
use crate::utils::error::AppResult;

/// Flow store persisted to a SQLite database
pub struct SqliteFlowStore {
    conn: Mutex<Connection>,
    capacity: usize,
}

impl SqliteFlowStore {
    /// Open (or create) the database at `path` and prepare the schema.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> AppResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| crate::utils::error::AppError::Io(std::io::Error::other(e)))?;
        let store = Self {
            conn: Mutex::new(conn),
            capacity,
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> AppResult<()> {
        self.conn
            .lock()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS flows (
                    seq      INTEGER PRIMARY KEY AUTOINCREMENT,
                    id       TEXT NOT NULL UNIQUE,
                    start_at TEXT NOT NULL,
                    data     TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS flow_meta (
                    key   TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                 );",
            )
            .map_err(sql_err)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO flow_meta (key, value) VALUES ('start_time', ?1), ('total', '0')",
            params![Utc::now().to_rfc3339()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn meta(&self, conn: &Connection, key: &str) -> Option<String> {
        conn.query_row(
            "SELECT value FROM flow_meta WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .ok()
    }
}

fn sql_err(e: rusqlite::Error) -> crate::utils::error::AppError {
    crate::utils::error::AppError::Io(std::io::Error::other(e))
}

fn decode(data: String) -> Option<Flow> {
    serde_json::from_str(&data).ok()
}

impl FlowStorage for SqliteFlowStore {
    fn add(&self, flow: Flow) {
        let Ok(data) = serde_json::to_string(&flow) else {
            return;
        };
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT OR REPLACE INTO flows (id, start_at, data) VALUES (?1, ?2, ?3)",
            params![flow.id, flow.start_at.to_rfc3339(), data],
        );
        let _ = conn.execute(
            "DELETE FROM flows WHERE seq <= (SELECT MAX(seq) FROM flows) - ?1",
            params![self.capacity as i64],
        );
        let _ = conn.execute(
            "UPDATE flow_meta SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT) WHERE key = 'total'",
            [],
        );
        let _ = conn.execute(
            "INSERT OR REPLACE INTO flow_meta (key, value) VALUES ('last_time', ?1)",
            params![Utc::now().to_rfc3339()],
        );
    }

    fn get_all(&self, limit: i64) -> Vec<Flow> {
        let conn = self.conn.lock();
        let limit = if limit <= 0 { i64::MAX } else { limit };
        let Ok(mut stmt) = conn.prepare(
            "SELECT data FROM (SELECT seq, data FROM flows ORDER BY seq DESC LIMIT ?1)
             ORDER BY seq ASC",
        ) else {
            return Vec::new();
        };
        let rows = stmt.query_map([limit], |row| row.get::<_, String>(0));
        match rows {
            Ok(rows) => rows.flatten().filter_map(decode).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn get_by_id(&self, id: &str) -> Option<Flow> {
        let conn = self.conn.lock();
        conn.query_row("SELECT data FROM flows WHERE id = ?1", [id], |row| {
            row.get::<_, String>(0)
        })
        .ok()
        .and_then(decode)
    }

    fn complete(&self, id: &str, completion: FlowCompletion) -> bool {
        let Some(mut flow) = self.get_by_id(id) else {
            return false;
        };
        flow.end_at = completion.end_at;
        flow.latency_ms = completion.latency_ms;
        if completion.response.is_some() {
            flow.response = completion.response;
        }
        if completion.performance.is_some() {
            flow.performance = completion.performance;
        }
        if completion.tls.is_some() {
            flow.tls = completion.tls;
        }
        if completion.error.is_some() {
            flow.error = completion.error;
        }
        if completion.content.is_some() {
            flow.content = completion.content;
        }

        let Ok(data) = serde_json::to_string(&flow) else {
            return false;
        };
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE flows SET data = ?1 WHERE id = ?2",
            params![data, id],
        )
        .map(|n| n > 0)
        .unwrap_or(false)
    }

    fn clear(&self) {
        let conn = self.conn.lock();
        let _ = conn.execute("DELETE FROM flows", []);
        let _ = conn.execute(
            "UPDATE flow_meta SET value = '0' WHERE key = 'total'",
            [],
        );
        let _ = conn.execute(
            "INSERT OR REPLACE INTO flow_meta (key, value) VALUES ('start_time', ?1)",
            params![Utc::now().to_rfc3339()],
        );
        let _ = conn.execute("DELETE FROM flow_meta WHERE key = 'last_time'", []);
    }

    fn get_stats(&self) -> FlowStats {
        let conn = self.conn.lock();
        let parse = |s: String| DateTime::parse_from_rfc3339(&s).ok().map(|t| t.with_timezone(&Utc));
        FlowStats {
            total: self
                .meta(&conn, "total")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            start_time: self.meta(&conn, "start_time").and_then(parse),
            last_time: self.meta(&conn, "last_time").and_then(parse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::flow::HttpRequestInfo;

    fn flow(id: &str) -> Flow {
        Flow {
            id: id.to_string(),
            scheme: "http".into(),
            remote_addr: "127.0.0.1:1".into(),
            start_at: Utc::now(),
            end_at: None,
            latency_ms: None,
            request: HttpRequestInfo::default(),
            response: None,
            performance: None,
            tls: None,
            error: None,
            content: None,
            network: None,
        }
    }

    fn temp_store(capacity: usize) -> SqliteFlowStore {
        let path = std::env::temp_dir().join(format!(
            "cetiprobe-test-{}.db",
            uuid::Uuid::new_v4()
        ));
        SqliteFlowStore::open(path, capacity).unwrap()
    }

    #[test]
    fn round_trips_flows() {
        let store = temp_store(100);
        store.add(flow("a"));
        assert!(store.get_by_id("a").is_some());
        assert_eq!(store.get_all(0).len(), 1);
        assert_eq!(store.get_stats().total, 1);
    }

    #[test]
    fn evicts_beyond_capacity() {
        let store = temp_store(2);
        store.add(flow("a"));
        store.add(flow("b"));
        store.add(flow("c"));
        assert!(store.get_by_id("a").is_none());
        assert_eq!(store.get_all(0).len(), 2);
        assert_eq!(store.get_stats().total, 3);
    }

    #[test]
    fn clear_resets_counters() {
        let store = temp_store(10);
        store.add(flow("a"));
        store.clear();
        let stats = store.get_stats();
        assert_eq!(stats.total, 0);
        assert!(stats.last_time.is_none());
        assert!(store.get_all(0).is_empty());
    }
}
