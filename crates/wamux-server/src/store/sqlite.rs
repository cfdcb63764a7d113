//! SQLite-backed store.
//!
//! rusqlite is synchronous, so the connection sits behind a parking_lot
//! mutex and every call runs on the blocking pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use wamux_core::{DeviceHandle, GatewayError, GatewayResult, Jid, SessionRecord, SessionStore};

const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
";

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id           TEXT PRIMARY KEY,
    client_id    TEXT NOT NULL,
    phone_number TEXT NOT NULL DEFAULT '',
    connected    INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_client_id ON sessions(client_id);

CREATE TABLE IF NOT EXISTS devices (
    session_id TEXT PRIMARY KEY,
    jid        TEXT,
    created_at TEXT NOT NULL
);
";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn db_err(e: rusqlite::Error) -> GatewayError {
    GatewayError::Storage(e.to_string())
}

impl SqliteStore {
    /// Open or create a database at `path`.
    pub fn open(path: &Path) -> GatewayResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GatewayError::Storage(format!("create dir: {e}")))?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "database opened");
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> GatewayResult<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> GatewayResult<Self> {
        conn.execute_batch(PRAGMAS)
            .map_err(|e| GatewayError::Storage(format!("pragmas: {e}")))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| GatewayError::Storage(format!("schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> GatewayResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard).map_err(db_err)
        })
        .await
        .map_err(|e| GatewayError::Storage(format!("blocking task: {e}")))?
    }
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let created: String = row.get(4)?;
    let updated: String = row.get(5)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        client_id: row.get(1)?,
        phone_number: row.get(2)?,
        connected: row.get(3)?,
        created_at: parse_time(&created),
        updated_at: parse_time(&updated),
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceHandle> {
    let jid: Option<String> = row.get(1)?;
    Ok(DeviceHandle {
        session_id: row.get(0)?,
        // A malformed stored jid is treated as unpaired.
        jid: jid.and_then(|j| Jid::parse(&j).ok()),
    })
}

const SELECT_SESSION: &str =
    "SELECT id, client_id, phone_number, connected, created_at, updated_at FROM sessions";

#[async_trait]
impl SessionStore for SqliteStore {
    async fn upsert_session(
        &self,
        id: &str,
        client_id: &str,
        phone_number: &str,
        connected: bool,
    ) -> GatewayResult<()> {
        let (id, client_id, phone) = (id.to_string(), client_id.to_string(), phone_number.to_string());
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, client_id, phone_number, connected, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    client_id = excluded.client_id,
                    phone_number = excluded.phone_number,
                    connected = excluded.connected,
                    updated_at = excluded.updated_at",
                params![id, client_id, phone, connected, now],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get_session(&self, id: &str) -> GatewayResult<Option<SessionRecord>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(&format!("{SELECT_SESSION} WHERE id = ?1"), [id], record_from_row)
                .optional()
        })
        .await
    }

    async fn get_session_by_client_id(
        &self,
        client_id: &str,
    ) -> GatewayResult<Option<SessionRecord>> {
        let client_id = client_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("{SELECT_SESSION} WHERE client_id = ?1 ORDER BY created_at LIMIT 1"),
                [client_id],
                record_from_row,
            )
            .optional()
        })
        .await
    }

    async fn delete_session(&self, id: &str) -> GatewayResult<()> {
        let id = id.to_string();
        self.with_conn(move |conn| conn.execute("DELETE FROM sessions WHERE id = ?1", [id]).map(|_| ()))
            .await
    }

    async fn list_sessions(&self) -> GatewayResult<Vec<SessionRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_SESSION} ORDER BY created_at"))?;
            let rows = stmt.query_map([], record_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn new_device(&self, session_id: &str) -> GatewayResult<DeviceHandle> {
        let sid = session_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO devices (session_id, jid, created_at) VALUES (?1, NULL, ?2)
                 ON CONFLICT(session_id) DO UPDATE SET jid = NULL",
                params![sid, now],
            )
            .map(|_| ())
        })
        .await?;
        Ok(DeviceHandle::new(session_id))
    }

    async fn all_devices(&self) -> GatewayResult<Vec<DeviceHandle>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT session_id, jid FROM devices ORDER BY created_at")?;
            let rows = stmt.query_map([], device_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn delete_device(&self, session_id: &str) -> GatewayResult<()> {
        let sid = session_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM devices WHERE session_id = ?1", [sid]).map(|_| ())
        })
        .await
    }

    async fn set_device_identity(&self, session_id: &str, jid: Option<&Jid>) -> GatewayResult<()> {
        let sid = session_id.to_string();
        let jid = jid.map(|j| j.to_string());
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO devices (session_id, jid, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET jid = excluded.jid",
                params![sid, jid, now],
            )
            .map(|_| ())
        })
        .await
    }
}
