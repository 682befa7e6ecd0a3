//! The embedded relational store: the source of truth for anything that
//! must survive a restart. In-memory maps elsewhere in the crate are a
//! cache, re-derivable from here; every mutation is write-through.
//!
//! Schema/migration style (WAL pragmas, a `schema_version` row in a
//! metadata table, idempotent `CREATE TABLE IF NOT EXISTS` /
//! `CREATE INDEX IF NOT EXISTS`) is grounded on the pack's rusqlite
//! reference implementation rather than on the teacher, which doesn't use
//! rusqlite directly in the files retrieved for grounding.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use tokio::task::spawn_blocking;

use crate::error::BrokerError;
use crate::model::{ActiveSession, ClusterHealth, HealthHistoryEntry, PartitionLimits, Session, SessionHistory, UserAccount};

const SCHEMA_VERSION: i64 = 1;

/// Filters accepted by `list_history`. All fields are optional; `None`
/// means "don't filter on this".
#[derive(Debug, Clone, Default)]
pub struct HistoryFilters {
    pub user: Option<String>,
    pub cluster: Option<String>,
}

pub struct SqliteStore {
    conn: Arc<std::sync::Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<SqliteStore, BrokerError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<SqliteStore, BrokerError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<SqliteStore, BrokerError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_millis(5_000))?;
        init_schema(&conn)?;
        Ok(SqliteStore { conn: Arc::new(std::sync::Mutex::new(conn)) })
    }

    /// Every blocking rusqlite call is funneled through here so async
    /// pollers never block the tokio runtime on file I/O.
    async fn run<F, T>(&self, f: F) -> Result<T, BrokerError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        spawn_blocking(move || {
            let guard = conn.lock().unwrap();
            f(&guard)
        })
        .await
        .map_err(|err| BrokerError::unexpected(format!("store task join error: {err}")))?
        .map_err(BrokerError::from)
    }

    // -- active_sessions --------------------------------------------------

    pub async fn upsert_active_session(&self, session: Session) -> Result<(), BrokerError> {
        let blob = to_json(&session)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO active_sessions (session_key, user, cluster, ide, status, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(session_key) DO UPDATE SET user=excluded.user, cluster=excluded.cluster,
                    ide=excluded.ide, status=excluded.status, data=excluded.data",
                params![
                    session.session_key.as_str(),
                    session.user,
                    session.cluster,
                    session.ide.as_str(),
                    status_str(&session),
                    blob
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_active_session(&self, session_key: &str) -> Result<(), BrokerError> {
        let key = session_key.to_string();
        self.run(move |conn| {
            conn.execute("DELETE FROM active_sessions WHERE session_key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    pub async fn get_active_session(&self, session_key: &str) -> Result<Option<Session>, BrokerError> {
        let key = session_key.to_string();
        self.run(move |conn| {
            conn.query_row("SELECT data FROM active_sessions WHERE session_key = ?1", params![key], |row| row.get::<_, String>(0))
                .optional()
        })
        .await?
        .map(|blob| from_json(&blob))
        .transpose()
    }

    pub async fn list_active_sessions(&self) -> Result<Vec<Session>, BrokerError> {
        let blobs = self
            .run(|conn| {
                let mut stmt = conn.prepare("SELECT data FROM active_sessions")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        blobs.iter().map(|blob| from_json(blob)).collect()
    }

    pub async fn list_active_sessions_for_user(&self, user: &str) -> Result<Vec<Session>, BrokerError> {
        let user = user.to_string();
        let blobs = self
            .run(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM active_sessions WHERE user = ?1")?;
                let rows = stmt.query_map(params![user], |row| row.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        blobs.iter().map(|blob| from_json(blob)).collect()
    }

    // -- session_history ----------------------------------------------------

    pub async fn insert_history(&self, record: SessionHistory) -> Result<(), BrokerError> {
        let blob = to_json(&record)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO session_history (user, cluster, ide, session_key, started_at, ended_at, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.user,
                    record.cluster,
                    record.ide.as_str(),
                    record.session_key.as_str(),
                    record.started_at.map(|t| t.to_rfc3339()),
                    record.ended_at.to_rfc3339(),
                    blob
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_history(&self, filters: HistoryFilters) -> Result<Vec<SessionHistory>, BrokerError> {
        let blobs = self
            .run(move |conn| {
                let mut sql = "SELECT data FROM session_history WHERE 1=1".to_string();
                let mut bound: Vec<String> = Vec::new();
                if let Some(user) = &filters.user {
                    sql.push_str(" AND user = ?");
                    bound.push(user.clone());
                }
                if let Some(cluster) = &filters.cluster {
                    sql.push_str(" AND cluster = ?");
                    bound.push(cluster.clone());
                }
                sql.push_str(" ORDER BY started_at ASC");
                let mut stmt = conn.prepare(&sql)?;
                let params: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
                let rows = stmt.query_map(params.as_slice(), |row| row.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        blobs.iter().map(|blob| from_json(blob)).collect()
    }

    pub async fn count_history(&self, filters: HistoryFilters) -> Result<u64, BrokerError> {
        Ok(self.list_history(filters).await?.len() as u64)
    }

    // -- app_state (activeSession pointer, known_hosts) ---------------------

    pub async fn set_app_state(&self, key: &str, value: &str) -> Result<(), BrokerError> {
        let key = key.to_string();
        let value = value.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO app_state (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_app_state(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let key = key.to_string();
        self.run(move |conn| conn.query_row("SELECT value FROM app_state WHERE key = ?1", params![key], |row| row.get(0)).optional()).await
    }

    pub async fn set_active_session_pointer(&self, pointer: Option<&ActiveSession>) -> Result<(), BrokerError> {
        match pointer {
            Some(pointer) => self.set_app_state("activeSession", &to_json(pointer)?).await,
            None => {
                self.run(|conn| {
                    conn.execute("DELETE FROM app_state WHERE key = 'activeSession'", [])?;
                    Ok(())
                })
                .await
            }
        }
    }

    pub async fn get_active_session_pointer(&self) -> Result<Option<ActiveSession>, BrokerError> {
        self.get_app_state("activeSession").await?.map(|blob| from_json(&blob)).transpose()
    }

    // -- users ---------------------------------------------------------------

    pub async fn upsert_user_account(&self, account: UserAccount) -> Result<(), BrokerError> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO users (user, account, fetched_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user) DO UPDATE SET account = excluded.account, fetched_at = excluded.fetched_at",
                params![account.user, account.account, account.fetched_at.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_user_account(&self, user: &str) -> Result<Option<UserAccount>, BrokerError> {
        let user = user.to_string();
        self.run(move |conn| {
            conn.query_row("SELECT user, account, fetched_at FROM users WHERE user = ?1", params![user], |row| {
                let fetched_at: String = row.get(2)?;
                Ok(UserAccount {
                    user: row.get(0)?,
                    account: row.get(1)?,
                    fetched_at: DateTime::parse_from_rfc3339(&fetched_at).map(|t| t.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
                })
            })
            .optional()
        })
        .await
    }

    // -- cluster_health / cluster_cache --------------------------------------

    pub async fn upsert_cluster_health(&self, cluster: &str, health: ClusterHealth) -> Result<(), BrokerError> {
        let cluster = cluster.to_string();
        let blob = to_json(&health)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO cluster_cache (cluster, data, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(cluster) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
                params![cluster, blob, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn insert_health_history(&self, cluster: &str, entry: &HealthHistoryEntry) -> Result<(), BrokerError> {
        let cluster = cluster.to_string();
        let blob = to_json(entry)?;
        let timestamp = entry.timestamp.to_rfc3339();
        self.run(move |conn| {
            conn.execute("INSERT INTO cluster_health (cluster, timestamp, data) VALUES (?1, ?2, ?3)", params![cluster, timestamp, blob])?;
            Ok(())
        })
        .await
    }

    pub async fn list_health_history(&self, cluster: &str) -> Result<Vec<HealthHistoryEntry>, BrokerError> {
        let cluster = cluster.to_string();
        let blobs = self
            .run(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM cluster_health WHERE cluster = ?1 ORDER BY timestamp ASC")?;
                let rows = stmt.query_map(params![cluster], |row| row.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        blobs.iter().map(|blob| from_json(blob)).collect()
    }

    /// Replaces every stored entry for `cluster` with `entries` — used by
    /// `HealthPoller`'s rollover/downsampling pass, which always recomputes
    /// the full bucketed series rather than patching it incrementally.
    pub async fn replace_health_history(&self, cluster: &str, entries: Vec<HealthHistoryEntry>) -> Result<(), BrokerError> {
        let cluster_owned = cluster.to_string();
        self.run(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM cluster_health WHERE cluster = ?1", params![cluster_owned])?;
            for entry in &entries {
                let blob = serde_json::to_string(entry).map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
                tx.execute(
                    "INSERT INTO cluster_health (cluster, timestamp, data) VALUES (?1, ?2, ?3)",
                    params![cluster_owned, entry.timestamp.to_rfc3339(), blob],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    // -- partition_limits ------------------------------------------------

    pub async fn upsert_partition_limits(&self, limits: PartitionLimits) -> Result<(), BrokerError> {
        let blob = to_json(&limits)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO partition_limits (cluster, name, data) VALUES (?1, ?2, ?3)
                 ON CONFLICT(cluster, name) DO UPDATE SET data = excluded.data",
                params![limits.cluster, limits.name, blob],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_stale_partition_limits(&self, cluster: &str, keep_set: Vec<String>) -> Result<(), BrokerError> {
        let cluster = cluster.to_string();
        self.run(move |conn| {
            let placeholders = vec!["?"; keep_set.len()].join(",");
            let sql = if keep_set.is_empty() {
                "DELETE FROM partition_limits WHERE cluster = ?1".to_string()
            } else {
                format!("DELETE FROM partition_limits WHERE cluster = ?1 AND name NOT IN ({placeholders})")
            };
            let mut all_params: Vec<&dyn rusqlite::ToSql> = vec![&cluster];
            for name in &keep_set {
                all_params.push(name);
            }
            conn.execute(&sql, all_params.as_slice())?;
            Ok(())
        })
        .await
    }

    pub async fn list_partition_limits(&self, cluster: &str) -> Result<Vec<PartitionLimits>, BrokerError> {
        let cluster = cluster.to_string();
        let blobs = self
            .run(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM partition_limits WHERE cluster = ?1")?;
                let rows = stmt.query_map(params![cluster], |row| row.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        blobs.iter().map(|blob| from_json(blob)).collect()
    }
}

fn status_str(session: &Session) -> &'static str {
    match session.status {
        crate::model::SessionStatus::Idle => "idle",
        crate::model::SessionStatus::Pending => "pending",
        crate::model::SessionStatus::Running => "running",
        crate::model::SessionStatus::Stopped => "stopped",
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, BrokerError> {
    serde_json::to_string(value).map_err(|err| BrokerError::unexpected(format!("serialize failed: {err}")))
}

fn from_json<T: DeserializeOwned>(blob: &str) -> Result<T, BrokerError> {
    serde_json::from_str(blob).map_err(|err| BrokerError::unexpected(format!("deserialize failed: {err}")))
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL);

        CREATE TABLE IF NOT EXISTS users (
            user TEXT PRIMARY KEY,
            account TEXT NOT NULL,
            fetched_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS active_sessions (
            session_key TEXT PRIMARY KEY,
            user TEXT NOT NULL,
            cluster TEXT NOT NULL,
            ide TEXT NOT NULL,
            status TEXT NOT NULL,
            data TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_active_sessions_user ON active_sessions(user);

        CREATE TABLE IF NOT EXISTS session_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user TEXT NOT NULL,
            cluster TEXT NOT NULL,
            ide TEXT NOT NULL,
            session_key TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT NOT NULL,
            data TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_session_history_user_started ON session_history(user, started_at);

        CREATE TABLE IF NOT EXISTS cluster_cache (
            cluster TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cluster_health (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cluster TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            data TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_cluster_health_cluster_timestamp ON cluster_health(cluster, timestamp);

        CREATE TABLE IF NOT EXISTS app_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS partition_limits (
            cluster TEXT NOT NULL,
            name TEXT NOT NULL,
            data TEXT NOT NULL,
            PRIMARY KEY (cluster, name)
        );
        ",
    )?;

    let version: Option<String> = conn.query_row("SELECT value FROM metadata WHERE key = 'schema_version'", [], |row| row.get(0)).optional()?;
    if version.is_none() {
        conn.execute("INSERT INTO metadata (key, value) VALUES ('schema_version', ?1)", params![SCHEMA_VERSION.to_string()])?;
    }
    Ok(())
}

pub mod legacy;
