//! Identity & persistence: the embedded relational store.
//!
//! A single SQLite database holds users, sandbox records, metric samples,
//! the session index, per-provider settings and MCP server records.
//! Statements are short and synchronous; the connection sits behind a
//! mutex and is shared by cloning the store handle. Migrations are
//! forward-only and idempotent.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A registered user.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub tier: String,
    pub is_admin: bool,
    pub extensions_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Persisted sandbox state; one row per user, at most one live at a time.
#[derive(Debug, Clone)]
pub struct SandboxRecord {
    pub user_id: i64,
    pub engine_id: Option<String>,
    pub name: String,
    pub status: String,
    pub tier_snapshot: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Append-only resource usage sample.
#[derive(Debug, Clone)]
pub struct SandboxMetric {
    pub engine_id: String,
    pub cpu_percent: f64,
    pub mem_used: u64,
    pub mem_limit: u64,
    pub disk_used: u64,
    pub ts: DateTime<Utc>,
}

/// Index entry for a logical conversation; the ledger itself is JSONL on
/// disk next to the user's data.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: i64,
    pub project_path: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Per-(user, provider) agent permissions.
#[derive(Debug, Clone, Default)]
pub struct UserSettings {
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub skip_permissions: bool,
}

/// A configured MCP server.
#[derive(Debug, Clone)]
pub struct McpServerRecord {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub transport: String,
    pub config: serde_json::Value,
    pub enabled: bool,
}

const MIGRATIONS: [&str; 7] = [
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        tier TEXT NOT NULL DEFAULT 'free',
        is_admin INTEGER NOT NULL DEFAULT 0,
        extensions_synced_at TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sandboxes (
        user_id INTEGER PRIMARY KEY REFERENCES users(id),
        engine_id TEXT,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        tier_snapshot TEXT NOT NULL,
        created_at TEXT NOT NULL,
        last_active_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sandbox_metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        engine_id TEXT NOT NULL,
        cpu_percent REAL NOT NULL,
        mem_used INTEGER NOT NULL,
        mem_limit INTEGER NOT NULL,
        disk_used INTEGER NOT NULL,
        ts TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_sandbox_metrics_engine
        ON sandbox_metrics(engine_id, ts)",
    "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id),
        project_path TEXT NOT NULL,
        created_at TEXT NOT NULL,
        last_message_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS user_settings (
        user_id INTEGER NOT NULL REFERENCES users(id),
        provider TEXT NOT NULL,
        allowed_tools TEXT NOT NULL DEFAULT '[]',
        disallowed_tools TEXT NOT NULL DEFAULT '[]',
        skip_permissions INTEGER NOT NULL DEFAULT 0,
        UNIQUE(user_id, provider)
    )",
    "CREATE TABLE IF NOT EXISTS mcp_servers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        name TEXT NOT NULL,
        transport TEXT NOT NULL,
        config TEXT NOT NULL DEFAULT '{}',
        enabled INTEGER NOT NULL DEFAULT 1,
        UNIQUE(user_id, name)
    )",
];

/// Handle to the embedded store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if missing) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Corrupt(format!("database dir: {}", e)))?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        info!("Database opened: {}", path.display());
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;
        for (idx, sql) in MIGRATIONS.iter().enumerate() {
            let version = idx as i64 + 1;
            let applied: Option<i64> = conn
                .query_row(
                    "SELECT version FROM schema_migrations WHERE version = ?1",
                    params![version],
                    |row| row.get(0),
                )
                .optional()?;
            if applied.is_none() {
                conn.execute_batch(sql)?;
                conn.execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                    params![version, to_ts(Utc::now())],
                )?;
                debug!("Applied migration {}", version);
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // The store mutex is never held across await points, so poisoning
        // can only follow a panic that is already aborting the task.
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // --- users -----------------------------------------------------------

    pub fn create_user(&self, username: &str, password_hash: &str, tier: &str) -> Result<User> {
        let conn = self.lock();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO users (username, password_hash, tier, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![username, password_hash, tier, to_ts(now)],
        )
        .map_err(conflict_on_constraint(format!("user {}", username)))?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.user_by_id(id)
    }

    pub fn user_by_id(&self, id: i64) -> Result<User> {
        self.lock()
            .query_row(
                "SELECT id, username, password_hash, tier, is_admin, extensions_synced_at,
                        created_at
                 FROM users WHERE id = ?1",
                params![id],
                row_to_user,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("user {}", id)))
    }

    pub fn user_by_name(&self, username: &str) -> Result<User> {
        self.lock()
            .query_row(
                "SELECT id, username, password_hash, tier, is_admin, extensions_synced_at,
                        created_at
                 FROM users WHERE username = ?1",
                params![username],
                row_to_user,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("user {}", username)))
    }

    pub fn list_user_ids(&self) -> Result<Vec<i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id FROM users ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    pub fn set_admin(&self, user_id: i64, is_admin: bool) -> Result<()> {
        self.lock().execute(
            "UPDATE users SET is_admin = ?2 WHERE id = ?1",
            params![user_id, is_admin],
        )?;
        Ok(())
    }

    pub fn mark_extensions_synced(&self, user_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.lock().execute(
            "UPDATE users SET extensions_synced_at = ?2 WHERE id = ?1",
            params![user_id, to_ts(at)],
        )?;
        Ok(())
    }

    /// Delete a user and everything that hangs off it, in one transaction.
    /// The data directory on disk is the caller's concern.
    pub fn delete_user(&self, user_id: i64) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM mcp_servers WHERE user_id = ?1", params![user_id])?;
        tx.execute("DELETE FROM user_settings WHERE user_id = ?1", params![user_id])?;
        tx.execute("DELETE FROM sessions WHERE user_id = ?1", params![user_id])?;
        tx.execute("DELETE FROM sandboxes WHERE user_id = ?1", params![user_id])?;
        tx.execute("DELETE FROM users WHERE id = ?1", params![user_id])?;
        tx.commit()?;
        Ok(())
    }

    // --- sandboxes -------------------------------------------------------

    pub fn upsert_sandbox(&self, record: &SandboxRecord) -> Result<()> {
        self.lock().execute(
            "INSERT INTO sandboxes
                (user_id, engine_id, name, status, tier_snapshot, created_at, last_active_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id) DO UPDATE SET
                engine_id = excluded.engine_id,
                name = excluded.name,
                status = excluded.status,
                tier_snapshot = excluded.tier_snapshot,
                created_at = excluded.created_at,
                last_active_at = excluded.last_active_at",
            params![
                record.user_id,
                record.engine_id,
                record.name,
                record.status,
                record.tier_snapshot,
                to_ts(record.created_at),
                to_ts(record.last_active_at),
            ],
        )?;
        Ok(())
    }

    pub fn sandbox_by_user(&self, user_id: i64) -> Result<Option<SandboxRecord>> {
        Ok(self
            .lock()
            .query_row(
                "SELECT user_id, engine_id, name, status, tier_snapshot, created_at,
                        last_active_at
                 FROM sandboxes WHERE user_id = ?1",
                params![user_id],
                row_to_sandbox,
            )
            .optional()?)
    }

    pub fn list_sandboxes(&self) -> Result<Vec<SandboxRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, engine_id, name, status, tier_snapshot, created_at,
                    last_active_at
             FROM sandboxes ORDER BY user_id",
        )?;
        let records = stmt
            .query_map([], row_to_sandbox)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn set_sandbox_status(&self, user_id: i64, status: &str) -> Result<()> {
        self.lock().execute(
            "UPDATE sandboxes SET status = ?2, last_active_at = ?3 WHERE user_id = ?1",
            params![user_id, status, to_ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn touch_sandbox(&self, user_id: i64) -> Result<()> {
        self.lock().execute(
            "UPDATE sandboxes SET last_active_at = ?2 WHERE user_id = ?1",
            params![user_id, to_ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn delete_sandbox(&self, user_id: i64) -> Result<()> {
        self.lock()
            .execute("DELETE FROM sandboxes WHERE user_id = ?1", params![user_id])?;
        Ok(())
    }

    // --- metrics ---------------------------------------------------------

    pub fn insert_metric(&self, metric: &SandboxMetric) -> Result<()> {
        self.lock().execute(
            "INSERT INTO sandbox_metrics (engine_id, cpu_percent, mem_used, mem_limit,
                                          disk_used, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                metric.engine_id,
                metric.cpu_percent,
                metric.mem_used as i64,
                metric.mem_limit as i64,
                metric.disk_used as i64,
                to_ts(metric.ts),
            ],
        )?;
        Ok(())
    }

    pub fn prune_metrics(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let removed = self.lock().execute(
            "DELETE FROM sandbox_metrics WHERE ts < ?1",
            params![to_ts(older_than)],
        )?;
        Ok(removed)
    }

    pub fn metrics_for(&self, engine_id: &str, limit: usize) -> Result<Vec<SandboxMetric>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT engine_id, cpu_percent, mem_used, mem_limit, disk_used, ts
             FROM sandbox_metrics WHERE engine_id = ?1
             ORDER BY ts DESC LIMIT ?2",
        )?;
        let metrics = stmt
            .query_map(params![engine_id, limit as i64], |row| {
                Ok(SandboxMetric {
                    engine_id: row.get(0)?,
                    cpu_percent: row.get(1)?,
                    mem_used: row.get::<_, i64>(2)? as u64,
                    mem_limit: row.get::<_, i64>(3)? as u64,
                    disk_used: row.get::<_, i64>(4)? as u64,
                    ts: from_ts(row.get::<_, String>(5)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(metrics)
    }

    // --- sessions --------------------------------------------------------

    pub fn upsert_session(&self, record: &SessionRecord) -> Result<()> {
        self.lock().execute(
            "INSERT INTO sessions (id, user_id, project_path, created_at, last_message_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                project_path = excluded.project_path,
                last_message_at = excluded.last_message_at",
            params![
                record.id,
                record.user_id,
                record.project_path,
                to_ts(record.created_at),
                record.last_message_at.map(to_ts),
            ],
        )?;
        Ok(())
    }

    pub fn session_by_id(&self, id: &str) -> Result<Option<SessionRecord>> {
        Ok(self
            .lock()
            .query_row(
                "SELECT id, user_id, project_path, created_at, last_message_at
                 FROM sessions WHERE id = ?1",
                params![id],
                row_to_session,
            )
            .optional()?)
    }

    pub fn rename_session(&self, old_id: &str, new_id: &str) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE sessions SET id = ?2 WHERE id = ?1",
            params![old_id, new_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {}", old_id)));
        }
        Ok(())
    }

    pub fn touch_session(&self, id: &str) -> Result<()> {
        self.lock().execute(
            "UPDATE sessions SET last_message_at = ?2 WHERE id = ?1",
            params![id, to_ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn sessions_for_user(&self, user_id: i64) -> Result<Vec<SessionRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, project_path, created_at, last_message_at
             FROM sessions WHERE user_id = ?1 ORDER BY created_at DESC",
        )?;
        let records = stmt
            .query_map(params![user_id], row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn delete_session(&self, id: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- settings --------------------------------------------------------

    pub fn settings(&self, user_id: i64, provider: &str) -> Result<Option<UserSettings>> {
        let row = self
            .lock()
            .query_row(
                "SELECT allowed_tools, disallowed_tools, skip_permissions
                 FROM user_settings WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((allowed, disallowed, skip)) => Ok(Some(UserSettings {
                allowed_tools: parse_tools(&allowed)?,
                disallowed_tools: parse_tools(&disallowed)?,
                skip_permissions: skip,
            })),
        }
    }

    pub fn put_settings(
        &self,
        user_id: i64,
        provider: &str,
        settings: &UserSettings,
    ) -> Result<()> {
        let allowed = serde_json::to_string(&settings.allowed_tools)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let disallowed = serde_json::to_string(&settings.disallowed_tools)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.lock().execute(
            "INSERT INTO user_settings (user_id, provider, allowed_tools, disallowed_tools,
                                        skip_permissions)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, provider) DO UPDATE SET
                allowed_tools = excluded.allowed_tools,
                disallowed_tools = excluded.disallowed_tools,
                skip_permissions = excluded.skip_permissions",
            params![user_id, provider, allowed, disallowed, settings.skip_permissions],
        )?;
        Ok(())
    }

    // --- MCP servers -----------------------------------------------------

    pub fn mcp_servers_for_user(&self, user_id: i64) -> Result<Vec<McpServerRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, transport, config, enabled
             FROM mcp_servers WHERE user_id = ?1 ORDER BY name",
        )?;
        let records = stmt
            .query_map(params![user_id], row_to_mcp)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn mcp_server(&self, user_id: i64, id: i64) -> Result<McpServerRecord> {
        self.lock()
            .query_row(
                "SELECT id, user_id, name, transport, config, enabled
                 FROM mcp_servers WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
                row_to_mcp,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("mcp server {}", id)))
    }

    pub fn create_mcp_server(
        &self,
        user_id: i64,
        name: &str,
        transport: &str,
        config: &serde_json::Value,
        enabled: bool,
    ) -> Result<McpServerRecord> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO mcp_servers (user_id, name, transport, config, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, name, transport, config.to_string(), enabled],
        )
        .map_err(conflict_on_constraint(format!("mcp server {}", name)))?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.mcp_server(user_id, id)
    }

    pub fn update_mcp_server(
        &self,
        user_id: i64,
        id: i64,
        name: &str,
        transport: &str,
        config: &serde_json::Value,
        enabled: bool,
    ) -> Result<McpServerRecord> {
        let changed = self.lock().execute(
            "UPDATE mcp_servers SET name = ?3, transport = ?4, config = ?5, enabled = ?6
             WHERE id = ?1 AND user_id = ?2",
            params![id, user_id, name, transport, config.to_string(), enabled],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("mcp server {}", id)));
        }
        self.mcp_server(user_id, id)
    }

    pub fn delete_mcp_server(&self, user_id: i64, id: i64) -> Result<()> {
        let changed = self.lock().execute(
            "DELETE FROM mcp_servers WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("mcp server {}", id)));
        }
        Ok(())
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        tier: row.get(3)?,
        is_admin: row.get(4)?,
        extensions_synced_at: row
            .get::<_, Option<String>>(5)?
            .map(from_ts)
            .transpose()?,
        created_at: from_ts(row.get::<_, String>(6)?)?,
    })
}

fn row_to_sandbox(row: &rusqlite::Row<'_>) -> rusqlite::Result<SandboxRecord> {
    Ok(SandboxRecord {
        user_id: row.get(0)?,
        engine_id: row.get(1)?,
        name: row.get(2)?,
        status: row.get(3)?,
        tier_snapshot: row.get(4)?,
        created_at: from_ts(row.get::<_, String>(5)?)?,
        last_active_at: from_ts(row.get::<_, String>(6)?)?,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        project_path: row.get(2)?,
        created_at: from_ts(row.get::<_, String>(3)?)?,
        last_message_at: row
            .get::<_, Option<String>>(4)?
            .map(from_ts)
            .transpose()?,
    })
}

fn row_to_mcp(row: &rusqlite::Row<'_>) -> rusqlite::Result<McpServerRecord> {
    let config: String = row.get(4)?;
    Ok(McpServerRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        transport: row.get(3)?,
        config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
        enabled: row.get(5)?,
    })
}

fn parse_tools(json: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn to_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn from_ts(s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn conflict_on_constraint(what: String) -> impl FnOnce(rusqlite::Error) -> StoreError {
    move |e| match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict(what)
        }
        e => StoreError::Sqlite(e),
    }
}
