use crate::config::Config;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const SCHEMA: &str = include_str!("schema.sql");

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// A finished purge, as handed to [`Database::record_purge_run`].
#[derive(Debug, Clone)]
pub struct NewPurgeRun {
    pub guild_id: String,
    pub channel_id: String,
    pub trigger: String,
    pub deleted: usize,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PurgeRunRecord {
    pub id: i64,
    pub guild_id: String,
    pub channel_id: String,
    pub trigger: String,
    pub deleted: usize,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

impl Database {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        if config.database_url != ":memory:" {
            if let Some(parent) = Path::new(&config.database_url).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        Self::open(&config.database_url)
    }

    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Fresh in-memory database with the schema applied.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let db = Self::open(":memory:")?;
        db.execute_init()?;
        Ok(db)
    }

    pub fn execute_init(&self) -> anyhow::Result<()> {
        info!("Database: Initializing schema...");
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    /// Runs `f` on the blocking pool so SQLite work never stalls the runtime.
    pub async fn run_blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| anyhow::anyhow!("database task failed: {}", e))?
    }

    pub fn record_purge_run(&self, run: &NewPurgeRun) -> anyhow::Result<i64> {
        debug!(
            "Database: Recording {} purge of channel {} ({} deleted)",
            run.trigger, run.channel_id, run.deleted
        );
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO purge_runs
                 (guild_id, channel_id, trigger_kind, deleted, error, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.guild_id,
                run.channel_id,
                run.trigger,
                run.deleted as i64,
                run.error,
                run.started_at.timestamp(),
                run.finished_at.timestamp(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent runs first, optionally restricted to one guild.
    pub fn recent_purge_runs(
        &self,
        guild_id: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<PurgeRunRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, guild_id, channel_id, trigger_kind, deleted, error, started_at, finished_at
             FROM purge_runs
             WHERE ?1 IS NULL OR guild_id = ?1
             ORDER BY finished_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![guild_id, limit as i64], |row| {
            Ok(PurgeRunRecord {
                id: row.get(0)?,
                guild_id: row.get(1)?,
                channel_id: row.get(2)?,
                trigger: row.get(3)?,
                deleted: row.get::<_, i64>(4)?.max(0) as usize,
                error: row.get(5)?,
                started_at: from_unix(row.get(6)?),
                finished_at: from_unix(row.get(7)?),
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Latest finish time per channel id.
    pub fn last_run_per_channel(&self) -> anyhow::Result<HashMap<String, DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT channel_id, MAX(finished_at) FROM purge_runs GROUP BY channel_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut results = HashMap::new();
        for row in rows {
            let (channel_id, finished_at) = row?;
            results.insert(channel_id, from_unix(finished_at));
        }
        Ok(results)
    }

    /// Removes run history older than `retention_days`. Returns the number of rows deleted.
    pub fn prune_purge_runs(&self, retention_days: u64) -> anyhow::Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM purge_runs WHERE finished_at < ?1",
            [cutoff.timestamp()],
        )?;
        Ok(count)
    }
}
