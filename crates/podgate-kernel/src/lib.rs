use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod types;

pub use types::{
    MessageRow, ModelState, ModelStatePatch, PodStatus, PresenceRecord, QueueItem, QueueStatus,
    TransitionError, UnknownStatus, UserSettings,
};

/// Fixed key of the singleton model-state row.
pub const MODEL_STATE_ID: i64 = 1;

/// Error text recorded on items swept by [`Kernel::fail_orphaned_running`].
pub const ORPHANED_ERROR: &str = "interrupted";

const QUEUE_COLS: &str =
    "id,user_id,conversation_id,prompt,status,created_at,started_at,finished_at,result_meta,error";

/// SQLite-backed store for queue items, presence, the model-state singleton,
/// user settings and conversation messages.
///
/// Every call opens its own connection with the per-connection pragmas
/// applied; the `_async` variants run the same work on the blocking pool.
#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
    busy_timeout: Duration,
}

/// Timestamps are stored as RFC3339 with millisecond precision and a `Z`
/// suffix so that lexical order matches chronological order.
pub fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn status_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = UnknownStatus>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn queue_item_from_row(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    let meta_s: Option<String> = row.get(8)?;
    Ok(QueueItem {
        id: row.get(0)?,
        user_id: row.get(1)?,
        conversation_id: row.get(2)?,
        prompt: row.get(3)?,
        status: status_col(row, 4)?,
        created_at: ts_col(row, 5)?,
        started_at: opt_ts_col(row, 6)?,
        finished_at: opt_ts_col(row, 7)?,
        result_meta: meta_s.and_then(|s| serde_json::from_str::<Value>(&s).ok()),
        error: row.get(9)?,
    })
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|err| anyhow!("create state dir {}: {err}", dir.display()))?;
        // Busy timeout (default 5000ms; override with PODGATE_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("PODGATE_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        let kernel = Self {
            db_path: dir.join("podgate.sqlite"),
            busy_timeout: Duration::from_millis(busy_ms),
        };
        let conn = kernel.conn()?;
        // WAL is persistent in the file header; the rest is per connection.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init_schema(&conn)?;
        Ok(kernel)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS request_queue (
              id TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              conversation_id TEXT,
              prompt TEXT NOT NULL,
              status TEXT NOT NULL,
              created_at TEXT NOT NULL,
              started_at TEXT,
              finished_at TEXT,
              result_meta TEXT,
              error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_status ON request_queue(status);
            CREATE INDEX IF NOT EXISTS idx_queue_created ON request_queue(created_at);
            CREATE INDEX IF NOT EXISTS idx_queue_user ON request_queue(user_id);

            -- Singleton coordination row (id is always 1)
            CREATE TABLE IF NOT EXISTS model_state (
              id INTEGER PRIMARY KEY,
              pod_status TEXT NOT NULL,
              last_request_at TEXT,
              last_start_at TEXT,
              last_stop_at TEXT,
              updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_presence (
              user_id TEXT PRIMARY KEY,
              last_seen TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_presence_seen ON user_presence(last_seen);

            CREATE TABLE IF NOT EXISTS user_settings (
              user_id TEXT PRIMARY KEY,
              system_prompt TEXT,
              memory TEXT,
              temperature REAL,
              updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
              id TEXT PRIMARY KEY,
              conversation_id TEXT NOT NULL,
              role TEXT NOT NULL,
              content TEXT NOT NULL,
              created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conv ON messages(conversation_id, created_at);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ---------- Presence ----------

    pub fn upsert_presence(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO user_presence(user_id,last_seen) VALUES(?,?)
             ON CONFLICT(user_id) DO UPDATE SET last_seen=excluded.last_seen",
            params![user_id, ts(at)],
        )?;
        Ok(())
    }

    pub fn count_presence_since(&self, cutoff: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(1) FROM user_presence WHERE last_seen >= ?",
            [ts(cutoff)],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn get_presence(&self, user_id: &str) -> Result<Option<PresenceRecord>> {
        let conn = self.conn()?;
        let rec = conn
            .query_row(
                "SELECT user_id,last_seen FROM user_presence WHERE user_id=?",
                [user_id],
                |row| {
                    Ok(PresenceRecord {
                        user_id: row.get(0)?,
                        last_seen: ts_col(row, 1)?,
                    })
                },
            )
            .optional()?;
        Ok(rec)
    }

    // ---------- Model state ----------

    /// Read the singleton; an absent row reads as a stopped pod with no history.
    pub fn get_model_state(&self) -> Result<ModelState> {
        let conn = self.conn()?;
        Self::read_model_state(&conn)
    }

    fn read_model_state(conn: &Connection) -> Result<ModelState> {
        let state = conn
            .query_row(
                "SELECT pod_status,last_request_at,last_start_at,last_stop_at,updated_at
                 FROM model_state WHERE id=?",
                [MODEL_STATE_ID],
                |row| {
                    Ok(ModelState {
                        pod_status: status_col(row, 0)?,
                        last_request_at: opt_ts_col(row, 1)?,
                        last_start_at: opt_ts_col(row, 2)?,
                        last_stop_at: opt_ts_col(row, 3)?,
                        updated_at: opt_ts_col(row, 4)?,
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_default())
    }

    /// Merge `patch` into the singleton with a fresh `updated_at`.
    ///
    /// A pod status change is checked against [`PodStatus::can_transition_to`]
    /// first; an illegal change returns [`TransitionError`] and writes nothing.
    /// The read and the write are not one transaction: concurrent writers race
    /// and the last call wins.
    pub fn upsert_model_state(&self, patch: &ModelStatePatch, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        if let Some(next) = patch.pod_status {
            let current = Self::read_model_state(&conn)?;
            current.pod_status.check_transition(next)?;
        }
        conn.execute(
            "INSERT INTO model_state(id,pod_status,last_request_at,last_start_at,last_stop_at,updated_at)
             VALUES(?1,COALESCE(?2,'stopped'),?3,?4,?5,?6)
             ON CONFLICT(id) DO UPDATE SET
               pod_status=COALESCE(?2,pod_status),
               last_request_at=COALESCE(?3,last_request_at),
               last_start_at=COALESCE(?4,last_start_at),
               last_stop_at=COALESCE(?5,last_stop_at),
               updated_at=?6",
            params![
                MODEL_STATE_ID,
                patch.pod_status.map(|s| s.as_str()),
                patch.last_request_at.map(ts),
                patch.last_start_at.map(ts),
                patch.last_stop_at.map(ts),
                ts(at),
            ],
        )?;
        Ok(())
    }

    // ---------- Request queue ----------

    /// Number of items still occupying a queue slot (queued or running).
    pub fn count_queue_active(&self) -> Result<i64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(1) FROM request_queue WHERE status IN (?,?)",
            params![
                QueueStatus::ACTIVE[0].as_str(),
                QueueStatus::ACTIVE[1].as_str()
            ],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn count_queue_by_status(&self) -> Result<BTreeMap<QueueStatus, i64>> {
        let conn = self.conn()?;
        let mut out: BTreeMap<QueueStatus, i64> =
            QueueStatus::ALL.iter().map(|s| (*s, 0)).collect();
        let mut stmt = conn.prepare("SELECT status, COUNT(1) FROM request_queue GROUP BY status")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let status: QueueStatus = status_col(row, 0)?;
            out.insert(status, row.get(1)?);
        }
        Ok(out)
    }

    pub fn insert_queue_item(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        prompt: &str,
        at: DateTime<Utc>,
    ) -> Result<QueueItem> {
        let conn = self.conn()?;
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO request_queue(id,user_id,conversation_id,prompt,status,created_at) VALUES(?,?,?,?,?,?)",
            params![
                id,
                user_id,
                conversation_id,
                prompt,
                QueueStatus::Queued.as_str(),
                ts(at)
            ],
        )?;
        Ok(QueueItem {
            id,
            user_id: user_id.to_string(),
            conversation_id: conversation_id.map(|s| s.to_string()),
            prompt: prompt.to_string(),
            status: QueueStatus::Queued,
            created_at: at,
            started_at: None,
            finished_at: None,
            result_meta: None,
            error: None,
        })
    }

    /// Claim the oldest queued item and mark it running in a single statement.
    ///
    /// Ordering is `created_at` ascending with insertion order breaking ties.
    pub fn claim_next_queued(&self, at: DateTime<Utc>) -> Result<Option<QueueItem>> {
        let conn = self.conn()?;
        let sql = format!(
            "UPDATE request_queue SET status='running', started_at=?1 WHERE id = (
                 SELECT id FROM request_queue WHERE status='queued'
                 ORDER BY created_at ASC, rowid ASC LIMIT 1
             ) AND status='queued' RETURNING {QUEUE_COLS}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![ts(at)])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(queue_item_from_row(row)?));
        }
        Ok(None)
    }

    /// Move a running item into a terminal state.
    ///
    /// Returns `Ok(false)` when the item is missing or no longer running, so a
    /// terminal item is never rewritten.
    pub fn finish_queue_item(
        &self,
        id: &str,
        terminal: QueueStatus,
        result_meta: Option<&Value>,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        QueueStatus::Running.check_transition(terminal)?;
        let conn = self.conn()?;
        let meta_s = result_meta.map(|v| serde_json::to_string(v).unwrap_or("{}".into()));
        let n = conn.execute(
            "UPDATE request_queue SET status=?, finished_at=?, result_meta=?, error=?
             WHERE id=? AND status='running'",
            params![terminal.as_str(), ts(at), meta_s, error, id],
        )?;
        Ok(n > 0)
    }

    /// Fail every item left `running` by a previous process so it stops
    /// holding a queue slot. Returns the number of items swept.
    pub fn fail_orphaned_running(&self, at: DateTime<Utc>) -> Result<usize> {
        QueueStatus::Running.check_transition(QueueStatus::Failed)?;
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE request_queue SET status=?, finished_at=?, error=? WHERE status='running'",
            params![QueueStatus::Failed.as_str(), ts(at), ORPHANED_ERROR],
        )?;
        Ok(n)
    }

    pub fn get_queue_item(&self, id: &str) -> Result<Option<QueueItem>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {QUEUE_COLS} FROM request_queue WHERE id=? LIMIT 1");
        let item = conn
            .query_row(&sql, [id], queue_item_from_row)
            .optional()?;
        Ok(item)
    }

    pub fn list_queue_items(&self, user_id: Option<&str>, limit: i64) -> Result<Vec<QueueItem>> {
        let conn = self.conn()?;
        let mut out = Vec::new();
        match user_id {
            Some(user) => {
                let sql = format!(
                    "SELECT {QUEUE_COLS} FROM request_queue WHERE user_id=? ORDER BY created_at DESC, rowid DESC LIMIT ?"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![user, limit])?;
                while let Some(row) = rows.next()? {
                    out.push(queue_item_from_row(row)?);
                }
            }
            None => {
                let sql = format!(
                    "SELECT {QUEUE_COLS} FROM request_queue ORDER BY created_at DESC, rowid DESC LIMIT ?"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![limit])?;
                while let Some(row) = rows.next()? {
                    out.push(queue_item_from_row(row)?);
                }
            }
        }
        Ok(out)
    }

    // ---------- User settings ----------

    pub fn get_user_settings(&self, user_id: &str) -> Result<Option<UserSettings>> {
        let conn = self.conn()?;
        let settings = conn
            .query_row(
                "SELECT user_id,system_prompt,memory,temperature FROM user_settings WHERE user_id=?",
                [user_id],
                |row| {
                    Ok(UserSettings {
                        user_id: row.get(0)?,
                        system_prompt: row.get(1)?,
                        memory: row.get(2)?,
                        temperature: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(settings)
    }

    pub fn upsert_user_settings(&self, settings: &UserSettings, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO user_settings(user_id,system_prompt,memory,temperature,updated_at) VALUES(?,?,?,?,?)
             ON CONFLICT(user_id) DO UPDATE SET
               system_prompt=excluded.system_prompt,
               memory=excluded.memory,
               temperature=excluded.temperature,
               updated_at=excluded.updated_at",
            params![
                settings.user_id,
                settings.system_prompt,
                settings.memory,
                settings.temperature,
                ts(at)
            ],
        )?;
        Ok(())
    }

    // ---------- Messages ----------

    pub fn append_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<MessageRow> {
        let conn = self.conn()?;
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO messages(id,conversation_id,role,content,created_at) VALUES(?,?,?,?,?)",
            params![id, conversation_id, role, content, ts(at)],
        )?;
        Ok(MessageRow {
            id,
            conversation_id: conversation_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: at,
        })
    }

    /// The newest `limit` messages of a conversation, returned oldest first.
    pub fn recent_messages(&self, conversation_id: &str, limit: i64) -> Result<Vec<MessageRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,conversation_id,role,content,created_at FROM messages
             WHERE conversation_id=? ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )?;
        let mut rows = stmt.query(params![conversation_id, limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(MessageRow {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                created_at: ts_col(row, 4)?,
            });
        }
        out.reverse();
        Ok(out)
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------
    // These helpers offload rusqlite work from async executors.

    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(Kernel) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let k = self.clone();
        tokio::task::spawn_blocking(move || work(k))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn upsert_presence_async(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        let user = user_id.to_string();
        self.blocking(move |k| k.upsert_presence(&user, at)).await
    }

    pub async fn count_presence_since_async(&self, cutoff: DateTime<Utc>) -> Result<i64> {
        self.blocking(move |k| k.count_presence_since(cutoff)).await
    }

    pub async fn get_model_state_async(&self) -> Result<ModelState> {
        self.blocking(|k| k.get_model_state()).await
    }

    pub async fn upsert_model_state_async(
        &self,
        patch: ModelStatePatch,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.blocking(move |k| k.upsert_model_state(&patch, at))
            .await
    }

    pub async fn count_queue_active_async(&self) -> Result<i64> {
        self.blocking(|k| k.count_queue_active()).await
    }

    pub async fn count_queue_by_status_async(&self) -> Result<BTreeMap<QueueStatus, i64>> {
        self.blocking(|k| k.count_queue_by_status()).await
    }

    pub async fn insert_queue_item_async(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        prompt: &str,
        at: DateTime<Utc>,
    ) -> Result<QueueItem> {
        let user = user_id.to_string();
        let conversation = conversation_id.map(|s| s.to_string());
        let prompt = prompt.to_string();
        self.blocking(move |k| k.insert_queue_item(&user, conversation.as_deref(), &prompt, at))
            .await
    }

    pub async fn claim_next_queued_async(&self, at: DateTime<Utc>) -> Result<Option<QueueItem>> {
        self.blocking(move |k| k.claim_next_queued(at)).await
    }

    pub async fn finish_queue_item_async(
        &self,
        id: &str,
        terminal: QueueStatus,
        result_meta: Option<Value>,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let id = id.to_string();
        self.blocking(move |k| {
            k.finish_queue_item(&id, terminal, result_meta.as_ref(), error.as_deref(), at)
        })
        .await
    }

    pub async fn fail_orphaned_running_async(&self, at: DateTime<Utc>) -> Result<usize> {
        self.blocking(move |k| k.fail_orphaned_running(at)).await
    }

    pub async fn get_queue_item_async(&self, id: &str) -> Result<Option<QueueItem>> {
        let id = id.to_string();
        self.blocking(move |k| k.get_queue_item(&id)).await
    }

    pub async fn list_queue_items_async(
        &self,
        user_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<QueueItem>> {
        let user = user_id.map(|s| s.to_string());
        self.blocking(move |k| k.list_queue_items(user.as_deref(), limit))
            .await
    }

    pub async fn get_user_settings_async(&self, user_id: &str) -> Result<Option<UserSettings>> {
        let user = user_id.to_string();
        self.blocking(move |k| k.get_user_settings(&user)).await
    }

    pub async fn append_message_async(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<MessageRow> {
        let conversation = conversation_id.to_string();
        let role = role.to_string();
        let content = content.to_string();
        self.blocking(move |k| k.append_message(&conversation, &role, &content, at))
            .await
    }

    pub async fn recent_messages_async(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<MessageRow>> {
        let conversation = conversation_id.to_string();
        self.blocking(move |k| k.recent_messages(&conversation, limit))
            .await
    }
}
