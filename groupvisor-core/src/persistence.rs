use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::schedule::ScheduleKind;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("store connection lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub chat_id: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: String,
    #[serde(default)]
    pub is_from_me: bool,
    #[serde(default)]
    pub is_bot_message: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInfo {
    pub chat_id: String,
    pub name: String,
    pub last_message_time: String,
    pub channel: Option<String>,
    pub is_group: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Paused,
    Completed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(JobStatus::Active),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Whether a job runs in the group's ongoing session or a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    #[serde(alias = "group")]
    Shared,
    #[default]
    Isolated,
}

impl ContextMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextMode::Shared => "shared",
            ContextMode::Isolated => "isolated",
        }
    }

    /// Lenient parse for request payloads: anything unrecognised is isolated.
    /// `group` is the older spelling of `shared`.
    pub fn from_wire(value: Option<&str>) -> Self {
        match value {
            Some("shared") | Some("group") => ContextMode::Shared,
            _ => ContextMode::Isolated,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub group_folder: String,
    /// Chat the job's output is delivered to.
    pub chat_id: String,
    pub prompt: String,
    pub schedule_type: ScheduleKind,
    pub schedule_value: String,
    #[serde(default)]
    pub context_mode: ContextMode,
    pub next_run: Option<String>,
    pub last_run: Option<String>,
    pub last_result: Option<String>,
    pub status: JobStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunLog {
    pub task_id: String,
    pub run_at: String,
    pub duration_ms: i64,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_type: Option<ScheduleKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Extra host directory a group asks to see inside its sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalMount {
    pub host_path: String,
    /// Relative path under `/workspace/extra`; defaults to the host basename.
    #[serde(default)]
    pub container_path: Option<String>,
    #[serde(default = "default_true")]
    pub readonly: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    #[serde(default)]
    pub additional_mounts: Vec<AdditionalMount>,
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub chat_id: String,
    pub name: String,
    pub folder: String,
    pub trigger: String,
    pub added_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_config: Option<SandboxConfig>,
    /// `None` means "use the default", which is to require the trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_trigger: Option<bool>,
}

// ---------------------------------------------------------------------------
// Store interfaces
// ---------------------------------------------------------------------------

pub trait JobStore: Send + Sync {
    fn create_job(&self, job: &ScheduledJob) -> StoreResult<()>;
    fn get_job(&self, id: &str) -> StoreResult<Option<ScheduledJob>>;
    fn get_all_jobs(&self) -> StoreResult<Vec<ScheduledJob>>;
    fn get_jobs_for_group(&self, group_folder: &str) -> StoreResult<Vec<ScheduledJob>>;
    /// Active jobs whose `next_run` is at or before `now`, earliest first.
    fn get_due_jobs(&self, now: &str) -> StoreResult<Vec<ScheduledJob>>;
    fn update_job(&self, id: &str, update: &JobUpdate) -> StoreResult<()>;
    /// Record the outcome of a run. A `None` next run completes the job;
    /// otherwise the status is left as is so a pause during the run sticks.
    fn update_job_after_run(
        &self,
        id: &str,
        next_run: Option<&str>,
        last_result: &str,
    ) -> StoreResult<()>;
    fn delete_job(&self, id: &str) -> StoreResult<()>;
    fn log_job_run(&self, log: &JobRunLog) -> StoreResult<()>;
    fn get_job_runs(&self, task_id: &str) -> StoreResult<Vec<JobRunLog>>;
}

pub trait GroupRegistry: Send + Sync {
    fn get_group(&self, chat_id: &str) -> StoreResult<Option<Group>>;
    fn set_group(&self, group: &Group) -> StoreResult<()>;
    fn get_all_groups(&self) -> StoreResult<HashMap<String, Group>>;
}

pub trait SessionStore: Send + Sync {
    fn get_session(&self, group_folder: &str) -> StoreResult<Option<String>>;
    fn set_session(&self, group_folder: &str, session_id: &str) -> StoreResult<()>;
    fn get_all_sessions(&self) -> StoreResult<HashMap<String, String>>;
}

pub trait MessageStore: Send + Sync {
    fn store_chat_metadata(
        &self,
        chat_id: &str,
        timestamp: &str,
        name: Option<&str>,
        channel: Option<&str>,
        is_group: Option<bool>,
    ) -> StoreResult<()>;
    fn get_all_chats(&self) -> StoreResult<Vec<ChatInfo>>;
    fn store_message(&self, msg: &StoredMessage) -> StoreResult<()>;
    /// Messages newer than `since` across `chat_ids`, plus the newest
    /// timestamp seen (or `since` when nothing is new).
    fn get_new_messages(
        &self,
        chat_ids: &[String],
        since: &str,
        bot_prefix: &str,
    ) -> StoreResult<(Vec<StoredMessage>, String)>;
    fn get_messages_since(
        &self,
        chat_id: &str,
        since: &str,
        bot_prefix: &str,
    ) -> StoreResult<Vec<StoredMessage>>;
    fn get_router_state(&self, key: &str) -> StoreResult<Option<String>>;
    fn set_router_state(&self, key: &str, value: &str) -> StoreResult<()>;
}

/// Everything the orchestrator needs from persistence.
pub trait Store: JobStore + GroupRegistry + SessionStore + MessageStore {}

impl<T: JobStore + GroupRegistry + SessionStore + MessageStore> Store for T {}

// ---------------------------------------------------------------------------
// Timestamps and ids
// ---------------------------------------------------------------------------

/// RFC 3339 UTC with milliseconds; lexical order equals time order.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// `task-{millis}-{8 hex}`.
pub fn new_job_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("task-{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

/// Single-connection SQLite store. Calls are short and synchronous; the
/// connection sits behind a std mutex that is never held across an await.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        ensure_schema(&conn)?;
        info!(path = %path.display(), "sqlite store opened and schema ensured");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "\
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS chats (
          chat_id TEXT PRIMARY KEY,
          name TEXT,
          last_message_time TEXT,
          channel TEXT,
          is_group INTEGER DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS messages (
          id TEXT NOT NULL,
          chat_id TEXT NOT NULL,
          sender TEXT,
          sender_name TEXT,
          content TEXT,
          timestamp TEXT NOT NULL,
          is_from_me INTEGER DEFAULT 0,
          is_bot_message INTEGER DEFAULT 0,
          PRIMARY KEY (id, chat_id)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);

        CREATE TABLE IF NOT EXISTS scheduled_tasks (
          id TEXT PRIMARY KEY,
          group_folder TEXT NOT NULL,
          chat_id TEXT NOT NULL,
          prompt TEXT NOT NULL,
          schedule_type TEXT NOT NULL,
          schedule_value TEXT NOT NULL,
          context_mode TEXT DEFAULT 'isolated',
          next_run TEXT,
          last_run TEXT,
          last_result TEXT,
          status TEXT DEFAULT 'active',
          created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON scheduled_tasks(next_run);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON scheduled_tasks(status);

        CREATE TABLE IF NOT EXISTS task_run_logs (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          task_id TEXT NOT NULL REFERENCES scheduled_tasks(id) ON DELETE CASCADE,
          run_at TEXT NOT NULL,
          duration_ms INTEGER NOT NULL,
          status TEXT NOT NULL,
          result TEXT,
          error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_task_run_logs_task ON task_run_logs(task_id, run_at);

        CREATE TABLE IF NOT EXISTS router_state (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
          group_folder TEXT PRIMARY KEY,
          session_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS registered_groups (
          chat_id TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          folder TEXT NOT NULL UNIQUE,
          trigger_pattern TEXT NOT NULL,
          added_at TEXT NOT NULL,
          container_config TEXT,
          requires_trigger INTEGER
        );
        ",
    )
}

// Enum columns are stored as their lowercase names.

impl ToSql for ScheduleKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ScheduleKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

impl ToSql for ContextMode {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ContextMode {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(ContextMode::from_wire(Some(value.as_str()?)))
    }
}

const JOB_COLUMNS: &str = "id, group_folder, chat_id, prompt, schedule_type, schedule_value, \
     context_mode, next_run, last_run, last_result, status, created_at";

fn row_to_job(r: &Row<'_>) -> rusqlite::Result<ScheduledJob> {
    Ok(ScheduledJob {
        id: r.get("id")?,
        group_folder: r.get("group_folder")?,
        chat_id: r.get("chat_id")?,
        prompt: r.get("prompt")?,
        schedule_type: r.get("schedule_type")?,
        schedule_value: r.get("schedule_value")?,
        context_mode: r
            .get::<_, Option<ContextMode>>("context_mode")?
            .unwrap_or_default(),
        next_run: r.get("next_run")?,
        last_run: r.get("last_run")?,
        last_result: r.get("last_result")?,
        status: r
            .get::<_, Option<JobStatus>>("status")?
            .unwrap_or(JobStatus::Active),
        created_at: r.get("created_at")?,
    })
}

fn row_to_group(r: &Row<'_>) -> rusqlite::Result<Group> {
    let container_config = match r.get::<_, Option<String>>("container_config")? {
        Some(raw) => Some(serde_json::from_str::<SandboxConfig>(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?),
        None => None,
    };
    Ok(Group {
        chat_id: r.get("chat_id")?,
        name: r.get("name")?,
        folder: r.get("folder")?,
        trigger: r.get("trigger_pattern")?,
        added_at: r.get("added_at")?,
        container_config,
        requires_trigger: r.get("requires_trigger")?,
    })
}

fn row_to_message(r: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: r.get("id")?,
        chat_id: r.get("chat_id")?,
        sender: r.get::<_, Option<String>>("sender")?.unwrap_or_default(),
        sender_name: r
            .get::<_, Option<String>>("sender_name")?
            .unwrap_or_default(),
        content: r.get::<_, Option<String>>("content")?.unwrap_or_default(),
        timestamp: r.get("timestamp")?,
        is_from_me: false,
        is_bot_message: false,
    })
}

impl JobStore for SqliteStore {
    fn create_job(&self, job: &ScheduledJob) -> StoreResult<()> {
        self.conn()?.execute(
            "\
            INSERT INTO scheduled_tasks
              (id, group_folder, chat_id, prompt, schedule_type, schedule_value,
               context_mode, next_run, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                job.id,
                job.group_folder,
                job.chat_id,
                job.prompt,
                job.schedule_type,
                job.schedule_value,
                job.context_mode,
                job.next_run,
                job.status,
                job.created_at,
            ],
        )?;
        Ok(())
    }

    fn get_job(&self, id: &str) -> StoreResult<Option<ScheduledJob>> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
                [id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn get_all_jobs(&self) -> StoreResult<Vec<ScheduledJob>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_tasks ORDER BY created_at DESC"
        ))?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn get_jobs_for_group(&self, group_folder: &str) -> StoreResult<Vec<ScheduledJob>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_tasks WHERE group_folder = ?1 \
             ORDER BY created_at DESC"
        ))?;
        let jobs = stmt
            .query_map([group_folder], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn get_due_jobs(&self, now: &str) -> StoreResult<Vec<ScheduledJob>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_tasks \
             WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1 \
             ORDER BY next_run"
        ))?;
        let jobs = stmt
            .query_map([now], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn update_job(&self, id: &str, update: &JobUpdate) -> StoreResult<()> {
        let mut fields: Vec<&str> = Vec::new();
        let mut values: Vec<&dyn ToSql> = Vec::new();

        if let Some(prompt) = &update.prompt {
            fields.push("prompt = ?");
            values.push(prompt);
        }
        if let Some(kind) = &update.schedule_type {
            fields.push("schedule_type = ?");
            values.push(kind);
        }
        if let Some(value) = &update.schedule_value {
            fields.push("schedule_value = ?");
            values.push(value);
        }
        if let Some(next_run) = &update.next_run {
            fields.push("next_run = ?");
            values.push(next_run);
        }
        if let Some(status) = &update.status {
            fields.push("status = ?");
            values.push(status);
        }

        if fields.is_empty() {
            return Ok(());
        }

        values.push(&id);
        let sql = format!(
            "UPDATE scheduled_tasks SET {} WHERE id = ?",
            fields.join(", ")
        );
        self.conn()?.execute(&sql, values.as_slice())?;
        Ok(())
    }

    fn update_job_after_run(
        &self,
        id: &str,
        next_run: Option<&str>,
        last_result: &str,
    ) -> StoreResult<()> {
        self.conn()?.execute(
            "\
            UPDATE scheduled_tasks
            SET next_run = ?1, last_run = ?2, last_result = ?3,
                status = CASE WHEN ?1 IS NULL THEN 'completed' ELSE status END
            WHERE id = ?4
            ",
            params![next_run, now_timestamp(), last_result, id],
        )?;
        Ok(())
    }

    fn delete_job(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM task_run_logs WHERE task_id = ?1", [id])?;
        conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", [id])?;
        Ok(())
    }

    fn log_job_run(&self, log: &JobRunLog) -> StoreResult<()> {
        self.conn()?.execute(
            "\
            INSERT INTO task_run_logs (task_id, run_at, duration_ms, status, result, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                log.task_id,
                log.run_at,
                log.duration_ms,
                log.status,
                log.result,
                log.error,
            ],
        )?;
        Ok(())
    }

    fn get_job_runs(&self, task_id: &str) -> StoreResult<Vec<JobRunLog>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, run_at, duration_ms, status, result, error \
             FROM task_run_logs WHERE task_id = ?1 ORDER BY run_at",
        )?;
        let runs = stmt
            .query_map([task_id], |r| {
                Ok(JobRunLog {
                    task_id: r.get(0)?,
                    run_at: r.get(1)?,
                    duration_ms: r.get(2)?,
                    status: r.get(3)?,
                    result: r.get(4)?,
                    error: r.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }
}

impl GroupRegistry for SqliteStore {
    fn get_group(&self, chat_id: &str) -> StoreResult<Option<Group>> {
        let conn = self.conn()?;
        let group = conn
            .query_row(
                "SELECT chat_id, name, folder, trigger_pattern, added_at, container_config, \
                 requires_trigger FROM registered_groups WHERE chat_id = ?1",
                [chat_id],
                row_to_group,
            )
            .optional()?;
        Ok(group)
    }

    fn set_group(&self, group: &Group) -> StoreResult<()> {
        let config_json = group
            .container_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.conn()?.execute(
            "\
            INSERT INTO registered_groups
              (chat_id, name, folder, trigger_pattern, added_at, container_config, requires_trigger)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (chat_id) DO UPDATE SET
              name = excluded.name,
              folder = excluded.folder,
              trigger_pattern = excluded.trigger_pattern,
              container_config = excluded.container_config,
              requires_trigger = excluded.requires_trigger
            ",
            params![
                group.chat_id,
                group.name,
                group.folder,
                group.trigger,
                group.added_at,
                config_json,
                group.requires_trigger,
            ],
        )?;
        Ok(())
    }

    fn get_all_groups(&self) -> StoreResult<HashMap<String, Group>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT chat_id, name, folder, trigger_pattern, added_at, container_config, \
             requires_trigger FROM registered_groups",
        )?;
        let groups = stmt
            .query_map([], row_to_group)?
            .map(|g| g.map(|g| (g.chat_id.clone(), g)))
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(groups)
    }
}

impl SessionStore for SqliteStore {
    fn get_session(&self, group_folder: &str) -> StoreResult<Option<String>> {
        let conn = self.conn()?;
        let session = conn
            .query_row(
                "SELECT session_id FROM sessions WHERE group_folder = ?1",
                [group_folder],
                |r| r.get(0),
            )
            .optional()?;
        Ok(session)
    }

    fn set_session(&self, group_folder: &str, session_id: &str) -> StoreResult<()> {
        self.conn()?.execute(
            "\
            INSERT INTO sessions (group_folder, session_id) VALUES (?1, ?2)
            ON CONFLICT (group_folder) DO UPDATE SET session_id = excluded.session_id
            ",
            [group_folder, session_id],
        )?;
        Ok(())
    }

    fn get_all_sessions(&self) -> StoreResult<HashMap<String, String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT group_folder, session_id FROM sessions")?;
        let sessions = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(sessions)
    }
}

impl MessageStore for SqliteStore {
    fn store_chat_metadata(
        &self,
        chat_id: &str,
        timestamp: &str,
        name: Option<&str>,
        channel: Option<&str>,
        is_group: Option<bool>,
    ) -> StoreResult<()> {
        let display_name = name.unwrap_or(chat_id);
        self.conn()?.execute(
            "\
            INSERT INTO chats (chat_id, name, last_message_time, channel, is_group)
            VALUES (?1, ?2, ?3, ?4, COALESCE(?5, 0))
            ON CONFLICT (chat_id) DO UPDATE SET
              name = COALESCE(NULLIF(excluded.name, excluded.chat_id), chats.name),
              last_message_time = MAX(COALESCE(chats.last_message_time, ''), excluded.last_message_time),
              channel = COALESCE(excluded.channel, chats.channel),
              is_group = COALESCE(?5, chats.is_group)
            ",
            params![chat_id, display_name, timestamp, channel, is_group],
        )?;
        Ok(())
    }

    fn get_all_chats(&self) -> StoreResult<Vec<ChatInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT chat_id, name, last_message_time, channel, is_group \
             FROM chats ORDER BY last_message_time DESC",
        )?;
        let chats = stmt
            .query_map([], |r| {
                Ok(ChatInfo {
                    chat_id: r.get(0)?,
                    name: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    last_message_time: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    channel: r.get(3)?,
                    is_group: r.get::<_, Option<bool>>(4)?.unwrap_or(false),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chats)
    }

    fn store_message(&self, msg: &StoredMessage) -> StoreResult<()> {
        self.conn()?.execute(
            "\
            INSERT INTO messages
              (id, chat_id, sender, sender_name, content, timestamp, is_from_me, is_bot_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (id, chat_id) DO UPDATE SET
              content = excluded.content,
              is_bot_message = excluded.is_bot_message
            ",
            params![
                msg.id,
                msg.chat_id,
                msg.sender,
                msg.sender_name,
                msg.content,
                msg.timestamp,
                msg.is_from_me,
                msg.is_bot_message,
            ],
        )?;
        Ok(())
    }

    fn get_new_messages(
        &self,
        chat_ids: &[String],
        since: &str,
        bot_prefix: &str,
    ) -> StoreResult<(Vec<StoredMessage>, String)> {
        if chat_ids.is_empty() {
            return Ok((Vec::new(), since.to_string()));
        }

        let placeholders = (0..chat_ids.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id, chat_id, sender, sender_name, content, timestamp FROM messages \
             WHERE timestamp > ?1 AND chat_id IN ({placeholders}) \
               AND is_bot_message = 0 AND content NOT LIKE ?2 \
               AND content != '' AND content IS NOT NULL \
             ORDER BY timestamp"
        );

        let like = format!("{bot_prefix}:%");
        let mut values: Vec<&dyn ToSql> = vec![&since as &dyn ToSql, &like as &dyn ToSql];
        values.extend(chat_ids.iter().map(|id| id as &dyn ToSql));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let messages = stmt
            .query_map(values.as_slice(), row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let newest = messages
            .iter()
            .map(|m| m.timestamp.as_str())
            .fold(since, |acc, ts| if ts > acc { ts } else { acc })
            .to_string();
        Ok((messages, newest))
    }

    fn get_messages_since(
        &self,
        chat_id: &str,
        since: &str,
        bot_prefix: &str,
    ) -> StoreResult<Vec<StoredMessage>> {
        let like = format!("{bot_prefix}:%");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "\
            SELECT id, chat_id, sender, sender_name, content, timestamp FROM messages
            WHERE chat_id = ?1 AND timestamp > ?2
              AND is_bot_message = 0 AND content NOT LIKE ?3
              AND content != '' AND content IS NOT NULL
            ORDER BY timestamp
            ",
        )?;
        let messages = stmt
            .query_map(params![chat_id, since, like], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    fn get_router_state(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM router_state WHERE key = ?1",
                [key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_router_state(&self, key: &str, value: &str) -> StoreResult<()> {
        self.conn()?.execute(
            "\
            INSERT INTO router_state (key, value) VALUES (?1, ?2)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            ",
            [key, value],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, folder: &str, next_run: Option<&str>) -> ScheduledJob {
        ScheduledJob {
            id: id.to_string(),
            group_folder: folder.to_string(),
            chat_id: "tg:1".to_string(),
            prompt: "check the build".to_string(),
            schedule_type: ScheduleKind::Interval,
            schedule_value: "60000".to_string(),
            context_mode: ContextMode::Isolated,
            next_run: next_run.map(str::to_string),
            last_run: None,
            last_result: None,
            status: JobStatus::Active,
            created_at: "2025-01-01T00:00:00.000Z".to_string(),
        }
    }

    fn group(chat_id: &str, folder: &str) -> Group {
        Group {
            chat_id: chat_id.to_string(),
            name: folder.to_string(),
            folder: folder.to_string(),
            trigger: "@Andy".to_string(),
            added_at: "2025-01-01T00:00:00.000Z".to_string(),
            container_config: None,
            requires_trigger: None,
        }
    }

    fn message(id: &str, chat_id: &str, content: &str, ts: &str) -> StoredMessage {
        StoredMessage {
            id: id.to_string(),
            chat_id: chat_id.to_string(),
            sender: "u1".to_string(),
            sender_name: "Alice".to_string(),
            content: content.to_string(),
            timestamp: ts.to_string(),
            is_from_me: false,
            is_bot_message: false,
        }
    }

    #[test]
    fn timestamps_have_millis_and_z() {
        let ts = now_timestamp();
        assert!(ts.ends_with('Z'), "{ts}");
        assert_eq!(ts.len(), 24, "{ts}");
    }

    #[test]
    fn job_ids_are_unique() {
        let a = new_job_id();
        assert!(a.starts_with("task-"));
        assert_ne!(a, new_job_id());
    }

    #[test]
    fn context_mode_wire_values() {
        assert_eq!(ContextMode::from_wire(Some("shared")), ContextMode::Shared);
        assert_eq!(ContextMode::from_wire(Some("group")), ContextMode::Shared);
        assert_eq!(ContextMode::from_wire(Some("isolated")), ContextMode::Isolated);
        assert_eq!(ContextMode::from_wire(Some("bogus")), ContextMode::Isolated);
        assert_eq!(ContextMode::from_wire(None), ContextMode::Isolated);
    }

    #[test]
    fn sandbox_config_accepts_legacy_timeout_key() {
        let cfg: SandboxConfig = serde_json::from_str(
            r#"{"additionalMounts":[{"hostPath":"~/src"}],"timeout":5000}"#,
        )
        .unwrap();
        assert_eq!(cfg.timeout_ms, Some(5000));
        assert!(cfg.additional_mounts[0].readonly);
    }

    #[test]
    fn job_crud_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .create_job(&job("t1", "main", Some("2025-01-01T00:01:00.000Z")))
            .unwrap();

        let fetched = store.get_job("t1").unwrap().unwrap();
        assert_eq!(fetched.schedule_type, ScheduleKind::Interval);
        assert_eq!(fetched.status, JobStatus::Active);

        store
            .update_job("t1", &JobUpdate::status(JobStatus::Paused))
            .unwrap();
        assert_eq!(
            store.get_job("t1").unwrap().unwrap().status,
            JobStatus::Paused
        );

        store.delete_job("t1").unwrap();
        assert!(store.get_job("t1").unwrap().is_none());
    }

    #[test]
    fn due_jobs_filter_by_time_and_status() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .create_job(&job("early", "main", Some("2025-01-01T00:00:00.000Z")))
            .unwrap();
        store
            .create_job(&job("late", "main", Some("2025-06-01T00:00:00.000Z")))
            .unwrap();
        store.create_job(&job("never", "main", None)).unwrap();
        store
            .create_job(&job("paused", "main", Some("2024-12-01T00:00:00.000Z")))
            .unwrap();
        store
            .update_job("paused", &JobUpdate::status(JobStatus::Paused))
            .unwrap();

        let due = store.get_due_jobs("2025-02-01T00:00:00.000Z").unwrap();
        let ids: Vec<_> = due.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["early"]);
    }

    #[test]
    fn finishing_without_next_run_completes_job() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .create_job(&job("once", "main", Some("2025-01-01T00:00:00.000Z")))
            .unwrap();
        store.update_job_after_run("once", None, "done").unwrap();

        let j = store.get_job("once").unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Completed);
        assert!(j.next_run.is_none());
        assert_eq!(j.last_result.as_deref(), Some("done"));
        assert!(j.last_run.is_some());
    }

    #[test]
    fn pause_during_run_is_not_undone() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .create_job(&job("t1", "main", Some("2025-01-01T00:00:00.000Z")))
            .unwrap();
        store
            .update_job("t1", &JobUpdate::status(JobStatus::Paused))
            .unwrap();
        store
            .update_job_after_run("t1", Some("2025-01-01T00:01:00.000Z"), "ok")
            .unwrap();
        assert_eq!(
            store.get_job("t1").unwrap().unwrap().status,
            JobStatus::Paused
        );
    }

    #[test]
    fn run_logs_recorded_and_removed_with_job() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_job(&job("t1", "main", None)).unwrap();
        store
            .log_job_run(&JobRunLog {
                task_id: "t1".to_string(),
                run_at: "2025-01-01T00:00:00.000Z".to_string(),
                duration_ms: 1200,
                status: "success".to_string(),
                result: Some("ok".to_string()),
                error: None,
            })
            .unwrap();
        assert_eq!(store.get_job_runs("t1").unwrap().len(), 1);

        store.delete_job("t1").unwrap();
        assert!(store.get_job_runs("t1").unwrap().is_empty());
    }

    #[test]
    fn groups_upsert_and_keep_sandbox_config() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut g = group("tg:1", "team-eng");
        g.container_config = Some(SandboxConfig {
            additional_mounts: vec![AdditionalMount {
                host_path: "~/projects".to_string(),
                container_path: Some("projects".to_string()),
                readonly: false,
            }],
            timeout_ms: Some(60_000),
        });
        g.requires_trigger = Some(false);
        store.set_group(&g).unwrap();
        assert_eq!(store.get_group("tg:1").unwrap().unwrap(), g);

        g.name = "Engineering".to_string();
        store.set_group(&g).unwrap();
        let all = store.get_all_groups().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["tg:1"].name, "Engineering");
    }

    #[test]
    fn folder_is_unique_across_groups() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set_group(&group("tg:1", "shared")).unwrap();
        assert!(store.set_group(&group("tg:2", "shared")).is_err());
    }

    #[test]
    fn sessions_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set_session("main", "s1").unwrap();
        store.set_session("main", "s2").unwrap();
        assert_eq!(store.get_session("main").unwrap().as_deref(), Some("s2"));
        assert_eq!(store.get_all_sessions().unwrap().len(), 1);
        assert!(store.get_session("other").unwrap().is_none());
    }

    #[test]
    fn new_messages_skip_bot_output_and_advance_cursor() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .store_message(&message("1", "tg:1", "hello", "2025-01-01T00:00:01.000Z"))
            .unwrap();
        store
            .store_message(&message("2", "tg:1", "Andy: hi back", "2025-01-01T00:00:02.000Z"))
            .unwrap();
        let mut bot = message("3", "tg:1", "from the bot", "2025-01-01T00:00:03.000Z");
        bot.is_bot_message = true;
        store.store_message(&bot).unwrap();
        store
            .store_message(&message("4", "tg:2", "elsewhere", "2025-01-01T00:00:04.000Z"))
            .unwrap();

        let (msgs, cursor) = store
            .get_new_messages(&["tg:1".to_string()], "", "Andy")
            .unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "hello");
        assert_eq!(cursor, "2025-01-01T00:00:01.000Z");

        let (msgs, cursor) = store
            .get_new_messages(&[], "2025-01-01T00:00:00.000Z", "Andy")
            .unwrap();
        assert!(msgs.is_empty());
        assert_eq!(cursor, "2025-01-01T00:00:00.000Z");

        let since = store
            .get_messages_since("tg:2", "2025-01-01T00:00:03.500Z", "Andy")
            .unwrap();
        assert_eq!(since.len(), 1);
    }

    #[test]
    fn chat_metadata_keeps_name_and_latest_time() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .store_chat_metadata("tg:1", "2025-01-01T00:00:05.000Z", Some("Team"), None, Some(true))
            .unwrap();
        store
            .store_chat_metadata("tg:1", "2025-01-01T00:00:01.000Z", None, Some("telegram"), None)
            .unwrap();

        let chats = store.get_all_chats().unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].name, "Team");
        assert_eq!(chats[0].last_message_time, "2025-01-01T00:00:05.000Z");
        assert_eq!(chats[0].channel.as_deref(), Some("telegram"));
        assert!(chats[0].is_group);
    }

    #[test]
    fn router_state_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get_router_state("last_timestamp").unwrap().is_none());
        store.set_router_state("last_timestamp", "a").unwrap();
        store.set_router_state("last_timestamp", "b").unwrap();
        assert_eq!(
            store.get_router_state("last_timestamp").unwrap().as_deref(),
            Some("b")
        );
    }

    #[test]
    fn open_creates_parent_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/store/groupvisor.db");
        let store = SqliteStore::open(&path).unwrap();
        store.set_router_state("k", "v").unwrap();
        assert!(path.exists());
    }
}
