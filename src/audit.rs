//! Audit Store: durable, transactional persistence of Events, ToolRuns, and
//! Approvals (spec §3, §5). Modeled as a repository trait so the Gateway
//! depends on an interface, not a concrete engine — the same separation
//! `domain::repository` draws between aggregate and storage backend.
//!
//! The default backend is SQLite via `sqlx`, selected through `DATABASE_URL`
//! exactly as the original Python service selects its `SQLAlchemy` engine.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};

/// `ToolRun.status` (spec §3). Stored as its lowercase string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Ok,
    Error,
    Timeout,
    ApprovalRequired,
}

impl RunStatus {
    fn as_str(self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
            RunStatus::Timeout => "timeout",
            RunStatus::ApprovalRequired => "approval_required",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(RunStatus::Started),
            "ok" => Ok(RunStatus::Ok),
            "error" => Ok(RunStatus::Error),
            "timeout" => Ok(RunStatus::Timeout),
            "approval_required" => Ok(RunStatus::ApprovalRequired),
            other => Err(Error::Store(format!("unrecognized tool_run status '{other}'"))),
        }
    }
}

/// `Approval.status` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

impl ApprovalStatus {
    fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "denied" => Ok(ApprovalStatus::Denied),
            other => Err(Error::Store(format!("unrecognized approval status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub event_type: String,
    pub profile_id: String,
    pub session_id: String,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRun {
    pub tool_run_id: String,
    pub request_id: String,
    pub profile_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub status: RunStatus,
    pub input_json: Value,
    pub output_json: Value,
    pub error_json: Value,
    pub latency_ms: i64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub approval_id: String,
    pub tool_run_id: String,
    pub profile_id: String,
    pub status: ApprovalStatus,
    pub ts_requested: DateTime<Utc>,
    pub ts_resolved: Option<DateTime<Utc>>,
    pub approval_context_json: Value,
}

/// Transactional record store for the gateway's audit trail.
///
/// Every method here is expected to be atomic with respect to concurrent
/// callers; [`AuditStore::resolve_approval`] in particular is the
/// single-flight linearization point described in spec §5 and MUST be
/// implemented as a conditional update, never a read-then-write.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn log_event(
        &self,
        event_type: &str,
        profile_id: &str,
        session_id: &str,
        payload: Value,
    ) -> Result<()>;

    async fn create_tool_run(
        &self,
        request_id: &str,
        profile_id: &str,
        session_id: &str,
        tool_name: &str,
        input_json: Value,
    ) -> Result<ToolRun>;

    async fn finalize_tool_run(
        &self,
        tool_run_id: &str,
        status: RunStatus,
        output_json: Value,
        error_json: Value,
        latency_ms: i64,
    ) -> Result<()>;

    async fn get_tool_run(&self, tool_run_id: &str) -> Result<Option<ToolRun>>;

    async fn create_approval(&self, tool_run_id: &str, profile_id: &str, context: Value) -> Result<Approval>;

    async fn get_approval(&self, approval_id: &str) -> Result<Option<Approval>>;

    /// Attempt `pending -> new_status`. Returns `true` iff this call made
    /// the transition (the single-flight winner); `false` means the
    /// approval was already resolved by someone else, or never existed.
    async fn resolve_approval(&self, approval_id: &str, new_status: ApprovalStatus) -> Result<bool>;

    async fn list_approvals(&self, status: Option<ApprovalStatus>, limit: i64) -> Result<Vec<Approval>>;
}

/// Default `AuditStore`, backed by SQLite through `sqlx`.
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    /// Connect using `database_url` (e.g. `sqlite://./toolgate.db`),
    /// creating the file and schema if absent. Mirrors the original
    /// service's `DATABASE_URL`-driven engine construction.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = sqlx::sqlite::SqliteConnectOptions::from_str(database_url)
            .map_err(|e| Error::Store(format!("invalid database url {database_url}: {e}")))?
            .create_if_missing(true);

        // Every pooled connection to an in-memory database is its own,
        // independent database; cap the pool at one connection so migrate()
        // and every later query see the same schema and rows.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| Error::Store(format!("connecting to {database_url}: {e}")))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS profiles (
                profile_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'admin',
                timezone TEXT NOT NULL DEFAULT 'UTC',
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                profile_id TEXT NOT NULL,
                channel TEXT NOT NULL DEFAULT 'cli',
                started_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                event_id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                profile_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                ts TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type)")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_profile_session ON events(profile_id, session_id)")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tool_runs (
                tool_run_id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                profile_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                status TEXT NOT NULL,
                input_json TEXT NOT NULL,
                output_json TEXT NOT NULL,
                error_json TEXT NOT NULL,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                ts TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tool_runs_request ON tool_runs(request_id)")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tool_runs_name ON tool_runs(tool_name)")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS approvals (
                approval_id TEXT PRIMARY KEY,
                tool_run_id TEXT NOT NULL,
                profile_id TEXT NOT NULL,
                status TEXT NOT NULL,
                ts_requested TEXT NOT NULL,
                ts_resolved TEXT,
                approval_context_json TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_approvals_status_ts ON approvals(status, ts_requested)")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(())
    }
}

fn store_err(e: sqlx::Error) -> Error {
    Error::Store(e.to_string())
}

fn parse_json_column(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(Error::from)
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn log_event(
        &self,
        event_type: &str,
        profile_id: &str,
        session_id: &str,
        payload: Value,
    ) -> Result<()> {
        let event_id = Uuid::new_v4().to_string();
        let ts = Utc::now();
        sqlx::query(
            "INSERT INTO events (event_id, event_type, profile_id, session_id, payload_json, ts)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&event_id)
        .bind(event_type)
        .bind(profile_id)
        .bind(session_id)
        .bind(payload.to_string())
        .bind(ts.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn create_tool_run(
        &self,
        request_id: &str,
        profile_id: &str,
        session_id: &str,
        tool_name: &str,
        input_json: Value,
    ) -> Result<ToolRun> {
        let tool_run_id = Uuid::new_v4().to_string();
        let ts = Utc::now();
        sqlx::query(
            "INSERT INTO tool_runs
                (tool_run_id, request_id, profile_id, session_id, tool_name, status,
                 input_json, output_json, error_json, latency_ms, ts)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&tool_run_id)
        .bind(request_id)
        .bind(profile_id)
        .bind(session_id)
        .bind(tool_name)
        .bind(RunStatus::Started.as_str())
        .bind(input_json.to_string())
        .bind(Value::Null.to_string())
        .bind(Value::Null.to_string())
        .bind(0_i64)
        .bind(ts.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(ToolRun {
            tool_run_id,
            request_id: request_id.to_string(),
            profile_id: profile_id.to_string(),
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            status: RunStatus::Started,
            input_json,
            output_json: Value::Null,
            error_json: Value::Null,
            latency_ms: 0,
            ts,
        })
    }

    async fn finalize_tool_run(
        &self,
        tool_run_id: &str,
        status: RunStatus,
        output_json: Value,
        error_json: Value,
        latency_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tool_runs SET status = ?, output_json = ?, error_json = ?, latency_ms = ?
             WHERE tool_run_id = ?",
        )
        .bind(status.as_str())
        .bind(output_json.to_string())
        .bind(error_json.to_string())
        .bind(latency_ms)
        .bind(tool_run_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_tool_run(&self, tool_run_id: &str) -> Result<Option<ToolRun>> {
        let row = sqlx::query("SELECT * FROM tool_runs WHERE tool_run_id = ?")
            .bind(tool_run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        row.map(|r| tool_run_from_row(&r)).transpose()
    }

    async fn create_approval(&self, tool_run_id: &str, profile_id: &str, context: Value) -> Result<Approval> {
        let approval_id = Uuid::new_v4().to_string();
        let ts_requested = Utc::now();
        sqlx::query(
            "INSERT INTO approvals
                (approval_id, tool_run_id, profile_id, status, ts_requested, ts_resolved, approval_context_json)
             VALUES (?, ?, ?, ?, ?, NULL, ?)",
        )
        .bind(&approval_id)
        .bind(tool_run_id)
        .bind(profile_id)
        .bind(ApprovalStatus::Pending.as_str())
        .bind(ts_requested.to_rfc3339())
        .bind(context.to_string())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(Approval {
            approval_id,
            tool_run_id: tool_run_id.to_string(),
            profile_id: profile_id.to_string(),
            status: ApprovalStatus::Pending,
            ts_requested,
            ts_resolved: None,
            approval_context_json: context,
        })
    }

    async fn get_approval(&self, approval_id: &str) -> Result<Option<Approval>> {
        let row = sqlx::query("SELECT * FROM approvals WHERE approval_id = ?")
            .bind(approval_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        row.map(|r| approval_from_row(&r)).transpose()
    }

    async fn resolve_approval(&self, approval_id: &str, new_status: ApprovalStatus) -> Result<bool> {
        let ts_resolved = Utc::now();
        let result = sqlx::query(
            "UPDATE approvals SET status = ?, ts_resolved = ?
             WHERE approval_id = ? AND status = ?",
        )
        .bind(new_status.as_str())
        .bind(ts_resolved.to_rfc3339())
        .bind(approval_id)
        .bind(ApprovalStatus::Pending.as_str())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_approvals(&self, status: Option<ApprovalStatus>, limit: i64) -> Result<Vec<Approval>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM approvals WHERE status = ? ORDER BY ts_requested DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM approvals ORDER BY ts_requested DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(store_err)?;

        rows.iter().map(approval_from_row).collect()
    }
}

fn tool_run_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ToolRun> {
    Ok(ToolRun {
        tool_run_id: row.try_get("tool_run_id").map_err(store_err)?,
        request_id: row.try_get("request_id").map_err(store_err)?,
        profile_id: row.try_get("profile_id").map_err(store_err)?,
        session_id: row.try_get("session_id").map_err(store_err)?,
        tool_name: row.try_get("tool_name").map_err(store_err)?,
        status: RunStatus::parse(&row.try_get::<String, _>("status").map_err(store_err)?)?,
        input_json: parse_json_column(&row.try_get::<String, _>("input_json").map_err(store_err)?)?,
        output_json: parse_json_column(&row.try_get::<String, _>("output_json").map_err(store_err)?)?,
        error_json: parse_json_column(&row.try_get::<String, _>("error_json").map_err(store_err)?)?,
        latency_ms: row.try_get("latency_ms").map_err(store_err)?,
        ts: parse_rfc3339(&row.try_get::<String, _>("ts").map_err(store_err)?)?,
    })
}

fn approval_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Approval> {
    let ts_resolved: Option<String> = row.try_get("ts_resolved").map_err(store_err)?;
    Ok(Approval {
        approval_id: row.try_get("approval_id").map_err(store_err)?,
        tool_run_id: row.try_get("tool_run_id").map_err(store_err)?,
        profile_id: row.try_get("profile_id").map_err(store_err)?,
        status: ApprovalStatus::parse(&row.try_get::<String, _>("status").map_err(store_err)?)?,
        ts_requested: parse_rfc3339(&row.try_get::<String, _>("ts_requested").map_err(store_err)?)?,
        ts_resolved: ts_resolved.map(|s| parse_rfc3339(&s)).transpose()?,
        approval_context_json: parse_json_column(
            &row.try_get::<String, _>("approval_context_json").map_err(store_err)?,
        )?,
    })
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Store(format!("bad timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteAuditStore {
        SqliteAuditStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_and_finalize_tool_run_round_trips() {
        let store = store().await;
        let run = store
            .create_tool_run("req-1", "alice", "sess-1", "calendar.google.get_agenda", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Started);

        store
            .finalize_tool_run(&run.tool_run_id, RunStatus::Ok, serde_json::json!({"ok": true}), Value::Null, 12)
            .await
            .unwrap();

        let reloaded = store.get_tool_run(&run.tool_run_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, RunStatus::Ok);
        assert_eq!(reloaded.output_json, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn resolve_approval_is_single_flight() {
        let store = store().await;
        let run = store
            .create_tool_run("req-2", "alice", "sess-1", "sonos.play", serde_json::json!({}))
            .await
            .unwrap();
        let approval = store
            .create_approval(&run.tool_run_id, "alice", serde_json::json!({}))
            .await
            .unwrap();

        let first = store
            .resolve_approval(&approval.approval_id, ApprovalStatus::Approved)
            .await
            .unwrap();
        let second = store
            .resolve_approval(&approval.approval_id, ApprovalStatus::Approved)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn list_approvals_filters_by_status_and_orders_recent_first() {
        let store = store().await;
        let run1 = store
            .create_tool_run("req-3", "alice", "sess-1", "sonos.play", serde_json::json!({}))
            .await
            .unwrap();
        let run2 = store
            .create_tool_run("req-4", "alice", "sess-1", "sonos.play", serde_json::json!({}))
            .await
            .unwrap();
        store.create_approval(&run1.tool_run_id, "alice", serde_json::json!({})).await.unwrap();
        let second = store.create_approval(&run2.tool_run_id, "alice", serde_json::json!({})).await.unwrap();
        store.resolve_approval(&second.approval_id, ApprovalStatus::Denied).await.unwrap();

        let pending = store.list_approvals(Some(ApprovalStatus::Pending), 20).await.unwrap();
        assert_eq!(pending.len(), 1);

        let denied = store.list_approvals(Some(ApprovalStatus::Denied), 20).await.unwrap();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].approval_id, second.approval_id);
    }
}
