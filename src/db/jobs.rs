pub mod ledger;

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use ledger::{AccountDefaults, LedgerBalance, RefundOutcome};

const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Generate,
    Modify,
    Enhance,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Modify => "modify",
            Self::Enhance => "enhance",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "generate" => Some(Self::Generate),
            "modify" => Some(Self::Modify),
            "enhance" => Some(Self::Enhance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }

    /// Terminal with respect to the executor and the cancellation guard.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Refunded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub owner_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub cost: i64,
    pub prompt: String,
    pub input_url: Option<String>,
    pub output_url: Option<String>,
    pub output_width: Option<i64>,
    pub output_height: Option<i64>,
    pub output_bytes: Option<i64>,
    pub output_sha256: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub processing_started_at: Option<String>,
    pub processing_completed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: String,
    pub kind: JobKind,
    pub cost: i64,
    pub prompt: String,
    pub input_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    pub url: String,
    pub width: i64,
    pub height: i64,
    pub size_bytes: i64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobHistoryPage {
    pub jobs: Vec<JobRecord>,
    pub total: i64,
    pub has_more: bool,
}

/// Why a cancellation attempt did not win the guarded transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled(JobRecord),
    NotFound,
    Forbidden,
    AlreadyTerminal(JobStatus),
}

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job not found")]
    NotFound,

    #[error("{0}")]
    Validation(String),

    #[error("active job ceiling reached ({in_flight} of {ceiling} in flight)")]
    AdmissionRejected { in_flight: i64, ceiling: i64 },

    #[error("insufficient token balance: need {needed}, have {remaining}")]
    InsufficientBalance { needed: i64, remaining: i64 },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Clone)]
pub struct JobStore {
    db_path: PathBuf,
    account_defaults: AccountDefaults,
}

impl JobStore {
    pub fn new(db_path: impl Into<PathBuf>, account_defaults: AccountDefaults) -> Self {
        Self {
            db_path: db_path.into(),
            account_defaults,
        }
    }

    pub fn initialize(&self) -> Result<(), JobStoreError> {
        self.with_connection(|_| Ok(()))
    }

    pub fn account_defaults(&self) -> &AccountDefaults {
        &self.account_defaults
    }

    fn with_connection<T, F>(&self, func: F) -> Result<T, JobStoreError>
    where
        F: FnOnce(&Connection) -> Result<T, JobStoreError>,
    {
        if let Some(parent) = self.db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(self.db_path.as_path())?;
        conn.busy_timeout(SQLITE_BUSY_TIMEOUT)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        ensure_schema(&conn)?;
        func(&conn)
    }

    fn with_connection_mut<T, F>(&self, func: F) -> Result<T, JobStoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, JobStoreError>,
    {
        if let Some(parent) = self.db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let mut conn = Connection::open(self.db_path.as_path())?;
        conn.busy_timeout(SQLITE_BUSY_TIMEOUT)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        ensure_schema(&conn)?;
        func(&mut conn)
    }
}

impl JobStore {
    /// Creates a job after re-checking the admission ceiling and debiting the
    /// ledger, all inside one immediate transaction. Two concurrent creators
    /// for the same owner therefore cannot both slip under the ceiling or both
    /// pass a stale balance check. Returns the created job and the remaining
    /// balance after the debit.
    pub fn create_job_charged(
        &self,
        input: NewJob,
        max_active: i64,
    ) -> Result<(JobRecord, i64), JobStoreError> {
        let defaults = self.account_defaults.clone();
        self.with_connection_mut(|conn| {
            let owner = input.owner_id.trim();
            if owner.is_empty() {
                return Err(JobStoreError::Validation(String::from(
                    "Field 'owner_id' is required",
                )));
            }
            if input.cost <= 0 {
                return Err(JobStoreError::Validation(String::from(
                    "Job cost must be positive",
                )));
            }

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let in_flight = query_count(
                &tx,
                "SELECT COUNT(*) FROM jobs WHERE owner_id = ?1 AND status = 'processing'",
                [owner],
            )?;
            if in_flight >= max_active {
                return Err(JobStoreError::AdmissionRejected {
                    in_flight,
                    ceiling: max_active,
                });
            }

            ledger::ensure_account(&tx, owner, &defaults)?;
            let remaining = ledger::consume_tokens(&tx, owner, input.cost)?;

            let job_id = format!("job_{}", Uuid::new_v4().simple());
            let now = now_iso();
            tx.execute(
                "
                INSERT INTO jobs
                  (id, owner_id, kind, status, cost, prompt, input_url, created_at)
                VALUES
                  (?1, ?2, ?3, 'processing', ?4, ?5, ?6, ?7)
            ",
                params![
                    job_id,
                    owner,
                    input.kind.as_str(),
                    input.cost,
                    input.prompt,
                    input.input_url,
                    now
                ],
            )?;

            let job =
                fetch_job_by_id(&tx, job_id.as_str())?.ok_or(JobStoreError::NotFound)?;
            tx.commit()?;
            Ok((job, remaining))
        })
    }

    pub fn get_job(
        &self,
        job_id: &str,
        owner_id: Option<&str>,
    ) -> Result<JobRecord, JobStoreError> {
        self.with_connection(|conn| {
            let job = fetch_job_by_id(conn, job_id)?.ok_or(JobStoreError::NotFound)?;
            if let Some(owner) = owner_id {
                if job.owner_id != owner {
                    return Err(JobStoreError::NotFound);
                }
            }
            Ok(job)
        })
    }

    pub fn job_history(
        &self,
        owner_id: &str,
        limit: i64,
        offset: i64,
        kind: Option<JobKind>,
    ) -> Result<JobHistoryPage, JobStoreError> {
        self.with_connection(|conn| {
            let capped = limit.clamp(1, 500);
            let offset = offset.max(0);

            let (total, jobs) = if let Some(kind) = kind {
                let total = query_count(
                    conn,
                    "SELECT COUNT(*) FROM jobs WHERE owner_id = ?1 AND kind = ?2",
                    params![owner_id, kind.as_str()],
                )?;
                let mut stmt = conn.prepare(
                    "
                    SELECT * FROM jobs
                    WHERE owner_id = ?1 AND kind = ?2
                    ORDER BY created_at DESC, id DESC
                    LIMIT ?3 OFFSET ?4
                ",
                )?;
                let rows =
                    stmt.query_map(params![owner_id, kind.as_str(), capped, offset], row_to_job)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                (total, out)
            } else {
                let total = query_count(
                    conn,
                    "SELECT COUNT(*) FROM jobs WHERE owner_id = ?1",
                    [owner_id],
                )?;
                let mut stmt = conn.prepare(
                    "
                    SELECT * FROM jobs
                    WHERE owner_id = ?1
                    ORDER BY created_at DESC, id DESC
                    LIMIT ?2 OFFSET ?3
                ",
                )?;
                let rows = stmt.query_map(params![owner_id, capped, offset], row_to_job)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                (total, out)
            };

            let has_more = offset + (jobs.len() as i64) < total;
            Ok(JobHistoryPage {
                jobs,
                total,
                has_more,
            })
        })
    }

    pub fn count_active_jobs(&self, owner_id: &str) -> Result<i64, JobStoreError> {
        self.with_connection(|conn| {
            query_count(
                conn,
                "SELECT COUNT(*) FROM jobs WHERE owner_id = ?1 AND status = 'processing'",
                [owner_id],
            )
        })
    }

    pub fn mark_started(&self, job_id: &str) -> Result<bool, JobStoreError> {
        self.with_connection(|conn| {
            let changed = conn.execute(
                "
                UPDATE jobs
                SET processing_started_at = ?1
                WHERE id = ?2 AND status = 'processing' AND processing_started_at IS NULL
            ",
                params![now_iso(), job_id],
            )?;
            Ok(changed == 1)
        })
    }

    /// Guarded PROCESSING -> COMPLETED transition. Returns false when the job
    /// already left PROCESSING, which means a concurrent cancel won the race.
    pub fn complete_if_processing(
        &self,
        job_id: &str,
        output: &JobOutput,
    ) -> Result<bool, JobStoreError> {
        self.with_connection(|conn| {
            let changed = conn.execute(
                "
                UPDATE jobs
                SET status = 'completed',
                    output_url = ?1,
                    output_width = ?2,
                    output_height = ?3,
                    output_bytes = ?4,
                    output_sha256 = ?5,
                    processing_completed_at = ?6
                WHERE id = ?7 AND status = 'processing'
            ",
                params![
                    output.url,
                    output.width,
                    output.height,
                    output.size_bytes,
                    output.sha256,
                    now_iso(),
                    job_id
                ],
            )?;
            Ok(changed == 1)
        })
    }

    /// Guarded PROCESSING -> FAILED transition with the classified reason.
    pub fn fail_if_processing(
        &self,
        job_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool, JobStoreError> {
        self.with_connection(|conn| {
            let changed = conn.execute(
                "
                UPDATE jobs
                SET status = 'failed',
                    error_code = ?1,
                    error_message = ?2,
                    processing_completed_at = ?3
                WHERE id = ?4 AND status = 'processing'
            ",
                params![error_code, error_message, now_iso(), job_id],
            )?;
            Ok(changed == 1)
        })
    }

    /// FAILED -> REFUNDED, recorded after the ledger refund lands.
    pub fn mark_refunded_if_failed(&self, job_id: &str) -> Result<bool, JobStoreError> {
        self.with_connection(|conn| {
            let changed = conn.execute(
                "UPDATE jobs SET status = 'refunded' WHERE id = ?1 AND status = 'failed'",
                [job_id],
            )?;
            Ok(changed == 1)
        })
    }

    /// Cancellation guard: a single conditional update keyed on owner and a
    /// still non-terminal status (PROCESSING, or FAILED awaiting its refund).
    /// When zero rows match, the job is re-read to report why the cancel lost
    /// instead of guessing.
    pub fn cancel_if_active(
        &self,
        job_id: &str,
        owner_id: &str,
    ) -> Result<CancelOutcome, JobStoreError> {
        self.with_connection(|conn| {
            let changed = conn.execute(
                "
                UPDATE jobs
                SET status = 'cancelled',
                    processing_completed_at = COALESCE(processing_completed_at, ?1)
                WHERE id = ?2 AND owner_id = ?3 AND status IN ('processing', 'failed')
            ",
                params![now_iso(), job_id, owner_id],
            )?;
            if changed == 1 {
                let job = fetch_job_by_id(conn, job_id)?.ok_or(JobStoreError::NotFound)?;
                return Ok(CancelOutcome::Cancelled(job));
            }

            let Some(job) = fetch_job_by_id(conn, job_id)? else {
                return Ok(CancelOutcome::NotFound);
            };
            if job.owner_id != owner_id {
                return Ok(CancelOutcome::Forbidden);
            }
            Ok(CancelOutcome::AlreadyTerminal(job.status))
        })
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), JobStoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
          id TEXT PRIMARY KEY,
          owner_id TEXT NOT NULL,
          kind TEXT NOT NULL,
          status TEXT NOT NULL DEFAULT 'processing',
          cost INTEGER NOT NULL,
          prompt TEXT NOT NULL DEFAULT '',
          input_url TEXT,
          output_url TEXT,
          output_width INTEGER,
          output_height INTEGER,
          output_bytes INTEGER,
          error_code TEXT,
          error_message TEXT,
          created_at TEXT NOT NULL,
          processing_started_at TEXT,
          processing_completed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_owner_status ON jobs(owner_id, status);

        CREATE TABLE IF NOT EXISTS ledger_accounts (
          owner_id TEXT PRIMARY KEY,
          remaining INTEGER NOT NULL,
          token_limit INTEGER NOT NULL,
          used INTEGER NOT NULL DEFAULT 0,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ledger_refunds (
          job_id TEXT PRIMARY KEY,
          owner_id TEXT NOT NULL,
          amount INTEGER NOT NULL,
          reason TEXT NOT NULL,
          created_at TEXT NOT NULL
        );
    ",
    )?;

    ensure_column(conn, "jobs", "output_sha256", "TEXT")?;
    ensure_column(
        conn,
        "ledger_accounts",
        "tier",
        "TEXT NOT NULL DEFAULT 'standard'",
    )?;
    Ok(())
}

fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<(), JobStoreError> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }
    conn.execute(
        format!("ALTER TABLE {table} ADD COLUMN {column} {definition}").as_str(),
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, JobStoreError> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = conn.prepare(pragma.as_str())?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get("name")?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn fetch_job_by_id(conn: &Connection, job_id: &str) -> Result<Option<JobRecord>, JobStoreError> {
    let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1 LIMIT 1")?;
    stmt.query_row([job_id], row_to_job)
        .optional()
        .map_err(JobStoreError::from)
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        kind: parse_enum_column(row, "kind", JobKind::parse)?,
        status: parse_enum_column(row, "status", JobStatus::parse)?,
        cost: row.get("cost")?,
        prompt: row.get::<_, Option<String>>("prompt")?.unwrap_or_default(),
        input_url: row.get("input_url")?,
        output_url: row.get("output_url")?,
        output_width: row.get("output_width")?,
        output_height: row.get("output_height")?,
        output_bytes: row.get("output_bytes")?,
        output_sha256: row.get("output_sha256")?,
        error_code: row.get("error_code")?,
        error_message: row.get("error_message")?,
        created_at: row.get("created_at")?,
        processing_started_at: row.get("processing_started_at")?,
        processing_completed_at: row.get("processing_completed_at")?,
    })
}

fn parse_enum_column<T>(
    row: &rusqlite::Row<'_>,
    column: &str,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    parse(raw.as_str()).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unrecognized {column} value: {raw}").into(),
        )
    })
}

fn query_count<P>(conn: &Connection, sql: &str, params: P) -> Result<i64, JobStoreError>
where
    P: rusqlite::Params,
{
    conn.query_row(sql, params, |row| row.get::<_, i64>(0))
        .map_err(JobStoreError::from)
}

pub(crate) fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
