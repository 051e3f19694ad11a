//! Job repository: SQL for the `jobs` and `stage_results` tables.
//!
//! Functions take a `&Connection` so the job store can compose several of
//! them inside one transaction. Conditional updates return the number of
//! rows changed; zero means the guard did not match.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub job_id: String,
    pub user_id: String,
    pub status: String,
    pub current_stage: Option<String>,
    pub input_params: String,
    pub error: Option<String>,
    pub progress: i64,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            user_id: row.get("user_id")?,
            status: row.get("status")?,
            current_stage: row.get("current_stage")?,
            input_params: row.get("input_params")?,
            error: row.get("error")?,
            progress: row.get("progress")?,
            lease_owner: row.get("lease_owner")?,
            lease_expires_at: row.get("lease_expires_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// A raw stage result row.
#[derive(Debug, Clone)]
pub struct StageResultRow {
    pub job_id: String,
    pub seq: i64,
    pub stage_name: String,
    pub output: String,
    pub attempts: i64,
    pub recorded_at: String,
}

impl StageResultRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            seq: row.get("seq")?,
            stage_name: row.get("stage_name")?,
            output: row.get("output")?,
            attempts: row.get("attempts")?,
            recorded_at: row.get("recorded_at")?,
        })
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<String>,
    pub user_id: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a job row unless one with the same id exists.
/// Returns `true` if a row was written.
pub fn insert_if_absent(conn: &Connection, job: &JobRow) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO jobs (job_id, user_id, status, current_stage, input_params,
         error, progress, lease_owner, lease_expires_at, created_at, updated_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            job.job_id,
            job.user_id,
            job.status,
            job.current_stage,
            job.input_params,
            job.error,
            job.progress,
            job.lease_owner,
            job.lease_expires_at,
            job.created_at,
            job.updated_at,
            job.completed_at,
        ],
    )?;
    Ok(changed == 1)
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, job_id: &str) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM jobs WHERE job_id = ?1",
            params![job_id],
            JobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Stage results of a job in recording order.
pub fn stage_results(
    conn: &Connection,
    job_id: &str,
) -> Result<Vec<StageResultRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT job_id, seq, stage_name, output, attempts, recorded_at
         FROM stage_results WHERE job_id = ?1 ORDER BY seq ASC",
    )?;
    let rows = stmt
        .query_map(params![job_id], StageResultRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn has_stage_result(
    conn: &Connection,
    job_id: &str,
    stage_name: &str,
) -> Result<bool, DatabaseError> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM stage_results WHERE job_id = ?1 AND stage_name = ?2",
        params![job_id, stage_name],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Appends a stage result at the next sequence number.
pub fn insert_stage_result(
    conn: &Connection,
    job_id: &str,
    stage_name: &str,
    output: &str,
    attempts: u32,
    recorded_at: &str,
) -> Result<i64, DatabaseError> {
    let seq: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq) + 1, 0) FROM stage_results WHERE job_id = ?1",
        params![job_id],
        |r| r.get(0),
    )?;
    conn.execute(
        "INSERT INTO stage_results (job_id, seq, stage_name, output, attempts, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![job_id, seq, stage_name, output, attempts, recorded_at],
    )?;
    Ok(seq)
}

/// Moves a job to RUNNING under `owner` if it is PENDING, or RUNNING with a
/// lease that is absent, expired, or already held by `owner`.
pub fn claim(
    conn: &Connection,
    job_id: &str,
    owner: &str,
    now_ms: i64,
    lease_expires_at: i64,
    updated_at: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'RUNNING', lease_owner = ?2, lease_expires_at = ?4,
         updated_at = ?5
         WHERE job_id = ?1 AND (
             status = 'PENDING'
             OR (status = 'RUNNING' AND (
                 lease_owner IS NULL OR lease_owner = ?2
                 OR lease_expires_at IS NULL OR lease_expires_at <= ?3)))",
        params![job_id, owner, now_ms, lease_expires_at, updated_at],
    )?;
    Ok(changed)
}

/// Records the stage being attempted and renews the lease.
pub fn set_current_stage(
    conn: &Connection,
    job_id: &str,
    owner: &str,
    stage_name: &str,
    lease_expires_at: i64,
    updated_at: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET current_stage = ?3, lease_expires_at = ?4, updated_at = ?5
         WHERE job_id = ?1 AND status = 'RUNNING' AND lease_owner = ?2",
        params![job_id, owner, stage_name, lease_expires_at, updated_at],
    )?;
    Ok(changed)
}

/// Advances `current_stage` and progress after a stage result is written.
#[allow(clippy::too_many_arguments)]
pub fn advance(
    conn: &Connection,
    job_id: &str,
    expected_status: &str,
    owner: &str,
    stage_name: &str,
    progress: u8,
    lease_expires_at: i64,
    updated_at: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET current_stage = ?4, progress = ?5, lease_expires_at = ?6,
         updated_at = ?7
         WHERE job_id = ?1 AND status = ?2 AND lease_owner = ?3",
        params![
            job_id,
            expected_status,
            owner,
            stage_name,
            progress,
            lease_expires_at,
            updated_at
        ],
    )?;
    Ok(changed)
}

/// Moves a RUNNING job held by `owner` to a terminal status and drops the lease.
pub fn close(
    conn: &Connection,
    job_id: &str,
    owner: &str,
    status: &str,
    error: Option<&str>,
    progress: Option<u8>,
    now: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = ?3, error = ?4, progress = COALESCE(?5, progress),
         lease_owner = NULL, lease_expires_at = NULL, updated_at = ?6, completed_at = ?6
         WHERE job_id = ?1 AND status = 'RUNNING' AND lease_owner = ?2",
        params![job_id, owner, status, error, progress, now],
    )?;
    Ok(changed)
}

/// Drops the lease held by `owner` without changing status.
pub fn release_lease(conn: &Connection, job_id: &str, owner: &str) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET lease_owner = NULL, lease_expires_at = NULL
         WHERE job_id = ?1 AND lease_owner = ?2",
        params![job_id, owner],
    )?;
    Ok(changed)
}

/// Pushes the lease deadline of a RUNNING job held by `owner`.
pub fn renew_lease(
    conn: &Connection,
    job_id: &str,
    owner: &str,
    lease_expires_at: i64,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET lease_expires_at = ?3
         WHERE job_id = ?1 AND status = 'RUNNING' AND lease_owner = ?2",
        params![job_id, owner, lease_expires_at],
    )?;
    Ok(changed)
}

/// Ids of jobs that nobody is driving: PENDING, or RUNNING with an
/// expired or missing lease. Oldest first.
pub fn stalled(conn: &Connection, now_ms: i64, limit: u64) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT job_id FROM jobs
         WHERE status = 'PENDING'
            OR (status = 'RUNNING' AND (lease_expires_at IS NULL OR lease_expires_at <= ?1))
         ORDER BY created_at ASC LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![now_ms, limit as i64], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(conn: &Connection, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    let mut conditions = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ref status) = filter.status {
        conditions.push(format!("status = ?{}", param_values.len() + 1));
        param_values.push(Box::new(status.clone()));
    }
    if let Some(ref user_id) = filter.user_id {
        conditions.push(format!("user_id = ?{}", param_values.len() + 1));
        param_values.push(Box::new(user_id.clone()));
    }
    if let Some(ref from_date) = filter.from_date {
        conditions.push(format!("created_at >= ?{}", param_values.len() + 1));
        param_values.push(Box::new(from_date.clone()));
    }
    if let Some(ref to_date) = filter.to_date {
        conditions.push(format!("created_at <= ?{}", param_values.len() + 1));
        param_values.push(Box::new(to_date.clone()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

    let limit = filter.limit.unwrap_or(100) as i64;
    let offset = filter.offset.unwrap_or(0) as i64;
    param_values.push(Box::new(limit));
    param_values.push(Box::new(offset));
    let query_sql = format!(
        "SELECT * FROM jobs {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
        where_clause,
        param_values.len() - 1,
        param_values.len()
    );

    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&query_sql)?;
    let rows: Vec<JobRow> = stmt
        .query_map(params_ref.as_slice(), JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok((rows, total))
}

/// Counts jobs with the given status.
pub fn count_by_status(conn: &Connection, status: &str) -> Result<u64, DatabaseError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM jobs WHERE status = ?1",
        params![status],
        |r| r.get(0),
    )?;
    Ok(count)
}
