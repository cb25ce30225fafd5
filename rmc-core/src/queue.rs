//! Durable job queue in the memory database.
//!
//! Jobs survive restarts: a claimed job is `running` until completed or
//! failed, and [`JobQueue::recover`] returns orphaned `running` jobs to
//! `pending` on startup. A failed attempt is rescheduled with backoff until
//! `max_attempts`, after which the job stays `failed` for inspection.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::Result;
use crate::memory::{
    encode_metadata, fmt_ts, insert_entry_row, parse_ts, string_enum, MemoryEntry, MemoryId,
    SqliteMemoryStore,
};

/// Pipeline stage a job drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Embed if needed, extract, relate, score
    ProcessEntry,
    /// Semantic contradiction pass for a strategic entry
    DetectConflicts,
}

string_enum!(JobKind, "job kind", {
    ProcessEntry => "process_entry",
    DetectConflicts => "detect_conflicts",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

string_enum!(JobStatus, "job status", {
    Pending => "pending",
    Running => "running",
    Done => "done",
    Failed => "failed",
});

/// Stage input carried in the job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub memory_id: MemoryId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: i64,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub status: JobStatus,
    /// Attempts started, including the current one
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

const JOB_COLUMNS: &str =
    "id, kind, payload, status, attempts, max_attempts, last_error, run_after, created_at, updated_at";

#[derive(Clone)]
pub struct JobQueue {
    store: SqliteMemoryStore,
}

impl JobQueue {
    pub fn new(store: SqliteMemoryStore) -> Self {
        Self { store }
    }

    pub fn enqueue(
        &self,
        kind: JobKind,
        memory_id: &MemoryId,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let payload = encode_payload(memory_id)?;
        let id = self
            .store
            .with_conn(|conn| insert_job(conn, kind, &payload, max_attempts, now))?;
        debug!(job_id = id, kind = kind.as_str(), memory_id = %memory_id, "Job enqueued");
        Ok(id)
    }

    /// Insert `entry` and its first job in one transaction, so a stored entry
    /// always has work queued for it.
    pub fn enqueue_with_entry(
        &self,
        entry: &MemoryEntry,
        kind: JobKind,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let payload = encode_payload(&entry.id)?;
        let metadata = encode_metadata(entry)?;
        let id = self.store.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            insert_entry_row(&tx, entry, metadata.as_deref())?;
            let id = insert_job(&tx, kind, &payload, max_attempts, now)?;
            tx.commit()?;
            Ok(id)
        })?;
        debug!(job_id = id, kind = kind.as_str(), memory_id = %entry.id, "Entry stored with job");
        Ok(id)
    }

    /// Atomically take the oldest due pending job.
    pub fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let claimed: Option<i64> = self.store.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM jobs WHERE status = 'pending' AND run_after <= ?1
                     ORDER BY run_after ASC, id ASC LIMIT 1",
                    params![fmt_ts(now)],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = id {
                tx.execute(
                    "UPDATE jobs SET status = 'running', attempts = attempts + 1, updated_at = ?2
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, fmt_ts(now)],
                )?;
            }
            tx.commit()?;
            Ok(id)
        })?;

        match claimed {
            Some(id) => self.get(id),
            None => Ok(None),
        }
    }

    pub fn get(&self, id: i64) -> Result<Option<Job>> {
        let row = self.store.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                RawJob::from_row,
            )
            .optional()
        })?;
        row.map(RawJob::into_job).transpose()
    }

    pub fn complete(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'done', last_error = NULL, updated_at = ?2 WHERE id = ?1",
                params![id, fmt_ts(now)],
            )?;
            Ok(())
        })
    }

    /// Record a failed attempt. Reschedules after `retry_after` unless it is
    /// `None` or attempts are exhausted; returns the job's new status.
    pub fn fail(
        &self,
        job: &Job,
        error: &str,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<JobStatus> {
        let (status, backoff) = match retry_after {
            Some(backoff) if !job.is_final_attempt() => (JobStatus::Pending, backoff),
            _ => (JobStatus::Failed, Duration::zero()),
        };
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET status = ?2, last_error = ?3, run_after = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![
                    job.id,
                    status.as_str(),
                    error,
                    fmt_ts(now + backoff),
                    fmt_ts(now)
                ],
            )?;
            Ok(())
        })?;
        if status == JobStatus::Failed {
            warn!(
                job_id = job.id,
                kind = job.kind.as_str(),
                memory_id = %job.payload.memory_id,
                attempts = job.attempts,
                error,
                "Job failed permanently"
            );
        } else {
            debug!(
                job_id = job.id,
                attempt = job.attempts,
                backoff_ms = backoff.num_milliseconds(),
                error,
                "Job attempt failed, rescheduled"
            );
        }
        Ok(status)
    }

    /// Return jobs left `running` by a previous process to `pending`.
    pub fn recover(&self, now: DateTime<Utc>) -> Result<usize> {
        self.store.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE jobs SET status = 'pending', updated_at = ?1 WHERE status = 'running'",
                params![fmt_ts(now)],
            )?;
            Ok(n)
        })
    }

    pub fn failed_jobs(&self) -> Result<Vec<Job>> {
        self.jobs_with_status(JobStatus::Failed)
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM jobs WHERE status = ?1 ORDER BY id ASC",
                JOB_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![status.as_str()], RawJob::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(RawJob::into_job).collect()
    }

    pub fn counts(&self) -> Result<HashMap<JobStatus, i64>> {
        let rows: Vec<(String, i64)> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        Ok(rows
            .into_iter()
            .filter_map(|(s, n)| s.parse::<JobStatus>().ok().map(|s| (s, n)))
            .collect())
    }

    /// Pending or running jobs remain.
    pub fn has_outstanding(&self) -> Result<bool> {
        self.store.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE status IN ('pending', 'running')",
                [],
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }
}

fn encode_payload(memory_id: &MemoryId) -> Result<String> {
    Ok(serde_json::to_string(&JobPayload {
        memory_id: memory_id.clone(),
    })?)
}

fn insert_job(
    conn: &Connection,
    kind: JobKind,
    payload: &str,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO jobs (kind, payload, status, attempts, max_attempts, run_after, created_at, updated_at)
         VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?4, ?4)",
        params![kind.as_str(), payload, max_attempts.max(1), fmt_ts(now)],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Row as stored, before enum and payload parsing.
struct RawJob {
    id: i64,
    kind: String,
    payload: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    last_error: Option<String>,
    run_after: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RawJob {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            payload: row.get(2)?,
            status: row.get(3)?,
            attempts: row.get(4)?,
            max_attempts: row.get(5)?,
            last_error: row.get(6)?,
            run_after: parse_ts(row, 7)?,
            created_at: parse_ts(row, 8)?,
            updated_at: parse_ts(row, 9)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let kind: JobKind = self.kind.parse()?;
        let status: JobStatus = self.status.parse()?;
        Ok(Job {
            id: self.id,
            kind,
            payload: serde_json::from_str(&self.payload)?,
            status,
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(0) as u32,
            last_error: self.last_error,
            run_after: self.run_after,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryType, Scope};

    fn queue() -> JobQueue {
        JobQueue::new(SqliteMemoryStore::in_memory().unwrap())
    }

    fn entry(text: &str) -> MemoryEntry {
        MemoryEntry::new(Scope::new("acme", "eng"), MemoryType::Semantic, text)
    }

    #[test]
    fn test_entry_and_job_commit_together() {
        let q = queue();
        let now = Utc::now();
        let stored = entry("Queue depth alarms fire nightly");
        let job_id = q
            .enqueue_with_entry(&stored, JobKind::ProcessEntry, 3, now)
            .unwrap();
        assert!(q.store.get_entry(&stored.id).unwrap().is_some());
        assert_eq!(q.get(job_id).unwrap().unwrap().payload.memory_id, stored.id);

        q.store
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_jobs BEFORE INSERT ON jobs
                     BEGIN SELECT RAISE(ABORT, 'queue full'); END;",
                )
            })
            .unwrap();
        let dropped = entry("Never stored");
        assert!(q
            .enqueue_with_entry(&dropped, JobKind::ProcessEntry, 3, now)
            .is_err());
        assert!(q.store.get_entry(&dropped.id).unwrap().is_none());
    }

    #[test]
    fn test_kind_and_status_strings() {
        assert_eq!(JobKind::DetectConflicts.as_str(), "detect_conflicts");
        assert_eq!("process_entry".parse::<JobKind>().unwrap(), JobKind::ProcessEntry);
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
        assert!("paused".parse::<JobStatus>().is_err());
        assert_eq!(JobStatus::Running.to_string(), "running");
    }

    #[test]
    fn test_claim_order_and_exclusivity() {
        let q = queue();
        let now = Utc::now();
        let a = MemoryId::new();
        let b = MemoryId::new();
        let first = q.enqueue(JobKind::ProcessEntry, &a, 3, now).unwrap();
        let second = q.enqueue(JobKind::ProcessEntry, &b, 3, now).unwrap();

        let job = q.claim_next(now).unwrap().unwrap();
        assert_eq!(job.id, first);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.payload.memory_id, a);

        let job2 = q.claim_next(now).unwrap().unwrap();
        assert_eq!(job2.id, second);
        assert!(q.claim_next(now).unwrap().is_none());
    }

    #[test]
    fn test_backoff_then_permanent_failure() {
        let q = queue();
        let now = Utc::now();
        let id = q.enqueue(JobKind::ProcessEntry, &MemoryId::new(), 2, now).unwrap();

        let job = q.claim_next(now).unwrap().unwrap();
        let status = q.fail(&job, "model down", Some(Duration::seconds(10)), now).unwrap();
        assert_eq!(status, JobStatus::Pending);
        // Not due yet.
        assert!(q.claim_next(now).unwrap().is_none());

        let later = now + Duration::seconds(11);
        let job = q.claim_next(later).unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert!(job.is_final_attempt());
        let status = q.fail(&job, "model still down", Some(Duration::seconds(10)), later).unwrap();
        assert_eq!(status, JobStatus::Failed);

        let failed = q.failed_jobs().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, id);
        assert_eq!(failed[0].last_error.as_deref(), Some("model still down"));
        assert!(!q.has_outstanding().unwrap());
    }

    #[test]
    fn test_fail_without_retry_is_final() {
        let q = queue();
        let now = Utc::now();
        q.enqueue(JobKind::ProcessEntry, &MemoryId::new(), 5, now).unwrap();
        let job = q.claim_next(now).unwrap().unwrap();
        assert!(!job.is_final_attempt());
        let status = q.fail(&job, "malformed", None, now).unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(q.failed_jobs().unwrap().len(), 1);
    }

    #[test]
    fn test_complete_counts_and_recover() {
        let q = queue();
        let now = Utc::now();
        q.enqueue(JobKind::ProcessEntry, &MemoryId::new(), 3, now).unwrap();
        q.enqueue(JobKind::DetectConflicts, &MemoryId::new(), 3, now).unwrap();

        let job = q.claim_next(now).unwrap().unwrap();
        q.complete(job.id, now).unwrap();
        let orphan = q.claim_next(now).unwrap().unwrap();
        assert_eq!(orphan.kind, JobKind::DetectConflicts);

        let counts = q.counts().unwrap();
        assert_eq!(counts.get(&JobStatus::Done), Some(&1));
        assert_eq!(counts.get(&JobStatus::Running), Some(&1));

        assert_eq!(q.recover(now).unwrap(), 1);
        assert_eq!(q.jobs_with_status(JobStatus::Pending).unwrap().len(), 1);
        assert!(q.has_outstanding().unwrap());
    }
}
