use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
    ledger::{charge_within, UsageCharge, UserId},
    store::{Store, StoreError},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    /// Transient: a failed attempt that went back to `Queued`.
    FailedRetryable,
    FailedTerminal,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::FailedRetryable => "failed_retryable",
            JobState::FailedTerminal => "failed_terminal",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "succeeded" => Some(JobState::Succeeded),
            "failed_retryable" => Some(JobState::FailedRetryable),
            "failed_terminal" => Some(JobState::FailedTerminal),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::FailedTerminal)
    }
}

/// Password for an encrypted input. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct DecryptionSecret(String);

impl DecryptionSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DecryptionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DecryptionSecret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: UserId,
    pub input_path: PathBuf,
    pub file_name: String,
    pub secret: Option<DecryptionSecret>,
}

#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub id: String,
    pub user_id: UserId,
    pub input_path: PathBuf,
    pub file_name: String,
    pub secret: Option<DecryptionSecret>,
    /// Failed attempts so far.
    pub attempts: u32,
    pub state: JobState,
    pub lease_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Whether a job that has already failed `attempts` times may run again
    /// after one more failure.
    pub fn allows_retry_after(&self, attempts: u32) -> bool {
        attempts.saturating_add(1) < self.max_attempts.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    FailedTerminal { reason: String },
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    Requeued { attempts: u32, visible_at: DateTime<Utc> },
    Terminal { attempts: u32 },
    /// The job is no longer leased to the caller (reclaimed by the reaper).
    LeaseLost,
}

#[derive(Debug, Clone)]
pub struct ReapedJob {
    pub job: ConversionJob,
    pub disposition: FailureDisposition,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub queued: i64,
    pub running: i64,
}

const JOB_COLUMNS: &str = "id, user_id, input_path, file_name, password, state, attempts, lease_id, last_error, created_at, visible_at, started_at";

fn millis_to_datetime(value: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(value).unwrap_or_default()
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<ConversionJob> {
    let state_text: String = row.get(5)?;
    let state = JobState::parse(&state_text)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(5, "state".to_string(), Type::Text))?;
    let input_path: String = row.get(2)?;
    let password: Option<String> = row.get(4)?;
    let attempts: i64 = row.get(6)?;
    let started_at: Option<i64> = row.get(11)?;

    Ok(ConversionJob {
        id: row.get(0)?,
        user_id: row.get(1)?,
        input_path: PathBuf::from(input_path),
        file_name: row.get(3)?,
        secret: password.map(DecryptionSecret),
        attempts: attempts.max(0) as u32,
        state,
        lease_id: row.get(7)?,
        last_error: row.get(8)?,
        created_at: millis_to_datetime(row.get(9)?),
        visible_at: millis_to_datetime(row.get(10)?),
        started_at: started_at.map(millis_to_datetime),
    })
}

fn queued_job(job: NewJob) -> ConversionJob {
    let now = Utc::now();
    ConversionJob {
        id: Uuid::new_v4().to_string(),
        user_id: job.user_id,
        input_path: job.input_path,
        file_name: job.file_name,
        secret: job.secret,
        attempts: 0,
        state: JobState::Queued,
        lease_id: None,
        last_error: None,
        created_at: now,
        visible_at: now,
        started_at: None,
    }
}

fn insert_job(conn: &Connection, job: &ConversionJob) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO jobs (id, user_id, input_path, file_name, password, state, attempts, created_at, visible_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'queued', 0, ?6, ?6)",
        params![
            job.id,
            job.user_id,
            job.input_path.to_string_lossy().to_string(),
            job.file_name,
            job.secret.as_ref().map(|secret| secret.expose().to_string()),
            job.created_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Durable job queue with leased, at-least-once delivery.
///
/// A dequeued job carries a fresh lease id; every later transition is
/// conditioned on that lease so a worker whose job was reclaimed by the
/// reaper cannot overwrite the newer state.
#[derive(Clone)]
pub struct JobQueue {
    store: Store,
    policy: RetryPolicy,
    wakeup: Arc<Notify>,
}

impl JobQueue {
    pub fn new(store: Store, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn enqueue(&self, job: NewJob) -> Result<ConversionJob, StoreError> {
        let stored = queued_job(job);
        let row = stored.clone();
        self.store
            .call(move |conn| insert_job(conn, &row))
            .await?;

        self.wakeup.notify_one();
        Ok(stored)
    }

    /// Charges the submitter's usage and enqueues the job in one
    /// transaction. Returns `None`, with nothing written, when the charge
    /// would exceed the daily limit.
    pub async fn enqueue_charged(
        &self,
        job: NewJob,
        charge: UsageCharge,
    ) -> Result<Option<ConversionJob>, StoreError> {
        let stored = queued_job(job);
        let row = stored.clone();
        let charged = self
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(count) =
                    charge_within(&tx, charge.user_id, charge.day, charge.limit)?
                else {
                    return Ok(None);
                };
                insert_job(&tx, &row)?;
                tx.commit()?;
                Ok(Some(count))
            })
            .await?;

        let Some(count) = charged else {
            return Ok(None);
        };
        tracing::debug!(user_id = stored.user_id, job_id = %stored.id, count, "usage charged");
        self.wakeup.notify_one();
        Ok(Some(stored))
    }

    pub async fn try_dequeue(&self) -> Result<Option<ConversionJob>, StoreError> {
        self.try_dequeue_at(Utc::now()).await
    }

    /// Claims the oldest visible queued job, moving it to `running` under a
    /// new lease. A single statement, so two callers never get the same job.
    pub async fn try_dequeue_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<ConversionJob>, StoreError> {
        let lease_id = Uuid::new_v4().to_string();
        let now_ms = now.timestamp_millis();
        self.store
            .call(move |conn| {
                conn.query_row(
                    &format!(
                        "UPDATE jobs SET state = 'running', lease_id = ?1, started_at = ?2
                         WHERE id = (
                             SELECT id FROM jobs
                             WHERE state = 'queued' AND visible_at <= ?2
                             ORDER BY visible_at ASC, created_at ASC
                             LIMIT 1
                         )
                         RETURNING {JOB_COLUMNS}"
                    ),
                    params![lease_id, now_ms],
                    job_from_row,
                )
                .optional()
            })
            .await
    }

    /// Waits until a job is available. Delayed jobs are picked up by polling
    /// every `poll_interval`; fresh enqueues wake a waiter immediately.
    pub async fn dequeue(&self, poll_interval: Duration) -> Result<ConversionJob, StoreError> {
        loop {
            if let Some(job) = self.try_dequeue().await? {
                return Ok(job);
            }
            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Returns a running job to `queued`, visible again after `delay`, and
    /// counts the failed attempt. Returns `false` if the lease was lost.
    pub async fn requeue(
        &self,
        job: &ConversionJob,
        delay: Duration,
        last_error: &str,
    ) -> Result<bool, StoreError> {
        let id = job.id.clone();
        let lease_id = job.lease_id.clone();
        let last_error = last_error.to_string();
        let visible_at = Utc::now().timestamp_millis().saturating_add(duration_millis(delay));
        self.store
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE jobs SET state = 'queued', attempts = attempts + 1, lease_id = NULL,
                         started_at = NULL, visible_at = ?1, last_error = ?2
                     WHERE id = ?3 AND state = 'running' AND lease_id IS ?4",
                    params![visible_at, last_error, id, lease_id],
                )?;
                Ok(changed == 1)
            })
            .await
    }

    /// Moves a running job to a terminal state and drops its stored secret.
    /// `count_attempt` adds the final failed attempt to the counter.
    pub async fn complete(
        &self,
        job: &ConversionJob,
        outcome: &JobOutcome,
        count_attempt: bool,
    ) -> Result<bool, StoreError> {
        let id = job.id.clone();
        let lease_id = job.lease_id.clone();
        let (state, last_error) = match outcome {
            JobOutcome::Succeeded => (JobState::Succeeded, None),
            JobOutcome::FailedTerminal { reason } => {
                (JobState::FailedTerminal, Some(reason.clone()))
            }
        };
        let increment = i64::from(count_attempt);
        let now_ms = Utc::now().timestamp_millis();
        self.store
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE jobs SET state = ?1, attempts = attempts + ?2, last_error = COALESCE(?3, last_error),
                         finished_at = ?4, lease_id = NULL, password = NULL
                     WHERE id = ?5 AND state = 'running' AND lease_id IS ?6",
                    params![state.as_str(), increment, last_error, now_ms, id, lease_id],
                )?;
                Ok(changed == 1)
            })
            .await
    }

    /// Applies the retry policy to a retryable failure: requeue with backoff
    /// while budget remains, otherwise terminalize.
    pub async fn fail_attempt(
        &self,
        job: &ConversionJob,
        diagnostic: &str,
    ) -> Result<FailureDisposition, StoreError> {
        let attempts = job.attempts + 1;
        if self.policy.allows_retry_after(job.attempts) {
            let visible_at = millis_to_datetime(
                Utc::now().timestamp_millis().saturating_add(duration_millis(self.policy.backoff)),
            );
            if self.requeue(job, self.policy.backoff, diagnostic).await? {
                return Ok(FailureDisposition::Requeued {
                    attempts,
                    visible_at,
                });
            }
            return Ok(FailureDisposition::LeaseLost);
        }

        let outcome = JobOutcome::FailedTerminal {
            reason: format!("retries exhausted: {}", diagnostic),
        };
        if self.complete(job, &outcome, true).await? {
            Ok(FailureDisposition::Terminal { attempts })
        } else {
            Ok(FailureDisposition::LeaseLost)
        }
    }

    pub async fn reap_expired(
        &self,
        hard_limit: Duration,
    ) -> Result<Vec<ReapedJob>, StoreError> {
        self.reap_expired_at(Utc::now(), hard_limit).await
    }

    /// Reclaims jobs that have been `running` longer than `hard_limit`,
    /// whether or not their worker is still alive. Each reclaim counts as a
    /// failed attempt under the normal retry policy.
    pub async fn reap_expired_at(
        &self,
        now: DateTime<Utc>,
        hard_limit: Duration,
    ) -> Result<Vec<ReapedJob>, StoreError> {
        let policy = self.policy;
        let now_ms = now.timestamp_millis();
        let cutoff = now_ms.saturating_sub(duration_millis(hard_limit));
        let retry_at = now_ms.saturating_add(duration_millis(policy.backoff));
        let reason = format!("exceeded hard time limit of {}s", hard_limit.as_secs());

        let reaped = self
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let expired = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {JOB_COLUMNS} FROM jobs
                         WHERE state = 'running' AND started_at IS NOT NULL AND started_at <= ?1"
                    ))?;
                    let rows = stmt
                        .query_map(params![cutoff], job_from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };

                let mut reaped = Vec::with_capacity(expired.len());
                for job in expired {
                    let attempts = job.attempts + 1;
                    let disposition = if policy.allows_retry_after(job.attempts) {
                        tx.execute(
                            "UPDATE jobs SET state = 'queued', attempts = ?1, lease_id = NULL,
                                 started_at = NULL, visible_at = ?2, last_error = ?3
                             WHERE id = ?4",
                            params![attempts, retry_at, reason, job.id],
                        )?;
                        FailureDisposition::Requeued {
                            attempts,
                            visible_at: millis_to_datetime(retry_at),
                        }
                    } else {
                        tx.execute(
                            "UPDATE jobs SET state = 'failed_terminal', attempts = ?1, lease_id = NULL,
                                 finished_at = ?2, last_error = ?3, password = NULL
                             WHERE id = ?4",
                            params![attempts, now_ms, format!("retries exhausted: {}", reason), job.id],
                        )?;
                        FailureDisposition::Terminal { attempts }
                    };
                    reaped.push(ReapedJob { job, disposition });
                }
                tx.commit()?;
                Ok(reaped)
            })
            .await?;

        if reaped
            .iter()
            .any(|entry| matches!(entry.disposition, FailureDisposition::Requeued { .. }))
        {
            self.wakeup.notify_one();
        }
        Ok(reaped)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ConversionJob>, StoreError> {
        let id = id.to_string();
        self.store
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                    params![id],
                    job_from_row,
                )
                .optional()
            })
            .await
    }

    pub async fn depth(&self) -> Result<QueueDepth, StoreError> {
        self.store
            .call(|conn| {
                conn.query_row(
                    "SELECT
                         COALESCE(SUM(CASE WHEN state = 'queued' THEN 1 ELSE 0 END), 0),
                         COALESCE(SUM(CASE WHEN state = 'running' THEN 1 ELSE 0 END), 0)
                     FROM jobs",
                    [],
                    |row| {
                        Ok(QueueDepth {
                            queued: row.get(0)?,
                            running: row.get(1)?,
                        })
                    },
                )
            })
            .await
    }
}
