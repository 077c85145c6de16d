use async_trait::async_trait;
use rusqlite::params;

use crate::{
    ledger::UserId,
    store::{now_millis, Store, StoreError},
};

pub const CONVERSION_ACTION: &str = "conversion";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionStatus {
    Success,
    /// One failed attempt that will be retried.
    Failed,
    /// The job's single terminal failure record.
    FailedTerminal,
}

impl ConversionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversionStatus::Success => "success",
            ConversionStatus::Failed => "failed",
            ConversionStatus::FailedTerminal => "failed_terminal",
        }
    }
}

/// Append-only sink for conversion outcomes.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record(
        &self,
        user_id: UserId,
        job_id: Option<&str>,
        status: ConversionStatus,
        details: Option<&str>,
    ) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct SqliteAnalytics {
    store: Store,
}

impl SqliteAnalytics {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn count_for_job(
        &self,
        job_id: &str,
        status: ConversionStatus,
    ) -> Result<i64, StoreError> {
        let job_id = job_id.to_string();
        self.store
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM conversion_events WHERE job_id = ?1 AND status = ?2",
                    params![job_id, status.as_str()],
                    |row| row.get(0),
                )
            })
            .await
    }
}

#[async_trait]
impl AnalyticsSink for SqliteAnalytics {
    async fn record(
        &self,
        user_id: UserId,
        job_id: Option<&str>,
        status: ConversionStatus,
        details: Option<&str>,
    ) -> Result<(), StoreError> {
        let job_id = job_id.map(ToString::to_string);
        let details = details.map(truncate_details);
        self.store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO conversion_events (user_id, job_id, action, status, details, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        user_id,
                        job_id,
                        CONVERSION_ACTION,
                        status.as_str(),
                        details,
                        now_millis()
                    ],
                )?;
                Ok(())
            })
            .await
    }
}

fn truncate_details(details: &str) -> String {
    details.chars().take(500).collect()
}
