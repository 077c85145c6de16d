use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::{now_millis, Store, StoreError};

pub type UserId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageCounter {
    pub user_id: UserId,
    pub day: NaiveDate,
    pub conversion_count: i64,
    pub notification_sent: bool,
}

/// One conversion to be charged against a user's daily counter. `limit` is
/// `None` for users whose usage is tracked but never enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageCharge {
    pub user_id: UserId,
    pub day: NaiveDate,
    pub limit: Option<i64>,
}

/// Calendar day a usage counter belongs to. Days roll over at UTC midnight.
pub fn usage_day(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// Per-user, per-day conversion counters.
///
/// Each operation is a single statement (or a single transaction) so that
/// concurrent admissions for the same user never lose an update.
#[derive(Clone)]
pub struct UsageLedger {
    store: Store,
}

impl UsageLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn get_or_create(
        &self,
        user_id: UserId,
        day: NaiveDate,
    ) -> Result<UsageCounter, StoreError> {
        let key = day_key(day);
        self.store
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO usage_counters (user_id, day, conversion_count, notification_sent, created_at)
                     VALUES (?1, ?2, 0, 0, ?3)
                     ON CONFLICT(user_id, day) DO NOTHING",
                    params![user_id, key, now_millis()],
                )?;
                let (conversion_count, notification_sent) = tx.query_row(
                    "SELECT conversion_count, notification_sent FROM usage_counters
                     WHERE user_id = ?1 AND day = ?2",
                    params![user_id, key],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?)),
                )?;
                tx.commit()?;
                Ok(UsageCounter {
                    user_id,
                    day,
                    conversion_count,
                    notification_sent,
                })
            })
            .await
    }

    /// Adds one conversion and returns the new count.
    pub async fn increment(&self, user_id: UserId, day: NaiveDate) -> Result<i64, StoreError> {
        let key = day_key(day);
        self.store
            .call(move |conn| {
                conn.query_row(
                    "INSERT INTO usage_counters (user_id, day, conversion_count, notification_sent, created_at)
                     VALUES (?1, ?2, 1, 0, ?3)
                     ON CONFLICT(user_id, day) DO UPDATE SET conversion_count = conversion_count + 1
                     RETURNING conversion_count",
                    params![user_id, key, now_millis()],
                    |row| row.get(0),
                )
            })
            .await
    }

    /// Adds one conversion only while the count is below `limit` (no limit
    /// when `None`). Returns the new count, or `None` when the limit was
    /// already reached.
    pub async fn try_increment(
        &self,
        user_id: UserId,
        day: NaiveDate,
        limit: Option<i64>,
    ) -> Result<Option<i64>, StoreError> {
        self.store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let charged = charge_within(&tx, user_id, day, limit)?;
                tx.commit()?;
                Ok(charged)
            })
            .await
    }

    pub async fn has_notified(&self, user_id: UserId, day: NaiveDate) -> Result<bool, StoreError> {
        let key = day_key(day);
        self.store
            .call(move |conn| {
                let flag: Option<bool> = conn
                    .query_row(
                        "SELECT notification_sent FROM usage_counters WHERE user_id = ?1 AND day = ?2",
                        params![user_id, key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(flag.unwrap_or(false))
            })
            .await
    }

    /// Sets the notification flag. Returns `true` only for the call that
    /// flipped it from unset to set; repeated calls are no-ops.
    pub async fn mark_notified(&self, user_id: UserId, day: NaiveDate) -> Result<bool, StoreError> {
        let key = day_key(day);
        self.store
            .call(move |conn| {
                let changed = conn.execute(
                    "INSERT INTO usage_counters (user_id, day, conversion_count, notification_sent, created_at)
                     VALUES (?1, ?2, 0, 1, ?3)
                     ON CONFLICT(user_id, day) DO UPDATE SET notification_sent = 1
                     WHERE notification_sent = 0",
                    params![user_id, key, now_millis()],
                )?;
                Ok(changed == 1)
            })
            .await
    }
}

/// Guarded increment on an open connection, so callers can charge usage in
/// the same transaction as the work being paid for.
pub(crate) fn charge_within(
    conn: &Connection,
    user_id: UserId,
    day: NaiveDate,
    limit: Option<i64>,
) -> rusqlite::Result<Option<i64>> {
    let key = day_key(day);
    conn.execute(
        "INSERT INTO usage_counters (user_id, day, conversion_count, notification_sent, created_at)
         VALUES (?1, ?2, 0, 0, ?3)
         ON CONFLICT(user_id, day) DO NOTHING",
        params![user_id, key, now_millis()],
    )?;
    conn.query_row(
        "UPDATE usage_counters SET conversion_count = conversion_count + 1
         WHERE user_id = ?1 AND day = ?2 AND (?3 IS NULL OR conversion_count < ?3)
         RETURNING conversion_count",
        params![user_id, key, limit],
        |row| row.get(0),
    )
    .optional()
}
