use chrono::{DateTime, Utc};

use crate::{
    entitlement::{is_unlimited, resolve_tier, Tier, UserRecord},
    ledger::{usage_day, UsageCharge, UsageLedger, UserId},
    store::StoreError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted {
        tier: Tier,
    },
    /// Daily limit reached. `notify` is set only for the first rejection of
    /// the day; the caller must emit exactly one limit notification for it.
    Rejected {
        notify: bool,
        conversion_count: i64,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// Daily admission control in front of the job queue.
///
/// `admit` is an early read-only check. The limit itself is enforced by the
/// guarded increment behind [`QuotaGate::charge_for`], which the queue
/// applies atomically with the job insert.
#[derive(Clone)]
pub struct QuotaGate {
    ledger: UsageLedger,
    daily_limit: i64,
}

impl QuotaGate {
    pub fn new(ledger: UsageLedger, daily_limit: i64) -> Self {
        Self {
            ledger,
            daily_limit,
        }
    }

    pub fn daily_limit(&self) -> i64 {
        self.daily_limit
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// Decides whether `user` may submit another conversion today. Never
    /// increments the counter.
    pub async fn admit(
        &self,
        user: &UserRecord,
        now: DateTime<Utc>,
    ) -> Result<Admission, StoreError> {
        if is_unlimited(user, now) {
            return Ok(Admission::Admitted {
                tier: resolve_tier(user, now),
            });
        }

        let day = usage_day(now);
        let counter = self.ledger.get_or_create(user.user_id, day).await?;
        if counter.conversion_count < self.daily_limit {
            return Ok(Admission::Admitted { tier: Tier::Free });
        }

        let notify = !counter.notification_sent && self.record_rejection(user.user_id, now).await?;
        Ok(Admission::Rejected {
            notify,
            conversion_count: counter.conversion_count,
        })
    }

    /// The charge for one accepted submission. Unlimited users are counted
    /// but never capped.
    pub fn charge_for(&self, user: &UserRecord, now: DateTime<Utc>) -> UsageCharge {
        UsageCharge {
            user_id: user.user_id,
            day: usage_day(now),
            limit: (!is_unlimited(user, now)).then_some(self.daily_limit),
        }
    }

    /// Charges one submission on its own. Returns the new daily count, or
    /// `None` when the limit was already reached.
    pub async fn consume(
        &self,
        user: &UserRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError> {
        let charge = self.charge_for(user, now);
        self.ledger
            .try_increment(charge.user_id, charge.day, charge.limit)
            .await
    }

    /// Records a rejection for today. Returns `true` only for the first one,
    /// which owes the user a limit notification. The conditional flip decides
    /// it, so racing rejections cannot both notify.
    pub async fn record_rejection(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.ledger.mark_notified(user_id, usage_day(now)).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::store::Store;

    fn gate() -> QuotaGate {
        QuotaGate::new(UsageLedger::new(Store::open_in_memory().unwrap()), 3)
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, day, hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn free_user_is_admitted_until_the_limit_then_notified_once() {
        let gate = gate();
        let user = UserRecord::free(12345);
        let now = at(5, 9);

        for expected in 1..=3 {
            assert!(gate.admit(&user, now).await.unwrap().is_admitted());
            assert_eq!(gate.consume(&user, now).await.unwrap(), Some(expected));
        }

        assert_eq!(
            gate.admit(&user, now).await.unwrap(),
            Admission::Rejected {
                notify: true,
                conversion_count: 3
            }
        );
        for _ in 0..5 {
            assert_eq!(
                gate.admit(&user, now).await.unwrap(),
                Admission::Rejected {
                    notify: false,
                    conversion_count: 3
                }
            );
        }

        let counter = gate
            .ledger()
            .get_or_create(12345, usage_day(now))
            .await
            .unwrap();
        assert_eq!(counter.conversion_count, 3);
        assert!(counter.notification_sent);
    }

    #[tokio::test]
    async fn limit_and_notification_reset_the_next_day() {
        let gate = gate();
        let user = UserRecord::free(8);
        for _ in 0..3 {
            gate.consume(&user, at(5, 10)).await.unwrap();
        }
        assert!(matches!(
            gate.admit(&user, at(5, 23)).await.unwrap(),
            Admission::Rejected { notify: true, .. }
        ));

        assert!(gate.admit(&user, at(6, 0)).await.unwrap().is_admitted());
        for _ in 0..3 {
            gate.consume(&user, at(6, 1)).await.unwrap();
        }
        assert!(matches!(
            gate.admit(&user, at(6, 2)).await.unwrap(),
            Admission::Rejected { notify: true, .. }
        ));
    }

    #[tokio::test]
    async fn unlimited_users_bypass_the_counter() {
        let gate = gate();
        let premium = UserRecord {
            is_premium: true,
            ..UserRecord::free(77)
        };
        let now = at(5, 9);

        for _ in 0..10 {
            assert_eq!(
                gate.admit(&premium, now).await.unwrap(),
                Admission::Admitted {
                    tier: Tier::Premium
                }
            );
        }
        let counter = gate.ledger().get_or_create(77, usage_day(now)).await.unwrap();
        assert_eq!(counter.conversion_count, 0);
        assert!(!counter.notification_sent);
    }

    #[tokio::test]
    async fn active_trial_is_unlimited_and_expired_trial_is_not() {
        let gate = gate();
        let now = at(5, 9);
        let trial = UserRecord {
            trial_expiry: Some(now + chrono::Duration::hours(1)),
            ..UserRecord::free(3)
        };
        for _ in 0..3 {
            gate.consume(&trial, now).await.unwrap();
        }
        assert_eq!(
            gate.admit(&trial, now).await.unwrap(),
            Admission::Admitted { tier: Tier::Trial }
        );

        let expired = UserRecord {
            trial_expiry: Some(now - chrono::Duration::seconds(1)),
            ..UserRecord::free(3)
        };
        assert!(!gate.admit(&expired, now).await.unwrap().is_admitted());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_rejections_notify_exactly_once() {
        let gate = gate();
        let user = UserRecord::free(500);
        let now = at(5, 9);
        for _ in 0..3 {
            gate.consume(&user, now).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = gate.clone();
            let user = user.clone();
            handles.push(tokio::spawn(async move { gate.admit(&user, now).await }));
        }

        let mut notified = 0;
        for handle in handles {
            if let Admission::Rejected { notify: true, .. } = handle.await.unwrap().unwrap() {
                notified += 1;
            }
        }
        assert_eq!(notified, 1);
    }

    #[tokio::test]
    async fn consume_refuses_past_the_limit_but_never_caps_unlimited_users() {
        let gate = gate();
        let now = at(5, 9);
        let free = UserRecord::free(21);
        for _ in 0..3 {
            assert!(gate.consume(&free, now).await.unwrap().is_some());
        }
        assert_eq!(gate.consume(&free, now).await.unwrap(), None);

        let premium = UserRecord {
            is_premium: true,
            ..UserRecord::free(22)
        };
        for expected in 1..=5 {
            assert_eq!(gate.consume(&premium, now).await.unwrap(), Some(expected));
        }
        assert_eq!(gate.charge_for(&premium, now).limit, None);
        assert_eq!(gate.charge_for(&free, now).limit, Some(3));
    }
}
