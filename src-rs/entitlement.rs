use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::UserId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Trial,
    Premium,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Trial => "trial",
            Tier::Premium => "premium",
        }
    }

    pub fn is_unlimited(self) -> bool {
        !matches!(self, Tier::Free)
    }
}

/// Snapshot of the entitlement fields of an externally owned user record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: UserId,
    pub is_premium: bool,
    pub trial_expiry: Option<DateTime<Utc>>,
}

impl UserRecord {
    pub fn free(user_id: UserId) -> Self {
        Self {
            user_id,
            is_premium: false,
            trial_expiry: None,
        }
    }
}

pub fn resolve_tier(user: &UserRecord, now: DateTime<Utc>) -> Tier {
    if user.is_premium {
        return Tier::Premium;
    }
    match user.trial_expiry {
        Some(expiry) if now < expiry => Tier::Trial,
        _ => Tier::Free,
    }
}

pub fn is_unlimited(user: &UserRecord, now: DateTime<Utc>) -> bool {
    resolve_tier(user, now).is_unlimited()
}
