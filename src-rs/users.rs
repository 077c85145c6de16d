use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::{convex::ConvexClient, entitlement::UserRecord, ledger::UserId};

/// Lookup of the externally owned user record.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Returns the user's entitlement fields, creating a default record if the
    /// user has never been seen.
    async fn get_or_create(&self, user_id: UserId) -> anyhow::Result<UserRecord>;
}

#[derive(Debug, Deserialize)]
struct ConvexUserRecord {
    #[serde(rename = "telegramId")]
    telegram_id: f64,
    #[serde(rename = "isPremium", default)]
    is_premium: bool,
    #[serde(rename = "trialExpiry", default)]
    trial_expiry: Option<f64>,
}

impl ConvexUserRecord {
    fn into_user_record(self, requested: UserId) -> anyhow::Result<UserRecord> {
        let user_id = self.telegram_id as i64;
        if user_id != requested {
            anyhow::bail!(
                "Convex returned user {} for lookup of user {}",
                user_id,
                requested
            );
        }
        let trial_expiry = match self.trial_expiry {
            Some(millis) if millis.is_finite() => Some(
                DateTime::<Utc>::from_timestamp_millis(millis as i64)
                    .ok_or_else(|| anyhow::anyhow!("trialExpiry out of range: {millis}"))?,
            ),
            _ => None,
        };
        Ok(UserRecord {
            user_id,
            is_premium: self.is_premium,
            trial_expiry,
        })
    }
}

#[derive(Clone)]
pub struct ConvexUserDirectory {
    convex: ConvexClient,
}

impl ConvexUserDirectory {
    pub fn new(convex: ConvexClient) -> Self {
        Self { convex }
    }
}

#[async_trait]
impl UserDirectory for ConvexUserDirectory {
    async fn get_or_create(&self, user_id: UserId) -> anyhow::Result<UserRecord> {
        let record: ConvexUserRecord = self
            .convex
            .mutation("users:getOrCreate", json!({ "telegramId": user_id }))
            .await?;
        record.into_user_record(user_id)
    }
}
