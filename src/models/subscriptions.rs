use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::string_enum;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Free,
    Active,
    PastDue,
    Cancelled,
}

string_enum!(SubscriptionStatus, "subscription status", {
    Free => "free",
    Active => "active",
    PastDue => "past_due",
    Cancelled => "cancelled",
});

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: SubscriptionStatus,
    pub period_transfers_used: i32,
    pub current_period_ends_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            status: self.status,
            period_transfers_used: self.period_transfers_used,
        }
    }
}

/// The subscription fields a routing decision depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SubscriptionSnapshot {
    pub status: SubscriptionStatus,
    pub period_transfers_used: i32,
}
