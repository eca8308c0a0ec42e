use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::string_enum;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MoneyDropStatus {
    Active,
    Completed,
    Expired,
}

string_enum!(MoneyDropStatus, "money drop status", {
    Active => "active",
    Completed => "completed",
    Expired => "expired",
});

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MoneyDrop {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub funding_account_id: Uuid,
    pub total_amount: i64,
    pub amount_per_claim: i64,
    pub total_claims_allowed: i32,
    pub claims_made_count: i32,
    pub status: MoneyDropStatus,
    pub expiry_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MoneyDrop {
    /// Funds not yet paid out to claimants.
    pub fn unclaimed_amount(&self) -> i64 {
        self.total_amount - i64::from(self.claims_made_count) * self.amount_per_claim
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MoneyDropClaim {
    pub id: Uuid,
    pub money_drop_id: Uuid,
    pub claimant_id: Uuid,
    pub transaction_id: Uuid,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewMoneyDrop {
    pub amount_per_claim: i64,
    pub total_claims_allowed: i32,
    pub expiry_timestamp: DateTime<Utc>,
}

/// Result of a successful claim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClaimReceipt {
    pub claim: MoneyDropClaim,
    pub drop: MoneyDrop,
    pub amount: i64,
}

/// Result of expiring a drop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExpiryRefund {
    pub drop: MoneyDrop,
    pub refunded: i64,
    pub transaction_id: Option<Uuid>,
}
