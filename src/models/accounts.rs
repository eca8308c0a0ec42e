use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::string_enum;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountPurpose {
    MainWallet,
    PooledFund,
}

string_enum!(AccountPurpose, "account purpose", {
    MainWallet => "main_wallet",
    PooledFund => "pooled_fund",
});

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Account {
    pub id: Uuid,
    pub user_id: Uuid,
    pub purpose: AccountPurpose,
    /// Minor currency units, never negative.
    pub balance: i64,
    pub external_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Beneficiary {
    pub id: Uuid,
    pub user_id: Uuid,
    pub external_counterparty_ref: String,
    pub account_name: String,
    pub account_number: String,
    pub bank_code: String,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewBeneficiary {
    pub account_name: String,
    pub account_number: String,
    pub bank_code: String,
    #[serde(default)]
    pub is_default: bool,
}
