use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::string_enum;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Personal,
    Merchant,
}

string_enum!(AccountType, "account type", {
    Personal => "personal",
    Merchant => "merchant",
});

impl AccountType {
    /// Merchants are receive-only until explicitly enabled.
    pub const fn allows_sending_by_default(&self) -> bool {
        matches!(self, Self::Personal)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Approved,
    Rejected,
}

string_enum!(VerificationStatus, "verification status", {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

impl VerificationStatus {
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct User {
    pub id: Uuid,
    pub subject: String,
    pub username: String,
    pub account_type: AccountType,
    pub verification_status: VerificationStatus,
    pub external_customer_ref: Option<String>,
    pub allow_sending: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct KycDetails {
    pub full_name: String,
    pub bvn: String,
    pub date_of_birth: String, // YYYY-MM-DD
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct KybDetails {
    pub business_name: String,
    pub rc_number: String,
    pub registration_date: String, // YYYY-MM-DD
    pub industry: String,
    pub contact_email: String,
    pub address: BusinessAddress,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BusinessAddress {
    pub line_1: String,
    pub city: String,
    pub state: String,
    pub country: String,
}

/// Identity details captured at signup, keyed by account type.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityDetails {
    Kyc(KycDetails),
    Kyb(KybDetails),
}

impl IdentityDetails {
    pub const fn account_type(&self) -> AccountType {
        match self {
            Self::Kyc(_) => AccountType::Personal,
            Self::Kyb(_) => AccountType::Merchant,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewUser {
    pub subject: String,
    pub username: String,
    pub account_type: AccountType,
    pub details: IdentityDetails,
}
