use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::string_enum;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    P2pExternal,
    P2pInternal,
    MoneyDropFunding,
    MoneyDropClaim,
    MoneyDropRefund,
    PaymentRequest,
}

string_enum!(TransactionType, "transaction type", {
    P2pExternal => "p2p_external",
    P2pInternal => "p2p_internal",
    MoneyDropFunding => "money_drop_funding",
    MoneyDropClaim => "money_drop_claim",
    MoneyDropRefund => "money_drop_refund",
    PaymentRequest => "payment_request",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Reversed,
}

string_enum!(TransactionStatus, "transaction status", {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Reversed => "reversed",
});

impl TransactionStatus {
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Where the money of a transaction lands. Exactly one per transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Destination {
    Account(Uuid),
    Beneficiary(Uuid),
}

impl Destination {
    pub const fn account_id(&self) -> Option<Uuid> {
        match self {
            Self::Account(id) => Some(*id),
            Self::Beneficiary(_) => None,
        }
    }

    pub const fn beneficiary_id(&self) -> Option<Uuid> {
        match self {
            Self::Beneficiary(id) => Some(*id),
            Self::Account(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub sender_id: Option<Uuid>,
    pub recipient_id: Option<Uuid>,
    pub source_account_id: Option<Uuid>,
    pub destination: Destination,
    pub external_transfer_ref: Option<String>,
    pub kind: TransactionType,
    pub amount: i64,
    pub status: TransactionStatus,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TransferRequest {
    pub recipient_id: Uuid,
    pub amount: i64,
    pub description: Option<String>,
}
