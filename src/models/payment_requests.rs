use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::string_enum;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentRequestStatus {
    Pending,
    Fulfilled,
}

string_enum!(PaymentRequestStatus, "payment request status", {
    Pending => "pending",
    Fulfilled => "fulfilled",
});

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PaymentRequest {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub amount: i64,
    pub description: Option<String>,
    pub status: PaymentRequestStatus,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub fulfilled_by_transaction_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewPaymentRequest {
    pub amount: i64,
    pub description: Option<String>,
}
