use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::users::IdentityDetails;

pub const VERIFICATION_APPROVED: &str = "customer.identification.approved";
pub const VERIFICATION_REJECTED: &str = "customer.identification.rejected";

/// Top-level webhook body as sent by the provider (JSON:API style).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WebhookPayload {
    pub data: WebhookData,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WebhookData {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
    #[serde(default)]
    pub relationships: WebhookRelationships,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct WebhookRelationships {
    pub customer: Option<RelationshipData>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RelationshipData {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl WebhookData {
    pub fn customer_ref(&self) -> Option<&str> {
        self.relationships
            .customer
            .as_ref()
            .map(|c| c.id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// Provider-supplied rejection reason, if any.
    pub fn rejection_reason(&self) -> Option<String> {
        ["reason", "message"]
            .iter()
            .find_map(|key| self.attributes.get(key).and_then(|v| v.as_str()))
            .map(str::to_string)
    }
}

#[derive(Clone, Debug)]
pub struct CreateCustomer<'a> {
    pub user_id: Uuid,
    pub details: &'a IdentityDetails,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CustomerKind {
    Individual,
    Business,
}

impl CustomerKind {
    pub const fn remote_type(&self) -> &'static str {
        match self {
            Self::Individual => "IndividualCustomer",
            Self::Business => "BusinessCustomer",
        }
    }

    pub const fn wallet_product(&self) -> &'static str {
        match self {
            Self::Individual => "SAVINGS",
            Self::Business => "CURRENT",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CreateDepositAccount<'a> {
    pub user_id: Uuid,
    pub customer_ref: &'a str,
    pub kind: CustomerKind,
}

#[derive(Clone, Debug)]
pub struct CreateCounterparty<'a> {
    pub user_id: Uuid,
    pub account_name: &'a str,
    pub account_number: &'a str,
    pub bank_code: &'a str,
}

#[derive(Clone, Debug)]
pub struct CreateTransfer<'a> {
    /// Local transaction id, reused as the remote reference.
    pub transaction_id: Uuid,
    pub source_account_ref: &'a str,
    pub counterparty_ref: &'a str,
    pub amount: i64,
    pub reason: Option<&'a str>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteTransferStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTransfer {
    pub id: String,
    pub status: RemoteTransferStatus,
}

/// `{ "data": { "id": ..., "attributes": {...} } }`
#[derive(Debug, Deserialize)]
pub struct ResourceEnvelope<A> {
    pub data: Resource<A>,
}

#[derive(Debug, Deserialize)]
pub struct Resource<A> {
    pub id: String,
    pub attributes: Option<A>,
}

#[derive(Debug, Deserialize)]
pub struct TransferAttributes {
    pub status: RemoteTransferStatus,
}
