//! Event envelope exchanged over the bus.
//!
//! Payloads are a closed, tagged set. The wire form is
//! `{ "type", "idempotency_key", "payload", "occurred_at" }` and the payload is
//! validated against its type when the envelope is decoded, so consumers never
//! see loosely-typed JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::transactions::{Transaction, TransactionType};
use super::users::{AccountType, IdentityDetails};

pub const USER_CREATED: &str = "user.created";
pub const CUSTOMER_VERIFIED: &str = "customer.verified";
pub const CUSTOMER_VERIFICATION_REJECTED: &str = "customer.verification.rejected";
pub const TRANSFER_REROUTED_INTERNAL: &str = "transfer.rerouted.internal";
pub const TRANSACTION_COMPLETED: &str = "transaction.completed";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserCreated {
    pub user_id: Uuid,
    pub account_type: AccountType,
    #[serde(rename = "kyc_or_kyb_details")]
    pub details: IdentityDetails,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CustomerVerified {
    pub user_id: Uuid,
    pub external_customer_ref: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CustomerVerificationRejected {
    pub user_id: Uuid,
    pub external_customer_ref: String,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TransferReroutedInternal {
    pub transaction_id: Uuid,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TransactionCompleted {
    pub transaction_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub recipient_id: Option<Uuid>,
    pub amount: i64,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub timestamp: DateTime<Utc>,
}

impl From<&Transaction> for TransactionCompleted {
    fn from(transaction: &Transaction) -> Self {
        TransactionCompleted {
            transaction_id: transaction.id,
            sender_id: transaction.sender_id,
            recipient_id: transaction.recipient_id,
            amount: transaction.amount,
            kind: transaction.kind,
            timestamp: transaction.updated_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventPayload {
    UserCreated(UserCreated),
    CustomerVerified(CustomerVerified),
    CustomerVerificationRejected(CustomerVerificationRejected),
    TransferReroutedInternal(TransferReroutedInternal),
    TransactionCompleted(TransactionCompleted),
}

impl EventPayload {
    /// The event type, which doubles as the routing key / topic.
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::UserCreated(_) => USER_CREATED,
            Self::CustomerVerified(_) => CUSTOMER_VERIFIED,
            Self::CustomerVerificationRejected(_) => CUSTOMER_VERIFICATION_REJECTED,
            Self::TransferReroutedInternal(_) => TRANSFER_REROUTED_INTERNAL,
            Self::TransactionCompleted(_) => TRANSACTION_COMPLETED,
        }
    }

    /// The local entity the event is about; feeds the idempotency key.
    fn subject(&self) -> Uuid {
        match self {
            Self::UserCreated(e) => e.user_id,
            Self::CustomerVerified(e) => e.user_id,
            Self::CustomerVerificationRejected(e) => e.user_id,
            Self::TransferReroutedInternal(e) => e.transaction_id,
            Self::TransactionCompleted(e) => e.transaction_id,
        }
    }

    fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::UserCreated(e) => serde_json::to_value(e),
            Self::CustomerVerified(e) => serde_json::to_value(e),
            Self::CustomerVerificationRejected(e) => serde_json::to_value(e),
            Self::TransferReroutedInternal(e) => serde_json::to_value(e),
            Self::TransactionCompleted(e) => serde_json::to_value(e),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "RawEvent", into = "RawEvent")]
pub struct Event {
    pub idempotency_key: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    /// Wraps a payload with a key derived from its type and subject, so the
    /// same logical event always carries the same key.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            idempotency_key: idempotency_key(payload.event_type(), &payload.subject().to_string()),
            occurred_at: Utc::now(),
            payload,
        }
    }

    pub const fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

/// Hex SHA-256 of `scope:subject`.
pub fn idempotency_key(scope: &str, subject: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update(b":");
    hasher.update(subject.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Clone, Deserialize, Serialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    idempotency_key: String,
    payload: serde_json::Value,
    occurred_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    #[error("unknown event type: {0}")]
    UnknownType(String),
    #[error("invalid payload for {event_type}: {source}")]
    InvalidPayload {
        event_type: String,
        source: serde_json::Error,
    },
}

impl TryFrom<RawEvent> for Event {
    type Error = EventDecodeError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        fn decode<T: serde::de::DeserializeOwned>(
            raw: &RawEvent,
        ) -> Result<T, EventDecodeError> {
            serde_json::from_value(raw.payload.clone()).map_err(|source| {
                EventDecodeError::InvalidPayload {
                    event_type: raw.event_type.clone(),
                    source,
                }
            })
        }

        let payload = match raw.event_type.as_str() {
            USER_CREATED => EventPayload::UserCreated(decode(&raw)?),
            CUSTOMER_VERIFIED => EventPayload::CustomerVerified(decode(&raw)?),
            CUSTOMER_VERIFICATION_REJECTED => {
                EventPayload::CustomerVerificationRejected(decode(&raw)?)
            }
            TRANSFER_REROUTED_INTERNAL => EventPayload::TransferReroutedInternal(decode(&raw)?),
            TRANSACTION_COMPLETED => EventPayload::TransactionCompleted(decode(&raw)?),
            other => return Err(EventDecodeError::UnknownType(other.to_string())),
        };

        Ok(Event {
            idempotency_key: raw.idempotency_key,
            occurred_at: raw.occurred_at,
            payload,
        })
    }
}

impl From<Event> for RawEvent {
    fn from(event: Event) -> Self {
        // Payload structs hold only strings, ids, integers and timestamps.
        let payload = event.payload.to_value().unwrap_or(serde_json::Value::Null);

        RawEvent {
            event_type: event.payload.event_type().to_string(),
            idempotency_key: event.idempotency_key,
            payload,
            occurred_at: event.occurred_at,
        }
    }
}
