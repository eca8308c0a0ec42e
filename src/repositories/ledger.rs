//! Ledger Store: the only component allowed to mutate balances, usage
//! counters, claim counts and transaction status. Every multi-row change is a
//! single atomic operation on the store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::accounts::{Account, Beneficiary, NewBeneficiary};
use crate::models::money_drops::{ClaimReceipt, ExpiryRefund, MoneyDrop, MoneyDropClaim, NewMoneyDrop};
use crate::models::payment_requests::{NewPaymentRequest, PaymentRequest};
use crate::models::subscriptions::{Subscription, SubscriptionSnapshot};
use crate::models::transactions::{Destination, Transaction, TransactionType};
use crate::models::users::{NewUser, User, VerificationStatus};

mod in_memory;
mod postgres;

pub use in_memory::{InMemoryLedger, LedgerOp};
pub use postgres::PgLedger;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("insufficient funds in account {0}")]
    InsufficientFunds(Uuid),
    #[error("money drop {0} is not active")]
    DropNotActive(Uuid),
    #[error("money drop {0} has expired")]
    DropExpired(Uuid),
    #[error("money drop {0} has no claims remaining")]
    DropExhausted(Uuid),
    #[error("user {claimant} already claimed money drop {drop}")]
    AlreadyClaimed { drop: Uuid, claimant: Uuid },
    #[error("subscription of user {0} changed since the routing decision")]
    StaleSnapshot(Uuid),
    #[error("{0} already exists")]
    AlreadyExists(&'static str),
    #[error("payment request {0} is already fulfilled")]
    AlreadyFulfilled(Uuid),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("lost a lock race: {0}")]
    Contention(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

// deadlock_detected, serialization_failure
const CONTENTION_CODES: [&str; 2] = ["40P01", "40001"];

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        let contended = err
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| CONTENTION_CODES.contains(&&*code));
        if contended {
            LedgerError::Contention(err.to_string())
        } else {
            LedgerError::Database(err)
        }
    }
}

impl LedgerError {
    /// True when repeating the same operation may succeed.
    pub fn is_contention(&self) -> bool {
        matches!(self, LedgerError::Contention(_))
    }
}

/// A routed transfer, ready to be opened atomically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferEntry {
    pub transaction_id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub amount: i64,
    pub description: Option<String>,
    pub kind: TransactionType,
    pub destination: Destination,
    /// Increment the recipient's `period_transfers_used` in the same unit.
    pub meter_usage: bool,
    /// Subscription state the routing decision was computed on.
    pub expected: SubscriptionSnapshot,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Persists a user with a fresh free-tier subscription.
    async fn create_user(
        &self,
        new_user: &NewUser,
        period_ends_at: DateTime<Utc>,
    ) -> Result<(User, Subscription), LedgerError>;
    async fn get_user(&self, user_id: Uuid) -> Result<User, LedgerError>;
    async fn find_user_by_customer_ref(
        &self,
        customer_ref: &str,
    ) -> Result<Option<User>, LedgerError>;
    /// Sets the external customer reference once. Repeating the same value is
    /// a no-op; a different value is `AlreadyExists`.
    async fn set_customer_ref(&self, user_id: Uuid, customer_ref: &str)
        -> Result<User, LedgerError>;
    /// `pending -> approved | rejected`. Repeating the current terminal value
    /// is a no-op.
    async fn set_verification_status(
        &self,
        user_id: Uuid,
        status: VerificationStatus,
    ) -> Result<User, LedgerError>;

    async fn find_wallet(&self, user_id: Uuid) -> Result<Option<Account>, LedgerError>;
    async fn create_wallet(
        &self,
        user_id: Uuid,
        external_reference: &str,
    ) -> Result<Account, LedgerError>;

    async fn add_beneficiary(
        &self,
        user_id: Uuid,
        counterparty_ref: &str,
        beneficiary: &NewBeneficiary,
    ) -> Result<Beneficiary, LedgerError>;
    async fn default_beneficiary(&self, user_id: Uuid) -> Result<Option<Beneficiary>, LedgerError>;

    async fn get_subscription(&self, user_id: Uuid) -> Result<Subscription, LedgerError>;
    /// Resets usage for every subscription whose period ended before `now`.
    async fn roll_over_periods(
        &self,
        now: DateTime<Utc>,
        period: Duration,
    ) -> Result<u64, LedgerError>;

    /// Debits the sender, applies the usage increment and records the
    /// transaction in one unit. Internal destinations are credited and
    /// completed immediately; external ones stay pending.
    async fn open_transfer(&self, entry: &TransferEntry) -> Result<Transaction, LedgerError>;
    async fn complete_transfer(
        &self,
        transaction_id: Uuid,
        external_ref: Option<&str>,
    ) -> Result<Transaction, LedgerError>;
    /// Marks a pending transfer failed and refunds the sender. Metered usage
    /// is kept: the counter only resets on period rollover.
    async fn fail_transfer(&self, transaction_id: Uuid) -> Result<Transaction, LedgerError>;
    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Transaction, LedgerError>;

    /// Moves the total from the creator wallet into a new pooled account.
    /// Returns the drop and its funding transaction.
    async fn create_money_drop(
        &self,
        creator_id: Uuid,
        drop: &NewMoneyDrop,
    ) -> Result<(MoneyDrop, Transaction), LedgerError>;
    async fn get_money_drop(&self, drop_id: Uuid) -> Result<MoneyDrop, LedgerError>;
    async fn money_drop_claims(&self, drop_id: Uuid) -> Result<Vec<MoneyDropClaim>, LedgerError>;
    async fn claim_money_drop(
        &self,
        drop_id: Uuid,
        claimant_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ClaimReceipt, LedgerError>;
    async fn expired_money_drops(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, LedgerError>;
    /// Expires one drop and refunds the unclaimed remainder. `None` when the
    /// drop is no longer eligible (completed, already expired, not yet due).
    async fn expire_money_drop(
        &self,
        drop_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExpiryRefund>, LedgerError>;

    async fn create_payment_request(
        &self,
        creator_id: Uuid,
        request: &NewPaymentRequest,
    ) -> Result<PaymentRequest, LedgerError>;
    async fn fulfill_payment_request(
        &self,
        request_id: Uuid,
        payer_id: Uuid,
    ) -> Result<(PaymentRequest, Transaction), LedgerError>;
}
