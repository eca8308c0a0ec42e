use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use super::{LedgerError, LedgerStore, TransferEntry};
use crate::models::accounts::{Account, AccountPurpose, Beneficiary, NewBeneficiary};
use crate::models::money_drops::{
    ClaimReceipt, ExpiryRefund, MoneyDrop, MoneyDropClaim, MoneyDropStatus, NewMoneyDrop,
};
use crate::models::payment_requests::{NewPaymentRequest, PaymentRequest, PaymentRequestStatus};
use crate::models::subscriptions::{Subscription, SubscriptionSnapshot, SubscriptionStatus};
use crate::models::transactions::{Destination, Transaction, TransactionStatus, TransactionType};
use crate::models::users::{NewUser, User, VerificationStatus};

type PgTx<'c> = sqlx::Transaction<'c, Postgres>;

const USER_COLUMNS: &str = "id, subject, username, account_type, verification_status, \
     external_customer_ref, allow_sending, created_at, updated_at";
const ACCOUNT_COLUMNS: &str =
    "id, user_id, purpose, balance, external_reference, created_at, updated_at";
const BENEFICIARY_COLUMNS: &str = "id, user_id, external_counterparty_ref, account_name, \
     account_number, bank_code, is_default, created_at, updated_at";
const SUBSCRIPTION_COLUMNS: &str =
    "id, user_id, status, period_transfers_used, current_period_ends_at, created_at, updated_at";
const TRANSACTION_COLUMNS: &str = "id, sender_id, recipient_id, source_account_id, \
     destination_account_id, destination_beneficiary_id, external_transfer_ref, type, amount, \
     status, description, created_at, updated_at";
const DROP_COLUMNS: &str = "id, creator_id, funding_account_id, total_amount, amount_per_claim, \
     total_claims_allowed, claims_made_count, status, expiry_timestamp, created_at, updated_at";
const CLAIM_COLUMNS: &str = "id, money_drop_id, claimant_id, transaction_id, claimed_at";
const PAYMENT_REQUEST_COLUMNS: &str = "id, creator_id, amount, description, status, \
     fulfilled_at, fulfilled_by_transaction_id, created_at, updated_at";

const CLAIM_UNIQUE_CONSTRAINT: &str = "money_drop_claims_once_per_user";

/// PostgreSQL-backed ledger. Contended rows are taken with `FOR UPDATE`
/// inside a single transaction per operation.
#[derive(Clone)]
pub struct PgLedger {
    conn: PgPool,
}

impl PgLedger {
    pub fn new(conn: PgPool) -> Self {
        PgLedger { conn }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.conn).await
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: std::str::FromStr<Err = crate::models::UnknownVariant>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        subject: row.try_get("subject")?,
        username: row.try_get("username")?,
        account_type: parse_column(row, "account_type")?,
        verification_status: parse_column(row, "verification_status")?,
        external_customer_ref: row.try_get("external_customer_ref")?,
        allow_sending: row.try_get("allow_sending")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn account_from_row(row: &PgRow) -> Result<Account, sqlx::Error> {
    Ok(Account {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        purpose: parse_column(row, "purpose")?,
        balance: row.try_get("balance")?,
        external_reference: row.try_get("external_reference")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn beneficiary_from_row(row: &PgRow) -> Result<Beneficiary, sqlx::Error> {
    Ok(Beneficiary {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        external_counterparty_ref: row.try_get("external_counterparty_ref")?,
        account_name: row.try_get("account_name")?,
        account_number: row.try_get("account_number")?,
        bank_code: row.try_get("bank_code")?,
        is_default: row.try_get("is_default")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription, sqlx::Error> {
    Ok(Subscription {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        status: parse_column(row, "status")?,
        period_transfers_used: row.try_get("period_transfers_used")?,
        current_period_ends_at: row.try_get("current_period_ends_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, sqlx::Error> {
    let account: Option<Uuid> = row.try_get("destination_account_id")?;
    let beneficiary: Option<Uuid> = row.try_get("destination_beneficiary_id")?;
    let destination = match (account, beneficiary) {
        (Some(id), None) => Destination::Account(id),
        (None, Some(id)) => Destination::Beneficiary(id),
        _ => {
            return Err(sqlx::Error::ColumnDecode {
                index: "destination_account_id".to_string(),
                source: "transaction must have exactly one destination".into(),
            })
        }
    };

    Ok(Transaction {
        id: row.try_get("id")?,
        sender_id: row.try_get("sender_id")?,
        recipient_id: row.try_get("recipient_id")?,
        source_account_id: row.try_get("source_account_id")?,
        destination,
        external_transfer_ref: row.try_get("external_transfer_ref")?,
        kind: parse_column(row, "type")?,
        amount: row.try_get("amount")?,
        status: parse_column(row, "status")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn drop_from_row(row: &PgRow) -> Result<MoneyDrop, sqlx::Error> {
    Ok(MoneyDrop {
        id: row.try_get("id")?,
        creator_id: row.try_get("creator_id")?,
        funding_account_id: row.try_get("funding_account_id")?,
        total_amount: row.try_get("total_amount")?,
        amount_per_claim: row.try_get("amount_per_claim")?,
        total_claims_allowed: row.try_get("total_claims_allowed")?,
        claims_made_count: row.try_get("claims_made_count")?,
        status: parse_column(row, "status")?,
        expiry_timestamp: row.try_get("expiry_timestamp")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn claim_from_row(row: &PgRow) -> Result<MoneyDropClaim, sqlx::Error> {
    Ok(MoneyDropClaim {
        id: row.try_get("id")?,
        money_drop_id: row.try_get("money_drop_id")?,
        claimant_id: row.try_get("claimant_id")?,
        transaction_id: row.try_get("transaction_id")?,
        claimed_at: row.try_get("claimed_at")?,
    })
}

fn payment_request_from_row(row: &PgRow) -> Result<PaymentRequest, sqlx::Error> {
    Ok(PaymentRequest {
        id: row.try_get("id")?,
        creator_id: row.try_get("creator_id")?,
        amount: row.try_get("amount")?,
        description: row.try_get("description")?,
        status: parse_column(row, "status")?,
        fulfilled_at: row.try_get("fulfilled_at")?,
        fulfilled_by_transaction_id: row.try_get("fulfilled_by_transaction_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn is_unique_violation(err: &sqlx::Error, constraint: Option<&str>) -> bool {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => match constraint {
            Some(name) => db.constraint() == Some(name),
            None => true,
        },
        _ => false,
    }
}

/// Fields of a ledger entry written inside an open transaction.
struct NewEntry {
    id: Uuid,
    sender_id: Option<Uuid>,
    recipient_id: Option<Uuid>,
    source_account_id: Option<Uuid>,
    destination: Destination,
    kind: TransactionType,
    amount: i64,
    status: TransactionStatus,
    description: Option<String>,
}

async fn insert_transaction(tx: &mut PgTx<'_>, entry: NewEntry) -> Result<Transaction, LedgerError> {
    let row = sqlx::query(&format!(
        "INSERT INTO transactions
         (id, sender_id, recipient_id, source_account_id, destination_account_id,
          destination_beneficiary_id, type, amount, status, description)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
         RETURNING {TRANSACTION_COLUMNS}"
    ))
    .bind(entry.id)
    .bind(entry.sender_id)
    .bind(entry.recipient_id)
    .bind(entry.source_account_id)
    .bind(entry.destination.account_id())
    .bind(entry.destination.beneficiary_id())
    .bind(entry.kind.as_str())
    .bind(entry.amount)
    .bind(entry.status.as_str())
    .bind(entry.description)
    .fetch_one(&mut **tx)
    .await?;

    Ok(transaction_from_row(&row)?)
}

async fn wallet_id(tx: &mut PgTx<'_>, user_id: Uuid, what: &'static str) -> Result<Uuid, LedgerError> {
    sqlx::query_scalar("SELECT id FROM accounts WHERE user_id = $1 AND purpose = $2")
        .bind(user_id)
        .bind(AccountPurpose::MainWallet.as_str())
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(LedgerError::NotFound(what))
}

/// Locks the given account rows in id order so concurrent transfers between
/// the same pair of accounts cannot deadlock.
async fn lock_accounts(tx: &mut PgTx<'_>, ids: &[Uuid]) -> Result<(), LedgerError> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids.dedup();

    let locked: Vec<Uuid> =
        sqlx::query_scalar("SELECT id FROM accounts WHERE id = ANY($1) ORDER BY id FOR UPDATE")
            .bind(&ids)
            .fetch_all(&mut **tx)
            .await?;

    if locked.len() != ids.len() {
        return Err(LedgerError::NotFound("account"));
    }
    Ok(())
}

async fn debit(tx: &mut PgTx<'_>, account_id: Uuid, amount: i64) -> Result<(), LedgerError> {
    let result = sqlx::query(
        "UPDATE accounts SET balance = balance - $2, updated_at = now()
         WHERE id = $1 AND balance >= $2",
    )
    .bind(account_id)
    .bind(amount)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(LedgerError::InsufficientFunds(account_id));
    }
    Ok(())
}

async fn credit(tx: &mut PgTx<'_>, account_id: Uuid, amount: i64) -> Result<(), LedgerError> {
    let result = sqlx::query(
        "UPDATE accounts SET balance = balance + $2, updated_at = now() WHERE id = $1",
    )
    .bind(account_id)
    .bind(amount)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(LedgerError::NotFound("account"));
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn create_user(
        &self,
        new_user: &NewUser,
        period_ends_at: DateTime<Utc>,
    ) -> Result<(User, Subscription), LedgerError> {
        let mut tx = self.conn.begin().await?;

        let row = sqlx::query(&format!(
            "INSERT INTO users (id, subject, username, account_type, allow_sending)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {USER_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&new_user.subject)
        .bind(&new_user.username)
        .bind(new_user.account_type.as_str())
        .bind(new_user.account_type.allows_sending_by_default())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e, None) {
                LedgerError::AlreadyExists("user")
            } else {
                LedgerError::from(e)
            }
        })?;
        let user = user_from_row(&row)?;

        let row = sqlx::query(&format!(
            "INSERT INTO subscriptions (id, user_id, status, current_period_ends_at)
             VALUES ($1, $2, $3, $4)
             RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(user.id)
        .bind(SubscriptionStatus::Free.as_str())
        .bind(period_ends_at)
        .fetch_one(&mut *tx)
        .await?;
        let subscription = subscription_from_row(&row)?;

        tx.commit().await?;
        Ok((user, subscription))
    }

    async fn get_user(&self, user_id: Uuid) -> Result<User, LedgerError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(user_id)
            .fetch_optional(&self.conn)
            .await?
            .ok_or(LedgerError::NotFound("user"))?;

        Ok(user_from_row(&row)?)
    }

    async fn find_user_by_customer_ref(
        &self,
        customer_ref: &str,
    ) -> Result<Option<User>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE external_customer_ref = $1"
        ))
        .bind(customer_ref)
        .fetch_optional(&self.conn)
        .await?;

        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    async fn set_customer_ref(
        &self,
        user_id: Uuid,
        customer_ref: &str,
    ) -> Result<User, LedgerError> {
        let row = sqlx::query(&format!(
            "UPDATE users SET external_customer_ref = $2, updated_at = now()
             WHERE id = $1 AND (external_customer_ref IS NULL OR external_customer_ref = $2)
             RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(customer_ref)
        .fetch_optional(&self.conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e, None) {
                LedgerError::AlreadyExists("customer reference")
            } else {
                LedgerError::from(e)
            }
        })?;

        match row {
            Some(row) => Ok(user_from_row(&row)?),
            None => {
                self.get_user(user_id).await?;
                Err(LedgerError::AlreadyExists("customer reference"))
            }
        }
    }

    async fn set_verification_status(
        &self,
        user_id: Uuid,
        status: VerificationStatus,
    ) -> Result<User, LedgerError> {
        if !status.is_terminal() {
            return Err(LedgerError::InvalidState(
                "verification can only move to a terminal status".to_string(),
            ));
        }

        let row = sqlx::query(&format!(
            "UPDATE users SET verification_status = $2, updated_at = now()
             WHERE id = $1 AND verification_status IN ('pending', $2)
             RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(status.as_str())
        .fetch_optional(&self.conn)
        .await?;

        match row {
            Some(row) => Ok(user_from_row(&row)?),
            None => {
                let user = self.get_user(user_id).await?;
                Err(LedgerError::InvalidState(format!(
                    "user {} is already {}",
                    user.id, user.verification_status
                )))
            }
        }
    }

    async fn find_wallet(&self, user_id: Uuid) -> Result<Option<Account>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = $1 AND purpose = $2"
        ))
        .bind(user_id)
        .bind(AccountPurpose::MainWallet.as_str())
        .fetch_optional(&self.conn)
        .await?;

        Ok(row.as_ref().map(account_from_row).transpose()?)
    }

    async fn create_wallet(
        &self,
        user_id: Uuid,
        external_reference: &str,
    ) -> Result<Account, LedgerError> {
        let row = sqlx::query(&format!(
            "INSERT INTO accounts (id, user_id, purpose, balance, external_reference)
             VALUES ($1, $2, $3, 0, $4)
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(AccountPurpose::MainWallet.as_str())
        .bind(external_reference)
        .fetch_one(&self.conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e, None) {
                LedgerError::AlreadyExists("main wallet")
            } else {
                LedgerError::from(e)
            }
        })?;

        Ok(account_from_row(&row)?)
    }

    async fn add_beneficiary(
        &self,
        user_id: Uuid,
        counterparty_ref: &str,
        beneficiary: &NewBeneficiary,
    ) -> Result<Beneficiary, LedgerError> {
        let mut tx = self.conn.begin().await?;

        // Serialises concurrent default changes for the same user.
        sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(LedgerError::NotFound("user"))?;

        let existing: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM beneficiaries WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;
        let make_default = beneficiary.is_default || existing == 0;

        if make_default {
            sqlx::query(
                "UPDATE beneficiaries SET is_default = false, updated_at = now()
                 WHERE user_id = $1 AND is_default",
            )
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }

        let row = sqlx::query(&format!(
            "INSERT INTO beneficiaries
             (id, user_id, external_counterparty_ref, account_name, account_number, bank_code, is_default)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {BENEFICIARY_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(counterparty_ref)
        .bind(&beneficiary.account_name)
        .bind(&beneficiary.account_number)
        .bind(&beneficiary.bank_code)
        .bind(make_default)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e, None) {
                LedgerError::AlreadyExists("beneficiary")
            } else {
                LedgerError::from(e)
            }
        })?;
        let created = beneficiary_from_row(&row)?;

        tx.commit().await?;
        Ok(created)
    }

    async fn default_beneficiary(&self, user_id: Uuid) -> Result<Option<Beneficiary>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {BENEFICIARY_COLUMNS} FROM beneficiaries WHERE user_id = $1 AND is_default"
        ))
        .bind(user_id)
        .fetch_optional(&self.conn)
        .await?;

        Ok(row.as_ref().map(beneficiary_from_row).transpose()?)
    }

    async fn get_subscription(&self, user_id: Uuid) -> Result<Subscription, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.conn)
        .await?
        .ok_or(LedgerError::NotFound("subscription"))?;

        Ok(subscription_from_row(&row)?)
    }

    async fn roll_over_periods(
        &self,
        now: DateTime<Utc>,
        period: Duration,
    ) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            "UPDATE subscriptions
             SET period_transfers_used = 0, current_period_ends_at = $2, updated_at = now()
             WHERE current_period_ends_at <= $1",
        )
        .bind(now)
        .bind(now + period)
        .execute(&self.conn)
        .await?;

        Ok(result.rows_affected())
    }

    async fn open_transfer(&self, entry: &TransferEntry) -> Result<Transaction, LedgerError> {
        let mut tx = self.conn.begin().await?;

        let row = sqlx::query(
            "SELECT status, period_transfers_used FROM subscriptions WHERE user_id = $1 FOR UPDATE",
        )
        .bind(entry.recipient_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::NotFound("subscription"))?;
        let current = SubscriptionSnapshot {
            status: parse_column(&row, "status")?,
            period_transfers_used: row.try_get("period_transfers_used")?,
        };
        if current != entry.expected {
            return Err(LedgerError::StaleSnapshot(entry.recipient_id));
        }

        let source = wallet_id(&mut tx, entry.sender_id, "sender wallet").await?;
        let mut lock_set = vec![source];
        lock_set.extend(entry.destination.account_id());
        lock_accounts(&mut tx, &lock_set).await?;

        debit(&mut tx, source, entry.amount).await?;

        if entry.meter_usage {
            sqlx::query(
                "UPDATE subscriptions
                 SET period_transfers_used = period_transfers_used + 1, updated_at = now()
                 WHERE user_id = $1",
            )
            .bind(entry.recipient_id)
            .execute(&mut *tx)
            .await?;
        }

        let status = match entry.destination {
            Destination::Account(account_id) => {
                credit(&mut tx, account_id, entry.amount).await?;
                TransactionStatus::Completed
            }
            Destination::Beneficiary(_) => TransactionStatus::Pending,
        };

        let transaction = insert_transaction(
            &mut tx,
            NewEntry {
                id: entry.transaction_id,
                sender_id: Some(entry.sender_id),
                recipient_id: Some(entry.recipient_id),
                source_account_id: Some(source),
                destination: entry.destination,
                kind: entry.kind,
                amount: entry.amount,
                status,
                description: entry.description.clone(),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(transaction)
    }

    async fn complete_transfer(
        &self,
        transaction_id: Uuid,
        external_ref: Option<&str>,
    ) -> Result<Transaction, LedgerError> {
        let row = sqlx::query(&format!(
            "UPDATE transactions
             SET status = 'completed',
                 external_transfer_ref = COALESCE($2, external_transfer_ref),
                 updated_at = now()
             WHERE id = $1 AND status = 'pending'
             RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(transaction_id)
        .bind(external_ref)
        .fetch_optional(&self.conn)
        .await?;

        if let Some(row) = row {
            return Ok(transaction_from_row(&row)?);
        }

        let existing = self.get_transaction(transaction_id).await?;
        match existing.status {
            TransactionStatus::Completed => Ok(existing),
            other => Err(LedgerError::InvalidState(format!(
                "transaction {transaction_id} is {other}"
            ))),
        }
    }

    async fn fail_transfer(&self, transaction_id: Uuid) -> Result<Transaction, LedgerError> {
        let mut tx = self.conn.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1 FOR UPDATE"
        ))
        .bind(transaction_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::NotFound("transaction"))?;
        let existing = transaction_from_row(&row)?;

        match existing.status {
            TransactionStatus::Failed => return Ok(existing),
            TransactionStatus::Pending => {}
            other => {
                return Err(LedgerError::InvalidState(format!(
                    "transaction {transaction_id} is {other}"
                )))
            }
        }

        // Subscriptions are left alone, so the only lock taken after the
        // transaction row is the sender's account, as in `open_transfer`.
        if let Some(source) = existing.source_account_id {
            lock_accounts(&mut tx, &[source]).await?;
            credit(&mut tx, source, existing.amount).await?;
        }

        let row = sqlx::query(&format!(
            "UPDATE transactions SET status = 'failed', updated_at = now()
             WHERE id = $1 RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(transaction_id)
        .fetch_one(&mut *tx)
        .await?;
        let failed = transaction_from_row(&row)?;

        tx.commit().await?;
        Ok(failed)
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Transaction, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.conn)
        .await?
        .ok_or(LedgerError::NotFound("transaction"))?;

        Ok(transaction_from_row(&row)?)
    }

    async fn create_money_drop(
        &self,
        creator_id: Uuid,
        drop: &NewMoneyDrop,
    ) -> Result<(MoneyDrop, Transaction), LedgerError> {
        let total_amount = drop
            .amount_per_claim
            .checked_mul(i64::from(drop.total_claims_allowed))
            .ok_or_else(|| LedgerError::InvalidState("money drop total overflows".to_string()))?;

        let mut tx = self.conn.begin().await?;

        let wallet = wallet_id(&mut tx, creator_id, "creator wallet").await?;
        lock_accounts(&mut tx, &[wallet]).await?;
        debit(&mut tx, wallet, total_amount).await?;

        let pooled: Uuid = sqlx::query_scalar(
            "INSERT INTO accounts (id, user_id, purpose, balance) VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(creator_id)
        .bind(AccountPurpose::PooledFund.as_str())
        .bind(total_amount)
        .fetch_one(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            "INSERT INTO money_drops
             (id, creator_id, funding_account_id, total_amount, amount_per_claim,
              total_claims_allowed, status, expiry_timestamp)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {DROP_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(creator_id)
        .bind(pooled)
        .bind(total_amount)
        .bind(drop.amount_per_claim)
        .bind(drop.total_claims_allowed)
        .bind(MoneyDropStatus::Active.as_str())
        .bind(drop.expiry_timestamp)
        .fetch_one(&mut *tx)
        .await?;
        let created = drop_from_row(&row)?;

        let funding = insert_transaction(
            &mut tx,
            NewEntry {
                id: Uuid::new_v4(),
                sender_id: Some(creator_id),
                recipient_id: Some(creator_id),
                source_account_id: Some(wallet),
                destination: Destination::Account(pooled),
                kind: TransactionType::MoneyDropFunding,
                amount: total_amount,
                status: TransactionStatus::Completed,
                description: None,
            },
        )
        .await?;

        tx.commit().await?;
        Ok((created, funding))
    }

    async fn get_money_drop(&self, drop_id: Uuid) -> Result<MoneyDrop, LedgerError> {
        let row = sqlx::query(&format!("SELECT {DROP_COLUMNS} FROM money_drops WHERE id = $1"))
            .bind(drop_id)
            .fetch_optional(&self.conn)
            .await?
            .ok_or(LedgerError::NotFound("money drop"))?;

        Ok(drop_from_row(&row)?)
    }

    async fn money_drop_claims(&self, drop_id: Uuid) -> Result<Vec<MoneyDropClaim>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT {CLAIM_COLUMNS} FROM money_drop_claims WHERE money_drop_id = $1 ORDER BY claimed_at"
        ))
        .bind(drop_id)
        .fetch_all(&self.conn)
        .await?;

        Ok(rows.iter().map(claim_from_row).collect::<Result<_, _>>()?)
    }

    async fn claim_money_drop(
        &self,
        drop_id: Uuid,
        claimant_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ClaimReceipt, LedgerError> {
        let mut tx = self.conn.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {DROP_COLUMNS} FROM money_drops WHERE id = $1 FOR UPDATE"
        ))
        .bind(drop_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::NotFound("money drop"))?;
        let drop = drop_from_row(&row)?;

        if drop.status != MoneyDropStatus::Active {
            return Err(LedgerError::DropNotActive(drop_id));
        }
        if now > drop.expiry_timestamp {
            return Err(LedgerError::DropExpired(drop_id));
        }
        if drop.claims_made_count >= drop.total_claims_allowed {
            return Err(LedgerError::DropExhausted(drop_id));
        }

        let already: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM money_drop_claims WHERE money_drop_id = $1 AND claimant_id = $2",
        )
        .bind(drop_id)
        .bind(claimant_id)
        .fetch_optional(&mut *tx)
        .await?;
        if already.is_some() {
            return Err(LedgerError::AlreadyClaimed {
                drop: drop_id,
                claimant: claimant_id,
            });
        }

        let wallet = wallet_id(&mut tx, claimant_id, "claimant wallet").await?;
        lock_accounts(&mut tx, &[drop.funding_account_id, wallet]).await?;
        debit(&mut tx, drop.funding_account_id, drop.amount_per_claim).await?;
        credit(&mut tx, wallet, drop.amount_per_claim).await?;

        let transaction = insert_transaction(
            &mut tx,
            NewEntry {
                id: Uuid::new_v4(),
                sender_id: Some(drop.creator_id),
                recipient_id: Some(claimant_id),
                source_account_id: Some(drop.funding_account_id),
                destination: Destination::Account(wallet),
                kind: TransactionType::MoneyDropClaim,
                amount: drop.amount_per_claim,
                status: TransactionStatus::Completed,
                description: None,
            },
        )
        .await?;

        let row = sqlx::query(&format!(
            "INSERT INTO money_drop_claims (id, money_drop_id, claimant_id, transaction_id, claimed_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {CLAIM_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(drop_id)
        .bind(claimant_id)
        .bind(transaction.id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e, Some(CLAIM_UNIQUE_CONSTRAINT)) {
                LedgerError::AlreadyClaimed {
                    drop: drop_id,
                    claimant: claimant_id,
                }
            } else {
                LedgerError::from(e)
            }
        })?;
        let claim = claim_from_row(&row)?;

        let row = sqlx::query(&format!(
            "UPDATE money_drops
             SET claims_made_count = claims_made_count + 1,
                 status = CASE WHEN claims_made_count + 1 >= total_claims_allowed
                               THEN 'completed' ELSE status END,
                 updated_at = now()
             WHERE id = $1
             RETURNING {DROP_COLUMNS}"
        ))
        .bind(drop_id)
        .fetch_one(&mut *tx)
        .await?;
        let updated = drop_from_row(&row)?;

        tx.commit().await?;
        Ok(ClaimReceipt {
            claim,
            amount: updated.amount_per_claim,
            drop: updated,
        })
    }

    async fn expired_money_drops(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, LedgerError> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM money_drops WHERE status = 'active' AND expiry_timestamp < $1",
        )
        .bind(now)
        .fetch_all(&self.conn)
        .await?;

        Ok(ids)
    }

    async fn expire_money_drop(
        &self,
        drop_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExpiryRefund>, LedgerError> {
        let mut tx = self.conn.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {DROP_COLUMNS} FROM money_drops WHERE id = $1 FOR UPDATE"
        ))
        .bind(drop_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::NotFound("money drop"))?;
        let drop = drop_from_row(&row)?;

        if drop.status != MoneyDropStatus::Active || drop.expiry_timestamp >= now {
            return Ok(None);
        }

        let refund = drop.unclaimed_amount();
        let mut transaction_id = None;

        if refund > 0 {
            let wallet = wallet_id(&mut tx, drop.creator_id, "creator wallet").await?;
            lock_accounts(&mut tx, &[drop.funding_account_id, wallet]).await?;
            debit(&mut tx, drop.funding_account_id, refund).await?;
            credit(&mut tx, wallet, refund).await?;

            let transaction = insert_transaction(
                &mut tx,
                NewEntry {
                    id: Uuid::new_v4(),
                    sender_id: Some(drop.creator_id),
                    recipient_id: Some(drop.creator_id),
                    source_account_id: Some(drop.funding_account_id),
                    destination: Destination::Account(wallet),
                    kind: TransactionType::MoneyDropRefund,
                    amount: refund,
                    status: TransactionStatus::Completed,
                    description: None,
                },
            )
            .await?;
            transaction_id = Some(transaction.id);
        }

        let row = sqlx::query(&format!(
            "UPDATE money_drops SET status = 'expired', updated_at = now()
             WHERE id = $1 RETURNING {DROP_COLUMNS}"
        ))
        .bind(drop_id)
        .fetch_one(&mut *tx)
        .await?;
        let expired = drop_from_row(&row)?;

        tx.commit().await?;
        Ok(Some(ExpiryRefund {
            drop: expired,
            refunded: refund,
            transaction_id,
        }))
    }

    async fn create_payment_request(
        &self,
        creator_id: Uuid,
        request: &NewPaymentRequest,
    ) -> Result<PaymentRequest, LedgerError> {
        let row = sqlx::query(&format!(
            "INSERT INTO payment_requests (id, creator_id, amount, description, status)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {PAYMENT_REQUEST_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(creator_id)
        .bind(request.amount)
        .bind(&request.description)
        .bind(PaymentRequestStatus::Pending.as_str())
        .fetch_one(&self.conn)
        .await?;

        Ok(payment_request_from_row(&row)?)
    }

    async fn fulfill_payment_request(
        &self,
        request_id: Uuid,
        payer_id: Uuid,
    ) -> Result<(PaymentRequest, Transaction), LedgerError> {
        let mut tx = self.conn.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_REQUEST_COLUMNS} FROM payment_requests WHERE id = $1 FOR UPDATE"
        ))
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::NotFound("payment request"))?;
        let request = payment_request_from_row(&row)?;

        if request.status == PaymentRequestStatus::Fulfilled {
            return Err(LedgerError::AlreadyFulfilled(request_id));
        }
        if request.creator_id == payer_id {
            return Err(LedgerError::InvalidState(
                "a payment request cannot be paid by its creator".to_string(),
            ));
        }

        let source = wallet_id(&mut tx, payer_id, "payer wallet").await?;
        let destination = wallet_id(&mut tx, request.creator_id, "requester wallet").await?;
        lock_accounts(&mut tx, &[source, destination]).await?;
        debit(&mut tx, source, request.amount).await?;
        credit(&mut tx, destination, request.amount).await?;

        let transaction = insert_transaction(
            &mut tx,
            NewEntry {
                id: Uuid::new_v4(),
                sender_id: Some(payer_id),
                recipient_id: Some(request.creator_id),
                source_account_id: Some(source),
                destination: Destination::Account(destination),
                kind: TransactionType::PaymentRequest,
                amount: request.amount,
                status: TransactionStatus::Completed,
                description: request.description.clone(),
            },
        )
        .await?;

        let row = sqlx::query(&format!(
            "UPDATE payment_requests
             SET status = 'fulfilled', fulfilled_at = now(),
                 fulfilled_by_transaction_id = $2, updated_at = now()
             WHERE id = $1
             RETURNING {PAYMENT_REQUEST_COLUMNS}"
        ))
        .bind(request_id)
        .bind(transaction.id)
        .fetch_one(&mut *tx)
        .await?;
        let fulfilled = payment_request_from_row(&row)?;

        tx.commit().await?;
        Ok((fulfilled, transaction))
    }
}
