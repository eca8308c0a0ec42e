use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{LedgerError, LedgerStore, TransferEntry};
use crate::models::accounts::{Account, AccountPurpose, Beneficiary, NewBeneficiary};
use crate::models::money_drops::{
    ClaimReceipt, ExpiryRefund, MoneyDrop, MoneyDropClaim, MoneyDropStatus, NewMoneyDrop,
};
use crate::models::payment_requests::{NewPaymentRequest, PaymentRequest, PaymentRequestStatus};
use crate::models::subscriptions::{Subscription, SubscriptionStatus};
use crate::models::transactions::{Destination, Transaction, TransactionStatus, TransactionType};
use crate::models::users::{NewUser, User, VerificationStatus};

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    accounts: HashMap<Uuid, Account>,
    beneficiaries: HashMap<Uuid, Beneficiary>,
    // keyed by user id
    subscriptions: HashMap<Uuid, Subscription>,
    transactions: HashMap<Uuid, Transaction>,
    drops: HashMap<Uuid, MoneyDrop>,
    claims: Vec<MoneyDropClaim>,
    payment_requests: HashMap<Uuid, PaymentRequest>,
}

impl State {
    fn user(&self, user_id: Uuid) -> Result<&User, LedgerError> {
        self.users.get(&user_id).ok_or(LedgerError::NotFound("user"))
    }

    fn wallet_id(&self, user_id: Uuid) -> Option<Uuid> {
        self.accounts
            .values()
            .find(|a| a.user_id == user_id && a.purpose == AccountPurpose::MainWallet)
            .map(|a| a.id)
    }

    fn balance(&self, account_id: Uuid) -> Result<i64, LedgerError> {
        self.accounts
            .get(&account_id)
            .map(|a| a.balance)
            .ok_or(LedgerError::NotFound("account"))
    }

    fn ensure_funds(&self, account_id: Uuid, amount: i64) -> Result<(), LedgerError> {
        if self.balance(account_id)? < amount {
            return Err(LedgerError::InsufficientFunds(account_id));
        }
        Ok(())
    }

    /// Applies a balance change already validated by the caller.
    fn adjust(&mut self, account_id: Uuid, delta: i64, now: DateTime<Utc>) {
        if let Some(account) = self.accounts.get_mut(&account_id) {
            account.balance += delta;
            account.updated_at = now;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        id: Uuid,
        sender_id: Option<Uuid>,
        recipient_id: Option<Uuid>,
        source_account_id: Option<Uuid>,
        destination: Destination,
        kind: TransactionType,
        amount: i64,
        status: TransactionStatus,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Transaction {
        let transaction = Transaction {
            id,
            sender_id,
            recipient_id,
            source_account_id,
            destination,
            external_transfer_ref: None,
            kind,
            amount,
            status,
            description,
            created_at: now,
            updated_at: now,
        };
        self.transactions.insert(id, transaction.clone());
        transaction
    }
}

/// Ledger writes that can be made to fail on demand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LedgerOp {
    SetCustomerRef,
    CreateWallet,
    FailTransfer,
}

/// Process-local ledger with the same atomicity as the database store: every
/// operation validates first and mutates under one lock.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
    faults: DashMap<LedgerOp, Vec<LedgerError>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call of `op` fail with `err` before touching any state.
    /// Queued faults are consumed in order.
    pub fn fail_next(&self, op: LedgerOp, err: LedgerError) {
        self.faults.entry(op).or_default().insert(0, err);
    }

    fn take_fault(&self, op: LedgerOp) -> Result<(), LedgerError> {
        match self.faults.get_mut(&op).and_then(|mut queued| queued.pop()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Credits a user's main wallet directly. Stands in for inbound funding.
    pub async fn deposit(&self, user_id: Uuid, amount: i64) -> Result<Account, LedgerError> {
        let mut state = self.state.lock().await;
        let wallet = state.wallet_id(user_id).ok_or(LedgerError::NotFound("wallet"))?;
        state.adjust(wallet, amount, Utc::now());
        state
            .accounts
            .get(&wallet)
            .cloned()
            .ok_or(LedgerError::NotFound("wallet"))
    }

    pub async fn set_subscription_status(
        &self,
        user_id: Uuid,
        status: SubscriptionStatus,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let subscription = state
            .subscriptions
            .get_mut(&user_id)
            .ok_or(LedgerError::NotFound("subscription"))?;
        subscription.status = status;
        subscription.updated_at = Utc::now();
        Ok(())
    }

    pub async fn set_transfers_used(&self, user_id: Uuid, used: i32) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let subscription = state
            .subscriptions
            .get_mut(&user_id)
            .ok_or(LedgerError::NotFound("subscription"))?;
        subscription.period_transfers_used = used;
        Ok(())
    }

    pub async fn set_allow_sending(&self, user_id: Uuid, allow: bool) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or(LedgerError::NotFound("user"))?;
        user.allow_sending = allow;
        Ok(())
    }

    pub async fn transactions(&self) -> Vec<Transaction> {
        let state = self.state.lock().await;
        let mut all: Vec<_> = state.transactions.values().cloned().collect();
        all.sort_by_key(|t| t.created_at);
        all
    }

    /// Sum of every account balance. Money only moves between accounts, so
    /// this changes only through `deposit` and external payouts.
    pub async fn total_balance(&self) -> i64 {
        let state = self.state.lock().await;
        state.accounts.values().map(|a| a.balance).sum()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn create_user(
        &self,
        new_user: &NewUser,
        period_ends_at: DateTime<Utc>,
    ) -> Result<(User, Subscription), LedgerError> {
        let mut state = self.state.lock().await;
        if state
            .users
            .values()
            .any(|u| u.subject == new_user.subject || u.username == new_user.username)
        {
            return Err(LedgerError::AlreadyExists("user"));
        }

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            subject: new_user.subject.clone(),
            username: new_user.username.clone(),
            account_type: new_user.account_type,
            verification_status: VerificationStatus::Pending,
            external_customer_ref: None,
            allow_sending: new_user.account_type.allows_sending_by_default(),
            created_at: now,
            updated_at: now,
        };
        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id: user.id,
            status: SubscriptionStatus::Free,
            period_transfers_used: 0,
            current_period_ends_at: period_ends_at,
            created_at: now,
            updated_at: now,
        };

        state.users.insert(user.id, user.clone());
        state.subscriptions.insert(user.id, subscription.clone());
        Ok((user, subscription))
    }

    async fn get_user(&self, user_id: Uuid) -> Result<User, LedgerError> {
        let state = self.state.lock().await;
        state.user(user_id).cloned()
    }

    async fn find_user_by_customer_ref(
        &self,
        customer_ref: &str,
    ) -> Result<Option<User>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .values()
            .find(|u| u.external_customer_ref.as_deref() == Some(customer_ref))
            .cloned())
    }

    async fn set_customer_ref(
        &self,
        user_id: Uuid,
        customer_ref: &str,
    ) -> Result<User, LedgerError> {
        self.take_fault(LedgerOp::SetCustomerRef)?;
        let mut state = self.state.lock().await;
        let taken = state.users.values().any(|u| {
            u.id != user_id && u.external_customer_ref.as_deref() == Some(customer_ref)
        });
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or(LedgerError::NotFound("user"))?;

        match user.external_customer_ref.as_deref() {
            Some(existing) if existing == customer_ref => Ok(user.clone()),
            Some(_) => Err(LedgerError::AlreadyExists("customer reference")),
            None if taken => Err(LedgerError::AlreadyExists("customer reference")),
            None => {
                user.external_customer_ref = Some(customer_ref.to_string());
                user.updated_at = Utc::now();
                Ok(user.clone())
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

        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or(LedgerError::NotFound("user"))?;

        if user.verification_status == status {
            return Ok(user.clone());
        }
        if user.verification_status.is_terminal() {
            return Err(LedgerError::InvalidState(format!(
                "user {} is already {}",
                user.id, user.verification_status
            )));
        }

        user.verification_status = status;
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn find_wallet(&self, user_id: Uuid) -> Result<Option<Account>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .wallet_id(user_id)
            .and_then(|id| state.accounts.get(&id).cloned()))
    }

    async fn create_wallet(
        &self,
        user_id: Uuid,
        external_reference: &str,
    ) -> Result<Account, LedgerError> {
        self.take_fault(LedgerOp::CreateWallet)?;
        let mut state = self.state.lock().await;
        state.user(user_id)?;
        if state.wallet_id(user_id).is_some() {
            return Err(LedgerError::AlreadyExists("main wallet"));
        }

        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4(),
            user_id,
            purpose: AccountPurpose::MainWallet,
            balance: 0,
            external_reference: Some(external_reference.to_string()),
            created_at: now,
            updated_at: now,
        };
        state.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn add_beneficiary(
        &self,
        user_id: Uuid,
        counterparty_ref: &str,
        beneficiary: &NewBeneficiary,
    ) -> Result<Beneficiary, LedgerError> {
        let mut state = self.state.lock().await;
        state.user(user_id)?;
        if state
            .beneficiaries
            .values()
            .any(|b| b.external_counterparty_ref == counterparty_ref)
        {
            return Err(LedgerError::AlreadyExists("beneficiary"));
        }

        let has_any = state.beneficiaries.values().any(|b| b.user_id == user_id);
        let make_default = beneficiary.is_default || !has_any;
        let now = Utc::now();

        if make_default {
            for existing in state.beneficiaries.values_mut() {
                if existing.user_id == user_id && existing.is_default {
                    existing.is_default = false;
                    existing.updated_at = now;
                }
            }
        }

        let created = Beneficiary {
            id: Uuid::new_v4(),
            user_id,
            external_counterparty_ref: counterparty_ref.to_string(),
            account_name: beneficiary.account_name.clone(),
            account_number: beneficiary.account_number.clone(),
            bank_code: beneficiary.bank_code.clone(),
            is_default: make_default,
            created_at: now,
            updated_at: now,
        };
        state.beneficiaries.insert(created.id, created.clone());
        Ok(created)
    }

    async fn default_beneficiary(&self, user_id: Uuid) -> Result<Option<Beneficiary>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .beneficiaries
            .values()
            .find(|b| b.user_id == user_id && b.is_default)
            .cloned())
    }

    async fn get_subscription(&self, user_id: Uuid) -> Result<Subscription, LedgerError> {
        let state = self.state.lock().await;
        state
            .subscriptions
            .get(&user_id)
            .cloned()
            .ok_or(LedgerError::NotFound("subscription"))
    }

    async fn roll_over_periods(
        &self,
        now: DateTime<Utc>,
        period: Duration,
    ) -> Result<u64, LedgerError> {
        let mut state = self.state.lock().await;
        let mut rolled = 0;
        for subscription in state.subscriptions.values_mut() {
            if subscription.current_period_ends_at <= now {
                subscription.period_transfers_used = 0;
                subscription.current_period_ends_at = now + period;
                subscription.updated_at = now;
                rolled += 1;
            }
        }
        Ok(rolled)
    }

    async fn open_transfer(&self, entry: &TransferEntry) -> Result<Transaction, LedgerError> {
        let mut state = self.state.lock().await;

        let current = state
            .subscriptions
            .get(&entry.recipient_id)
            .ok_or(LedgerError::NotFound("subscription"))?
            .snapshot();
        if current != entry.expected {
            return Err(LedgerError::StaleSnapshot(entry.recipient_id));
        }

        let source = state
            .wallet_id(entry.sender_id)
            .ok_or(LedgerError::NotFound("sender wallet"))?;
        state.ensure_funds(source, entry.amount)?;

        let status = match entry.destination {
            Destination::Account(account_id) => {
                state.balance(account_id)?;
                TransactionStatus::Completed
            }
            Destination::Beneficiary(beneficiary_id) => {
                if !state.beneficiaries.contains_key(&beneficiary_id) {
                    return Err(LedgerError::NotFound("beneficiary"));
                }
                TransactionStatus::Pending
            }
        };

        let now = Utc::now();
        state.adjust(source, -entry.amount, now);
        if let Some(account_id) = entry.destination.account_id() {
            state.adjust(account_id, entry.amount, now);
        }
        if entry.meter_usage {
            if let Some(subscription) = state.subscriptions.get_mut(&entry.recipient_id) {
                subscription.period_transfers_used += 1;
                subscription.updated_at = now;
            }
        }

        Ok(state.record(
            entry.transaction_id,
            Some(entry.sender_id),
            Some(entry.recipient_id),
            Some(source),
            entry.destination,
            entry.kind,
            entry.amount,
            status,
            entry.description.clone(),
            now,
        ))
    }

    async fn complete_transfer(
        &self,
        transaction_id: Uuid,
        external_ref: Option<&str>,
    ) -> Result<Transaction, LedgerError> {
        let mut state = self.state.lock().await;
        let transaction = state
            .transactions
            .get_mut(&transaction_id)
            .ok_or(LedgerError::NotFound("transaction"))?;

        match transaction.status {
            TransactionStatus::Completed => Ok(transaction.clone()),
            TransactionStatus::Pending => {
                transaction.status = TransactionStatus::Completed;
                if let Some(reference) = external_ref {
                    transaction.external_transfer_ref = Some(reference.to_string());
                }
                transaction.updated_at = Utc::now();
                Ok(transaction.clone())
            }
            other => Err(LedgerError::InvalidState(format!(
                "transaction {transaction_id} is {other}"
            ))),
        }
    }

    async fn fail_transfer(&self, transaction_id: Uuid) -> Result<Transaction, LedgerError> {
        self.take_fault(LedgerOp::FailTransfer)?;
        let mut state = self.state.lock().await;
        let existing = state
            .transactions
            .get(&transaction_id)
            .cloned()
            .ok_or(LedgerError::NotFound("transaction"))?;

        match existing.status {
            TransactionStatus::Failed => return Ok(existing),
            TransactionStatus::Pending => {}
            other => {
                return Err(LedgerError::InvalidState(format!(
                    "transaction {transaction_id} is {other}"
                )))
            }
        }

        let now = Utc::now();
        if let Some(source) = existing.source_account_id {
            state.balance(source)?;
            state.adjust(source, existing.amount, now);
        }

        let transaction = state
            .transactions
            .get_mut(&transaction_id)
            .ok_or(LedgerError::NotFound("transaction"))?;
        transaction.status = TransactionStatus::Failed;
        transaction.updated_at = now;
        Ok(transaction.clone())
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Transaction, LedgerError> {
        let state = self.state.lock().await;
        state
            .transactions
            .get(&transaction_id)
            .cloned()
            .ok_or(LedgerError::NotFound("transaction"))
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

        let mut state = self.state.lock().await;
        let wallet = state
            .wallet_id(creator_id)
            .ok_or(LedgerError::NotFound("creator wallet"))?;
        state.ensure_funds(wallet, total_amount)?;

        let now = Utc::now();
        let pooled = Account {
            id: Uuid::new_v4(),
            user_id: creator_id,
            purpose: AccountPurpose::PooledFund,
            balance: 0,
            external_reference: None,
            created_at: now,
            updated_at: now,
        };
        let pooled_id = pooled.id;
        state.accounts.insert(pooled_id, pooled);

        state.adjust(wallet, -total_amount, now);
        state.adjust(pooled_id, total_amount, now);

        let created = MoneyDrop {
            id: Uuid::new_v4(),
            creator_id,
            funding_account_id: pooled_id,
            total_amount,
            amount_per_claim: drop.amount_per_claim,
            total_claims_allowed: drop.total_claims_allowed,
            claims_made_count: 0,
            status: MoneyDropStatus::Active,
            expiry_timestamp: drop.expiry_timestamp,
            created_at: now,
            updated_at: now,
        };
        state.drops.insert(created.id, created.clone());

        let funding = state.record(
            Uuid::new_v4(),
            Some(creator_id),
            Some(creator_id),
            Some(wallet),
            Destination::Account(pooled_id),
            TransactionType::MoneyDropFunding,
            total_amount,
            TransactionStatus::Completed,
            None,
            now,
        );

        Ok((created, funding))
    }

    async fn get_money_drop(&self, drop_id: Uuid) -> Result<MoneyDrop, LedgerError> {
        let state = self.state.lock().await;
        state
            .drops
            .get(&drop_id)
            .cloned()
            .ok_or(LedgerError::NotFound("money drop"))
    }

    async fn money_drop_claims(&self, drop_id: Uuid) -> Result<Vec<MoneyDropClaim>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .claims
            .iter()
            .filter(|c| c.money_drop_id == drop_id)
            .cloned()
            .collect())
    }

    async fn claim_money_drop(
        &self,
        drop_id: Uuid,
        claimant_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ClaimReceipt, LedgerError> {
        let mut state = self.state.lock().await;
        let drop = state
            .drops
            .get(&drop_id)
            .cloned()
            .ok_or(LedgerError::NotFound("money drop"))?;

        if drop.status != MoneyDropStatus::Active {
            return Err(LedgerError::DropNotActive(drop_id));
        }
        if now > drop.expiry_timestamp {
            return Err(LedgerError::DropExpired(drop_id));
        }
        if drop.claims_made_count >= drop.total_claims_allowed {
            return Err(LedgerError::DropExhausted(drop_id));
        }
        if state
            .claims
            .iter()
            .any(|c| c.money_drop_id == drop_id && c.claimant_id == claimant_id)
        {
            return Err(LedgerError::AlreadyClaimed {
                drop: drop_id,
                claimant: claimant_id,
            });
        }

        let wallet = state
            .wallet_id(claimant_id)
            .ok_or(LedgerError::NotFound("claimant wallet"))?;
        state.ensure_funds(drop.funding_account_id, drop.amount_per_claim)?;

        state.adjust(drop.funding_account_id, -drop.amount_per_claim, now);
        state.adjust(wallet, drop.amount_per_claim, now);

        let transaction = state.record(
            Uuid::new_v4(),
            Some(drop.creator_id),
            Some(claimant_id),
            Some(drop.funding_account_id),
            Destination::Account(wallet),
            TransactionType::MoneyDropClaim,
            drop.amount_per_claim,
            TransactionStatus::Completed,
            None,
            now,
        );

        let claim = MoneyDropClaim {
            id: Uuid::new_v4(),
            money_drop_id: drop_id,
            claimant_id,
            transaction_id: transaction.id,
            claimed_at: now,
        };
        state.claims.push(claim.clone());

        let updated = state
            .drops
            .get_mut(&drop_id)
            .ok_or(LedgerError::NotFound("money drop"))?;
        updated.claims_made_count += 1;
        if updated.claims_made_count >= updated.total_claims_allowed {
            updated.status = MoneyDropStatus::Completed;
        }
        updated.updated_at = now;

        Ok(ClaimReceipt {
            claim,
            amount: updated.amount_per_claim,
            drop: updated.clone(),
        })
    }

    async fn expired_money_drops(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .drops
            .values()
            .filter(|d| d.status == MoneyDropStatus::Active && d.expiry_timestamp < now)
            .map(|d| d.id)
            .collect())
    }

    async fn expire_money_drop(
        &self,
        drop_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExpiryRefund>, LedgerError> {
        let mut state = self.state.lock().await;
        let drop = state
            .drops
            .get(&drop_id)
            .cloned()
            .ok_or(LedgerError::NotFound("money drop"))?;

        if drop.status != MoneyDropStatus::Active || drop.expiry_timestamp >= now {
            return Ok(None);
        }

        let refund = drop.unclaimed_amount();
        let mut transaction_id = None;

        if refund > 0 {
            let wallet = state
                .wallet_id(drop.creator_id)
                .ok_or(LedgerError::NotFound("creator wallet"))?;
            state.ensure_funds(drop.funding_account_id, refund)?;
            state.adjust(drop.funding_account_id, -refund, now);
            state.adjust(wallet, refund, now);

            let transaction = state.record(
                Uuid::new_v4(),
                Some(drop.creator_id),
                Some(drop.creator_id),
                Some(drop.funding_account_id),
                Destination::Account(wallet),
                TransactionType::MoneyDropRefund,
                refund,
                TransactionStatus::Completed,
                None,
                now,
            );
            transaction_id = Some(transaction.id);
        }

        let expired = state
            .drops
            .get_mut(&drop_id)
            .ok_or(LedgerError::NotFound("money drop"))?;
        expired.status = MoneyDropStatus::Expired;
        expired.updated_at = now;

        Ok(Some(ExpiryRefund {
            drop: expired.clone(),
            refunded: refund,
            transaction_id,
        }))
    }

    async fn create_payment_request(
        &self,
        creator_id: Uuid,
        request: &NewPaymentRequest,
    ) -> Result<PaymentRequest, LedgerError> {
        let mut state = self.state.lock().await;
        state.user(creator_id)?;

        let now = Utc::now();
        let created = PaymentRequest {
            id: Uuid::new_v4(),
            creator_id,
            amount: request.amount,
            description: request.description.clone(),
            status: PaymentRequestStatus::Pending,
            fulfilled_at: None,
            fulfilled_by_transaction_id: None,
            created_at: now,
            updated_at: now,
        };
        state.payment_requests.insert(created.id, created.clone());
        Ok(created)
    }

    async fn fulfill_payment_request(
        &self,
        request_id: Uuid,
        payer_id: Uuid,
    ) -> Result<(PaymentRequest, Transaction), LedgerError> {
        let mut state = self.state.lock().await;
        let request = state
            .payment_requests
            .get(&request_id)
            .cloned()
            .ok_or(LedgerError::NotFound("payment request"))?;

        if request.status == PaymentRequestStatus::Fulfilled {
            return Err(LedgerError::AlreadyFulfilled(request_id));
        }
        if request.creator_id == payer_id {
            return Err(LedgerError::InvalidState(
                "a payment request cannot be paid by its creator".to_string(),
            ));
        }

        let source = state
            .wallet_id(payer_id)
            .ok_or(LedgerError::NotFound("payer wallet"))?;
        let destination = state
            .wallet_id(request.creator_id)
            .ok_or(LedgerError::NotFound("requester wallet"))?;
        state.ensure_funds(source, request.amount)?;

        let now = Utc::now();
        state.adjust(source, -request.amount, now);
        state.adjust(destination, request.amount, now);

        let transaction = state.record(
            Uuid::new_v4(),
            Some(payer_id),
            Some(request.creator_id),
            Some(source),
            Destination::Account(destination),
            TransactionType::PaymentRequest,
            request.amount,
            TransactionStatus::Completed,
            request.description.clone(),
            now,
        );

        let fulfilled = state
            .payment_requests
            .get_mut(&request_id)
            .ok_or(LedgerError::NotFound("payment request"))?;
        fulfilled.status = PaymentRequestStatus::Fulfilled;
        fulfilled.fulfilled_at = Some(now);
        fulfilled.fulfilled_by_transaction_id = Some(transaction.id);
        fulfilled.updated_at = now;

        Ok((fulfilled.clone(), transaction))
    }
}
