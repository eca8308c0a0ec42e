#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::StatusCode;
use uuid::Uuid;

use payment_orchestrator::bus::MemoryBus;
use payment_orchestrator::models::accounts::{Beneficiary, NewBeneficiary};
use payment_orchestrator::models::baas::{
    CreateCounterparty, CreateCustomer, CreateDepositAccount, CreateTransfer, RemoteTransfer,
    RemoteTransferStatus,
};
use payment_orchestrator::models::users::{
    AccountType, IdentityDetails, KycDetails, NewUser, User, VerificationStatus,
};
use payment_orchestrator::repositories::{BaasError, BaasGateway, InMemoryLedger, LedgerStore};
use payment_orchestrator::services::Dependencies;

pub const WEBHOOK_SECRET: &str = "whsec_test";

/// Scripted outcome for a gateway call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    /// The provider accepted the call but reports the transfer as failed.
    Declined,
    Status(u16),
    Timeout,
}

impl Outcome {
    fn into_error(self) -> Option<BaasError> {
        match self {
            Outcome::Succeed | Outcome::Declined => None,
            Outcome::Status(code) => Some(BaasError::Remote {
                status: StatusCode::from_u16(code).unwrap(),
                body: format!("{{\"errors\":[{{\"status\":\"{code}\"}}]}}"),
            }),
            Outcome::Timeout => Some(BaasError::Timeout),
        }
    }
}

/// Gateway double that counts calls and answers from a script.
pub struct FakeGateway {
    pub customers: AtomicUsize,
    pub verifications: AtomicUsize,
    pub deposit_accounts: AtomicUsize,
    pub counterparties: AtomicUsize,
    pub transfers: AtomicUsize,
    customer_outcome: Mutex<Outcome>,
    verification_outcome: Mutex<Outcome>,
    deposit_account_outcome: Mutex<Outcome>,
    transfer_outcome: Mutex<Outcome>,
}

impl FakeGateway {
    pub fn new() -> Self {
        FakeGateway {
            customers: AtomicUsize::new(0),
            verifications: AtomicUsize::new(0),
            deposit_accounts: AtomicUsize::new(0),
            counterparties: AtomicUsize::new(0),
            transfers: AtomicUsize::new(0),
            customer_outcome: Mutex::new(Outcome::Succeed),
            verification_outcome: Mutex::new(Outcome::Succeed),
            deposit_account_outcome: Mutex::new(Outcome::Succeed),
            transfer_outcome: Mutex::new(Outcome::Succeed),
        }
    }

    pub fn script_customer(&self, outcome: Outcome) {
        *self.customer_outcome.lock().unwrap() = outcome;
    }

    pub fn script_verification(&self, outcome: Outcome) {
        *self.verification_outcome.lock().unwrap() = outcome;
    }

    pub fn script_deposit_account(&self, outcome: Outcome) {
        *self.deposit_account_outcome.lock().unwrap() = outcome;
    }

    pub fn script_transfer(&self, outcome: Outcome) {
        *self.transfer_outcome.lock().unwrap() = outcome;
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn outcome(slot: &Mutex<Outcome>) -> Outcome {
        *slot.lock().unwrap()
    }
}

pub fn customer_ref_for(user_id: Uuid) -> String {
    format!("cus_{}", user_id.simple())
}

pub fn account_ref_for(user_id: Uuid) -> String {
    format!("acct_{}", user_id.simple())
}

#[async_trait]
impl BaasGateway for FakeGateway {
    async fn create_customer(&self, request: CreateCustomer<'_>) -> Result<String, BaasError> {
        self.customers.fetch_add(1, Ordering::SeqCst);
        match Self::outcome(&self.customer_outcome).into_error() {
            Some(err) => Err(err),
            None => Ok(customer_ref_for(request.user_id)),
        }
    }

    async fn trigger_verification(
        &self,
        _customer_ref: &str,
        _details: &IdentityDetails,
    ) -> Result<(), BaasError> {
        self.verifications.fetch_add(1, Ordering::SeqCst);
        match Self::outcome(&self.verification_outcome).into_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn create_deposit_account(
        &self,
        request: CreateDepositAccount<'_>,
    ) -> Result<String, BaasError> {
        self.deposit_accounts.fetch_add(1, Ordering::SeqCst);
        match Self::outcome(&self.deposit_account_outcome).into_error() {
            Some(err) => Err(err),
            None => Ok(account_ref_for(request.user_id)),
        }
    }

    async fn create_counterparty(
        &self,
        request: CreateCounterparty<'_>,
    ) -> Result<String, BaasError> {
        let n = self.counterparties.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("cp_{}_{}", request.account_number, n))
    }

    async fn create_transfer(&self, request: CreateTransfer<'_>) -> Result<RemoteTransfer, BaasError> {
        self.transfers.fetch_add(1, Ordering::SeqCst);
        let outcome = Self::outcome(&self.transfer_outcome);
        if let Some(err) = outcome.into_error() {
            return Err(err);
        }
        let status = match outcome {
            Outcome::Declined => RemoteTransferStatus::Failed,
            _ => RemoteTransferStatus::Completed,
        };
        Ok(RemoteTransfer {
            id: format!("tr_{}", request.transaction_id.simple()),
            status,
        })
    }
}

pub struct Harness {
    pub ledger: Arc<InMemoryLedger>,
    pub gateway: Arc<FakeGateway>,
    pub bus: MemoryBus,
    pub deps: Dependencies,
}

impl Harness {
    pub fn new() -> Self {
        let ledger = Arc::new(InMemoryLedger::new());
        let gateway = Arc::new(FakeGateway::new());
        let bus = MemoryBus::new();
        let deps = Dependencies {
            ledger: ledger.clone(),
            gateway: gateway.clone(),
            bus: Arc::new(bus.clone()),
        };
        Harness {
            ledger,
            gateway,
            bus,
            deps,
        }
    }

    /// A verified personal user with a provisioned wallet.
    pub async fn user(&self, username: &str) -> User {
        let (user, _) = self
            .ledger
            .create_user(&new_personal_user(username), Utc::now() + Duration::days(30))
            .await
            .unwrap();
        self.ledger
            .set_customer_ref(user.id, &customer_ref_for(user.id))
            .await
            .unwrap();
        self.ledger
            .set_verification_status(user.id, VerificationStatus::Approved)
            .await
            .unwrap();
        self.ledger
            .create_wallet(user.id, &account_ref_for(user.id))
            .await
            .unwrap();
        self.ledger.get_user(user.id).await.unwrap()
    }

    pub async fn funded_user(&self, username: &str, amount: i64) -> User {
        let user = self.user(username).await;
        self.ledger.deposit(user.id, amount).await.unwrap();
        user
    }

    pub async fn balance(&self, user_id: Uuid) -> i64 {
        self.ledger
            .find_wallet(user_id)
            .await
            .unwrap()
            .map(|wallet| wallet.balance)
            .unwrap_or_default()
    }

    pub async fn default_beneficiary(&self, user_id: Uuid) -> Beneficiary {
        self.ledger
            .add_beneficiary(
                user_id,
                &format!("cp_{}", user_id.simple()),
                &NewBeneficiary {
                    account_name: "Ada Obi".to_string(),
                    account_number: "0123456789".to_string(),
                    bank_code: "058".to_string(),
                    is_default: true,
                },
            )
            .await
            .unwrap()
    }
}

pub fn kyc_details() -> IdentityDetails {
    IdentityDetails::Kyc(KycDetails {
        full_name: "Ada Obi".to_string(),
        bvn: "22222222222".to_string(),
        date_of_birth: "1994-05-17".to_string(),
    })
}

pub fn new_personal_user(username: &str) -> NewUser {
    NewUser {
        subject: format!("sub|{username}"),
        username: username.to_string(),
        account_type: AccountType::Personal,
        details: kyc_details(),
    }
}
