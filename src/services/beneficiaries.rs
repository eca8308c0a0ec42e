use async_trait::async_trait;
use log::{error, info};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{Dependencies, RequestHandler, Service, ServiceError};
use crate::models::accounts::{Beneficiary, NewBeneficiary};
use crate::models::baas::CreateCounterparty;
use crate::repositories::LedgerError;

pub enum BeneficiaryRequest {
    Add {
        user_id: Uuid,
        beneficiary: NewBeneficiary,
        response: oneshot::Sender<Result<Beneficiary, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct BeneficiaryRequestHandler {
    deps: Dependencies,
}

fn validate(beneficiary: &NewBeneficiary) -> Result<(), ServiceError> {
    if beneficiary.account_name.trim().is_empty() {
        return Err(ServiceError::Validation("account_name is required".to_string()));
    }
    if beneficiary.account_number.len() != 10
        || !beneficiary.account_number.chars().all(|c| c.is_ascii_digit())
    {
        return Err(ServiceError::Validation(
            "account_number must be 10 digits".to_string(),
        ));
    }
    if beneficiary.bank_code.trim().is_empty() {
        return Err(ServiceError::Validation("bank_code is required".to_string()));
    }
    Ok(())
}

impl BeneficiaryRequestHandler {
    pub fn new(deps: Dependencies) -> Self {
        BeneficiaryRequestHandler { deps }
    }

    /// Registers the payout target with the provider, then stores it locally.
    pub async fn add_beneficiary(
        &self,
        user_id: Uuid,
        beneficiary: NewBeneficiary,
    ) -> Result<Beneficiary, ServiceError> {
        validate(&beneficiary)?;
        self.deps.ledger.get_user(user_id).await?;

        let counterparty_ref = self
            .deps
            .gateway
            .create_counterparty(CreateCounterparty {
                user_id,
                account_name: &beneficiary.account_name,
                account_number: &beneficiary.account_number,
                bank_code: &beneficiary.bank_code,
            })
            .await?;

        match self
            .deps
            .ledger
            .add_beneficiary(user_id, &counterparty_ref, &beneficiary)
            .await
        {
            Ok(created) => {
                info!(
                    "Added beneficiary {} for user {} (default: {})",
                    created.id, user_id, created.is_default
                );
                Ok(created)
            }
            Err(e @ LedgerError::AlreadyExists(_)) => Err(e.into()),
            Err(e) => {
                let err = ServiceError::Inconsistency {
                    resource: format!("counterparty {counterparty_ref}"),
                    detail: format!("beneficiary for user {user_id} not stored: {e}"),
                };
                error!(target: "reconciliation", "{}", err);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl RequestHandler<BeneficiaryRequest> for BeneficiaryRequestHandler {
    async fn handle_request(&self, request: BeneficiaryRequest) {
        match request {
            BeneficiaryRequest::Add {
                user_id,
                beneficiary,
                response,
            } => {
                let result = self.add_beneficiary(user_id, beneficiary).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct BeneficiaryService;

impl BeneficiaryService {
    pub fn new() -> Self {
        BeneficiaryService {}
    }
}

#[async_trait]
impl Service<BeneficiaryRequest, BeneficiaryRequestHandler> for BeneficiaryService {}
