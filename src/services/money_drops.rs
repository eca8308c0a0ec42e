//! Money Drop Claim Protocol: a pooled, capped, time-bound fund that each
//! claimant may draw from once. All guards run inside the ledger's lock on
//! the drop, so concurrent claims serialise per drop only.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{publish_after_commit, RequestHandler, Service, ServiceError};
use crate::bus::EventBus;
use crate::models::events::{Event, EventPayload};
use crate::models::money_drops::{ClaimReceipt, ExpiryRefund, MoneyDrop, NewMoneyDrop};
use crate::models::transactions::Transaction;
use crate::repositories::LedgerStore;

pub enum MoneyDropRequest {
    Create {
        creator_id: Uuid,
        drop: NewMoneyDrop,
        response: oneshot::Sender<Result<MoneyDrop, ServiceError>>,
    },
    Claim {
        drop_id: Uuid,
        claimant_id: Uuid,
        response: oneshot::Sender<Result<ClaimReceipt, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct MoneyDropRequestHandler {
    ledger: Arc<dyn LedgerStore>,
    bus: Arc<dyn EventBus>,
}

impl MoneyDropRequestHandler {
    pub fn new(ledger: Arc<dyn LedgerStore>, bus: Arc<dyn EventBus>) -> Self {
        MoneyDropRequestHandler { ledger, bus }
    }

    pub async fn create_drop(
        &self,
        creator_id: Uuid,
        drop: NewMoneyDrop,
    ) -> Result<MoneyDrop, ServiceError> {
        if drop.amount_per_claim <= 0 {
            return Err(ServiceError::Validation(
                "amount_per_claim must be greater than zero".to_string(),
            ));
        }
        if drop.total_claims_allowed <= 0 {
            return Err(ServiceError::Validation(
                "total_claims_allowed must be greater than zero".to_string(),
            ));
        }
        if drop.expiry_timestamp <= Utc::now() {
            return Err(ServiceError::Validation(
                "expiry_timestamp must be in the future".to_string(),
            ));
        }

        let (created, funding) = self.ledger.create_money_drop(creator_id, &drop).await?;
        info!(
            "Money drop {} funded with {} by {} ({} x {})",
            created.id,
            created.total_amount,
            creator_id,
            created.total_claims_allowed,
            created.amount_per_claim
        );
        announce(self.bus.as_ref(), &funding).await;
        Ok(created)
    }

    pub async fn claim(&self, drop_id: Uuid, claimant_id: Uuid) -> Result<ClaimReceipt, ServiceError> {
        let receipt = self
            .ledger
            .claim_money_drop(drop_id, claimant_id, Utc::now())
            .await?;
        info!(
            "User {} claimed {} from drop {} ({}/{})",
            claimant_id,
            receipt.amount,
            drop_id,
            receipt.drop.claims_made_count,
            receipt.drop.total_claims_allowed
        );
        announce_by_id(self.ledger.as_ref(), self.bus.as_ref(), receipt.claim.transaction_id).await;
        Ok(receipt)
    }
}

async fn announce(bus: &dyn EventBus, transaction: &Transaction) {
    publish_after_commit(
        bus,
        Event::new(EventPayload::TransactionCompleted(transaction.into())),
    )
    .await;
}

/// Like `announce` for movements the ledger reports by id only.
async fn announce_by_id(ledger: &dyn LedgerStore, bus: &dyn EventBus, transaction_id: Uuid) {
    match ledger.get_transaction(transaction_id).await {
        Ok(transaction) => announce(bus, &transaction).await,
        Err(e) => warn!(
            "Committed transaction {} but could not load it to publish: {}",
            transaction_id, e
        ),
    }
}

/// Expires every active drop past its deadline and refunds the remainder.
/// A drop that fails is logged and retried on the next sweep.
pub async fn sweep_expired(
    ledger: &dyn LedgerStore,
    bus: &dyn EventBus,
) -> Result<Vec<ExpiryRefund>, ServiceError> {
    let now = Utc::now();
    let mut refunds = Vec::new();

    for drop_id in ledger.expired_money_drops(now).await? {
        match ledger.expire_money_drop(drop_id, now).await {
            Ok(Some(refund)) => {
                info!(
                    "Money drop {} expired, refunded {} to {}",
                    drop_id, refund.refunded, refund.drop.creator_id
                );
                if let Some(transaction_id) = refund.transaction_id {
                    announce_by_id(ledger, bus, transaction_id).await;
                }
                refunds.push(refund);
            }
            // Claimed out or expired by another sweeper in the meantime.
            Ok(None) => {}
            Err(e) => error!("Could not expire money drop {}: {}", drop_id, e),
        }
    }

    Ok(refunds)
}

#[async_trait]
impl RequestHandler<MoneyDropRequest> for MoneyDropRequestHandler {
    async fn handle_request(&self, request: MoneyDropRequest) {
        match request {
            MoneyDropRequest::Create {
                creator_id,
                drop,
                response,
            } => {
                let result = self.create_drop(creator_id, drop).await;
                let _ = response.send(result);
            }
            MoneyDropRequest::Claim {
                drop_id,
                claimant_id,
                response,
            } => {
                let result = self.claim(drop_id, claimant_id).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct MoneyDropService;

impl MoneyDropService {
    pub fn new() -> Self {
        MoneyDropService {}
    }
}

#[async_trait]
impl Service<MoneyDropRequest, MoneyDropRequestHandler> for MoneyDropService {}
