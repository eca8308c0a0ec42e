use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::routing::{self, RecipientState, Route, RoutingDecision};
use super::{publish_after_commit, Dependencies, RequestHandler, Service, ServiceError};
use crate::models::accounts::Account;
use crate::models::baas::{CreateTransfer, RemoteTransferStatus};
use crate::models::events::{Event, EventPayload, TransferReroutedInternal};
use crate::models::transactions::{Transaction, TransferRequest};
use crate::repositories::{LedgerError, TransferEntry};

/// Re-decisions allowed when the recipient's subscription moves between the
/// routing read and the ledger write.
const MAX_ROUTING_ATTEMPTS: usize = 3;
const MAX_UNWIND_ATTEMPTS: u32 = 5;
const UNWIND_BACKOFF: Duration = Duration::from_millis(50);

pub enum TransferServiceRequest {
    Send {
        sender_id: Uuid,
        request: TransferRequest,
        response: oneshot::Sender<Result<Transaction, ServiceError>>,
    },
}

struct OpenedTransfer {
    decision: RoutingDecision,
    transaction: Transaction,
    counterparty_ref: Option<String>,
}

#[derive(Clone)]
pub struct TransferRequestHandler {
    deps: Dependencies,
    free_limit: i32,
}

impl TransferRequestHandler {
    pub fn new(deps: Dependencies, free_limit: i32) -> Self {
        TransferRequestHandler { deps, free_limit }
    }

    pub async fn send_transfer(
        &self,
        sender_id: Uuid,
        request: TransferRequest,
    ) -> Result<Transaction, ServiceError> {
        if request.amount <= 0 {
            return Err(ServiceError::Validation(
                "amount must be greater than zero".to_string(),
            ));
        }
        if sender_id == request.recipient_id {
            return Err(ServiceError::Validation(
                "sender and recipient must differ".to_string(),
            ));
        }

        let ledger = &self.deps.ledger;
        let sender = ledger.get_user(sender_id).await?;
        if !sender.allow_sending {
            return Err(ServiceError::Validation(format!(
                "user {} is not allowed to send money",
                sender.id
            )));
        }
        let sender_wallet = ledger.find_wallet(sender.id).await?.ok_or_else(|| {
            ServiceError::Validation(format!("user {} has no wallet yet", sender.id))
        })?;
        ledger.get_user(request.recipient_id).await?;

        let opened = self.open(Uuid::new_v4(), sender.id, &request).await?;
        let transaction = match opened.decision.route {
            Route::Internal { .. } => {
                info!(
                    "Transfer {} rerouted to the internal wallet of {}",
                    opened.transaction.id, request.recipient_id
                );
                publish_after_commit(
                    self.deps.bus.as_ref(),
                    Event::new(EventPayload::TransferReroutedInternal(
                        TransferReroutedInternal {
                            transaction_id: opened.transaction.id,
                        },
                    )),
                )
                .await;
                opened.transaction
            }
            Route::External { .. } => {
                let counterparty_ref = opened.counterparty_ref.as_deref().unwrap_or_default();
                self.pay_out(opened.transaction, &sender_wallet, counterparty_ref)
                    .await?
            }
        };

        publish_after_commit(
            self.deps.bus.as_ref(),
            Event::new(EventPayload::TransactionCompleted((&transaction).into())),
        )
        .await;

        Ok(transaction)
    }

    /// Routes and opens the transfer, re-deciding when the ledger reports
    /// that the subscription snapshot went stale.
    async fn open(
        &self,
        transaction_id: Uuid,
        sender_id: Uuid,
        request: &TransferRequest,
    ) -> Result<OpenedTransfer, ServiceError> {
        let ledger = &self.deps.ledger;
        let recipient_id = request.recipient_id;

        for attempt in 1..=MAX_ROUTING_ATTEMPTS {
            let subscription = ledger.get_subscription(recipient_id).await?;
            let beneficiary = ledger.default_beneficiary(recipient_id).await?;
            let wallet = ledger.find_wallet(recipient_id).await?;

            let decision = routing::decide(
                &RecipientState {
                    user_id: recipient_id,
                    subscription: subscription.snapshot(),
                    default_beneficiary: beneficiary.as_ref(),
                    main_wallet: wallet.as_ref(),
                },
                self.free_limit,
            )
            .map_err(|e| ServiceError::Validation(e.to_string()))?;

            let entry = TransferEntry {
                transaction_id,
                sender_id,
                recipient_id,
                amount: request.amount,
                description: request.description.clone(),
                kind: decision.kind(),
                destination: decision.destination(),
                meter_usage: decision.metered(),
                expected: decision.snapshot,
            };

            match ledger.open_transfer(&entry).await {
                Ok(transaction) => {
                    debug!("Opened transfer {} as {:?}", transaction.id, decision.route);
                    return Ok(OpenedTransfer {
                        decision,
                        transaction,
                        counterparty_ref: beneficiary.map(|b| b.external_counterparty_ref),
                    });
                }
                Err(LedgerError::StaleSnapshot(_)) => {
                    debug!(
                        "Subscription of {} moved during routing (attempt {})",
                        recipient_id, attempt
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ServiceError::Transient(format!(
            "subscription of {recipient_id} kept changing while routing"
        )))
    }

    async fn pay_out(
        &self,
        transaction: Transaction,
        sender_wallet: &Account,
        counterparty_ref: &str,
    ) -> Result<Transaction, ServiceError> {
        let Some(source_ref) = sender_wallet.external_reference.as_deref() else {
            self.unwind(&transaction).await?;
            return Err(ServiceError::Validation(format!(
                "wallet {} is not provisioned with the provider",
                sender_wallet.id
            )));
        };

        let remote = self
            .deps
            .gateway
            .create_transfer(CreateTransfer {
                transaction_id: transaction.id,
                source_account_ref: source_ref,
                counterparty_ref,
                amount: transaction.amount,
                reason: transaction.description.as_deref(),
            })
            .await;

        match remote {
            Ok(remote) if remote.status != RemoteTransferStatus::Failed => {
                match self
                    .deps
                    .ledger
                    .complete_transfer(transaction.id, Some(&remote.id))
                    .await
                {
                    Ok(completed) => {
                        info!("Transfer {} paid out as {}", completed.id, remote.id);
                        Ok(completed)
                    }
                    Err(e) => {
                        let err = ServiceError::Inconsistency {
                            resource: format!("remote transfer {}", remote.id),
                            detail: format!("transaction {} not completed: {}", transaction.id, e),
                        };
                        error!(target: "reconciliation", "{}", err);
                        Err(err)
                    }
                }
            }
            Ok(remote) => {
                warn!("Transfer {} failed remotely ({})", transaction.id, remote.id);
                self.unwind(&transaction).await?;
                Err(ServiceError::Rejected(format!(
                    "transfer {} was declined by the provider",
                    transaction.id
                )))
            }
            Err(e) => {
                warn!("Payout of transfer {} failed: {}", transaction.id, e);
                self.unwind(&transaction).await?;
                Err(e.into())
            }
        }
    }

    /// Refunds the sender. Lock contention is retried here because giving
    /// up would leave the funds in a pending transfer nobody revisits.
    async fn unwind(&self, transaction: &Transaction) -> Result<(), ServiceError> {
        let mut backoff = UNWIND_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.deps.ledger.fail_transfer(transaction.id).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_contention() && attempt < MAX_UNWIND_ATTEMPTS => {
                    debug!(
                        "Refund of transfer {} contended (attempt {}): {}",
                        transaction.id, attempt, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    let err = ServiceError::Inconsistency {
                        resource: format!("transaction {}", transaction.id),
                        detail: format!("payout failed and refund could not be recorded: {e}"),
                    };
                    error!(target: "reconciliation", "{}", err);
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl RequestHandler<TransferServiceRequest> for TransferRequestHandler {
    async fn handle_request(&self, request: TransferServiceRequest) {
        match request {
            TransferServiceRequest::Send {
                sender_id,
                request,
                response,
            } => {
                let result = self.send_transfer(sender_id, request).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct TransferService;

impl TransferService {
    pub fn new() -> Self {
        TransferService {}
    }
}

#[async_trait]
impl Service<TransferServiceRequest, TransferRequestHandler> for TransferService {}
