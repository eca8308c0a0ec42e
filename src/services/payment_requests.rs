use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{publish_after_commit, RequestHandler, Service, ServiceError};
use crate::bus::EventBus;
use crate::models::events::{Event, EventPayload};
use crate::models::payment_requests::{NewPaymentRequest, PaymentRequest};
use crate::models::transactions::Transaction;
use crate::repositories::LedgerStore;

pub enum PaymentRequestMessage {
    Create {
        creator_id: Uuid,
        request: NewPaymentRequest,
        response: oneshot::Sender<Result<PaymentRequest, ServiceError>>,
    },
    Pay {
        request_id: Uuid,
        payer_id: Uuid,
        response: oneshot::Sender<Result<(PaymentRequest, Transaction), ServiceError>>,
    },
}

#[derive(Clone)]
pub struct PaymentRequestHandler {
    ledger: Arc<dyn LedgerStore>,
    bus: Arc<dyn EventBus>,
}

impl PaymentRequestHandler {
    pub fn new(ledger: Arc<dyn LedgerStore>, bus: Arc<dyn EventBus>) -> Self {
        PaymentRequestHandler { ledger, bus }
    }

    pub async fn create(
        &self,
        creator_id: Uuid,
        request: NewPaymentRequest,
    ) -> Result<PaymentRequest, ServiceError> {
        if request.amount <= 0 {
            return Err(ServiceError::Validation(
                "amount must be greater than zero".to_string(),
            ));
        }

        let created = self.ledger.create_payment_request(creator_id, &request).await?;
        info!("Payment request {} for {} created by {}", created.id, created.amount, creator_id);
        Ok(created)
    }

    pub async fn pay(
        &self,
        request_id: Uuid,
        payer_id: Uuid,
    ) -> Result<(PaymentRequest, Transaction), ServiceError> {
        let payer = self.ledger.get_user(payer_id).await?;
        if !payer.allow_sending {
            return Err(ServiceError::Validation(format!(
                "user {} is not allowed to send money",
                payer.id
            )));
        }

        let (fulfilled, transaction) = self
            .ledger
            .fulfill_payment_request(request_id, payer_id)
            .await?;
        info!(
            "Payment request {} fulfilled by {} via {}",
            request_id, payer_id, transaction.id
        );

        publish_after_commit(
            self.bus.as_ref(),
            Event::new(EventPayload::TransactionCompleted((&transaction).into())),
        )
        .await;

        Ok((fulfilled, transaction))
    }
}

#[async_trait]
impl RequestHandler<PaymentRequestMessage> for PaymentRequestHandler {
    async fn handle_request(&self, request: PaymentRequestMessage) {
        match request {
            PaymentRequestMessage::Create {
                creator_id,
                request,
                response,
            } => {
                let result = self.create(creator_id, request).await;
                let _ = response.send(result);
            }
            PaymentRequestMessage::Pay {
                request_id,
                payer_id,
                response,
            } => {
                let result = self.pay(request_id, payer_id).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct PaymentRequestService;

impl PaymentRequestService {
    pub fn new() -> Self {
        PaymentRequestService {}
    }
}

#[async_trait]
impl Service<PaymentRequestMessage, PaymentRequestHandler> for PaymentRequestService {}
