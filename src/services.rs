use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info};
use tokio::sync::{mpsc, watch};

use crate::bus::{self, Disposition, EventBus};
use crate::models::events;
use crate::repositories::{BaasError, BaasGateway, LedgerError, LedgerStore};
use crate::settings::Settings;

pub mod beneficiaries;
pub mod http;
pub mod money_drops;
pub mod onboarding;
pub mod payment_requests;
pub mod routing;
pub mod scheduler;
pub mod transfers;
pub mod webhook;

const CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Temporarily unavailable: {0}")]
    Transient(String),
    #[error("Rejected by provider: {0}")]
    Rejected(String),
    #[error("Inconsistent state for {resource}: {detail}")]
    Inconsistency { resource: String, detail: String },
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl ServiceError {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Transient(_) => Disposition::Retry,
            Self::Inconsistency { .. } => Disposition::Reconcile,
            Self::Validation(_)
            | Self::NotFound(_)
            | Self::Conflict(_)
            | Self::Rejected(_)
            | Self::Unauthorized(_) => Disposition::DeadLetter,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Transient(_) => "unavailable",
            Self::Rejected(_) => "rejected",
            Self::Inconsistency { .. } => "inconsistency",
            Self::Unauthorized(_) => "unauthorized",
        }
    }
}

impl From<LedgerError> for ServiceError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(_) => ServiceError::NotFound(err.to_string()),
            LedgerError::InsufficientFunds(_) | LedgerError::InvalidState(_) => {
                ServiceError::Validation(err.to_string())
            }
            LedgerError::DropNotActive(_)
            | LedgerError::DropExpired(_)
            | LedgerError::DropExhausted(_)
            | LedgerError::AlreadyClaimed { .. }
            | LedgerError::AlreadyExists(_)
            | LedgerError::AlreadyFulfilled(_) => ServiceError::Conflict(err.to_string()),
            // Callers that can re-decide handle this before converting.
            LedgerError::StaleSnapshot(_)
            | LedgerError::Contention(_)
            | LedgerError::Database(_) => {
                ServiceError::Transient(err.to_string())
            }
        }
    }
}

impl From<BaasError> for ServiceError {
    fn from(err: BaasError) -> Self {
        if err.is_permanent() {
            ServiceError::Rejected(err.to_string())
        } else {
            ServiceError::Transient(err.to_string())
        }
    }
}

impl From<bus::BusError> for ServiceError {
    fn from(err: bus::BusError) -> Self {
        ServiceError::Transient(err.to_string())
    }
}

/// Publishes an event for state that is already committed. A failure cannot
/// be rolled back, so it is logged and swallowed.
pub(crate) async fn publish_after_commit(bus: &dyn EventBus, event: events::Event) {
    if let Err(e) = bus.publish(&event).await {
        log::warn!(
            "Committed state but could not publish {} ({}): {}",
            event.event_type(),
            event.idempotency_key,
            e
        );
    }
}

#[async_trait]
pub trait RequestHandler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle_request(&self, request: T);
}

#[async_trait]
pub trait Service<T, H>: Send + Sync + 'static
where
    T: Send + 'static,
    H: RequestHandler<T> + Clone + Send,
{
    async fn run(&mut self, handler: H, receiver: &mut mpsc::Receiver<T>) {
        while let Some(request) = receiver.recv().await {
            let handler = handler.clone();

            tokio::spawn(async move {
                handler.handle_request(request).await;
            });
        }
    }
}

/// Collaborators shared by every service.
#[derive(Clone)]
pub struct Dependencies {
    pub ledger: Arc<dyn LedgerStore>,
    pub gateway: Arc<dyn BaasGateway>,
    pub bus: Arc<dyn EventBus>,
}

pub async fn start_services(
    deps: Dependencies,
    settings: Settings,
    listen: String,
    shutdown: watch::Receiver<bool>,
) -> Result<(), anyhow::Error> {
    let (transfer_tx, mut transfer_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (onboarding_tx, mut onboarding_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (beneficiary_tx, mut beneficiary_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (money_drop_tx, mut money_drop_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (payment_request_tx, mut payment_request_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let period = chrono::Duration::days(settings.scheduler.subscription_period_days);
    let onboarding = onboarding::OnboardingHandler::new(deps.clone(), period);

    info!("Starting transfer service.");
    let transfer_handler =
        transfers::TransferRequestHandler::new(deps.clone(), settings.routing.free_transfer_limit);
    tokio::spawn(async move {
        transfers::TransferService::new()
            .run(transfer_handler, &mut transfer_rx)
            .await;
    });

    info!("Starting onboarding service.");
    let webhook_secret = settings.baas.webhook_secret.clone();
    let onboarding_handler =
        onboarding::OnboardingRequestHandler::new(onboarding.clone(), webhook_secret);
    tokio::spawn(async move {
        onboarding::OnboardingService::new()
            .run(onboarding_handler, &mut onboarding_rx)
            .await;
    });

    info!("Starting beneficiary service.");
    let beneficiary_handler = beneficiaries::BeneficiaryRequestHandler::new(deps.clone());
    tokio::spawn(async move {
        beneficiaries::BeneficiaryService::new()
            .run(beneficiary_handler, &mut beneficiary_rx)
            .await;
    });

    info!("Starting money drop service.");
    let money_drop_handler =
        money_drops::MoneyDropRequestHandler::new(deps.ledger.clone(), deps.bus.clone());
    tokio::spawn(async move {
        money_drops::MoneyDropService::new()
            .run(money_drop_handler, &mut money_drop_rx)
            .await;
    });

    info!("Starting payment request service.");
    let payment_request_handler =
        payment_requests::PaymentRequestHandler::new(deps.ledger.clone(), deps.bus.clone());
    tokio::spawn(async move {
        payment_requests::PaymentRequestService::new()
            .run(payment_request_handler, &mut payment_request_rx)
            .await;
    });

    info!("Starting onboarding consumers.");
    let consumer: Arc<dyn bus::EventHandler> = Arc::new(onboarding);
    let max_attempts = settings.broker.max_delivery_attempts;
    let consumer_bus = deps.bus.clone();
    let group = settings.broker.group_id.clone();
    let consumer_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let topics = [events::USER_CREATED, events::CUSTOMER_VERIFIED];
        if let Err(e) = bus::consume(
            consumer_bus,
            &topics,
            &group,
            consumer,
            max_attempts,
            consumer_shutdown,
        )
        .await
        {
            error!("Onboarding consumer stopped: {}", e);
        }
    });

    info!("Starting scheduler.");
    let scheduler = scheduler::Scheduler::new(
        deps.ledger.clone(),
        deps.bus.clone(),
        std::time::Duration::from_secs(settings.scheduler.sweep_interval_secs),
        period,
    );
    let scheduler_shutdown = shutdown.clone();
    tokio::spawn(async move {
        scheduler.run(scheduler_shutdown).await;
    });

    info!("Starting HTTP server.");
    let channels = http::Channels {
        transfers: transfer_tx,
        onboarding: onboarding_tx,
        beneficiaries: beneficiary_tx,
        money_drops: money_drop_tx,
        payment_requests: payment_request_tx,
    };
    http::start_http_server(channels, &listen, shutdown).await?;

    info!("Services stopped.");
    Ok(())
}
