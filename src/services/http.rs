use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use log::{error, info};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::{
    beneficiaries::BeneficiaryRequest, money_drops::MoneyDropRequest,
    onboarding::OnboardingRequest, payment_requests::PaymentRequestMessage,
    transfers::TransferServiceRequest, webhook::SIGNATURE_HEADER, ServiceError,
};
use crate::models::{
    accounts::NewBeneficiary, money_drops::NewMoneyDrop, payment_requests::NewPaymentRequest,
    transactions::TransferRequest, users::NewUser,
};

pub const USER_ID_HEADER: &str = "x-user-id";

type ApiResponse = (StatusCode, Json<Value>);

#[derive(Clone)]
pub struct Channels {
    pub transfers: mpsc::Sender<TransferServiceRequest>,
    pub onboarding: mpsc::Sender<OnboardingRequest>,
    pub beneficiaries: mpsc::Sender<BeneficiaryRequest>,
    pub money_drops: mpsc::Sender<MoneyDropRequest>,
    pub payment_requests: mpsc::Sender<PaymentRequestMessage>,
}

fn status_of(error: &ServiceError) -> StatusCode {
    match error {
        ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Conflict(_) => StatusCode::CONFLICT,
        ServiceError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ServiceError::Inconsistency { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
    }
}

fn error_response(error: ServiceError) -> ApiResponse {
    let status = status_of(&error);
    // Internal detail stays in the logs.
    let description = match &error {
        ServiceError::Inconsistency { .. } => "Internal server error.".to_string(),
        other => other.to_string(),
    };
    if status.is_server_error() {
        error!("Request failed: {}", error);
    }
    (
        status,
        Json(json!({"error": error.kind(), "description": description})),
    )
}

fn unavailable(reason: impl std::fmt::Display) -> ApiResponse {
    error!("Service channel failure: {}", reason);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": "unavailable", "description": "Service unavailable."})),
    )
}

/// Sends a request to a service loop and waits for its answer.
async fn dispatch<R, T, F>(
    channel: &mpsc::Sender<R>,
    success: StatusCode,
    build: F,
) -> ApiResponse
where
    T: Serialize,
    F: FnOnce(oneshot::Sender<Result<T, ServiceError>>) -> R,
{
    let (response_tx, response_rx) = oneshot::channel();

    if let Err(e) = channel.send(build(response_tx)).await {
        return unavailable(e);
    }

    match response_rx.await {
        Ok(Ok(value)) => (success, Json(json!(value))),
        Ok(Err(service_error)) => error_response(service_error),
        Err(e) => unavailable(e),
    }
}

/// Local user id set by the upstream identity layer.
pub struct Caller(pub Uuid);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiResponse;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(Caller)
            .ok_or_else(|| {
                error_response(ServiceError::Unauthorized(format!(
                    "missing or malformed {} header",
                    USER_ID_HEADER
                )))
            })
    }
}

async fn register_user(
    State(channels): State<Channels>,
    Json(user): Json<NewUser>,
) -> ApiResponse {
    dispatch(&channels.onboarding, StatusCode::CREATED, |response| {
        OnboardingRequest::Register { user, response }
    })
    .await
}

async fn send_transfer(
    State(channels): State<Channels>,
    Caller(sender_id): Caller,
    Json(request): Json<TransferRequest>,
) -> ApiResponse {
    dispatch(&channels.transfers, StatusCode::CREATED, |response| {
        TransferServiceRequest::Send {
            sender_id,
            request,
            response,
        }
    })
    .await
}

async fn add_beneficiary(
    State(channels): State<Channels>,
    Caller(user_id): Caller,
    Json(beneficiary): Json<NewBeneficiary>,
) -> ApiResponse {
    dispatch(&channels.beneficiaries, StatusCode::CREATED, |response| {
        BeneficiaryRequest::Add {
            user_id,
            beneficiary,
            response,
        }
    })
    .await
}

async fn create_money_drop(
    State(channels): State<Channels>,
    Caller(creator_id): Caller,
    Json(drop): Json<NewMoneyDrop>,
) -> ApiResponse {
    dispatch(&channels.money_drops, StatusCode::CREATED, |response| {
        MoneyDropRequest::Create {
            creator_id,
            drop,
            response,
        }
    })
    .await
}

async fn claim_money_drop(
    State(channels): State<Channels>,
    Caller(claimant_id): Caller,
    Path(drop_id): Path<Uuid>,
) -> ApiResponse {
    dispatch(&channels.money_drops, StatusCode::OK, |response| {
        MoneyDropRequest::Claim {
            drop_id,
            claimant_id,
            response,
        }
    })
    .await
}

async fn create_payment_request(
    State(channels): State<Channels>,
    Caller(creator_id): Caller,
    Json(request): Json<NewPaymentRequest>,
) -> ApiResponse {
    dispatch(&channels.payment_requests, StatusCode::CREATED, |response| {
        PaymentRequestMessage::Create {
            creator_id,
            request,
            response,
        }
    })
    .await
}

#[derive(Serialize)]
struct FulfilledRequest<P: Serialize, T: Serialize> {
    request: P,
    transaction: T,
}

async fn pay_payment_request(
    State(channels): State<Channels>,
    Caller(payer_id): Caller,
    Path(request_id): Path<Uuid>,
) -> ApiResponse {
    let (response_tx, response_rx) = oneshot::channel();

    let tx_result = channels
        .payment_requests
        .send(PaymentRequestMessage::Pay {
            request_id,
            payer_id,
            response: response_tx,
        })
        .await;

    if let Err(e) = tx_result {
        return unavailable(e);
    }

    match response_rx.await {
        Ok(Ok((request, transaction))) => (
            StatusCode::OK,
            Json(json!(FulfilledRequest {
                request,
                transaction
            })),
        ),
        Ok(Err(service_error)) => error_response(service_error),
        Err(e) => unavailable(e),
    }
}

async fn baas_webhook(
    State(channels): State<Channels>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResponse {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    dispatch(&channels.onboarding, StatusCode::OK, |response| {
        OnboardingRequest::Webhook {
            body: body.to_vec(),
            signature,
            response,
        }
    })
    .await
}

pub fn router(channels: Channels) -> Router {
    Router::new()
        .route("/users", post(register_user))
        .route("/transfers", post(send_transfer))
        .route("/beneficiaries", post(add_beneficiary))
        .route("/money-drops", post(create_money_drop))
        .route("/money-drops/{id}/claim", post(claim_money_drop))
        .route("/payment-requests", post(create_payment_request))
        .route("/payment-requests/{id}/pay", post(pay_payment_request))
        .route("/webhooks/baas", post(baas_webhook))
        .route("/health", get(|| async { "OK" }))
        .with_state(channels)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_http_server(
    channels: Channels,
    listen: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), anyhow::Error> {
    let app = router(channels);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_channels() -> (Channels, mpsc::Receiver<TransferServiceRequest>) {
        let (transfers, transfer_rx) = mpsc::channel(1);
        let (onboarding, _) = mpsc::channel(1);
        let (beneficiaries, _) = mpsc::channel(1);
        let (money_drops, _) = mpsc::channel(1);
        let (payment_requests, _) = mpsc::channel(1);
        let channels = Channels {
            transfers,
            onboarding,
            beneficiaries,
            money_drops,
            payment_requests,
        };
        (channels, transfer_rx)
    }

    fn transfer_request(user_id: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/transfers")
            .header("content-type", "application/json");
        if let Some(user_id) = user_id {
            builder = builder.header(USER_ID_HEADER, user_id);
        }
        let body = json!({"recipient_id": Uuid::new_v4(), "amount": 100});
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            status_of(&ServiceError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(&ServiceError::Conflict("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(&ServiceError::Transient("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(&ServiceError::Unauthorized("x".into())),
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn missing_caller_is_unauthorized() {
        let (channels, _rx) = test_channels();

        let response = router(channels)
            .oneshot(transfer_request(None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let (channels, _rx) = test_channels();
        let response = router(channels)
            .oneshot(transfer_request(Some("not-a-uuid")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn service_errors_become_json() {
        let (channels, mut rx) = test_channels();
        let sender = Uuid::new_v4();

        tokio::spawn(async move {
            if let Some(TransferServiceRequest::Send {
                sender_id,
                response,
                ..
            }) = rx.recv().await
            {
                let _ = response.send(Err(ServiceError::Validation(format!(
                    "user {} is not allowed to send money",
                    sender_id
                ))));
            }
        });

        let response = router(channels)
            .oneshot(transfer_request(Some(&sender.to_string())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "validation");
        assert!(body["description"]
            .as_str()
            .unwrap()
            .contains(&sender.to_string()));
    }

    #[tokio::test]
    async fn health() {
        let (channels, _rx) = test_channels();
        let response = router(channels)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
