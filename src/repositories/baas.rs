use async_trait::async_trait;
use reqwest::StatusCode;

use crate::models::baas::{
    CreateCounterparty, CreateCustomer, CreateDepositAccount, CreateTransfer, RemoteTransfer,
};
use crate::models::users::IdentityDetails;

mod http;

pub use http::HttpBaasGateway;

#[derive(Debug, thiserror::Error)]
pub enum BaasError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("remote returned {status}: {body}")]
    Remote { status: StatusCode, body: String },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl BaasError {
    /// A 4xx the provider will keep returning. Timeouts and throttling are
    /// excluded so callers can retry them.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Remote { status, .. } => {
                status.is_client_error()
                    && *status != StatusCode::REQUEST_TIMEOUT
                    && *status != StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for BaasError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BaasError::Timeout
        } else if err.is_decode() {
            BaasError::Decode(err.to_string())
        } else {
            BaasError::Transport(err.to_string())
        }
    }
}

/// Remote banking provider. Never retries on its own; callers check local
/// state before repeating a call.
#[async_trait]
pub trait BaasGateway: Send + Sync {
    /// Returns the remote customer id.
    async fn create_customer(&self, request: CreateCustomer<'_>) -> Result<String, BaasError>;
    async fn trigger_verification(
        &self,
        customer_ref: &str,
        details: &IdentityDetails,
    ) -> Result<(), BaasError>;
    /// Returns the remote account id.
    async fn create_deposit_account(
        &self,
        request: CreateDepositAccount<'_>,
    ) -> Result<String, BaasError>;
    /// Returns the remote counterparty id.
    async fn create_counterparty(
        &self,
        request: CreateCounterparty<'_>,
    ) -> Result<String, BaasError>;
    async fn create_transfer(&self, request: CreateTransfer<'_>) -> Result<RemoteTransfer, BaasError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanence_follows_status_class() {
        let remote = |code: u16| BaasError::Remote {
            status: StatusCode::from_u16(code).unwrap(),
            body: String::new(),
        };

        assert!(remote(400).is_permanent());
        assert!(remote(422).is_permanent());
        assert!(!remote(408).is_permanent());
        assert!(!remote(429).is_permanent());
        assert!(!remote(502).is_permanent());
        assert!(!BaasError::Timeout.is_permanent());
    }
}
