//! Onboarding saga. Each stage reacts to the previous stage's event, checks
//! local state before any remote call, and either commits and acknowledges or
//! does neither:
//!
//! 1. `user.created` creates the remote customer and starts verification.
//! 2. The provider webhook records the verdict and emits `customer.verified`
//!    or `customer.verification.rejected`.
//! 3. `customer.verified` opens the user's deposit account and main wallet.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use log::{debug, error, info, warn};
use tokio::sync::oneshot;

use super::{publish_after_commit, webhook, Dependencies, RequestHandler, Service, ServiceError};
use crate::bus::EventHandler;
use crate::models::baas::{
    CreateCustomer, CreateDepositAccount, CustomerKind, WebhookData, WebhookPayload,
    VERIFICATION_APPROVED, VERIFICATION_REJECTED,
};
use crate::models::events::{
    CustomerVerificationRejected, CustomerVerified, Event, EventPayload, UserCreated,
};
use crate::models::users::{AccountType, IdentityDetails, NewUser, User, VerificationStatus};
use crate::repositories::{BaasError, LedgerError};

const GENERIC_REJECTION: &str = "verification rejected by provider";

pub enum OnboardingRequest {
    Register {
        user: NewUser,
        response: oneshot::Sender<Result<User, ServiceError>>,
    },
    Webhook {
        body: Vec<u8>,
        signature: Option<String>,
        response: oneshot::Sender<Result<(), ServiceError>>,
    },
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate, ServiceError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| ServiceError::Validation(format!("{field} must be YYYY-MM-DD")))
}

fn validate(user: &NewUser) -> Result<(), ServiceError> {
    if user.subject.trim().is_empty() || user.username.trim().is_empty() {
        return Err(ServiceError::Validation(
            "subject and username are required".to_string(),
        ));
    }
    if user.details.account_type() != user.account_type {
        return Err(ServiceError::Validation(format!(
            "{} accounts require {} details",
            user.account_type,
            match user.account_type {
                AccountType::Personal => "KYC",
                AccountType::Merchant => "KYB",
            }
        )));
    }

    match &user.details {
        IdentityDetails::Kyc(kyc) => {
            if kyc.full_name.trim().is_empty() {
                return Err(ServiceError::Validation("full_name is required".to_string()));
            }
            if kyc.bvn.len() != 11 || !kyc.bvn.chars().all(|c| c.is_ascii_digit()) {
                return Err(ServiceError::Validation("bvn must be 11 digits".to_string()));
            }
            parse_date("date_of_birth", &kyc.date_of_birth)?;
        }
        IdentityDetails::Kyb(kyb) => {
            if kyb.business_name.trim().is_empty() || kyb.rc_number.trim().is_empty() {
                return Err(ServiceError::Validation(
                    "business_name and rc_number are required".to_string(),
                ));
            }
            if !kyb.contact_email.contains('@') {
                return Err(ServiceError::Validation(
                    "contact_email is not an email address".to_string(),
                ));
            }
            parse_date("registration_date", &kyb.registration_date)?;
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct OnboardingHandler {
    deps: Dependencies,
    period: Duration,
}

impl OnboardingHandler {
    pub fn new(deps: Dependencies, period: Duration) -> Self {
        OnboardingHandler { deps, period }
    }

    /// Persists the user with a free subscription and kicks off the saga.
    pub async fn register_user(&self, new_user: NewUser) -> Result<User, ServiceError> {
        validate(&new_user)?;

        let (user, _) = self
            .deps
            .ledger
            .create_user(&new_user, Utc::now() + self.period)
            .await?;
        info!("Registered {} user {}", user.account_type, user.id);

        publish_after_commit(
            self.deps.bus.as_ref(),
            Event::new(EventPayload::UserCreated(UserCreated {
                user_id: user.id,
                account_type: user.account_type,
                details: new_user.details,
            })),
        )
        .await;

        Ok(user)
    }

    pub async fn on_user_created(&self, event: &UserCreated) -> Result<(), ServiceError> {
        let ledger = &self.deps.ledger;
        let user = ledger.get_user(event.user_id).await?;

        if user.verification_status.is_terminal() {
            info!(
                "User {} already {}, skipping identity stage",
                user.id, user.verification_status
            );
            return Ok(());
        }
        if event.details.account_type() != user.account_type {
            return Err(ServiceError::Validation(format!(
                "user {} is {} but the event carries {} details",
                user.id,
                user.account_type,
                event.details.account_type()
            )));
        }

        let customer_ref = match user.external_customer_ref.clone() {
            Some(existing) => {
                debug!("User {} already has customer {}", user.id, existing);
                existing
            }
            None => {
                let created = self
                    .deps
                    .gateway
                    .create_customer(CreateCustomer {
                        user_id: user.id,
                        details: &event.details,
                    })
                    .await;
                let customer_ref = match created {
                    Ok(customer_ref) => customer_ref,
                    Err(e) if e.is_permanent() => return self.reject(&user, None, &e).await,
                    Err(e) => return Err(e.into()),
                };

                if let Err(e) = ledger.set_customer_ref(user.id, &customer_ref).await {
                    let err = ServiceError::Inconsistency {
                        resource: format!("customer {customer_ref}"),
                        detail: format!("reference not stored for user {}: {}", user.id, e),
                    };
                    error!(target: "reconciliation", "{}", err);
                    return Err(err);
                }
                info!("Created customer {} for user {}", customer_ref, user.id);
                customer_ref
            }
        };

        match self
            .deps
            .gateway
            .trigger_verification(&customer_ref, &event.details)
            .await
        {
            Ok(()) => {
                info!("Verification started for customer {}", customer_ref);
                Ok(())
            }
            Err(e) if e.is_permanent() => self.reject(&user, Some(&customer_ref), &e).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Terminal rejection during the identity stage. Acknowledged, not retried.
    async fn reject(
        &self,
        user: &User,
        customer_ref: Option<&str>,
        cause: &BaasError,
    ) -> Result<(), ServiceError> {
        warn!("Provider rejected onboarding of user {}: {}", user.id, cause);
        self.deps
            .ledger
            .set_verification_status(user.id, VerificationStatus::Rejected)
            .await?;

        publish_after_commit(
            self.deps.bus.as_ref(),
            Event::new(EventPayload::CustomerVerificationRejected(
                CustomerVerificationRejected {
                    user_id: user.id,
                    external_customer_ref: customer_ref.unwrap_or_default().to_string(),
                    reason: cause.to_string(),
                },
            )),
        )
        .await;
        Ok(())
    }

    /// Verification stage. Nothing in the body is read before the signature
    /// checks out.
    pub async fn handle_webhook(
        &self,
        secret: Option<&str>,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<(), ServiceError> {
        webhook::verify_signature(secret, body, signature)?;

        let payload: WebhookPayload = serde_json::from_slice(body)
            .map_err(|e| ServiceError::Validation(format!("malformed webhook: {e}")))?;
        let data = payload.data;

        let verdict = match data.event_type.as_str() {
            VERIFICATION_APPROVED => VerificationStatus::Approved,
            VERIFICATION_REJECTED => VerificationStatus::Rejected,
            other => {
                debug!("Ignoring webhook {} of type {}", data.id, other);
                return Ok(());
            }
        };

        let Some(customer_ref) = data.customer_ref() else {
            return Err(ServiceError::Validation(format!(
                "webhook {} names no customer",
                data.id
            )));
        };
        let Some(user) = self
            .deps
            .ledger
            .find_user_by_customer_ref(customer_ref)
            .await?
        else {
            warn!(
                "Webhook {} for unknown customer {}, acknowledging",
                data.id, customer_ref
            );
            return Ok(());
        };

        self.record_verdict(&user, customer_ref, verdict, &data).await
    }

    async fn record_verdict(
        &self,
        user: &User,
        customer_ref: &str,
        verdict: VerificationStatus,
        data: &WebhookData,
    ) -> Result<(), ServiceError> {
        match self
            .deps
            .ledger
            .set_verification_status(user.id, verdict)
            .await
        {
            Ok(_) => {}
            Err(LedgerError::InvalidState(reason)) => {
                warn!("Ignoring {} verdict for user {}: {}", verdict, user.id, reason);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let payload = match verdict {
            VerificationStatus::Approved => {
                info!("Customer {} of user {} verified", customer_ref, user.id);
                EventPayload::CustomerVerified(CustomerVerified {
                    user_id: user.id,
                    external_customer_ref: customer_ref.to_string(),
                })
            }
            _ => {
                let reason = data
                    .rejection_reason()
                    .unwrap_or_else(|| GENERIC_REJECTION.to_string());
                info!("Customer {} of user {} rejected: {}", customer_ref, user.id, reason);
                EventPayload::CustomerVerificationRejected(CustomerVerificationRejected {
                    user_id: user.id,
                    external_customer_ref: customer_ref.to_string(),
                    reason,
                })
            }
        };

        // The status write is idempotent, so a failed publish is surfaced and
        // the provider's redelivery completes the stage.
        self.deps.bus.publish(&Event::new(payload)).await?;
        Ok(())
    }

    pub async fn on_customer_verified(&self, event: &CustomerVerified) -> Result<(), ServiceError> {
        let ledger = &self.deps.ledger;

        if let Some(wallet) = ledger.find_wallet(event.user_id).await? {
            info!(
                "User {} already has wallet {}, skipping provisioning",
                event.user_id, wallet.id
            );
            return Ok(());
        }

        let user = ledger.get_user(event.user_id).await?;
        if user.verification_status != VerificationStatus::Approved {
            return Err(ServiceError::Validation(format!(
                "user {} is {}, not approved",
                user.id, user.verification_status
            )));
        }
        let kind = match user.account_type {
            AccountType::Personal => CustomerKind::Individual,
            AccountType::Merchant => CustomerKind::Business,
        };

        let account_ref = self
            .deps
            .gateway
            .create_deposit_account(CreateDepositAccount {
                user_id: user.id,
                customer_ref: &event.external_customer_ref,
                kind,
            })
            .await?;

        match ledger.create_wallet(user.id, &account_ref).await {
            Ok(wallet) => {
                info!(
                    "Provisioned wallet {} ({}) for user {}",
                    wallet.id, account_ref, user.id
                );
                Ok(())
            }
            Err(LedgerError::AlreadyExists(_)) => {
                let existing = ledger.find_wallet(user.id).await?;
                match existing.and_then(|w| w.external_reference) {
                    Some(reference) if reference == account_ref => Ok(()),
                    _ => {
                        let err = ServiceError::Inconsistency {
                            resource: format!("deposit account {account_ref}"),
                            detail: format!("user {} already has another wallet", user.id),
                        };
                        error!(target: "reconciliation", "{}", err);
                        Err(err)
                    }
                }
            }
            Err(e) => {
                let err = ServiceError::Inconsistency {
                    resource: format!("deposit account {account_ref}"),
                    detail: format!("wallet not stored for user {}: {}", user.id, e),
                };
                error!(target: "reconciliation", "{}", err);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl EventHandler for OnboardingHandler {
    async fn handle(&self, event: &Event) -> Result<(), ServiceError> {
        match &event.payload {
            EventPayload::UserCreated(e) => self.on_user_created(e).await,
            EventPayload::CustomerVerified(e) => self.on_customer_verified(e).await,
            other => {
                debug!("Onboarding ignores {}", other.event_type());
                Ok(())
            }
        }
    }
}

#[derive(Clone)]
pub struct OnboardingRequestHandler {
    onboarding: OnboardingHandler,
    webhook_secret: Option<String>,
}

impl OnboardingRequestHandler {
    pub fn new(onboarding: OnboardingHandler, webhook_secret: Option<String>) -> Self {
        OnboardingRequestHandler {
            onboarding,
            webhook_secret,
        }
    }
}

#[async_trait]
impl RequestHandler<OnboardingRequest> for OnboardingRequestHandler {
    async fn handle_request(&self, request: OnboardingRequest) {
        match request {
            OnboardingRequest::Register { user, response } => {
                let result = self.onboarding.register_user(user).await;
                let _ = response.send(result);
            }
            OnboardingRequest::Webhook {
                body,
                signature,
                response,
            } => {
                let result = self
                    .onboarding
                    .handle_webhook(
                        self.webhook_secret.as_deref(),
                        &body,
                        signature.as_deref(),
                    )
                    .await;
                if let Err(e) = &result {
                    warn!("Webhook not processed: {}", e);
                }
                let _ = response.send(result);
            }
        }
    }
}

pub struct OnboardingService;

impl OnboardingService {
    pub fn new() -> Self {
        OnboardingService {}
    }
}

#[async_trait]
impl Service<OnboardingRequest, OnboardingRequestHandler> for OnboardingService {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::users::{KybDetails, BusinessAddress, KycDetails};

    fn personal(details: IdentityDetails) -> NewUser {
        NewUser {
            subject: "auth|ada".to_string(),
            username: "ada".to_string(),
            account_type: AccountType::Personal,
            details,
        }
    }

    fn kyc() -> KycDetails {
        KycDetails {
            full_name: "Ada Lovelace".to_string(),
            bvn: "22222222222".to_string(),
            date_of_birth: "1990-01-01".to_string(),
        }
    }

    #[test]
    fn personal_account_needs_kyc() {
        let kyb = IdentityDetails::Kyb(KybDetails {
            business_name: "Analytical Engines".to_string(),
            rc_number: "RC1".to_string(),
            registration_date: "2020-02-02".to_string(),
            industry: "Technology".to_string(),
            contact_email: "ops@engines.ng".to_string(),
            address: BusinessAddress {
                line_1: "1 Marina".to_string(),
                city: "Lagos".to_string(),
                state: "Lagos".to_string(),
                country: "NG".to_string(),
            },
        });

        assert!(matches!(
            validate(&personal(kyb)),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn kyc_fields_are_checked() {
        assert!(validate(&personal(IdentityDetails::Kyc(kyc()))).is_ok());

        let mut short_bvn = kyc();
        short_bvn.bvn = "123".to_string();
        assert!(validate(&personal(IdentityDetails::Kyc(short_bvn))).is_err());

        let mut bad_date = kyc();
        bad_date.date_of_birth = "01/01/1990".to_string();
        assert!(validate(&personal(IdentityDetails::Kyc(bad_date))).is_err());
    }
}
