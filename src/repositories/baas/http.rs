use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::{BaasError, BaasGateway};
use crate::models::baas::{
    CreateCounterparty, CreateCustomer, CreateDepositAccount, CreateTransfer, RemoteTransfer,
    RemoteTransferStatus, ResourceEnvelope, TransferAttributes,
};
use crate::models::events::idempotency_key;
use crate::models::users::IdentityDetails;

const API_KEY_HEADER: &str = "x-anchor-key";
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const CURRENCY: &str = "NGN";

pub struct HttpBaasGateway {
    api_key: String,
    url: String,
    client: reqwest::Client,
}

impl HttpBaasGateway {
    pub fn new(api_key: String, url: String, timeout: Duration) -> Result<Self, BaasError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            api_key,
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post(
        &self,
        path: &str,
        idempotency: Option<String>,
        payload: &Value,
    ) -> Result<reqwest::Response, BaasError> {
        let mut request = self
            .client
            .post(format!("{}{}", self.url, path))
            .header(API_KEY_HEADER, &self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(payload);
        if let Some(key) = idempotency {
            request = request.header(IDEMPOTENCY_HEADER, key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BaasError::Remote { status, body });
        }

        debug!("BaaS POST {} -> {}", path, status);
        Ok(response)
    }

    async fn create_resource<A: DeserializeOwned>(
        &self,
        path: &str,
        idempotency: String,
        payload: &Value,
    ) -> Result<ResourceEnvelope<A>, BaasError> {
        let envelope: ResourceEnvelope<A> =
            self.post(path, Some(idempotency), payload).await?.json().await?;

        if envelope.data.id.is_empty() {
            return Err(BaasError::Decode(format!("{path}: empty resource id")));
        }
        Ok(envelope)
    }
}

fn split_name(full_name: &str) -> (&str, &str) {
    let trimmed = full_name.trim();
    match trimmed.split_once(' ') {
        Some((first, last)) => (first, last.trim()),
        None => (trimmed, trimmed),
    }
}

fn customer_payload(details: &IdentityDetails, user_id: &str) -> Value {
    match details {
        IdentityDetails::Kyc(kyc) => {
            let (first_name, last_name) = split_name(&kyc.full_name);
            json!({
                "data": {
                    "type": "IndividualCustomer",
                    "attributes": {
                        "fullName": { "firstName": first_name, "lastName": last_name },
                        "identificationLevel2": { "dateOfBirth": kyc.date_of_birth, "bvn": kyc.bvn },
                        "metadata": { "userId": user_id },
                    }
                }
            })
        }
        IdentityDetails::Kyb(kyb) => json!({
            "data": {
                "type": "BusinessCustomer",
                "attributes": {
                    "basicDetail": {
                        "businessName": kyb.business_name,
                        "industry": kyb.industry,
                        "registrationType": "Private_Incorporated",
                        "dateOfRegistration": kyb.registration_date,
                    },
                    "contact": {
                        "email": { "general": kyb.contact_email },
                        "address": {
                            "main": {
                                "addressLine_1": kyb.address.line_1,
                                "city": kyb.address.city,
                                "state": kyb.address.state,
                                "country": kyb.address.country,
                            }
                        }
                    },
                    "metadata": { "userId": user_id },
                }
            }
        }),
    }
}

#[async_trait]
impl BaasGateway for HttpBaasGateway {
    async fn create_customer(&self, request: CreateCustomer<'_>) -> Result<String, BaasError> {
        let user_id = request.user_id.to_string();
        let payload = customer_payload(request.details, &user_id);

        let envelope: ResourceEnvelope<Value> = self
            .create_resource(
                "/api/v1/customers",
                idempotency_key("create_customer", &user_id),
                &payload,
            )
            .await?;
        Ok(envelope.data.id)
    }

    async fn trigger_verification(
        &self,
        customer_ref: &str,
        details: &IdentityDetails,
    ) -> Result<(), BaasError> {
        let (path, payload) = match details {
            IdentityDetails::Kyc(kyc) => (
                format!("/api/v1/customers/{customer_ref}/verification/individual"),
                json!({
                    "data": {
                        "type": "Verification",
                        "attributes": {
                            "level": "TIER_2",
                            "level2": { "bvn": kyc.bvn, "dateOfBirth": kyc.date_of_birth },
                        }
                    }
                }),
            ),
            IdentityDetails::Kyb(kyb) => (
                format!("/api/v1/customers/{customer_ref}/verification/business"),
                json!({
                    "data": {
                        "type": "Verification",
                        "attributes": { "rcNumber": kyb.rc_number },
                    }
                }),
            ),
        };

        // Verification is keyed by the remote customer, repeats are harmless.
        self.post(&path, None, &payload).await?;
        Ok(())
    }

    async fn create_deposit_account(
        &self,
        request: CreateDepositAccount<'_>,
    ) -> Result<String, BaasError> {
        let payload = json!({
            "data": {
                "type": "DepositAccount",
                "attributes": { "productName": request.kind.wallet_product() },
                "relationships": {
                    "customer": {
                        "data": { "id": request.customer_ref, "type": request.kind.remote_type() }
                    }
                }
            }
        });

        let envelope: ResourceEnvelope<Value> = self
            .create_resource(
                "/api/v1/accounts",
                idempotency_key("create_deposit_account", &request.user_id.to_string()),
                &payload,
            )
            .await?;
        Ok(envelope.data.id)
    }

    async fn create_counterparty(
        &self,
        request: CreateCounterparty<'_>,
    ) -> Result<String, BaasError> {
        let payload = json!({
            "data": {
                "type": "CounterParty",
                "attributes": {
                    "accountName": request.account_name,
                    "accountNumber": request.account_number,
                    "bankCode": request.bank_code,
                    "verifyName": false,
                }
            }
        });
        let subject = format!(
            "{}:{}:{}",
            request.user_id, request.bank_code, request.account_number
        );

        let envelope: ResourceEnvelope<Value> = self
            .create_resource(
                "/api/v1/counterparties",
                idempotency_key("create_counterparty", &subject),
                &payload,
            )
            .await?;
        Ok(envelope.data.id)
    }

    async fn create_transfer(&self, request: CreateTransfer<'_>) -> Result<RemoteTransfer, BaasError> {
        let reference = request.transaction_id.to_string();
        let payload = json!({
            "data": {
                "type": "NIPTransfer",
                "attributes": {
                    "amount": request.amount,
                    "currency": CURRENCY,
                    "reason": request.reason.unwrap_or("Transfer"),
                    "reference": reference,
                },
                "relationships": {
                    "account": {
                        "data": { "id": request.source_account_ref, "type": "DepositAccount" }
                    },
                    "counterParty": {
                        "data": { "id": request.counterparty_ref, "type": "CounterParty" }
                    }
                }
            }
        });

        let envelope: ResourceEnvelope<TransferAttributes> = self
            .create_resource(
                "/api/v1/transfers",
                idempotency_key("create_transfer", &reference),
                &payload,
            )
            .await?;

        Ok(RemoteTransfer {
            status: envelope
                .data
                .attributes
                .map(|a| a.status)
                .unwrap_or(RemoteTransferStatus::Pending),
            id: envelope.data.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::baas::CustomerKind;
    use crate::models::users::KycDetails;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(server: &MockServer) -> HttpBaasGateway {
        HttpBaasGateway::new("test-key".to_string(), server.uri(), Duration::from_millis(500))
            .unwrap()
    }

    fn kyc() -> IdentityDetails {
        IdentityDetails::Kyc(KycDetails {
            full_name: "Ada Lovelace".to_string(),
            bvn: "22222222222".to_string(),
            date_of_birth: "1990-01-01".to_string(),
        })
    }

    #[tokio::test]
    async fn creates_customer_with_auth_and_idempotency_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/customers"))
            .and(header("x-anchor-key", "test-key"))
            .and(header_exists("idempotency-key"))
            .and(body_partial_json(json!({
                "data": {
                    "type": "IndividualCustomer",
                    "attributes": { "fullName": { "firstName": "Ada", "lastName": "Lovelace" } }
                }
            })))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({ "data": { "id": "cus_123" } })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let details = kyc();
        let id = gateway(&server)
            .create_customer(CreateCustomer {
                user_id: Uuid::new_v4(),
                details: &details,
            })
            .await
            .unwrap();

        assert_eq!(id, "cus_123");
    }

    #[tokio::test]
    async fn non_success_maps_to_remote_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/customers/cus_1/verification/individual"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bvn mismatch"))
            .mount(&server)
            .await;

        let err = gateway(&server)
            .trigger_verification("cus_1", &kyc())
            .await
            .unwrap_err();

        match err {
            BaasError::Remote { status, ref body } => {
                assert_eq!(status.as_u16(), 422);
                assert_eq!(body, "bvn mismatch");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn slow_remote_is_a_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/accounts"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({ "data": { "id": "acct_1" } }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let err = gateway(&server)
            .create_deposit_account(CreateDepositAccount {
                user_id: Uuid::new_v4(),
                customer_ref: "cus_1",
                kind: CustomerKind::Individual,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BaasError::Timeout));
    }

    #[tokio::test]
    async fn transfer_status_is_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/transfers"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "data": { "id": "trf_9", "attributes": { "status": "COMPLETED" } }
            })))
            .mount(&server)
            .await;

        let transfer = gateway(&server)
            .create_transfer(CreateTransfer {
                transaction_id: Uuid::new_v4(),
                source_account_ref: "acct_1",
                counterparty_ref: "cp_1",
                amount: 1_000,
                reason: None,
            })
            .await
            .unwrap();

        assert_eq!(transfer.id, "trf_9");
        assert_eq!(transfer.status, RemoteTransferStatus::Completed);
    }

    #[tokio::test]
    async fn missing_id_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/counterparties"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": {} })))
            .mount(&server)
            .await;

        let err = gateway(&server)
            .create_counterparty(CreateCounterparty {
                user_id: Uuid::new_v4(),
                account_name: "Ada",
                account_number: "0123456789",
                bank_code: "058",
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BaasError::Decode(_)));
    }
}
