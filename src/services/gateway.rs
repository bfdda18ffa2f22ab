use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, instrument, warn};

use crate::config::GatewayConfig;
use crate::entities::{OrderStatus, PaymentStatus};
use crate::errors::ServiceError;

/// Transaction status as reported by the payment gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GatewayStatus {
    Approved,
    Declined,
    Voided,
    Pending,
    /// Anything the gateway adds later (`ERROR` today)
    Other(String),
}

impl GatewayStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "APPROVED" => GatewayStatus::Approved,
            "DECLINED" => GatewayStatus::Declined,
            "VOIDED" => GatewayStatus::Voided,
            "PENDING" => GatewayStatus::Pending,
            other => GatewayStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            GatewayStatus::Approved => "APPROVED",
            GatewayStatus::Declined => "DECLINED",
            GatewayStatus::Voided => "VOIDED",
            GatewayStatus::Pending => "PENDING",
            GatewayStatus::Other(raw) => raw,
        }
    }

    /// Maps the gateway outcome onto the local (order, payment) status pair.
    /// Unknown values stay pending until a later poll or webhook settles them.
    pub fn resolve(&self) -> (OrderStatus, PaymentStatus) {
        match self {
            GatewayStatus::Approved => (OrderStatus::Confirmed, PaymentStatus::Approved),
            GatewayStatus::Declined | GatewayStatus::Voided => {
                (OrderStatus::Cancelled, PaymentStatus::Rejected)
            }
            GatewayStatus::Pending | GatewayStatus::Other(_) => {
                (OrderStatus::Pending, PaymentStatus::Pending)
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, GatewayStatus::Pending)
    }
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for GatewayStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for GatewayStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(GatewayStatus::parse(&raw))
    }
}

/// Raw card data. Only ever forwarded to the tokenization endpoint.
#[derive(Clone)]
pub struct CardDetails {
    pub number: String,
    pub exp_month: String,
    pub exp_year: String,
    pub cvc: String,
    pub card_holder: String,
}

impl fmt::Debug for CardDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last4 = self
            .number
            .len()
            .checked_sub(4)
            .and_then(|start| self.number.get(start..))
            .unwrap_or("");
        f.debug_struct("CardDetails")
            .field("number", &format!("****{}", last4))
            .field("card_holder", &self.card_holder)
            .finish_non_exhaustive()
    }
}

/// Authorization request for an already tokenized card
#[derive(Debug, Clone)]
pub struct TransactionRequest {
    pub amount_in_cents: i64,
    pub currency: String,
    pub customer_email: String,
    pub payment_token: String,
    /// Merchant reference, also the gateway-side idempotency key
    pub reference: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayTransaction {
    pub id: String,
    pub status: GatewayStatus,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub status_message: Option<String>,
}

/// Remote card-payment gateway. Calls have at-least-once semantics: a
/// request may succeed remotely even when the response is lost.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn tokenize_card(&self, card: &CardDetails) -> Result<String, ServiceError>;

    async fn create_transaction(
        &self,
        request: &TransactionRequest,
    ) -> Result<GatewayTransaction, ServiceError>;

    async fn get_transaction(&self, transaction_id: &str)
        -> Result<GatewayTransaction, ServiceError>;
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct MerchantData {
    presigned_acceptance: PresignedAcceptance,
}

#[derive(Deserialize)]
struct PresignedAcceptance {
    acceptance_token: String,
}

#[derive(Deserialize)]
struct TokenData {
    id: String,
}

#[derive(Serialize)]
struct TokenizeBody<'a> {
    number: &'a str,
    exp_month: &'a str,
    exp_year: &'a str,
    cvc: &'a str,
    card_holder: &'a str,
}

#[derive(Serialize)]
struct PaymentMethodBody<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    installments: u32,
    token: &'a str,
}

// Shipping address is deliberately absent; the sandbox rejects it with 422.
#[derive(Serialize)]
struct CreateTransactionBody<'a> {
    amount_in_cents: i64,
    currency: &'a str,
    customer_email: &'a str,
    payment_method: PaymentMethodBody<'a>,
    reference: &'a str,
    acceptance_token: &'a str,
    signature: &'a str,
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    AcceptanceToken,
    Tokenize,
    CreateTransaction,
    GetTransaction,
}

impl Operation {
    fn label(self) -> &'static str {
        match self {
            Operation::AcceptanceToken => "acceptance token",
            Operation::Tokenize => "card tokenization",
            Operation::CreateTransaction => "transaction creation",
            Operation::GetTransaction => "transaction query",
        }
    }
}

/// Pulls a human-readable message out of a gateway error body.
pub fn extract_error_message(body: &Value) -> Option<String> {
    let error = body.get("error");

    if let Some(reason) = error.and_then(|e| e.get("reason")).and_then(Value::as_str) {
        return Some(reason.to_string());
    }

    if let Some(messages) = error.and_then(|e| e.get("messages")) {
        let rendered = match messages {
            Value::Object(fields) => fields
                .iter()
                .map(|(field, msgs)| match msgs {
                    Value::Array(items) => format!(
                        "{}: {}",
                        field,
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                    other => format!("{}: {}", field, other),
                })
                .collect::<Vec<_>>()
                .join("; "),
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("; "),
            Value::String(s) => s.clone(),
            _ => String::new(),
        };
        if !rendered.is_empty() {
            return Some(rendered);
        }
    }

    error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .or_else(|| body.get("message").and_then(Value::as_str))
        .map(str::to_string)
}

/// Translates a non-success gateway response into the error taxonomy.
async fn error_from_response(operation: Operation, response: Response) -> ServiceError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .as_ref()
        .and_then(extract_error_message)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string()
        });

    warn!(
        operation = operation.label(),
        status = status.as_u16(),
        %message,
        "Gateway call failed"
    );

    classify_status(operation, status, message)
}

fn classify_status(operation: Operation, status: StatusCode, message: String) -> ServiceError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return ServiceError::GatewayAuthError(format!(
            "{} returned {}",
            operation.label(),
            status.as_u16()
        ));
    }

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return ServiceError::GatewayUnavailable(format!(
            "{} returned {}: {}",
            operation.label(),
            status.as_u16(),
            message
        ));
    }

    match operation {
        Operation::Tokenize => ServiceError::GatewayValidationError(message),
        _ => ServiceError::GatewayRejected(message),
    }
}

fn transport_error(operation: Operation, err: reqwest::Error) -> ServiceError {
    let detail = if err.is_timeout() {
        "timed out".to_string()
    } else {
        err.to_string()
    };
    warn!(operation = operation.label(), error = %detail, "Gateway unreachable");
    ServiceError::GatewayUnavailable(format!("{}: {}", operation.label(), detail))
}

fn decode_error(operation: Operation, err: reqwest::Error) -> ServiceError {
    ServiceError::GatewayUnavailable(format!(
        "{} returned an unreadable body: {}",
        operation.label(),
        err
    ))
}

/// `PaymentGateway` over the gateway's REST API.
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
    public_key: String,
    private_key: String,
}

impl HttpPaymentGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| {
                ServiceError::InternalError(format!("failed to build gateway HTTP client: {}", e))
            })?;

        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: &GatewayConfig, client: Client) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            public_key: config.public_key.clone(),
            private_key: config.private_key.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fetches a fresh acceptance token; they are short-lived so one is
    /// requested per transaction.
    #[instrument(skip(self))]
    async fn acceptance_token(&self) -> Result<String, ServiceError> {
        let op = Operation::AcceptanceToken;
        let response = self
            .client
            .get(self.url(&format!("/merchants/{}", self.public_key)))
            .bearer_auth(&self.public_key)
            .send()
            .await
            .map_err(|e| transport_error(op, e))?;

        if !response.status().is_success() {
            return Err(error_from_response(op, response).await);
        }

        let body: Envelope<MerchantData> =
            response.json().await.map_err(|e| decode_error(op, e))?;
        Ok(body.data.presigned_acceptance.acceptance_token)
    }

    async fn read_transaction(
        op: Operation,
        response: Response,
    ) -> Result<GatewayTransaction, ServiceError> {
        if !response.status().is_success() {
            return Err(error_from_response(op, response).await);
        }
        let body: Envelope<GatewayTransaction> =
            response.json().await.map_err(|e| decode_error(op, e))?;
        Ok(body.data)
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, card))]
    async fn tokenize_card(&self, card: &CardDetails) -> Result<String, ServiceError> {
        let op = Operation::Tokenize;
        let body = TokenizeBody {
            number: &card.number,
            exp_month: &card.exp_month,
            exp_year: &card.exp_year,
            cvc: &card.cvc,
            card_holder: &card.card_holder,
        };

        crate::tracing::with_metrics("gateway_tokenize_card", move || async move {
            let response = self
                .client
                .post(self.url("/tokens/cards"))
                .bearer_auth(&self.public_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| transport_error(op, e))?;

            if !response.status().is_success() {
                return Err(error_from_response(op, response).await);
            }

            let token: Envelope<TokenData> =
                response.json().await.map_err(|e| decode_error(op, e))?;
            debug!("Card tokenized");
            Ok(token.data.id)
        })
        .await
    }

    #[instrument(skip(self, request), fields(reference = %request.reference, amount_in_cents = request.amount_in_cents))]
    async fn create_transaction(
        &self,
        request: &TransactionRequest,
    ) -> Result<GatewayTransaction, ServiceError> {
        let op = Operation::CreateTransaction;

        crate::tracing::with_metrics("gateway_create_transaction", move || async move {
            let acceptance_token = self.acceptance_token().await?;
            let body = CreateTransactionBody {
                amount_in_cents: request.amount_in_cents,
                currency: &request.currency,
                customer_email: &request.customer_email,
                payment_method: PaymentMethodBody {
                    kind: "CARD",
                    installments: 1,
                    token: &request.payment_token,
                },
                reference: &request.reference,
                acceptance_token: &acceptance_token,
                signature: &request.signature,
            };

            let response = self
                .client
                .post(self.url("/transactions"))
                .bearer_auth(&self.private_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| transport_error(op, e))?;

            Self::read_transaction(op, response).await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<GatewayTransaction, ServiceError> {
        let op = Operation::GetTransaction;

        crate::tracing::with_metrics("gateway_get_transaction", move || async move {
            let response = self
                .client
                .get(self.url(&format!("/transactions/{}", transaction_id)))
                .bearer_auth(&self.public_key)
                .send()
                .await
                .map_err(|e| transport_error(op, e))?;

            Self::read_transaction(op, response).await
        })
        .await
    }
}
