use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::config::GatewayConfig;
use crate::entities::{product, OrderStatus, PaymentStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::repositories::{
    AddressSnapshot, CustomerSnapshot, NewOrder, OrderRepository, OrderTransition, OrderWithItems,
    ProductRepository,
};
use crate::services::gateway::{CardDetails, GatewayStatus, PaymentGateway, TransactionRequest};
use crate::services::pricing::{PriceCalculator, PriceQuote};
use crate::services::publish_status_update;
use crate::services::signature::{integrity_signature, SignaturePayload};

static CARD_NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9 ]{12,23}$").unwrap());
static EXP_MONTH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(0?[1-9]|1[0-2])$").unwrap());
static EXP_YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([0-9]{2}|[0-9]{4})$").unwrap());
static CVC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{3,4}$").unwrap());

fn validate_uuid(value: &str) -> Result<(), ValidationError> {
    Uuid::parse_str(value)
        .map(|_| ())
        .map_err(|_| ValidationError::new("uuid"))
}

fn parse_product_id(value: &str) -> Result<Uuid, ServiceError> {
    Uuid::parse_str(value)
        .map_err(|_| ServiceError::ValidationError(format!("productId '{}' is not a UUID", value)))
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInput {
    #[validate(length(min = 1, max = 255))]
    pub full_name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1, max = 40))]
    pub phone: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryInput {
    #[validate(length(min = 1, max = 255))]
    pub address: String,
    #[validate(length(min = 1, max = 120))]
    pub city: String,
    #[validate(length(min = 2, max = 120))]
    pub country: String,
    #[validate(length(min = 1, max = 20))]
    pub postal_code: String,
    #[validate(length(max = 120))]
    pub region: Option<String>,
}

#[derive(Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CardInput {
    #[validate(regex = "CARD_NUMBER_RE")]
    pub number: String,
    #[validate(regex = "EXP_MONTH_RE")]
    pub exp_month: String,
    #[validate(regex = "EXP_YEAR_RE")]
    pub exp_year: String,
    #[validate(regex = "CVC_RE")]
    pub cvc: String,
}

impl fmt::Debug for CardInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardInput").finish_non_exhaustive()
    }
}

/// Direct card checkout. There is deliberately no total field: the server
/// prices every order itself.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    #[validate(custom = "validate_uuid")]
    pub product_id: String,
    #[validate(range(min = 1))]
    pub quantity: Option<i32>,
    #[validate]
    pub customer: CustomerInput,
    #[validate]
    pub delivery: DeliveryInput,
    #[validate]
    pub card: CardInput,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddressInput {
    #[validate(length(min = 1, max = 255))]
    pub street: String,
    #[validate(length(min = 1, max = 120))]
    pub city: String,
    #[validate(length(max = 120))]
    pub state: Option<String>,
    #[validate(length(min = 1, max = 20))]
    pub postal_code: String,
    #[validate(length(min = 2, max = 120))]
    pub country: String,
    #[validate(length(min = 1, max = 40))]
    pub phone: String,
}

/// Checkout for a card the browser already tokenized with the gateway.
/// Card data never reaches this service on this path.
#[derive(Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TokenizedCheckoutRequest {
    #[validate(custom = "validate_uuid")]
    pub product_id: String,
    #[validate(range(min = 1))]
    pub quantity: i32,
    #[validate(email)]
    pub customer_email: String,
    #[validate(length(min = 1, max = 255))]
    pub customer_name: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub payment_token: String,
    #[validate]
    pub shipping_address: ShippingAddressInput,
}

impl fmt::Debug for TokenizedCheckoutRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenizedCheckoutRequest")
            .field("product_id", &self.product_id)
            .field("quantity", &self.quantity)
            .field("customer_email", &self.customer_email)
            .field("shipping_address", &self.shipping_address)
            .finish_non_exhaustive()
    }
}

/// How the payment method reaches the gateway
enum PaymentSource {
    Card(CardDetails),
    Token(String),
}

/// A validated checkout, whichever endpoint it came from
struct CheckoutDraft {
    product_id: Uuid,
    quantity: i32,
    customer: CustomerSnapshot,
    address: AddressSnapshot,
    payment: PaymentSource,
}

/// Result of a checkout attempt once an order exists
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutOutcome {
    pub success: bool,
    /// Gateway status as last observed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_status: Option<OrderStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<PaymentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl CheckoutOutcome {
    fn failed(order: &OrderWithItems, err: &ServiceError) -> Self {
        Self {
            success: false,
            order_status: Some(order.order.status),
            payment_status: Some(order.order.payment_status),
            order_id: Some(order.order.id),
            reference: Some(order.order.order_number.clone()),
            error: Some(err.response_message()),
            error_code: Some(err.code().to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SessionAddressInput {
    #[validate(length(min = 1, max = 255))]
    pub address_line1: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_line2: Option<String>,
    #[validate(length(min = 2, max = 120))]
    pub country: String,
    #[validate(length(min = 1, max = 120))]
    pub city: String,
    #[validate(length(min = 1, max = 40))]
    pub phone_number: String,
    #[validate(length(min = 1, max = 120))]
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SessionCustomerInput {
    #[validate(email)]
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legal_id_type: Option<String>,
}

/// Request for the hosted-widget flow, where the browser talks to the
/// gateway directly and this service only signs the amount.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSessionRequest {
    #[validate(custom = "validate_uuid")]
    pub product_id: String,
    #[validate(range(min = 1))]
    pub quantity: i32,
    #[validate(email)]
    pub customer_email: String,
    #[validate]
    pub shipping_address: SessionAddressInput,
    #[validate]
    pub customer_data: Option<SessionCustomerInput>,
    #[validate(url)]
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxBreakdown {
    pub vat: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSummary {
    pub id: Uuid,
    pub name: String,
    pub price: Decimal,
}

/// Everything the hosted widget needs to start a payment
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub public_key: String,
    pub currency: String,
    pub amount_in_cents: i64,
    pub reference: String,
    pub signature: String,
    pub redirect_url: String,
    pub shipping_address: SessionAddressInput,
    pub customer_data: SessionCustomerInput,
    pub tax_in_cents: TaxBreakdown,
    pub product: ProductSummary,
    pub quantity: i32,
}

/// Gateway settings the orchestrator needs; keys for outbound calls stay in
/// the gateway client.
#[derive(Clone)]
pub struct CheckoutSettings {
    pub public_key: String,
    pub integrity_secret: String,
    pub poll_delay: Duration,
    pub redirect_url: String,
}

impl From<&GatewayConfig> for CheckoutSettings {
    fn from(cfg: &GatewayConfig) -> Self {
        Self {
            public_key: cfg.public_key.clone(),
            integrity_secret: cfg.integrity_secret.clone(),
            poll_delay: cfg.poll_delay(),
            redirect_url: cfg.redirect_url.clone(),
        }
    }
}

/// Drives a checkout from request to reconciled order.
#[derive(Clone)]
pub struct CheckoutService {
    products: ProductRepository,
    orders: OrderRepository,
    gateway: Arc<dyn PaymentGateway>,
    calculator: PriceCalculator,
    settings: CheckoutSettings,
    events: EventSender,
}

impl CheckoutService {
    pub fn new(
        products: ProductRepository,
        orders: OrderRepository,
        gateway: Arc<dyn PaymentGateway>,
        calculator: PriceCalculator,
        settings: CheckoutSettings,
        events: EventSender,
    ) -> Self {
        Self {
            products,
            orders,
            gateway,
            calculator,
            settings,
            events,
        }
    }

    fn new_reference() -> String {
        format!("ORDER_{}", Uuid::new_v4())
    }

    /// Loads the product and checks it can be sold in `quantity`.
    async fn sellable_product(
        &self,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<product::Model, ServiceError> {
        let product = self
            .products
            .find_by_id(product_id)
            .await?
            .ok_or_else(|| ServiceError::ProductNotFound(product_id.to_string()))?;

        if !product.is_active {
            return Err(ServiceError::ProductInactive(product_id.to_string()));
        }
        if product.stock < quantity {
            return Err(ServiceError::InsufficientStock(format!(
                "requested {}, available {}",
                quantity, product.stock
            )));
        }

        Ok(product)
    }

    /// Runs a full card checkout.
    ///
    /// Validation and product preconditions fail with `Err` before anything
    /// is written. Once the PENDING order exists every failure is reported
    /// as an unsuccessful outcome that still carries the order id.
    #[instrument(skip(self, request), fields(product_id = %request.product_id))]
    pub async fn process(&self, request: CheckoutRequest) -> Result<CheckoutOutcome, ServiceError> {
        request.validate()?;
        let product_id = parse_product_id(&request.product_id)?;

        let CheckoutRequest {
            quantity,
            customer,
            delivery,
            card,
            ..
        } = request;

        self.run(CheckoutDraft {
            product_id,
            quantity: quantity.unwrap_or(1),
            address: AddressSnapshot {
                street: delivery.address,
                city: delivery.city,
                region: delivery.region,
                postal_code: delivery.postal_code,
                country: delivery.country,
                phone: Some(customer.phone.clone()),
            },
            payment: PaymentSource::Card(CardDetails {
                number: card.number.replace(' ', ""),
                exp_month: card.exp_month,
                exp_year: card.exp_year,
                cvc: card.cvc,
                card_holder: customer.full_name.clone(),
            }),
            customer: CustomerSnapshot {
                full_name: customer.full_name,
                email: customer.email,
                phone: customer.phone,
            },
        })
        .await
    }

    /// Same pipeline as [`process`](Self::process) for a card token issued
    /// to the browser by the gateway; tokenization is skipped.
    #[instrument(skip(self, request), fields(product_id = %request.product_id))]
    pub async fn process_tokenized(
        &self,
        request: TokenizedCheckoutRequest,
    ) -> Result<CheckoutOutcome, ServiceError> {
        request.validate()?;
        let product_id = parse_product_id(&request.product_id)?;

        let TokenizedCheckoutRequest {
            quantity,
            customer_email,
            customer_name,
            payment_token,
            shipping_address: address,
            ..
        } = request;

        self.run(CheckoutDraft {
            product_id,
            quantity,
            customer: CustomerSnapshot {
                full_name: customer_name.unwrap_or_else(|| customer_email.clone()),
                email: customer_email,
                phone: address.phone.clone(),
            },
            address: AddressSnapshot {
                region: address.state.or_else(|| Some(address.city.clone())),
                street: address.street,
                city: address.city,
                postal_code: address.postal_code,
                country: address.country,
                phone: Some(address.phone),
            },
            payment: PaymentSource::Token(payment_token),
        })
        .await
    }

    async fn run(&self, draft: CheckoutDraft) -> Result<CheckoutOutcome, ServiceError> {
        let CheckoutDraft {
            product_id,
            quantity,
            customer,
            address,
            payment,
        } = draft;

        let product = self.sellable_product(product_id, quantity).await?;
        let quote = self.calculator.quote(product.price, quantity)?;
        let reference = Self::new_reference();
        let customer_email = customer.email.clone();

        let order = self
            .orders
            .create(NewOrder {
                order_number: reference.clone(),
                product_id,
                product_name: product.name,
                quote: quote.clone(),
                customer,
                address,
            })
            .await?;

        self.events
            .send_or_log(Event::OrderCreated {
                order_id: order.order.id,
                order_number: reference,
            })
            .await;

        match self.authorize(&order, &quote, &customer_email, payment).await {
            Ok(outcome) => {
                let result = match (outcome.success, outcome.payment_status) {
                    (true, _) => "approved",
                    (false, Some(PaymentStatus::Pending)) => "pending",
                    _ => "declined",
                };
                counter!("checkout_outcomes_total", 1, "result" => result);
                Ok(outcome)
            }
            Err(err) => {
                warn!(
                    order_id = %order.order.id,
                    error = %err,
                    "Checkout failed after order creation"
                );
                let result = if err.is_gateway_error() {
                    "gateway_error"
                } else {
                    "failed"
                };
                counter!("checkout_outcomes_total", 1, "result" => result);
                self.events
                    .send_or_log(Event::CheckoutFailed {
                        order_id: Some(order.order.id),
                        error_code: err.code().to_string(),
                    })
                    .await;
                Ok(CheckoutOutcome::failed(&order, &err))
            }
        }
    }

    /// Gateway leg: tokenize if needed, authorize, one bounded re-poll,
    /// reconcile.
    async fn authorize(
        &self,
        order: &OrderWithItems,
        quote: &PriceQuote,
        customer_email: &str,
        payment: PaymentSource,
    ) -> Result<CheckoutOutcome, ServiceError> {
        let payment_token = match payment {
            PaymentSource::Card(card) => self.gateway.tokenize_card(&card).await?,
            PaymentSource::Token(token) => token,
        };

        let reference = order.order.order_number.as_str();
        let amount_in_cents = quote.amount_in_cents()?;
        let signature = integrity_signature(
            &SignaturePayload::new(reference, amount_in_cents, &quote.currency),
            &self.settings.integrity_secret,
        );

        let transaction = self
            .gateway
            .create_transaction(&TransactionRequest {
                amount_in_cents,
                currency: quote.currency.clone(),
                customer_email: customer_email.to_string(),
                payment_token,
                reference: reference.to_string(),
                signature,
            })
            .await?;

        let mut status = transaction.status.clone();
        if status.is_pending() {
            tokio::time::sleep(self.settings.poll_delay).await;
            match self.gateway.get_transaction(&transaction.id).await {
                Ok(polled) => status = polled.status,
                Err(err) => warn!(
                    transaction_id = %transaction.id,
                    error = %err,
                    "Re-poll failed; leaving the order pending for the webhook"
                ),
            }
        }

        let update = self
            .orders
            .update_status(
                order.order.id,
                OrderTransition::new(status.resolve(), Some(transaction.id.clone())),
            )
            .await?;
        publish_status_update(&self.events, &update).await;

        let persisted = &update.order.order;
        let success = persisted.payment_status == PaymentStatus::Approved;
        let message = match persisted.payment_status {
            PaymentStatus::Approved => "Payment successful",
            PaymentStatus::Pending => "Payment pending",
            PaymentStatus::Rejected | PaymentStatus::Cancelled => "Payment declined",
        };

        info!(
            order_id = %persisted.id,
            transaction_id = %transaction.id,
            gateway_status = %status,
            "Checkout reconciled"
        );

        Ok(CheckoutOutcome {
            success,
            status: Some(status.to_string()),
            order_status: Some(persisted.status),
            payment_status: Some(persisted.payment_status),
            transaction_id: Some(transaction.id),
            order_id: Some(persisted.id),
            reference: Some(persisted.order_number.clone()),
            message: Some(message_for(&status, message)),
            ..Default::default()
        })
    }

    /// Prices and signs a payment for the hosted widget. Nothing is
    /// persisted; the order is reconciled later by reference.
    #[instrument(skip(self, request), fields(product_id = %request.product_id))]
    pub async fn create_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ServiceError> {
        request.validate()?;
        let product_id = parse_product_id(&request.product_id)?;
        let product = self.sellable_product(product_id, request.quantity).await?;
        let quote = self.calculator.quote(product.price, request.quantity)?;

        let reference = Self::new_reference();
        let amount_in_cents = quote.amount_in_cents()?;
        let signature = integrity_signature(
            &SignaturePayload::new(&reference, amount_in_cents, &quote.currency),
            &self.settings.integrity_secret,
        );

        let customer_data = request.customer_data.unwrap_or(SessionCustomerInput {
            email: request.customer_email.clone(),
            full_name: None,
            phone_number: None,
            phone_number_prefix: None,
            legal_id: None,
            legal_id_type: None,
        });

        Ok(CheckoutSession {
            public_key: self.settings.public_key.clone(),
            currency: quote.currency.clone(),
            amount_in_cents,
            reference,
            signature,
            redirect_url: request
                .redirect_url
                .unwrap_or_else(|| self.settings.redirect_url.clone()),
            shipping_address: request.shipping_address,
            customer_data,
            tax_in_cents: TaxBreakdown {
                vat: quote.tax_in_cents()?,
            },
            product: ProductSummary {
                id: product.id,
                name: product.name,
                price: product.price,
            },
            quantity: request.quantity,
        })
    }
}

fn message_for(status: &GatewayStatus, default: &str) -> String {
    match status {
        GatewayStatus::Voided => "Payment voided".to_string(),
        GatewayStatus::Other(raw) => format!("Payment pending (gateway reported {})", raw),
        _ => default.to_string(),
    }
}
