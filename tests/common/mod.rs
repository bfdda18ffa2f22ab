use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tower::ServiceExt;
use uuid::Uuid;

use checkout_api::{
    config::AppConfig,
    db,
    entities::product,
    errors::ServiceError,
    events::{self, EventSender},
    repositories::NewProduct,
    services::gateway::{
        CardDetails, GatewayStatus, GatewayTransaction, PaymentGateway, TransactionRequest,
    },
    AppState,
};

pub const INTEGRITY_SECRET: &str = "test_integrity_secret";
pub const PUBLIC_KEY: &str = "pub_test_key";

pub fn transaction(id: &str, status: &str) -> GatewayTransaction {
    GatewayTransaction {
        id: id.to_string(),
        status: GatewayStatus::parse(status),
        reference: None,
        status_message: None,
    }
}

/// Payment gateway double replaying scripted responses in order.
#[derive(Default)]
pub struct ScriptedGateway {
    tokenize: Mutex<VecDeque<Result<String, ServiceError>>>,
    create: Mutex<VecDeque<Result<GatewayTransaction, ServiceError>>>,
    poll: Mutex<VecDeque<Result<GatewayTransaction, ServiceError>>>,
    poll_gate: Mutex<Option<Arc<Notify>>>,
    pub cards: Mutex<Vec<CardDetails>>,
    pub requests: Mutex<Vec<TransactionRequest>>,
    pub poll_calls: AtomicUsize,
    /// Signalled once a transaction has been created
    pub created: Notify,
}

#[allow(dead_code)]
impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_tokenize(&self, result: Result<String, ServiceError>) -> &Self {
        self.tokenize.lock().unwrap().push_back(result);
        self
    }

    pub fn on_create(&self, result: Result<GatewayTransaction, ServiceError>) -> &Self {
        self.create.lock().unwrap().push_back(result);
        self
    }

    pub fn on_poll(&self, result: Result<GatewayTransaction, ServiceError>) -> &Self {
        self.poll.lock().unwrap().push_back(result);
        self
    }

    /// Holds every poll until the returned handle is notified.
    pub fn gate_polls(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.poll_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn poll_count(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<TransactionRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn tokenize_card(&self, card: &CardDetails) -> Result<String, ServiceError> {
        self.cards.lock().unwrap().push(card.clone());
        self.tokenize
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("tok_test_4242".to_string()))
    }

    async fn create_transaction(
        &self,
        request: &TransactionRequest,
    ) -> Result<GatewayTransaction, ServiceError> {
        self.requests.lock().unwrap().push(request.clone());
        let result = self.create.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(ServiceError::InternalError(
                "no scripted transaction".to_string(),
            ))
        });
        self.created.notify_one();
        result
    }

    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<GatewayTransaction, ServiceError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.poll_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.poll.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(ServiceError::GatewayUnavailable(format!(
                "no scripted poll for {}",
                transaction_id
            )))
        })
    }
}

/// Application wired to a throwaway SQLite database and a scripted gateway.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<ScriptedGateway>,
    _db_dir: tempfile::TempDir,
    _event_task: tokio::task::JoinHandle<()>,
}

#[allow(dead_code)]
impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Construct a test application, letting the caller adjust configuration.
    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let db_dir = tempfile::tempdir().expect("temp dir for test database");
        let db_path = db_dir.path().join("checkout_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 4;
        cfg.db_min_connections = 1;
        cfg.gateway.public_key = PUBLIC_KEY.to_string();
        cfg.gateway.private_key = "prv_test_key".to_string();
        cfg.gateway.integrity_secret = INTEGRITY_SECRET.to_string();
        cfg.gateway.poll_delay_ms = 0;
        adjust(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = ScriptedGateway::new();
        let state = AppState::new(
            Arc::new(pool),
            cfg,
            gateway.clone(),
            EventSender::new(event_tx),
        );
        let router = checkout_api::app_router(state.clone());

        Self {
            router,
            state,
            gateway,
            _db_dir: db_dir,
            _event_task: event_task,
        }
    }

    pub async fn seed_product(&self, price: Decimal, stock: i32) -> product::Model {
        self.seed_product_with(price, stock, true).await
    }

    pub async fn seed_product_with(
        &self,
        price: Decimal,
        stock: i32,
        is_active: bool,
    ) -> product::Model {
        let sku = format!("SKU-{}", &Uuid::new_v4().simple().to_string()[..8]);
        self.state
            .products
            .create(NewProduct {
                name: "Camiseta Básica".to_string(),
                description: Some("Camiseta de algodón".to_string()),
                sku,
                price,
                stock,
                is_active,
                image_url: None,
            })
            .await
            .expect("seed product")
    }

    pub async fn stock_of(&self, id: Uuid) -> i32 {
        self.state
            .products
            .find_by_id(id)
            .await
            .expect("product lookup")
            .expect("product exists")
            .stock
    }

    pub async fn order_count(&self) -> u64 {
        use sea_orm::{EntityTrait, PaginatorTrait};
        checkout_api::entities::order::Entity::find()
            .count(&*self.state.db)
            .await
            .expect("count orders")
    }

    /// Send a JSON request against the router
    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };
        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&bytes).expect("response body is JSON")
}

#[allow(dead_code)]
pub fn checkout_body(product_id: Uuid, quantity: i32) -> Value {
    json!({
        "productId": product_id.to_string(),
        "quantity": quantity,
        "customer": {
            "fullName": "Ana Pérez",
            "email": "ana@example.com",
            "phone": "3001234567"
        },
        "delivery": {
            "address": "Calle 1 # 2-3",
            "city": "Bogotá",
            "country": "CO",
            "postalCode": "110111",
            "region": "Cundinamarca"
        },
        "card": {
            "number": "4242 4242 4242 4242",
            "expMonth": "08",
            "expYear": "28",
            "cvc": "123"
        }
    })
}

#[allow(dead_code)]
pub fn transaction_event(id: &str, status: &str, reference: Option<&str>) -> Value {
    json!({
        "event": "transaction.updated",
        "data": {
            "transaction": {
                "id": id,
                "status": status,
                "reference": reference,
                "currency": "COP",
                "payment_method_type": "CARD"
            }
        },
        "timestamp": 1_700_000_000i64,
        "sent_at": "2023-11-14T22:13:20.000Z"
    })
}
