use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, ModelTrait,
    QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::order::{
    ActiveModel as OrderActiveModel, Column, Entity as Order, Model as OrderModel,
};
use crate::entities::order_item::{
    ActiveModel as OrderItemActiveModel, Entity as OrderItem, Model as OrderItemModel,
};
use crate::entities::{OrderStatus, PaymentStatus};
use crate::errors::ServiceError;
use crate::middleware_helpers::retry::{with_retry, RetryConfig, StoreContentionPolicy};
use crate::services::pricing::PriceQuote;

use super::product_repository::ProductRepository;

/// Delivery fields copied into the order at creation time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressSnapshot {
    pub street: String,
    pub city: String,
    pub region: Option<String>,
    pub postal_code: String,
    pub country: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerSnapshot {
    pub full_name: String,
    pub email: String,
    pub phone: String,
}

/// Everything needed to persist a fresh PENDING order with a single line
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_number: String,
    pub product_id: Uuid,
    pub product_name: String,
    pub quote: PriceQuote,
    pub customer: CustomerSnapshot,
    pub address: AddressSnapshot,
}

/// Order row together with its lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderWithItems {
    #[serde(flatten)]
    pub order: OrderModel,
    pub shipping_address: AddressSnapshot,
    pub items: Vec<OrderItemModel>,
}

impl OrderWithItems {
    fn new(order: OrderModel, items: Vec<OrderItemModel>) -> Self {
        let shipping_address = AddressSnapshot {
            street: order.shipping_street.clone(),
            city: order.shipping_city.clone(),
            region: order.shipping_region.clone(),
            postal_code: order.shipping_postal_code.clone(),
            country: order.shipping_country.clone(),
            phone: order.shipping_phone.clone(),
        };
        Self {
            order,
            shipping_address,
            items,
        }
    }
}

/// Target state for a status update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTransition {
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub external_payment_id: Option<String>,
}

impl OrderTransition {
    pub fn new(
        (status, payment_status): (OrderStatus, PaymentStatus),
        external_payment_id: Option<String>,
    ) -> Self {
        Self {
            status,
            payment_status,
            external_payment_id,
        }
    }
}

/// Result of `update_status`
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub order: OrderWithItems,
    /// False when the update was a no-op or was ignored as a backward move
    pub changed: bool,
    /// True when this call took the order's items out of stock
    pub stock_decremented: bool,
}

/// Repository for orders and their status transitions
#[derive(Debug, Clone)]
pub struct OrderRepository {
    db: Arc<DatabaseConnection>,
}

impl OrderRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn load_items<C: ConnectionTrait>(
        conn: &C,
        order: &OrderModel,
    ) -> Result<Vec<OrderItemModel>, ServiceError> {
        Ok(order.find_related(OrderItem).all(conn).await?)
    }

    async fn with_items(
        &self,
        order: Option<OrderModel>,
    ) -> Result<Option<OrderWithItems>, ServiceError> {
        match order {
            Some(order) => {
                let items = Self::load_items(&*self.db, &order).await?;
                Ok(Some(OrderWithItems::new(order, items)))
            }
            None => Ok(None),
        }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<OrderWithItems>, ServiceError> {
        let order = Order::find_by_id(id).one(&*self.db).await?;
        self.with_items(order).await
    }

    pub async fn find_by_external_payment_id(
        &self,
        external_payment_id: &str,
    ) -> Result<Option<OrderWithItems>, ServiceError> {
        let order = Order::find()
            .filter(Column::ExternalPaymentId.eq(external_payment_id))
            .one(&*self.db)
            .await?;
        self.with_items(order).await
    }

    pub async fn find_by_order_number(
        &self,
        order_number: &str,
    ) -> Result<Option<OrderWithItems>, ServiceError> {
        let order = Order::find()
            .filter(Column::OrderNumber.eq(order_number))
            .one(&*self.db)
            .await?;
        self.with_items(order).await
    }

    /// Persists a PENDING/PENDING order and its line in one transaction.
    #[instrument(skip(self, input), fields(order_number = %input.order_number))]
    pub async fn create(&self, input: NewOrder) -> Result<OrderWithItems, ServiceError> {
        let quote = input.quote;
        let order_id = Uuid::new_v4();

        let txn = self.db.begin().await?;

        let order = OrderActiveModel {
            id: Set(order_id),
            order_number: Set(input.order_number),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            external_payment_id: Set(None),
            subtotal: Set(quote.subtotal),
            base_fee: Set(quote.base_fee),
            shipping_fee: Set(quote.shipping_fee),
            tax: Set(quote.tax),
            total: Set(quote.total),
            currency: Set(quote.currency),
            customer_name: Set(input.customer.full_name),
            customer_email: Set(input.customer.email),
            customer_phone: Set(input.customer.phone),
            shipping_street: Set(input.address.street),
            shipping_city: Set(input.address.city),
            shipping_region: Set(input.address.region),
            shipping_postal_code: Set(input.address.postal_code),
            shipping_country: Set(input.address.country),
            shipping_phone: Set(input.address.phone),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        let item = OrderItemActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            product_id: Set(input.product_id),
            product_name: Set(input.product_name),
            quantity: Set(quote.quantity),
            unit_price: Set(quote.unit_price),
            subtotal: Set(quote.subtotal),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;

        info!(%order_id, "Order created in PENDING state");
        Ok(OrderWithItems::new(order, vec![item]))
    }

    /// Moves an order to `transition`, idempotently.
    ///
    /// The row is re-read under a write lock, so concurrent callers (the
    /// synchronous poll and the webhook) serialize here. Re-applying the
    /// current state is a no-op, backward moves are ignored, and the first
    /// move of the payment to APPROVED takes every line out of stock inside
    /// the same transaction. A failed decrement rolls the whole update back.
    /// Attempts that lose a lock race to another writer are retried.
    #[instrument(skip(self), fields(order_id = %id))]
    pub async fn update_status(
        &self,
        id: Uuid,
        transition: OrderTransition,
    ) -> Result<StatusUpdate, ServiceError> {
        with_retry(
            &RetryConfig::store_contention(),
            StoreContentionPolicy,
            || self.apply_transition(id, transition.clone()),
        )
        .await
    }

    async fn apply_transition(
        &self,
        id: Uuid,
        transition: OrderTransition,
    ) -> Result<StatusUpdate, ServiceError> {
        let txn = self.db.begin().await?;

        // Writing before reading takes the row's write lock up front on every
        // backend; SQLite has no SELECT ... FOR UPDATE.
        let claimed = Order::update_many()
            .col_expr(Column::Status, Expr::col(Column::Status).into())
            .filter(Column::Id.eq(id))
            .exec(&txn)
            .await?;
        if claimed.rows_affected == 0 {
            txn.rollback().await?;
            return Err(ServiceError::NotFound(format!("Order {} not found", id)));
        }

        let current = Order::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))?;
        let items = Self::load_items(&txn, &current).await?;

        let forward = current.status.can_transition_to(transition.status)
            && current
                .payment_status
                .can_transition_to(transition.payment_status);
        if !forward {
            warn!(
                from_status = %current.status,
                from_payment_status = %current.payment_status,
                to_status = %transition.status,
                to_payment_status = %transition.payment_status,
                "Ignoring backward status transition"
            );
            txn.rollback().await?;
            return Ok(StatusUpdate {
                order: OrderWithItems::new(current, items),
                changed: false,
                stock_decremented: false,
            });
        }

        let attach_external_id = match (
            &current.external_payment_id,
            &transition.external_payment_id,
        ) {
            (None, Some(_)) => true,
            (Some(existing), Some(incoming)) if existing != incoming => {
                warn!(
                    existing = %existing,
                    incoming = %incoming,
                    "Order already linked to another gateway transaction; keeping the original"
                );
                false
            }
            _ => false,
        };

        let same_state = current.status == transition.status
            && current.payment_status == transition.payment_status;
        if same_state && !attach_external_id {
            txn.rollback().await?;
            return Ok(StatusUpdate {
                order: OrderWithItems::new(current, items),
                changed: false,
                stock_decremented: false,
            });
        }

        let approving = current.payment_status != PaymentStatus::Approved
            && transition.payment_status == PaymentStatus::Approved;
        if approving {
            for item in &items {
                if let Err(err) =
                    ProductRepository::decrement_stock(&txn, item.product_id, item.quantity).await
                {
                    txn.rollback().await?;
                    return Err(err);
                }
            }
        }

        let mut active: OrderActiveModel = current.into();
        active.status = Set(transition.status);
        active.payment_status = Set(transition.payment_status);
        if attach_external_id {
            active.external_payment_id = Set(transition.external_payment_id);
        }
        let updated = active.update(&txn).await?;

        txn.commit().await?;

        info!(
            status = %updated.status,
            payment_status = %updated.payment_status,
            stock_decremented = approving,
            "Order status updated"
        );

        Ok(StatusUpdate {
            order: OrderWithItems::new(updated, items),
            changed: true,
            stock_decremented: approving,
        })
    }
}
