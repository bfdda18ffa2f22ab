use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use std::sync::Arc;
use tracing::{error, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::entities::product::{
    ActiveModel as ProductActiveModel, Column, Entity as Product, Model as ProductModel,
};
use crate::errors::ServiceError;

/// Input for seeding or administratively adding a product
#[derive(Debug, Clone)]
pub struct NewProduct {
    pub name: String,
    pub description: Option<String>,
    pub sku: String,
    pub price: Decimal,
    pub stock: i32,
    pub is_active: bool,
    pub image_url: Option<String>,
}

/// Repository for product reads and the stock guard
#[derive(Debug, Clone)]
pub struct ProductRepository {
    db: Arc<DatabaseConnection>,
}

impl ProductRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<ProductModel>, ServiceError> {
        Ok(Product::find_by_id(id).one(&*self.db).await?)
    }

    pub async fn find_by_sku(&self, sku: &str) -> Result<Option<ProductModel>, ServiceError> {
        Ok(Product::find()
            .filter(Column::Sku.eq(sku))
            .one(&*self.db)
            .await?)
    }

    /// Active products, ordered by name
    pub async fn list_active(&self) -> Result<Vec<ProductModel>, ServiceError> {
        Ok(Product::find()
            .filter(Column::IsActive.eq(true))
            .order_by_asc(Column::Name)
            .all(&*self.db)
            .await?)
    }

    pub async fn create(&self, input: NewProduct) -> Result<ProductModel, ServiceError> {
        let now = Utc::now();
        let model = ProductModel {
            id: Uuid::new_v4(),
            name: input.name,
            description: input.description,
            sku: input.sku,
            price: input.price,
            stock: input.stock,
            is_active: input.is_active,
            image_url: input.image_url,
            created_at: now,
            updated_at: now,
        };
        model.validate()?;
        if model.price.is_sign_negative() && !model.price.is_zero() {
            return Err(ServiceError::ValidationError(
                "Product price cannot be negative".to_string(),
            ));
        }

        let active = ProductActiveModel {
            id: Set(model.id),
            name: Set(model.name),
            description: Set(model.description),
            sku: Set(model.sku),
            price: Set(model.price),
            stock: Set(model.stock),
            is_active: Set(model.is_active),
            image_url: Set(model.image_url),
            created_at: Set(model.created_at),
            updated_at: Set(model.updated_at),
        };

        Ok(active.insert(&*self.db).await?)
    }

    /// Atomically takes `quantity` units out of stock.
    ///
    /// The guard lives in the `UPDATE ... WHERE stock >= quantity` itself, so
    /// a concurrent decrement can never drive stock negative. Zero affected
    /// rows means the stock is no longer there and is reported, never
    /// clamped. Runs on whatever connection or transaction it is given.
    #[instrument(skip(conn))]
    pub async fn decrement_stock<C>(
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError>
    where
        C: ConnectionTrait,
    {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Quantity to decrement must be positive".to_string(),
            ));
        }

        let result = Product::update_many()
            .col_expr(Column::Stock, Expr::col(Column::Stock).sub(quantity))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::Id.eq(product_id))
            .filter(Column::Stock.gte(quantity))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            error!(%product_id, quantity, "Stock decrement refused");
            return Err(ServiceError::StoreConsistencyError(format!(
                "cannot take {} unit(s) of product {} out of stock",
                quantity, product_id
            )));
        }

        Ok(())
    }
}
