//! Seed data script - populates the catalog with demo products
//!
//! Run with: cargo run --bin seed-data
//!
//! Uses the regular configuration (APP__DATABASE_URL etc.), applies pending
//! migrations and inserts every product whose SKU is not present yet, so it
//! is safe to run repeatedly.

use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::info;

use checkout_api::repositories::{NewProduct, ProductRepository};

fn demo_products() -> Vec<NewProduct> {
    let product = |name: &str, description: &str, sku: &str, price, stock, image: &str| NewProduct {
        name: name.to_string(),
        description: Some(description.to_string()),
        sku: sku.to_string(),
        price,
        stock,
        is_active: true,
        image_url: Some(format!("https://images.unsplash.com/{}?w=500", image)),
    };

    vec![
        product(
            "iPhone 15 Pro",
            "El smartphone más avanzado de Apple con chip A17 Pro",
            "IPH15PRO-128",
            dec!(3999000),
            15,
            "photo-1592750475338-74b7b21085ab",
        ),
        product(
            "Samsung Galaxy S24",
            "Smartphone Android de última generación",
            "SGS24-256",
            dec!(3299000),
            20,
            "photo-1511707171634-5f897ff02aa9",
        ),
        product(
            "AirPods Pro",
            "Auriculares inalámbricos con cancelación de ruido activa",
            "APPRO-2GEN",
            dec!(899000),
            30,
            "photo-1606220945770-b5b6c2c55bf1",
        ),
        product(
            "Camiseta Básica",
            "Camiseta de algodón 100% en varios colores",
            "CAM-BAS-001",
            dec!(45000),
            100,
            "photo-1521572163474-6864f9cf17ab",
        ),
        product(
            "Jeans Clásicos",
            "Pantalón jeans de corte clásico, cómodo y duradero",
            "JEAN-CLS-001",
            dec!(129000),
            50,
            "photo-1542272604-787c3835535d",
        ),
        product(
            "Zapatillas Deportivas",
            "Zapatillas cómodas para uso diario y deporte",
            "ZAP-DEP-001",
            dec!(199000),
            40,
            "photo-1542291026-7eec264c27ff",
        ),
        product(
            "Lámpara de Escritorio LED",
            "Lámpara LED ajustable para escritorio, luz cálida y fría",
            "LAMP-LED-001",
            dec!(89000),
            25,
            "photo-1507473885765-e6ed057f782c",
        ),
        product(
            "Set de Sábanas Algodón",
            "Juego de sábanas de algodón egipcio, incluye funda y fundas de almohada",
            "SAB-ALG-001",
            dec!(149000),
            35,
            "photo-1586105251261-72a756497a11",
        ),
        product(
            "MacBook Pro 14\"",
            "Laptop profesional con chip M3 Pro, 16GB RAM, 512GB SSD",
            "MBP14-M3-512",
            dec!(8999000),
            10,
            "photo-1517336714731-489689fd1ca8",
        ),
        product(
            "Reloj Inteligente",
            "Smartwatch con monitor de actividad física y notificaciones",
            "REL-SMT-001",
            dec!(599000),
            20,
            "photo-1523275335684-37898b6baf30",
        ),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("=== Checkout API Seed Data ===");

    let cfg = checkout_api::config::load_config()?;
    let db = checkout_api::db::establish_connection_from_app_config(&cfg).await?;
    checkout_api::db::run_migrations(&db).await?;

    let products = ProductRepository::new(Arc::new(db));
    let mut created = 0;
    let mut skipped = 0;

    for input in demo_products() {
        if products.find_by_sku(&input.sku).await?.is_some() {
            skipped += 1;
            continue;
        }
        let product = products.create(input).await?;
        info!("  {} ({}) -> {}", product.name, product.sku, product.id);
        created += 1;
    }

    info!("Created {} products, {} already present", created, skipped);
    Ok(())
}
