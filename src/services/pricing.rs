use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

/// Fees, tax rate and currency applied to every quote. Amounts are major
/// currency units.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PricingConfig {
    #[serde(default = "default_base_fee")]
    pub base_fee: Decimal,
    #[serde(default = "default_shipping_fee")]
    pub shipping_fee: Decimal,
    /// Fraction, e.g. 0.19 for 19%
    #[serde(default = "default_tax_rate")]
    pub tax_rate: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_base_fee() -> Decimal {
    dec!(3000)
}

fn default_shipping_fee() -> Decimal {
    dec!(7000)
}

fn default_tax_rate() -> Decimal {
    dec!(0.19)
}

fn default_currency() -> String {
    "COP".to_string()
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            base_fee: default_base_fee(),
            shipping_fee: default_shipping_fee(),
            tax_rate: default_tax_rate(),
            currency: default_currency(),
        }
    }
}

/// Server-side price breakdown for one checkout line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    pub unit_price: Decimal,
    pub quantity: i32,
    pub subtotal: Decimal,
    pub base_fee: Decimal,
    pub shipping_fee: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub currency: String,
}

impl PriceQuote {
    /// Total in minor units, the amount the gateway is asked to charge
    pub fn amount_in_cents(&self) -> Result<i64, ServiceError> {
        to_minor_units(self.total)
    }

    pub fn tax_in_cents(&self) -> Result<i64, ServiceError> {
        to_minor_units(self.tax)
    }
}

/// Converts a major-unit amount to integer minor units (×100).
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    (amount * dec!(100))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| {
            ServiceError::ValidationError(format!("Amount {} is out of range", amount))
        })
}

/// Money calculator. The only place totals are computed; client-supplied
/// totals never reach it.
#[derive(Debug, Clone, Default)]
pub struct PriceCalculator {
    config: PricingConfig,
}

impl PriceCalculator {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    /// subtotal = price × quantity, tax = subtotal × rate rounded half-up to
    /// the minor unit, total = subtotal + fees + tax. Fees are not taxed.
    pub fn quote(&self, unit_price: Decimal, quantity: i32) -> Result<PriceQuote, ServiceError> {
        if unit_price.is_sign_negative() && !unit_price.is_zero() {
            return Err(ServiceError::ValidationError(
                "Unit price cannot be negative".to_string(),
            ));
        }
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let subtotal = unit_price
            .checked_mul(Decimal::from(quantity))
            .ok_or_else(|| ServiceError::ValidationError("Subtotal overflow".to_string()))?;
        let tax = (subtotal * self.config.tax_rate)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        let total = subtotal + self.config.base_fee + self.config.shipping_fee + tax;

        Ok(PriceQuote {
            unit_price,
            quantity,
            subtotal,
            base_fee: self.config.base_fee,
            shipping_fee: self.config.shipping_fee,
            tax,
            total,
            currency: self.config.currency.clone(),
        })
    }
}
