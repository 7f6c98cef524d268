//! Represents all purchases a user made on one calendar day.
//!
//! At most one `Order` exists per (user, date); same-day lines in the legacy extract are
//! merged into it by appending products.

use crate::model::Product;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Type-safe identifier for Orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub u64);

impl From<u64> for OrderId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub id: OrderId,
    pub date: NaiveDate,
    pub products: Vec<Product>,
}

impl Order {
    /// Creates a new Order instance.
    ///
    /// # Arguments
    /// * `id` - Order id taken from the first line seen for this date
    /// * `date` - Calendar date (no time of day)
    /// * `products` - Initial products, usually a single one
    pub fn new(id: impl Into<OrderId>, date: NaiveDate, products: Vec<Product>) -> Self {
        Self {
            id: id.into(),
            date,
            products,
        }
    }

    /// Sum of product values in cents.
    pub fn total(&self) -> i64 {
        self.products.iter().map(|p| p.value).sum()
    }
}
