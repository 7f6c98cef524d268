//! Represents a product line inside an order.
//!
//! `value` is stored in minor currency units (cents) so that sums never suffer from
//! floating-point rounding.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Type-safe identifier for Products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub u64);

impl From<u64> for ProductId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub value: i64,
}

impl Product {
    pub fn new(id: impl Into<ProductId>, name: impl Into<String>, value: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            value,
        }
    }
}
