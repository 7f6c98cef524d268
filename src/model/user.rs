use crate::model::Order;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Natural key of a user, as found in the legacy extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A customer together with all of their orders. This is the aggregate root and the
/// unit carried by one queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub orders: Vec<Order>,
}

impl User {
    /// Creates a user with no orders yet.
    pub fn new(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            orders: Vec::new(),
        }
    }

    /// Builder-style helper used mostly by tests.
    pub fn with_order(mut self, order: Order) -> Self {
        self.orders.push(order);
        self
    }

    pub fn product_count(&self) -> usize {
        self.orders.iter().map(|o| o.products.len()).sum()
    }
}
