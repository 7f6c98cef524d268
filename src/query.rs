//! Order query use case and its response shape.
//!
//! ```json
//! [{"user_id":70,"name":"Palmer Prosacco","orders":[
//!   {"order_id":753,"total":"1836.74","date":"2021-03-08",
//!    "products":[{"product_id":3,"product_value":"1836.74"}]}]}]
//! ```

use crate::model::{format_cents, Order, User};
use crate::persistence::{FindFilters, PersistenceError, PersistenceGateway};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSummary {
    pub user_id: u64,
    pub name: String,
    pub orders: Vec<OrderSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderSummary {
    pub order_id: u64,
    pub total: String,
    pub date: String,
    pub products: Vec<ProductSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductSummary {
    pub product_id: u64,
    pub product_value: String,
}

impl From<&Order> for OrderSummary {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id.0,
            total: format_cents(order.total()),
            date: order.date.format("%Y-%m-%d").to_string(),
            products: order
                .products
                .iter()
                .map(|p| ProductSummary {
                    product_id: p.id.0,
                    product_value: format_cents(p.value),
                })
                .collect(),
        }
    }
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id.0,
            name: user.name.clone(),
            orders: user.orders.iter().map(OrderSummary::from).collect(),
        }
    }
}

#[derive(Clone)]
pub struct QueryOrders {
    gateway: Arc<dyn PersistenceGateway>,
}

impl QueryOrders {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }

    #[instrument(skip(self))]
    pub async fn execute(
        &self,
        filters: &FindFilters,
    ) -> Result<Vec<UserSummary>, PersistenceError> {
        let users = self.gateway.find(filters).await?;
        debug!(found = users.len(), "Orders queried");
        Ok(users.iter().map(UserSummary::from).collect())
    }
}
