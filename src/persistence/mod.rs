//! # Persistence
//!
//! The gateway the worker writes through, plus an in-memory implementation.
//!
//! [`PersistenceGateway::save_all`] persists whole aggregates (user, orders, products) as
//! one atomic unit, upserting by natural key. Saving the same aggregate twice converges
//! to the same stored state, which is what makes at-least-once delivery safe.

pub mod error;
pub mod store;

pub use error::*;
pub use store::*;

use crate::model::{OrderId, User};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::time::Duration;

/// Query filters for [`PersistenceGateway::find`]. Date bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindFilters {
    pub order_id: Option<OrderId>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl FindFilters {
    pub fn order_id(mut self, id: impl Into<OrderId>) -> Self {
        self.order_id = Some(id.into());
        self
    }

    pub fn start_date(mut self, date: NaiveDate) -> Self {
        self.start_date = Some(date);
        self
    }

    pub fn end_date(mut self, date: NaiveDate) -> Self {
        self.end_date = Some(date);
        self
    }

    /// Whether an order with this id and date passes every set filter.
    pub fn matches(&self, id: OrderId, date: NaiveDate) -> bool {
        self.order_id.map_or(true, |wanted| wanted == id)
            && self.start_date.map_or(true, |start| date >= start)
            && self.end_date.map_or(true, |end| date <= end)
    }
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Upserts every aggregate in one transaction: all of them or none.
    async fn save_all(&self, users: &[User]) -> Result<(), PersistenceError>;

    /// Users with at least one matching order, each carrying only its matching orders,
    /// ordered by user id, order date and product id.
    async fn find(&self, filters: &FindFilters) -> Result<Vec<User>, PersistenceError>;
}

/// Runs `save_all` with an upper bound on how long it may take.
pub async fn save_all_within(
    gateway: &dyn PersistenceGateway,
    users: &[User],
    limit: Duration,
) -> Result<(), PersistenceError> {
    match tokio::time::timeout(limit, gateway.save_all(users)).await {
        Ok(result) => result,
        Err(_) => Err(PersistenceError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_filters_are_inclusive() {
        let filters = FindFilters::default()
            .start_date(date("2021-03-01"))
            .end_date(date("2021-03-31"));
        assert!(filters.matches(OrderId(1), date("2021-03-01")));
        assert!(filters.matches(OrderId(1), date("2021-03-31")));
        assert!(!filters.matches(OrderId(1), date("2021-04-01")));
        assert!(FindFilters::default().matches(OrderId(9), date("1999-01-01")));
        assert!(!FindFilters::default()
            .order_id(2u64)
            .matches(OrderId(1), date("2021-03-01")));
    }
}
