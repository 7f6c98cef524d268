//! In-memory [`PersistenceGateway`] backed by an actor.
//!
//! The [`OrderStoreActor`] owns three tables keyed the way a relational schema would key
//! them: users by user id, orders by order id, order lines by (order id, product id).
//! Requests are processed one at a time, so every `save_all` is applied as a whole before
//! the next request is looked at.

use super::{FindFilters, PersistenceError, PersistenceGateway};
use crate::model::{Order, OrderId, Product, ProductId, User, UserId};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

type Response<T> = oneshot::Sender<Result<T, PersistenceError>>;

#[derive(Debug)]
enum StoreRequest {
    SaveAll {
        users: Vec<User>,
        respond_to: Response<()>,
    },
    Find {
        filters: FindFilters,
        respond_to: Response<Vec<User>>,
    },
    FailNextSaves {
        count: usize,
        reason: String,
    },
    Counts {
        respond_to: oneshot::Sender<StoreCounts>,
    },
}

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub users: usize,
    pub orders: usize,
    pub order_lines: usize,
}

#[derive(Debug, Clone)]
struct OrderRow {
    user_id: UserId,
    date: NaiveDate,
}

#[derive(Debug, Clone)]
struct LineRow {
    name: String,
    value: i64,
}

pub struct OrderStoreActor {
    receiver: mpsc::Receiver<StoreRequest>,
    users: BTreeMap<UserId, String>,
    orders: BTreeMap<OrderId, OrderRow>,
    lines: BTreeMap<(OrderId, ProductId), LineRow>,
    failures: Option<(usize, String)>,
}

impl OrderStoreActor {
    pub async fn run(mut self) {
        info!("Order store started");
        while let Some(request) = self.receiver.recv().await {
            match request {
                StoreRequest::SaveAll { users, respond_to } => {
                    let result = self.save_all(&users);
                    let _ = respond_to.send(result);
                }
                StoreRequest::Find {
                    filters,
                    respond_to,
                } => {
                    let users = self.find(&filters);
                    debug!(?filters, found = users.len(), "Find");
                    let _ = respond_to.send(Ok(users));
                }
                StoreRequest::FailNextSaves { count, reason } => {
                    self.failures = (count > 0).then_some((count, reason));
                }
                StoreRequest::Counts { respond_to } => {
                    let _ = respond_to.send(self.counts());
                }
            }
        }
        info!(users = self.users.len(), orders = self.orders.len(), "Order store shutdown");
    }

    fn save_all(&mut self, users: &[User]) -> Result<(), PersistenceError> {
        if let Some((remaining, reason)) = self.failures.take() {
            if remaining > 1 {
                self.failures = Some((remaining - 1, reason.clone()));
            }
            warn!(users = users.len(), %reason, "Transaction rejected");
            return Err(PersistenceError::Rejected(reason));
        }

        for user in users {
            self.users.insert(user.id, user.name.clone());
            for order in &user.orders {
                self.orders.insert(
                    order.id,
                    OrderRow {
                        user_id: user.id,
                        date: order.date,
                    },
                );
                for product in &order.products {
                    self.lines.insert(
                        (order.id, product.id),
                        LineRow {
                            name: product.name.clone(),
                            value: product.value,
                        },
                    );
                }
            }
        }
        info!(users = users.len(), total_users = self.users.len(), "Transaction committed");
        Ok(())
    }

    fn find(&self, filters: &FindFilters) -> Vec<User> {
        let mut by_user: BTreeMap<UserId, Vec<Order>> = BTreeMap::new();
        for (&order_id, row) in &self.orders {
            if !filters.matches(order_id, row.date) {
                continue;
            }
            let products = self
                .lines
                .range((order_id, ProductId(0))..=(order_id, ProductId(u64::MAX)))
                .map(|(&(_, product_id), line)| {
                    Product::new(product_id, line.name.clone(), line.value)
                })
                .collect();
            by_user
                .entry(row.user_id)
                .or_default()
                .push(Order::new(order_id, row.date, products));
        }

        by_user
            .into_iter()
            .map(|(user_id, mut orders)| {
                orders.sort_by_key(|o| (o.date, o.id));
                let name = self.users.get(&user_id).cloned().unwrap_or_default();
                User {
                    id: user_id,
                    name,
                    orders,
                }
            })
            .collect()
    }

    fn counts(&self) -> StoreCounts {
        StoreCounts {
            users: self.users.len(),
            orders: self.orders.len(),
            order_lines: self.lines.len(),
        }
    }
}

/// Cloneable handle to the [`OrderStoreActor`].
#[derive(Clone)]
pub struct OrderStore {
    sender: mpsc::Sender<StoreRequest>,
}

impl OrderStore {
    pub fn new(buffer_size: usize) -> (OrderStoreActor, OrderStore) {
        let (sender, receiver) = mpsc::channel(buffer_size);
        let actor = OrderStoreActor {
            receiver,
            users: BTreeMap::new(),
            orders: BTreeMap::new(),
            lines: BTreeMap::new(),
            failures: None,
        };
        (actor, OrderStore { sender })
    }

    /// Creates the store and runs its actor on the current runtime.
    pub fn spawn() -> OrderStore {
        let (actor, store) = Self::new(32);
        tokio::spawn(actor.run());
        store
    }

    /// Makes the next `count` transactions fail with `reason` without writing anything.
    pub async fn fail_next_saves(&self, count: usize, reason: impl Into<String>) {
        let _ = self
            .sender
            .send(StoreRequest::FailNextSaves {
                count,
                reason: reason.into(),
            })
            .await;
    }

    pub async fn counts(&self) -> StoreCounts {
        let (respond_to, response) = oneshot::channel();
        if self
            .sender
            .send(StoreRequest::Counts { respond_to })
            .await
            .is_err()
        {
            return StoreCounts::default();
        }
        response.await.unwrap_or_default()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Response<T>) -> StoreRequest,
    ) -> Result<T, PersistenceError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(build(respond_to))
            .await
            .map_err(|_| PersistenceError::StoreClosed)?;
        response.await.map_err(|_| PersistenceError::StoreDropped)?
    }
}

#[async_trait]
impl PersistenceGateway for OrderStore {
    async fn save_all(&self, users: &[User]) -> Result<(), PersistenceError> {
        let users = users.to_vec();
        self.request(|respond_to| StoreRequest::SaveAll { users, respond_to })
            .await
    }

    async fn find(&self, filters: &FindFilters) -> Result<Vec<User>, PersistenceError> {
        let filters = filters.clone();
        self.request(|respond_to| StoreRequest::Find {
            filters,
            respond_to,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn palmer() -> User {
        User::new(70, "Palmer Prosacco")
            .with_order(Order::new(
                753,
                date("2021-03-08"),
                vec![Product::new(3, "Product 3", 183674)],
            ))
            .with_order(Order::new(
                12,
                date("2021-01-02"),
                vec![
                    Product::new(9, "Product 9", 100),
                    Product::new(1, "Product 1", 250),
                ],
            ))
    }

    #[tokio::test]
    async fn test_saving_twice_converges() {
        let store = OrderStore::spawn();
        store.save_all(&[palmer()]).await.unwrap();
        store.save_all(&[palmer()]).await.unwrap();

        assert_eq!(
            store.counts().await,
            StoreCounts {
                users: 1,
                orders: 2,
                order_lines: 3
            }
        );
    }

    #[tokio::test]
    async fn test_second_product_occurrence_overwrites() {
        let store = OrderStore::spawn();
        let user = User::new(1, "Ann").with_order(Order::new(
            5,
            date("2021-01-01"),
            vec![Product::new(7, "first", 10), Product::new(7, "second", 20)],
        ));
        store.save_all(&[user]).await.unwrap();

        let found = store.find(&FindFilters::default()).await.unwrap();
        assert_eq!(found[0].orders[0].products, vec![Product::new(7, "second", 20)]);
    }

    #[tokio::test]
    async fn test_find_orders_by_user_date_and_product() {
        let store = OrderStore::spawn();
        store
            .save_all(&[palmer(), User::new(2, "Bea").with_order(Order::new(
                40,
                date("2021-02-01"),
                vec![Product::new(1, "Product 1", 5)],
            ))])
            .await
            .unwrap();

        let found = store.find(&FindFilters::default()).await.unwrap();
        let ids: Vec<u64> = found.iter().map(|u| u.id.0).collect();
        assert_eq!(ids, vec![2, 70]);

        let palmer = &found[1];
        let dates: Vec<_> = palmer.orders.iter().map(|o| o.date).collect();
        assert_eq!(dates, vec![date("2021-01-02"), date("2021-03-08")]);
        let products: Vec<u64> = palmer.orders[0].products.iter().map(|p| p.id.0).collect();
        assert_eq!(products, vec![1, 9]);
    }

    #[tokio::test]
    async fn test_find_skips_users_without_matching_orders() {
        let store = OrderStore::spawn();
        store
            .save_all(&[palmer(), User::new(2, "Bea").with_order(Order::new(
                40,
                date("2021-02-01"),
                vec![Product::new(1, "Product 1", 5)],
            ))])
            .await
            .unwrap();

        let found = store
            .find(&FindFilters::default().start_date(date("2021-03-01")))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, UserId(70));
        assert_eq!(found[0].orders.len(), 1);
        assert_eq!(found[0].orders[0].id, OrderId(753));

        let by_id = store
            .find(&FindFilters::default().order_id(40u64))
            .await
            .unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].name, "Bea");
    }

    #[tokio::test]
    async fn test_rejected_transaction_writes_nothing() {
        let store = OrderStore::spawn();
        store.fail_next_saves(1, "deadlock detected").await;

        let result = store.save_all(&[palmer()]).await;
        assert_eq!(
            result,
            Err(PersistenceError::Rejected("deadlock detected".into()))
        );
        assert_eq!(store.counts().await, StoreCounts::default());

        store.save_all(&[palmer()]).await.unwrap();
        assert_eq!(store.counts().await.users, 1);
    }
}
