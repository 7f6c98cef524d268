//! Wire shape of one aggregate on the queue.
//!
//! ```json
//! {"id":70,"name":"Palmer Prosacco","orders":[
//!   {"id":753,"date":"2021-03-08","products":[{"id":3,"name":"Product 3","value":183674}]}]}
//! ```

use crate::model::{Order, Product, User};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// A queue payload that cannot be turned back into an aggregate.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MessageFormatError {
    #[error("Malformed payload: {0}")]
    Json(String),

    #[error("Invalid order date {raw:?} in order {order_id}")]
    Date { order_id: u64, raw: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserOrderMessage {
    pub id: u64,
    pub name: String,
    pub orders: Vec<OrderMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderMessage {
    pub id: u64,
    pub date: String,
    pub products: Vec<ProductMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductMessage {
    pub id: u64,
    pub name: String,
    pub value: i64,
}

impl From<&User> for UserOrderMessage {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.0,
            name: user.name.clone(),
            orders: user
                .orders
                .iter()
                .map(|order| OrderMessage {
                    id: order.id.0,
                    date: order.date.format(DATE_FORMAT).to_string(),
                    products: order
                        .products
                        .iter()
                        .map(|p| ProductMessage {
                            id: p.id.0,
                            name: p.name.clone(),
                            value: p.value,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

impl TryFrom<UserOrderMessage> for User {
    type Error = MessageFormatError;

    fn try_from(message: UserOrderMessage) -> Result<Self, Self::Error> {
        let orders = message
            .orders
            .into_iter()
            .map(|order| {
                let date = NaiveDate::parse_from_str(&order.date, DATE_FORMAT).map_err(|_| {
                    MessageFormatError::Date {
                        order_id: order.id,
                        raw: order.date.clone(),
                    }
                })?;
                let products = order
                    .products
                    .into_iter()
                    .map(|p| Product::new(p.id, p.name, p.value))
                    .collect();
                Ok(Order::new(order.id, date, products))
            })
            .collect::<Result<Vec<_>, MessageFormatError>>()?;

        Ok(User {
            id: message.id.into(),
            name: message.name,
            orders,
        })
    }
}

impl UserOrderMessage {
    pub fn encode(&self) -> Result<Vec<u8>, MessageFormatError> {
        serde_json::to_vec(self).map_err(|e| MessageFormatError::Json(e.to_string()))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, MessageFormatError> {
        serde_json::from_slice(payload).map_err(|e| MessageFormatError::Json(e.to_string()))
    }
}

/// Rehydrates the aggregate carried by a queue payload.
pub fn decode_user(payload: &[u8]) -> Result<User, MessageFormatError> {
    UserOrderMessage::decode(payload)?.try_into()
}

pub fn encode_user(user: &User) -> Result<Vec<u8>, MessageFormatError> {
    UserOrderMessage::from(user).encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let user = User::new(70, "Palmer Prosacco").with_order(Order::new(
            753,
            NaiveDate::from_ymd_opt(2021, 3, 8).unwrap(),
            vec![Product::new(3, "Product 3", 183674)],
        ));
        let json: serde_json::Value = serde_json::from_slice(&encode_user(&user).unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 70,
                "name": "Palmer Prosacco",
                "orders": [{
                    "id": 753,
                    "date": "2021-03-08",
                    "products": [{"id": 3, "name": "Product 3", "value": 183674}]
                }]
            })
        );
        assert_eq!(decode_user(&encode_user(&user).unwrap()).unwrap(), user);
    }

    #[test]
    fn test_rejects_bad_payloads() {
        assert!(matches!(
            decode_user(b"not json"),
            Err(MessageFormatError::Json(_))
        ));

        let bad_date =
            br#"{"id":1,"name":"A","orders":[{"id":2,"date":"08/03/2021","products":[]}]}"#;
        assert_eq!(
            decode_user(bad_date),
            Err(MessageFormatError::Date {
                order_id: 2,
                raw: "08/03/2021".into()
            })
        );
    }
}
