//! Order domain payload.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::codec::Payload;

/// Opaque order identifier.
///
/// Rendered as 32 lowercase hex characters with no dashes. Any textual UUID
/// form is accepted when parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderId(Uuid);

impl OrderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl std::str::FromStr for OrderId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Serialize for OrderId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0.simple())
    }
}

impl<'de> Deserialize<'de> for OrderId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A customer order.
///
/// The identifier is assigned once on construction and cannot be changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(rename = "OrderID")]
    order_id: OrderId,
    #[serde(rename = "UnitPrice", with = "rust_decimal::serde::arbitrary_precision")]
    pub unit_price: Decimal,
    #[serde(rename = "Quantity")]
    pub quantity: u32,
    #[serde(rename = "ItemName")]
    pub item_name: String,
    #[serde(rename = "CustomerName")]
    pub customer_name: String,
}

impl Order {
    pub fn new(
        customer_name: impl Into<String>,
        item_name: impl Into<String>,
        unit_price: Decimal,
        quantity: u32,
    ) -> Self {
        Self {
            order_id: OrderId::new(),
            unit_price,
            quantity,
            item_name: item_name.into(),
            customer_name: customer_name.into(),
        }
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }
}

impl Payload for Order {
    const TYPE_NAME: &'static str = "Order";

    fn message_id(&self) -> String {
        self.order_id.to_string()
    }

    fn validate(&self) -> Result<(), String> {
        if self.unit_price < Decimal::ZERO {
            return Err(format!("UnitPrice must not be negative, got {}", self.unit_price));
        }
        Ok(())
    }
}

/// Order submission coming from an interactive front end.
///
/// An identifier is generated when `order_id` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub customer_name: String,
    pub item_name: String,
    pub unit_price: Decimal,
    pub quantity: u32,
    pub order_id: Option<OrderId>,
}

impl From<PublishRequest> for Order {
    fn from(request: PublishRequest) -> Self {
        Order {
            order_id: request.order_id.unwrap_or_default(),
            unit_price: request.unit_price,
            quantity: request.quantity,
            item_name: request.item_name,
            customer_name: request.customer_name,
        }
    }
}
