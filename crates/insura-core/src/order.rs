//! Orders and their payment/underwriting state machine.
//!
//! ```text
//! Pending ──pay──▶ Paid ──underwrite──▶ Active
//!    │               │
//!    └────fail───────┴──────▶ Failed
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{CoreError, Result};
use crate::product::Product;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Active,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Active => "active",
            OrderStatus::Failed => "failed",
        }
    }

    /// Numeric code used by relational storage.
    pub fn code(&self) -> i16 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Paid => 1,
            OrderStatus::Active => 2,
            OrderStatus::Failed => 3,
        }
    }

    pub fn from_code(code: i16) -> Result<Self> {
        match code {
            0 => Ok(OrderStatus::Pending),
            1 => Ok(OrderStatus::Paid),
            2 => Ok(OrderStatus::Active),
            3 => Ok(OrderStatus::Failed),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Paid)
                | (OrderStatus::Pending, OrderStatus::Failed)
                | (OrderStatus::Paid, OrderStatus::Active)
                | (OrderStatus::Paid, OrderStatus::Failed)
        )
    }

    /// Validate `self -> next`, returning a typed error for illegal moves.
    pub fn transition_to(&self, next: OrderStatus) -> Result<OrderStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::invalid_transition(*self, next))
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "paid" => Ok(OrderStatus::Paid),
            "active" => Ok(OrderStatus::Active),
            "failed" => Ok(OrderStatus::Failed),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// A purchase of one product by one user.
///
/// Product name and price are snapshotted at creation; later catalog edits
/// never change an existing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    #[serde(with = "crate::id::as_string")]
    pub id: i64,
    #[serde(with = "crate::id::as_string")]
    pub user_id: i64,
    #[serde(with = "crate::id::as_string")]
    pub product_id: i64,
    pub product_name_snapshot: String,
    pub unit_price_cents: i64,
    pub total_amount_cents: i64,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_number: Option<String>,
    /// Optimistic concurrency version, bumped by every status change.
    #[serde(default = "default_version")]
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

fn default_version() -> i64 {
    1
}

impl Order {
    /// Build a pending order for `product`, snapshotting its name and price.
    pub fn pending(id: i64, user_id: i64, product: &Product) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            user_id,
            product_id: product.id,
            product_name_snapshot: product.name.clone(),
            unit_price_cents: product.base_price_cents,
            total_amount_cents: product.base_price_cents,
            status: OrderStatus::Pending,
            policy_number: None,
            version: default_version(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_pay(&self) -> bool {
        self.status == OrderStatus::Pending
    }

    pub fn is_paid(&self) -> bool {
        matches!(self.status, OrderStatus::Paid | OrderStatus::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Paid));
        assert!(OrderStatus::Paid.can_transition_to(OrderStatus::Active));
        assert!(OrderStatus::Paid.can_transition_to(OrderStatus::Failed));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Active));
        assert!(!OrderStatus::Active.can_transition_to(OrderStatus::Paid));
        assert!(!OrderStatus::Paid.can_transition_to(OrderStatus::Paid));
    }

    #[test]
    fn test_transition_error() {
        let err = OrderStatus::Active
            .transition_to(OrderStatus::Pending)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid order status transition from active to pending"
        );
    }

    #[test]
    fn test_status_codes_roundtrip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Paid,
            OrderStatus::Active,
            OrderStatus::Failed,
        ] {
            assert_eq!(OrderStatus::from_code(status.code()).unwrap(), status);
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!(OrderStatus::from_code(9).is_err());
    }

    #[test]
    fn test_pending_order_snapshots_product() {
        let product = Product::new(3, "Travel Basic", "travel", 1999);
        let order = Order::pending(42, 7, &product);

        assert!(order.can_pay());
        assert!(!order.is_paid());
        assert_eq!(order.product_name_snapshot, "Travel Basic");
        assert_eq!(order.total_amount_cents, 1999);

        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["id"], "42");
        assert_eq!(json["user_id"], "7");
        assert_eq!(json["status"], "pending");
        assert!(json.get("policy_number").is_none());
    }
}
