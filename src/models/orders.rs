use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "confirmed" => Ok(OrderStatus::Confirmed),
            "processing" => Ok(OrderStatus::Processing),
            "shipped" => Ok(OrderStatus::Shipped),
            "delivered" => Ok(OrderStatus::Delivered),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(EngineError::invalid(format!("unknown order status {}", other))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Verified,
    Rejected,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Verified => "verified",
            PaymentStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "verified" => Ok(PaymentStatus::Verified),
            "rejected" => Ok(PaymentStatus::Rejected),
            other => Err(EngineError::invalid(format!("unknown payment status {}", other))),
        }
    }
}

/// Flat shipping fee, waived once the subtotal reaches the threshold.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct ShippingPolicy {
    pub flat_charge_in_cents: i64,
    pub free_shipping_threshold_in_cents: i64,
}

impl ShippingPolicy {
    pub fn charge_for(&self, subtotal_in_cents: i64) -> i64 {
        if subtotal_in_cents >= self.free_shipping_threshold_in_cents {
            0
        } else {
            self.flat_charge_in_cents
        }
    }
}

/// Contact and delivery details copied onto the order at checkout.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct CustomerSnapshot {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub mobile: Option<String>,
    pub address: String,
    #[serde(default)]
    pub city: Option<String>,
    pub postal_code: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CartItem {
    pub product_id: String,
    pub name: String,
    pub unit_price_in_cents: i64,
    pub quantity: u32,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct OrderItem {
    pub product_id: String,
    pub name: String,
    pub unit_price_in_cents: i64,
    pub quantity: u32,
    pub line_total_in_cents: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", content = "status", rename_all = "snake_case")]
pub enum HistoryEvent {
    Status(OrderStatus),
    Payment(PaymentStatus),
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct HistoryEntry {
    pub event: HistoryEvent,
    pub note: String,
    pub date: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Order {
    pub order_id: String,
    pub customer: CustomerSnapshot,
    pub items: Vec<OrderItem>,
    pub subtotal_in_cents: i64,
    pub shipping_in_cents: i64,
    pub total_in_cents: i64,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub status_history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn snapshot_item(item: &CartItem) -> Result<OrderItem, EngineError> {
    if item.quantity == 0 {
        return Err(EngineError::invalid(format!("{} has a zero quantity", item.name)));
    }
    if item.unit_price_in_cents < 0 {
        return Err(EngineError::invalid(format!("{} has a negative price", item.name)));
    }

    let line_total_in_cents = item
        .unit_price_in_cents
        .checked_mul(i64::from(item.quantity))
        .ok_or_else(|| EngineError::invalid(format!("{} line total overflows", item.name)))?;

    Ok(OrderItem {
        product_id: item.product_id.clone(),
        name: item.name.clone(),
        unit_price_in_cents: item.unit_price_in_cents,
        quantity: item.quantity,
        line_total_in_cents,
    })
}

impl Order {
    pub fn place(
        order_id: String,
        cart: &[CartItem],
        customer: CustomerSnapshot,
        policy: &ShippingPolicy,
        now: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        if cart.is_empty() {
            return Err(EngineError::invalid("cart is empty"));
        }

        let items = cart.iter().map(snapshot_item).collect::<Result<Vec<_>, _>>()?;
        let subtotal_in_cents = items
            .iter()
            .try_fold(0i64, |acc, item| acc.checked_add(item.line_total_in_cents))
            .ok_or_else(|| EngineError::invalid("order subtotal overflows"))?;
        let shipping_in_cents = policy.charge_for(subtotal_in_cents);

        Ok(Self {
            order_id,
            customer,
            items,
            subtotal_in_cents,
            shipping_in_cents,
            total_in_cents: subtotal_in_cents + shipping_in_cents,
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            status_history: vec![HistoryEntry {
                event: HistoryEvent::Status(OrderStatus::Pending),
                note: "Order placed".to_string(),
                date: now,
            }],
            created_at: now,
            updated_at: now,
        })
    }

    /// Any status may follow any other; operators correct mistakes by moving backwards.
    pub fn record_status(&mut self, status: OrderStatus, note: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        let note = note.unwrap_or_else(|| format!("Order status updated to {}", status));
        self.append(HistoryEvent::Status(status), note, now);
    }

    /// Payment verification never advances fulfillment on its own.
    pub fn record_payment_status(
        &mut self,
        status: PaymentStatus,
        note: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.payment_status = status;
        let note = note.unwrap_or_else(|| format!("Payment status updated to {}", status));
        self.append(HistoryEvent::Payment(status), note, now);
    }

    fn append(&mut self, event: HistoryEvent, note: String, now: DateTime<Utc>) {
        self.updated_at = crate::utils::advance(self.updated_at, now);
        self.status_history.push(HistoryEntry {
            event,
            note,
            date: self.updated_at,
        });
    }
}
