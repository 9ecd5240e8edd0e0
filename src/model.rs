use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calc;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct CustomerInfo {
    pub name: String,
    pub phone: String,
    pub address: String,
}

impl CustomerInfo {
    pub fn new(name: impl Into<String>, phone: impl Into<String>, address: impl Into<String>) -> Self {
        Self { name: name.into(), phone: phone.into(), address: address.into() }
    }
}

/// One editable row of a bill. `amount` is always `quantity * rate`; the
/// fields are private so nothing can store it independently.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct BillItem {
    id: u64,
    name: String,
    quantity: u32,
    rate: Decimal,
    amount: Decimal,
}

impl BillItem {
    pub fn new(id: u64, name: impl Into<String>, quantity: u32, rate: Decimal) -> Self {
        Self {
            id,
            name: name.into(),
            quantity,
            rate,
            amount: calc::line_amount(quantity, rate),
        }
    }

    pub fn blank(id: u64) -> Self {
        Self::new(id, "", 1, Decimal::ZERO)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    pub fn rate(&self) -> Decimal {
        self.rate
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    /// Rows with a blank name are kept in the editor but never persisted or rendered.
    pub fn is_named(&self) -> bool {
        !self.name.trim().is_empty()
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub(crate) fn set_quantity(&mut self, quantity: u32) {
        self.quantity = quantity;
        self.amount = calc::line_amount(self.quantity, self.rate);
    }

    pub(crate) fn set_rate(&mut self, rate: Decimal) {
        self.rate = rate;
        self.amount = calc::line_amount(self.quantity, self.rate);
    }
}

// ==========================================
// Persisted rows
// ==========================================

/// Header row as written to the `bills` table.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct NewBill {
    pub bill_number: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_address: String,
    pub subtotal: Decimal,
    pub gst_amount: Decimal,
    pub total_amount: Decimal,
    pub include_gst: bool,
}

/// Line item row as written to the `bill_items` table.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct NewBillLineItem {
    pub bill_id: Uuid,
    pub item_name: String,
    pub quantity: u32,
    pub rate: Decimal,
    pub amount: Decimal,
}

impl NewBillLineItem {
    pub fn snapshot(bill_id: Uuid, item: &BillItem) -> Self {
        Self {
            bill_id,
            item_name: item.name().to_string(),
            quantity: item.quantity(),
            rate: item.rate(),
            amount: item.amount(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BillLineItem {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub bill_id: Uuid,
    pub item_name: String,
    pub quantity: u32,
    pub rate: Decimal,
    pub amount: Decimal,
}

/// A bill as stored by the backend. `id` is the backend-assigned key;
/// `bill_number` is only the label printed on the invoice.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Bill {
    pub id: Uuid,
    pub bill_number: String,
    pub customer_name: String,
    pub customer_phone: String,
    #[serde(default)]
    pub customer_address: String,
    pub subtotal: Decimal,
    pub gst_amount: Decimal,
    pub total_amount: Decimal,
    pub include_gst: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub bill_items: Vec<BillLineItem>,
}

impl Bill {
    pub fn customer(&self) -> CustomerInfo {
        CustomerInfo::new(&self.customer_name, &self.customer_phone, &self.customer_address)
    }
}

// ==========================================
// Shop identity
// ==========================================

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ShopProfile {
    pub name: String,
    #[serde(default)]
    pub tagline: String,
    pub address: String,
    #[serde(default)]
    pub phones: Vec<String>,
    #[serde(default)]
    pub website: Option<String>,
    /// Local path or http(s) URL of the logo printed in the invoice header.
    #[serde(default)]
    pub logo: Option<String>,
    /// Local path or http(s) URL of the QR code printed next to the totals.
    #[serde(default)]
    pub qr_code: Option<String>,
    #[serde(default = "default_footer")]
    pub footer: String,
}

fn default_footer() -> String {
    "THANK YOU FOR YOUR BUSINESS!".to_string()
}

// ==========================================
// Template context
// ==========================================

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct InvoiceLine {
    pub name: String,
    pub quantity: u32,
    pub rate: Decimal,
    pub amount: Decimal,
}

#[derive(Serialize)]
pub struct InvoiceContext<'a> {
    pub title: String,
    pub bill_number: &'a str,
    pub date: String,
    pub shop: &'a ShopProfile,
    pub customer: &'a CustomerInfo,
    pub items: &'a [InvoiceLine],
    pub subtotal: Decimal,
    pub gst_amount: Decimal,
    pub total: Decimal,
    pub include_gst: bool,
    pub gst_percent: String,
    /// Asset file names of images that settled successfully.
    pub logo: Option<String>,
    pub qr_code: Option<String>,
}
