use rust_decimal::Decimal;

use crate::calc::Totals;
use crate::error::MissingInfo;
use crate::model::{BillItem, CustomerInfo, NewBill};

/// The bill being edited. Always holds at least one row.
#[derive(Debug, Clone)]
pub struct BillDraft {
    pub customer: CustomerInfo,
    pub include_gst: bool,
    items: Vec<BillItem>,
    next_id: u64,
}

impl Default for BillDraft {
    fn default() -> Self {
        Self::new()
    }
}

impl BillDraft {
    pub fn new() -> Self {
        Self {
            customer: CustomerInfo::default(),
            include_gst: false,
            items: vec![BillItem::blank(1)],
            next_id: 2,
        }
    }

    pub fn items(&self) -> &[BillItem] {
        &self.items
    }

    /// Appends a blank row and returns its id.
    pub fn add_item(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.items.push(BillItem::blank(id));
        id
    }

    /// Removes a row unless it is the last one. Returns whether anything was removed.
    pub fn remove_item(&mut self, id: u64) -> bool {
        if self.items.len() <= 1 {
            return false;
        }
        let before = self.items.len();
        self.items.retain(|item| item.id() != id);
        self.items.len() != before
    }

    pub fn set_name(&mut self, id: u64, name: impl Into<String>) -> bool {
        self.with_item(id, |item| item.set_name(name))
    }

    /// Quantities below one fall back to one.
    pub fn set_quantity(&mut self, id: u64, quantity: u32) -> bool {
        self.with_item(id, |item| item.set_quantity(quantity.max(1)))
    }

    /// Negative rates fall back to zero.
    pub fn set_rate(&mut self, id: u64, rate: Decimal) -> bool {
        self.with_item(id, |item| item.set_rate(rate.max(Decimal::ZERO)))
    }

    fn with_item(&mut self, id: u64, edit: impl FnOnce(&mut BillItem)) -> bool {
        match self.items.iter_mut().find(|item| item.id() == id) {
            Some(item) => {
                edit(item);
                true
            }
            None => false,
        }
    }

    /// Rows that will be persisted and printed.
    pub fn named_items(&self) -> Vec<BillItem> {
        self.items.iter().filter(|item| item.is_named()).cloned().collect()
    }

    pub fn totals(&self, tax_rate: Decimal) -> Totals {
        Totals::compute(&self.items, self.include_gst, tax_rate)
    }

    pub fn validate_for_generation(&self) -> Result<(), MissingInfo> {
        if self.customer.name.trim().is_empty() {
            return Err(MissingInfo("Please fill in the customer name".into()));
        }
        if !self.items.iter().any(BillItem::is_named) {
            return Err(MissingInfo("Please add at least one item with a name".into()));
        }
        Ok(())
    }

    /// Header row for this draft. Totals cover every row, matching the preview.
    pub fn to_new_bill(&self, bill_number: &str, tax_rate: Decimal) -> NewBill {
        let totals = self.totals(tax_rate);
        NewBill {
            bill_number: bill_number.to_string(),
            customer_name: self.customer.name.trim().to_string(),
            customer_phone: self.customer.phone.trim().to_string(),
            customer_address: self.customer.address.trim().to_string(),
            subtotal: totals.subtotal,
            gst_amount: totals.tax,
            total_amount: totals.grand_total,
            include_gst: self.include_gst,
        }
    }
}
