//! Sales figures computed from the full bill list. Fine for a shop's volume
//! (a few thousand rows); there is no server-side aggregation path.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::model::Bill;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentBill {
    pub bill_number: String,
    pub customer: String,
    pub amount: Decimal,
    pub when: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DayStats {
    pub sales: Decimal,
    pub orders: usize,
    pub customers: usize,
    pub avg_order_value: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MonthStats {
    pub sales: Decimal,
    pub orders: usize,
    pub customers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductSales {
    pub name: String,
    pub units: u32,
    pub revenue: Decimal,
}

fn local_date<Tz: TimeZone>(at: &DateTime<chrono::Utc>, tz: &Tz) -> NaiveDate {
    at.with_timezone(tz).date_naive()
}

/// The first `limit` bills (already newest first) with a relative date label.
pub fn recent_bills(bills: &[Bill], limit: usize, now: DateTime<Local>) -> Vec<RecentBill> {
    bills
        .iter()
        .take(limit)
        .map(|bill| RecentBill {
            bill_number: bill.bill_number.clone(),
            customer: bill.customer_name.clone(),
            amount: bill.total_amount,
            when: relative_day(bill.created_at.with_timezone(&Local), now),
        })
        .collect()
}

/// "Today", "Yesterday", "3 days ago" within a week, otherwise the date.
/// A bill dated after today (clock skew) shows its date.
pub fn relative_day(at: DateTime<Local>, now: DateTime<Local>) -> String {
    let days = (now.date_naive() - at.date_naive()).num_days();
    match days {
        0 => "Today".to_string(),
        1 => "Yesterday".to_string(),
        2..=6 => format!("{days} days ago"),
        _ => at.format("%d/%m/%Y").to_string(),
    }
}

fn summarize<'a>(bills: impl Iterator<Item = &'a Bill>) -> (Decimal, usize, usize) {
    let mut sales = Decimal::ZERO;
    let mut orders = 0;
    let mut customers = HashSet::new();
    for bill in bills {
        sales += bill.total_amount;
        orders += 1;
        customers.insert(bill.customer_name.trim().to_lowercase());
    }
    (sales, orders, customers.len())
}

pub fn today_stats<Tz: TimeZone>(bills: &[Bill], today: NaiveDate, tz: &Tz) -> DayStats {
    let (sales, orders, customers) = summarize(bills.iter().filter(|b| local_date(&b.created_at, tz) == today));
    let avg_order_value = if orders > 0 {
        (sales / Decimal::from(orders)).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
    } else {
        Decimal::ZERO
    };
    DayStats { sales, orders, customers, avg_order_value }
}

pub fn month_stats<Tz: TimeZone>(bills: &[Bill], year: i32, month: u32, tz: &Tz) -> MonthStats {
    let (sales, orders, customers) = summarize(bills.iter().filter(|b| {
        let date = local_date(&b.created_at, tz);
        date.year() == year && date.month() == month
    }));
    MonthStats { sales, orders, customers }
}

/// Best sellers by revenue across the given bills.
pub fn top_products(bills: &[Bill], limit: usize) -> Vec<ProductSales> {
    let mut totals: HashMap<String, ProductSales> = HashMap::new();
    for item in bills.iter().flat_map(|b| &b.bill_items) {
        let entry = totals.entry(item.item_name.trim().to_string()).or_insert_with(|| ProductSales {
            name: item.item_name.trim().to_string(),
            units: 0,
            revenue: Decimal::ZERO,
        });
        entry.units += item.quantity;
        entry.revenue += item.amount;
    }
    let mut products: Vec<ProductSales> = totals.into_values().collect();
    products.sort_by(|a, b| b.revenue.cmp(&a.revenue).then_with(|| a.name.cmp(&b.name)));
    products.truncate(limit);
    products
}
