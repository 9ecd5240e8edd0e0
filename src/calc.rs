//! Bill arithmetic. Currency is whole rupees; tax is rounded to the unit.

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::model::BillItem;

/// Default GST rate (18%).
pub const TAX_RATE: Decimal = Decimal::from_parts(18, 0, 0, false, 2);

pub fn line_amount(quantity: u32, rate: Decimal) -> Decimal {
    Decimal::from(quantity) * rate
}

/// Sums every row, named or not. Filtering blank rows is the caller's job.
pub fn subtotal(items: &[BillItem]) -> Decimal {
    items.iter().map(BillItem::amount).sum()
}

pub fn tax(subtotal: Decimal, include_tax: bool) -> Decimal {
    tax_at(subtotal, include_tax, TAX_RATE)
}

pub fn tax_at(subtotal: Decimal, include_tax: bool, rate: Decimal) -> Decimal {
    if !include_tax {
        return Decimal::ZERO;
    }
    (subtotal * rate).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

pub fn grand_total(subtotal: Decimal, tax: Decimal) -> Decimal {
    subtotal + tax
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub grand_total: Decimal,
}

impl Totals {
    pub fn compute(items: &[BillItem], include_tax: bool, rate: Decimal) -> Self {
        let subtotal = subtotal(items);
        let tax = tax_at(subtotal, include_tax, rate);
        Self { subtotal, tax, grand_total: grand_total(subtotal, tax) }
    }
}

/// Display label for a new bill: the last six digits of the epoch millis.
/// Not unique; never use it as a key.
pub fn bill_number() -> String {
    bill_number_at(Utc::now().timestamp_millis())
}

pub fn bill_number_at(epoch_millis: i64) -> String {
    format!("{:06}", epoch_millis.rem_euclid(1_000_000))
}

/// `₹15600`, or `₹99.50` when there is a fractional part. No digit grouping.
pub fn format_currency(amount: Decimal) -> String {
    let amount = amount.normalize();
    if amount.fract().is_zero() {
        format!("₹{}", amount.trunc())
    } else {
        format!("₹{:.2}", amount)
    }
}

/// `18` for 0.18, `12.5` for 0.125.
pub fn format_percent(rate: Decimal) -> String {
    (rate * Decimal::ONE_HUNDRED).normalize().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn item(id: u64, name: &str, quantity: u32, rate: Decimal) -> BillItem {
        BillItem::new(id, name, quantity, rate)
    }

    #[test]
    fn line_amount_is_quantity_times_rate() {
        assert_eq!(line_amount(3, dec!(250.50)), dec!(751.50));
        assert_eq!(line_amount(0, dec!(99)), Decimal::ZERO);
        assert_eq!(line_amount(7, Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn subtotal_includes_unnamed_rows() {
        let items = vec![item(1, "Bell", 2, dec!(120)), item(2, "", 1, dec!(80))];
        assert_eq!(subtotal(&items), dec!(320));
    }

    #[test]
    fn tax_is_zero_when_excluded() {
        assert_eq!(tax(dec!(15600), false), Decimal::ZERO);
        assert_eq!(tax(dec!(0), false), Decimal::ZERO);
    }

    #[test]
    fn tax_rounds_to_whole_units() {
        assert_eq!(tax(dec!(15600), true), dec!(2808));
        // 0.18 * 25 = 4.5 rounds up like Math.round
        assert_eq!(tax(dec!(25), true), dec!(5));
        // 0.18 * 37 = 6.66
        assert_eq!(tax(dec!(37), true), dec!(7));
    }

    #[test]
    fn configurable_rate() {
        assert_eq!(tax_at(dec!(1000), true, dec!(0.12)), dec!(120));
    }

    #[test]
    fn totals_for_single_bike() {
        let items = vec![item(1, "Hero Sprint Pro", 1, dec!(15600))];
        let without = Totals::compute(&items, false, TAX_RATE);
        assert_eq!(without.subtotal, dec!(15600));
        assert_eq!(without.tax, Decimal::ZERO);
        assert_eq!(without.grand_total, dec!(15600));

        let with = Totals::compute(&items, true, TAX_RATE);
        assert_eq!(with.tax, dec!(2808));
        assert_eq!(with.grand_total, dec!(18408));
    }

    #[test]
    fn bill_number_is_last_six_digits() {
        assert_eq!(bill_number_at(1_718_000_123_456), "123456");
        assert_eq!(bill_number_at(1_718_000_000_042), "000042");
        assert_eq!(bill_number().len(), 6);
    }

    #[test]
    fn currency_formatting() {
        assert_eq!(format_currency(dec!(15600)), "₹15600");
        assert_eq!(format_currency(dec!(15600.00)), "₹15600");
        assert_eq!(format_currency(dec!(99.5)), "₹99.50");
        assert_eq!(format_percent(TAX_RATE), "18");
    }
}
