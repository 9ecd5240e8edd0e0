//! WhatsApp hand-off: dial strings, message text and `wa.me` deep links.

use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;

use crate::calc::format_currency;

pub const DEFAULT_COUNTRY_CODE: &str = "91";

static SCHEME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(?i)https?://").unwrap());

pub fn normalize_phone(raw: &str) -> String {
    normalize_phone_with(raw, DEFAULT_COUNTRY_CODE)
}

/// Digits only, leading zeros dropped, country code prefixed if absent.
/// Best effort: garbage in gives a garbage dial string, never an error.
pub fn normalize_phone_with(raw: &str, country_code: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let local = digits.trim_start_matches('0');
    if local.starts_with(country_code) {
        local.to_string()
    } else {
        format!("{country_code}{local}")
    }
}

/// Forces an explicit `https://` so the messaging app turns it into a link.
pub fn with_https_scheme(url: &str) -> String {
    format!("https://{}", SCHEME_RE.replace(url.trim(), ""))
}

pub fn compose_message(customer_name: &str, total: Decimal, document_url: &str) -> String {
    format!(
        "Hello {},\nYour bill of {} is ready.\nDownload here:\n{}",
        customer_name.trim(),
        format_currency(total),
        with_https_scheme(document_url)
    )
}

/// Short text that travels with a PDF attached to the native share sheet.
pub fn compose_share_text(customer_name: &str, total: Decimal) -> String {
    format!("Invoice for {} - Amount: {}", customer_name.trim(), format_currency(total))
}

pub fn build_deep_link(dial_string: &str, text: &str) -> String {
    format!("https://wa.me/{}?text={}", dial_string, urlencoding::encode(text))
}
