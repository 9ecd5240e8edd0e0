//! Bill persistence.
//!
//! Saving is a two-step saga over the `bills` and `bill_items` tables:
//! the header goes in first, then the item snapshot. If the items fail the
//! header is deleted again so no bill is left without its lines; when even
//! that delete fails the error says so.

use std::collections::HashMap;

use futures::future::try_join_all;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{BackendError, Filter, Query, RowStore};
use crate::error::BillSaveError;
use crate::model::{Bill, BillItem, BillLineItem, NewBill, NewBillLineItem};

pub const BILLS_TABLE: &str = "bills";
pub const BILL_ITEMS_TABLE: &str = "bill_items";

/// Bill ids per item lookup. Keeps each `in.(...)` filter a few KB long,
/// well inside gateway URL limits.
pub const ITEM_LOOKUP_CHUNK: usize = 100;

pub struct BillRepository<S> {
    rows: S,
}

impl<S: RowStore> BillRepository<S> {
    pub fn new(rows: S) -> Self {
        Self { rows }
    }

    /// Persists the header and the named items. Blank rows are dropped here,
    /// so later edits to the draft never touch what was saved.
    pub async fn save_bill(&self, header: &NewBill, items: &[BillItem]) -> Result<Bill, BillSaveError> {
        let mut bill = self.insert_header(header).await?;

        let snapshot: Vec<NewBillLineItem> = items
            .iter()
            .filter(|item| item.is_named())
            .map(|item| NewBillLineItem::snapshot(bill.id, item))
            .collect();

        match self.insert_items(&snapshot).await {
            Ok(saved) => {
                info!(bill_number = %bill.bill_number, id = %bill.id, items = saved.len(), "bill saved");
                bill.bill_items = saved;
                Ok(bill)
            }
            Err(source) => {
                let compensated = self.delete_header(bill.id).await;
                Err(BillSaveError::Items { source, compensated })
            }
        }
    }

    async fn insert_header(&self, header: &NewBill) -> Result<Bill, BillSaveError> {
        let row = serde_json::to_value(header).map_err(|e| BillSaveError::Header(e.into()))?;
        let mut stored = self.rows.insert(BILLS_TABLE, vec![row]).await.map_err(BillSaveError::Header)?;
        if stored.is_empty() {
            return Err(BillSaveError::MissingHeader);
        }
        serde_json::from_value(stored.swap_remove(0)).map_err(|e| BillSaveError::Header(e.into()))
    }

    async fn insert_items(&self, items: &[NewBillLineItem]) -> Result<Vec<BillLineItem>, BackendError> {
        if items.is_empty() {
            return Ok(vec![]);
        }
        let rows = items.iter().map(serde_json::to_value).collect::<Result<Vec<_>, _>>()?;
        let stored = self.rows.insert(BILL_ITEMS_TABLE, rows).await?;
        stored.into_iter().map(|row| Ok(serde_json::from_value(row)?)).collect()
    }

    /// Compensating step for a failed item insert. Returns whether the header is gone.
    async fn delete_header(&self, id: Uuid) -> bool {
        match self.rows.delete(BILLS_TABLE, &[Filter::eq("id", id.to_string())]).await {
            Ok(()) => {
                warn!(%id, "bill items failed; header rolled back");
                true
            }
            Err(err) => {
                warn!(%id, error = %err, "bill items failed and header could not be rolled back");
                false
            }
        }
    }

    /// All bills, newest first, each with its line items.
    pub async fn list_bills(&self) -> Result<Vec<Bill>, BackendError> {
        let rows = self.rows.select(BILLS_TABLE, &Query::new().order_desc("created_at")).await?;
        let mut bills: Vec<Bill> = rows.into_iter().map(serde_json::from_value).collect::<Result<_, _>>()?;
        if bills.is_empty() {
            return Ok(bills);
        }

        let lookups = bills.chunks(ITEM_LOOKUP_CHUNK).map(|chunk| {
            let ids: Vec<Value> = chunk.iter().map(|b| Value::String(b.id.to_string())).collect();
            let query = Query::new().filter(Filter::any_of("bill_id", ids));
            async move { self.rows.select(BILL_ITEMS_TABLE, &query).await }
        });
        let item_rows = try_join_all(lookups).await?;

        let mut by_bill: HashMap<Uuid, Vec<BillLineItem>> = HashMap::new();
        for row in item_rows.into_iter().flatten() {
            let item: BillLineItem = serde_json::from_value(row)?;
            by_bill.entry(item.bill_id).or_default().push(item);
        }
        for bill in &mut bills {
            bill.bill_items = by_bill.remove(&bill.id).unwrap_or_default();
        }
        Ok(bills)
    }

    pub async fn find_by_number(&self, bill_number: &str) -> Result<Option<Bill>, BackendError> {
        Ok(self.list_bills().await?.into_iter().find(|b| b.bill_number == bill_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::calc::TAX_RATE;
    use crate::draft::BillDraft;
    use crate::model::CustomerInfo;
    use rust_decimal_macros::dec;

    fn sample_draft() -> BillDraft {
        let mut draft = BillDraft::new();
        draft.customer = CustomerInfo::new("Rahul Sharma", "9876543210", "M.G. Road, Nanded");
        let first = draft.items()[0].id();
        draft.set_name(first, "Hero Sprint Pro");
        draft.set_rate(first, dec!(15600));
        let second = draft.add_item();
        draft.set_name(second, "Helmet");
        draft.set_quantity(second, 2);
        draft.set_rate(second, dec!(750));
        draft.add_item();
        draft
    }

    #[tokio::test]
    async fn saved_bill_round_trips_through_listing() {
        let store = MemoryStore::new();
        let repo = BillRepository::new(store.clone());
        let draft = sample_draft();
        let header = draft.to_new_bill("123456", TAX_RATE);

        let saved = repo.save_bill(&header, draft.items()).await.unwrap();
        assert_eq!(saved.bill_items.len(), 2);

        let listed = repo.list_bills().await.unwrap();
        assert_eq!(listed.len(), 1);
        let bill = &listed[0];
        assert_eq!(bill.id, saved.id);
        assert_eq!(bill.bill_number, "123456");
        assert_eq!(bill.customer_name, "Rahul Sharma");
        assert_eq!(bill.customer_phone, "9876543210");
        assert_eq!(bill.customer_address, "M.G. Road, Nanded");
        assert_eq!(bill.subtotal, dec!(17100));
        assert_eq!(bill.gst_amount, dec!(0));
        assert_eq!(bill.total_amount, dec!(17100));
        assert!(!bill.include_gst);

        let mut names: Vec<&str> = bill.bill_items.iter().map(|i| i.item_name.as_str()).collect();
        names.sort();
        assert_eq!(names, ["Helmet", "Hero Sprint Pro"]);
        let helmet = bill.bill_items.iter().find(|i| i.item_name == "Helmet").unwrap();
        assert_eq!(helmet.quantity, 2);
        assert_eq!(helmet.amount, dec!(1500));
    }

    #[tokio::test]
    async fn later_draft_edits_do_not_change_saved_bill() {
        let store = MemoryStore::new();
        let repo = BillRepository::new(store.clone());
        let mut draft = sample_draft();
        repo.save_bill(&draft.to_new_bill("1", TAX_RATE), draft.items()).await.unwrap();

        let first = draft.items()[0].id();
        draft.set_rate(first, dec!(1));

        let bill = repo.find_by_number("1").await.unwrap().unwrap();
        let bike = bill.bill_items.iter().find(|i| i.item_name == "Hero Sprint Pro").unwrap();
        assert_eq!(bike.rate, dec!(15600));
    }

    #[tokio::test]
    async fn header_failure_writes_nothing() {
        let store = MemoryStore::new();
        store.fail_inserts(BILLS_TABLE, "permission denied for table bills");
        let repo = BillRepository::new(store.clone());
        let draft = sample_draft();

        let err = repo.save_bill(&draft.to_new_bill("1", TAX_RATE), draft.items()).await.unwrap_err();
        assert!(matches!(err, BillSaveError::Header(_)));
        assert!(err.to_string().contains("permission denied"));
        assert!(store.rows(BILLS_TABLE).is_empty());
        assert!(store.rows(BILL_ITEMS_TABLE).is_empty());
    }

    #[tokio::test]
    async fn item_failure_rolls_back_header() {
        let store = MemoryStore::new();
        store.fail_inserts(BILL_ITEMS_TABLE, "value too long");
        let repo = BillRepository::new(store.clone());
        let draft = sample_draft();

        let err = repo.save_bill(&draft.to_new_bill("1", TAX_RATE), draft.items()).await.unwrap_err();
        assert!(matches!(err, BillSaveError::Items { compensated: true, .. }));
        assert!(store.rows(BILLS_TABLE).is_empty());
    }

    #[tokio::test]
    async fn failed_rollback_is_reported() {
        let store = MemoryStore::new();
        store.fail_inserts(BILL_ITEMS_TABLE, "value too long");
        store.fail_deletes(BILLS_TABLE, "network down");
        let repo = BillRepository::new(store.clone());
        let draft = sample_draft();

        let err = repo.save_bill(&draft.to_new_bill("1", TAX_RATE), draft.items()).await.unwrap_err();
        assert!(matches!(err, BillSaveError::Items { compensated: false, .. }));
        assert_eq!(store.rows(BILLS_TABLE).len(), 1);
    }

    /// Rejects item lookups whose id list would not fit in a request URL.
    struct UrlLimitedStore {
        inner: MemoryStore,
        max_ids: usize,
        lookups: std::sync::Mutex<Vec<usize>>,
    }

    #[async_trait::async_trait]
    impl RowStore for UrlLimitedStore {
        async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, BackendError> {
            self.inner.insert(table, rows).await
        }

        async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, BackendError> {
            for filter in &query.filters {
                if let Filter::In(_, ids) = filter {
                    self.lookups.lock().unwrap().push(ids.len());
                    if ids.len() > self.max_ids {
                        return Err(BackendError::Status { status: 414, message: "URI Too Long".into() });
                    }
                }
            }
            self.inner.select(table, query).await
        }

        async fn update(&self, table: &str, filters: &[Filter], patch: Value) -> Result<Vec<Value>, BackendError> {
            self.inner.update(table, filters, patch).await
        }

        async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), BackendError> {
            self.inner.delete(table, filters).await
        }
    }

    #[tokio::test]
    async fn listing_thousands_of_bills_splits_item_lookups() {
        let inner = MemoryStore::new();
        let bills: Vec<Value> = (0..2500)
            .map(|n| {
                serde_json::json!({
                    "id": Uuid::new_v4(), "bill_number": format!("{n:06}"), "customer_name": "A",
                    "customer_phone": "1", "customer_address": "", "subtotal": 100, "gst_amount": 0,
                    "total_amount": 100, "include_gst": false,
                })
            })
            .collect();
        let stored = inner.insert(BILLS_TABLE, bills).await.unwrap();
        let items: Vec<Value> = stored
            .iter()
            .map(|bill| {
                serde_json::json!({
                    "bill_id": bill["id"], "item_name": "Bell", "quantity": 1, "rate": 100, "amount": 100,
                })
            })
            .collect();
        inner.insert(BILL_ITEMS_TABLE, items).await.unwrap();

        let store = UrlLimitedStore { inner, max_ids: ITEM_LOOKUP_CHUNK, lookups: Default::default() };
        let repo = BillRepository::new(store);
        let listed = repo.list_bills().await.unwrap();

        assert_eq!(listed.len(), 2500);
        assert!(listed.iter().all(|bill| bill.bill_items.len() == 1));
        let lookups = repo.rows.lookups.lock().unwrap();
        assert_eq!(lookups.len(), 25);
        assert!(lookups.iter().all(|&n| n <= ITEM_LOOKUP_CHUNK));
    }

    #[tokio::test]
    async fn listing_is_newest_first() {
        let store = MemoryStore::new();
        store
            .insert(
                BILLS_TABLE,
                vec![
                    serde_json::json!({
                        "bill_number": "000001", "customer_name": "A", "customer_phone": "1",
                        "customer_address": "", "subtotal": 10, "gst_amount": 0, "total_amount": 10,
                        "include_gst": false, "created_at": "2024-05-01T09:00:00Z",
                        "updated_at": "2024-05-01T09:00:00Z"
                    }),
                    serde_json::json!({
                        "bill_number": "000002", "customer_name": "B", "customer_phone": "2",
                        "customer_address": "", "subtotal": 20, "gst_amount": 0, "total_amount": 20,
                        "include_gst": false, "created_at": "2024-05-02T09:00:00Z",
                        "updated_at": "2024-05-02T09:00:00Z"
                    }),
                ],
            )
            .await
            .unwrap();

        let repo = BillRepository::new(store);
        let numbers: Vec<String> = repo.list_bills().await.unwrap().into_iter().map(|b| b.bill_number).collect();
        assert_eq!(numbers, ["000002", "000001"]);
    }
}
