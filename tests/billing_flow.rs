//! Bill entry through to a shared invoice, against the in-memory backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal_macros::dec;

use cycle_billing::artifact::BucketArtifactStore;
use cycle_billing::backend::MemoryStore;
use cycle_billing::calc::TAX_RATE;
use cycle_billing::draft::BillDraft;
use cycle_billing::error::{BillSaveError, DocumentRenderError, ShareError};
use cycle_billing::model::{CustomerInfo, ShopProfile};
use cycle_billing::render::{
    Asset, DocumentRenderer, DocumentSource, ImageLoadError, ImageLoader, ImageSource, InvoiceView, PdfEngine,
};
use cycle_billing::repository::{BILL_ITEMS_TABLE, BILLS_TABLE, BillRepository};
use cycle_billing::share::{
    DispatchError, NativeShareResult, ShareDispatcher, ShareOutcome, SharePayload, ShareState, ShareTarget,
};

#[derive(Clone, Default)]
struct CountingEngine {
    calls: Arc<AtomicUsize>,
    markup: Arc<Mutex<Vec<String>>>,
}

impl CountingEngine {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_markup(&self) -> String {
        self.markup.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl PdfEngine for CountingEngine {
    async fn compile(&self, markup: &str, _assets: &[Asset]) -> Result<Vec<u8>, DocumentRenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.markup.lock().unwrap().push(markup.to_string());
        Ok(b"%PDF-1.7 invoice".to_vec())
    }
}

/// Every image is unreachable.
struct NoImages;

#[async_trait]
impl ImageLoader for NoImages {
    async fn load(&self, _source: &ImageSource) -> Result<Vec<u8>, ImageLoadError> {
        Err(ImageLoadError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no such image")))
    }
}

#[derive(Default)]
struct LinkOnlyTarget {
    opened: Mutex<Vec<String>>,
}

#[async_trait]
impl ShareTarget for LinkOnlyTarget {
    fn supports_file_share(&self) -> bool {
        false
    }

    async fn share_files(&self, _payload: SharePayload) -> Result<NativeShareResult, DispatchError> {
        Ok(NativeShareResult::Unsupported("link only".into()))
    }

    async fn open_url(&self, url: &str) -> Result<(), DispatchError> {
        self.opened.lock().unwrap().push(url.to_string());
        Ok(())
    }
}

fn shop(logo: Option<&str>) -> ShopProfile {
    ShopProfile {
        name: "ANAND CYCLE STORE".into(),
        tagline: "Bicycles, Spares & Accessories".into(),
        address: "Main Road, Nanded".into(),
        phones: vec!["+91 98220 00000".into()],
        website: None,
        logo: logo.map(str::to_string),
        qr_code: None,
        footer: "THANK YOU FOR YOUR BUSINESS!".into(),
    }
}

fn rahul_draft(phone: &str, include_gst: bool) -> BillDraft {
    let mut draft = BillDraft::new();
    draft.customer = CustomerInfo::new("Rahul Sharma", phone, "Station Road");
    draft.include_gst = include_gst;
    let id = draft.items()[0].id();
    draft.set_name(id, "Hero Sprint Pro");
    draft.set_quantity(id, 1);
    draft.set_rate(id, dec!(15600));
    // Left blank on purpose: it must not reach the backend or the invoice.
    draft.add_item();
    draft
}

struct Pipeline {
    store: MemoryStore,
    engine: CountingEngine,
    target: Arc<LinkOnlyTarget>,
    dispatcher: ShareDispatcher<
        Arc<DocumentRenderer<CountingEngine, NoImages>>,
        BucketArtifactStore<MemoryStore>,
        Arc<LinkOnlyTarget>,
    >,
}

fn pipeline() -> Pipeline {
    let store = MemoryStore::new();
    let engine = CountingEngine::default();
    let renderer = Arc::new(DocumentRenderer::new(engine.clone(), NoImages).unwrap());
    let target = Arc::new(LinkOnlyTarget::default());
    let dispatcher = ShareDispatcher::new(renderer, BucketArtifactStore::new(store.clone(), "bills"), target.clone());
    Pipeline { store, engine, target, dispatcher }
}

#[tokio::test]
async fn saved_bill_is_shared_as_a_link_without_gst() {
    let p = pipeline();
    let draft = rahul_draft("98765 43210", false);
    draft.validate_for_generation().unwrap();

    let repository = BillRepository::new(p.store.clone());
    let saved = repository.save_bill(&draft.to_new_bill("123456", TAX_RATE), draft.items()).await.unwrap();
    assert_eq!(saved.total_amount, dec!(15600));
    assert_eq!(saved.gst_amount, dec!(0));
    assert_eq!(p.store.rows(BILL_ITEMS_TABLE).len(), 1);

    let bills = repository.list_bills().await.unwrap();
    let view = InvoiceView::from_bill(&shop(None), &bills[0], TAX_RATE);
    let report = p.dispatcher.share(&view).await;

    assert_eq!(report.final_state(), ShareState::Done);
    let ShareOutcome::LinkOpened { document_url, deep_link } = report.result.unwrap() else {
        panic!("expected the link route");
    };
    assert!(document_url.ends_with("rahul_sharma_123456.pdf"));
    assert!(p.store.object("bills", "rahul_sharma_123456.pdf").is_some());
    assert!(deep_link.starts_with("https://wa.me/919876543210?text="));
    assert_eq!(p.target.opened.lock().unwrap().as_slice(), [deep_link]);

    let markup = p.engine.last_markup();
    assert!(markup.contains("Hero Sprint Pro"));
    assert!(markup.contains("₹15600"));
    assert!(!markup.contains("GST ("));
}

#[tokio::test]
async fn gst_is_added_on_top_and_printed() {
    let p = pipeline();
    let draft = rahul_draft("9876543210", true);

    let totals = draft.totals(TAX_RATE);
    assert_eq!(totals.subtotal, dec!(15600));
    assert_eq!(totals.tax, dec!(2808));
    assert_eq!(totals.grand_total, dec!(18408));

    let saved = BillRepository::new(p.store.clone())
        .save_bill(&draft.to_new_bill("654321", TAX_RATE), draft.items())
        .await
        .unwrap();
    assert_eq!(saved.total_amount, dec!(18408));

    let view = InvoiceView::from_bill(&shop(None), &saved, TAX_RATE);
    let report = p.dispatcher.share(&view).await;
    assert!(report.result.is_ok());

    let markup = p.engine.last_markup();
    assert!(markup.contains("GST (18%)"));
    assert!(markup.contains("₹2808"));
    assert!(markup.contains("₹18408"));
}

#[tokio::test]
async fn missing_phone_stops_before_rendering() {
    let p = pipeline();
    let draft = rahul_draft("", false);
    let view = InvoiceView::from_draft(&shop(None), &draft, "111111", chrono::Local::now().date_naive(), TAX_RATE);

    let report = p.dispatcher.share(&view).await;

    assert!(matches!(report.result, Err(ShareError::MissingInfo(_))));
    assert_eq!(report.transitions, [ShareState::Idle, ShareState::Failed]);
    assert_eq!(p.engine.calls(), 0);
    assert_eq!(p.store.object_count(), 0);
    assert!(p.target.opened.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_logo_does_not_block_the_invoice() {
    let engine = CountingEngine::default();
    let renderer = DocumentRenderer::new(engine.clone(), NoImages).unwrap();
    let draft = rahul_draft("9876543210", false);
    let today = chrono::Local::now().date_naive();
    let view = InvoiceView::from_draft(&shop(Some("/nowhere/logo.png")), &draft, "222222", today, TAX_RATE);

    let document = renderer.render(&view).await.unwrap();

    assert!(!document.bytes.is_empty());
    assert_eq!(document.file_name, "rahul_sharma_222222.pdf");
    assert!(!engine.last_markup().contains("#image("));
}

#[tokio::test]
async fn failed_items_roll_back_the_header() {
    let store = MemoryStore::new();
    store.fail_inserts(BILL_ITEMS_TABLE, "items table unavailable");
    let draft = rahul_draft("9876543210", false);

    let err = BillRepository::new(store.clone())
        .save_bill(&draft.to_new_bill("333333", TAX_RATE), draft.items())
        .await
        .unwrap_err();

    assert!(matches!(err, BillSaveError::Items { compensated: true, .. }));
    assert!(err.notice().detail.contains("items table unavailable"));
    assert!(store.rows(BILLS_TABLE).is_empty());
}
