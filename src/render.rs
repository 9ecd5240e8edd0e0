//! Invoice rendering: structured view -> tera template -> Typst markup -> PDF.
//!
//! Every image the invoice references is settled (loaded, failed or timed
//! out) before the engine is started. A failed image is left out of the
//! layout instead of failing the invoice.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use futures::future::join_all;
use rust_decimal::Decimal;
use tempfile::NamedTempFile;
use tera::{Context, Tera, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::artifact::artifact_file_name;
use crate::calc::{self, Totals};
use crate::desktop;
use crate::draft::BillDraft;
use crate::error::DocumentRenderError;
use crate::model::{Bill, CustomerInfo, InvoiceContext, InvoiceLine, ShopProfile};

pub const DEFAULT_TEMPLATE: &str = include_str!("../templates/invoice.tera");
const TEMPLATE_NAME: &str = "invoice.tera";
const DATE_FORMAT: &str = "%d/%m/%Y";

// ==========================================
// Invoice view
// ==========================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Path(PathBuf),
    Url(String),
}

impl ImageSource {
    pub fn parse(source: &str) -> Self {
        let source = source.trim();
        if source.starts_with("http://") || source.starts_with("https://") {
            ImageSource::Url(source.to_string())
        } else {
            ImageSource::Path(PathBuf::from(source))
        }
    }

    fn extension(&self) -> String {
        let name = match self {
            ImageSource::Path(path) => path.to_string_lossy().into_owned(),
            ImageSource::Url(url) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
        };
        Path::new(&name)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "png".to_string())
    }
}

/// Everything printed on one invoice.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceView {
    pub shop: ShopProfile,
    pub bill_number: String,
    pub date: NaiveDate,
    pub customer: CustomerInfo,
    pub lines: Vec<InvoiceLine>,
    pub totals: Totals,
    pub include_gst: bool,
    pub gst_rate: Decimal,
    pub logo: Option<ImageSource>,
    pub qr_code: Option<ImageSource>,
}

impl InvoiceView {
    /// Builds the preview of a draft. Blank rows are not printed; totals
    /// still cover every row.
    pub fn from_draft(
        shop: &ShopProfile,
        draft: &BillDraft,
        bill_number: &str,
        date: NaiveDate,
        gst_rate: Decimal,
    ) -> Self {
        let lines = draft
            .named_items()
            .iter()
            .map(|item| InvoiceLine {
                name: item.name().trim().to_string(),
                quantity: item.quantity(),
                rate: item.rate(),
                amount: item.amount(),
            })
            .collect();
        Self::with_shop(
            shop,
            bill_number,
            date,
            draft.customer.clone(),
            lines,
            draft.totals(gst_rate),
            draft.include_gst,
            gst_rate,
        )
    }

    /// Re-renders a saved bill from its stored snapshot.
    pub fn from_bill(shop: &ShopProfile, bill: &Bill, gst_rate: Decimal) -> Self {
        let lines = bill
            .bill_items
            .iter()
            .map(|item| InvoiceLine {
                name: item.item_name.clone(),
                quantity: item.quantity,
                rate: item.rate,
                amount: item.amount,
            })
            .collect();
        let totals = Totals { subtotal: bill.subtotal, tax: bill.gst_amount, grand_total: bill.total_amount };
        let date = bill.created_at.with_timezone(&Local).date_naive();
        let customer = bill.customer();
        Self::with_shop(shop, &bill.bill_number, date, customer, lines, totals, bill.include_gst, gst_rate)
    }

    #[allow(clippy::too_many_arguments)]
    fn with_shop(
        shop: &ShopProfile,
        bill_number: &str,
        date: NaiveDate,
        customer: CustomerInfo,
        lines: Vec<InvoiceLine>,
        totals: Totals,
        include_gst: bool,
        gst_rate: Decimal,
    ) -> Self {
        Self {
            shop: shop.clone(),
            bill_number: bill_number.to_string(),
            date,
            customer,
            lines,
            totals,
            include_gst,
            gst_rate,
            logo: shop.logo.as_deref().map(ImageSource::parse),
            qr_code: shop.qr_code.as_deref().map(ImageSource::parse),
        }
    }

    pub fn file_name(&self) -> String {
        artifact_file_name(&self.customer.name, &self.bill_number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDocument {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// A file placed next to the markup so the template can reference it by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub name: String,
    pub bytes: Vec<u8>,
}

// ==========================================
// Seams
// ==========================================

#[derive(Debug, Error)]
pub enum ImageLoadError {
    #[error("could not read image: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not fetch image: {0}")]
    Http(#[from] reqwest::Error),

    #[error("image is empty")]
    Empty,
}

#[async_trait]
pub trait ImageLoader: Send + Sync {
    async fn load(&self, source: &ImageSource) -> Result<Vec<u8>, ImageLoadError>;
}

#[async_trait]
pub trait PdfEngine: Send + Sync {
    async fn compile(&self, markup: &str, assets: &[Asset]) -> Result<Vec<u8>, DocumentRenderError>;
}

/// What the share pipeline needs from a renderer.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn render(&self, view: &InvoiceView) -> Result<RenderedDocument, DocumentRenderError>;
}

#[async_trait]
impl<T: DocumentSource + ?Sized> DocumentSource for std::sync::Arc<T> {
    async fn render(&self, view: &InvoiceView) -> Result<RenderedDocument, DocumentRenderError> {
        (**self).render(view).await
    }
}

/// Reads local files with tokio and fetches URLs with reqwest.
pub struct DefaultImageLoader {
    client: reqwest::Client,
}

impl DefaultImageLoader {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self { client: reqwest::Client::builder().timeout(timeout).build()? })
    }
}

#[async_trait]
impl ImageLoader for DefaultImageLoader {
    async fn load(&self, source: &ImageSource) -> Result<Vec<u8>, ImageLoadError> {
        let bytes = match source {
            ImageSource::Path(path) => tokio::fs::read(path).await?,
            ImageSource::Url(url) => self.client.get(url).send().await?.error_for_status()?.bytes().await?.to_vec(),
        };
        if bytes.is_empty() {
            return Err(ImageLoadError::Empty);
        }
        Ok(bytes)
    }
}

/// Compiles with the `typst` CLI in a scratch directory.
pub struct TypstEngine {
    binary: PathBuf,
}

impl Default for TypstEngine {
    fn default() -> Self {
        Self { binary: PathBuf::from("typst") }
    }
}

impl TypstEngine {
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }
}

#[async_trait]
impl PdfEngine for TypstEngine {
    async fn compile(&self, markup: &str, assets: &[Asset]) -> Result<Vec<u8>, DocumentRenderError> {
        let dir = tempfile::tempdir()?;
        for asset in assets {
            tokio::fs::write(dir.path().join(&asset.name), &asset.bytes).await?;
        }
        let typ_path = dir.path().join("invoice.typ");
        let pdf_path = dir.path().join("invoice.pdf");
        tokio::fs::write(&typ_path, markup).await?;

        debug!(binary = %self.binary.display(), "compiling invoice");
        let output = tokio::process::Command::new(&self.binary)
            .arg("compile")
            .arg("--root")
            .arg(dir.path())
            .arg(&typ_path)
            .arg(&pdf_path)
            .output()
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    DocumentRenderError::EngineUnavailable(format!("'{}' is not installed", self.binary.display()))
                }
                _ => DocumentRenderError::EngineUnavailable(err.to_string()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(DocumentRenderError::Compile(stderr));
        }
        Ok(tokio::fs::read(&pdf_path).await?)
    }
}

// ==========================================
// Renderer
// ==========================================

pub struct DocumentRenderer<E, L> {
    tera: Tera,
    engine: E,
    images: L,
    image_timeout: Duration,
}

impl<E: PdfEngine, L: ImageLoader> DocumentRenderer<E, L> {
    pub fn new(engine: E, images: L) -> Result<Self, DocumentRenderError> {
        let mut tera = Tera::default();
        tera.register_filter("typst_str", typst_str_filter);
        tera.register_filter("money", money_filter);
        tera.add_raw_template(TEMPLATE_NAME, DEFAULT_TEMPLATE)?;
        Ok(Self { tera, engine, images, image_timeout: Duration::from_secs(10) })
    }

    pub fn with_image_timeout(mut self, timeout: Duration) -> Self {
        self.image_timeout = timeout;
        self
    }

    /// Replaces the built-in template when `path` exists.
    pub fn with_template_override(mut self, path: &Path) -> Result<Self, DocumentRenderError> {
        if path.exists() {
            let template = std::fs::read_to_string(path)?;
            self.tera.add_raw_template(TEMPLATE_NAME, &template)?;
            info!(path = %path.display(), "using custom invoice template");
        }
        Ok(self)
    }

    /// Loads every referenced image concurrently. Returns only the ones that arrived.
    async fn settle_images(&self, view: &InvoiceView) -> Vec<(&'static str, Asset)> {
        let slots = [("logo", view.logo.as_ref()), ("qr_code", view.qr_code.as_ref())];
        let loads = slots.into_iter().filter_map(|(slot, source)| source.map(|s| (slot, s))).map(
            |(slot, source)| async move {
                match tokio::time::timeout(self.image_timeout, self.images.load(source)).await {
                    Ok(Ok(bytes)) => Some((slot, Asset { name: format!("{slot}.{}", source.extension()), bytes })),
                    Ok(Err(err)) => {
                        warn!(slot, ?source, error = %err, "image failed to load, leaving it out");
                        None
                    }
                    Err(_) => {
                        warn!(slot, ?source, timeout = ?self.image_timeout, "image timed out, leaving it out");
                        None
                    }
                }
            },
        );
        join_all(loads).await.into_iter().flatten().collect()
    }

    /// The Typst markup plus the assets it references.
    pub async fn markup(&self, view: &InvoiceView) -> Result<(String, Vec<Asset>), DocumentRenderError> {
        if view.lines.is_empty() {
            return Err(DocumentRenderError::EmptyDocument);
        }
        let images = self.settle_images(view).await;
        let asset_name = |slot: &str| images.iter().find(|(s, _)| *s == slot).map(|(_, a)| a.name.clone());

        let context = InvoiceContext {
            title: format!("Invoice {} - {}", view.bill_number, view.customer.name.trim()),
            bill_number: &view.bill_number,
            date: view.date.format(DATE_FORMAT).to_string(),
            shop: &view.shop,
            customer: &view.customer,
            items: &view.lines,
            subtotal: view.totals.subtotal,
            gst_amount: view.totals.tax,
            total: view.totals.grand_total,
            include_gst: view.include_gst,
            gst_percent: calc::format_percent(view.gst_rate),
            logo: asset_name("logo"),
            qr_code: asset_name("qr_code"),
        };
        let markup = self.tera.render(TEMPLATE_NAME, &Context::from_serialize(&context)?)?;
        Ok((markup, images.into_iter().map(|(_, asset)| asset).collect()))
    }

    /// Renders to a file in `dir`. The file only appears once it is complete.
    pub async fn save(&self, view: &InvoiceView, dir: &Path) -> Result<PathBuf, DocumentRenderError> {
        let document = self.render(view).await?;
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&document.bytes)?;
        let target = dir.join(&document.file_name);
        tmp.persist(&target).map_err(|err| err.error)?;
        info!(path = %target.display(), "invoice saved");
        Ok(target)
    }

    /// Saves into `spool_dir` and hands the file to the system print command.
    pub async fn print(&self, view: &InvoiceView, spool_dir: &Path) -> Result<PathBuf, DocumentRenderError> {
        let path = self.save(view, spool_dir).await?;
        desktop::print_file(&path).await?;
        Ok(path)
    }
}

#[async_trait]
impl<E: PdfEngine, L: ImageLoader> DocumentSource for DocumentRenderer<E, L> {
    async fn render(&self, view: &InvoiceView) -> Result<RenderedDocument, DocumentRenderError> {
        let (markup, assets) = self.markup(view).await?;
        let bytes = self.engine.compile(&markup, &assets).await?;
        if bytes.is_empty() {
            return Err(DocumentRenderError::EmptyOutput);
        }
        let file_name = view.file_name();
        info!(bill_number = %view.bill_number, %file_name, size = bytes.len(), "invoice rendered");
        Ok(RenderedDocument { file_name, bytes })
    }
}

// ==========================================
// Template filters
// ==========================================

/// Escapes a value for use inside a Typst string literal.
pub fn typst_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

fn typst_str_filter(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    Ok(Value::String(typst_escape(&text)))
}

fn money_filter(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    let amount: Decimal = match value {
        Value::String(s) => s.parse::<Decimal>(),
        Value::Number(n) => n.to_string().parse::<Decimal>(),
        other => return Err(tera::Error::msg(format!("money filter expects a number, got {other}"))),
    }
    .map_err(|err| tera::Error::msg(format!("not an amount: {err}")))?;
    Ok(Value::String(calc::format_currency(amount)))
}
