//! Share Dispatcher: render -> (attach | upload) -> dispatch.
//!
//! One linear async pass per invocation. Every state entered is recorded in
//! the returned [`ShareReport`], so a caller (or a test) can see exactly how
//! far a share got. Shares are keyed by bill number: a second share for the
//! same bill while one is running is rejected without rendering.
//!
//! A document whose upload failed is kept for the next share of that bill
//! number, together with the view it was rendered from. Bill numbers can
//! collide and drafts keep changing, so it is only reused for an identical
//! view; anything else renders afresh.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::artifact::ArtifactStore;
use crate::error::{MissingInfo, Notice, ShareError, error_chain};
use crate::phone::{self, DEFAULT_COUNTRY_CODE};
use crate::render::{DocumentSource, InvoiceView, RenderedDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareState {
    Idle,
    Rendering,
    Uploading,
    Attaching,
    Dispatching,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareOutcome {
    /// The native share sheet accepted the file.
    Shared,
    /// The user closed the share sheet. Not an error.
    Cancelled,
    /// The document was uploaded and the messaging deep link opened.
    LinkOpened { document_url: String, deep_link: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharePayload {
    pub title: String,
    pub text: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeShareResult {
    Shared,
    Cancelled,
    /// The platform refused this payload shape; the link route is used instead.
    Unsupported(String),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct DispatchError(pub String);

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        DispatchError(err.to_string())
    }
}

/// The host environment's ways of handing something to another app.
#[async_trait]
pub trait ShareTarget: Send + Sync {
    fn supports_file_share(&self) -> bool;
    async fn share_files(&self, payload: SharePayload) -> Result<NativeShareResult, DispatchError>;
    /// Opens a URL in a new browsing context. Nothing is read back.
    async fn open_url(&self, url: &str) -> Result<(), DispatchError>;
}

#[async_trait]
impl<T: ShareTarget + ?Sized> ShareTarget for std::sync::Arc<T> {
    fn supports_file_share(&self) -> bool {
        (**self).supports_file_share()
    }
    async fn share_files(&self, payload: SharePayload) -> Result<NativeShareResult, DispatchError> {
        (**self).share_files(payload).await
    }
    async fn open_url(&self, url: &str) -> Result<(), DispatchError> {
        (**self).open_url(url).await
    }
}

#[derive(Debug)]
pub struct ShareReport {
    pub bill_number: String,
    pub transitions: Vec<ShareState>,
    pub result: Result<ShareOutcome, ShareError>,
}

impl ShareReport {
    pub fn final_state(&self) -> ShareState {
        self.transitions.last().copied().unwrap_or(ShareState::Idle)
    }

    /// The toast for a failed share. Cancellation and success have none.
    pub fn notice(&self) -> Option<Notice> {
        self.result.as_ref().err().map(ShareError::notice)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ShareTimeouts {
    pub render: Duration,
    pub upload: Duration,
}

impl Default for ShareTimeouts {
    fn default() -> Self {
        Self { render: Duration::from_secs(30), upload: Duration::from_secs(30) }
    }
}

pub struct ShareDispatcher<R, A, T> {
    renderer: R,
    artifacts: A,
    target: T,
    country_code: String,
    timeouts: ShareTimeouts,
    in_flight: DashMap<String, ()>,
    /// Documents whose upload failed, with the view each was rendered from.
    retained: DashMap<String, Retained>,
}

struct Retained {
    view: InvoiceView,
    document: RenderedDocument,
}

/// Clears the in-flight mark however the share ends.
struct InFlightGuard<'a> {
    map: &'a DashMap<String, ()>,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

impl<R: DocumentSource, A: ArtifactStore, T: ShareTarget> ShareDispatcher<R, A, T> {
    pub fn new(renderer: R, artifacts: A, target: T) -> Self {
        Self {
            renderer,
            artifacts,
            target,
            country_code: DEFAULT_COUNTRY_CODE.to_string(),
            timeouts: ShareTimeouts::default(),
            in_flight: DashMap::new(),
            retained: DashMap::new(),
        }
    }

    pub fn with_country_code(mut self, country_code: impl Into<String>) -> Self {
        self.country_code = country_code.into();
        self
    }

    pub fn with_timeouts(mut self, timeouts: ShareTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn is_in_flight(&self, bill_number: &str) -> bool {
        self.in_flight.contains_key(bill_number)
    }

    pub fn has_retained_document(&self, bill_number: &str) -> bool {
        self.retained.contains_key(bill_number)
    }

    pub async fn share(&self, view: &InvoiceView) -> ShareReport {
        let mut transitions = vec![ShareState::Idle];
        let bill_number = view.bill_number.clone();

        let result = match self.begin(view) {
            Ok(_guard) => self.run(view, &mut transitions).await,
            Err(err) => Err(err),
        };

        match &result {
            Ok(outcome) => {
                info!(%bill_number, ?outcome, "share finished");
                transitions.push(ShareState::Done);
            }
            Err(err) => {
                warn!(%bill_number, error = %error_chain(err), "share failed");
                transitions.push(ShareState::Failed);
            }
        }
        ShareReport { bill_number, transitions, result }
    }

    fn begin(&self, view: &InvoiceView) -> Result<InFlightGuard<'_>, ShareError> {
        if view.customer.name.trim().is_empty() || view.customer.phone.trim().is_empty() {
            return Err(MissingInfo("Please fill in customer name and phone number".into()).into());
        }
        match self.in_flight.entry(view.bill_number.clone()) {
            Entry::Occupied(_) => Err(ShareError::InFlight(view.bill_number.clone())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(InFlightGuard { map: &self.in_flight, key: view.bill_number.clone() })
            }
        }
    }

    /// Takes the retained document for this bill number if it was rendered
    /// from exactly this view. A stale one is discarded.
    fn take_retained(&self, view: &InvoiceView) -> Option<RenderedDocument> {
        let (_, retained) = self.retained.remove(&view.bill_number)?;
        if retained.view == *view {
            debug!(bill_number = %view.bill_number, "reusing rendered document");
            Some(retained.document)
        } else {
            debug!(bill_number = %view.bill_number, "invoice changed since the failed upload, rendering again");
            None
        }
    }

    async fn run(
        &self,
        view: &InvoiceView,
        transitions: &mut Vec<ShareState>,
    ) -> Result<ShareOutcome, ShareError> {
        let document = match self.take_retained(view) {
            Some(document) => document,
            None => {
                transitions.push(ShareState::Rendering);
                tokio::time::timeout(self.timeouts.render, self.renderer.render(view))
                    .await
                    .map_err(|_| ShareError::Timeout { step: "render", after: self.timeouts.render })??
            }
        };

        let total = view.totals.grand_total;
        if self.target.supports_file_share() {
            transitions.push(ShareState::Attaching);
            let payload = SharePayload {
                title: format!("Invoice for {}", view.customer.name.trim()),
                text: phone::compose_share_text(&view.customer.name, total),
                file_name: document.file_name.clone(),
                bytes: document.bytes.clone(),
            };
            transitions.push(ShareState::Dispatching);
            match self.target.share_files(payload).await {
                Ok(NativeShareResult::Shared) => return Ok(ShareOutcome::Shared),
                Ok(NativeShareResult::Cancelled) => return Ok(ShareOutcome::Cancelled),
                Ok(NativeShareResult::Unsupported(reason)) => {
                    warn!(%reason, "file share refused, sharing a link instead");
                }
                Err(err) => return Err(ShareError::Dispatch(err.to_string())),
            }
        }

        self.upload_and_link(view, document, total, transitions).await
    }

    async fn upload_and_link(
        &self,
        view: &InvoiceView,
        document: RenderedDocument,
        total: Decimal,
        transitions: &mut Vec<ShareState>,
    ) -> Result<ShareOutcome, ShareError> {
        transitions.push(ShareState::Uploading);
        let uploaded = tokio::time::timeout(
            self.timeouts.upload,
            self.artifacts.upload(document.bytes.clone(), &document.file_name),
        )
        .await;
        let failure: ShareError = match uploaded {
            Ok(Ok(url)) => return self.open_link(view, url, total, transitions).await,
            Ok(Err(err)) => err.into(),
            Err(_) => ShareError::Timeout { step: "upload", after: self.timeouts.upload },
        };
        self.retained.insert(view.bill_number.clone(), Retained { view: view.clone(), document });
        Err(failure)
    }

    async fn open_link(
        &self,
        view: &InvoiceView,
        document_url: String,
        total: Decimal,
        transitions: &mut Vec<ShareState>,
    ) -> Result<ShareOutcome, ShareError> {
        let message = phone::compose_message(&view.customer.name, total, &document_url);
        let dial = phone::normalize_phone_with(&view.customer.phone, &self.country_code);
        let deep_link = phone::build_deep_link(&dial, &message);

        transitions.push(ShareState::Dispatching);
        self.target
            .open_url(&deep_link)
            .await
            .map_err(|err| ShareError::Dispatch(err.to_string()))?;
        Ok(ShareOutcome::LinkOpened { document_url, deep_link })
    }
}
