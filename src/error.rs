//! Failure taxonomy for the billing pipelines.
//!
//! Every failure that reaches an action handler is turned into a [`Notice`]
//! (title + detail) for the operator. User cancellation and the manual
//! install fallback are outcomes, not errors, and never appear here.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;

/// User-correctable gap in the input. Blocks the action before any work starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct MissingInfo(pub String);

#[derive(Debug, Error)]
pub enum DocumentRenderError {
    #[error("invoice has no named line items")]
    EmptyDocument,

    #[error("template error: {0}")]
    Template(String),

    #[error("PDF engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("PDF compilation failed: {0}")]
    Compile(String),

    #[error("PDF engine produced an empty document")]
    EmptyOutput,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tera::Error> for DocumentRenderError {
    fn from(err: tera::Error) -> Self {
        DocumentRenderError::Template(error_chain(&err))
    }
}

#[derive(Debug, Error)]
#[error("upload of {file_name} failed: {detail}")]
pub struct ArtifactUploadError {
    pub file_name: String,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum BillSaveError {
    #[error("could not save bill header: {0}")]
    Header(#[source] BackendError),

    #[error("backend returned no bill header row")]
    MissingHeader,

    #[error("could not save bill items ({}): {source}", compensation_label(.compensated))]
    Items {
        #[source]
        source: BackendError,
        /// Whether the compensating header delete went through.
        compensated: bool,
    },
}

fn compensation_label(compensated: &bool) -> &'static str {
    if *compensated { "bill header rolled back" } else { "bill header left without items" }
}

#[derive(Debug, Error)]
pub enum ShareError {
    #[error(transparent)]
    MissingInfo(#[from] MissingInfo),

    #[error(transparent)]
    Render(#[from] DocumentRenderError),

    #[error(transparent)]
    Upload(#[from] ArtifactUploadError),

    #[error("could not open share target: {0}")]
    Dispatch(String),

    #[error("{step} timed out after {after:?}")]
    Timeout { step: &'static str, after: Duration },

    #[error("a share for bill {0} is already in progress")]
    InFlight(String),
}

impl ShareError {
    pub fn notice(&self) -> Notice {
        let title = match self {
            ShareError::MissingInfo(_) => "Missing Information",
            ShareError::Render(_) => "Could not generate PDF",
            ShareError::Upload(_) => "Upload failed",
            ShareError::Dispatch(_) => "Could not open WhatsApp",
            ShareError::Timeout { .. } => "Timed out",
            ShareError::InFlight(_) => "Share already in progress",
        };
        Notice::new(title, error_chain(self))
    }
}

impl BillSaveError {
    pub fn notice(&self) -> Notice {
        Notice::new("Failed to save bill", error_chain(self))
    }
}

/// What the operator sees for a finished action: a short title plus the
/// underlying detail, backend messages included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub detail: String,
}

impl Notice {
    pub fn new(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { title: title.into(), detail: detail.into() }
    }

    pub fn from_error(title: impl Into<String>, err: &(dyn StdError + 'static)) -> Self {
        Self::new(title, error_chain(err))
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.title)
        } else {
            write!(f, "{}: {}", self.title, self.detail)
        }
    }
}

/// `outer: inner: root`, skipping sources already contained in the outer text.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}
