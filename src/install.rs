//! When to offer "install this app".
//!
//! ```text
//! Unknown ──startup(standalone)──────────────────────────────► Installed
//!    │ startup                                                    ▲
//!    ▼                                                            │
//! NotInstallable ─offer─► InstallableIdle ─evaluate─► PromptOffered ─accept─► Accepted
//!                                 ▲                        │
//!                                 └──── (cool-down) ◄── Dismissed
//! ```
//!
//! The platform offer handle survives a dismissal so a manual "Install"
//! action still works later. The dismissal time is persisted and blocks
//! automatic re-prompting for the cool-down window.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use async_trait::async_trait;

use crate::state_store::{INSTALL_PROMPT_DISMISSED, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    Unknown,
    NotInstallable,
    InstallableIdle,
    PromptOffered,
    Accepted,
    Dismissed,
    Installed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserChoice {
    Accepted,
    Dismissed,
}

/// The deferred platform install offer.
#[async_trait]
pub trait InstallPrompt: Send + Sync {
    /// Shows the platform install dialog and resolves with the user's choice.
    async fn prompt(&self) -> Result<UserChoice, String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallResult {
    Installed,
    NotInstalled,
    /// No programmatic install available; show these steps instead.
    Instructions(String),
}

#[derive(Debug, Clone, Copy)]
pub struct InstallPolicy {
    pub prompt_delay: Duration,
    pub dismiss_cooldown: Duration,
}

impl Default for InstallPolicy {
    fn default() -> Self {
        Self { prompt_delay: Duration::seconds(3), dismiss_cooldown: Duration::hours(2) }
    }
}

pub struct InstallController<S> {
    store: S,
    policy: InstallPolicy,
    user_agent: String,
    state: InstallState,
    offer: Option<Box<dyn InstallPrompt>>,
    installable_since: Option<DateTime<Utc>>,
}

impl<S: StateStore> InstallController<S> {
    pub fn new(store: S, policy: InstallPolicy, user_agent: impl Into<String>) -> Self {
        Self {
            store,
            policy,
            user_agent: user_agent.into(),
            state: InstallState::Unknown,
            offer: None,
            installable_since: None,
        }
    }

    pub fn state(&self) -> InstallState {
        self.state
    }

    pub fn is_installed(&self) -> bool {
        matches!(self.state, InstallState::Installed | InstallState::Accepted)
    }

    pub fn is_installable(&self) -> bool {
        !self.is_installed() && self.offer.is_some()
    }

    pub fn show_prompt(&self) -> bool {
        self.state == InstallState::PromptOffered
    }

    pub fn last_dismissed_at(&self) -> Option<DateTime<Utc>> {
        self.store.get(&INSTALL_PROMPT_DISMISSED)
    }

    /// Page load: a standalone display mode means we are already installed.
    pub fn startup(&mut self, standalone: bool) {
        if self.state != InstallState::Unknown {
            return;
        }
        self.state = if standalone { InstallState::Installed } else { InstallState::NotInstallable };
    }

    /// The platform says installation is available. Ignored once installed.
    pub fn offer_available(&mut self, handle: Box<dyn InstallPrompt>, now: DateTime<Utc>) {
        if self.is_installed() {
            return;
        }
        info!("install offer captured");
        self.offer = Some(handle);
        if matches!(self.state, InstallState::Unknown | InstallState::NotInstallable) {
            self.state = InstallState::InstallableIdle;
            self.installable_since = Some(now);
        }
    }

    fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.last_dismissed_at()
            .is_some_and(|at| now - at < self.policy.dismiss_cooldown)
    }

    /// Timer tick. Offers the prompt once the delay has passed and no recent
    /// dismissal blocks it. Returns whether the prompt is showing.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> bool {
        let waiting = matches!(self.state, InstallState::InstallableIdle | InstallState::Dismissed);
        let delay_passed = self
            .installable_since
            .is_some_and(|since| now - since >= self.policy.prompt_delay);
        if waiting && self.offer.is_some() && delay_passed && !self.in_cooldown(now) {
            self.state = InstallState::PromptOffered;
        }
        self.show_prompt()
    }

    /// "Later": hides the prompt, keeps the offer, starts the cool-down.
    pub fn dismiss(&mut self, now: DateTime<Utc>) {
        if self.state == InstallState::PromptOffered {
            self.state = InstallState::Dismissed;
        }
        self.record_dismissal(now);
    }

    fn record_dismissal(&self, now: DateTime<Utc>) {
        if let Err(err) = self.store.set(&INSTALL_PROMPT_DISMISSED, &now) {
            warn!(error = %err, "could not persist install prompt dismissal");
        }
    }

    /// Install button. Without a platform offer this only explains how to
    /// install by hand.
    pub async fn install(&mut self, now: DateTime<Utc>) -> InstallResult {
        if self.is_installed() {
            return InstallResult::Installed;
        }
        let Some(handle) = self.offer.take() else {
            return InstallResult::Instructions(manual_instructions(&self.user_agent).to_string());
        };

        match handle.prompt().await {
            Ok(UserChoice::Accepted) => {
                info!("install accepted");
                self.state = InstallState::Accepted;
                InstallResult::Installed
            }
            Ok(UserChoice::Dismissed) => {
                self.offer = Some(handle);
                self.state = InstallState::Dismissed;
                self.record_dismissal(now);
                InstallResult::NotInstalled
            }
            Err(err) => {
                warn!(error = %err, "install prompt failed");
                self.offer = Some(handle);
                InstallResult::NotInstalled
            }
        }
    }

    /// The platform reports the app was installed (by any route).
    pub fn app_installed(&mut self) {
        info!("app installed");
        self.state = InstallState::Installed;
        self.offer = None;
    }
}

pub fn manual_instructions(user_agent: &str) -> &'static str {
    let ua = user_agent.to_lowercase();
    if ua.contains("chrome") && ua.contains("mobile") {
        "To install this app:\n1. Tap the menu button (⋮)\n2. Select \"Add to Home screen\""
    } else if ua.contains("safari") && ua.contains("mobile") {
        "To install this app:\n1. Tap the share button\n2. Select \"Add to Home Screen\""
    } else {
        "To install this app, look for \"Install\" or \"Add to Home Screen\" in your browser menu."
    }
}
