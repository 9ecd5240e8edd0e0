//! Settings (where the data folder lives) and the per-shop configuration
//! kept inside it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::{BaseDirs, ProjectDirs};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use slug::slugify;
use thiserror::Error;
use tracing::info;

use crate::calc::TAX_RATE;
use crate::install::InstallPolicy;
use crate::model::ShopProfile;
use crate::offline::DEFAULT_CACHE_NAME;
use crate::phone::DEFAULT_COUNTRY_CODE;
use crate::share::ShareTimeouts;

pub const DEFAULT_SHOP_CONFIG: &str = include_str!("../shop.toml");
pub const DEFAULT_DATA_ROOT: &str = "~/Documents/Business";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("could not encode settings: {0}")]
    Encode(#[from] toml::ser::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io { path: path.to_path_buf(), source }
}

// ==========================================
// App settings
// ==========================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppSettings {
    pub data_root: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self { data_root: DEFAULT_DATA_ROOT.to_string() }
    }
}

impl AppSettings {
    pub fn root(&self) -> PathBuf {
        PathBuf::from(expand_home_dir(&self.data_root))
    }
}

fn config_dir() -> PathBuf {
    match ProjectDirs::from("in", "anand-cycle", "cycle-billing") {
        Some(dirs) => dirs.config_dir().to_path_buf(),
        None => PathBuf::from("."),
    }
}

pub fn get_config_path() -> PathBuf {
    config_dir().join("settings.toml")
}

/// Persisted install/chat state lives next to the settings.
pub fn state_file_path() -> PathBuf {
    config_dir().join("state.toml")
}

pub fn load_settings() -> Option<AppSettings> {
    let content = fs::read_to_string(get_config_path()).ok()?;
    toml::from_str(&content).ok()
}

pub fn save_settings(settings: &AppSettings) -> Result<PathBuf, ConfigError> {
    let path = get_config_path();
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(io_error(dir))?;
    }
    fs::write(&path, toml::to_string_pretty(settings)?).map_err(io_error(&path))?;
    Ok(path)
}

pub fn expand_home_dir(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(base_dirs) = BaseDirs::new() {
            let home = base_dirs.home_dir().to_string_lossy();
            return path.replacen('~', &home, 1);
        }
    }
    path.to_string()
}

// ==========================================
// Shop configuration
// ==========================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BillingConfig {
    #[serde(default = "default_gst_rate")]
    pub gst_rate: Decimal,
    #[serde(default = "default_country_code")]
    pub country_code: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self { gst_rate: default_gst_rate(), country_code: default_country_code() }
    }
}

fn default_gst_rate() -> Decimal {
    TAX_RATE
}

fn default_country_code() -> String {
    DEFAULT_COUNTRY_CODE.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub anon_key: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { url: String::new(), anon_key: String::new(), bucket: default_bucket() }
    }
}

impl BackendConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.trim().is_empty() && !self.anon_key.trim().is_empty()
    }
}

fn default_bucket() -> String {
    "bills".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub render_secs: u64,
    pub upload_secs: u64,
    pub image_secs: u64,
    pub backend_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { render_secs: 30, upload_secs: 30, image_secs: 10, backend_secs: 20 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InstallConfig {
    pub prompt_delay_secs: i64,
    pub dismiss_cooldown_hours: i64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self { prompt_delay_secs: 3, dismiss_cooldown_hours: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfflineConfig {
    #[serde(default = "default_cache_name")]
    pub cache_name: String,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self { cache_name: default_cache_name() }
    }
}

fn default_cache_name() -> String {
    DEFAULT_CACHE_NAME.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShopConfig {
    pub shop: ShopProfile,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub offline: OfflineConfig,
}

impl ShopConfig {
    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Reads `<root>/shop.toml`, writing the default first if there is none.
    /// Backend credentials from the environment win over the file.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join("shop.toml");
        let content = if path.exists() {
            fs::read_to_string(&path).map_err(io_error(&path))?
        } else {
            info!(path = %path.display(), "initializing default shop configuration");
            fs::create_dir_all(root).map_err(io_error(root))?;
            fs::write(&path, DEFAULT_SHOP_CONFIG).map_err(io_error(&path))?;
            DEFAULT_SHOP_CONFIG.to_string()
        };
        let mut config = Self::parse(&content, &path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.resolve_paths(root);
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("SUPABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.backend.url = url;
        }
        if let Some(key) = lookup("SUPABASE_ANON_KEY").filter(|v| !v.trim().is_empty()) {
            self.backend.anon_key = key;
        }
    }

    /// Relative image paths are relative to the data folder.
    fn resolve_paths(&mut self, root: &Path) {
        for image in [&mut self.shop.logo, &mut self.shop.qr_code].into_iter().flatten() {
            let is_url = image.starts_with("http://") || image.starts_with("https://");
            if !is_url && Path::new(image.as_str()).is_relative() {
                *image = root.join(image.as_str()).to_string_lossy().into_owned();
            }
        }
    }

    pub fn install_policy(&self) -> InstallPolicy {
        InstallPolicy {
            prompt_delay: chrono::Duration::seconds(self.install.prompt_delay_secs),
            dismiss_cooldown: chrono::Duration::hours(self.install.dismiss_cooldown_hours),
        }
    }

    pub fn share_timeouts(&self) -> ShareTimeouts {
        ShareTimeouts {
            render: Duration::from_secs(self.timeouts.render_secs),
            upload: Duration::from_secs(self.timeouts.upload_secs),
        }
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.image_secs)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.backend_secs)
    }
}

/// `<root>/templates/invoice.tera`, used instead of the built-in template when present.
pub fn template_override_path(root: &Path) -> PathBuf {
    root.join("templates").join("invoice.tera")
}

/// `<root>/output/<year>/<customer-slug>/`
pub fn output_dir(root: &Path, year: i32, customer_name: &str) -> PathBuf {
    let slug = slugify(customer_name.trim());
    let slug = if slug.is_empty() { "customer".to_string() } else { slug };
    root.join("output").join(year.to_string()).join(slug)
}
