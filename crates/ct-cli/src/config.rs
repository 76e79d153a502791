//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};

use ct_core::LegacyShutdownDiscount;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,
    /// Path to the JSON price catalog.
    pub catalog_path: PathBuf,
    /// Discount applied when the catalog carries no rules.
    #[serde(default)]
    pub legacy_discount: LegacyShutdownDiscount,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("catalog_path", &self.catalog_path)
            .field("legacy_discount", &self.legacy_discount)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("costctl.db"),
            catalog_path: data_dir.join("pricing.json"),
            legacy_discount: LegacyShutdownDiscount::default(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // COSTCTL_LEGACY_DISCOUNT__PERCENT=50 sets legacy_discount.percent
        figment = figment.merge(Env::prefixed("COSTCTL_").split("__"));

        figment.extract()
    }
}

/// Returns the platform-specific config directory for costctl.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("costctl"))
}

/// Returns the platform-specific data directory for costctl.
///
/// On Linux: `~/.local/share/costctl`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("costctl"))
}
