//! Configuration loading and validation.
//!
//! Settings come from a Figment provider chain: built-in defaults, then an
//! optional TOML file, then `SCANGUARD_`-prefixed environment variables.
//! Watchdog templates are declared as a `kind`-tagged table array:
//!
//! ```toml
//! [watchdogs]
//! active = true
//!
//! [[watchdogs.templates]]
//! name = "topup"
//! kind = "topup"
//! countdown = "topup_countdown"
//! cooloff_ms = 4000
//! warmup_ms = 5000
//! period_ms = 600000
//! topup_time_ms = 15000
//!
//! [[watchdogs.templates]]
//! name = "beam"
//! kind = "expression"
//! expression = "beam_current > 190.0 && shutter_open"
//! message = "Beam unavailable"
//! restore = ["sample_x"]
//! ```
//!
//! Parsing and semantic validation are separate steps: Figment reports
//! format problems, [`Settings::validate`] reports values that parse but are
//! logically wrong (an empty expression, a topup window with no room in it).

use crate::condition::TopupWindow;
use crate::error::{GuardError, GuardResult};
use crate::scannable::{Positioner, ScannableRegistry};
use crate::watchdog::{WatchdogConfig, WatchdogRegistry, WatchdogTemplate};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "scanguard.toml";

/// Top-level settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Watchdog supervision settings
    #[serde(default)]
    pub watchdogs: WatchdogSettings,
}

/// The `[watchdogs]` section.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchdogSettings {
    /// Process-wide kill switch; off means every scan runs unsupervised
    #[serde(default = "default_active")]
    pub active: bool,
    /// Watchdog template declarations, in file order
    #[serde(default)]
    pub templates: Vec<TemplateSettings>,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            active: true,
            templates: Vec::new(),
        }
    }
}

fn default_active() -> bool {
    true
}

fn default_enabled() -> bool {
    true
}

/// One `[[watchdogs.templates]]` entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemplateSettings {
    /// Unique template name
    pub name: String,
    /// Disabled templates stay registered but are never instantiated
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Kind-specific fields, selected by `kind`
    #[serde(flatten)]
    pub config: WatchdogConfig,
}

impl Settings {
    /// Load settings from defaults, an optional TOML file, and environment
    /// overrides. A missing file is not an error; a malformed one is.
    pub fn load(path: Option<&Path>) -> GuardResult<Self> {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("SCANGUARD_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation of values that parsed cleanly.
    pub fn validate(&self) -> GuardResult<()> {
        for template in &self.watchdogs.templates {
            if template.name.trim().is_empty() {
                return Err(GuardError::Configuration(
                    "watchdog template with an empty name".to_string(),
                ));
            }
            match &template.config {
                WatchdogConfig::Topup(cfg) => {
                    if cfg.countdown.trim().is_empty() {
                        return Err(GuardError::Configuration(format!(
                            "watchdog '{}': no countdown scannable",
                            template.name
                        )));
                    }
                    TopupWindow {
                        cooloff_ms: cfg.cooloff_ms,
                        warmup_ms: cfg.warmup_ms,
                        period_ms: cfg.period_ms,
                        topup_time_ms: cfg.topup_time_ms,
                    }
                    .validate()
                    .map_err(|e| {
                        GuardError::Configuration(format!(
                            "watchdog '{}': {}",
                            template.name, e
                        ))
                    })?;
                }
                WatchdogConfig::Expression(cfg) => {
                    if cfg.expression.trim().is_empty() {
                        return Err(GuardError::Configuration(format!(
                            "watchdog '{}': empty expression",
                            template.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Build a [`WatchdogRegistry`] holding every declared template.
    ///
    /// Duplicate template names surface here as
    /// [`GuardError::DuplicateWatchdog`].
    pub fn build_registry(
        &self,
        scannables: Arc<ScannableRegistry>,
        positioner: Arc<dyn Positioner>,
    ) -> GuardResult<WatchdogRegistry> {
        let registry = WatchdogRegistry::new(self.watchdogs.active, scannables, positioner);
        for template in &self.watchdogs.templates {
            registry.register(WatchdogTemplate {
                name: template.name.clone(),
                enabled: template.enabled,
                config: template.config.clone(),
            })?;
        }
        Ok(registry)
    }
}
