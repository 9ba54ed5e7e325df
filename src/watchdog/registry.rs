//! Watchdog templates and the per-scan factory.
//!
//! Templates are registered once at startup (usually from configuration, see
//! [`crate::config`]) and never bound to a scan themselves. For each new scan
//! the registry builds one fresh [`DeviceController`] plus one watchdog
//! instance per enabled template. Monitoring is defense-in-depth, not a scan
//! precondition: a template that cannot be instantiated is skipped with a
//! logged error, and if supervision cannot be created at all the scan simply
//! runs unsupervised.

use crate::device::{PausableDevice, ScanStatus};
use crate::error::{GuardError, GuardResult};
use crate::scannable::{Positioner, ScannableRegistry};
use crate::watchdog::controller::DeviceController;
use crate::watchdog::expression::ExpressionWatchdog;
use crate::watchdog::topup::TopupWatchdog;
use crate::watchdog::Watchdog;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Configuration for the periodic-interruption (topup) watchdog.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopupConfig {
    /// Scannable giving milliseconds until the next interruption
    pub countdown: String,
    /// Minimum buffer after an interruption ends before resuming (ms)
    pub cooloff_ms: i64,
    /// Minimum buffer before the next interruption begins (ms)
    pub warmup_ms: i64,
    /// Recurrence interval of the interruption (ms)
    pub period_ms: i64,
    /// Maximum duration of the interruption itself (ms)
    pub topup_time_ms: i64,
    /// Scannable whose value must read "Normal" at scan start, if set
    #[serde(default)]
    pub machine_mode: Option<String>,
}

/// Configuration for the expression watchdog.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExpressionConfig {
    /// Boolean expression over scannable names as free variables
    pub expression: String,
    /// Human-readable reason surfaced while this watchdog holds a pause
    #[serde(default)]
    pub message: Option<String>,
    /// Scannables whose position is snapshotted at pause and restored at resume
    #[serde(default)]
    pub restore: Vec<String>,
}

/// The closed set of watchdog kinds.
///
/// The kinds are a small, known set, so they are modeled as an enum rather
/// than an open trait-object factory; adding a kind means adding a variant
/// and a `build` arm.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatchdogConfig {
    /// Pause around a recurring machine interruption
    Topup(TopupConfig),
    /// Pause while a boolean expression over live readings is false
    Expression(ExpressionConfig),
}

impl WatchdogConfig {
    /// Build a fresh watchdog instance bound to `controller`.
    ///
    /// The template's configuration is cloned into the instance, so
    /// concurrent scans never share mutable config state.
    pub fn build(
        &self,
        name: &str,
        controller: Arc<DeviceController>,
        scannables: Arc<ScannableRegistry>,
        positioner: Arc<dyn Positioner>,
    ) -> GuardResult<Arc<dyn Watchdog>> {
        match self {
            WatchdogConfig::Topup(cfg) => Ok(Arc::new(TopupWatchdog::new(
                name,
                cfg.clone(),
                controller,
                scannables,
            )?)),
            WatchdogConfig::Expression(cfg) => Ok(Arc::new(ExpressionWatchdog::new(
                name,
                cfg.clone(),
                controller,
                scannables,
                positioner,
            )?)),
        }
    }
}

/// A named, reusable watchdog definition.
#[derive(Clone, Debug)]
pub struct WatchdogTemplate {
    /// Unique template name (process-wide key)
    pub name: String,
    /// Disabled templates are never instantiated for a scan
    pub enabled: bool,
    /// Kind-specific configuration
    pub config: WatchdogConfig,
}

/// Holds watchdog templates and produces the supervision set for each scan.
pub struct WatchdogRegistry {
    /// Process-wide kill switch; when off, scans run unsupervised
    active: AtomicBool,
    /// Registration order is preserved
    templates: Mutex<Vec<WatchdogTemplate>>,
    scannables: Arc<ScannableRegistry>,
    positioner: Arc<dyn Positioner>,
}

impl WatchdogRegistry {
    /// Create a registry.
    ///
    /// `active` is the process-wide supervision switch; it is an explicit
    /// field here rather than an ambient global so tests and deployments can
    /// flip it deliberately.
    pub fn new(
        active: bool,
        scannables: Arc<ScannableRegistry>,
        positioner: Arc<dyn Positioner>,
    ) -> Self {
        Self {
            active: AtomicBool::new(active),
            templates: Mutex::new(Vec::new()),
            scannables,
            positioner,
        }
    }

    /// Whether supervision is enabled at all.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Toggle the process-wide supervision switch.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Register a template. Duplicate names are a fatal configuration error.
    pub fn register(&self, template: WatchdogTemplate) -> GuardResult<()> {
        let mut templates = self
            .templates
            .lock()
            .map_err(|_| GuardError::Configuration("registry lock poisoned".to_string()))?;
        if templates.iter().any(|t| t.name == template.name) {
            return Err(GuardError::DuplicateWatchdog(template.name));
        }
        info!(name = %template.name, "registered watchdog template");
        templates.push(template);
        Ok(())
    }

    /// Remove a template by name. Idempotent.
    pub fn unregister(&self, name: &str) {
        if let Ok(mut templates) = self.templates.lock() {
            templates.retain(|t| t.name != name);
        }
    }

    /// Look up a template by name.
    pub fn get(&self, name: &str) -> Option<WatchdogTemplate> {
        self.templates
            .lock()
            .ok()
            .and_then(|templates| templates.iter().find(|t| t.name == name).cloned())
    }

    /// Names of all registered templates, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.templates
            .lock()
            .map(|templates| templates.iter().map(|t| t.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Enable or disable a registered template. Returns false if unknown.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.templates.lock() {
            Ok(mut templates) => match templates.iter_mut().find(|t| t.name == name) {
                Some(t) => {
                    t.enabled = enabled;
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Produce the supervision set for a new scan, or `None` for an
    /// unsupervised scan.
    ///
    /// `None` is an intentional escape hatch, returned when the kill switch
    /// is off, when no templates are registered, or when creation fails as a
    /// whole. A single template that fails to instantiate is skipped with a
    /// logged error and the scan proceeds with the reduced set.
    pub fn create_for_scan(
        &self,
        device: Arc<dyn PausableDevice>,
        status: Option<ScanStatus>,
    ) -> Option<Arc<DeviceController>> {
        if !self.is_active() {
            info!("watchdog supervision is switched off, scan runs unsupervised");
            return None;
        }
        let templates = match self.templates.lock() {
            Ok(templates) => templates.clone(),
            Err(_) => {
                warn!("watchdog registry lock poisoned, scan runs unsupervised");
                return None;
            }
        };
        if templates.is_empty() {
            return None;
        }

        match self.try_create(device, status, &templates) {
            Ok(controller) => Some(controller),
            Err(e) => {
                warn!("could not create watchdog supervision, scan runs unsupervised: {e}");
                None
            }
        }
    }

    fn try_create(
        &self,
        device: Arc<dyn PausableDevice>,
        status: Option<ScanStatus>,
        templates: &[WatchdogTemplate],
    ) -> GuardResult<Arc<DeviceController>> {
        let controller = Arc::new(DeviceController::new(device, status));

        for template in templates.iter().filter(|t| t.enabled) {
            match template.config.build(
                &template.name,
                controller.clone(),
                self.scannables.clone(),
                self.positioner.clone(),
            ) {
                Ok(watchdog) => {
                    info!(name = %template.name, id = watchdog.id(), "attached watchdog");
                    controller.attach(watchdog);
                }
                Err(e) => {
                    error!(name = %template.name, "skipping watchdog that failed to instantiate: {e}");
                }
            }
        }

        Ok(controller)
    }
}
