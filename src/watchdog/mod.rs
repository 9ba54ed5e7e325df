//! Scan watchdogs: concurrent monitors that arbitrate pause/resume/seek.
//!
//! A watchdog observes one external condition (a topup countdown, a boolean
//! expression over beamline readings) and, when the condition turns unsafe,
//! demands that the running scan be suspended. Several watchdogs supervise
//! one scan at a time; their demands are combined by a shared
//! [`DeviceController`] with an asymmetric quorum:
//!
//! - **any** single watchdog can pause the scan (fail-safe default), but
//! - **every** watchdog must agree before the scan resumes.
//!
//! # Architecture
//!
//! ```text
//! WatchdogRegistry --(per scan)--> DeviceController <--votes-- Watchdog tasks
//!                                        |                        ^
//!                                   PausableDevice        PositionEvent streams
//! ```
//!
//! Templates are registered once at startup in the [`WatchdogRegistry`]; each
//! scan gets a fresh controller and a fresh watchdog instance per enabled
//! template, so no arbitration state leaks between scans.
//!
//! # Lifecycle
//!
//! Each watchdog instance moves Inactive → Active on the scan-start hook and
//! back on the scan-end hook (which fires exactly once regardless of how the
//! scan finished). Activation failures that indicate a genuine precondition
//! violation propagate and prevent the scan from starting; everything that
//! goes wrong during steady-state monitoring is logged and swallowed so one
//! misbehaving watchdog cannot take down a healthy scan.

pub mod controller;
pub mod expression;
pub mod registry;
pub mod topup;

pub use controller::{DeviceController, Vote};
pub use expression::ExpressionWatchdog;
pub use registry::{
    ExpressionConfig, TopupConfig, WatchdogConfig, WatchdogRegistry, WatchdogTemplate,
};
pub use topup::TopupWatchdog;

use crate::error::GuardResult;
use async_trait::async_trait;

/// Scan step number used by lifecycle hooks and seek requests.
pub type StepNumber = u64;

/// Lifecycle contract shared by all watchdog kinds.
///
/// Instances are created per scan by the registry, bound to one controller
/// for their whole life, and discarded when the scan ends.
#[async_trait]
pub trait Watchdog: Send + Sync {
    /// The template name this instance was built from.
    fn name(&self) -> &str;

    /// Arbitration key. Kind-derived; for expression watchdogs it includes
    /// the expression text, so two instances with different expressions are
    /// distinct voters.
    fn id(&self) -> &str;

    /// True while the scan this instance supervises is running.
    fn is_active(&self) -> bool;

    /// Scan-start hook: validate preconditions, take an initial reading,
    /// subscribe to sensor updates. Errors here are fatal and must prevent
    /// the scan from starting.
    async fn scan_started(&self, first_step: StepNumber) -> GuardResult<()>;

    /// Fired after every completed scan point; records the most recent
    /// known-good position for later seeks.
    async fn point_completed(&self, step: StepNumber);

    /// Scan-end hook, fired exactly once whether the scan succeeded, failed,
    /// or was aborted: unsubscribe and release transient state.
    async fn scan_ended(&self);
}
