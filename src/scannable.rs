//! The sensor boundary: scannables, position events, and group moves.
//!
//! A [`Scannable`] is anything with a readable position: a motor axis, a ring
//! countdown timer, a machine-mode flag, a beam-current monitor. Watchdogs
//! never poll; they subscribe to a scannable's [`PositionEvent`] broadcast and
//! react to updates delivered on the notification task.
//!
//! # Data Flow
//!
//! ```text
//! Scannable --[PositionEvent]--> broadcast::channel ---> Watchdog monitor tasks
//! ```
//!
//! All traits require `Send + Sync` so handles can be shared across the
//! notification tasks and the scan task.

use crate::error::{GuardError, GuardResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// A scannable's position.
///
/// Most positions are numeric, but some scannables report text (a machine
/// operating mode) or a flag (a shutter). Watchdog expressions can reference
/// any of the three.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PositionValue {
    Float(f64),
    Text(String),
    Flag(bool),
}

impl PositionValue {
    /// Extract as f64 (numeric positions only).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PositionValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Extract as text (textual positions only).
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PositionValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Extract as a flag (boolean positions only).
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            PositionValue::Flag(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for PositionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionValue::Float(v) => write!(f, "{}", v),
            PositionValue::Text(s) => write!(f, "{}", s),
            PositionValue::Flag(b) => write!(f, "{}", b),
        }
    }
}

impl From<f64> for PositionValue {
    fn from(value: f64) -> Self {
        PositionValue::Float(value)
    }
}

impl From<bool> for PositionValue {
    fn from(value: bool) -> Self {
        PositionValue::Flag(value)
    }
}

impl From<&str> for PositionValue {
    fn from(value: &str) -> Self {
        PositionValue::Text(value.to_string())
    }
}

/// Whether an event reports an intermediate position or a completed move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionEventKind {
    /// Position changed while a move is still in flight
    Changed,
    /// A requested move has completed
    Performed,
}

/// A position update from one scannable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PositionEvent {
    /// Name of the scannable that moved
    pub scannable: String,
    /// The new position
    pub value: PositionValue,
    /// Intermediate update or completed move
    pub kind: PositionEventKind,
    /// UTC timestamp when the update was observed
    pub timestamp: DateTime<Utc>,
}

/// A named, position-readable handle with change notifications.
#[async_trait]
pub trait Scannable: Send + Sync {
    /// Unique scannable identifier.
    fn name(&self) -> &str;

    /// Read the current position.
    async fn position(&self) -> GuardResult<PositionValue>;

    /// Move to a target position.
    async fn set_position(&self, target: PositionValue) -> GuardResult<()>;

    /// Subscribe to position updates.
    ///
    /// Not every scannable publishes events; those that do not return
    /// [`GuardError::NotListenable`], which is a fatal scan-start error for
    /// any watchdog that depends on them.
    fn subscribe(&self) -> GuardResult<broadcast::Receiver<PositionEvent>>;
}

/// Moves a set of named scannables to targets, returning once all are done.
///
/// Used by the expression watchdog to restore drifted axes to their
/// pre-pause snapshot before resuming.
#[async_trait]
pub trait Positioner: Send + Sync {
    /// Move each named scannable to its target, blocking until complete.
    async fn move_to(&self, targets: &HashMap<String, PositionValue>) -> GuardResult<()>;
}

/// Name → handle lookup for the scannables available to watchdogs.
///
/// Watchdogs resolve the sensors they monitor by name at scan start; an
/// unresolvable name fails the scan before it begins.
#[derive(Default)]
pub struct ScannableRegistry {
    inner: RwLock<HashMap<String, Arc<dyn Scannable>>>,
}

impl ScannableRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scannable under its own name, replacing any previous entry.
    pub fn register(&self, scannable: Arc<dyn Scannable>) {
        let name = scannable.name().to_string();
        if let Ok(mut map) = self.inner.write() {
            map.insert(name, scannable);
        }
    }

    /// Look up a scannable by name.
    pub fn get(&self, name: &str) -> GuardResult<Arc<dyn Scannable>> {
        self.inner
            .read()
            .ok()
            .and_then(|map| map.get(name).cloned())
            .ok_or_else(|| GuardError::UnknownScannable(name.to_string()))
    }

    /// Names of all registered scannables.
    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }
}
