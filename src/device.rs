//! The controlled-device boundary.
//!
//! The watchdog subsystem never drives hardware directly; it talks to a
//! [`PausableDevice`], the handle onto whatever long-running process (a scan,
//! an acquisition) is being supervised. The real implementation lives in the
//! scan engine; this crate ships a mock in [`crate::mock`] for tests and the
//! demo binary.
//!
//! A device serializes its own physical `pause`/`resume`/`seek`/`abort`
//! operations internally. The arbitration layer only guarantees that vote
//! bookkeeping and the decision to issue a physical call happen atomically.

use crate::error::GuardResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle state of the controlled process.
///
/// Mirrors the state set of a scan device: it rests at `Idle`, is `Armed`
/// once configured, moves between `Running` and `Paused` during execution,
/// and terminates in `Idle`, `Aborted`, or `Fault`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Not configured for a scan
    Idle,
    /// Configured and ready to run
    Armed,
    /// Actively advancing through scan points
    Running,
    /// Suspended (can resume)
    Paused,
    /// Terminated by an abort request
    Aborted,
    /// Terminated by an unrecoverable error
    Fault,
}

impl DeviceState {
    /// True if the device is actively advancing.
    pub fn is_running(self) -> bool {
        self == DeviceState::Running
    }

    /// True if the device is suspended and can be resumed or repositioned.
    pub fn is_paused(self) -> bool {
        self == DeviceState::Paused
    }
}

/// Handle to the controlled process.
///
/// All operations may fail; failures propagate to the caller as
/// [`crate::error::GuardError::Device`]. The monitoring paths in this crate
/// log such failures rather than letting them escape.
#[async_trait]
pub trait PausableDevice: Send + Sync {
    /// Device identifier, used in log output.
    fn name(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> DeviceState;

    /// Suspend execution at the next safe point.
    async fn pause(&self) -> GuardResult<()>;

    /// Continue execution from where it was suspended.
    async fn resume(&self) -> GuardResult<()>;

    /// Reposition execution to a previously completed step.
    async fn seek(&self, step: u64) -> GuardResult<()>;

    /// Terminate execution immediately.
    async fn abort(&self) -> GuardResult<()>;
}

/// Free-text status surfaced to observers of the running scan.
///
/// Backed by a `tokio::sync::watch` channel so any number of observers (GUI,
/// logs, tests) can follow the latest message without polling. Writes are
/// last-writer-wins, which is the intended behavior when several watchdogs
/// pause concurrently.
#[derive(Clone, Debug)]
pub struct ScanStatus {
    sender: watch::Sender<String>,
}

impl ScanStatus {
    /// Create a status object with an empty message.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(String::new());
        Self { sender }
    }

    /// Replace the surfaced message, notifying all subscribers.
    pub fn set_message(&self, message: impl Into<String>) {
        self.sender.send_replace(message.into());
    }

    /// The most recently surfaced message.
    pub fn message(&self) -> String {
        self.sender.borrow().clone()
    }

    /// Subscribe to message changes.
    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.sender.subscribe()
    }
}

impl Default for ScanStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(DeviceState::Running.is_running());
        assert!(!DeviceState::Paused.is_running());
        assert!(DeviceState::Paused.is_paused());
        assert!(!DeviceState::Idle.is_paused());
    }

    #[test]
    fn test_status_last_writer_wins() {
        let status = ScanStatus::new();
        status.set_message("Waiting for topup");
        status.set_message("Beam lost");
        assert_eq!(status.message(), "Beam lost");
    }

    #[tokio::test]
    async fn test_status_subscription() {
        let status = ScanStatus::new();
        let mut rx = status.subscribe();

        status.set_message("Paused");
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), "Paused");
    }
}
