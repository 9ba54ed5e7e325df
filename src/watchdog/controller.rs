//! The arbitration core: one controller per scan, many voting watchdogs.
//!
//! The controller converts per-watchdog votes into at most one physical
//! instruction per request to the controlled device. Pausing never requires
//! agreement (any single concerned party can stop the process); resuming
//! requires unanimity (every concerned party must agree conditions are safe).
//!
//! # Thread Safety
//!
//! Votes and pause messages are the only shared mutable state. One async
//! mutex guards the whole read-decide-act sequence of each call, so a
//! `resume` can never observe votes mid-update from a concurrent `pause`.
//! The device itself serializes its physical operations; the lock here is
//! about vote consistency, not device access.

use crate::device::{PausableDevice, ScanStatus};
use crate::error::GuardResult;
use crate::watchdog::{StepNumber, Watchdog};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A single watchdog's most recently requested state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Vote {
    /// The watchdog considers it safe to run.
    Running,
    /// The watchdog demands suspension.
    Paused,
}

/// Vote bookkeeping, guarded as one unit.
#[derive(Default)]
struct Arbitration {
    /// watchdog id → last requested vote; persists until that id votes again
    votes: HashMap<String, Vote>,
    /// watchdog id → message supplied with its most recent pause request
    pause_messages: HashMap<String, Option<String>>,
}

impl Arbitration {
    fn can_resume(&self) -> bool {
        !self.votes.values().any(|v| *v == Vote::Paused)
    }
}

/// Arbitration core bound to one controlled device for one scan.
///
/// The controller is unaware of watchdog behavior; it sees only ids and
/// votes. Watchdog instances hold an `Arc` to their controller and call in
/// from their own notification tasks.
pub struct DeviceController {
    device: Arc<dyn PausableDevice>,
    arbitration: Mutex<Arbitration>,
    watchdogs: StdMutex<Vec<Arc<dyn Watchdog>>>,
    status: Option<ScanStatus>,
}

impl DeviceController {
    /// Create a controller for `device`, optionally surfacing pause reasons
    /// through `status`.
    pub fn new(device: Arc<dyn PausableDevice>, status: Option<ScanStatus>) -> Self {
        Self {
            device,
            arbitration: Mutex::new(Arbitration::default()),
            watchdogs: StdMutex::new(Vec::new()),
            status,
        }
    }

    /// Attach a watchdog instance for the lifetime of this scan.
    pub fn attach(&self, watchdog: Arc<dyn Watchdog>) {
        if let Ok(mut set) = self.watchdogs.lock() {
            set.push(watchdog);
        }
    }

    /// The watchdog instances attached to this controller.
    pub fn attached(&self) -> Vec<Arc<dyn Watchdog>> {
        self.watchdogs
            .lock()
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    /// The controlled device.
    pub fn device(&self) -> &Arc<dyn PausableDevice> {
        &self.device
    }

    /// Record a pause vote for `id` and suspend the device if it is running.
    ///
    /// The vote and message are recorded unconditionally; the physical pause
    /// is only issued while the device is actually running, so repeated pause
    /// votes against an already-paused device just refresh the bookkeeping.
    pub async fn pause(&self, id: &str, message: Option<String>) -> GuardResult<()> {
        let mut arb = self.arbitration.lock().await;
        arb.votes.insert(id.to_string(), Vote::Paused);
        arb.pause_messages.insert(id.to_string(), message.clone());

        if !self.device.state().is_running() {
            debug!(id, state = ?self.device.state(), "pause vote recorded, device not running");
            return Ok(());
        }

        if let (Some(msg), Some(status)) = (&message, &self.status) {
            status.set_message(msg.clone());
        }
        info!(id, "pausing {}", self.device.name());
        self.device.pause().await
    }

    /// Record a resume vote for `id` and resume the device if every watchdog
    /// now agrees.
    ///
    /// When other pause votes remain, no physical action is taken; instead
    /// the surfaced status message is refreshed from one of the still-paused
    /// watchdogs. Which one wins is unspecified when several hold messages.
    pub async fn resume(&self, id: &str) -> GuardResult<()> {
        let mut arb = self.arbitration.lock().await;
        arb.votes.insert(id.to_string(), Vote::Running);

        if !self.device.state().is_paused() {
            debug!(id, state = ?self.device.state(), "resume vote recorded, device not paused");
            return Ok(());
        }

        if arb.can_resume() {
            info!(id, "resuming {}", self.device.name());
            return self.device.resume().await;
        }

        for (holdout, vote) in &arb.votes {
            if *vote != Vote::Paused {
                continue;
            }
            if let Some(Some(msg)) = arb.pause_messages.get(holdout) {
                debug!(id, holdout, "resume blocked, surfacing holdout message");
                if let Some(status) = &self.status {
                    status.set_message(msg.clone());
                }
                break;
            }
        }
        Ok(())
    }

    /// Reposition the device to `step` if everyone *else* agrees to run.
    ///
    /// The caller's own vote is hypothetically overridden to Running for the
    /// decision, without actually flipping it: a watchdog about to resume can
    /// seek first even though its recorded vote is still Paused.
    pub async fn seek(&self, id: &str, step: StepNumber) -> GuardResult<()> {
        let arb = self.arbitration.lock().await;

        if !self.device.state().is_paused() {
            debug!(id, step, state = ?self.device.state(), "seek skipped, device not paused");
            return Ok(());
        }

        let others_agree = arb
            .votes
            .iter()
            .filter(|(voter, _)| voter.as_str() != id)
            .all(|(_, vote)| *vote == Vote::Running);

        if others_agree {
            info!(id, step, "seeking {}", self.device.name());
            self.device.seek(step).await
        } else {
            debug!(id, step, "seek blocked by other pause votes");
            Ok(())
        }
    }

    /// Abort the device unconditionally. No arbitration, no vote bookkeeping.
    pub async fn abort(&self, id: &str) -> GuardResult<()> {
        warn!(id, "aborting {}", self.device.name());
        self.device.abort().await
    }

    /// True only if every attached watchdog reports active, i.e. the full
    /// expected supervision set is actually running.
    pub fn is_active(&self) -> bool {
        self.attached().iter().all(|w| w.is_active())
    }

    /// A watchdog's currently recorded vote, if any. Test and diagnostic aid.
    pub async fn vote(&self, id: &str) -> Option<Vote> {
        self.arbitration.lock().await.votes.get(id).copied()
    }
}
