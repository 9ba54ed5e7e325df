//! Mock collaborators for tests and the demo binary.
//!
//! The real scan engine, beamline scannables, and positioner live outside
//! this crate; these stand-ins implement the same traits with synthetic
//! state so the arbitration logic can be exercised end-to-end without
//! hardware.

use crate::device::{DeviceState, PausableDevice};
use crate::error::{GuardError, GuardResult};
use crate::scannable::{
    PositionEvent, PositionEventKind, PositionValue, Positioner, Scannable, ScannableRegistry,
};
use crate::watchdog::controller::DeviceController;
use crate::watchdog::StepNumber;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::info;

/// One physical operation received by the mock device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceCall {
    Pause,
    Resume,
    Seek(StepNumber),
    Abort,
}

/// In-memory pausable device recording every physical call it receives.
///
/// State transitions mimic a real scan device: `pause` moves Running →
/// Paused, `resume` moves Paused → Running, `abort` terminates from any
/// state. `seek` repositions without changing state.
pub struct MockDevice {
    name: String,
    state: Mutex<DeviceState>,
    calls: Mutex<Vec<DeviceCall>>,
}

impl MockDevice {
    /// Create a device in the given initial state.
    pub fn new(state: DeviceState) -> Self {
        Self {
            name: "mock_scan".to_string(),
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Force the device into a state, as the scan engine would.
    pub fn set_state(&self, state: DeviceState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    /// Every physical call received, in order.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// How many times a given call was received.
    pub fn count(&self, call: &DeviceCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    /// The steps of every seek received, in order.
    pub fn seeks(&self) -> Vec<StepNumber> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DeviceCall::Seek(step) => Some(step),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: DeviceCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl PausableDevice for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> DeviceState {
        self.state.lock().map(|s| *s).unwrap_or(DeviceState::Fault)
    }

    async fn pause(&self) -> GuardResult<()> {
        self.record(DeviceCall::Pause);
        self.set_state(DeviceState::Paused);
        Ok(())
    }

    async fn resume(&self) -> GuardResult<()> {
        self.record(DeviceCall::Resume);
        self.set_state(DeviceState::Running);
        Ok(())
    }

    async fn seek(&self, step: StepNumber) -> GuardResult<()> {
        self.record(DeviceCall::Seek(step));
        Ok(())
    }

    async fn abort(&self) -> GuardResult<()> {
        self.record(DeviceCall::Abort);
        self.set_state(DeviceState::Aborted);
        Ok(())
    }
}

/// In-memory scannable with a settable position and an event broadcast.
pub struct MockScannable {
    name: String,
    position: Mutex<PositionValue>,
    sender: broadcast::Sender<PositionEvent>,
    listenable: bool,
}

impl MockScannable {
    /// Create a scannable at an initial position.
    pub fn new(name: &str, initial: PositionValue) -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            name: name.to_string(),
            position: Mutex::new(initial),
            sender,
            listenable: true,
        }
    }

    /// Make `subscribe` fail, mimicking a scannable without notifications.
    pub fn without_events(mut self) -> Self {
        self.listenable = false;
        self
    }

    /// Update the position and broadcast an intermediate change event.
    pub fn publish(&self, value: PositionValue) {
        self.store(value.clone());
        self.send(value, PositionEventKind::Changed);
    }

    fn store(&self, value: PositionValue) {
        if let Ok(mut position) = self.position.lock() {
            *position = value;
        }
    }

    fn send(&self, value: PositionValue, kind: PositionEventKind) {
        // No receivers is fine; events are fire-and-forget.
        let _ = self.sender.send(PositionEvent {
            scannable: self.name.clone(),
            value,
            kind,
            timestamp: Utc::now(),
        });
    }
}

#[async_trait]
impl Scannable for MockScannable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn position(&self) -> GuardResult<PositionValue> {
        self.position
            .lock()
            .map(|p| p.clone())
            .map_err(|_| GuardError::Scannable(format!("{}: position lock poisoned", self.name)))
    }

    async fn set_position(&self, target: PositionValue) -> GuardResult<()> {
        self.store(target.clone());
        self.send(target, PositionEventKind::Performed);
        Ok(())
    }

    fn subscribe(&self) -> GuardResult<broadcast::Receiver<PositionEvent>> {
        if self.listenable {
            Ok(self.sender.subscribe())
        } else {
            Err(GuardError::NotListenable(self.name.clone()))
        }
    }
}

/// Positioner that drives registered scannables and records every group move.
pub struct MockPositioner {
    scannables: Arc<ScannableRegistry>,
    moves: Mutex<Vec<HashMap<String, PositionValue>>>,
}

impl MockPositioner {
    /// Create a positioner over the given registry.
    pub fn new(scannables: Arc<ScannableRegistry>) -> Self {
        Self {
            scannables,
            moves: Mutex::new(Vec::new()),
        }
    }

    /// Every group move performed, in order.
    pub fn moves(&self) -> Vec<HashMap<String, PositionValue>> {
        self.moves.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Positioner for MockPositioner {
    async fn move_to(&self, targets: &HashMap<String, PositionValue>) -> GuardResult<()> {
        if let Ok(mut moves) = self.moves.lock() {
            moves.push(targets.clone());
        }
        for (name, target) in targets {
            self.scannables
                .get(name)?
                .set_position(target.clone())
                .await?;
        }
        Ok(())
    }
}

/// Minimal stand-in for the scan engine's lifecycle side.
///
/// Drives the hooks a real engine would: a start hook with the first step,
/// a hook after every completed point, and an end hook fired exactly once
/// regardless of outcome. Supervision is optional, mirroring the registry's
/// unsupervised escape hatch.
pub struct SimulatedScan {
    device: Arc<MockDevice>,
    controller: Option<Arc<DeviceController>>,
}

impl SimulatedScan {
    /// Create a scan over `device`, supervised if a controller is given.
    pub fn new(device: Arc<MockDevice>, controller: Option<Arc<DeviceController>>) -> Self {
        Self { device, controller }
    }

    /// Arm the device, activate every watchdog, and start running.
    ///
    /// A watchdog start failure is fatal: already-started watchdogs are wound
    /// back down and the error propagates, leaving the device unstarted.
    pub async fn start(&self, first_step: StepNumber) -> GuardResult<()> {
        self.device.set_state(DeviceState::Armed);

        if let Some(controller) = &self.controller {
            let mut started = Vec::new();
            for watchdog in controller.attached() {
                match watchdog.scan_started(first_step).await {
                    Ok(()) => started.push(watchdog),
                    Err(e) => {
                        for wound_back in started {
                            wound_back.scan_ended().await;
                        }
                        self.device.set_state(DeviceState::Idle);
                        return Err(e);
                    }
                }
            }
        }

        self.device.set_state(DeviceState::Running);
        info!("simulated scan running");
        Ok(())
    }

    /// Notify watchdogs that `step` completed successfully.
    pub async fn complete_point(&self, step: StepNumber) {
        if let Some(controller) = &self.controller {
            for watchdog in controller.attached() {
                watchdog.point_completed(step).await;
            }
        }
    }

    /// Fire the end-of-scan hook on every watchdog and rest the device.
    pub async fn finish(&self) {
        if let Some(controller) = &self.controller {
            for watchdog in controller.attached() {
                watchdog.scan_ended().await;
            }
        }
        if !matches!(self.device.state(), DeviceState::Aborted | DeviceState::Fault) {
            self.device.set_state(DeviceState::Idle);
        }
        info!("simulated scan finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_device_records_calls() {
        let device = MockDevice::new(DeviceState::Running);
        device.pause().await.unwrap();
        device.seek(3).await.unwrap();
        device.resume().await.unwrap();

        assert_eq!(
            device.calls(),
            vec![DeviceCall::Pause, DeviceCall::Seek(3), DeviceCall::Resume]
        );
        assert_eq!(device.seeks(), vec![3]);
        assert_eq!(device.state(), DeviceState::Running);
    }

    #[tokio::test]
    async fn test_mock_scannable_events() {
        let scannable = MockScannable::new("beam_current", PositionValue::Float(200.0));
        let mut rx = scannable.subscribe().unwrap();

        scannable.publish(PositionValue::Float(150.0));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.scannable, "beam_current");
        assert_eq!(event.value, PositionValue::Float(150.0));
        assert_eq!(event.kind, PositionEventKind::Changed);
    }

    #[tokio::test]
    async fn test_unsupervised_scan_lifecycle() {
        let device = Arc::new(MockDevice::new(DeviceState::Idle));
        let scan = SimulatedScan::new(device.clone(), None);

        scan.start(0).await.unwrap();
        assert_eq!(device.state(), DeviceState::Running);

        scan.finish().await;
        assert_eq!(device.state(), DeviceState::Idle);
    }
}
