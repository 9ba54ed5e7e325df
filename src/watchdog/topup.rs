//! Periodic-interruption (topup) watchdog.
//!
//! Synchrotron storage rings are topped up on a fixed period; during the
//! topup the beam is unusable. This watchdog follows a countdown scannable
//! (milliseconds until the next topup) and pauses the scan just before the
//! interruption, resuming once the configured cooloff has passed. A negative
//! countdown means the countdown itself is lost; when it comes back the
//! watchdog seeks the scan back to the last completed point before resuming,
//! since an unknown amount of drift may have accumulated.
//!
//! Countdown updates can arrive at ~10 Hz, faster than a pause round-trip.
//! A `busy` flag drops updates that arrive while one is still being
//! processed: dropping is safe because the next update re-evaluates current
//! truth, so no stale decision can stick.

use crate::condition::TopupWindow;
use crate::error::{GuardError, GuardResult};
use crate::scannable::{PositionEvent, ScannableRegistry};
use crate::watchdog::controller::DeviceController;
use crate::watchdog::registry::TopupConfig;
use crate::watchdog::{StepNumber, Watchdog};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Machine mode required at scan start when a mode scannable is configured.
const NORMAL_MODE: &str = "Normal";

/// Status message surfaced while this watchdog holds a pause.
const PAUSE_MESSAGE: &str = "Waiting for topup to finish";

/// Arbitration id. Kind-derived: all topup instances vote as one concern.
const TOPUP_ID: &str = "topup";

/// State shared between the watchdog handle and its monitor task.
struct Inner {
    id: String,
    window: TopupWindow,
    controller: Arc<DeviceController>,
    active: AtomicBool,
    /// Reentrancy guard: drop updates that arrive mid-processing
    busy: AtomicBool,
    /// Set while the countdown is lost; forces a seek before the next resume
    rewind: AtomicBool,
    last_point: Mutex<Option<StepNumber>>,
}

impl Inner {
    fn last_point(&self) -> Option<StepNumber> {
        self.last_point.lock().ok().and_then(|p| *p)
    }

    /// Handle one countdown update. Updates arriving while a previous one is
    /// in flight are dropped.
    async fn on_countdown(&self, countdown_ms: f64) {
        if self.busy.swap(true, Ordering::AcqRel) {
            debug!(countdown_ms, "dropping countdown update while busy");
            return;
        }
        self.evaluate(countdown_ms).await;
        self.busy.store(false, Ordering::Release);
    }

    async fn evaluate(&self, countdown_ms: f64) {
        let countdown = countdown_ms.round() as i64;

        if self.window.permits(countdown) {
            if self.rewind.swap(false, Ordering::AcqRel) {
                if let Some(step) = self.last_point() {
                    info!(step, "countdown recovered, rewinding to last completed point");
                    if let Err(e) = self.controller.seek(&self.id, step).await {
                        warn!("seek after countdown recovery failed: {e}");
                    }
                }
            }
            if let Err(e) = self.controller.resume(&self.id).await {
                warn!("resume request failed: {e}");
            }
        } else {
            if countdown < 0 {
                debug!(countdown, "countdown lost, will rewind on recovery");
                self.rewind.store(true, Ordering::Release);
            }
            if let Err(e) = self
                .controller
                .pause(&self.id, Some(PAUSE_MESSAGE.to_string()))
                .await
            {
                warn!("pause request failed: {e}");
            }
        }
    }
}

/// Watchdog that pauses the scan around each periodic beam interruption.
pub struct TopupWatchdog {
    name: String,
    config: TopupConfig,
    scannables: Arc<ScannableRegistry>,
    inner: Arc<Inner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl TopupWatchdog {
    /// Build an instance from a template's configuration.
    pub fn new(
        name: &str,
        config: TopupConfig,
        controller: Arc<DeviceController>,
        scannables: Arc<ScannableRegistry>,
    ) -> GuardResult<Self> {
        if config.countdown.trim().is_empty() {
            return Err(GuardError::Instantiation {
                name: name.to_string(),
                reason: "no countdown scannable configured".to_string(),
            });
        }
        let window = TopupWindow {
            cooloff_ms: config.cooloff_ms,
            warmup_ms: config.warmup_ms,
            period_ms: config.period_ms,
            topup_time_ms: config.topup_time_ms,
        };
        window.validate().map_err(|e| GuardError::Instantiation {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            name: name.to_string(),
            config,
            scannables,
            inner: Arc::new(Inner {
                id: TOPUP_ID.to_string(),
                window,
                controller,
                active: AtomicBool::new(false),
                busy: AtomicBool::new(false),
                rewind: AtomicBool::new(false),
                last_point: Mutex::new(None),
            }),
            monitor: Mutex::new(None),
        })
    }

    /// Feed one countdown value directly, bypassing the event stream.
    #[cfg(test)]
    pub(crate) async fn handle_countdown(&self, countdown_ms: f64) {
        self.inner.on_countdown(countdown_ms).await;
    }

    fn spawn_monitor(&self, mut events: broadcast::Receiver<PositionEvent>) {
        let inner = self.inner.clone();
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match event.value.as_f64() {
                        Some(countdown_ms) => inner.on_countdown(countdown_ms).await,
                        None => debug!(watchdog = %name, "ignoring non-numeric countdown update"),
                    },
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Missed updates are recoverable; the next one
                        // re-evaluates current truth.
                        warn!(watchdog = %name, missed, "countdown updates lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Ok(mut monitor) = self.monitor.lock() {
            *monitor = Some(handle);
        }
    }
}

#[async_trait]
impl Watchdog for TopupWatchdog {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> &str {
        &self.inner.id
    }

    fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    async fn scan_started(&self, first_step: StepNumber) -> GuardResult<()> {
        // Wrong machine mode is a genuine precondition violation: the scan
        // must not start at all.
        if let Some(mode_name) = &self.config.machine_mode {
            let mode = self.scannables.get(mode_name)?;
            let value = mode.position().await?;
            if value.as_text() != Some(NORMAL_MODE) {
                return Err(GuardError::Precondition(format!(
                    "machine mode is '{}', expected '{}'",
                    value, NORMAL_MODE
                )));
            }
        }

        let countdown = self.scannables.get(&self.config.countdown)?;
        let events = countdown.subscribe()?;

        if let Ok(mut last) = self.inner.last_point.lock() {
            *last = Some(first_step);
        }
        self.inner.active.store(true, Ordering::Release);
        info!(watchdog = %self.name, countdown = %self.config.countdown, "topup watchdog active");

        // Evaluate the countdown as it stands; updates may be minutes apart.
        match countdown.position().await {
            Ok(value) => {
                if let Some(countdown_ms) = value.as_f64() {
                    self.inner.on_countdown(countdown_ms).await;
                }
            }
            Err(e) => warn!(watchdog = %self.name, "initial countdown reading failed: {e}"),
        }

        self.spawn_monitor(events);
        Ok(())
    }

    async fn point_completed(&self, step: StepNumber) {
        if let Ok(mut last) = self.inner.last_point.lock() {
            *last = Some(step);
        }
    }

    async fn scan_ended(&self) {
        if let Ok(mut monitor) = self.monitor.lock() {
            if let Some(handle) = monitor.take() {
                handle.abort();
            }
        }
        self.inner.active.store(false, Ordering::Release);
        self.inner.busy.store(false, Ordering::Release);
        self.inner.rewind.store(false, Ordering::Release);
        info!(watchdog = %self.name, "topup watchdog inactive");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceState, PausableDevice};
    use crate::mock::{DeviceCall, MockDevice, MockScannable};
    use crate::scannable::PositionValue;

    fn config() -> TopupConfig {
        TopupConfig {
            countdown: "topup_countdown".to_string(),
            cooloff_ms: 4000,
            warmup_ms: 5000,
            period_ms: 600_000,
            topup_time_ms: 15_000,
            machine_mode: None,
        }
    }

    struct Rig {
        device: Arc<MockDevice>,
        scannables: Arc<ScannableRegistry>,
        watchdog: TopupWatchdog,
    }

    fn rig(config: TopupConfig) -> Rig {
        let device = Arc::new(MockDevice::new(DeviceState::Running));
        let controller = Arc::new(DeviceController::new(device.clone(), None));
        let scannables = Arc::new(ScannableRegistry::new());
        scannables.register(Arc::new(MockScannable::new(
            "topup_countdown",
            PositionValue::Float(100_000.0),
        )));
        let watchdog =
            TopupWatchdog::new("topup", config, controller, scannables.clone()).unwrap();
        Rig {
            device,
            scannables,
            watchdog,
        }
    }

    #[tokio::test]
    async fn test_invalid_countdown_pauses() {
        let rig = rig(config());
        rig.watchdog.scan_started(0).await.unwrap();

        rig.watchdog.handle_countdown(590_000.0).await;
        assert_eq!(rig.device.state(), DeviceState::Paused);
        assert_eq!(rig.device.count(&DeviceCall::Pause), 1);

        rig.watchdog.scan_ended().await;
    }

    #[tokio::test]
    async fn test_valid_countdown_resumes() {
        let rig = rig(config());
        rig.watchdog.scan_started(0).await.unwrap();

        rig.watchdog.handle_countdown(590_000.0).await;
        rig.watchdog.handle_countdown(100_000.0).await;

        assert_eq!(rig.device.state(), DeviceState::Running);
        assert_eq!(rig.device.count(&DeviceCall::Resume), 1);
        // Countdown was never lost, so no rewind.
        assert_eq!(rig.device.seeks(), Vec::<u64>::new());

        rig.watchdog.scan_ended().await;
    }

    #[tokio::test]
    async fn test_lost_countdown_rewinds_before_resume() {
        let rig = rig(config());
        rig.watchdog.scan_started(0).await.unwrap();
        rig.watchdog.point_completed(12).await;

        rig.watchdog.handle_countdown(-1.0).await;
        assert_eq!(rig.device.state(), DeviceState::Paused);

        rig.watchdog.handle_countdown(100_000.0).await;
        assert_eq!(rig.device.seeks(), vec![12]);
        assert_eq!(rig.device.state(), DeviceState::Running);

        rig.watchdog.scan_ended().await;
    }

    #[tokio::test]
    async fn test_wrong_machine_mode_is_fatal() {
        let mut cfg = config();
        cfg.machine_mode = Some("machine_mode".to_string());
        let rig = rig(cfg);
        rig.scannables.register(Arc::new(MockScannable::new(
            "machine_mode",
            PositionValue::Text("Shutdown".into()),
        )));

        let err = rig.watchdog.scan_started(0).await;
        assert!(matches!(err, Err(GuardError::Precondition(_))));
        assert!(!rig.watchdog.is_active());
    }

    #[tokio::test]
    async fn test_missing_countdown_scannable_is_fatal() {
        let device = Arc::new(MockDevice::new(DeviceState::Running));
        let controller = Arc::new(DeviceController::new(device, None));
        let scannables = Arc::new(ScannableRegistry::new());
        let watchdog =
            TopupWatchdog::new("topup", config(), controller, scannables).unwrap();

        let err = watchdog.scan_started(0).await;
        assert!(matches!(err, Err(GuardError::UnknownScannable(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_activation() {
        let rig = rig(config());
        assert!(!rig.watchdog.is_active());

        rig.watchdog.scan_started(0).await.unwrap();
        assert!(rig.watchdog.is_active());

        rig.watchdog.scan_ended().await;
        assert!(!rig.watchdog.is_active());
    }

    #[tokio::test]
    async fn test_event_stream_drives_votes() {
        let rig = rig(config());
        let countdown = rig.scannables.get("topup_countdown").unwrap();
        rig.watchdog.scan_started(0).await.unwrap();

        countdown
            .set_position(PositionValue::Float(590_000.0))
            .await
            .unwrap();

        // The monitor task runs on its own; poll for the effect.
        for _ in 0..50 {
            if rig.device.state() == DeviceState::Paused {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(rig.device.state(), DeviceState::Paused);

        rig.watchdog.scan_ended().await;
    }
}
