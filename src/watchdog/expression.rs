//! Expression watchdog.
//!
//! Pauses the scan while a user-supplied boolean expression over live
//! scannable readings is false (e.g. `beam_current > 190.0 && shutter_open`)
//! and resumes when it turns true again. Optionally, a set of scannables is
//! snapshotted at the moment of pausing and driven back to those positions
//! at the moment of resuming, so axes that drifted during the pause return
//! to their last known-good state.
//!
//! The snapshot is captured once per pause episode: if the expression goes
//! false a second time before a resume, the earlier snapshot is kept, since
//! the earliest known-good positions are preferred over wherever the axes
//! have drifted to since.

use crate::condition::ExprCondition;
use crate::error::{GuardError, GuardResult};
use crate::scannable::{PositionEvent, PositionValue, Positioner, ScannableRegistry};
use crate::watchdog::controller::DeviceController;
use crate::watchdog::registry::ExpressionConfig;
use crate::watchdog::{StepNumber, Watchdog};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

/// State shared between the watchdog handle and its monitor task.
struct Inner {
    id: String,
    config: ExpressionConfig,
    controller: Arc<DeviceController>,
    scannables: Arc<ScannableRegistry>,
    positioner: Arc<dyn Positioner>,
    active: AtomicBool,
    /// Compiled at scan start, cleared at scan end
    condition: Mutex<Option<ExprCondition>>,
    /// Latest reading per free variable
    readings: Mutex<HashMap<String, PositionValue>>,
    /// Restore positions captured at the start of the current pause episode
    snapshot: Mutex<Option<HashMap<String, PositionValue>>>,
    last_point: Mutex<Option<StepNumber>>,
}

impl Inner {
    fn last_point(&self) -> Option<StepNumber> {
        self.last_point.lock().ok().and_then(|p| *p)
    }

    async fn on_event(&self, event: PositionEvent) {
        if let Ok(mut readings) = self.readings.lock() {
            readings.insert(event.scannable.clone(), event.value.clone());
        }
        self.evaluate_now().await;
    }

    /// Re-evaluate the expression against the latest readings and vote.
    async fn evaluate_now(&self) {
        let verdict = {
            let readings = match self.readings.lock() {
                Ok(readings) => readings.clone(),
                Err(_) => return,
            };
            let condition = match self.condition.lock() {
                Ok(condition) => condition,
                Err(_) => return,
            };
            match condition.as_ref() {
                Some(condition) => condition.evaluate(&readings),
                None => return,
            }
        };

        match verdict {
            Ok(true) => self.on_safe().await,
            Ok(false) => self.on_unsafe().await,
            // An evaluation failure is operational, not fatal: keep the
            // current vote and let the next update try again.
            Err(e) => warn!(id = %self.id, "expression evaluation failed: {e}"),
        }
    }

    async fn on_unsafe(&self) {
        if !self.config.restore.is_empty() && self.snapshot_is_empty() {
            let mut captured = HashMap::new();
            for name in &self.config.restore {
                match self.scannables.get(name) {
                    Ok(scannable) => match scannable.position().await {
                        Ok(value) => {
                            captured.insert(name.clone(), value);
                        }
                        Err(e) => warn!(scannable = %name, "snapshot read failed: {e}"),
                    },
                    Err(e) => warn!(scannable = %name, "snapshot skipped: {e}"),
                }
            }
            if let Ok(mut snapshot) = self.snapshot.lock() {
                // A concurrent pause may have beaten us here; the earliest
                // snapshot wins.
                if snapshot.is_none() {
                    debug!(id = %self.id, ?captured, "captured restore snapshot");
                    *snapshot = Some(captured);
                }
            }
        }

        if let Err(e) = self
            .controller
            .pause(&self.id, self.config.message.clone())
            .await
        {
            warn!(id = %self.id, "pause request failed: {e}");
        }
    }

    async fn on_safe(&self) {
        if let Some(step) = self.last_point() {
            if let Err(e) = self.controller.seek(&self.id, step).await {
                warn!(id = %self.id, "seek to last completed point failed: {e}");
            }
        }

        let targets = self.snapshot.lock().ok().and_then(|mut s| s.take());
        if let Some(targets) = targets {
            if !targets.is_empty() {
                info!(id = %self.id, "restoring {} scannables to pre-pause positions", targets.len());
                if let Err(e) = self.positioner.move_to(&targets).await {
                    warn!(id = %self.id, "restore move failed: {e}");
                }
            }
        }

        if let Err(e) = self.controller.resume(&self.id).await {
            warn!(id = %self.id, "resume request failed: {e}");
        }
    }

    fn snapshot_is_empty(&self) -> bool {
        self.snapshot.lock().map(|s| s.is_none()).unwrap_or(false)
    }
}

/// Watchdog that follows a boolean expression over live readings.
pub struct ExpressionWatchdog {
    name: String,
    inner: Arc<Inner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ExpressionWatchdog {
    /// Build an instance from a template's configuration.
    ///
    /// The expression is only compiled at scan start; here it just has to be
    /// non-empty. Two instances with different expressions get distinct
    /// arbitration ids.
    pub fn new(
        name: &str,
        config: ExpressionConfig,
        controller: Arc<DeviceController>,
        scannables: Arc<ScannableRegistry>,
        positioner: Arc<dyn Positioner>,
    ) -> GuardResult<Self> {
        let expression = config.expression.trim().to_string();
        if expression.is_empty() {
            return Err(GuardError::Instantiation {
                name: name.to_string(),
                reason: "empty expression".to_string(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            inner: Arc::new(Inner {
                id: format!("expression[{}]", expression),
                config,
                controller,
                scannables,
                positioner,
                active: AtomicBool::new(false),
                condition: Mutex::new(None),
                readings: Mutex::new(HashMap::new()),
                snapshot: Mutex::new(None),
                last_point: Mutex::new(None),
            }),
            monitor: Mutex::new(None),
        })
    }

    /// Feed one reading directly, bypassing the event streams.
    #[cfg(test)]
    pub(crate) async fn handle_reading(&self, scannable: &str, value: PositionValue) {
        self.inner
            .on_event(PositionEvent {
                scannable: scannable.to_string(),
                value,
                kind: crate::scannable::PositionEventKind::Changed,
                timestamp: chrono::Utc::now(),
            })
            .await;
    }

    fn spawn_monitor(&self, receivers: Vec<tokio::sync::broadcast::Receiver<PositionEvent>>) {
        let inner = self.inner.clone();
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            let mut events =
                futures::stream::select_all(receivers.into_iter().map(BroadcastStream::new));
            while let Some(item) = events.next().await {
                match item {
                    Ok(event) => inner.on_event(event).await,
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        warn!(watchdog = %name, missed, "position updates lagged");
                    }
                }
            }
        });
        if let Ok(mut monitor) = self.monitor.lock() {
            *monitor = Some(handle);
        }
    }
}

#[async_trait]
impl Watchdog for ExpressionWatchdog {
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
        // Parse failures, unknown scannables, and scannables without event
        // streams are all fatal: the expression cannot be monitored.
        let condition = ExprCondition::parse(&self.inner.config.expression)?;

        let mut receivers = Vec::with_capacity(condition.variables().len());
        let mut initial = HashMap::new();
        for variable in condition.variables() {
            let scannable = self.inner.scannables.get(variable)?;
            receivers.push(scannable.subscribe()?);
            initial.insert(variable.clone(), scannable.position().await?);
        }

        if let Ok(mut readings) = self.inner.readings.lock() {
            *readings = initial;
        }
        if let Ok(mut cond) = self.inner.condition.lock() {
            *cond = Some(condition);
        }
        if let Ok(mut last) = self.inner.last_point.lock() {
            *last = Some(first_step);
        }
        self.inner.active.store(true, Ordering::Release);
        info!(watchdog = %self.name, id = %self.inner.id, "expression watchdog active");

        // Judge the initial readings before any update arrives.
        self.inner.evaluate_now().await;

        self.spawn_monitor(receivers);
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
        if let Ok(mut cond) = self.inner.condition.lock() {
            *cond = None;
        }
        if let Ok(mut readings) = self.inner.readings.lock() {
            readings.clear();
        }
        if let Ok(mut snapshot) = self.inner.snapshot.lock() {
            *snapshot = None;
        }
        info!(watchdog = %self.name, "expression watchdog inactive");
    }
}
