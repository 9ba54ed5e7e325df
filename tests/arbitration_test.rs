//! End-to-end arbitration tests: registry → simulated scan → sensor events.

use scanguard::device::{DeviceState, PausableDevice, ScanStatus};
use scanguard::mock::{DeviceCall, MockDevice, MockPositioner, MockScannable, SimulatedScan};
use scanguard::scannable::{PositionValue, ScannableRegistry};
use scanguard::watchdog::{
    ExpressionConfig, TopupConfig, WatchdogConfig, WatchdogRegistry, WatchdogTemplate,
};
use std::sync::Arc;
use std::time::Duration;

struct Beamline {
    scannables: Arc<ScannableRegistry>,
    registry: WatchdogRegistry,
    device: Arc<MockDevice>,
}

fn beamline() -> Beamline {
    let scannables = Arc::new(ScannableRegistry::new());
    scannables.register(Arc::new(MockScannable::new(
        "beam_a",
        PositionValue::Flag(true),
    )));
    scannables.register(Arc::new(MockScannable::new(
        "beam_b",
        PositionValue::Flag(true),
    )));
    scannables.register(Arc::new(MockScannable::new(
        "topup_countdown",
        PositionValue::Float(100_000.0),
    )));
    scannables.register(Arc::new(MockScannable::new(
        "machine_mode",
        PositionValue::Text("Normal".into()),
    )));

    let positioner = Arc::new(MockPositioner::new(scannables.clone()));
    let registry = WatchdogRegistry::new(true, scannables.clone(), positioner);
    let device = Arc::new(MockDevice::new(DeviceState::Idle));

    Beamline {
        scannables,
        registry,
        device,
    }
}

fn expression_template(name: &str, expression: &str) -> WatchdogTemplate {
    WatchdogTemplate {
        name: name.to_string(),
        enabled: true,
        config: WatchdogConfig::Expression(ExpressionConfig {
            expression: expression.to_string(),
            message: Some(format!("{} unhappy", name)),
            restore: Vec::new(),
        }),
    }
}

async fn wait_for_state(device: &MockDevice, expected: DeviceState) {
    for _ in 0..100 {
        if device.state() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "device never reached {:?}, still {:?}",
        expected,
        device.state()
    );
}

#[tokio::test]
async fn two_watchdogs_pause_wins_resume_needs_unanimity() {
    let bl = beamline();
    bl.registry
        .register(expression_template("a", "beam_a"))
        .unwrap();
    bl.registry
        .register(expression_template("b", "beam_b"))
        .unwrap();

    let controller = bl
        .registry
        .create_for_scan(bl.device.clone(), None)
        .expect("supervised scan");
    let scan = SimulatedScan::new(bl.device.clone(), Some(controller.clone()));
    scan.start(0).await.unwrap();
    assert!(controller.is_active());

    // "a" goes unhappy while "b" stays fine: the scan must pause.
    let beam_a = bl.scannables.get("beam_a").unwrap();
    beam_a.set_position(PositionValue::Flag(false)).await.unwrap();
    wait_for_state(&bl.device, DeviceState::Paused).await;
    assert_eq!(bl.device.count(&DeviceCall::Pause), 1);

    // "b" re-affirming its happiness must not resume the scan.
    let beam_b = bl.scannables.get("beam_b").unwrap();
    beam_b.set_position(PositionValue::Flag(true)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bl.device.state(), DeviceState::Paused);
    assert_eq!(bl.device.count(&DeviceCall::Resume), 0);

    // "a" recovering resumes: everyone now agrees.
    beam_a.set_position(PositionValue::Flag(true)).await.unwrap();
    wait_for_state(&bl.device, DeviceState::Running).await;
    assert_eq!(bl.device.count(&DeviceCall::Resume), 1);

    scan.finish().await;
    assert!(!controller.is_active());
    assert_eq!(bl.device.state(), DeviceState::Idle);
}

#[tokio::test]
async fn abort_reaches_device_regardless_of_votes() {
    let bl = beamline();
    bl.registry
        .register(expression_template("a", "beam_a"))
        .unwrap();

    let controller = bl
        .registry
        .create_for_scan(bl.device.clone(), None)
        .expect("supervised scan");
    let scan = SimulatedScan::new(bl.device.clone(), Some(controller.clone()));
    scan.start(0).await.unwrap();

    let beam_a = bl.scannables.get("beam_a").unwrap();
    beam_a.set_position(PositionValue::Flag(false)).await.unwrap();
    wait_for_state(&bl.device, DeviceState::Paused).await;

    controller.abort("operator").await.unwrap();
    assert_eq!(bl.device.state(), DeviceState::Aborted);
    assert_eq!(bl.device.count(&DeviceCall::Abort), 1);

    scan.finish().await;
    assert_eq!(bl.device.state(), DeviceState::Aborted);
}

#[tokio::test]
async fn kill_switch_means_unsupervised_scan() {
    let bl = beamline();
    bl.registry
        .register(expression_template("a", "beam_a"))
        .unwrap();
    bl.registry.set_active(false);

    assert!(bl
        .registry
        .create_for_scan(bl.device.clone(), None)
        .is_none());

    // The scan still runs, just without supervision.
    let scan = SimulatedScan::new(bl.device.clone(), None);
    scan.start(0).await.unwrap();
    assert_eq!(bl.device.state(), DeviceState::Running);
    scan.finish().await;
}

#[tokio::test]
async fn wrong_machine_mode_prevents_scan_start() {
    let bl = beamline();
    bl.scannables.register(Arc::new(MockScannable::new(
        "machine_mode",
        PositionValue::Text("Shutdown".into()),
    )));
    bl.registry
        .register(WatchdogTemplate {
            name: "topup".to_string(),
            enabled: true,
            config: WatchdogConfig::Topup(TopupConfig {
                countdown: "topup_countdown".to_string(),
                cooloff_ms: 4000,
                warmup_ms: 5000,
                period_ms: 600_000,
                topup_time_ms: 15_000,
                machine_mode: Some("machine_mode".to_string()),
            }),
        })
        .unwrap();

    let controller = bl
        .registry
        .create_for_scan(bl.device.clone(), None)
        .expect("supervised scan");
    let scan = SimulatedScan::new(bl.device.clone(), Some(controller));

    assert!(scan.start(0).await.is_err());
    assert_eq!(bl.device.state(), DeviceState::Idle);
}

#[tokio::test]
async fn blocked_resume_surfaces_holdout_message() {
    let bl = beamline();
    bl.registry
        .register(expression_template("a", "beam_a"))
        .unwrap();
    bl.registry
        .register(expression_template("b", "beam_b"))
        .unwrap();

    let status = ScanStatus::new();
    let controller = bl
        .registry
        .create_for_scan(bl.device.clone(), Some(status.clone()))
        .expect("supervised scan");
    let scan = SimulatedScan::new(bl.device.clone(), Some(controller));
    scan.start(0).await.unwrap();

    let beam_a = bl.scannables.get("beam_a").unwrap();
    let beam_b = bl.scannables.get("beam_b").unwrap();

    beam_a.set_position(PositionValue::Flag(false)).await.unwrap();
    wait_for_state(&bl.device, DeviceState::Paused).await;
    beam_b.set_position(PositionValue::Flag(false)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // "b" recovers but "a" still holds the pause; its reason is surfaced.
    beam_b.set_position(PositionValue::Flag(true)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bl.device.state(), DeviceState::Paused);
    assert_eq!(status.message(), "a unhappy");

    beam_a.set_position(PositionValue::Flag(true)).await.unwrap();
    wait_for_state(&bl.device, DeviceState::Running).await;
    scan.finish().await;
}
