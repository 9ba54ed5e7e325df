//! Demo binary: runs a simulated, supervised scan against mock hardware.
//!
//! Loads watchdog templates from configuration (or uses a built-in demo set
//! when none are declared), starts a simulated scan, then scripts a beam
//! drop and recovery so the arbitration can be watched in the logs.

use anyhow::Result;
use clap::Parser;
use scanguard::config::Settings;
use scanguard::device::{DeviceState, PausableDevice, ScanStatus};
use scanguard::mock::{MockDevice, MockPositioner, MockScannable, SimulatedScan};
use scanguard::scannable::{PositionValue, ScannableRegistry};
use scanguard::watchdog::{ExpressionConfig, TopupConfig, WatchdogConfig, WatchdogTemplate};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scanguard", about = "Simulated supervised scan demo")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Templates used when the configuration declares none.
fn demo_templates() -> Vec<WatchdogTemplate> {
    vec![
        WatchdogTemplate {
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
        },
        WatchdogTemplate {
            name: "beam".to_string(),
            enabled: true,
            config: WatchdogConfig::Expression(ExpressionConfig {
                expression: "beam_current > 190.0 && shutter_open".to_string(),
                message: Some("Beam unavailable".to_string()),
                restore: vec!["sample_x".to_string()],
            }),
        },
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    // Mock beamline.
    let scannables = Arc::new(ScannableRegistry::new());
    let countdown = Arc::new(MockScannable::new(
        "topup_countdown",
        PositionValue::Float(100_000.0),
    ));
    let beam_current = Arc::new(MockScannable::new(
        "beam_current",
        PositionValue::Float(300.0),
    ));
    let shutter = Arc::new(MockScannable::new("shutter_open", PositionValue::Flag(true)));
    let mode = Arc::new(MockScannable::new(
        "machine_mode",
        PositionValue::Text("Normal".into()),
    ));
    let sample_x = Arc::new(MockScannable::new("sample_x", PositionValue::Float(1.0)));
    scannables.register(countdown.clone());
    scannables.register(beam_current.clone());
    scannables.register(shutter.clone());
    scannables.register(mode.clone());
    scannables.register(sample_x.clone());
    let positioner = Arc::new(MockPositioner::new(scannables.clone()));

    let registry = settings.build_registry(scannables.clone(), positioner)?;
    if registry.names().is_empty() {
        info!("no watchdog templates configured, using the demo set");
        for template in demo_templates() {
            registry.register(template)?;
        }
    }

    let status = ScanStatus::new();
    let mut status_rx = status.subscribe();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let message = status_rx.borrow().clone();
            info!(%message, "scan status");
        }
    });

    let device = Arc::new(MockDevice::new(DeviceState::Idle));
    let controller = registry.create_for_scan(device.clone(), Some(status));
    let scan = SimulatedScan::new(device.clone(), controller);

    scan.start(0).await?;
    for step in 1..=3 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        scan.complete_point(step).await;
    }

    info!("dropping the beam");
    beam_current.publish(PositionValue::Float(12.0));
    tokio::time::sleep(Duration::from_millis(500)).await;
    info!(state = ?device.state(), "after beam drop");

    info!("beam is back");
    beam_current.publish(PositionValue::Float(300.0));
    tokio::time::sleep(Duration::from_millis(500)).await;
    info!(state = ?device.state(), "after recovery");

    scan.finish().await;
    info!(calls = ?device.calls(), "physical device calls");
    Ok(())
}
