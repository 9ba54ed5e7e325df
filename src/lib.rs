//! Watchdog arbitration for pausable scans.
//!
//! Several independent monitors ("watchdogs") supervise one long-running
//! scan. Each observes an external condition (a periodic machine
//! interruption countdown, or a boolean expression over live sensor
//! readings) and may unilaterally demand that the scan be suspended. A
//! shared [`watchdog::DeviceController`] arbitrates: any one watchdog can
//! pause the scan, but resuming requires every watchdog to agree.
//!
//! # Architecture Overview
//!
//! - [`watchdog::WatchdogRegistry`]: holds named templates, produces a fresh
//!   controller + watchdog set per scan
//! - [`watchdog::DeviceController`]: the arbitration core, votes in, at most
//!   one physical instruction out
//! - [`watchdog::TopupWatchdog`] / [`watchdog::ExpressionWatchdog`]: the two
//!   concrete monitor kinds
//! - [`condition`]: the leaf predicates the watchdogs consult
//! - [`device`] / [`scannable`]: trait boundaries to the scan engine and the
//!   beamline hardware, with mocks in [`mock`]
//!
//! # Data Flow
//!
//! ```text
//! Scannables --[PositionEvent]--> Watchdog tasks --votes--> DeviceController
//!                                                                |
//!                                                        PausableDevice
//! ```

pub mod condition;
pub mod config;
pub mod device;
pub mod error;
pub mod mock;
pub mod scannable;
pub mod watchdog;
