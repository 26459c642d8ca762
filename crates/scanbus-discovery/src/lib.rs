//! Scanbus Discovery - topology scanning for IEEE-1394 buses
//!
//! This crate ties the decoder and the transport together:
//! - [`BusSession`] owns the transport and lookup tables of one bus
//! - [`BusResetNotifier`] tracks bus generations so stale builds are discarded
//! - [`BusScanner`] rebuilds the topology after resets and publishes snapshots
//! - TOML configuration loading

pub mod config;
pub mod scanner;
pub mod session;

pub use config::{load_config, save_default_config, ScannerConfig};
pub use scanner::{BusScanner, ScanEvent, SnapshotExport, TopologySnapshot};
pub use session::{BusResetNotifier, BusScan, BusSession, NodeWarning, ScanError, SharedResolver};
