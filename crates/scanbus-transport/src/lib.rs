//! Scanbus Transport - register access to IEEE-1394 nodes
//!
//! This crate provides everything that touches bus registers:
//! - The [`BusTransport`] trait with bounded retry on busy nodes
//! - An in-memory [`LoopbackBus`] and configuration ROM builder
//! - Topology map and cycle-time register reads
//! - The configuration ROM reader
//! - FCP request/response transactions

pub mod csr;
pub mod fcp;
pub mod loopback;
pub mod rom;
pub mod transport;

pub use csr::{fetch_topology_map, node_address, read_cycle_time};
pub use fcp::{fcp_transaction, FcpError, FcpResponder, FcpResponse, ResponseCode};
pub use loopback::{ConfigRomBuilder, LoopbackBus};
pub use rom::{read_device_info, read_guid, RomRead, RomWarning};
pub use transport::{BusTransport, RetryPolicy, RetryingTransport, TransportError};
