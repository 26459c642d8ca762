//! Scanbus Core - SelfID decoding, device model, and bus topology
//!
//! This crate provides the bus-independent pieces of the inspector:
//! - SelfID packet decoding into per-node descriptors
//! - Device metadata read from configuration ROMs, and node classification
//! - GUID and vendor name tables
//! - Topology tree reconstruction and queries

pub mod device;
pub mod resolve;
pub mod selfid;
pub mod topology;

pub use device::{classify, BusInfo, DeviceInfo, Guid, NodeType};
pub use resolve::{GuidEntry, LookupError, LookupTables, NameResolver};
pub use selfid::{decode, decode_with, DecodeError, DecodeMode, PortState, SelfIdDescriptor};
pub use topology::{
    generate_test_map, NodeIndex, RawTopologyMap, TopologyError, TopologyGraph, TopologyNode,
    TopologyTree,
};
