//! Well-known CSR addresses and the registers read directly from them

use scanbus_core::RawTopologyMap;
use tracing::{debug, warn};

use crate::transport::{BusTransport, Result};

/// Start of the CSR register space of every node
pub const CSR_REGISTER_BASE: u64 = 0xFFFF_F000_0000;

/// Cycle-time register, relative to [`CSR_REGISTER_BASE`]
pub const CYCLE_TIME: u64 = 0x200;

/// Configuration ROM, relative to [`CSR_REGISTER_BASE`]
pub const CONFIG_ROM: u64 = 0x400;

/// FCP command frame register, relative to [`CSR_REGISTER_BASE`]
pub const FCP_COMMAND: u64 = 0xB00;

/// FCP response frame register, relative to [`CSR_REGISTER_BASE`]
pub const FCP_RESPONSE: u64 = 0xD00;

/// Topology map, relative to [`CSR_REGISTER_BASE`]
pub const TOPOLOGY_MAP: u64 = 0x1000;

/// Bus ID bits of a destination ID on the local bus
pub const LOCAL_BUS: u16 = 0xffc0;

/// Destination ID of a node on the local bus
pub fn node_address(phy_id: u8) -> u16 {
    LOCAL_BUS | (phy_id as u16 & 0x3f)
}

/// Physical ID part of a destination ID
pub fn phy_id_of(node: u16) -> u8 {
    (node & 0x3f) as u8
}

/// Read the topology map held by the local node
pub fn fetch_topology_map<T: BusTransport + ?Sized>(transport: &mut T) -> Result<RawTopologyMap> {
    let local = transport.local_id();
    let base = CSR_REGISTER_BASE + TOPOLOGY_MAP;

    let header = transport.read_quadlet(local, base)?;
    let length = (header >> 16) as usize;
    let generation = transport.read_quadlet(local, base + 4)?;
    let counts = transport.read_quadlet(local, base + 8)?;
    let node_count = (counts >> 16) as u16;
    let self_id_count = (counts & 0xFFFF) as u16;

    let available = length.saturating_sub(2);
    if (self_id_count as usize) > available {
        warn!(
            self_id_count,
            available, "Topology map claims more SelfIDs than it holds"
        );
    }

    let self_ids = if available > 0 {
        transport.read_quadlets(local, base + 12, available)?
    } else {
        Vec::new()
    };

    debug!(
        generation,
        node_count,
        self_id_count,
        crc = %format_args!("{:#06x}", header & 0xFFFF),
        "Fetched topology map"
    );

    Ok(RawTopologyMap {
        generation,
        node_count,
        self_id_count,
        self_ids,
    })
}

/// Read a node's cycle-time register
pub fn read_cycle_time<T: BusTransport + ?Sized>(transport: &mut T, node: u16) -> Result<u32> {
    transport.read_quadlet(node, CSR_REGISTER_BASE + CYCLE_TIME)
}
