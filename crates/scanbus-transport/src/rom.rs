//! Configuration ROM reader
//!
//! Walks the bus-info block, the root directory, and the first unit
//! directory of a node, then reads the textual leaves both directories
//! point at. Every problem is local to the node: the walk returns whatever
//! it gathered plus a list of [`RomWarning`]s and never fails as a whole.

use scanbus_core::device::{BusInfo, DeviceInfo, Guid};
use scanbus_core::NameResolver;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::csr::{node_address, CONFIG_ROM, CSR_REGISTER_BASE};
use crate::transport::{BusTransport, TransportError};

/// "1394" in ASCII
pub const BUS_MAGIC: u32 = 0x3133_3934;

/// Bus-info block length in quadlets, from the ROM header
pub const BUS_INFO_LENGTH: u32 = 4;

/// Textual leaves shorter than this many bytes carry no text
const MIN_LEAF_BYTES: usize = 12;

/// Longest textual leaf accepted, in bytes
const MAX_LEAF_BYTES: usize = 256;

mod keys {
    pub const VENDOR_ID: u8 = 0x03;
    pub const NODE_CAPABILITIES: u8 = 0x0C;
    pub const UNIT_SPEC_ID: u8 = 0x12;
    pub const UNIT_SW_VERSION: u8 = 0x13;
    pub const MODEL_ID: u8 = 0x17;
    pub const TEXTUAL_LEAF: u8 = 0x81;
    /// Unit directory in the root directory, textual leaf in a unit directory
    pub const DIRECTORY_OR_LEAF: u8 = 0xD1;
}

/// Non-fatal problem found while reading one node's ROM
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RomWarning {
    #[error("Bus info block length is {found} quadlets, expected 4")]
    BadRomLength { found: u32 },
    #[error("Bus name quadlet is {found:#010x}, expected \"1394\"")]
    BadMagic { found: u32 },
    #[error("Textual leaf at {offset:#014x} is {length} bytes long")]
    BadLeafLength { offset: u64, length: usize },
    #[error("Read at {offset:#014x} failed: {reason}")]
    ReadFailed { offset: u64, reason: String },
}

/// Outcome of a ROM walk
#[derive(Debug, Clone)]
pub struct RomRead {
    pub info: DeviceInfo,
    pub warnings: Vec<RomWarning>,
}

impl RomRead {
    pub fn is_complete(&self) -> bool {
        self.warnings.is_empty()
    }
}

struct RomWalker<'a, T: ?Sized> {
    transport: &'a mut T,
    node: u16,
    warnings: Vec<RomWarning>,
}

impl<T: BusTransport + ?Sized> RomWalker<'_, T> {
    fn quadlet(&mut self, offset: u64) -> Option<u32> {
        match self.transport.read_quadlet(self.node, offset) {
            Ok(q) => Some(q),
            Err(e) => {
                self.fail(offset, &e);
                None
            }
        }
    }

    fn fail(&mut self, offset: u64, error: &TransportError) {
        warn!(
            node = %format_args!("{:#06x}", self.node),
            offset = %format_args!("{:#014x}", offset),
            error = %error,
            "ROM read failed"
        );
        self.warnings.push(RomWarning::ReadFailed {
            offset,
            reason: error.to_string(),
        });
    }

    /// Walk one directory, handing every (key, value, entry address) to `visit`
    fn directory<F>(&mut self, start: u64, mut visit: F) -> Option<()>
    where
        F: FnMut(u8, u32, u64),
    {
        let header = self.quadlet(start)?;
        let length = (header >> 16) as u64;
        trace!(offset = %format_args!("{:#014x}", start), length, "Reading directory");

        for i in 1..=length {
            let entry_addr = start + i * 4;
            let entry = self.quadlet(entry_addr)?;
            visit((entry >> 24) as u8, entry & 0xFF_FFFF, entry_addr);
        }
        Some(())
    }

    fn textual_leaf(&mut self, offset: u64) -> Option<String> {
        let header = self.quadlet(offset)?;
        let length = (header >> 16) as usize * 4;
        if !(MIN_LEAF_BYTES..=MAX_LEAF_BYTES).contains(&length) {
            warn!(
                node = %format_args!("{:#06x}", self.node),
                offset = %format_args!("{:#014x}", offset),
                length,
                "Ignoring textual leaf with bad length"
            );
            self.warnings.push(RomWarning::BadLeafLength { offset, length });
            return None;
        }

        // header, then specifier ID and language quadlets
        let text_len = length - 8;
        let mut bytes = Vec::with_capacity(text_len);
        let mut addr = offset + 12;
        while bytes.len() < text_len {
            let q = self.quadlet(addr)?;
            let take = (text_len - bytes.len()).min(4);
            bytes.extend_from_slice(&q.to_be_bytes()[..take]);
            addr += 4;
        }

        if let Some(end) = bytes.iter().position(|&b| b == 0) {
            bytes.truncate(end);
        }
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Read and resolve the configuration ROM of the node with `phy_id`
pub fn read_device_info<T: BusTransport + ?Sized>(
    transport: &mut T,
    phy_id: u8,
    resolver: &dyn NameResolver,
) -> RomRead {
    let mut walker = RomWalker {
        transport,
        node: node_address(phy_id),
        warnings: Vec::new(),
    };

    let info = match walk(&mut walker) {
        Some(mut info) => {
            info.resolve(resolver);
            info
        }
        None => DeviceInfo::default(),
    };

    debug!(
        phy_id,
        guid = %info.guid,
        label = %info.label,
        node_type = ?info.node_type,
        warnings = walker.warnings.len(),
        "Read configuration ROM"
    );

    RomRead {
        info,
        warnings: walker.warnings,
    }
}

/// Returns `None` when the bus-info block is unusable
fn walk<T: BusTransport + ?Sized>(walker: &mut RomWalker<'_, T>) -> Option<DeviceInfo> {
    let base = CSR_REGISTER_BASE + CONFIG_ROM;

    let header = walker.quadlet(base)?;
    let bus_info_length = header >> 24;
    if bus_info_length != BUS_INFO_LENGTH {
        warn!(phy_id = walker.node & 0x3f, found = bus_info_length, "Wrong bus info block length");
        walker.warnings.push(RomWarning::BadRomLength {
            found: bus_info_length,
        });
        return None;
    }

    let magic = walker.quadlet(base + 4)?;
    if magic != BUS_MAGIC {
        warn!(phy_id = walker.node & 0x3f, magic = %format_args!("{:#010x}", magic), "Wrong magic quadlet");
        walker.warnings.push(RomWarning::BadMagic { found: magic });
        return None;
    }

    let options = walker.quadlet(base + 8)?;
    let guid_hi = walker.quadlet(base + 12)?;
    let guid_lo = walker.quadlet(base + 16)?;

    let mut info = DeviceInfo {
        magic,
        bus_info: BusInfo::from_quadlet(options),
        guid: Guid::new(guid_hi, guid_lo),
        ..Default::default()
    };

    let mut leaves = Vec::new();
    let mut unit_directory = None;

    // a failed directory read keeps what was gathered so far
    let root_ok = walker
        .directory(base + 20, |key, value, addr| match key {
            keys::NODE_CAPABILITIES => info.node_capabilities = value,
            keys::VENDOR_ID => info.vendor_id = value,
            keys::TEXTUAL_LEAF => leaves.push(addr + value as u64 * 4),
            keys::DIRECTORY_OR_LEAF => unit_directory = Some(addr + value as u64 * 4),
            _ => debug!(key = %format_args!("{:#04x}", key), value, "Unknown root directory key"),
        })
        .is_some();

    if let (true, Some(unit)) = (root_ok, unit_directory) {
        walker.directory(unit, |key, value, addr| match key {
            keys::UNIT_SPEC_ID => info.unit_spec_id = value,
            keys::UNIT_SW_VERSION => info.unit_sw_version = value,
            keys::MODEL_ID => info.model_id = value,
            keys::DIRECTORY_OR_LEAF => leaves.push(addr + value as u64 * 4),
            _ => debug!(key = %format_args!("{:#04x}", key), value, "Unknown unit directory key"),
        });
    }

    info.textual_leaves = leaves
        .into_iter()
        .map(|offset| walker.textual_leaf(offset))
        .collect();

    Some(info)
}

/// Read only the GUID of a node; a zero GUID if it cannot be read
pub fn read_guid<T: BusTransport + ?Sized>(transport: &mut T, phy_id: u8) -> Guid {
    let node = node_address(phy_id);
    let base = CSR_REGISTER_BASE + CONFIG_ROM;

    let hi = transport.read_quadlet(node, base + 12);
    let lo = transport.read_quadlet(node, base + 16);
    match (hi, lo) {
        (Ok(hi), Ok(lo)) => Guid::new(hi, lo),
        (Err(e), _) | (_, Err(e)) => {
            debug!(phy_id, error = %e, "Could not read GUID");
            Guid::default()
        }
    }
}
