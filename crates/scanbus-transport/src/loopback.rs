//! In-memory bus for tests and offline inspection
//!
//! Each node is a sparse byte-addressed register space. Reads of bytes that
//! were never written fail with [`TransportError::AddressError`], like an
//! unimplemented CSR on real hardware.

use std::collections::{HashMap, HashSet};

use scanbus_core::device::Guid;
use scanbus_core::RawTopologyMap;
use tracing::trace;

use crate::csr::{node_address, CONFIG_ROM, CSR_REGISTER_BASE, TOPOLOGY_MAP};
use crate::rom::{BUS_INFO_LENGTH, BUS_MAGIC};
use crate::transport::{BusTransport, Result, TransportError};

#[derive(Debug, Default)]
pub struct LoopbackBus {
    local_id: u16,
    nodes: HashMap<u16, HashMap<u64, u8>>,
    disconnected: HashSet<u16>,
    busy: u32,
    transactions: usize,
}

impl LoopbackBus {
    pub fn new(local_id: u16) -> Self {
        let mut bus = Self {
            local_id,
            ..Default::default()
        };
        bus.add_node(local_id);
        bus
    }

    pub fn add_node(&mut self, node: u16) {
        self.nodes.entry(node).or_default();
    }

    /// Answer the next `count` transactions with `TryAgain`
    pub fn inject_busy(&mut self, count: u32) {
        self.busy = count;
    }

    /// Fail every further transaction with `node`
    pub fn disconnect(&mut self, node: u16) {
        self.disconnected.insert(node);
    }

    /// Transactions attempted so far, including failed ones
    pub fn transaction_count(&self) -> usize {
        self.transactions
    }

    /// Store raw bytes without going through a transaction
    pub fn poke(&mut self, node: u16, offset: u64, data: &[u8]) {
        let memory = self.nodes.entry(node).or_default();
        for (i, byte) in data.iter().enumerate() {
            memory.insert(offset + i as u64, *byte);
        }
    }

    /// Store quadlets in big-endian order
    pub fn poke_quadlets(&mut self, node: u16, offset: u64, quadlets: &[u32]) {
        let bytes: Vec<u8> = quadlets.iter().flat_map(|q| q.to_be_bytes()).collect();
        self.poke(node, offset, &bytes);
    }

    /// Raw bytes at `offset`, if all of them have been written
    pub fn peek(&self, node: u16, offset: u64, len: usize) -> Option<Vec<u8>> {
        let memory = self.nodes.get(&node)?;
        (0..len as u64)
            .map(|i| memory.get(&(offset + i)).copied())
            .collect()
    }

    /// Place a configuration ROM image at the node's config-ROM base
    pub fn install_rom(&mut self, phy_id: u8, rom: &[u32]) {
        self.poke_quadlets(node_address(phy_id), CSR_REGISTER_BASE + CONFIG_ROM, rom);
    }

    /// Place a topology map in the local node's topology-map registers
    pub fn install_topology_map(&mut self, map: &RawTopologyMap) {
        let length = map.self_ids.len() as u32 + 2;
        let mut quadlets = vec![
            length << 16,
            map.generation,
            ((map.node_count as u32) << 16) | map.self_id_count as u32,
        ];
        quadlets.extend_from_slice(&map.self_ids);
        self.poke_quadlets(self.local_id, CSR_REGISTER_BASE + TOPOLOGY_MAP, &quadlets);
    }

    fn begin(&mut self, node: u16, offset: u64) -> Result<()> {
        self.transactions += 1;
        if self.busy > 0 {
            self.busy -= 1;
            return Err(TransportError::TryAgain { node });
        }
        if self.disconnected.contains(&node) || !self.nodes.contains_key(&node) {
            return Err(TransportError::Failed {
                node,
                offset,
                reason: "no acknowledge".to_string(),
            });
        }
        Ok(())
    }
}

impl BusTransport for LoopbackBus {
    fn read(&mut self, node: u16, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.begin(node, offset)?;
        let bytes = self
            .peek(node, offset, buf.len())
            .ok_or(TransportError::AddressError { node, offset })?;
        buf.copy_from_slice(&bytes);
        trace!(node, offset, len = buf.len(), "Loopback read");
        Ok(())
    }

    fn write(&mut self, node: u16, offset: u64, data: &[u8]) -> Result<()> {
        self.begin(node, offset)?;
        self.poke(node, offset, data);
        trace!(node, offset, len = data.len(), "Loopback write");
        Ok(())
    }

    fn local_id(&self) -> u16 {
        self.local_id
    }
}

/// Builder for synthetic configuration ROM images
///
/// Layout: bus-info block, root directory, optional unit directory, then
/// the textual leaves of both directories in insertion order.
#[derive(Debug, Clone)]
pub struct ConfigRomBuilder {
    magic: u32,
    bus_info_length: u32,
    bus_options: u32,
    guid: Guid,
    root: Vec<Entry>,
    unit: Option<Vec<Entry>>,
}

#[derive(Debug, Clone)]
enum Entry {
    Immediate(u8, u32),
    Leaf(u8, Vec<u32>),
}

impl ConfigRomBuilder {
    pub fn new(guid: Guid) -> Self {
        Self {
            magic: BUS_MAGIC,
            bus_info_length: BUS_INFO_LENGTH,
            bus_options: 0,
            guid,
            root: Vec::new(),
            unit: None,
        }
    }

    pub fn magic(mut self, magic: u32) -> Self {
        self.magic = magic;
        self
    }

    pub fn bus_info_length(mut self, length: u32) -> Self {
        self.bus_info_length = length;
        self
    }

    pub fn bus_options(mut self, options: u32) -> Self {
        self.bus_options = options;
        self
    }

    pub fn root_entry(mut self, key: u8, value: u32) -> Self {
        self.root.push(Entry::Immediate(key, value));
        self
    }

    /// Root-directory textual leaf (key 0x81)
    pub fn root_text(mut self, text: &str) -> Self {
        self.root.push(Entry::Leaf(0x81, text_leaf(text)));
        self
    }

    /// Root-directory leaf with caller-supplied contents
    pub fn root_raw_leaf(mut self, key: u8, quadlets: Vec<u32>) -> Self {
        self.root.push(Entry::Leaf(key, quadlets));
        self
    }

    pub fn unit_entry(mut self, key: u8, value: u32) -> Self {
        self.unit
            .get_or_insert_with(Vec::new)
            .push(Entry::Immediate(key, value));
        self
    }

    /// Unit-directory textual leaf (key 0xD1)
    pub fn unit_text(mut self, text: &str) -> Self {
        self.unit
            .get_or_insert_with(Vec::new)
            .push(Entry::Leaf(0xD1, text_leaf(text)));
        self
    }

    pub fn build(&self) -> Vec<u32> {
        let mut rom = vec![
            (self.bus_info_length << 24),
            self.magic,
            self.bus_options,
            self.guid.hi,
            self.guid.lo,
        ];

        let root_len = self.root.len() + usize::from(self.unit.is_some());
        let root_start = rom.len();
        let unit_start = root_start + 1 + root_len;
        let unit_len = self.unit.as_ref().map(Vec::len).unwrap_or(0);
        let mut leaf_start = unit_start + self.unit.as_ref().map(|_| 1 + unit_len).unwrap_or(0);
        let mut leaves: Vec<u32> = Vec::new();

        let mut place = |entries: &[Entry], dir_start: usize, out: &mut Vec<u32>| {
            for (i, entry) in entries.iter().enumerate() {
                let entry_index = dir_start + 1 + i;
                match entry {
                    Entry::Immediate(key, value) => {
                        out.push(((*key as u32) << 24) | (value & 0xFF_FFFF));
                    }
                    Entry::Leaf(key, quadlets) => {
                        let delta = (leaf_start - entry_index) as u32;
                        out.push(((*key as u32) << 24) | delta);
                        leaf_start += quadlets.len();
                        leaves.extend_from_slice(quadlets);
                    }
                }
            }
        };

        rom.push((root_len as u32) << 16);
        place(&self.root, root_start, &mut rom);
        if let Some(unit) = &self.unit {
            let entry_index = root_start + 1 + self.root.len();
            rom.push((0xD1 << 24) | (unit_start - entry_index) as u32);
            rom.push((unit_len as u32) << 16);
            place(unit, unit_start, &mut rom);
        }

        rom.extend(leaves);
        rom
    }
}

/// Minimal ASCII textual leaf: header, two descriptor quadlets, padded text
pub fn text_leaf(text: &str) -> Vec<u32> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }

    let text_quadlets: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let mut leaf = vec![((text_quadlets.len() as u32 + 2) << 16), 0, 0];
    leaf.extend(text_quadlets);
    leaf
}
