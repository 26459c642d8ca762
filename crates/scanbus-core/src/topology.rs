//! Bus topology tree reconstructed from SelfID packets
//!
//! Nodes live in one arena indexed by SelfID order (lowest physical ID
//! first). Parent and child links are arena indices. The last node in the
//! SelfID stream is the root.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::device::{DeviceInfo, Guid, NodeType, UNKNOWN_LABEL};
use crate::selfid::{decode_with, DecodeError, DecodeMode, PhySpeed, SelfIdDescriptor};

/// Arena index of a node; equals its position in the SelfID stream
pub type NodeIndex = usize;

/// Physical IDs are six bits wide and 63 is the broadcast address
pub const MAX_NODES: usize = 63;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Invalid SelfID stream: {0}")]
    Decode(#[from] DecodeError),
    #[error("Topology map contains no SelfID packets")]
    EmptyMap,
    #[error("SelfID stream describes {count} nodes, a bus holds at most 63")]
    TooManyNodes { count: usize },
    #[error("Topology map declares {declared} nodes but SelfID stream describes {decoded}")]
    NodeCountMismatch { declared: usize, decoded: usize },
    #[error("Inconsistent port graph at node {phy_id}: {reason}")]
    InconsistentPortGraph { phy_id: u8, reason: String },
}

/// Raw topology map as fetched from the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTopologyMap {
    pub generation: u32,
    pub node_count: u16,
    pub self_id_count: u16,
    pub self_ids: Vec<u32>,
}

impl RawTopologyMap {
    pub fn new(generation: u32, node_count: u16, self_ids: Vec<u32>) -> Self {
        Self {
            generation,
            node_count,
            self_id_count: u16::try_from(self_ids.len()).unwrap_or(u16::MAX),
            self_ids,
        }
    }

    /// The SelfID quadlets covered by `self_id_count`
    ///
    /// Fails if fewer quadlets were fetched than the count announces.
    pub fn entries(&self) -> Result<&[u32], DecodeError> {
        let count = self.self_id_count as usize;
        self.self_ids.get(..count).ok_or(DecodeError::Truncated {
            needed: count,
            available: self.self_ids.len(),
        })
    }
}

/// One vertex of the topology tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyNode {
    pub selfid: SelfIdDescriptor,
    pub info: DeviceInfo,
    /// Display label
    pub label: String,
    parent: Option<NodeIndex>,
    /// Child nodes in ascending port order
    children: Vec<NodeIndex>,
}

impl TopologyNode {
    fn new(selfid: SelfIdDescriptor, info: DeviceInfo) -> Self {
        let label = display_label(&info);
        Self {
            selfid,
            info,
            label,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn phy_id(&self) -> u8 {
        self.selfid.phy_id()
    }

    pub fn parent(&self) -> Option<NodeIndex> {
        self.parent
    }

    pub fn children(&self) -> &[NodeIndex] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// SelfID and ROM summary of this node
    pub fn summary(&self) -> String {
        format!(
            "{}\n{}",
            crate::selfid::selfid_summary(&self.selfid),
            self.info.summary()
        )
    }
}

/// The ROM label if it names the device, else a label derived from the node type
fn display_label(info: &DeviceInfo) -> String {
    if !info.label.is_empty() && info.label != UNKNOWN_LABEL {
        return info.label.clone();
    }
    info.node_type
        .fallback_label()
        .unwrap_or(UNKNOWN_LABEL)
        .to_string()
}

/// Topology tree for one bus generation
#[derive(Debug, Clone, Serialize)]
pub struct TopologyTree {
    generation: u32,
    nodes: Vec<TopologyNode>,
    root: NodeIndex,
}

impl TopologyTree {
    /// Build the tree in tolerant decode mode
    pub fn build<F>(map: &RawTopologyMap, read_rom: F) -> Result<Self, TopologyError>
    where
        F: FnMut(u8) -> DeviceInfo,
    {
        Self::build_with(map, DecodeMode::Tolerant, read_rom)
    }

    /// Build the tree from a raw topology map
    ///
    /// `read_rom` is called once per link-active node with its physical ID;
    /// link-inactive nodes get a default [`DeviceInfo`]. The whole SelfID
    /// stream is decoded before the first ROM read.
    pub fn build_with<F>(
        map: &RawTopologyMap,
        mode: DecodeMode,
        mut read_rom: F,
    ) -> Result<Self, TopologyError>
    where
        F: FnMut(u8) -> DeviceInfo,
    {
        let selfids = decode_all(map.entries()?, mode)?;
        if selfids.is_empty() {
            return Err(TopologyError::EmptyMap);
        }
        // bounds the recursion of the claim pass
        if selfids.len() > MAX_NODES {
            return Err(TopologyError::TooManyNodes {
                count: selfids.len(),
            });
        }
        if selfids.len() != map.node_count as usize {
            return Err(TopologyError::NodeCountMismatch {
                declared: map.node_count as usize,
                decoded: selfids.len(),
            });
        }

        let mut nodes: Vec<TopologyNode> = selfids
            .into_iter()
            .map(|selfid| {
                let info = if selfid.link_active() {
                    read_rom(selfid.phy_id())
                } else {
                    DeviceInfo::default()
                };
                TopologyNode::new(selfid, info)
            })
            .collect();

        let root = nodes.len() - 1;
        let unclaimed = attach_subtree(&mut nodes, root, None, root)?;
        if unclaimed != 0 {
            return Err(TopologyError::InconsistentPortGraph {
                phy_id: nodes[root].phy_id(),
                reason: format!("{} nodes are not reachable from the root", unclaimed),
            });
        }

        debug!(
            generation = map.generation,
            nodes = nodes.len(),
            root = nodes[root].phy_id(),
            "Built topology tree"
        );

        Ok(Self {
            generation: map.generation,
            nodes,
            root,
        })
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[TopologyNode] {
        &self.nodes
    }

    pub fn node(&self, index: NodeIndex) -> Option<&TopologyNode> {
        self.nodes.get(index)
    }

    pub fn find_by_phy_id(&self, phy_id: u8) -> Option<NodeIndex> {
        self.nodes.iter().position(|n| n.phy_id() == phy_id)
    }

    pub fn root_index(&self) -> NodeIndex {
        self.root
    }

    pub fn root(&self) -> &TopologyNode {
        &self.nodes[self.root]
    }

    /// Follow parent links from `index` to the node without a parent
    pub fn root_of(&self, index: NodeIndex) -> Option<NodeIndex> {
        let mut current = index;
        let mut node = self.nodes.get(current)?;
        while let Some(parent) = node.parent {
            current = parent;
            node = &self.nodes[current];
        }
        Some(current)
    }

    /// Longest root-to-leaf path; a lone root has depth 0
    pub fn depth(&self) -> usize {
        self.subtree_depth(self.root)
    }

    fn subtree_depth(&self, index: NodeIndex) -> usize {
        self.nodes[index]
            .children
            .iter()
            .map(|&child| 1 + self.subtree_depth(child))
            .max()
            .unwrap_or(0)
    }

    /// Distance of `index` from the root
    pub fn level(&self, index: NodeIndex) -> Option<usize> {
        let mut node = self.nodes.get(index)?;
        let mut level = 0;
        while let Some(parent) = node.parent {
            level += 1;
            node = &self.nodes[parent];
        }
        Some(level)
    }

    pub fn child_count(&self, index: NodeIndex) -> usize {
        self.nodes.get(index).map(|n| n.children.len()).unwrap_or(0)
    }

    /// The `n`th child (1-based) in ascending port order
    pub fn nth_child(&self, index: NodeIndex, n: usize) -> Option<NodeIndex> {
        let node = self.nodes.get(index)?;
        n.checked_sub(1).and_then(|i| node.children.get(i)).copied()
    }

    /// Lowest arena index within the subtree rooted at `index`
    pub fn lowest_indexed_node(&self, index: NodeIndex) -> Option<NodeIndex> {
        let node = self.nodes.get(index)?;
        Some(
            node.children
                .iter()
                .filter_map(|&child| self.lowest_indexed_node(child))
                .fold(index, usize::min),
        )
    }

    /// Serializable snapshot of the tree for export
    pub fn to_graph(&self) -> TopologyGraph {
        let phy = |i: NodeIndex| self.nodes[i].phy_id();
        TopologyGraph {
            generation: self.generation,
            root: phy(self.root),
            depth: self.depth(),
            nodes: self
                .nodes
                .iter()
                .map(|node| GraphNode {
                    phy_id: node.phy_id(),
                    label: node.label.clone(),
                    vendor: node.info.vendor.clone(),
                    guid: node.info.guid,
                    node_type: node.info.node_type,
                    speed: node.selfid.zero.speed,
                    link_active: node.selfid.link_active(),
                    parent: node.parent.map(phy),
                    children: node.children.iter().map(|&c| phy(c)).collect(),
                })
                .collect(),
        }
    }
}

fn decode_all(entries: &[u32], mode: DecodeMode) -> Result<Vec<SelfIdDescriptor>, DecodeError> {
    let mut selfids = Vec::new();
    let mut position = 0;

    while position < entries.len() {
        let (selfid, consumed) = decode_with(&entries[position..], mode)?;
        trace!(
            position,
            consumed,
            phy_id = selfid.phy_id(),
            "Decoded SelfID"
        );
        position += consumed;
        selfids.push(selfid);
    }

    Ok(selfids)
}

/// Attach the subtree rooted at `index` and return how many slots stay unclaimed
///
/// Slots `0..unclaimed` are still free. The node's children occupy the
/// slots directly below it: the child on the highest-numbered port sits
/// immediately below the parent, its own subtree below that, then the next
/// lower port's child.
fn attach_subtree(
    nodes: &mut [TopologyNode],
    index: NodeIndex,
    parent: Option<NodeIndex>,
    mut unclaimed: usize,
) -> Result<usize, TopologyError> {
    nodes[index].parent = parent;
    let child_ports = nodes[index].selfid.child_ports();

    let mut children = Vec::with_capacity(child_ports.len());
    for &port in child_ports.iter().rev() {
        if unclaimed == 0 {
            return Err(TopologyError::InconsistentPortGraph {
                phy_id: nodes[index].phy_id(),
                reason: format!("port {} leads to a child but no nodes remain", port),
            });
        }
        let child = unclaimed - 1;
        trace!(
            parent = nodes[index].phy_id(),
            port,
            child = nodes[child].phy_id(),
            "Linked child"
        );
        unclaimed = attach_subtree(nodes, child, Some(index), child)?;
        children.push(child);
    }

    children.reverse();
    nodes[index].children = children;
    Ok(unclaimed)
}

/// Tree export with links expressed as physical IDs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyGraph {
    pub generation: u32,
    pub root: u8,
    pub depth: usize,
    pub nodes: Vec<GraphNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub phy_id: u8,
    pub label: String,
    pub vendor: String,
    pub guid: Guid,
    pub node_type: NodeType,
    pub speed: PhySpeed,
    pub link_active: bool,
    pub parent: Option<u8>,
    pub children: Vec<u8>,
}

impl TopologyGraph {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Build a synthetic topology map of `node_count` nodes
///
/// Nodes are laid out from the root down. Every non-root node has its parent
/// on port 0. A node above the current leaf budget gets a child on port 1
/// and, when `branch(phy_id)` says so, a second child on port 2, which adds
/// one more leaf to the budget. All nodes are link-inactive, so building the
/// resulting map never touches a bus.
pub fn generate_test_map<F>(node_count: u8, mut branch: F) -> RawTopologyMap
where
    F: FnMut(u8) -> bool,
{
    const PARENT_ON_PORT0: u32 = 2 << 6;
    const CHILD_ON_PORT1: u32 = 3 << 4;
    const CHILD_ON_PORT2: u32 = 3 << 2;

    let count = node_count.min(MAX_NODES as u8);
    let mut self_ids = vec![0u32; count as usize];
    let mut leaves = 0u8;

    for phy_id in (0..count).rev() {
        let mut quadlet = 0x8000_0000 | ((phy_id as u32) << 24);
        if phy_id + 1 < count {
            quadlet |= PARENT_ON_PORT0;
        }
        if phy_id > leaves {
            quadlet |= CHILD_ON_PORT1;
            if phy_id > leaves + 1 && branch(phy_id) {
                quadlet |= CHILD_ON_PORT2;
                leaves += 1;
            }
        }
        self_ids[phy_id as usize] = quadlet;
    }

    RawTopologyMap::new(0, count as u16, self_ids)
}
