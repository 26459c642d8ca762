//! SelfID packet decoding
//!
//! Every node on the bus broadcasts one to four SelfID quadlets after a bus
//! reset: a packet zero carrying its identity and the state of ports 0-2,
//! optionally followed by "more" packets carrying eight further ports each.
//! [`decode`] turns the quadlets of one node into a [`SelfIdDescriptor`].

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use thiserror::Error;
use tracing::trace;

/// Maximum quadlets a single node may send (packet zero + three more-packets)
pub const MAX_PACKETS: usize = 4;

/// Port slots carried by packet zero
pub const PACKET_ZERO_PORTS: usize = 3;

/// Port slots carried by each more-packet
pub const MORE_PACKET_PORTS: usize = 8;

/// Value of the two designator bits on every SelfID quadlet
pub const SELFID_DESIGNATOR: u8 = 0b10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("SelfID chain truncated: needs {needed} quadlets, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("Quadlet {index} has designator {designator:#04b}, expected 0b10")]
    BadDesignator { index: usize, designator: u8 },
    #[error("More-packet {index} carries sequence number {found}, expected {expected}")]
    UnexpectedSequence { index: usize, expected: u8, found: u8 },
    #[error("Quadlet {index} has the wrong packet kind (extended bit {extended})")]
    WrongPacketKind { index: usize, extended: bool },
    #[error("Continuation flag still set after 4 packets")]
    ChainTooLong,
}

/// How much checking [`decode_with`] performs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeMode {
    /// Only the continuation chain is followed; tag bits are not inspected
    #[default]
    Tolerant,
    /// Designator, packet kind, and more-packet sequence numbers are verified
    Strict,
}

/// Bit position and width of one SelfID field
#[derive(Debug, Clone, Copy)]
struct Field {
    shift: u32,
    width: u32,
}

impl Field {
    const fn new(shift: u32, width: u32) -> Self {
        Self { shift, width }
    }

    fn extract(self, quadlet: u32) -> u32 {
        (quadlet >> self.shift) & ((1 << self.width) - 1)
    }
}

/// Field layout shared by packet zero and more-packets
mod layout {
    use super::Field;

    pub const DESIGNATOR: Field = Field::new(30, 2);
    pub const PHY_ID: Field = Field::new(24, 6);
    pub const EXTENDED: Field = Field::new(23, 1);
    pub const MORE_PACKETS: Field = Field::new(0, 1);

    // packet zero
    pub const LINK_ACTIVE: Field = Field::new(22, 1);
    pub const GAP_COUNT: Field = Field::new(16, 6);
    pub const SPEED: Field = Field::new(14, 2);
    pub const DELAY: Field = Field::new(12, 2);
    pub const CONTENDER: Field = Field::new(11, 1);
    pub const POWER_CLASS: Field = Field::new(8, 3);
    pub const PORTS_ZERO: [Field; 3] = [Field::new(6, 2), Field::new(4, 2), Field::new(2, 2)];
    pub const INITIATED_RESET: Field = Field::new(1, 1);

    // more-packets
    pub const SEQUENCE: Field = Field::new(20, 3);
    pub const RESERVED: Field = Field::new(18, 2);
    pub const PORTS_MORE: [Field; 8] = [
        Field::new(16, 2),
        Field::new(14, 2),
        Field::new(12, 2),
        Field::new(10, 2),
        Field::new(8, 2),
        Field::new(6, 2),
        Field::new(4, 2),
        Field::new(2, 2),
    ];
    pub const RESERVED_BIT: Field = Field::new(1, 1);
}

/// Connection state of one PHY port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    NotPresent,
    NotConnected,
    ParentConnection,
    ChildConnection,
}

impl PortState {
    /// Map a 2-bit port code
    pub fn from_code(code: u32) -> Self {
        match code & 0b11 {
            0 => Self::NotPresent,
            1 => Self::NotConnected,
            2 => Self::ParentConnection,
            _ => Self::ChildConnection,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::NotPresent => 0,
            Self::NotConnected => 1,
            Self::ParentConnection => 2,
            Self::ChildConnection => 3,
        }
    }

    /// Fixed English phrase used in node summaries
    pub fn description(self) -> &'static str {
        match self {
            Self::NotPresent => "Not present",
            Self::NotConnected => "Not connected",
            Self::ParentConnection => "Connected to parent node",
            Self::ChildConnection => "Connected to child node",
        }
    }
}

/// PHY speed code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhySpeed {
    S100,
    S200,
    S400,
    Unknown,
}

impl PhySpeed {
    pub fn from_code(code: u32) -> Self {
        match code & 0b11 {
            0 => Self::S100,
            1 => Self::S200,
            2 => Self::S400,
            _ => Self::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::S100 => "S100",
            Self::S200 => "S200",
            Self::S400 => "S400",
            Self::Unknown => "Unknown",
        }
    }
}

/// First SelfID quadlet of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketZero {
    pub designator: u8,
    pub phy_id: u8,
    /// Packet-kind bit; 0 for packet zero
    pub extended: bool,
    pub link_active: bool,
    pub gap_count: u8,
    pub speed: PhySpeed,
    pub delay: u8,
    /// Contender for isochronous resource manager
    pub contender: bool,
    pub power_class: u8,
    pub ports: [PortState; PACKET_ZERO_PORTS],
    pub initiated_reset: bool,
    pub more_packets: bool,
}

impl PacketZero {
    pub fn decode(quadlet: u32) -> Self {
        trace!(quadlet = %format_args!("{:032b}", quadlet), "Decoding SelfID packet zero");
        Self {
            designator: layout::DESIGNATOR.extract(quadlet) as u8,
            phy_id: layout::PHY_ID.extract(quadlet) as u8,
            extended: layout::EXTENDED.extract(quadlet) == 1,
            link_active: layout::LINK_ACTIVE.extract(quadlet) == 1,
            gap_count: layout::GAP_COUNT.extract(quadlet) as u8,
            speed: PhySpeed::from_code(layout::SPEED.extract(quadlet)),
            delay: layout::DELAY.extract(quadlet) as u8,
            contender: layout::CONTENDER.extract(quadlet) == 1,
            power_class: layout::POWER_CLASS.extract(quadlet) as u8,
            ports: layout::PORTS_ZERO.map(|f| PortState::from_code(f.extract(quadlet))),
            initiated_reset: layout::INITIATED_RESET.extract(quadlet) == 1,
            more_packets: layout::MORE_PACKETS.extract(quadlet) == 1,
        }
    }
}

/// Continuation SelfID quadlet carrying eight more ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MorePacket {
    pub designator: u8,
    pub phy_id: u8,
    /// Packet-kind bit; 1 for more-packets
    pub extended: bool,
    pub sequence: u8,
    pub reserved: u8,
    pub ports: [PortState; MORE_PACKET_PORTS],
    pub reserved_bit: bool,
    pub more_packets: bool,
}

impl MorePacket {
    pub fn decode(quadlet: u32) -> Self {
        trace!(quadlet = %format_args!("{:032b}", quadlet), "Decoding SelfID more-packet");
        Self {
            designator: layout::DESIGNATOR.extract(quadlet) as u8,
            phy_id: layout::PHY_ID.extract(quadlet) as u8,
            extended: layout::EXTENDED.extract(quadlet) == 1,
            sequence: layout::SEQUENCE.extract(quadlet) as u8,
            reserved: layout::RESERVED.extract(quadlet) as u8,
            ports: layout::PORTS_MORE.map(|f| PortState::from_code(f.extract(quadlet))),
            reserved_bit: layout::RESERVED_BIT.extract(quadlet) == 1,
            more_packets: layout::MORE_PACKETS.extract(quadlet) == 1,
        }
    }
}

/// One node's identity, decoded from its chained SelfID quadlets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfIdDescriptor {
    pub zero: PacketZero,
    pub more: Vec<MorePacket>,
}

impl SelfIdDescriptor {
    pub fn phy_id(&self) -> u8 {
        self.zero.phy_id
    }

    pub fn link_active(&self) -> bool {
        self.zero.link_active
    }

    /// Number of quadlets this descriptor was decoded from
    pub fn packet_count(&self) -> usize {
        1 + self.more.len()
    }

    /// All port states in port-number order: ports 0-2, then A-H of each more-packet
    pub fn ports(&self) -> impl Iterator<Item = PortState> + '_ {
        self.zero
            .ports
            .iter()
            .chain(self.more.iter().flat_map(|p| p.ports.iter()))
            .copied()
    }

    pub fn port(&self, number: usize) -> Option<PortState> {
        self.ports().nth(number)
    }

    /// Port numbers that lead to child nodes, ascending
    pub fn child_ports(&self) -> Vec<usize> {
        self.ports()
            .enumerate()
            .filter(|(_, state)| *state == PortState::ChildConnection)
            .map(|(number, _)| number)
            .collect()
    }

    /// Port number that leads to the parent node, if any
    pub fn parent_port(&self) -> Option<usize> {
        self.ports().position(|state| state == PortState::ParentConnection)
    }
}

/// Decode one node's SelfID chain in tolerant mode
///
/// Returns the descriptor and the number of quadlets consumed (1-4).
pub fn decode(entries: &[u32]) -> Result<(SelfIdDescriptor, usize), DecodeError> {
    decode_with(entries, DecodeMode::Tolerant)
}

/// Decode one node's SelfID chain
pub fn decode_with(
    entries: &[u32],
    mode: DecodeMode,
) -> Result<(SelfIdDescriptor, usize), DecodeError> {
    let first = *entries.first().ok_or(DecodeError::Truncated {
        needed: 1,
        available: 0,
    })?;

    let zero = PacketZero::decode(first);
    if mode == DecodeMode::Strict {
        check_designator(0, zero.designator)?;
        if zero.extended {
            return Err(DecodeError::WrongPacketKind {
                index: 0,
                extended: true,
            });
        }
    }

    let mut more: Vec<MorePacket> = Vec::new();
    let mut continues = zero.more_packets;

    while continues {
        let index = 1 + more.len();
        if index == MAX_PACKETS {
            if mode == DecodeMode::Strict {
                return Err(DecodeError::ChainTooLong);
            }
            break;
        }

        let quadlet = *entries.get(index).ok_or(DecodeError::Truncated {
            needed: index + 1,
            available: entries.len(),
        })?;

        let packet = MorePacket::decode(quadlet);
        if mode == DecodeMode::Strict {
            check_designator(index, packet.designator)?;
            if !packet.extended {
                return Err(DecodeError::WrongPacketKind {
                    index,
                    extended: false,
                });
            }
            let expected = (index - 1) as u8;
            if packet.sequence != expected {
                return Err(DecodeError::UnexpectedSequence {
                    index,
                    expected,
                    found: packet.sequence,
                });
            }
        }

        continues = packet.more_packets;
        more.push(packet);
    }

    let consumed = 1 + more.len();
    Ok((SelfIdDescriptor { zero, more }, consumed))
}

fn check_designator(index: usize, designator: u8) -> Result<(), DecodeError> {
    if designator != SELFID_DESIGNATOR {
        return Err(DecodeError::BadDesignator { index, designator });
    }
    Ok(())
}

pub fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

pub fn delay_label(code: u8) -> &'static str {
    if code == 0 {
        "<=144ns"
    } else {
        "Unknown"
    }
}

pub fn power_class_label(code: u8) -> &'static str {
    match code {
        0 => "None",
        1 => "+15W",
        2 => "+30W",
        3 => "+45W",
        4 => "-1W",
        5 => "-3W",
        6 => "-6W",
        7 => "-10W",
        _ => "Error",
    }
}

/// One `Port <n>: <phrase>` line per present port, numbered across all packets
pub fn all_ports_summary(selfid: &SelfIdDescriptor) -> String {
    let mut out = String::new();
    for (number, state) in selfid.ports().enumerate() {
        if state == PortState::NotPresent {
            continue;
        }
        let _ = writeln!(out, "Port {}: {}", number, state.description());
    }
    out
}

/// Multi-line "SelfID Info" block for one node
pub fn selfid_summary(selfid: &SelfIdDescriptor) -> String {
    let zero = &selfid.zero;
    let mut out = String::new();
    let _ = writeln!(out, "SelfID Info");
    let _ = writeln!(out, "-----------");
    let _ = writeln!(out, "Physical ID: {}", zero.phy_id);
    let _ = writeln!(out, "Link active: {}", yes_no(zero.link_active));
    let _ = writeln!(out, "Gap Count: {}", zero.gap_count);
    let _ = writeln!(out, "PHY Speed: {}", zero.speed.label());
    let _ = writeln!(out, "PHY Delay: {}", delay_label(zero.delay));
    let _ = writeln!(out, "IRM Capable: {}", yes_no(zero.contender));
    let _ = writeln!(out, "Power Class: {}", power_class_label(zero.power_class));
    out.push_str(&all_ports_summary(selfid));
    let _ = writeln!(out, "Init. reset: {}", yes_no(zero.initiated_reset));
    out
}
