//! Device metadata read from a node's configuration ROM

use serde::{Deserialize, Serialize};

use crate::resolve::NameResolver;

/// Unit specifier ID of the 1394 Trade Association
pub const UNIT_SPEC_1394TA: u32 = 0xA02D;

/// Unit specifier ID used by SBP-2 storage devices
pub const UNIT_SPEC_NCITS: u32 = 0x609E;

/// Unit software version of SBP-2 storage devices
pub const UNIT_SW_SBP2: u32 = 0x10483;

/// Unit software versions of configurable digital cameras
pub const UNIT_SW_CAMERA: [u32; 3] = [0x100, 0x101, 0x102];

/// Unit software versions of AV/C devices
pub const UNIT_SW_AVC: [u32; 2] = [0x10000, 0x10001];

/// Label used wherever nothing better is known
pub const UNKNOWN_LABEL: &str = "Unknown";

/// 64-bit globally unique node identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guid {
    pub hi: u32,
    pub lo: u32,
}

impl Guid {
    pub fn new(hi: u32, lo: u32) -> Self {
        Self { hi, lo }
    }

    pub fn as_u64(&self) -> u64 {
        ((self.hi as u64) << 32) | self.lo as u64
    }

    pub fn is_zero(&self) -> bool {
        self.hi == 0 && self.lo == 0
    }

    /// Company ID (OUI) carried in the top 24 bits
    pub fn company_id(&self) -> u32 {
        self.hi >> 8
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode_upper(self.as_u64().to_be_bytes()))
    }
}

/// Classified role of a node, derived from its unit directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    Unknown,
    ConfigurableCamera,
    AvcDevice,
    Sbp2Storage,
    GenericComputer,
}

impl NodeType {
    /// Display label used when the ROM does not name the device
    pub fn fallback_label(self) -> Option<&'static str> {
        match self {
            Self::ConfigurableCamera | Self::AvcDevice => Some("AV/C Device"),
            Self::Sbp2Storage => Some("SBP2 Device"),
            Self::GenericComputer | Self::Unknown => None,
        }
    }
}

/// Capability flags and limits from the bus-info block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusInfo {
    pub irm_capable: bool,
    pub cycle_master_capable: bool,
    pub iso_capable: bool,
    pub bus_manager_capable: bool,
    pub cycle_clock_accuracy: u8,
    /// Maximum async payload code; payload is 2^(max_rec+1) bytes
    pub max_rec: u8,
}

impl BusInfo {
    pub fn from_quadlet(quadlet: u32) -> Self {
        Self {
            irm_capable: quadlet >> 31 == 1,
            cycle_master_capable: (quadlet >> 30) & 1 == 1,
            iso_capable: (quadlet >> 29) & 1 == 1,
            bus_manager_capable: (quadlet >> 28) & 1 == 1,
            cycle_clock_accuracy: ((quadlet >> 16) & 0xFF) as u8,
            max_rec: ((quadlet >> 12) & 0xF) as u8,
        }
    }

    pub fn max_async_payload(&self) -> usize {
        1 << (self.max_rec as usize + 1)
    }
}

/// Static per-node metadata from the configuration ROM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Bus name quadlet; "1394" in ASCII on a well-formed ROM
    pub magic: u32,
    pub bus_info: BusInfo,
    pub guid: Guid,
    pub node_capabilities: u32,
    pub vendor_id: u32,
    pub unit_spec_id: u32,
    pub unit_sw_version: u32,
    pub model_id: u32,
    /// Textual leaves in directory order; unreadable leaves are `None`
    pub textual_leaves: Vec<Option<String>>,
    pub label: String,
    pub vendor: String,
    pub node_type: NodeType,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            magic: 0,
            bus_info: BusInfo::default(),
            guid: Guid::default(),
            node_capabilities: 0,
            vendor_id: 0,
            unit_spec_id: 0,
            unit_sw_version: 0,
            model_id: 0,
            textual_leaves: Vec::new(),
            label: UNKNOWN_LABEL.to_string(),
            vendor: UNKNOWN_LABEL.to_string(),
            node_type: NodeType::Unknown,
        }
    }
}

impl DeviceInfo {
    /// Fill in label, vendor name, and node type from the raw ROM fields
    ///
    /// The label prefers a GUID table entry, then the first textual leaf.
    pub fn resolve(&mut self, resolver: &dyn NameResolver) {
        let guid_entry = resolver.resolve_guid(self.guid);

        self.label = guid_entry
            .as_ref()
            .map(|entry| entry.label.clone())
            .or_else(|| self.textual_leaves.first().cloned().flatten())
            .unwrap_or_else(|| UNKNOWN_LABEL.to_string());

        self.vendor = resolver
            .resolve_vendor(self.vendor_id)
            .unwrap_or_else(|| UNKNOWN_LABEL.to_string());

        self.node_type = classify(
            self.unit_spec_id,
            self.unit_sw_version,
            guid_entry.map(|entry| entry.cpu).unwrap_or(false),
        );
    }

    /// Textual leaves that could be read, in directory order
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.textual_leaves.iter().filter_map(|t| t.as_deref())
    }

    /// Multi-line "CSR ROM Info" block
    pub fn summary(&self) -> String {
        let mut out = String::from("CSR ROM Info\n------------\n");
        out.push_str(&format!("GUID: {}\n", self.guid));
        out.push_str(&format!("Node Capabilities: 0x{:08X}\n", self.node_capabilities));
        out.push_str(&format!("Vendor ID: 0x{:08X}\n", self.vendor_id));
        out.push_str(&format!("Unit Spec ID: 0x{:08X}\n", self.unit_spec_id));
        out.push_str(&format!("Unit SW Version: 0x{:08X}\n", self.unit_sw_version));
        out.push_str(&format!("Model ID: 0x{:08X}\n", self.model_id));
        out.push_str(&format!("Nr. Textual Leafes: {}\n", self.textual_leaves.len()));
        out.push_str(&format!("Vendor: {}\n", self.vendor));
        out.push_str("Textual Leafes:");
        for text in self.texts() {
            out.push('\n');
            out.push_str(text);
        }
        out.push('\n');
        out
    }
}

/// Classify a node from its unit directory
///
/// `known_cpu` is only consulted when the unit directory names no known
/// protocol; it comes from the GUID table's CPU flag.
pub fn classify(unit_spec_id: u32, unit_sw_version: u32, known_cpu: bool) -> NodeType {
    if unit_spec_id == UNIT_SPEC_1394TA {
        if UNIT_SW_CAMERA.contains(&unit_sw_version) {
            return NodeType::ConfigurableCamera;
        }
        if UNIT_SW_AVC.contains(&unit_sw_version) {
            return NodeType::AvcDevice;
        }
        return NodeType::Unknown;
    }

    if unit_spec_id == UNIT_SPEC_NCITS && unit_sw_version == UNIT_SW_SBP2 {
        return NodeType::Sbp2Storage;
    }

    if known_cpu {
        NodeType::GenericComputer
    } else {
        NodeType::Unknown
    }
}

/// Firmware revision of a configurable camera, from its unit software version
pub fn camera_sw_version_label(unit_sw_version: u32) -> &'static str {
    match unit_sw_version & 0xFF_FFFF {
        0x000101 => "1.20",
        0x000100 => "1.04",
        _ => UNKNOWN_LABEL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::LookupTables;

    #[test]
    fn test_classify() {
        assert_eq!(classify(0xA02D, 0x10000, false), NodeType::AvcDevice);
        assert_eq!(classify(0xA02D, 0x10001, true), NodeType::AvcDevice);
        assert_eq!(classify(0xA02D, 0x101, false), NodeType::ConfigurableCamera);
        assert_eq!(classify(0x609E, 0x10483, false), NodeType::Sbp2Storage);
        assert_eq!(classify(0, 0, true), NodeType::GenericComputer);
        assert_eq!(classify(0, 0, false), NodeType::Unknown);
    }

    #[test]
    fn test_classify_cpu_flag_ignored_for_1394ta_units() {
        // An unrecognised 1394TA unit never falls through to the CPU check
        assert_eq!(classify(0xA02D, 0x999, true), NodeType::Unknown);
        // A non-SBP2 NCITS unit does
        assert_eq!(classify(0x609E, 0x1, true), NodeType::GenericComputer);
    }

    #[test]
    fn test_bus_info_from_quadlet() {
        let info = BusInfo::from_quadlet(0xE064_A002);
        assert!(info.irm_capable);
        assert!(info.cycle_master_capable);
        assert!(info.iso_capable);
        assert!(!info.bus_manager_capable);
        assert_eq!(info.cycle_clock_accuracy, 0x64);
        assert_eq!(info.max_rec, 0xA);
        assert_eq!(info.max_async_payload(), 2048);
    }

    #[test]
    fn test_guid_display() {
        let guid = Guid::new(0x0800_4601, 0x0102_abcd);
        assert_eq!(guid.to_string(), "0x080046010102ABCD");
        assert_eq!(guid.company_id(), 0x080046);
        assert!(Guid::default().is_zero());
    }

    #[test]
    fn test_resolve_without_tables() {
        let mut info = DeviceInfo {
            textual_leaves: vec![None, Some("DV Camcorder".to_string())],
            unit_spec_id: 0xA02D,
            unit_sw_version: 0x10000,
            ..Default::default()
        };
        info.resolve(&LookupTables::default());

        // the first leaf is unreadable, so no leaf label is taken
        assert_eq!(info.label, "Unknown");
        assert_eq!(info.vendor, "Unknown");
        assert_eq!(info.node_type, NodeType::AvcDevice);
        assert_eq!(info.texts().collect::<Vec<_>>(), vec!["DV Camcorder"]);
    }

    #[test]
    fn test_resolve_prefers_guid_table() {
        let tables = LookupTables::from_strs(
            "0800460101020304 Studio Mac\t1\n",
            "080046 Sony\n",
        );
        let mut info = DeviceInfo {
            guid: Guid::new(0x0800_4601, 0x0102_0304),
            vendor_id: 0x080046,
            textual_leaves: vec![Some("From ROM".to_string())],
            ..Default::default()
        };
        info.resolve(&tables);

        assert_eq!(info.label, "Studio Mac");
        assert_eq!(info.vendor, "Sony");
        assert_eq!(info.node_type, NodeType::GenericComputer);
    }

    #[test]
    fn test_summary() {
        let info = DeviceInfo {
            vendor_id: 0x080046,
            textual_leaves: vec![Some("Sony".to_string()), None],
            ..Default::default()
        };
        let summary = info.summary();
        assert!(summary.contains("Vendor ID: 0x00080046\n"));
        assert!(summary.contains("Nr. Textual Leafes: 2\n"));
        assert!(summary.ends_with("Textual Leafes:\nSony\n"));
    }

    #[test]
    fn test_camera_sw_version_label() {
        assert_eq!(camera_sw_version_label(0x000101), "1.20");
        assert_eq!(camera_sw_version_label(0xFF000100), "1.04");
        assert_eq!(camera_sw_version_label(0x102), "Unknown");
    }

    #[test]
    fn test_fallback_label() {
        assert_eq!(NodeType::AvcDevice.fallback_label(), Some("AV/C Device"));
        assert_eq!(NodeType::ConfigurableCamera.fallback_label(), Some("AV/C Device"));
        assert_eq!(NodeType::Sbp2Storage.fallback_label(), Some("SBP2 Device"));
        assert_eq!(NodeType::Unknown.fallback_label(), None);
    }
}
