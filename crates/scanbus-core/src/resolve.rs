//! Vendor and device name resolution
//!
//! Two optional text tables map identifiers to human labels:
//! - GUID table: `<8-hex hi><8-hex lo> <description>\t<0|1 cpu flag>`
//! - OUI table: `<6-hex vendor id> <vendor name>`
//!
//! Lines starting with `#` are comments. A missing table is not an error;
//! lookups against it simply miss.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::Guid;

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Failed to read lookup table {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One entry of the GUID table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidEntry {
    pub label: String,
    /// Node is a general-purpose computer
    pub cpu: bool,
}

/// Injectable name lookup used while reading configuration ROMs
pub trait NameResolver {
    fn resolve_guid(&self, guid: Guid) -> Option<GuidEntry>;
    fn resolve_vendor(&self, vendor_id: u32) -> Option<String>;
}

/// In-memory GUID and OUI tables
#[derive(Debug, Clone, Default)]
pub struct LookupTables {
    guids: HashMap<Guid, GuidEntry>,
    vendors: HashMap<u32, String>,
}

impl LookupTables {
    /// Parse both tables from text
    pub fn from_strs(guid_table: &str, oui_table: &str) -> Self {
        Self {
            guids: parse_guid_table(guid_table),
            vendors: parse_oui_table(oui_table),
        }
    }

    /// Load each table from the first candidate path that exists
    pub fn load(guid_paths: &[PathBuf], oui_paths: &[PathBuf]) -> Result<Self, LookupError> {
        let guids = read_first(guid_paths, "GUID")?
            .map(|text| parse_guid_table(&text))
            .unwrap_or_default();
        let vendors = read_first(oui_paths, "OUI")?
            .map(|text| parse_oui_table(&text))
            .unwrap_or_default();

        info!(
            guids = guids.len(),
            vendors = vendors.len(),
            "Loaded lookup tables"
        );

        Ok(Self { guids, vendors })
    }

    pub fn guid_count(&self) -> usize {
        self.guids.len()
    }

    pub fn vendor_count(&self) -> usize {
        self.vendors.len()
    }

    pub fn insert_guid(&mut self, guid: Guid, entry: GuidEntry) {
        self.guids.insert(guid, entry);
    }

    pub fn insert_vendor(&mut self, vendor_id: u32, name: impl Into<String>) {
        self.vendors.insert(vendor_id, name.into());
    }
}

impl NameResolver for LookupTables {
    fn resolve_guid(&self, guid: Guid) -> Option<GuidEntry> {
        self.guids.get(&guid).cloned()
    }

    fn resolve_vendor(&self, vendor_id: u32) -> Option<String> {
        self.vendors.get(&vendor_id).cloned()
    }
}

fn read_first(paths: &[PathBuf], table: &str) -> Result<Option<String>, LookupError> {
    for path in paths {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                debug!(path = %path.display(), table, "Opened lookup table");
                return Ok(Some(text));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), table, "Lookup table not found");
            }
            Err(source) => {
                return Err(LookupError::IoError {
                    path: path.clone(),
                    source,
                })
            }
        }
    }

    info!(table, "No lookup table found, lookups will miss");
    Ok(None)
}

fn table_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(n, line)| (n + 1, line.trim_end_matches('\r')))
        .filter(|(_, line)| !line.trim().is_empty() && !line.starts_with('#'))
}

fn parse_hex(field: Option<&str>) -> Option<u32> {
    field.and_then(|s| u32::from_str_radix(s, 16).ok())
}

/// Parse the GUID table; malformed lines are skipped
pub fn parse_guid_table(text: &str) -> HashMap<Guid, GuidEntry> {
    let mut guids = HashMap::new();

    for (line_no, line) in table_lines(text) {
        let hi = parse_hex(line.get(0..8));
        let lo = parse_hex(line.get(8..16));
        let (Some(hi), Some(lo)) = (hi, lo) else {
            warn!(line = line_no, "Skipping malformed GUID table line");
            continue;
        };

        let rest = line[16..].trim_start_matches([' ', '\t']);
        let (label, flag) = match rest.split_once('\t') {
            Some((label, flag)) => (label, flag.trim_start_matches([' ', '\t'])),
            None => (rest, ""),
        };

        guids.insert(
            Guid::new(hi, lo),
            GuidEntry {
                label: label.trim_end().to_string(),
                cpu: flag.starts_with('1'),
            },
        );
    }

    guids
}

/// Parse the OUI table; malformed lines are skipped
pub fn parse_oui_table(text: &str) -> HashMap<u32, String> {
    let mut vendors = HashMap::new();

    for (line_no, line) in table_lines(text) {
        let Some(oui) = parse_hex(line.get(0..6)) else {
            warn!(line = line_no, "Skipping malformed OUI table line");
            continue;
        };
        vendors.insert(oui, line[6..].trim().to_string());
    }

    vendors
}

/// Default search paths for a table: working directory first, then `sysconf_dir`
pub fn default_search_paths(file_name: &str, sysconf_dir: &Path) -> Vec<PathBuf> {
    vec![PathBuf::from(file_name), sysconf_dir.join(file_name)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const GUIDS: &str = "\
# GUID table
0800460101020304 Sony DCR-TRV900\t0
00a0b8d000000001\tLinux Box\t1

zzzzzzzz00000000 broken
0000000100000002 No flag here
";

    const OUIS: &str = "\
# vendor table
080046 Sony Corporation
00A0B8  Symbios Logic
xyz
";

    #[test]
    fn test_parse_guid_table() {
        let guids = parse_guid_table(GUIDS);
        assert_eq!(guids.len(), 3);

        let sony = &guids[&Guid::new(0x0800_4601, 0x0102_0304)];
        assert_eq!(sony.label, "Sony DCR-TRV900");
        assert!(!sony.cpu);

        let linux = &guids[&Guid::new(0x00a0_b8d0, 0x0000_0001)];
        assert_eq!(linux.label, "Linux Box");
        assert!(linux.cpu);

        let bare = &guids[&Guid::new(1, 2)];
        assert_eq!(bare.label, "No flag here");
        assert!(!bare.cpu);
    }

    #[test]
    fn test_parse_oui_table() {
        let vendors = parse_oui_table(OUIS);
        assert_eq!(vendors.len(), 2);
        assert_eq!(vendors[&0x080046], "Sony Corporation");
        assert_eq!(vendors[&0x00A0B8], "Symbios Logic");
    }

    #[test]
    fn test_missing_files_are_empty_tables() {
        let dir = tempfile::tempdir().unwrap();
        let tables = LookupTables::load(
            &[dir.path().join("guid-resolv.conf")],
            &[dir.path().join("oui-resolv.conf")],
        )
        .unwrap();

        assert_eq!(tables.guid_count(), 0);
        assert_eq!(tables.vendor_count(), 0);
        assert!(tables.resolve_vendor(0x080046).is_none());
        assert!(tables.resolve_guid(Guid::new(1, 2)).is_none());
    }

    #[test]
    fn test_load_uses_first_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let sysconf = dir.path().join("etc");
        std::fs::create_dir(&sysconf).unwrap();

        let mut oui = std::fs::File::create(sysconf.join("oui-resolv.conf")).unwrap();
        writeln!(oui, "080046 Sony").unwrap();

        let oui_paths = vec![dir.path().join("oui-resolv.conf"), sysconf.join("oui-resolv.conf")];
        let tables = LookupTables::load(&[], &oui_paths).unwrap();

        assert_eq!(tables.resolve_vendor(0x080046).as_deref(), Some("Sony"));
    }

    #[test]
    fn test_default_search_paths() {
        let paths = default_search_paths("guid-resolv.conf", Path::new("/etc"));
        assert_eq!(
            paths,
            vec![
                PathBuf::from("guid-resolv.conf"),
                PathBuf::from("/etc/guid-resolv.conf")
            ]
        );
    }
}
