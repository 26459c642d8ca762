//! Bus session: the transport, lookup tables, and generation tracking of one bus

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use scanbus_core::device::{DeviceInfo, Guid};
use scanbus_core::{DecodeMode, NameResolver, TopologyError, TopologyTree};
use scanbus_transport::{
    fcp_transaction, fetch_topology_map, read_cycle_time, read_device_info, rom, BusTransport,
    FcpError, FcpResponder, FcpResponse, RetryingTransport, RomWarning, TransportError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Failed to read topology map: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("Bus reset to generation {current} while scanning generation {expected}")]
    StaleGeneration { expected: u32, current: u32 },
}

/// Shared record of the latest bus generation
///
/// The bus driver's reset handler calls [`notify`](Self::notify); sessions
/// and scanners hold clones and compare generations around each build.
#[derive(Debug, Clone)]
pub struct BusResetNotifier {
    latest: Arc<AtomicU32>,
    tx: Arc<watch::Sender<u32>>,
}

impl BusResetNotifier {
    pub fn new(generation: u32) -> Self {
        let (tx, _) = watch::channel(generation);
        Self {
            latest: Arc::new(AtomicU32::new(generation)),
            tx: Arc::new(tx),
        }
    }

    /// Record a bus reset; generations never move backwards
    pub fn notify(&self, generation: u32) {
        let previous = self.latest.fetch_max(generation, Ordering::SeqCst);
        if generation > previous {
            info!(previous, generation, "Bus reset");
            self.tx.send_replace(generation);
        }
    }

    pub fn current(&self) -> u32 {
        self.latest.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<u32> {
        self.tx.subscribe()
    }
}

impl Default for BusResetNotifier {
    fn default() -> Self {
        Self::new(0)
    }
}

/// ROM problem reported for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeWarning {
    pub phy_id: u8,
    pub warning: RomWarning,
}

/// Result of one successful topology build
#[derive(Debug, Clone)]
pub struct BusScan {
    /// Generation reported by the [`BusResetNotifier`]; the tree carries the
    /// generation read from the topology map
    pub reset_generation: u32,
    pub tree: TopologyTree,
    pub warnings: Vec<NodeWarning>,
}

pub type SharedResolver = Arc<dyn NameResolver + Send + Sync>;

pub struct BusSession {
    transport: RetryingTransport<Box<dyn BusTransport + Send>>,
    resolver: SharedResolver,
    mode: DecodeMode,
    fcp_send_retries: u32,
    resets: BusResetNotifier,
}

impl BusSession {
    pub fn new(
        transport: Box<dyn BusTransport + Send>,
        resolver: SharedResolver,
        config: &ScannerConfig,
    ) -> Self {
        Self {
            transport: RetryingTransport::new(transport, config.transport.retry_policy()),
            resolver,
            mode: config.decoder.mode(),
            fcp_send_retries: config.transport.fcp_send_retries,
            resets: BusResetNotifier::default(),
        }
    }

    /// Share an existing notifier, e.g. one already wired to the bus driver
    pub fn with_reset_notifier(mut self, resets: BusResetNotifier) -> Self {
        self.resets = resets;
        self
    }

    pub fn reset_notifier(&self) -> BusResetNotifier {
        self.resets.clone()
    }

    pub fn decode_mode(&self) -> DecodeMode {
        self.mode
    }

    /// Fetch the topology map and build the tree, reading every ROM
    ///
    /// Fails with [`ScanError::StaleGeneration`] if a bus reset was reported
    /// while the build was running.
    pub fn build_topology(&mut self) -> Result<BusScan, ScanError> {
        let expected = self.resets.current();
        let map = fetch_topology_map(&mut self.transport)?;
        debug!(
            generation = expected,
            map_generation = map.generation,
            nodes = map.node_count,
            "Building topology"
        );

        let transport = &mut self.transport;
        let resolver = self.resolver.as_ref();
        let resets = &self.resets;
        let mut warnings = Vec::new();

        let tree = TopologyTree::build_with(&map, self.mode, |phy_id| {
            if resets.current() != expected {
                // results would be discarded anyway
                return DeviceInfo::default();
            }
            let read = read_device_info(&mut *transport, phy_id, resolver);
            warnings.extend(
                read.warnings
                    .into_iter()
                    .map(|warning| NodeWarning { phy_id, warning }),
            );
            read.info
        })?;

        let current = self.resets.current();
        if current != expected {
            warn!(expected, current, "Discarding topology built across a bus reset");
            return Err(ScanError::StaleGeneration { expected, current });
        }

        info!(
            generation = expected,
            nodes = tree.len(),
            depth = tree.depth(),
            warnings = warnings.len(),
            "Topology built"
        );

        Ok(BusScan {
            reset_generation: expected,
            tree,
            warnings,
        })
    }

    /// Cycle-time register of the local node; answers only if the local node is alive
    pub fn local_cycle_time(&mut self) -> Result<u32, TransportError> {
        let local = self.transport.local_id();
        read_cycle_time(&mut self.transport, local)
    }

    pub fn read_guid(&mut self, phy_id: u8) -> Guid {
        rom::read_guid(&mut self.transport, phy_id)
    }

    /// Run one FCP request/response transaction with the node `phy_id`
    pub fn fcp_transaction<R: FcpResponder + ?Sized>(
        &mut self,
        responder: &mut R,
        phy_id: u8,
        command: &[u32],
    ) -> Result<FcpResponse, FcpError> {
        fcp_transaction(
            &mut self.transport,
            responder,
            phy_id,
            command,
            self.fcp_send_retries,
        )
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use scanbus_core::device::Guid;
    use scanbus_core::RawTopologyMap;
    use scanbus_transport::csr::node_address;
    use scanbus_transport::{BusTransport, ConfigRomBuilder, LoopbackBus, TransportError};
    use std::sync::{Arc, Mutex};

    /// Loopback bus that stays reachable from the test after being handed to a session
    #[derive(Clone)]
    pub struct SharedBus(pub Arc<Mutex<LoopbackBus>>);

    impl SharedBus {
        pub fn new(bus: LoopbackBus) -> Self {
            Self(Arc::new(Mutex::new(bus)))
        }
    }

    impl BusTransport for SharedBus {
        fn read(&mut self, node: u16, offset: u64, buf: &mut [u8]) -> Result<(), TransportError> {
            self.0.lock().unwrap().read(node, offset, buf)
        }

        fn write(&mut self, node: u16, offset: u64, data: &[u8]) -> Result<(), TransportError> {
            self.0.lock().unwrap().write(node, offset, data)
        }

        fn local_id(&self) -> u16 {
            self.0.lock().unwrap().local_id()
        }
    }

    /// Three link-active nodes in a chain: 2 (root, local) - 1 - 0
    ///
    /// Node 1 is an AV/C device, node 2 an SBP-2 disk, and node 0 has a
    /// ROM with a bad bus name.
    pub fn chain_bus() -> LoopbackBus {
        let mut bus = LoopbackBus::new(node_address(2));
        bus.add_node(node_address(0));
        bus.add_node(node_address(1));

        bus.install_topology_map(&RawTopologyMap::new(
            3,
            3,
            vec![0x8040_0080, 0x8140_00B0, 0x8240_00C0],
        ));

        bus.install_rom(
            0,
            &ConfigRomBuilder::new(Guid::new(0, 1)).magic(0).build(),
        );
        bus.install_rom(
            1,
            &ConfigRomBuilder::new(Guid::new(0x0800_4601, 2))
                .root_entry(0x03, 0x080046)
                .root_text("Camcorder")
                .unit_entry(0x12, 0xA02D)
                .unit_entry(0x13, 0x10000)
                .build(),
        );
        bus.install_rom(
            2,
            &ConfigRomBuilder::new(Guid::new(0x00d0_4b00, 3))
                .unit_entry(0x12, 0x609E)
                .unit_entry(0x13, 0x10483)
                .build(),
        );
        bus
    }
}

#[cfg(test)]
mod tests {
    use super::testing::chain_bus;
    use super::*;
    use scanbus_core::{LookupTables, NodeType};
    use scanbus_transport::csr::{node_address, CSR_REGISTER_BASE, CYCLE_TIME};
    use scanbus_transport::{LoopbackBus, ResponseCode};
    use std::collections::VecDeque;

    fn session_for(transport: Box<dyn BusTransport + Send>) -> BusSession {
        let mut config = ScannerConfig::default();
        config.transport.retry_delay_ms = 0;
        BusSession::new(transport, Arc::new(LookupTables::default()), &config)
    }

    /// Reports a bus reset the first time `node` is read
    struct ResetDuringRead {
        bus: LoopbackBus,
        resets: BusResetNotifier,
        node: u16,
    }

    impl BusTransport for ResetDuringRead {
        fn read(&mut self, node: u16, offset: u64, buf: &mut [u8]) -> Result<(), TransportError> {
            if node == self.node && self.resets.current() == 0 {
                self.resets.notify(1);
            }
            self.bus.read(node, offset, buf)
        }

        fn write(&mut self, node: u16, offset: u64, data: &[u8]) -> Result<(), TransportError> {
            self.bus.write(node, offset, data)
        }

        fn local_id(&self) -> u16 {
            self.bus.local_id()
        }
    }

    #[test]
    fn test_build_topology_with_malformed_rom() {
        let mut session = session_for(Box::new(chain_bus()));
        let scan = session.build_topology().unwrap();

        assert_eq!(scan.tree.len(), 3);
        assert_eq!(scan.tree.depth(), 2);

        let tree = &scan.tree;
        assert_eq!(tree.node(0).unwrap().info.node_type, NodeType::Unknown);
        assert_eq!(tree.node(1).unwrap().info.node_type, NodeType::AvcDevice);
        assert_eq!(tree.node(1).unwrap().label, "Camcorder");
        assert_eq!(tree.node(2).unwrap().info.node_type, NodeType::Sbp2Storage);
        assert_eq!(tree.root().label, "SBP2 Device");

        assert_eq!(
            scan.warnings,
            vec![NodeWarning {
                phy_id: 0,
                warning: RomWarning::BadMagic { found: 0 }
            }]
        );
    }

    #[test]
    fn test_busy_bus_is_retried() {
        let mut bus = chain_bus();
        bus.inject_busy(4);
        let mut session = session_for(Box::new(bus));
        assert_eq!(session.build_topology().unwrap().tree.len(), 3);
    }

    #[test]
    fn test_reset_during_build_is_stale() {
        let resets = BusResetNotifier::new(0);
        let transport = ResetDuringRead {
            bus: chain_bus(),
            resets: resets.clone(),
            node: node_address(1),
        };
        let mut session = session_for(Box::new(transport)).with_reset_notifier(resets.clone());

        let err = session.build_topology().unwrap_err();
        assert!(matches!(
            err,
            ScanError::StaleGeneration {
                expected: 0,
                current: 1
            }
        ));

        // the next build runs entirely within generation 1
        let scan = session.build_topology().unwrap();
        assert_eq!(scan.reset_generation, 1);
        // chain_bus installs a map of generation 3
        assert_eq!(scan.tree.generation(), 3);
    }

    #[test]
    fn test_missing_topology_map() {
        let bus = LoopbackBus::new(node_address(0));
        let mut session = session_for(Box::new(bus));
        assert!(matches!(
            session.build_topology(),
            Err(ScanError::Transport(TransportError::AddressError { .. }))
        ));
    }

    #[test]
    fn test_notifier_never_goes_backwards() {
        let resets = BusResetNotifier::new(4);
        let mut rx = resets.subscribe();

        resets.notify(2);
        assert_eq!(resets.current(), 4);
        assert!(!rx.has_changed().unwrap());

        resets.notify(6);
        assert_eq!(resets.current(), 6);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 6);
    }

    #[test]
    fn test_local_cycle_time_and_guid() {
        let mut bus = chain_bus();
        bus.poke_quadlets(node_address(2), CSR_REGISTER_BASE + CYCLE_TIME, &[0xabcd]);
        let mut session = session_for(Box::new(bus));

        assert_eq!(session.local_cycle_time().unwrap(), 0xabcd);
        assert_eq!(session.read_guid(1), Guid::new(0x0800_4601, 2));
        assert!(session.read_guid(7).is_zero());
    }

    #[test]
    fn test_fcp_transaction_through_session() {
        let mut session = session_for(Box::new(chain_bus()));
        let mut responses: VecDeque<Vec<u8>> = VecDeque::from(vec![
            0x0F00_0000u32.to_be_bytes().to_vec(),
            0x0900_0000u32.to_be_bytes().to_vec(),
        ]);

        let response = session
            .fcp_transaction(&mut responses, 1, &[0x0020_C375])
            .unwrap();
        assert_eq!(response.code(), ResponseCode::Accepted);
    }
}
