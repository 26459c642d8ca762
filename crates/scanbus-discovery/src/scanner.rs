//! Scanner service that keeps the current topology up to date

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use scanbus_core::{TopologyGraph, TopologyTree};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ScanConfig;
use crate::session::{BusResetNotifier, BusSession, NodeWarning, ScanError};

/// A complete topology together with when and for which generation it was built
///
/// `reset_generation` counts bus resets seen by the notifier. The map's own
/// generation is `tree.generation()`.
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    pub reset_generation: u32,
    pub built_at: DateTime<Utc>,
    pub tree: TopologyTree,
    pub warnings: Vec<NodeWarning>,
}

impl TopologySnapshot {
    pub fn export(&self) -> SnapshotExport {
        SnapshotExport {
            reset_generation: self.reset_generation,
            built_at: self.built_at,
            topology: self.tree.to_graph(),
            warnings: self.warnings.clone(),
        }
    }
}

/// Serializable form of a [`TopologySnapshot`]
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotExport {
    pub reset_generation: u32,
    pub built_at: DateTime<Utc>,
    pub topology: TopologyGraph,
    pub warnings: Vec<NodeWarning>,
}

impl SnapshotExport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Scanner event for real-time updates
///
/// Generations in events are reset generations, as in [`TopologySnapshot`].
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// Build started for this generation
    ScanStarted { generation: u32 },
    /// A new snapshot replaced the previous one
    TopologyUpdated { generation: u32, nodes: usize },
    /// Build ran across a bus reset and was thrown away
    ScanDiscarded { expected: u32, current: u32 },
    /// Build failed; the previous snapshot stays current
    ScanFailed { error: String },
}

/// Bus scanner service
pub struct BusScanner {
    config: ScanConfig,
    session: Arc<Mutex<BusSession>>,
    resets: BusResetNotifier,
    current: Arc<RwLock<Option<Arc<TopologySnapshot>>>>,
    event_tx: broadcast::Sender<ScanEvent>,
}

impl BusScanner {
    pub fn new(session: BusSession, config: ScanConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let resets = session.reset_notifier();
        Self {
            config,
            session: Arc::new(Mutex::new(session)),
            resets,
            current: Arc::new(RwLock::new(None)),
            event_tx,
        }
    }

    /// Subscribe to scanner events
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.event_tx.subscribe()
    }

    /// Handle for reporting bus resets to this scanner
    pub fn reset_notifier(&self) -> BusResetNotifier {
        self.resets.clone()
    }

    /// Latest complete snapshot, if any build has succeeded
    pub async fn current(&self) -> Option<Arc<TopologySnapshot>> {
        self.current.read().await.clone()
    }

    /// Shared access to the session, e.g. for FCP transactions between scans
    pub fn session(&self) -> Arc<Mutex<BusSession>> {
        self.session.clone()
    }

    /// Run a single topology build and publish the result
    ///
    /// The build runs on the blocking pool. Readers keep seeing the previous
    /// snapshot until the new one is complete.
    pub async fn scan_once(&self) -> Result<Arc<TopologySnapshot>> {
        let generation = self.resets.current();
        let _ = self.event_tx.send(ScanEvent::ScanStarted { generation });

        let session = self.session.clone();
        let outcome = tokio::task::spawn_blocking(move || session.blocking_lock().build_topology())
            .await
            .context("Topology build task panicked")?;

        let scan = match outcome {
            Ok(scan) => scan,
            Err(ScanError::StaleGeneration { expected, current }) => {
                let _ = self
                    .event_tx
                    .send(ScanEvent::ScanDiscarded { expected, current });
                return Err(ScanError::StaleGeneration { expected, current }.into());
            }
            Err(e) => {
                let _ = self.event_tx.send(ScanEvent::ScanFailed {
                    error: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let snapshot = Arc::new(TopologySnapshot {
            reset_generation: scan.reset_generation,
            built_at: Utc::now(),
            tree: scan.tree,
            warnings: scan.warnings,
        });

        *self.current.write().await = Some(snapshot.clone());

        let _ = self.event_tx.send(ScanEvent::TopologyUpdated {
            generation: snapshot.reset_generation,
            nodes: snapshot.tree.len(),
        });

        info!(
            generation = snapshot.reset_generation,
            map_generation = snapshot.tree.generation(),
            nodes = snapshot.tree.len(),
            "Topology snapshot updated"
        );

        Ok(snapshot)
    }

    /// Run continuous scanning in background
    ///
    /// Every bus reset (and startup) is followed by `reset_settle_rescans`
    /// rebuilds. With a non-zero `rescan_interval_secs` the bus is also
    /// rescanned periodically. Runs until the task is cancelled.
    pub async fn run(&self) -> Result<()> {
        let mut resets = self.resets.subscribe();
        let settle = self.config.reset_settle_rescans.max(1);
        let settle_delay = Duration::from_millis(self.config.settle_delay_ms);
        let periodic = self.config.rescan_interval_secs > 0;
        let period = Duration::from_secs(self.config.rescan_interval_secs);

        info!(settle, periodic, "Bus scanner started");
        let mut remaining = settle;

        loop {
            while remaining > 0 {
                remaining -= 1;
                if let Err(e) = self.scan_once().await {
                    warn!(error = %e, "Topology scan failed");
                }
                if remaining > 0 {
                    tokio::time::sleep(settle_delay).await;
                }
            }

            tokio::select! {
                changed = resets.changed() => {
                    if changed.is_err() {
                        info!("Reset notifier closed, scanner stopping");
                        return Ok(());
                    }
                    let generation = *resets.borrow_and_update();
                    debug!(generation, "Rescanning after bus reset");
                    remaining = settle;
                }
                _ = tokio::time::sleep(period), if periodic => {
                    debug!("Periodic rescan");
                    remaining = 1;
                }
            }
        }
    }
}
