//! Register transport abstraction with bounded retry

use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Errors surfaced by a [`BusTransport`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Node {node:#06x} is busy, try again")]
    TryAgain { node: u16 },
    #[error("Transaction with node {node:#06x} at {offset:#014x} failed: {reason}")]
    Failed {
        node: u16,
        offset: u64,
        reason: String,
    },
    #[error("Node {node:#06x} has no register at {offset:#014x}")]
    AddressError { node: u16, offset: u64 },
    #[error("Node {node:#06x} still busy after {attempts} attempts")]
    RetriesExhausted { node: u16, attempts: u32 },
}

impl TransportError {
    /// Transient condition worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TryAgain { .. })
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Asynchronous register access to nodes on the bus
///
/// `node` is a full destination ID (`0xffc0 | phy_id` on the local bus);
/// `offset` is an absolute 48-bit CSR address. Register contents are
/// big-endian on the wire; the quadlet helpers convert to host order.
pub trait BusTransport {
    fn read(&mut self, node: u16, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, node: u16, offset: u64, data: &[u8]) -> Result<()>;

    /// Destination ID of the node this transport is attached to
    fn local_id(&self) -> u16;

    fn read_quadlet(&mut self, node: u16, offset: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(node, offset, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Block read of `count` consecutive quadlets
    fn read_quadlets(&mut self, node: u16, offset: u64, count: usize) -> Result<Vec<u32>> {
        let mut buf = vec![0u8; count * 4];
        self.read(node, offset, &mut buf)?;
        Ok(buf
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn write_quadlet(&mut self, node: u16, offset: u64, value: u32) -> Result<()> {
        self.write(node, offset, &value.to_be_bytes())
    }

    fn write_quadlets(&mut self, node: u16, offset: u64, values: &[u32]) -> Result<()> {
        let buf: Vec<u8> = values.iter().flat_map(|q| q.to_be_bytes()).collect();
        self.write(node, offset, &buf)
    }
}

impl<T: BusTransport + ?Sized> BusTransport for &mut T {
    fn read(&mut self, node: u16, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read(node, offset, buf)
    }

    fn write(&mut self, node: u16, offset: u64, data: &[u8]) -> Result<()> {
        (**self).write(node, offset, data)
    }

    fn local_id(&self) -> u16 {
        (**self).local_id()
    }
}

impl<T: BusTransport + ?Sized> BusTransport for Box<T> {
    fn read(&mut self, node: u16, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read(node, offset, buf)
    }

    fn write(&mut self, node: u16, offset: u64, data: &[u8]) -> Result<()> {
        (**self).write(node, offset, data)
    }

    fn local_id(&self) -> u16 {
        (**self).local_id()
    }
}

/// Maximum attempts per transaction
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Pause between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Bounded retry on [`TransportError::TryAgain`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Run `op` until it succeeds, fails for good, or the attempts run out
    ///
    /// Only `TryAgain` is retried; every other error is returned at once.
    pub fn run<T, F>(&self, node: u16, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let attempts = self.max_attempts.max(1);
        for attempt in 1..=attempts {
            match op() {
                Err(e) if e.is_retryable() => {
                    trace!(node = %format_args!("{:#06x}", node), attempt, "Node busy, retrying");
                    if attempt < attempts {
                        std::thread::sleep(self.delay);
                    }
                }
                other => return other,
            }
        }

        debug!(node = %format_args!("{:#06x}", node), attempts, "Giving up on busy node");
        Err(TransportError::RetriesExhausted { node, attempts })
    }
}

/// Transport decorator that applies a [`RetryPolicy`] to every transaction
pub struct RetryingTransport<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T: BusTransport> RetryingTransport<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: BusTransport> BusTransport for RetryingTransport<T> {
    fn read(&mut self, node: u16, offset: u64, buf: &mut [u8]) -> Result<()> {
        let inner = &mut self.inner;
        self.policy.run(node, || inner.read(node, offset, buf))
    }

    fn write(&mut self, node: u16, offset: u64, data: &[u8]) -> Result<()> {
        let inner = &mut self.inner;
        self.policy.run(node, || inner.write(node, offset, data))
    }

    fn local_id(&self) -> u16 {
        self.inner.local_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackBus;

    const NODE: u16 = 0xffc1;
    const REG: u64 = 0xFFFF_F000_0400;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(0))
    }

    #[test]
    fn test_quadlet_byte_order_round_trip() {
        let mut bus = LoopbackBus::new(0xffc0);
        bus.add_node(NODE);

        bus.write_quadlet(NODE, REG, 0x3133_3934).unwrap();
        assert_eq!(bus.peek(NODE, REG, 4), Some(vec![0x31, 0x33, 0x39, 0x34]));
        assert_eq!(bus.read_quadlet(NODE, REG).unwrap(), 0x3133_3934);

        bus.write_quadlets(NODE, REG + 4, &[1, 0xdead_beef]).unwrap();
        assert_eq!(
            bus.read_quadlets(NODE, REG + 4, 2).unwrap(),
            vec![1, 0xdead_beef]
        );
    }

    #[test]
    fn test_retry_recovers_from_busy_node() {
        let mut bus = LoopbackBus::new(0xffc0);
        bus.add_node(NODE);
        bus.write_quadlet(NODE, REG, 42).unwrap();
        bus.inject_busy(3);

        let mut transport = RetryingTransport::new(bus, fast_policy(20));
        assert_eq!(transport.read_quadlet(NODE, REG).unwrap(), 42);
        // three busy answers plus the successful one
        assert_eq!(transport.inner().transaction_count(), 5);
    }

    #[test]
    fn test_retry_gives_up_after_max_attempts() {
        let mut bus = LoopbackBus::new(0xffc0);
        bus.add_node(NODE);
        bus.inject_busy(100);

        let mut transport = RetryingTransport::new(bus, fast_policy(20));
        let before = transport.inner().transaction_count();
        assert_eq!(
            transport.read_quadlet(NODE, REG),
            Err(TransportError::RetriesExhausted {
                node: NODE,
                attempts: 20
            })
        );
        assert_eq!(transport.inner().transaction_count() - before, 20);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let mut bus = LoopbackBus::new(0xffc0);
        bus.add_node(NODE);

        let mut transport = RetryingTransport::new(bus, fast_policy(20));
        let err = transport.read_quadlet(NODE, REG).unwrap_err();
        assert_eq!(err, TransportError::AddressError { node: NODE, offset: REG });
        assert_eq!(transport.inner().transaction_count(), 1);
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 20);
        assert_eq!(policy.delay, Duration::from_millis(10));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn test_boxed_transport() {
        let mut bus = LoopbackBus::new(0xffc0);
        bus.add_node(NODE);
        let mut boxed: Box<dyn BusTransport> = Box::new(bus);
        boxed.write_quadlet(NODE, REG, 7).unwrap();
        assert_eq!(boxed.read_quadlet(NODE, REG).unwrap(), 7);
        assert_eq!(boxed.local_id(), 0xffc0);
    }
}
