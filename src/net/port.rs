//! Port allocation for the private listeners spun up per CONNECT.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

/// What a private listener is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// TLS interception of a CONNECT tunnel.
    Https,
    /// Plain listener serving a sniffed upgrade request.
    Upgrade,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::Https => f.write_str("https"),
            ListenerKind::Upgrade => f.write_str("upgrade"),
        }
    }
}

pub trait PortAllocator: Send + Sync + 'static {
    /// Port to bind; `0` lets the OS choose.
    fn allocate(&self, kind: ListenerKind) -> u16;

    /// Returns a port once its listener is gone.
    fn release(&self, _port: u16) {}
}

/// Always lets the OS pick.
#[derive(Debug, Clone, Copy, Default)]
pub struct EphemeralPorts;

impl PortAllocator for EphemeralPorts {
    fn allocate(&self, _kind: ListenerKind) -> u16 {
        0
    }
}

/// A port range that is empty or includes port `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid port range [{start}, {end}]")]
pub struct InvalidPortRange {
    pub start: u16,
    pub end: u16,
}

/// Hands out ports from an inclusive range, round robin, skipping leased ones.
/// Falls back to `0` when the range is exhausted.
#[derive(Debug)]
pub struct PortRange {
    start: u16,
    end: u16,
    cursor: AtomicU32,
    leased: DashMap<u16, ListenerKind>,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, InvalidPortRange> {
        if start == 0 || start > end {
            return Err(InvalidPortRange { start, end });
        }
        Ok(Self {
            start,
            end,
            cursor: AtomicU32::new(0),
            leased: DashMap::new(),
        })
    }

    pub fn leased(&self) -> usize {
        self.leased.len()
    }
}

impl PortAllocator for PortRange {
    fn allocate(&self, kind: ListenerKind) -> u16 {
        let span = u32::from(self.end - self.start) + 1;
        for _ in 0..span {
            let offset = self.cursor.fetch_add(1, Ordering::Relaxed) % span;
            let port = self.start + offset as u16;
            if let Entry::Vacant(slot) = self.leased.entry(port) {
                slot.insert(kind);
                return port;
            }
        }
        tracing::warn!(start = self.start, end = self.end, %kind, "Port range exhausted, using an ephemeral port");
        0
    }

    fn release(&self, port: u16) {
        self.leased.remove(&port);
    }
}

/// Releases a port back to its allocator when dropped.
pub struct PortLease {
    ports: Arc<dyn PortAllocator>,
    port: u16,
}

impl PortLease {
    pub fn acquire(ports: &Arc<dyn PortAllocator>, kind: ListenerKind) -> Self {
        Self {
            ports: Arc::clone(ports),
            port: ports.allocate(kind),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if self.port != 0 {
            self.ports.release(self.port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_skips_leased_ports_and_exhausts_to_zero() {
        let range = PortRange::new(40000, 40001).unwrap();
        let a = range.allocate(ListenerKind::Https);
        let b = range.allocate(ListenerKind::Upgrade);
        assert_ne!(a, b);
        assert_eq!(range.allocate(ListenerKind::Https), 0);

        range.release(a);
        assert_eq!(range.allocate(ListenerKind::Https), a);
    }

    #[test]
    fn lease_releases_on_drop() {
        let range = Arc::new(PortRange::new(41000, 41010).unwrap());
        let ports: Arc<dyn PortAllocator> = range.clone();
        {
            let lease = PortLease::acquire(&ports, ListenerKind::Https);
            assert!((41000..=41010).contains(&lease.port()));
            assert_eq!(range.leased(), 1);
        }
        assert_eq!(range.leased(), 0);
    }

    #[test]
    fn inverted_or_zero_ranges_are_rejected() {
        assert_eq!(
            PortRange::new(5000, 4000).unwrap_err(),
            InvalidPortRange { start: 5000, end: 4000 }
        );
        assert!(PortRange::new(0, 10).is_err());

        let single = PortRange::new(65535, 65535).unwrap();
        assert_eq!(single.allocate(ListenerKind::Upgrade), 65535);
        assert_eq!(single.allocate(ListenerKind::Upgrade), 0);
    }

    #[test]
    fn ephemeral_is_zero() {
        assert_eq!(EphemeralPorts.allocate(ListenerKind::Upgrade), 0);
    }
}
