//! Local port allocation for replicas.
//!
//! The allocator hands out ports from a fixed range `[base, base+capacity)`.
//! It keeps no persistence of its own: on controller restart it is rebuilt
//! by scanning the cluster state's replica specs.

use std::collections::BTreeSet;

use crate::error::FleetError;

/// Lowest-free allocator over a fixed port range.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    capacity: u16,
    held: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(base: u16, capacity: u16) -> Self {
        Self {
            base,
            capacity,
            held: BTreeSet::new(),
        }
    }

    /// Rebuild an allocator from ports already held by existing replicas.
    pub fn rebuild(base: u16, capacity: u16, in_use: impl IntoIterator<Item = u16>) -> Self {
        let mut alloc = Self::new(base, capacity);
        for port in in_use {
            if alloc.contains(port) {
                alloc.held.insert(port);
            }
        }
        alloc
    }

    fn contains(&self, port: u16) -> bool {
        port >= self.base && (port as u32) < self.base as u32 + self.capacity as u32
    }

    /// Allocate the lowest unused port in the range.
    pub fn allocate(&mut self) -> Result<u16, FleetError> {
        for offset in 0..self.capacity as u32 {
            let Ok(port) = u16::try_from(self.base as u32 + offset) else {
                break;
            };
            if self.held.insert(port) {
                return Ok(port);
            }
        }
        Err(FleetError::ExhaustedRange {
            base: self.base,
            capacity: self.capacity,
        })
    }

    /// Return a port to the free set. Releasing an already-free or
    /// out-of-range port is a no-op.
    pub fn release(&mut self, port: u16) {
        if self.contains(port) {
            self.held.remove(&port);
        }
    }

    /// Number of ports currently held.
    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_lowest_first() {
        let mut alloc = PortAllocator::new(14000, 4);
        assert_eq!(alloc.allocate().unwrap(), 14000);
        assert_eq!(alloc.allocate().unwrap(), 14001);

        alloc.release(14000);
        // Freed port is the lowest again.
        assert_eq!(alloc.allocate().unwrap(), 14000);
        assert_eq!(alloc.allocate().unwrap(), 14002);
    }

    #[test]
    fn test_exhaustion() {
        let mut alloc = PortAllocator::new(14000, 2);
        alloc.allocate().unwrap();
        alloc.allocate().unwrap();
        match alloc.allocate() {
            Err(FleetError::ExhaustedRange { base, capacity }) => {
                assert_eq!(base, 14000);
                assert_eq!(capacity, 2);
            }
            other => panic!("expected ExhaustedRange, got {:?}", other),
        }
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut alloc = PortAllocator::new(14000, 2);
        let port = alloc.allocate().unwrap();
        alloc.release(port);
        alloc.release(port);
        alloc.release(9); // out of range, no-op
        assert_eq!(alloc.held_count(), 0);
    }

    #[test]
    fn test_rebuild_from_specs() {
        let mut alloc = PortAllocator::rebuild(14000, 8, [14000, 14003, 9999]);
        assert_eq!(alloc.held_count(), 2);
        assert_eq!(alloc.allocate().unwrap(), 14001);
    }
}
