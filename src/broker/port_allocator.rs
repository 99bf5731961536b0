//! Exclusive port leasing from a fixed range.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::PortAllocatorError;

/// Leases ports from `[port_min, port_max]` one at a time.
///
/// `allocate` scans the range in ascending order for the first free port.
/// All mutation goes through an internal mutex, so concurrent callers
/// observe linearizable allocation: no two concurrent `allocate` calls ever
/// return the same port.
#[derive(Debug)]
pub struct PortAllocator {
    port_min: u16,
    port_max: u16,
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Create an allocator over `[port_min, port_max]`.
    ///
    /// # Panics
    ///
    /// Panics if `port_min > port_max`; callers validate ranges at the CLI
    /// boundary before constructing this type.
    pub fn new(port_min: u16, port_max: u16) -> Self {
        assert!(port_min <= port_max, "port_min must be <= port_max");
        Self {
            port_min,
            port_max,
            allocated: Mutex::new(HashSet::new()),
        }
    }

    /// Lease the first free port in the range.
    ///
    /// # Errors
    ///
    /// Returns [`PortAllocatorError::Exhausted`] if every port in the range
    /// is currently leased.
    pub fn allocate(&self) -> Result<u16, PortAllocatorError> {
        let mut allocated = self.allocated.lock().expect("port allocator mutex poisoned");
        for port in self.port_min..=self.port_max {
            if !allocated.contains(&port) {
                allocated.insert(port);
                return Ok(port);
            }
        }
        Err(PortAllocatorError::Exhausted {
            port_min: self.port_min,
            port_max: self.port_max,
        })
    }

    /// Release a previously leased port.
    ///
    /// Releasing a port that was never leased is a no-op, logged at warning
    /// level — it indicates a caller bug, not a fatal condition.
    pub fn release(&self, port: u16) {
        let mut allocated = self.allocated.lock().expect("port allocator mutex poisoned");
        if !allocated.remove(&port) {
            log::warn!("release() called for port {port} that was not leased");
        }
    }

    /// Number of ports still available in the range.
    pub fn available_count(&self) -> usize {
        let allocated = self.allocated.lock().expect("port allocator mutex poisoned");
        let range_size = usize::from(self.port_max - self.port_min) + 1;
        range_size - allocated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn allocates_ascending_first_free_port() {
        let allocator = PortAllocator::new(10000, 10002);
        assert_eq!(allocator.allocate().unwrap(), 10000);
        assert_eq!(allocator.allocate().unwrap(), 10001);
        assert_eq!(allocator.allocate().unwrap(), 10002);
    }

    #[test]
    fn exhaustion_fails_after_full_range_leased() {
        let allocator = PortAllocator::new(10000, 10000);
        assert_eq!(allocator.allocate().unwrap(), 10000);
        assert!(allocator.allocate().is_err());
    }

    #[test]
    fn release_frees_port_for_reuse() {
        let allocator = PortAllocator::new(10000, 10000);
        let port = allocator.allocate().unwrap();
        allocator.release(port);
        assert_eq!(allocator.allocate().unwrap(), port);
    }

    #[test]
    fn release_of_unleased_port_is_a_no_op() {
        let allocator = PortAllocator::new(10000, 10001);
        allocator.release(10000);
        assert_eq!(allocator.available_count(), 2);
    }

    #[test]
    fn available_count_tracks_leases() {
        let allocator = PortAllocator::new(10000, 10004);
        assert_eq!(allocator.available_count(), 5);
        let a = allocator.allocate().unwrap();
        let _b = allocator.allocate().unwrap();
        assert_eq!(allocator.available_count(), 3);
        allocator.release(a);
        assert_eq!(allocator.available_count(), 4);
    }

    #[test]
    fn concurrent_allocate_returns_n_distinct_ports_before_failing() {
        let allocator = Arc::new(PortAllocator::new(20000, 20099));
        let mut handles = Vec::new();
        for _ in 0..100 {
            let allocator = Arc::clone(&allocator);
            handles.push(std::thread::spawn(move || allocator.allocate()));
        }
        let mut ports: Vec<u16> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 100);
        assert!(allocator.allocate().is_err());
    }
}
