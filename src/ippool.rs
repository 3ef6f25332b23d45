//! Loopback address pool.
//!
//! Every managed tunnel gets its own address out of a contiguous loopback
//! range so each service can bind the same well-known port. Released
//! addresses go to a free list and are reused before fresh offsets are
//! handed out.

#![allow(dead_code)]

use ipnet::Ipv4Net;
use std::collections::{BTreeSet, HashSet};
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("address pool {0} is exhausted")]
    Exhausted(Ipv4Net),
    #[error("address {0} is outside the pool range {1}")]
    OutOfRange(Ipv4Addr, Ipv4Net),
    #[error("address {0} is already allocated")]
    InUse(Ipv4Addr),
    #[error("address {0} is not allocated")]
    NotAllocated(Ipv4Addr),
}

/// Pool of host addresses carved out of a single CIDR range.
///
/// The network and broadcast addresses are never handed out.
pub struct IpPool {
    net: Ipv4Net,
    /// Offset of the next never-allocated host, counted from the network
    /// address.
    cursor: u32,
    allocated: HashSet<Ipv4Addr>,
    /// Released addresses, reused before the cursor advances.
    free: BTreeSet<Ipv4Addr>,
}

impl IpPool {
    pub fn new(net: Ipv4Net) -> Self {
        Self {
            net,
            cursor: 1,
            allocated: HashSet::new(),
            free: BTreeSet::new(),
        }
    }

    /// Number of usable host addresses in the range.
    fn capacity(&self) -> u32 {
        match 32u32.saturating_sub(u32::from(self.net.prefix_len())) {
            0 | 1 => 0,
            bits if bits >= 32 => u32::MAX - 1,
            bits => (1u32 << bits) - 2,
        }
    }

    /// Allocates the lowest available address in the range.
    pub fn acquire_any(&mut self) -> Result<Ipv4Addr, PoolError> {
        if let Some(ip) = self.free.iter().next().copied() {
            self.free.remove(&ip);
            self.allocated.insert(ip);
            return Ok(ip);
        }

        let base = u32::from(self.net.network());
        while self.cursor <= self.capacity() {
            let ip = Ipv4Addr::from(base + self.cursor);
            self.cursor += 1;
            // addresses pinned with acquire() are skipped here
            if !self.allocated.contains(&ip) {
                self.allocated.insert(ip);
                return Ok(ip);
            }
        }

        Err(PoolError::Exhausted(self.net))
    }

    /// Pins a specific address so `acquire_any` never returns it.
    pub fn acquire(&mut self, ip: Ipv4Addr) -> Result<(), PoolError> {
        if !self.net.contains(&ip) {
            return Err(PoolError::OutOfRange(ip, self.net));
        }
        if self.allocated.contains(&ip) {
            return Err(PoolError::InUse(ip));
        }
        self.free.remove(&ip);
        self.allocated.insert(ip);
        Ok(())
    }

    /// Returns an address to the pool.
    pub fn release(&mut self, ip: Ipv4Addr) -> Result<(), PoolError> {
        if !self.allocated.remove(&ip) {
            return Err(PoolError::NotAllocated(ip));
        }
        self.free.insert(ip);
        Ok(())
    }

    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.allocated.contains(&ip)
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str) -> IpPool {
        IpPool::new(cidr.parse().unwrap())
    }

    #[test]
    fn test_acquire_distinct() {
        let mut pool = pool("127.50.0.0/29");

        let a = pool.acquire_any().unwrap();
        let b = pool.acquire_any().unwrap();

        assert_ne!(a, b);
        assert_eq!(a, Ipv4Addr::new(127, 50, 0, 1));
        assert_eq!(b, Ipv4Addr::new(127, 50, 0, 2));
        assert_eq!(pool.allocated_count(), 2);
    }

    #[test]
    fn test_release_and_reuse() {
        let mut pool = pool("127.50.0.0/29");

        let a = pool.acquire_any().unwrap();
        let _b = pool.acquire_any().unwrap();
        pool.release(a).unwrap();

        assert!(!pool.is_allocated(a));
        // released addresses come back before the cursor advances
        assert_eq!(pool.acquire_any().unwrap(), a);
    }

    #[test]
    fn test_pinned_address_never_returned() {
        let mut pool = pool("127.0.0.0/29");
        pool.acquire(Ipv4Addr::new(127, 0, 0, 1)).unwrap();

        while let Ok(ip) = pool.acquire_any() {
            assert_ne!(ip, Ipv4Addr::new(127, 0, 0, 1));
        }
    }

    #[test]
    fn test_exhaustion() {
        // /30 has exactly two usable hosts
        let mut pool = pool("127.50.0.0/30");

        pool.acquire_any().unwrap();
        pool.acquire_any().unwrap();

        assert!(matches!(pool.acquire_any(), Err(PoolError::Exhausted(_))));
    }

    #[test]
    fn test_acquire_specific_errors() {
        let mut pool = pool("127.50.0.0/29");

        assert!(matches!(
            pool.acquire(Ipv4Addr::new(10, 0, 0, 1)),
            Err(PoolError::OutOfRange(..))
        ));

        let a = pool.acquire_any().unwrap();
        assert!(matches!(pool.acquire(a), Err(PoolError::InUse(_))));
    }

    #[test]
    fn test_release_unallocated() {
        let mut pool = pool("127.50.0.0/29");
        assert!(matches!(
            pool.release(Ipv4Addr::new(127, 50, 0, 3)),
            Err(PoolError::NotAllocated(_))
        ));
    }

    #[test]
    fn test_host_bits_in_cidr_ignored() {
        // "127.0.0.1/8" and "127.0.0.0/8" describe the same range
        let mut pool = pool("127.0.0.1/8");
        assert_eq!(pool.acquire_any().unwrap(), Ipv4Addr::new(127, 0, 0, 1));
    }
}
