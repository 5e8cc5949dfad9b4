//! Process-wide lease table for terminal-access ports.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::{PortError, PortRange, Result};

/// Leases ports from a fixed range to owners (lab ids).
///
/// All operations take the same lock, so allocation and release from concurrently deploying
/// labs never hand out one port twice.
#[derive(Debug)]
pub struct PortPool {
    range: PortRange,
    state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    leases: BTreeMap<u16, String>,
    cursor: u16,
}

impl PortPool {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            state: Mutex::new(PoolState {
                leases: BTreeMap::new(),
                cursor: range.start,
            }),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an existing lease, e.g. ports already persisted on VMs at startup.
    ///
    /// Re-reserving a port for its current owner is a no-op.
    pub fn reserve(&self, port: u16, owner: &str) -> Result<()> {
        if !self.range.contains(port) {
            return Err(PortError::OutOfRange {
                port,
                range: self.range.to_string(),
            });
        }

        let mut state = self.lock();
        match state.leases.get(&port) {
            Some(current) if current == owner => Ok(()),
            Some(current) => Err(PortError::AlreadyLeased {
                port,
                owner: current.clone(),
            }),
            None => {
                state.leases.insert(port, owner.to_string());
                Ok(())
            }
        }
    }

    /// Lease the next free port to `owner`.
    ///
    /// The search starts after the most recently allocated port and wraps once, so freshly
    /// released ports are not reused immediately.
    pub fn allocate(&self, owner: &str) -> Result<u16> {
        let mut state = self.lock();
        let size = self.range.size();

        let mut candidate = state.cursor;
        for _ in 0..size {
            if !state.leases.contains_key(&candidate) {
                state.leases.insert(candidate, owner.to_string());
                state.cursor = self.next_after(candidate);
                debug!(port = candidate, owner, "Leased terminal port");
                return Ok(candidate);
            }
            candidate = self.next_after(candidate);
        }

        warn!(range = %self.range, "Terminal port range exhausted");
        Err(PortError::Exhausted(self.range.to_string()))
    }

    fn next_after(&self, port: u16) -> u16 {
        if port >= self.range.end {
            self.range.start
        } else {
            port + 1
        }
    }

    /// Release one port. Returns whether it was leased.
    pub fn release(&self, port: u16) -> bool {
        self.lock().leases.remove(&port).is_some()
    }

    /// Release every port held by `owner`, returning them in ascending order.
    pub fn release_owner(&self, owner: &str) -> Vec<u16> {
        let mut state = self.lock();
        let ports: Vec<u16> = state
            .leases
            .iter()
            .filter(|(_, o)| o.as_str() == owner)
            .map(|(port, _)| *port)
            .collect();
        for port in &ports {
            state.leases.remove(port);
        }
        ports
    }

    pub fn owner_of(&self, port: u16) -> Option<String> {
        self.lock().leases.get(&port).cloned()
    }

    pub fn leased(&self) -> usize {
        self.lock().leases.len()
    }

    pub fn available(&self) -> usize {
        self.range.size() - self.leased()
    }
}
