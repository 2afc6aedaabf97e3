//! ProcAllocator — carves procs out of hosts and gives them back.
//!
//! A thin layer over the store's atomic booking primitives that maps
//! storage failures onto the dispatch error taxonomy and keeps the
//! booking counters. Callers serialize per host with [`HostLocks`].
//!
//! [`HostLocks`]: crate::locks::HostLocks

use std::sync::Arc;

use rendergrid_state::{ProcRequest, StateStore, VirtualProc};
use tracing::{debug, info};

use crate::error::{DispatchError, DispatchResult};
use crate::stats::{Counter, DispatchStats};

/// How a proc's memory reservation was brought up to observed usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAdjustment {
    /// Usage already fits the reservation.
    Unchanged,
    /// Raised from the host's idle memory.
    Increased,
    /// Raised with slack taken from sibling procs.
    Balanced,
    /// Neither worked; the proc keeps its reservation.
    Failed,
}

#[derive(Clone)]
pub struct ProcAllocator {
    store: StateStore,
    stats: Arc<DispatchStats>,
    balance_headroom_kb: u64,
}

impl ProcAllocator {
    pub fn new(store: StateStore, stats: Arc<DispatchStats>, balance_headroom_kb: u64) -> Self {
        Self {
            store,
            stats,
            balance_headroom_kb,
        }
    }

    /// Reserve cores, memory and GPU on a host.
    pub fn reserve(&self, req: &ProcRequest) -> DispatchResult<VirtualProc> {
        let proc = self.store.reserve_proc(req)?;
        self.stats.incr(Counter::ProcsBooked);
        Ok(proc)
    }

    /// Bind a proc to a waiting frame. At most one proc per frame.
    pub fn bind(&self, proc_id: &str, frame_id: &str) -> DispatchResult<VirtualProc> {
        Ok(self.store.bind_proc(proc_id, frame_id)?)
    }

    /// Raise a proc's reservation to `new_rss` KB from idle host memory.
    ///
    /// Returns false when no raise was needed.
    pub fn adjust_memory(&self, proc_id: &str, new_rss: u64) -> DispatchResult<bool> {
        Ok(self.store.increase_reserved_memory(proc_id, new_rss)?)
    }

    /// Cover a proc's shortfall up to `needed_kb` with sibling slack.
    pub fn balance(&self, proc_id: &str, needed_kb: u64) -> DispatchResult<bool> {
        Ok(self
            .store
            .balance_reserved_memory(proc_id, needed_kb, self.balance_headroom_kb)?)
    }

    /// Adjust, falling back to a balance when the host cannot cover it.
    pub fn ensure_memory(&self, proc: &VirtualProc, rss: u64) -> DispatchResult<MemoryAdjustment> {
        match self.adjust_memory(&proc.id, rss) {
            Ok(true) => {
                info!(proc = %proc.name(), reserved = rss, "increased reserved memory");
                Ok(MemoryAdjustment::Increased)
            }
            Ok(false) => Ok(MemoryAdjustment::Unchanged),
            Err(DispatchError::ReservationAdjustment(reason)) => {
                info!(
                    proc = %proc.name(),
                    needed = rss.saturating_sub(proc.memory_reserved),
                    %reason,
                    "unable to reserve additional memory"
                );
                if self.balance(&proc.id, rss)? {
                    info!(proc = %proc.name(), "balanced host memory");
                    Ok(MemoryAdjustment::Balanced)
                } else {
                    info!(proc = %proc.name(), "failed to balance host memory");
                    Ok(MemoryAdjustment::Failed)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Give a proc's resources back. Safe to call twice.
    pub fn release(&self, proc_id: &str) -> DispatchResult<Option<VirtualProc>> {
        let released = self.store.release_proc(proc_id)?;
        match &released {
            Some(proc) => {
                self.stats.incr(Counter::ProcsReleased);
                debug!(proc = %proc.name(), "proc unbooked");
            }
            None => debug!(proc = %proc_id, "proc already released"),
        }
        Ok(released)
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    fn allocator(store: &StateStore) -> ProcAllocator {
        ProcAllocator::new(store.clone(), Arc::new(DispatchStats::new()), 0)
    }

    fn request(cores: u32, memory: u64) -> ProcRequest {
        ProcRequest {
            host_id: "host-1".to_string(),
            job_id: "job-1".to_string(),
            layer_id: "layer-1".to_string(),
            cores,
            memory,
            gpu: 0,
            assignment_id: None,
        }
    }

    #[test]
    fn reserve_beyond_idle_is_exhausted() {
        let store = seeded_store();
        let err = allocator(&store).reserve(&request(9, GB)).unwrap_err();
        assert!(matches!(err, DispatchError::ResourceExhausted(_)));
    }

    #[test]
    fn second_bind_is_duplication() {
        let store = seeded_store();
        let alloc = allocator(&store);
        let a = alloc.reserve(&request(1, GB)).unwrap();
        let b = alloc.reserve(&request(1, GB)).unwrap();
        alloc.bind(&a.id, "frame-1").unwrap();
        let err = alloc.bind(&b.id, "frame-1").unwrap_err();
        assert!(matches!(err, DispatchError::ResourceDuplication(_)));
    }

    #[test]
    fn release_twice_credits_once() {
        let store = seeded_store();
        let alloc = allocator(&store);
        let proc = alloc.reserve(&request(4, 2 * GB)).unwrap();
        assert!(alloc.release(&proc.id).unwrap().is_some());
        assert!(alloc.release(&proc.id).unwrap().is_none());
        let host = store.get_host("host-1").unwrap().unwrap();
        assert_eq!(host.idle_cores, 8);
        assert_eq!(host.idle_memory, 8 * GB);
        assert_eq!(alloc.stats.get(Counter::ProcsReleased), 1);
    }

    #[test]
    fn ensure_memory_increases_then_balances() {
        let store = seeded_store();
        let alloc = allocator(&store);
        let small = alloc.reserve(&request(1, GB)).unwrap();
        let big = alloc.reserve(&request(1, 6 * GB)).unwrap();
        alloc.bind(&small.id, "frame-1").unwrap();
        alloc.bind(&big.id, "frame-2").unwrap();

        // 1GB idle left: a raise to 2GB comes straight from the host.
        assert_eq!(alloc.ensure_memory(&small, 2 * GB).unwrap(), MemoryAdjustment::Increased);
        // Host is now full; the next raise is taken from the idle sibling.
        let small = store.get_proc(&small.id).unwrap().unwrap();
        assert_eq!(alloc.ensure_memory(&small, 3 * GB).unwrap(), MemoryAdjustment::Balanced);
        assert_eq!(store.get_proc(&small.id).unwrap().unwrap().memory_reserved, 3 * GB);
        assert_eq!(store.get_proc(&big.id).unwrap().unwrap().memory_reserved, 5 * GB);
        // Unchanged when usage fits.
        assert_eq!(alloc.ensure_memory(&small, GB).unwrap(), MemoryAdjustment::Unchanged);
    }

    #[test]
    fn ensure_memory_fails_without_slack() {
        let store = seeded_store();
        let alloc = allocator(&store);
        let proc = alloc.reserve(&request(1, 8 * GB)).unwrap();
        let proc = alloc.bind(&proc.id, "frame-1").unwrap();
        assert_eq!(alloc.ensure_memory(&proc, 9 * GB).unwrap(), MemoryAdjustment::Failed);
    }
}
