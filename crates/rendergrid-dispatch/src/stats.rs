//! Process-wide dispatch counters.
//!
//! Lock-free atomics, read as a [`StatsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Running frames the database of record could not verify.
    AccountingErrors,
    KilledOomProcs,
    KilledOffenderProcs,
    ProcsBooked,
    ProcsReleased,
    OrphansCleared,
    RejectedReports,
    RejectedKills,
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    accounting_errors: AtomicU64,
    killed_oom_procs: AtomicU64,
    killed_offender_procs: AtomicU64,
    procs_booked: AtomicU64,
    procs_released: AtomicU64,
    orphans_cleared: AtomicU64,
    rejected_reports: AtomicU64,
    rejected_kills: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accounting_errors: u64,
    pub killed_oom_procs: u64,
    pub killed_offender_procs: u64,
    pub procs_booked: u64,
    pub procs_released: u64,
    pub orphans_cleared: u64,
    pub rejected_reports: u64,
    pub rejected_kills: u64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::AccountingErrors => &self.accounting_errors,
            Counter::KilledOomProcs => &self.killed_oom_procs,
            Counter::KilledOffenderProcs => &self.killed_offender_procs,
            Counter::ProcsBooked => &self.procs_booked,
            Counter::ProcsReleased => &self.procs_released,
            Counter::OrphansCleared => &self.orphans_cleared,
            Counter::RejectedReports => &self.rejected_reports,
            Counter::RejectedKills => &self.rejected_kills,
        }
    }

    pub fn incr(&self, counter: Counter) {
        self.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.slot(counter).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accounting_errors: self.get(Counter::AccountingErrors),
            killed_oom_procs: self.get(Counter::KilledOomProcs),
            killed_offender_procs: self.get(Counter::KilledOffenderProcs),
            procs_booked: self.get(Counter::ProcsBooked),
            procs_released: self.get(Counter::ProcsReleased),
            orphans_cleared: self.get(Counter::OrphansCleared),
            rejected_reports: self.get(Counter::RejectedReports),
            rejected_kills: self.get(Counter::RejectedKills),
        }
    }
}
