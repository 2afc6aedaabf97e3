//! RenderGrid resource matcher — feasibility, tag matching, fair-share ranking.
//!
//! This crate decides *what* a host should run. It does not reserve
//! anything (that's `rendergrid-state` booking, driven by
//! `rendergrid-dispatch`). Every function is pure over a snapshot, so a
//! matching pass tolerates slightly stale tiers and can never double-book.
//!
//! # Components
//!
//! - **`candidate`** — Snapshot types and the feasibility predicate
//! - **`ranking`** — Candidate job, frame, local and show queries
//! - **`tags`** — Disjunctive, case-insensitive tag matching
//! - **`convert`** — Type conversions from state store types

pub mod candidate;
pub mod convert;
pub mod ranking;
pub mod tags;

pub use candidate::{
    CandidateJob, CandidateLayer, DispatchFrame, FrameFilter, JobRank, LocalRank, ProcShape,
    ResourceOffer, layer_fits,
};
pub use convert::{candidate_jobs, effective_idle_cores, host_offer, proc_offer, proc_shape};
pub use ranking::{
    MatchScope, find_bookable_shows, find_candidate_jobs, find_dispatch_frames,
    find_local_dispatch_frames, find_local_jobs, has_under_proced_job_elsewhere, local_offer,
};
