//! Candidate queries: which jobs, frames and shows a host should be offered.
//!
//! Jobs are ordered by ascending tier at three nested levels (scheduling
//! point, folder, job) so the most starved job in the most starved folder
//! comes first. Frames within a job are ordered by dispatch order, then
//! layer order.

use std::collections::HashMap;

use rendergrid_state::{Frame, FrameState, LocalHostAssignment, Show, ShowId, Subscription};
use tracing::debug;

use crate::candidate::*;

/// Narrows the set of jobs a host is matched against.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchScope {
    All,
    Show(ShowId),
    Group(String),
    Job(String),
}

impl MatchScope {
    fn includes(&self, job: &CandidateJob) -> bool {
        match self {
            Self::All => true,
            Self::Show(show_id) => &job.show_id == show_id,
            Self::Group(folder_id) => &job.folder_id == folder_id,
            Self::Job(job_id) => &job.job_id == job_id,
        }
    }
}

/// Jobs the offer can serve, best first, capped at `limit`.
pub fn find_candidate_jobs(
    offer: &ResourceOffer,
    jobs: &[CandidateJob],
    scope: &MatchScope,
    limit: usize,
) -> Vec<JobRank> {
    let mut eligible: Vec<&CandidateJob> = jobs
        .iter()
        .filter(|job| scope.includes(job))
        .filter(|job| job.accepts(offer))
        .filter(|job| job.feasible_layers(offer).next().is_some())
        .collect();

    eligible.sort_by(|a, b| {
        a.point_tier
            .total_cmp(&b.point_tier)
            .then(a.folder_tier.total_cmp(&b.folder_tier))
            .then(a.tier.total_cmp(&b.tier))
            .then_with(|| a.job_id.cmp(&b.job_id))
    });

    let ranked: Vec<JobRank> = eligible
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(rank, job)| JobRank {
            job_id: job.job_id.clone(),
            tier: job.tier,
            rank,
        })
        .collect();
    debug!(host = %offer.host_id, ?scope, candidates = ranked.len(), "candidate jobs");
    ranked
}

/// Waiting frames of `job` the offer can run, in dispatch order.
pub fn find_dispatch_frames(
    offer: &ResourceOffer,
    job: &CandidateJob,
    frames: &[Frame],
    filter: &FrameFilter,
    limit: usize,
) -> Vec<DispatchFrame> {
    if !job.accepts(offer) {
        return Vec::new();
    }
    let layers: HashMap<&str, &CandidateLayer> = job
        .feasible_layers(offer)
        .map(|layer| (layer.layer_id.as_str(), layer))
        .collect();
    frames_for_layers(job, &layers, frames, filter, limit)
}

/// Jobs pinned to this host through local assignments, lowest assignment
/// tier first. Fair-share tiers, tags and folder limits play no part; only
/// the assignment's idle budget, capped by the host offer, does.
pub fn find_local_jobs(
    host_offer: &ResourceOffer,
    assignments: &[LocalHostAssignment],
    jobs: &[CandidateJob],
    limit: usize,
) -> Vec<LocalRank> {
    let mut ordered: Vec<&LocalHostAssignment> = assignments
        .iter()
        .filter(|lha| lha.host_id == host_offer.host_id)
        .collect();
    ordered.sort_by(|a, b| a.tier.total_cmp(&b.tier).then_with(|| a.id.cmp(&b.id)));

    ordered
        .into_iter()
        .filter(|lha| {
            let budget = local_offer(host_offer, lha);
            jobs.iter()
                .filter(|job| job.job_id == lha.job_id && job.dispatchable)
                .any(|job| local_layers(job, lha, &budget).next().is_some())
        })
        .take(limit)
        .enumerate()
        .map(|(rank, lha)| LocalRank {
            assignment_id: lha.id.clone(),
            job_id: lha.job_id.clone(),
            layer_id: lha.layer_id.clone(),
            frame_id: lha.frame_id.clone(),
            tier: lha.tier,
            rank,
        })
        .collect()
}

/// Waiting frames a local assignment may run on its host.
pub fn find_local_dispatch_frames(
    host_offer: &ResourceOffer,
    assignment: &LocalHostAssignment,
    job: &CandidateJob,
    frames: &[Frame],
    limit: usize,
) -> Vec<DispatchFrame> {
    if !job.dispatchable || job.job_id != assignment.job_id {
        return Vec::new();
    }
    let budget = local_offer(host_offer, assignment);
    let layers: HashMap<&str, &CandidateLayer> = local_layers(job, assignment, &budget)
        .map(|layer| (layer.layer_id.as_str(), layer))
        .collect();
    let filter = FrameFilter {
        layer_id: assignment.layer_id.clone(),
        frame_id: assignment.frame_id.clone(),
    };
    frames_for_layers(job, &layers, frames, &filter, limit)
}

/// The host offer shrunk to what a local assignment still has idle.
pub fn local_offer(host_offer: &ResourceOffer, assignment: &LocalHostAssignment) -> ResourceOffer {
    ResourceOffer {
        cores: host_offer.cores.min(assignment.idle_cores()),
        memory: host_offer.memory.min(assignment.idle_memory()),
        gpu: host_offer.gpu.min(assignment.idle_gpu()),
        ..host_offer.clone()
    }
}

fn local_layers<'a>(
    job: &'a CandidateJob,
    assignment: &'a LocalHostAssignment,
    budget: &'a ResourceOffer,
) -> impl Iterator<Item = &'a CandidateLayer> + 'a {
    job.layers.iter().filter(move |layer| {
        assignment.layer_id.as_ref().is_none_or(|id| &layer.layer_id == id)
            && layer.waiting_count > 0
            && layer.min_cores <= budget.cores
            && layer.min_memory <= budget.memory
            && layer.min_gpu <= budget.gpu
    })
}

fn frames_for_layers(
    job: &CandidateJob,
    layers: &HashMap<&str, &CandidateLayer>,
    frames: &[Frame],
    filter: &FrameFilter,
    limit: usize,
) -> Vec<DispatchFrame> {
    let mut ready: Vec<DispatchFrame> = frames
        .iter()
        .filter(|f| f.job_id == job.job_id && f.state == FrameState::Waiting)
        .filter(|f| filter.layer_id.as_ref().is_none_or(|id| &f.layer_id == id))
        .filter(|f| filter.frame_id.as_ref().is_none_or(|id| &f.id == id))
        .filter_map(|f| {
            layers.get(f.layer_id.as_str()).map(|layer| DispatchFrame {
                frame_id: f.id.clone(),
                frame_name: f.name.clone(),
                job_id: f.job_id.clone(),
                layer_id: f.layer_id.clone(),
                dispatch_order: f.dispatch_order,
                layer_order: f.layer_order,
                cores: layer.min_cores,
                memory: layer.min_memory,
                gpu: layer.min_gpu,
            })
        })
        .collect();
    ready.sort_by(|a, b| {
        (a.dispatch_order, a.layer_order, &a.frame_id).cmp(&(b.dispatch_order, b.layer_order, &b.frame_id))
    });
    ready.truncate(limit);
    ready
}

/// Shows with at least `min_deficit` cores of unmet burst on this
/// allocation, largest deficit first.
pub fn find_bookable_shows(
    subscriptions: &[Subscription],
    shows: &[Show],
    min_deficit: u32,
) -> Vec<ShowId> {
    let active: HashMap<&str, &Show> = shows
        .iter()
        .filter(|s| s.active)
        .map(|s| (s.id.as_str(), s))
        .collect();
    let mut bookable: Vec<&Subscription> = subscriptions
        .iter()
        .filter(|sub| active.contains_key(sub.show_id.as_str()))
        .filter(|sub| sub.burst > 0 && sub.burst_deficit() >= min_deficit.max(1))
        .collect();
    bookable.sort_by(|a, b| {
        b.burst_deficit()
            .cmp(&a.burst_deficit())
            .then(a.tier.total_cmp(&b.tier))
            .then_with(|| a.show_id.cmp(&b.show_id))
    });
    bookable.into_iter().map(|sub| sub.show_id.clone()).collect()
}

/// True if another job of the same show, facility and OS sits below its
/// minimum and could take a proc of this shape right now.
///
/// Always false while `current` is itself at or under its own minimum.
pub fn has_under_proced_job_elsewhere(
    current: &CandidateJob,
    shape: &ProcShape,
    jobs: &[CandidateJob],
) -> bool {
    if !current.is_over_min() {
        return false;
    }
    jobs.iter()
        .filter(|job| job.job_id != current.job_id)
        .filter(|job| {
            job.show_id == current.show_id
                && job.facility == current.facility
                && job.os == current.os
        })
        .filter(|job| {
            job.dispatchable
                && job.folder_has_capacity
                && job.is_under_min()
                && job.cores + shape.cores <= job.max_cores
        })
        .any(|job| {
            job.layers.iter().any(|layer| {
                layer.waiting_count > 0
                    && layer.min_gpu == shape.gpu
                    && layer.min_cores <= shape.cores
                    && layer.min_memory <= shape.memory
            })
        })
}
