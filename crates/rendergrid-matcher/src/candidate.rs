//! Snapshot types the matcher ranks, and the feasibility predicate.
//!
//! Tier values are taken as given; the matcher never recomputes them and
//! tolerates them being slightly stale.

use rendergrid_state::{AssignmentId, FolderId, FrameId, HostId, JobId, LayerId, ProcId, ShowId};

use crate::tags;

/// Resources a host, proc or local assignment can give a layer.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResourceOffer {
    pub host_id: HostId,
    pub facility: String,
    pub os: String,
    pub tags: Vec<String>,
    pub cores: u32,
    /// KB.
    pub memory: u64,
    pub gpu: u32,
    /// Only threadable layers may take this offer.
    pub threadable_only: bool,
    /// Set when the offer is an existing proc being reused.
    pub proc_id: Option<ProcId>,
}

/// A layer as seen by the matcher.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CandidateLayer {
    pub layer_id: LayerId,
    pub name: String,
    pub min_cores: u32,
    pub min_memory: u64,
    pub min_gpu: u32,
    pub threadable: bool,
    pub tags: String,
    /// Frames in this layer currently Waiting.
    pub waiting_count: u32,
}

/// A job with its folder and point context, as seen by the matcher.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CandidateJob {
    pub job_id: JobId,
    pub name: String,
    pub show_id: ShowId,
    pub folder_id: FolderId,
    pub facility: String,
    pub os: String,
    /// Pending and not paused.
    pub dispatchable: bool,
    pub cores: u32,
    pub min_cores: u32,
    pub max_cores: u32,
    pub folder_has_capacity: bool,
    pub point_tier: f64,
    pub folder_tier: f64,
    pub tier: f64,
    pub layers: Vec<CandidateLayer>,
}

impl CandidateJob {
    /// True if the job holds more cores than its minimum.
    pub fn is_over_min(&self) -> bool {
        self.cores > self.min_cores
    }

    /// True if the job is below its minimum.
    pub fn is_under_min(&self) -> bool {
        self.cores < self.min_cores
    }

    /// Job-level part of the feasibility predicate.
    pub fn accepts(&self, offer: &ResourceOffer) -> bool {
        self.dispatchable
            && self.facility == offer.facility
            && self.os == offer.os
            && self.folder_has_capacity
    }

    /// Layers of this job the offer can run, in declaration order.
    pub fn feasible_layers<'a>(
        &'a self,
        offer: &'a ResourceOffer,
    ) -> impl Iterator<Item = &'a CandidateLayer> + 'a {
        self.layers
            .iter()
            .filter(move |layer| layer_fits(self, layer, offer))
    }
}

/// Layer-level part of the feasibility predicate.
///
/// A reused proc's cores are already counted against the job, so they are
/// taken back out before the ceiling check.
pub fn layer_fits(job: &CandidateJob, layer: &CandidateLayer, offer: &ResourceOffer) -> bool {
    let booked = if offer.proc_id.is_some() {
        job.cores.saturating_sub(offer.cores)
    } else {
        job.cores
    };
    layer.waiting_count > 0
        && booked + layer.min_cores < job.max_cores
        && layer.min_cores <= offer.cores
        && layer.min_memory <= offer.memory
        && layer.min_gpu <= offer.gpu
        && (layer.threadable || !offer.threadable_only)
        && tags::matches(&offer.tags, &layer.tags)
}

/// A job that passed the predicate, with its position in the ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRank {
    pub job_id: JobId,
    pub tier: f64,
    pub rank: usize,
}

/// A job that a local assignment may serve.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRank {
    pub assignment_id: AssignmentId,
    pub job_id: JobId,
    pub layer_id: Option<LayerId>,
    pub frame_id: Option<FrameId>,
    pub tier: f64,
    pub rank: usize,
}

/// A frame ready to dispatch, carrying what its layer needs.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchFrame {
    pub frame_id: FrameId,
    pub frame_name: String,
    pub job_id: JobId,
    pub layer_id: LayerId,
    pub dispatch_order: u32,
    pub layer_order: u32,
    pub cores: u32,
    pub memory: u64,
    pub gpu: u32,
}

/// Restricts frame selection to one layer or one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameFilter {
    pub layer_id: Option<LayerId>,
    pub frame_id: Option<FrameId>,
}

/// Resource shape of a proc, for the under-proced check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcShape {
    pub cores: u32,
    pub memory: u64,
    pub gpu: u32,
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn fits_within_offer() {
        let j = job("j", 0.0, vec![layer("l", 50, 2 * GB)]);
        assert!(layer_fits(&j, &j.layers[0], &offer(100, 8 * GB)));
        assert!(!layer_fits(&j, &j.layers[0], &offer(49, 8 * GB)));
        assert!(!layer_fits(&j, &j.layers[0], &offer(100, GB)));
    }

    #[test]
    fn job_core_ceiling_is_strict() {
        let mut j = job("j", 0.0, vec![layer("l", 4, GB)]);
        j.cores = 6;
        j.max_cores = 10;
        assert!(!layer_fits(&j, &j.layers[0], &offer(8, 8 * GB)));
        j.max_cores = 11;
        assert!(layer_fits(&j, &j.layers[0], &offer(8, 8 * GB)));
    }

    #[test]
    fn no_waiting_frames_no_fit() {
        let mut l = layer("l", 1, GB);
        l.waiting_count = 0;
        let j = job("j", 0.0, vec![l]);
        assert_eq!(j.feasible_layers(&offer(8, 8 * GB)).count(), 0);
    }

    #[test]
    fn gpu_window() {
        let mut l = layer("l", 1, GB);
        l.min_gpu = 1;
        let j = job("j", 0.0, vec![l]);
        let mut o = offer(8, 8 * GB);
        assert!(!layer_fits(&j, &j.layers[0], &o));
        o.gpu = 2;
        assert!(layer_fits(&j, &j.layers[0], &o));
    }

    #[test]
    fn thread_all_hosts_need_threadable_layers() {
        let mut j = job("j", 0.0, vec![layer("l", 1, GB)]);
        let mut o = offer(8, 8 * GB);
        o.threadable_only = true;
        assert!(!layer_fits(&j, &j.layers[0], &o));
        j.layers[0].threadable = true;
        assert!(layer_fits(&j, &j.layers[0], &o));
    }

    #[test]
    fn os_and_facility_must_match() {
        let j = job("j", 0.0, vec![layer("l", 1, GB)]);
        let mut o = offer(8, 8 * GB);
        assert!(j.accepts(&o));
        o.os = "windows".to_string();
        assert!(!j.accepts(&o));
        o.os = "linux".to_string();
        o.facility = "lax".to_string();
        assert!(!j.accepts(&o));
    }

    #[test]
    fn paused_or_full_folder_rejected() {
        let o = offer(8, 8 * GB);
        let mut j = job("j", 0.0, vec![layer("l", 1, GB)]);
        j.dispatchable = false;
        assert!(!j.accepts(&o));
        j.dispatchable = true;
        j.folder_has_capacity = false;
        assert!(!j.accepts(&o));
    }
}
