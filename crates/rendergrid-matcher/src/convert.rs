//! Type conversions between state store types and matcher types.
//!
//! Bridges `rendergrid_state::{Host, VirtualProc, Job, Folder, Layer, ...}`
//! to the matcher's `ResourceOffer` and `CandidateJob`.

use std::collections::HashMap;

use rendergrid_state::{
    Folder, Frame, FrameState, Host, Job, Layer, Point, ThreadMode, VirtualProc,
};
use tracing::warn;

use crate::candidate::{CandidateJob, CandidateLayer, ProcShape, ResourceOffer};

/// Idle cores after discounting reported load.
///
/// A host running more processes than its bookable cores suggest gets
/// fewer cores offered; `threshold` is the fraction of total cores
/// tolerated as overload before idle cores are cut.
pub fn effective_idle_cores(host: &Host, threshold: f64) -> u32 {
    let allowed = f64::from(host.total_cores) * (1.0 + threshold) - host.load;
    if allowed <= 0.0 {
        return 0;
    }
    let by_load = allowed.floor().min(f64::from(u32::MAX)) as u32;
    host.idle_cores.min(by_load)
}

/// Offer a host's idle resources.
pub fn host_offer(host: &Host, idle_cores: u32) -> ResourceOffer {
    ResourceOffer {
        host_id: host.id.clone(),
        facility: host.facility.clone(),
        os: host.os.clone(),
        tags: host.tags.clone(),
        cores: idle_cores,
        memory: host.idle_memory,
        gpu: host.idle_gpu,
        threadable_only: host.thread_mode == ThreadMode::All,
        proc_id: None,
    }
}

/// Offer an existing proc's reservation for reuse.
pub fn proc_offer(proc: &VirtualProc, host: &Host) -> ResourceOffer {
    ResourceOffer {
        host_id: host.id.clone(),
        facility: host.facility.clone(),
        os: host.os.clone(),
        tags: host.tags.clone(),
        cores: proc.cores,
        memory: proc.memory_reserved,
        gpu: proc.gpu_reserved,
        threadable_only: host.thread_mode == ThreadMode::All,
        proc_id: Some(proc.id.clone()),
    }
}

pub fn proc_shape(proc: &VirtualProc) -> ProcShape {
    ProcShape {
        cores: proc.cores,
        memory: proc.memory_reserved,
        gpu: proc.gpu_reserved,
    }
}

/// Join jobs with their folder, point, layers and waiting-frame counts.
///
/// Jobs whose folder is missing are skipped; a missing point reads as
/// tier 0.
pub fn candidate_jobs(
    jobs: &[Job],
    folders: &[Folder],
    points: &[Point],
    layers: &[Layer],
    frames: &[Frame],
) -> Vec<CandidateJob> {
    let folders: HashMap<&str, &Folder> = folders.iter().map(|f| (f.id.as_str(), f)).collect();
    let point_tiers: HashMap<&str, f64> = points.iter().map(|p| (p.id.as_str(), p.tier)).collect();

    let mut waiting: HashMap<&str, u32> = HashMap::new();
    for frame in frames.iter().filter(|f| f.state == FrameState::Waiting) {
        *waiting.entry(frame.layer_id.as_str()).or_default() += 1;
    }

    let mut layers_by_job: HashMap<&str, Vec<CandidateLayer>> = HashMap::new();
    for layer in layers {
        layers_by_job
            .entry(layer.job_id.as_str())
            .or_default()
            .push(CandidateLayer {
                layer_id: layer.id.clone(),
                name: layer.name.clone(),
                min_cores: layer.min_cores,
                min_memory: layer.min_memory,
                min_gpu: layer.min_gpu,
                threadable: layer.threadable,
                tags: layer.tags.clone(),
                waiting_count: waiting.get(layer.id.as_str()).copied().unwrap_or(0),
            });
    }

    jobs.iter()
        .filter_map(|job| {
            let Some(folder) = folders.get(job.folder_id.as_str()) else {
                warn!(job = %job.name, folder = %job.folder_id, "job references unknown folder");
                return None;
            };
            Some(CandidateJob {
                job_id: job.id.clone(),
                name: job.name.clone(),
                show_id: job.show_id.clone(),
                folder_id: job.folder_id.clone(),
                facility: job.facility.clone(),
                os: job.os.clone(),
                dispatchable: job.is_dispatchable(),
                cores: job.cores,
                min_cores: job.min_cores,
                max_cores: job.max_cores,
                folder_has_capacity: folder.has_capacity(),
                point_tier: point_tiers.get(folder.point_id.as_str()).copied().unwrap_or(0.0),
                folder_tier: folder.tier,
                tier: job.tier,
                layers: layers_by_job.remove(job.id.as_str()).unwrap_or_default(),
            })
        })
        .collect()
}
