//! Depend edges as a sum type over the four (depender, dependee) pairs.
//!
//! Each variant is built through a checked constructor that rejects an
//! entity depending on itself, compared at the most specific id the
//! variant carries.

use rendergrid_state::{
    DependRecord, DependTarget, DependType, EntityRef, FrameId, JobId, LayerId,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DependError, DependResult};

/// A layer endpoint, with its job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerRef {
    pub job_id: JobId,
    pub layer_id: LayerId,
}

impl LayerRef {
    pub fn new(job_id: impl Into<JobId>, layer_id: impl Into<LayerId>) -> Self {
        Self {
            job_id: job_id.into(),
            layer_id: layer_id.into(),
        }
    }
}

/// A frame endpoint, with its layer and job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRef {
    pub job_id: JobId,
    pub layer_id: LayerId,
    pub frame_id: FrameId,
}

impl FrameRef {
    pub fn new(
        job_id: impl Into<JobId>,
        layer_id: impl Into<LayerId>,
        frame_id: impl Into<FrameId>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            layer_id: layer_id.into(),
            frame_id: frame_id.into(),
        }
    }
}

/// A directed "waits-for" edge: the depender waits on the dependee.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Depend {
    JobOnJob { depender: JobId, dependee: JobId },
    LayerOnLayer { depender: LayerRef, dependee: LayerRef },
    LayerOnFrame { depender: LayerRef, dependee: FrameRef },
    FrameOnFrame { depender: FrameRef, dependee: FrameRef },
}

/// Double dispatch over the depend variants.
pub trait DependVisitor {
    type Output;

    fn visit_job_on_job(&mut self, depender: &JobId, dependee: &JobId) -> Self::Output;
    fn visit_layer_on_layer(&mut self, depender: &LayerRef, dependee: &LayerRef) -> Self::Output;
    fn visit_layer_on_frame(&mut self, depender: &LayerRef, dependee: &FrameRef) -> Self::Output;
    fn visit_frame_on_frame(&mut self, depender: &FrameRef, dependee: &FrameRef) -> Self::Output;
}

impl Depend {
    pub fn job_on_job(depender: impl Into<JobId>, dependee: impl Into<JobId>) -> DependResult<Self> {
        let (depender, dependee) = (depender.into(), dependee.into());
        if depender == dependee {
            return Err(DependError::SelfDependency(format!("job {depender}")));
        }
        Ok(Self::JobOnJob { depender, dependee })
    }

    pub fn layer_on_layer(depender: LayerRef, dependee: LayerRef) -> DependResult<Self> {
        if depender.layer_id == dependee.layer_id {
            return Err(DependError::SelfDependency(format!("layer {}", depender.layer_id)));
        }
        Ok(Self::LayerOnLayer { depender, dependee })
    }

    /// A layer may not wait on one of its own frames.
    pub fn layer_on_frame(depender: LayerRef, dependee: FrameRef) -> DependResult<Self> {
        if depender.layer_id == dependee.layer_id {
            return Err(DependError::SelfDependency(format!("layer {}", depender.layer_id)));
        }
        Ok(Self::LayerOnFrame { depender, dependee })
    }

    pub fn frame_on_frame(depender: FrameRef, dependee: FrameRef) -> DependResult<Self> {
        if depender.frame_id == dependee.frame_id {
            return Err(DependError::SelfDependency(format!("frame {}", depender.frame_id)));
        }
        Ok(Self::FrameOnFrame { depender, dependee })
    }

    pub fn kind(&self) -> DependType {
        match self {
            Self::JobOnJob { .. } => DependType::JobOnJob,
            Self::LayerOnLayer { .. } => DependType::LayerOnLayer,
            Self::LayerOnFrame { .. } => DependType::LayerOnFrame,
            Self::FrameOnFrame { .. } => DependType::FrameOnFrame,
        }
    }

    /// Internal when both ends sit in one job. Job-on-job edges are
    /// always External.
    pub fn target(&self) -> DependTarget {
        let same_job = match self {
            Self::JobOnJob { .. } => false,
            Self::LayerOnLayer { depender, dependee } => depender.job_id == dependee.job_id,
            Self::LayerOnFrame { depender, dependee } => depender.job_id == dependee.job_id,
            Self::FrameOnFrame { depender, dependee } => depender.job_id == dependee.job_id,
        };
        if same_job {
            DependTarget::Internal
        } else {
            DependTarget::External
        }
    }

    /// Stable hex SHA-256 of the type tag and both endpoints' ids.
    pub fn signature(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind().as_str().as_bytes());
        for id in self.depender().ids().chain(std::iter::once("->")).chain(self.dependee().ids()) {
            hasher.update([0u8]);
            hasher.update(id.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn depender(&self) -> Endpoint<'_> {
        match self {
            Self::JobOnJob { depender, .. } => Endpoint::Job(depender),
            Self::LayerOnLayer { depender, .. } | Self::LayerOnFrame { depender, .. } => {
                Endpoint::Layer(depender)
            }
            Self::FrameOnFrame { depender, .. } => Endpoint::Frame(depender),
        }
    }

    pub fn dependee(&self) -> Endpoint<'_> {
        match self {
            Self::JobOnJob { dependee, .. } => Endpoint::Job(dependee),
            Self::LayerOnLayer { dependee, .. } => Endpoint::Layer(dependee),
            Self::LayerOnFrame { dependee, .. } | Self::FrameOnFrame { dependee, .. } => {
                Endpoint::Frame(dependee)
            }
        }
    }

    pub fn accept<V: DependVisitor>(&self, visitor: &mut V) -> V::Output {
        match self {
            Self::JobOnJob { depender, dependee } => visitor.visit_job_on_job(depender, dependee),
            Self::LayerOnLayer { depender, dependee } => {
                visitor.visit_layer_on_layer(depender, dependee)
            }
            Self::LayerOnFrame { depender, dependee } => {
                visitor.visit_layer_on_frame(depender, dependee)
            }
            Self::FrameOnFrame { depender, dependee } => {
                visitor.visit_frame_on_frame(depender, dependee)
            }
        }
    }

    /// The persisted form, keyed by signature.
    pub fn to_record(&self, created_at: u64) -> DependRecord {
        DependRecord {
            id: self.signature(),
            kind: self.kind(),
            target: self.target(),
            depender: self.depender().to_entity(),
            dependee: self.dependee().to_entity(),
            created_at,
        }
    }
}

/// One side of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint<'a> {
    Job(&'a JobId),
    Layer(&'a LayerRef),
    Frame(&'a FrameRef),
}

impl<'a> Endpoint<'a> {
    /// Ids from the job down to the most specific level.
    fn ids(self) -> impl Iterator<Item = &'a str> {
        let ids: Vec<&'a str> = match self {
            Self::Job(job_id) => vec![job_id.as_str()],
            Self::Layer(l) => vec![l.job_id.as_str(), l.layer_id.as_str()],
            Self::Frame(f) => vec![f.job_id.as_str(), f.layer_id.as_str(), f.frame_id.as_str()],
        };
        ids.into_iter()
    }

    pub fn job_id(self) -> &'a str {
        match self {
            Self::Job(job_id) => job_id.as_str(),
            Self::Layer(l) => l.job_id.as_str(),
            Self::Frame(f) => f.job_id.as_str(),
        }
    }

    pub fn to_entity(self) -> EntityRef {
        match self {
            Self::Job(job_id) => EntityRef::job(job_id.clone()),
            Self::Layer(l) => EntityRef::layer(l.job_id.clone(), l.layer_id.clone()),
            Self::Frame(f) => {
                EntityRef::frame(f.job_id.clone(), f.layer_id.clone(), f.frame_id.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(job: &str, layer: &str, frame: &str) -> FrameRef {
        FrameRef::new(job, layer, frame)
    }

    // ── Construction ───────────────────────────────────────────────

    #[test]
    fn self_dependency_rejected_for_every_variant() {
        assert!(matches!(
            Depend::job_on_job("job-1", "job-1"),
            Err(DependError::SelfDependency(_))
        ));
        assert!(matches!(
            Depend::layer_on_layer(LayerRef::new("job-1", "l1"), LayerRef::new("job-1", "l1")),
            Err(DependError::SelfDependency(_))
        ));
        assert!(matches!(
            Depend::layer_on_frame(LayerRef::new("job-1", "l1"), frame("job-1", "l1", "f1")),
            Err(DependError::SelfDependency(_))
        ));
        assert!(matches!(
            Depend::frame_on_frame(frame("job-1", "l1", "f1"), frame("job-1", "l1", "f1")),
            Err(DependError::SelfDependency(_))
        ));
    }

    #[test]
    fn distinct_endpoints_construct() {
        assert!(Depend::job_on_job("job-1", "job-2").is_ok());
        assert!(Depend::layer_on_layer(LayerRef::new("job-1", "l1"), LayerRef::new("job-1", "l2")).is_ok());
        assert!(Depend::layer_on_frame(LayerRef::new("job-1", "l1"), frame("job-1", "l2", "f9")).is_ok());
        assert!(Depend::frame_on_frame(frame("job-1", "l1", "f1"), frame("job-1", "l1", "f2")).is_ok());
    }

    // ── Target ─────────────────────────────────────────────────────

    #[test]
    fn job_on_job_always_external() {
        let d = Depend::job_on_job("job-1", "job-2").unwrap();
        assert_eq!(d.target(), DependTarget::External);
    }

    #[test]
    fn same_job_is_internal() {
        let internal =
            Depend::layer_on_layer(LayerRef::new("job-1", "l1"), LayerRef::new("job-1", "l2")).unwrap();
        let external =
            Depend::layer_on_layer(LayerRef::new("job-1", "l1"), LayerRef::new("job-2", "l2")).unwrap();
        assert_eq!(internal.target(), DependTarget::Internal);
        assert_eq!(external.target(), DependTarget::External);

        let frames = Depend::frame_on_frame(frame("job-1", "l1", "f1"), frame("job-2", "l1", "f2")).unwrap();
        assert_eq!(frames.target(), DependTarget::External);
    }

    // ── Signature ──────────────────────────────────────────────────

    #[test]
    fn signature_is_deterministic() {
        let a = Depend::job_on_job("job-1", "job-2").unwrap();
        let b = Depend::job_on_job("job-1", "job-2").unwrap();
        assert_eq!(a.signature(), b.signature());
        assert_eq!(a.signature().len(), 64);
    }

    #[test]
    fn signature_differs_by_direction_type_and_endpoint() {
        let edges = vec![
            Depend::job_on_job("job-1", "job-2").unwrap(),
            Depend::job_on_job("job-2", "job-1").unwrap(),
            Depend::job_on_job("job-1", "job-3").unwrap(),
            Depend::layer_on_layer(LayerRef::new("job-1", "l1"), LayerRef::new("job-2", "l1")).unwrap(),
            Depend::layer_on_frame(LayerRef::new("job-1", "l1"), frame("job-2", "l1", "f1")).unwrap(),
            Depend::frame_on_frame(frame("job-1", "l1", "f1"), frame("job-2", "l1", "f1")).unwrap(),
            Depend::frame_on_frame(frame("job-1", "l1", "f1"), frame("job-2", "l1", "f2")).unwrap(),
        ];
        let mut sigs: Vec<String> = edges.iter().map(Depend::signature).collect();
        sigs.sort();
        sigs.dedup();
        assert_eq!(sigs.len(), edges.len());
    }

    #[test]
    fn id_boundaries_do_not_collide() {
        let a = Depend::layer_on_layer(LayerRef::new("job-1", "l1"), LayerRef::new("job-1", "1l")).unwrap();
        let b = Depend::layer_on_layer(LayerRef::new("job-1", "l11"), LayerRef::new("job-1", "l")).unwrap();
        assert_ne!(a.signature(), b.signature());
    }

    // ── Visitor ────────────────────────────────────────────────────

    struct Namer;

    impl DependVisitor for Namer {
        type Output = &'static str;

        fn visit_job_on_job(&mut self, _: &JobId, _: &JobId) -> &'static str {
            "job"
        }
        fn visit_layer_on_layer(&mut self, _: &LayerRef, _: &LayerRef) -> &'static str {
            "layer"
        }
        fn visit_layer_on_frame(&mut self, _: &LayerRef, _: &FrameRef) -> &'static str {
            "layer-frame"
        }
        fn visit_frame_on_frame(&mut self, _: &FrameRef, _: &FrameRef) -> &'static str {
            "frame"
        }
    }

    #[test]
    fn accept_dispatches_per_variant() {
        let d = Depend::layer_on_frame(LayerRef::new("job-1", "l1"), frame("job-1", "l2", "f1")).unwrap();
        assert_eq!(d.accept(&mut Namer), "layer-frame");
        assert_eq!(Depend::job_on_job("a", "b").unwrap().accept(&mut Namer), "job");
    }

    #[test]
    fn record_keyed_by_signature() {
        let d = Depend::frame_on_frame(frame("job-1", "l1", "f1"), frame("job-1", "l1", "f2")).unwrap();
        let record = d.to_record(42);
        assert_eq!(record.id, d.signature());
        assert_eq!(record.kind, DependType::FrameOnFrame);
        assert_eq!(record.target, DependTarget::Internal);
        assert_eq!(record.depender, EntityRef::frame("job-1", "l1", "f1"));
        assert_eq!(record.dependee.frame_id.as_deref(), Some("f2"));
    }
}
