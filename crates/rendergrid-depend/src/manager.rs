//! Creation, lookup and satisfaction of depend edges.

use rendergrid_state::{DependRecord, DependTarget, EntityRef, JobId, StateStore, epoch_secs};
use tracing::{debug, info};

use crate::depend::{Depend, DependVisitor, FrameRef, LayerRef};
use crate::error::{DependError, DependResult};

/// What `create_depend` did with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// The edge was stored and its depender frames gated.
    Created(DependRecord),
    /// An edge with the same signature already exists.
    Duplicate,
    /// The dependee is already complete, so nothing was stored.
    AlreadySatisfied,
}

/// Owns the depend edges in a state store.
#[derive(Clone)]
pub struct DependManager {
    store: StateStore,
}

impl DependManager {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Store a depend edge, deduplicating by signature.
    pub fn create_depend(&self, depend: &Depend) -> DependResult<CreateOutcome> {
        depend.accept(&mut EndpointCheck { store: &self.store })?;

        if self.store.is_entity_complete(&depend.dependee().to_entity())? {
            debug!(kind = depend.kind().as_str(), "dependee already complete");
            return Ok(CreateOutcome::AlreadySatisfied);
        }

        let record = depend.to_record(epoch_secs());
        if self.store.insert_depend(&record)? {
            info!(
                depend = %record.id,
                kind = record.kind.as_str(),
                target = ?record.target,
                depender = %record.depender.job_id,
                dependee = %record.dependee.job_id,
                "depend created"
            );
            Ok(CreateOutcome::Created(record))
        } else {
            Ok(CreateOutcome::Duplicate)
        }
    }

    /// Edges waiting on exactly this entity.
    pub fn get_what_depends_on(
        &self,
        entity: &EntityRef,
        target: DependTarget,
    ) -> DependResult<Vec<DependRecord>> {
        Ok(self
            .store
            .list_depends()?
            .into_iter()
            .filter(|d| &d.dependee == entity && target.matches(d.target))
            .collect())
    }

    /// Edges held by this entity or anything inside it: a job's query
    /// includes its layers' and frames' edges.
    pub fn get_what_this_depends_on(
        &self,
        entity: &EntityRef,
        target: DependTarget,
    ) -> DependResult<Vec<DependRecord>> {
        Ok(self
            .store
            .list_depends()?
            .into_iter()
            .filter(|d| covers(entity, &d.depender) && target.matches(d.target))
            .collect())
    }

    /// Remove one edge and release its frames. Returns false if it was
    /// already satisfied.
    pub fn satisfy_depend(&self, depend_id: &str) -> DependResult<bool> {
        match self.store.satisfy_depend(depend_id)? {
            Some(record) => {
                info!(depend = %record.id, kind = record.kind.as_str(), "depend satisfied");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Satisfy every edge waiting on `entity`, if it has completed.
    ///
    /// Returns the number of edges satisfied.
    pub fn resolve_completed(&self, entity: &EntityRef) -> DependResult<usize> {
        if !self.store.is_entity_complete(entity)? {
            return Ok(0);
        }
        let mut satisfied = 0;
        for record in self.get_what_depends_on(entity, DependTarget::Any)? {
            if self.satisfy_depend(&record.id)? {
                satisfied += 1;
            }
        }
        Ok(satisfied)
    }

    /// Drop every edge the entity holds, regardless of dependee state.
    pub fn drop_depends(&self, entity: &EntityRef, target: DependTarget) -> DependResult<usize> {
        let mut dropped = 0;
        for record in self.get_what_this_depends_on(entity, target)? {
            if self.satisfy_depend(&record.id)? {
                dropped += 1;
            }
        }
        debug!(job = %entity.job_id, dropped, "depends dropped");
        Ok(dropped)
    }
}

/// True if `inner` is `outer` or lives inside it.
fn covers(outer: &EntityRef, inner: &EntityRef) -> bool {
    outer.job_id == inner.job_id
        && outer.layer_id.as_ref().is_none_or(|l| inner.layer_id.as_ref() == Some(l))
        && outer.frame_id.as_ref().is_none_or(|f| inner.frame_id.as_ref() == Some(f))
}

/// Verifies both endpoints exist and their ids agree.
struct EndpointCheck<'a> {
    store: &'a StateStore,
}

impl EndpointCheck<'_> {
    fn job(&self, job_id: &JobId) -> DependResult<()> {
        match self.store.get_job(job_id)? {
            Some(_) => Ok(()),
            None => Err(DependError::InvalidEdge(format!("unknown job {job_id}"))),
        }
    }

    fn layer(&self, layer: &LayerRef) -> DependResult<()> {
        match self.store.get_layer(&layer.layer_id)? {
            Some(l) if l.job_id == layer.job_id => Ok(()),
            Some(l) => Err(DependError::InvalidEdge(format!(
                "layer {} belongs to job {}, not {}",
                layer.layer_id, l.job_id, layer.job_id
            ))),
            None => Err(DependError::InvalidEdge(format!("unknown layer {}", layer.layer_id))),
        }
    }

    fn frame(&self, frame: &FrameRef) -> DependResult<()> {
        match self.store.get_frame(&frame.frame_id)? {
            Some(f) if f.job_id == frame.job_id && f.layer_id == frame.layer_id => Ok(()),
            Some(_) => Err(DependError::InvalidEdge(format!(
                "frame {} is not in layer {} of job {}",
                frame.frame_id, frame.layer_id, frame.job_id
            ))),
            None => Err(DependError::InvalidEdge(format!("unknown frame {}", frame.frame_id))),
        }
    }
}

impl DependVisitor for EndpointCheck<'_> {
    type Output = DependResult<()>;

    fn visit_job_on_job(&mut self, depender: &JobId, dependee: &JobId) -> DependResult<()> {
        self.job(depender)?;
        self.job(dependee)
    }

    fn visit_layer_on_layer(&mut self, depender: &LayerRef, dependee: &LayerRef) -> DependResult<()> {
        self.layer(depender)?;
        self.layer(dependee)
    }

    fn visit_layer_on_frame(&mut self, depender: &LayerRef, dependee: &FrameRef) -> DependResult<()> {
        self.layer(depender)?;
        self.frame(dependee)
    }

    fn visit_frame_on_frame(&mut self, depender: &FrameRef, dependee: &FrameRef) -> DependResult<()> {
        self.frame(depender)?;
        self.frame(dependee)
    }
}
