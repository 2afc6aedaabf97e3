//! Persistence for depend edges and the frame gating they imply.

use redb::ReadableTable;
use tracing::debug;

use crate::error::StateResult;
use crate::store::{StateStore, get_json, list_json, put_json};
use crate::tables::*;
use crate::types::*;

impl StateStore {
    /// Persist a depend edge and gate the depender's frames on it.
    ///
    /// Every non-terminal frame of the depender gains one to its
    /// `depend_count`; waiting frames move to Depend. Returns false, and
    /// changes nothing, if an edge with the same id already exists.
    pub fn insert_depend(&self, record: &DependRecord) -> StateResult<bool> {
        let gated = self.write(|txn| {
            let mut depends = txn.open_table(DEPENDS).map_err(map_err!(Table))?;
            if get_json::<DependRecord, _>(&depends, &record.id)?.is_some() {
                return Ok(None);
            }
            put_json(&mut depends, &record.id, record)?;

            let mut frames = txn.open_table(FRAMES).map_err(map_err!(Table))?;
            let mut gated = 0usize;
            for mut frame in frames_of(&frames, &record.depender)? {
                if frame.state.is_terminal() {
                    continue;
                }
                frame.depend_count += 1;
                if frame.state == FrameState::Waiting {
                    frame.state = FrameState::Depend;
                }
                put_json(&mut frames, &frame.id, &frame)?;
                gated += 1;
            }
            Ok(Some(gated))
        })?;
        match gated {
            Some(frames) => {
                debug!(depend = %record.id, kind = record.kind.as_str(), frames, "depend created");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove a depend edge and release the frames it gated.
    ///
    /// Frames whose `depend_count` reaches zero return from Depend to
    /// Waiting. Returns the removed record, or `None` if it was already
    /// gone.
    pub fn satisfy_depend(&self, depend_id: &str) -> StateResult<Option<DependRecord>> {
        self.write(|txn| {
            let mut depends = txn.open_table(DEPENDS).map_err(map_err!(Table))?;
            let Some(record) = get_json::<DependRecord, _>(&depends, depend_id)? else {
                return Ok(None);
            };
            depends.remove(depend_id).map_err(map_err!(Write))?;

            let mut frames = txn.open_table(FRAMES).map_err(map_err!(Table))?;
            for mut frame in frames_of(&frames, &record.depender)? {
                if frame.state.is_terminal() || frame.depend_count == 0 {
                    continue;
                }
                frame.depend_count -= 1;
                if frame.depend_count == 0 && frame.state == FrameState::Depend {
                    frame.state = FrameState::Waiting;
                }
                put_json(&mut frames, &frame.id, &frame)?;
            }
            Ok(Some(record))
        })
    }

    /// True once the entity's work is done: every frame it covers has
    /// succeeded or been eaten. An entity with no frames is complete.
    pub fn is_entity_complete(&self, entity: &EntityRef) -> StateResult<bool> {
        self.read(|txn| {
            let frames = txn.open_table(FRAMES).map_err(map_err!(Table))?;
            Ok(frames_of(&frames, entity)?
                .iter()
                .all(|f| matches!(f.state, FrameState::Succeeded | FrameState::Eaten)))
        })
    }

    /// Set a frame's state outright.
    pub fn set_frame_state(&self, frame_id: &str, state: FrameState) -> StateResult<bool> {
        self.write(|txn| {
            let mut frames = txn.open_table(FRAMES).map_err(map_err!(Table))?;
            let Some(mut frame) = get_json::<Frame, _>(&frames, frame_id)? else {
                return Ok(false);
            };
            frame.state = state;
            put_json(&mut frames, frame_id, &frame)?;
            Ok(true)
        })
    }
}

/// Frames covered by an entity reference: one frame, one layer's frames,
/// or a whole job's frames.
fn frames_of<R>(frames: &R, entity: &EntityRef) -> StateResult<Vec<Frame>>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    if let Some(frame_id) = &entity.frame_id {
        return Ok(get_json::<Frame, _>(frames, frame_id)?.into_iter().collect());
    }
    let all: Vec<Frame> = list_json(frames)?;
    Ok(all
        .into_iter()
        .filter(|f| f.job_id == entity.job_id)
        .filter(|f| entity.layer_id.as_ref().is_none_or(|l| &f.layer_id == l))
        .collect())
}
