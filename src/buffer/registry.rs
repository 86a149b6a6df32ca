//! Per-surface buffer ownership table
//!
//! The registry is the only owner of [`Buffer`] state. Queries are public;
//! state transitions are reserved to the owning surface state machine.

use log::debug;
use std::collections::HashMap;

use super::{Buffer, BufferParams, BufferState};
use crate::error::BufferCreateError;
use crate::protocol::BufferId;

#[derive(Debug, Default)]
pub struct BufferRegistry {
    buffers: HashMap<BufferId, Buffer>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new buffer; it starts out released (never submitted)
    pub fn create(&mut self, id: BufferId, params: BufferParams) -> Result<&Buffer, BufferCreateError> {
        if self.buffers.contains_key(&id) {
            return Err(BufferCreateError::AlreadyExists(id));
        }
        params.validate(id)?;

        debug!(
            "Registered {} ({}x{} {:?})",
            id, params.width, params.height, params.format
        );
        Ok(self.buffers.entry(id).or_insert_with(|| Buffer::new(id, params)))
    }

    pub fn get(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers.get(&id)
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.buffers.contains_key(&id)
    }

    pub fn state(&self, id: BufferId) -> Option<BufferState> {
        self.buffers.get(&id).map(Buffer::state)
    }

    pub fn is_released(&self, id: BufferId) -> Option<bool> {
        self.buffers.get(&id).map(Buffer::is_released)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Registered buffer ids in ascending order
    pub fn ids(&self) -> Vec<BufferId> {
        let mut ids: Vec<_> = self.buffers.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Buffers the compositor currently holds
    pub fn awaiting_release(&self) -> usize {
        self.buffers
            .values()
            .filter(|b| b.state() == BufferState::AwaitingRelease)
            .count()
    }

    /// Released → AwaitingRelease for a new distinct submission
    pub(crate) fn mark_in_flight(&mut self, id: BufferId) -> bool {
        match self.buffers.get_mut(&id) {
            Some(buffer) if buffer.is_released() => {
                buffer.mark_in_flight();
                buffer.commit_count += 1;
                true
            }
            _ => false,
        }
    }

    /// Counts a resubmission without touching the release state
    pub(crate) fn note_resubmission(&mut self, id: BufferId) {
        if let Some(buffer) = self.buffers.get_mut(&id) {
            buffer.commit_count += 1;
        }
    }

    pub(crate) fn mark_released(&mut self, id: BufferId) -> bool {
        match self.buffers.get_mut(&id) {
            Some(buffer) => {
                buffer.mark_released();
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&mut self, id: BufferId) -> Option<Buffer> {
        let removed = self.buffers.remove(&id);
        if removed.is_some() {
            debug!("Unregistered {}", id);
        }
        removed
    }

    /// Drops every buffer, returning how many were registered
    pub(crate) fn clear(&mut self) -> usize {
        let count = self.buffers.len();
        self.buffers.clear();
        count
    }
}
