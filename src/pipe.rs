//! Pipe descriptors and the fixed pipe table.
//!
//! A slot moves `Free -> Reserved -> Used` on creation and
//! `Used -> Reserved -> Free` on deletion. The reserved state covers the
//! windows where the bus lock is dropped to talk to the queue service, so two
//! creators never claim the same slot and a pipe being drained cannot be
//! subscribed to.

use crate::config::{MAX_NAME_LEN, MAX_PIPES};
use crate::ids::{AppId, BufferHandle, PipeId};
use crate::queue::QueueHandle;
use arrayvec::ArrayString;
use heapless::Vec;
use serde::{Deserialize, Serialize};

pub type PipeName = ArrayString<MAX_NAME_LEN>;

/// What happens when a message arrives at a full pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Count it as a delivery error on that destination.
    #[default]
    Report,
    /// Discard it silently apart from the drop counters.
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipeOptions {
    /// Skip this pipe when its owner transmits a message it subscribes to.
    pub ignore_mine: bool,
    pub overflow: OverflowPolicy,
}

impl PipeOptions {
    pub const fn new() -> Self {
        Self {
            ignore_mine: false,
            overflow: OverflowPolicy::Report,
        }
    }

    pub const fn with_ignore_mine(mut self, ignore_mine: bool) -> Self {
        self.ignore_mine = ignore_mine;
        self
    }

    pub const fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PipeDescriptor {
    pub pipe_id: PipeId,
    pub name: PipeName,
    pub queue: QueueHandle,
    pub owner: AppId,
    pub max_queue_depth: u16,
    pub current_queue_depth: u16,
    pub peak_queue_depth: u16,
    pub send_errors: u16,
    pub overflow_drops: u16,
    pub options: PipeOptions,
    /// Buffer handed out by the previous receive, released by the next one.
    pub last_buffer: Option<BufferHandle>,
}

impl PipeDescriptor {
    pub fn new(
        pipe_id: PipeId,
        name: PipeName,
        queue: QueueHandle,
        owner: AppId,
        depth: u16,
        options: PipeOptions,
    ) -> Self {
        Self {
            pipe_id,
            name,
            queue,
            owner,
            max_queue_depth: depth,
            current_queue_depth: 0,
            peak_queue_depth: 0,
            send_errors: 0,
            overflow_drops: 0,
            options,
            last_buffer: None,
        }
    }

    pub(crate) fn note_enqueued(&mut self) {
        self.current_queue_depth = self.current_queue_depth.saturating_add(1);
        self.peak_queue_depth = self.peak_queue_depth.max(self.current_queue_depth);
    }

    pub(crate) fn note_dequeued(&mut self) {
        self.current_queue_depth = self.current_queue_depth.saturating_sub(1);
    }

    pub(crate) fn note_send_error(&mut self) {
        self.send_errors = self.send_errors.saturating_add(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Reserved,
    Used,
}

#[derive(Debug, Clone)]
struct PipeSlot {
    state: SlotState,
    pipe_id: PipeId,
    descriptor: Option<PipeDescriptor>,
}

impl PipeSlot {
    const fn free() -> Self {
        Self {
            state: SlotState::Free,
            pipe_id: PipeId::new(0),
            descriptor: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PipeTableStats {
    pub pipes_in_use: u32,
    pub peak_pipes_in_use: u32,
}

#[derive(Debug)]
pub struct PipeTable {
    slots: Vec<PipeSlot, MAX_PIPES>,
    last_id: PipeId,
    stats: PipeTableStats,
}

impl PipeTable {
    pub fn new(max_pipes: usize) -> Self {
        debug_assert!(max_pipes > 0 && max_pipes <= MAX_PIPES);
        let mut slots = Vec::new();
        for _ in 0..max_pipes.min(MAX_PIPES) {
            let _ = slots.push(PipeSlot::free());
        }
        Self {
            slots,
            last_id: PipeId::new(0),
            stats: PipeTableStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the next free slot after the last id handed out.
    pub fn reserve(&mut self) -> Option<PipeId> {
        let table_size = self.slots.len();
        let mut candidate = self.last_id;
        for _ in 0..table_size {
            candidate = candidate.next();
            let slot = &mut self.slots[candidate.slot(table_size)];
            if slot.state == SlotState::Free {
                slot.state = SlotState::Reserved;
                slot.pipe_id = candidate;
                self.last_id = candidate;
                return Some(candidate);
            }
        }
        None
    }

    /// Complete a reservation made by [`PipeTable::reserve`].
    pub fn commit(&mut self, descriptor: PipeDescriptor) {
        let table_size = self.slots.len();
        let slot = &mut self.slots[descriptor.pipe_id.slot(table_size)];
        debug_assert!(slot.state == SlotState::Reserved && slot.pipe_id == descriptor.pipe_id);
        slot.state = SlotState::Used;
        slot.descriptor = Some(descriptor);

        self.stats.pipes_in_use += 1;
        self.stats.peak_pipes_in_use = self.stats.peak_pipes_in_use.max(self.stats.pipes_in_use);
    }

    /// Return a reserved slot that never became a pipe.
    pub fn abandon(&mut self, pipe_id: PipeId) {
        let table_size = self.slots.len();
        let slot = &mut self.slots[pipe_id.slot(table_size)];
        if slot.state == SlotState::Reserved && slot.pipe_id == pipe_id {
            *slot = PipeSlot::free();
        }
    }

    pub fn locate(&self, pipe_id: PipeId) -> Option<&PipeDescriptor> {
        let slot = self.slots.get(pipe_id.slot(self.slots.len()))?;
        if slot.state == SlotState::Used && slot.pipe_id == pipe_id {
            slot.descriptor.as_ref()
        } else {
            None
        }
    }

    pub fn locate_mut(&mut self, pipe_id: PipeId) -> Option<&mut PipeDescriptor> {
        let table_size = self.slots.len();
        let slot = self.slots.get_mut(pipe_id.slot(table_size))?;
        if slot.state == SlotState::Used && slot.pipe_id == pipe_id {
            slot.descriptor.as_mut()
        } else {
            None
        }
    }

    /// Take the descriptor out and park the slot as reserved while the queue drains.
    pub fn begin_delete(&mut self, pipe_id: PipeId) -> Option<PipeDescriptor> {
        let table_size = self.slots.len();
        let slot = self.slots.get_mut(pipe_id.slot(table_size))?;
        if slot.state != SlotState::Used || slot.pipe_id != pipe_id {
            return None;
        }
        slot.state = SlotState::Reserved;
        slot.descriptor.take()
    }

    pub fn finish_delete(&mut self, pipe_id: PipeId) {
        let table_size = self.slots.len();
        let slot = &mut self.slots[pipe_id.slot(table_size)];
        if slot.state == SlotState::Reserved && slot.pipe_id == pipe_id {
            *slot = PipeSlot::free();
            self.stats.pipes_in_use = self.stats.pipes_in_use.saturating_sub(1);
        }
    }

    pub fn state_of(&self, pipe_id: PipeId) -> SlotState {
        match self.slots.get(pipe_id.slot(self.slots.len())) {
            Some(slot) if slot.pipe_id == pipe_id => slot.state,
            _ => SlotState::Free,
        }
    }

    pub fn iter_used(&self) -> impl Iterator<Item = &PipeDescriptor> {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::Used)
            .filter_map(|slot| slot.descriptor.as_ref())
    }

    pub fn find_by_queue(&self, queue: QueueHandle) -> Option<PipeId> {
        self.iter_used()
            .find(|pipe| pipe.queue == queue)
            .map(|pipe| pipe.pipe_id)
    }

    pub fn owned_by(&self, app: AppId) -> alloc::vec::Vec<PipeId> {
        self.iter_used()
            .filter(|pipe| pipe.owner == app)
            .map(|pipe| pipe.pipe_id)
            .collect()
    }

    pub fn get_stats(&self) -> PipeTableStats {
        self.stats
    }
}
