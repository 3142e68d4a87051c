//! Blocking bounded queues carrying buffer references.
//!
//! [`QueueService`] is the OS-primitive seam: every pipe wraps exactly one
//! queue. [`MemoryQueueService`] implements it in-process with a
//! `parking_lot` mutex and condition variable per queue, so a blocked reader
//! never holds the table lock or the bus lock while it waits.

use crate::ids::BufferHandle;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Raw timeout meaning "do not wait".
pub const POLL: i32 = 0;
/// Raw timeout meaning "wait until a message arrives".
pub const PEND_FOREVER: i32 = -1;

const DEFAULT_MAX_QUEUES: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Poll,
    Millis(u32),
    PendForever,
}

impl Timeout {
    /// Convert the flight-software integer convention: `-1` pends forever,
    /// `0` polls, a positive value waits that many milliseconds.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            PEND_FOREVER => Some(Self::PendForever),
            POLL => Some(Self::Poll),
            ms if ms > 0 => Some(Self::Millis(ms.unsigned_abs())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue full")]
    Full,
    #[error("queue empty")]
    Empty,
    #[error("timed out waiting for a message")]
    TimedOut,
    #[error("queue was deleted")]
    Deleted,
    #[error("invalid queue handle")]
    InvalidHandle,
    #[error("queue name already in use")]
    NameTaken,
    #[error("no free queue ids")]
    NoFreeIds,
    #[error("no queue with that name")]
    NameNotFound,
    #[error("queue depth must be non-zero")]
    BadDepth,
}

pub trait QueueService: Send + Sync {
    fn create(&self, name: &str, depth: usize) -> Result<QueueHandle, QueueError>;

    /// Delete a queue. Anyone blocked in [`QueueService::get`] wakes with
    /// [`QueueError::Deleted`].
    fn delete(&self, queue: QueueHandle) -> Result<(), QueueError>;

    /// Never blocks; a full queue is [`QueueError::Full`].
    fn put(&self, queue: QueueHandle, item: BufferHandle) -> Result<(), QueueError>;

    fn get(&self, queue: QueueHandle, timeout: Timeout) -> Result<BufferHandle, QueueError>;

    fn get_id_by_name(&self, name: &str) -> Result<QueueHandle, QueueError>;

    /// Number of items currently queued.
    fn len(&self, queue: QueueHandle) -> Result<usize, QueueError>;
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<BufferHandle>,
    depth: usize,
    deleted: bool,
}

#[derive(Debug)]
struct BoundedQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl BoundedQueue {
    fn new(depth: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(depth),
                depth,
                deleted: false,
            }),
            available: Condvar::new(),
        }
    }

    fn put(&self, item: BufferHandle) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.deleted {
            return Err(QueueError::Deleted);
        }
        if state.items.len() >= state.depth {
            return Err(QueueError::Full);
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    fn get(&self, timeout: Timeout) -> Result<BufferHandle, QueueError> {
        let deadline = match timeout {
            Timeout::Millis(ms) => Some(Instant::now() + Duration::from_millis(u64::from(ms))),
            Timeout::Poll | Timeout::PendForever => None,
        };

        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            if state.deleted {
                return Err(QueueError::Deleted);
            }
            match (timeout, deadline) {
                (Timeout::Poll, _) => return Err(QueueError::Empty),
                (_, Some(deadline)) => {
                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        return state.items.pop_front().ok_or(QueueError::TimedOut);
                    }
                }
                (_, None) => self.available.wait(&mut state),
            }
        }
    }

    fn close(&self) {
        self.state.lock().deleted = true;
        self.available.notify_all();
    }

    fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}

#[derive(Debug)]
struct QueueEntry {
    name: String,
    queue: Arc<BoundedQueue>,
}

#[derive(Debug, Default)]
struct QueueSlot {
    generation: u32,
    entry: Option<QueueEntry>,
}

/// In-process queue service.
#[derive(Debug)]
pub struct MemoryQueueService {
    slots: Mutex<Vec<QueueSlot>>,
    max_queues: usize,
}

impl Default for MemoryQueueService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueueService {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_QUEUES)
    }

    pub fn with_capacity(max_queues: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            max_queues,
        }
    }

    fn lookup(&self, handle: QueueHandle) -> Result<Arc<BoundedQueue>, QueueError> {
        let slots = self.slots.lock();
        match slots.get(handle.index as usize) {
            Some(QueueSlot {
                generation,
                entry: Some(entry),
            }) if *generation == handle.generation => Ok(Arc::clone(&entry.queue)),
            _ => Err(QueueError::InvalidHandle),
        }
    }
}

impl QueueService for MemoryQueueService {
    fn create(&self, name: &str, depth: usize) -> Result<QueueHandle, QueueError> {
        if depth == 0 {
            return Err(QueueError::BadDepth);
        }

        let mut slots = self.slots.lock();
        let name_taken = slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .any(|entry| entry.name == name);
        if name_taken {
            return Err(QueueError::NameTaken);
        }

        let index = match slots.iter().position(|slot| slot.entry.is_none()) {
            Some(index) => index,
            None if slots.len() < self.max_queues => {
                slots.push(QueueSlot::default());
                slots.len() - 1
            }
            None => return Err(QueueError::NoFreeIds),
        };

        let slot = &mut slots[index];
        slot.entry = Some(QueueEntry {
            name: name.to_string(),
            queue: Arc::new(BoundedQueue::new(depth)),
        });
        Ok(QueueHandle {
            index: index as u32,
            generation: slot.generation,
        })
    }

    fn delete(&self, handle: QueueHandle) -> Result<(), QueueError> {
        let entry = {
            let mut slots = self.slots.lock();
            match slots.get_mut(handle.index as usize) {
                Some(slot) if slot.generation == handle.generation && slot.entry.is_some() => {
                    slot.generation = slot.generation.wrapping_add(1);
                    slot.entry.take()
                }
                _ => None,
            }
        };

        match entry {
            Some(entry) => {
                entry.queue.close();
                Ok(())
            }
            None => Err(QueueError::InvalidHandle),
        }
    }

    fn put(&self, handle: QueueHandle, item: BufferHandle) -> Result<(), QueueError> {
        self.lookup(handle)?.put(item)
    }

    fn get(&self, handle: QueueHandle, timeout: Timeout) -> Result<BufferHandle, QueueError> {
        // table lock is released before a potentially long wait
        let queue = self.lookup(handle)?;
        queue.get(timeout)
    }

    fn get_id_by_name(&self, name: &str) -> Result<QueueHandle, QueueError> {
        let slots = self.slots.lock();
        slots
            .iter()
            .enumerate()
            .find_map(|(index, slot)| match &slot.entry {
                Some(entry) if entry.name == name => Some(QueueHandle {
                    index: index as u32,
                    generation: slot.generation,
                }),
                _ => None,
            })
            .ok_or(QueueError::NameNotFound)
    }

    fn len(&self, handle: QueueHandle) -> Result<usize, QueueError> {
        Ok(self.lookup(handle)?.len())
    }
}
