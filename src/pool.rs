//! Reference-counted message buffers.
//!
//! Buffer descriptors live in an arena indexed by [`BufferHandle`]; the handle
//! generation is bumped whenever a slot is freed, so stale handles are
//! rejected. Memory for both buffers and destination records is accounted
//! against one [`MemPool`]. The pool budget is accounting only; each
//! descriptor owns its content as a separate heap allocation sized to the
//! requested message size.
//!
//! Two circular tracking lists thread through the arena: buffers currently
//! held zero-copy by an application, and buffers in transit after broadcast.
//! All methods expect the caller to hold the bus lock.

use crate::error::{BusError, Result};
use crate::ids::{AppId, BufferHandle, MsgId};
use crate::mempool::{MemPool, MemPoolStats, PoolBlock};
use serde::{Deserialize, Serialize};

/// Descriptor bytes accounted in front of the message content.
pub const BUFFER_CONTENT_OFFSET: usize = 64;
/// Pool bytes charged for one destination record.
pub const DESTINATION_BLOCK_BYTES: usize = 32;
/// Use counts saturate here rather than wrapping.
pub const MAX_USE_COUNT: u16 = 0x7FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingListKind {
    ZeroCopy,
    InTransit,
}

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: u32,
    next: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct TrackingList {
    head: Option<u32>,
    len: usize,
}

#[derive(Debug)]
struct BufferDescriptor {
    use_count: u16,
    content: Vec<u8>,
    msg_id: MsgId,
    /// Set while an application holds the buffer zero-copy.
    app_id: Option<AppId>,
    block: PoolBlock,
}

#[derive(Debug, Default)]
struct BufferSlot {
    generation: u32,
    list: Option<TrackingListKind>,
    link: Link,
    descriptor: Option<BufferDescriptor>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub buffers_in_use: u32,
    pub peak_buffers_in_use: u32,
    pub mem_in_use: usize,
    pub peak_mem_in_use: usize,
}

#[derive(Debug)]
pub struct BufferPool {
    mem: MemPool,
    slots: Vec<BufferSlot>,
    free_slots: Vec<u32>,
    zero_copy: TrackingList,
    in_transit: TrackingList,
    max_msg_size: usize,
    stats: PoolStats,
}

impl BufferPool {
    pub fn new(pool_size: usize, block_sizes: &[usize], max_msg_size: usize) -> Self {
        Self {
            mem: MemPool::new(pool_size, block_sizes),
            slots: Vec::new(),
            free_slots: Vec::new(),
            zero_copy: TrackingList::default(),
            in_transit: TrackingList::default(),
            max_msg_size,
            stats: PoolStats::default(),
        }
    }

    /// Allocate a buffer able to hold `max_size` content bytes, use count 1.
    pub fn get_buffer(&mut self, max_size: usize) -> Result<BufferHandle> {
        if max_size > self.max_msg_size {
            return Err(BusError::MsgTooBig {
                size: max_size,
                max: self.max_msg_size,
            });
        }

        let block = self.mem.allocate(BUFFER_CONTENT_OFFSET + max_size)?;
        let requested = block.requested();

        let index = match self.free_slots.pop() {
            Some(index) => index,
            None => {
                self.slots.push(BufferSlot::default());
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.descriptor = Some(BufferDescriptor {
            use_count: 1,
            content: vec![0u8; max_size],
            msg_id: MsgId::new(0),
            app_id: None,
            block,
        });
        let handle = BufferHandle::new(index, slot.generation);

        self.stats.buffers_in_use += 1;
        self.stats.peak_buffers_in_use = self
            .stats
            .peak_buffers_in_use
            .max(self.stats.buffers_in_use);
        self.charge(requested);

        Ok(handle)
    }

    /// Allocate a buffer on behalf of `app` and track it as zero-copy.
    pub fn allocate_zero_copy(&mut self, size: usize, app: AppId) -> Result<BufferHandle> {
        let handle = self.get_buffer(size)?;
        if let Some(descriptor) = self.slots[handle.index()].descriptor.as_mut() {
            descriptor.app_id = Some(app);
        }
        self.list_insert(TrackingListKind::ZeroCopy, handle.index() as u32);
        Ok(handle)
    }

    pub fn incr_use_count(&mut self, handle: BufferHandle) -> Result<u16> {
        let descriptor = self.descriptor_mut(handle)?;
        if descriptor.use_count < MAX_USE_COUNT {
            descriptor.use_count += 1;
        }
        Ok(descriptor.use_count)
    }

    /// Drop one reference; at zero the buffer goes back to the pool.
    /// Returns the remaining use count.
    pub fn decr_use_count(&mut self, handle: BufferHandle) -> Result<u16> {
        let descriptor = self.descriptor_mut(handle)?;
        debug_assert!(descriptor.use_count > 0, "use count underflow on {handle}");
        descriptor.use_count = descriptor.use_count.saturating_sub(1);
        let remaining = descriptor.use_count;
        if remaining == 0 {
            self.return_to_pool(handle.index());
        }
        Ok(remaining)
    }

    /// Check that `handle` is a live zero-copy buffer held by some application.
    pub fn validate_zero_copy(&self, handle: BufferHandle) -> Result<AppId> {
        let descriptor = self.descriptor(handle)?;
        match (self.slots[handle.index()].list, descriptor.app_id) {
            (Some(TrackingListKind::ZeroCopy), Some(app)) => Ok(app),
            _ => Err(BusError::BufferInvalid(handle)),
        }
    }

    /// Give back a zero-copy buffer that will not be transmitted.
    pub fn release_zero_copy(&mut self, handle: BufferHandle) -> Result<()> {
        self.validate_zero_copy(handle)?;
        self.descriptor_mut(handle)?.app_id = None;
        self.decr_use_count(handle)?;
        Ok(())
    }

    /// Move a buffer onto the in-transit list and drop its zero-copy owner.
    pub fn mark_in_transit(&mut self, handle: BufferHandle) -> Result<()> {
        self.descriptor_mut(handle)?.app_id = None;
        let index = handle.index() as u32;
        if self.slots[handle.index()].list.is_some() {
            self.list_remove(index);
        }
        self.list_insert(TrackingListKind::InTransit, index);
        Ok(())
    }

    /// Release every zero-copy buffer still tagged with `app`. Returns how many.
    pub fn release_app_buffers(&mut self, app: AppId) -> usize {
        let tagged: Vec<BufferHandle> = self
            .list_members(TrackingListKind::ZeroCopy)
            .into_iter()
            .filter(|handle| {
                self.descriptor(*handle)
                    .map(|d| d.app_id == Some(app))
                    .unwrap_or(false)
            })
            .collect();

        for handle in &tagged {
            if let Ok(descriptor) = self.descriptor_mut(*handle) {
                descriptor.app_id = None;
            }
            let _ = self.decr_use_count(*handle);
        }
        tagged.len()
    }

    pub fn content(&self, handle: BufferHandle) -> Result<&[u8]> {
        Ok(&self.descriptor(handle)?.content)
    }

    pub fn content_mut(&mut self, handle: BufferHandle) -> Result<&mut [u8]> {
        Ok(&mut self.descriptor_mut(handle)?.content)
    }

    /// Shrink the visible content to `len` bytes. The pool block is unchanged.
    pub fn truncate_content(&mut self, handle: BufferHandle, len: usize) -> Result<()> {
        self.descriptor_mut(handle)?.content.truncate(len);
        Ok(())
    }

    pub fn msg_id(&self, handle: BufferHandle) -> Result<MsgId> {
        Ok(self.descriptor(handle)?.msg_id)
    }

    pub fn set_msg_id(&mut self, handle: BufferHandle, msg_id: MsgId) -> Result<()> {
        self.descriptor_mut(handle)?.msg_id = msg_id;
        Ok(())
    }

    pub fn use_count(&self, handle: BufferHandle) -> Option<u16> {
        self.descriptor(handle).ok().map(|d| d.use_count)
    }

    pub fn is_live(&self, handle: BufferHandle) -> bool {
        self.descriptor(handle).is_ok()
    }

    /// Charge a destination record against the pool.
    pub fn allocate_destination_block(&mut self) -> Result<PoolBlock> {
        let block = self.mem.allocate(DESTINATION_BLOCK_BYTES)?;
        self.charge(block.requested());
        Ok(block)
    }

    pub fn release_destination_block(&mut self, block: PoolBlock) {
        self.stats.mem_in_use = self.stats.mem_in_use.saturating_sub(block.requested());
        self.mem.release(block);
    }

    pub fn get_stats(&self) -> PoolStats {
        self.stats
    }

    pub fn get_mem_stats(&self) -> MemPoolStats {
        self.mem.get_stats()
    }

    pub fn free_bytes(&self) -> usize {
        self.mem.free_bytes()
    }

    pub fn pool_size(&self) -> usize {
        self.mem.pool_size()
    }

    pub fn zero_copy_count(&self) -> usize {
        self.zero_copy.len
    }

    pub fn in_transit_count(&self) -> usize {
        self.in_transit.len
    }

    fn charge(&mut self, bytes: usize) {
        self.stats.mem_in_use += bytes;
        self.stats.peak_mem_in_use = self.stats.peak_mem_in_use.max(self.stats.mem_in_use);
    }

    fn descriptor(&self, handle: BufferHandle) -> Result<&BufferDescriptor> {
        match self.slots.get(handle.index()) {
            Some(slot) if slot.generation == handle.generation() => slot
                .descriptor
                .as_ref()
                .ok_or(BusError::BufferInvalid(handle)),
            _ => Err(BusError::BufferInvalid(handle)),
        }
    }

    fn descriptor_mut(&mut self, handle: BufferHandle) -> Result<&mut BufferDescriptor> {
        match self.slots.get_mut(handle.index()) {
            Some(slot) if slot.generation == handle.generation() => slot
                .descriptor
                .as_mut()
                .ok_or(BusError::BufferInvalid(handle)),
            _ => Err(BusError::BufferInvalid(handle)),
        }
    }

    fn return_to_pool(&mut self, index: usize) {
        if self.slots[index].list.is_some() {
            self.list_remove(index as u32);
        }

        let slot = &mut self.slots[index];
        let Some(descriptor) = slot.descriptor.take() else {
            return;
        };
        slot.generation = slot.generation.wrapping_add(1);

        self.stats.buffers_in_use = self.stats.buffers_in_use.saturating_sub(1);
        self.stats.mem_in_use = self
            .stats
            .mem_in_use
            .saturating_sub(descriptor.block.requested());
        self.mem.release(descriptor.block);
        self.free_slots.push(index as u32);
    }

    fn list(&mut self, kind: TrackingListKind) -> &mut TrackingList {
        match kind {
            TrackingListKind::ZeroCopy => &mut self.zero_copy,
            TrackingListKind::InTransit => &mut self.in_transit,
        }
    }

    /// Append at the tail of a circular list.
    fn list_insert(&mut self, kind: TrackingListKind, index: u32) {
        let head = self.list(kind).head;
        match head {
            None => {
                self.slots[index as usize].link = Link {
                    prev: index,
                    next: index,
                };
                self.list(kind).head = Some(index);
            }
            Some(head) => {
                let tail = self.slots[head as usize].link.prev;
                self.slots[index as usize].link = Link {
                    prev: tail,
                    next: head,
                };
                self.slots[tail as usize].link.next = index;
                self.slots[head as usize].link.prev = index;
            }
        }
        self.slots[index as usize].list = Some(kind);
        self.list(kind).len += 1;
    }

    fn list_remove(&mut self, index: u32) {
        let Some(kind) = self.slots[index as usize].list.take() else {
            return;
        };
        let Link { prev, next } = self.slots[index as usize].link;
        let list = self.list(kind);
        list.len -= 1;

        if next == index {
            list.head = None;
        } else {
            if list.head == Some(index) {
                list.head = Some(next);
            }
            self.slots[prev as usize].link.next = next;
            self.slots[next as usize].link.prev = prev;
        }
        self.slots[index as usize].link = Link::default();
    }

    fn list_members(&mut self, kind: TrackingListKind) -> Vec<BufferHandle> {
        let mut members = Vec::with_capacity(self.list(kind).len);
        let Some(head) = self.list(kind).head else {
            return members;
        };
        let mut cursor = head;
        loop {
            let slot = &self.slots[cursor as usize];
            members.push(BufferHandle::new(cursor, slot.generation));
            cursor = slot.link.next;
            if cursor == head {
                break;
            }
        }
        members
    }
}
