//! Identifier types shared across the bus.
//!
//! Pipe ids are rotating serial numbers: the table slot is `serial % max_pipes`
//! and the slot remembers which serial currently occupies it, so a handle that
//! outlived its pipe never aliases the pipe that reused the slot. Buffer
//! handles carry an explicit generation for the same reason.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Routed message identifier, as extracted from a message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(u32);

impl MsgId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Valid ids are `1..=highest`; zero is reserved as "no message id".
    pub const fn is_valid(self, highest: u32) -> bool {
        self.0 != 0 && self.0 <= highest
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl From<u32> for MsgId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Application identifier handed out by the identity service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(u32);

impl AppId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "app:{}", self.0)
    }
}

/// Pipe identifier: a serial number that rotates through the pipe table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipeId(u32);

/// Serial numbers wrap back to 1 after this value.
pub const PIPE_SERIAL_MAX: u32 = 0x00FF_FFFF;

impl PipeId {
    pub const fn new(serial: u32) -> Self {
        Self(serial)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Table slot this id maps onto for a table of `table_size` entries.
    pub const fn slot(self, table_size: usize) -> usize {
        (self.0 as usize) % table_size
    }

    /// Next serial after this one, skipping zero on wrap.
    pub const fn next(self) -> Self {
        if self.0 >= PIPE_SERIAL_MAX {
            Self(1)
        } else {
            Self(self.0 + 1)
        }
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe:{}", self.0)
    }
}

/// Index of a route in the routing table. Routes are never reclaimed, so the
/// index alone is stable for the life of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(u16);

impl RouteId {
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "route:{}", self.0)
    }
}

/// Generation-tagged reference to a buffer descriptor in the pool arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

impl BufferHandle {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) const fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf:{}#{}", self.index, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_id_validity() {
        assert!(!MsgId::new(0).is_valid(0x1FFF));
        assert!(MsgId::new(1).is_valid(0x1FFF));
        assert!(MsgId::new(0x1FFF).is_valid(0x1FFF));
        assert!(!MsgId::new(0x2000).is_valid(0x1FFF));
    }

    #[test]
    fn test_pipe_id_rotation_skips_zero() {
        let last = PipeId::new(PIPE_SERIAL_MAX);
        assert_eq!(last.next(), PipeId::new(1));
        assert_eq!(PipeId::new(7).next(), PipeId::new(8));
    }

    #[test]
    fn test_pipe_id_slot_mapping() {
        assert_eq!(PipeId::new(3).slot(64), 3);
        assert_eq!(PipeId::new(67).slot(64), 3);
        assert_ne!(PipeId::new(3), PipeId::new(67));
    }

    #[test]
    fn test_display_formats() {
        assert_eq!(MsgId::new(0x100).to_string(), "0x0100");
        assert_eq!(PipeId::new(5).to_string(), "pipe:5");
        assert_eq!(BufferHandle::new(2, 9).to_string(), "buf:2#9");
    }
}
