//! Routing table and per-route destination lists.
//!
//! Routes are appended on first subscription and never reclaimed, so a
//! [`RouteId`] stays valid for the life of the bus. Each route heads an
//! intrusive doubly-linked list of [`DestinationNode`]s stored in a shared
//! arena and linked by index.

use crate::config::{MAX_DEST_PER_ROUTE, MAX_MSG_IDS};
use crate::error::{BusError, Result};
use crate::header::SEQUENCE_COUNT_MASK;
use crate::ids::{MsgId, PipeId, RouteId};
use crate::mempool::PoolBlock;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

/// Slots in the hashed message-id map.
pub const ROUTE_MAP_SIZE: usize = 1024;

const_assert!(ROUTE_MAP_SIZE.is_power_of_two());
const_assert!(ROUTE_MAP_SIZE >= 2 * MAX_MSG_IDS);
const_assert!(MAX_MSG_IDS <= u16::MAX as usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RouteMapKind {
    /// Open-addressing hash table with linear probing.
    #[default]
    Hashed,
    /// Index array covering every valid message id.
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Scope {
    /// Delivered only on this processor.
    Local,
    #[default]
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Qos {
    pub priority: u8,
    pub reliability: u8,
}

impl Qos {
    pub const DEFAULT: Self = Self {
        priority: 0,
        reliability: 0,
    };
}

fn hash_msg_id(msg_id: MsgId) -> usize {
    let mut hash = msg_id.value();
    hash = ((hash >> 16) ^ hash).wrapping_mul(0x045d_9f3b);
    hash = ((hash >> 16) ^ hash).wrapping_mul(0x045d_9f3b);
    hash = (hash >> 16) ^ hash;
    (hash as usize) & (ROUTE_MAP_SIZE - 1)
}

#[derive(Debug)]
enum RouteMap {
    Hashed(Vec<Option<(MsgId, RouteId)>>),
    Direct(Vec<Option<RouteId>>),
}

impl RouteMap {
    fn new(kind: RouteMapKind, highest_valid_msg_id: u32) -> Self {
        match kind {
            RouteMapKind::Hashed => Self::Hashed(vec![None; ROUTE_MAP_SIZE]),
            RouteMapKind::Direct => Self::Direct(vec![None; highest_valid_msg_id as usize + 1]),
        }
    }

    fn lookup(&self, msg_id: MsgId) -> Option<RouteId> {
        match self {
            Self::Hashed(slots) => {
                let start = hash_msg_id(msg_id);
                for probe in 0..ROUTE_MAP_SIZE {
                    match slots[(start + probe) & (ROUTE_MAP_SIZE - 1)] {
                        Some((id, route)) if id == msg_id => return Some(route),
                        Some(_) => {}
                        None => return None,
                    }
                }
                None
            }
            Self::Direct(index) => index.get(msg_id.value() as usize).copied().flatten(),
        }
    }

    /// Returns the number of occupied slots probed past the home slot.
    fn insert(&mut self, msg_id: MsgId, route: RouteId) -> Option<u32> {
        match self {
            Self::Hashed(slots) => {
                let start = hash_msg_id(msg_id);
                let mut collisions = 0;
                for probe in 0..ROUTE_MAP_SIZE {
                    let slot = &mut slots[(start + probe) & (ROUTE_MAP_SIZE - 1)];
                    if slot.is_none() {
                        *slot = Some((msg_id, route));
                        return Some(collisions);
                    }
                    collisions += 1;
                }
                None
            }
            Self::Direct(index) => {
                let slot = index.get_mut(msg_id.value() as usize)?;
                *slot = Some(route);
                Some(0)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub msg_id: MsgId,
    head: Option<u32>,
    dest_count: usize,
    seq_count: u16,
}

impl Route {
    pub fn destination_count(&self) -> usize {
        self.dest_count
    }

    pub fn sequence_count(&self) -> u16 {
        self.seq_count
    }
}

/// One subscription of a pipe to a route.
#[derive(Debug)]
pub struct DestinationNode {
    pub pipe_id: PipeId,
    pub active: bool,
    pub scope: Scope,
    pub qos: Qos,
    pub msg_limit: u16,
    /// Messages for this destination currently sitting in the pipe.
    pub buff_count: u16,
    /// Total messages delivered.
    pub dest_count: u32,
    prev: Option<u32>,
    next: Option<u32>,
    pub(crate) block: PoolBlock,
}

impl DestinationNode {
    pub fn new(pipe_id: PipeId, scope: Scope, qos: Qos, msg_limit: u16, block: PoolBlock) -> Self {
        Self {
            pipe_id,
            active: true,
            scope,
            qos,
            msg_limit,
            buff_count: 0,
            dest_count: 0,
            prev: None,
            next: None,
            block,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteAdded {
    pub route: RouteId,
    pub collisions: u32,
}

pub type DestinationIndices = heapless::Vec<u32, MAX_DEST_PER_ROUTE>;

#[derive(Debug)]
pub struct RouteTable {
    map: RouteMap,
    routes: heapless::Vec<Route, MAX_MSG_IDS>,
    max_routes: usize,
    nodes: Vec<Option<DestinationNode>>,
    free_nodes: Vec<u32>,
}

impl RouteTable {
    pub fn new(max_routes: usize, kind: RouteMapKind, highest_valid_msg_id: u32) -> Self {
        debug_assert!(max_routes <= MAX_MSG_IDS);
        Self {
            map: RouteMap::new(kind, highest_valid_msg_id),
            routes: heapless::Vec::new(),
            max_routes: max_routes.min(MAX_MSG_IDS),
            nodes: Vec::new(),
            free_nodes: Vec::new(),
        }
    }

    pub fn lookup(&self, msg_id: MsgId) -> Option<RouteId> {
        self.map.lookup(msg_id)
    }

    /// Append a route for `msg_id`. The caller must have checked it has none.
    pub fn add_route(&mut self, msg_id: MsgId) -> Result<RouteAdded> {
        if self.routes.len() >= self.max_routes {
            return Err(BusError::MaxMsgsMet(self.max_routes));
        }
        let route = RouteId::new(self.routes.len() as u16);
        let collisions = self
            .map
            .insert(msg_id, route)
            .ok_or(BusError::InvalidMsgId(msg_id))?;
        let _ = self.routes.push(Route {
            msg_id,
            head: None,
            dest_count: 0,
            seq_count: 0,
        });
        Ok(RouteAdded { route, collisions })
    }

    pub fn route(&self, route: RouteId) -> Option<&Route> {
        self.routes.get(route.index())
    }

    pub fn routes_in_use(&self) -> usize {
        self.routes.len()
    }

    pub fn iter_routes(&self) -> impl Iterator<Item = (RouteId, &Route)> {
        self.routes
            .iter()
            .enumerate()
            .map(|(index, route)| (RouteId::new(index as u16), route))
    }

    /// Bump and return the route's 14-bit sequence counter.
    pub fn next_sequence(&mut self, route: RouteId) -> u16 {
        match self.routes.get_mut(route.index()) {
            Some(route) => {
                route.seq_count = route.seq_count.wrapping_add(1) & SEQUENCE_COUNT_MASK;
                route.seq_count
            }
            None => 0,
        }
    }

    /// Link `node` at the head of the route's list, making it first in broadcast order.
    pub fn insert_head(&mut self, route: RouteId, mut node: DestinationNode) -> u32 {
        let old_head = self.routes[route.index()].head;
        node.prev = None;
        node.next = old_head;

        let index = match self.free_nodes.pop() {
            Some(index) => {
                self.nodes[index as usize] = Some(node);
                index
            }
            None => {
                self.nodes.push(Some(node));
                (self.nodes.len() - 1) as u32
            }
        };

        if let Some(old_head) = old_head {
            if let Some(next) = self.nodes[old_head as usize].as_mut() {
                next.prev = Some(index);
            }
        }
        let route = &mut self.routes[route.index()];
        route.head = Some(index);
        route.dest_count += 1;
        index
    }

    /// Unlink a destination and hand it back so its pool block can be released.
    pub fn remove_destination(&mut self, route: RouteId, index: u32) -> Option<DestinationNode> {
        let node = self.nodes.get_mut(index as usize)?.take()?;

        match node.prev {
            Some(prev) => {
                if let Some(prev) = self.nodes[prev as usize].as_mut() {
                    prev.next = node.next;
                }
            }
            None => self.routes[route.index()].head = node.next,
        }
        if let Some(next) = node.next {
            if let Some(next) = self.nodes[next as usize].as_mut() {
                next.prev = node.prev;
            }
        }

        let route = &mut self.routes[route.index()];
        route.dest_count = route.dest_count.saturating_sub(1);
        self.free_nodes.push(index);
        Some(node)
    }

    pub fn find_destination(&self, route: RouteId, pipe_id: PipeId) -> Option<u32> {
        self.destination_indices(route)
            .into_iter()
            .find(|index| self.destination(*index).is_some_and(|d| d.pipe_id == pipe_id))
    }

    pub fn destination(&self, index: u32) -> Option<&DestinationNode> {
        self.nodes.get(index as usize)?.as_ref()
    }

    pub fn destination_mut(&mut self, index: u32) -> Option<&mut DestinationNode> {
        self.nodes.get_mut(index as usize)?.as_mut()
    }

    /// Destination indices of a route, in broadcast order.
    pub fn destination_indices(&self, route: RouteId) -> DestinationIndices {
        let mut indices = DestinationIndices::new();
        let mut cursor = self.routes.get(route.index()).and_then(|r| r.head);
        while let Some(index) = cursor {
            if indices.push(index).is_err() {
                break;
            }
            cursor = self.nodes[index as usize].as_ref().and_then(|n| n.next);
        }
        indices
    }

    pub fn destinations(&self, route: RouteId) -> impl Iterator<Item = &DestinationNode> {
        self.destination_indices(route)
            .into_iter()
            .filter_map(move |index| self.destination(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::MemPool;

    fn node(pool: &mut MemPool, pipe: u32) -> DestinationNode {
        DestinationNode::new(
            PipeId::new(pipe),
            Scope::Global,
            Qos::DEFAULT,
            4,
            pool.allocate(32).unwrap(),
        )
    }

    fn pipes_of(table: &RouteTable, route: RouteId) -> Vec<u32> {
        table.destinations(route).map(|d| d.pipe_id.value()).collect()
    }

    #[test]
    fn test_hashed_and_direct_lookup() {
        for kind in [RouteMapKind::Hashed, RouteMapKind::Direct] {
            let mut table = RouteTable::new(8, kind, 0x1FFF);
            assert!(table.lookup(MsgId::new(0x100)).is_none());
            let added = table.add_route(MsgId::new(0x100)).unwrap();
            assert_eq!(table.lookup(MsgId::new(0x100)), Some(added.route));
            assert!(table.lookup(MsgId::new(0x101)).is_none());
        }
    }

    #[test]
    fn test_hash_collisions_are_counted_not_fatal() {
        let first = MsgId::new(1);
        let home = hash_msg_id(first);
        let colliding = (2..0x1FFF)
            .map(MsgId::new)
            .find(|id| hash_msg_id(*id) == home)
            .unwrap();

        let mut table = RouteTable::new(8, RouteMapKind::Hashed, 0x1FFF);
        assert_eq!(table.add_route(first).unwrap().collisions, 0);
        let second = table.add_route(colliding).unwrap();
        assert_eq!(second.collisions, 1);
        assert_eq!(table.lookup(colliding), Some(second.route));
        assert_eq!(table.lookup(first), Some(RouteId::new(0)));
    }

    #[test]
    fn test_route_table_full() {
        let mut table = RouteTable::new(2, RouteMapKind::Hashed, 0x1FFF);
        table.add_route(MsgId::new(1)).unwrap();
        table.add_route(MsgId::new(2)).unwrap();
        assert!(matches!(
            table.add_route(MsgId::new(3)),
            Err(BusError::MaxMsgsMet(2))
        ));
        assert_eq!(table.routes_in_use(), 2);
    }

    #[test]
    fn test_newest_destination_first() {
        let mut pool = MemPool::new(4096, &[32]);
        let mut table = RouteTable::new(4, RouteMapKind::Hashed, 0x1FFF);
        let route = table.add_route(MsgId::new(0x10)).unwrap().route;
        for pipe in 1..=3 {
            table.insert_head(route, node(&mut pool, pipe));
        }
        assert_eq!(pipes_of(&table, route), vec![3, 2, 1]);
        assert_eq!(table.route(route).unwrap().destination_count(), 3);
    }

    #[test]
    fn test_unlink_head_middle_tail_and_only() {
        let mut pool = MemPool::new(4096, &[32]);
        let mut table = RouteTable::new(4, RouteMapKind::Hashed, 0x1FFF);
        let route = table.add_route(MsgId::new(0x10)).unwrap().route;
        for pipe in 1..=4 {
            table.insert_head(route, node(&mut pool, pipe));
        }

        // list is 4, 3, 2, 1
        let middle = table.find_destination(route, PipeId::new(3)).unwrap();
        pool.release(table.remove_destination(route, middle).unwrap().block);
        assert_eq!(pipes_of(&table, route), vec![4, 2, 1]);

        let head = table.find_destination(route, PipeId::new(4)).unwrap();
        pool.release(table.remove_destination(route, head).unwrap().block);
        assert_eq!(pipes_of(&table, route), vec![2, 1]);

        let tail = table.find_destination(route, PipeId::new(1)).unwrap();
        pool.release(table.remove_destination(route, tail).unwrap().block);
        assert_eq!(pipes_of(&table, route), vec![2]);

        let only = table.find_destination(route, PipeId::new(2)).unwrap();
        pool.release(table.remove_destination(route, only).unwrap().block);
        assert!(pipes_of(&table, route).is_empty());
        assert_eq!(table.route(route).unwrap().destination_count(), 0);

        // route survives with no destinations
        assert_eq!(table.lookup(MsgId::new(0x10)), Some(route));
        assert!(table.remove_destination(route, only).is_none());
    }

    #[test]
    fn test_freed_nodes_are_reused() {
        let mut pool = MemPool::new(4096, &[32]);
        let mut table = RouteTable::new(4, RouteMapKind::Direct, 0xFF);
        let route = table.add_route(MsgId::new(0x10)).unwrap().route;
        let first = table.insert_head(route, node(&mut pool, 1));
        let removed = table.remove_destination(route, first).unwrap();
        pool.release(removed.block);

        let again = table.insert_head(route, node(&mut pool, 2));
        assert_eq!(again, first);
        assert_eq!(table.find_destination(route, PipeId::new(2)), Some(again));
        assert!(table.find_destination(route, PipeId::new(1)).is_none());
    }

    #[test]
    fn test_sequence_count_wraps_at_14_bits() {
        let mut table = RouteTable::new(1, RouteMapKind::Hashed, 0x1FFF);
        let route = table.add_route(MsgId::new(7)).unwrap().route;
        assert_eq!(table.next_sequence(route), 1);
        for _ in 1..SEQUENCE_COUNT_MASK {
            table.next_sequence(route);
        }
        assert_eq!(table.route(route).unwrap().sequence_count(), SEQUENCE_COUNT_MASK);
        assert_eq!(table.next_sequence(route), 0);
    }
}
