//! Bounded arena of queue nodes.
//!
//! Nodes live in a `Vec` and are addressed by [`NodeHandle`] indices instead of
//! pointers. The first `preallocated` slots are created eagerly and recycled
//! through a free list forever. Slots above that are created on demand up to
//! `max` and dropped on release, so memory falls back to the baseline once a
//! burst drains.

use serde::Serialize;

use crate::error::ClusterError;

/// Index of a node inside an [`ObjectPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(usize);

impl NodeHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A doubly-linked queue node.
#[derive(Debug)]
pub struct Node<K> {
    pub key: Option<K>,
    pub prev: Option<NodeHandle>,
    pub next: Option<NodeHandle>,
}

impl<K> Node<K> {
    fn empty() -> Self {
        Self {
            key: None,
            prev: None,
            next: None,
        }
    }

    fn clear(&mut self) {
        self.key = None;
        self.prev = None;
        self.next = None;
    }
}

/// Occupancy snapshot of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub preallocated: usize,
    pub max: usize,
    /// Nodes currently in existence (free preallocated ones included).
    pub allocated: usize,
    /// Preallocated nodes waiting on the free list.
    pub free: usize,
}

pub struct ObjectPool<K> {
    slots: Vec<Option<Node<K>>>,
    /// Free preallocated slots, reused LIFO.
    free: Vec<usize>,
    /// Empty overflow slots that can host a new node.
    vacant: Vec<usize>,
    preallocated: usize,
    max: usize,
    allocated: usize,
}

impl<K> ObjectPool<K> {
    /// Create a pool and allocate `preallocated` nodes eagerly.
    pub fn new(preallocated: usize, max: usize) -> Result<Self, ClusterError> {
        if max < preallocated {
            return Err(ClusterError::InvalidConfiguration(format!(
                "pool max ({max}) must be >= preallocated ({preallocated})"
            )));
        }

        let slots = (0..preallocated).map(|_| Some(Node::empty())).collect();
        // Reversed so that the first acquire hands out slot 0.
        let free = (0..preallocated).rev().collect();

        Ok(Self {
            slots,
            free,
            vacant: Vec::new(),
            preallocated,
            max,
            allocated: preallocated,
        })
    }

    /// Take a node: a free preallocated one first, then a fresh one while below `max`.
    pub fn acquire(&mut self) -> Result<NodeHandle, ClusterError> {
        if let Some(index) = self.free.pop() {
            return Ok(NodeHandle(index));
        }

        if self.allocated >= self.max {
            return Err(ClusterError::CapacityExceeded { max: self.max });
        }

        let index = match self.vacant.pop() {
            Some(index) => {
                self.slots[index] = Some(Node::empty());
                index
            }
            None => {
                self.slots.push(Some(Node::empty()));
                self.slots.len() - 1
            }
        };
        self.allocated += 1;
        Ok(NodeHandle(index))
    }

    /// Return a node. Its key and links are cleared either way.
    pub fn release(&mut self, handle: NodeHandle) {
        let index = handle.0;
        match self.slots.get_mut(index) {
            Some(Some(node)) => node.clear(),
            _ => {
                tracing::warn!(index, "release of a node that is not allocated");
                return;
            }
        }

        if self.is_preallocated(handle) {
            self.free.push(index);
            return;
        }

        self.slots[index] = None;
        self.allocated -= 1;
        self.vacant.push(index);
        self.shrink();
    }

    pub fn node(&self, handle: NodeHandle) -> Option<&Node<K>> {
        self.slots.get(handle.0).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, handle: NodeHandle) -> Option<&mut Node<K>> {
        self.slots.get_mut(handle.0).and_then(Option::as_mut)
    }

    pub fn is_preallocated(&self, handle: NodeHandle) -> bool {
        handle.0 < self.preallocated
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            preallocated: self.preallocated,
            max: self.max,
            allocated: self.allocated,
            free: self.free.len(),
        }
    }

    /// Drop trailing empty overflow slots so the arena itself shrinks back.
    fn shrink(&mut self) {
        let before = self.slots.len();
        while self.slots.len() > self.preallocated && matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        if self.slots.len() != before {
            let len = self.slots.len();
            self.vacant.retain(|&index| index < len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_max_below_preallocated() {
        let err = ObjectPool::<String>::new(3, 2).err().unwrap();
        assert!(matches!(err, ClusterError::InvalidConfiguration(_)));
    }

    #[test]
    fn two_tier_acquire_and_release() {
        let mut pool = ObjectPool::<String>::new(2, 3).unwrap();

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.is_preallocated(a) && pool.is_preallocated(b));
        assert_eq!(pool.stats().allocated, 2);

        let c = pool.acquire().unwrap();
        assert!(!pool.is_preallocated(c));
        assert_eq!(pool.stats().allocated, 3);

        assert!(pool.acquire().unwrap_err().is_capacity());

        // Overflow node is discarded, not kept on the free list.
        pool.release(c);
        assert_eq!(pool.stats().allocated, 2);
        assert_eq!(pool.stats().free, 0);
        assert!(pool.node(c).is_none());

        // A released preallocated node is the next one handed out.
        pool.release(a);
        assert_eq!(pool.stats().free, 1);
        assert_eq!(pool.acquire().unwrap(), a);
    }

    #[test]
    fn release_clears_key_and_links() {
        let mut pool = ObjectPool::<String>::new(1, 1).unwrap();
        let h = pool.acquire().unwrap();
        {
            let node = pool.node_mut(h).unwrap();
            node.key = Some("x".into());
            node.next = Some(h);
            node.prev = Some(h);
        }
        pool.release(h);
        let node = pool.node(h).unwrap();
        assert!(node.key.is_none() && node.prev.is_none() && node.next.is_none());
    }

    #[test]
    fn burst_shrinks_back_to_baseline() {
        let mut pool = ObjectPool::<u32>::new(1, 10).unwrap();
        let handles: Vec<_> = (0..10).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.stats().allocated, 10);

        for h in handles {
            pool.release(h);
        }
        assert_eq!(pool.stats().allocated, 1);
        assert_eq!(pool.slots.len(), 1);
        assert!(pool.vacant.is_empty());
    }

    #[test]
    fn interior_vacancy_is_reused() {
        let mut pool = ObjectPool::<u32>::new(0, 3).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let _c = pool.acquire().unwrap();

        pool.release(b);
        assert_eq!(pool.acquire().unwrap(), b);
        pool.release(a);
        assert_eq!(pool.stats().allocated, 2);
    }

    #[test]
    fn zero_capacity_pool_always_refuses() {
        let mut pool = ObjectPool::<u32>::new(0, 0).unwrap();
        assert!(pool.acquire().unwrap_err().is_capacity());
    }
}
