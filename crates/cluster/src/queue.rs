//! FIFO queue with O(1) removal by key.
//!
//! A doubly-linked list threaded through an [`ObjectPool`] arena plus a hash
//! index from key to node. A key is indexed iff its node is linked.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use crate::error::ClusterError;
use crate::pool::{NodeHandle, ObjectPool, PoolStats};

pub struct IndexedQueue<K> {
    head: Option<NodeHandle>,
    tail: Option<NodeHandle>,
    index: HashMap<K, NodeHandle>,
    pool: ObjectPool<K>,
}

impl<K> IndexedQueue<K>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn new(pool: ObjectPool<K>) -> Self {
        Self {
            head: None,
            tail: None,
            index: HashMap::new(),
            pool,
        }
    }

    /// Build a queue over a fresh pool with the given bounds.
    pub fn with_bounds(preallocated: usize, max: usize) -> Result<Self, ClusterError> {
        Ok(Self::new(ObjectPool::new(preallocated, max)?))
    }

    /// Append `key` at the tail.
    pub fn add(&mut self, key: K) -> Result<(), ClusterError> {
        if self.index.contains_key(&key) {
            return Err(ClusterError::DuplicateMember(key.to_string()));
        }

        let handle = self.pool.acquire()?;
        let old_tail = self.tail;
        if let Some(node) = self.pool.node_mut(handle) {
            node.key = Some(key.clone());
            node.prev = old_tail;
            node.next = None;
        }

        match old_tail {
            Some(tail) => {
                if let Some(node) = self.pool.node_mut(tail) {
                    node.next = Some(handle);
                }
            }
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
        self.index.insert(key, handle);
        Ok(())
    }

    /// Pop the head. `None` when empty.
    pub fn shift(&mut self) -> Option<K> {
        let head = self.head?;
        let (key, next) = {
            let node = self.pool.node_mut(head)?;
            (node.key.take(), node.next)
        };

        self.head = next;
        match next {
            Some(next) => {
                if let Some(node) = self.pool.node_mut(next) {
                    node.prev = None;
                }
            }
            None => self.tail = None,
        }

        if let Some(key) = &key {
            self.index.remove(key);
        }
        self.pool.release(head);
        key
    }

    /// Unlink `key` from wherever it sits.
    pub fn remove(&mut self, key: &K) -> Result<(), ClusterError> {
        let handle = self
            .index
            .remove(key)
            .ok_or_else(|| ClusterError::NotFound(key.to_string()))?;

        let (prev, next) = match self.pool.node(handle) {
            Some(node) => (node.prev, node.next),
            None => (None, None),
        };

        match prev {
            Some(prev) => {
                if let Some(node) = self.pool.node_mut(prev) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(next) => {
                if let Some(node) = self.pool.node_mut(next) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        self.pool.release(handle);
        Ok(())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn front(&self) -> Option<&K> {
        self.head
            .and_then(|h| self.pool.node(h))
            .and_then(|node| node.key.as_ref())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Keys from head to tail.
    pub fn iter(&self) -> Iter<'_, K> {
        Iter {
            queue: self,
            cursor: self.head,
            forward: true,
        }
    }

    /// Keys from tail to head.
    pub fn iter_rev(&self) -> Iter<'_, K> {
        Iter {
            queue: self,
            cursor: self.tail,
            forward: false,
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

pub struct Iter<'a, K> {
    queue: &'a IndexedQueue<K>,
    cursor: Option<NodeHandle>,
    forward: bool,
}

impl<'a, K> Iterator for Iter<'a, K> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.queue.pool.node(self.cursor?)?;
        self.cursor = if self.forward { node.next } else { node.prev };
        node.key.as_ref()
    }
}
