//! Registry of protocol instances within a sliding window of state indexes
//!
//! Services run many instances of a protocol, each identified by a state index and a key. Only
//! instances close to the latest index the local node has asked for are worth keeping:
//! * Instances older than `current - past` are reaped once `current` advances
//! * Instances newer than `current + future` are not created at all, messages addressed to them
//!   are rejected
//!
//! The window tracks a single `current` index that only moves forward.

use std::collections::{btree_map::Entry, BTreeMap};

use core::fmt;

/// Instance registry bounded by a sliding window of state indexes
#[derive(Debug)]
pub struct InstanceWindow<K, T> {
    past: u32,
    future: u32,
    current: u32,
    instances: BTreeMap<(u32, K), T>,
}

impl<K: Ord + Clone, T> InstanceWindow<K, T> {
    /// Constructs an empty window at index `0`
    pub fn new(past: u32, future: u32) -> Self {
        Self {
            past,
            future,
            current: 0,
            instances: BTreeMap::new(),
        }
    }

    /// Latest index asked by the local node
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Indicates whether an instance with `index` may exist
    pub fn in_range(&self, index: u32) -> bool {
        index.saturating_add(self.past) >= self.current
            && index <= self.current.saturating_add(self.future)
    }

    /// Moves the window forward to `index`, returns reaped instances
    ///
    /// Does nothing if `index` is not ahead of the current one.
    pub fn advance(&mut self, index: u32) -> Vec<((u32, K), T)> {
        if index <= self.current {
            return vec![];
        }
        self.current = index;
        let threshold = index.saturating_sub(self.past);
        let stale: Vec<_> = self
            .instances
            .keys()
            .filter(|(i, _)| *i < threshold)
            .cloned()
            .collect();
        stale
            .into_iter()
            .filter_map(|k| {
                let instance = self.instances.remove(&k)?;
                Some((k, instance))
            })
            .collect()
    }

    /// Returns an instance
    pub fn get(&self, index: u32, key: &K) -> Option<&T> {
        self.instances.get(&(index, key.clone()))
    }

    /// Returns an instance
    pub fn get_mut(&mut self, index: u32, key: &K) -> Option<&mut T> {
        self.instances.get_mut(&(index, key.clone()))
    }

    /// Returns an instance, creating it if it doesn't exist yet
    ///
    /// Fails if `index` is out of the window.
    pub fn get_or_try_insert_with(
        &mut self,
        index: u32,
        key: K,
        create: impl FnOnce() -> T,
    ) -> Result<&mut T, OutOfWindow> {
        if !self.in_range(index) {
            return Err(OutOfWindow {
                index,
                current: self.current,
            });
        }
        Ok(self.instances.entry((index, key)).or_insert_with(create))
    }

    /// Returns an instance, creating it if it doesn't exist yet
    ///
    /// Unlike [`get_or_try_insert_with`](Self::get_or_try_insert_with), creation may fail.
    /// Nothing is inserted then.
    pub fn get_or_create_with<E: From<OutOfWindow>>(
        &mut self,
        index: u32,
        key: K,
        create: impl FnOnce() -> Result<T, E>,
    ) -> Result<&mut T, E> {
        if !self.in_range(index) {
            return Err(OutOfWindow {
                index,
                current: self.current,
            }
            .into());
        }
        match self.instances.entry((index, key)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(create()?)),
        }
    }

    /// Removes an instance
    pub fn remove(&mut self, index: u32, key: &K) -> Option<T> {
        self.instances.remove(&(index, key.clone()))
    }

    /// Iterates over instances ordered by `(index, key)`
    pub fn iter(&self) -> impl Iterator<Item = (&(u32, K), &T)> {
        self.instances.iter()
    }

    /// Iterates over instances ordered by `(index, key)`
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&(u32, K), &mut T)> {
        self.instances.iter_mut()
    }

    /// Number of instances
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Indicates that there are no instances
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Removes all instances
    pub fn drain(&mut self) -> Vec<((u32, K), T)> {
        std::mem::take(&mut self.instances).into_iter().collect()
    }
}

/// Index is out of the instance window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfWindow {
    /// Requested index
    pub index: u32,
    /// Current index of the window
    pub current: u32,
}

impl fmt::Display for OutOfWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "index {} is out of the window around current index {}",
            self.index, self.current
        )
    }
}

impl std::error::Error for OutOfWindow {}
