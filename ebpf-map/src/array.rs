//! Array and per-CPU array maps.
//!
//! Every index below `max_entries` always holds a value, zero-filled at
//! creation. A slot is an epoch-managed pointer to an immutable value node:
//! writers swap in a fresh node and retire the old one, so a reader sees
//! either the whole old value or the whole new one.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crossbeam_utils::CachePadded;
use kovan::{Atomic, Shared};

use crate::attr::{MapAttr, UpdateFlags};
use crate::epoch::{self, Guard, ValueNode};
use crate::error::{MapError, Result};
use crate::ops::{DeinitArg, MapInstance};
use crate::platform::Platform;

/// Array keys are native-endian `u32` indices.
pub const ARRAY_KEY_SIZE: usize = 4;

const BAD_KEY: MapError = MapError::InvalidArgument("array key must be 4 bytes");

#[inline]
fn index_of(key: &[u8]) -> Option<usize> {
    let raw: [u8; ARRAY_KEY_SIZE] = key.try_into().ok()?;
    Some(u32::from_ne_bytes(raw) as usize)
}

/// Successor of `key` in index order, written into `next_key`.
///
/// An out-of-range key restarts iteration at index 0.
fn next_index(key: Option<&[u8]>, max_entries: usize, next_key: &mut [u8]) -> Result<()> {
    if next_key.len() != ARRAY_KEY_SIZE {
        return Err(BAD_KEY);
    }

    let next = match key {
        None => 0,
        Some(key) => match index_of(key).ok_or(BAD_KEY)? {
            idx if idx >= max_entries => 0,
            idx if idx + 1 == max_entries => return Err(MapError::NotFound),
            idx => idx + 1,
        },
    };

    next_key.copy_from_slice(&(next as u32).to_ne_bytes());
    Ok(())
}

/// Fixed table of value slots.
pub(crate) struct ArrayStorage {
    slots: Box<[Atomic<ValueNode>]>,
}

impl ArrayStorage {
    fn new(entries: usize, value_size: usize) -> Self {
        let slots = (0..entries)
            .map(|_| Atomic::new(ValueNode::zeroed(value_size)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    #[inline]
    fn get<'g>(&'g self, idx: usize, guard: &'g Guard) -> Option<&'g [u8]> {
        let node = self.slots.get(idx)?.load(Ordering::Acquire, guard);
        // SAFETY: a slot always points at a live node; a node swapped out
        // concurrently is retired and outlives `guard`.
        unsafe { node.as_ref().map(ValueNode::bytes) }
    }

    fn store(&self, idx: usize, value: &[u8], guard: &Guard) {
        let new = ValueNode::from_bytes(value.into());
        // SAFETY: `new` is a fresh, exclusively owned allocation.
        let old = self.slots[idx].swap(unsafe { Shared::from_raw(new) }, Ordering::AcqRel, guard);
        if !old.is_null() {
            // SAFETY: `old` was unlinked by the swap above, exactly once.
            unsafe { epoch::defer_free(old.as_raw()) };
        }
    }
}

impl Drop for ArrayStorage {
    fn drop(&mut self) {
        let guard = epoch::enter();
        for slot in self.slots.iter() {
            let node = slot.load(Ordering::Relaxed, &guard);
            if !node.is_null() {
                // SAFETY: `&mut self` means no reader can reach this slot.
                unsafe { drop(Box::from_raw(node.as_raw())) };
            }
        }
    }
}

// SAFETY: slots are only mutated through atomic swaps and nodes are
// immutable once published.
unsafe impl Send for ArrayStorage {}
unsafe impl Sync for ArrayStorage {}

/// Dense array map.
pub struct ArrayMap {
    storage: ArrayStorage,
    max_entries: usize,
    value_size: usize,
}

impl ArrayMap {
    pub(crate) fn new(attr: &MapAttr) -> Result<Self> {
        if attr.key_size as usize != ARRAY_KEY_SIZE {
            return Err(BAD_KEY);
        }
        let max_entries = attr.max_entries as usize;
        let value_size = attr.value_size as usize;
        Ok(Self {
            storage: ArrayStorage::new(max_entries, value_size),
            max_entries,
            value_size,
        })
    }

    fn writable_index(&self, key: &[u8], flags: UpdateFlags) -> Result<usize> {
        let idx = index_of(key).ok_or(BAD_KEY)?;
        if idx >= self.max_entries {
            return Err(MapError::InvalidArgument("array index out of range"));
        }
        if flags == UpdateFlags::NoExist {
            return Err(MapError::AlreadyExists);
        }
        Ok(idx)
    }
}

impl MapInstance for ArrayMap {
    fn lookup<'g>(&'g self, key: &[u8], guard: &'g Guard) -> Option<&'g [u8]> {
        self.storage.get(index_of(key)?, guard)
    }

    fn lookup_from_user(&self, key: &[u8], value: &mut [u8], guard: &Guard) -> Result<()> {
        if value.len() != self.value_size {
            return Err(MapError::InvalidArgument("value buffer size mismatch"));
        }
        let idx = index_of(key).ok_or(BAD_KEY)?;
        let stored = self.storage.get(idx, guard).ok_or(MapError::NotFound)?;
        value.copy_from_slice(stored);
        Ok(())
    }

    fn update(&self, key: &[u8], value: &[u8], flags: UpdateFlags, guard: &Guard) -> Result<()> {
        let idx = self.writable_index(key, flags)?;
        self.storage.store(idx, value, guard);
        Ok(())
    }

    fn update_from_user(
        &self,
        key: &[u8],
        value: &[u8],
        flags: UpdateFlags,
        guard: &Guard,
    ) -> Result<()> {
        self.update(key, value, flags, guard)
    }

    fn delete(&self, _key: &[u8], _guard: &Guard) -> Result<()> {
        Err(MapError::InvalidArgument("array maps do not support delete"))
    }

    fn delete_from_user(&self, key: &[u8], guard: &Guard) -> Result<()> {
        self.delete(key, guard)
    }

    fn get_next_key_from_user(
        &self,
        key: Option<&[u8]>,
        next_key: &mut [u8],
        _guard: &Guard,
    ) -> Result<()> {
        next_index(key, self.max_entries, next_key)
    }

    fn deinit(&mut self, _arg: DeinitArg<'_>) {
        tracing::trace!(entries = self.max_entries, "array map deinit");
    }
}

/// Array map with one replica per CPU.
///
/// The trusted path reads and writes the calling CPU's replica. The user
/// path sees all of them: lookups return every CPU's value back to back in
/// CPU order, updates write the value to every replica.
pub struct PercpuArrayMap {
    replicas: Box<[CachePadded<ArrayStorage>]>,
    platform: Arc<dyn Platform>,
    max_entries: usize,
    value_size: usize,
}

impl PercpuArrayMap {
    pub(crate) fn new(attr: &MapAttr, platform: Arc<dyn Platform>) -> Result<Self> {
        if attr.key_size as usize != ARRAY_KEY_SIZE {
            return Err(BAD_KEY);
        }
        let max_entries = attr.max_entries as usize;
        let value_size = attr.value_size as usize;
        let replicas = (0..platform.ncpus().max(1))
            .map(|_| CachePadded::new(ArrayStorage::new(max_entries, value_size)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            replicas,
            platform,
            max_entries,
            value_size,
        })
    }

    pub(crate) fn ncpus(&self) -> usize {
        self.replicas.len()
    }

    #[inline]
    fn local(&self) -> &ArrayStorage {
        let cpu = self.platform.curcpu() as usize % self.replicas.len();
        &self.replicas[cpu]
    }

    fn writable_index(&self, key: &[u8], flags: UpdateFlags) -> Result<usize> {
        let idx = index_of(key).ok_or(BAD_KEY)?;
        if idx >= self.max_entries {
            return Err(MapError::InvalidArgument("array index out of range"));
        }
        if flags == UpdateFlags::NoExist {
            return Err(MapError::AlreadyExists);
        }
        Ok(idx)
    }
}

impl MapInstance for PercpuArrayMap {
    fn lookup<'g>(&'g self, key: &[u8], guard: &'g Guard) -> Option<&'g [u8]> {
        self.local().get(index_of(key)?, guard)
    }

    fn lookup_from_user(&self, key: &[u8], value: &mut [u8], guard: &Guard) -> Result<()> {
        if value.len() != self.value_size * self.replicas.len() {
            return Err(MapError::InvalidArgument("value buffer size mismatch"));
        }
        let idx = index_of(key).ok_or(BAD_KEY)?;
        if idx >= self.max_entries {
            return Err(MapError::NotFound);
        }
        for (replica, out) in self.replicas.iter().zip(value.chunks_exact_mut(self.value_size)) {
            let stored = replica.get(idx, guard).ok_or(MapError::NotFound)?;
            out.copy_from_slice(stored);
        }
        Ok(())
    }

    fn update(&self, key: &[u8], value: &[u8], flags: UpdateFlags, guard: &Guard) -> Result<()> {
        let idx = self.writable_index(key, flags)?;
        self.local().store(idx, value, guard);
        Ok(())
    }

    fn update_from_user(
        &self,
        key: &[u8],
        value: &[u8],
        flags: UpdateFlags,
        guard: &Guard,
    ) -> Result<()> {
        let idx = self.writable_index(key, flags)?;
        for replica in self.replicas.iter() {
            replica.store(idx, value, guard);
        }
        Ok(())
    }

    fn delete(&self, _key: &[u8], _guard: &Guard) -> Result<()> {
        Err(MapError::InvalidArgument("array maps do not support delete"))
    }

    fn delete_from_user(&self, key: &[u8], guard: &Guard) -> Result<()> {
        self.delete(key, guard)
    }

    fn get_next_key_from_user(
        &self,
        key: Option<&[u8]>,
        next_key: &mut [u8],
        _guard: &Guard,
    ) -> Result<()> {
        next_index(key, self.max_entries, next_key)
    }

    fn deinit(&mut self, _arg: DeinitArg<'_>) {
        tracing::trace!(
            entries = self.max_entries,
            cpus = self.replicas.len(),
            "percpu array map deinit"
        );
    }
}
