//! Hash table and per-CPU hash table maps.
//!
//! # Architecture
//! - **Buckets**: power-of-two array of atomic chain heads, sized from
//!   `max_entries`.
//! - **Nodes**: singly linked, immutable once published. An overwrite builds
//!   a replacement node and swings the link that pointed at the old one.
//! - **Readers**: walk chains under an epoch guard without taking any lock.
//! - **Writers**: serialize on a per-table mutex. Unlinked nodes are retired
//!   and freed only after every reader that could still see them is gone.

use std::hash::BuildHasher;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use foldhash::fast::FixedState;
use kovan::{Atomic, RetiredNode, Shared};
use parking_lot::Mutex;
use portable_atomic::AtomicU64;

use crate::attr::{MapAttr, UpdateFlags};
use crate::epoch::{self, Guard};
use crate::error::{MapError, Result};
use crate::ops::{DeinitArg, MapInstance};
use crate::platform::Platform;

const MIN_BUCKETS: usize = 16;
const MAX_BUCKETS: usize = 1 << 16;

/// Chain node. `RetiredNode` must stay at offset 0 for the reclaimer.
#[repr(C)]
struct Node {
    retired: RetiredNode,
    hash: u64,
    next: Atomic<Node>,
    /// Key bytes immediately followed by value bytes.
    data: Box<[u8]>,
}

impl Node {
    fn alloc(hash: u64, data: Box<[u8]>, next: *mut Node) -> *mut Node {
        Box::into_raw(Box::new(Node {
            retired: RetiredNode::new(),
            hash,
            next: Atomic::new(next),
            data,
        }))
    }
}

/// Bounded byte-keyed hash table with epoch-protected reads.
pub(crate) struct HashTable {
    buckets: Box<[Atomic<Node>]>,
    mask: usize,
    hasher: FixedState,
    len: AtomicU64,
    writer: Mutex<()>,
    key_size: usize,
    value_size: usize,
    max_entries: usize,
}

impl HashTable {
    pub(crate) fn new(key_size: usize, value_size: usize, max_entries: usize) -> Self {
        let count = max_entries
            .next_power_of_two()
            .clamp(MIN_BUCKETS, MAX_BUCKETS);
        let buckets = (0..count)
            .map(|_| Atomic::null())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buckets,
            mask: count - 1,
            hasher: FixedState::default(),
            len: AtomicU64::new(0),
            writer: Mutex::new(()),
            key_size,
            value_size,
            max_entries,
        }
    }

    /// Number of live entries.
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire) as usize
    }

    #[inline(always)]
    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & self.mask
    }

    #[inline(always)]
    fn key_of<'n>(&self, node: &'n Node) -> &'n [u8] {
        &node.data[..self.key_size]
    }

    #[inline(always)]
    fn value_of<'n>(&self, node: &'n Node) -> &'n [u8] {
        &node.data[self.key_size..]
    }

    fn find<'g>(&'g self, hash: u64, key: &[u8], guard: &'g Guard) -> Option<&'g Node> {
        let mut current = self.buckets[self.bucket_of(hash)].load(Ordering::Acquire, guard);
        while !current.is_null() {
            // SAFETY: reachable nodes are live; unlinked ones are retired and
            // outlive `guard`.
            let node = unsafe { current.deref() };
            if node.hash == hash && self.key_of(node) == key {
                return Some(node);
            }
            current = node.next.load(Ordering::Acquire, guard);
        }
        None
    }

    /// Value stored under `key`, valid for the lifetime of `guard`.
    pub(crate) fn get<'g>(&'g self, key: &[u8], guard: &'g Guard) -> Option<&'g [u8]> {
        let hash = self.hasher.hash_one(key);
        self.find(hash, key, guard).map(|node| self.value_of(node))
    }

    /// Inserts or replaces the entry for `key` according to `flags`.
    ///
    /// `fill` receives the current value (if any) and the zeroed value
    /// buffer of the node about to be published.
    pub(crate) fn upsert<F>(&self, key: &[u8], flags: UpdateFlags, guard: &Guard, fill: F) -> Result<()>
    where
        F: FnOnce(Option<&[u8]>, &mut [u8]),
    {
        let hash = self.hasher.hash_one(key);
        let _writer = self.writer.lock();

        let mut link = &self.buckets[self.bucket_of(hash)];
        let mut current = link.load(Ordering::Acquire, guard);

        while !current.is_null() {
            // SAFETY: writers are serialized, so `current` is still linked.
            let node = unsafe { current.deref() };

            if node.hash == hash && self.key_of(node) == key {
                if flags == UpdateFlags::NoExist {
                    return Err(MapError::AlreadyExists);
                }

                let mut data = vec![0u8; self.key_size + self.value_size].into_boxed_slice();
                data[..self.key_size].copy_from_slice(key);
                fill(Some(self.value_of(node)), &mut data[self.key_size..]);

                let next = node.next.load(Ordering::Acquire, guard);
                let replacement = Node::alloc(hash, data, next.as_raw());
                // SAFETY: `replacement` is fresh; `current` is unlinked by
                // this store and retired exactly once.
                unsafe {
                    link.store(Shared::from_raw(replacement), Ordering::Release);
                    epoch::defer_free(current.as_raw());
                }
                return Ok(());
            }

            link = &node.next;
            current = node.next.load(Ordering::Acquire, guard);
        }

        if flags == UpdateFlags::Exist {
            return Err(MapError::NotFound);
        }
        if self.len() >= self.max_entries {
            return Err(MapError::Busy);
        }

        let mut data = vec![0u8; self.key_size + self.value_size].into_boxed_slice();
        data[..self.key_size].copy_from_slice(key);
        fill(None, &mut data[self.key_size..]);

        // Append at the tail so iteration order of existing keys is stable.
        let node = Node::alloc(hash, data, core::ptr::null_mut());
        // SAFETY: `node` is a fresh allocation published exactly once.
        unsafe { link.store(Shared::from_raw(node), Ordering::Release) };
        self.len.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Unlinks the entry for `key`.
    pub(crate) fn remove(&self, key: &[u8], guard: &Guard) -> Result<()> {
        let hash = self.hasher.hash_one(key);
        let _writer = self.writer.lock();

        let mut link = &self.buckets[self.bucket_of(hash)];
        let mut current = link.load(Ordering::Acquire, guard);

        while !current.is_null() {
            // SAFETY: writers are serialized, so `current` is still linked.
            let node = unsafe { current.deref() };

            if node.hash == hash && self.key_of(node) == key {
                let next = node.next.load(Ordering::Acquire, guard);
                link.store(next, Ordering::Release);
                self.len.fetch_sub(1, Ordering::Release);
                // SAFETY: unlinked above; readers that still hold it keep it
                // alive through their guards.
                unsafe { epoch::defer_free(current.as_raw()) };
                return Ok(());
            }

            link = &node.next;
            current = node.next.load(Ordering::Acquire, guard);
        }

        Err(MapError::NotFound)
    }

    /// Writes the key that follows `key` in bucket-then-chain order.
    ///
    /// A key that is no longer present restarts from the first entry.
    pub(crate) fn next_key(&self, key: Option<&[u8]>, next_key: &mut [u8], guard: &Guard) -> Result<()> {
        if next_key.len() != self.key_size {
            return Err(MapError::InvalidArgument("key buffer size mismatch"));
        }

        let mut start = 0;
        if let Some(key) = key {
            let hash = self.hasher.hash_one(key);
            if let Some(node) = self.find(hash, key, guard) {
                let next = node.next.load(Ordering::Acquire, guard);
                // SAFETY: protected by `guard`.
                if let Some(next) = unsafe { next.as_ref() } {
                    next_key.copy_from_slice(self.key_of(next));
                    return Ok(());
                }
                start = self.bucket_of(hash) + 1;
            }
        }

        for bucket in self.buckets[start..].iter() {
            let head = bucket.load(Ordering::Acquire, guard);
            // SAFETY: protected by `guard`.
            if let Some(node) = unsafe { head.as_ref() } {
                next_key.copy_from_slice(self.key_of(node));
                return Ok(());
            }
        }

        Err(MapError::NotFound)
    }
}

impl Drop for HashTable {
    fn drop(&mut self) {
        let guard = epoch::enter();

        for bucket in self.buckets.iter() {
            let mut current = bucket.load(Ordering::Acquire, &guard);
            while !current.is_null() {
                // SAFETY: `&mut self` means no reader or writer remains.
                unsafe {
                    let next = current.deref().next.load(Ordering::Relaxed, &guard);
                    drop(Box::from_raw(current.as_raw()));
                    current = next;
                }
            }
        }
    }
}

// SAFETY: chains are mutated only under `writer` and published with
// release stores; nodes are immutable after publication.
unsafe impl Send for HashTable {}
unsafe impl Sync for HashTable {}

/// Hash table map.
pub struct HashtableMap {
    table: HashTable,
    value_size: usize,
}

impl HashtableMap {
    pub(crate) fn new(attr: &MapAttr) -> Result<Self> {
        let value_size = attr.value_size as usize;
        Ok(Self {
            table: HashTable::new(attr.key_size as usize, value_size, attr.max_entries as usize),
            value_size,
        })
    }

    fn store(&self, key: &[u8], value: &[u8], flags: UpdateFlags, guard: &Guard) -> Result<()> {
        self.table
            .upsert(key, flags, guard, |_, slot| slot.copy_from_slice(value))
    }
}

impl MapInstance for HashtableMap {
    fn lookup<'g>(&'g self, key: &[u8], guard: &'g Guard) -> Option<&'g [u8]> {
        self.table.get(key, guard)
    }

    fn lookup_from_user(&self, key: &[u8], value: &mut [u8], guard: &Guard) -> Result<()> {
        if value.len() != self.value_size {
            return Err(MapError::InvalidArgument("value buffer size mismatch"));
        }
        let stored = self.table.get(key, guard).ok_or(MapError::NotFound)?;
        value.copy_from_slice(stored);
        Ok(())
    }

    fn update(&self, key: &[u8], value: &[u8], flags: UpdateFlags, guard: &Guard) -> Result<()> {
        self.store(key, value, flags, guard)
    }

    fn update_from_user(
        &self,
        key: &[u8],
        value: &[u8],
        flags: UpdateFlags,
        guard: &Guard,
    ) -> Result<()> {
        self.store(key, value, flags, guard)
    }

    fn delete(&self, key: &[u8], guard: &Guard) -> Result<()> {
        self.table.remove(key, guard)
    }

    fn delete_from_user(&self, key: &[u8], guard: &Guard) -> Result<()> {
        self.table.remove(key, guard)
    }

    fn get_next_key_from_user(
        &self,
        key: Option<&[u8]>,
        next_key: &mut [u8],
        guard: &Guard,
    ) -> Result<()> {
        self.table.next_key(key, next_key, guard)
    }

    fn deinit(&mut self, _arg: DeinitArg<'_>) {
        tracing::trace!(entries = self.table.len(), "hashtable map deinit");
    }
}

/// Hash table with one value slot per CPU under a single key set.
///
/// Trusted calls touch only the calling CPU's slot; inserting through the
/// trusted path leaves the other CPUs' slots zeroed. The key itself is shared,
/// so once inserted on one CPU a trusted lookup on any other CPU finds it and
/// reads zeroes rather than missing. User lookups return all slots back to
/// back in CPU order and user updates write every slot.
pub struct PercpuHashtableMap {
    table: HashTable,
    platform: Arc<dyn Platform>,
    ncpus: usize,
    value_size: usize,
}

impl PercpuHashtableMap {
    pub(crate) fn new(attr: &MapAttr, platform: Arc<dyn Platform>) -> Result<Self> {
        let ncpus = platform.ncpus().max(1) as usize;
        let value_size = attr.value_size as usize;
        Ok(Self {
            table: HashTable::new(
                attr.key_size as usize,
                value_size * ncpus,
                attr.max_entries as usize,
            ),
            platform,
            ncpus,
            value_size,
        })
    }

    pub(crate) fn ncpus(&self) -> usize {
        self.ncpus
    }

    #[inline]
    fn local_range(&self) -> core::ops::Range<usize> {
        let cpu = self.platform.curcpu() as usize % self.ncpus;
        cpu * self.value_size..(cpu + 1) * self.value_size
    }
}

impl MapInstance for PercpuHashtableMap {
    fn lookup<'g>(&'g self, key: &[u8], guard: &'g Guard) -> Option<&'g [u8]> {
        let range = self.local_range();
        self.table.get(key, guard).map(|slots| &slots[range])
    }

    fn lookup_from_user(&self, key: &[u8], value: &mut [u8], guard: &Guard) -> Result<()> {
        if value.len() != self.value_size * self.ncpus {
            return Err(MapError::InvalidArgument("value buffer size mismatch"));
        }
        let stored = self.table.get(key, guard).ok_or(MapError::NotFound)?;
        value.copy_from_slice(stored);
        Ok(())
    }

    fn update(&self, key: &[u8], value: &[u8], flags: UpdateFlags, guard: &Guard) -> Result<()> {
        let range = self.local_range();
        self.table.upsert(key, flags, guard, |old, slots| {
            if let Some(old) = old {
                slots.copy_from_slice(old);
            }
            slots[range].copy_from_slice(value);
        })
    }

    fn update_from_user(
        &self,
        key: &[u8],
        value: &[u8],
        flags: UpdateFlags,
        guard: &Guard,
    ) -> Result<()> {
        self.table.upsert(key, flags, guard, |_, slots| {
            for slot in slots.chunks_exact_mut(self.value_size) {
                slot.copy_from_slice(value);
            }
        })
    }

    fn delete(&self, key: &[u8], guard: &Guard) -> Result<()> {
        self.table.remove(key, guard)
    }

    fn delete_from_user(&self, key: &[u8], guard: &Guard) -> Result<()> {
        self.table.remove(key, guard)
    }

    fn get_next_key_from_user(
        &self,
        key: Option<&[u8]>,
        next_key: &mut [u8],
        guard: &Guard,
    ) -> Result<()> {
        self.table.next_key(key, next_key, guard)
    }

    fn deinit(&mut self, _arg: DeinitArg<'_>) {
        tracing::trace!(
            entries = self.table.len(),
            cpus = self.ncpus,
            "percpu hashtable map deinit"
        );
    }
}
