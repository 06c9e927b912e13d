//! Map type registry.
//!
//! A fixed table of type-id slots behind one lock. The low range holds the
//! built-in kinds and is populated at construction; the rest is open to
//! extension kinds at runtime. Each descriptor carries a reference count so
//! it cannot be unregistered while maps of that kind are alive.

use core::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::attr::{
    BASIC_MAP_TYPE_MAX, MAP_TYPE_ARRAY, MAP_TYPE_BAD, MAP_TYPE_HASHTABLE, MAP_TYPE_MAX,
    MAP_TYPE_NAME_MAX, MAP_TYPE_PERCPU_ARRAY, MAP_TYPE_PERCPU_HASHTABLE,
};
use crate::error::{MapError, Result};
use crate::ops::{MapOps, MapTypeOps};
use crate::platform::{HostPlatform, Platform};

const TYPE_SLOTS: usize = MAP_TYPE_MAX as usize;
const FIRST_DYNAMIC: usize = BASIC_MAP_TYPE_MAX as usize;

/// Description of one map kind: its name, operation table and reference
/// count.
pub struct MapType {
    name: [u8; MAP_TYPE_NAME_MAX],
    ops: MapTypeOps,
    refcount: AtomicU32,
    /// Set while the descriptor occupies a slot in some registry.
    installed: AtomicBool,
}

impl MapType {
    /// Creates an extension descriptor.
    ///
    /// The name must be non-empty, free of NUL bytes and at most
    /// [`MAP_TYPE_NAME_MAX`] bytes long.
    pub fn new(name: &str, ops: impl MapOps + 'static) -> Result<Self> {
        Self::with_ops(name, MapTypeOps::Extension(Box::new(ops)))
    }

    fn with_ops(name: &str, ops: MapTypeOps) -> Result<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > MAP_TYPE_NAME_MAX || bytes.contains(&0) {
            return Err(MapError::InvalidArgument("invalid map type name"));
        }
        let mut fixed = [0u8; MAP_TYPE_NAME_MAX];
        fixed[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            name: fixed,
            ops,
            refcount: AtomicU32::new(0),
            installed: AtomicBool::new(false),
        })
    }

    /// Name of the map kind.
    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAP_TYPE_NAME_MAX);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    /// Number of live references handed out by the registry.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn ops(&self) -> &MapTypeOps {
        &self.ops
    }
}

impl fmt::Debug for MapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapType")
            .field("name", &self.name())
            .field("refcount", &self.refcount())
            .finish()
    }
}

fn builtin_types() -> [(u16, &'static str, fn() -> MapTypeOps); FIRST_DYNAMIC] {
    [
        (MAP_TYPE_BAD, "bad", || MapTypeOps::Bad),
        (MAP_TYPE_ARRAY, "array", || MapTypeOps::Array),
        (MAP_TYPE_PERCPU_ARRAY, "percpu_array", || MapTypeOps::PercpuArray),
        (MAP_TYPE_HASHTABLE, "hashtable", || MapTypeOps::Hashtable),
        (
            MAP_TYPE_PERCPU_HASHTABLE,
            "percpu_hashtable",
            || MapTypeOps::PercpuHashtable,
        ),
    ]
}

/// Table of registered map kinds.
///
/// Constructed once per subsystem and shared with every map created from
/// it. Registration, unregistration, acquisition and release are each a
/// single critical section on the registry lock.
pub struct MapTypeRegistry {
    slots: Mutex<[Option<Arc<MapType>>; TYPE_SLOTS]>,
    platform: Arc<dyn Platform>,
}

impl MapTypeRegistry {
    /// Creates a registry with the built-in kinds installed.
    pub fn new(platform: Arc<dyn Platform>) -> Arc<Self> {
        let registry = Self {
            slots: Mutex::new(std::array::from_fn(|_| None)),
            platform,
        };
        registry.init_builtins();
        Arc::new(registry)
    }

    /// Creates a registry backed by a [`HostPlatform`] sized to this machine.
    pub fn with_host_platform() -> Arc<Self> {
        Self::new(Arc::new(HostPlatform::detect()))
    }

    /// Platform the per-CPU kinds consult.
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Installs fresh built-in descriptors, with zero reference counts, into
    /// every empty built-in slot.
    ///
    /// Runs as part of [`MapTypeRegistry::new`]. Calling it again after a
    /// successful [`MapTypeRegistry::deinit`] brings the subsystem back up.
    pub fn init_builtins(&self) {
        let mut slots = self.slots.lock();
        let mut installed = 0usize;
        for (id, name, ops) in builtin_types() {
            let slot = &mut slots[id as usize];
            if slot.is_none() {
                *slot = Some(Arc::new(MapType {
                    name: builtin_name(name),
                    ops: ops(),
                    refcount: AtomicU32::new(0),
                    installed: AtomicBool::new(true),
                }));
                installed += 1;
            }
        }
        tracing::debug!(installed, "built-in map types installed");
    }

    /// Registers an extension kind and returns the type-id it was given.
    ///
    /// The whole table is checked for a name collision even after a free
    /// slot has been found, so a duplicate never gets a slot. A descriptor
    /// already installed in this or another registry fails with
    /// [`MapError::Busy`].
    pub fn register(&self, ty: Arc<MapType>) -> Result<u16> {
        let mut slots = self.slots.lock();
        let mut available: Option<usize> = None;

        for (id, slot) in slots.iter().enumerate() {
            match slot {
                Some(existing) => {
                    if existing.name == ty.name {
                        return Err(MapError::DuplicateName(ty.name().to_owned()));
                    }
                }
                None if id >= FIRST_DYNAMIC && available.is_none() => available = Some(id),
                None => {}
            }
        }

        let id = available.ok_or(MapError::Exhausted)?;
        if ty
            .installed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MapError::Busy);
        }
        tracing::debug!(type_id = id, name = ty.name(), "map type registered");
        slots[id] = Some(ty);
        Ok(id as u16)
    }

    /// Removes an extension kind, identified by descriptor identity.
    pub fn unregister(&self, ty: &Arc<MapType>) -> Result<()> {
        let mut slots = self.slots.lock();

        let id = slots[FIRST_DYNAMIC..]
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|t| Arc::ptr_eq(t, ty)))
            .map(|pos| pos + FIRST_DYNAMIC)
            .ok_or(MapError::NotFound)?;

        if ty.refcount() != 0 {
            return Err(MapError::Busy);
        }

        slots[id] = None;
        ty.installed.store(false, Ordering::Release);
        tracing::debug!(type_id = id, name = ty.name(), "map type unregistered");
        Ok(())
    }

    /// Takes a reference on the kind at `type_id`.
    ///
    /// Every successful call must be paired with one
    /// [`release`](Self::release) of the same id.
    pub fn acquire(&self, type_id: u16) -> Result<Arc<MapType>> {
        if type_id >= MAP_TYPE_MAX {
            return Err(MapError::InvalidArgument("map type id out of range"));
        }

        let slots = self.slots.lock();
        let ty = slots[type_id as usize].as_ref().ok_or(MapError::NotFound)?;
        ty.refcount.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::clone(ty))
    }

    /// Like [`acquire`](Self::acquire), but the reference is dropped
    /// automatically with the returned handle.
    pub fn acquire_ref(self: &Arc<Self>, type_id: u16) -> Result<MapTypeRef> {
        let ty = self.acquire(type_id)?;
        Ok(MapTypeRef {
            registry: Arc::clone(self),
            type_id,
            ty,
            held: true,
        })
    }

    /// Drops a reference taken with [`acquire`](Self::acquire).
    ///
    /// # Panics
    ///
    /// Releasing an empty slot or a zero count is a contract violation.
    pub fn release(&self, type_id: u16) {
        let slots = self.slots.lock();
        let ty = slots.get(type_id as usize).and_then(Option::as_ref);
        assert!(ty.is_some(), "release of empty map type slot {type_id}");
        if let Some(ty) = ty {
            let count = ty.refcount.load(Ordering::Acquire);
            assert!(count > 0, "map type {type_id} released more often than acquired");
            ty.refcount.store(count - 1, Ordering::Release);
        }
    }

    /// Clears every slot, built-in and dynamic.
    ///
    /// Fails with [`MapError::Busy`], leaving every slot in place, while any
    /// registered kind is still referenced.
    pub fn deinit(&self) -> Result<()> {
        let mut slots = self.slots.lock();

        if slots.iter().flatten().any(|ty| ty.refcount() != 0) {
            return Err(MapError::Busy);
        }

        let cleared = slots
            .iter_mut()
            .filter_map(Option::take)
            .inspect(|ty| ty.installed.store(false, Ordering::Release))
            .count();
        tracing::debug!(cleared, "map type registry cleared");
        Ok(())
    }

    /// Reference count of the kind at `type_id`, if the slot is occupied.
    pub fn refcount(&self, type_id: u16) -> Option<u32> {
        let slots = self.slots.lock();
        slots
            .get(type_id as usize)
            .and_then(Option::as_ref)
            .map(|ty| ty.refcount())
    }

    /// Type-id of the kind registered under `name`.
    pub fn lookup_name(&self, name: &str) -> Option<u16> {
        let slots = self.slots.lock();
        slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|ty| ty.name() == name))
            .map(|id| id as u16)
    }
}

impl fmt::Debug for MapTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        f.debug_map()
            .entries(
                slots
                    .iter()
                    .enumerate()
                    .filter_map(|(id, slot)| slot.as_ref().map(|ty| (id, ty))),
            )
            .finish()
    }
}

fn builtin_name(name: &str) -> [u8; MAP_TYPE_NAME_MAX] {
    let mut fixed = [0u8; MAP_TYPE_NAME_MAX];
    fixed[..name.len()].copy_from_slice(name.as_bytes());
    fixed
}

/// A held reference on a registered map kind, released on drop.
pub struct MapTypeRef {
    registry: Arc<MapTypeRegistry>,
    type_id: u16,
    ty: Arc<MapType>,
    held: bool,
}

impl MapTypeRef {
    /// Type-id the reference was taken on.
    pub fn type_id(&self) -> u16 {
        self.type_id
    }

    /// The referenced descriptor.
    pub fn map_type(&self) -> &Arc<MapType> {
        &self.ty
    }

    /// Registry the reference belongs to.
    pub fn registry(&self) -> &Arc<MapTypeRegistry> {
        &self.registry
    }

    pub(crate) fn release(&mut self) {
        if self.held {
            self.held = false;
            self.registry.release(self.type_id);
        }
    }
}

impl Drop for MapTypeRef {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for MapTypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapTypeRef")
            .field("type_id", &self.type_id)
            .field("name", &self.ty.name())
            .field("held", &self.held)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_installed() {
        let registry = MapTypeRegistry::new(Arc::new(HostPlatform::new(2)));
        assert_eq!(registry.lookup_name("array"), Some(MAP_TYPE_ARRAY));
        assert_eq!(registry.lookup_name("percpu_hashtable"), Some(MAP_TYPE_PERCPU_HASHTABLE));
        for id in 0..BASIC_MAP_TYPE_MAX {
            assert_eq!(registry.refcount(id), Some(0));
        }
        assert_eq!(registry.refcount(BASIC_MAP_TYPE_MAX), None);
    }

    #[test]
    fn test_name_limits() {
        let long = "x".repeat(MAP_TYPE_NAME_MAX + 1);
        assert!(MapType::with_ops(&long, MapTypeOps::Bad).is_err());
        assert!(MapType::with_ops("", MapTypeOps::Bad).is_err());
        assert!(MapType::with_ops("a\0b", MapTypeOps::Bad).is_err());
        let exact = "y".repeat(MAP_TYPE_NAME_MAX);
        let ty = MapType::with_ops(&exact, MapTypeOps::Bad).unwrap();
        assert_eq!(ty.name(), exact);
    }

    #[test]
    fn test_acquire_ref_releases_on_drop() {
        let registry = MapTypeRegistry::new(Arc::new(HostPlatform::new(1)));
        {
            let held = registry.acquire_ref(MAP_TYPE_HASHTABLE).unwrap();
            assert_eq!(held.type_id(), MAP_TYPE_HASHTABLE);
            assert_eq!(registry.refcount(MAP_TYPE_HASHTABLE), Some(1));
        }
        assert_eq!(registry.refcount(MAP_TYPE_HASHTABLE), Some(0));
    }

    #[test]
    #[should_panic(expected = "released more often than acquired")]
    fn test_release_without_acquire_panics() {
        let registry = MapTypeRegistry::new(Arc::new(HostPlatform::new(1)));
        registry.release(MAP_TYPE_ARRAY);
    }
}
