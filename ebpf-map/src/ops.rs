//! Operation tables.
//!
//! The four built-in kinds form a closed set and are dispatched with a
//! `match`. Externally registered kinds plug in through [`MapOps`] and
//! [`MapInstance`] and are the only ones reached through a vtable.

use std::any::Any;
use std::sync::Arc;

use crate::array::{ArrayMap, PercpuArrayMap};
use crate::attr::{MapAttr, UpdateFlags};
use crate::epoch::Guard;
use crate::error::{MapError, Result};
use crate::hashtable::{HashtableMap, PercpuHashtableMap};
use crate::platform::Platform;

/// Opaque argument forwarded from `Map::deinit` to the type's `deinit`.
pub type DeinitArg<'a> = Option<&'a mut dyn Any>;

/// Constructor half of an operation table, implemented by extension types.
pub trait MapOps: Send + Sync {
    /// Builds the type-specific body of a new map.
    ///
    /// `attr` has already been validated for non-zero sizes.
    fn init(&self, attr: &MapAttr, platform: &Arc<dyn Platform>) -> Result<Box<dyn MapInstance>>;
}

/// Per-map half of an operation table.
///
/// Key and value slices handed in by the dispatch layer already have the
/// map's configured lengths. Every method is required.
pub trait MapInstance: Send + Sync {
    /// Trusted lookup. Returns a view of the stored value valid for `guard`.
    fn lookup<'g>(&'g self, key: &[u8], guard: &'g Guard) -> Option<&'g [u8]>;

    /// User lookup. Copies the value into `value`.
    fn lookup_from_user(&self, key: &[u8], value: &mut [u8], guard: &Guard) -> Result<()>;

    /// Trusted update.
    fn update(&self, key: &[u8], value: &[u8], flags: UpdateFlags, guard: &Guard) -> Result<()>;

    /// User update.
    fn update_from_user(
        &self,
        key: &[u8],
        value: &[u8],
        flags: UpdateFlags,
        guard: &Guard,
    ) -> Result<()>;

    /// Trusted delete.
    fn delete(&self, key: &[u8], guard: &Guard) -> Result<()>;

    /// User delete.
    fn delete_from_user(&self, key: &[u8], guard: &Guard) -> Result<()>;

    /// Writes the key following `key` (or the first key for `None`) into
    /// `next_key`. Fails with [`MapError::NotFound`] at the end.
    fn get_next_key_from_user(
        &self,
        key: Option<&[u8]>,
        next_key: &mut [u8],
        guard: &Guard,
    ) -> Result<()>;

    /// Releases type-specific resources before the body is dropped.
    fn deinit(&mut self, arg: DeinitArg<'_>);
}

/// Operation table stored in a map type descriptor.
pub(crate) enum MapTypeOps {
    Bad,
    Array,
    PercpuArray,
    Hashtable,
    PercpuHashtable,
    Extension(Box<dyn MapOps>),
}

impl MapTypeOps {
    pub(crate) fn init(&self, attr: &MapAttr, platform: &Arc<dyn Platform>) -> Result<MapBody> {
        match self {
            MapTypeOps::Bad => Err(MapError::InvalidArgument("bad map type")),
            MapTypeOps::Array => ArrayMap::new(attr).map(MapBody::Array),
            MapTypeOps::PercpuArray => {
                PercpuArrayMap::new(attr, Arc::clone(platform)).map(MapBody::PercpuArray)
            }
            MapTypeOps::Hashtable => HashtableMap::new(attr).map(MapBody::Hashtable),
            MapTypeOps::PercpuHashtable => {
                PercpuHashtableMap::new(attr, Arc::clone(platform)).map(MapBody::PercpuHashtable)
            }
            MapTypeOps::Extension(ops) => ops.init(attr, platform).map(MapBody::Extension),
        }
    }
}

/// Type-specific body of a live map.
pub(crate) enum MapBody {
    Array(ArrayMap),
    PercpuArray(PercpuArrayMap),
    Hashtable(HashtableMap),
    PercpuHashtable(PercpuHashtableMap),
    Extension(Box<dyn MapInstance>),
}

macro_rules! dispatch {
    ($body:expr, $m:ident => $call:expr) => {
        match $body {
            MapBody::Array($m) => $call,
            MapBody::PercpuArray($m) => $call,
            MapBody::Hashtable($m) => $call,
            MapBody::PercpuHashtable($m) => $call,
            MapBody::Extension($m) => $call,
        }
    };
}

impl MapBody {
    /// Number of CPU slots a user-path value spans.
    pub(crate) fn value_slots(&self) -> usize {
        match self {
            MapBody::PercpuArray(m) => m.ncpus(),
            MapBody::PercpuHashtable(m) => m.ncpus(),
            _ => 1,
        }
    }
}

impl MapInstance for MapBody {
    #[inline]
    fn lookup<'g>(&'g self, key: &[u8], guard: &'g Guard) -> Option<&'g [u8]> {
        dispatch!(self, m => m.lookup(key, guard))
    }

    #[inline]
    fn lookup_from_user(&self, key: &[u8], value: &mut [u8], guard: &Guard) -> Result<()> {
        dispatch!(self, m => m.lookup_from_user(key, value, guard))
    }

    #[inline]
    fn update(&self, key: &[u8], value: &[u8], flags: UpdateFlags, guard: &Guard) -> Result<()> {
        dispatch!(self, m => m.update(key, value, flags, guard))
    }

    #[inline]
    fn update_from_user(
        &self,
        key: &[u8],
        value: &[u8],
        flags: UpdateFlags,
        guard: &Guard,
    ) -> Result<()> {
        dispatch!(self, m => m.update_from_user(key, value, flags, guard))
    }

    #[inline]
    fn delete(&self, key: &[u8], guard: &Guard) -> Result<()> {
        dispatch!(self, m => m.delete(key, guard))
    }

    #[inline]
    fn delete_from_user(&self, key: &[u8], guard: &Guard) -> Result<()> {
        dispatch!(self, m => m.delete_from_user(key, guard))
    }

    #[inline]
    fn get_next_key_from_user(
        &self,
        key: Option<&[u8]>,
        next_key: &mut [u8],
        guard: &Guard,
    ) -> Result<()> {
        dispatch!(self, m => m.get_next_key_from_user(key, next_key, guard))
    }

    fn deinit(&mut self, arg: DeinitArg<'_>) {
        dispatch!(self, m => m.deinit(arg))
    }
}
