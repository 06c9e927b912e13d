//! Generic map objects.
//!
//! A [`Map`] holds the common attributes, a reference on its registered kind
//! and the kind-specific body. Every element operation validates the
//! buffers it is given against the map's configuration before dispatching
//! to the body.
//!
//! Two entry families exist. The trusted path (`lookup_elem`,
//! `update_elem`, `delete_elem`) runs under a caller-held epoch [`Guard`]
//! and may hand out borrowed views of stored values. The user path
//! (`*_from_user`) pins its own guard and only ever copies in and out of
//! caller buffers.

use core::fmt;
use std::sync::Arc;

use crate::attr::{MapAttr, UpdateFlags};
use crate::epoch::{self, Guard};
use crate::error::{MapError, Result};
use crate::ops::{DeinitArg, MapBody, MapInstance};
use crate::registry::{MapType, MapTypeRef, MapTypeRegistry};

/// Finalizer invoked once when a map is torn down.
///
/// The default is [`Map::deinit_default`]. A replacement that wants the
/// kind's own cleanup to run must call it.
pub type Deinitializer = fn(&mut Map, DeinitArg<'_>);

/// A live map instance.
pub struct Map {
    type_id: u16,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    flags: u32,
    deinitializer: Deinitializer,
    finalized: bool,
    ty: MapTypeRef,
    body: Option<MapBody>,
}

impl Map {
    /// Creates a map of the kind registered at `attr.map_type`.
    ///
    /// On any failure after the type reference was taken, the reference is
    /// released before returning.
    pub fn init(registry: &Arc<MapTypeRegistry>, attr: &MapAttr) -> Result<Map> {
        attr.validate()?;
        let ty = registry.acquire_ref(attr.map_type)?;

        let mut map = Map {
            type_id: attr.map_type,
            key_size: attr.key_size,
            value_size: attr.value_size,
            max_entries: attr.max_entries,
            flags: attr.flags,
            deinitializer: Map::deinit_default,
            finalized: false,
            ty,
            body: None,
        };
        map.body = Some(map.ty.map_type().ops().init(attr, registry.platform())?);

        tracing::debug!(
            type_id = map.type_id,
            kind = map.ty.map_type().name(),
            key_size = map.key_size,
            value_size = map.value_size,
            max_entries = map.max_entries,
            "map created"
        );
        Ok(map)
    }

    /// Registry type-id of the map's kind.
    pub fn type_id(&self) -> u16 {
        self.type_id
    }

    /// Key length in bytes.
    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    /// Value length in bytes as seen by the trusted path.
    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    /// Maximum number of entries.
    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    /// Creation flags.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Descriptor of the map's kind.
    pub fn map_type(&self) -> &Arc<MapType> {
        self.ty.map_type()
    }

    /// Length of the value buffer the user path reads and writes for
    /// lookups. Per-CPU kinds span one value per CPU.
    pub fn user_value_size(&self) -> usize {
        self.value_size as usize * self.body.as_ref().map_or(1, MapBody::value_slots)
    }

    /// Replaces the finalizer run by [`Map::deinit`] or on drop.
    pub fn set_deinitializer(&mut self, deinitializer: Deinitializer) {
        self.deinitializer = deinitializer;
    }

    fn body(&self) -> Result<&MapBody> {
        self.body
            .as_ref()
            .ok_or(MapError::InvalidArgument("map has been torn down"))
    }

    #[inline]
    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size as usize {
            return Err(MapError::InvalidArgument("key size mismatch"));
        }
        Ok(())
    }

    #[inline]
    fn check_update(&self, key: &[u8], value: &[u8], flags: u64) -> Result<UpdateFlags> {
        self.check_key(key)?;
        if value.len() != self.value_size as usize {
            return Err(MapError::InvalidArgument("value size mismatch"));
        }
        UpdateFlags::try_from(flags)
    }

    /// Trusted lookup.
    ///
    /// Returns a view of the stored value that stays valid for as long as
    /// `guard` is held. A key of the wrong length finds nothing.
    #[inline]
    pub fn lookup_elem<'g>(&'g self, key: &[u8], guard: &'g Guard) -> Option<&'g [u8]> {
        if key.len() != self.key_size as usize {
            return None;
        }
        self.body.as_ref()?.lookup(key, guard)
    }

    /// Trusted update. `flags` is one of the [`UpdateFlags`] values.
    #[inline]
    pub fn update_elem(&self, key: &[u8], value: &[u8], flags: u64, guard: &Guard) -> Result<()> {
        let flags = self.check_update(key, value, flags)?;
        self.body()?.update(key, value, flags, guard)
    }

    /// Trusted delete.
    #[inline]
    pub fn delete_elem(&self, key: &[u8], guard: &Guard) -> Result<()> {
        self.check_key(key)?;
        self.body()?.delete(key, guard)
    }

    /// Copies the value stored under `key` into `value`, which must be
    /// [`user_value_size`](Self::user_value_size) bytes long.
    pub fn lookup_elem_from_user(&self, key: &[u8], value: &mut [u8]) -> Result<()> {
        self.check_key(key)?;
        if value.len() != self.user_value_size() {
            return Err(MapError::InvalidArgument("value buffer size mismatch"));
        }
        let body = self.body()?;
        let guard = epoch::enter();
        body.lookup_from_user(key, value, &guard)
    }

    /// Stores `value` under `key` from the user side.
    pub fn update_elem_from_user(&self, key: &[u8], value: &[u8], flags: u64) -> Result<()> {
        let flags = self.check_update(key, value, flags)?;
        let body = self.body()?;
        let guard = epoch::enter();
        body.update_from_user(key, value, flags, &guard)
    }

    /// Removes `key` from the user side.
    pub fn delete_elem_from_user(&self, key: &[u8]) -> Result<()> {
        self.check_key(key)?;
        let body = self.body()?;
        let guard = epoch::enter();
        body.delete_from_user(key, &guard)
    }

    /// Writes the key following `key` into `next_key`.
    ///
    /// `None` asks for the first key. Fails with [`MapError::NotFound`] once
    /// iteration is complete.
    pub fn get_next_key_from_user(&self, key: Option<&[u8]>, next_key: &mut [u8]) -> Result<()> {
        if let Some(key) = key {
            self.check_key(key)?;
        }
        if next_key.len() != self.key_size as usize {
            return Err(MapError::InvalidArgument("key buffer size mismatch"));
        }
        let body = self.body()?;
        let guard = epoch::enter();
        body.get_next_key_from_user(key, next_key, &guard)
    }

    /// Tears the map down through its finalizer, forwarding `arg`.
    pub fn deinit(mut self, arg: DeinitArg<'_>) {
        self.finalize(arg);
    }

    /// Default finalizer: runs the kind's `deinit`, frees the body and
    /// releases the type reference.
    pub fn deinit_default(map: &mut Map, arg: DeinitArg<'_>) {
        if let Some(mut body) = map.body.take() {
            body.deinit(arg);
        }
        map.ty.release();
        tracing::debug!(type_id = map.type_id, "map destroyed");
    }

    fn finalize(&mut self, arg: DeinitArg<'_>) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        let deinitializer = self.deinitializer;
        deinitializer(self, arg);
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        self.finalize(None);
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("type_id", &self.type_id)
            .field("kind", &self.ty.map_type().name())
            .field("key_size", &self.key_size)
            .field("value_size", &self.value_size)
            .field("max_entries", &self.max_entries)
            .field("flags", &self.flags)
            .finish()
    }
}
