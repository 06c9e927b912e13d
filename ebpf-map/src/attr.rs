//! Map configuration, update flags and the type-id space.

use crate::error::{MapError, Result};

/// Sentinel type whose `init` always fails.
pub const MAP_TYPE_BAD: u16 = 0;
/// Fixed-size dense array indexed by a `u32` key.
pub const MAP_TYPE_ARRAY: u16 = 1;
/// One array replica per CPU.
pub const MAP_TYPE_PERCPU_ARRAY: u16 = 2;
/// Bounded hash table.
pub const MAP_TYPE_HASHTABLE: u16 = 3;
/// Hash table with one value slot per CPU.
pub const MAP_TYPE_PERCPU_HASHTABLE: u16 = 4;

/// First type-id available to dynamically registered map types.
pub const BASIC_MAP_TYPE_MAX: u16 = 5;
/// Total number of type-id slots in a registry.
pub const MAP_TYPE_MAX: u16 = 64;
/// Maximum length in bytes of a map type name.
pub const MAP_TYPE_NAME_MAX: usize = 32;

/// Creation parameters of a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapAttr {
    /// Registry type-id of the map kind.
    pub map_type: u16,
    /// Key length in bytes.
    pub key_size: u32,
    /// Value length in bytes.
    pub value_size: u32,
    /// Maximum number of live entries.
    pub max_entries: u32,
    /// Creation flags. Stored, not interpreted by the built-in kinds.
    pub flags: u32,
}

impl MapAttr {
    /// Creates an attribute set with no creation flags.
    pub const fn new(map_type: u16, key_size: u32, value_size: u32, max_entries: u32) -> Self {
        Self {
            map_type,
            key_size,
            value_size,
            max_entries,
            flags: 0,
        }
    }

    /// Sets the creation flags.
    pub const fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.map_type >= MAP_TYPE_MAX {
            return Err(MapError::InvalidArgument("map type id out of range"));
        }
        if self.key_size == 0 || self.value_size == 0 || self.max_entries == 0 {
            return Err(MapError::InvalidArgument("zero-sized map configuration"));
        }
        Ok(())
    }
}

/// Insert semantics of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum UpdateFlags {
    /// Insert or overwrite.
    Any = 0,
    /// Insert only; fails if the key exists.
    NoExist = 1,
    /// Overwrite only; fails if the key is absent.
    Exist = 2,
}

impl TryFrom<u64> for UpdateFlags {
    type Error = MapError;

    fn try_from(raw: u64) -> Result<Self> {
        match raw {
            0 => Ok(UpdateFlags::Any),
            1 => Ok(UpdateFlags::NoExist),
            2 => Ok(UpdateFlags::Exist),
            _ => Err(MapError::InvalidArgument("unknown update flags")),
        }
    }
}

impl From<UpdateFlags> for u64 {
    fn from(flags: UpdateFlags) -> u64 {
        flags as u64
    }
}
