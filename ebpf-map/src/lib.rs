//! Pluggable eBPF map subsystem.
//!
//! Maps are typed key/value stores shared between trusted in-kernel
//! programs and a user-facing control plane. This crate provides:
//!
//! - a [`MapTypeRegistry`] of map kinds, with reference counting so a kind
//!   cannot be unregistered while maps of it are alive,
//! - a generic [`Map`] object with lifecycle management and per-operation
//!   dispatch,
//! - four built-in kinds: array, per-CPU array, hash table and per-CPU
//!   hash table.
//!
//! Trusted lookups return borrowed views that stay valid for the epoch
//! [`Guard`] they were made under; writers never block them and retired
//! values are reclaimed only after those guards are gone.
//!
//! # Example
//!
//! ```rust
//! use ebpf_map::{epoch, Map, MapAttr, MapTypeRegistry, UpdateFlags, MAP_TYPE_HASHTABLE};
//!
//! let registry = MapTypeRegistry::with_host_platform();
//! let map = Map::init(&registry, &MapAttr::new(MAP_TYPE_HASHTABLE, 4, 8, 128)).unwrap();
//!
//! let key = 7u32.to_ne_bytes();
//! map.update_elem_from_user(&key, &42u64.to_ne_bytes(), UpdateFlags::Any.into())
//!     .unwrap();
//!
//! let guard = epoch::enter();
//! assert_eq!(map.lookup_elem(&key, &guard), Some(&42u64.to_ne_bytes()[..]));
//! ```

#![warn(missing_docs)]

mod array;
mod attr;
pub mod epoch;
mod error;
mod hashtable;
mod map;
mod ops;
pub mod platform;
mod registry;

pub use array::ARRAY_KEY_SIZE;
pub use attr::{
    BASIC_MAP_TYPE_MAX, MAP_TYPE_ARRAY, MAP_TYPE_BAD, MAP_TYPE_HASHTABLE, MAP_TYPE_MAX,
    MAP_TYPE_NAME_MAX, MAP_TYPE_PERCPU_ARRAY, MAP_TYPE_PERCPU_HASHTABLE, MapAttr, UpdateFlags,
};
pub use epoch::Guard;
pub use error::{MapError, Result};
pub use map::{Deinitializer, Map};
pub use ops::{DeinitArg, MapInstance, MapOps};
pub use platform::{HostPlatform, Platform};
pub use registry::{MapType, MapTypeRef, MapTypeRegistry};
