//! Error type shared by the registry, the dispatch layer and every map kind.

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, MapError>;

const EINVAL: i32 = 22;
const ENOENT: i32 = 2;
const EEXIST: i32 = 17;
const EBUSY: i32 = 16;
const ENOSPC: i32 = 28;

/// Errors returned by map and registry operations.
///
/// Every error is handed back to the immediate caller unchanged. Retry
/// policy belongs to whoever issued the call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// Malformed request: out-of-range id or index, bad flags, wrong buffer
    /// length or zero-sized configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Empty registry slot, absent key or exhausted iteration.
    #[error("not found")]
    NotFound,

    /// Create-only update on a key that is already present.
    #[error("element already exists")]
    AlreadyExists,

    /// A map type with this name is already registered.
    #[error("map type '{0}' is already registered")]
    DuplicateName(String),

    /// Capacity exhausted, or a map type that is still referenced.
    #[error("resource busy")]
    Busy,

    /// No free dynamic slot left in the type registry.
    #[error("no free map type slot")]
    Exhausted,
}

impl MapError {
    /// Errno value a syscall layer reports for this error.
    pub fn errno(&self) -> i32 {
        match self {
            MapError::InvalidArgument(_) => EINVAL,
            MapError::NotFound => ENOENT,
            MapError::AlreadyExists | MapError::DuplicateName(_) => EEXIST,
            MapError::Busy => EBUSY,
            MapError::Exhausted => ENOSPC,
        }
    }
}
