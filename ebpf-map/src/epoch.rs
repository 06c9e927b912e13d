//! Epoch-based read-side critical sections and deferred reclamation.
//!
//! A [`Guard`] marks the calling thread as a reader. Nodes a writer unlinks
//! are handed to [`defer_free`] and are only freed once no guard that could
//! have observed them is alive. Sections nest: an inner [`enter`] while a
//! guard is already held is cheap and shares the outer protection.

use kovan::RetiredNode;

pub use kovan::Guard;

/// Opens a read-side critical section. Dropping the guard closes it.
#[inline]
pub fn enter() -> Guard {
    kovan::pin()
}

/// Heap node that carries the header required for deferred reclamation.
///
/// `RetiredNode` must stay the first field: the reclaimer reads its
/// bookkeeping from offset 0 of every retired allocation.
#[repr(C)]
pub(crate) struct ValueNode {
    retired: RetiredNode,
    bytes: Box<[u8]>,
}

impl ValueNode {
    pub(crate) fn zeroed(len: usize) -> *mut ValueNode {
        Self::from_bytes(vec![0u8; len].into_boxed_slice())
    }

    pub(crate) fn from_bytes(bytes: Box<[u8]>) -> *mut ValueNode {
        Box::into_raw(Box::new(ValueNode {
            retired: RetiredNode::new(),
            bytes,
        }))
    }

    #[inline]
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Schedules `ptr` to be freed once every reader that might still hold it
/// has left its section.
///
/// # Safety
///
/// - `ptr` must come from `Box::into_raw` and be `#[repr(C)]` with a
///   `RetiredNode` as its first field.
/// - `ptr` must already be unreachable for new readers and must not be
///   retired twice.
#[inline]
pub(crate) unsafe fn defer_free<T: 'static>(ptr: *mut T) {
    unsafe { kovan::retire(ptr) }
}
