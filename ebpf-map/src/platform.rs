//! Platform abstraction consumed by the per-CPU map kinds.
//!
//! The kernel port answers these from the scheduler. Hosted builds use
//! [`HostPlatform`], which hands every thread a stable pseudo-CPU id.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// CPU topology queries.
pub trait Platform: Send + Sync {
    /// Number of CPUs. Always at least one.
    fn ncpus(&self) -> u16;

    /// Id of the CPU the caller is running on, in `0..ncpus()`.
    fn curcpu(&self) -> u16;
}

/// Next pseudo-CPU id handed to a thread that has not been bound yet.
static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CURRENT_CPU: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Hosted platform: a fixed CPU count and thread-local CPU ids.
///
/// Threads are assigned ids round-robin on first use, so each thread keeps
/// touching the same replica, like a pinned kernel context would.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPlatform {
    ncpus: u16,
}

impl HostPlatform {
    /// Creates a platform reporting `ncpus` CPUs (clamped to at least one).
    pub fn new(ncpus: u16) -> Self {
        Self {
            ncpus: ncpus.max(1),
        }
    }

    /// Creates a platform sized to the host's available parallelism.
    pub fn detect() -> Self {
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(u16::try_from(n).unwrap_or(u16::MAX))
    }

    /// Binds the calling thread to `cpu`.
    ///
    /// Ids at or above a platform's `ncpus()` wrap around.
    pub fn set_current_cpu(cpu: u16) {
        CURRENT_CPU.with(|c| c.set(Some(cpu as usize)));
    }

    fn thread_cpu() -> usize {
        CURRENT_CPU.with(|c| match c.get() {
            Some(cpu) => cpu,
            None => {
                let cpu = NEXT_CPU.fetch_add(1, Ordering::Relaxed);
                c.set(Some(cpu));
                cpu
            }
        })
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::detect()
    }
}

impl Platform for HostPlatform {
    #[inline]
    fn ncpus(&self) -> u16 {
        self.ncpus
    }

    #[inline]
    fn curcpu(&self) -> u16 {
        (Self::thread_cpu() % self.ncpus as usize) as u16
    }
}
