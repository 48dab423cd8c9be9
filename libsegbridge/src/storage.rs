//! Aligned byte storage shared by host arrays and native matrices

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Counters of cross-boundary allocations owned by one runtime
#[derive(Debug, Default)]
pub struct AllocationStats {
    live_storage: AtomicUsize,
    total_storage: AtomicUsize,
    live_holds: AtomicUsize,
}

impl AllocationStats {
    /// Storage blocks allocated and not yet freed
    pub fn live_storage(&self) -> usize {
        self.live_storage.load(Ordering::SeqCst)
    }

    /// Storage blocks allocated since the runtime started
    pub fn total_storage(&self) -> usize {
        self.total_storage.load(Ordering::SeqCst)
    }

    /// Native matrices currently holding a reference on a host array
    pub fn live_holds(&self) -> usize {
        self.live_holds.load(Ordering::SeqCst)
    }

    pub(crate) fn hold_acquired(&self) {
        self.live_holds.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn hold_released(&self) {
        self.live_holds.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A block of zero-initialised bytes, aligned for any element type.
///
/// The block never moves or grows, so its address identifies it for its
/// whole lifetime. Access goes through a read/write lock.
pub struct Storage {
    words: RwLock<Box<[u64]>>,
    len: usize,
    addr: usize,
    stats: Option<Arc<AllocationStats>>,
}

impl Storage {
    /// Allocate `len` zeroed bytes, counted against `stats` when given
    pub fn zeroed(len: usize, stats: Option<Arc<AllocationStats>>) -> Arc<Self> {
        let words = vec![0_u64; len.div_ceil(8)].into_boxed_slice();
        let addr = words.as_ptr() as usize;
        if let Some(stats) = &stats {
            stats.live_storage.fetch_add(1, Ordering::SeqCst);
            stats.total_storage.fetch_add(1, Ordering::SeqCst);
        }
        log::trace!("Allocated storage of {len} bytes at {addr:#x}");
        Arc::new(Self {
            words: RwLock::new(words),
            len,
            addr,
            stats,
        })
    }

    /// Allocate a block holding a copy of `bytes`
    pub fn from_bytes(bytes: &[u8], stats: Option<Arc<AllocationStats>>) -> Arc<Self> {
        let storage = Self::zeroed(bytes.len(), stats);
        storage.write(|dst| dst.copy_from_slice(bytes));
        storage
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first byte
    pub const fn addr(&self) -> usize {
        self.addr
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let words = self.words.read().unwrap_or_else(PoisonError::into_inner);
        let bytes: &[u8] = bytemuck::cast_slice(&words[..]);
        f(&bytes[..self.len])
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut words = self.words.write().unwrap_or_else(PoisonError::into_inner);
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words[..]);
        f(&mut bytes[..self.len])
    }

    /// Copy bytes out of `src` into `self`, handling the case where both are the same block
    pub fn copy_from<R>(&self, src: &Self, f: impl FnOnce(&[u8], &mut [u8]) -> R) -> R {
        if std::ptr::eq(self, src) {
            let snapshot = src.read(<[u8]>::to_vec);
            self.write(|dst| f(&snapshot, dst))
        } else {
            src.read(|from| self.write(|to| f(from, to)))
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(stats) = &self.stats {
            stats.live_storage.fetch_sub(1, Ordering::SeqCst);
        }
        log::trace!("Freed storage of {} bytes at {:#x}", self.len, self.addr);
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("len", &self.len)
            .field("addr", &format_args!("{:#x}", self.addr))
            .finish()
    }
}
