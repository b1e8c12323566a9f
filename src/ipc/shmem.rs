//! POSIX shared memory wrapper with type safety and automatic cleanup.
//!
//! [`Shm<T, Mode>`] is a smart pointer to a named shared memory object
//! (`shm_open` + `mmap`). The `Mode` type parameter encodes cleanup
//! behavior at compile time:
//!
//! - [`Creator`] — creates the object, unlinks the name on drop
//! - [`Opener`] — attaches to an existing object, only unmaps on drop
//!
//! Types placed in shared memory must implement [`SharedMemorySafe`]:
//! stable `#[repr(C)]` layout, no pointers, atomics for synchronization,
//! safe even if `Drop` never runs (a crashed process bypasses destructors).
//!
//! Creation initializes the memory in place through a caller-supplied
//! closure; openers rendezvous on an [`InitCell`] magic value so they never
//! observe a partially initialized object.

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use std::fmt;
use std::marker::PhantomData;
use std::mem::{MaybeUninit, size_of};
use std::ops::Deref;
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;
use std::time::Duration;

use thiserror::Error;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Errors produced by [`Shm`] and the primitives built on it.
#[derive(Debug, Error)]
pub enum ShmError {
    /// The provided POSIX shared memory name is invalid.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// `shm_open`, `mmap`, `ftruncate`, etc. failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        op: &'static str,
        path: String,
        source: io::Errno,
    },
    /// The existing object has a different size than `T`.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
    /// The creator never finished initializing the object.
    #[error("shared memory `{path}` was not initialized in time")]
    InitTimeout { path: String },
}

impl ShmError {
    fn posix(op: &'static str, path: &ShmPath, err: io::Errno) -> Self {
        Self::Posix {
            op,
            path: path.to_string(),
            source: err,
        }
    }

    /// Errno carried by this error, if it wraps a failed POSIX call.
    #[must_use]
    pub fn errno(&self) -> Option<io::Errno> {
        match self {
            Self::Posix { source, .. } => Some(*source),
            _ => None,
        }
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated POSIX shared memory object name.
///
/// For portable use the name must start with `/`, contain no further
/// slashes, and stay within `NAME_MAX` (255) bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    /// Validates `path` as a POSIX shared memory name.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::InvalidPath`] if the name does not meet the
    /// `shm_open` portability requirements.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(ShmError::InvalidPath {
                path,
                reason: "path must start with '/'",
            });
        }
        if path[1..].contains('/') {
            return Err(ShmError::InvalidPath {
                path,
                reason: "path must not contain additional '/' characters",
            });
        }
        if path.len() > POSIX_NAME_MAX {
            return Err(ShmError::InvalidPath {
                path,
                reason: "path length must be <= 255 bytes",
            });
        }
        Ok(Self(path))
    }

    /// The validated name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ShmPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ShmPath> for String {
    fn from(path: ShmPath) -> Self {
        path.0
    }
}

/// Cleanup behavior marker for shared memory handles.
///
/// `Shm<T, Creator>` and `Shm<T, Opener>` are distinct types with distinct
/// `Drop` behavior, enforced at compile time.
pub trait ShmMode {
    /// Whether to unlink the shared memory name on drop.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker for the process that creates the object.
///
/// Dropping a `Shm<T, Creator>` unmaps the memory and unlinks the name.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker for processes that attach to an existing object.
///
/// Dropping a `Shm<T, Opener>` only unmaps; the name persists until the
/// creator removes it.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types safe to place in POSIX shared memory across processes.
///
/// # Safety
///
/// Implementers must guarantee:
/// - `#[repr(C)]` or `#[repr(transparent)]` layout
/// - no pointers, references, or heap-backed fields (addresses do not
///   transfer across address spaces)
/// - all fields are themselves `SharedMemorySafe`
/// - concurrent access is mediated by atomics
/// - the type is safe even if `Drop` never runs
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    bool,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

// Arrays are SharedMemorySafe if their elements are.
unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// Cross-process initialization rendezvous cell.
///
/// The creator publishes a magic value once the surrounding structure is
/// fully initialized; openers spin on the cell before touching anything
/// else. Lives on its own cache line at the head of the shared structure.
#[repr(C)]
#[repr(align(64))]
pub(crate) struct InitCell(AtomicU64);

// SAFETY: a single AtomicU64 with stable layout.
unsafe impl SharedMemorySafe for InitCell {}

impl InitCell {
    /// An unpublished cell, for in-place construction by the creator.
    pub(crate) const fn unset() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Marks the surrounding structure as fully initialized.
    pub(crate) fn publish(&self, magic: u64) {
        self.0.store(magic, Ordering::Release);
    }

    /// Spins until `magic` is published or `timeout` expires.
    pub(crate) fn wait(&self, magic: u64, timeout: Duration) -> bool {
        let start = minstant::Instant::now();
        loop {
            if self.0.load(Ordering::Acquire) == magic {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::hint::spin_loop();
        }
    }
}

/// Smart pointer to a named POSIX shared memory object.
///
/// Provides access to the shared `T` via [`Deref`] and cleanup via `Drop`;
/// the `Mode` parameter ([`Creator`] or [`Opener`]) selects whether drop
/// also unlinks the name.
pub struct Shm<T: SharedMemorySafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    size: usize,
    path: ShmPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: the pointer refers to shared memory, not thread-local data, and
// T: SharedMemorySafe already requires Send + Sync.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Send for Shm<T, Mode> {}
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

impl<T: SharedMemorySafe> Shm<T, Creator> {
    /// Creates a new shared memory object and initializes it in place.
    ///
    /// The object is created exclusively (`O_CREAT | O_EXCL`), sized to
    /// `T`, mapped read-write, and handed to `init` as uninitialized
    /// memory. `init` must fully initialize the `T`, typically finishing
    /// by publishing an [`InitCell`] magic so openers can rendezvous.
    ///
    /// # Errors
    ///
    /// `EEXIST` if an object of that name already exists, `EACCES` on
    /// insufficient permissions, `ENOMEM`/`EMFILE` on resource exhaustion,
    /// or any `ftruncate`/`mmap` failure.
    pub fn create(path: ShmPath, init: impl FnOnce(&mut MaybeUninit<T>)) -> Result<Self> {
        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        if let Err(err) = ftruncate(&fd, size_of::<T>() as u64) {
            drop(fd);
            let _ = shm::unlink(path.as_str());
            return Err(ShmError::posix("ftruncate", &path, err));
        }

        // SAFETY: fresh mapping of a correctly sized object; mmap returns
        // page-aligned addresses, satisfying any T's alignment, and the
        // mapping aliases no existing Rust object in this process.
        let ptr_result = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match ptr_result {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path.as_str());
                return Err(ShmError::posix("mmap", &path, err));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr.cast::<T>()) };

        let shm = Self {
            ptr,
            size: size_of::<T>(),
            path,
            _mode: PhantomData,
        };

        // SAFETY: the mapping is exclusive to us until `init` publishes;
        // treating it as MaybeUninit<T> is sound because nothing has been
        // written yet.
        init(unsafe { &mut *shm.ptr.as_ptr().cast::<MaybeUninit<T>>() });

        Ok(shm)
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Attaches to an existing shared memory object.
    ///
    /// Verifies the object size matches `T` before mapping. The name is
    /// not unlinked on drop; the creator owns the lifecycle.
    ///
    /// # Errors
    ///
    /// `ENOENT` if no object exists under `path`, `EACCES` on insufficient
    /// permissions, [`ShmError::SizeMismatch`] if the object was created
    /// with a different layout.
    pub fn open(path: ShmPath) -> Result<Self> {
        let fd = shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        let stat = match fstat(&fd) {
            Ok(stat) => stat,
            Err(err) => {
                drop(fd);
                return Err(ShmError::posix("fstat", &path, err));
            }
        };
        if stat.st_size != size_of::<T>() as i64 {
            drop(fd);
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        // SAFETY: the object exists and has the expected size; the mapping
        // aliases no local Rust object. Concurrent access is governed by
        // T: SharedMemorySafe.
        let ptr_result = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match ptr_result {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                return Err(ShmError::posix("mmap", &path, err));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr.cast::<T>()) };

        Ok(Self {
            ptr,
            size: size_of::<T>(),
            path,
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Shm<T, Mode> {
    /// Raw pointer to the shared object, for reads that must not assume
    /// the memory is initialized yet (init rendezvous).
    pub(crate) fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe the mapping established at construction.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.size);
        }
        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> fmt::Debug for Shm<T, Mode> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shm")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the mapping is valid for the lifetime of self, and
        // T: SharedMemorySafe governs concurrent access.
        unsafe { &*self.ptr.as_ptr() }
    }
}

/// Removes a shared memory name from the system namespace.
///
/// Idempotent: a missing name is not an error.
///
/// # Errors
///
/// Any `shm_unlink` failure other than `ENOENT`.
pub fn remove(path: &ShmPath) -> Result<()> {
    match shm::unlink(path.as_str()) {
        Ok(()) => Ok(()),
        Err(io::Errno::NOENT) => Ok(()),
        Err(err) => Err(ShmError::posix("shm_unlink", path, err)),
    }
}
