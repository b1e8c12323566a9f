//! Named counting semaphore over POSIX shared memory.
//!
//! The medium access lock of the simulation: a process-wide, named,
//! integer-valued gate. Capacity 1 yields mutual exclusion. The permit
//! counter lives in shared memory, so any participant that knows the name
//! can contend — threads or separate processes alike.
//!
//! Acquisition is bounded-wait only: [`Semaphore::acquire_before`] polls
//! until a permit is available or the deadline elapses, and reports a
//! timeout as an [`Acquire`] outcome rather than an error. Callers retry.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use minstant::Instant;
//! use aether::ipc::sem::{Acquire, Semaphore};
//! use aether::ipc::shmem::{Creator, Opener, ShmPath};
//!
//! let name = ShmPath::new("/my-lock")?;
//! let owner = Semaphore::<Creator>::create(name.clone(), 1)?;
//!
//! let lock = Semaphore::<Opener>::open(name)?;
//! match lock.acquire_before(Instant::now() + Duration::from_secs(1)) {
//!     Acquire::Acquired => {
//!         // exclusive access to the medium
//!         lock.release()?;
//!     }
//!     Acquire::TimedOut => { /* retry */ }
//! }
//! # Ok::<(), aether::ipc::sem::SemError>(())
//! ```

use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use minstant::Instant;
use rustix::io::Errno;
use thiserror::Error;

use super::shmem::{Creator, InitCell, Opener, SharedMemorySafe, Shm, ShmError, ShmMode, ShmPath};

/// Published once the creator has stored the initial permit count.
const SEM_MAGIC: u64 = 0x4145_5448_5345_4D31; // "AETHSEM1"

/// How long openers wait for the creator to finish initialization.
const INIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll interval while waiting for a permit.
///
/// The counter is plain shared memory with no kernel wait queue, so a
/// blocked acquirer sleeps in short slices between permit checks.
const ACQUIRE_POLL: Duration = Duration::from_micros(200);

/// Shared state of one named semaphore.
#[repr(C)]
struct SemState {
    init: InitCell,
    permits: AtomicU32,
}

// SAFETY: repr(C); both fields are atomics with stable layout; safe under
// concurrent access from any number of processes.
unsafe impl SharedMemorySafe for SemState {}

/// Errors produced by semaphore operations.
#[derive(Debug, Error)]
pub enum SemError {
    /// `create` found a semaphore of that name already present.
    #[error("semaphore `{name}` already exists")]
    AlreadyExists { name: String },
    /// `open` found no semaphore of that name.
    #[error("semaphore `{name}` not found")]
    NotFound { name: String },
    /// The permit counter wrapped: more releases than the counter can
    /// represent, the underlying state is no longer trustworthy.
    #[error("semaphore counter is inconsistent (release overflow)")]
    Inconsistent,
    /// Underlying shared memory failure.
    #[error(transparent)]
    Shm(#[from] ShmError),
}

/// Outcome of a bounded-wait acquisition attempt.
///
/// A timeout is an expected outcome that drives the caller's retry loop,
/// not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Acquire {
    /// A permit was taken; the caller must [`Semaphore::release`] it.
    Acquired,
    /// The deadline elapsed with no permit available.
    TimedOut,
}

/// Named counting semaphore handle.
///
/// The `Mode` parameter follows the shared-memory typestate: the
/// [`Creator`] handle owns the name and unlinks it on drop, [`Opener`]
/// handles only detach. Acquire/release are available on both.
pub struct Semaphore<Mode: ShmMode> {
    shm: Shm<SemState, Mode>,
}

impl Semaphore<Creator> {
    /// Creates a named semaphore with `initial` permits.
    ///
    /// The name must not exist yet; stale names from crashed runs should be
    /// removed first with [`unlink`].
    ///
    /// # Errors
    ///
    /// [`SemError::AlreadyExists`] if the name is taken, or any shared
    /// memory failure.
    pub fn create(name: ShmPath, initial: u32) -> Result<Self, SemError> {
        let shm = Shm::<SemState, Creator>::create(name.clone(), |uninit| {
            let ptr = uninit.as_mut_ptr();
            // SAFETY: in-place field initialization of freshly mapped,
            // exclusively owned memory.
            unsafe {
                addr_of_mut!((*ptr).init).write(InitCell::unset());
                addr_of_mut!((*ptr).permits).write(AtomicU32::new(initial));
                (*ptr).init.publish(SEM_MAGIC);
            }
        })
        .map_err(|err| match err.errno() {
            Some(Errno::EXIST) => SemError::AlreadyExists {
                name: name.to_string(),
            },
            _ => SemError::Shm(err),
        })?;
        Ok(Self { shm })
    }
}

impl Semaphore<Opener> {
    /// Attaches to an existing named semaphore.
    ///
    /// # Errors
    ///
    /// [`SemError::NotFound`] if no semaphore of that name exists, or any
    /// shared memory failure (including an initialization timeout if the
    /// creator stalled mid-setup).
    pub fn open(name: ShmPath) -> Result<Self, SemError> {
        let shm = Shm::<SemState, Opener>::open(name.clone()).map_err(|err| match err.errno() {
            Some(Errno::NOENT) => SemError::NotFound {
                name: name.to_string(),
            },
            _ => SemError::Shm(err),
        })?;
        // SAFETY: the mapping is valid; reading through the raw pointer does
        // not assume the rest of the structure is initialized yet.
        let ready = unsafe { (*shm.as_ptr()).init.wait(SEM_MAGIC, INIT_TIMEOUT) };
        if !ready {
            return Err(SemError::Shm(ShmError::InitTimeout {
                path: name.to_string(),
            }));
        }
        Ok(Self { shm })
    }
}

impl<Mode: ShmMode> Semaphore<Mode> {
    /// Attempts to take one permit without waiting.
    ///
    /// Returns `true` on success. The counter never goes below zero: the
    /// decrement only happens when a permit is observably available.
    pub fn try_acquire(&self) -> bool {
        let permits = &self.shm.permits;
        let mut current = permits.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match permits.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Blocks until a permit is available or `deadline` elapses.
    ///
    /// A deadline already in the past yields an immediate
    /// [`Acquire::TimedOut`] without touching the counter. There is no
    /// queueing discipline among waiters: the first to observe a free
    /// permit wins, so callers desynchronize themselves with randomized
    /// deadlines.
    pub fn acquire_before(&self, deadline: Instant) -> Acquire {
        loop {
            if Instant::now() >= deadline {
                return Acquire::TimedOut;
            }
            if self.try_acquire() {
                return Acquire::Acquired;
            }
            std::thread::sleep(ACQUIRE_POLL);
        }
    }

    /// Returns one permit.
    ///
    /// Releasing more often than acquiring is a caller error and is not
    /// guarded; the only failure reported is a wrapped counter, after which
    /// the semaphore state can no longer be trusted.
    ///
    /// # Errors
    ///
    /// [`SemError::Inconsistent`] if the counter overflowed.
    pub fn release(&self) -> Result<(), SemError> {
        let prev = self.shm.permits.fetch_add(1, Ordering::Release);
        if prev == u32::MAX {
            return Err(SemError::Inconsistent);
        }
        Ok(())
    }

    /// Current permit count. Racy by nature; intended for logging and
    /// assertions between phases, not for decision making.
    #[must_use]
    pub fn permits(&self) -> u32 {
        self.shm.permits.load(Ordering::Relaxed)
    }
}

/// Removes a semaphore name from the system namespace.
///
/// Idempotent: absence is not an error. Existing handles remain usable
/// until dropped; new [`Semaphore::open`] calls will fail `NotFound`.
///
/// # Errors
///
/// Any unlink failure other than absence.
pub fn unlink(name: &ShmPath) -> Result<(), SemError> {
    super::shmem::remove(name).map_err(SemError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use std::thread;

    fn unique_path(tag: &str) -> ShmPath {
        ShmPath::new(format!("/aether-test-sem-{}-{tag}", std::process::id())).unwrap()
    }

    /// Shared memory may be unavailable in sandboxed environments.
    macro_rules! sem_or_skip {
        ($name:expr, $permits:expr, $test:literal) => {
            match Semaphore::<Creator>::create($name, $permits) {
                Ok(sem) => sem,
                Err(SemError::Shm(err)) if err.errno() == Some(Errno::ACCESS) => {
                    eprintln!("Skipping {}: {err}", $test);
                    return;
                }
                Err(err) => panic!("create failed: {err}"),
            }
        };
    }

    #[test]
    fn acquire_and_release_roundtrip() {
        let name = unique_path("roundtrip");
        let _ = unlink(&name);
        let sem = sem_or_skip!(name, 1, "acquire_and_release_roundtrip");

        assert_eq!(sem.permits(), 1);
        assert!(sem.try_acquire());
        assert_eq!(sem.permits(), 0);
        assert!(!sem.try_acquire());
        sem.release().unwrap();
        assert_eq!(sem.permits(), 1);
    }

    #[test]
    fn past_deadline_times_out_without_taking_a_permit() {
        let name = unique_path("past-deadline");
        let _ = unlink(&name);
        let sem = sem_or_skip!(name, 1, "past_deadline_times_out_without_taking_a_permit");

        let already_passed = Instant::now() - Duration::from_millis(5);
        assert_eq!(sem.acquire_before(already_passed), Acquire::TimedOut);
        // The permit is untouched even though one was available.
        assert_eq!(sem.permits(), 1);
    }

    #[test]
    fn waiter_times_out_while_lock_is_held() {
        let name = unique_path("held");
        let _ = unlink(&name);
        let sem = sem_or_skip!(name, 1, "waiter_times_out_while_lock_is_held");

        assert!(sem.try_acquire());
        let start = Instant::now();
        let outcome = sem.acquire_before(Instant::now() + Duration::from_millis(30));
        assert_eq!(outcome, Acquire::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
        sem.release().unwrap();
    }

    #[test]
    fn waiter_proceeds_once_released() {
        let name = unique_path("handoff");
        let _ = unlink(&name);
        let owner = sem_or_skip!(name.clone(), 1, "waiter_proceeds_once_released");

        assert!(owner.try_acquire());
        let contender = Semaphore::<Opener>::open(name).unwrap();
        let waiter = thread::spawn(move || {
            let outcome = contender.acquire_before(Instant::now() + Duration::from_secs(5));
            (outcome, contender)
        });

        thread::sleep(Duration::from_millis(20));
        owner.release().unwrap();

        let (outcome, contender) = waiter.join().unwrap();
        assert_eq!(outcome, Acquire::Acquired);
        contender.release().unwrap();
        assert_eq!(owner.permits(), 1);
    }

    #[test]
    fn capacity_one_is_mutually_exclusive() {
        let name = unique_path("mutex");
        let _ = unlink(&name);
        let owner = sem_or_skip!(name.clone(), 1, "capacity_one_is_mutually_exclusive");

        let in_section = Arc::new(AtomicBool::new(false));
        let entries = Arc::new(AtomicU64::new(0));
        let mut handles = vec![];
        for _ in 0..4 {
            let sem = Semaphore::<Opener>::open(name.clone()).unwrap();
            let in_section = Arc::clone(&in_section);
            let entries = Arc::clone(&entries);
            handles.push(thread::spawn(move || {
                for _ in 0..25 {
                    loop {
                        match sem.acquire_before(Instant::now() + Duration::from_millis(50)) {
                            Acquire::Acquired => break,
                            Acquire::TimedOut => continue,
                        }
                    }
                    assert!(!in_section.swap(true, Ordering::SeqCst), "lock violated");
                    entries.fetch_add(1, Ordering::SeqCst);
                    in_section.store(false, Ordering::SeqCst);
                    sem.release().unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(entries.load(Ordering::SeqCst), 100);
        assert_eq!(owner.permits(), 1);
    }

    #[test]
    fn open_without_create_is_not_found() {
        let name = unique_path("absent");
        let _ = unlink(&name);
        assert!(matches!(
            Semaphore::<Opener>::open(name),
            Err(SemError::NotFound { .. })
        ));
    }

    #[test]
    fn create_twice_reports_already_exists() {
        let name = unique_path("exists");
        let _ = unlink(&name);
        let _first = sem_or_skip!(name.clone(), 1, "create_twice_reports_already_exists");
        assert!(matches!(
            Semaphore::<Creator>::create(name, 1),
            Err(SemError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn unlink_is_idempotent_and_open_fails_after() {
        let name = unique_path("unlinked");
        let _ = unlink(&name);
        let sem = sem_or_skip!(name.clone(), 1, "unlink_is_idempotent_and_open_fails_after");
        drop(sem); // Creator drop unlinks

        assert!(unlink(&name).is_ok());
        assert!(unlink(&name).is_ok());
        assert!(matches!(
            Semaphore::<Opener>::open(name),
            Err(SemError::NotFound { .. })
        ));
    }
}
