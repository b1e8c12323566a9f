//! Named MPSC record queue over POSIX shared memory.
//!
//! The out-of-band payload channel of the simulation: a process-wide FIFO
//! queue of fixed-layout records, identified by a shared name. Multiple
//! producers send concurrently; a single consumer drains in global FIFO
//! order. The queue itself serializes delivery — the receiver needs no
//! locking.
//!
//! - [`Sender`] — write end, any number per queue
//! - [`Receiver`] — read end, exactly one per queue
//!
//! Sending is non-blocking: a full queue is a transport error the caller
//! must handle. Receiving can block, bounded or unbounded, via
//! [`Receiver::recv_blocking`].

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::addr_of_mut;
use std::time::Duration;

use minstant::Instant;
use rustix::io::Errno;
use thiserror::Error;

use super::shmem::{Creator, InitCell, Opener, SharedMemorySafe, Shm, ShmError, ShmMode, ShmPath};
use crate::ring::Ring;

/// Published once the creator has initialized the ring.
const QUEUE_MAGIC: u64 = 0x4145_5448_5749_5245; // "AETHWIRE"

/// How long openers wait for the creator to finish initialization.
const INIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll interval for blocking receives.
const RECV_POLL: Duration = Duration::from_micros(200);

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely. The caller accepts the liveness risk: if the
    /// expected records never arrive, the receive never returns.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Option<Duration>> for Timeout {
    fn from(d: Option<Duration>) -> Self {
        match d {
            Some(d) => Self::Duration(d),
            None => Self::Infinite,
        }
    }
}

/// Errors produced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// `create` found a queue of that name already present.
    #[error("queue `{name}` already exists")]
    AlreadyExists { name: String },
    /// `open` found no queue of that name.
    #[error("queue `{name}` not found")]
    NotFound { name: String },
    /// The queue is at capacity; the record was not delivered.
    #[error("queue is full")]
    Full,
    /// Underlying shared memory failure.
    #[error(transparent)]
    Shm(#[from] ShmError),
}

/// Queue layout inside shared memory: init rendezvous plus the ring.
#[repr(C)]
struct SharedQueue<T: SharedMemorySafe, const N: usize> {
    init: InitCell,
    ring: Ring<T, N>,
}

// SAFETY: repr(C); the init cell is atomic and the ring coordinates all
// access through its sequence-number protocol.
unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for SharedQueue<T, N> {}

impl<T: SharedMemorySafe, const N: usize> SharedQueue<T, N> {
    /// Initializes the queue in place inside freshly mapped memory.
    fn init_shared(uninit: &mut std::mem::MaybeUninit<Self>) {
        let ptr = uninit.as_mut_ptr();
        // SAFETY: exclusive access to uninitialized mapped memory; every
        // field is written before the magic is published.
        unsafe {
            addr_of_mut!((*ptr).init).write(InitCell::unset());
            Ring::init_at(addr_of_mut!((*ptr).ring));
            (*ptr).init.publish(QUEUE_MAGIC);
        }
    }
}

/// Marker type to opt out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the named queue.
///
/// Multiple senders per queue are safe and expected. `Send` but not
/// `Sync`: a handle moves to its producer thread and stays there.
pub struct Sender<T: SharedMemorySafe, const N: usize, Mode: ShmMode> {
    shm: Shm<SharedQueue<T, N>, Mode>,
    _unsync: PhantomUnsync,
}

/// Read end of the named queue.
///
/// Exactly one receiver may exist per queue; the type system cannot
/// enforce this across processes, so callers must. `Send` but not `Sync`.
pub struct Receiver<T: SharedMemorySafe, const N: usize, Mode: ShmMode> {
    shm: Shm<SharedQueue<T, N>, Mode>,
    _unsync: PhantomUnsync,
}

fn create_shm<T: SharedMemorySafe, const N: usize>(
    name: ShmPath,
) -> Result<Shm<SharedQueue<T, N>, Creator>, QueueError> {
    Shm::<SharedQueue<T, N>, Creator>::create(name.clone(), SharedQueue::init_shared).map_err(
        |err| match err.errno() {
            Some(Errno::EXIST) => QueueError::AlreadyExists {
                name: name.to_string(),
            },
            _ => QueueError::Shm(err),
        },
    )
}

fn open_shm<T: SharedMemorySafe, const N: usize>(
    name: ShmPath,
) -> Result<Shm<SharedQueue<T, N>, Opener>, QueueError> {
    let shm =
        Shm::<SharedQueue<T, N>, Opener>::open(name.clone()).map_err(|err| match err.errno() {
            Some(Errno::NOENT) => QueueError::NotFound {
                name: name.to_string(),
            },
            _ => QueueError::Shm(err),
        })?;
    // SAFETY: the mapping is valid; the raw read does not assume the rest
    // of the structure is initialized yet.
    let ready = unsafe { (*shm.as_ptr()).init.wait(QUEUE_MAGIC, INIT_TIMEOUT) };
    if !ready {
        return Err(QueueError::Shm(ShmError::InitTimeout {
            path: name.to_string(),
        }));
    }
    Ok(shm)
}

impl<T: SharedMemorySafe, const N: usize> Receiver<T, N, Creator> {
    /// Creates the queue and returns the read end.
    ///
    /// The typical pattern: the lifecycle owner creates the queue as
    /// receiver, senders open it by name. The name is unlinked when this
    /// handle drops.
    ///
    /// # Errors
    ///
    /// [`QueueError::AlreadyExists`] if the name is taken, or any shared
    /// memory failure.
    pub fn create(name: ShmPath) -> Result<Self, QueueError> {
        Ok(Self {
            shm: create_shm(name)?,
            _unsync: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, const N: usize> Receiver<T, N, Opener> {
    /// Attaches to an existing queue as its (sole) receiver.
    ///
    /// # Errors
    ///
    /// [`QueueError::NotFound`] if the queue does not exist, or any shared
    /// memory failure.
    pub fn open(name: ShmPath) -> Result<Self, QueueError> {
        Ok(Self {
            shm: open_shm(name)?,
            _unsync: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, const N: usize> Sender<T, N, Opener> {
    /// Attaches to an existing queue as a sender.
    ///
    /// Any number of senders may open the same queue.
    ///
    /// # Errors
    ///
    /// [`QueueError::NotFound`] if the queue does not exist, or any shared
    /// memory failure.
    pub fn open(name: ShmPath) -> Result<Self, QueueError> {
        Ok(Self {
            shm: open_shm(name)?,
            _unsync: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, const N: usize, Mode: ShmMode> Sender<T, N, Mode> {
    /// Appends `record` to the queue tail.
    ///
    /// Non-blocking: the queue bounds delivery only by its capacity.
    ///
    /// # Errors
    ///
    /// [`QueueError::Full`] if the queue is at capacity; the record was
    /// not delivered and the caller decides whether the attempt counts.
    pub fn send(&self, record: T) -> Result<(), QueueError> {
        // SAFETY: the queue was initialized before this handle existed;
        // concurrent sends are safe by the ring protocol.
        unsafe { self.shm.ring.push(record) }.map_err(|_| QueueError::Full)
    }
}

impl<T: SharedMemorySafe, const N: usize, Mode: ShmMode> Receiver<T, N, Mode> {
    /// Removes the record at the queue head, if any.
    #[must_use]
    pub fn recv(&self) -> Option<T> {
        // SAFETY: this handle is the queue's only consumer (not Sync, one
        // per queue by contract) and the queue was initialized.
        unsafe { self.shm.ring.pop() }
    }

    /// Blocks until a record is available or the timeout expires.
    ///
    /// Returns `None` only on timeout; with [`Timeout::Infinite`] the call
    /// does not return until a record arrives.
    #[must_use]
    pub fn recv_blocking(&self, timeout: Timeout) -> Option<T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            if let Some(record) = self.recv() {
                return Some(record);
            }
            if let Some(dl) = deadline
                && Instant::now() >= dl
            {
                return None;
            }
            std::thread::sleep(RECV_POLL);
        }
    }
}

/// Removes a queue name from the system namespace.
///
/// Idempotent: absence is not an error. Safe only once all expected sends
/// and receives have completed; there is no reference counting.
///
/// # Errors
///
/// Any unlink failure other than absence.
pub fn unlink(name: &ShmPath) -> Result<(), QueueError> {
    super::shmem::remove(name).map_err(QueueError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn unique_path(tag: &str) -> ShmPath {
        ShmPath::new(format!("/aether-test-mpsc-{}-{tag}", std::process::id())).unwrap()
    }

    /// Shared memory may be unavailable in sandboxed environments.
    macro_rules! queue_or_skip {
        ($name:expr, $cap:expr, $test:literal) => {
            match Receiver::<u64, { $cap }, Creator>::create($name) {
                Ok(rx) => rx,
                Err(QueueError::Shm(err)) if err.errno() == Some(Errno::ACCESS) => {
                    eprintln!("Skipping {}: {err}", $test);
                    return;
                }
                Err(err) => panic!("create failed: {err}"),
            }
        };
    }

    #[test]
    fn send_recv_fifo() {
        let name = unique_path("fifo");
        let _ = unlink(&name);
        let rx = queue_or_skip!(name.clone(), 8, "send_recv_fifo");
        let tx = Sender::<u64, 8, Opener>::open(name).unwrap();

        for i in 0..5 {
            tx.send(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.recv(), Some(i));
        }
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn full_queue_is_a_transport_error() {
        let name = unique_path("full");
        let _ = unlink(&name);
        let rx = queue_or_skip!(name.clone(), 4, "full_queue_is_a_transport_error");
        let tx = Sender::<u64, 4, Opener>::open(name).unwrap();

        for i in 0..4 {
            tx.send(i).unwrap();
        }
        assert!(matches!(tx.send(99), Err(QueueError::Full)));

        assert_eq!(rx.recv(), Some(0));
        tx.send(4).unwrap();
        assert!(matches!(tx.send(100), Err(QueueError::Full)));
    }

    #[test]
    fn recv_blocking_times_out_on_empty_queue() {
        let name = unique_path("timeout");
        let _ = unlink(&name);
        let rx = queue_or_skip!(name, 4, "recv_blocking_times_out_on_empty_queue");

        let start = Instant::now();
        assert_eq!(
            rx.recv_blocking(Timeout::Duration(Duration::from_millis(20))),
            None
        );
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn recv_blocking_wakes_for_late_send() {
        let name = unique_path("late");
        let _ = unlink(&name);
        let rx = queue_or_skip!(name.clone(), 4, "recv_blocking_wakes_for_late_send");

        let sender = thread::spawn(move || {
            let tx = Sender::<u64, 4, Opener>::open(name).unwrap();
            thread::sleep(Duration::from_millis(20));
            tx.send(7).unwrap();
        });

        assert_eq!(
            rx.recv_blocking(Timeout::Duration(Duration::from_secs(5))),
            Some(7)
        );
        sender.join().unwrap();
    }

    #[test]
    fn open_without_create_is_not_found() {
        let name = unique_path("absent");
        let _ = unlink(&name);
        assert!(matches!(
            Sender::<u64, 4, Opener>::open(name),
            Err(QueueError::NotFound { .. })
        ));
    }

    #[test]
    fn concurrent_senders_preserve_per_sender_order() {
        let name = unique_path("concurrent");
        let _ = unlink(&name);
        let rx = queue_or_skip!(name.clone(), 64, "concurrent_senders_preserve_per_sender_order");

        let senders = 3u64;
        let per_sender = 100u64;
        let mut handles = vec![];
        for s in 0..senders {
            let name = name.clone();
            handles.push(thread::spawn(move || {
                let tx = Sender::<u64, 64, Opener>::open(name).unwrap();
                for i in 0..per_sender {
                    let value = s * 1000 + i;
                    loop {
                        match tx.send(value) {
                            Ok(()) => break,
                            Err(QueueError::Full) => thread::yield_now(),
                            Err(err) => panic!("send failed: {err}"),
                        }
                    }
                }
            }));
        }

        let mut items = vec![];
        while items.len() < (senders * per_sender) as usize {
            match rx.recv_blocking(Timeout::Duration(Duration::from_secs(5))) {
                Some(item) => items.push(item),
                None => panic!("queue drain stalled"),
            }
        }
        for h in handles {
            h.join().unwrap();
        }

        for s in 0..senders {
            let base = s * 1000;
            let seen: Vec<u64> = items
                .iter()
                .copied()
                .filter(|v| (base..base + per_sender).contains(v))
                .collect();
            let expected: Vec<u64> = (base..base + per_sender).collect();
            assert_eq!(seen, expected);
        }
    }
}
