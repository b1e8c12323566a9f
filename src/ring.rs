//! Bounded lock-free MPSC ring buffer.
//!
//! Vyukov-style bounded queue specialized for a single consumer. Each slot
//! carries an atomic sequence number that encodes its state relative to the
//! head/tail counters:
//!
//! - initial: the slot index
//! - after a producer writes at position `pos`: `pos + 1` ("data ready")
//! - after the consumer reads at position `tail`: `tail + N` ("slot free")
//!
//! Producers claim positions by CAS on `head`; the consumer advances `tail`
//! alone. Within one queue, delivery order equals claim order across all
//! producers combined — the global FIFO the transport layer relies on.
//!
//! The structure is `#[repr(C)]` and pointer-free so it can live directly
//! in shared memory; [`Ring::init_at`] constructs it in place.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Head or tail counter, isolated on its own cache line.
#[repr(C)]
#[repr(align(64))]
struct Counter(AtomicUsize);

/// One ring slot: sequence number plus payload storage.
#[repr(C)]
#[repr(align(64))]
struct Slot<T> {
    seq: AtomicUsize,
    item: UnsafeCell<MaybeUninit<T>>,
}

/// The shared ring structure.
#[repr(C)]
pub(crate) struct Ring<T, const N: usize> {
    /// Next position producers will claim.
    head: Counter,
    /// Next position the consumer will read. Consumer-owned.
    tail: Counter,
    slots: [Slot<T>; N],
}

// SAFETY: slot payloads are protected by the sequence-number protocol;
// all coordination state is atomic.
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

impl<T, const N: usize> Ring<T, N> {
    /// Compile-time assertion that the capacity is non-zero.
    const CAPACITY_OK: () = assert!(N > 0, "ring capacity must be greater than 0");

    /// Initializes a ring in place at `ptr`.
    ///
    /// Used for construction inside freshly mapped shared memory, where the
    /// structure cannot be built by value.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of `Self`, properly aligned, and no
    /// other reference to the memory may exist during initialization.
    pub(crate) unsafe fn init_at(ptr: *mut Self) {
        let () = Self::CAPACITY_OK;
        unsafe {
            std::ptr::addr_of_mut!((*ptr).head).write(Counter(AtomicUsize::new(0)));
            std::ptr::addr_of_mut!((*ptr).tail).write(Counter(AtomicUsize::new(0)));
            for i in 0..N {
                std::ptr::addr_of_mut!((*ptr).slots[i]).write(Slot {
                    seq: AtomicUsize::new(i),
                    item: UnsafeCell::new(MaybeUninit::uninit()),
                });
            }
        }
    }

    /// Attempts to enqueue `item`.
    ///
    /// Lock-free; any number of producers may call this concurrently.
    /// Returns `Err(item)` if the ring is full.
    ///
    /// # Safety
    ///
    /// The ring must have been initialized via [`Ring::init_at`] (or
    /// equivalent) before first use.
    pub(crate) unsafe fn push(&self, item: T) -> Result<(), T> {
        loop {
            let pos = self.head.0.load(Ordering::Relaxed);
            let slot = &self.slots[pos % N];
            let seq = slot.seq.load(Ordering::Acquire);

            // Wrapping-aware distance between the slot state and our claim.
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                // Slot free at this position; try to claim it.
                if self
                    .head
                    .0
                    .compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // SAFETY: the CAS grants exclusive write access to this
                    // slot until we publish via seq.
                    unsafe {
                        (*slot.item.get()).write(item);
                    }
                    slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                    return Ok(());
                }
                // Lost the race; reload head and retry.
            } else if diff < 0 {
                // Consumer has not released this slot yet: full.
                return Err(item);
            }
            // diff > 0: another producer claimed this position; retry.
        }
    }

    /// Attempts to dequeue one item.
    ///
    /// Returns `None` if the ring is empty.
    ///
    /// # Safety
    ///
    /// Exactly one thread of execution may act as consumer, and the ring
    /// must have been initialized before first use.
    pub(crate) unsafe fn pop(&self) -> Option<T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let slot = &self.slots[tail % N];
        let seq = slot.seq.load(Ordering::Acquire);

        if seq != tail.wrapping_add(1) {
            // Producer has not published at this position yet.
            return None;
        }

        // SAFETY: the sequence check proves the producer finished writing.
        let item = unsafe { (*slot.item.get()).assume_init_read() };

        // Hand the slot back to producers at position tail + N.
        slot.seq.store(tail.wrapping_add(N), Ordering::Release);
        self.tail.0.store(tail.wrapping_add(1), Ordering::Relaxed);

        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn boxed_ring<T, const N: usize>() -> Arc<Ring<T, N>> {
        let mut uninit = Box::new(MaybeUninit::<Ring<T, N>>::uninit());
        // SAFETY: the box owns the memory exclusively.
        unsafe {
            Ring::init_at(uninit.as_mut_ptr());
            Arc::from(Box::from_raw(Box::into_raw(uninit).cast::<Ring<T, N>>()))
        }
    }

    #[test]
    fn fifo_order_single_producer() {
        let ring = boxed_ring::<u64, 8>();
        unsafe {
            for i in 0..5 {
                assert!(ring.push(i).is_ok());
            }
            for i in 0..5 {
                assert_eq!(ring.pop(), Some(i));
            }
            assert_eq!(ring.pop(), None);
        }
    }

    #[test]
    fn full_ring_rejects_push() {
        let ring = boxed_ring::<u64, 4>();
        unsafe {
            for i in 0..4 {
                assert!(ring.push(i).is_ok());
            }
            assert_eq!(ring.push(99), Err(99));
            assert_eq!(ring.pop(), Some(0));
            assert!(ring.push(4).is_ok());
            assert_eq!(ring.push(100), Err(100));
        }
    }

    #[test]
    fn wraparound_preserves_order() {
        let ring = boxed_ring::<u64, 4>();
        for round in 0..6 {
            unsafe {
                for i in 0..4 {
                    assert!(ring.push(round * 10 + i).is_ok());
                }
                for i in 0..4 {
                    assert_eq!(ring.pop(), Some(round * 10 + i));
                }
                assert_eq!(ring.pop(), None);
            }
        }
    }

    #[test]
    fn concurrent_producers_deliver_everything() {
        let ring = boxed_ring::<u64, 64>();
        let producers = 3u64;
        let per_producer = 200u64;

        let mut handles = vec![];
        for p in 0..producers {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for i in 0..per_producer {
                    let value = p * 1000 + i;
                    loop {
                        // SAFETY: push is safe for concurrent producers.
                        if unsafe { ring.push(value) }.is_ok() {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            }));
        }

        let mut items = vec![];
        while items.len() < (producers * per_producer) as usize {
            // SAFETY: this thread is the only consumer.
            match unsafe { ring.pop() } {
                Some(item) => items.push(item),
                None => thread::yield_now(),
            }
        }
        for h in handles {
            h.join().unwrap();
        }

        // Per-producer order is preserved even though producers interleave.
        for p in 0..producers {
            let base = p * 1000;
            let seen: Vec<u64> = items
                .iter()
                .copied()
                .filter(|v| (base..base + per_producer).contains(v))
                .collect();
            let expected: Vec<u64> = (base..base + per_producer).collect();
            assert_eq!(seen, expected);
        }
    }
}
