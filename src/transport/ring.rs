// Licensed under the Apache-2.0 license

//! Single-producer/single-consumer descriptor ring living in shared memory.
//!
//! Indices are free-running `u32` counters; the slot for index `i` is
//! `i & (N - 1)`, so the capacity must be a power of two. The ring holds at
//! most `N` descriptors: enqueue into a full ring fails and never overwrites.
//!
//! The producer writes the descriptor and then publishes it with a release
//! store of `write_idx`; the consumer acquires `write_idx` before reading the
//! descriptor and releases the entry back with a store of `read_idx`. Each
//! ring has exactly one producer and one consumer, fixed by the transport
//! protocol (see [`crate::transport::context`]).

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Buffer descriptor exchanged through a ring.
///
/// `address` is the slot's byte offset from the base of the buffer pool.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Descriptor {
    pub address: u64,
    pub size: u32,
    _reserved: u32,
}

impl Descriptor {
    #[must_use]
    pub const fn new(address: u64, size: u32) -> Self {
        Self {
            address,
            size,
            _reserved: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// No room for another descriptor.
    Full,
    /// Nothing to dequeue.
    Empty,
}

/// Fixed-capacity descriptor ring.
#[repr(C)]
pub struct Ring<const N: usize> {
    write_idx: AtomicU32,
    read_idx: AtomicU32,
    entries: [UnsafeCell<Descriptor>; N],
}

// SAFETY: entries are only written by the single producer before the release
// store of `write_idx`, and only read by the single consumer after the
// matching acquire load; the index protocol serialises every access.
unsafe impl<const N: usize> Sync for Ring<N> {}

impl<const N: usize> Default for Ring<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Ring<N> {
    const CAPACITY_OK: () = assert!(
        N.is_power_of_two() && N <= (u32::MAX as usize) / 2,
        "ring capacity must be a power of two"
    );

    #[must_use]
    pub const fn new() -> Self {
        let () = Self::CAPACITY_OK;
        Self {
            write_idx: AtomicU32::new(0),
            read_idx: AtomicU32::new(0),
            entries: [const { UnsafeCell::new(Descriptor::new(0, 0)) }; N],
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Empty the ring.
    ///
    /// Only the owner of the link may call this, and only while the other
    /// end is not yet using it.
    pub fn reset(&self) {
        self.write_idx.store(0, Ordering::Relaxed);
        self.read_idx.store(0, Ordering::Release);
    }

    /// Number of descriptors currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        let write = self.write_idx.load(Ordering::Acquire);
        let read = self.read_idx.load(Ordering::Acquire);
        write.wrapping_sub(read) as usize
    }

    /// Descriptors enqueued since the last reset, modulo 2^32.
    #[must_use]
    pub fn produced(&self) -> u32 {
        self.write_idx.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= N
    }

    /// Producer side: append a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::Full`] when `N` descriptors are already queued.
    pub fn enqueue(&self, desc: Descriptor) -> Result<(), RingError> {
        let write = self.write_idx.load(Ordering::Relaxed);
        let read = self.read_idx.load(Ordering::Acquire);
        if write.wrapping_sub(read) as usize >= N {
            return Err(RingError::Full);
        }
        let cell = self.entry(write).ok_or(RingError::Full)?;
        // SAFETY: the entry at `write` is outside the consumer's window until
        // the store below publishes it, and this is the only producer.
        unsafe {
            cell.get().write(desc);
        }
        self.write_idx
            .store(write.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side: take the oldest descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::Empty`] when nothing is queued.
    pub fn dequeue(&self) -> Result<Descriptor, RingError> {
        let read = self.read_idx.load(Ordering::Relaxed);
        let write = self.write_idx.load(Ordering::Acquire);
        if read == write {
            return Err(RingError::Empty);
        }
        let cell = self.entry(read).ok_or(RingError::Empty)?;
        // SAFETY: the acquire load above synchronises with the producer's
        // publishing store, and the producer will not touch this entry until
        // `read_idx` moves past it.
        let desc = unsafe { cell.get().read() };
        self.read_idx.store(read.wrapping_add(1), Ordering::Release);
        Ok(desc)
    }

    fn entry(&self, idx: u32) -> Option<&UnsafeCell<Descriptor>> {
        self.entries.get(idx as usize & (N - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let ring = Ring::<4>::new();
        for i in 0..3 {
            ring.enqueue(Descriptor::new(i * 64, 64)).unwrap();
        }
        assert_eq!(ring.len(), 3);
        for i in 0..3 {
            assert_eq!(ring.dequeue().unwrap().address, i * 64);
        }
        assert_eq!(ring.dequeue(), Err(RingError::Empty));
    }

    #[test]
    fn full_ring_rejects_without_overwrite() {
        let ring = Ring::<4>::new();
        for i in 0..4 {
            ring.enqueue(Descriptor::new(i, 1)).unwrap();
        }
        assert!(ring.is_full());
        assert_eq!(ring.enqueue(Descriptor::new(99, 1)), Err(RingError::Full));
        assert_eq!(ring.dequeue().unwrap().address, 0);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn occupancy_stays_in_bounds_across_wraparound() {
        let ring = Ring::<8>::new();
        let mut expected = 0usize;
        let mut next = 0u64;
        // Mixed pattern of bursts that wraps the indices many times.
        for round in 0..200u64 {
            let pushes = (round % 11) as usize;
            let pops = (round % 7) as usize;
            for _ in 0..pushes {
                match ring.enqueue(Descriptor::new(next, 1)) {
                    Ok(()) => {
                        expected += 1;
                        next += 1;
                    }
                    Err(RingError::Full) => assert_eq!(expected, 8),
                    Err(e) => panic!("unexpected {e:?}"),
                }
                assert!(ring.len() <= ring.capacity());
            }
            for _ in 0..pops {
                match ring.dequeue() {
                    Ok(_) => expected -= 1,
                    Err(RingError::Empty) => assert_eq!(expected, 0),
                    Err(e) => panic!("unexpected {e:?}"),
                }
            }
            assert_eq!(ring.len(), expected);
        }
    }

    #[test]
    fn indices_wrap_at_u32_boundary() {
        let ring = Ring::<4>::new();
        ring.write_idx.store(u32::MAX - 1, Ordering::Relaxed);
        ring.read_idx.store(u32::MAX - 1, Ordering::Relaxed);
        for i in 0..4 {
            ring.enqueue(Descriptor::new(i, 1)).unwrap();
        }
        assert!(ring.is_full());
        for i in 0..4 {
            assert_eq!(ring.dequeue().unwrap().address, i);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn reset_empties_ring() {
        let ring = Ring::<2>::new();
        ring.enqueue(Descriptor::new(0, 1)).unwrap();
        ring.reset();
        assert!(ring.is_empty());
        assert_eq!(ring.dequeue(), Err(RingError::Empty));
    }
}
