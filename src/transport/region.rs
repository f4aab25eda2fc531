// Licensed under the Apache-2.0 license

//! Shared transport region: four descriptor rings followed by the buffer pool.
//!
//! The layout is `#[repr(C)]` and identical on both ends of a link:
//!
//! ```text
//! +----------+----------+----------+----------+------------------------------+
//! | req-free | req-used | ret-free | ret-used | pool: 2 * N slots of S bytes |
//! +----------+----------+----------+----------+------------------------------+
//! ```
//!
//! Pool slots `0..N` belong to the request class and `N..2N` to the return
//! class. A [`Slot`] is the only way to reach a buffer's bytes; it is created
//! when a descriptor leaves a ring and consumed when it goes back, so at any
//! time a buffer is either queued in exactly one ring or held by exactly one
//! owner.

use super::ring::{Descriptor, Ring};
use core::cell::UnsafeCell;
use core::ptr::NonNull;

/// Bytes per buffer slot.
pub const I2C_BUF_SZ: usize = 512;
/// Slots per buffer class (and descriptor ring capacity).
pub const I2C_BUF_COUNT: usize = 512;

/// Which half of the pool a buffer belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferClass {
    Request,
    Return,
}

impl BufferClass {
    const fn first_slot<const N: usize>(self) -> usize {
        match self {
            BufferClass::Request => 0,
            BufferClass::Return => N,
        }
    }
}

/// One link's worth of shared memory.
#[repr(C)]
pub struct TransportRegion<const N: usize = I2C_BUF_COUNT, const S: usize = I2C_BUF_SZ> {
    pub(crate) req_free: Ring<N>,
    pub(crate) req_used: Ring<N>,
    pub(crate) ret_free: Ring<N>,
    pub(crate) ret_used: Ring<N>,
    pool: [UnsafeCell<[u8; S]>; N],
    ret_pool: [UnsafeCell<[u8; S]>; N],
}

// SAFETY: pool bytes are only reachable through a `Slot`, which is unique per
// buffer (see module docs); rings are `Sync` on their own.
unsafe impl<const N: usize, const S: usize> Sync for TransportRegion<N, S> {}

impl<const N: usize, const S: usize> Default for TransportRegion<N, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, const S: usize> TransportRegion<N, S> {
    /// Size in bytes of a single slot.
    pub const SLOT_SIZE: usize = S;
    /// Number of slots per class.
    pub const SLOT_COUNT: usize = N;

    /// A zeroed region, suitable for a `static` placed in shared memory.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            req_free: Ring::new(),
            req_used: Ring::new(),
            ret_free: Ring::new(),
            ret_used: Ring::new(),
            pool: [const { UnsafeCell::new([0; S]) }; N],
            ret_pool: [const { UnsafeCell::new([0; S]) }; N],
        }
    }

    /// Attach to a region mapped by the platform at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a mapping of at least
    /// `size_of::<TransportRegion<N, S>>()` bytes, suitably aligned, that
    /// stays mapped for `'static` and is shared only with the peer at the
    /// other end of this link.
    #[must_use]
    pub unsafe fn from_raw(base: NonNull<Self>) -> &'static Self {
        // SAFETY: upheld by the caller.
        unsafe { base.as_ref() }
    }

    /// Pool offset of slot `index` of `class`.
    pub(crate) fn offset_of(class: BufferClass, index: usize) -> u64 {
        ((class.first_slot::<N>() + index) * S) as u64
    }

    /// Map a descriptor back to an index within `class`, rejecting anything
    /// that is misaligned or outside the class's half of the pool.
    pub(crate) fn index_of(class: BufferClass, desc: &Descriptor) -> Option<usize> {
        let offset = usize::try_from(desc.address).ok()?;
        if offset % S != 0 || desc.size as usize > S {
            return None;
        }
        let index = (offset / S).checked_sub(class.first_slot::<N>())?;
        (index < N).then_some(index)
    }

    fn cell(&self, class: BufferClass, index: usize) -> Option<&UnsafeCell<[u8; S]>> {
        match class {
            BufferClass::Request => self.pool.get(index),
            BufferClass::Return => self.ret_pool.get(index),
        }
    }
}

/// Exclusive ownership of one pool buffer.
///
/// Not `Clone`: handing a slot back to a ring consumes it.
#[must_use = "a slot must be released or enqueued, otherwise the buffer leaks"]
pub struct Slot<'r, const N: usize = I2C_BUF_COUNT, const S: usize = I2C_BUF_SZ> {
    region: &'r TransportRegion<N, S>,
    class: BufferClass,
    index: usize,
    len: usize,
}

impl<'r, const N: usize, const S: usize> Slot<'r, N, S> {
    /// Claim the buffer a dequeued descriptor refers to.
    ///
    /// Only called right after the descriptor left a ring, which is what
    /// makes the returned handle unique.
    pub(crate) fn from_descriptor(
        region: &'r TransportRegion<N, S>,
        class: BufferClass,
        desc: &Descriptor,
    ) -> Option<Self> {
        let index = TransportRegion::<N, S>::index_of(class, desc)?;
        Some(Self {
            region,
            class,
            index,
            len: desc.size as usize,
        })
    }

    pub(crate) fn descriptor(&self, len: usize) -> Descriptor {
        Descriptor::new(
            TransportRegion::<N, S>::offset_of(self.class, self.index),
            u32::try_from(len.min(S)).unwrap_or(0),
        )
    }

    pub(crate) fn belongs_to(&self, region: &TransportRegion<N, S>) -> bool {
        core::ptr::eq(self.region, region)
    }

    #[must_use]
    pub fn class(&self) -> BufferClass {
        self.class
    }

    /// Index of the slot within its class.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Logical length recorded in the descriptor this slot arrived with.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole buffer, regardless of logical length.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match self.region.cell(self.class, self.index) {
            // SAFETY: this handle is the buffer's only owner, and no `&mut`
            // can coexist with `&self`.
            Some(cell) => unsafe { &*cell.get() },
            None => &[],
        }
    }

    /// The whole buffer, mutably.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self.region.cell(self.class, self.index) {
            // SAFETY: this handle is the buffer's only owner and is borrowed
            // mutably for the lifetime of the returned slice.
            Some(cell) => unsafe { &mut *cell.get() },
            None => &mut [],
        }
    }

    /// The first `len()` bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        let len = self.len;
        self.bytes().get(..len).unwrap_or(&[])
    }
}

impl<const N: usize, const S: usize> core::fmt::Debug for Slot<'_, N, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Slot")
            .field("class", &self.class)
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Region = TransportRegion<4, 32>;

    #[test]
    fn offsets_split_pool_by_class() {
        assert_eq!(Region::offset_of(BufferClass::Request, 0), 0);
        assert_eq!(Region::offset_of(BufferClass::Request, 3), 96);
        assert_eq!(Region::offset_of(BufferClass::Return, 0), 128);
        assert_eq!(Region::offset_of(BufferClass::Return, 3), 224);
    }

    #[test]
    fn descriptor_validation() {
        let req = Descriptor::new(64, 10);
        assert_eq!(Region::index_of(BufferClass::Request, &req), Some(2));
        // Request offsets are not valid return buffers and vice versa.
        assert_eq!(Region::index_of(BufferClass::Return, &req), None);
        let ret = Descriptor::new(160, 10);
        assert_eq!(Region::index_of(BufferClass::Return, &ret), Some(1));
        assert_eq!(Region::index_of(BufferClass::Request, &ret), None);
        // Misaligned, oversized and past-the-end descriptors are rejected.
        assert_eq!(Region::index_of(BufferClass::Request, &Descriptor::new(3, 1)), None);
        assert_eq!(Region::index_of(BufferClass::Request, &Descriptor::new(0, 33)), None);
        assert_eq!(Region::index_of(BufferClass::Return, &Descriptor::new(256, 1)), None);
    }

    #[test]
    fn slot_bytes_are_per_buffer() {
        let region = Region::new();
        let mut a =
            Slot::from_descriptor(&region, BufferClass::Request, &Descriptor::new(0, 3)).unwrap();
        let mut b =
            Slot::from_descriptor(&region, BufferClass::Return, &Descriptor::new(128, 3)).unwrap();
        a.bytes_mut()[..3].copy_from_slice(&[1, 2, 3]);
        b.bytes_mut()[..3].copy_from_slice(&[7, 8, 9]);
        assert_eq!(a.payload(), &[1, 2, 3]);
        assert_eq!(b.payload(), &[7, 8, 9]);
        assert_eq!(a.bytes().len(), 32);
        assert!(a.belongs_to(&region));
        assert!(!a.belongs_to(&Region::new()));
    }
}
