// Licensed under the Apache-2.0 license

//! Transport context: one end's view of a [`TransportRegion`].
//!
//! The same type serves all three roles. Which rings a role produces into
//! and consumes from is fixed by the protocol:
//!
//! | ring     | producer                 | consumer                 |
//! |----------|--------------------------|--------------------------|
//! | req-free | requests' consumer end   | requests' producer end   |
//! | req-used | requests' producer end   | requests' consumer end   |
//! | ret-free | returns' consumer end    | returns' producer end    |
//! | ret-used | returns' producer end    | returns' consumer end    |
//!
//! On a client link the client produces requests and consumes returns; on
//! the driver link the server does. The server owns both pools and is the
//! only party that passes `buffer_init = true`.
//!
//! A free ring is only ever fed by the end that consumes the class, so a
//! buffer taken from a free ring is never given back to it. Every check
//! that can fail runs before the buffer is taken, and operations that
//! cannot hand a buffer on return it to the caller.

use super::layout::{request_parts_mut, REQ_BUF_DAT_OFFSET};
use super::region::{BufferClass, Slot, TransportRegion, I2C_BUF_COUNT, I2C_BUF_SZ};
use super::ring::{Descriptor, Ring, RingError};
use crate::i2c::token::{compose_stream, compose_write, stream_len, StreamError, Transfer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The free ring of the class is empty.
    NoBuffer,
    /// The used ring refused the descriptor.
    RingFull,
    /// Payload does not fit a slot after the header.
    TooLarge,
    /// Zero-length read.
    EmptyRead,
    /// Slot was popped from a different region.
    ForeignSlot,
    /// Peer handed over a descriptor that names no buffer of this class.
    InvalidDescriptor,
}

impl From<StreamError> for TransportError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::TooLarge => TransportError::TooLarge,
            StreamError::EmptyRead => TransportError::EmptyRead,
        }
    }
}

/// A buffer an operation could not hand on, returned with the reason.
pub type Rejected<'r, const N: usize, const S: usize> = (Slot<'r, N, S>, TransportError);

/// Handle on the four rings and buffer pool of one link.
#[derive(Clone, Copy)]
pub struct TransportContext<'r, const N: usize = I2C_BUF_COUNT, const S: usize = I2C_BUF_SZ> {
    region: &'r TransportRegion<N, S>,
}

impl<'r, const N: usize, const S: usize> TransportContext<'r, N, S> {
    /// Largest token stream a request slot can carry.
    pub const MAX_STREAM: usize = S - REQ_BUF_DAT_OFFSET;

    /// Bind to `region`.
    ///
    /// With `buffer_init` the rings are emptied and every pool slot is
    /// pushed onto the free ring of its class. Only the pool owner (the
    /// server) does this, before its peer starts; every other end attaches
    /// with `buffer_init = false` and leaves the shared state untouched.
    pub fn init(region: &'r TransportRegion<N, S>, buffer_init: bool) -> Self {
        let ctx = Self { region };
        if buffer_init {
            for ring in [
                &region.req_free,
                &region.req_used,
                &region.ret_free,
                &region.ret_used,
            ] {
                ring.reset();
            }
            for index in 0..N {
                for (class, ring) in [
                    (BufferClass::Request, &region.req_free),
                    (BufferClass::Return, &region.ret_free),
                ] {
                    let desc = Descriptor::new(TransportRegion::<N, S>::offset_of(class, index), S as u32);
                    // Capacity equals the slot count, so this cannot fail.
                    let _ = ring.enqueue(desc);
                }
            }
        }
        ctx
    }

    #[must_use]
    pub fn region(&self) -> &'r TransportRegion<N, S> {
        self.region
    }

    /// Server side: queue an already tokenised request.
    ///
    /// `tokens` is copied verbatim after the header. Nothing is taken if
    /// the stream does not fit.
    ///
    /// # Errors
    ///
    /// [`TransportError::TooLarge`], [`TransportError::NoBuffer`] or
    /// [`TransportError::RingFull`].
    pub fn alloc_request(&self, tokens: &[u8], client: u8, addr: u8) -> Result<usize, TransportError> {
        if tokens.len() > Self::MAX_STREAM {
            return Err(TransportError::TooLarge);
        }
        self.fill_request(client, addr, |stream| {
            stream.get_mut(..tokens.len()).map_or(0, |dst| {
                dst.copy_from_slice(tokens);
                tokens.len()
            })
        })
    }

    /// Client side: compose the token stream for `transfer` and queue it.
    ///
    /// The client id byte is left zero; the server stamps the real id.
    /// A `continued` request ends in END rather than STOP.
    ///
    /// # Errors
    ///
    /// As [`Self::alloc_request`], plus [`TransportError::EmptyRead`].
    pub fn client_alloc_request(
        &self,
        transfer: Transfer<'_>,
        continued: bool,
        addr: u8,
    ) -> Result<usize, TransportError> {
        if transfer == Transfer::Read(0) {
            return Err(TransportError::EmptyRead);
        }
        if stream_len(transfer) > Self::MAX_STREAM {
            return Err(TransportError::TooLarge);
        }
        self.fill_request(0, addr, |stream| {
            compose_stream(transfer, continued, stream).unwrap_or(0)
        })
    }

    /// Client side: queue one write whose payload is `parts` back to back,
    /// under a single address phase.
    ///
    /// # Errors
    ///
    /// As [`Self::alloc_request`].
    pub fn client_alloc_write<'a, I>(&self, parts: I, continued: bool, addr: u8) -> Result<usize, TransportError>
    where
        I: IntoIterator<Item = &'a [u8]>,
        I::IntoIter: Clone,
    {
        let parts = parts.into_iter();
        let len: usize = parts.clone().map(<[u8]>::len).sum();
        if stream_len(Transfer::Write(&[])) + 2 * len > Self::MAX_STREAM {
            return Err(TransportError::TooLarge);
        }
        self.fill_request(0, addr, |stream| {
            compose_write(parts, continued, stream).unwrap_or(0)
        })
    }

    /// Take a request buffer, stamp the header and let `fill` write the
    /// stream. Callers size-check before this; `fill` returns the stream
    /// length it wrote, and a zero-length stream is rejected by the driver.
    fn fill_request<F>(&self, client: u8, addr: u8, fill: F) -> Result<usize, TransportError>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let mut slot = self.take_free(BufferClass::Request)?;
        let stream_len = request_parts_mut(slot.bytes_mut()).map_or(0, |(header, stream)| {
            header.client = client;
            header.address = addr;
            fill(stream)
        });
        let len = stream_len + REQ_BUF_DAT_OFFSET;
        // The used ring holds every buffer of the class, so this only fails
        // on a corrupted ring; the buffer is lost with it.
        self.push_used(slot, len).map_err(|(_, err)| err)?;
        Ok(len)
    }

    /// Take an empty return buffer (driver, or server towards a client).
    ///
    /// # Errors
    ///
    /// [`TransportError::NoBuffer`] when the return pool is exhausted.
    pub fn get_return_slot(&self) -> Result<Slot<'r, N, S>, TransportError> {
        self.take_free(BufferClass::Return)
    }

    /// Hand a filled return buffer of `len` bytes to the other end.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidDescriptor`] for a request buffer,
    /// [`TransportError::ForeignSlot`] or [`TransportError::RingFull`]. The
    /// slot comes back with the error.
    pub fn push_return(&self, slot: Slot<'r, N, S>, len: usize) -> Result<(), Rejected<'r, N, S>> {
        if slot.class() != BufferClass::Return {
            return Err((slot, TransportError::InvalidDescriptor));
        }
        self.push_used(slot, len)
    }

    /// Next pending request. `WouldBlock` means there is no work now.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidDescriptor`] if the peer queued garbage; the
    /// descriptor is discarded.
    pub fn pop_request(&self) -> nb::Result<Slot<'r, N, S>, TransportError> {
        self.pop_used(BufferClass::Request)
    }

    /// Next completed return buffer. `WouldBlock` means nothing completed.
    ///
    /// # Errors
    ///
    /// As [`Self::pop_request`].
    pub fn pop_return(&self) -> nb::Result<Slot<'r, N, S>, TransportError> {
        self.pop_used(BufferClass::Return)
    }

    /// Give a popped buffer back to its class's free ring. Only the end that
    /// consumes a class releases its buffers.
    ///
    /// Consuming the handle is what makes a second release of the same
    /// buffer impossible:
    ///
    /// ```compile_fail
    /// use i2c_sddf::i2c::token::Transfer;
    /// use i2c_sddf::transport::{TransportContext, TransportRegion};
    ///
    /// let region = TransportRegion::<4, 32>::new();
    /// let server = TransportContext::init(&region, true);
    /// let client = TransportContext::init(&region, false);
    /// client.client_alloc_request(Transfer::Read(1), false, 0x50).unwrap();
    /// let slot = server.pop_request().unwrap();
    /// server.release(slot).unwrap();
    /// server.release(slot).unwrap(); // use of moved value
    /// ```
    ///
    /// # Errors
    ///
    /// [`TransportError::ForeignSlot`] if the slot belongs to another region,
    /// [`TransportError::RingFull`] if the free ring is already full. The
    /// slot comes back with the error.
    pub fn release(&self, slot: Slot<'r, N, S>) -> Result<(), Rejected<'r, N, S>> {
        if !slot.belongs_to(self.region) {
            return Err((slot, TransportError::ForeignSlot));
        }
        let ring = self.free_ring(slot.class());
        match ring.enqueue(slot.descriptor(S)) {
            Ok(()) => Ok(()),
            Err(_) => Err((slot, TransportError::RingFull)),
        }
    }

    /// Whether the request used ring is empty.
    #[must_use]
    pub fn requests_empty(&self) -> bool {
        self.region.req_used.is_empty()
    }

    /// Whether the return used ring is empty.
    #[must_use]
    pub fn returns_empty(&self) -> bool {
        self.region.ret_used.is_empty()
    }

    /// Buffers currently available in `class`'s free ring.
    #[must_use]
    pub fn free_count(&self, class: BufferClass) -> usize {
        self.free_ring(class).len()
    }

    fn take_free(&self, class: BufferClass) -> Result<Slot<'r, N, S>, TransportError> {
        let desc = self
            .free_ring(class)
            .dequeue()
            .map_err(|_| TransportError::NoBuffer)?;
        Slot::from_descriptor(self.region, class, &desc).ok_or(TransportError::InvalidDescriptor)
    }

    fn push_used(&self, slot: Slot<'r, N, S>, len: usize) -> Result<(), Rejected<'r, N, S>> {
        if !slot.belongs_to(self.region) {
            return Err((slot, TransportError::ForeignSlot));
        }
        let desc = slot.descriptor(len);
        match self.used_ring(slot.class()).enqueue(desc) {
            Ok(()) => Ok(()),
            Err(_) => Err((slot, TransportError::RingFull)),
        }
    }

    fn pop_used(&self, class: BufferClass) -> nb::Result<Slot<'r, N, S>, TransportError> {
        match self.used_ring(class).dequeue() {
            Ok(desc) => Slot::from_descriptor(self.region, class, &desc)
                .ok_or(nb::Error::Other(TransportError::InvalidDescriptor)),
            Err(RingError::Empty) => Err(nb::Error::WouldBlock),
            Err(RingError::Full) => Err(nb::Error::Other(TransportError::RingFull)),
        }
    }

    fn free_ring(&self, class: BufferClass) -> &'r Ring<N> {
        match class {
            BufferClass::Request => &self.region.req_free,
            BufferClass::Return => &self.region.ret_free,
        }
    }

    fn used_ring(&self, class: BufferClass) -> &'r Ring<N> {
        match class {
            BufferClass::Request => &self.region.req_used,
            BufferClass::Return => &self.region.ret_used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::layout::request_parts;
    use hex_literal::hex;

    type Region = TransportRegion<4, 32>;

    #[test]
    fn owner_init_fills_free_rings() {
        let region = Region::new();
        let ctx = TransportContext::init(&region, true);
        assert_eq!(ctx.free_count(BufferClass::Request), 4);
        assert_eq!(ctx.free_count(BufferClass::Return), 4);
        assert!(ctx.requests_empty());
        assert!(ctx.returns_empty());
    }

    #[test]
    fn attaching_leaves_shared_state_alone() {
        let region = Region::new();
        let owner = TransportContext::init(&region, true);
        owner.alloc_request(&[0x02], 1, 0x10).unwrap();
        let peer = TransportContext::init(&region, false);
        assert!(!peer.requests_empty());
        assert_eq!(peer.free_count(BufferClass::Request), 3);
    }

    #[test]
    fn server_request_round_trip() {
        let region = Region::new();
        let server = TransportContext::init(&region, true);
        let driver = TransportContext::init(&region, false);

        let len = server.alloc_request(&hex!("02 04 aa 06"), 7, 0x50).unwrap();
        assert_eq!(len, 6);

        let slot = driver.pop_request().unwrap();
        assert_eq!(slot.len(), 6);
        let (hdr, stream) = request_parts(slot.payload()).unwrap();
        assert_eq!((hdr.client, hdr.address), (7, 0x50));
        assert_eq!(stream, &hex!("02 04 aa 06"));
        assert!(matches!(driver.pop_request(), Err(nb::Error::WouldBlock)));

        driver.release(slot).unwrap();
        assert_eq!(server.free_count(BufferClass::Request), 4);
    }

    #[test]
    fn client_request_is_tokenised() {
        let region = Region::new();
        let _server = TransportContext::init(&region, true);
        let client = TransportContext::init(&region, false);

        client
            .client_alloc_request(Transfer::Write(&[0x11, 0x22]), true, 0x23)
            .unwrap();
        let slot = client.pop_request().unwrap();
        assert_eq!(slot.payload(), &hex!("00 23 02 04 11 04 22 00"));
        client.release(slot).unwrap();
    }

    #[test]
    fn oversized_requests_write_nothing() {
        let region = Region::new();
        let ctx = TransportContext::init(&region, true);
        let stream = [0x04u8; 31];
        assert_eq!(ctx.alloc_request(&stream, 0, 0), Err(TransportError::TooLarge));
        // 32-byte slot: 2 header + 2 + 2 * 14 = 32 fits, 15 bytes does not.
        assert!(ctx.client_alloc_request(Transfer::Write(&[0; 14]), false, 1).is_ok());
        assert_eq!(
            ctx.client_alloc_request(Transfer::Write(&[0; 15]), false, 1),
            Err(TransportError::TooLarge)
        );
        assert_eq!(
            ctx.client_alloc_request(Transfer::Read(0), false, 1),
            Err(TransportError::EmptyRead)
        );
        assert_eq!(ctx.free_count(BufferClass::Request), 3);
        assert_eq!(ctx.region().req_used.len(), 1);
    }

    #[test]
    fn exhausted_pool_reports_no_buffer() {
        let region = Region::new();
        let ctx = TransportContext::init(&region, true);
        for _ in 0..4 {
            ctx.alloc_request(&[0x02], 0, 1).unwrap();
        }
        assert_eq!(ctx.alloc_request(&[0x02], 0, 1), Err(TransportError::NoBuffer));
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(ctx.get_return_slot().unwrap());
        }
        assert_eq!(ctx.get_return_slot().unwrap_err(), TransportError::NoBuffer);
        for slot in held {
            ctx.release(slot).unwrap();
        }
        assert_eq!(ctx.free_count(BufferClass::Return), 4);
    }

    #[test]
    fn every_slot_is_in_exactly_one_place() {
        let region = Region::new();
        let server = TransportContext::init(&region, true);
        let driver = TransportContext::init(&region, false);
        let mut in_flight = Vec::new();
        for round in 0..20 {
            if round % 3 != 2 {
                let _ = server.alloc_request(&[0x02], 0, 1);
            }
            if let Ok(slot) = driver.pop_request() {
                in_flight.push(slot);
            }
            if round % 2 == 1 {
                if let Some(slot) = in_flight.pop() {
                    driver.release(slot).unwrap();
                }
            }
            let total = server.free_count(BufferClass::Request)
                + region.req_used.len()
                + in_flight.len();
            assert_eq!(total, 4);
            let mut seen: Vec<_> = in_flight.iter().map(Slot::index).collect();
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), in_flight.len());
        }
    }

    #[test]
    fn slots_from_another_region_are_refused() {
        let a = Region::new();
        let b = Region::new();
        let ctx_a = TransportContext::init(&a, true);
        let ctx_b = TransportContext::init(&b, true);
        let slot = ctx_a.get_return_slot().unwrap();
        let (slot, err) = ctx_b.release(slot).unwrap_err();
        assert_eq!(err, TransportError::ForeignSlot);
        assert_eq!(ctx_b.free_count(BufferClass::Return), 4);

        let (slot, err) = ctx_b.push_return(slot, 4).unwrap_err();
        assert_eq!(err, TransportError::ForeignSlot);
        assert!(ctx_b.returns_empty());

        // Still usable in its own region.
        ctx_a.push_return(slot, 4).unwrap();
        assert_eq!(ctx_a.pop_return().unwrap().index(), 0);
    }

    #[test]
    fn request_buffer_is_not_a_return() {
        let region = Region::new();
        let server = TransportContext::init(&region, true);
        let driver = TransportContext::init(&region, false);
        server.alloc_request(&[0x02, 0x06], 1, 0x10).unwrap();
        let request = driver.pop_request().unwrap();

        let produced = region.ret_used.produced();
        let (request, err) = driver.push_return(request, 2).unwrap_err();
        assert_eq!(err, TransportError::InvalidDescriptor);
        assert_eq!(request.class(), BufferClass::Request);
        assert_eq!(region.ret_used.produced(), produced);
        driver.release(request).unwrap();
    }

    #[test]
    fn failed_allocation_takes_nothing() {
        let region = Region::new();
        let server = TransportContext::init(&region, true);
        let client = TransportContext::init(&region, false);
        let taken = region.req_free.produced();

        assert!(client.client_alloc_request(Transfer::Read(40), false, 1).is_err());
        assert!(client.client_alloc_write([&[0u8; 10][..], &[0; 5]], false, 1).is_err());
        assert!(server.alloc_request(&[0x04; 31], 0, 1).is_err());

        assert_eq!(region.req_free.produced(), taken);
        assert_eq!(client.free_count(BufferClass::Request), 4);
        assert!(client.requests_empty());
    }

    #[test]
    fn write_parts_share_one_address_phase() {
        let region = Region::new();
        let _server = TransportContext::init(&region, true);
        let client = TransportContext::init(&region, false);

        let len = client
            .client_alloc_write([&[0x10u8][..], &[], &[0x01, 0x02]], false, 0x50)
            .unwrap();
        assert_eq!(len, 10);
        let slot = client.pop_request().unwrap();
        assert_eq!(slot.payload(), &hex!("00 50 02 04 10 04 01 04 02 06"));
        client.release(slot).unwrap();
    }

    #[test]
    fn garbage_descriptors_are_discarded() {
        let region = Region::new();
        let ctx = TransportContext::init(&region, true);
        region.ret_used.enqueue(Descriptor::new(5, 4)).unwrap();
        assert!(matches!(
            ctx.pop_return(),
            Err(nb::Error::Other(TransportError::InvalidDescriptor))
        ));
        assert!(matches!(ctx.pop_return(), Err(nb::Error::WouldBlock)));
    }
}
