// Licensed under the Apache-2.0 license

//! Client side of a client↔server link.
//!
//! [`I2cClient`] queues plain reads and writes and collects their responses
//! without blocking. [`BlockingI2c`] layers `embedded_hal::i2c::I2c` on top of
//! it for code that expects a synchronous bus.

use crate::common::{Channel, Notifier, WaitForNotification};
use crate::i2c::common::I2cError;
use crate::i2c::token::Transfer;
use crate::transport::layout::{return_parts, I2C_ADDR_MAX, REQ_BUF_DAT_OFFSET};
use crate::transport::{
    BufferClass, TransportContext, TransportError, TransportRegion, I2C_BUF_COUNT, I2C_BUF_SZ,
};
use embedded_hal::i2c::{ErrorKind, Operation, SevenBitAddress};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClientError {
    /// Address outside the 7-bit range.
    InvalidAddress(u8),
    /// Request could not be queued.
    Transport(TransportError),
    /// Response payload larger than the caller's buffer; the response is
    /// consumed.
    BufferTooSmall { needed: usize },
    /// Return buffer shorter than its header.
    Malformed,
    /// The transfer completed with a bus error.
    Bus(I2cError),
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        ClientError::Transport(err)
    }
}

impl From<I2cError> for ClientError {
    fn from(err: I2cError) -> Self {
        ClientError::Bus(err)
    }
}

impl embedded_hal::i2c::Error for ClientError {
    fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Bus(err) => err.kind(),
            _ => ErrorKind::Other,
        }
    }
}

/// One completed request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub address: u8,
    /// Raw error code, see [`crate::i2c::common::ErrorCode`].
    pub error: u8,
    /// Hardware token that failed, when `error` is a NACK.
    pub error_token: u8,
    /// Payload bytes copied to the caller.
    pub len: usize,
}

impl Response {
    /// # Errors
    ///
    /// The bus error the response carries, if any.
    pub fn result(&self) -> Result<(), I2cError> {
        I2cError::check(self.error, self.error_token)
    }
}

pub struct I2cClient<'r, Nf: Notifier, const N: usize = I2C_BUF_COUNT, const S: usize = I2C_BUF_SZ> {
    transport: TransportContext<'r, N, S>,
    notifier: Nf,
    server: Channel,
}

impl<'r, Nf: Notifier, const N: usize, const S: usize> I2cClient<'r, Nf, N, S> {
    /// Longest write one request can carry.
    pub const MAX_WRITE: usize = (S - REQ_BUF_DAT_OFFSET - 2) / 2;
    /// Longest read one request can carry.
    pub const MAX_READ: usize = S - REQ_BUF_DAT_OFFSET - 2;

    /// Attach to a link the server has already initialised.
    pub fn new(region: &'r TransportRegion<N, S>, notifier: Nf, server: Channel) -> Self {
        Self {
            transport: TransportContext::init(region, false),
            notifier,
            server,
        }
    }

    /// Queue a write to `addr` and signal the server.
    ///
    /// # Errors
    ///
    /// Fails without queueing anything if the address or length is out of
    /// range or no request buffer is free.
    pub fn write(&mut self, addr: u8, bytes: &[u8]) -> Result<(), ClientError> {
        self.submit(addr, Transfer::Write(bytes), false)?;
        self.notify_server();
        Ok(())
    }

    /// Queue a read of `len` bytes from `addr` and signal the server.
    ///
    /// # Errors
    ///
    /// As [`Self::write`]; zero-length reads are rejected.
    pub fn read(&mut self, addr: u8, len: usize) -> Result<(), ClientError> {
        self.submit(addr, Transfer::Read(len), false)?;
        self.notify_server();
        Ok(())
    }

    /// Queue a write that holds the bus followed by a read, with a single
    /// signal. Produces two responses.
    ///
    /// # Errors
    ///
    /// As [`Self::write`]. Either both requests are queued or neither is.
    pub fn write_read(&mut self, addr: u8, bytes: &[u8], len: usize) -> Result<(), ClientError> {
        self.check(addr, Transfer::Write(bytes))?;
        self.check(addr, Transfer::Read(len))?;
        if self.free_requests() < 2 {
            return Err(TransportError::NoBuffer.into());
        }
        self.submit(addr, Transfer::Write(bytes), true)?;
        self.submit(addr, Transfer::Read(len), false)?;
        self.notify_server();
        Ok(())
    }

    /// Queue one request without signalling. A `continued` request leaves
    /// the bus held for the next one.
    ///
    /// # Errors
    ///
    /// See [`ClientError`].
    pub fn submit(&mut self, addr: u8, transfer: Transfer<'_>, continued: bool) -> Result<(), ClientError> {
        self.check(addr, transfer)?;
        self.transport
            .client_alloc_request(transfer, continued, addr)?;
        Ok(())
    }

    pub fn notify_server(&mut self) {
        self.notifier.notify(self.server);
    }

    /// Collect the next response, copying its payload into `buf`.
    /// `WouldBlock` means nothing has completed yet.
    ///
    /// # Errors
    ///
    /// [`ClientError::BufferTooSmall`] or [`ClientError::Malformed`]; in both
    /// cases the response is consumed.
    pub fn poll_response(&mut self, buf: &mut [u8]) -> nb::Result<Response, ClientError> {
        self.poll_with(|payload| {
            let dst = buf.get_mut(..payload.len()).ok_or(ClientError::BufferTooSmall {
                needed: payload.len(),
            })?;
            dst.copy_from_slice(payload);
            Ok(())
        })
    }

    /// Collect the next response, handing its payload to `copy`.
    fn poll_with<F>(&mut self, copy: F) -> nb::Result<Response, ClientError>
    where
        F: FnOnce(&[u8]) -> Result<(), ClientError>,
    {
        let slot = self
            .transport
            .pop_return()
            .map_err(|e| e.map(ClientError::Transport))?;
        let result = match return_parts(slot.payload()) {
            Some((header, payload)) => copy(payload).map(|()| Response {
                address: header.address,
                error: header.error,
                error_token: header.error_token,
                len: payload.len(),
            }),
            None => Err(ClientError::Malformed),
        };
        if let Err((_, err)) = self.transport.release(slot) {
            return Err(nb::Error::Other(ClientError::Transport(err)));
        }
        result.map_err(nb::Error::Other)
    }

    /// Request buffers available for new submissions.
    #[must_use]
    pub fn free_requests(&self) -> usize {
        self.transport.free_count(BufferClass::Request)
    }

    #[must_use]
    pub fn server_channel(&self) -> Channel {
        self.server
    }

    fn check(&self, addr: u8, transfer: Transfer<'_>) -> Result<(), ClientError> {
        if addr > I2C_ADDR_MAX {
            return Err(ClientError::InvalidAddress(addr));
        }
        match transfer {
            Transfer::Write(bytes) if bytes.len() > Self::MAX_WRITE => Err(TransportError::TooLarge.into()),
            Transfer::Read(0) => Err(TransportError::EmptyRead.into()),
            Transfer::Read(len) if len > Self::MAX_READ => Err(TransportError::TooLarge.into()),
            _ => Ok(()),
        }
    }

    /// Limits of the single request a run of same-kind operations becomes.
    fn check_run(&self, addr: u8, run: &[Operation<'_>]) -> Result<(), ClientError> {
        let len = run_len(run);
        match run.first() {
            Some(Operation::Write(_)) if len > Self::MAX_WRITE => Err(TransportError::TooLarge.into()),
            Some(Operation::Write(_)) | None => self.check(addr, Transfer::Write(&[])),
            Some(Operation::Read(_)) => self.check(addr, Transfer::Read(len)),
        }
    }

    /// Queue a run of same-kind operations as one request.
    fn submit_run(&mut self, addr: u8, run: &[Operation<'_>], continued: bool) -> Result<(), ClientError> {
        self.check_run(addr, run)?;
        match run.first() {
            Some(Operation::Read(_)) => {
                self.transport
                    .client_alloc_request(Transfer::Read(run_len(run)), continued, addr)?;
            }
            _ => {
                let parts = run.iter().filter_map(|op| match op {
                    Operation::Write(bytes) => Some(*bytes),
                    Operation::Read(_) => None,
                });
                self.transport.client_alloc_write(parts, continued, addr)?;
            }
        }
        Ok(())
    }
}

fn same_kind(a: &Operation<'_>, b: &Operation<'_>) -> bool {
    matches!(
        (a, b),
        (Operation::Write(_), Operation::Write(_)) | (Operation::Read(_), Operation::Read(_))
    )
}

/// Total bytes a run of operations moves.
fn run_len(run: &[Operation<'_>]) -> usize {
    run.iter()
        .map(|op| match op {
            Operation::Write(bytes) => bytes.len(),
            Operation::Read(buf) => buf.len(),
        })
        .sum()
}

/// Spread a read payload over the buffers of a run, in order.
fn scatter(payload: &[u8], run: &mut [Operation<'_>]) -> Result<(), ClientError> {
    if payload.len() > run_len(run) {
        return Err(ClientError::BufferTooSmall {
            needed: payload.len(),
        });
    }
    let mut rest = payload;
    for op in run.iter_mut() {
        if let Operation::Read(buf) = op {
            let (head, tail) = rest
                .split_at_checked(buf.len().min(rest.len()))
                .unwrap_or((rest, &[]));
            if let Some(dst) = buf.get_mut(..head.len()) {
                dst.copy_from_slice(head);
            }
            rest = tail;
        }
    }
    Ok(())
}

/// Synchronous `embedded-hal` bus over an [`I2cClient`].
///
/// Adjacent operations of the same kind in a transaction are merged into one
/// request, so they share a single address phase; every request but the last
/// holds the bus. The call blocks on the server channel until every request
/// has a response. A request for an address the client has not claimed is
/// dropped by the server and never answered, so claim first.
pub struct BlockingI2c<'r, Nf: Notifier, W: WaitForNotification, const N: usize = I2C_BUF_COUNT, const S: usize = I2C_BUF_SZ> {
    client: I2cClient<'r, Nf, N, S>,
    waiter: W,
}

impl<'r, Nf, W, const N: usize, const S: usize> BlockingI2c<'r, Nf, W, N, S>
where
    Nf: Notifier,
    W: WaitForNotification,
{
    pub fn new(client: I2cClient<'r, Nf, N, S>, waiter: W) -> Self {
        Self { client, waiter }
    }

    pub fn into_inner(self) -> (I2cClient<'r, Nf, N, S>, W) {
        (self.client, self.waiter)
    }

    /// Block until the response to `run` arrives and scatter its payload.
    fn collect(&mut self, run: &mut [Operation<'_>]) -> Result<Response, ClientError> {
        loop {
            match self.client.poll_with(|payload| scatter(payload, run)) {
                Ok(response) => return Ok(response),
                Err(nb::Error::Other(err)) => return Err(err),
                Err(nb::Error::WouldBlock) => self.waiter.wait(self.client.server_channel()),
            }
        }
    }
}

impl<Nf, W, const N: usize, const S: usize> embedded_hal::i2c::ErrorType for BlockingI2c<'_, Nf, W, N, S>
where
    Nf: Notifier,
    W: WaitForNotification,
{
    type Error = ClientError;
}

impl<Nf, W, const N: usize, const S: usize> embedded_hal::i2c::I2c for BlockingI2c<'_, Nf, W, N, S>
where
    Nf: Notifier,
    W: WaitForNotification,
{
    fn transaction(
        &mut self,
        address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let mut requests = 0;
        for run in operations.chunk_by(same_kind) {
            self.client.check_run(address, run)?;
            requests += 1;
        }
        if requests == 0 {
            return Ok(());
        }
        if self.client.free_requests() < requests {
            return Err(TransportError::NoBuffer.into());
        }
        for (i, run) in operations.chunk_by(same_kind).enumerate() {
            self.client.submit_run(address, run, i + 1 != requests)?;
        }
        self.client.notify_server();

        // Drain every response even after a failure so the next transaction
        // starts in step.
        let mut outcome = Ok(());
        for run in operations.chunk_by_mut(same_kind) {
            let status = self
                .collect(run)
                .and_then(|r| r.result().map_err(ClientError::from));
            if outcome.is_ok() {
                outcome = status;
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::layout::return_parts_mut;
    use hex_literal::hex;

    type Region = TransportRegion<4, 32>;
    const SERVER: Channel = 7;

    #[derive(Default)]
    struct Count(usize);

    impl Notifier for Count {
        fn notify(&mut self, channel: Channel) {
            assert_eq!(channel, SERVER);
            self.0 += 1;
        }

        fn irq_ack(&mut self, _channel: Channel) {}
    }

    fn respond(server: &TransportContext<'_, 4, 32>, error: u8, token: u8, payload: &[u8]) {
        let mut slot = server.get_return_slot().unwrap();
        let (hdr, data) = return_parts_mut(slot.bytes_mut()).unwrap();
        hdr.address = 0x50;
        hdr.error = error;
        hdr.error_token = token;
        data[..payload.len()].copy_from_slice(payload);
        server.push_return(slot, 4 + payload.len()).unwrap();
    }

    #[test]
    fn limits_follow_slot_size() {
        assert_eq!(<I2cClient<'_, Count, 4, 32>>::MAX_WRITE, 14);
        assert_eq!(<I2cClient<'_, Count, 4, 32>>::MAX_READ, 28);
        assert_eq!(<I2cClient<'_, Count>>::MAX_WRITE, 254);
        assert_eq!(<I2cClient<'_, Count>>::MAX_READ, 508);
    }

    #[test]
    fn requests_are_tokenised_and_signalled() {
        let region = Region::new();
        let server = TransportContext::init(&region, true);
        let mut client = I2cClient::new(&region, Count::default(), SERVER);

        client.write(0x50, &[0xAB]).unwrap();
        client.read(0x50, 2).unwrap();
        assert_eq!(client.notifier.0, 2);

        let w = server.pop_request().unwrap();
        assert_eq!(w.payload(), &hex!("00 50 02 04 ab 06"));
        let r = server.pop_request().unwrap();
        assert_eq!(r.payload(), &hex!("00 50 03 04 05 06"));
        server.release(w).unwrap();
        server.release(r).unwrap();
    }

    #[test]
    fn write_read_is_all_or_nothing() {
        let region = Region::new();
        let server = TransportContext::init(&region, true);
        let mut client = I2cClient::new(&region, Count::default(), SERVER);

        client.write_read(0x50, &[0x10], 3).unwrap();
        assert_eq!(client.notifier.0, 1);
        let w = server.pop_request().unwrap();
        assert_eq!(w.payload(), &hex!("00 50 02 04 10 00"));
        let r = server.pop_request().unwrap();
        assert_eq!(r.payload(), &hex!("00 50 03 04 04 05 06"));

        // Two buffers left: a third request plus a write_read cannot both fit.
        client.read(0x50, 1).unwrap();
        assert_eq!(
            client.write_read(0x50, &[0x10], 3),
            Err(ClientError::Transport(TransportError::NoBuffer))
        );
        assert_eq!(client.free_requests(), 1);
        server.release(w).unwrap();
        server.release(r).unwrap();
    }

    #[test]
    fn rejects_bad_parameters_before_queueing() {
        let region = Region::new();
        let _server = TransportContext::init(&region, true);
        let mut client = I2cClient::new(&region, Count::default(), SERVER);

        assert_eq!(client.write(0x80, &[1]), Err(ClientError::InvalidAddress(0x80)));
        assert_eq!(
            client.write(0x50, &[0; 15]),
            Err(ClientError::Transport(TransportError::TooLarge))
        );
        assert_eq!(
            client.read(0x50, 0),
            Err(ClientError::Transport(TransportError::EmptyRead))
        );
        assert_eq!(
            client.read(0x50, 29),
            Err(ClientError::Transport(TransportError::TooLarge))
        );
        assert_eq!(client.free_requests(), 4);
        assert_eq!(client.notifier.0, 0);
    }

    #[test]
    fn poll_response_copies_payload_and_releases() {
        let region = Region::new();
        let server = TransportContext::init(&region, true);
        let mut client = I2cClient::new(&region, Count::default(), SERVER);

        let mut buf = [0u8; 4];
        assert!(matches!(client.poll_response(&mut buf), Err(nb::Error::WouldBlock)));

        respond(&server, 0, 0, &[1, 2, 3]);
        let response = client.poll_response(&mut buf).unwrap();
        assert_eq!(response.len, 3);
        assert_eq!(response.result(), Ok(()));
        assert_eq!(&buf[..3], &[1, 2, 3]);

        respond(&server, 2, 3, &[]);
        let response = client.poll_response(&mut buf).unwrap();
        assert_eq!(response.result(), Err(I2cError::NoRead { token: 3 }));

        respond(&server, 0, 0, &[0; 6]);
        assert!(matches!(
            client.poll_response(&mut buf),
            Err(nb::Error::Other(ClientError::BufferTooSmall { needed: 6 }))
        ));
        assert_eq!(server.free_count(BufferClass::Return), 4);
    }

    /// Answers every queued request when the client blocks.
    struct Replies<'r> {
        server: TransportContext<'r, 4, 32>,
        seen: Vec<Vec<u8>>,
        payloads: Vec<Vec<u8>>,
    }

    impl WaitForNotification for Replies<'_> {
        fn wait(&mut self, channel: Channel) {
            assert_eq!(channel, SERVER);
            while let Ok(slot) = self.server.pop_request() {
                self.seen.push(slot.payload().to_vec());
                self.server.release(slot).unwrap();
            }
            for payload in self.payloads.drain(..) {
                respond(&self.server, 0, 0, &payload);
            }
        }
    }

    #[test]
    fn adjacent_operations_share_one_request() {
        use embedded_hal::i2c::I2c;

        let region = Region::new();
        let server = TransportContext::init(&region, true);
        let replies = Replies {
            server,
            seen: Vec::new(),
            payloads: vec![vec![], vec![9, 8, 7, 6, 5]],
        };
        let mut bus = BlockingI2c::new(I2cClient::new(&region, Count::default(), SERVER), replies);

        let (mut a, mut b) = ([0u8; 2], [0u8; 3]);
        bus.transaction(
            0x50,
            &mut [
                Operation::Write(&[0x10]),
                Operation::Write(&[0x01, 0x02]),
                Operation::Read(&mut a),
                Operation::Read(&mut b),
            ],
        )
        .unwrap();
        assert_eq!((a, b), ([9, 8], [7, 6, 5]));

        let (client, replies) = bus.into_inner();
        assert_eq!(client.notifier.0, 1);
        assert_eq!(
            replies.seen,
            vec![
                hex!("00 50 02 04 10 04 01 04 02 00").to_vec(),
                hex!("00 50 03 04 04 04 04 05 06").to_vec(),
            ]
        );
    }

    #[test]
    fn merged_write_is_held_to_one_request_limit() {
        use embedded_hal::i2c::I2c;

        let region = Region::new();
        let server = TransportContext::init(&region, true);
        let replies = Replies {
            server,
            seen: Vec::new(),
            payloads: Vec::new(),
        };
        let mut bus = BlockingI2c::new(I2cClient::new(&region, Count::default(), SERVER), replies);

        assert_eq!(
            bus.transaction(
                0x50,
                &mut [Operation::Write(&[0; 10]), Operation::Write(&[0; 5])],
            ),
            Err(ClientError::Transport(TransportError::TooLarge))
        );
        let (client, _) = bus.into_inner();
        assert_eq!(client.free_requests(), 4);
        assert_eq!(client.notifier.0, 0);
    }

    #[test]
    fn scatter_fills_read_buffers_in_order() {
        let (mut a, mut b) = ([0u8; 1], [0u8; 3]);
        let mut run = [Operation::Read(&mut a), Operation::Read(&mut b)];
        scatter(&[1, 2, 3], &mut run).unwrap();
        assert_eq!(
            scatter(&[0; 5], &mut run),
            Err(ClientError::BufferTooSmall { needed: 5 })
        );
        assert_eq!((a, b), ([1], [2, 3, 0]));
    }
}
