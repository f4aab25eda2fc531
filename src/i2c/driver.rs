// Licensed under the Apache-2.0 license

//! Driver state machine for one list-processor bus interface.
//!
//! ```text
//! IDLE --server notify--> LOADING --start--> RUNNING
//!   ^                        ^                  |
//!   |                        +--tokens remain---+ completion IRQ
//!   +----- push return, notify server ----------+ (or error / timeout IRQ)
//! ```
//!
//! The driver never blocks. It is driven by [`I2cDriver::notified`] with the
//! channel that fired, and keeps at most one transaction in flight. Work that
//! arrives while a transaction is running raises a deferred flag that is
//! checked once the interrupt has been handled.
//!
//! Return buffers come off a ring the server feeds. One that was taken for a
//! request that is then abandoned is kept as a spare for the next request
//! rather than handed back.

use crate::common::{Channel, Logger, NoOpLogger, Notifier};
use crate::i2c::common::{ConfigurationError, ErrorCode, I2cConfig};
use crate::i2c::registers::{Control, ListStatus, Register, SlaveAddr};
use crate::i2c::token::{
    load_chunk, read_len, DataLanes, DecodeError, Direction, HwToken, TokenList, DATA_LANES,
    TOKEN_SLOTS,
};
use crate::i2c::traits::I2cRegisters;
use crate::transport::layout::{request_parts, return_parts_mut, I2C_ADDR_MAX, RET_BUF_DAT_OFFSET};
use crate::transport::{Slot, TransportContext, I2C_BUF_COUNT, I2C_BUF_SZ};

/// Channels the driver listens and talks on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DriverChannels {
    /// Doorbell shared with the server, both directions.
    pub server: Channel,
    /// List-processor completion interrupt.
    pub irq: Channel,
    /// List-processor timeout interrupt.
    pub irq_timeout: Channel,
}

/// Events the state machine reacts to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DriverEvent {
    ServerNotify,
    Complete,
    Timeout,
}

/// Why a request was abandoned before (or between) hardware loads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestError {
    /// Target address outside the 7-bit range.
    InvalidAddress(u8),
    /// Malformed token stream.
    Decode(DecodeError),
    /// Request without a token stream.
    EmptyStream,
    /// Stream reads more bytes than a return buffer holds.
    ReadTooLong { len: usize, capacity: usize },
}

impl From<DecodeError> for RequestError {
    fn from(err: DecodeError) -> Self {
        RequestError::Decode(err)
    }
}

struct InFlight<'r, const N: usize, const S: usize> {
    request: Slot<'r, N, S>,
    ret: Slot<'r, N, S>,
    address: u8,
    /// Token stream length, excluding the request header.
    stream_len: usize,
    /// Next unprocessed stream byte.
    cursor: usize,
    /// Payload bytes already stored in the return buffer.
    ret_len: usize,
    direction: Direction,
}

/// Per-interface bookkeeping, reset between transactions.
pub struct InterfaceState<'r, const N: usize = I2C_BUF_COUNT, const S: usize = I2C_BUF_SZ> {
    in_flight: Option<InFlight<'r, N, S>>,
    notified: bool,
    /// Return buffer left over from an abandoned request.
    spare: Option<Slot<'r, N, S>>,
}

impl<const N: usize, const S: usize> Default for InterfaceState<'_, N, S> {
    fn default() -> Self {
        Self {
            in_flight: None,
            notified: false,
            spare: None,
        }
    }
}

impl<const N: usize, const S: usize> InterfaceState<'_, N, S> {
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Server signalled while a transaction was running.
    #[must_use]
    pub fn deferred(&self) -> bool {
        self.notified
    }

    /// Stream bytes not yet loaded into the hardware.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.in_flight
            .as_ref()
            .map_or(0, |f| f.stream_len.saturating_sub(f.cursor))
    }

    #[must_use]
    pub fn direction(&self) -> Option<Direction> {
        self.in_flight.as_ref().map(|f| f.direction)
    }

    /// Target address of the transaction in flight.
    #[must_use]
    pub fn address(&self) -> Option<u8> {
        self.in_flight.as_ref().map(|f| f.address)
    }

    /// Whether a return buffer is held for the next request.
    #[must_use]
    pub fn has_spare(&self) -> bool {
        self.spare.is_some()
    }
}

pub struct I2cDriver<
    'r,
    R: I2cRegisters,
    Nf: Notifier,
    L: Logger = NoOpLogger,
    const N: usize = I2C_BUF_COUNT,
    const S: usize = I2C_BUF_SZ,
> {
    regs: R,
    transport: TransportContext<'r, N, S>,
    notifier: Nf,
    channels: DriverChannels,
    config: I2cConfig,
    logger: L,
    state: InterfaceState<'r, N, S>,
}

impl<'r, R, Nf, L, const N: usize, const S: usize> I2cDriver<'r, R, Nf, L, N, S>
where
    R: I2cRegisters,
    Nf: Notifier,
    L: Logger,
{
    pub fn new(
        regs: R,
        transport: TransportContext<'r, N, S>,
        notifier: Nf,
        channels: DriverChannels,
        config: I2cConfig,
        logger: L,
    ) -> Self {
        Self {
            regs,
            transport,
            notifier,
            channels,
            config,
            logger,
            state: InterfaceState::default(),
        }
    }

    /// Program clock, filters and mode bits, and reset the interface state.
    ///
    /// # Errors
    ///
    /// Returns the configuration error without touching the hardware.
    pub fn init(&mut self) -> Result<(), ConfigurationError> {
        self.config.validate()?;
        let (high, low) = self.config.dividers()?;
        let (scl_filter, sda_filter) = (self.config.scl_filter, self.config.sda_filter);

        self.regs.modify(Register::Control, |v| {
            Control(v)
                .with_start(0)
                .with_manual(0)
                .with_ack_ignore(0)
                .with_cntl_jic(1)
                .with_clkdiv(high)
                .0
        });
        self.regs.modify(Register::SlaveAddr, |v| {
            SlaveAddr(v)
                .with_scl_filter(u32::from(scl_filter))
                .with_sda_filter(u32::from(sda_filter))
                .with_scl_delay(low)
                .with_scl_delay_enable(1)
                .0
        });
        let spare = match self.state.in_flight.take() {
            Some(flight) => {
                self.release(flight.request);
                Some(flight.ret)
            }
            None => self.state.spare.take(),
        };
        self.state = InterfaceState {
            spare,
            ..InterfaceState::default()
        };
        self.logger.debug(format_args!(
            "bus configured, clkdiv {high} scl_delay {low}"
        ));
        Ok(())
    }

    /// Entry point for every notification delivered to the driver.
    pub fn notified(&mut self, channel: Channel) {
        if channel == self.channels.server {
            self.handle(DriverEvent::ServerNotify);
        } else if channel == self.channels.irq {
            self.handle(DriverEvent::Complete);
            self.notifier.irq_ack(channel);
        } else if channel == self.channels.irq_timeout {
            self.handle(DriverEvent::Timeout);
            self.notifier.irq_ack(channel);
        } else {
            self.logger
                .error(format_args!("notification on unknown channel {channel}"));
        }
    }

    pub fn handle(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::ServerNotify => self.on_server_notify(),
            DriverEvent::Complete => {
                self.on_complete();
                self.run_deferred();
            }
            DriverEvent::Timeout => {
                self.on_timeout();
                self.run_deferred();
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> &InterfaceState<'r, N, S> {
        &self.state
    }

    #[must_use]
    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut R {
        &mut self.regs
    }

    #[must_use]
    pub fn notifier(&self) -> &Nf {
        &self.notifier
    }

    pub fn notifier_mut(&mut self) -> &mut Nf {
        &mut self.notifier
    }

    #[must_use]
    pub fn logger(&self) -> &L {
        &self.logger
    }

    fn on_server_notify(&mut self) {
        if self.state.is_busy() {
            self.logger
                .debug(format_args!("busy, deferring server notification"));
            self.state.notified = true;
            return;
        }
        self.start_next();
    }

    /// Once the interface is idle again, pick up work that arrived while it
    /// was busy. The server signals once per batch, so queued requests are
    /// picked up even without the flag.
    fn run_deferred(&mut self) {
        if self.state.is_busy() {
            return;
        }
        let deferred = core::mem::take(&mut self.state.notified);
        if deferred || !self.transport.requests_empty() {
            self.start_next();
        }
    }

    /// Pop requests until one is running or the request ring is empty.
    fn start_next(&mut self) {
        loop {
            let request = match self.transport.pop_request() {
                Ok(slot) => slot,
                Err(nb::Error::WouldBlock) => return,
                Err(nb::Error::Other(err)) => {
                    self.logger
                        .error(format_args!("dropping request descriptor: {err:?}"));
                    continue;
                }
            };
            let ret = match self.state.spare.take() {
                Some(slot) => Ok(slot),
                None => self.transport.get_return_slot(),
            };
            let ret = match ret {
                Ok(slot) => slot,
                Err(err) => {
                    self.logger
                        .error(format_args!("no return buffer ({err:?}), dropping request"));
                    self.release(request);
                    return;
                }
            };
            if self.begin(request, ret) {
                return;
            }
        }
    }

    /// Set up a transaction and load its first chunk. Returns whether the
    /// hardware was started.
    fn begin(&mut self, request: Slot<'r, N, S>, mut ret: Slot<'r, N, S>) -> bool {
        let Some((header, stream)) = request_parts(request.payload()) else {
            self.logger.error(format_args!("request shorter than its header"));
            self.release(request);
            self.state.spare = Some(ret);
            return false;
        };
        let (client, address, stream_len) = (header.client, header.address, stream.len());
        if let Err(err) = Self::validate(address, stream) {
            self.logger
                .error(format_args!("client {client}: rejecting request: {err:?}"));
            self.release(request);
            self.state.spare = Some(ret);
            return false;
        }

        if let Some((ret_header, _)) = return_parts_mut(ret.bytes_mut()) {
            ret_header.client = client;
            ret_header.address = address;
            ret_header.error = ErrorCode::Ok as u8;
            ret_header.error_token = 0;
        }
        self.state.in_flight = Some(InFlight {
            request,
            ret,
            address,
            stream_len,
            cursor: 0,
            ret_len: 0,
            direction: Direction::Write,
        });
        self.logger.debug(format_args!(
            "client {client} addr {address:#04x}: {stream_len} stream bytes"
        ));
        self.load_or_abort()
    }

    /// Checks that need no hardware: the address range, a non-empty stream
    /// that decodes, and a read payload that fits the return buffer.
    fn validate(address: u8, stream: &[u8]) -> Result<(), RequestError> {
        if address > I2C_ADDR_MAX {
            return Err(RequestError::InvalidAddress(address));
        }
        if stream.is_empty() {
            return Err(RequestError::EmptyStream);
        }
        let capacity = S.saturating_sub(RET_BUF_DAT_OFFSET);
        let len = read_len(stream)?;
        if len > capacity {
            return Err(RequestError::ReadTooLong { len, capacity });
        }
        Ok(())
    }

    fn load_or_abort(&mut self) -> bool {
        match self.load() {
            Ok(()) => true,
            Err(err) => {
                self.logger
                    .error(format_args!("aborting request: {err:?}"));
                if let Some(flight) = self.state.in_flight.take() {
                    self.release(flight.request);
                    self.state.spare = Some(flight.ret);
                }
                false
            }
        }
    }

    /// Program the next chunk of the in-flight stream and start the list
    /// processor.
    fn load(&mut self) -> Result<(), RequestError> {
        let Some(flight) = self.state.in_flight.as_mut() else {
            return Ok(());
        };
        if flight.address > I2C_ADDR_MAX {
            return Err(RequestError::InvalidAddress(flight.address));
        }
        let stream = request_parts(flight.request.payload()).map_or(&[][..], |(_, s)| s);
        let chunk = load_chunk(stream, flight.cursor, flight.direction)?;

        for reg in [
            Register::TokenList0,
            Register::TokenList1,
            Register::WriteData0,
            Register::WriteData1,
        ] {
            self.regs.write(reg, 0);
        }
        let address = u32::from(flight.address);
        self.regs
            .modify(Register::SlaveAddr, |v| SlaveAddr(v).with_address(address).0);

        let (list0, list1) = chunk.tokens.words();
        self.regs.write(Register::TokenList0, list0);
        self.regs.write(Register::TokenList1, list1);
        let (data0, data1) = chunk.write_data.words();
        self.regs.write(Register::WriteData0, data0);
        self.regs.write(Register::WriteData1, data1);

        flight.cursor += chunk.consumed;
        flight.direction = chunk.direction;

        self.regs
            .modify(Register::Control, |v| Control(v).with_start(1).0);
        Ok(())
    }

    fn halt(&mut self) {
        self.regs
            .modify(Register::Control, |v| Control(v).with_start(0).0);
    }

    fn on_complete(&mut self) {
        self.halt();
        let status = Control(self.regs.read(Register::Control)).list_status();
        let lanes = DataLanes::from_words(
            self.regs.read(Register::ReadData0),
            self.regs.read(Register::ReadData1),
        );

        let Some(flight) = self.state.in_flight.as_mut() else {
            self.logger
                .debug(format_args!("completion with nothing in flight"));
            return;
        };

        let failed = match status {
            ListStatus::Nack { token } => {
                let code = if u32::from(token) == HwToken::SlaveAddrRead.bits() {
                    ErrorCode::NoRead
                } else {
                    ErrorCode::Nack
                };
                if let Some((header, _)) = return_parts_mut(flight.ret.bytes_mut()) {
                    header.error = code as u8;
                    header.error_token = token;
                }
                self.logger.error(format_args!(
                    "{code:?} at addr {:#04x} on token {token}",
                    flight.address
                ));
                true
            }
            ListStatus::Done { count } if count > 0 => {
                let count = count.min(DATA_LANES);
                let start = flight.ret_len;
                match return_parts_mut(flight.ret.bytes_mut())
                    .and_then(|(_, payload)| payload.get_mut(start..start + count))
                {
                    Some(dst) => {
                        lanes.copy_to(dst);
                        flight.ret_len += count;
                        false
                    }
                    None => {
                        self.logger.error(format_args!(
                            "{count} bytes read at addr {:#04x} overflow the return buffer after {start}",
                            flight.address
                        ));
                        true
                    }
                }
            }
            ListStatus::Done { .. } => false,
        };

        if failed || flight.cursor >= flight.stream_len {
            self.finish();
        } else if self.load_or_abort() {
            self.logger.debug(format_args!(
                "reloaded, {} stream bytes remaining",
                self.state.remaining()
            ));
        }
    }

    fn on_timeout(&mut self) {
        self.halt();
        let Some(flight) = self.state.in_flight.as_mut() else {
            return;
        };
        if let Some((header, _)) = return_parts_mut(flight.ret.bytes_mut()) {
            header.error = ErrorCode::Timeout as u8;
            header.error_token = 0;
        }
        self.logger
            .error(format_args!("timeout at addr {:#04x}", flight.address));
        self.finish();
    }

    /// Hand the return buffer to the server, recycle the request and signal
    /// once.
    fn finish(&mut self) {
        let Some(flight) = self.state.in_flight.take() else {
            return;
        };
        let len = RET_BUF_DAT_OFFSET + flight.ret_len;
        if let Err((ret, err)) = self.transport.push_return(flight.ret, len) {
            self.logger
                .error(format_args!("could not queue return: {err:?}"));
            self.state.spare = Some(ret);
        }
        self.release(flight.request);
        self.notifier.notify(self.channels.server);
    }

    /// Recycle a request buffer. The driver consumes requests, so it is the
    /// only end that feeds their free ring.
    fn release(&mut self, slot: Slot<'r, N, S>) {
        if let Err((_, err)) = self.transport.release(slot) {
            self.logger
                .error(format_args!("could not release buffer: {err:?}"));
        }
    }

    /// Log every register field of the interface.
    pub fn dump_registers(&mut self) {
        let ctl = Control(self.regs.read(Register::Control));
        let addr = SlaveAddr(self.regs.read(Register::SlaveAddr));
        let log = &mut self.logger;
        log.info(format_args!("control {:#010x}", ctl.0));
        log.info(format_args!(
            "  start {} ack_ignore {} status {} error {} curr_token {}",
            ctl.start(),
            ctl.ack_ignore(),
            ctl.status(),
            ctl.error(),
            ctl.curr_token()
        ));
        log.info(format_args!(
            "  rd_count {} clkdiv {} manual {} cntl_jic {}",
            ctl.rd_count(),
            ctl.clkdiv(),
            ctl.manual(),
            ctl.cntl_jic()
        ));
        log.info(format_args!("slave_addr {:#010x}", addr.0));
        log.info(format_args!(
            "  address {:#04x} sda_filter {} scl_filter {} scl_delay {} scl_delay_enable {}",
            addr.address(),
            addr.sda_filter(),
            addr.scl_filter(),
            addr.scl_delay(),
            addr.scl_delay_enable()
        ));

        let tokens = TokenList::from_words(
            self.regs.read(Register::TokenList0),
            self.regs.read(Register::TokenList1),
        );
        for slot in 0..TOKEN_SLOTS {
            match tokens.get(slot) {
                Some(token) => log.info(format_args!("  token[{slot}] {token:?}")),
                None => log.info(format_args!("  token[{slot}] invalid")),
            }
        }
        for (name, low, high) in [
            ("wdata", Register::WriteData0, Register::WriteData1),
            ("rdata", Register::ReadData0, Register::ReadData1),
        ] {
            let lanes = DataLanes::from_words(self.regs.read(low), self.regs.read(high));
            let mut bytes = [0u8; DATA_LANES];
            lanes.copy_to(&mut bytes);
            log.info(format_args!("{name} {bytes:02x?}"));
        }
    }
}
