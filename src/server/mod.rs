// Licensed under the Apache-2.0 license

//! Security and multiplexer server.
//!
//! The server sits between any number of clients and one driver. It owns the
//! buffer pools of every link, admits client requests only for addresses the
//! client has claimed, and routes each completion back to the client id the
//! driver echoes in the return buffer. It keeps no other per-request state.

pub mod admin;
pub mod security;

use crate::common::{Channel, Logger, NoOpLogger, Notifier};
use crate::transport::layout::{request_parts, return_parts, I2C_ADDR_MAX};
use crate::transport::{TransportContext, TransportRegion, I2C_BUF_COUNT, I2C_BUF_SZ};
use admin::{AdminRequest, MessageWord, ADMIN_ERR, ADMIN_OK};
use heapless::Vec;
use security::{SecurityError, SecurityList};

/// Default size of the client table.
pub const MAX_CLIENTS: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Doorbell shared with the driver.
    pub driver_channel: Channel,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegistrationError {
    /// Id is not a 7-bit value or collides with the driver channel.
    InvalidId,
    /// Id already registered.
    Duplicate,
    /// Client table full.
    TableFull,
}

struct ClientLink<'r, const N: usize, const S: usize> {
    id: u8,
    transport: TransportContext<'r, N, S>,
}

pub struct I2cServer<
    'r,
    Nf: Notifier,
    L: Logger = NoOpLogger,
    const N: usize = I2C_BUF_COUNT,
    const S: usize = I2C_BUF_SZ,
    const C: usize = MAX_CLIENTS,
> {
    driver: TransportContext<'r, N, S>,
    clients: Vec<ClientLink<'r, N, S>, C>,
    security: SecurityList,
    notifier: Nf,
    config: ServerConfig,
    logger: L,
}

impl<'r, Nf, L, const N: usize, const S: usize, const C: usize> I2cServer<'r, Nf, L, N, S, C>
where
    Nf: Notifier,
    L: Logger,
{
    /// Take ownership of the driver link and fill its pools.
    pub fn new(
        driver_region: &'r TransportRegion<N, S>,
        notifier: Nf,
        config: ServerConfig,
        logger: L,
    ) -> Self {
        Self {
            driver: TransportContext::init(driver_region, true),
            clients: Vec::new(),
            security: SecurityList::new(),
            notifier,
            config,
            logger,
        }
    }

    /// Add the link for client `id` and fill its pools. The client's
    /// notification channel is its id.
    ///
    /// # Errors
    ///
    /// See [`RegistrationError`].
    pub fn register_client(
        &mut self,
        id: u8,
        region: &'r TransportRegion<N, S>,
    ) -> Result<(), RegistrationError> {
        if id > I2C_ADDR_MAX || Channel::from(id) == self.config.driver_channel {
            return Err(RegistrationError::InvalidId);
        }
        if self.link(id).is_some() {
            return Err(RegistrationError::Duplicate);
        }
        let link = ClientLink {
            id,
            transport: TransportContext::init(region, true),
        };
        self.clients
            .push(link)
            .map_err(|_| RegistrationError::TableFull)?;
        self.logger.info(format_args!("client {id} registered"));
        Ok(())
    }

    /// Entry point for every notification delivered to the server.
    pub fn notified(&mut self, channel: Channel) {
        if channel == self.config.driver_channel {
            self.on_driver_notify();
            return;
        }
        match u8::try_from(channel) {
            Ok(client) if self.link(client).is_some() => self.on_client_notify(client),
            _ => self
                .logger
                .error(format_args!("notification on unknown channel {channel}")),
        }
    }

    /// Forward every pending request of `client` that targets an address it
    /// owns, then ring the driver once.
    pub fn on_client_notify(&mut self, client: u8) {
        let Some(link) = self.clients.iter().find(|l| l.id == client) else {
            self.logger
                .error(format_args!("no link for client {client}"));
            return;
        };
        let transport = link.transport;
        let mut forwarded = 0usize;

        loop {
            let slot = match transport.pop_request() {
                Ok(slot) => slot,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(err)) => {
                    self.logger
                        .error(format_args!("client {client}: bad descriptor {err:?}"));
                    continue;
                }
            };
            match request_parts(slot.payload()) {
                Some((header, tokens)) if self.security.is_owner(header.address, client) => {
                    match self.driver.alloc_request(tokens, client, header.address) {
                        Ok(_) => forwarded += 1,
                        Err(err) => self.logger.error(format_args!(
                            "client {client}: driver queue refused request ({err:?}), dropped"
                        )),
                    }
                }
                Some((header, _)) => self.logger.error(format_args!(
                    "client {client}: address {:#04x} not owned, request dropped",
                    header.address
                )),
                None => self
                    .logger
                    .error(format_args!("client {client}: truncated request dropped")),
            }
            if let Err((_, err)) = transport.release(slot) {
                self.logger
                    .error(format_args!("client {client}: release failed {err:?}"));
            }
        }

        if forwarded > 0 {
            self.logger
                .debug(format_args!("client {client}: {forwarded} request(s) to driver"));
            self.notifier.notify(self.config.driver_channel);
        }
    }

    /// Route every completed return buffer to the client named in it.
    pub fn on_driver_notify(&mut self) {
        let mut wake: Vec<u8, C> = Vec::new();
        loop {
            let ret = match self.driver.pop_return() {
                Ok(slot) => slot,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(err)) => {
                    self.logger
                        .error(format_args!("driver: bad descriptor {err:?}"));
                    continue;
                }
            };
            if let Some(client) = self.route(ret.payload()) {
                if !wake.contains(&client) {
                    // `wake` has the same capacity as the client table.
                    let _ = wake.push(client);
                }
            }
            if let Err((_, err)) = self.driver.release(ret) {
                self.logger
                    .error(format_args!("driver: release failed {err:?}"));
            }
        }
        for client in wake {
            self.notifier.notify(Channel::from(client));
        }
    }

    /// Copy one driver return into the owning client's pool. Returns the
    /// client to wake on success.
    fn route(&mut self, ret: &[u8]) -> Option<u8> {
        let Some((header, _)) = return_parts(ret) else {
            self.logger
                .error(format_args!("driver: truncated return dropped"));
            return None;
        };
        let client = header.client;
        if header.error != 0 {
            self.logger.error(format_args!(
                "client {client}: bus error {} at token {} (addr {:#04x})",
                header.error, header.error_token, header.address
            ));
        }
        let Some(link) = self.clients.iter().find(|l| l.id == client) else {
            self.logger
                .error(format_args!("driver: return for unknown client {client}"));
            return None;
        };
        let mut slot = match link.transport.get_return_slot() {
            Ok(slot) => slot,
            Err(err) => {
                self.logger.error(format_args!(
                    "client {client}: no return buffer ({err:?}), response dropped"
                ));
                return None;
            }
        };
        // Both links use the same slot size, so the whole return fits.
        if let Some(dst) = slot.bytes_mut().get_mut(..ret.len()) {
            dst.copy_from_slice(ret);
        }
        // The client feeds its return free ring, so a refused buffer cannot
        // go back there; it is lost with the response.
        match link.transport.push_return(slot, ret.len()) {
            Ok(()) => Some(client),
            Err((slot, err)) => {
                self.logger.error(format_args!(
                    "client {client}: return queue refused response ({err:?}), buffer {} lost",
                    slot.index()
                ));
                None
            }
        }
    }

    /// Claim `addr` for a registered client.
    ///
    /// # Errors
    ///
    /// See [`SecurityError`].
    pub fn claim(&mut self, addr: u8, client: u8) -> Result<(), SecurityError> {
        if self.link(client).is_none() {
            return Err(SecurityError::UnknownClient);
        }
        self.security.claim(addr, client)
    }

    /// Give up `addr`.
    ///
    /// # Errors
    ///
    /// See [`SecurityError`].
    pub fn release(&mut self, addr: u8, client: u8) -> Result<(), SecurityError> {
        self.security.release(addr, client)
    }

    /// Serve one administrative call and produce its reply word.
    pub fn handle_admin(&mut self, mrs: &[MessageWord]) -> MessageWord {
        let result = match AdminRequest::decode(mrs) {
            Ok(AdminRequest::Claim { addr, client }) => self.claim(addr, client),
            Ok(AdminRequest::Release { addr, client }) => self.release(addr, client),
            Err(err) => {
                self.logger
                    .error(format_args!("invalid admin call: {err:?}"));
                return ADMIN_ERR;
            }
        };
        match result {
            Ok(()) => ADMIN_OK,
            Err(err) => {
                self.logger.error(format_args!("admin call failed: {err:?}"));
                ADMIN_ERR
            }
        }
    }

    #[must_use]
    pub fn security(&self) -> &SecurityList {
        &self.security
    }

    #[must_use]
    pub fn notifier(&self) -> &Nf {
        &self.notifier
    }

    pub fn notifier_mut(&mut self) -> &mut Nf {
        &mut self.notifier
    }

    fn link(&self, id: u8) -> Option<&ClientLink<'r, N, S>> {
        self.clients.iter().find(|l| l.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::i2c::token::Transfer;
    use crate::transport::layout::{request_parts, return_parts_mut};
    use crate::transport::BufferClass;
    use hex_literal::hex;

    type Region = TransportRegion<4, 32>;
    const DRIVER: Channel = 100;

    #[derive(Default)]
    struct Recorder(std::vec::Vec<Channel>);

    impl Notifier for Recorder {
        fn notify(&mut self, channel: Channel) {
            self.0.push(channel);
        }

        fn irq_ack(&mut self, _channel: Channel) {}
    }

    type Server<'r> = I2cServer<'r, Recorder, NoOpLogger, 4, 32, 2>;

    fn server(driver: &Region) -> Server<'_> {
        I2cServer::new(
            driver,
            Recorder::default(),
            ServerConfig {
                driver_channel: DRIVER,
            },
            NoOpLogger,
        )
    }

    fn submit(region: &Region, transfer: Transfer<'_>, addr: u8) {
        TransportContext::init(region, false)
            .client_alloc_request(transfer, false, addr)
            .unwrap();
    }

    #[test]
    fn registration_rules() {
        let (drv, a, b, c) = (Region::new(), Region::new(), Region::new(), Region::new());
        let mut server = server(&drv);
        assert_eq!(server.register_client(1, &a), Ok(()));
        assert_eq!(server.register_client(1, &b), Err(RegistrationError::Duplicate));
        assert_eq!(server.register_client(100, &b), Err(RegistrationError::InvalidId));
        assert_eq!(server.register_client(0x80, &b), Err(RegistrationError::InvalidId));
        assert_eq!(server.register_client(2, &b), Ok(()));
        assert_eq!(server.register_client(3, &c), Err(RegistrationError::TableFull));
        // Registration fills the client's pools.
        let view = TransportContext::init(&a, false);
        assert_eq!(view.free_count(BufferClass::Request), 4);
    }

    #[test]
    fn only_the_owner_reaches_the_driver() {
        let (drv, a, b) = (Region::new(), Region::new(), Region::new());
        let mut server = server(&drv);
        server.register_client(1, &a).unwrap();
        server.register_client(2, &b).unwrap();
        assert_eq!(server.handle_admin(&[1, 0x50, 1]), ADMIN_OK);

        submit(&b, Transfer::Write(&[0xEE]), 0x50);
        server.notified(2);
        let driver_side = TransportContext::init(&drv, false);
        assert!(driver_side.requests_empty());
        assert!(server.notifier().0.is_empty());
        // B's buffer came back to B's pool.
        assert_eq!(TransportContext::init(&b, false).free_count(BufferClass::Request), 4);

        submit(&a, Transfer::Write(&[0xAA]), 0x50);
        server.notified(1);
        assert_eq!(server.notifier().0, vec![DRIVER]);
        let slot = driver_side.pop_request().unwrap();
        let (hdr, tokens) = request_parts(slot.payload()).unwrap();
        assert_eq!((hdr.client, hdr.address), (1, 0x50));
        assert_eq!(tokens, &hex!("02 04 aa 06"));
        driver_side.release(slot).unwrap();
    }

    #[test]
    fn full_driver_pool_drops_and_releases() {
        let (drv, a) = (Region::new(), Region::new());
        let mut server = server(&drv);
        server.register_client(1, &a).unwrap();
        server.claim(0x10, 1).unwrap();

        for _ in 0..4 {
            submit(&a, Transfer::Read(1), 0x10);
        }
        server.notified(1);
        for _ in 0..2 {
            submit(&a, Transfer::Read(1), 0x10);
        }
        server.notified(1);

        let driver_side = TransportContext::init(&drv, false);
        assert_eq!(drv.req_used.len(), 4);
        assert_eq!(driver_side.free_count(BufferClass::Request), 0);
        assert_eq!(TransportContext::init(&a, false).free_count(BufferClass::Request), 4);
        // Second batch was dropped entirely, so the driver was rung once.
        assert_eq!(server.notifier().0, vec![DRIVER]);
    }

    #[test]
    fn completions_route_by_embedded_client_id() {
        let (drv, a, b) = (Region::new(), Region::new(), Region::new());
        let mut server = server(&drv);
        server.register_client(1, &a).unwrap();
        server.register_client(2, &b).unwrap();

        let driver_side = TransportContext::init(&drv, false);
        for (client, err, payload) in [(2u8, 0u8, &[0x12, 0x34][..]), (9, 0, &[]), (1, 1, &[])] {
            let mut slot = driver_side.get_return_slot().unwrap();
            let (hdr, data) = return_parts_mut(slot.bytes_mut()).unwrap();
            hdr.client = client;
            hdr.address = 0x50;
            hdr.error = err;
            hdr.error_token = if err == 0 { 0 } else { 4 };
            data[..payload.len()].copy_from_slice(payload);
            driver_side.push_return(slot, 4 + payload.len()).unwrap();
        }
        server.notified(DRIVER);

        assert_eq!(server.notifier().0, vec![2, 1]);
        assert_eq!(driver_side.free_count(BufferClass::Return), 4);

        let b_side = TransportContext::init(&b, false);
        let slot = b_side.pop_return().unwrap();
        assert_eq!(slot.payload(), &hex!("02 50 00 00 12 34"));
        b_side.release(slot).unwrap();

        let a_side = TransportContext::init(&a, false);
        let slot = a_side.pop_return().unwrap();
        assert_eq!(slot.payload(), &hex!("01 50 01 04"));
        a_side.release(slot).unwrap();
    }

    #[test]
    fn admin_calls_follow_ownership() {
        let (drv, a) = (Region::new(), Region::new());
        let mut server = server(&drv);
        server.register_client(1, &a).unwrap();

        assert_eq!(server.handle_admin(&[1, 0x50, 1]), ADMIN_OK);
        assert_eq!(server.handle_admin(&[1, 0x50, 1]), ADMIN_ERR);
        assert_eq!(server.handle_admin(&[1, 0x51, 5]), ADMIN_ERR);
        assert_eq!(server.handle_admin(&[2, 0x50, 5]), ADMIN_ERR);
        assert_eq!(server.handle_admin(&[2, 0x50, 1]), ADMIN_OK);
        assert_eq!(server.handle_admin(&[1, 200, 1]), ADMIN_ERR);
        assert_eq!(server.handle_admin(&[7, 0x50, 1]), ADMIN_ERR);
        assert_eq!(server.security().owner(0x50), None);
    }
}
