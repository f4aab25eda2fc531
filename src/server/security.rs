// Licensed under the Apache-2.0 license

//! Exclusive ownership of bus addresses.

use crate::transport::layout::I2C_ADDR_MAX;

/// One entry per 7-bit address.
pub const SECURITY_LIST_SZ: usize = I2C_ADDR_MAX as usize + 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SecurityError {
    /// Address already has an owner.
    AlreadyClaimed,
    /// Caller does not own the address.
    NotOwner,
    /// Address outside the 7-bit range.
    InvalidAddress,
    /// Client id has no registered link.
    UnknownClient,
}

/// Owner of each bus address, or `None` when unclaimed.
#[derive(Clone, Debug)]
pub struct SecurityList {
    owners: [Option<u8>; SECURITY_LIST_SZ],
}

impl Default for SecurityList {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityList {
    /// Every address unclaimed.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            owners: [None; SECURITY_LIST_SZ],
        }
    }

    /// # Errors
    ///
    /// [`SecurityError::AlreadyClaimed`] if any client, including `client`
    /// itself, holds `addr`.
    pub fn claim(&mut self, addr: u8, client: u8) -> Result<(), SecurityError> {
        let entry = self
            .owners
            .get_mut(usize::from(addr))
            .ok_or(SecurityError::InvalidAddress)?;
        if entry.is_some() {
            return Err(SecurityError::AlreadyClaimed);
        }
        *entry = Some(client);
        Ok(())
    }

    /// # Errors
    ///
    /// [`SecurityError::NotOwner`] unless `client` currently owns `addr`.
    pub fn release(&mut self, addr: u8, client: u8) -> Result<(), SecurityError> {
        let entry = self
            .owners
            .get_mut(usize::from(addr))
            .ok_or(SecurityError::InvalidAddress)?;
        if *entry != Some(client) {
            return Err(SecurityError::NotOwner);
        }
        *entry = None;
        Ok(())
    }

    #[must_use]
    pub fn owner(&self, addr: u8) -> Option<u8> {
        self.owners.get(usize::from(addr)).copied().flatten()
    }

    /// Whether `client` may address `addr`. Out-of-range addresses are never
    /// owned.
    #[must_use]
    pub fn is_owner(&self, addr: u8, client: u8) -> bool {
        self.owner(addr) == Some(client)
    }
}
