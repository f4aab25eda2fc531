// Licensed under the Apache-2.0 license

//! Administrative call format.
//!
//! Claims and releases arrive as synchronous calls carrying three message
//! registers:
//!
//! | MR | content                             |
//! |----|-------------------------------------|
//! | 0  | request type (1 claim, 2 release)   |
//! | 1  | 7-bit bus address                   |
//! | 2  | client id                           |
//!
//! The reply is a single register: [`ADMIN_OK`] or [`ADMIN_ERR`].

use crate::transport::layout::I2C_ADDR_MAX;

/// Message register word.
pub type MessageWord = u64;

pub const MR_REQTYPE: usize = 0;
pub const MR_ADDR: usize = 1;
pub const MR_CLIENT: usize = 2;

pub const ADMIN_CLAIM: MessageWord = 1;
pub const ADMIN_RELEASE: MessageWord = 2;

pub const ADMIN_OK: MessageWord = 0;
/// `-1` as an unsigned word.
pub const ADMIN_ERR: MessageWord = MessageWord::MAX;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AdminRequest {
    Claim { addr: u8, client: u8 },
    Release { addr: u8, client: u8 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AdminError {
    /// Fewer than three message registers.
    Truncated,
    /// Request type is neither claim nor release.
    InvalidRequest(MessageWord),
    /// Address outside 0..=127.
    InvalidAddress(MessageWord),
    /// Client id does not fit a request header byte.
    InvalidClient(MessageWord),
}

impl AdminRequest {
    /// # Errors
    ///
    /// See [`AdminError`].
    pub fn decode(mrs: &[MessageWord]) -> Result<Self, AdminError> {
        let word = |i: usize| mrs.get(i).copied().ok_or(AdminError::Truncated);
        let (kind, addr, client) = (word(MR_REQTYPE)?, word(MR_ADDR)?, word(MR_CLIENT)?);

        let addr = u8::try_from(addr)
            .ok()
            .filter(|&a| a <= I2C_ADDR_MAX)
            .ok_or(AdminError::InvalidAddress(addr))?;
        let client = u8::try_from(client).map_err(|_| AdminError::InvalidClient(client))?;
        match kind {
            ADMIN_CLAIM => Ok(AdminRequest::Claim { addr, client }),
            ADMIN_RELEASE => Ok(AdminRequest::Release { addr, client }),
            other => Err(AdminError::InvalidRequest(other)),
        }
    }

    #[must_use]
    pub fn encode(self) -> [MessageWord; 3] {
        match self {
            AdminRequest::Claim { addr, client } => {
                [ADMIN_CLAIM, MessageWord::from(addr), MessageWord::from(client)]
            }
            AdminRequest::Release { addr, client } => {
                [ADMIN_RELEASE, MessageWord::from(addr), MessageWord::from(client)]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_both_request_types() {
        assert_eq!(
            AdminRequest::decode(&[1, 0x50, 3]),
            Ok(AdminRequest::Claim { addr: 0x50, client: 3 })
        );
        assert_eq!(
            AdminRequest::decode(&[2, 0x7F, 0]),
            Ok(AdminRequest::Release { addr: 0x7F, client: 0 })
        );
        let req = AdminRequest::Release { addr: 9, client: 2 };
        assert_eq!(AdminRequest::decode(&req.encode()), Ok(req));
    }

    #[test]
    fn rejects_malformed_calls() {
        assert_eq!(AdminRequest::decode(&[1, 0x50]), Err(AdminError::Truncated));
        assert_eq!(AdminRequest::decode(&[3, 0x50, 1]), Err(AdminError::InvalidRequest(3)));
        assert_eq!(AdminRequest::decode(&[1, 128, 1]), Err(AdminError::InvalidAddress(128)));
        assert_eq!(
            AdminRequest::decode(&[1, 0x10, 0x1_00]),
            Err(AdminError::InvalidClient(0x100))
        );
    }
}
