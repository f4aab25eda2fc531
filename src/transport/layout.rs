// Licensed under the Apache-2.0 license

//! Byte layout of request and return buffers.
//!
//! ```text
//! request: [client id][target addr][token stream ...]
//! return:  [client id][target addr][error code][error token][payload ...]
//! ```
//!
//! DATA tokens in a write stream are followed inline by their data byte.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const REQ_BUF_CLIENT: usize = 0;
pub const REQ_BUF_ADDR: usize = 1;
pub const REQ_BUF_DAT_OFFSET: usize = 2;

pub const RET_BUF_CLIENT: usize = 0;
pub const RET_BUF_ADDR: usize = 1;
pub const RET_BUF_ERR: usize = 2;
pub const RET_BUF_ERR_TK: usize = 3;
pub const RET_BUF_DAT_OFFSET: usize = 4;

/// Highest valid 7-bit bus address.
pub const I2C_ADDR_MAX: u8 = 0x7F;

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct RequestHeader {
    pub client: u8,
    pub address: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ReturnHeader {
    pub client: u8,
    pub address: u8,
    pub error: u8,
    pub error_token: u8,
}

const _: () = assert!(core::mem::size_of::<RequestHeader>() == REQ_BUF_DAT_OFFSET);
const _: () = assert!(core::mem::size_of::<ReturnHeader>() == RET_BUF_DAT_OFFSET);

/// Split a request buffer into its header and token stream.
#[must_use]
pub fn request_parts(buf: &[u8]) -> Option<(&RequestHeader, &[u8])> {
    RequestHeader::ref_from_prefix(buf).ok()
}

#[must_use]
pub fn request_parts_mut(buf: &mut [u8]) -> Option<(&mut RequestHeader, &mut [u8])> {
    RequestHeader::mut_from_prefix(buf).ok()
}

/// Split a return buffer into its header and payload area.
#[must_use]
pub fn return_parts(buf: &[u8]) -> Option<(&ReturnHeader, &[u8])> {
    ReturnHeader::ref_from_prefix(buf).ok()
}

#[must_use]
pub fn return_parts_mut(buf: &mut [u8]) -> Option<(&mut ReturnHeader, &mut [u8])> {
    ReturnHeader::mut_from_prefix(buf).ok()
}
