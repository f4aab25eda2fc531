// Licensed under the Apache-2.0 license

// Prevent panic-prone patterns in production code only
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::indexing_slicing))]
#![cfg_attr(not(test), warn(clippy::expect_used))]
#![cfg_attr(not(test), no_std)]

//! Split I2C subsystem for a microkernel platform.
//!
//! ```text
//! client --(link)--> server --(link)--> driver --> list-processor master
//!        <---------         <---------
//! ```
//!
//! - [`transport`]: shared-memory rings and buffer pools, one per link.
//! - [`i2c`]: token codec, register model and the driver state machine.
//! - [`server`]: address ownership and request multiplexing.
//! - [`client`]: request submission, plus an `embedded-hal` blocking bus.

pub mod client;
pub mod common;
pub mod i2c;
pub mod server;
pub mod transport;
