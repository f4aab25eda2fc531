// Licensed under the Apache-2.0 license

//! I2C driver module.
//!
//! Bus configuration, the portable-to-hardware token codec, the register
//! model of the list-processor master and the driver state machine that ties
//! them to the transport.

pub mod common;
pub mod driver;
pub mod registers;
pub mod token;
pub mod traits;

pub use common::{I2cConfig, I2cConfigBuilder, I2cError, I2cSpeed};
pub use driver::{DriverChannels, DriverEvent, I2cDriver};
