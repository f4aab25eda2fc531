// Licensed under the Apache-2.0 license

//! Shared-memory transport between clients, the server and the driver.
//!
//! Every link is one [`TransportRegion`]: four single-producer,
//! single-consumer descriptor rings plus a pool of fixed-size buffers.
//! Descriptors carry pool offsets, never pointers, so each end may map the
//! region at a different address.

pub mod context;
pub mod layout;
pub mod region;
pub mod ring;

pub use context::{Rejected, TransportContext, TransportError};
pub use region::{BufferClass, Slot, TransportRegion, I2C_BUF_COUNT, I2C_BUF_SZ};
pub use ring::{Descriptor, Ring, RingError};
