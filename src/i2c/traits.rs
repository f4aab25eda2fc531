// Licensed under the Apache-2.0 license

//! # I2C Hardware Abstraction Traits
//!
//! The driver state machine never dereferences hardware addresses itself. It
//! programs the bus interface through [`I2cRegisters`], which keeps the
//! translation and recovery logic independent of how the register block is
//! reached:
//!
//! ```text
//! I2cRegisters (word-level access)
//!     ├── MmioRegisters (volatile access to a mapped block)
//!     └── any simulated register file (host tests, emulators)
//! ```
//!
//! Field-level meaning lives in [`crate::i2c::registers`]; this trait only
//! moves 32-bit words.

use crate::i2c::registers::Register;

/// Word-level access to one I2C master register block.
///
/// # Examples
///
/// ```rust
/// use i2c_sddf::i2c::registers::{Control, Register};
/// use i2c_sddf::i2c::traits::I2cRegisters;
///
/// fn halt<R: I2cRegisters>(regs: &mut R) {
///     regs.modify(Register::Control, |v| Control(v).with_start(0).0);
/// }
/// ```
pub trait I2cRegisters {
    /// Read the current value of `reg`.
    fn read(&self, reg: Register) -> u32;

    /// Overwrite `reg` with `value`.
    fn write(&mut self, reg: Register, value: u32);

    /// Read-modify-write `reg`.
    ///
    /// Not atomic with respect to the hardware; callers only use it on fields
    /// the list processor does not update concurrently.
    fn modify<F>(&mut self, reg: Register, f: F)
    where
        F: FnOnce(u32) -> u32,
    {
        let value = self.read(reg);
        self.write(reg, f(value));
    }
}

impl<T: I2cRegisters + ?Sized> I2cRegisters for &mut T {
    fn read(&self, reg: Register) -> u32 {
        (**self).read(reg)
    }

    fn write(&mut self, reg: Register, value: u32) {
        (**self).write(reg, value);
    }
}
