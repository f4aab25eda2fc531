// Licensed under the Apache-2.0 license

//! Register model of the list-processor I2C master.
//!
//! Each register that carries packed fields gets a newtype with one getter
//! and one `with_*` builder per field, plus `*_SHIFT` / `*_MASK` constants,
//! so bit positions live in exactly one place and can be tested off-target.

use super::traits::I2cRegisters;
use core::ptr::NonNull;

/// Register offsets within one master interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Register {
    Control = 0x00,
    SlaveAddr = 0x04,
    TokenList0 = 0x08,
    TokenList1 = 0x0C,
    WriteData0 = 0x10,
    WriteData1 = 0x14,
    ReadData0 = 0x18,
    ReadData1 = 0x1C,
}

impl Register {
    pub const ALL: [Register; 8] = [
        Register::Control,
        Register::SlaveAddr,
        Register::TokenList0,
        Register::TokenList1,
        Register::WriteData0,
        Register::WriteData1,
        Register::ReadData0,
        Register::ReadData1,
    ];

    /// Index of the register as a 32-bit word.
    #[must_use]
    pub const fn word(self) -> usize {
        self as usize / 4
    }
}

macro_rules! register_fields {
    ($reg:ident { $( $(#[$doc:meta])* $field:ident : $shift:literal, $width:literal; )* }) => {
        impl $reg {
            paste::paste! {
                $(
                    #[doc = concat!("Bit offset of `", stringify!($field), "`.")]
                    pub const [<$field:upper _SHIFT>]: u32 = $shift;
                    #[doc = concat!("In-place mask of `", stringify!($field), "`.")]
                    pub const [<$field:upper _MASK>]: u32 = ((1u32 << $width) - 1) << $shift;

                    $(#[$doc])*
                    #[must_use]
                    pub const fn $field(self) -> u32 {
                        (self.0 & Self::[<$field:upper _MASK>]) >> $shift
                    }

                    #[must_use]
                    pub const fn [<with_ $field>](self, value: u32) -> Self {
                        Self((self.0 & !Self::[<$field:upper _MASK>])
                            | ((value << $shift) & Self::[<$field:upper _MASK>]))
                    }
                )*
            }
        }
    };
}

/// Control register.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Control(pub u32);

register_fields!(Control {
    /// Bit 0: writing 1 starts the list processor, 0 halts it.
    start: 0, 1;
    /// Bit 1: ignore slave NACKs.
    ack_ignore: 1, 1;
    /// Bit 2: list processor busy.
    status: 2, 1;
    /// Bit 3: the last list ended on a NACK.
    error: 3, 1;
    /// Bits 4..8: token the list processor was executing when it stopped.
    curr_token: 4, 4;
    /// Bits 8..12: bytes latched into the read-data registers.
    rd_count: 8, 4;
    /// Bits 12..22: SCL high-period clock divider.
    clkdiv: 12, 10;
    /// Bit 22: manual (bit-bang) mode.
    manual: 22, 1;
    /// Bit 31: bypass dynamic clock gating.
    cntl_jic: 31, 1;
});

/// Slave address register.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SlaveAddr(pub u32);

register_fields!(SlaveAddr {
    /// Bits 1..8: 7-bit target address (the hardware expects it shifted left by one).
    address: 1, 7;
    /// Bits 8..11: SDA glitch filter.
    sda_filter: 8, 3;
    /// Bits 11..14: SCL glitch filter.
    scl_filter: 11, 3;
    /// Bits 16..25: SCL low-period delay.
    scl_delay: 16, 9;
    /// Bit 28: use `scl_delay` for the low period.
    scl_delay_enable: 28, 1;
});

/// Outcome the list processor reports when it stops.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListStatus {
    /// Finished; `count` bytes were read (0 for a write).
    Done { count: usize },
    /// Stopped on a NACK while executing the hardware token `token`.
    Nack { token: u8 },
}

impl Control {
    #[must_use]
    pub const fn list_status(self) -> ListStatus {
        if self.error() != 0 {
            ListStatus::Nack {
                token: self.curr_token() as u8,
            }
        } else {
            ListStatus::Done {
                count: self.rd_count() as usize,
            }
        }
    }
}

/// Memory-mapped register block of one master interface.
pub struct MmioRegisters {
    base: NonNull<u32>,
}

// SAFETY: the block is owned by exactly one driver instance.
unsafe impl Send for MmioRegisters {}

impl MmioRegisters {
    /// # Safety
    ///
    /// `base` must be the mapped base of an I2C master register block that
    /// nothing else accesses for the lifetime of the returned value.
    #[must_use]
    pub const unsafe fn new(base: NonNull<u32>) -> Self {
        Self { base }
    }
}

impl I2cRegisters for MmioRegisters {
    fn read(&self, reg: Register) -> u32 {
        // SAFETY: `reg.word()` is within the register block per `new`.
        unsafe { self.base.as_ptr().add(reg.word()).read_volatile() }
    }

    fn write(&mut self, reg: Register, value: u32) {
        // SAFETY: as for `read`.
        unsafe { self.base.as_ptr().add(reg.word()).write_volatile(value) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_fields() {
        let ctl = Control(0)
            .with_start(1)
            .with_error(1)
            .with_curr_token(0x3)
            .with_rd_count(5)
            .with_clkdiv(154)
            .with_cntl_jic(1);
        assert_eq!(ctl.0, 0x8009_A539);
        assert_eq!(ctl.start(), 1);
        assert_eq!(ctl.curr_token(), 3);
        assert_eq!(ctl.rd_count(), 5);
        assert_eq!(ctl.clkdiv(), 154);
        assert_eq!(Control::CLKDIV_MASK, 0x003F_F000);
        assert_eq!(Control::RD_COUNT_SHIFT, 8);
    }

    #[test]
    fn builders_truncate_to_field_width() {
        let ctl = Control(0).with_curr_token(0x1F);
        assert_eq!(ctl.curr_token(), 0xF);
        assert_eq!(ctl.rd_count(), 0);
        let addr = SlaveAddr(u32::MAX).with_address(0x50);
        assert_eq!(addr.address(), 0x50);
        assert_eq!(addr.0 & 0xFF, 0xA0);
        assert_eq!(addr.scl_delay(), 0x1FF);
    }

    #[test]
    fn list_status_decoding() {
        let ok_read = Control(0).with_rd_count(4);
        assert_eq!(ok_read.list_status(), ListStatus::Done { count: 4 });
        let nack = Control(0).with_error(1).with_curr_token(2).with_rd_count(1);
        assert_eq!(nack.list_status(), ListStatus::Nack { token: 2 });
    }

    #[test]
    fn mmio_accesses_word_offsets() {
        let mut block = [0u32; 8];
        let mut regs = unsafe { MmioRegisters::new(NonNull::new(block.as_mut_ptr()).unwrap()) };
        regs.write(Register::WriteData1, 0xDEAD_BEEF);
        regs.write(Register::Control, 1);
        assert_eq!(regs.read(Register::WriteData1), 0xDEAD_BEEF);
        drop(regs);
        assert_eq!(block[5], 0xDEAD_BEEF);
        assert_eq!(block[0], 1);
    }
}
