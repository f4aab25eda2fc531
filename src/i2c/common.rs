// Licensed under the Apache-2.0 license

//! Common types and constants for the I2C driver, server and clients.
//!
//! This module provides bus configuration (speed and clock dividers), the
//! error codes carried in return buffers, and their mapping onto
//! `embedded-hal` error kinds.

use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource};
use fugit::HertzU32;

/// Default list-processor source clock (clk81).
pub const DEFAULT_SOURCE_CLOCK_HZ: u32 = 166_666_666;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum I2cSpeed {
    Standard = 100_000,
    Fast = 400_000,
    FastPlus = 1_000_000,
}

impl I2cSpeed {
    #[must_use]
    pub const fn frequency(self) -> HertzU32 {
        HertzU32::from_raw(self as u32)
    }
}

/// Manually chosen SCL dividers, bypassing the duty-cycle computation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimingConfig {
    /// SCL high period, in source clock cycles (control register divider).
    pub scl_high_div: u32,
    /// SCL low period, in source clock cycles (address register delay).
    pub scl_low_div: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Divider does not fit its register field.
    DividerOutOfRange,
    /// Filter level does not fit its 3-bit field.
    FilterOutOfRange,
    /// Bus frequency of zero.
    InvalidFrequency,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct I2cConfig {
    pub speed: I2cSpeed,
    pub source_clock: HertzU32,
    pub timing: Option<TimingConfig>,
    pub scl_filter: u8,
    pub sda_filter: u8,
}

impl Default for I2cConfig {
    fn default() -> Self {
        I2cConfigBuilder::new().build()
    }
}

const CLKDIV_MAX: u32 = (1 << 10) - 1;
const SCL_DELAY_MAX: u32 = (1 << 9) - 1;
const FILTER_MAX: u8 = (1 << 3) - 1;

impl I2cConfig {
    /// `(high, low)` SCL dividers for this configuration.
    ///
    /// Without a manual [`TimingConfig`] the period is split 2:3 high to low
    /// (40 % duty), which keeps fast mode inside its minimum low time.
    ///
    /// # Errors
    ///
    /// Fails if the frequency is zero or a divider overflows its field.
    pub fn dividers(&self) -> Result<(u32, u32), ConfigurationError> {
        let (high, low) = match self.timing {
            Some(timing) => (timing.scl_high_div, timing.scl_low_div),
            None => {
                let clk = u64::from(self.source_clock.raw());
                let freq = u64::from(self.speed.frequency().raw());
                if freq == 0 {
                    return Err(ConfigurationError::InvalidFrequency);
                }
                let high = clk * 2 / (freq * 5);
                let low = clk * 3 / (freq * 10);
                (
                    u32::try_from(high).map_err(|_| ConfigurationError::DividerOutOfRange)?,
                    u32::try_from(low).map_err(|_| ConfigurationError::DividerOutOfRange)?,
                )
            }
        };
        if high > CLKDIV_MAX || low > SCL_DELAY_MAX {
            return Err(ConfigurationError::DividerOutOfRange);
        }
        Ok((high, low))
    }

    /// Check every field against its register width.
    ///
    /// # Errors
    ///
    /// See [`ConfigurationError`].
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.scl_filter > FILTER_MAX || self.sda_filter > FILTER_MAX {
            return Err(ConfigurationError::FilterOutOfRange);
        }
        self.dividers().map(|_| ())
    }
}

pub struct I2cConfigBuilder {
    speed: I2cSpeed,
    source_clock: HertzU32,
    timing: Option<TimingConfig>,
    scl_filter: u8,
    sda_filter: u8,
}

impl Default for I2cConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl I2cConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            speed: I2cSpeed::Fast,
            source_clock: HertzU32::from_raw(DEFAULT_SOURCE_CLOCK_HZ),
            timing: None,
            scl_filter: 0,
            sda_filter: 0,
        }
    }
    #[must_use]
    pub fn speed(mut self, speed: I2cSpeed) -> Self {
        self.speed = speed;
        self
    }
    #[must_use]
    pub fn source_clock(mut self, clock: HertzU32) -> Self {
        self.source_clock = clock;
        self
    }
    #[must_use]
    pub fn timing_config(mut self, config: TimingConfig) -> Self {
        self.timing = Some(config);
        self
    }
    #[must_use]
    pub fn scl_filter(mut self, level: u8) -> Self {
        self.scl_filter = level;
        self
    }
    #[must_use]
    pub fn sda_filter(mut self, level: u8) -> Self {
        self.sda_filter = level;
        self
    }
    #[must_use]
    pub fn build(self) -> I2cConfig {
        I2cConfig {
            speed: self.speed,
            source_clock: self.source_clock,
            timing: self.timing,
            scl_filter: self.scl_filter,
            sda_filter: self.sda_filter,
        }
    }
}

/// Status byte stored in a return buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0,
    /// Slave did not acknowledge.
    Nack = 1,
    /// Slave did not acknowledge its read address.
    NoRead = 2,
    /// List processor timed out.
    Timeout = 3,
}

impl ErrorCode {
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => ErrorCode::Ok,
            1 => ErrorCode::Nack,
            2 => ErrorCode::NoRead,
            3 => ErrorCode::Timeout,
            _ => return None,
        })
    }
}

/// Bus-level failure of a completed request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum I2cError {
    /// NACK while executing the given hardware token.
    Nack { token: u8 },
    /// NACK on a read address token.
    NoRead { token: u8 },
    Timeout,
    /// Status byte the client does not understand.
    Unknown(u8),
}

impl I2cError {
    /// `Ok(())` for [`ErrorCode::Ok`], otherwise the matching error.
    ///
    /// # Errors
    ///
    /// Returns the decoded bus error.
    pub fn check(code: u8, token: u8) -> Result<(), Self> {
        match ErrorCode::from_u8(code) {
            Some(ErrorCode::Ok) => Ok(()),
            Some(ErrorCode::Nack) => Err(I2cError::Nack { token }),
            Some(ErrorCode::NoRead) => Err(I2cError::NoRead { token }),
            Some(ErrorCode::Timeout) => Err(I2cError::Timeout),
            None => Err(I2cError::Unknown(code)),
        }
    }
}

impl embedded_hal::i2c::Error for I2cError {
    fn kind(&self) -> ErrorKind {
        match self {
            I2cError::Nack { .. } => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data),
            I2cError::NoRead { .. } => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address),
            I2cError::Timeout | I2cError::Unknown(_) => ErrorKind::Other,
        }
    }
}
