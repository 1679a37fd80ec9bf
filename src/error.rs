//! Error taxonomy shared by every device abstraction in this crate.

use derive_more::{Display, Error};
use embedded_hal::i2c;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors surfaced by pins, the software PWM engine, the PCA9685 client and the actuators.
///
/// Only transient bus failures are retried (once, inside [`Pca9685`](crate::pca9685::Pca9685));
/// everything else reaches the caller as one of these variants.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A caller-supplied value is outside its contractual range.
    #[display("invalid {name}: {value}")]
    InvalidParameter {
        /// Name of the offending parameter.
        name: &'static str,
        /// The rejected value, rendered as text.
        value: String,
    },

    /// PCA9685 channel outside `0..=15`.
    #[display("invalid channel {_0} (expected 0..=15)")]
    InvalidChannel(#[error(not(source))] u8),

    /// The pin or bus session is already owned; release it first.
    #[display("resource busy: {_0}")]
    ResourceBusy(#[error(not(source))] String),

    /// The platform GPIO subsystem or bus device cannot be opened.
    #[display("hardware unavailable: {_0}")]
    HardwareUnavailable(#[error(not(source))] String),

    /// Nothing acknowledged the bus address during initialization.
    #[display("no device acknowledged address {address:#04x}")]
    DeviceNotFound {
        /// 7-bit bus address that was probed.
        address: u8,
    },

    /// Bus transport failure that persisted after the single retry.
    #[display("bus error at address {address:#04x}: {kind:?}")]
    Bus {
        /// 7-bit bus address of the transaction.
        address: u8,
        /// Transport-level error classification.
        kind: i2c::ErrorKind,
    },

    /// A GPIO line read or write failed.
    #[display("pin {pin}: {message}")]
    Pin {
        /// Resolved line offset.
        pin: u32,
        /// Backend error text.
        message: String,
    },

    /// The pin handle has already been released.
    #[display("pin handle already released")]
    PinReleased,

    /// The PCA9685 bus session has been shut down.
    #[display("PCA9685 session already shut down")]
    SessionClosed,

    /// The background PWM thread could not be spawned.
    #[display("failed to spawn background task: {_0}")]
    TaskSpawn(#[error(not(source))] String),

    /// The background PWM thread panicked; the pin was released during unwinding.
    #[display("background task panicked")]
    TaskPanicked,
}

impl Error {
    pub(crate) fn invalid(name: &'static str, value: impl core::fmt::Display) -> Self {
        Self::InvalidParameter {
            name,
            value: value.to_string(),
        }
    }
}

impl embedded_hal::digital::Error for Error {
    fn kind(&self) -> embedded_hal::digital::ErrorKind {
        embedded_hal::digital::ErrorKind::Other
    }
}
