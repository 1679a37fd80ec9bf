//! A device abstraction for exclusively owned GPIO lines.
//!
//! A [`Gpio`] wraps a platform [`GpioBackend`] and tracks which lines are owned.
//! [`Gpio::acquire`] hands out a [`PinHandle`], the only way to drive or read a line.
//! The handle releases the line on drop, so every exit path (early return, `?`,
//! panic unwinding) leaves the line Low and back in the backend's inert state.
//!
//! See [`Gpio`] for a usage example.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ============================================================================
// Pin description
// ============================================================================

/// Logic level of a digital line.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Level {
    /// Line driven or read low.
    Low,
    /// Line driven or read high.
    High,
}

impl Level {
    /// Returns `true` for [`Level::High`].
    #[must_use]
    pub const fn is_high(self) -> bool {
        matches!(self, Self::High)
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Self::High } else { Self::Low }
    }
}

impl core::ops::Not for Level {
    type Output = Self;

    fn not(self) -> Self {
        match self {
            Self::Low => Self::High,
            Self::High => Self::Low,
        }
    }
}

/// How a pin number is interpreted.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Numbering {
    /// Physical header position on the board.
    Board,
    /// Line offset on the SoC's GPIO controller.
    Soc,
}

/// Direction a line is requested in.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Direction {
    /// Input; [`PinHandle::read`] is valid.
    In,
    /// Output; [`PinHandle::set`] is valid.
    Out,
}

/// Identifies one line and how it should be requested. Immutable once acquired.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct PinSpec {
    /// Pin number, interpreted according to `numbering`.
    pub pin: u32,
    /// Numbering mode for `pin`.
    pub numbering: Numbering,
    /// Requested direction.
    pub direction: Direction,
}

impl PinSpec {
    /// Create a pin specification.
    #[must_use]
    pub const fn new(pin: u32, numbering: Numbering, direction: Direction) -> Self {
        Self {
            pin,
            numbering,
            direction,
        }
    }

    /// Output on a physical board pin.
    #[must_use]
    pub const fn output(pin: u32) -> Self {
        Self::new(pin, Numbering::Board, Direction::Out)
    }

    /// Input on a physical board pin.
    #[must_use]
    pub const fn input(pin: u32) -> Self {
        Self::new(pin, Numbering::Board, Direction::In)
    }
}

// ============================================================================
// Backend traits
// ============================================================================

/// One opened GPIO line, as provided by a [`GpioBackend`].
pub trait GpioLine: Send + 'static {
    /// Drive the line.
    ///
    /// # Errors
    /// Returns [`Error::Pin`] if the platform rejects the write.
    fn set_level(&mut self, level: Level) -> Result<()>;

    /// Sample the line.
    ///
    /// # Errors
    /// Returns [`Error::Pin`] if the platform rejects the read.
    fn level(&mut self) -> Result<Level>;

    /// Return the line to an inert, floating-safe state and give it back to the platform.
    ///
    /// # Errors
    /// Returns [`Error::Pin`] if the platform rejects the release.
    fn release(&mut self) -> Result<()>;
}

/// Platform GPIO capability: resolves pin numbers and opens lines.
pub trait GpioBackend: Send + Sync + 'static {
    /// Line type produced by [`open`](Self::open).
    type Line: GpioLine;

    /// Resolve a pin number to the SoC line offset used for ownership tracking.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] for a pin the platform does not expose.
    fn line_offset(&self, pin: u32, numbering: Numbering) -> Result<u32>;

    /// Open a line in the requested direction.
    ///
    /// # Errors
    /// Returns [`Error::HardwareUnavailable`] if the GPIO subsystem cannot be opened.
    fn open(&self, offset: u32, direction: Direction) -> Result<Self::Line>;
}

// ============================================================================
// Gpio - ownership registry
// ============================================================================

type OwnedLines = Arc<Mutex<HashSet<u32>>>;

/// Hands out exclusive [`PinHandle`]s over one platform GPIO backend.
///
/// Cloning a `Gpio` shares the backend and the ownership table, so a line acquired
/// through one clone is busy for every other clone.
///
/// # Example
///
/// ```rust
/// use pwm_kit::gpio::{Gpio, Level, PinSpec};
/// use pwm_kit::mock::MockGpio;
///
/// # fn main() -> pwm_kit::Result<()> {
/// let gpio = Gpio::new(MockGpio::new());
/// {
///     let mut led = gpio.acquire(PinSpec::output(33))?;
///     led.set(Level::High)?;
///     assert!(gpio.acquire(PinSpec::output(33)).is_err()); // already owned
/// } // released here: driven Low, returned to the platform
/// assert!(!gpio.is_owned(PinSpec::output(33))?);
/// # Ok(())
/// # }
/// ```
pub struct Gpio<B> {
    backend: Arc<B>,
    owned: OwnedLines,
}

impl<B> Clone for Gpio<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            owned: Arc::clone(&self.owned),
        }
    }
}

impl<B: GpioBackend> Gpio<B> {
    /// Wrap a platform backend.
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            owned: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Acquire exclusive ownership of a line.
    ///
    /// Output lines start Low.
    ///
    /// # Errors
    /// - [`Error::ResourceBusy`] if the resolved line is already owned.
    /// - [`Error::HardwareUnavailable`] if the backend cannot open the line.
    /// - [`Error::InvalidParameter`] if the pin number does not resolve.
    pub fn acquire(&self, spec: PinSpec) -> Result<PinHandle<B::Line>> {
        let offset = self.backend.line_offset(spec.pin, spec.numbering)?;
        let mut owned = self.owned.lock().unwrap_or_else(PoisonError::into_inner);
        if owned.contains(&offset) {
            return Err(Error::ResourceBusy(format!(
                "pin {} (line {offset}) is already owned",
                spec.pin
            )));
        }
        let mut line = self.backend.open(offset, spec.direction)?;
        if spec.direction == Direction::Out {
            if let Err(err) = line.set_level(Level::Low) {
                // Best effort: hand the line back before reporting.
                let _ = line.release();
                return Err(err);
            }
        }
        owned.insert(offset);
        info!(
            "gpio: acquired pin {} ({:?}) as line {offset}, {:?}",
            spec.pin, spec.numbering, spec.direction
        );
        Ok(PinHandle {
            spec,
            offset,
            line: Some(line),
            last_written: Level::Low,
            owned: Arc::clone(&self.owned),
        })
    }

    /// Returns whether the line behind `spec` is currently owned.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] if the pin number does not resolve.
    pub fn is_owned(&self, spec: PinSpec) -> Result<bool> {
        let offset = self.backend.line_offset(spec.pin, spec.numbering)?;
        Ok(self
            .owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&offset))
    }

    /// The wrapped backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

// ============================================================================
// PinHandle
// ============================================================================

/// Exclusive ownership of one GPIO line. Released on drop.
///
/// Also usable as an `embedded-hal` [`OutputPin`](embedded_hal::digital::OutputPin) /
/// [`InputPin`](embedded_hal::digital::InputPin).
///
/// See [`Gpio`] for a usage example.
pub struct PinHandle<L: GpioLine> {
    spec: PinSpec,
    offset: u32,
    line: Option<L>,
    last_written: Level,
    owned: OwnedLines,
}

impl<L: GpioLine> PinHandle<L> {
    /// The [`PinSpec`] this handle was acquired with.
    #[must_use]
    pub const fn spec(&self) -> PinSpec {
        self.spec
    }

    /// Resolved SoC line offset.
    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Returns whether [`release`](Self::release) has already run.
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.line.is_none()
    }

    /// Drive the line.
    ///
    /// # Errors
    /// - [`Error::InvalidParameter`] if the pin was acquired as an input.
    /// - [`Error::PinReleased`] after [`release`](Self::release).
    /// - [`Error::Pin`] if the backend write fails.
    pub fn set(&mut self, level: Level) -> Result<()> {
        if self.spec.direction != Direction::Out {
            return Err(Error::invalid("direction for set", "pin is an input"));
        }
        let line = self.line.as_mut().ok_or(Error::PinReleased)?;
        line.set_level(level)?;
        self.last_written = level;
        Ok(())
    }

    /// Invert the last level written.
    ///
    /// # Errors
    /// Same as [`set`](Self::set).
    pub fn toggle(&mut self) -> Result<()> {
        self.set(!self.last_written)
    }

    /// Sample the line.
    ///
    /// # Errors
    /// - [`Error::InvalidParameter`] if the pin was acquired as an output.
    /// - [`Error::PinReleased`] after [`release`](Self::release).
    /// - [`Error::Pin`] if the backend read fails.
    pub fn read(&mut self) -> Result<Level> {
        if self.spec.direction != Direction::In {
            return Err(Error::invalid("direction for read", "pin is an output"));
        }
        self.line.as_mut().ok_or(Error::PinReleased)?.level()
    }

    /// Drive the line Low (outputs), return it to the platform and drop ownership.
    ///
    /// Idempotent: later calls are no-ops. Ownership is dropped even if the backend
    /// reports an error, so the line can be acquired again.
    ///
    /// # Errors
    /// Returns the first backend error from driving Low or releasing.
    pub fn release(&mut self) -> Result<()> {
        let Some(mut line) = self.line.take() else {
            return Ok(());
        };
        let low = if self.spec.direction == Direction::Out {
            line.set_level(Level::Low)
        } else {
            Ok(())
        };
        let released = line.release();
        self.owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.offset);
        debug!("gpio: released pin {} (line {})", self.spec.pin, self.offset);
        low.and(released)
    }
}

impl<L: GpioLine> Drop for PinHandle<L> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!("gpio: releasing pin {} on drop failed: {err}", self.spec.pin);
        }
    }
}

impl<L: GpioLine> embedded_hal::digital::ErrorType for PinHandle<L> {
    type Error = Error;
}

impl<L: GpioLine> embedded_hal::digital::OutputPin for PinHandle<L> {
    fn set_low(&mut self) -> Result<()> {
        self.set(Level::Low)
    }

    fn set_high(&mut self) -> Result<()> {
        self.set(Level::High)
    }
}

impl<L: GpioLine> embedded_hal::digital::InputPin for PinHandle<L> {
    fn is_high(&mut self) -> Result<bool> {
        Ok(self.read()?.is_high())
    }

    fn is_low(&mut self) -> Result<bool> {
        Ok(!self.read()?.is_high())
    }
}
