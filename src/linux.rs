//! Linux hardware backends: character-device GPIO and `/dev/i2c-N` buses.
//!
//! Enabled by the `linux` feature.

use std::collections::HashMap;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use gpio_cdev::errors::Error as CdevError;
use gpio_cdev::{Chip, LineHandle, LineRequestFlags};
use linux_embedded_hal::I2cdev;
use log::{debug, info};

use crate::gpio::{Direction, GpioBackend, GpioLine, Level, Numbering};
use crate::{Error, Result};

/// Default consumer label shown by `gpioinfo` for lines this crate holds.
pub const CONSUMER_DEFAULT: &str = "pwm-kit";

/// A GPIO controller reached through `/dev/gpiochipN`.
///
/// Releasing a line drops its request, and the kernel returns it to an input.
pub struct CdevGpio {
    chip: Mutex<Chip>,
    board_map: HashMap<u32, u32>,
    consumer: String,
}

impl CdevGpio {
    /// Open a GPIO character device such as `/dev/gpiochip0`.
    ///
    /// Without a board map only [`Numbering::Soc`] pins resolve.
    ///
    /// # Errors
    /// Returns [`Error::HardwareUnavailable`] if the device cannot be opened.
    pub fn open(path: &str) -> Result<Self> {
        let chip = Chip::new(path)
            .map_err(|err| Error::HardwareUnavailable(format!("{path}: {err}")))?;
        info!("gpio: opened {path} ({} lines)", chip.num_lines());
        Ok(Self {
            chip: Mutex::new(chip),
            board_map: HashMap::new(),
            consumer: CONSUMER_DEFAULT.to_owned(),
        })
    }

    /// Resolve [`Numbering::Board`] pins through `map` (`header pin -> line offset`).
    #[must_use]
    pub fn with_board_map(mut self, map: impl IntoIterator<Item = (u32, u32)>) -> Self {
        self.board_map.extend(map);
        self
    }

    /// Label requested lines with `consumer`.
    #[must_use]
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }
}

impl GpioBackend for CdevGpio {
    type Line = CdevLine;

    fn line_offset(&self, pin: u32, numbering: Numbering) -> Result<u32> {
        match numbering {
            Numbering::Soc => Ok(pin),
            Numbering::Board => self
                .board_map
                .get(&pin)
                .copied()
                .ok_or_else(|| Error::invalid("board pin", pin)),
        }
    }

    fn open(&self, offset: u32, direction: Direction) -> Result<CdevLine> {
        let mut chip = self.chip.lock().unwrap_or_else(PoisonError::into_inner);
        let unavailable =
            |err: CdevError| Error::HardwareUnavailable(format!("line {offset}: {err}"));
        let line = chip.get_line(offset).map_err(unavailable)?;
        let flags = match direction {
            Direction::Out => LineRequestFlags::OUTPUT,
            Direction::In => LineRequestFlags::INPUT,
        };
        let handle = line.request(flags, 0, &self.consumer).map_err(unavailable)?;
        debug!("gpio: requested line {offset} as {direction:?}");
        Ok(CdevLine {
            offset,
            handle: Some(handle),
        })
    }
}

/// One requested line on a [`CdevGpio`].
pub struct CdevLine {
    offset: u32,
    handle: Option<LineHandle>,
}

impl CdevLine {
    fn handle(&self) -> Result<&LineHandle> {
        self.handle.as_ref().ok_or(Error::PinReleased)
    }

    fn pin_error(&self, err: &CdevError) -> Error {
        Error::Pin {
            pin: self.offset,
            message: err.to_string(),
        }
    }
}

impl GpioLine for CdevLine {
    fn set_level(&mut self, level: Level) -> Result<()> {
        self.handle()?
            .set_value(u8::from(level.is_high()))
            .map_err(|err| self.pin_error(&err))
    }

    fn level(&mut self) -> Result<Level> {
        let value = self.handle()?.get_value().map_err(|err| self.pin_error(&err))?;
        Ok(Level::from(value != 0))
    }

    fn release(&mut self) -> Result<()> {
        self.handle = None;
        Ok(())
    }
}

// I2C_TIMEOUT from <linux/i2c-dev.h>; the argument counts 10 ms units.
const I2C_TIMEOUT: libc::c_ulong = 0x0702;
const I2C_TIMEOUT_UNIT_MS: u128 = 10;

/// Open `/dev/i2c-{bus}` for use with [`Pca9685`](crate::pca9685::Pca9685).
///
/// `io_timeout` (normally [`Pca9685Config::io_timeout`](crate::pca9685::Pca9685Config))
/// becomes the adapter's transfer timeout, rounded up to 10 ms. A transfer that runs
/// past it fails with a bus error.
///
/// # Errors
/// Returns [`Error::HardwareUnavailable`] if the device cannot be opened or refuses
/// the timeout.
pub fn open_i2c_bus(bus: u8, io_timeout: Duration) -> Result<I2cdev> {
    let path = format!("/dev/i2c-{bus}");
    let dev = I2cdev::new(&path)
        .map_err(|err| Error::HardwareUnavailable(format!("{path}: {err}")))?;
    set_transfer_timeout(&dev, io_timeout)
        .map_err(|err| Error::HardwareUnavailable(format!("{path}: I2C_TIMEOUT: {err}")))?;
    info!("i2c: opened {path} (timeout {io_timeout:?})");
    Ok(dev)
}

fn timeout_units(timeout: Duration) -> libc::c_ulong {
    let units = timeout.as_millis().div_ceil(I2C_TIMEOUT_UNIT_MS);
    units.clamp(1, u128::from(u32::MAX)) as libc::c_ulong
}

fn set_transfer_timeout(dev: &I2cdev, timeout: Duration) -> io::Result<()> {
    let units = timeout_units(timeout);
    // SAFETY: I2C_TIMEOUT takes its argument by value and the fd stays open for the call.
    #[expect(unsafe_code, reason = "no safe wrapper exposes I2C_TIMEOUT")]
    let status = unsafe { libc::ioctl(dev.as_raw_fd(), I2C_TIMEOUT as _, units) };
    if status < 0 {
        return Err(io::Error::last_os_error());
    }
    debug!("i2c: transfer timeout {units} x 10 ms");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_rounds_up_to_whole_units() {
        assert_eq!(timeout_units(Duration::from_millis(30)), 3);
        assert_eq!(timeout_units(Duration::from_millis(25)), 3);
        assert_eq!(timeout_units(Duration::from_micros(1)), 1);
        assert_eq!(timeout_units(Duration::ZERO), 1);
    }
}
