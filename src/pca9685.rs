//! A client for the PCA9685 16-channel, 12-bit PWM driver chip.
//!
//! The chip sits on a shared I2C bus, reached through any `embedded-hal` 1.0
//! [`I2c`] implementation. [`Pca9685`] programs the prescaler once at
//! initialization, then writes each channel's on/off tick window in a single
//! auto-incremented bus transaction. The register math lives in [`registers`] and
//! has no bus dependency.
//!
//! Bus failures get one retry after a short backoff. A second failure is reported
//! as [`Error::Bus`], after a best-effort pass that turns every channel off.
//!
//! See [`Pca9685`] for a usage example.

pub mod registers;

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use embedded_hal::i2c::{Error as _, ErrorKind, I2c};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::output::{AngleOutput, DutyOutput};
use crate::{Error, Result};
use registers::{
    CHANNEL_COUNT, ChannelProgram, DEFAULT_ADDRESS, MODE1, MODE1_AI, MODE1_ALLCALL,
    MODE1_RESTART, MODE1_SLEEP, MODE2, MODE2_OUTDRV, MODE2_RESERVED_MASK, OSCILLATOR_HZ_DEFAULT,
    PRE_SCALE, PRESCALE_MIN, ServoAngleMap,
};

/// Default PWM frequency (Hz), suited to hobby servos.
pub const FREQUENCY_HZ_DEFAULT: f64 = 50.0;

/// Default pause before retrying a failed bus transaction.
pub const RETRY_BACKOFF_DEFAULT: Duration = Duration::from_millis(2);

/// Default bound on one bus transfer.
pub const IO_TIMEOUT_DEFAULT: Duration = Duration::from_millis(30);

// The oscillator needs 500 µs after leaving sleep before RESTART may be set.
const OSCILLATOR_SETTLE: Duration = Duration::from_millis(1);

// ============================================================================
// Configuration
// ============================================================================

/// Settings fixed for the lifetime of one [`Pca9685`] session.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pca9685Config {
    /// 7-bit bus address.
    pub address: u8,
    /// Target PWM frequency; sets the prescaler and the nominal period.
    pub frequency_hz: f64,
    /// Chip oscillator frequency.
    pub oscillator_hz: u32,
    /// Angle-to-pulse mapping for [`Pca9685::set_servo_angle`].
    pub angle_map: ServoAngleMap,
    /// Pause before the single retry of a failed transaction.
    pub retry_backoff: Duration,
    /// Bound on one bus transfer. The transport enforces it (see
    /// `linux::open_i2c_bus`); a timed-out transfer fails like any other bus error and
    /// gets the single retry. Successful transfers slower than this are logged.
    pub io_timeout: Duration,
}

impl Default for Pca9685Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            frequency_hz: FREQUENCY_HZ_DEFAULT,
            oscillator_hz: OSCILLATOR_HZ_DEFAULT,
            angle_map: ServoAngleMap::default(),
            retry_backoff: RETRY_BACKOFF_DEFAULT,
            io_timeout: IO_TIMEOUT_DEFAULT,
        }
    }
}

/// Register values read by [`Pca9685::probe`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChipFingerprint {
    /// MODE1 register.
    pub mode1: u8,
    /// MODE2 register.
    pub mode2: u8,
    /// PRE_SCALE register.
    pub prescale: u8,
    /// Output frequency implied by `prescale` with the reference oscillator.
    pub frequency_hz: f64,
}

// ============================================================================
// Bus session with the retry policy
// ============================================================================

struct Session<'a, I2C> {
    bus: &'a mut I2C,
    address: u8,
    backoff: Duration,
    timeout: Duration,
}

impl<I2C: I2c> Session<'_, I2C> {
    fn with_retry<T>(
        &mut self,
        mut op: impl FnMut(&mut I2C, u8) -> Result<T, I2C::Error>,
    ) -> Result<T> {
        let started = Instant::now();
        match op(&mut *self.bus, self.address) {
            Ok(value) => {
                let elapsed = started.elapsed();
                if elapsed > self.timeout {
                    warn!(
                        "pca9685 addr={:#04x}: transfer took {elapsed:?} (timeout {:?})",
                        self.address, self.timeout
                    );
                }
                Ok(value)
            }
            Err(first) => {
                warn!(
                    "pca9685 addr={:#04x}: bus error {:?}, retrying once",
                    self.address,
                    first.kind()
                );
                thread::sleep(self.backoff);
                op(&mut *self.bus, self.address).map_err(|second| Error::Bus {
                    address: self.address,
                    kind: second.kind(),
                })
            }
        }
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<()> {
        self.with_retry(|bus, address| bus.write(address, &[register, value]))
    }

    fn read_register(&mut self, register: u8) -> Result<u8> {
        let mut buffer = [0_u8];
        self.with_retry(|bus, address| bus.write_read(address, &[register], &mut buffer))?;
        let [value] = buffer;
        Ok(value)
    }

    fn write_program(&mut self, program: ChannelProgram) -> Result<()> {
        let [on_l, on_h, off_l, off_h] = program.to_le_bytes();
        let frame = [program.register(), on_l, on_h, off_l, off_h];
        self.with_retry(|bus, address| bus.write(address, &frame))
    }

    fn read_program(&mut self, channel: u8) -> Result<ChannelProgram> {
        let register = registers::channel_register(channel)?;
        let mut buffer = [0_u8; 4];
        self.with_retry(|bus, address| bus.write_read(address, &[register], &mut buffer))?;
        ChannelProgram::from_le_bytes(channel, buffer)
    }

    /// Turn every channel off, attempting all of them; returns the first error.
    fn zero_all(&mut self) -> Result<()> {
        let mut outcome = Ok(());
        for channel in 0..CHANNEL_COUNT {
            let written = ChannelProgram::off(channel).and_then(|off| self.write_program(off));
            if outcome.is_ok() {
                outcome = written;
            }
        }
        outcome
    }

    /// One unretried pass turning every channel off; used after a fatal error.
    fn zero_all_best_effort(&mut self) {
        let mut failures = 0_u32;
        for channel in 0..CHANNEL_COUNT {
            let frame = [registers::LED0_ON_L + 4 * channel, 0, 0, 0, 0];
            if self.bus.write(self.address, &frame).is_err() {
                failures += 1;
            }
        }
        if failures > 0 {
            error!(
                "pca9685 addr={:#04x}: safe-off pass failed on {failures} channels",
                self.address
            );
        }
    }
}

// ============================================================================
// Pca9685
// ============================================================================

/// Client for one PCA9685 chip.
///
/// All methods take `&self`; bus transactions are serialized by an internal lock, so
/// one client can be shared (`Arc<Pca9685<_>>`) by several actuators and threads.
/// [`shutdown`](Self::shutdown) (or drop) turns every channel off, puts the chip to
/// sleep and releases the bus.
///
/// # Example
///
/// ```rust
/// use pwm_kit::mock::MockPca9685;
/// use pwm_kit::pca9685::Pca9685;
///
/// # fn main() -> pwm_kit::Result<()> {
/// let bus = MockPca9685::new(0x40);
/// let chip = Pca9685::new(bus.clone(), 0x40)?; // 50 Hz
/// assert_eq!(chip.prescale(), 121);
///
/// chip.set_servo_angle(0, 90.0)?;             // 1500 µs pulse
/// assert_eq!(chip.read_channel(0)?.off_tick(), 307);
///
/// chip.set_channel_duty(1, 100.0)?;
/// assert_eq!(bus.channel(1), (0, 4095));
///
/// chip.shutdown()?;
/// assert_eq!(bus.channel(0), (0, 0));
/// # Ok(())
/// # }
/// ```
pub struct Pca9685<I2C: I2c> {
    config: Pca9685Config,
    prescale: u8,
    bus: Mutex<Option<I2C>>,
}

impl<I2C: I2c> Pca9685<I2C> {
    /// Initialize the chip at `address` with the default configuration (50 Hz).
    ///
    /// # Errors
    /// See [`initialize`](Self::initialize).
    pub fn new(bus: I2C, address: u8) -> Result<Self> {
        Self::initialize(
            bus,
            Pca9685Config {
                address,
                ..Pca9685Config::default()
            },
        )
    }

    /// Probe the address, reset the chip, program the prescaler and turn every channel off.
    ///
    /// # Errors
    /// - [`Error::InvalidParameter`] for an unsupported frequency, address or angle map.
    /// - [`Error::DeviceNotFound`] if the address is not acknowledged.
    /// - [`Error::Bus`] if a transaction still fails after its retry.
    pub fn initialize(mut bus: I2C, config: Pca9685Config) -> Result<Self> {
        if config.address > 0x7F {
            return Err(Error::invalid("address", format!("{:#04x}", config.address)));
        }
        config.angle_map.validate()?;
        if config.io_timeout.is_zero() {
            return Err(Error::invalid("io_timeout", format!("{:?}", config.io_timeout)));
        }
        let prescale = registers::prescale_for(config.oscillator_hz, config.frequency_hz)?;

        let mut session = Session {
            bus: &mut bus,
            address: config.address,
            backoff: config.retry_backoff,
            timeout: config.io_timeout,
        };
        let mode1 = session.read_register(MODE1).map_err(|err| match err {
            Error::Bus {
                kind: ErrorKind::NoAcknowledge(_),
                address,
            } => Error::DeviceNotFound { address },
            other => other,
        })?;
        debug!("pca9685 addr={:#04x}: MODE1 was {mode1:#04x}", config.address);

        if let Err(err) = program_chip(&mut session, prescale) {
            error!("pca9685 addr={:#04x}: initialization failed: {err}", config.address);
            session.zero_all_best_effort();
            let sleep = [MODE1, MODE1_SLEEP | MODE1_AI | MODE1_ALLCALL];
            if let Err(sleep_err) = session.bus.write(config.address, &sleep) {
                error!(
                    "pca9685 addr={:#04x}: could not put the chip back to sleep: {:?}",
                    config.address,
                    sleep_err.kind()
                );
            }
            return Err(err);
        }

        info!(
            "pca9685 addr={:#04x} prescale={prescale} freq={}Hz",
            config.address, config.frequency_hz
        );
        Ok(Self {
            config,
            prescale,
            bus: Mutex::new(Some(bus)),
        })
    }

    /// Read MODE1, MODE2 and PRE_SCALE without writing, and decide whether a PCA9685 answers.
    ///
    /// Returns `Ok(None)` if nothing acknowledges the address or the registers do not look
    /// like a PCA9685 (PRE_SCALE below 3, or MODE2 reserved bits set).
    ///
    /// # Errors
    /// Returns [`Error::Bus`] for failures other than a missing acknowledgment.
    pub fn probe(bus: &mut I2C, address: u8) -> Result<Option<ChipFingerprint>> {
        let mut session = Session {
            bus,
            address,
            backoff: RETRY_BACKOFF_DEFAULT,
            timeout: IO_TIMEOUT_DEFAULT,
        };
        let mode1 = match session.read_register(MODE1) {
            Ok(mode1) => mode1,
            Err(Error::Bus {
                kind: ErrorKind::NoAcknowledge(_),
                ..
            }) => return Ok(None),
            Err(err) => return Err(err),
        };
        let mode2 = session.read_register(MODE2)?;
        let prescale = session.read_register(PRE_SCALE)?;
        if prescale < PRESCALE_MIN || mode2 & MODE2_RESERVED_MASK != 0 {
            debug!(
                "pca9685 probe addr={address:#04x}: not a PCA9685 \
                 (MODE2={mode2:#04x}, PRE_SCALE={prescale})"
            );
            return Ok(None);
        }
        Ok(Some(ChipFingerprint {
            mode1,
            mode2,
            prescale,
            frequency_hz: registers::frequency_for(OSCILLATOR_HZ_DEFAULT, prescale),
        }))
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut Session<'_, I2C>) -> Result<T>) -> Result<T> {
        let mut guard = self.bus.lock().unwrap_or_else(PoisonError::into_inner);
        let bus = guard.as_mut().ok_or(Error::SessionClosed)?;
        f(&mut Session {
            bus,
            address: self.config.address,
            backoff: self.config.retry_backoff,
            timeout: self.config.io_timeout,
        })
    }

    /// Write one channel's on/off window in a single bus transaction.
    ///
    /// # Errors
    /// - [`Error::Bus`] after the retry; every channel is then turned off best-effort.
    /// - [`Error::SessionClosed`] after [`shutdown`](Self::shutdown).
    pub fn set_channel_program(&self, program: ChannelProgram) -> Result<()> {
        self.with_session(|session| {
            let written = session.write_program(program);
            if let Err(err @ Error::Bus { .. }) = &written {
                error!(
                    "pca9685 addr={:#04x}: channel {} write failed: {err}; all channels off",
                    self.config.address,
                    program.channel()
                );
                session.zero_all_best_effort();
            }
            written
        })
    }

    /// Set a channel's duty cycle: `on = 0`, `off = round(duty / 100 * 4095)`.
    ///
    /// # Errors
    /// - [`Error::InvalidChannel`] for channels above 15.
    /// - [`Error::InvalidParameter`] for a duty outside `0..=100`.
    /// - [`Error::Bus`] / [`Error::SessionClosed`] as for
    ///   [`set_channel_program`](Self::set_channel_program).
    pub fn set_channel_duty(&self, channel: u8, duty_percent: f64) -> Result<()> {
        registers::channel_register(channel)?;
        let off_tick = registers::duty_to_off_tick(duty_percent)?;
        debug!("pca9685 ch{channel}: duty {duty_percent}% -> off_tick {off_tick}");
        self.set_channel_program(ChannelProgram::new(channel, 0, off_tick)?)
    }

    /// Move a servo: angle -> pulse width (via the angle map) -> off tick (via the period).
    ///
    /// # Errors
    /// - [`Error::InvalidChannel`] for channels above 15.
    /// - [`Error::InvalidParameter`] for an angle outside the configured range.
    /// - [`Error::Bus`] / [`Error::SessionClosed`] as for
    ///   [`set_channel_program`](Self::set_channel_program).
    pub fn set_servo_angle(&self, channel: u8, angle_degrees: f64) -> Result<()> {
        registers::channel_register(channel)?;
        let pulse_us = self.config.angle_map.pulse_us(angle_degrees)?;
        let off_tick = registers::pulse_to_off_tick(pulse_us, self.period_us())?;
        debug!("pca9685 ch{channel}: {angle_degrees}° -> {pulse_us}µs -> off_tick {off_tick}");
        self.set_channel_program(ChannelProgram::new(channel, 0, off_tick)?)
    }

    /// Turn one channel off.
    ///
    /// # Errors
    /// As for [`set_channel_program`](Self::set_channel_program), plus
    /// [`Error::InvalidChannel`].
    pub fn channel_off(&self, channel: u8) -> Result<()> {
        self.set_channel_program(ChannelProgram::off(channel)?)
    }

    /// Turn every channel off, attempting all 16 even if one fails.
    ///
    /// # Errors
    /// Returns the first [`Error::Bus`], or [`Error::SessionClosed`].
    pub fn all_off(&self) -> Result<()> {
        self.with_session(|session| session.zero_all())
    }

    /// Read back a channel's on/off window.
    ///
    /// # Errors
    /// [`Error::InvalidChannel`], [`Error::Bus`] or [`Error::SessionClosed`].
    pub fn read_channel(&self, channel: u8) -> Result<ChannelProgram> {
        self.with_session(|session| session.read_program(channel))
    }

    /// Turn every channel off, put the chip to sleep and release the bus.
    ///
    /// Idempotent. The bus is released even if the final writes fail.
    ///
    /// # Errors
    /// Returns the first [`Error::Bus`] from zeroing the channels or entering sleep.
    pub fn shutdown(&self) -> Result<()> {
        let mut guard = self.bus.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(mut bus) = guard.take() else {
            return Ok(());
        };
        let mut session = Session {
            bus: &mut bus,
            address: self.config.address,
            backoff: self.config.retry_backoff,
            timeout: self.config.io_timeout,
        };
        let zeroed = session.zero_all();
        let slept = session.write_register(MODE1, MODE1_SLEEP | MODE1_AI | MODE1_ALLCALL);
        drop(bus);
        info!("pca9685 addr={:#04x}: shut down", self.config.address);
        zeroed.and(slept)
    }

    /// Returns whether [`shutdown`](Self::shutdown) has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.bus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// A handle that drives one channel; usable as an LED or servo backend.
    ///
    /// # Errors
    /// Returns [`Error::InvalidChannel`] for channels above 15.
    pub fn channel(self: &Arc<Self>, channel: u8) -> Result<ChipChannel<I2C>> {
        registers::channel_register(channel)?;
        Ok(ChipChannel {
            chip: Arc::clone(self),
            channel,
        })
    }

    /// Bus address.
    #[must_use]
    pub const fn address(&self) -> u8 {
        self.config.address
    }

    /// Prescaler value programmed at initialization.
    #[must_use]
    pub const fn prescale(&self) -> u8 {
        self.prescale
    }

    /// Configured (nominal) PWM frequency.
    #[must_use]
    pub const fn frequency_hz(&self) -> f64 {
        self.config.frequency_hz
    }

    /// Frequency the chip actually produces with the rounded prescaler.
    #[must_use]
    pub fn output_frequency_hz(&self) -> f64 {
        registers::frequency_for(self.config.oscillator_hz, self.prescale)
    }

    /// Nominal period in microseconds, used for pulse-to-tick conversion.
    #[must_use]
    pub fn period_us(&self) -> f64 {
        1_000_000.0 / self.config.frequency_hz
    }

    /// Angle-to-pulse mapping.
    #[must_use]
    pub const fn angle_map(&self) -> ServoAngleMap {
        self.config.angle_map
    }

    /// Session configuration.
    #[must_use]
    pub const fn config(&self) -> Pca9685Config {
        self.config
    }
}

impl<I2C: I2c> Drop for Pca9685<I2C> {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            warn!(
                "pca9685 addr={:#04x}: dropped without shutdown, turning channels off",
                self.config.address
            );
            if let Err(err) = self.shutdown() {
                error!("pca9685 addr={:#04x}: shutdown on drop failed: {err}", self.config.address);
            }
        }
    }
}

fn program_chip<I2C: I2c>(session: &mut Session<'_, I2C>, prescale: u8) -> Result<()> {
    session.write_register(MODE2, MODE2_OUTDRV)?;
    // Sleep stops the oscillator; PRE_SCALE is only writable while asleep.
    session.write_register(MODE1, MODE1_SLEEP | MODE1_AI | MODE1_ALLCALL)?;
    session.write_register(PRE_SCALE, prescale)?;
    session.zero_all()?;
    session.write_register(MODE1, MODE1_AI | MODE1_ALLCALL)?;
    thread::sleep(OSCILLATOR_SETTLE);
    session.write_register(MODE1, MODE1_RESTART | MODE1_AI | MODE1_ALLCALL)
}

// ============================================================================
// ChipChannel
// ============================================================================

/// One channel of a shared [`Pca9685`], as an LED or servo backend.
///
/// Created with [`Pca9685::channel`].
pub struct ChipChannel<I2C: I2c> {
    chip: Arc<Pca9685<I2C>>,
    channel: u8,
}

impl<I2C: I2c> ChipChannel<I2C> {
    /// Channel number.
    #[must_use]
    pub const fn channel(&self) -> u8 {
        self.channel
    }

    /// The shared chip client.
    #[must_use]
    pub const fn chip(&self) -> &Arc<Pca9685<I2C>> {
        &self.chip
    }
}

impl<I2C: I2c> DutyOutput for ChipChannel<I2C> {
    fn set_duty(&mut self, duty_cycle_percent: f64) -> Result<()> {
        self.chip.set_channel_duty(self.channel, duty_cycle_percent)
    }

    fn release_output(&mut self) -> Result<()> {
        self.chip.channel_off(self.channel)
    }
}

impl<I2C: I2c> AngleOutput for ChipChannel<I2C> {
    fn angle_map(&self) -> ServoAngleMap {
        self.chip.angle_map()
    }

    fn drive_angle(&mut self, degrees: f64) -> Result<()> {
        self.chip.set_servo_angle(self.channel, degrees)
    }

    fn relax(&mut self) -> Result<()> {
        self.chip.channel_off(self.channel)
    }
}
