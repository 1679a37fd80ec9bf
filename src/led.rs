//! A device abstraction for a dimmable LED.
//!
//! [`Led`] turns brightness percentages into duty cycles on any [`DutyOutput`]: a
//! [`SoftPwm`] engine on a GPIO line or one channel of a shared [`Pca9685`]. Fades,
//! blinks and breathing are plain sequences of [`Led::set_brightness`] calls with
//! pauses in between, run on the caller's thread.
//!
//! See [`Led`] for a usage example.

use core::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::gpio::{Gpio, GpioBackend, PinSpec};
use crate::output::{DutyOutput, StdDelay, check_percent, pause};
use crate::pca9685::{ChipChannel, Pca9685};
use crate::soft_pwm::{PwmConfig, SoftPwm};
use crate::{Error, Result};

/// Default software PWM frequency for LEDs (Hz); high enough to avoid visible flicker.
pub const LED_FREQUENCY_HZ_DEFAULT: f64 = 200.0;
/// Default number of brightness steps in [`Led::fade_to`].
pub const FADE_STEPS_DEFAULT: u32 = 50;
/// Brightness updates per second during [`Led::breathe`].
pub const BREATHE_UPDATES_PER_SECOND: f64 = 50.0;

/// LED settings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedConfig {
    /// Software PWM frequency. Chip-driven LEDs use the chip's frequency instead.
    pub frequency_hz: f64,
    /// Brightness ceiling in percent; requests above it are clamped.
    pub max_brightness: f64,
    /// The LED lights when the line is Low (sinking current).
    pub active_low: bool,
    /// Number of steps in a fade.
    pub fade_steps: u32,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            frequency_hz: LED_FREQUENCY_HZ_DEFAULT,
            max_brightness: 100.0,
            active_low: false,
            fade_steps: FADE_STEPS_DEFAULT,
        }
    }
}

impl LedConfig {
    fn validate(&self) -> Result<()> {
        check_percent("max_brightness", self.max_brightness)?;
        if self.fade_steps == 0 {
            return Err(Error::invalid("fade_steps", self.fade_steps));
        }
        Ok(())
    }
}

/// Brightness at `phase` (`0.0..=1.0`) of one breathing cycle between `min` and `max`.
///
/// Follows `min + (max - min) * (1 - cos(2π·phase)) / 2`: `min` at both ends, `max` halfway.
#[must_use]
pub fn breathe_level(phase: f64, min: f64, max: f64) -> f64 {
    min + (max - min) * (1.0 - (TAU * phase).cos()) / 2.0
}

/// A dimmable LED on a software or chip PWM output.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use pwm_kit::gpio::{Gpio, PinSpec};
/// use pwm_kit::led::{Led, LedConfig};
/// use pwm_kit::mock::{MockDelay, MockGpio};
///
/// # fn main() -> pwm_kit::Result<()> {
/// let gpio = Gpio::new(MockGpio::new());
/// let mut led = Led::software(gpio, PinSpec::output(12), LedConfig::default())?
///     .with_delay(MockDelay::new()); // record pauses instead of sleeping
///
/// led.set_brightness(40.0)?;
/// led.blink(3, Duration::from_millis(250))?;
/// assert_eq!(led.brightness(), 40.0); // blink restores the prior level
///
/// led.fade_to(0.0, Duration::from_millis(500))?;
/// led.release()?;
/// # Ok(())
/// # }
/// ```
pub struct Led<O: DutyOutput, D: DelayNs = StdDelay> {
    output: O,
    delay: D,
    config: LedConfig,
    brightness: f64,
}

impl<B: GpioBackend> Led<SoftPwm<B>> {
    /// LED on a GPIO line driven by a software PWM engine at `config.frequency_hz`.
    ///
    /// The line is acquired by the first brightness that needs a non-zero duty cycle.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] for a bad config or a non-output `spec`.
    pub fn software(gpio: Gpio<B>, spec: PinSpec, config: LedConfig) -> Result<Self> {
        let pwm_config = PwmConfig {
            frequency_hz: config.frequency_hz,
            duty_cycle_percent: 0.0,
        };
        Self::new(SoftPwm::new(gpio, spec, pwm_config)?, config)
    }
}

impl<I2C: I2c> Led<ChipChannel<I2C>> {
    /// LED on one channel of a shared chip.
    ///
    /// # Errors
    /// Returns [`Error::InvalidChannel`] or [`Error::InvalidParameter`] for a bad config.
    pub fn on_chip(chip: &Arc<Pca9685<I2C>>, channel: u8, config: LedConfig) -> Result<Self> {
        Self::new(chip.channel(channel)?, config)
    }
}

impl<O: DutyOutput> Led<O> {
    /// LED on any duty-cycle output, pausing with [`StdDelay`].
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] if `max_brightness` is outside `0..=100` or
    /// `fade_steps` is zero.
    pub fn new(output: O, config: LedConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            output,
            delay: StdDelay,
            config,
            brightness: 0.0,
        })
    }
}

impl<O: DutyOutput, D: DelayNs> Led<O, D> {
    /// Replace the delay used between steps of fades, blinks and breaths.
    #[must_use]
    pub fn with_delay<D2: DelayNs>(self, delay: D2) -> Led<O, D2> {
        Led {
            output: self.output,
            delay,
            config: self.config,
            brightness: self.brightness,
        }
    }

    /// Set brightness in percent, clamped to `max_brightness`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] outside `0..=100`, or the backend's error.
    pub fn set_brightness(&mut self, percent: f64) -> Result<()> {
        check_percent("brightness", percent)?;
        let level = percent.min(self.config.max_brightness);
        let duty = if self.config.active_low {
            100.0 - level
        } else {
            level
        };
        self.output.set_duty(duty)?;
        self.brightness = level;
        Ok(())
    }

    /// Last brightness set, after clamping.
    #[must_use]
    pub const fn brightness(&self) -> f64 {
        self.brightness
    }

    /// Settings this LED was built with.
    #[must_use]
    pub const fn config(&self) -> LedConfig {
        self.config
    }

    /// Turn on at `max_brightness`.
    ///
    /// # Errors
    /// Returns the backend's error.
    pub fn on(&mut self) -> Result<()> {
        self.set_brightness(self.config.max_brightness)
    }

    /// Turn off (brightness 0).
    ///
    /// # Errors
    /// Returns the backend's error.
    pub fn off(&mut self) -> Result<()> {
        self.set_brightness(0.0)
    }

    /// Step brightness linearly to `target_percent` over `duration`, in `fade_steps` steps.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] for a target outside `0..=100`, or the first
    /// backend error (the fade stops there).
    pub fn fade_to(&mut self, target_percent: f64, duration: Duration) -> Result<()> {
        check_percent("target brightness", target_percent)?;
        let target = target_percent.min(self.config.max_brightness);
        let start = self.brightness;
        let steps = self.config.fade_steps;
        let step_pause = duration / steps;
        debug!("led: fade {start}% -> {target}% over {duration:?} in {steps} steps");
        for step in 1..=steps {
            pause(&mut self.delay, step_pause);
            let level = if step == steps {
                target
            } else {
                start + (target - start) * f64::from(step) / f64::from(steps)
            };
            self.set_brightness(level)?;
        }
        Ok(())
    }

    /// Blink `times` times, `interval` on then `interval` off, then restore the prior brightness.
    ///
    /// Blinks at the prior brightness, or at `max_brightness` if the LED was off.
    ///
    /// # Errors
    /// Returns the first backend error.
    pub fn blink(&mut self, times: u32, interval: Duration) -> Result<()> {
        let prior = self.brightness;
        let lit = if prior > 0.0 {
            prior
        } else {
            self.config.max_brightness
        };
        info!("led: blink x{times} at {lit}%, interval {interval:?}");
        for _ in 0..times {
            self.set_brightness(lit)?;
            pause(&mut self.delay, interval);
            self.set_brightness(0.0)?;
            pause(&mut self.delay, interval);
        }
        self.set_brightness(prior)
    }

    /// One sinusoidal breath from off up to `max_brightness` and back over `period`.
    ///
    /// # Errors
    /// Returns the first backend error.
    pub fn breathe(&mut self, period: Duration) -> Result<()> {
        self.breathe_between(period, 0.0, self.config.max_brightness)
    }

    /// One sinusoidal breath from `min` up to `max` and back over `period`,
    /// at [`BREATHE_UPDATES_PER_SECOND`]. Ends at `min`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] unless `0 <= min <= max <= 100`, or the first
    /// backend error.
    pub fn breathe_between(&mut self, period: Duration, min: f64, max: f64) -> Result<()> {
        check_percent("min brightness", min)?;
        check_percent("max brightness", max)?;
        if min > max {
            return Err(Error::invalid("brightness range", format!("{min}..={max}")));
        }
        let updates = ((period.as_secs_f64() * BREATHE_UPDATES_PER_SECOND).round() as u32).max(1);
        let step_pause = period / updates;
        for update in 0..updates {
            let phase = f64::from(update) / f64::from(updates);
            self.set_brightness(breathe_level(phase, min, max))?;
            pause(&mut self.delay, step_pause);
        }
        self.set_brightness(min)
    }

    /// Stop driving the LED: the software engine stops and releases its line, a chip
    /// channel is turned off.
    ///
    /// # Errors
    /// Returns the backend's error.
    pub fn release(&mut self) -> Result<()> {
        self.brightness = 0.0;
        self.output.release_output()
    }

    /// The backend output.
    #[must_use]
    pub const fn output(&self) -> &O {
        &self.output
    }
}
