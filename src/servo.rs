//! A device abstraction for hobby servos.
//!
//! [`Servo`] validates angles against a [`ServoAngleMap`] and drives any
//! [`AngleOutput`]: a [`SoftServoOutput`] (software PWM on a GPIO line at a fixed
//! 50 Hz) or one channel of a shared [`Pca9685`]. Motion sequences are lists of
//! `(degrees, hold)` steps; build them with [`linear`] and play them with
//! [`Servo::animate`].
//!
//! See [`Servo`] for a usage example.

use std::sync::Arc;
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::gpio::{Gpio, GpioBackend, PinSpec};
use crate::output::{AngleOutput, DutyOutput, StdDelay, pause};
use crate::pca9685::registers::ServoAngleMap;
use crate::pca9685::{ChipChannel, Pca9685};
use crate::soft_pwm::{PwmConfig, SoftPwm};
use crate::{Error, Result};

/// Servo frame period assumed by the software path (µs).
pub const SERVO_PERIOD_US: f64 = 20_000.0;
/// Servo frame rate used by the software path (Hz).
pub const SERVO_FREQUENCY_HZ: f64 = 1_000_000.0 / SERVO_PERIOD_US;

/// What [`Servo::animate`] does after the last step.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AtEnd {
    /// Keep driving the final position.
    Hold,
    /// Stop the pulses so the servo relaxes.
    Relax,
}

/// Build a linear sequence of `steps` animation steps from `start_degrees` to `end_degrees`.
///
/// Each step holds for `total_duration / steps`. The first step is `start_degrees` and the
/// last is `end_degrees`. A `steps` of 0 is treated as 1.
///
/// ```rust
/// use std::time::Duration;
/// use pwm_kit::servo::linear;
///
/// let sweep = linear(0.0, 180.0, Duration::from_secs(2), 5);
/// let angles: Vec<f64> = sweep.iter().map(|(degrees, _)| *degrees).collect();
/// assert_eq!(angles, [0.0, 45.0, 90.0, 135.0, 180.0]);
/// assert_eq!(sweep[0].1, Duration::from_millis(400));
/// ```
#[must_use]
pub fn linear(
    start_degrees: f64,
    end_degrees: f64,
    total_duration: Duration,
    steps: usize,
) -> Vec<(f64, Duration)> {
    let steps = steps.max(1);
    let hold = total_duration / u32::try_from(steps).unwrap_or(u32::MAX);
    let denom = if steps == 1 { 1.0 } else { (steps - 1) as f64 };
    (0..steps)
        .map(|index| {
            let degrees = if index + 1 == steps && steps > 1 {
                end_degrees
            } else {
                start_degrees + (end_degrees - start_degrees) * index as f64 / denom
            };
            (degrees, hold)
        })
        .collect()
}

// ============================================================================
// Software backend
// ============================================================================

/// Servo pulses generated by a [`SoftPwm`] engine at [`SERVO_FREQUENCY_HZ`].
///
/// An angle becomes a pulse width through the map, then a duty cycle of
/// `pulse_us / 20_000 * 100`.
pub struct SoftServoOutput<B: GpioBackend> {
    engine: SoftPwm<B>,
    map: ServoAngleMap,
}

impl<B: GpioBackend> SoftServoOutput<B> {
    /// Create a stopped software servo output. The line is acquired by the first angle.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] for an invalid map, a pulse range that does not
    /// fit in one frame, or a non-output `spec`.
    pub fn new(gpio: Gpio<B>, spec: PinSpec, map: ServoAngleMap) -> Result<Self> {
        map.validate()?;
        if map.max_pulse_us > SERVO_PERIOD_US {
            return Err(Error::invalid("max_pulse_us", map.max_pulse_us));
        }
        let config = PwmConfig {
            frequency_hz: SERVO_FREQUENCY_HZ,
            duty_cycle_percent: 0.0,
        };
        Ok(Self {
            engine: SoftPwm::new(gpio, spec, config)?,
            map,
        })
    }

    /// The underlying engine.
    #[must_use]
    pub const fn engine(&self) -> &SoftPwm<B> {
        &self.engine
    }
}

impl<B: GpioBackend> AngleOutput for SoftServoOutput<B> {
    fn angle_map(&self) -> ServoAngleMap {
        self.map
    }

    fn drive_angle(&mut self, degrees: f64) -> Result<()> {
        let pulse_us = self.map.pulse_us(degrees)?;
        self.engine.set_duty(pulse_us / SERVO_PERIOD_US * 100.0)
    }

    fn relax(&mut self) -> Result<()> {
        self.engine.stop()
    }
}

// ============================================================================
// Servo
// ============================================================================

/// A servo on a software or chip PWM output.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use pwm_kit::mock::{MockDelay, MockPca9685};
/// use pwm_kit::pca9685::Pca9685;
/// use pwm_kit::servo::{AtEnd, Servo, linear};
///
/// # fn main() -> pwm_kit::Result<()> {
/// let bus = MockPca9685::new(0x40);
/// let chip = Arc::new(Pca9685::new(bus.clone(), 0x40)?);
/// let mut servo = Servo::on_chip(&chip, 0)?.with_delay(MockDelay::new());
///
/// servo.set_angle(90.0)?;
/// assert_eq!(bus.channel(0), (0, 307));
/// assert!(servo.set_angle(200.0).is_err()); // outside 0..=180
///
/// servo.animate(linear(0.0, 180.0, Duration::from_secs(1), 10), AtEnd::Relax)?;
/// assert_eq!(servo.angle(), None);
/// # Ok(())
/// # }
/// ```
pub struct Servo<O: AngleOutput, D: DelayNs = StdDelay> {
    output: O,
    delay: D,
    map: ServoAngleMap,
    angle: Option<f64>,
}

impl<B: GpioBackend> Servo<SoftServoOutput<B>> {
    /// Servo on a GPIO line driven by software PWM.
    ///
    /// # Errors
    /// See [`SoftServoOutput::new`].
    pub fn software(gpio: Gpio<B>, spec: PinSpec, map: ServoAngleMap) -> Result<Self> {
        Self::new(SoftServoOutput::new(gpio, spec, map)?)
    }
}

impl<I2C: I2c> Servo<ChipChannel<I2C>> {
    /// Servo on one channel of a shared chip, using the chip's angle map.
    ///
    /// # Errors
    /// Returns [`Error::InvalidChannel`] for channels above 15.
    pub fn on_chip(chip: &Arc<Pca9685<I2C>>, channel: u8) -> Result<Self> {
        Self::new(chip.channel(channel)?)
    }
}

impl<O: AngleOutput> Servo<O> {
    /// Servo on any angle output, pausing with [`StdDelay`].
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] if the output's angle map is invalid.
    pub fn new(output: O) -> Result<Self> {
        let map = output.angle_map();
        map.validate()?;
        Ok(Self {
            output,
            delay: StdDelay,
            map,
            angle: None,
        })
    }
}

impl<O: AngleOutput, D: DelayNs> Servo<O, D> {
    /// Replace the delay used between animation steps.
    #[must_use]
    pub fn with_delay<D2: DelayNs>(self, delay: D2) -> Servo<O, D2> {
        Servo {
            output: self.output,
            delay,
            map: self.map,
            angle: self.angle,
        }
    }

    /// Move to `degrees`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] outside the angle map's range (nothing is
    /// driven), or the backend's error.
    pub fn set_angle(&mut self, degrees: f64) -> Result<()> {
        if !self.map.contains(degrees) {
            return Err(Error::invalid("angle", degrees));
        }
        self.output.drive_angle(degrees)?;
        debug!("Servo set_angle({degrees}) -> {}µs", self.map.pulse_us(degrees)?);
        self.angle = Some(degrees);
        Ok(())
    }

    /// Move to the middle of the angle range.
    ///
    /// # Errors
    /// Returns the backend's error.
    pub fn center(&mut self) -> Result<()> {
        self.set_angle(self.map.center())
    }

    /// Stop sending pulses so the servo can be moved by hand.
    ///
    /// # Errors
    /// Returns the backend's error.
    pub fn relax(&mut self) -> Result<()> {
        self.output.relax()?;
        self.angle = None;
        Ok(())
    }

    /// Last commanded angle, or `None` before the first move and after [`relax`](Self::relax).
    #[must_use]
    pub const fn angle(&self) -> Option<f64> {
        self.angle
    }

    /// Angle range and pulse mapping.
    #[must_use]
    pub const fn angle_map(&self) -> ServoAngleMap {
        self.map
    }

    /// Play `(degrees, hold)` steps in order, then hold or relax.
    ///
    /// Every angle is checked before the first move.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] if any step is out of range, or the first
    /// backend error (the animation stops there).
    pub fn animate<I>(&mut self, steps: I, at_end: AtEnd) -> Result<()>
    where
        I: IntoIterator<Item = (f64, Duration)>,
    {
        let steps: Vec<(f64, Duration)> = steps.into_iter().collect();
        if let Some((degrees, _)) = steps.iter().find(|(degrees, _)| !self.map.contains(*degrees)) {
            return Err(Error::invalid("animation angle", degrees));
        }
        info!("Servo animate: {} steps, then {at_end:?}", steps.len());
        for (degrees, hold) in steps {
            self.set_angle(degrees)?;
            pause(&mut self.delay, hold);
        }
        match at_end {
            AtEnd::Hold => Ok(()),
            AtEnd::Relax => self.relax(),
        }
    }

    /// Move from `from_degrees` to `to_degrees` over `duration` in `steps` evenly spaced
    /// steps, holding the final position.
    ///
    /// # Errors
    /// As for [`animate`](Self::animate).
    pub fn sweep(
        &mut self,
        from_degrees: f64,
        to_degrees: f64,
        duration: Duration,
        steps: usize,
    ) -> Result<()> {
        self.animate(linear(from_degrees, to_degrees, duration, steps), AtEnd::Hold)
    }

    /// The backend output.
    #[must_use]
    pub const fn output(&self) -> &O {
        &self.output
    }
}
