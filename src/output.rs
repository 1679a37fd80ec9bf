//! Backend seams shared by the [`Led`](crate::led::Led) and [`Servo`](crate::servo::Servo)
//! actuators, plus the blocking delay they pause with.

use std::thread;
use std::time::Duration;

use embedded_hal::delay::DelayNs;

use crate::{Error, Result};
use crate::gpio::GpioBackend;
use crate::pca9685::registers::ServoAngleMap;
use crate::soft_pwm::{PwmRunState, SoftPwm};

/// Something that can hold a PWM duty cycle: a software engine or a chip channel.
pub trait DutyOutput {
    /// Drive the output at `duty_cycle_percent` (`0..=100`), starting it if needed.
    ///
    /// A stopped software engine stays stopped (and its pin unclaimed) for a duty of 0.
    ///
    /// # Errors
    /// Returns the backend's error; see [`SoftPwm::start`] and
    /// [`Pca9685::set_channel_duty`](crate::pca9685::Pca9685::set_channel_duty).
    fn set_duty(&mut self, duty_cycle_percent: f64) -> Result<()>;

    /// Stop driving the output and leave it off.
    ///
    /// # Errors
    /// Returns the backend's error.
    fn release_output(&mut self) -> Result<()>;
}

/// Something that can hold a servo at an angle.
pub trait AngleOutput {
    /// Angle range and pulse mapping this output honors.
    fn angle_map(&self) -> ServoAngleMap;

    /// Drive the servo to `degrees`.
    ///
    /// # Errors
    /// Returns the backend's error.
    fn drive_angle(&mut self, degrees: f64) -> Result<()>;

    /// Stop sending pulses so the servo can relax.
    ///
    /// # Errors
    /// Returns the backend's error.
    fn relax(&mut self) -> Result<()>;
}

impl<B: GpioBackend> DutyOutput for SoftPwm<B> {
    fn set_duty(&mut self, duty_cycle_percent: f64) -> Result<()> {
        match self.state() {
            PwmRunState::Running => self.set_duty_cycle(duty_cycle_percent),
            PwmRunState::Stopped if duty_cycle_percent == 0.0 => Ok(()),
            PwmRunState::Stopped => self.start(duty_cycle_percent),
        }
    }

    fn release_output(&mut self) -> Result<()> {
        self.stop()
    }
}

/// Accept `value` only if it is a finite percentage in `0..=100`.
pub(crate) fn check_percent(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::invalid(name, value))
    }
}

/// [`DelayNs`] backed by [`std::thread::sleep`].
#[derive(Clone, Copy, Debug, Default)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        thread::sleep(Duration::from_nanos(u64::from(ns)));
    }

    fn delay_us(&mut self, us: u32) {
        thread::sleep(Duration::from_micros(u64::from(us)));
    }

    fn delay_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}

/// Pause for `duration` on any [`DelayNs`], in microsecond resolution.
pub(crate) fn pause(delay: &mut impl DelayNs, duration: Duration) {
    let mut remaining = duration.as_micros();
    while remaining > 0 {
        let chunk = remaining.min(u128::from(u32::MAX)) as u32;
        delay.delay_us(chunk);
        remaining -= u128::from(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDelay;

    #[test]
    fn percent_bounds_are_inclusive() {
        assert!(check_percent("duty", 0.0).is_ok());
        assert!(check_percent("duty", 100.0).is_ok());
        for value in [-0.1, 100.1, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                check_percent("duty", value),
                Err(Error::InvalidParameter { name: "duty", .. })
            ));
        }
    }

    #[test]
    fn pause_hands_the_whole_duration_to_the_delay() {
        let mut delay = MockDelay::new();
        pause(&mut delay, Duration::from_millis(1_500));
        assert_eq!(delay.total(), Duration::from_millis(1_500));
    }
}
