//! PCA9685 register layout and the pure math that fills it.
//!
//! Nothing here touches the bus, so all of it is unit tested on the host.

use serde::{Deserialize, Serialize};

use crate::output::check_percent;
use crate::{Error, Result};

/// Mode register 1.
pub const MODE1: u8 = 0x00;
/// Mode register 2.
pub const MODE2: u8 = 0x01;
/// First register of channel 0 (`LED0_ON_L`). Channel `n` starts at `LED0_ON_L + 4 * n`.
pub const LED0_ON_L: u8 = 0x06;
/// Prescaler register; writable only while [`MODE1_SLEEP`] is set.
pub const PRE_SCALE: u8 = 0xFE;

/// MODE1: restart PWM channels after sleep.
pub const MODE1_RESTART: u8 = 0x80;
/// MODE1: register auto-increment.
pub const MODE1_AI: u8 = 0x20;
/// MODE1: low-power mode, oscillator off.
pub const MODE1_SLEEP: u8 = 0x10;
/// MODE1: respond to the LED all-call address.
pub const MODE1_ALLCALL: u8 = 0x01;
/// MODE2: totem-pole outputs.
pub const MODE2_OUTDRV: u8 = 0x04;
/// MODE2 bits 7..5 are reserved and read back as zero.
pub const MODE2_RESERVED_MASK: u8 = 0xE0;

/// Default 7-bit bus address.
pub const DEFAULT_ADDRESS: u8 = 0x40;
/// Number of PWM channels on the chip.
pub const CHANNEL_COUNT: u8 = 16;
/// Counter steps in one PWM period.
pub const TICKS_PER_PERIOD: u32 = 4096;
/// Largest tick value a channel register accepts.
pub const MAX_TICK: u16 = 4095;
/// Internal oscillator frequency of the reference chip.
pub const OSCILLATOR_HZ_DEFAULT: u32 = 25_000_000;
/// Smallest prescaler value the chip honors.
pub const PRESCALE_MIN: u8 = 3;
/// Largest prescaler value.
pub const PRESCALE_MAX: u8 = 255;

const TICK_MASK: u16 = 0x0FFF;

/// Supported output frequency range `(min, max)` in Hz for an oscillator.
///
/// About 23.8 Hz to 1525.9 Hz for the 25 MHz reference oscillator.
#[must_use]
pub fn frequency_range(oscillator_hz: u32) -> (f64, f64) {
    (
        frequency_for(oscillator_hz, PRESCALE_MAX),
        frequency_for(oscillator_hz, PRESCALE_MIN),
    )
}

/// Output frequency produced by a prescaler value.
#[must_use]
pub fn frequency_for(oscillator_hz: u32, prescale: u8) -> f64 {
    f64::from(oscillator_hz) / (f64::from(TICKS_PER_PERIOD) * (f64::from(prescale) + 1.0))
}

/// Prescaler for a target frequency: `round(osc / (4096 * f)) - 1`, clamped to the valid range.
///
/// # Errors
/// Returns [`Error::InvalidParameter`] if `frequency_hz` is not finite or lies outside
/// [`frequency_range`].
pub fn prescale_for(oscillator_hz: u32, frequency_hz: f64) -> Result<u8> {
    let (min_hz, max_hz) = frequency_range(oscillator_hz);
    // Allow the rounding slack of the endpoints themselves.
    if !frequency_hz.is_finite() || frequency_hz < min_hz - 1e-9 || frequency_hz > max_hz + 1e-9 {
        return Err(Error::invalid("frequency_hz", frequency_hz));
    }
    let ticks_per_second = f64::from(TICKS_PER_PERIOD) * frequency_hz;
    let raw = (f64::from(oscillator_hz) / ticks_per_second).round() - 1.0;
    Ok(raw.clamp(f64::from(PRESCALE_MIN), f64::from(PRESCALE_MAX)) as u8)
}

/// Off tick for a duty cycle: `round(duty / 100 * 4095)`.
///
/// # Errors
/// Returns [`Error::InvalidParameter`] unless `0 <= duty_percent <= 100`.
pub fn duty_to_off_tick(duty_percent: f64) -> Result<u16> {
    check_percent("duty_percent", duty_percent)?;
    Ok((duty_percent / 100.0 * f64::from(MAX_TICK)).round() as u16)
}

/// Off tick for a pulse width: `round(4095 * pulse / period)`.
///
/// # Errors
/// Returns [`Error::InvalidParameter`] if `period_us` is not positive or the pulse does not
/// fit in one period.
pub fn pulse_to_off_tick(pulse_us: f64, period_us: f64) -> Result<u16> {
    if !period_us.is_finite() || period_us <= 0.0 {
        return Err(Error::invalid("period_us", period_us));
    }
    if !pulse_us.is_finite() || !(0.0..=period_us).contains(&pulse_us) {
        return Err(Error::invalid("pulse_us", pulse_us));
    }
    Ok((f64::from(MAX_TICK) * pulse_us / period_us).round() as u16)
}

/// First register (`LEDn_ON_L`) of a channel.
///
/// # Errors
/// Returns [`Error::InvalidChannel`] for channels above 15.
pub const fn channel_register(channel: u8) -> Result<u8> {
    if channel >= CHANNEL_COUNT {
        return Err(Error::InvalidChannel(channel));
    }
    Ok(LED0_ON_L + 4 * channel)
}

// ============================================================================
// ChannelProgram
// ============================================================================

/// The on/off tick window of one channel within the 4096-step period.
///
/// Both ticks are within `0..=4095` by construction.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct ChannelProgram {
    channel: u8,
    on_tick: u16,
    off_tick: u16,
}

impl ChannelProgram {
    /// Create a validated channel program.
    ///
    /// # Errors
    /// - [`Error::InvalidChannel`] for channels above 15.
    /// - [`Error::InvalidParameter`] for ticks above 4095.
    pub fn new(channel: u8, on_tick: u16, off_tick: u16) -> Result<Self> {
        channel_register(channel)?;
        if on_tick > MAX_TICK {
            return Err(Error::invalid("on_tick", on_tick));
        }
        if off_tick > MAX_TICK {
            return Err(Error::invalid("off_tick", off_tick));
        }
        Ok(Self {
            channel,
            on_tick,
            off_tick,
        })
    }

    /// Fully-off program (`on = 0`, `off = 0`).
    ///
    /// # Errors
    /// Returns [`Error::InvalidChannel`] for channels above 15.
    pub fn off(channel: u8) -> Result<Self> {
        Self::new(channel, 0, 0)
    }

    /// Channel number.
    #[must_use]
    pub const fn channel(&self) -> u8 {
        self.channel
    }

    /// Tick at which the output goes high.
    #[must_use]
    pub const fn on_tick(&self) -> u16 {
        self.on_tick
    }

    /// Tick at which the output goes low.
    #[must_use]
    pub const fn off_tick(&self) -> u16 {
        self.off_tick
    }

    /// First register of this channel.
    #[must_use]
    pub const fn register(&self) -> u8 {
        LED0_ON_L + 4 * self.channel
    }

    /// Register bytes `[ON_L, ON_H, OFF_L, OFF_H]`: two little-endian 16-bit ticks.
    #[must_use]
    pub const fn to_le_bytes(&self) -> [u8; 4] {
        let [on_l, on_h] = self.on_tick.to_le_bytes();
        let [off_l, off_h] = self.off_tick.to_le_bytes();
        [on_l, on_h, off_l, off_h]
    }

    /// Decode register bytes read back from the chip, keeping the 12 significant bits.
    ///
    /// # Errors
    /// Returns [`Error::InvalidChannel`] for channels above 15.
    pub fn from_le_bytes(channel: u8, bytes: [u8; 4]) -> Result<Self> {
        let [on_l, on_h, off_l, off_h] = bytes;
        Self::new(
            channel,
            u16::from_le_bytes([on_l, on_h]) & TICK_MASK,
            u16::from_le_bytes([off_l, off_h]) & TICK_MASK,
        )
    }
}

// ============================================================================
// ServoAngleMap
// ============================================================================

/// Default servo angle range start (degrees).
pub const SERVO_MIN_ANGLE_DEFAULT: f64 = 0.0;
/// Default servo angle range end (degrees).
pub const SERVO_MAX_ANGLE_DEFAULT: f64 = 180.0;
/// Default pulse width at the minimum angle (microseconds).
pub const SERVO_MIN_US_DEFAULT: f64 = 1_000.0;
/// Default pulse width at the maximum angle (microseconds).
pub const SERVO_MAX_US_DEFAULT: f64 = 2_000.0;

/// Linear mapping `min_angle <-> min_pulse_us`, `max_angle <-> max_pulse_us`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServoAngleMap {
    /// Smallest accepted angle (degrees).
    pub min_angle: f64,
    /// Largest accepted angle (degrees).
    pub max_angle: f64,
    /// Pulse width at `min_angle` (microseconds).
    pub min_pulse_us: f64,
    /// Pulse width at `max_angle` (microseconds).
    pub max_pulse_us: f64,
}

impl Default for ServoAngleMap {
    fn default() -> Self {
        Self {
            min_angle: SERVO_MIN_ANGLE_DEFAULT,
            max_angle: SERVO_MAX_ANGLE_DEFAULT,
            min_pulse_us: SERVO_MIN_US_DEFAULT,
            max_pulse_us: SERVO_MAX_US_DEFAULT,
        }
    }
}

impl ServoAngleMap {
    /// Check that both ranges are finite and increasing and the pulses are positive.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if !(self.min_angle.is_finite() && self.max_angle.is_finite())
            || self.min_angle >= self.max_angle
        {
            return Err(Error::invalid(
                "angle range",
                format!("{}..={}", self.min_angle, self.max_angle),
            ));
        }
        if !(self.min_pulse_us.is_finite() && self.max_pulse_us.is_finite())
            || self.min_pulse_us <= 0.0
            || self.min_pulse_us >= self.max_pulse_us
        {
            return Err(Error::invalid(
                "pulse range",
                format!("{}..={}us", self.min_pulse_us, self.max_pulse_us),
            ));
        }
        Ok(())
    }

    /// Returns whether `angle` lies in `min_angle..=max_angle`.
    #[must_use]
    pub fn contains(&self, angle: f64) -> bool {
        angle.is_finite() && (self.min_angle..=self.max_angle).contains(&angle)
    }

    /// Midpoint of the angle range.
    #[must_use]
    pub fn center(&self) -> f64 {
        self.min_angle + (self.max_angle - self.min_angle) / 2.0
    }

    /// Pulse width for an angle.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] if `angle` is outside the configured range.
    pub fn pulse_us(&self, angle: f64) -> Result<f64> {
        if !self.contains(angle) {
            return Err(Error::invalid("angle", angle));
        }
        let fraction = (angle - self.min_angle) / (self.max_angle - self.min_angle);
        Ok(self.min_pulse_us + fraction * (self.max_pulse_us - self.min_pulse_us))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prescale_for_50_hz_is_121() {
        assert_eq!(prescale_for(OSCILLATOR_HZ_DEFAULT, 50.0), Ok(121));
    }

    #[test]
    fn prescale_range_endpoints() {
        let (min_hz, max_hz) = frequency_range(OSCILLATOR_HZ_DEFAULT);
        assert!((min_hz - 23.84).abs() < 0.01);
        assert!((max_hz - 1525.88).abs() < 0.01);
        assert_eq!(prescale_for(OSCILLATOR_HZ_DEFAULT, min_hz), Ok(PRESCALE_MAX));
        assert_eq!(prescale_for(OSCILLATOR_HZ_DEFAULT, max_hz), Ok(PRESCALE_MIN));
    }

    #[test]
    fn prescale_rejects_out_of_range_frequencies() {
        for frequency_hz in [0.0, -50.0, 20.0, 1600.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                prescale_for(OSCILLATOR_HZ_DEFAULT, frequency_hz),
                Err(Error::InvalidParameter { name: "frequency_hz", .. })
            ));
        }
    }

    #[test]
    fn duty_boundaries() {
        assert_eq!(duty_to_off_tick(0.0), Ok(0));
        assert_eq!(duty_to_off_tick(100.0), Ok(4095));
        assert_eq!(duty_to_off_tick(50.0), Ok(2048));
        assert!(duty_to_off_tick(100.5).is_err());
        assert!(duty_to_off_tick(-0.1).is_err());
    }

    #[test]
    fn servo_90_degrees_at_50_hz_is_tick_307() {
        let map = ServoAngleMap::default();
        let pulse_us = map.pulse_us(90.0).unwrap();
        assert!((pulse_us - 1500.0).abs() < f64::EPSILON);
        assert_eq!(pulse_to_off_tick(pulse_us, 20_000.0), Ok(307));
    }

    #[test]
    fn angle_outside_map_is_rejected() {
        let map = ServoAngleMap::default();
        assert!(map.pulse_us(-1.0).is_err());
        assert!(map.pulse_us(180.5).is_err());
        assert!(map.pulse_us(f64::NAN).is_err());
    }

    #[test]
    fn channel_registers_are_four_bytes_apart() {
        assert_eq!(channel_register(0), Ok(0x06));
        assert_eq!(channel_register(1), Ok(0x0A));
        assert_eq!(channel_register(15), Ok(0x42));
        assert_eq!(channel_register(16), Err(Error::InvalidChannel(16)));
    }

    #[test]
    fn channel_program_bytes_are_little_endian_ticks() {
        let program = ChannelProgram::new(3, 0x0123, 0x0ABC).unwrap();
        assert_eq!(program.register(), 0x12);
        assert_eq!(program.to_le_bytes(), [0x23, 0x01, 0xBC, 0x0A]);
    }

    #[test]
    fn read_back_masks_full_on_and_full_off_bits() {
        let program = ChannelProgram::from_le_bytes(0, [0x00, 0x10, 0x00, 0x10]).unwrap();
        assert_eq!((program.on_tick(), program.off_tick()), (0, 0));
    }

    #[test]
    fn channel_program_rejects_ticks_above_4095() {
        assert!(ChannelProgram::new(0, 4096, 0).is_err());
        assert!(ChannelProgram::new(0, 0, 4096).is_err());
    }

    #[test]
    fn invalid_angle_maps_are_rejected() {
        let reversed = ServoAngleMap {
            min_angle: 90.0,
            max_angle: 0.0,
            ..ServoAngleMap::default()
        };
        assert!(reversed.validate().is_err());
        let zero_pulse = ServoAngleMap {
            min_pulse_us: 0.0,
            ..ServoAngleMap::default()
        };
        assert!(zero_pulse.validate().is_err());
        assert!(ServoAngleMap::default().validate().is_ok());
    }
}
