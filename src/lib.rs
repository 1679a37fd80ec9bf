//! Device abstractions for PWM-driven LEDs and servos on Linux single-board computers.
//!
//! Two ways to produce a PWM signal, and two actuators on top of them:
//!
//! - [`soft_pwm`]: a background thread toggles one GPIO line ([`soft_pwm::SoftPwm`]).
//! - [`pca9685`]: a client for the PCA9685 16-channel PWM chip on an I2C bus
//!   ([`pca9685::Pca9685`]).
//! - [`led`] and [`servo`]: brightness and angle on either backend.
//!
//! Hardware is reached only through [`gpio::GpioBackend`] and `embedded-hal`'s
//! [`I2c`](embedded_hal::i2c::I2c), so everything runs on a desktop against the fakes in
//! [`mock`]. The `linux` feature adds real backends in `linux`.
//!
//! Every resource is released on drop: pins go Low and back to the platform, chips turn
//! every channel off and sleep.
//!
//! # Glossary
//!
//! - **Duty cycle:** percent of each PWM period the output is High.
//! - **Tick:** one of the 4096 steps of the chip's PWM counter within a period.
//! - **Prescaler:** chip register dividing the 25 MHz oscillator to set the PWM frequency.
//! - **Board / SoC numbering:** a pin's physical header position, or its line offset on the
//!   GPIO controller.

pub mod gpio;
pub mod led;
#[cfg(feature = "linux")]
pub mod linux;
pub mod mock;
pub mod output;
pub mod pca9685;
pub mod servo;
pub mod soft_pwm;

mod error;

// Re-export error types and result (used throughout)
pub use crate::error::{Error, Result};
