//! Sweep a servo on PCA9685 channel 0, or on board pin 32 with software PWM using `soft`.
//!
//! ```text
//! RUST_LOG=debug cargo run --features linux --bin demo_servo_sweep [soft]
//! ```

use std::sync::Arc;
use std::time::Duration;

use pwm_kit::Result;
use pwm_kit::gpio::{Gpio, PinSpec};
use pwm_kit::linux::{CdevGpio, open_i2c_bus};
use pwm_kit::output::AngleOutput;
use pwm_kit::pca9685::{IO_TIMEOUT_DEFAULT, Pca9685};
use pwm_kit::pca9685::registers::ServoAngleMap;
use pwm_kit::servo::{AtEnd, Servo, linear};

// Raspberry Pi 40-pin header: board pin 32 is GPIO12.
const BOARD_MAP: [(u32, u32); 2] = [(32, 12), (33, 13)];

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = inner_main() {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn inner_main() -> Result<()> {
    if std::env::args().nth(1).as_deref() == Some("soft") {
        let gpio = Gpio::new(CdevGpio::open("/dev/gpiochip0")?.with_board_map(BOARD_MAP));
        run(Servo::software(gpio, PinSpec::output(32), ServoAngleMap::default())?)
    } else {
        let mut bus = open_i2c_bus(1, IO_TIMEOUT_DEFAULT)?;
        match Pca9685::probe(&mut bus, 0x40)? {
            Some(fingerprint) => log::info!("found PCA9685: {fingerprint:?}"),
            None => log::warn!("no PCA9685 fingerprint at 0x40, initializing anyway"),
        }
        let chip = Arc::new(Pca9685::new(bus, 0x40)?);
        run(Servo::on_chip(&chip, 0)?)?;
        chip.shutdown()
    }
}

fn run<O: AngleOutput>(mut servo: Servo<O>) -> Result<()> {
    servo.set_angle(0.0)?;
    std::thread::sleep(Duration::from_millis(400));
    servo.set_angle(180.0)?;
    std::thread::sleep(Duration::from_millis(400));
    servo.center()?;
    std::thread::sleep(Duration::from_millis(400));

    // Up in 10 degree steps, hold, then back down.
    let mut steps = linear(0.0, 180.0, Duration::from_secs(2), 19);
    steps.push((180.0, Duration::from_millis(400)));
    steps.extend(linear(180.0, 0.0, Duration::from_secs(2), 19));
    servo.animate(steps, AtEnd::Hold)?;
    servo.sweep(0.0, 90.0, Duration::from_secs(1), 10)?;
    servo.relax()
}
