//! Breathe an LED on board pin 12 with software PWM, or on PCA9685 channel 0 with `chip`.
//!
//! ```text
//! RUST_LOG=info cargo run --features linux --bin demo_led_breathe [chip]
//! ```

use std::sync::Arc;
use std::time::Duration;

use pwm_kit::Result;
use pwm_kit::gpio::{Gpio, PinSpec};
use pwm_kit::led::{Led, LedConfig};
use pwm_kit::linux::{CdevGpio, open_i2c_bus};
use pwm_kit::output::DutyOutput;
use pwm_kit::pca9685::{IO_TIMEOUT_DEFAULT, Pca9685};

// Raspberry Pi 40-pin header: board pin 12 is GPIO18.
const BOARD_MAP: [(u32, u32); 4] = [(11, 17), (12, 18), (32, 12), (33, 13)];
const BREATHS: u32 = 5;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = inner_main() {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn inner_main() -> Result<()> {
    let config = LedConfig::default();
    if std::env::args().nth(1).as_deref() == Some("chip") {
        let chip = Arc::new(Pca9685::new(open_i2c_bus(1, IO_TIMEOUT_DEFAULT)?, 0x40)?);
        let led = Led::on_chip(&chip, 0, config)?;
        run(led)?;
        chip.shutdown()
    } else {
        let gpio = Gpio::new(CdevGpio::open("/dev/gpiochip0")?.with_board_map(BOARD_MAP));
        run(Led::software(gpio, PinSpec::output(12), config)?)
    }
}

fn run<O: DutyOutput>(mut led: Led<O>) -> Result<()> {
    led.fade_to(100.0, Duration::from_secs(1))?;
    led.blink(3, Duration::from_millis(200))?;
    for _ in 0..BREATHS {
        led.breathe(Duration::from_secs(2))?;
    }
    led.release()
}
