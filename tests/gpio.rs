#![allow(missing_docs)]
//! Host-level tests for pin ownership and release.

use embedded_hal::digital::OutputPin;
use pwm_kit::gpio::{Direction, Gpio, Level, Numbering, PinSpec};
use pwm_kit::mock::MockGpio;
use pwm_kit::{Error, Result};

#[test]
fn second_acquire_is_resource_busy() -> Result<()> {
    let gpio = Gpio::new(MockGpio::new());
    let _held = gpio.acquire(PinSpec::output(33))?;
    assert!(matches!(
        gpio.acquire(PinSpec::output(33)),
        Err(Error::ResourceBusy(_))
    ));
    Ok(())
}

#[test]
fn board_and_soc_numbers_share_ownership() -> Result<()> {
    let gpio = Gpio::new(MockGpio::with_board_map([(33, 13)]));
    let soc_13 = PinSpec::new(13, Numbering::Soc, Direction::Out);
    {
        let held = gpio.acquire(PinSpec::output(33))?;
        assert_eq!(held.offset(), 13);
        assert!(matches!(gpio.acquire(soc_13), Err(Error::ResourceBusy(_))));
    }
    let again = gpio.acquire(soc_13)?;
    assert_eq!(again.offset(), 13);
    Ok(())
}

#[test]
fn release_is_idempotent_and_leaves_line_low() -> Result<()> {
    let mock = MockGpio::new();
    let gpio = Gpio::new(mock.clone());
    let mut pin = gpio.acquire(PinSpec::output(21))?;
    pin.set(Level::High)?;
    assert_eq!(mock.level(21), Some(Level::High));

    pin.release()?;
    pin.release()?;
    assert!(pin.is_released());
    assert_eq!(mock.level(21), Some(Level::Low));
    assert_eq!(mock.release_count(21), 1);
    assert!(!mock.is_open(21));
    assert!(!gpio.is_owned(PinSpec::output(21))?);
    assert_eq!(pin.set(Level::High), Err(Error::PinReleased));

    drop(pin);
    assert_eq!(mock.release_count(21), 1);
    Ok(())
}

fn drive_then_fail(gpio: &Gpio<MockGpio>) -> Result<()> {
    let mut pin = gpio.acquire(PinSpec::output(5))?;
    pin.set(Level::High)?;
    pin.read()?; // outputs cannot be read
    Ok(())
}

#[test]
fn error_path_releases_pin() -> Result<()> {
    let mock = MockGpio::new();
    let gpio = Gpio::new(mock.clone());
    assert!(matches!(
        drive_then_fail(&gpio),
        Err(Error::InvalidParameter { .. })
    ));
    assert_eq!(mock.level(5), Some(Level::Low));
    assert!(!mock.is_open(5));
    assert!(!gpio.is_owned(PinSpec::output(5))?);
    Ok(())
}

#[test]
fn panic_unwinding_releases_pin() {
    let mock = MockGpio::new();
    let gpio = Gpio::new(mock.clone());
    let worker_gpio = gpio.clone();
    let outcome = std::thread::spawn(move || {
        let mut pin = worker_gpio.acquire(PinSpec::output(8)).unwrap();
        pin.set(Level::High).unwrap();
        panic!("actuator task crashed");
    })
    .join();
    assert!(outcome.is_err());
    assert_eq!(mock.level(8), Some(Level::Low));
    assert!(!gpio.is_owned(PinSpec::output(8)).unwrap());
}

#[test]
fn inputs_read_and_outputs_write() -> Result<()> {
    let mock = MockGpio::new();
    let gpio = Gpio::new(mock.clone());
    mock.set_input(7, Level::High);

    let mut input = gpio.acquire(PinSpec::input(7))?;
    assert_eq!(input.read()?, Level::High);
    assert!(matches!(
        input.set(Level::Low),
        Err(Error::InvalidParameter { .. })
    ));
    assert_eq!(mock.direction(7), Some(Direction::In));
    assert_eq!(mock.level(7), None); // inputs are never driven
    Ok(())
}

#[test]
fn unavailable_controller_is_reported() -> Result<()> {
    let gpio = Gpio::new(MockGpio::unavailable());
    assert!(matches!(
        gpio.acquire(PinSpec::output(3)),
        Err(Error::HardwareUnavailable(_))
    ));
    assert!(!gpio.is_owned(PinSpec::output(3))?);
    Ok(())
}

#[test]
fn failed_initial_low_write_gives_line_back() -> Result<()> {
    let mock = MockGpio::new();
    let gpio = Gpio::new(mock.clone());
    mock.fail_writes(true);
    assert!(matches!(
        gpio.acquire(PinSpec::output(4)),
        Err(Error::Pin { pin: 4, .. })
    ));
    assert!(!mock.is_open(4));
    assert!(!gpio.is_owned(PinSpec::output(4))?);

    mock.fail_writes(false);
    let _pin = gpio.acquire(PinSpec::output(4))?;
    Ok(())
}

#[test]
fn pin_handle_is_an_embedded_hal_output() -> Result<()> {
    let mock = MockGpio::new();
    let gpio = Gpio::new(mock.clone());
    let mut pin = gpio.acquire(PinSpec::output(16))?;

    pin.set_high()?;
    assert_eq!(mock.level(16), Some(Level::High));
    pin.toggle()?;
    assert_eq!(mock.level(16), Some(Level::Low));
    pin.toggle()?;
    assert_eq!(mock.level(16), Some(Level::High));
    Ok(())
}
