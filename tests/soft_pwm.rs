#![allow(missing_docs)]
//! Host-level tests for the software PWM engine.

use std::thread;
use std::time::{Duration, Instant};

use pwm_kit::gpio::{Direction, Gpio, Level, PinSpec};
use pwm_kit::mock::MockGpio;
use pwm_kit::soft_pwm::{PwmConfig, PwmRunState, SoftPwm};
use pwm_kit::{Error, Result};

fn engine(frequency_hz: f64) -> Result<(MockGpio, Gpio<MockGpio>, SoftPwm<MockGpio>)> {
    let mock = MockGpio::new();
    let gpio = Gpio::new(mock.clone());
    let config = PwmConfig {
        frequency_hz,
        ..PwmConfig::default()
    };
    let pwm = SoftPwm::new(gpio.clone(), PinSpec::output(18), config)?;
    Ok((mock, gpio, pwm))
}

/// Fraction of time spent High between the first and last recorded write.
fn measured_duty(events: &[(Instant, Level)]) -> f64 {
    let mut high = Duration::ZERO;
    let mut total = Duration::ZERO;
    for pair in events.windows(2) {
        let ((at, level), (next, _)) = (pair[0], pair[1]);
        let span = next.duration_since(at);
        total += span;
        if level == Level::High {
            high += span;
        }
    }
    high.as_secs_f64() / total.as_secs_f64()
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

#[test]
fn duty_cycle_converges_over_many_periods() -> Result<()> {
    let (mock, _gpio, mut pwm) = engine(100.0)?;
    pwm.start(30.0)?;
    thread::sleep(Duration::from_millis(1_500)); // 150 periods
    pwm.stop()?;

    let duty = measured_duty(&mock.events(18));
    assert!((duty - 0.30).abs() < 0.1, "measured duty {duty}");
    Ok(())
}

#[test]
fn zero_and_full_duty_hold_a_constant_level() -> Result<()> {
    let (mock, _gpio, mut pwm) = engine(500.0)?;
    pwm.start(0.0)?;
    thread::sleep(Duration::from_millis(50));
    pwm.stop()?;
    assert!(mock.events(18).iter().all(|(_, level)| *level == Level::Low));

    let (mock, _gpio, mut pwm) = engine(500.0)?;
    pwm.start(100.0)?;
    thread::sleep(Duration::from_millis(50));
    pwm.stop()?;
    let levels: Vec<Level> = mock.events(18).iter().map(|(_, level)| *level).collect();
    // acquire drives Low, the engine goes High once, release drives Low
    assert_eq!(levels, [Level::Low, Level::High, Level::Low]);
    Ok(())
}

#[test]
fn start_stop_start_reacquires_the_pin() -> Result<()> {
    let (mock, gpio, mut pwm) = engine(1_000.0)?;
    pwm.start(50.0)?;
    assert_eq!(pwm.state(), PwmRunState::Running);
    pwm.stop()?;
    assert_eq!(pwm.state(), PwmRunState::Stopped);
    assert!(!gpio.is_owned(PinSpec::output(18))?);
    assert!(!mock.is_open(18));
    assert_eq!(mock.level(18), Some(Level::Low));

    pwm.start(25.0)?;
    assert_eq!(pwm.state(), PwmRunState::Running);
    assert_eq!(mock.open_count(18), 2);
    pwm.stop()?;
    pwm.stop()?; // no-op once stopped
    assert_eq!(mock.release_count(18), 2);
    Ok(())
}

#[test]
fn dropping_a_running_engine_releases_the_pin_low() -> Result<()> {
    let mock = MockGpio::new();
    let gpio = Gpio::new(mock.clone());
    {
        let mut pwm = SoftPwm::new(gpio.clone(), PinSpec::output(18), PwmConfig::default())?;
        pwm.start(90.0)?;
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(mock.level(18), Some(Level::Low));
    assert!(!mock.is_open(18));
    assert!(!gpio.is_owned(PinSpec::output(18))?);
    Ok(())
}

#[test]
fn out_of_range_duty_is_rejected_without_touching_the_pin() -> Result<()> {
    let (mock, gpio, mut pwm) = engine(1_000.0)?;
    for duty in [150.0, -1.0, f64::NAN] {
        assert!(matches!(
            pwm.start(duty),
            Err(Error::InvalidParameter { .. })
        ));
    }
    assert_eq!(pwm.state(), PwmRunState::Stopped);
    assert_eq!(mock.open_count(18), 0);
    assert!(!gpio.is_owned(PinSpec::output(18))?);

    assert!(matches!(
        pwm.set_duty_cycle(101.0),
        Err(Error::InvalidParameter { .. })
    ));
    Ok(())
}

#[test]
fn set_duty_while_stopped_is_a_no_op() -> Result<()> {
    let (mock, _gpio, mut pwm) = engine(1_000.0)?;
    pwm.set_duty_cycle(40.0)?;
    assert_eq!(pwm.state(), PwmRunState::Stopped);
    assert_eq!(mock.open_count(18), 0);
    Ok(())
}

#[test]
fn duty_changes_take_effect_while_running() -> Result<()> {
    let (mock, _gpio, mut pwm) = engine(200.0)?;
    pwm.start(0.0)?;
    thread::sleep(Duration::from_millis(30));
    assert_eq!(mock.level(18), Some(Level::Low));

    pwm.set_duty_cycle(100.0)?;
    pwm.set_duty_cycle(100.0)?; // unchanged value: no-op
    assert!(wait_until(Duration::from_secs(1), || mock.level(18) == Some(Level::High)));
    assert!((pwm.status().duty_cycle_percent - 100.0).abs() < f64::EPSILON);

    pwm.start(0.0)?; // start while running only updates the duty
    assert_eq!(mock.open_count(18), 1);
    assert!(wait_until(Duration::from_secs(1), || mock.level(18) == Some(Level::Low)));
    pwm.stop()
}

#[test]
fn frequency_is_fixed_while_running() -> Result<()> {
    let (_mock, _gpio, mut pwm) = engine(1_000.0)?;
    pwm.set_frequency(250.0)?;
    assert!(matches!(
        pwm.set_frequency(0.0),
        Err(Error::InvalidParameter { .. })
    ));

    pwm.start(10.0)?;
    assert!(matches!(pwm.set_frequency(500.0), Err(Error::ResourceBusy(_))));
    pwm.stop()?;
    pwm.set_frequency(500.0)?;
    assert!((pwm.config().frequency_hz - 500.0).abs() < f64::EPSILON);
    Ok(())
}

#[test]
fn start_on_an_owned_pin_is_resource_busy() -> Result<()> {
    let (_mock, gpio, mut pwm) = engine(1_000.0)?;
    let _held = gpio.acquire(PinSpec::output(18))?;
    assert!(matches!(pwm.start(50.0), Err(Error::ResourceBusy(_))));
    assert_eq!(pwm.state(), PwmRunState::Stopped);
    Ok(())
}

#[test]
fn status_counts_completed_periods() -> Result<()> {
    let (_mock, _gpio, mut pwm) = engine(1_000.0)?;
    pwm.start(50.0)?;
    assert!(wait_until(Duration::from_secs(1), || pwm.status().cycles >= 10));
    let status = pwm.status();
    assert_eq!(status.pin, 18);
    assert_eq!(status.state, PwmRunState::Running);
    pwm.stop()
}

#[test]
fn input_pins_are_rejected() {
    let gpio = Gpio::new(MockGpio::new());
    let spec = PinSpec::input(18);
    assert_eq!(spec.direction, Direction::In);
    assert!(matches!(
        SoftPwm::new(gpio, spec, PwmConfig::default()),
        Err(Error::InvalidParameter { .. })
    ));
}

#[test]
fn pin_write_failure_stops_the_engine_and_releases() -> Result<()> {
    let (mock, gpio, mut pwm) = engine(200.0)?;
    pwm.start(50.0)?;
    thread::sleep(Duration::from_millis(20));
    mock.fail_writes(true);

    assert!(wait_until(Duration::from_secs(2), || pwm.state() == PwmRunState::Stopped));
    assert!(matches!(pwm.stop(), Err(Error::Pin { pin: 18, .. })));
    assert!(!gpio.is_owned(PinSpec::output(18))?);
    assert!(!mock.is_open(18));
    Ok(())
}

#[test]
fn low_mid_and_high_duty_cycles_converge_closely() -> Result<()> {
    for target in [5.0, 50.0, 95.0] {
        let (mock, _gpio, mut pwm) = engine(200.0)?;
        pwm.start(target)?;
        thread::sleep(Duration::from_millis(700)); // 140 periods
        pwm.stop()?;
        let duty = measured_duty(&mock.events(18));
        assert!(
            (duty - target / 100.0).abs() < 0.025,
            "target {target}%, measured duty {duty}"
        );
    }
    Ok(())
}

#[test]
fn repeating_the_running_duty_keeps_pin_and_phase() -> Result<()> {
    const PERIOD_S: f64 = 0.005;
    let (mock, _gpio, mut pwm) = engine(200.0)?;
    pwm.start(50.0)?;
    thread::sleep(Duration::from_millis(60));
    for _ in 0..10 {
        pwm.set_duty_cycle(50.0)?;
        pwm.start(50.0)?;
    }
    thread::sleep(Duration::from_millis(60));
    let status = pwm.status();
    pwm.stop()?;

    assert_eq!(status.state, PwmRunState::Running);
    assert!((status.duty_cycle_percent - 50.0).abs() < f64::EPSILON);
    assert_eq!(mock.open_count(18), 1);

    // Rising edges stay on the grid laid down by the first one.
    let events = mock.events(18);
    let rising: Vec<Instant> = events
        .windows(2)
        .filter(|pair| pair[0].1 == Level::Low && pair[1].1 == Level::High)
        .map(|pair| pair[1].0)
        .collect();
    assert!(rising.len() >= 10, "only {} rising edges", rising.len());
    let first = rising[0];
    let on_grid = rising
        .iter()
        .filter(|at| {
            let phase = (at.duration_since(first).as_secs_f64() / PERIOD_S).fract();
            !(0.2..=0.8).contains(&phase)
        })
        .count();
    assert!(on_grid * 10 >= rising.len() * 8, "{on_grid} of {} on grid", rising.len());
    Ok(())
}
