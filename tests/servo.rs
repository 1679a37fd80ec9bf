#![allow(missing_docs)]
//! Host-level tests for the servo actuator.

use std::sync::Arc;
use std::time::Duration;

use pwm_kit::gpio::{Gpio, PinSpec};
use pwm_kit::mock::{MockDelay, MockGpio, MockPca9685};
use pwm_kit::output::AngleOutput;
use pwm_kit::pca9685::{ChipChannel, Pca9685};
use pwm_kit::pca9685::registers::ServoAngleMap;
use pwm_kit::servo::{AtEnd, SERVO_FREQUENCY_HZ, Servo, linear};
use pwm_kit::soft_pwm::PwmRunState;
use pwm_kit::{Error, Result};

/// Records every angle it is asked for.
struct Recorder {
    map: ServoAngleMap,
    angles: Vec<f64>,
    relaxed: usize,
}

impl Recorder {
    fn new(map: ServoAngleMap) -> Self {
        Self {
            map,
            angles: Vec::new(),
            relaxed: 0,
        }
    }
}

impl AngleOutput for Recorder {
    fn angle_map(&self) -> ServoAngleMap {
        self.map
    }

    fn drive_angle(&mut self, degrees: f64) -> Result<()> {
        self.angles.push(degrees);
        Ok(())
    }

    fn relax(&mut self) -> Result<()> {
        self.relaxed += 1;
        Ok(())
    }
}

type ChipServo = Servo<ChipChannel<MockPca9685>, MockDelay>;

fn chip_servo() -> Result<(MockPca9685, ChipServo)> {
    let bus = MockPca9685::new(0x40);
    let chip = Arc::new(Pca9685::new(bus.clone(), 0x40)?);
    let servo = Servo::on_chip(&chip, 0)?.with_delay(MockDelay::new());
    Ok((bus, servo))
}

#[test]
fn chip_servo_maps_angles_to_ticks() -> Result<()> {
    let (bus, mut servo) = chip_servo()?;
    servo.set_angle(90.0)?;
    assert_eq!(bus.channel(0), (0, 307));
    servo.set_angle(0.0)?;
    assert_eq!(bus.channel(0), (0, 205));
    servo.set_angle(180.0)?;
    assert_eq!(bus.channel(0), (0, 410));
    assert_eq!(servo.angle(), Some(180.0));
    Ok(())
}

#[test]
fn out_of_range_angles_drive_nothing() -> Result<()> {
    let (bus, mut servo) = chip_servo()?;
    servo.set_angle(45.0)?;
    bus.clear_writes();
    for degrees in [-1.0, 180.5, f64::NAN] {
        assert!(matches!(
            servo.set_angle(degrees),
            Err(Error::InvalidParameter { name: "angle", .. })
        ));
    }
    assert!(bus.writes().is_empty());
    assert_eq!(servo.angle(), Some(45.0));
    Ok(())
}

#[test]
fn center_and_relax() -> Result<()> {
    let (bus, mut servo) = chip_servo()?;
    servo.center()?;
    assert_eq!(bus.channel(0), (0, 307));
    assert_eq!(servo.angle(), Some(90.0));

    servo.relax()?;
    assert_eq!(bus.channel(0), (0, 0));
    assert_eq!(servo.angle(), None);
    Ok(())
}

#[test]
fn animate_checks_every_step_before_moving() -> Result<()> {
    let mut servo = Servo::new(Recorder::new(ServoAngleMap::default()))?;
    let steps = [(10.0, Duration::ZERO), (200.0, Duration::ZERO)];
    assert!(matches!(
        servo.animate(steps, AtEnd::Hold),
        Err(Error::InvalidParameter { .. })
    ));
    assert!(servo.output().angles.is_empty());
    Ok(())
}

#[test]
fn animate_plays_steps_then_holds_or_relaxes() -> Result<()> {
    let delay = MockDelay::new();
    let mut servo = Servo::new(Recorder::new(ServoAngleMap::default()))?.with_delay(delay.clone());

    servo.animate(linear(0.0, 180.0, Duration::from_millis(900), 3), AtEnd::Hold)?;
    assert_eq!(servo.output().angles, vec![0.0, 90.0, 180.0]);
    assert_eq!(delay.pauses(), vec![Duration::from_millis(300); 3]);
    assert_eq!(servo.angle(), Some(180.0));
    assert_eq!(servo.output().relaxed, 0);

    servo.animate([(30.0, Duration::from_millis(10))], AtEnd::Relax)?;
    assert_eq!(servo.output().relaxed, 1);
    assert_eq!(servo.angle(), None);
    Ok(())
}

#[test]
fn sweep_moves_evenly_and_holds_the_end() -> Result<()> {
    let delay = MockDelay::new();
    let mut servo = Servo::new(Recorder::new(ServoAngleMap::default()))?.with_delay(delay.clone());
    servo.sweep(180.0, 0.0, Duration::from_secs(1), 5)?;
    assert_eq!(servo.output().angles, vec![180.0, 135.0, 90.0, 45.0, 0.0]);
    assert_eq!(delay.total(), Duration::from_secs(1));
    assert_eq!(servo.angle(), Some(0.0));
    Ok(())
}

#[test]
fn custom_angle_range_is_validated_and_centered() -> Result<()> {
    let map = ServoAngleMap {
        min_angle: -90.0,
        max_angle: 90.0,
        ..ServoAngleMap::default()
    };
    let mut servo = Servo::new(Recorder::new(map))?;
    servo.set_angle(-90.0)?;
    servo.center()?;
    assert!(servo.set_angle(120.0).is_err());
    assert_eq!(servo.output().angles, vec![-90.0, 0.0]);
    Ok(())
}

#[test]
fn invalid_angle_map_is_rejected() {
    let map = ServoAngleMap {
        min_pulse_us: 2_000.0,
        max_pulse_us: 1_000.0,
        ..ServoAngleMap::default()
    };
    assert!(matches!(
        Servo::new(Recorder::new(map)),
        Err(Error::InvalidParameter { .. })
    ));
}

#[test]
fn software_servo_runs_at_50_hz_with_pulse_duty() -> Result<()> {
    let mock = MockGpio::new();
    let gpio = Gpio::new(mock.clone());
    let mut servo = Servo::software(gpio.clone(), PinSpec::output(32), ServoAngleMap::default())?;

    servo.set_angle(90.0)?;
    let status = servo.output().engine().status();
    assert_eq!(status.state, PwmRunState::Running);
    assert!((status.frequency_hz - SERVO_FREQUENCY_HZ).abs() < f64::EPSILON);
    assert!((status.duty_cycle_percent - 7.5).abs() < 1e-9); // 1500 µs of 20 000 µs

    servo.set_angle(180.0)?;
    assert!((servo.output().engine().status().duty_cycle_percent - 10.0).abs() < 1e-9);

    servo.relax()?;
    assert_eq!(servo.output().engine().state(), PwmRunState::Stopped);
    assert!(!gpio.is_owned(PinSpec::output(32))?);
    assert_eq!(mock.open_count(32), 1);
    Ok(())
}

#[test]
fn software_servo_rejects_pulses_longer_than_a_frame() {
    let map = ServoAngleMap {
        max_pulse_us: 25_000.0,
        ..ServoAngleMap::default()
    };
    let gpio = Gpio::new(MockGpio::new());
    assert!(matches!(
        Servo::software(gpio, PinSpec::output(32), map),
        Err(Error::InvalidParameter { name: "max_pulse_us", .. })
    ));
}
