//! A software PWM engine that toggles one GPIO line from a background thread.
//!
//! See [`SoftPwm`] for usage and timing details.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::gpio::{Direction, Gpio, GpioBackend, GpioLine, Level, PinHandle, PinSpec};
use crate::output::check_percent;
use crate::{Error, Result};

/// Default software PWM frequency (Hz).
pub const SOFT_PWM_FREQUENCY_HZ_DEFAULT: f64 = 1_000.0;

// ============================================================================
// Configuration and status
// ============================================================================

/// Frequency and duty cycle of a software PWM signal.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PwmConfig {
    /// Signal frequency; fixed while the engine runs.
    pub frequency_hz: f64,
    /// Fraction of each period held High, in percent.
    pub duty_cycle_percent: f64,
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            frequency_hz: SOFT_PWM_FREQUENCY_HZ_DEFAULT,
            duty_cycle_percent: 0.0,
        }
    }
}

/// Whether the background thread is driving the pin.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum PwmRunState {
    /// No background thread; the pin is not owned.
    Stopped,
    /// Background thread owns the pin and is toggling it.
    Running,
}

/// Snapshot returned by [`SoftPwm::status`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PwmStatus {
    /// Pin the engine drives.
    pub pin: u32,
    /// Configured frequency.
    pub frequency_hz: f64,
    /// Current duty cycle.
    pub duty_cycle_percent: f64,
    /// Run state.
    pub state: PwmRunState,
    /// Completed periods since the last start.
    pub cycles: u64,
}

// ============================================================================
// Shared state between caller and background thread
// ============================================================================

struct Shared {
    duty_bits: AtomicU64,
    stop: AtomicBool,
    cycles: AtomicU64,
}

impl Shared {
    fn new(duty_cycle_percent: f64) -> Self {
        Self {
            duty_bits: AtomicU64::new(duty_cycle_percent.to_bits()),
            stop: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
        }
    }

    fn duty(&self) -> f64 {
        f64::from_bits(self.duty_bits.load(Ordering::Acquire))
    }

    fn set_duty(&self, duty_cycle_percent: f64) {
        self.duty_bits
            .store(duty_cycle_percent.to_bits(), Ordering::Release);
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

// ============================================================================
// SoftPwm
// ============================================================================

/// Software PWM on one GPIO output.
///
/// `Stopped --start(duty)--> Running --set_duty_cycle(duty)--> Running --stop()--> Stopped`
///
/// While running, a dedicated thread owns the pin. Period `k` starts at
/// `start + k * T`; the pin is High until `start + k * T + duty * T` and Low until
/// `start + (k + 1) * T`. Deadlines come from elapsed time since start, so sleep
/// overshoot never accumulates into drift. The duty value is read at the start of
/// every period.
///
/// [`stop`](Self::stop) lets the current half-period finish, drives the pin Low and
/// releases it, so stop latency is at most one period. Dropping a running engine
/// stops it the same way.
///
/// # Example
///
/// ```rust
/// use pwm_kit::gpio::{Gpio, PinSpec};
/// use pwm_kit::mock::MockGpio;
/// use pwm_kit::soft_pwm::{PwmConfig, PwmRunState, SoftPwm};
///
/// # fn main() -> pwm_kit::Result<()> {
/// let gpio = Gpio::new(MockGpio::new());
/// let config = PwmConfig { frequency_hz: 500.0, ..PwmConfig::default() };
/// let mut pwm = SoftPwm::new(gpio.clone(), PinSpec::output(33), config)?;
///
/// pwm.start(25.0)?;
/// pwm.set_duty_cycle(75.0)?;
/// assert_eq!(pwm.state(), PwmRunState::Running);
/// pwm.stop()?;
/// assert!(!gpio.is_owned(PinSpec::output(33))?); // released between runs
/// # Ok(())
/// # }
/// ```
pub struct SoftPwm<B: GpioBackend> {
    gpio: Gpio<B>,
    spec: PinSpec,
    config: PwmConfig,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl<B: GpioBackend> SoftPwm<B> {
    /// Create a stopped engine for an output pin. The pin is acquired by [`start`](Self::start).
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] if `spec` is not an output or the duty cycle is
    /// outside `0..=100`.
    pub fn new(gpio: Gpio<B>, spec: PinSpec, config: PwmConfig) -> Result<Self> {
        if spec.direction != Direction::Out {
            return Err(Error::invalid("pin direction", "software PWM needs an output"));
        }
        check_percent("duty_cycle_percent", config.duty_cycle_percent)?;
        Ok(Self {
            gpio,
            spec,
            config,
            shared: Arc::new(Shared::new(config.duty_cycle_percent)),
            worker: None,
        })
    }

    /// Acquire the pin and start toggling it at `duty_cycle_percent`.
    ///
    /// Calling `start` on a running engine only updates the duty cycle.
    ///
    /// # Errors
    /// - [`Error::InvalidParameter`] if the duty is outside `0..=100` or the frequency is not
    ///   positive.
    /// - [`Error::ResourceBusy`] if another owner holds the pin.
    /// - [`Error::TaskSpawn`] if the background thread cannot be created.
    pub fn start(&mut self, duty_cycle_percent: f64) -> Result<()> {
        check_percent("duty_cycle_percent", duty_cycle_percent)?;
        let period = period_for(self.config.frequency_hz)?;
        if self.state() == PwmRunState::Running {
            return self.set_duty_cycle(duty_cycle_percent);
        }
        if let Err(err) = self.join_worker() {
            warn!("soft_pwm: pin {} previous run ended with: {err}", self.spec.pin);
        }

        let pin = self.gpio.acquire(self.spec)?;
        self.config.duty_cycle_percent = duty_cycle_percent;
        self.shared = Arc::new(Shared::new(duty_cycle_percent));
        let shared = Arc::clone(&self.shared);
        let worker = thread::Builder::new()
            .name(format!("soft-pwm-{}", self.spec.pin))
            .spawn(move || run_square_wave(pin, &shared, period))
            .map_err(|err| Error::TaskSpawn(err.to_string()))?;
        self.worker = Some(worker);
        info!(
            "soft_pwm: pin {} started at {}Hz, duty {}%",
            self.spec.pin, self.config.frequency_hz, duty_cycle_percent
        );
        Ok(())
    }

    /// Change the duty cycle; the background thread picks it up at the next period.
    ///
    /// A no-op while stopped or when the value is unchanged.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] if the duty is outside `0..=100`.
    pub fn set_duty_cycle(&mut self, duty_cycle_percent: f64) -> Result<()> {
        check_percent("duty_cycle_percent", duty_cycle_percent)?;
        if self.state() == PwmRunState::Stopped {
            return Ok(());
        }
        if self.shared.duty().to_bits() == duty_cycle_percent.to_bits() {
            return Ok(());
        }
        debug!(
            "soft_pwm: pin {} duty {}% -> {}%",
            self.spec.pin,
            self.shared.duty(),
            duty_cycle_percent
        );
        self.shared.set_duty(duty_cycle_percent);
        self.config.duty_cycle_percent = duty_cycle_percent;
        Ok(())
    }

    /// Change the frequency of a stopped engine.
    ///
    /// # Errors
    /// - [`Error::ResourceBusy`] while running; stop first.
    /// - [`Error::InvalidParameter`] if `frequency_hz` is not positive.
    pub fn set_frequency(&mut self, frequency_hz: f64) -> Result<()> {
        if self.state() == PwmRunState::Running {
            return Err(Error::ResourceBusy(format!(
                "pin {}: frequency is fixed while running",
                self.spec.pin
            )));
        }
        period_for(frequency_hz)?;
        self.config.frequency_hz = frequency_hz;
        Ok(())
    }

    /// Stop toggling, drive the pin Low and release it. A no-op while stopped.
    ///
    /// # Errors
    /// Returns the pin error that ended the background thread, if any, or
    /// [`Error::TaskPanicked`].
    pub fn stop(&mut self) -> Result<()> {
        if self.worker.is_none() {
            return Ok(());
        }
        self.shared.stop.store(true, Ordering::Release);
        let outcome = self.join_worker();
        info!(
            "soft_pwm: pin {} stopped after {} cycles",
            self.spec.pin,
            self.shared.cycles.load(Ordering::Relaxed)
        );
        outcome
    }

    fn join_worker(&mut self) -> Result<()> {
        match self.worker.take() {
            None => Ok(()),
            Some(worker) => worker.join().unwrap_or(Err(Error::TaskPanicked)),
        }
    }

    /// Current run state. A background thread that exited on a pin error counts as stopped.
    #[must_use]
    pub fn state(&self) -> PwmRunState {
        match &self.worker {
            Some(worker) if !worker.is_finished() => PwmRunState::Running,
            _ => PwmRunState::Stopped,
        }
    }

    /// Configured frequency and most recent duty cycle.
    #[must_use]
    pub const fn config(&self) -> PwmConfig {
        self.config
    }

    /// Pin this engine drives.
    #[must_use]
    pub const fn spec(&self) -> PinSpec {
        self.spec
    }

    /// Snapshot of configuration, state and completed periods.
    #[must_use]
    pub fn status(&self) -> PwmStatus {
        PwmStatus {
            pin: self.spec.pin,
            frequency_hz: self.config.frequency_hz,
            duty_cycle_percent: self.config.duty_cycle_percent,
            state: self.state(),
            cycles: self.shared.cycles.load(Ordering::Relaxed),
        }
    }
}

impl<B: GpioBackend> Drop for SoftPwm<B> {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!("soft_pwm: pin {} stop on drop failed: {err}", self.spec.pin);
        }
    }
}

// ============================================================================
// Background loop
// ============================================================================

fn period_for(frequency_hz: f64) -> Result<Duration> {
    if !frequency_hz.is_finite() || frequency_hz <= 0.0 {
        return Err(Error::invalid("frequency_hz", frequency_hz));
    }
    Duration::try_from_secs_f64(1.0 / frequency_hz)
        .map_err(|_| Error::invalid("frequency_hz", frequency_hz))
}

fn run_square_wave<L: GpioLine>(
    mut pin: PinHandle<L>,
    shared: &Shared,
    period: Duration,
) -> Result<()> {
    let outcome = drive_square_wave(&mut pin, shared, period);
    if let Err(err) = &outcome {
        error!("soft_pwm: pin {} stopped on error: {err}", pin.spec().pin);
    }
    // Drives Low before giving the line back.
    let released = pin.release();
    outcome.and(released)
}

fn drive_square_wave<L: GpioLine>(
    pin: &mut PinHandle<L>,
    shared: &Shared,
    period: Duration,
) -> Result<()> {
    let start = Instant::now();
    let period_ns = (period.as_nanos() as u64).max(1);
    let at = |ns: u64| start + Duration::from_nanos(ns);
    let mut level = Level::Low;
    let mut cycle: u64 = 0;

    while !shared.stop_requested() {
        // Skip periods lost to a scheduling stall instead of replaying them.
        cycle = cycle.max(start.elapsed().as_nanos() as u64 / period_ns);
        let cycle_start_ns = cycle.saturating_mul(period_ns);
        let high_ns = (period_ns as f64 * shared.duty() / 100.0).round() as u64;

        if high_ns > 0 {
            if level != Level::High {
                pin.set(Level::High)?;
                level = Level::High;
            }
            sleep_until(at(cycle_start_ns.saturating_add(high_ns)));
            if shared.stop_requested() {
                break;
            }
        }
        if high_ns < period_ns {
            if level != Level::Low {
                pin.set(Level::Low)?;
                level = Level::Low;
            }
            sleep_until(at(cycle_start_ns.saturating_add(period_ns)));
        }

        cycle = cycle.saturating_add(1);
        shared.cycles.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

fn sleep_until(deadline: Instant) {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if !remaining.is_zero() {
        thread::sleep(remaining);
    }
}
