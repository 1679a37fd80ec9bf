//! Host fakes for the hardware seams, used by tests, doc examples and dry runs.
//!
//! - [`MockGpio`] is a [`GpioBackend`] that records every level written with its timestamp.
//! - [`MockPca9685`] is an `embedded-hal` [`I2c`] bus with one PCA9685 register file on it.
//! - [`MockDelay`] is a [`DelayNs`] that records pauses instead of sleeping.
//!
//! Every fake is a cheap handle over shared state: keep a clone to inspect what the
//! code under test did.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};

use crate::gpio::{Direction, GpioBackend, GpioLine, Level, Numbering};
use crate::pca9685::registers::{
    CHANNEL_COUNT, LED0_ON_L, MODE1, MODE1_AI, MODE1_SLEEP, MODE2, PRE_SCALE,
};
use crate::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// MockGpio
// ============================================================================

#[derive(Debug, Default)]
struct LineRecord {
    level: Option<Level>,
    input: Option<Level>,
    direction: Option<Direction>,
    events: Vec<(Instant, Level)>,
    open: bool,
    opens: usize,
    releases: usize,
}

#[derive(Debug, Default)]
struct GpioState {
    board_map: HashMap<u32, u32>,
    lines: HashMap<u32, LineRecord>,
    fail_writes: bool,
    unavailable: bool,
}

/// In-memory GPIO controller.
///
/// Board pins resolve through an optional board map and fall back to the same number;
/// SoC numbers are used as-is.
#[derive(Clone, Debug, Default)]
pub struct MockGpio {
    state: Arc<Mutex<GpioState>>,
}

impl MockGpio {
    /// A controller where every line can be opened.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A controller whose board pins resolve through `map` (`board pin -> line offset`).
    #[must_use]
    pub fn with_board_map(map: impl IntoIterator<Item = (u32, u32)>) -> Self {
        let gpio = Self::new();
        lock(&gpio.state).board_map.extend(map);
        gpio
    }

    /// A controller whose subsystem cannot be opened.
    #[must_use]
    pub fn unavailable() -> Self {
        let gpio = Self::new();
        lock(&gpio.state).unavailable = true;
        gpio
    }

    /// Make every subsequent line write fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    /// Level an input line reads back.
    pub fn set_input(&self, offset: u32, level: Level) {
        lock(&self.state).lines.entry(offset).or_default().input = Some(level);
    }

    /// Last level written to a line, `None` if never written.
    #[must_use]
    pub fn level(&self, offset: u32) -> Option<Level> {
        lock(&self.state).lines.get(&offset).and_then(|line| line.level)
    }

    /// Every level written to a line, with the time of the write.
    #[must_use]
    pub fn events(&self, offset: u32) -> Vec<(Instant, Level)> {
        lock(&self.state)
            .lines
            .get(&offset)
            .map(|line| line.events.clone())
            .unwrap_or_default()
    }

    /// Whether a line is currently open.
    #[must_use]
    pub fn is_open(&self, offset: u32) -> bool {
        lock(&self.state).lines.get(&offset).is_some_and(|line| line.open)
    }

    /// Times a line has been opened.
    #[must_use]
    pub fn open_count(&self, offset: u32) -> usize {
        lock(&self.state).lines.get(&offset).map_or(0, |line| line.opens)
    }

    /// Times a line has been released.
    #[must_use]
    pub fn release_count(&self, offset: u32) -> usize {
        lock(&self.state).lines.get(&offset).map_or(0, |line| line.releases)
    }

    /// Direction a line was last opened in.
    #[must_use]
    pub fn direction(&self, offset: u32) -> Option<Direction> {
        lock(&self.state).lines.get(&offset).and_then(|line| line.direction)
    }
}

impl GpioBackend for MockGpio {
    type Line = MockLine;

    fn line_offset(&self, pin: u32, numbering: Numbering) -> Result<u32> {
        Ok(match numbering {
            Numbering::Board => lock(&self.state).board_map.get(&pin).copied().unwrap_or(pin),
            Numbering::Soc => pin,
        })
    }

    fn open(&self, offset: u32, direction: Direction) -> Result<MockLine> {
        let mut state = lock(&self.state);
        if state.unavailable {
            return Err(Error::HardwareUnavailable("mock GPIO controller is offline".into()));
        }
        let line = state.lines.entry(offset).or_default();
        line.open = true;
        line.opens += 1;
        line.direction = Some(direction);
        Ok(MockLine {
            offset,
            state: Arc::clone(&self.state),
        })
    }
}

/// A line opened on a [`MockGpio`].
#[derive(Debug)]
pub struct MockLine {
    offset: u32,
    state: Arc<Mutex<GpioState>>,
}

impl GpioLine for MockLine {
    fn set_level(&mut self, level: Level) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_writes {
            return Err(Error::Pin {
                pin: self.offset,
                message: "injected write failure".into(),
            });
        }
        let line = state.lines.entry(self.offset).or_default();
        line.level = Some(level);
        line.events.push((Instant::now(), level));
        Ok(())
    }

    fn level(&mut self) -> Result<Level> {
        let state = lock(&self.state);
        let line = state.lines.get(&self.offset);
        Ok(line
            .and_then(|line| line.input.or(line.level))
            .unwrap_or(Level::Low))
    }

    fn release(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        let line = state.lines.entry(self.offset).or_default();
        line.open = false;
        line.releases += 1;
        Ok(())
    }
}

// ============================================================================
// MockPca9685
// ============================================================================

/// Error returned by [`MockPca9685`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MockI2cError(pub ErrorKind);

impl embedded_hal::i2c::Error for MockI2cError {
    fn kind(&self) -> ErrorKind {
        self.0
    }
}

struct ChipState {
    registers: [u8; 256],
    pointer: u8,
    // `None` lets one transaction through.
    failures: VecDeque<Option<ErrorKind>>,
    transactions: usize,
    writes: Vec<Vec<u8>>,
}

impl ChipState {
    fn power_on() -> Self {
        let mut registers = [0_u8; 256];
        registers[usize::from(MODE1)] = 0x11;
        registers[usize::from(MODE2)] = 0x04;
        registers[0x05] = 0xE0; // ALLCALLADR
        registers[usize::from(PRE_SCALE)] = 0x1E;
        for channel in 0..CHANNEL_COUNT {
            // LEDn_OFF_H full-off bit
            registers[usize::from(LED0_ON_L + 4 * channel + 3)] = 0x10;
        }
        Self {
            registers,
            pointer: 0,
            failures: VecDeque::new(),
            transactions: 0,
            writes: Vec::new(),
        }
    }

    fn advance(&mut self) {
        if self.registers[usize::from(MODE1)] & MODE1_AI != 0 {
            self.pointer = self.pointer.wrapping_add(1);
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        self.writes.push(bytes.to_vec());
        let Some((&pointer, data)) = bytes.split_first() else {
            return;
        };
        self.pointer = pointer;
        for &value in data {
            let sleeping = self.registers[usize::from(MODE1)] & MODE1_SLEEP != 0;
            // PRE_SCALE only latches while the oscillator is off.
            if self.pointer != PRE_SCALE || sleeping {
                self.registers[usize::from(self.pointer)] = value;
            }
            self.advance();
        }
    }

    fn read(&mut self, buffer: &mut [u8]) {
        for byte in buffer {
            *byte = self.registers[usize::from(self.pointer)];
            self.advance();
        }
    }
}

/// An I2C bus with a single PCA9685 answering at one address.
///
/// Register writes follow the chip: auto-increment only while MODE1.AI is set, and
/// PRE_SCALE ignores writes unless MODE1.SLEEP is set. Other addresses are not
/// acknowledged.
#[derive(Clone)]
pub struct MockPca9685 {
    address: u8,
    state: Arc<Mutex<ChipState>>,
}

impl MockPca9685 {
    /// A chip at `address` with power-on register values.
    #[must_use]
    pub fn new(address: u8) -> Self {
        Self {
            address,
            state: Arc::new(Mutex::new(ChipState::power_on())),
        }
    }

    /// Fail the next `count` transactions with [`ErrorKind::Other`].
    pub fn fail_next(&self, count: usize) {
        self.fail_next_with(ErrorKind::Other, count);
    }

    /// Fail the next `count` transactions with `kind`.
    pub fn fail_next_with(&self, kind: ErrorKind, count: usize) {
        lock(&self.state).failures.extend(core::iter::repeat_n(Some(kind), count));
    }

    /// Let `passes` transactions through, then fail the following `count` with `kind`.
    pub fn fail_after(&self, passes: usize, kind: ErrorKind, count: usize) {
        let mut state = lock(&self.state);
        state.failures.extend(core::iter::repeat_n(None, passes));
        state.failures.extend(core::iter::repeat_n(Some(kind), count));
    }

    /// Transactions attempted so far, failed ones included.
    #[must_use]
    pub fn transactions(&self) -> usize {
        lock(&self.state).transactions
    }

    /// Current value of a register.
    #[must_use]
    pub fn register(&self, register: u8) -> u8 {
        lock(&self.state).registers[usize::from(register)]
    }

    /// Overwrite a register, bypassing the bus.
    pub fn set_register(&self, register: u8, value: u8) {
        lock(&self.state).registers[usize::from(register)] = value;
    }

    /// `(on_tick, off_tick)` of a channel, keeping the 12 tick bits.
    ///
    /// # Panics
    /// Panics if `channel` is above 15.
    #[must_use]
    pub fn channel(&self, channel: u8) -> (u16, u16) {
        assert!(channel < CHANNEL_COUNT, "channel {channel} out of range");
        let state = lock(&self.state);
        let base = usize::from(LED0_ON_L + 4 * channel);
        let tick = |low: usize| {
            u16::from_le_bytes([state.registers[low], state.registers[low + 1]]) & 0x0FFF
        };
        (tick(base), tick(base + 2))
    }

    /// Every successful write, as sent on the bus (register pointer first).
    #[must_use]
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).writes.clone()
    }

    /// Forget recorded writes and reset the transaction count.
    pub fn clear_writes(&self) {
        let mut state = lock(&self.state);
        state.writes.clear();
        state.transactions = 0;
    }
}

impl ErrorType for MockPca9685 {
    type Error = MockI2cError;
}

impl I2c for MockPca9685 {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> core::result::Result<(), MockI2cError> {
        let mut state = lock(&self.state);
        state.transactions += 1;
        if let Some(kind) = state.failures.pop_front().flatten() {
            return Err(MockI2cError(kind));
        }
        if address != self.address {
            return Err(MockI2cError(ErrorKind::NoAcknowledge(
                NoAcknowledgeSource::Address,
            )));
        }
        for operation in operations {
            match operation {
                Operation::Write(bytes) => state.write(bytes),
                Operation::Read(buffer) => state.read(buffer),
            }
        }
        Ok(())
    }
}

// ============================================================================
// MockDelay
// ============================================================================

/// A [`DelayNs`] that returns immediately and records each requested pause.
#[derive(Clone, Debug, Default)]
pub struct MockDelay {
    pauses: Arc<Mutex<Vec<Duration>>>,
}

impl MockDelay {
    /// An empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pauses requested so far.
    #[must_use]
    pub fn pauses(&self) -> Vec<Duration> {
        lock(&self.pauses).clone()
    }

    /// Sum of all pauses requested so far.
    #[must_use]
    pub fn total(&self) -> Duration {
        lock(&self.pauses).iter().sum()
    }
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        lock(&self.pauses).push(Duration::from_nanos(u64::from(ns)));
    }

    fn delay_us(&mut self, us: u32) {
        lock(&self.pauses).push(Duration::from_micros(u64::from(us)));
    }
}
