//! Board abstraction
//!
//! Everything the core touches on the hardware goes through the `Board`
//! trait: ADC sequencing, heater/fan PWM, the probe modulation output,
//! drives, endstops, the watchdog and ATX power. `SimBoard` is the
//! reference implementation used by the simulator binary and the tests;
//! its state is shared behind a handle so a test can poke ADC values and
//! observe outputs while the platform owns the boxed trait object.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// ADC resolution: 12-bit conversions.
pub const AD_RANGE: u32 = 4095;

/// Raw readings at or above this value mean the input is floating
/// (thermistor disconnected).
pub const AD_DISCONNECTED: u32 = AD_RANGE - 3;

/// Identifier of one analog input.
pub type AdcChannel = usize;

/// State of one endstop input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndstopState {
    /// No switch fitted at this end of the axis.
    NotFitted,
    /// Switch present, not pressed.
    Open,
    /// Switch pressed.
    Hit,
}

/// Hardware access used by the platform.
///
/// `start_adc_conversion`/`read_adc` model the one-conversion-at-a-time
/// ADC the tick sampler multiplexes: a conversion is started on one tick
/// and its result collected on the next.
pub trait Board {
    /// Begin a conversion on the given channel.
    fn start_adc_conversion(&mut self, channel: AdcChannel);

    /// Collect the completed conversion from the given channel.
    fn read_adc(&mut self, channel: AdcChannel) -> u16;

    /// Pet the watchdog.
    fn kick_watchdog(&mut self);

    /// Drive the Z-probe modulation output.
    fn set_probe_modulation(&mut self, on: bool);

    /// Set a heater output. `power` is a fraction in [0, 1].
    fn set_heater_pwm(&mut self, heater: usize, power: f64);

    /// Set the cooling fan output. `value` is a fraction in [0, 1].
    fn set_fan_pwm(&mut self, value: f64);

    /// Energise a drive.
    fn enable_drive(&mut self, drive: usize);

    /// De-energise a drive.
    fn disable_drive(&mut self, drive: usize);

    /// Program a motor current in milliamps.
    fn set_motor_current(&mut self, drive: usize, milliamps: f64);

    /// Read the low-end endstop of a drive.
    fn low_endstop(&self, drive: usize) -> EndstopState;

    /// Read the high-end endstop of a drive.
    fn high_endstop(&self, drive: usize) -> EndstopState;

    /// Switch the ATX power supply output.
    fn set_atx_power(&mut self, on: bool);

    /// Read the ATX power supply output state.
    fn atx_power(&self) -> bool;
}

/// Time source. Integer milliseconds from boot, so resolution does not
/// degrade with uptime.
pub trait Clock {
    /// Milliseconds since boot.
    fn millis(&self) -> u64;

    /// Microseconds since boot, for short intervals such as the fan tacho.
    fn micros(&self) -> u64;
}

/// Wall clock starting at construction.
#[derive(Debug)]
pub struct SystemClock {
    start: std::time::Instant,
}

impl SystemClock {
    /// Clock starting now.
    pub fn new() -> Self {
        SystemClock {
            start: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn micros(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

/// Manually stepped clock for tests. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_micros: Arc<AtomicU64>,
}

impl ManualClock {
    /// Clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance by a number of milliseconds.
    pub fn advance(&self, millis: u64) {
        self.now_micros.fetch_add(millis * 1000, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn millis(&self) -> u64 {
        self.now_micros.load(Ordering::Relaxed) / 1000
    }

    fn micros(&self) -> u64 {
        self.now_micros.load(Ordering::Relaxed)
    }
}

/// Observable state of the simulated board.
#[derive(Debug)]
pub struct SimBoardState {
    /// Value each analog channel converts to.
    pub adc_values: Vec<u16>,
    /// Channel with a conversion in flight.
    pub pending_conversion: Option<AdcChannel>,
    /// Heater PWM outputs as last written.
    pub heater_pwms: Vec<f64>,
    /// Fan PWM output as last written.
    pub fan_pwm: f64,
    /// Probe modulation output state.
    pub probe_modulation: bool,
    /// Per-drive enabled flags.
    pub drives_enabled: Vec<bool>,
    /// Per-drive programmed currents in mA.
    pub motor_currents: Vec<f64>,
    /// Low endstop states, settable by tests.
    pub low_endstops: Vec<EndstopState>,
    /// High endstop states, settable by tests.
    pub high_endstops: Vec<EndstopState>,
    /// Watchdog kick counter.
    pub watchdog_kicks: u64,
    /// ATX supply output.
    pub atx_on: bool,
}

/// Simulated board. Clone the handle before boxing it into the platform
/// to keep observing and driving its state.
#[derive(Debug, Clone)]
pub struct SimBoard {
    state: Arc<Mutex<SimBoardState>>,
}

impl SimBoard {
    /// Board with `channels` analog inputs, all reading mid-scale.
    pub fn new(channels: usize, heaters: usize, drives: usize) -> Self {
        SimBoard {
            state: Arc::new(Mutex::new(SimBoardState {
                adc_values: vec![2048; channels],
                pending_conversion: None,
                heater_pwms: vec![0.0; heaters],
                fan_pwm: 0.0,
                probe_modulation: false,
                drives_enabled: vec![false; drives],
                motor_currents: vec![0.0; drives],
                low_endstops: vec![EndstopState::Open; drives],
                high_endstops: vec![EndstopState::NotFitted; drives],
                watchdog_kicks: 0,
                atx_on: false,
            })),
        }
    }

    /// Lock and inspect or mutate the board state.
    pub fn state(&self) -> std::sync::MutexGuard<'_, SimBoardState> {
        self.state.lock().unwrap()
    }

    /// Set the value a channel will convert to.
    pub fn set_adc_value(&self, channel: AdcChannel, value: u16) {
        self.state().adc_values[channel] = value;
    }
}

impl Board for SimBoard {
    fn start_adc_conversion(&mut self, channel: AdcChannel) {
        self.state().pending_conversion = Some(channel);
    }

    fn read_adc(&mut self, channel: AdcChannel) -> u16 {
        let mut s = self.state();
        debug_assert_eq!(s.pending_conversion, Some(channel));
        s.pending_conversion = None;
        s.adc_values[channel]
    }

    fn kick_watchdog(&mut self) {
        self.state().watchdog_kicks += 1;
    }

    fn set_probe_modulation(&mut self, on: bool) {
        self.state().probe_modulation = on;
    }

    fn set_heater_pwm(&mut self, heater: usize, power: f64) {
        self.state().heater_pwms[heater] = power.clamp(0.0, 1.0);
    }

    fn set_fan_pwm(&mut self, value: f64) {
        self.state().fan_pwm = value.clamp(0.0, 1.0);
    }

    fn enable_drive(&mut self, drive: usize) {
        self.state().drives_enabled[drive] = true;
    }

    fn disable_drive(&mut self, drive: usize) {
        self.state().drives_enabled[drive] = false;
    }

    fn set_motor_current(&mut self, drive: usize, milliamps: f64) {
        self.state().motor_currents[drive] = milliamps;
    }

    fn low_endstop(&self, drive: usize) -> EndstopState {
        self.state().low_endstops[drive]
    }

    fn high_endstop(&self, drive: usize) -> EndstopState {
        self.state().high_endstops[drive]
    }

    fn set_atx_power(&mut self, on: bool) {
        self.state().atx_on = on;
    }

    fn atx_power(&self) -> bool {
        self.state().atx_on
    }
}
