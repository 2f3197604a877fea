//! Platform facade
//!
//! Single front door to everything below the G-code layer: the board,
//! the clock, the tick sampler, the non-volatile store, the file store,
//! the serial channels and the message router. The dispatcher talks to
//! this facade and to the motion/heat collaborators only.

use crate::board::{AdcChannel, Board, Clock, EndstopState, AD_DISCONNECTED, AD_RANGE};
use crate::config::{
    reset_reason, Compatibility, NvBackend, NvStore, SoftwareResetData, ZProbeType, RESET_MAGIC,
};
use crate::filestore::{FileStore, MassStorage, CONFIG_FILE};
use crate::params::{PidParameters, ZProbeParameters, ABS_ZERO};
use crate::tick::TickSampler;
use printforge_core::{
    ConfigError, DestinationQueue, OutputPool, Result, WebChannel, WebSource, AXES, DRIVES,
    HEATERS,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Error bit: a thermistor reported an over-temperature or disconnected
/// reading and the heater was cut.
pub const ERROR_BAD_TEMP: u32 = 1 << 0;

/// Error bit: an output message was dropped because the pool was full.
pub const ERROR_OUTPUT_STARVED: u32 = 1 << 1;

/// Tacho pulses per RPM calculation window.
const FAN_TACHO_PULSES_PER_CALC: u32 = 4;

/// Fan RPM readings older than this are reported as zero.
const FAN_RPM_STALE_MICROS: u64 = 3_000_000;

/// Interval between "module spinning" debug reports.
const SPIN_REPORT_MILLIS: u64 = 60_000;

/// Result of an endstop query for one drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndStopHit {
    /// No stop reached.
    NoStop,
    /// The low-end stop (or the Z probe) has triggered.
    LowHit,
    /// The probe is within 90% of its trigger level; the planner slows.
    LowNear,
    /// The high-end stop has triggered.
    HighHit,
}

/// Message destinations, mapped from a message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Blocking write to the USB port. Dangerous: may stall the loop.
    Debug,
    /// Non-blocking message to the USB host.
    Host,
    /// Blocking write to the AUX device. No flow control on that port.
    Aux,
    /// Non-blocking message to the HTTP and Telnet clients.
    Web,
    /// Non-blocking message to USB, HTTP and Telnet together.
    Generic,
}

/// A byte-oriented serial port.
pub trait SerialChannel {
    /// True when a received byte is waiting.
    fn byte_available(&self) -> bool;

    /// Take one received byte.
    fn read_byte(&mut self) -> Option<u8>;

    /// How many bytes a non-blocking write can accept right now.
    fn can_write(&self) -> usize;

    /// Non-blocking write; returns how many bytes were accepted.
    fn write(&mut self, data: &[u8]) -> usize;

    /// Blocking write of the whole buffer.
    fn write_blocking(&mut self, data: &[u8]);
}

/// In-memory serial port for the simulator and tests. Clones share the
/// same buffers, so keep one as a handle for injecting input and reading
/// output after boxing the other into the platform.
#[derive(Debug, Clone)]
pub struct SimSerial {
    input: std::sync::Arc<std::sync::Mutex<std::collections::VecDeque<u8>>>,
    output: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
    write_room: std::sync::Arc<std::sync::Mutex<usize>>,
}

impl SimSerial {
    /// Port with effectively unlimited write room.
    pub fn new() -> Self {
        SimSerial {
            input: Default::default(),
            output: Default::default(),
            write_room: std::sync::Arc::new(std::sync::Mutex::new(usize::MAX)),
        }
    }

    /// Queue bytes as if received from the host.
    pub fn inject(&self, data: &[u8]) {
        self.input.lock().unwrap().extend(data);
    }

    /// Take and clear the accumulated output.
    pub fn take_output(&self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut *self.output.lock().unwrap())).into_owned()
    }

    /// Limit how many bytes each non-blocking write accepts.
    pub fn set_write_room(&self, room: usize) {
        *self.write_room.lock().unwrap() = room;
    }
}

impl Default for SimSerial {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialChannel for SimSerial {
    fn byte_available(&self) -> bool {
        !self.input.lock().unwrap().is_empty()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.input.lock().unwrap().pop_front()
    }

    fn can_write(&self) -> usize {
        *self.write_room.lock().unwrap()
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(*self.write_room.lock().unwrap());
        self.output.lock().unwrap().extend_from_slice(&data[..take]);
        take
    }

    fn write_blocking(&mut self, data: &[u8]) {
        self.output.lock().unwrap().extend_from_slice(data);
    }
}

/// Everything the platform is built from.
pub struct PlatformDeps {
    /// Hardware access.
    pub board: Box<dyn Board + Send>,
    /// Time source.
    pub clock: Box<dyn Clock + Send>,
    /// Non-volatile storage backend.
    pub nv: Box<dyn NvBackend + Send>,
    /// Root of the removable storage tree.
    pub storage_root: PathBuf,
    /// The USB host link.
    pub usb: Box<dyn SerialChannel + Send>,
    /// The AUX device link.
    pub aux: Box<dyn SerialChannel + Send>,
}

/// The platform facade.
pub struct Platform {
    board: Box<dyn Board + Send>,
    clock: Box<dyn Clock + Send>,
    nv: NvStore,
    storage: MassStorage,
    sampler: TickSampler,

    pool: OutputPool,
    usb_queue: DestinationQueue,
    http_queue: DestinationQueue,
    telnet_queue: DestinationQueue,
    usb: Box<dyn SerialChannel + Send>,
    aux: Box<dyn SerialChannel + Send>,
    indent: usize,

    error_code_bits: u32,
    heater_faults: [bool; HEATERS],
    z_probing: bool,
    reset_pending: Option<u16>,
    boot_reset_record: Option<SoftwareResetData>,
    min_free_ram: u32,
    debug_level: i32,

    axis_minima: [f64; AXES],
    axis_maxima: [f64; AXES],
    home_feedrates: [f64; AXES],
    max_feedrates: [f64; DRIVES],
    instant_dvs: [f64; DRIVES],
    accelerations: [f64; DRIVES],
    steps_per_unit: [f64; DRIVES],
    motor_currents: [f64; DRIVES],
    fan_value: f64,

    fan_pulse_count: AtomicU32,
    fan_interval_micros: AtomicU64,
    fan_last_reset_micros: AtomicU64,
}

impl Platform {
    /// Bring the platform up: mount storage, load the configuration,
    /// preload the thermistor filters and remember the previous reset
    /// record for diagnostics.
    pub fn new(deps: PlatformDeps) -> Result<Self> {
        let PlatformDeps {
            mut board,
            clock,
            nv,
            storage_root,
            usb,
            aux,
        } = deps;

        let storage = MassStorage::new(storage_root)?;
        let mut nv = NvStore::load(nv);
        let boot_reset_record = nv.read_reset_record();

        let heater_channels: [AdcChannel; HEATERS] = std::array::from_fn(|h| h);
        let probe_channel: AdcChannel = HEATERS;
        let sampler = TickSampler::new(board.as_mut(), heater_channels, probe_channel, &nv.data().pid);

        let mut platform = Platform {
            board,
            clock,
            nv,
            storage,
            sampler,
            pool: OutputPool::new(),
            usb_queue: DestinationQueue::default(),
            http_queue: DestinationQueue::default(),
            telnet_queue: DestinationQueue::default(),
            usb,
            aux,
            indent: 0,
            error_code_bits: 0,
            heater_faults: [false; HEATERS],
            z_probing: false,
            reset_pending: None,
            boot_reset_record,
            min_free_ram: 81_920,
            debug_level: 0,
            axis_minima: [0.0, 0.0, 0.0],
            axis_maxima: [210.0, 200.0, 180.0],
            home_feedrates: [50.0, 50.0, 1.0],
            max_feedrates: [100.0, 100.0, 3.0, 45.0, 45.0],
            instant_dvs: [15.0, 15.0, 0.2, 2.0, 2.0],
            accelerations: [800.0, 800.0, 10.0, 250.0, 250.0],
            steps_per_unit: [87.489, 87.489, 4000.0, 420.0, 420.0],
            motor_currents: [0.0; DRIVES],
            fan_value: 0.0,
            fan_pulse_count: AtomicU32::new(0),
            fan_interval_micros: AtomicU64::new(0),
            fan_last_reset_micros: AtomicU64::new(0),
        };
        platform.init_z_probe_pin();
        Ok(platform)
    }

    /// Milliseconds since boot.
    pub fn millis(&self) -> u64 {
        self.clock.millis()
    }

    // ----- tick path -----

    /// One 1 ms system tick: run the sampler and latch any fault it
    /// reports.
    pub fn tick(&mut self) {
        let probe_type = self.nv.data().z_probe_type;
        if let Some(heater) = self.sampler.tick(self.board.as_mut(), probe_type) {
            self.error_code_bits |= ERROR_BAD_TEMP;
            self.heater_faults[heater] = true;
        }
    }

    /// Called from the fan tacho edge interrupt.
    pub fn fan_interrupt(&self) {
        let count = self.fan_pulse_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= FAN_TACHO_PULSES_PER_CALC {
            let now = self.clock.micros();
            let last = self.fan_last_reset_micros.swap(now, Ordering::Relaxed);
            self.fan_interval_micros.store(now - last, Ordering::Relaxed);
            self.fan_pulse_count.store(0, Ordering::Relaxed);
        }
    }

    // ----- main-loop spin -----

    /// Drain the non-blocking output queues. Called once per main-loop
    /// iteration.
    pub fn spin(&mut self, web: &mut dyn WebChannel) {
        let room = self.usb.can_write();
        let usb = &mut self.usb;
        self.usb_queue
            .drain(&mut self.pool, room, |chunk| usb.write(chunk));

        self.http_queue.drain(&mut self.pool, usize::MAX, |chunk| {
            web.handle_gcode_reply(WebSource::Http, chunk);
            chunk.len()
        });
        self.telnet_queue.drain(&mut self.pool, usize::MAX, |chunk| {
            web.handle_gcode_reply(WebSource::Telnet, chunk);
            chunk.len()
        });
    }

    /// Debug-only "still alive" report, throttled per module.
    pub fn class_report(&self, module: &str, last_report: &mut u64) {
        if self.debug_level != 0 {
            let now = self.millis();
            if now.saturating_sub(*last_report) >= SPIN_REPORT_MILLIS {
                *last_report = now;
                tracing::debug!(module, "module spinning");
            }
        }
    }

    // ----- messaging -----

    /// Route a message to its destinations.
    pub fn message(&mut self, kind: MessageKind, text: &str) {
        match kind {
            MessageKind::Debug => self.usb.write_blocking(text.as_bytes()),
            MessageKind::Aux => self.aux.write_blocking(text.as_bytes()),
            MessageKind::Host => {
                let indented = self.indented(text);
                if !self.usb_queue.cat(&mut self.pool, &indented) {
                    self.error_code_bits |= ERROR_OUTPUT_STARVED;
                }
            }
            MessageKind::Web => self.message_shared(text, false),
            MessageKind::Generic => self.message_shared(text, true),
        }
    }

    /// Convenience for error text: same routing with an `Error: ` prefix.
    pub fn message_error(&mut self, kind: MessageKind, text: &str) {
        self.message(kind, &format!("Error: {text}"));
    }

    fn message_shared(&mut self, text: &str, include_usb: bool) {
        let payload = if include_usb {
            self.indented(text)
        } else {
            text.to_string()
        };
        let destinations = if include_usb { 3 } else { 2 };
        match self.pool.build_chain(&payload) {
            Some(chain) => {
                self.pool.set_references(&chain, destinations);
                if include_usb {
                    self.usb_queue.enqueue(&chain);
                }
                self.http_queue.enqueue(&chain);
                self.telnet_queue.enqueue(&chain);
            }
            None => {
                tracing::warn!(len = text.len(), "output pool full, message dropped");
                self.error_code_bits |= ERROR_OUTPUT_STARVED;
            }
        }
    }

    fn indented(&self, text: &str) -> String {
        if self.indent == 0 {
            text.to_string()
        } else {
            format!("{}{}", " ".repeat(self.indent), text)
        }
    }

    /// Deepen the host-message indentation (macro entry).
    pub fn push_message_indent(&mut self) {
        self.indent += 1;
    }

    /// Shallow the host-message indentation (macro exit).
    pub fn pop_message_indent(&mut self) {
        self.indent = self.indent.saturating_sub(1);
    }

    /// Free nodes left in the output pool, for diagnostics and tests.
    pub fn output_pool_free(&self) -> usize {
        self.pool.free_count()
    }

    // ----- serial input -----

    /// True when the USB host link has a byte waiting.
    pub fn serial_byte_available(&self) -> bool {
        self.usb.byte_available()
    }

    /// Take one byte from the USB host link.
    pub fn read_serial_byte(&mut self) -> Option<u8> {
        self.usb.read_byte()
    }

    // ----- temperatures and probes -----

    /// Convert a heater's filtered reading to degrees Celsius using the
    /// beta-parameter thermistor model.
    pub fn get_temperature(&self, heater: usize) -> f64 {
        let p = &self.nv.data().pid[heater];
        let window = crate::filter::THERMISTOR_AVERAGE_READINGS as u32;
        let mut raw = (self.sampler.thermistor_sum(heater) / window) as i32;

        // A negative high-end offset means the ADC never reaches full
        // scale; allow for it when recognising a disconnected input.
        if p.adc_high_offset < 0.0 {
            raw -= p.adc_high_offset as i32;
        }
        if raw as u32 >= AD_DISCONNECTED {
            return ABS_ZERO;
        }

        let mut reading = (self.sampler.thermistor_sum(heater) / window) as f64 + 0.5;
        reading -= p.adc_low_offset;
        reading *= (AD_RANGE + 1) as f64
            / ((AD_RANGE + 1) as f64 + p.adc_high_offset - p.adc_low_offset);

        let resistance = reading * p.thermistor_series_r / ((AD_RANGE + 1) as f64 - reading);
        if resistance <= p.r_inf() {
            2000.0 // thermistor short circuit
        } else {
            ABS_ZERO + p.beta() / (resistance / p.r_inf()).ln()
        }
    }

    /// Whether the thermistor filter for a heater holds a full window yet.
    pub fn thermistor_valid(&self, heater: usize) -> bool {
        self.sampler.thermistor_valid(heater)
    }

    /// The filtered Z-probe reading.
    pub fn z_probe(&self) -> i32 {
        self.sampler.z_probe_value(self.nv.data().z_probe_type)
    }

    /// Secondary probe reading (emitter-on value for the modulated
    /// sensor).
    pub fn z_probe_secondary(&self) -> Option<i32> {
        self.sampler.z_probe_secondary_value(self.nv.data().z_probe_type)
    }

    /// Probe stop height corrected for the current bed temperature.
    pub fn z_probe_stop_height(&self) -> f64 {
        let temperature = self.get_temperature(0);
        self.active_probe_parameters().stop_height(temperature)
    }

    /// Dive height of the active probe set.
    pub fn z_probe_dive_height(&self) -> f64 {
        self.active_probe_parameters().dive
    }

    /// The fitted probe kind.
    pub fn z_probe_type(&self) -> ZProbeType {
        self.nv.data().z_probe_type
    }

    /// Select the probe kind (M558) and re-initialise the modulation
    /// output.
    pub fn set_z_probe_type(&mut self, code: i32) {
        let t = ZProbeType::from_code(code);
        let r = self.nv.mutate(|d| d.z_probe_type = t);
        self.report_nv_error(r);
        self.sampler.reset_probe_filters();
        self.init_z_probe_pin();
    }

    fn init_z_probe_pin(&mut self) {
        let t = self.nv.data().z_probe_type;
        if t != ZProbeType::Switch {
            // Enable the IR emitter (or the alternate sensor's drive
            // line, which idles low).
            self.board.set_probe_modulation(t.uses_modulation_pin());
        }
    }

    /// The probe modulation channel (M558 R).
    pub fn z_probe_channel(&self) -> i32 {
        self.nv.data().z_probe_channel
    }

    /// Select the probe modulation channel.
    pub fn set_z_probe_channel(&mut self, channel: i32) {
        let channel = if channel == 1 { 1 } else { 0 };
        let r = self.nv.mutate(|d| d.z_probe_channel = channel);
        self.report_nv_error(r);
    }

    /// Parameters of the active probe set.
    pub fn active_probe_parameters(&self) -> &ZProbeParameters {
        let d = self.nv.data();
        match d.z_probe_type {
            ZProbeType::Switch => &d.switch_probe,
            ZProbeType::Ir | ZProbeType::ModulatedIr => &d.ir_probe,
            ZProbeType::Alternate => &d.alternate_probe,
        }
    }

    /// Replace the parameters of the active probe set.
    pub fn set_probe_parameters(&mut self, params: ZProbeParameters) {
        let r = self.nv.mutate(|d| match d.z_probe_type {
            ZProbeType::Switch => d.switch_probe = params,
            ZProbeType::Ir | ZProbeType::ModulatedIr => d.ir_probe = params,
            ZProbeType::Alternate => d.alternate_probe = params,
        });
        self.report_nv_error(r);
    }

    /// Axes homed with the probe rather than an endstop.
    pub fn z_probe_axes(&self) -> [bool; AXES] {
        self.nv.data().z_probe_axes
    }

    /// Set the probe-axis mask.
    pub fn set_z_probe_axes(&mut self, axes: [bool; AXES]) {
        let r = self.nv.mutate(|d| d.z_probe_axes = axes);
        self.report_nv_error(r);
    }

    /// True when Z may only be homed after X and Y (a bed probe is
    /// fitted).
    pub fn must_home_xy_before_z(&self) -> bool {
        self.nv.data().z_probe_type != ZProbeType::Switch
    }

    /// Mark a probing move in progress.
    pub fn set_z_probing(&mut self, probing: bool) {
        self.z_probing = probing;
    }

    /// Whether a probing move is in progress.
    pub fn z_probing(&self) -> bool {
        self.z_probing
    }

    /// Endstop state for one drive. Probe-homed axes compare the filtered
    /// probe reading against the trigger threshold, with a "near" level at
    /// 90% so the planner can slow down before contact.
    pub fn stopped(&self, drive: usize) -> EndStopHit {
        let d = self.nv.data();
        if d.z_probe_type != ZProbeType::Switch && drive < AXES && d.z_probe_axes[drive] {
            let value = self.z_probe();
            let threshold = self.active_probe_parameters().adc_value;
            return if value >= threshold {
                EndStopHit::LowHit
            } else if value * 10 >= threshold * 9 {
                EndStopHit::LowNear
            } else {
                EndStopHit::NoStop
            };
        }
        if self.board.low_endstop(drive) == EndstopState::Hit {
            return EndStopHit::LowHit;
        }
        if self.board.high_endstop(drive) == EndstopState::Hit {
            return EndStopHit::HighHit;
        }
        EndStopHit::NoStop
    }

    // ----- heaters -----

    /// PID and thermistor parameters for a heater. Out-of-range indexes
    /// fall back to the bed.
    pub fn pid_parameters(&self, heater: usize) -> &PidParameters {
        &self.nv.data().pid[if heater < HEATERS { heater } else { 0 }]
    }

    /// Replace a heater's parameters and refresh its overheat threshold.
    pub fn set_pid_parameters(&mut self, heater: usize, params: PidParameters) {
        if heater >= HEATERS {
            return;
        }
        let r = self.nv.mutate(|d| d.pid[heater] = params);
        self.report_nv_error(r);
        let pid = self.nv.data().pid[heater].clone();
        self.sampler.update_overheat_sum(heater, &pid);
    }

    /// Drive a heater output. Power is clamped to [0, 1]; a latched fault
    /// forces zero until the fault is cleared.
    pub fn set_heater(&mut self, heater: usize, power: f64) {
        let power = if self.heater_faults[heater] { 0.0 } else { power };
        self.board.set_heater_pwm(heater, power.clamp(0.0, 1.0));
    }

    /// Whether a heater's over-temperature fault is latched.
    pub fn heater_fault(&self, heater: usize) -> bool {
        self.heater_faults[heater]
    }

    /// Clear a heater's fault latch (M562).
    pub fn clear_heater_fault(&mut self, heater: usize) {
        if heater < HEATERS {
            self.heater_faults[heater] = false;
            if !self.heater_faults.iter().any(|&f| f) {
                self.error_code_bits &= !ERROR_BAD_TEMP;
            }
        }
    }

    /// The latched error bits.
    pub fn error_code_bits(&self) -> u32 {
        self.error_code_bits
    }

    // ----- fan -----

    /// Set the cooling fan. Accepts either a fraction in [0, 1] or the
    /// legacy [0, 255] range; values above 1 are scaled down.
    pub fn set_fan_value(&mut self, speed: f64) {
        let fraction = if speed <= 1.0 {
            speed.max(0.0)
        } else {
            (speed / 255.0).min(1.0)
        };
        self.fan_value = fraction;
        self.board.set_fan_pwm(fraction);
    }

    /// Current fan setting as a fraction.
    pub fn fan_value(&self) -> f64 {
        self.fan_value
    }

    /// Fan speed from the tacho, zero when the reading is stale. Two
    /// pulses per revolution.
    pub fn fan_rpm(&self) -> f64 {
        let interval = self.fan_interval_micros.load(Ordering::Relaxed);
        let last = self.fan_last_reset_micros.load(Ordering::Relaxed);
        if interval != 0 && self.clock.micros().saturating_sub(last) < FAN_RPM_STALE_MICROS {
            (30_000_000u64 * FAN_TACHO_PULSES_PER_CALC as u64) as f64 / interval as f64
        } else {
            0.0
        }
    }

    // ----- drives and geometry -----

    /// Energise a drive.
    pub fn enable_drive(&mut self, drive: usize) {
        self.board.enable_drive(drive);
    }

    /// De-energise a drive.
    pub fn disable_drive(&mut self, drive: usize) {
        self.board.disable_drive(drive);
    }

    /// Program a motor current (M906).
    pub fn set_motor_current(&mut self, drive: usize, milliamps: f64) {
        if drive < DRIVES {
            self.motor_currents[drive] = milliamps;
            self.board.set_motor_current(drive, milliamps);
        }
    }

    /// The programmed motor current.
    pub fn motor_current(&self, drive: usize) -> f64 {
        self.motor_currents.get(drive).copied().unwrap_or(0.0)
    }

    /// Lower travel limit of an axis.
    pub fn axis_minimum(&self, axis: usize) -> f64 {
        self.axis_minima[axis]
    }

    /// Set the lower travel limit (M208 S1).
    pub fn set_axis_minimum(&mut self, axis: usize, value: f64) {
        self.axis_minima[axis] = value;
    }

    /// Upper travel limit of an axis.
    pub fn axis_maximum(&self, axis: usize) -> f64 {
        self.axis_maxima[axis]
    }

    /// Set the upper travel limit (M208).
    pub fn set_axis_maximum(&mut self, axis: usize, value: f64) {
        self.axis_maxima[axis] = value;
    }

    /// Total travel of an axis.
    pub fn axis_total_length(&self, axis: usize) -> f64 {
        self.axis_maxima[axis] - self.axis_minima[axis]
    }

    /// Homing feedrate of an axis in mm/s.
    pub fn home_feedrate(&self, axis: usize) -> f64 {
        self.home_feedrates[axis]
    }

    /// Set the homing feedrate (M210).
    pub fn set_home_feedrate(&mut self, axis: usize, value: f64) {
        self.home_feedrates[axis] = value;
    }

    /// Maximum feedrate of a drive in mm/s.
    pub fn max_feedrate(&self, drive: usize) -> f64 {
        self.max_feedrates[drive]
    }

    /// Set the maximum feedrate (M203).
    pub fn set_max_feedrate(&mut self, drive: usize, value: f64) {
        self.max_feedrates[drive] = value;
    }

    /// Instantaneous speed change of a drive in mm/s.
    pub fn instant_dv(&self, drive: usize) -> f64 {
        self.instant_dvs[drive]
    }

    /// Set the instantaneous speed change (M566).
    pub fn set_instant_dv(&mut self, drive: usize, value: f64) {
        self.instant_dvs[drive] = value;
    }

    /// The smallest instantaneous speed change across all drives, used as
    /// the stationary feedrate after G92.
    pub fn slowest_instant_dv(&self) -> f64 {
        self.instant_dvs.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// Acceleration of a drive in mm/s^2.
    pub fn acceleration(&self, drive: usize) -> f64 {
        self.accelerations[drive]
    }

    /// Set a drive's acceleration (M201).
    pub fn set_acceleration(&mut self, drive: usize, value: f64) {
        self.accelerations[drive] = value;
    }

    /// Steps per millimetre of a drive.
    pub fn drive_steps_per_unit(&self, drive: usize) -> f64 {
        self.steps_per_unit[drive]
    }

    /// Set a drive's steps per millimetre (M92).
    pub fn set_drive_steps_per_unit(&mut self, drive: usize, value: f64) {
        self.steps_per_unit[drive] = value;
    }

    /// Switch the ATX supply (M80/M81).
    pub fn set_atx_power(&mut self, on: bool) {
        self.board.set_atx_power(on);
    }

    /// ATX supply state.
    pub fn atx_power(&self) -> bool {
        self.board.atx_power()
    }

    // ----- configuration -----

    /// Reply-format emulation in effect. Explicit native selection reads
    /// back as native.
    pub fn emulating(&self) -> Compatibility {
        match self.nv.data().compat {
            Compatibility::RepRapFirmware => Compatibility::Me,
            c => c,
        }
    }

    /// Select the emulation mode (M555). Returns false for unsupported
    /// modes, which are left unselected.
    pub fn set_emulating(&mut self, compat: Compatibility) -> bool {
        if !compat.is_native() && compat != Compatibility::Marlin {
            return false;
        }
        let value = if compat == Compatibility::RepRapFirmware {
            Compatibility::Me
        } else {
            compat
        };
        let r = self.nv.mutate(|d| d.compat = value);
        self.report_nv_error(r);
        true
    }

    /// The static IP address.
    pub fn ip_address(&self) -> [u8; 4] {
        self.nv.data().ip
    }

    /// Set the static IP address (M552).
    pub fn set_ip_address(&mut self, ip: [u8; 4]) {
        let r = self.nv.mutate(|d| d.ip = ip);
        self.report_nv_error(r);
    }

    /// The network mask.
    pub fn net_mask(&self) -> [u8; 4] {
        self.nv.data().mask
    }

    /// Set the network mask (M553).
    pub fn set_net_mask(&mut self, mask: [u8; 4]) {
        let r = self.nv.mutate(|d| d.mask = mask);
        self.report_nv_error(r);
    }

    /// The default gateway.
    pub fn gateway(&self) -> [u8; 4] {
        self.nv.data().gateway
    }

    /// Set the default gateway (M554).
    pub fn set_gateway(&mut self, gw: [u8; 4]) {
        let r = self.nv.mutate(|d| d.gateway = gw);
        self.report_nv_error(r);
    }

    /// The MAC address.
    pub fn mac_address(&self) -> [u8; 6] {
        self.nv.data().mac
    }

    /// Set the MAC address (M540).
    pub fn set_mac_address(&mut self, mac: [u8; 6]) {
        let r = self.nv.mutate(|d| d.mac = mac);
        self.report_nv_error(r);
    }

    /// Enable or disable configuration write-through.
    pub fn set_auto_save(&mut self, enabled: bool) {
        self.nv.set_auto_save(enabled);
    }

    /// Write the configuration record now.
    pub fn save_nv_data(&mut self) {
        let r = self.nv.save();
        self.report_nv_error(r.map(|_| ()));
    }

    fn report_nv_error<T>(&mut self, r: std::result::Result<T, ConfigError>) {
        if let Err(e) = r {
            tracing::error!(error = %e, "non-volatile save failed");
            self.message_error(MessageKind::Generic, &format!("Cannot save settings: {e}\n"));
        }
    }

    // ----- files -----

    /// Directory-level storage access.
    pub fn mass_storage(&self) -> &MassStorage {
        &self.storage
    }

    /// Open a file under one of the storage directories. `Ok(None)` when a
    /// file opened for reading does not exist.
    pub fn get_file_store(
        &self,
        directory: &str,
        file_name: &str,
        write: bool,
    ) -> Result<Option<FileStore>> {
        self.storage.open(directory, file_name, write)
    }

    /// Name of the startup configuration file.
    pub fn config_file(&self) -> &'static str {
        CONFIG_FILE
    }

    // ----- debug, diagnostics and reset -----

    /// Set the debug level (M111).
    pub fn set_debug(&mut self, level: i32) {
        self.debug_level = level;
    }

    /// Whether debug output is enabled.
    pub fn debug(&self) -> bool {
        self.debug_level != 0
    }

    /// Record the reset reason and flag the embedder to restart. The
    /// stuck-output bits are added here so the record shows what the main
    /// loop was blocked on.
    pub fn software_reset(&mut self, mut reason: u16) {
        if reason & reset_reason::USER == 0 {
            if self.usb.can_write() == 0 {
                reason |= reset_reason::IN_USB_OUTPUT;
            }
            if self.aux.can_write() == 0 {
                reason |= reset_reason::IN_AUX_OUTPUT;
            }
        }
        let record = SoftwareResetData {
            magic: RESET_MAGIC,
            reason,
            never_used_ram: self.min_free_ram,
        };
        if let Err(e) = self.nv.write_reset_record(&record) {
            tracing::error!(error = %e, "failed to record reset reason");
        }
        tracing::warn!(reason = format_args!("{reason:#06x}"), "software reset requested");
        self.reset_pending = Some(reason);
    }

    /// Reason of a reset requested this session, if any. The embedder
    /// polls this and restarts the firmware.
    pub fn reset_pending(&self) -> Option<u16> {
        self.reset_pending
    }

    /// Dump the platform diagnostics to the generic destinations (M122).
    pub fn diagnostics(&mut self, planner: &dyn printforge_core::MotionPlanner) {
        self.message(MessageKind::Generic, "Platform Diagnostics:\n");

        let up = self.millis() / 1000;
        let text = format!(
            "Up time: {:02}:{:02}:{:02}\n",
            up / 3600,
            (up % 3600) / 60,
            up % 60
        );
        self.message(MessageKind::Generic, &text);

        if let Some(record) = self.boot_reset_record {
            let text = format!(
                "Last software reset code & available RAM: {:#06x}, {}\n",
                record.reason, record.never_used_ram
            );
            self.message(MessageKind::Generic, &text);
        }

        let text = format!("Error status: {}\n", self.error_code_bits);
        self.message(MessageKind::Generic, &text);

        let mut heights = String::from("Bed probe heights:");
        for point in 0..planner.probe_point_count().max(1) {
            heights.push_str(&format!(" {:.3}", planner.z_bed_probe_point(point)));
        }
        heights.push('\n');
        self.message(MessageKind::Generic, &heights);

        let text = format!("Free file entries: {}\n", self.storage.free_file_entries());
        self.message(MessageKind::Generic, &text);

        let text = format!(
            "Longest block write time: {:.1}ms\n",
            FileStore::get_and_clear_longest_write_time()
        );
        self.message(MessageKind::Generic, &text);
    }
}
