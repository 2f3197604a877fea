//! The G-code dispatcher
//!
//! Cooperative and single-threaded. Each spin the dispatcher first resumes
//! any command still executing, in fixed source priority (web, then
//! serial, then file); otherwise it polls the sources for new bytes in the
//! same order; and only when nothing else wants attention does it advance
//! the print file by one byte. Handlers return true when their command is
//! finished; a false return leaves the command executing and the same
//! handler is retried next spin, so a multi-tick command blocks everything
//! behind it.

use crate::buffer::GCodeBuffer;
use crate::tools::Tool;
use printforge_core::{
    GcodeError, HeatControl, MotionPlanner, MoveArray, WebChannel, AXES, AXIS_LETTERS, BED_HEATER,
    DRIVES, EXTRUDE_LETTER, FEEDRATE_LETTER, X_AXIS, Y_AXIS, Z_AXIS,
};
use printforge_platform::{
    reset_reason, Compatibility, FileStore, MessageKind, PidParameters, Platform, GCODE_DIR,
    SYS_DIR, WEB_DIR,
};

/// Maximum depth of the push/pop execution stack.
pub const STACK: usize = 5;

/// Millimetres per inch, for G20.
const INCH_TO_MM: f64 = 25.4;

/// Z values below this mean "really probe" rather than "record this
/// height".
pub(crate) const SILLY_Z_VALUE: f64 = -9999.0;

/// Marker ending a web-interface file upload over the serial link.
const HTML_EOF_STRING: &str = "<!-- **EOF for HTML** -->";

/// Firmware identity reported by M115.
const FIRMWARE_NAME: &str = "printforge";
/// Firmware version reported by M115.
const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Electronics name reported by M115.
const FIRMWARE_ELECTRONICS: &str = "Simulated v1.0";

/// The external collaborators a spin works against.
pub struct Context<'a> {
    /// The platform facade.
    pub platform: &'a mut Platform,
    /// The motion planner.
    pub planner: &'a mut dyn MotionPlanner,
    /// The heater controller.
    pub heat: &'a mut dyn HeatControl,
    /// The web queue.
    pub web: &'a mut dyn WebChannel,
}

/// The G-code sources, in dispatch priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The web-served queue.
    Web = 0,
    /// The host serial link.
    Serial = 1,
    /// The file being printed.
    File = 2,
    /// Macro file playback.
    Macro = 3,
}

/// One saved execution frame.
pub(crate) struct StackFrame {
    pub(crate) drives_relative: bool,
    pub(crate) axes_relative: bool,
    pub(crate) feedrate: f64,
    pub(crate) file: Option<FileStore>,
}

/// The dispatcher.
pub struct GCodes {
    buffers: [GCodeBuffer; 4],
    active: bool,

    pub(crate) drives_relative: bool,
    pub(crate) axes_relative: bool,
    pub(crate) distance_scale: f64,

    pub(crate) move_buffer: MoveArray,
    pub(crate) move_available: bool,
    pub(crate) check_endstops: bool,
    pub(crate) last_extruder_pos: [f64; DRIVES - AXES],

    pub(crate) stack: Vec<StackFrame>,

    pub(crate) file_being_printed: Option<FileStore>,
    file_to_print: Option<FileStore>,
    file_being_written: Option<FileStore>,
    writing_dir: Option<&'static str>,
    writing_source: Option<Source>,
    eof_counter: usize,
    config_file_being_sent: Option<FileStore>,

    pub(crate) home_x: bool,
    pub(crate) home_y: bool,
    pub(crate) home_z: bool,
    pub(crate) axis_is_homed: [bool; AXES],
    pub(crate) probe_count: usize,
    pub(crate) z_probes_set: bool,

    pub(crate) doing_macro_file: bool,
    pub(crate) canned_cycle_move_count: u8,
    pub(crate) canned_cycle_move_queued: bool,
    pub(crate) move_to_do: MoveArray,
    pub(crate) active_drives: [bool; DRIVES + 1],
    pub(crate) offset_record: MoveArray,
    pub(crate) offset_set: bool,

    waiting_for_move_to_complete: bool,
    dwell_waiting: bool,
    dwell_end_millis: u64,

    speed_factor: f64,
    speed_factor_change: f64,
    extrusion_factors: [f64; DRIVES - AXES],
    pub(crate) limit_axes: bool,
    cooling_inverted: bool,

    pub(crate) tools: Vec<Tool>,
    pub(crate) current_tool: Option<usize>,
    pub(crate) tool_change_sequence: u8,

    emulation_noted: u8,
    long_wait: u64,
}

impl GCodes {
    /// Build the dispatcher with all sources idle.
    pub fn new() -> Self {
        GCodes {
            buffers: [
                GCodeBuffer::new("web: "),
                GCodeBuffer::new("serial: "),
                GCodeBuffer::new("file: "),
                GCodeBuffer::new("macro: "),
            ],
            active: false,
            drives_relative: true,
            axes_relative: false,
            distance_scale: 1.0,
            move_buffer: [0.0; DRIVES + 1],
            move_available: false,
            check_endstops: false,
            last_extruder_pos: [0.0; DRIVES - AXES],
            stack: Vec::with_capacity(STACK),
            file_being_printed: None,
            file_to_print: None,
            file_being_written: None,
            writing_dir: None,
            writing_source: None,
            eof_counter: 0,
            config_file_being_sent: None,
            home_x: false,
            home_y: false,
            home_z: false,
            axis_is_homed: [false; AXES],
            probe_count: 0,
            z_probes_set: false,
            doing_macro_file: false,
            canned_cycle_move_count: 0,
            canned_cycle_move_queued: false,
            move_to_do: [0.0; DRIVES + 1],
            active_drives: [false; DRIVES + 1],
            offset_record: [0.0; DRIVES + 1],
            offset_set: false,
            waiting_for_move_to_complete: false,
            dwell_waiting: false,
            dwell_end_millis: 0,
            speed_factor: 1.0 / 60.0,
            speed_factor_change: 1.0,
            extrusion_factors: [1.0; DRIVES - AXES],
            limit_axes: true,
            cooling_inverted: false,
            tools: Vec::new(),
            current_tool: None,
            tool_change_sequence: 0,
            emulation_noted: 0,
            long_wait: 0,
        }
    }

    /// Bring the dispatcher up.
    pub fn init(&mut self) {
        self.reset();
        self.drives_relative = true;
        self.axes_relative = false;
        self.distance_scale = 1.0;
        self.last_extruder_pos = [0.0; DRIVES - AXES];
        self.home_x = false;
        self.home_y = false;
        self.home_z = false;
        self.axis_is_homed = [false; AXES];
        self.offset_set = false;
        self.z_probes_set = false;
        self.limit_axes = true;
        self.tool_change_sequence = 0;
        self.cooling_inverted = false;
        self.active = true;
    }

    /// Drop all in-flight work. Called from `init` and from the emergency
    /// stop.
    pub fn reset(&mut self) {
        for gb in &mut self.buffers {
            gb.init();
        }
        self.move_available = false;
        self.check_endstops = false;
        self.file_being_printed = None;
        self.file_to_print = None;
        self.file_being_written = None;
        self.writing_dir = None;
        self.writing_source = None;
        self.config_file_being_sent = None;
        self.doing_macro_file = false;
        self.dwell_waiting = false;
        self.stack.clear();
        self.waiting_for_move_to_complete = false;
        self.probe_count = 0;
        self.canned_cycle_move_count = 0;
        self.canned_cycle_move_queued = false;
        self.speed_factor = 1.0 / 60.0;
        self.speed_factor_change = 1.0;
        self.extrusion_factors = [1.0; DRIVES - AXES];
    }

    pub(crate) fn gb(&mut self, src: Source) -> &mut GCodeBuffer {
        &mut self.buffers[src as usize]
    }

    /// Current push/pop stack depth, used for message indentation.
    pub fn stack_pointer(&self) -> usize {
        self.stack.len()
    }

    /// Whether axis words are being interpreted as relative (G91).
    pub fn axes_relative(&self) -> bool {
        self.axes_relative
    }

    /// Whether extruder words are being interpreted as relative
    /// (G91/M83).
    pub fn drives_relative(&self) -> bool {
        self.drives_relative
    }

    /// Whether an axis has been homed since boot.
    pub fn axis_homed(&self, axis: usize) -> bool {
        self.axis_is_homed[axis]
    }

    /// Whether a print file is loaded and running.
    pub fn printing_a_file(&self) -> bool {
        self.file_being_printed.is_some()
    }

    /// Play `sys/config.g` at boot. Call repeatedly until it returns
    /// true; a missing file is reported and counts as done.
    pub fn run_config_file(&mut self, ctx: &mut Context) -> bool {
        let name = ctx.platform.config_file();
        self.do_file_macro(name, ctx)
    }

    /// The planner's pull side of the single-slot move buffer.
    pub fn read_move(&mut self) -> Option<(MoveArray, bool)> {
        if !self.move_available {
            return None;
        }
        let m = self.move_buffer;
        let ce = self.check_endstops;
        self.move_available = false;
        self.check_endstops = false;
        Some((m, ce))
    }

    /// One cooperative scheduling pass.
    pub fn spin(&mut self, ctx: &mut Context) {
        if !self.active {
            return;
        }

        // Resume whichever source still has a command executing, in
        // priority order, and do nothing else this spin.
        for src in [Source::Web, Source::Serial, Source::File] {
            if self.buffers[src as usize].active() {
                let finished = self.act_on_code(src, ctx);
                self.gb(src).set_finished(finished);
                ctx.platform.class_report("gcodes", &mut self.long_wait);
                return;
            }
        }

        // Poll the web queue.
        if ctx.web.gcode_available() {
            let mut taken = 0;
            loop {
                let b = ctx.web.read_gcode();
                if self.gb(Source::Web).put(b) {
                    if self.writing_source == Some(Source::Web) {
                        self.write_gcode_to_file(Source::Web, ctx);
                    } else {
                        let finished = self.act_on_code(Source::Web, ctx);
                        self.gb(Source::Web).set_finished(finished);
                    }
                    break;
                }
                taken += 1;
                if taken >= 16 || !ctx.web.gcode_available() {
                    break;
                }
            }
            ctx.platform.class_report("gcodes", &mut self.long_wait);
            return;
        }

        // The serial link. A web-interface upload bypasses line assembly
        // and streams bytes straight into the file.
        if self.writing_source == Some(Source::Serial) && self.writing_dir == Some(WEB_DIR) {
            if let Some(b) = ctx.platform.read_serial_byte() {
                self.write_html_to_file(b, ctx);
            }
        } else if ctx.platform.serial_byte_available() {
            let mut taken = 0;
            loop {
                let Some(b) = ctx.platform.read_serial_byte() else {
                    break;
                };
                if self.gb(Source::Serial).put(b) {
                    if self.writing_source == Some(Source::Serial) {
                        self.write_gcode_to_file(Source::Serial, ctx);
                    } else {
                        let finished = self.act_on_code(Source::Serial, ctx);
                        self.gb(Source::Serial).set_finished(finished);
                    }
                    break;
                }
                taken += 1;
                if taken >= 16 || !ctx.platform.serial_byte_available() {
                    break;
                }
            }
            ctx.platform.class_report("gcodes", &mut self.long_wait);
            return;
        }

        // Nothing else to do: feed the print file.
        self.do_file_print(Source::File, ctx);
        ctx.platform.class_report("gcodes", &mut self.long_wait);
    }

    /// Advance the file being printed by one byte into the given buffer.
    pub(crate) fn do_file_print(&mut self, src: Source, ctx: &mut Context) {
        let read = match self.file_being_printed.as_mut() {
            Some(file) => file.read_byte(),
            None => return,
        };
        match read {
            Ok(Some(b)) => {
                if self.gb(src).put(b) {
                    let finished = self.act_on_code(src, ctx);
                    self.gb(src).set_finished(finished);
                }
            }
            Ok(None) => {
                // End of file; close out a possibly unterminated line.
                if self.gb(src).put(b'\n') {
                    let finished = self.act_on_code(src, ctx);
                    self.gb(src).set_finished(finished);
                }
                self.file_being_printed = None;
            }
            Err(e) => {
                ctx.platform
                    .message_error(MessageKind::Generic, &format!("Print file read: {e}\n"));
                self.file_being_printed = None;
            }
        }
    }

    /// Dispatch a complete line. M is checked first because M-code
    /// parameters (file names) may contain the letters G and T.
    pub(crate) fn act_on_code(&mut self, src: Source, ctx: &mut Context) -> bool {
        if self.gb(src).seen('M') {
            return self.handle_mcode(src, ctx);
        }
        if self.gb(src).seen('G') {
            return self.handle_gcode(src, ctx);
        }
        if self.gb(src).seen('T') {
            return self.handle_tcode(src, ctx);
        }

        // An empty buffer is discarded with a bare acknowledgement.
        self.handle_reply(ctx, src, false, "", 'X', 0, false);
        true
    }

    fn handle_gcode(&mut self, src: Source, ctx: &mut Context) -> bool {
        let mut result = true;
        let mut error = false;
        let mut resend = false;
        let mut reply = String::new();

        let code = {
            let gb = self.gb(src);
            gb.seen('G');
            gb.int_value()
        };
        match code {
            0 | 1 => {
                if self.waiting_for_move_to_complete {
                    // This move checks endstops; wait for it to finish so
                    // a following relative move computes correctly.
                    result = self.all_moves_finished_and_move_buffer_loaded(ctx);
                    if result {
                        self.waiting_for_move_to_complete = false;
                    }
                } else {
                    let res = self.set_up_move(src, ctx);
                    if res == 2 {
                        self.waiting_for_move_to_complete = true;
                    }
                    result = res == 1;
                }
            }

            4 => result = self.do_dwell(src, ctx),

            10 => result = self.set_offsets(src, ctx),

            20 => self.distance_scale = INCH_TO_MM,
            21 => self.distance_scale = 1.0,

            28 => {
                if self.no_home() {
                    self.home_x = self.gb(src).seen(AXIS_LETTERS[X_AXIS]);
                    self.home_y = self.gb(src).seen(AXIS_LETTERS[Y_AXIS]);
                    self.home_z = self.gb(src).seen(AXIS_LETTERS[Z_AXIS]);
                    if self.no_home() {
                        self.home_x = true;
                        self.home_y = true;
                        self.home_z = true;
                    }
                }
                result = self.do_home(ctx, &mut reply, &mut error);
            }

            30 => result = self.set_single_z_probe_at_a_position(src, ctx),

            31 => result = self.set_print_z_probe(src, ctx, &mut reply),

            32 => {
                if !(self.axis_is_homed[X_AXIS] && self.axis_is_homed[Y_AXIS]) {
                    reply.push_str("Must home X and Y before bed probing");
                    error = true;
                } else {
                    result = self.do_multiple_z_probe(ctx);
                }
            }

            90 => {
                self.drives_relative = false;
                self.axes_relative = false;
            }
            91 => {
                self.drives_relative = true;
                self.axes_relative = true;
            }

            92 => result = self.set_positions(src, ctx),

            998 => {
                if self.gb(src).seen('P') {
                    reply = self.gb(src).int_value().to_string();
                    resend = true;
                }
            }

            _ => {
                error = true;
                reply = GcodeError::UnknownG {
                    line: self.gb(src).buffer().to_string(),
                }
                .to_string();
            }
        }

        if result {
            self.handle_reply(ctx, src, error, &reply, 'G', code, resend);
        }
        result
    }

    fn handle_mcode(&mut self, src: Source, ctx: &mut Context) -> bool {
        let mut result = true;
        let mut error = false;
        let mut resend = false;
        let mut reply = String::new();

        let code = {
            let gb = self.gb(src);
            gb.seen('M');
            gb.int_value()
        };
        match code {
            0 | 1 => {
                // Stop or sleep: park the print, then quiesce.
                if self.file_being_printed.is_some() {
                    self.file_to_print = self.file_being_printed.take();
                }
                if !self.disable_drives(ctx) || !self.standby_heaters(ctx) {
                    return false;
                }
            }

            18 | 84 => result = self.disable_drives(ctx),

            20 => {
                let native = ctx.platform.emulating().is_native();
                match ctx.platform.mass_storage().list(GCODE_DIR) {
                    Ok(entries) => {
                        let names: Vec<&str> = entries
                            .iter()
                            .filter(|e| !e.is_directory)
                            .map(|e| e.name.as_str())
                            .collect();
                        if native {
                            reply.push_str("GCode files:\n");
                            if names.is_empty() {
                                reply.push_str("NONE");
                            } else {
                                reply.push_str(&names.join("\n"));
                            }
                        } else if names.is_empty() {
                            reply.push_str("NONE");
                        } else {
                            reply = names
                                .iter()
                                .map(|n| format!("\"{n}\""))
                                .collect::<Vec<_>>()
                                .join(",");
                        }
                    }
                    Err(e) => {
                        error = true;
                        reply = format!("Can't list files: {e}");
                    }
                }
            }

            21 => {} // the card is mounted at boot

            23 => {
                let name = self.gb(src).unprecedented_string();
                self.queue_file_to_print(&name, ctx);
                if self.file_to_print.is_some()
                    && ctx.platform.emulating() == Compatibility::Marlin
                {
                    reply.push_str("File opened\nFile selected");
                }
            }

            24 => {
                if self.file_being_printed.is_none() {
                    self.file_being_printed = self.file_to_print.take();
                }
            }

            25 => {
                if self.file_being_printed.is_some() {
                    self.file_to_print = self.file_being_printed.take();
                }
            }

            27 => {
                reply.push_str(if self.file_being_printed.is_some() {
                    "SD printing."
                } else {
                    "Not SD printing."
                });
            }

            28 => {
                let name = self.gb(src).unprecedented_string();
                let ok = self.open_file_to_write(GCODE_DIR, &name, src, ctx);
                if ok {
                    reply = format!("Writing to file: {name}");
                } else {
                    error = true;
                    reply = format!("Can't open file {name} for writing.");
                }
            }

            29 => {
                // Normally intercepted by the file-writing path.
                ctx.platform
                    .message(MessageKind::Host, "GCode end-of-file being interpreted.\n");
            }

            30 => {
                let name = self.gb(src).unprecedented_string();
                if let Err(e) = ctx.platform.mass_storage().delete(GCODE_DIR, &name) {
                    error = true;
                    reply = format!("Unsuccessful attempt to delete: {name} ({e})");
                }
            }

            80 | 81 => ctx.platform.set_atx_power(code == 80),

            82 => {
                self.last_extruder_pos = [0.0; DRIVES - AXES];
                self.drives_relative = false;
            }
            83 => {
                self.last_extruder_pos = [0.0; DRIVES - AXES];
                self.drives_relative = true;
            }

            85 => {} // inactivity timeout: no timer to set

            92 => {
                let mut seen = false;
                for axis in 0..AXES {
                    if self.gb(src).seen(AXIS_LETTERS[axis]) {
                        let v = self.gb(src).float_value();
                        ctx.platform.set_drive_steps_per_unit(axis, v);
                        seen = true;
                    }
                }
                if self.gb(src).seen(EXTRUDE_LETTER) {
                    seen = true;
                    let values = self.gb(src).float_array(DRIVES - AXES);
                    if values.len() == DRIVES - AXES {
                        for (e, &v) in values.iter().enumerate() {
                            ctx.platform.set_drive_steps_per_unit(AXES + e, v);
                        }
                    } else {
                        ctx.platform.message(
                            MessageKind::Host,
                            "Setting steps/mm - wrong number of E drives\n",
                        );
                    }
                }
                if !seen {
                    reply = format!(
                        "Steps/mm: X: {:.0}, Y: {:.0}, Z: {:.0}, E: {}",
                        ctx.platform.drive_steps_per_unit(X_AXIS),
                        ctx.platform.drive_steps_per_unit(Y_AXIS),
                        ctx.platform.drive_steps_per_unit(Z_AXIS),
                        self.extruder_report(|d| ctx.platform.drive_steps_per_unit(d), 1.0)
                    );
                }
            }

            98 => {
                if self.gb(src).seen('P') {
                    let name = self.gb(src).string_value();
                    result = self.do_file_macro(&name, ctx);
                }
            }

            99 => result = self.file_macro_return(ctx),

            104 => {
                if self.gb(src).seen('S') {
                    let temperature = self.gb(src).float_value();
                    self.set_tool_heaters(temperature, ctx, &mut error, &mut reply);
                }
            }

            105 => {
                reply.push_str("T:");
                for heater in 1..printforge_core::HEATERS {
                    if !ctx.heat.switched_off(heater) {
                        reply.push_str(&format!("{:.1} ", ctx.heat.temperature(heater)));
                    }
                }
                reply.push_str(&format!("B: {:.1}", ctx.heat.temperature(BED_HEATER)));
            }

            106 => {
                if self.gb(src).seen('I') {
                    self.cooling_inverted = self.gb(src).int_value() > 0;
                }
                if self.gb(src).seen('S') {
                    let f = self.gb(src).float_value().clamp(0.0, 255.0);
                    if self.cooling_inverted {
                        let max = if f <= 1.0 { 1.0 } else { 255.0 };
                        ctx.platform.set_fan_value(max - f);
                    } else {
                        ctx.platform.set_fan_value(f);
                    }
                }
            }

            107 => {
                ctx.platform
                    .set_fan_value(if self.cooling_inverted { 255.0 } else { 0.0 });
            }

            109 => {
                if self.gb(src).seen('S') {
                    let temperature = self.gb(src).float_value();
                    self.set_tool_heaters(temperature, ctx, &mut error, &mut reply);
                }
                if !error {
                    result = ctx.heat.all_heaters_at_set_temperatures(false);
                }
            }

            110 => {} // line numbers are handled during assembly

            111 => {
                if self.gb(src).seen('S') {
                    let level = self.gb(src).int_value();
                    ctx.platform.set_debug(level);
                }
            }

            112 => self.emergency_stop(ctx),

            114 => reply = self.get_current_coordinates(ctx),

            115 => {
                reply = format!(
                    "FIRMWARE_NAME:{FIRMWARE_NAME} FIRMWARE_VERSION:{FIRMWARE_VERSION} ELECTRONICS:{FIRMWARE_ELECTRONICS}"
                );
            }

            116 => {
                if !self.all_moves_finished_and_move_buffer_loaded(ctx) {
                    return false;
                }
                result = ctx.heat.all_heaters_at_set_temperatures(true);
            }

            119 => {
                ctx.platform
                    .message(MessageKind::Host, "M119 - endstop status not yet implemented\n");
            }

            120 => result = self.push(ctx),
            121 => result = self.pop(ctx),

            122 => {
                let val = if self.gb(src).seen('P') {
                    self.gb(src).int_value()
                } else {
                    0
                };
                if val == 0 {
                    ctx.platform.diagnostics(&*ctx.planner);
                    self.diagnostics(ctx);
                } else {
                    tracing::warn!(test = val, "diagnostic test requested");
                }
            }

            126 => {
                ctx.platform
                    .message(MessageKind::Host, "M126 - valves not yet implemented\n");
            }
            127 => {
                ctx.platform
                    .message(MessageKind::Host, "M127 - valves not yet implemented\n");
            }

            135 => {} // PID sample interval is fixed

            140 => {
                if self.gb(src).seen('S') {
                    let t = self.gb(src).float_value();
                    if !self.heater_enable_blocked(ctx, BED_HEATER, &mut error, &mut reply) {
                        ctx.heat.set_active_temperature(BED_HEATER, t);
                        ctx.heat.activate(BED_HEATER);
                    }
                }
                if self.gb(src).seen('R') {
                    let t = self.gb(src).float_value();
                    ctx.heat.set_standby_temperature(BED_HEATER, t);
                }
            }

            141 => {
                ctx.platform
                    .message(MessageKind::Host, "M141 - heated chamber not yet implemented\n");
            }

            190 => {
                if self.gb(src).seen('S') {
                    let t = self.gb(src).float_value();
                    if !self.heater_enable_blocked(ctx, BED_HEATER, &mut error, &mut reply) {
                        ctx.heat.set_active_temperature(BED_HEATER, t);
                        ctx.heat.activate(BED_HEATER);
                        result = ctx.heat.heater_at_set_temperature(BED_HEATER);
                    }
                }
            }

            201 => {
                let seen = self.set_per_drive(src, ctx, |p, d, v| p.set_acceleration(d, v), 1.0);
                if !seen {
                    reply = format!(
                        "Accelerations: X: {:.1}, Y: {:.1}, Z: {:.1}, E: {}",
                        ctx.platform.acceleration(X_AXIS) / self.distance_scale,
                        ctx.platform.acceleration(Y_AXIS) / self.distance_scale,
                        ctx.platform.acceleration(Z_AXIS) / self.distance_scale,
                        self.extruder_report(|d| ctx.platform.acceleration(d), self.distance_scale)
                    );
                }
            }

            203 => {
                let scale = 1.0 / 60.0;
                let seen = self.set_per_drive(src, ctx, |p, d, v| p.set_max_feedrate(d, v), scale);
                if !seen {
                    let back = self.distance_scale * scale;
                    reply = format!(
                        "Maximum feedrates: X: {:.1}, Y: {:.1}, Z: {:.1}, E: {}",
                        ctx.platform.max_feedrate(X_AXIS) / back,
                        ctx.platform.max_feedrate(Y_AXIS) / back,
                        ctx.platform.max_feedrate(Z_AXIS) / back,
                        self.extruder_report(|d| ctx.platform.max_feedrate(d), back)
                    );
                }
            }

            205 => {} // advanced jerk settings are the planner's business

            206 => result = self.offset_axes(src, ctx),

            208 => {
                let set_min = self.gb(src).seen('S') && self.gb(src).int_value() == 1;
                let mut set_something = false;
                for axis in 0..AXES {
                    if self.gb(src).seen(AXIS_LETTERS[axis]) {
                        let value = self.gb(src).float_value() * self.distance_scale;
                        if set_min {
                            ctx.platform.set_axis_minimum(axis, value);
                        } else {
                            ctx.platform.set_axis_maximum(axis, value);
                        }
                        set_something = true;
                    }
                }
                if !set_something {
                    let read = |axis: usize| {
                        if set_min {
                            ctx.platform.axis_minimum(axis)
                        } else {
                            ctx.platform.axis_maximum(axis)
                        }
                    };
                    reply = format!(
                        "X:{:.1} Y:{:.1} Z:{:.1}",
                        read(X_AXIS),
                        read(Y_AXIS),
                        read(Z_AXIS)
                    );
                }
            }

            210 => {
                for axis in 0..AXES {
                    if self.gb(src).seen(AXIS_LETTERS[axis]) {
                        let value =
                            self.gb(src).float_value() * self.distance_scale / 60.0;
                        ctx.platform.set_home_feedrate(axis, value);
                    }
                }
            }

            220 => {
                if self.gb(src).seen('S') {
                    let factor = self.gb(src).float_value();
                    let new_speed_factor = factor / (60.0 * 100.0);
                    if new_speed_factor > 0.0 {
                        self.speed_factor_change *= new_speed_factor / self.speed_factor;
                        self.speed_factor = new_speed_factor;
                    } else {
                        error = true;
                        reply = GcodeError::ParameterOutOfRange {
                            letter: 'S',
                            value: factor,
                        }
                        .to_string();
                    }
                }
            }

            221 => {
                if self.gb(src).seen('S') {
                    let factor = self.gb(src).float_value() / 100.0;
                    let drive = if self.gb(src).seen('D') {
                        self.gb(src).int_value()
                    } else {
                        0
                    };
                    if drive >= 0 && (drive as usize) < DRIVES - AXES && factor >= 0.0 {
                        self.extrusion_factors[drive as usize] = factor;
                    }
                }
            }

            301 => self.set_pid_parameters(src, ctx, 1, &mut reply),
            304 => self.set_pid_parameters(src, ctx, BED_HEATER, &mut reply),
            305 => self.set_heater_parameters(src, ctx, &mut reply),

            503 => result = self.send_config_to_line(ctx),

            540 => {
                if self.gb(src).seen('P') {
                    self.set_mac_address(src, ctx);
                }
            }

            550 => {
                if self.gb(src).seen('P') {
                    let name = self.gb(src).string_value();
                    ctx.web.set_name(&name);
                }
            }

            551 => {
                if self.gb(src).seen('P') {
                    let password = self.gb(src).string_value();
                    ctx.web.set_password(&password);
                }
            }

            552 => {
                if self.gb(src).seen('P') {
                    self.set_ethernet_address(src, ctx, code);
                } else {
                    let ip = ctx.platform.ip_address();
                    reply = format!("IP address: {}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]);
                }
            }

            553 => {
                if self.gb(src).seen('P') {
                    self.set_ethernet_address(src, ctx, code);
                } else {
                    let nm = ctx.platform.net_mask();
                    reply = format!("Net mask: {}.{}.{}.{}", nm[0], nm[1], nm[2], nm[3]);
                }
            }

            554 => {
                if self.gb(src).seen('P') {
                    self.set_ethernet_address(src, ctx, code);
                } else {
                    let gw = ctx.platform.gateway();
                    reply = format!("Gateway: {}.{}.{}.{}", gw[0], gw[1], gw[2], gw[3]);
                }
            }

            555 => {
                if self.gb(src).seen('P') {
                    let code = self.gb(src).int_value();
                    match Compatibility::from_code(code) {
                        Some(compat) => {
                            if !ctx.platform.set_emulating(compat) {
                                self.note_unsupported_emulation(ctx, compat);
                            }
                        }
                        None => {
                            error = true;
                            reply = format!("invalid emulation mode: {code}");
                        }
                    }
                }
            }

            556 => {
                if self.gb(src).seen('S') {
                    let value = self.gb(src).float_value();
                    if value != 0.0 {
                        for axis in 0..AXES {
                            if self.gb(src).seen(AXIS_LETTERS[axis]) {
                                let amount = self.gb(src).float_value();
                                ctx.planner.set_axis_compensation(axis, amount / value);
                            }
                        }
                    }
                }
            }

            557 => {
                if self.gb(src).seen('P') {
                    let point = self.gb(src).int_value() as usize;
                    if self.gb(src).seen(AXIS_LETTERS[X_AXIS]) {
                        let x = self.gb(src).float_value();
                        ctx.planner.set_x_bed_probe_point(point, x);
                    }
                    if self.gb(src).seen(AXIS_LETTERS[Y_AXIS]) {
                        let y = self.gb(src).float_value();
                        ctx.planner.set_y_bed_probe_point(point, y);
                    }
                }
            }

            558 => {
                if self.gb(src).seen('P') {
                    let t = self.gb(src).int_value();
                    ctx.platform.set_z_probe_type(t);
                } else {
                    reply = format!("Z Probe: {}", ctx.platform.z_probe_type().code());
                }
            }

            559 => {
                let name = if self.gb(src).seen('P') {
                    self.gb(src).string_value()
                } else {
                    ctx.platform.config_file().to_string()
                };
                let ok = self.open_file_to_write(SYS_DIR, &name, src, ctx);
                if ok {
                    reply = format!("Writing to file: {name}");
                } else {
                    error = true;
                    reply = format!("Can't open file {name} for writing.");
                }
            }

            560 => {
                let name = if self.gb(src).seen('P') {
                    self.gb(src).string_value()
                } else {
                    "reprap.htm".to_string()
                };
                let ok = self.open_file_to_write(WEB_DIR, &name, src, ctx);
                if ok {
                    reply = format!("Writing to file: {name}");
                } else {
                    error = true;
                    reply = format!("Can't open file {name} for writing.");
                }
            }

            561 => ctx.planner.set_identity_transform(),

            562 => {
                if self.gb(src).seen('P') {
                    let heater = self.gb(src).int_value();
                    if heater >= 0 && (heater as usize) < printforge_core::HEATERS {
                        ctx.platform.clear_heater_fault(heater as usize);
                        ctx.heat.reset_fault(heater as usize);
                    }
                }
            }

            563 => self.add_new_tool(src),

            564 => {
                if self.gb(src).seen('S') {
                    self.limit_axes = self.gb(src).int_value() != 0;
                }
            }

            566 => {
                let scale = 1.0 / 60.0;
                let seen = self.set_per_drive(src, ctx, |p, d, v| p.set_instant_dv(d, v), scale);
                if !seen {
                    let back = self.distance_scale * scale;
                    reply = format!(
                        "Minimum feedrates: X: {:.1}, Y: {:.1}, Z: {:.1}, E: {}",
                        ctx.platform.instant_dv(X_AXIS) / back,
                        ctx.platform.instant_dv(Y_AXIS) / back,
                        ctx.platform.instant_dv(Z_AXIS) / back,
                        self.extruder_report(|d| ctx.platform.instant_dv(d), back)
                    );
                }
            }

            906 => {
                for axis in 0..AXES {
                    if self.gb(src).seen(AXIS_LETTERS[axis]) {
                        let value = self.gb(src).float_value();
                        ctx.platform.set_motor_current(axis, value);
                    }
                }
                if self.gb(src).seen(EXTRUDE_LETTER) {
                    let values = self.gb(src).float_array(DRIVES - AXES);
                    if values.len() == DRIVES - AXES {
                        for (e, &v) in values.iter().enumerate() {
                            ctx.platform.set_motor_current(AXES + e, v);
                        }
                    } else {
                        ctx.platform.message(
                            MessageKind::Host,
                            "Setting motor currents - wrong number of E drives\n",
                        );
                    }
                }
            }

            998 => {
                if self.gb(src).seen('P') {
                    reply = self.gb(src).int_value().to_string();
                    resend = true;
                }
            }

            999 => {
                // Give the reply a chance to go out before restarting.
                result = self.do_dwell_time(500, ctx);
                if result {
                    ctx.platform.software_reset(reset_reason::USER);
                }
            }

            _ => {
                error = true;
                reply = GcodeError::UnknownM {
                    line: self.gb(src).buffer().to_string(),
                }
                .to_string();
            }
        }

        if result {
            self.handle_reply(ctx, src, error, &reply, 'M', code, resend);
        }
        result
    }

    fn handle_tcode(&mut self, src: Source, ctx: &mut Context) -> bool {
        let code = {
            let gb = self.gb(src);
            gb.seen('T');
            gb.int_value()
        };
        let result = self.change_tool(code, ctx);
        if result {
            self.handle_reply(ctx, src, false, "", 'T', code, false);
        }
        result
    }

    // ----- replies -----

    /// Send a command reply with the framing the emulation mode asks for.
    pub(crate) fn handle_reply(
        &mut self,
        ctx: &mut Context,
        src: Source,
        error: bool,
        reply: &str,
        code_letter: char,
        code: i32,
        resend: bool,
    ) {
        // The web clients get every reply except the diagnostics pair,
        // which went out through the generic route already.
        if !(code_letter == 'M' && (code == 111 || code == 122)) && !reply.is_empty() {
            let text = if error {
                format!("Error: {reply}\n")
            } else {
                format!("{reply}\n")
            };
            ctx.platform.message(MessageKind::Web, &text);
        }

        let compat = if src == Source::Serial {
            ctx.platform.emulating()
        } else {
            Compatibility::Me
        };
        let response = if resend { "rs" } else { "ok" };

        match compat {
            Compatibility::Me | Compatibility::RepRapFirmware => {
                if resend {
                    ctx.platform
                        .message(MessageKind::Host, &format!("{response} {reply}\n"));
                    return;
                }
                if reply.is_empty() {
                    return;
                }
                if error {
                    ctx.platform
                        .message(MessageKind::Host, &format!("Error: {reply}\n"));
                } else {
                    ctx.platform.message(MessageKind::Host, &format!("{reply}\n"));
                }
            }

            Compatibility::Marlin => {
                // A few codes place the ok on its own line or inline with
                // the reply.
                if code_letter == 'M' && code == 20 {
                    ctx.platform.message(
                        MessageKind::Host,
                        &format!("Begin file list\n{reply}\nEnd file list\n{response}\n"),
                    );
                } else if code_letter == 'M' && code == 28 {
                    ctx.platform
                        .message(MessageKind::Host, &format!("{response}\n{reply}\n"));
                } else if (code_letter == 'M' && code == 105)
                    || (code_letter == 'G' && code == 998)
                {
                    ctx.platform
                        .message(MessageKind::Host, &format!("{response} {reply}\n"));
                } else {
                    let mut text = String::new();
                    if !reply.is_empty() {
                        text.push_str(reply);
                        text.push('\n');
                    }
                    text.push_str(response);
                    text.push('\n');
                    ctx.platform.message(MessageKind::Host, &text);
                }
            }

            other => self.note_unsupported_emulation(ctx, other),
        }
    }

    fn note_unsupported_emulation(&mut self, ctx: &mut Context, compat: Compatibility) {
        let bit = 1u8 << (compat as u8);
        if self.emulation_noted & bit == 0 {
            self.emulation_noted |= bit;
            ctx.platform.message(
                MessageKind::Host,
                &format!("Emulation of {compat} is not yet supported.\n"),
            );
        }
    }

    // ----- command helpers -----

    pub(crate) fn no_home(&self) -> bool {
        !(self.home_x || self.home_y || self.home_z)
    }

    fn heater_enable_blocked(
        &mut self,
        ctx: &mut Context,
        heater: usize,
        error: &mut bool,
        reply: &mut String,
    ) -> bool {
        if ctx.platform.heater_fault(heater) {
            *error = true;
            reply.clear();
            reply.push_str(&format!(
                "heater {heater} fault latched; clear it with M562 P{heater}"
            ));
            true
        } else {
            false
        }
    }

    /// Set every drive-indexed parameter mentioned on the line, scaling
    /// G-code units to internal ones. Returns whether anything was seen.
    fn set_per_drive(
        &mut self,
        src: Source,
        ctx: &mut Context,
        set: impl Fn(&mut Platform, usize, f64),
        time_scale: f64,
    ) -> bool {
        let mut seen = false;
        for axis in 0..AXES {
            if self.gb(src).seen(AXIS_LETTERS[axis]) {
                let v = self.gb(src).float_value() * self.distance_scale * time_scale;
                set(&mut *ctx.platform, axis, v);
                seen = true;
            }
        }
        if self.gb(src).seen(EXTRUDE_LETTER) {
            seen = true;
            let values = self.gb(src).float_array(DRIVES - AXES);
            if values.len() == DRIVES - AXES {
                for (e, &v) in values.iter().enumerate() {
                    set(&mut *ctx.platform, AXES + e, v * self.distance_scale * time_scale);
                }
            } else {
                ctx.platform
                    .message(MessageKind::Host, "Wrong number of E drives\n");
            }
        }
        seen
    }

    fn extruder_report(&self, value: impl Fn(usize) -> f64, back_scale: f64) -> String {
        (AXES..DRIVES)
            .map(|d| format!("{:.1}", value(d) / back_scale))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Report the live coordinates (M114).
    fn get_current_coordinates(&self, ctx: &mut Context) -> String {
        let mut live: MoveArray = [0.0; DRIVES + 1];
        ctx.planner.live_coordinates(&mut live);
        let mut s = format!(
            "X:{:.3} Y:{:.3} Z:{:.3} ",
            live[X_AXIS], live[Y_AXIS], live[Z_AXIS]
        );
        for e in AXES..DRIVES {
            s.push_str(&format!("E{}:{:.3} ", e - AXES, live[e]));
        }
        s.trim_end().to_string()
    }

    /// Diagnostics for this layer (M122).
    fn diagnostics(&mut self, ctx: &mut Context) {
        ctx.platform
            .message(MessageKind::Generic, "GCodes Diagnostics:\n");
        let text = format!("Stack depth: {}\n", self.stack.len());
        ctx.platform.message(MessageKind::Generic, &text);
    }

    /// M112: bypass everything and bring the machine to a safe state.
    /// Public because the web server invokes it directly, outside normal
    /// dispatch.
    pub fn emergency_stop(&mut self, ctx: &mut Context) {
        for heater in 0..printforge_core::HEATERS {
            ctx.heat.standby(heater);
        }
        for drive in 0..DRIVES {
            ctx.platform.disable_drive(drive);
        }
        ctx.planner.set_z_probing(false);
        ctx.platform.set_z_probing(false);
        self.reset();
        self.active = true;
    }

    pub(crate) fn disable_drives(&mut self, ctx: &mut Context) -> bool {
        if !self.all_moves_finished_and_move_buffer_loaded(ctx) {
            return false;
        }
        for drive in 0..DRIVES {
            ctx.platform.disable_drive(drive);
        }
        true
    }

    pub(crate) fn standby_heaters(&mut self, ctx: &mut Context) -> bool {
        if !self.all_moves_finished_and_move_buffer_loaded(ctx) {
            return false;
        }
        ctx.heat.standby(BED_HEATER);
        if let Some(tool) = self.current_tool {
            let heaters: Vec<usize> = (0..self.tools[tool].heater_count())
                .map(|i| self.tools[tool].heater(i))
                .collect();
            for h in heaters {
                ctx.heat.standby(h);
            }
        }
        true
    }

    // ----- dwell -----

    fn do_dwell(&mut self, src: Source, ctx: &mut Context) -> bool {
        if !self.gb(src).seen('P') {
            return true; // no time given, nothing to wait for
        }
        let millis = self.gb(src).long_value().max(0) as u64;
        if !ctx.planner.all_moves_finished() {
            return false;
        }
        self.do_dwell_time(millis, ctx)
    }

    pub(crate) fn do_dwell_time(&mut self, millis: u64, ctx: &mut Context) -> bool {
        if self.dwell_waiting {
            if ctx.platform.millis() >= self.dwell_end_millis {
                self.dwell_waiting = false;
                ctx.planner.resume_moving();
                return true;
            }
            return false;
        }
        self.dwell_waiting = true;
        self.dwell_end_millis = ctx.platform.millis() + millis;
        false
    }

    // ----- heater parameter commands -----

    /// M301/M304: PID gains for a heater.
    fn set_pid_parameters(
        &mut self,
        src: Source,
        ctx: &mut Context,
        default_heater: usize,
        reply: &mut String,
    ) {
        let heater = if self.gb(src).seen('H') {
            self.gb(src).int_value()
        } else {
            default_heater as i32
        };
        if heater < 0 || heater as usize >= printforge_core::HEATERS {
            return;
        }
        let heater = heater as usize;

        let mut pp = ctx.platform.pid_parameters(heater).clone();
        let mut seen = false;
        if self.gb(src).seen('P') {
            pp.k_p = self.gb(src).float_value();
            seen = true;
        }
        if self.gb(src).seen('I') {
            pp.k_i = self.gb(src).float_value();
            seen = true;
        }
        if self.gb(src).seen('D') {
            pp.k_d = self.gb(src).float_value();
            seen = true;
        }
        if self.gb(src).seen('W') {
            pp.pid_max = self.gb(src).float_value();
            seen = true;
        }
        if self.gb(src).seen('B') {
            pp.full_band = self.gb(src).float_value();
            seen = true;
        }

        if seen {
            ctx.platform.set_pid_parameters(heater, pp);
        } else {
            *reply = format!(
                "P:{:.2} I:{:.3} D:{:.2} W:{:.1} B:{:.1}",
                pp.k_p, pp.k_i, pp.k_d, pp.pid_max, pp.full_band
            );
        }
    }

    /// M305: thermistor model for a heater. R25 and beta must be set
    /// together so Rinf stays consistent.
    fn set_heater_parameters(&mut self, src: Source, ctx: &mut Context, reply: &mut String) {
        if !self.gb(src).seen('P') {
            return;
        }
        let heater = self.gb(src).int_value();
        if heater < 0 || heater as usize >= printforge_core::HEATERS {
            return;
        }
        let heater = heater as usize;
        let mut pp: PidParameters = ctx.platform.pid_parameters(heater).clone();
        let mut seen = false;

        let r25 = if self.gb(src).seen('T') {
            seen = true;
            self.gb(src).float_value()
        } else {
            pp.thermistor_r25()
        };
        let beta = if self.gb(src).seen('B') {
            seen = true;
            self.gb(src).float_value()
        } else {
            pp.beta()
        };
        if seen {
            pp.set_thermistor_r25_and_beta(r25, beta);
        }

        if self.gb(src).seen('R') {
            pp.thermistor_series_r = self.gb(src).float_value();
            seen = true;
        }
        if self.gb(src).seen('L') {
            pp.adc_low_offset = self.gb(src).float_value();
            seen = true;
        }
        if self.gb(src).seen('H') {
            pp.adc_high_offset = self.gb(src).float_value();
            seen = true;
        }

        if seen {
            ctx.platform.set_pid_parameters(heater, pp);
        } else {
            *reply = format!(
                "T:{:.1} B:{:.1} R:{:.1} L:{:.1} H:{:.1}",
                r25, beta, pp.thermistor_series_r, pp.adc_low_offset, pp.adc_high_offset
            );
        }
    }

    /// M104/M109: active temperature for every heater of the current
    /// tool.
    fn set_tool_heaters(
        &mut self,
        temperature: f64,
        ctx: &mut Context,
        error: &mut bool,
        reply: &mut String,
    ) {
        let Some(tool_index) = self.current_tool else {
            ctx.platform
                .message(MessageKind::Host, "Setting temperature: no tool selected.\n");
            return;
        };
        let heaters: Vec<usize> = (0..self.tools[tool_index].heater_count())
            .map(|i| self.tools[tool_index].heater(i))
            .collect();
        for &h in &heaters {
            if self.heater_enable_blocked(ctx, h, error, reply) {
                return;
            }
        }
        self.tools[tool_index].set_all_active(temperature);
        for h in heaters {
            ctx.heat.set_active_temperature(h, temperature);
            ctx.heat.activate(h);
        }
    }

    // ----- network parameter commands -----

    fn set_ethernet_address(&mut self, src: Source, ctx: &mut Context, mcode: i32) {
        let text = {
            let gb = self.gb(src);
            gb.seen('P');
            gb.string_value()
        };
        let parts: Vec<&str> = text.split('.').collect();
        let mut eth = [0u8; 4];
        let ok = parts.len() == 4
            && parts
                .iter()
                .enumerate()
                .all(|(i, p)| match p.trim().parse::<u8>() {
                    Ok(v) => {
                        eth[i] = v;
                        true
                    }
                    Err(_) => false,
                });
        if !ok {
            ctx.platform
                .message(MessageKind::Host, &format!("Dud IP address: {text}\n"));
            return;
        }
        match mcode {
            552 => ctx.platform.set_ip_address(eth),
            553 => ctx.platform.set_net_mask(eth),
            554 => ctx.platform.set_gateway(eth),
            _ => {}
        }
    }

    fn set_mac_address(&mut self, src: Source, ctx: &mut Context) {
        let text = {
            let gb = self.gb(src);
            gb.seen('P');
            gb.string_value()
        };
        let parts: Vec<&str> = text.split(':').collect();
        let mut mac = [0u8; 6];
        let ok = parts.len() == 6
            && parts
                .iter()
                .enumerate()
                .all(|(i, p)| match u8::from_str_radix(p.trim(), 16) {
                    Ok(v) => {
                        mac[i] = v;
                        true
                    }
                    Err(_) => false,
                });
        if ok {
            ctx.platform.set_mac_address(mac);
        } else {
            ctx.platform
                .message(MessageKind::Host, &format!("Dud MAC address: {text}\n"));
        }
    }

    // ----- file commands -----

    /// M23: open a print file but do not start it.
    fn queue_file_to_print(&mut self, name: &str, ctx: &mut Context) {
        self.file_to_print = None;
        // A paused wait-style command must not resume against a new file.
        self.gb(Source::File).cancel_pause();
        match ctx.platform.get_file_store(GCODE_DIR, name, false) {
            Ok(Some(f)) => self.file_to_print = Some(f),
            Ok(None) => {
                ctx.platform
                    .message_error(MessageKind::Generic, "GCode file not found\n");
            }
            Err(e) => {
                ctx.platform
                    .message_error(MessageKind::Generic, &format!("GCode file open: {e}\n"));
            }
        }
    }

    /// Pause the SD print from outside the dispatcher (the web interface
    /// pause button).
    pub fn pause_sd_print(&mut self) {
        if self.file_being_printed.is_some() {
            self.file_to_print = self.file_being_printed.take();
            self.gb(Source::File).pause();
        }
    }

    fn open_file_to_write(
        &mut self,
        directory: &'static str,
        name: &str,
        src: Source,
        ctx: &mut Context,
    ) -> bool {
        self.eof_counter = 0;
        match ctx.platform.get_file_store(directory, name, true) {
            Ok(Some(f)) => {
                self.file_being_written = Some(f);
                self.writing_dir = Some(directory);
                self.writing_source = Some(src);
                self.gb(src).set_writing_file(true);
                true
            }
            _ => {
                ctx.platform
                    .message(MessageKind::Host, "Can't open GCode file for writing.\n");
                false
            }
        }
    }

    fn finish_writing(&mut self, src: Source) {
        self.file_being_written = None;
        self.writing_dir = None;
        self.writing_source = None;
        self.gb(src).set_writing_file(false);
    }

    /// A completed line while a G-code file is being written: watch for
    /// M29 (end) and G998/M998 (resend), store everything else.
    pub(crate) fn write_gcode_to_file(&mut self, src: Source, ctx: &mut Context) {
        if self.file_being_written.is_none() {
            ctx.platform
                .message(MessageKind::Host, "Attempt to write to a null file.\n");
            self.gb(src).set_finished(true);
            return;
        }

        if self.gb(src).seen('M') && self.gb(src).int_value() == 29 {
            self.file_being_written = None;
            let marlin = ctx.platform.emulating() == Compatibility::Marlin;
            self.finish_writing(src);
            let reply = if marlin { "Done saving file." } else { "" };
            self.handle_reply(ctx, src, false, reply, 'M', 29, false);
            self.gb(src).set_finished(true);
            return;
        }

        if self.gb(src).seen('G') && self.gb(src).int_value() == 998 && self.gb(src).seen('P') {
            let line_number = self.gb(src).int_value().to_string();
            self.handle_reply(ctx, src, false, &line_number, 'G', 998, true);
            self.gb(src).set_finished(true);
            return;
        }

        let line = self.gb(src).buffer().to_string();
        if let Some(f) = self.file_being_written.as_mut() {
            let write = f.write_str(&line).and_then(|_| f.write_str("\n"));
            if let Err(e) = write {
                ctx.platform
                    .message_error(MessageKind::Generic, &format!("File write: {e}\n"));
            }
        }
        self.handle_reply(ctx, src, false, "", 'G', 1, false);
        self.gb(src).set_finished(true);
    }

    /// One byte of a web-interface upload. The end-of-file marker is
    /// matched incrementally; a partial match that breaks is flushed to
    /// the file.
    pub(crate) fn write_html_to_file(&mut self, b: u8, ctx: &mut Context) {
        if self.file_being_written.is_none() {
            ctx.platform
                .message(MessageKind::Host, "Attempt to write to a null file.\n");
            return;
        }
        let eof = HTML_EOF_STRING.as_bytes();

        if self.eof_counter != 0 && b != eof[self.eof_counter] {
            let held = self.eof_counter;
            let file = self.file_being_written.as_mut().unwrap();
            for &e in eof.iter().take(held) {
                let _ = file.write_byte(e);
            }
            self.eof_counter = 0;
        }

        if b == eof[self.eof_counter] {
            self.eof_counter += 1;
            if self.eof_counter >= eof.len() {
                self.file_being_written = None;
                let marlin = ctx.platform.emulating() == Compatibility::Marlin;
                self.finish_writing(Source::Serial);
                let reply = if marlin { "Done saving file." } else { "" };
                self.handle_reply(ctx, Source::Serial, false, reply, 'M', 560, false);
            }
        } else {
            let write = self.file_being_written.as_mut().unwrap().write_byte(b);
            if let Err(e) = write {
                ctx.platform
                    .message_error(MessageKind::Generic, &format!("File write: {e}\n"));
            }
        }
    }

    /// M503: stream the configuration file to the host one line per spin.
    fn send_config_to_line(&mut self, ctx: &mut Context) -> bool {
        if self.config_file_being_sent.is_none() {
            let name = ctx.platform.config_file();
            match ctx.platform.get_file_store(SYS_DIR, name, false) {
                Ok(Some(f)) => {
                    self.config_file_being_sent = Some(f);
                    ctx.platform.message(MessageKind::Host, "\n");
                }
                _ => {
                    ctx.platform
                        .message(MessageKind::Host, "Configuration file not found\n");
                    return true;
                }
            }
        }

        let (line, finished) = {
            let file = self.config_file_being_sent.as_mut().unwrap();
            let mut line = String::new();
            loop {
                match file.read_byte() {
                    Ok(Some(b)) => {
                        line.push(b as char);
                        if b == b'\n' {
                            break (line, false);
                        }
                    }
                    _ => {
                        line.push('\n');
                        break (line, true);
                    }
                }
            }
        };
        ctx.platform.message(MessageKind::Host, &line);
        if finished {
            self.config_file_being_sent = None;
        }
        finished
    }

    // ----- tools -----

    /// M563: define a tool.
    fn add_new_tool(&mut self, src: Source) {
        if !self.gb(src).seen('P') {
            return;
        }
        let number = self.gb(src).int_value();

        let drives: Vec<usize> = if self.gb(src).seen('D') {
            self.gb(src)
                .long_array(DRIVES - AXES)
                .iter()
                .filter(|&&d| d >= 0 && (d as usize) < DRIVES - AXES)
                .map(|&d| d as usize)
                .collect()
        } else {
            Vec::new()
        };
        let heaters: Vec<usize> = if self.gb(src).seen('H') {
            self.gb(src)
                .long_array(printforge_core::HEATERS)
                .iter()
                .filter(|&&h| h >= 0 && (h as usize) < printforge_core::HEATERS)
                .map(|&h| h as usize)
                .collect()
        } else {
            Vec::new()
        };

        self.tools.retain(|t| t.number() != number);
        self.tools.push(Tool::new(number, drives, heaters));
    }

    /// G10: set tool temperatures.
    fn set_offsets(&mut self, src: Source, ctx: &mut Context) -> bool {
        if !self.gb(src).seen('P') {
            return true;
        }
        let number = self.gb(src).int_value();
        let Some(index) = self.tools.iter().position(|t| t.number() == number) else {
            ctx.platform.message(
                MessageKind::Host,
                &format!("Attempt to set temperatures for non-existent tool: {number}\n"),
            );
            return true;
        };
        let heater_count = self.tools[index].heater_count();

        let standby = if self.gb(src).seen('R') {
            self.gb(src).float_array(heater_count)
        } else {
            self.tools[index].variables().0.to_vec()
        };
        let active = if self.gb(src).seen('S') {
            self.gb(src).float_array(heater_count)
        } else {
            self.tools[index].variables().1.to_vec()
        };
        self.tools[index].set_variables(&standby, &active);
        true
    }

    /// Put a tool's heaters on standby.
    pub(crate) fn standby_tool(&mut self, number: i32, ctx: &mut Context) {
        if let Some(tool) = self.tools.iter().find(|t| t.number() == number) {
            let (standby, _) = tool.variables();
            let temps: Vec<(usize, f64)> = (0..tool.heater_count())
                .map(|i| (tool.heater(i), standby[i]))
                .collect();
            for (h, t) in temps {
                ctx.heat.set_standby_temperature(h, t);
                ctx.heat.standby(h);
            }
        }
        if self.current_tool.map(|i| self.tools[i].number()) == Some(number) {
            self.current_tool = None;
        }
    }

    /// Select a tool and bring its heaters to active. Selecting an
    /// unknown number deselects all tools.
    pub(crate) fn select_tool(&mut self, number: i32, ctx: &mut Context) {
        let Some(index) = self.tools.iter().position(|t| t.number() == number) else {
            self.current_tool = None;
            return;
        };
        self.current_tool = Some(index);
        let tool = &self.tools[index];
        let (_, active) = tool.variables();
        let temps: Vec<(usize, f64)> = (0..tool.heater_count())
            .map(|i| (tool.heater(i), active[i]))
            .collect();
        for (h, t) in temps {
            if ctx.platform.heater_fault(h) {
                ctx.platform.message_error(
                    MessageKind::Generic,
                    &format!("heater {h} fault latched; clear it with M562 P{h}\n"),
                );
                continue;
            }
            ctx.heat.set_active_temperature(h, t);
            ctx.heat.activate(h);
        }
    }

    /// The currently selected tool.
    pub fn current_tool(&self) -> Option<&Tool> {
        self.current_tool.map(|i| &self.tools[i])
    }

    /// How far each extruder has been told to travel, for reporting.
    pub fn extruder_position(&self, extruder: usize) -> f64 {
        self.last_extruder_pos.get(extruder).copied().unwrap_or(0.0)
    }

    // ----- moves -----

    /// Wait for quiescence, then reload the move buffer with the current
    /// position and feedrate. Call until it returns true.
    pub(crate) fn all_moves_finished_and_move_buffer_loaded(&mut self, ctx: &mut Context) -> bool {
        if self.move_available {
            return false;
        }
        if !ctx.planner.all_moves_finished() {
            return false;
        }
        ctx.planner.resume_moving();
        ctx.planner.current_user_position(&mut self.move_buffer)
    }

    /// Fill the move buffer from a movement command. Axis words are
    /// absolute or relative per G90/G91; extruder words are mapped
    /// through the selected tool and always handed to the planner as
    /// relative distances.
    pub(crate) fn load_move_buffer_from_gcode(
        &mut self,
        src: Source,
        ctx: &mut Context,
        doing_g92: bool,
        apply_limits: bool,
    ) -> bool {
        if self.gb(src).seen(EXTRUDE_LETTER) {
            let Some(tool_index) = self.current_tool else {
                ctx.platform.message_error(
                    MessageKind::Generic,
                    "Attempting to extrude with no tool selected.\n",
                );
                return false;
            };
            let drive_count = self.tools[tool_index].drive_count();
            let movement = self.gb(src).float_array(drive_count);
            if movement.len() != drive_count {
                ctx.platform.message(
                    MessageKind::Host,
                    &format!(
                        "Wrong number of extruder drives for the selected tool: {}\n",
                        self.gb(src).buffer()
                    ),
                );
                return false;
            }

            // Unmentioned extruder drives must not move.
            for drive in AXES..DRIVES {
                self.move_buffer[drive] = 0.0;
            }

            for (i, &raw) in movement.iter().enumerate() {
                let extruder = self.tools[tool_index].drive(i);
                let move_arg = raw * self.distance_scale;
                if doing_g92 {
                    self.move_buffer[AXES + extruder] = 0.0;
                    self.last_extruder_pos[extruder] = move_arg;
                } else if self.drives_relative {
                    self.move_buffer[AXES + extruder] =
                        move_arg * self.extrusion_factors[extruder];
                    self.last_extruder_pos[extruder] += move_arg;
                } else {
                    self.move_buffer[AXES + extruder] = (move_arg
                        - self.last_extruder_pos[extruder])
                        * self.extrusion_factors[extruder];
                    self.last_extruder_pos[extruder] = move_arg;
                }
            }
        }

        for axis in 0..AXES {
            if self.gb(src).seen(AXIS_LETTERS[axis]) {
                let mut move_arg = self.gb(src).float_value() * self.distance_scale;
                if self.axes_relative && !doing_g92 {
                    move_arg += self.move_buffer[axis];
                }
                if apply_limits && axis < 2 && self.axis_is_homed[axis] && !doing_g92 {
                    move_arg = move_arg
                        .max(ctx.platform.axis_minimum(axis))
                        .min(ctx.platform.axis_maximum(axis));
                }
                self.move_buffer[axis] = move_arg;
                if doing_g92 {
                    // Defining the position also defines "homed".
                    self.axis_is_homed[axis] = true;
                }
            }
        }

        if self.gb(src).seen(FEEDRATE_LETTER) {
            // G-code feedrates are mm/min; the planner wants mm/s.
            self.move_buffer[DRIVES] =
                self.gb(src).float_value() * self.distance_scale * self.speed_factor;
        }

        true
    }

    /// G0/G1. Returns 0 when the slot is still occupied, 1 when the move
    /// was queued, 2 when it was queued with endstop checks and the
    /// caller must wait for it.
    pub(crate) fn set_up_move(&mut self, src: Source, ctx: &mut Context) -> i32 {
        if self.move_available {
            return 0;
        }
        if !ctx.planner.current_user_position(&mut self.move_buffer) {
            return 0;
        }

        self.move_buffer[DRIVES] *= self.speed_factor_change;
        self.speed_factor_change = 1.0;

        self.check_endstops = self.gb(src).seen('S') && self.gb(src).int_value() == 1;

        let apply_limits = !self.check_endstops && self.limit_axes;
        self.move_available = self.load_move_buffer_from_gcode(src, ctx, false, apply_limits);
        if self.check_endstops {
            2
        } else {
            1
        }
    }

    /// G92.
    pub(crate) fn set_positions(&mut self, src: Source, ctx: &mut Context) -> bool {
        if !self.all_moves_finished_and_move_buffer_loaded(ctx) {
            return false;
        }
        if self.load_move_buffer_from_gcode(src, ctx, true, false) {
            // Transform so that a G92 Z0 really reads back as zero.
            ctx.planner.transform(&mut self.move_buffer);
            ctx.planner.set_live_coordinates(&self.move_buffer);
            ctx.planner.set_positions(&self.move_buffer);
            // Effectively stationary after a G92.
            ctx.planner.set_feedrate(ctx.platform.slowest_instant_dv());
        }
        true
    }
}

impl Default for GCodes {
    fn default() -> Self {
        Self::new()
    }
}
