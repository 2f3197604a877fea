//! Canned cycles
//!
//! The multi-tick sequences: push/pop of the execution context, canned
//! moves built from `move_to_do`, macro file playback, homing, single and
//! multi-point bed probing, tool changes and axis offsetting. Every
//! sequence is a small explicit state machine driven by repeated calls
//! from the dispatcher; each step returns false until it completes.

use crate::gcodes::{Context, GCodes, Source, StackFrame, SILLY_Z_VALUE, STACK};
use printforge_core::{
    GcodeError, AXES, AXIS_LETTERS, DRIVES, FEEDRATE_LETTER, X_AXIS, Y_AXIS, Z_AXIS,
};
use printforge_platform::{MessageKind, SYS_DIR};

/// Macro run by G28 when all three axes are requested.
const HOME_ALL_FILE: &str = "homeall.g";
/// Per-axis homing macros, in axis order.
const HOME_AXIS_FILES: [&str; AXES] = ["homeX.g", "homeY.g", "homeZ.g"];

impl GCodes {
    /// Save the execution context: relative modes, feedrate and the print
    /// file position. Call until it returns true. Overflow reports an
    /// error and behaves as completed.
    pub(crate) fn push(&mut self, ctx: &mut Context) -> bool {
        if self.stack.len() >= STACK {
            ctx.platform
                .message_error(MessageKind::Generic, "Push(): stack overflow\n");
            return true;
        }
        if !self.all_moves_finished_and_move_buffer_loaded(ctx) {
            return false;
        }

        let file = match self.file_being_printed.as_ref() {
            Some(f) => match f.duplicate() {
                Ok(dup) => Some(dup),
                Err(e) => {
                    ctx.platform.message_error(
                        MessageKind::Generic,
                        &format!("Cannot save print file position: {e}\n"),
                    );
                    None
                }
            },
            None => None,
        };

        self.stack.push(StackFrame {
            drives_relative: self.drives_relative,
            axes_relative: self.axes_relative,
            feedrate: self.move_buffer[DRIVES],
            file,
        });
        ctx.platform.push_message_indent();
        true
    }

    /// Restore the context saved by the matching push and queue a
    /// zero-displacement move to re-seat the planner at the restored
    /// feedrate. Call until it returns true. Underflow reports an error
    /// and behaves as completed.
    pub(crate) fn pop(&mut self, ctx: &mut Context) -> bool {
        if self.stack.is_empty() {
            ctx.platform
                .message_error(MessageKind::Generic, "Pop(): stack underflow\n");
            return true;
        }
        if !self.all_moves_finished_and_move_buffer_loaded(ctx) {
            return false;
        }

        let frame = self.stack.pop().unwrap();
        self.drives_relative = frame.drives_relative;
        self.axes_relative = frame.axes_relative;
        self.file_being_printed = frame.file;
        ctx.platform.pop_message_indent();

        // Remember the extruder positions in case the restored mode is
        // absolute.
        for drive in AXES..DRIVES {
            self.last_extruder_pos[drive - AXES] = self.move_buffer[drive];
        }

        self.move_buffer[DRIVES] = frame.feedrate;
        self.check_endstops = false;
        self.move_available = true;
        true
    }

    /// Execute one canned move: push, load `move_to_do` over the drives
    /// flagged in `active_drives`, let it run, then pop. Call until it
    /// returns true.
    pub(crate) fn do_canned_cycle_move(&mut self, check_endstops: bool, ctx: &mut Context) -> bool {
        if self.canned_cycle_move_queued {
            // The move is running; wait for it, then restore the state.
            if !self.pop(ctx) {
                return false;
            }
            self.canned_cycle_move_queued = false;
            true
        } else {
            if !self.push(ctx) {
                return false;
            }
            for drive in 0..=DRIVES {
                if self.active_drives[drive] {
                    self.move_buffer[drive] = self.move_to_do[drive];
                }
            }
            self.check_endstops = check_endstops;
            self.canned_cycle_move_queued = true;
            self.move_available = true;
            false
        }
    }

    /// Play a macro file from the sys directory through the macro buffer.
    /// Call until it returns true. A missing file is reported and counts
    /// as completed.
    pub(crate) fn do_file_macro(&mut self, name: &str, ctx: &mut Context) -> bool {
        if self.doing_macro_file
            && self.gb(Source::Macro).state() == crate::buffer::BufferState::Complete
        {
            // A line inside a running macro is trying to start another
            // one. There is a single macro buffer, so that cannot work.
            ctx.platform
                .message_error(MessageKind::Generic, "Nested macro files are not supported\n");
            return true;
        }
        if !self.doing_macro_file {
            if !self.push(ctx) {
                return false;
            }
            match ctx.platform.get_file_store(SYS_DIR, name, false) {
                Ok(Some(f)) => {
                    self.file_being_printed = Some(f);
                    self.doing_macro_file = true;
                    self.gb(Source::Macro).init();
                    false
                }
                _ => {
                    let missing = GcodeError::MacroNotFound {
                        name: name.to_string(),
                    };
                    ctx.platform
                        .message(MessageKind::Host, &format!("{missing}.\n"));
                    if !self.pop(ctx) {
                        ctx.platform
                            .message(MessageKind::Host, "Cannot pop the stack.\n");
                    }
                    true
                }
            }
        } else if self.file_being_printed.is_none() {
            // The macro has been fully consumed.
            if !self.pop(ctx) {
                return false;
            }
            self.doing_macro_file = false;
            self.gb(Source::Macro).init();
            true
        } else if self.gb(Source::Macro).active() {
            let finished = self.act_on_code(Source::Macro, ctx);
            self.gb(Source::Macro).set_finished(finished);
            false
        } else {
            self.do_file_print(Source::Macro, ctx);
            false
        }
    }

    /// M99: end macro playback early. The enclosing macro driver notices
    /// the closed file and pops.
    pub(crate) fn file_macro_return(&mut self, ctx: &mut Context) -> bool {
        if !self.doing_macro_file {
            return true;
        }
        if !self.all_moves_finished_and_move_buffer_loaded(ctx) {
            return false;
        }
        self.doing_macro_file = false;
        self.gb(Source::Macro).init();
        self.file_being_printed = None;
        true
    }

    /// G28. Homes whichever of the three axis flags are set: all three
    /// run the home-all macro, otherwise the per-axis macros run one at a
    /// time. Z homing with a bed probe requires X and Y first.
    pub(crate) fn do_home(
        &mut self,
        ctx: &mut Context,
        reply: &mut String,
        error: &mut bool,
    ) -> bool {
        if self.home_x && self.home_y && self.home_z {
            if self.do_file_macro(HOME_ALL_FILE, ctx) {
                self.home_x = false;
                self.home_y = false;
                self.home_z = false;
                return true;
            }
            return false;
        }

        if self.home_x {
            if self.do_file_macro(HOME_AXIS_FILES[X_AXIS], ctx) {
                self.home_x = false;
                return self.no_home();
            }
            return false;
        }

        if self.home_y {
            if self.do_file_macro(HOME_AXIS_FILES[Y_AXIS], ctx) {
                self.home_y = false;
                return self.no_home();
            }
            return false;
        }

        if self.home_z {
            if ctx.platform.must_home_xy_before_z()
                && !(self.axis_is_homed[X_AXIS] && self.axis_is_homed[Y_AXIS])
            {
                reply.push_str("Must home X and Y before homing Z");
                *error = true;
                self.home_z = false;
                return true;
            }
            if self.do_file_macro(HOME_AXIS_FILES[Z_AXIS], ctx) {
                self.home_z = false;
                return self.no_home();
            }
            return false;
        }

        // Nothing left to home.
        self.check_endstops = false;
        self.move_available = false;
        true
    }

    /// One probe at the stored (X, Y) of probe point `probe_count`:
    /// raise to the dive height, travel, descend with endstop checks
    /// until the probe triggers, raise again, record the result.
    pub(crate) fn do_single_z_probe_at_point(&mut self, ctx: &mut Context) -> bool {
        ctx.planner.set_identity_transform();

        self.active_drives = [false; DRIVES + 1];

        match self.canned_cycle_move_count {
            0 => {
                // Raise to the dive height. Only moves anything on the
                // first point; afterwards Z is already there.
                self.move_to_do[Z_AXIS] = ctx.platform.z_probe_dive_height();
                self.active_drives[Z_AXIS] = true;
                self.move_to_do[DRIVES] = ctx.platform.max_feedrate(Z_AXIS);
                self.active_drives[DRIVES] = true;
                ctx.planner.set_z_probing(false);
                if self.do_canned_cycle_move(false, ctx) {
                    self.canned_cycle_move_count += 1;
                }
                false
            }

            1 => {
                let (x, y, _z, _set) = self.get_probe_coordinates(self.probe_count, ctx);
                self.move_to_do[X_AXIS] = x;
                self.move_to_do[Y_AXIS] = y;
                self.active_drives[X_AXIS] = true;
                self.active_drives[Y_AXIS] = true;
                self.move_to_do[DRIVES] = ctx.platform.max_feedrate(X_AXIS);
                self.active_drives[DRIVES] = true;
                ctx.planner.set_z_probing(false);
                if self.do_canned_cycle_move(false, ctx) {
                    self.canned_cycle_move_count += 1;
                    // Only signalled once per probe.
                    ctx.platform.set_z_probing(true);
                }
                false
            }

            2 => {
                // Descend until the probe triggers. The commanded depth
                // overshoots so the endstop check is what stops it.
                self.move_to_do[Z_AXIS] = -2.0 * ctx.platform.axis_maximum(Z_AXIS);
                self.active_drives[Z_AXIS] = true;
                self.move_to_do[DRIVES] = ctx.platform.home_feedrate(Z_AXIS);
                self.active_drives[DRIVES] = true;
                ctx.planner.set_z_probing(true);
                if self.do_canned_cycle_move(true, ctx) {
                    self.canned_cycle_move_count += 1;
                    ctx.platform.set_z_probing(false);
                }
                false
            }

            3 => {
                self.move_to_do[Z_AXIS] = ctx.platform.z_probe_dive_height();
                self.active_drives[Z_AXIS] = true;
                self.move_to_do[DRIVES] = ctx.platform.max_feedrate(Z_AXIS);
                self.active_drives[DRIVES] = true;
                ctx.planner.set_z_probing(false);
                if self.do_canned_cycle_move(false, ctx) {
                    self.canned_cycle_move_count += 1;
                }
                false
            }

            _ => {
                self.canned_cycle_move_count = 0;
                let probed = ctx.planner.last_probed_z();
                ctx.planner.set_z_bed_probe_point(self.probe_count, probed);
                true
            }
        }
    }

    /// G30 without P: simply descend until the probe or switch triggers.
    pub(crate) fn do_single_z_probe(&mut self, ctx: &mut Context) -> bool {
        self.active_drives = [false; DRIVES + 1];

        match self.canned_cycle_move_count {
            0 => {
                ctx.platform.set_z_probing(true);
                self.canned_cycle_move_count += 1;
                false
            }

            1 => {
                self.move_to_do[Z_AXIS] = -1.1 * ctx.platform.axis_total_length(Z_AXIS);
                self.active_drives[Z_AXIS] = true;
                self.move_to_do[DRIVES] = ctx.platform.home_feedrate(Z_AXIS);
                self.active_drives[DRIVES] = true;
                if self.do_canned_cycle_move(true, ctx) {
                    self.canned_cycle_move_count += 1;
                    self.probe_count = 0;
                    ctx.platform.set_z_probing(false);
                }
                false
            }

            _ => {
                self.canned_cycle_move_count = 0;
                true
            }
        }
    }

    /// G30: with P, record or probe the bed height at probe point P; the
    /// point's X and Y come from the line or from the current position.
    /// An explicit real Z records that height directly; otherwise the bed
    /// is probed. S fits the bed equation afterwards.
    pub(crate) fn set_single_z_probe_at_a_position(
        &mut self,
        src: Source,
        ctx: &mut Context,
    ) -> bool {
        if !self.all_moves_finished_and_move_buffer_loaded(ctx) {
            return false;
        }

        if !self.gb(src).seen('P') {
            return self.do_single_z_probe(ctx);
        }
        let point = self.gb(src).int_value().max(0) as usize;

        let x = if self.gb(src).seen(AXIS_LETTERS[X_AXIS]) {
            self.gb(src).float_value()
        } else {
            self.move_buffer[X_AXIS]
        };
        let y = if self.gb(src).seen(AXIS_LETTERS[Y_AXIS]) {
            self.gb(src).float_value()
        } else {
            self.move_buffer[Y_AXIS]
        };
        let z = if self.gb(src).seen(AXIS_LETTERS[Z_AXIS]) {
            self.gb(src).float_value()
        } else {
            SILLY_Z_VALUE
        };

        self.probe_count = point;
        ctx.planner.set_x_bed_probe_point(point, x);
        ctx.planner.set_y_bed_probe_point(point, y);

        if z > SILLY_Z_VALUE {
            // The height was supplied; no probing required.
            ctx.planner.set_z_bed_probe_point(point, z);
            ctx.planner.set_z_probing(false);
            self.probe_count = 0;
            if self.gb(src).seen('S') {
                self.z_probes_set = true;
                ctx.planner.set_probed_bed_equation();
            }
            true
        } else if self.do_single_z_probe_at_point(ctx) {
            self.probe_count = 0;
            ctx.planner.set_z_probing(false);
            if self.gb(src).seen('S') {
                self.z_probes_set = true;
                ctx.planner.set_probed_bed_equation();
            }
            true
        } else {
            false
        }
    }

    /// G32: probe every stored point, then fit the bed plane. Needs at
    /// least three points.
    pub(crate) fn do_multiple_z_probe(&mut self, ctx: &mut Context) -> bool {
        if ctx.planner.probe_point_count() < 3 {
            ctx.platform.message(
                MessageKind::Host,
                "Bed probing: there needs to be 3 or more points set.\n",
            );
            return true;
        }

        if self.do_single_z_probe_at_point(ctx) {
            self.probe_count += 1;
        }
        if self.probe_count >= ctx.planner.probe_point_count() {
            self.probe_count = 0;
            self.z_probes_set = true;
            ctx.planner.set_z_probing(false);
            ctx.platform.set_z_probing(false);
            ctx.planner.set_probed_bed_equation();
            return true;
        }
        false
    }

    /// The (X, Y) to probe at for point `count`, plus the recorded Z and
    /// whether the probe grid has been completed.
    pub(crate) fn get_probe_coordinates(
        &self,
        count: usize,
        ctx: &mut Context,
    ) -> (f64, f64, f64, bool) {
        (
            ctx.planner.x_bed_probe_point(count),
            ctx.planner.y_bed_probe_point(count),
            ctx.planner.z_bed_probe_point(count),
            self.z_probes_set,
        )
    }

    /// G31: report the probe reading, or set the active probe's
    /// parameters when Z is given.
    pub(crate) fn set_print_z_probe(
        &mut self,
        src: Source,
        ctx: &mut Context,
        reply: &mut String,
    ) -> bool {
        if !self.all_moves_finished_and_move_buffer_loaded(ctx) {
            return false;
        }

        if self.gb(src).seen(AXIS_LETTERS[Z_AXIS]) {
            let mut params = ctx.platform.active_probe_parameters().clone();
            params.height = self.gb(src).float_value();
            if self.gb(src).seen('P') {
                params.adc_value = self.gb(src).int_value();
            }
            params.calib_temperature = if self.gb(src).seen('S') {
                self.gb(src).float_value()
            } else {
                // Calibrate against the current bed temperature when none
                // was given.
                ctx.platform.get_temperature(0)
            };
            params.temperature_coefficient = if self.gb(src).seen('C') {
                self.gb(src).float_value()
            } else {
                0.0
            };
            ctx.platform.set_probe_parameters(params);
        } else {
            let v0 = ctx.platform.z_probe();
            *reply = match ctx.platform.z_probe_secondary() {
                Some(v1) => format!("{v0} ({v1})"),
                None => format!("{v0}"),
            };
        }
        true
    }

    /// T code: six-phase tool change. Runs the free/pre/post macros for
    /// the outgoing and incoming tools around the standby/select steps.
    /// The sequence runs even when the new tool is the old one, so the
    /// macros always execute.
    pub(crate) fn change_tool(&mut self, new_tool: i32, ctx: &mut Context) -> bool {
        let old_tool = self.current_tool.map(|i| self.tools[i].number());
        let new_exists = self.tools.iter().any(|t| t.number() == new_tool);

        match self.tool_change_sequence {
            0 => {
                // Pre-release macro for the old tool, if any.
                match old_tool {
                    Some(old) => {
                        if self.do_file_macro(&format!("tfree{old}.g"), ctx) {
                            self.tool_change_sequence += 1;
                        }
                    }
                    None => self.tool_change_sequence += 1,
                }
                false
            }

            1 => {
                if let Some(old) = old_tool {
                    self.standby_tool(old, ctx);
                }
                self.tool_change_sequence += 1;
                false
            }

            2 => {
                if new_exists {
                    if self.do_file_macro(&format!("tpre{new_tool}.g"), ctx) {
                        self.tool_change_sequence += 1;
                    }
                } else {
                    self.tool_change_sequence += 1;
                }
                false
            }

            3 => {
                // Selecting a nonexistent tool just deselects all tools.
                self.select_tool(new_tool, ctx);
                self.tool_change_sequence += 1;
                false
            }

            4 => {
                if new_exists {
                    if self.do_file_macro(&format!("tpost{new_tool}.g"), ctx) {
                        self.tool_change_sequence += 1;
                    }
                } else {
                    self.tool_change_sequence += 1;
                }
                false
            }

            _ => {
                self.tool_change_sequence = 0;
                true
            }
        }
    }

    /// M206: move by the given offsets, then declare the pre-move
    /// coordinates current again, shifting the logical origin.
    pub(crate) fn offset_axes(&mut self, src: Source, ctx: &mut Context) -> bool {
        if !self.offset_set {
            if !self.all_moves_finished_and_move_buffer_loaded(ctx) {
                return false;
            }
            for drive in 0..=DRIVES {
                if drive < AXES || drive == DRIVES {
                    self.offset_record[drive] = self.move_buffer[drive];
                    self.move_to_do[drive] = self.move_buffer[drive];
                } else {
                    self.offset_record[drive] = 0.0;
                    self.move_to_do[drive] = 0.0;
                }
                self.active_drives[drive] = false;
            }

            for axis in 0..AXES {
                if self.gb(src).seen(AXIS_LETTERS[axis]) {
                    self.move_to_do[axis] += self.gb(src).float_value();
                    self.active_drives[axis] = true;
                }
            }
            if self.gb(src).seen(FEEDRATE_LETTER) {
                self.move_to_do[DRIVES] = self.gb(src).float_value();
                self.active_drives[DRIVES] = true;
            }

            self.offset_set = true;
        }

        if self.do_canned_cycle_move(false, ctx) {
            self.move_buffer = self.offset_record;
            ctx.planner.set_live_coordinates(&self.offset_record);
            ctx.planner.set_positions(&self.offset_record);
            self.offset_set = false;
            return true;
        }
        false
    }
}
