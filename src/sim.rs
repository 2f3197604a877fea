//! Simulated collaborators for the host-side machine
//!
//! The planner executes moves instantly; the heater model relaxes the
//! measured temperature toward the setpoint; the web queue is a plain
//! byte queue with captured replies. Good enough to drive the core end to
//! end without hardware.

use printforge_core::{HeatControl, MotionPlanner, MoveArray, WebChannel, WebSource, DRIVES, HEATERS, Z_AXIS};
use printforge_platform::Platform;
use std::collections::VecDeque;

/// Upper bound on stored bed probe points.
pub const MAX_PROBE_POINTS: usize = 5;

/// Instant-execution motion planner.
pub struct SimPlanner {
    position: MoveArray,
    live: MoveArray,
    probe_x: [f64; MAX_PROBE_POINTS],
    probe_y: [f64; MAX_PROBE_POINTS],
    probe_z: [f64; MAX_PROBE_POINTS],
    probe_set: [bool; MAX_PROBE_POINTS],
    z_probing: bool,
    last_probed_z: f64,
    bed_equation_fitted: bool,
}

impl SimPlanner {
    /// Planner at the origin.
    pub fn new() -> Self {
        SimPlanner {
            position: [0.0; DRIVES + 1],
            live: [0.0; DRIVES + 1],
            probe_x: [0.0; MAX_PROBE_POINTS],
            probe_y: [0.0; MAX_PROBE_POINTS],
            probe_z: [0.0; MAX_PROBE_POINTS],
            probe_set: [false; MAX_PROBE_POINTS],
            z_probing: false,
            last_probed_z: 0.0,
            bed_equation_fitted: false,
        }
    }

    /// Execute a move pulled from the dispatcher. Probing moves stop at
    /// the platform's probe stop height instead of the commanded depth.
    pub fn execute(&mut self, mut m: MoveArray, check_endstops: bool, platform: &Platform) {
        if check_endstops && self.z_probing {
            let stop = platform.z_probe_stop_height();
            m[Z_AXIS] = stop;
            self.last_probed_z = stop;
        }
        self.position = m;
        self.live = m;
    }

    /// Whether a bed equation has been fitted (G32 / G30 S).
    pub fn bed_equation_fitted(&self) -> bool {
        self.bed_equation_fitted
    }
}

impl Default for SimPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionPlanner for SimPlanner {
    fn all_moves_finished(&self) -> bool {
        true
    }

    fn resume_moving(&mut self) {}

    fn current_user_position(&self, m: &mut MoveArray) -> bool {
        *m = self.position;
        true
    }

    fn transform(&self, _m: &mut MoveArray) {}

    fn set_live_coordinates(&mut self, m: &MoveArray) {
        self.live = *m;
    }

    fn set_positions(&mut self, m: &MoveArray) {
        self.position = *m;
    }

    fn set_feedrate(&mut self, feedrate: f64) {
        self.position[DRIVES] = feedrate;
    }

    fn live_coordinates(&self, m: &mut MoveArray) {
        *m = self.live;
    }

    fn set_identity_transform(&mut self) {
        self.bed_equation_fitted = false;
    }

    fn set_axis_compensation(&mut self, _axis: usize, _factor: f64) {}

    fn set_x_bed_probe_point(&mut self, index: usize, x: f64) {
        if index < MAX_PROBE_POINTS {
            self.probe_x[index] = x;
            self.probe_set[index] = true;
        }
    }

    fn set_y_bed_probe_point(&mut self, index: usize, y: f64) {
        if index < MAX_PROBE_POINTS {
            self.probe_y[index] = y;
            self.probe_set[index] = true;
        }
    }

    fn set_z_bed_probe_point(&mut self, index: usize, z: f64) {
        if index < MAX_PROBE_POINTS {
            self.probe_z[index] = z;
        }
    }

    fn x_bed_probe_point(&self, index: usize) -> f64 {
        self.probe_x.get(index).copied().unwrap_or(0.0)
    }

    fn y_bed_probe_point(&self, index: usize) -> f64 {
        self.probe_y.get(index).copied().unwrap_or(0.0)
    }

    fn z_bed_probe_point(&self, index: usize) -> f64 {
        self.probe_z.get(index).copied().unwrap_or(0.0)
    }

    fn probe_point_count(&self) -> usize {
        self.probe_set.iter().filter(|&&s| s).count()
    }

    fn set_probed_bed_equation(&mut self) {
        self.bed_equation_fitted = true;
    }

    fn set_z_probing(&mut self, probing: bool) {
        self.z_probing = probing;
    }

    fn last_probed_z(&self) -> f64 {
        self.last_probed_z
    }
}

/// First-order thermal model per heater.
pub struct SimHeat {
    active: [f64; HEATERS],
    standby: [f64; HEATERS],
    target_is_active: [bool; HEATERS],
    on: [bool; HEATERS],
    temperature: [f64; HEATERS],
}

/// Settle band in degrees for "at temperature" checks.
const HYSTERESIS: f64 = 2.5;

impl SimHeat {
    /// All heaters off at ambient.
    pub fn new() -> Self {
        SimHeat {
            active: [0.0; HEATERS],
            standby: [0.0; HEATERS],
            target_is_active: [false; HEATERS],
            on: [false; HEATERS],
            temperature: [20.0; HEATERS],
        }
    }

    fn target(&self, heater: usize) -> f64 {
        if !self.on[heater] {
            0.0
        } else if self.target_is_active[heater] {
            self.active[heater]
        } else {
            self.standby[heater]
        }
    }

    /// Relax temperatures toward their targets and drive the heater
    /// outputs through the platform (which enforces the fault latch).
    pub fn update(&mut self, platform: &mut Platform) {
        for h in 0..HEATERS {
            let target = self.target(h).max(20.0);
            self.temperature[h] += (target - self.temperature[h]) * 0.1;
            let power = if self.target(h) > self.temperature[h] {
                1.0
            } else {
                0.0
            };
            platform.set_heater(h, power);
        }
    }

    /// Force a measured temperature, for scripted scenarios.
    pub fn set_temperature(&mut self, heater: usize, t: f64) {
        self.temperature[heater] = t;
    }
}

impl Default for SimHeat {
    fn default() -> Self {
        Self::new()
    }
}

impl HeatControl for SimHeat {
    fn set_active_temperature(&mut self, heater: usize, t: f64) {
        self.active[heater] = t;
    }

    fn active_temperature(&self, heater: usize) -> f64 {
        self.active[heater]
    }

    fn set_standby_temperature(&mut self, heater: usize, t: f64) {
        self.standby[heater] = t;
    }

    fn activate(&mut self, heater: usize) {
        self.on[heater] = true;
        self.target_is_active[heater] = true;
    }

    fn standby(&mut self, heater: usize) {
        self.target_is_active[heater] = false;
    }

    fn temperature(&self, heater: usize) -> f64 {
        self.temperature[heater]
    }

    fn heater_at_set_temperature(&self, heater: usize) -> bool {
        let target = self.target(heater);
        target <= 0.0 || self.temperature[heater] >= target - HYSTERESIS
    }

    fn all_heaters_at_set_temperatures(&self, include_standby: bool) -> bool {
        (0..HEATERS).all(|h| {
            if !include_standby && !self.target_is_active[h] {
                true
            } else {
                self.heater_at_set_temperature(h)
            }
        })
    }

    fn switched_off(&self, heater: usize) -> bool {
        !self.on[heater]
    }

    fn reset_fault(&mut self, heater: usize) {
        self.on[heater] = false;
    }
}

/// Byte-queue web channel with captured replies.
pub struct SimWeb {
    queue: VecDeque<u8>,
    /// Reply bytes delivered to the HTTP stream.
    pub http_replies: Vec<u8>,
    /// Reply bytes delivered to the Telnet stream.
    pub telnet_replies: Vec<u8>,
    /// Machine name set by M550.
    pub name: String,
    /// Password set by M551.
    pub password: String,
}

impl SimWeb {
    /// Empty queue.
    pub fn new() -> Self {
        SimWeb {
            queue: VecDeque::new(),
            http_replies: Vec::new(),
            telnet_replies: Vec::new(),
            name: String::new(),
            password: String::new(),
        }
    }

    /// Queue a G-code line as if received over HTTP.
    pub fn inject_line(&mut self, line: &str) {
        self.queue.extend(line.bytes());
        if !line.ends_with('\n') {
            self.queue.push_back(b'\n');
        }
    }
}

impl Default for SimWeb {
    fn default() -> Self {
        Self::new()
    }
}

impl WebChannel for SimWeb {
    fn gcode_available(&self) -> bool {
        !self.queue.is_empty()
    }

    fn read_gcode(&mut self) -> u8 {
        self.queue.pop_front().unwrap_or(b'\n')
    }

    fn handle_gcode_reply(&mut self, source: WebSource, data: &[u8]) {
        match source {
            WebSource::Http => self.http_replies.extend_from_slice(data),
            WebSource::Telnet => self.telnet_replies.extend_from_slice(data),
        }
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn set_password(&mut self, password: &str) {
        self.password = password.to_string();
    }
}
