//! Shared rig for dispatcher tests: a platform over simulated hardware
//! plus mock motion/heat/web collaborators.
#![allow(dead_code)]

use printforge_core::{
    HeatControl, MotionPlanner, MoveArray, WebChannel, WebSource, DRIVES, HEATERS, Z_AXIS,
};
use printforge_gcode::{Context, GCodes};
use printforge_platform::{
    MemNv, Platform, PlatformDeps, SimBoard, SimSerial, SystemClock,
};
use std::collections::VecDeque;

/// Mock planner: moves finish instantly, everything is recorded.
#[derive(Default)]
pub struct MockPlanner {
    pub position: MoveArray,
    pub live: MoveArray,
    pub moves: Vec<(MoveArray, bool)>,
    pub probe_x: Vec<f64>,
    pub probe_y: Vec<f64>,
    pub probe_z: Vec<f64>,
    pub z_probing: bool,
    pub last_probed_z: f64,
    pub bed_equation_fitted: bool,
    pub identity_transform_set: bool,
}

impl MockPlanner {
    pub fn new() -> Self {
        let mut p = MockPlanner::default();
        p.probe_x = vec![0.0; 8];
        p.probe_y = vec![0.0; 8];
        p.probe_z = vec![0.0; 8];
        p
    }

    /// Apply a move pulled from the dispatcher's slot.
    pub fn apply(&mut self, m: MoveArray, check_endstops: bool) {
        let mut m = m;
        if check_endstops && self.z_probing {
            // The probe "triggers" at a fixed height.
            m[Z_AXIS] = self.last_probed_z;
        }
        self.moves.push((m, check_endstops));
        self.position = m;
        self.live = m;
    }
}

impl MotionPlanner for MockPlanner {
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
        self.identity_transform_set = true;
    }
    fn set_axis_compensation(&mut self, _axis: usize, _factor: f64) {}
    fn set_x_bed_probe_point(&mut self, index: usize, x: f64) {
        self.probe_x[index] = x;
    }
    fn set_y_bed_probe_point(&mut self, index: usize, y: f64) {
        self.probe_y[index] = y;
    }
    fn set_z_bed_probe_point(&mut self, index: usize, z: f64) {
        self.probe_z[index] = z;
    }
    fn x_bed_probe_point(&self, index: usize) -> f64 {
        self.probe_x[index]
    }
    fn y_bed_probe_point(&self, index: usize) -> f64 {
        self.probe_y[index]
    }
    fn z_bed_probe_point(&self, index: usize) -> f64 {
        self.probe_z[index]
    }
    fn probe_point_count(&self) -> usize {
        self.probe_x.iter().zip(&self.probe_y).filter(|(&x, &y)| x != 0.0 || y != 0.0).count()
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

/// Mock heater controller with directly settable temperatures.
pub struct MockHeat {
    pub active: [f64; HEATERS],
    pub standby: [f64; HEATERS],
    pub on: [bool; HEATERS],
    pub target_is_active: [bool; HEATERS],
    pub temperature: [f64; HEATERS],
    pub faults_reset: Vec<usize>,
}

impl MockHeat {
    pub fn new() -> Self {
        MockHeat {
            active: [0.0; HEATERS],
            standby: [0.0; HEATERS],
            on: [false; HEATERS],
            target_is_active: [false; HEATERS],
            temperature: [20.0; HEATERS],
            faults_reset: Vec::new(),
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
}

impl HeatControl for MockHeat {
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
        target <= 0.0 || self.temperature[heater] >= target - 2.5
    }
    fn all_heaters_at_set_temperatures(&self, include_standby: bool) -> bool {
        (0..HEATERS).all(|h| {
            (!include_standby && !self.target_is_active[h]) || self.heater_at_set_temperature(h)
        })
    }
    fn switched_off(&self, heater: usize) -> bool {
        !self.on[heater]
    }
    fn reset_fault(&mut self, heater: usize) {
        self.faults_reset.push(heater);
    }
}

/// Mock web queue capturing replies.
pub struct MockWeb {
    pub queue: VecDeque<u8>,
    pub http_replies: Vec<u8>,
    pub telnet_replies: Vec<u8>,
    pub name: String,
}

impl MockWeb {
    pub fn new() -> Self {
        MockWeb {
            queue: VecDeque::new(),
            http_replies: Vec::new(),
            telnet_replies: Vec::new(),
            name: String::new(),
        }
    }

    pub fn inject_line(&mut self, line: &str) {
        self.queue.extend(line.bytes());
        if !line.ends_with('\n') {
            self.queue.push_back(b'\n');
        }
    }
}

impl WebChannel for MockWeb {
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
    fn set_password(&mut self, _password: &str) {}
}

/// Everything a dispatcher test needs.
pub struct Rig {
    pub _dir: tempfile::TempDir,
    pub board: SimBoard,
    pub usb: SimSerial,
    pub platform: Platform,
    pub planner: MockPlanner,
    pub heat: MockHeat,
    pub web: MockWeb,
    pub gcodes: GCodes,
}

impl Rig {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let board = SimBoard::new(HEATERS + 1, HEATERS, DRIVES);
        let usb = SimSerial::new();
        let deps = PlatformDeps {
            board: Box::new(board.clone()),
            clock: Box::new(SystemClock::new()),
            nv: Box::new(MemNv::new()),
            storage_root: dir.path().to_path_buf(),
            usb: Box::new(usb.clone()),
            aux: Box::new(SimSerial::new()),
        };
        let platform = Platform::new(deps).unwrap();
        let mut gcodes = GCodes::new();
        gcodes.init();
        Rig {
            _dir: dir,
            board,
            usb,
            platform,
            planner: MockPlanner::new(),
            heat: MockHeat::new(),
            web: MockWeb::new(),
            gcodes,
        }
    }

    /// One scheduling pass plus move pickup and output drain.
    pub fn spin(&mut self) {
        {
            let mut ctx = Context {
                platform: &mut self.platform,
                planner: &mut self.planner,
                heat: &mut self.heat,
                web: &mut self.web,
            };
            self.gcodes.spin(&mut ctx);
        }
        if let Some((m, check_endstops)) = self.gcodes.read_move() {
            self.planner.apply(m, check_endstops);
        }
        self.platform.spin(&mut self.web);
    }

    /// Spin a bounded number of times.
    pub fn spins(&mut self, n: usize) {
        for _ in 0..n {
            self.spin();
        }
    }

    /// Send a line over the serial link.
    pub fn send_serial(&mut self, line: &str) {
        let mut text = line.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        self.usb.inject(text.as_bytes());
    }

    /// Everything the host has received so far.
    pub fn serial_output(&mut self) -> String {
        self.usb.take_output()
    }

    /// Write a macro file under sys/.
    pub fn write_sys_file(&self, name: &str, contents: &str) {
        let path = self._dir.path().join("sys").join(name);
        std::fs::write(path, contents).unwrap();
    }

    /// Write a print file under gcodes/.
    pub fn write_gcode_file(&self, name: &str, contents: &str) {
        let path = self._dir.path().join("gcodes").join(name);
        std::fs::write(path, contents).unwrap();
    }
}

/// Checksum-wrap a line the way a host does: prepend nothing, append
/// `*cs` computed over the text.
pub fn with_checksum(line: &str) -> String {
    let cs = line.bytes().fold(0u8, |a, b| a ^ b);
    format!("{line}*{cs}")
}
