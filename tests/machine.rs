//! End-to-end scenarios against the simulated machine: the dispatcher,
//! platform, tick sampler and file store working together.

use printforge::sim::SimHeat;
use printforge::Machine;
use printforge_core::{BED_HEATER, DRIVES, HEATERS, X_AXIS, Y_AXIS, Z_AXIS};
use printforge_platform::{
    FileNv, ManualClock, Platform, PlatformDeps, SimBoard, SimSerial, THERMISTOR_AVERAGE_READINGS,
};

struct Bench {
    _dir: tempfile::TempDir,
    board: SimBoard,
    clock: ManualClock,
    usb: SimSerial,
    machine: Machine,
}

fn bench() -> Bench {
    let dir = tempfile::tempdir().unwrap();
    let board = SimBoard::new(HEATERS + 1, HEATERS, DRIVES);
    let clock = ManualClock::new();
    let usb = SimSerial::new();
    let deps = PlatformDeps {
        board: Box::new(board.clone()),
        clock: Box::new(clock.clone()),
        nv: Box::new(FileNv::new(dir.path().join("nv")).unwrap()),
        storage_root: dir.path().to_path_buf(),
        usb: Box::new(usb.clone()),
        aux: Box::new(SimSerial::new()),
    };
    let platform = Platform::new(deps).unwrap();
    let machine = Machine::new(platform);
    Bench {
        _dir: dir,
        board,
        clock,
        usb,
        machine,
    }
}

impl Bench {
    fn send(&mut self, line: &str) {
        let mut text = line.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        self.usb.inject(text.as_bytes());
    }

    fn spins(&mut self, n: usize) {
        for _ in 0..n {
            self.clock.advance(1);
            self.machine.tick();
            self.machine.spin();
        }
    }

    fn output(&mut self) -> String {
        self.usb.take_output()
    }

    fn write_sys(&self, name: &str, contents: &str) {
        std::fs::write(self._dir.path().join("sys").join(name), contents).unwrap();
    }

    fn write_gcodes(&self, name: &str, contents: &str) {
        std::fs::write(self._dir.path().join("gcodes").join(name), contents).unwrap();
    }
}

fn checksum_wrap(line: &str) -> String {
    let cs = line.bytes().fold(0u8, |a, b| a ^ b);
    format!("{line}*{cs}")
}

#[test]
fn homing_all_axes_with_a_switch_probe() {
    let mut b = bench();
    b.write_sys(
        "homeall.g",
        "G1 X-240 Y-240 F3000 S1\nG92 X0 Y0\nG1 Z-250 F100 S1\nG92 Z0\n",
    );

    // Marlin framing so the success is acknowledged with an ok.
    b.send("M555 P2");
    b.spins(4);
    b.output();

    b.send(&checksum_wrap("N1 G28 X Y Z"));
    b.spins(500);

    assert!(b.machine.gcodes.axis_homed(X_AXIS));
    assert!(b.machine.gcodes.axis_homed(Y_AXIS));
    assert!(b.machine.gcodes.axis_homed(Z_AXIS));
    assert!(b.output().contains("ok"));
}

#[test]
fn bed_heating_waits_for_temperature() {
    use printforge_core::HeatControl;

    let mut b = bench();
    b.send("M140 S60");
    b.spins(4);
    assert_eq!(b.machine.heat.active_temperature(BED_HEATER), 60.0);

    b.send("M190 S60");
    b.spins(3);
    // Still heating: the command must hold the dispatcher.
    assert!(!b.machine.heat.heater_at_set_temperature(BED_HEATER));

    // The first-order model settles within a few dozen updates.
    b.spins(100);
    assert!(b.machine.heat.heater_at_set_temperature(BED_HEATER));
    assert!(b.machine.heat.temperature(BED_HEATER) >= 57.5);
}

#[test]
fn checksum_mismatch_requests_resend_of_that_line() {
    let mut b = bench();
    // True checksum differs from 42.
    b.send("N5 G1 X10 Y20 F1500*42");
    b.spins(6);

    assert_eq!(b.output(), "rs 5\n");
    // Nothing moved.
    let mut live = [0.0; DRIVES + 1];
    use printforge_core::MotionPlanner;
    b.machine.planner.live_coordinates(&mut live);
    assert_eq!(live[X_AXIS], 0.0);
}

#[test]
fn thermistor_fault_latches_heater_off_until_m562() {
    let mut b = bench();

    // Define a tool on heater 1 and warm it up.
    b.send("M563 P0 D0 H1");
    b.send("T0");
    b.spins(30);
    b.send("M104 S200");
    b.spins(6);

    // The thermistor now reads the disconnected sentinel.
    b.board.set_adc_value(1, 4095);
    b.spins(THERMISTOR_AVERAGE_READINGS * HEATERS * 4 + 8);

    assert!(b.machine.platform.heater_fault(1));
    assert_eq!(b.board.state().heater_pwms[1], 0.0);

    // The reading recovers and the filter window refills, but the latch
    // stays: re-enabling without clearing it is refused.
    b.board.set_adc_value(1, 2048);
    b.spins(THERMISTOR_AVERAGE_READINGS * HEATERS * 4);
    b.output();
    b.send("M104 S200");
    b.spins(6);
    assert!(b.output().contains("Error"));
    assert_eq!(b.board.state().heater_pwms[1], 0.0);

    // M562 clears the latch; the heater may heat again.
    b.send("M562 P1");
    b.spins(6);
    assert!(!b.machine.platform.heater_fault(1));
    b.send("M104 S200");
    b.spins(20);
    assert!(b.board.state().heater_pwms[1] > 0.0);
}

#[test]
fn emergency_stop_during_multi_probe() {
    let mut b = bench();
    b.send("G92 X0 Y0");
    b.send("M557 P0 X20 Y20");
    b.send("M557 P1 X180 Y20");
    b.send("M557 P2 X100 Y180");
    b.send("M557 P3 X100 Y100");
    b.send("G32");
    // Run long enough to be somewhere in the middle of the points.
    b.spins(40);

    {
        let mut ctx = printforge::Context {
            platform: &mut b.machine.platform,
            planner: &mut b.machine.planner,
            heat: &mut b.machine.heat,
            web: &mut b.machine.web,
        };
        b.machine.gcodes.emergency_stop(&mut ctx);
    }

    assert!(!b.machine.gcodes.printing_a_file());
    assert!(!b.machine.platform.z_probing());
    assert_eq!(b.machine.gcodes.stack_pointer(), 0);
    let state = b.board.state();
    assert!(state.drives_enabled.iter().all(|&e| !e));
}

#[test]
fn printing_a_file_executes_its_moves() {
    let mut b = bench();
    b.write_gcodes("part.g", "G92 X0 Y0 Z0\nG1 X15 Y5 F1200\nG1 X30 Y10 F1200\n");

    b.send("M23 part.g");
    b.send("M24");
    // One byte per spin while idle: give it room.
    b.spins(400);

    use printforge_core::MotionPlanner;
    let mut live = [0.0; DRIVES + 1];
    b.machine.planner.live_coordinates(&mut live);
    assert_eq!(live[X_AXIS], 30.0);
    assert_eq!(live[Y_AXIS], 10.0);
    assert!(!b.machine.gcodes.printing_a_file(), "file must close at EOF");
}

#[test]
fn pausing_a_print_stops_feeding_it() {
    let mut b = bench();
    b.write_gcodes("part.g", "G92 X0\nG1 X10 F1200\nG1 X20 F1200\nG1 X30 F1200\n");
    b.send("M23 part.g");
    b.send("M24");
    b.spins(25);
    b.send("M25");
    b.spins(10);
    assert!(!b.machine.gcodes.printing_a_file());

    let mut live = [0.0; DRIVES + 1];
    use printforge_core::MotionPlanner;
    b.machine.planner.live_coordinates(&mut live);
    let paused_at = live[X_AXIS];

    // Nothing advances while paused.
    b.spins(100);
    b.machine.planner.live_coordinates(&mut live);
    assert_eq!(live[X_AXIS], paused_at);

    // Resume and finish.
    b.send("M24");
    b.spins(400);
    b.machine.planner.live_coordinates(&mut live);
    assert_eq!(live[X_AXIS], 30.0);
}

#[test]
fn file_list_framing_differs_between_native_and_marlin() {
    let mut b = bench();
    b.write_gcodes("a.g", "G1 X1\n");
    b.write_gcodes("b.g", "G1 X2\n");

    b.send("M20");
    b.spins(6);
    let native = b.output();
    assert!(native.contains("GCode files:"), "got: {native}");
    assert!(native.contains("a.g") && native.contains("b.g"));

    b.send("M555 P2");
    b.spins(4);
    b.output();
    b.send("M20");
    b.spins(6);
    let marlin = b.output();
    assert!(marlin.starts_with("Begin file list\n"), "got: {marlin}");
    assert!(marlin.contains("End file list\nok\n"));
}

#[test]
fn m28_streams_following_lines_into_a_file() {
    let mut b = bench();
    b.send("M28 upload.g");
    b.send("G1 X5 F600");
    b.send("G1 X9 F600");
    b.send("M29");
    b.spins(60);

    let text = std::fs::read_to_string(b._dir.path().join("gcodes").join("upload.g")).unwrap();
    assert_eq!(text, "G1 X5 F600\nG1 X9 F600\n");

    // And nothing was executed while writing.
    use printforge_core::MotionPlanner;
    let mut live = [0.0; DRIVES + 1];
    b.machine.planner.live_coordinates(&mut live);
    assert_eq!(live[X_AXIS], 0.0);
}

#[test]
fn m30_deletes_a_file() {
    let mut b = bench();
    b.write_gcodes("old.g", "G1 X1\n");
    b.send("M30 old.g");
    b.spins(6);
    assert!(!b._dir.path().join("gcodes").join("old.g").exists());
}

#[test]
fn m503_streams_the_config_file() {
    let mut b = bench();
    b.write_sys("config.g", "M552 P10.0.0.2\nM555 P2\n");
    b.send("M503");
    b.spins(30);
    let out = b.output();
    assert!(out.contains("M552 P10.0.0.2"));
    assert!(out.contains("M555 P2"));
}

#[test]
fn network_settings_persist_across_a_reboot() {
    let dir = tempfile::tempdir().unwrap();

    let build = |dir: &std::path::Path, usb: SimSerial| {
        let deps = PlatformDeps {
            board: Box::new(SimBoard::new(HEATERS + 1, HEATERS, DRIVES)),
            clock: Box::new(ManualClock::new()),
            nv: Box::new(FileNv::new(dir.join("nv")).unwrap()),
            storage_root: dir.to_path_buf(),
            usb: Box::new(usb),
            aux: Box::new(SimSerial::new()),
        };
        Machine::new(Platform::new(deps).unwrap())
    };

    {
        let usb = SimSerial::new();
        let mut machine = build(dir.path(), usb.clone());
        machine.platform.set_auto_save(true);
        usb.inject(b"M552 P10.1.2.3\n");
        for _ in 0..8 {
            machine.spin();
        }
        assert_eq!(machine.platform.ip_address(), [10, 1, 2, 3]);
    }

    // Power cycle: a fresh machine over the same backing store.
    let machine = build(dir.path(), SimSerial::new());
    assert_eq!(machine.platform.ip_address(), [10, 1, 2, 3]);
}

#[test]
fn startup_configuration_file_runs_at_boot() {
    let mut b = bench();
    b.write_sys("config.g", "M558 P1\nM563 P0 D0 H1\nM203 X6000 Y6000 Z180\n");
    b.machine.run_config_file();

    use printforge_platform::ZProbeType;
    assert_eq!(b.machine.platform.z_probe_type(), ZProbeType::Ir);
    assert_eq!(b.machine.platform.max_feedrate(X_AXIS), 100.0);

    // A tool defined at boot is selectable straight away.
    b.send("T0");
    b.spins(40);
    assert!(b.machine.gcodes.current_tool().is_some());
}

#[test]
fn m114_reports_live_coordinates() {
    let mut b = bench();
    b.send("G92 X12.5 Y3 Z0.8");
    b.send("M114");
    b.spins(10);
    let out = b.output();
    assert!(out.contains("X:12.500 Y:3.000 Z:0.800"), "got: {out}");
}

#[test]
fn m115_reports_the_firmware_identity() {
    let mut b = bench();
    b.send("M115");
    b.spins(6);
    let out = b.output();
    assert!(out.contains("FIRMWARE_NAME:printforge"));
    assert!(out.contains("FIRMWARE_VERSION:"));
}

#[test]
fn m105_reports_bed_and_active_tool_temperatures() {
    let mut b = bench();
    b.machine.heat.set_temperature(BED_HEATER, 55.0);
    b.send("M105");
    b.spins(6);
    let out = b.output();
    assert!(out.contains("B: 55.0"), "got: {out}");
}

#[test]
fn m999_requests_a_software_reset() {
    let mut b = bench();
    b.send("M999");
    // The handler dwells half a second before resetting.
    b.spins(600);
    let reason = b.machine.platform.reset_pending().expect("reset must be pending");
    assert_ne!(reason & printforge_platform::reset_reason::USER, 0);
}

#[test]
fn g31_reports_and_sets_probe_parameters() {
    let mut b = bench();
    b.send("M558 P1"); // IR probe
    b.send("G31 Z0.9 P550");
    b.send("M558 P0");
    b.spins(12);
    b.send("M558 P1");
    b.spins(6);

    // The IR parameter set kept the values across the type switch.
    use printforge_platform::ZProbeType;
    assert_eq!(b.machine.platform.z_probe_type(), ZProbeType::Ir);
    let params = b.machine.platform.active_probe_parameters();
    assert_eq!(params.height, 0.9);
    assert_eq!(params.adc_value, 550);
}

#[test]
fn fan_commands_scale_to_fractions() {
    let mut b = bench();
    b.send("M106 S255");
    b.spins(4);
    assert_eq!(b.machine.platform.fan_value(), 1.0);
    b.send("M106 S127.5");
    b.spins(4);
    assert!((b.machine.platform.fan_value() - 0.5).abs() < 0.01);
    b.send("M107");
    b.spins(4);
    assert_eq!(b.machine.platform.fan_value(), 0.0);
}

#[test]
fn overheat_cutoff_fires_from_the_tick_path_alone() {
    let mut b = bench();
    // Heater 2's thermistor shorts: very low reading means very hot.
    b.board.set_adc_value(2, 3);
    b.board.state().heater_pwms[2] = 0.9;

    // Only tick; the main loop never runs.
    for _ in 0..THERMISTOR_AVERAGE_READINGS * HEATERS * 4 {
        b.clock.advance(1);
        b.machine.tick();
    }

    assert_eq!(b.board.state().heater_pwms[2], 0.0);
    assert!(b.machine.platform.heater_fault(2));
}

#[test]
fn heat_sim() {
    use printforge_core::HeatControl;

    // The bed model converges monotonically toward its setpoint.
    let mut heat = SimHeat::new();
    heat.set_active_temperature(BED_HEATER, 60.0);
    heat.activate(BED_HEATER);
    let mut last = heat.temperature(BED_HEATER);
    let mut deps = dummy_platform();
    for _ in 0..50 {
        heat.update(&mut deps);
        let now = heat.temperature(BED_HEATER);
        assert!(now >= last);
        last = now;
    }
    assert!(heat.heater_at_set_temperature(BED_HEATER));
}

fn dummy_platform() -> Platform {
    let dir = tempfile::tempdir().unwrap();
    let deps = PlatformDeps {
        board: Box::new(SimBoard::new(HEATERS + 1, HEATERS, DRIVES)),
        clock: Box::new(ManualClock::new()),
        nv: Box::new(printforge_platform::MemNv::new()),
        storage_root: dir.path().to_path_buf(),
        usb: Box::new(SimSerial::new()),
        aux: Box::new(SimSerial::new()),
    };
    // The tempdir is dropped here; the platform only needs it at
    // construction for this test.
    Platform::new(deps).unwrap()
}
