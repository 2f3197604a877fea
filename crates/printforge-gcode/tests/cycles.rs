//! Canned-cycle sequences: homing through macro files, bed probing,
//! macro playback with push/pop, and the emergency stop.

mod common;

use common::Rig;
use printforge_core::{X_AXIS, Y_AXIS, Z_AXIS};
use printforge_gcode::Context;

fn write_home_macros(rig: &Rig) {
    rig.write_sys_file("homeall.g", "G1 X-240 Y-240 F3000 S1\nG92 X0 Y0\nG1 Z-250 F100 S1\nG92 Z0\n");
    rig.write_sys_file("homeX.g", "G1 X-240 F3000 S1\nG92 X0\n");
    rig.write_sys_file("homeY.g", "G1 Y-240 F3000 S1\nG92 Y0\n");
    rig.write_sys_file("homeZ.g", "G1 Z-250 F100 S1\nG92 Z0\n");
}

#[test]
fn g28_homes_all_axes_through_the_home_all_macro() {
    let mut rig = Rig::new();
    write_home_macros(&rig);

    rig.send_serial("G28 X Y Z");
    rig.spins(400);

    assert!(rig.gcodes.axis_homed(X_AXIS));
    assert!(rig.gcodes.axis_homed(Y_AXIS));
    assert!(rig.gcodes.axis_homed(Z_AXIS));
    // The macro finished and the stack unwound.
    assert_eq!(rig.gcodes.stack_pointer(), 0);
}

#[test]
fn g28_single_axis_runs_only_that_macro() {
    let mut rig = Rig::new();
    write_home_macros(&rig);

    rig.send_serial("G28 Y");
    rig.spins(200);

    assert!(!rig.gcodes.axis_homed(X_AXIS));
    assert!(rig.gcodes.axis_homed(Y_AXIS));
}

#[test]
fn homing_z_with_a_probe_requires_x_and_y_first() {
    let mut rig = Rig::new();
    write_home_macros(&rig);
    rig.platform.set_z_probe_type(1); // IR probe fitted

    rig.send_serial("G28 Z");
    rig.spins(50);

    assert!(!rig.gcodes.axis_homed(Z_AXIS));
    assert!(rig.serial_output().contains("Must home X and Y before homing Z"));

    // With X and Y homed the same request goes through.
    rig.send_serial("G28 X");
    rig.send_serial("G28 Y");
    rig.spins(400);
    rig.send_serial("G28 Z");
    rig.spins(200);
    assert!(rig.gcodes.axis_homed(Z_AXIS));
}

#[test]
fn homing_z_with_a_switch_needs_no_xy() {
    let mut rig = Rig::new();
    write_home_macros(&rig);
    // Default probe type is the switch.
    rig.send_serial("G28 Z");
    rig.spins(200);
    assert!(rig.gcodes.axis_homed(Z_AXIS));
}

#[test]
fn missing_home_macro_reports_and_completes() {
    let mut rig = Rig::new(); // no macro files written
    rig.send_serial("G28 X");
    rig.spins(50);
    assert!(rig.serial_output().contains("Macro file homeX.g not found."));
    assert_eq!(rig.gcodes.stack_pointer(), 0);
}

#[test]
fn probe_at_point_records_the_trigger_height() {
    let mut rig = Rig::new();
    rig.planner.last_probed_z = 1.375;

    rig.send_serial("G30 P0 X50 Y50");
    rig.spins(100);

    assert_eq!(rig.planner.probe_x[0], 50.0);
    assert_eq!(rig.planner.probe_y[0], 50.0);
    assert_eq!(rig.planner.probe_z[0], 1.375);
    // The probing flag was dropped again afterwards.
    assert!(!rig.planner.z_probing);
}

#[test]
fn probe_at_point_with_explicit_z_skips_probing() {
    let mut rig = Rig::new();
    rig.send_serial("G30 P1 X30 Y40 Z0.2");
    rig.spins(10);

    assert_eq!(rig.planner.probe_z[1], 0.2);
    // No probing move was ever queued.
    assert!(rig.planner.moves.iter().all(|&(_, ce)| !ce));
}

#[test]
fn probing_descent_checks_endstops() {
    let mut rig = Rig::new();
    rig.planner.last_probed_z = 0.9;
    rig.send_serial("G30 P0 X10 Y10");
    rig.spins(100);

    let probing_moves: Vec<_> = rig.planner.moves.iter().filter(|&&(_, ce)| ce).collect();
    assert_eq!(probing_moves.len(), 1);
    // The descent stopped where the probe triggered.
    assert_eq!(probing_moves[0].0[Z_AXIS], 0.9);
}

#[test]
fn multi_probe_needs_three_points() {
    let mut rig = Rig::new();
    rig.send_serial("G92 X0 Y0");
    rig.send_serial("M557 P0 X20 Y20");
    rig.send_serial("M557 P1 X180 Y20");
    rig.send_serial("G32");
    rig.spins(30);

    assert!(!rig.planner.bed_equation_fitted);
    assert!(rig.serial_output().contains("3 or more points"));
}

#[test]
fn multi_probe_probes_every_point_then_fits() {
    let mut rig = Rig::new();
    rig.planner.last_probed_z = 0.5;
    rig.send_serial("G92 X0 Y0");
    rig.send_serial("M557 P0 X20 Y20");
    rig.send_serial("M557 P1 X180 Y20");
    rig.send_serial("M557 P2 X100 Y180");
    rig.send_serial("G32");
    rig.spins(600);

    assert!(rig.planner.bed_equation_fitted);
    for p in 0..3 {
        assert_eq!(rig.planner.probe_z[p], 0.5, "point {p} not probed");
    }
}

#[test]
fn g32_requires_homed_x_and_y() {
    let mut rig = Rig::new();
    rig.send_serial("M557 P0 X20 Y20");
    rig.send_serial("M557 P1 X180 Y20");
    rig.send_serial("M557 P2 X100 Y180");
    rig.send_serial("G32");
    rig.spins(30);

    assert!(!rig.planner.bed_equation_fitted);
    assert!(rig.serial_output().contains("Must home X and Y before bed probing"));
}

#[test]
fn macro_invocation_restores_state_on_return() {
    let mut rig = Rig::new();
    rig.write_sys_file("setup.g", "G91\nG1 X5 F600\n");

    rig.send_serial("G90"); // absolute before the macro
    rig.send_serial("M98 Psetup.g");
    rig.spins(200);

    // The macro switched to relative; the pop restored absolute.
    assert!(!rig.gcodes.axes_relative());
    assert_eq!(rig.gcodes.stack_pointer(), 0);
}

#[test]
fn m99_ends_a_macro_early() {
    let mut rig = Rig::new();
    rig.write_sys_file("partial.g", "G92 X1\nM99\nG92 X99\n");

    rig.send_serial("M98 Ppartial.g");
    rig.spins(200);

    assert_eq!(rig.planner.position[X_AXIS], 1.0, "lines after M99 must not run");
}

#[test]
fn tool_change_runs_through_all_phases() {
    let mut rig = Rig::new();
    rig.write_sys_file("tpre0.g", "G92 Y11\n");
    rig.write_sys_file("tpost0.g", "G92 Y22\n");

    rig.send_serial("M563 P0 D0 H1");
    rig.send_serial("G10 P0 S210 R160");
    rig.send_serial("T0");
    rig.spins(300);

    assert!(rig.gcodes.current_tool().is_some());
    assert_eq!(rig.planner.position[Y_AXIS], 22.0, "tpost macro must run last");
    assert_eq!(rig.heat.active[1], 210.0);
    assert!(rig.heat.on[1]);
}

#[test]
fn emergency_stop_aborts_probing_and_printing() {
    let mut rig = Rig::new();
    rig.write_gcode_file("job.g", "G1 X10 F600\nG1 X20 F600\nG1 X30 F600\n");
    rig.planner.last_probed_z = 0.5;

    rig.send_serial("M23 job.g");
    rig.send_serial("M24");
    rig.spins(12);
    assert!(rig.gcodes.printing_a_file());

    // Fire the stop the way the web server does: straight in, bypassing
    // dispatch order.
    {
        let mut ctx = Context {
            platform: &mut rig.platform,
            planner: &mut rig.planner,
            heat: &mut rig.heat,
            web: &mut rig.web,
        };
        rig.gcodes.emergency_stop(&mut ctx);
    }

    assert!(!rig.gcodes.printing_a_file());
    assert_eq!(rig.gcodes.stack_pointer(), 0);
    assert!(!rig.platform.z_probing());
    for h in 0..printforge_core::HEATERS {
        assert!(!rig.heat.target_is_active[h]);
    }
    let board_state = rig.board.state();
    assert!(board_state.drives_enabled.iter().all(|&e| !e));
}
