//! Host-side simulator: the firmware core against a simulated board.
//!
//! Stdin is the host serial link; replies come back on stdout. The
//! storage tree lives under `./machine-data` (or the first argument) with
//! the standard `gcodes/`, `sys/` and `www/` directories.

use printforge::{init_logging, Machine};
use printforge_platform::{
    FileNv, Platform, PlatformDeps, SimBoard, SimSerial, SystemClock,
};
use std::io::BufRead;

fn main() -> anyhow::Result<()> {
    init_logging()?;

    let root = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "machine-data".to_string());
    let root = std::path::PathBuf::from(root);

    let board = SimBoard::new(printforge_core::HEATERS + 1, printforge_core::HEATERS, printforge_core::DRIVES);
    let usb = SimSerial::new();
    let usb_handle = usb.clone();

    let deps = PlatformDeps {
        board: Box::new(board),
        clock: Box::new(SystemClock::new()),
        nv: Box::new(FileNv::new(root.join("nv"))?),
        storage_root: root.clone(),
        usb: Box::new(usb),
        aux: Box::new(SimSerial::new()),
    };
    let platform = Platform::new(deps)?;
    let mut machine = Machine::new(platform);
    machine.run_config_file();

    // Feed stdin into the serial link from a reader thread.
    let stdin_handle = usb_handle.clone();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(mut l) => {
                    l.push('\n');
                    stdin_handle.inject(l.as_bytes());
                }
                Err(_) => break,
            }
        }
    });

    tracing::info!(root = %root.display(), "machine up; send G-code on stdin");

    // Echo serial output as it drains.
    let reason = loop {
        machine.tick();
        for _ in 0..8 {
            machine.spin();
        }
        let out = usb_handle.take_output();
        if !out.is_empty() {
            print!("{out}");
            use std::io::Write;
            std::io::stdout().flush().ok();
        }
        if let Some(reason) = machine.platform.reset_pending() {
            break reason;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    };

    tracing::info!(reason = format_args!("{reason:#06x}"), "software reset requested, exiting");
    Ok(())
}
