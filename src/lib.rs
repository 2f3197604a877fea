//! # printforge
//!
//! Firmware core of a 3D-printer controller, organised as a workspace:
//!
//! 1. **printforge-core** - errors, the output buffer pool, collaborator
//!    contracts
//! 2. **printforge-platform** - board abstraction, tick sampler, config
//!    store, file store, platform facade
//! 3. **printforge-gcode** - G-code parsing, the cooperative dispatcher,
//!    canned cycles
//! 4. **printforge** - this crate: simulated motion/heat/web collaborators
//!    and the host-side simulator binary
//!
//! The simulator wires the real core against a simulated board: stdin is
//! the host serial link, a local directory stands in for the SD card, and
//! the tick sampler runs off the wall clock.

pub mod sim;

pub use printforge_core::{HeatControl, MotionPlanner, WebChannel};
pub use printforge_gcode::{Context, GCodes};
pub use printforge_platform::{Platform, PlatformDeps};

/// Initialize tracing for the simulator. `RUST_LOG` overrides the default
/// `info` level.
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing init: {e}"))?;
    Ok(())
}

/// The complete simulated machine.
pub struct Machine {
    /// The platform facade.
    pub platform: Platform,
    /// The dispatcher.
    pub gcodes: GCodes,
    /// Simulated motion planner.
    pub planner: sim::SimPlanner,
    /// Simulated heater controller.
    pub heat: sim::SimHeat,
    /// Simulated web queue.
    pub web: sim::SimWeb,
}

impl Machine {
    /// Build a machine over the given platform.
    pub fn new(platform: Platform) -> Self {
        let mut gcodes = GCodes::new();
        gcodes.init();
        Machine {
            platform,
            gcodes,
            planner: sim::SimPlanner::new(),
            heat: sim::SimHeat::new(),
            web: sim::SimWeb::new(),
        }
    }

    /// One main-loop iteration: dispatch, execute any queued move, drain
    /// output, advance the heater simulation.
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
            self.planner.execute(m, check_endstops, &self.platform);
        }
        self.platform.spin(&mut self.web);
        self.heat.update(&mut self.platform);
    }

    /// One 1 ms system tick.
    pub fn tick(&mut self) {
        self.platform.tick();
    }

    /// Play the startup configuration file to completion. A missing
    /// `sys/config.g` is reported and skipped.
    pub fn run_config_file(&mut self) {
        loop {
            let done = {
                let mut ctx = Context {
                    platform: &mut self.platform,
                    planner: &mut self.planner,
                    heat: &mut self.heat,
                    web: &mut self.web,
                };
                self.gcodes.run_config_file(&mut ctx)
            };
            if let Some((m, check_endstops)) = self.gcodes.read_move() {
                self.planner.execute(m, check_endstops, &self.platform);
            }
            self.heat.update(&mut self.platform);
            if done {
                break;
            }
        }
    }
}
