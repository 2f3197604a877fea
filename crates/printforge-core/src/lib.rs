//! # printforge core
//!
//! Shared foundations for the printforge firmware core:
//! - Error taxonomy for the G-code, platform and config layers
//! - The reference-counted output buffer pool used by non-blocking
//!   messaging
//! - Machine geometry constants and the contracts of the external
//!   collaborators (motion planner, heater controller, web queue)

pub mod buffer;
pub mod error;
pub mod machine;

pub use buffer::{BufferId, DestinationQueue, OutputPool, OUTPUT_BUFFER_COUNT, OUTPUT_BUFFER_SIZE};

pub use error::{ConfigError, Error, GcodeError, PlatformError, Result};

pub use machine::{
    HeatControl, MotionPlanner, MoveArray, WebChannel, WebSource, AXES, AXIS_LETTERS, BED_HEATER,
    DRIVES, EXTRUDE_LETTER, FEEDRATE_LETTER, HEATERS, LIST_SEPARATOR, X_AXIS, Y_AXIS, Z_AXIS,
};
