//! # printforge gcode
//!
//! The G-code layer of the firmware core:
//! - Line assembly with the checksum/line-number protocol and
//!   letter-addressed parameter access
//! - The cooperative multi-source dispatcher (web, serial, file) with
//!   per-source resumable execution
//! - Canned cycles: homing, bed probing, tool changes, macro playback and
//!   the push/pop execution stack
//! - Tool definitions and selection

pub mod buffer;
mod cycles;
pub mod gcodes;
pub mod tools;

pub use buffer::{BufferState, GCodeBuffer, GCODE_LENGTH};
pub use gcodes::{Context, GCodes, Source, STACK};
pub use tools::Tool;
