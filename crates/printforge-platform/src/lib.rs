//! # printforge platform
//!
//! The layer between the G-code dispatcher and the hardware:
//! - Board, clock and serial-channel abstractions with simulated
//!   implementations
//! - The 1 kHz tick sampler and over-temperature supervisor
//! - The non-volatile configuration store with magic-value persistence
//! - The file store façade over the removable storage
//! - The platform facade tying it together with message routing and
//!   diagnostics

pub mod board;
pub mod config;
pub mod filestore;
pub mod filter;
pub mod params;
pub mod platform;
pub mod tick;

pub use board::{
    AdcChannel, Board, Clock, EndstopState, ManualClock, SimBoard, SystemClock, AD_DISCONNECTED,
    AD_RANGE,
};

pub use config::{
    reset_reason, Compatibility, FileNv, MemNv, NvBackend, NvData, NvSlot, NvStore,
    SoftwareResetData, ZProbeType, NV_MAGIC, NV_SECTOR_SIZE, RESET_MAGIC,
};

pub use filestore::{
    FileInfo, FileStore, MassStorage, CONFIG_FILE, GCODE_DIR, MAX_FILES, SYS_DIR, WEB_DIR,
};

pub use filter::{
    AveragingFilter, ThermistorFilter, ZProbeFilter, THERMISTOR_AVERAGE_READINGS,
    Z_PROBE_AVERAGE_READINGS,
};

pub use params::{
    PidParameters, ZProbeParameters, ABS_ZERO, BAD_HIGH_TEMPERATURE, DEFAULT_PROBE_STOP_HEIGHT,
    DEFAULT_Z_DIVE,
};

pub use platform::{
    EndStopHit, MessageKind, Platform, PlatformDeps, SerialChannel, SimSerial, ERROR_BAD_TEMP,
    ERROR_OUTPUT_STARVED,
};

pub use tick::TickSampler;
