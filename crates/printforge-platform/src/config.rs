//! Non-volatile configuration store
//!
//! All persistent parameters live in one record written as a single block
//! to sector 0 of the backend. Sector 1 holds the record written
//! immediately before a software reset so the next boot can surface why it
//! happened. The backend is pluggable: a directory of sector files in
//! production, plain memory in tests.
//!
//! Load semantics: a missing sector, an undecodable record or a magic
//! mismatch re-initializes defaults in memory without writing back. Save
//! semantics: every mutator writes through synchronously when auto-save is
//! enabled, and only when the value actually changed.

use crate::params::{PidParameters, ZProbeParameters, DEFAULT_PROBE_STOP_HEIGHT};
use printforge_core::{ConfigError, AXES, HEATERS};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;

/// Magic sentinel marking a valid configuration record. Changes only when
/// the record layout changes.
pub const NV_MAGIC: u32 = 0x5A5A_F00D;

/// Magic sentinel marking a valid software-reset record.
pub const RESET_MAGIC: u32 = 0x7D44_91F0;

/// Capacity of one backend sector in bytes.
pub const NV_SECTOR_SIZE: usize = 1024;

/// Firmware flavours the reply formatter can emulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compatibility {
    /// Native reply framing.
    Me,
    /// Explicit native selection; treated as `Me`.
    RepRapFirmware,
    /// Marlin-style `ok` framing.
    Marlin,
    /// Not supported; selecting it produces a notice.
    Teacup,
    /// Not supported; selecting it produces a notice.
    Sprinter,
    /// Not supported; selecting it produces a notice.
    Repetier,
}

impl Compatibility {
    /// Decode an M555 P value.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Compatibility::Me),
            1 => Some(Compatibility::RepRapFirmware),
            2 => Some(Compatibility::Marlin),
            3 => Some(Compatibility::Teacup),
            4 => Some(Compatibility::Sprinter),
            5 => Some(Compatibility::Repetier),
            _ => None,
        }
    }

    /// True for the native reply framing.
    pub fn is_native(self) -> bool {
        matches!(self, Compatibility::Me | Compatibility::RepRapFirmware)
    }
}

impl std::fmt::Display for Compatibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compatibility::Me | Compatibility::RepRapFirmware => write!(f, "native"),
            Compatibility::Marlin => write!(f, "marlin"),
            Compatibility::Teacup => write!(f, "teacup"),
            Compatibility::Sprinter => write!(f, "sprinter"),
            Compatibility::Repetier => write!(f, "repetier"),
        }
    }
}

/// Kind of Z probe fitted to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZProbeType {
    /// Microswitch on the carriage; no analog channel.
    Switch,
    /// Unmodulated IR sensor.
    Ir,
    /// IR sensor with emitter modulation for ambient-light rejection.
    ModulatedIr,
    /// Alternate analog sensor.
    Alternate,
}

impl ZProbeType {
    /// Decode an M558 P value. Out-of-range values select the switch.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ZProbeType::Ir,
            2 => ZProbeType::ModulatedIr,
            3 => ZProbeType::Alternate,
            _ => ZProbeType::Switch,
        }
    }

    /// The wire code reported by M558.
    pub fn code(self) -> i32 {
        match self {
            ZProbeType::Switch => 0,
            ZProbeType::Ir => 1,
            ZProbeType::ModulatedIr => 2,
            ZProbeType::Alternate => 3,
        }
    }

    /// True for the IR family that drives the modulation pin.
    pub fn uses_modulation_pin(self) -> bool {
        matches!(self, ZProbeType::Ir | ZProbeType::ModulatedIr)
    }
}

/// The persistent configuration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NvData {
    /// Layout sentinel; must equal [`NV_MAGIC`].
    pub magic: u32,
    /// Reply-format emulation mode.
    pub compat: Compatibility,
    /// Static IP address.
    pub ip: [u8; 4],
    /// Network mask.
    pub mask: [u8; 4],
    /// Default gateway.
    pub gateway: [u8; 4],
    /// MAC address.
    pub mac: [u8; 6],
    /// Fitted probe kind.
    #[serde(rename = "probeType")]
    pub z_probe_type: ZProbeType,
    /// Which board channel the probe modulation output uses.
    #[serde(rename = "probeChannel")]
    pub z_probe_channel: i32,
    /// Axes whose homing uses the Z probe instead of an endstop.
    #[serde(rename = "probeAxes")]
    pub z_probe_axes: [bool; AXES],
    /// Parameters when a switch probe is selected.
    #[serde(rename = "switchProbe")]
    pub switch_probe: ZProbeParameters,
    /// Parameters shared by the IR and modulated-IR probes.
    #[serde(rename = "irProbe")]
    pub ir_probe: ZProbeParameters,
    /// Parameters for the alternate sensor.
    #[serde(rename = "altProbe")]
    pub alternate_probe: ZProbeParameters,
    /// Per-heater PID and thermistor parameters.
    pub pid: [PidParameters; HEATERS],
}

impl Default for NvData {
    fn default() -> Self {
        NvData {
            magic: NV_MAGIC,
            compat: Compatibility::Me,
            ip: [192, 168, 1, 14],
            mask: [255, 255, 255, 0],
            gateway: [192, 168, 1, 1],
            mac: [0xbe, 0xef, 0xde, 0xad, 0xfe, 0xed],
            z_probe_type: ZProbeType::Switch,
            z_probe_channel: 0,
            z_probe_axes: [true, false, true],
            switch_probe: ZProbeParameters::init(0.0),
            ir_probe: ZProbeParameters::init(DEFAULT_PROBE_STOP_HEIGHT),
            alternate_probe: ZProbeParameters::init(DEFAULT_PROBE_STOP_HEIGHT),
            pid: std::array::from_fn(PidParameters::defaults_for),
        }
    }
}

/// Record written just before a software-triggered reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareResetData {
    /// Must equal [`RESET_MAGIC`].
    pub magic: u32,
    /// Bit-packed reset reason; see the `reset_reason` constants.
    pub reason: u16,
    /// Minimum free RAM observed before the reset.
    #[serde(rename = "neverUsedRam")]
    pub never_used_ram: u32,
}

/// Reset reason bits.
pub mod reset_reason {
    /// Mask over the module that was spinning when the reset was taken.
    pub const MODULE_MASK: u16 = 0x000f;
    /// Reset requested by the host (M999).
    pub const USER: u16 = 0x0010;
    /// The main loop was stuck writing to the USB channel.
    pub const IN_USB_OUTPUT: u16 = 0x0020;
    /// The main loop was stuck writing to the AUX channel.
    pub const IN_AUX_OUTPUT: u16 = 0x0040;
    /// The main loop was stuck inside the network stack.
    pub const IN_NETWORK: u16 = 0x0080;
    /// The watchdog fired.
    pub const WATCHDOG: u16 = 0x0100;
}

/// Which sector of the backend a record occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvSlot {
    /// Sector 0: the configuration record.
    Config,
    /// Sector 1: the software-reset record.
    ResetRecord,
}

/// Storage behind the configuration store.
pub trait NvBackend {
    /// Read the whole sector. `Ok(None)` when it has never been written.
    fn read(&mut self, slot: NvSlot) -> io::Result<Option<Vec<u8>>>;

    /// Overwrite the whole sector.
    fn write(&mut self, slot: NvSlot, data: &[u8]) -> io::Result<()>;
}

/// In-memory backend for tests and for boards without flash support.
#[derive(Debug, Default)]
pub struct MemNv {
    sectors: [Option<Vec<u8>>; 2],
}

impl MemNv {
    /// Empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl NvBackend for MemNv {
    fn read(&mut self, slot: NvSlot) -> io::Result<Option<Vec<u8>>> {
        Ok(self.sectors[slot as usize].clone())
    }

    fn write(&mut self, slot: NvSlot, data: &[u8]) -> io::Result<()> {
        self.sectors[slot as usize] = Some(data.to_vec());
        Ok(())
    }
}

/// File-backed backend: one file per sector under a directory.
#[derive(Debug)]
pub struct FileNv {
    dir: PathBuf,
}

impl FileNv {
    /// Create a backend under `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(FileNv { dir })
    }

    fn path(&self, slot: NvSlot) -> PathBuf {
        match slot {
            NvSlot::Config => self.dir.join("sector0.nv"),
            NvSlot::ResetRecord => self.dir.join("sector1.nv"),
        }
    }
}

impl NvBackend for FileNv {
    fn read(&mut self, slot: NvSlot) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(self.path(slot)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, slot: NvSlot, data: &[u8]) -> io::Result<()> {
        std::fs::write(self.path(slot), data)
    }
}

/// The configuration store: the in-memory record, its backend, and the
/// auto-save flag.
pub struct NvStore {
    backend: Box<dyn NvBackend + Send>,
    data: NvData,
    auto_save: bool,
}

impl NvStore {
    /// Create a store and load the record, falling back to defaults on a
    /// missing sector, decode failure or magic mismatch. Defaults are not
    /// written back.
    pub fn load(mut backend: Box<dyn NvBackend + Send>) -> Self {
        let data = match backend.read(NvSlot::Config) {
            Ok(Some(bytes)) => match serde_json::from_slice::<NvData>(&bytes) {
                Ok(d) if d.magic == NV_MAGIC => d,
                Ok(d) => {
                    tracing::info!(found = d.magic, "config magic mismatch, using defaults");
                    NvData::default()
                }
                Err(e) => {
                    tracing::info!(error = %e, "config record undecodable, using defaults");
                    NvData::default()
                }
            },
            Ok(None) => NvData::default(),
            Err(e) => {
                tracing::warn!(error = %e, "config sector unreadable, using defaults");
                NvData::default()
            }
        };
        NvStore {
            backend,
            data,
            auto_save: false,
        }
    }

    /// Read access to the record.
    pub fn data(&self) -> &NvData {
        &self.data
    }

    /// Enable or disable write-through on mutation.
    pub fn set_auto_save(&mut self, enabled: bool) {
        self.auto_save = enabled;
    }

    /// Whether write-through is enabled.
    pub fn auto_save(&self) -> bool {
        self.auto_save
    }

    /// Write the record to sector 0 now.
    pub fn save(&mut self) -> Result<(), ConfigError> {
        let bytes =
            serde_json::to_vec(&self.data).map_err(|e| ConfigError::Codec(e.to_string()))?;
        if bytes.len() > NV_SECTOR_SIZE {
            return Err(ConfigError::Codec(format!(
                "record is {} bytes, sector holds {}",
                bytes.len(),
                NV_SECTOR_SIZE
            )));
        }
        self.backend.write(NvSlot::Config, &bytes)?;
        Ok(())
    }

    /// Apply a mutation to the record; write through if it changed
    /// anything and auto-save is on.
    pub fn mutate<R>(
        &mut self,
        f: impl FnOnce(&mut NvData) -> R,
    ) -> Result<R, ConfigError> {
        let before = self.data.clone();
        let r = f(&mut self.data);
        if self.auto_save && self.data != before {
            self.save()?;
        }
        Ok(r)
    }

    /// Write the software-reset record to sector 1.
    pub fn write_reset_record(&mut self, record: &SoftwareResetData) -> Result<(), ConfigError> {
        let bytes = serde_json::to_vec(record).map_err(|e| ConfigError::Codec(e.to_string()))?;
        self.backend.write(NvSlot::ResetRecord, &bytes)?;
        Ok(())
    }

    /// Read back the software-reset record, if a valid one exists.
    pub fn read_reset_record(&mut self) -> Option<SoftwareResetData> {
        let bytes = self.backend.read(NvSlot::ResetRecord).ok()??;
        let record: SoftwareResetData = serde_json::from_slice(&bytes).ok()?;
        (record.magic == RESET_MAGIC).then_some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sector_loads_defaults_without_writing_back() {
        let mut store = NvStore::load(Box::new(MemNv::new()));
        assert_eq!(store.data().magic, NV_MAGIC);
        // Nothing was written back.
        assert!(store.backend.read(NvSlot::Config).unwrap().is_none());
    }

    #[test]
    fn magic_mismatch_reinitializes() {
        let mut backend = MemNv::new();
        let mut stale = NvData::default();
        stale.magic = 0xdead_beef;
        stale.ip = [10, 0, 0, 99];
        backend
            .write(NvSlot::Config, &serde_json::to_vec(&stale).unwrap())
            .unwrap();

        let store = NvStore::load(Box::new(backend));
        assert_eq!(store.data().ip, NvData::default().ip);
    }

    #[test]
    fn save_and_reload_round_trips_byte_identical() {
        let mut store = NvStore::load(Box::new(MemNv::new()));
        store
            .mutate(|d| {
                d.ip = [10, 1, 2, 3];
                d.z_probe_type = ZProbeType::ModulatedIr;
            })
            .unwrap();
        store.save().unwrap();
        let first = store.backend.read(NvSlot::Config).unwrap().unwrap();

        let mut reloaded = NvStore::load(Box::new(MemNv::new()));
        reloaded.data = serde_json::from_slice(&first).unwrap();
        reloaded.save().unwrap();
        let second = reloaded.backend.read(NvSlot::Config).unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn record_fits_the_sector() {
        let bytes = serde_json::to_vec(&NvData::default()).unwrap();
        assert!(
            bytes.len() <= NV_SECTOR_SIZE,
            "record is {} bytes",
            bytes.len()
        );
    }

    #[test]
    fn auto_save_writes_through_only_on_change() {
        let mut store = NvStore::load(Box::new(MemNv::new()));
        store.set_auto_save(true);

        // A no-op mutation must not touch the backend.
        store.mutate(|_| ()).unwrap();
        assert!(store.backend.read(NvSlot::Config).unwrap().is_none());

        store.mutate(|d| d.z_probe_channel = 1).unwrap();
        assert!(store.backend.read(NvSlot::Config).unwrap().is_some());
    }

    #[test]
    fn reset_record_round_trips() {
        let mut store = NvStore::load(Box::new(MemNv::new()));
        let record = SoftwareResetData {
            magic: RESET_MAGIC,
            reason: reset_reason::USER | 3,
            never_used_ram: 2048,
        };
        store.write_reset_record(&record).unwrap();
        assert_eq!(store.read_reset_record(), Some(record));
    }

    #[test]
    fn file_backend_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = FileNv::new(dir.path().join("nv")).unwrap();
            let mut store = NvStore::load(Box::new(backend));
            store.mutate(|d| d.mac = [1, 2, 3, 4, 5, 6]).unwrap();
            store.save().unwrap();
        }
        let backend = FileNv::new(dir.path().join("nv")).unwrap();
        let store = NvStore::load(Box::new(backend));
        assert_eq!(store.data().mac, [1, 2, 3, 4, 5, 6]);
    }
}
