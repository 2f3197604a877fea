//! File store façade over the removable storage
//!
//! The storage root holds three directories: `gcodes/` for print files,
//! `sys/` for the configuration and macro files, and `www/` for the web
//! interface. `MassStorage` provides directory-level operations inside the
//! root; `FileStore` is a buffered reader/writer with the longest-write
//! metric the diagnostics report.

use printforge_core::{PlatformError, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Directory for print files.
pub const GCODE_DIR: &str = "gcodes";

/// Directory for configuration and macro files.
pub const SYS_DIR: &str = "sys";

/// Directory for the web interface files.
pub const WEB_DIR: &str = "www";

/// Name of the startup configuration file under [`SYS_DIR`].
pub const CONFIG_FILE: &str = "config.g";

/// Maximum number of simultaneously open files.
pub const MAX_FILES: usize = 8;

/// Buffer size for file reads and writes.
const FILE_BUF_LEN: usize = 256;

/// Longest single buffered write observed, in microseconds. Shared across
/// all file stores; read and cleared by the diagnostics report.
static LONGEST_WRITE_MICROS: AtomicU64 = AtomicU64::new(0);

/// One directory entry from a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Entry name without the directory.
    pub name: String,
    /// Size in bytes; zero for directories.
    pub size: u64,
    /// True for subdirectories.
    pub is_directory: bool,
}

/// Directory-level access to the storage root.
pub struct MassStorage {
    root: PathBuf,
    open_files: Arc<AtomicUsize>,
}

impl MassStorage {
    /// Mount the store at `root`, creating the standard directory layout.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [GCODE_DIR, SYS_DIR, WEB_DIR] {
            std::fs::create_dir_all(root.join(dir)).map_err(PlatformError::FileStore)?;
        }
        Ok(MassStorage {
            root,
            open_files: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Join a directory and file name under the root.
    pub fn combine(&self, directory: &str, file_name: &str) -> PathBuf {
        self.root.join(directory).join(file_name)
    }

    /// List a directory. Entries come back in directory order.
    pub fn list(&self, directory: &str) -> Result<Vec<FileInfo>> {
        let mut entries = Vec::new();
        let dir = self.root.join(directory);
        for entry in std::fs::read_dir(dir).map_err(PlatformError::FileStore)? {
            let entry = entry.map_err(PlatformError::FileStore)?;
            let meta = entry.metadata().map_err(PlatformError::FileStore)?;
            entries.push(FileInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: if meta.is_dir() { 0 } else { meta.len() },
                is_directory: meta.is_dir(),
            });
        }
        Ok(entries)
    }

    /// Delete a file. Returns an error if it does not exist.
    pub fn delete(&self, directory: &str, file_name: &str) -> Result<()> {
        std::fs::remove_file(self.combine(directory, file_name))
            .map_err(|e| PlatformError::FileStore(e).into())
    }

    /// True if the file exists.
    pub fn file_exists(&self, directory: &str, file_name: &str) -> bool {
        self.combine(directory, file_name).is_file()
    }

    /// Create a subdirectory under the root.
    pub fn make_directory(&self, directory: &str) -> Result<()> {
        std::fs::create_dir_all(self.root.join(directory))
            .map_err(|e| PlatformError::FileStore(e).into())
    }

    /// Rename a file within the root.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        std::fs::rename(self.root.join(old), self.root.join(new))
            .map_err(|e| PlatformError::FileStore(e).into())
    }

    /// Open a file for reading or writing. Returns `Ok(None)` when a file
    /// opened for reading does not exist, so callers can report a missing
    /// macro without treating it as an I/O failure.
    pub fn open(&self, directory: &str, file_name: &str, write: bool) -> Result<Option<FileStore>> {
        if self.open_files.load(Ordering::Relaxed) >= MAX_FILES {
            return Err(PlatformError::FileTableFull.into());
        }
        let path = self.combine(directory, file_name);
        let file = if write {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .map_err(PlatformError::FileStore)?
        } else {
            match File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(PlatformError::FileStore(e).into()),
            }
        };
        FileStore::new(path, file, write, self.open_files.clone()).map(Some)
    }

    /// Number of free entries in the file table.
    pub fn free_file_entries(&self) -> usize {
        MAX_FILES - self.open_files.load(Ordering::Relaxed).min(MAX_FILES)
    }
}

/// A buffered open file.
pub struct FileStore {
    path: PathBuf,
    file: File,
    writing: bool,
    buf: [u8; FILE_BUF_LEN],
    buf_len: usize,
    buf_pos: usize,
    position: u64,
    length: u64,
    open_files: Arc<AtomicUsize>,
}

impl FileStore {
    fn new(path: PathBuf, file: File, writing: bool, open_files: Arc<AtomicUsize>) -> Result<Self> {
        let length = if writing {
            0
        } else {
            file.metadata().map_err(PlatformError::FileStore)?.len()
        };
        open_files.fetch_add(1, Ordering::Relaxed);
        Ok(FileStore {
            path,
            file,
            writing,
            buf: [0; FILE_BUF_LEN],
            buf_len: 0,
            buf_pos: 0,
            position: 0,
            length,
            open_files,
        })
    }

    /// The path this store was opened on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read one byte. `Ok(None)` at end of file.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        if self.buf_pos == self.buf_len {
            self.buf_len = self.file.read(&mut self.buf).map_err(PlatformError::FileStore)?;
            self.buf_pos = 0;
            if self.buf_len == 0 {
                return Ok(None);
            }
        }
        let b = self.buf[self.buf_pos];
        self.buf_pos += 1;
        self.position += 1;
        Ok(Some(b))
    }

    /// Append one byte through the write buffer.
    pub fn write_byte(&mut self, b: u8) -> Result<()> {
        debug_assert!(self.writing);
        if self.buf_len == FILE_BUF_LEN {
            self.flush_write_buffer()?;
        }
        self.buf[self.buf_len] = b;
        self.buf_len += 1;
        self.position += 1;
        Ok(())
    }

    /// Append a string through the write buffer.
    pub fn write_str(&mut self, s: &str) -> Result<()> {
        for &b in s.as_bytes() {
            self.write_byte(b)?;
        }
        Ok(())
    }

    /// Flush buffered writes to the medium.
    pub fn flush(&mut self) -> Result<()> {
        if self.writing {
            self.flush_write_buffer()?;
            self.file.flush().map_err(PlatformError::FileStore)?;
        }
        Ok(())
    }

    fn flush_write_buffer(&mut self) -> Result<()> {
        if self.buf_len > 0 {
            let started = Instant::now();
            self.file
                .write_all(&self.buf[..self.buf_len])
                .map_err(PlatformError::FileStore)?;
            let took = started.elapsed().as_micros() as u64;
            LONGEST_WRITE_MICROS.fetch_max(took, Ordering::Relaxed);
            self.buf_len = 0;
        }
        Ok(())
    }

    /// Seek a read-mode store to an absolute position.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        debug_assert!(!self.writing);
        self.file
            .seek(SeekFrom::Start(pos))
            .map_err(PlatformError::FileStore)?;
        self.buf_len = 0;
        self.buf_pos = 0;
        self.position = pos;
        Ok(())
    }

    /// Current read/write position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Fraction of the file consumed, in [0, 1].
    pub fn fraction_read(&self) -> f64 {
        if self.length == 0 {
            0.0
        } else {
            self.position as f64 / self.length as f64
        }
    }

    /// Duplicate a read-mode store: a second handle on the same file at
    /// the same position. Used when the execution stack captures the print
    /// file across a macro invocation.
    pub fn duplicate(&self) -> Result<FileStore> {
        debug_assert!(!self.writing);
        if self.open_files.load(Ordering::Relaxed) >= MAX_FILES {
            return Err(PlatformError::FileTableFull.into());
        }
        let file = File::open(&self.path).map_err(PlatformError::FileStore)?;
        let mut dup = FileStore::new(self.path.clone(), file, false, self.open_files.clone())?;
        dup.seek(self.position)?;
        Ok(dup)
    }

    /// The longest single buffered write seen since the last call, in
    /// milliseconds. Clears the metric.
    pub fn get_and_clear_longest_write_time() -> f64 {
        LONGEST_WRITE_MICROS.swap(0, Ordering::Relaxed) as f64 / 1000.0
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if self.writing {
            if let Err(e) = self.flush() {
                tracing::warn!(path = %self.path.display(), error = %e, "flush on close failed");
            }
        }
        self.open_files.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("writing", &self.writing)
            .field("position", &self.position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, MassStorage) {
        let dir = tempfile::tempdir().unwrap();
        let ms = MassStorage::new(dir.path()).unwrap();
        (dir, ms)
    }

    #[test]
    fn standard_directories_are_created() {
        let (_dir, ms) = storage();
        assert!(ms.list(GCODE_DIR).unwrap().is_empty());
        assert!(ms.list(SYS_DIR).unwrap().is_empty());
        assert!(ms.list(WEB_DIR).unwrap().is_empty());
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, ms) = storage();
        {
            let mut f = ms.open(GCODE_DIR, "part.g", true).unwrap().unwrap();
            f.write_str("G1 X10\nG1 Y20\n").unwrap();
        }
        let mut f = ms.open(GCODE_DIR, "part.g", false).unwrap().unwrap();
        let mut text = String::new();
        while let Some(b) = f.read_byte().unwrap() {
            text.push(b as char);
        }
        assert_eq!(text, "G1 X10\nG1 Y20\n");
        assert!((f.fraction_read() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_read_file_is_none_not_error() {
        let (_dir, ms) = storage();
        assert!(ms.open(SYS_DIR, "nope.g", false).unwrap().is_none());
    }

    #[test]
    fn file_table_limits_open_handles() {
        let (_dir, ms) = storage();
        let mut handles = Vec::new();
        for i in 0..MAX_FILES {
            handles.push(ms.open(GCODE_DIR, &format!("f{i}.g"), true).unwrap());
        }
        assert_eq!(ms.free_file_entries(), 0);
        assert!(ms.open(GCODE_DIR, "overflow.g", true).is_err());
        handles.clear();
        assert_eq!(ms.free_file_entries(), MAX_FILES);
    }

    #[test]
    fn duplicate_keeps_position() {
        let (_dir, ms) = storage();
        {
            let mut f = ms.open(GCODE_DIR, "p.g", true).unwrap().unwrap();
            f.write_str("abcdef").unwrap();
        }
        let mut f = ms.open(GCODE_DIR, "p.g", false).unwrap().unwrap();
        f.read_byte().unwrap();
        f.read_byte().unwrap();
        let mut dup = f.duplicate().unwrap();
        assert_eq!(dup.read_byte().unwrap(), Some(b'c'));
    }

    #[test]
    fn longest_write_metric_reports_and_clears() {
        let (_dir, ms) = storage();
        {
            let mut f = ms.open(GCODE_DIR, "w.g", true).unwrap().unwrap();
            f.write_str(&"x".repeat(FILE_BUF_LEN * 3)).unwrap();
        }
        assert!(FileStore::get_and_clear_longest_write_time() >= 0.0);
        assert_eq!(FileStore::get_and_clear_longest_write_time(), 0.0);
    }

    #[test]
    fn rename_into_a_new_directory() {
        let (_dir, ms) = storage();
        {
            let mut f = ms.open(GCODE_DIR, "draft.g", true).unwrap().unwrap();
            f.write_str("G28\n").unwrap();
        }
        ms.make_directory("gcodes/archive").unwrap();
        ms.rename("gcodes/draft.g", "gcodes/archive/final.g").unwrap();
        assert!(!ms.file_exists(GCODE_DIR, "draft.g"));
        assert!(ms.file_exists("gcodes/archive", "final.g"));
    }

    #[test]
    fn delete_and_exists() {
        let (_dir, ms) = storage();
        {
            ms.open(GCODE_DIR, "gone.g", true).unwrap().unwrap();
        }
        assert!(ms.file_exists(GCODE_DIR, "gone.g"));
        ms.delete(GCODE_DIR, "gone.g").unwrap();
        assert!(!ms.file_exists(GCODE_DIR, "gone.g"));
        assert!(ms.delete(GCODE_DIR, "gone.g").is_err());
    }
}
