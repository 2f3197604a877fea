//! G-code line assembly and field access
//!
//! A `GCodeBuffer` assembles one line at a time from a byte source,
//! handling comments, the `Nnnn ... *cs` checksum protocol and over-long
//! lines. Once a line is complete the letter-addressed accessors read
//! parameter values from it: `seen` finds a letter and leaves a cursor for
//! the following `float_value`/`int_value`/array/string reads.

/// Maximum characters in one G-code line. Longer lines are discarded with
/// a diagnostic.
pub const GCODE_LENGTH: usize = 100;

/// Lifecycle of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferState {
    /// Empty, waiting for bytes.
    #[default]
    Idle,
    /// Bytes received but no terminator yet.
    Assembling,
    /// A full line is ready to be dispatched.
    Complete,
    /// The line's handler has started but not finished.
    Executing,
}

/// One G-code line and its parsing state.
#[derive(Debug, Default)]
pub struct GCodeBuffer {
    identity: &'static str,
    line: String,
    state: BufferState,
    read_index: Option<usize>,
    in_comment: bool,
    paused: bool,
    writing_file: bool,
}

impl GCodeBuffer {
    /// A buffer tagged with the source name used in debug echo.
    pub fn new(identity: &'static str) -> Self {
        GCodeBuffer {
            identity,
            ..Default::default()
        }
    }

    /// Reset to idle, dropping any assembled content.
    pub fn init(&mut self) {
        self.line.clear();
        self.state = BufferState::Idle;
        self.read_index = None;
        self.in_comment = false;
    }

    /// While a file is being written through this buffer, comment bytes
    /// are kept instead of stripped.
    pub fn set_writing_file(&mut self, writing: bool) {
        self.writing_file = writing;
    }

    /// Add a byte to the line being assembled. Returns true when the line
    /// is complete and ready to be acted upon.
    pub fn put(&mut self, c: u8) -> bool {
        if c == b';' {
            self.in_comment = true;
        }

        if c == b'\n' || c == 0 {
            if self.line.is_empty() && self.state == BufferState::Idle {
                // Blank line or pure comment; still presented so the
                // dispatcher can acknowledge it.
                self.in_comment = false;
                self.state = BufferState::Complete;
                return true;
            }
            if !self.line.is_empty() && !self.writing_file {
                tracing::debug!(source = self.identity, line = %self.line, "gcode received");
            }
            self.in_comment = false;
            self.apply_checksum_protocol();
            self.state = BufferState::Complete;
            return true;
        }

        if !self.in_comment || self.writing_file {
            if self.line.len() >= GCODE_LENGTH {
                tracing::warn!(source = self.identity, "G-code buffer length overflow");
                self.init();
                return false;
            }
            self.line.push(c as char);
            if self.state == BufferState::Idle {
                self.state = BufferState::Assembling;
            }
        }
        false
    }

    /// XOR of the line's bytes before the `*`, the checksum the sender
    /// computed over.
    fn checksum(&self) -> u8 {
        let mut cs = 0u8;
        for &b in self.line.as_bytes() {
            if b == b'*' {
                break;
            }
            cs ^= b;
        }
        cs
    }

    /// Verify and strip the `Nnnn ... *cs` wrapping, replacing the line
    /// with a resend request on mismatch.
    fn apply_checksum_protocol(&mut self) {
        if self.seen('*') {
            let sent = self.int_value();
            let computed = self.checksum() as i32;
            let line_number = if self.seen('N') { self.int_value() } else { 0 };
            if sent != computed {
                self.line = format!("M998 P{line_number}");
                self.read_index = None;
                return;
            }

            // Strip the line number prefix and the checksum suffix.
            if let Some(star) = self.line.find('*') {
                self.line.truncate(star);
            }
            if self.line.starts_with('N') {
                match self.line.find(' ') {
                    Some(space) => self.line.drain(..=space),
                    None => self.line.drain(..),
                };
            }
            self.line = self.line.trim_end().to_string();
        }
        self.read_index = None;
    }

    /// Mark the line as acted on: finished handlers return the buffer to
    /// idle; unfinished ones leave it executing for the next spin.
    pub fn set_finished(&mut self, finished: bool) {
        if finished {
            self.init();
        } else {
            self.state = BufferState::Executing;
        }
    }

    /// True when this buffer holds a command that still needs attention.
    pub fn active(&self) -> bool {
        !self.paused && matches!(self.state, BufferState::Complete | BufferState::Executing)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Park an executing command, as when an SD print is paused while a
    /// wait-style command is in flight.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume a parked command.
    pub fn cancel_pause(&mut self) {
        self.paused = false;
    }

    /// The assembled line.
    pub fn buffer(&self) -> &str {
        &self.line
    }

    /// Look for a parameter letter. Leaves the read cursor on it for a
    /// following value read. The search stops at a comment.
    pub fn seen(&mut self, letter: char) -> bool {
        for (i, b) in self.line.char_indices() {
            if b == ';' {
                break;
            }
            if b == letter {
                self.read_index = Some(i);
                return true;
            }
        }
        self.read_index = None;
        false
    }

    /// Float value following the letter found by `seen`.
    pub fn float_value(&mut self) -> f64 {
        match self.read_index.take() {
            Some(i) => parse_float(&self.line[i + 1..]),
            None => {
                tracing::error!(source = self.identity, "float read before a search");
                0.0
            }
        }
    }

    /// Integer value following the letter found by `seen`.
    pub fn int_value(&mut self) -> i32 {
        match self.read_index.take() {
            Some(i) => parse_int(&self.line[i + 1..]) as i32,
            None => {
                tracing::error!(source = self.identity, "int read before a search");
                0
            }
        }
    }

    /// Long value following the letter found by `seen`.
    pub fn long_value(&mut self) -> i64 {
        match self.read_index.take() {
            Some(i) => parse_int(&self.line[i + 1..]),
            None => {
                tracing::error!(source = self.identity, "long read before a search");
                0
            }
        }
    }

    /// A `:`-separated list of floats following the letter found by
    /// `seen`. A single value is broadcast to `requested` entries; a list
    /// longer than `requested` is an error and comes back empty.
    pub fn float_array(&mut self, requested: usize) -> Vec<f64> {
        let values = self.raw_array();
        match values {
            Some(v) if v.len() == 1 && requested > 1 => {
                vec![parse_float(&v[0]); requested]
            }
            Some(v) if v.len() <= requested => v.iter().map(|s| parse_float(s)).collect(),
            Some(_) => {
                tracing::warn!(source = self.identity, line = %self.line, "float array too long");
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// A `:`-separated list of integers following the letter found by
    /// `seen`.
    pub fn long_array(&mut self, requested: usize) -> Vec<i64> {
        let values = self.raw_array();
        match values {
            Some(v) if v.len() <= requested => v.iter().map(|s| parse_int(s)).collect(),
            Some(_) => {
                tracing::warn!(source = self.identity, line = %self.line, "long array too long");
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    fn raw_array(&mut self) -> Option<Vec<String>> {
        let i = self.read_index.take()?;
        let rest = &self.line[i + 1..];
        let end = rest.find(' ').unwrap_or(rest.len());
        Some(
            rest[..end]
                .split(printforge_core::LIST_SEPARATOR)
                .map(str::to_string)
                .collect(),
        )
    }

    /// The rest of the line after the letter found by `seen`. Strings are
    /// always the last parameter on a line.
    pub fn string_value(&mut self) -> String {
        match self.read_index.take() {
            Some(i) => self.line[i + 1..].trim().to_string(),
            None => {
                tracing::error!(source = self.identity, "string read before a search");
                String::new()
            }
        }
    }

    /// Everything after the first space: the legacy form used by M23 and
    /// friends where a file name follows the code without a tag letter.
    pub fn unprecedented_string(&mut self) -> String {
        self.read_index = None;
        match self.line.find(' ') {
            Some(space) => self.line[space + 1..].trim().to_string(),
            None => String::new(),
        }
    }
}

/// Parse the longest leading number, the way `strtod` stops at the first
/// character that cannot continue one.
fn parse_float(s: &str) -> f64 {
    let end = number_end(s, true);
    s[..end].parse().unwrap_or(0.0)
}

fn parse_int(s: &str) -> i64 {
    let end = number_end(s, false);
    s[..end].parse().unwrap_or(0)
}

fn number_end(s: &str, allow_dot: bool) -> usize {
    let mut end = 0;
    for (i, c) in s.char_indices() {
        let ok = c.is_ascii_digit()
            || (i == 0 && (c == '+' || c == '-'))
            || (allow_dot && c == '.');
        if !ok {
            break;
        }
        end = i + c.len_utf8();
    }
    end
}
