//! Log Records
//!
//! Levels, visibility masks and the two text forms every record can take.

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Timestamp layout used in both console and file lines.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Layout of archived log file names.
pub const ARCHIVE_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// Severity / category of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum LogLevel {
    /// Operator-facing output, printed without decoration.
    Print = 0,
    /// File-only plain output.
    File = 1,
    /// Diagnostic detail.
    Debug = 2,
    /// Connection access trail.
    Access = 3,
    /// Normal operation.
    Info = 4,
    /// Something unexpected but recoverable.
    Warn = 5,
    /// A failure.
    Error = 6,
    /// The process cannot continue.
    Fatal = 7,
}

impl LogLevel {
    /// Every level, in order.
    pub const ALL: [LogLevel; 8] = [
        LogLevel::Print,
        LogLevel::File,
        LogLevel::Debug,
        LogLevel::Access,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Fatal,
    ];

    /// Upper-case name as it appears in log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Print => "PRINT",
            LogLevel::File => "FILE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Access => "ACCESS",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    /// Print-like levels carry no level tag.
    pub fn is_plain(self) -> bool {
        matches!(self, LogLevel::Print | LogLevel::File)
    }

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of levels allowed through one output.
///
/// Serialized as a list of level names.
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<LogLevel>", into = "Vec<LogLevel>")]
pub struct LevelMask(u8);

impl LevelMask {
    /// No level passes.
    pub const NONE: LevelMask = LevelMask(0);
    /// Every level passes.
    pub const ALL: LevelMask = LevelMask(u8::MAX);

    /// Build a mask from a list of levels.
    pub fn of(levels: &[LogLevel]) -> Self {
        levels.iter().copied().collect()
    }

    /// Default console visibility.
    pub fn console_default() -> Self {
        Self::of(&[
            LogLevel::Print,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
            LogLevel::Fatal,
        ])
    }

    /// Does the mask let `level` through.
    pub fn contains(self, level: LogLevel) -> bool {
        self.0 & level.bit() != 0
    }

    /// Allow `level`.
    pub fn insert(&mut self, level: LogLevel) {
        self.0 |= level.bit();
    }

    /// Block `level`.
    pub fn remove(&mut self, level: LogLevel) {
        self.0 &= !level.bit();
    }

    /// Levels in the mask, in order.
    pub fn levels(self) -> Vec<LogLevel> {
        LogLevel::ALL
            .iter()
            .copied()
            .filter(|level| self.contains(*level))
            .collect()
    }
}

impl FromIterator<LogLevel> for LevelMask {
    fn from_iter<I: IntoIterator<Item = LogLevel>>(iter: I) -> Self {
        let mut mask = LevelMask::NONE;
        for level in iter {
            mask.insert(level);
        }
        mask
    }
}

impl From<Vec<LogLevel>> for LevelMask {
    fn from(levels: Vec<LogLevel>) -> Self {
        levels.into_iter().collect()
    }
}

impl From<LevelMask> for Vec<LogLevel> {
    fn from(mask: LevelMask) -> Self {
        mask.levels()
    }
}

impl fmt::Debug for LevelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.levels()).finish()
    }
}

/// Console and file visibility for a sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Visibility {
    /// Levels printed to the console.
    pub console: LevelMask,
    /// Levels persisted to the log file.
    pub file: LevelMask,
}

impl Default for Visibility {
    fn default() -> Self {
        Self {
            console: LevelMask::console_default(),
            file: LevelMask::ALL,
        }
    }
}

/// One immutable event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    timestamp: DateTime<Local>,
    level: LogLevel,
    message: String,
}

impl LogRecord {
    /// Create a record.
    pub fn new(timestamp: DateTime<Local>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            level,
            message: message.into(),
        }
    }

    /// Create a record stamped with the current local time.
    pub fn now(level: LogLevel, message: impl Into<String>) -> Self {
        Self::new(Local::now(), level, message)
    }

    /// When the record was produced.
    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// Record level.
    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Record text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Line shown on the console.
    pub fn console_line(&self) -> String {
        format_console(&self.timestamp, self.level, &self.message)
    }

    /// Line persisted to the file, without terminator.
    pub fn file_line(&self) -> String {
        format_file(&self.timestamp, self.level, &self.message)
    }
}

/// Render a timestamp the way log lines show it.
pub fn format_timestamp(timestamp: &DateTime<Local>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

fn format_console(timestamp: &DateTime<Local>, level: LogLevel, message: &str) -> String {
    if level.is_plain() {
        message.to_string()
    } else {
        format!("{} [{}] {}", format_timestamp(timestamp), level, message)
    }
}

fn format_file(timestamp: &DateTime<Local>, level: LogLevel, message: &str) -> String {
    if level.is_plain() {
        format!("{} {}", format_timestamp(timestamp), message)
    } else {
        format!("{} [{}] {}", format_timestamp(timestamp), level, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).single().unwrap()
            + chrono::Duration::milliseconds(41)
    }

    #[test]
    fn test_console_line_plain_levels() {
        let record = LogRecord::new(fixed_time(), LogLevel::Print, "hello");
        assert_eq!(record.console_line(), "hello");

        let record = LogRecord::new(fixed_time(), LogLevel::File, "hello");
        assert_eq!(record.console_line(), "hello");
    }

    #[test]
    fn test_console_line_tagged_levels() {
        let record = LogRecord::new(fixed_time(), LogLevel::Access, "CONNECTION FROM 1.2.3.4:5");
        assert_eq!(
            record.console_line(),
            "2024-03-07 09:05:02.041 [ACCESS] CONNECTION FROM 1.2.3.4:5"
        );
    }

    #[test]
    fn test_file_line_always_stamped() {
        let record = LogRecord::new(fixed_time(), LogLevel::Print, "hello");
        assert_eq!(record.file_line(), "2024-03-07 09:05:02.041 hello");

        let record = LogRecord::new(fixed_time(), LogLevel::Fatal, "boom");
        assert_eq!(record.file_line(), "2024-03-07 09:05:02.041 [FATAL] boom");
    }

    #[test]
    fn test_mask_membership() {
        let mut mask = LevelMask::console_default();
        assert!(mask.contains(LogLevel::Info));
        assert!(!mask.contains(LogLevel::Debug));
        assert!(!mask.contains(LogLevel::Access));

        mask.insert(LogLevel::Debug);
        assert!(mask.contains(LogLevel::Debug));
        mask.remove(LogLevel::Info);
        assert!(!mask.contains(LogLevel::Info));

        for level in LogLevel::ALL {
            assert!(LevelMask::ALL.contains(level));
            assert!(!LevelMask::NONE.contains(level));
        }
    }

    #[test]
    fn test_mask_serde_as_level_list() {
        let mask: LevelMask = serde_json::from_str(r#"["DEBUG", "FATAL"]"#).unwrap();
        assert_eq!(mask.levels(), vec![LogLevel::Debug, LogLevel::Fatal]);

        let json = serde_json::to_string(&mask).unwrap();
        assert_eq!(json, r#"["DEBUG","FATAL"]"#);
    }
}
