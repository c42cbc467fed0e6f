//! Logger handle
//!
//! Cheap cloneable producer side of a [`LogSink`], injected into the
//! components that emit events.

use std::sync::Arc;

use crate::log::record::{LogLevel, LogRecord};
use crate::log::sink::LogSink;

/// Producer handle over one sink.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<LogSink>,
}

impl Logger {
    /// Wrap a sink.
    pub fn new(sink: Arc<LogSink>) -> Self {
        Self { sink }
    }

    /// The sink records go to.
    pub fn sink(&self) -> &Arc<LogSink> {
        &self.sink
    }

    /// Record `message` at `level`, stamped now.
    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        self.sink.record(&LogRecord::now(level, message.as_ref()));
    }

    /// Operator output without level tag.
    pub fn print(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Print, message);
    }

    /// Diagnostic detail.
    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message);
    }

    /// Connection access trail.
    pub fn access(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Access, message);
    }

    /// Normal operation.
    pub fn inform(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message);
    }

    /// Recoverable oddity.
    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warn, message);
    }

    /// A failure.
    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message);
    }

    /// Unrecoverable failure.
    pub fn fatal(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Fatal, message);
    }
}

/// Logger over an in-memory sink that records every level.
#[cfg(test)]
pub(crate) fn memory_logger() -> (Logger, Arc<LogSink>, crate::log::sink::MemoryTarget) {
    use crate::log::record::{LevelMask, Visibility};

    let target = crate::log::sink::MemoryTarget::new();
    let visibility = Visibility {
        console: LevelMask::NONE,
        file: LevelMask::ALL,
    };
    let sink = LogSink::with_target(Box::new(target.clone()), visibility)
        .expect("memory sink should start");
    let sink = Arc::new(sink);
    (Logger::new(sink.clone()), sink, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::record::{LevelMask, Visibility};
    use crate::log::sink::MemoryTarget;

    #[test]
    fn test_helpers_tag_levels() {
        let target = MemoryTarget::new();
        let visibility = Visibility {
            console: LevelMask::NONE,
            file: LevelMask::ALL,
        };
        let sink = Arc::new(LogSink::with_target(Box::new(target.clone()), visibility).unwrap());
        let logger = Logger::new(sink.clone());

        logger.access("REQUEST FROM 127.0.0.1:9000");
        logger.debug("checking origin");
        logger.inform("listener open");
        logger.print("plain");
        sink.flush();

        let contents = target.contents();
        let lines: Vec<&str> = contents.lines().collect();
        assert!(lines[0].ends_with("[ACCESS] REQUEST FROM 127.0.0.1:9000"));
        assert!(lines[1].ends_with("[DEBUG] checking origin"));
        assert!(lines[2].ends_with("[INFO] listener open"));
        assert!(lines[3].ends_with(" plain"));
        assert!(!lines[3].contains('['));
    }
}
