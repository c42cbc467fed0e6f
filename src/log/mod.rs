//! Event Log
//!
//! Crash-consistent, ordered event recording.
//!
//! ## Module Structure
//!
//! - `record`: Levels, visibility masks, line formatting
//! - `sink`: The serialized writer and terminal flush
//! - `logger`: Producer handle injected into components
//! - `layer`: `tracing` bridge into the sink

pub mod layer;
pub mod logger;
pub mod record;
pub mod sink;

pub use layer::SinkLayer;
pub use logger::Logger;
pub use record::{LevelMask, LogLevel, LogRecord, Visibility};
pub use sink::{FileTarget, LogSettings, LogSink, LogTarget, MemoryTarget};
