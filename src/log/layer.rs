//! Tracing bridge
//!
//! Routes `tracing` events into the [`LogSink`] so the crate, tokio and
//! tungstenite all end up in one ordered log.
//!
//! Targets pick the non-standard levels: `access`, `print` and `fatal`.
//! Everything else maps by tracing level (TRACE folds into DEBUG).

use std::fmt::{self, Write as _};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Metadata, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::log::record::{LogLevel, LogRecord};
use crate::log::sink::LogSink;

/// `tracing_subscriber` layer writing into a sink.
pub struct SinkLayer {
    sink: Arc<LogSink>,
}

impl SinkLayer {
    /// Bridge events into `sink`.
    pub fn new(sink: Arc<LogSink>) -> Self {
        Self { sink }
    }
}

impl<S: Subscriber> Layer<S> for SinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.sink
            .record(&LogRecord::now(level_for(event.metadata()), visitor.finish()));
    }
}

/// Log level for an event's metadata.
pub fn level_for(metadata: &Metadata<'_>) -> LogLevel {
    match metadata.target() {
        "access" => LogLevel::Access,
        "print" => LogLevel::Print,
        "fatal" => LogLevel::Fatal,
        _ => match *metadata.level() {
            Level::ERROR => LogLevel::Error,
            Level::WARN => LogLevel::Warn,
            Level::INFO => LogLevel::Info,
            Level::DEBUG | Level::TRACE => LogLevel::Debug,
        },
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
            return;
        }
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={:?}", field.name(), value);
    }
}
