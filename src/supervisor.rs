//! Fault Supervisor
//!
//! The outermost scheduling boundary. Whatever ends the server, the log
//! sink is finished exactly once: a clean return records the exit code,
//! and an error, a panic or a failed log write takes the fatal path.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt;
use std::future::{self, Future};
use std::panic;
use std::sync::Arc;

use tokio::sync::watch;

use crate::log::LogSink;

/// Exit code after a clean shutdown.
pub const EXIT_OK: i32 = 0;

/// Exit code after a fault.
pub const EXIT_FAULT: i32 = 1;

/// Run `server` to completion and finish `sink` accordingly. Returns the
/// process exit code.
pub async fn supervise<F, E>(sink: Arc<LogSink>, server: F) -> i32
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let mut faults = sink.faults();
    let mut task = tokio::spawn(server);

    let fault = tokio::select! {
        joined = &mut task => match joined {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(error.to_string()),
            Err(error) if error.is_panic() => Some(panic_message(error.into_panic())),
            Err(error) => Some(error.to_string()),
        },
        detail = next_fault(&mut faults) => {
            task.abort();
            Some(detail)
        }
    };

    match fault {
        None => {
            if let Err(error) = sink.finish(EXIT_OK) {
                eprintln!("failed to flush log: {error}");
            }
            EXIT_OK
        }
        Some(detail) => {
            if let Err(error) = sink.fail(&detail) {
                eprintln!("{detail}");
                eprintln!("failed to flush log: {error}");
            }
            EXIT_FAULT
        }
    }
}

async fn next_fault(faults: &mut watch::Receiver<Option<String>>) -> String {
    loop {
        if let Some(detail) = faults.borrow_and_update().clone() {
            return detail;
        }
        if faults.changed().await.is_err() {
            return future::pending().await;
        }
    }
}

thread_local! {
    /// Location and backtrace of the last panic on this thread, kept by the
    /// hook until the payload is described.
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Install a panic hook that keeps where each panic happened, so the fatal
/// record carries it. The previous hook still runs.
pub fn install_panic_hook() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(ToString::to_string)
            .unwrap_or_else(|| "an unknown location".to_string());
        let trace = format!("at {location}\n{}", Backtrace::force_capture());
        PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
        previous(info);
    }));
}

/// Text carried by a panic payload, followed by the hook's trace when the
/// panic happened on this thread.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let mut message = if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked with a non-text payload".to_string()
    };
    if let Some(trace) = PANIC_TRACE.with(|slot| slot.borrow_mut().take()) {
        message.push(' ');
        message.push_str(&trace);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::logger::memory_logger;
    use crate::log::record::{LevelMask, Visibility};
    use crate::log::sink::{LogTarget, MemoryTarget, FAULT_NOTICE};
    use std::io;

    #[tokio::test]
    async fn test_clean_exit_records_code() {
        let (logger, sink, target) = memory_logger();

        let code = supervise(sink.clone(), async move {
            logger.inform("serving");
            Ok::<(), io::Error>(())
        })
        .await;

        assert_eq!(code, EXIT_OK);
        assert!(sink.is_terminated());
        let log = target.contents();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] serving"));
        assert!(lines[1].ends_with("[INFO] ended with code 0"));
    }

    #[tokio::test]
    async fn test_error_takes_fatal_path() {
        let (logger, sink, target) = memory_logger();

        let code = supervise(sink.clone(), async move {
            for i in 0..20 {
                logger.debug(format!("record {i}"));
            }
            Err::<(), _>(io::Error::new(io::ErrorKind::AddrInUse, "port taken"))
        })
        .await;

        assert_eq!(code, EXIT_FAULT);
        let log = target.contents();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 22);
        for (i, line) in lines[..20].iter().enumerate() {
            assert!(line.ends_with(&format!("[DEBUG] record {i}")));
        }
        assert!(lines[20].ends_with("[FATAL] port taken"));
        assert!(lines[21].ends_with(&format!("[ERROR] {FAULT_NOTICE}")));
    }

    #[tokio::test]
    async fn test_panic_takes_fatal_path() {
        let (_logger, sink, target) = memory_logger();

        let code = supervise(sink.clone(), overrun()).await;

        assert_eq!(code, EXIT_FAULT);
        let log = target.contents();
        assert!(log.contains("[FATAL] panicked: tick overran"));
        assert!(log.contains(FAULT_NOTICE));
        assert!(!log.contains("ended with code"));
    }

    async fn overrun() -> Result<(), io::Error> {
        panic!("tick overran")
    }

    struct BrokenDisk {
        tail: MemoryTarget,
    }

    impl LogTarget for BrokenDisk {
        fn write_batch(&mut self, _batch: &str) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn finish(self: Box<Self>, tail: &str) -> io::Result<()> {
            Box::new(self.tail.clone()).finish(tail)
        }
    }

    #[tokio::test]
    async fn test_log_fault_stops_server() {
        let tail = MemoryTarget::new();
        let visibility = Visibility {
            console: LevelMask::NONE,
            file: LevelMask::ALL,
        };
        let broken = BrokenDisk { tail: tail.clone() };
        let sink = Arc::new(LogSink::with_target(Box::new(broken), visibility).unwrap());
        let producer = crate::log::Logger::new(sink.clone());

        let code = supervise(sink.clone(), async move {
            producer.inform("first write fails");
            future::pending::<Result<(), io::Error>>().await
        })
        .await;

        assert_eq!(code, EXIT_FAULT);
        let log = tail.contents();
        assert!(log.contains("[INFO] first write fails"));
        assert!(log.contains("[FATAL] log write failed: disk full"));
        assert!(log.contains(FAULT_NOTICE));
    }

    #[test]
    fn test_hook_adds_panic_location() {
        install_panic_hook();

        let payload = panic::catch_unwind(|| {
            panic!("tick overran");
        })
        .unwrap_err();
        let message = panic_message(payload);
        assert!(message.starts_with("panicked: tick overran at src/supervisor.rs:"), "{message}");
        assert!(message.lines().count() > 1);

        // The trace belongs to that one panic.
        assert_eq!(panic_message(Box::new("later")), "panicked: later");
    }

    #[tokio::test]
    async fn test_fatal_record_carries_panic_location() {
        install_panic_hook();
        let (_logger, sink, target) = memory_logger();

        let code = supervise(sink.clone(), overrun()).await;

        assert_eq!(code, EXIT_FAULT);
        let log = target.contents();
        assert!(log.contains("[FATAL] panicked: tick overran at src/supervisor.rs:"), "{log}");
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(Box::new("static")), "panicked: static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "panicked: owned");
        assert_eq!(panic_message(Box::new(7u8)), "panicked with a non-text payload");
    }
}
