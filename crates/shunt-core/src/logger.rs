//! Log and status fan-out.
//!
//! The engine never prints; it hands lines to the caller's log callback and
//! milestone messages to the status callback. `EngineLogger` applies the
//! configured verbosity before a line ever reaches the callback, and mirrors
//! each line onto the `log` facade so embedding hosts with a global logger
//! see the same stream.

use std::sync::Arc;

/// Receives every log line the engine decides to emit.
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Receives status messages, optionally with an integer percentage 0..=100.
pub type StatusCallback = Arc<dyn Fn(&str, Option<u8>) + Send + Sync>;

/// Verbosity levels, ordered so that a configured level admits everything at
/// or below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Error,
    Info,
    Debug,
}

impl Verbosity {
    fn log_level(self) -> log::Level {
        match self {
            Verbosity::Error => log::Level::Error,
            Verbosity::Info => log::Level::Info,
            Verbosity::Debug => log::Level::Debug,
        }
    }
}

/// Verbosity-filtering wrapper around the caller's log callback.
#[derive(Clone)]
pub struct EngineLogger {
    verbosity: Verbosity,
    sink: LogCallback,
}

impl EngineLogger {
    pub fn new(verbosity: Verbosity, sink: LogCallback) -> Self {
        Self { verbosity, sink }
    }

    /// Logger that drops everything; used by tests and defaults.
    pub fn noop() -> Self {
        Self {
            verbosity: Verbosity::Error,
            sink: Arc::new(|_| {}),
        }
    }

    pub fn error(&self, line: impl AsRef<str>) {
        self.emit(Verbosity::Error, line.as_ref());
    }

    pub fn info(&self, line: impl AsRef<str>) {
        self.emit(Verbosity::Info, line.as_ref());
    }

    pub fn debug(&self, line: impl AsRef<str>) {
        self.emit(Verbosity::Debug, line.as_ref());
    }

    fn emit(&self, level: Verbosity, line: &str) {
        log::log!(target: "shunt", level.log_level(), "{line}");
        if level <= self.verbosity {
            (self.sink)(line);
        }
    }
}

/// Thin wrapper around the status callback.
#[derive(Clone)]
pub struct StatusSink {
    callback: StatusCallback,
}

impl StatusSink {
    pub fn new(callback: StatusCallback) -> Self {
        Self { callback }
    }

    pub fn noop() -> Self {
        Self {
            callback: Arc::new(|_, _| {}),
        }
    }

    pub fn emit(&self, message: &str, percent: Option<u8>) {
        (self.callback)(message, percent);
    }
}
