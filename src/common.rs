// Licensed under the Apache-2.0 license

//! Ambient seams shared by every component: logging and notification.
//!
//! Components never talk to the microkernel directly. They are handed a
//! [`Notifier`] for outgoing signals and are driven by whoever owns the event
//! loop, which keeps the driver and server state machines host-testable.

use core::fmt;

/// Notification channel identifier.
///
/// Client ids double as the server's channel to that client.
pub type Channel = u32;

/// Severity of a log line.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Sink for diagnostic output.
///
/// Implementations must not fail the caller: a broken sink drops lines.
pub trait Logger {
    fn log(&mut self, level: LogLevel, args: fmt::Arguments<'_>);

    fn debug(&mut self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Debug, args);
    }

    fn info(&mut self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Info, args);
    }

    fn error(&mut self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Error, args);
    }
}

/// Logger that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {
    fn log(&mut self, _level: LogLevel, _args: fmt::Arguments<'_>) {}
}

/// Line-oriented logger over any `embedded-io` writer (typically a debug UART).
///
/// Lines look like `driver|ERROR: no return buffer\r\n`.
pub struct WriterLogger<W: embedded_io::Write> {
    writer: W,
    component: &'static str,
    min_level: LogLevel,
}

impl<W: embedded_io::Write> WriterLogger<W> {
    pub fn new(writer: W, component: &'static str) -> Self {
        Self {
            writer,
            component,
            min_level: LogLevel::Debug,
        }
    }

    #[must_use]
    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: embedded_io::Write> Logger for WriterLogger<W> {
    fn log(&mut self, level: LogLevel, args: fmt::Arguments<'_>) {
        if level < self.min_level {
            return;
        }
        let _ = write!(
            self.writer,
            "{}|{}: {}\r\n",
            self.component,
            level.as_str(),
            args
        );
    }
}

/// Outgoing signals to other components.
///
/// `notify` is the cross-component doorbell; `irq_ack` re-arms a hardware
/// interrupt line once its handler has run.
pub trait Notifier {
    fn notify(&mut self, channel: Channel);

    fn irq_ack(&mut self, channel: Channel);
}

/// Blocking half of the notification facility, used only by clients that
/// want synchronous semantics on top of the asynchronous transport.
pub trait WaitForNotification {
    /// Suspend until `channel` is signalled.
    fn wait(&mut self, channel: Channel);
}
