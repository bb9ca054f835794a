// Level-filtered log sink for the host runtime.
//
// The crate logs through the `log` facade; this module is the backend.
// One facility is active at a time: stdout (default), a file opened
// truncating, or a syslog channel. Switching facilities closes the
// previous one, and a facility that fails to open falls back to stdout.
//
// The severity scale is syslog's eight levels. The `log` facade only
// reaches down to `error!`; the three levels above it are emitted
// through the `crit!`, `alert!` and `emerg!` macros exported at the
// crate root.

use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{NvmeError, Result};

/// Message severities, ordered most severe first.
///
/// A message is emitted when its level is at or above the sink
/// threshold (numerically less than or equal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// System is unusable.
    Emerg = 0,
    /// Action must be taken immediately.
    Alert = 1,
    /// Critical conditions.
    Crit = 2,
    /// Error conditions.
    Err = 3,
    /// Warning conditions.
    Warning = 4,
    /// Normal but significant condition.
    Notice = 5,
    /// Informational.
    Info = 6,
    /// Debug-level messages.
    Debug = 7,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Emerg => "FATAL",
            LogLevel::Alert => "ALERT",
            LogLevel::Crit => "CRITICAL",
            LogLevel::Err => "ERROR",
            LogLevel::Warning => "WARNING",
            LogLevel::Notice => "NOTICE",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => LogLevel::Err,
            log::Level::Warn => LogLevel::Warning,
            log::Level::Info => LogLevel::Info,
            log::Level::Debug => LogLevel::Debug,
            log::Level::Trace => LogLevel::Debug,
        }
    }
}

/// Log output target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFacility {
    /// Write to standard output (the default).
    Stdout,
    /// Write to the given file, truncated on open.
    File(PathBuf),
    /// Send to syslog under the given identity tag.
    Syslog(String),
}

enum Output {
    Stdout,
    File(File),
    // The tag buffer must outlive the syslog connection: openlog(3)
    // keeps the pointer, it does not copy the string.
    Syslog(#[allow(dead_code)] CString),
}

struct LogSink {
    level: LogLevel,
    facility: LogFacility,
    output: Output,
}

impl LogSink {
    fn close_output(&mut self) {
        match std::mem::replace(&mut self.output, Output::Stdout) {
            Output::File(mut f) => {
                let _ = f.flush();
            }
            Output::Syslog(_) => unsafe {
                libc::closelog();
            },
            Output::Stdout => {}
        }
        self.facility = LogFacility::Stdout;
    }
}

static SINK: Lazy<Mutex<LogSink>> = Lazy::new(|| {
    Mutex::new(LogSink {
        level: LogLevel::Notice,
        facility: LogFacility::Stdout,
        output: Output::Stdout,
    })
});

/// Set the sink threshold. Messages below it are dropped.
pub fn set_log_level(level: LogLevel) {
    SINK.lock().level = level;
}

/// Current sink threshold.
pub fn log_level() -> LogLevel {
    SINK.lock().level
}

/// Current facility.
pub fn log_facility() -> LogFacility {
    SINK.lock().facility.clone()
}

/// Switch the active facility, closing the previous one.
///
/// On failure the sink falls back to stdout and the error is returned.
pub fn set_log_facility(facility: LogFacility) -> Result<()> {
    let mut sink = SINK.lock();
    sink.close_output();

    match &facility {
        LogFacility::Stdout => {}
        LogFacility::File(path) => {
            let file = File::create(path).map_err(NvmeError::Io)?;
            sink.output = Output::File(file);
        }
        LogFacility::Syslog(tag) => {
            let tag = CString::new(tag.as_str())
                .map_err(|_| NvmeError::invalid("syslog tag contains a NUL byte"))?;
            unsafe {
                libc::openlog(tag.as_ptr(), libc::LOG_NDELAY | libc::LOG_PID, libc::LOG_USER);
            }
            sink.output = Output::Syslog(tag);
        }
    }

    sink.facility = facility;
    Ok(())
}

/// Route a message into the active facility.
///
/// Used by the facade bridge and the `crit!`/`alert!`/`emerg!` macros;
/// ordinary messages should go through the `log` macros instead.
pub fn emit(level: LogLevel, args: fmt::Arguments<'_>) {
    let mut sink = SINK.lock();
    if level > sink.level {
        return;
    }

    match &mut sink.output {
        Output::Stdout => {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "rusty-nvme [{}] {}", level.as_str(), args);
            let _ = out.flush();
        }
        Output::File(file) => {
            let _ = writeln!(file, "rusty-nvme [{}] {}", level.as_str(), args);
            let _ = file.flush();
        }
        Output::Syslog(_) => {
            if let Ok(msg) = CString::new(format!("{}", args)) {
                const FMT: &[u8] = b"%s\0";
                unsafe {
                    libc::syslog(
                        level as libc::c_int,
                        FMT.as_ptr() as *const libc::c_char,
                        msg.as_ptr(),
                    );
                }
            }
        }
    }
}

struct FacadeLogger;

impl log::Log for FacadeLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        LogLevel::from(metadata.level()) <= SINK.lock().level
    }

    fn log(&self, record: &log::Record<'_>) {
        emit(LogLevel::from(record.level()), *record.args());
    }

    fn flush(&self) {}
}

static FACADE: FacadeLogger = FacadeLogger;

/// Install the sink as the `log` facade backend. Idempotent; losing the
/// race against another logger leaves that logger in place.
pub(crate) fn install() {
    if log::set_logger(&FACADE).is_ok() {
        log::set_max_level(log::LevelFilter::Trace);
    }
}

/// Critical conditions.
#[macro_export]
macro_rules! crit {
    ($($arg:tt)*) => {
        $crate::logging::emit($crate::logging::LogLevel::Crit, ::core::format_args!($($arg)*))
    };
}

/// Action must be taken immediately.
#[macro_export]
macro_rules! alert {
    ($($arg:tt)*) => {
        $crate::logging::emit($crate::logging::LogLevel::Alert, ::core::format_args!($($arg)*))
    };
}

/// System is unusable.
#[macro_export]
macro_rules! emerg {
    ($($arg:tt)*) => {
        $crate::logging::emit($crate::logging::LogLevel::Emerg, ::core::format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    // The sink is process-global; serialize the tests that mutate it.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Emerg < LogLevel::Crit);
        assert!(LogLevel::Crit < LogLevel::Err);
        assert!(LogLevel::Notice < LogLevel::Debug);
        assert_eq!(LogLevel::from(log::Level::Error), LogLevel::Err);
        assert_eq!(LogLevel::from(log::Level::Trace), LogLevel::Debug);
    }

    #[test]
    fn test_file_facility_and_threshold() {
        let _guard = TEST_LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.log");

        set_log_facility(LogFacility::File(path.clone())).unwrap();
        set_log_level(LogLevel::Notice);

        emit(LogLevel::Err, format_args!("kept message"));
        emit(LogLevel::Debug, format_args!("dropped message"));

        set_log_facility(LogFacility::Stdout).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("kept message"));
        assert!(contents.contains("[ERROR]"));
        assert!(!contents.contains("dropped message"));
    }

    #[test]
    fn test_bad_file_falls_back_to_stdout() {
        let _guard = TEST_LOCK.lock();
        let res = set_log_facility(LogFacility::File(PathBuf::from(
            "/nonexistent-dir/no-such-file.log",
        )));
        assert!(res.is_err());
        assert_eq!(log_facility(), LogFacility::Stdout);
    }

    #[test]
    fn test_level_roundtrip() {
        let _guard = TEST_LOCK.lock();
        let prev = log_level();
        set_log_level(LogLevel::Debug);
        assert_eq!(log_level(), LogLevel::Debug);
        set_log_level(prev);
    }
}
