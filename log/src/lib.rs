//! Simple logging crate inspired by OpenBSD's `log.c`.
//!
//! Diagnostics are written as bare lines to a process-wide output
//! descriptor.  The descriptor defaults to standard error and can be
//! repointed at runtime with [`set_output_fd`]; a forking server uses this
//! to keep logging on its *saved* stderr after the normal descriptor slots
//! have been reassigned to a client socket.  Setting the descriptor to a
//! negative value discards all output.
//!
//! The output cell is a plain atomic so that signal handlers can read it
//! and write through `libc::write` without taking any locks.

use derive_more::{Display, From, Into};
use serde_derive::{Deserialize, Serialize};
use slog::{Drain, Level, Logger, OwnedKVList, Record, KV};
use slog_envlogger::LogBuilder;
use slog_scope::GlobalLoggerGuard;
use std::{
    env, fmt, io,
    os::unix::io::RawFd,
    sync::{
        atomic::{AtomicI32, Ordering},
        Mutex, Once,
    },
};

/// Re-export the scoped logging macros.
pub use slog_scope::{debug, error, info, trace, warn};

static LOG_BRIDGE: Once = Once::new();

/// Where log lines are written.  Shared with signal handlers.
static OUTPUT_FD: AtomicI32 = AtomicI32::new(libc::STDERR_FILENO);

lazy_static::lazy_static! {
    /// Default logger global guard.
    ///
    /// This is used before a logger context is initialized.
    pub static ref GLOBAL_LOGGER_GUARD: (Logger, GlobalLoggerGuard) = {
        let guard = new(
            Box::new(Stderr::new("").unwrap().fuse()),
            Config {
                level: Some("debug".to_string()),
            }
        );
        guard
    };

    /// Default global logger scope.
    static ref GLOBAL_LOGGER: Logger = GLOBAL_LOGGER_GUARD.0.clone();
}

/// Point all subsequent log output at the given descriptor.
pub fn set_output_fd(fd: RawFd) {
    OUTPUT_FD.store(fd, Ordering::SeqCst);
}

/// The descriptor log output is currently written to, or a negative value
/// if output is discarded.
pub fn output_fd() -> RawFd {
    OUTPUT_FD.load(Ordering::SeqCst)
}

/// Configuration for the logging crate.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// The log level filter if `RUST_LOG` is not set.
    level: Option<String>,
}

impl From<Option<String>> for Config {
    #[inline]
    fn from(level: Option<String>) -> Self {
        Self { level }
    }
}

/// Logging errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "{}", "_0")]
    IoError(io::Error),
}

impl std::error::Error for Error {}

/// Initialize the global logger context.
///
/// This is also called by `sync_logger`.
pub fn init() {
    lazy_static::initialize(&GLOBAL_LOGGER);
    LOG_BRIDGE.call_once(|| {
        if let Err(err) = slog_stdlog::init() {
            error!("Failed to initialize log bridge: {}", err);
        }
    });
}

fn new(
    drain: Box<dyn Drain<Err = slog::Never, Ok = ()> + Send>,
    config: Config,
) -> (Logger, GlobalLoggerGuard) {
    let kv = slog::o!();

    // Build log filter
    let mut builder = LogBuilder::new(drain);
    let log = env::var("RUST_LOG")
        .ok()
        .or(config.level)
        .unwrap_or_else(|| "info".to_string());
    builder = builder.parse(&log);
    let drain = builder.build();

    // This is required to make the drain `UnwindSafe`.
    let drain = Mutex::new(drain.fuse());

    let logger = slog::Logger::root(drain.fuse(), kv).into_erased();
    let guard = slog_scope::set_global_logger(logger.clone());

    (logger, guard)
}

/// Return a new global sync logger.
pub fn sync_logger<C: Into<Config>>(name: &str, config: C) -> Result<LoggerGuard, Error> {
    let config = config.into();

    init();

    Ok(new(Box::new(Stderr::new(name)?.fuse()), config).into())
}

/// Wrapper for the global logger guard.
#[derive(From)]
pub struct LoggerGuard {
    _logger: Logger,
    _guard: GlobalLoggerGuard,
}

impl Drop for LoggerGuard {
    fn drop(&mut self) {
        let guard = slog_scope::set_global_logger(GLOBAL_LOGGER.clone());
        guard.cancel_reset();
    }
}

/// Local trait for logger targets.
pub trait Target: Send + Sync {
    fn new(name: &str) -> Result<Self, Error>
    where
        Self: Sized;
    fn log_str(&self, name: &str) -> Result<(), Error>;
}

/// Logger that writes to the process-wide output descriptor.
pub struct Stderr {
    name: String,
}

impl Target for Stderr {
    /// Create a new logger.
    fn new(name: &str) -> Result<Self, Error> {
        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Log the pre-formatted string.
    fn log_str(&self, message: &str) -> Result<(), Error> {
        let fd = output_fd();
        if fd < 0 {
            return Ok(());
        }
        let message = if !self.name.is_empty() {
            format!("{}: {}\n", self.name, message)
        } else {
            format!("{}\n", message)
        };
        write_fd(fd, message.as_bytes()).map_err(Into::into)
    }
}

impl Drain for Stderr {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        let message = format_log(record, values);
        self.log_str(&message)
    }
}

/// Write the whole buffer to a raw descriptor, retrying on interruption.
fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let mut offset = 0;
    while offset < buf.len() {
        let ret = unsafe {
            libc::write(
                fd,
                buf[offset..].as_ptr() as *const libc::c_void,
                buf.len() - offset,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        offset += ret as usize;
    }
    Ok(())
}

/// Format the log message to a string.
#[inline]
fn format_log(record: &Record<'_>, values: &OwnedKVList) -> String {
    let mut formatter = Formatter::new(record);
    let _ = record.kv().serialize(record, &mut formatter);
    let _ = values.serialize(record, &mut formatter);
    formatter.into()
}

/// Formatter to create a log message from a record.
#[derive(Into)]
struct Formatter {
    #[into]
    buf: String,
}

impl Formatter {
    /// Return a new formatter.
    fn new(record: &Record<'_>) -> Self {
        let mut buf = format!("{}", record.msg());

        if record.level() >= Level::Debug {
            // Rust does not support function!()
            buf.push_str(&format!(
                ", source: {}:{}, module: {}",
                record.file(),
                record.line(),
                record.module()
            ));
        };

        Self { buf }
    }
}

/// Serializer for key-value fields.
impl slog::Serializer for Formatter {
    fn emit_arguments(&mut self, key: &str, val: &fmt::Arguments<'_>) -> slog::Result {
        self.buf.push_str(&format!(", {}: {}", key, val));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{info, init, set_output_fd, sync_logger, Config};

    #[test]
    fn test_default_log() {
        init();
        info!("default log");
    }

    #[test]
    fn test_redirected_output() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let _guard = sync_logger(
            "test",
            Config {
                level: Some("info".to_string()),
            },
        )
        .unwrap();

        set_output_fd(fds[1]);
        info!("Hello, World!");
        set_output_fd(libc::STDERR_FILENO);

        assert_eq!(unsafe { libc::close(fds[1]) }, 0);

        let mut buf = [0u8; 256];
        let n = unsafe { libc::read(fds[0], buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert_eq!(unsafe { libc::close(fds[0]) }, 0);

        assert!(n > 0);
        let output = String::from_utf8_lossy(&buf[..n as usize]);
        assert!(output.contains("test: Hello, World!"));
    }
}
