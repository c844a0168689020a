//! The connection lifecycle: the privileged listener loop, the forked
//! per-connection workers, and the privilege-boundary transitions between
//! them.

use crate::{
    error::Error,
    net::{Connection, Listener},
    options::{self, Config, ServerOptions},
    privilege::{self, Account},
    signals, stdio,
};
use arrayvec::ArrayVec;
use nix::{
    errno::Errno,
    unistd::{self, alarm, fork, getpid, ForkResult, Pid},
};
use pwnable_log::{debug, error, info, warn};
use std::{
    env,
    ffi::CString,
    io::{self, Write},
    os::unix::{
        ffi::{OsStrExt, OsStringExt},
        io::{AsRawFd, RawFd},
    },
    path::Path,
    process,
};

/// Signature of the function used to handle connections.  The argument is
/// the opened descriptor for the socket connection, which is also bound to
/// the standard streams.
pub type ConnHandler = fn(RawFd);

/// Environment variable that marks a process image as a connection worker.
/// Its value is the inherited client socket descriptor in decimal; when it
/// is absent, the process runs as the listener.
pub const ENV_MARKER: &str = "PWNABLE_CONNECTION";

/// Deployment variables that must not leak into challenge code.
const SCRUBBED_VARS: [&str; 5] = [
    "CHALLENGE_NAME",
    "CHALLENGE_PASSWORD",
    "PORT",
    "TIMELIMIT",
    "PWNABLESERVER_EXTRA_ARGS",
];

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "ios", target_os = "macos"))] {
        /// Environment variable that makes exec'd children preload a library.
        const PRELOAD_ENV_VAR: &str = "DYLD_INSERT_LIBRARIES";
    } else {
        /// Environment variable that makes exec'd children preload a library.
        const PRELOAD_ENV_VAR: &str = "LD_PRELOAD";
    }
}

/// Start the server after applying command-line overrides to the
/// embedder's default options.
///
/// On a usage failure (or an explicit `-h`/`--help`) the usage block is
/// printed to standard output and an [`Error::Usage`] is returned; the
/// caller exits non-zero.
pub fn server_main(options: ServerOptions, handler: Option<ConnHandler>) -> Result<(), Error> {
    let config = match options::parse_args(&options, env::args_os()) {
        Ok(config) => config,
        Err(usage) => {
            let mut stdout = io::stdout();
            if let Some(message) = &usage.message {
                let _ = writeln!(stdout, "{}\n", message);
            }
            let _ = stdout.write_all(usage.help.as_bytes());
            let _ = stdout.flush();
            return Err(Error::Usage(
                usage.message.unwrap_or_else(|| "help requested".to_string()),
            ));
        }
    };

    serve_internal(config, handler)
}

/// Start the server with the given options, ignoring the command line.
pub fn serve(options: ServerOptions, handler: Option<ConnHandler>) -> Result<(), Error> {
    serve_internal(Config::from_options(&options, true), handler)
}

fn serve_internal(config: Config, handler: Option<ConnHandler>) -> Result<(), Error> {
    if handler.is_none() && config.exec_prog.is_none() {
        return Err(Error::MissingHandler);
    }

    // A marker in the environment means this image was exec'd to handle a
    // client connection: skip the server setup and run the challenge.
    if let Some(sock) = worker_marker()? {
        return run_challenge(handler, sock);
    }

    // Without `--listen`, run the challenge directly for local testing.
    if !config.listen {
        return run_challenge(handler, 0);
    }

    let _guard = pwnable_log::sync_logger("", pwnable_log::Config::default())
        .map_err(|err| Error::GeneralError(Box::new(err)))?;

    privilege::ensure_superuser()?;

    // Exec'd children inherit the preload variable.
    if let Some(lib) = &config.inject_lib {
        env::set_var(PRELOAD_ENV_VAR, lib);
    }

    let account = privilege::resolve_account(&config.user)?;
    debug!(
        "Workers will run as {} (uid {}, gid {}, home {})",
        account.name,
        account.uid,
        account.gid,
        account.home.display()
    );

    if config.chrooted {
        privilege::enter_jail(&account)?;
    }

    signals::install_handlers()?;

    let listener = Listener::bind(config.port)?;

    // Relocate 0/1/2 after `listen` and before the banner, so the banner
    // and all later diagnostics flow to the operator's terminal while the
    // normal slots are free for the workers.
    let saved = stdio::save_standard_streams()?;

    info!("Server PID: {}", getpid());
    info!(
        "Now accepting connections on port {} (0x{:04x})",
        listener.port(),
        listener.port()
    );

    loop {
        let conn = match listener.accept() {
            Ok(conn) => conn,
            Err(err) => {
                warn!("accept: {}", err);
                continue;
            }
        };

        match unsafe { fork() } {
            Ok(ForkResult::Parent { .. }) => {
                // The worker owns the connection now.
                drop(conn);
            }
            Ok(ForkResult::Child) => worker(&config, &account, handler, &listener, conn, &saved),
            Err(err) => {
                error!("fork: {}", err);
                return Err(Error::Fork(err));
            }
        }
    }
}

/// How a worker transfers control to the challenge.
enum Transfer {
    /// Exec a named target program.
    Exec(CString),
    /// Re-exec the server binary so the worker gets a fresh address-space
    /// layout, with the marker variable carrying the socket descriptor.
    ReExec { path: CString, argv0: CString },
    /// Call the registered handler in-process (local-testing only).
    CallThrough,
}

/// The worker side of the dispatcher.  Runs on the child side of `fork`
/// and never returns; any failure logs to the saved stderr and fast-exits.
fn worker(
    config: &Config,
    account: &Account,
    handler: Option<ConnHandler>,
    listener: &Listener,
    conn: Connection,
    saved: &stdio::SavedStdio,
) -> ! {
    // Close the listening socket first so connections cannot be hijacked.
    listener.shutdown();

    // Prevent long-running connections from hogging up the system.
    if config.time_limit_seconds > 0 {
        let _ = alarm::set(config.time_limit_seconds);
    }

    let pid = getpid();
    info!(
        "{}: [{}] Received connection from {}.",
        pid,
        timestamp(),
        conn.peer_quad()
    );

    let sock = conn.as_raw_fd();
    if let Err(err) = stdio::bind_streams_to_socket(sock) {
        error!("Failed to redirect IO to socket. {}", err);
        fast_exit();
    }

    // Only the worker drops privileges, never the listener.
    if let Err(err) = privilege::drop_privileges(account) {
        error!("{}", err);
        error!("Unable to drop privileges... Committing suicide.");
        fast_exit();
    }

    // Deployment variables must not be visible to the challenge.
    scrub_environment();

    if let Some(secret) = &config.password {
        if !password_gate(secret, pid) {
            fast_exit();
        }
    }

    // Resolve the exec target while diagnostics still have somewhere to go.
    let transfer = match &config.exec_prog {
        Some(prog) => Transfer::Exec(path_to_cstr(prog)),
        None if config.reexec_self => match reexec_target() {
            Ok((path, argv0)) => Transfer::ReExec { path, argv0 },
            Err(err) => {
                error!("Unable to locate own executable: {}", err);
                fast_exit();
            }
        },
        None => Transfer::CallThrough,
    };

    // The worker no longer needs the saved streams.
    saved.shutdown();

    match transfer {
        Transfer::Exec(path) => {
            let _ = unistd::execv(&path, &[&path]);
        }
        Transfer::ReExec { path, argv0 } => {
            // Tell the fresh image which descriptor is the client socket.
            env::set_var(ENV_MARKER, sock.to_string());
            let _ = unistd::execv(&path, &[&argv0]);
        }
        Transfer::CallThrough => match handler {
            Some(handler) => {
                stdio::unbuffer_stdio();
                handler(sock);
                unsafe { libc::_exit(libc::EXIT_SUCCESS) }
            }
            None => fast_exit(),
        },
    }

    // Control never returns from a successful exec.
    process::abort();
}

/// Worker bootstrap: unbuffer the standard streams and hand the socket
/// descriptor to the registered challenge handler.
fn run_challenge(handler: Option<ConnHandler>, sock: RawFd) -> Result<(), Error> {
    let handler = handler.ok_or(Error::MissingHandler)?;

    stdio::unbuffer_stdio();
    handler(sock);

    Ok(())
}

/// The worker marker, if this image was exec'd to serve a connection:
/// the client socket descriptor, parsed from its decimal encoding.
fn worker_marker() -> Result<Option<RawFd>, Error> {
    match env::var(ENV_MARKER) {
        Ok(value) => Ok(Some(value.parse::<u32>()? as RawFd)),
        Err(_) => Ok(None),
    }
}

/// Ask the client for the password and compare byte-exact.
///
/// The comparison is not constant time; this gates a CTF challenge, it is
/// not a secret-protection boundary.
fn password_gate(secret: &str, pid: Pid) -> bool {
    let mut stdout = io::stdout();
    let _ = write!(stdout, "Password: ");
    let _ = stdout.flush();

    let line = match read_password_line() {
        Some(line) => line,
        None => {
            let _ = writeln!(stdout, "Must enter a password.");
            let _ = stdout.flush();
            warn!("{}: No password provided.", pid);
            return false;
        }
    };

    if !password_matches(&line, secret) {
        let _ = writeln!(stdout, "Incorrect password.");
        let _ = stdout.flush();
        warn!(
            "{}: Incorrect password ({})",
            pid,
            String::from_utf8_lossy(strip_newline(&line))
        );
        return false;
    }

    info!("{}: Correct password.", pid);
    true
}

/// Read one line from the socket-bound standard input: at most 99 bytes
/// plus the newline terminator, without buffering past the line.
fn read_password_line() -> Option<ArrayVec<u8, 100>> {
    let mut line = ArrayVec::new();

    while line.len() < 99 {
        let mut byte = [0u8; 1];
        match unistd::read(libc::STDIN_FILENO, &mut byte) {
            Ok(0) => break,
            Ok(_) => {
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }

    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}

fn strip_newline(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((b'\n', rest)) => rest,
        _ => line,
    }
}

fn password_matches(line: &[u8], secret: &str) -> bool {
    strip_newline(line) == secret.as_bytes()
}

/// Remove the deployment variables the embedding environment may have set.
fn scrub_environment() {
    for var in SCRUBBED_VARS {
        env::remove_var(var);
    }
}

/// Path and argv[0] for re-exec'ing the current binary.
fn reexec_target() -> Result<(CString, CString), Error> {
    let exe = env::current_exe()?;
    let path = path_to_cstr(&exe);
    let argv0 = env::args_os()
        .next()
        .map(|arg| unsafe { CString::from_vec_unchecked(arg.into_vec()) })
        .unwrap_or_else(|| path.clone());

    Ok((path, argv0))
}

fn path_to_cstr(path: &Path) -> CString {
    let ospath = path.as_os_str().as_bytes().to_vec();
    unsafe { CString::from_vec_unchecked(ospath) }
}

/// Human timestamp in the ctime(3) layout, e.g. `Thu Nov 24 18:22:48 1986`.
fn timestamp() -> String {
    chrono::Local::now().format("%a %b %e %H:%M:%S %Y").to_string()
}

/// Immediate termination that skips library-level shutdown: the saved
/// streams may already be closed and must not be flushed again.
fn fast_exit() -> ! {
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

#[cfg(test)]
mod tests {
    use super::{
        password_matches, scrub_environment, timestamp, worker_marker, ENV_MARKER, SCRUBBED_VARS,
    };
    use crate::error::Error;
    use std::env;

    #[test]
    fn test_worker_marker() {
        env::remove_var(ENV_MARKER);
        assert!(worker_marker().unwrap().is_none());

        env::set_var(ENV_MARKER, "7");
        assert_eq!(worker_marker().unwrap(), Some(7));

        env::set_var(ENV_MARKER, "0");
        assert_eq!(worker_marker().unwrap(), Some(0));

        env::set_var(ENV_MARKER, "not-a-number");
        assert!(matches!(worker_marker(), Err(Error::InvalidMarker(_))));

        env::set_var(ENV_MARKER, "-1");
        assert!(matches!(worker_marker(), Err(Error::InvalidMarker(_))));

        env::remove_var(ENV_MARKER);
    }

    #[test]
    fn test_scrub_environment() {
        for var in SCRUBBED_VARS {
            env::set_var(var, "leaky");
        }
        env::set_var("PWNABLE_UNRELATED", "kept");

        scrub_environment();

        for var in SCRUBBED_VARS {
            assert!(env::var(var).is_err(), "{} must be scrubbed", var);
        }
        assert_eq!(env::var("PWNABLE_UNRELATED").as_deref(), Ok("kept"));
        env::remove_var("PWNABLE_UNRELATED");
    }

    #[test]
    fn test_password_matches() {
        assert!(password_matches(b"letmein\n", "letmein"));
        assert!(password_matches(b"letmein", "letmein"));
        assert!(!password_matches(b"letmein \n", "letmein"));
        assert!(!password_matches(b"LETMEIN\n", "letmein"));
        assert!(!password_matches(b"\n", "letmein"));
        assert!(password_matches(b"\n", ""));
    }

    #[test]
    fn test_timestamp_shape() {
        let stamp = timestamp();
        // ctime(3) layout is fixed-width: "Thu Nov 24 18:22:48 1986"
        assert_eq!(stamp.len(), 24);
        let year = stamp.rsplit(' ').next().unwrap();
        assert_eq!(year.len(), 4);
        assert!(year.chars().all(|c| c.is_ascii_digit()));
    }
}
