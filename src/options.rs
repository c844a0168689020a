//! Server configuration: embedder-supplied defaults and the command-line
//! surface that overrides them.

use clap::{error::ErrorKind, value_parser, Arg, ArgAction, Command};
use std::{
    borrow::Cow,
    ffi::OsString,
    path::{Path, PathBuf},
};

/// Options given to the server to change how it runs.
///
/// These are the embedder's defaults; `server_main` lets the command line
/// override them.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Name of the account used to run child processes.
    pub user: Cow<'static, str>,
    /// True if the server should run within a chroot.
    pub chrooted: bool,
    /// Port bound for receiving incoming connections.
    pub port: u16,
    /// Max number of seconds a child process may run, or 0 to disable.
    pub time_limit_seconds: u32,
    /// Re-exec the server binary for each connection so every worker gets
    /// a fresh address-space layout.  Disabling this calls the registered
    /// handler in-process; that path is a local-testing convenience and is
    /// not reachable from the command line.
    pub reexec_self: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            user: Cow::Borrowed("nobody"),
            chrooted: false,
            port: 65001,
            time_limit_seconds: 0,
            reexec_self: true,
        }
    }
}

/// Fully resolved runtime configuration.
#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub user: String,
    pub chrooted: bool,
    pub port: u16,
    pub time_limit_seconds: u32,
    pub listen: bool,
    pub inject_lib: Option<PathBuf>,
    pub exec_prog: Option<PathBuf>,
    pub password: Option<String>,
    pub reexec_self: bool,
}

impl Config {
    /// Configuration for the argument-less `serve` entry point.
    pub fn from_options(options: &ServerOptions, listen: bool) -> Self {
        Self {
            user: options.user.to_string(),
            chrooted: options.chrooted,
            port: options.port,
            time_limit_seconds: options.time_limit_seconds,
            listen,
            inject_lib: None,
            exec_prog: None,
            password: None,
            reexec_self: options.reexec_self,
        }
    }
}

/// A parse failure or an explicit help request.  The help text goes to
/// standard output and the process exits non-zero.
#[derive(Debug)]
pub(crate) struct Usage {
    /// The offending argument, if any; absent for `-h`/`--help`.
    pub message: Option<String>,
    /// The rendered usage block, with the current defaults.
    pub help: String,
}

/// The command-line surface, with defaults taken from the embedder's
/// options so the help text shows what actually applies.
fn command(name: &str, defaults: &ServerOptions) -> Command {
    Command::new(name.to_string())
        .about("Forking TCP server harness for pwnable challenges")
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .action(ArgAction::SetTrue)
                .help("Run the server and listen for incoming connections"),
        )
        .arg(
            Arg::new("alarm")
                .short('a')
                .long("alarm")
                .value_name("seconds")
                .value_parser(value_parser!(u32))
                .default_value(defaults.time_limit_seconds.to_string())
                .help("Time limit for child processes to run, or 0 to disable"),
        )
        .arg(
            Arg::new("no-chroot")
                .long("no-chroot")
                .action(ArgAction::SetTrue)
                .help("Prevent the server from entering a chroot and changing directory"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("port")
                .value_parser(value_parser!(u16))
                .default_value(defaults.port.to_string())
                .help("Set the port the server listens on for incoming connections"),
        )
        .arg(
            Arg::new("user")
                .short('u')
                .long("user")
                .value_name("user")
                .default_value(defaults.user.to_string())
                .help("Name of the user that child processes should run as"),
        )
        .arg(
            Arg::new("inject")
                .short('i')
                .long("inject")
                .value_name("dynamic-library")
                .value_parser(value_parser!(PathBuf))
                .help("Path to a dynamic library that should be injected into the target process"),
        )
        .arg(
            Arg::new("exec")
                .short('e')
                .long("exec")
                .value_name("program")
                .value_parser(value_parser!(PathBuf))
                .help("Program to execute upon receiving a connection"),
        )
        .arg(
            Arg::new("password")
                .short('k')
                .long("password")
                .value_name("password")
                .help("Require that clients enter the provided password after connecting, or '_' to disable"),
        )
}

/// Parse an argument vector against the embedder's defaults.
pub(crate) fn parse_args<I, T>(defaults: &ServerOptions, argv: I) -> Result<Config, Usage>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let argv: Vec<OsString> = argv.into_iter().map(Into::into).collect();
    let name = argv
        .first()
        .and_then(|arg| Path::new(arg).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "pwnable-server".to_string());

    let mut cmd = command(&name, defaults);

    let matches = match cmd.clone().try_get_matches_from(argv) {
        Ok(matches) => matches,
        Err(err) => {
            let message = match err.kind() {
                ErrorKind::DisplayHelp => None,
                _ => Some(
                    err.to_string()
                        .lines()
                        .next()
                        .unwrap_or("invalid arguments")
                        .to_string(),
                ),
            };
            return Err(Usage {
                message,
                help: cmd.render_help().to_string(),
            });
        }
    };

    Ok(Config {
        user: matches
            .get_one::<String>("user")
            .cloned()
            .unwrap_or_else(|| defaults.user.to_string()),
        chrooted: defaults.chrooted && !matches.get_flag("no-chroot"),
        port: matches
            .get_one::<u16>("port")
            .copied()
            .unwrap_or(defaults.port),
        time_limit_seconds: matches
            .get_one::<u32>("alarm")
            .copied()
            .unwrap_or(defaults.time_limit_seconds),
        listen: matches.get_flag("listen"),
        inject_lib: matches.get_one::<PathBuf>("inject").cloned(),
        exec_prog: matches.get_one::<PathBuf>("exec").cloned(),
        password: matches
            .get_one::<String>("password")
            .cloned()
            .filter(|password| password != "_"),
        reexec_self: defaults.reexec_self,
    })
}
