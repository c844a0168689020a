//! Error definitions

use derive_more::{Display, From};
use std::{borrow::Cow, io, num};

/// Common errors of the `pwnable-harness` crate.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "I/O error: {}", "_0")]
    IoError(io::Error),
    #[display(fmt = "{}", "_0")]
    UnixError(nix::Error),
    #[display(fmt = "Permission denied, must run as root")]
    PermissionDenied,
    #[display(fmt = "Couldn't find user '{}'", "_0")]
    #[from(ignore)]
    UserNotFound(Cow<'static, str>),
    #[display(fmt = "Failed to enter chroot jail ({}) - {}", "_0", "_1")]
    #[from(ignore)]
    Jail(&'static str, nix::Error),
    #[display(fmt = "Failed to drop privileges ({}) - {}", "_0", "_1")]
    Privdrop(&'static str, Box<dyn std::error::Error>),
    #[display(fmt = "Failed to set up listener ({}) - {}", "_0", "_1")]
    #[from(ignore)]
    ListenerSetup(&'static str, nix::Error),
    #[display(fmt = "Failed to move standard streams ({}) - {}", "_0", "_1")]
    #[from(ignore)]
    StdioRelocation(&'static str, nix::Error),
    #[display(fmt = "Failed to redirect standard streams ({}) - {}", "_0", "_1")]
    #[from(ignore)]
    StdioRedirect(&'static str, nix::Error),
    #[display(fmt = "Invalid connection marker: {}", "_0")]
    InvalidMarker(num::ParseIntError),
    #[display(fmt = "Failed to fork connection handler - {}", "_0")]
    #[from(ignore)]
    Fork(nix::Error),
    #[display(fmt = "{}", "_0")]
    #[from(ignore)]
    Usage(String),
    #[display(fmt = "No connection handler and no program to exec was provided")]
    MissingHandler,
    #[display(fmt = "General error: {}", "_0")]
    GeneralError(Box<dyn std::error::Error>),
}

impl std::error::Error for Error {}
