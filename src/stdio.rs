//! Relocation of the standard streams.
//!
//! Before the accept loop starts, the listener moves descriptors 0/1/2 to
//! fresh slots kept open for operator-visible logging, so the normal
//! numbers are free to be reassigned to the client socket in each worker.

use crate::{error::Error, net::Fd};
use nix::unistd::{close, dup, dup2};
use std::{
    fs::File,
    os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd},
    ptr,
};

/// The listener's original standard streams, duplicated away from
/// descriptors 0/1/2 and held open for logging.
#[derive(Debug)]
pub struct SavedStdio {
    stdin: File,
    stdout: File,
    stderr: File,
}

impl SavedStdio {
    /// Forcefully close the saved streams without dropping them.
    ///
    /// Used by workers just before transferring control to the challenge,
    /// where the owning stack frame diverges into `exec` and `Drop` never
    /// runs.  Log output is discarded first so nothing writes to a closed
    /// or recycled descriptor.
    pub fn shutdown(&self) {
        pwnable_log::set_output_fd(-1);
        let _ = close(self.stdin.as_raw_fd());
        let _ = close(self.stdout.as_raw_fd());
        let _ = close(self.stderr.as_raw_fd());
    }
}

/// Duplicate descriptors 0/1/2 to new slots, wrap the duplicates as owned
/// handles, and close the original slots.
///
/// Called once in the listener, after `listen` and before the banner is
/// printed.  On failure the duplicates made so far are closed again and
/// the original descriptors are left untouched.
pub fn save_standard_streams() -> Result<SavedStdio, Error> {
    let saved_stdin = dup(libc::STDIN_FILENO)
        .map(Fd::from)
        .map_err(|err| Error::StdioRelocation("dup(stdin)", err))?;
    let saved_stdout = dup(libc::STDOUT_FILENO)
        .map(Fd::from)
        .map_err(|err| Error::StdioRelocation("dup(stdout)", err))?;
    let saved_stderr = dup(libc::STDERR_FILENO)
        .map(Fd::from)
        .map_err(|err| Error::StdioRelocation("dup(stderr)", err))?;

    // Free the normal slots for the per-worker socket redirection.
    let _ = close(libc::STDIN_FILENO);
    let _ = close(libc::STDOUT_FILENO);
    let _ = close(libc::STDERR_FILENO);

    // From here on, diagnostics go to the saved stderr.
    pwnable_log::set_output_fd(saved_stderr.as_raw_fd());

    Ok(SavedStdio {
        stdin: unsafe { File::from_raw_fd(saved_stdin.into_raw_fd()) },
        stdout: unsafe { File::from_raw_fd(saved_stdout.into_raw_fd()) },
        stderr: unsafe { File::from_raw_fd(saved_stderr.into_raw_fd()) },
    })
}

/// Duplicate the connected socket onto descriptors 0, 1, and 2.
///
/// Called in each worker after `fork`, before the privilege drop.  On
/// failure the descriptors already redirected are closed again.
pub fn bind_streams_to_socket(sock: RawFd) -> Result<(), Error> {
    dup2(sock, libc::STDIN_FILENO).map_err(|err| Error::StdioRedirect("dup2(stdin)", err))?;

    if let Err(err) = dup2(sock, libc::STDOUT_FILENO) {
        let _ = close(libc::STDIN_FILENO);
        return Err(Error::StdioRedirect("dup2(stdout)", err));
    }

    if let Err(err) = dup2(sock, libc::STDERR_FILENO) {
        let _ = close(libc::STDIN_FILENO);
        let _ = close(libc::STDOUT_FILENO);
        return Err(Error::StdioRedirect("dup2(stderr)", err));
    }

    Ok(())
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "ios", target_os = "macos"))] {
        extern "C" {
            #[link_name = "__stdoutp"]
            static mut C_STDOUT: *mut libc::FILE;
            #[link_name = "__stderrp"]
            static mut C_STDERR: *mut libc::FILE;
        }
    } else {
        extern "C" {
            #[link_name = "stdout"]
            static mut C_STDOUT: *mut libc::FILE;
            #[link_name = "stderr"]
            static mut C_STDERR: *mut libc::FILE;
        }
    }
}

/// Disable buffering on the C standard output streams.
///
/// Challenge code, whether exec'd or linked in, writes to the socket
/// through stdio; output must not sit in a buffer while the client waits.
pub fn unbuffer_stdio() {
    unsafe {
        libc::setvbuf(C_STDOUT, ptr::null_mut(), libc::_IONBF, 0);
        libc::setvbuf(C_STDERR, ptr::null_mut(), libc::_IONBF, 0);
    }
}
