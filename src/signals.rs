//! Signal handling for the listener: child reaping and clean termination.

use crate::error::Error;
use nix::sys::signal::{signal, SigHandler, Signal};

/// Written from the SIGTERM handler; only async-signal-safe calls are
/// allowed there.
static TERM_MESSAGE: &[u8] = b"Got SIGTERM, exiting...\n";

extern "C" fn handle_term(signum: libc::c_int) {
    let fd = pwnable_log::output_fd();
    if fd >= 0 {
        unsafe {
            libc::write(
                fd,
                TERM_MESSAGE.as_ptr() as *const libc::c_void,
                TERM_MESSAGE.len(),
            );
        }
    }
    unsafe { libc::_exit(signum) }
}

/// Install the listener's signal handlers.
///
/// Dead children are ignored so the kernel reaps them and they never turn
/// into zombies; the listener itself calls no `wait`.  SIGTERM exits with
/// the signal number as status, so that container stops reach a listener
/// running as PID 1 instead of leaving a stuck process.
pub fn install_handlers() -> Result<(), Error> {
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) }?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(handle_term)) }?;

    Ok(())
}
