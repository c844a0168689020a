//! Forking TCP front-end harness for pwnable CTF challenges.
//!
//! Challenge authors write an ordinary terminal program that reads from
//! standard input and writes to standard output; this crate makes it serve
//! the network.  A privileged listener binds a TCP port and, for every
//! accepted connection, forks a worker that closes the listening socket,
//! arms a wall-clock alarm, binds the client socket to descriptors 0/1/2,
//! drops to an unprivileged account (optionally inside a chroot of that
//! account's home directory), scrubs deployment variables from the
//! environment, optionally enforces a plaintext password gate, and then
//! transfers control to the challenge.
//!
//! By default control transfer re-execs the server binary itself so every
//! worker gets an independently randomized address space; the fresh image
//! recognizes itself as a worker through the `PWNABLE_CONNECTION`
//! environment variable, which carries the inherited socket descriptor.
//! Alternatively a target program can be exec'd (`--exec`), or the
//! registered handler can be called in-process for local testing.
//!
//! Server diagnostics never reach the socket: before the accept loop
//! starts the listener moves its original standard streams to saved
//! descriptors and all logging flows there.
//!
//! # Examples
//!
//! ```ignore
//! use pwnable_harness::{server_main, ServerOptions};
//! use std::os::unix::io::RawFd;
//!
//! fn challenge(_sock: RawFd) {
//!     println!("What is your name?");
//!     let mut name = String::new();
//!     if std::io::stdin().read_line(&mut name).is_ok() {
//!         println!("Hello, {}!", name.trim_end());
//!     }
//! }
//!
//! fn main() {
//!     let options = ServerOptions {
//!         port: 32101,
//!         time_limit_seconds: 30,
//!         ..Default::default()
//!     };
//!
//!     if let Err(err) = server_main(options, Some(challenge)) {
//!         eprintln!("Error: {}", err);
//!         std::process::exit(1);
//!     }
//! }
//! ```

mod error;
mod net;
mod options;
mod privilege;
mod server;
mod signals;
mod stdio;

pub use {
    error::Error,
    options::ServerOptions,
    server::{serve, server_main, ConnHandler, ENV_MARKER},
};
