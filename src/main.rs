//! Standalone server binary: serves an arbitrary program given with
//! `--exec`, since no connection handler is compiled in.

use pwnable_harness::{server_main, Error, ServerOptions};
use std::{
    io::{self, Write},
    process,
};

fn main() {
    // These will likely all be overridden by the passed arguments.
    let options = ServerOptions::default();

    match server_main(options, None) {
        Ok(()) => {}
        // The usage block has already been printed to stdout.
        Err(Error::Usage(_)) => process::exit(1),
        Err(err) => {
            // Descriptor 2 is gone once the streams have been relocated;
            // late errors were already logged to the saved stderr.
            let _ = writeln!(io::stderr(), "Error: {}", err);
            process::exit(1);
        }
    }
}
