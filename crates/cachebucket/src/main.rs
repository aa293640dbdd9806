//! cachebucket.
//!
//! cachebucket is a `GOCACHEPROG` program for the Go toolchain. It keeps build outputs in a local
//! disk cache and shares them with other machines through an object store bucket.
//!
//! Stdout is reserved for the protocol, everything else goes to stderr.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
