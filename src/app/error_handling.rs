//! Centralized fatal-error handling.
//!
//! The session supervisor draws a hard line between errors that are
//! surfaced to a caller (validation, not-found) and ones that end the
//! process (the CLI itself has nowhere further to propagate to). This is
//! that boundary.

use tracing::error;

use crate::Error;

/// Map a top-level error to an exit code and print it, then exit.
///
/// Exit code `1` for user errors, `2` for internal errors. `0` (success)
/// never reaches this path.
pub fn handle_fatal_error(err: Error, verbose: u8) -> ! {
    error!("fatal error: {err}");

    let exit_code = match &err {
        Error::Validation(_) | Error::NotFound(_) | Error::AmbiguousSessionId(_, _) => {
            eprintln!("Error: {err}");
            1
        }
        _ => {
            eprintln!("Error: {err}");
            2
        }
    };

    if verbose >= 1 {
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
    }

    std::process::exit(exit_code)
}
