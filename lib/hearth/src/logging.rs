//! Thin facade over `slog` so the rest of the workspace has a single
//! logging import. Components take `Into<Option<&Logger>>` in their
//! constructors and fall back to `Discard`, keeping tests quiet.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the root terminal logger. The verbosity level maps onto log
/// severities the same way the daemon's `-v` flags do: 0 info, 1 debug,
/// 2+ trace.
pub fn init(verbosity: u8) -> Logger {
    let severity = match verbosity {
        0 => Severity::Info,
        1 => Severity::Debug,
        _ => Severity::Trace,
    };

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(Destination::Stderr);

    builder.build().expect("Error building terminal logger")
}

/// A root logger that swallows everything.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
