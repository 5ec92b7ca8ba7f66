//! Fatal diagnostics: the single termination entry point for this crate.
//!
//! A violated precondition or a failed native call has no well-defined
//! recovery in a GPU resource layer, so both are treated identically: log a
//! diagnostic with the caller's source location, then panic. Tests intercept
//! the panic with `#[should_panic]` instead of crashing the test process.

use std::fmt;

/// Log the message at error level with the caller's location, then panic.
#[track_caller]
pub(crate) fn die(args: fmt::Arguments<'_>) -> ! {
    let loc = std::panic::Location::caller();
    tracing::error!("fatal error at {}:{}: {}", loc.file(), loc.line(), args);
    panic!("{}", args);
}

/// Terminate with a formatted diagnostic.
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::fail::die(core::format_args!($($arg)*))
    };
}

/// Terminate with a formatted diagnostic unless the condition holds.
macro_rules! ensure_or_die {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::fail::die(core::format_args!($($arg)*));
        }
    };
}

pub(crate) use {ensure_or_die, fatal};
