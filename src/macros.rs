//! General purpose macros for text output.
//!
//! The file system is a library; it does not own a console. Hosts that want
//! operational logging install a sink with [`set_log_sink`], and the `info!`
//! and `error!` macros forward through it. Without a sink the macros are
//! no-ops.

use conquer_once::spin::OnceCell;
use core::fmt::Arguments;

/// Severity attached to a log record handed to the sink.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Info,
    Error,
}

/// Host-provided log sink: `(level, context, message)`.
pub type LogSink = fn(LogLevel, &str, &Arguments);

static LOG_SINK: OnceCell<LogSink> = OnceCell::uninit();

/// Installs the process-wide log sink.
///
/// May only be called once; later calls are ignored.
pub fn set_log_sink(sink: LogSink) {
    let _ = LOG_SINK.try_init_once(|| sink);
}

#[doc(hidden)]
pub fn __dispatch(level: LogLevel, ctx: &str, args: &Arguments) {
    if let Some(sink) = LOG_SINK.get() {
        sink(level, ctx, args);
    }
}

/// Prints a standard information message to the installed sink.
///
/// You can specify a 'context' as the first argument when calling the macro,
/// which will be handed to the sink alongside the message.
///
/// # Examples
///
/// ```
/// use fzfs::info;
///
/// info!("fzfs", "mounted file system");
/// ```
#[macro_export]
macro_rules! info {
    ($ctx: literal, $($arg: tt)*) => {
        $crate::macros::__dispatch(
            $crate::macros::LogLevel::Info,
            $ctx,
            &format_args!($($arg)*),
        )
    };
    ($($arg: tt)*) => {
        $crate::macros::__dispatch(
            $crate::macros::LogLevel::Info,
            "",
            &format_args!($($arg)*),
        )
    };
}

/// Prints a standard error message to the installed sink.
///
/// You can specify a 'context' as the first argument when calling the macro,
/// which will be handed to the sink alongside the message.
#[macro_export]
macro_rules! error {
    ($ctx: literal, $($arg: tt)*) => {
        $crate::macros::__dispatch(
            $crate::macros::LogLevel::Error,
            $ctx,
            &format_args!($($arg)*),
        )
    };
    ($($arg: tt)*) => {
        $crate::macros::__dispatch(
            $crate::macros::LogLevel::Error,
            "",
            &format_args!($($arg)*),
        )
    };
}
