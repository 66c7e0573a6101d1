//! Logging setup for the binaries and benchmarks.
//!
//! The library only emits `tracing` events. Applications that want them on stderr call
//! [`init_logger`] once at startup; `RUST_LOG` overrides the default level, e.g.
//! `RUST_LOG=lsq_solver=debug` shows the solver configuration and reduction details.

use std::fmt;

use chrono::Local;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    EnvFilter,
    fmt::{FmtContext, FormatEvent, FormatFields, format::Writer},
    registry::LookupSpan,
};

/// Install the global subscriber at INFO.
///
/// ```no_run
/// lsq_solver::init_logger();
/// tracing::info!("solving");
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Install the global subscriber with `default_level` unless `RUST_LOG` says otherwise.
///
/// Does nothing when a global subscriber is already installed.
pub fn init_logger_with_level(default_level: Level) {
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(SolverFormat {
            colored: std::env::var_os("NO_COLOR").is_none(),
        })
        .try_init();
    if installed.is_err() {
        tracing::debug!("A global tracing subscriber is already installed");
    }
}

/// `[LEVEL HH:MM:SS.mmm target] message`, with `file:line` instead of the target for
/// DEBUG and TRACE events.
struct SolverFormat {
    colored: bool,
}

impl SolverFormat {
    fn level_label(&self, level: Level) -> (&'static str, &'static str) {
        let color = match level {
            Level::ERROR => "\x1b[31m",
            Level::WARN => "\x1b[33m",
            Level::INFO => "\x1b[32m",
            Level::DEBUG => "\x1b[34m",
            Level::TRACE => "\x1b[35m",
        };
        (if self.colored { color } else { "" }, if self.colored { "\x1b[0m" } else { "" })
    }
}

impl<S, N> FormatEvent<S, N> for SolverFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let level = *metadata.level();
        let (start, end) = self.level_label(level);
        write!(
            writer,
            "[{start}{level:<5}{end} {} ",
            Local::now().format("%H:%M:%S%.3f")
        )?;

        let verbose = level == Level::DEBUG || level == Level::TRACE;
        match (verbose, metadata.file(), metadata.line()) {
            (true, Some(file), Some(line)) => {
                let file = file.rsplit('/').next().unwrap_or(file);
                write!(writer, "{file}:{line}")?;
            }
            _ => write!(writer, "{}", metadata.target())?,
        }
        write!(writer, "] ")?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
