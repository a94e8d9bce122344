//! Logging setup for applications embedding the back-calculation engine.
//!
//! The library itself only emits `tracing` events (noise reports and run summaries at
//! INFO, solver tables at DEBUG). Hosts that do not install their own subscriber can call
//! [`init_logger`] once at startup.

use tracing::Level;

/// Error returned when a global subscriber has already been installed.
pub type LoggerInitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Initialize the tracing subscriber with the default INFO level.
///
/// Format: `[LEVEL YYYY-MM-DD HH:MM:SS.mmm target] message`, with `file:line` in place
/// of the target for DEBUG/TRACE events.
///
/// ```no_run
/// use pavement_backcalc::init_logger;
///
/// init_logger();
/// tracing::info!("Back-calculation service started");
/// ```
///
/// Override the level with `RUST_LOG`, e.g. `RUST_LOG=pavement_backcalc=debug` to see
/// the per-iteration trust-region table.
///
/// Panics if a global subscriber is already set; use [`try_init_logger_with_level`]
/// when that can happen.
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level (overridable via `RUST_LOG`).
pub fn init_logger_with_level(default_level: Level) {
    if let Err(e) = try_init_logger_with_level(default_level) {
        panic!("failed to install tracing subscriber: {e}");
    }
}

/// Fallible variant of [`init_logger_with_level`].
pub fn try_init_logger_with_level(default_level: Level) -> Result<(), LoggerInitError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .event_format(BracketFormatter)
        .try_init()
}

/// Event formatter producing bracketed, colored prefixes.
struct BracketFormatter;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for BracketFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        use chrono::Local;

        let metadata = event.metadata();
        let level = *metadata.level();

        let colored_level = match level {
            Level::ERROR => "\x1b[31mERROR\x1b[0m",
            Level::WARN => "\x1b[33mWARN\x1b[0m",
            Level::INFO => "\x1b[32mINFO\x1b[0m",
            Level::DEBUG => "\x1b[34mDEBUG\x1b[0m",
            Level::TRACE => "\x1b[35mTRACE\x1b[0m",
        };
        write!(
            writer,
            "[{} {} ",
            colored_level,
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
        )?;

        match (level, metadata.file(), metadata.line()) {
            (Level::DEBUG | Level::TRACE, Some(file), Some(line)) => {
                let filename = file.rsplit('/').next().unwrap_or(file);
                write!(writer, "{}:{}", filename, line)?;
            }
            _ => write!(writer, "{}", metadata.target())?,
        }

        write!(writer, "] ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
