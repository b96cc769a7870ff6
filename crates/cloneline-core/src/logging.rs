//! Logging setup with indicatif integration
//!
//! TTY runs route log lines through the shared `MultiProgress` so they do
//! not tear the stage progress bars; non-TTY runs get plain labeled lines
//! suitable for log aggregation.

use indicatif::MultiProgress;

fn level_label(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN ",
        log::Level::Info => "INFO ",
        log::Level::Debug => "DEBUG",
        log::Level::Trace => "TRACE",
    }
}

fn level_color(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "\x1b[31m",
        log::Level::Warn => "\x1b[33m",
        log::Level::Info => "\x1b[32m",
        log::Level::Debug => "\x1b[36m",
        log::Level::Trace => "\x1b[35m",
    }
}

/// Logger that prints above active progress bars.
pub struct BarLogger {
    inner: env_logger::Logger,
    multi: MultiProgress,
}

impl BarLogger {
    pub fn new(inner: env_logger::Logger, multi: MultiProgress) -> Self {
        Self { inner, multi }
    }
}

impl log::Log for BarLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if self.inner.enabled(record.metadata()) {
            let line = format!(
                "[{}{}\x1b[0m] {}",
                level_color(record.level()),
                level_label(record.level()),
                record.args()
            );
            self.multi.suspend(|| eprintln!("{line}"));
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Initialize logging.
///
/// `multi` present means a TTY run: the [`BarLogger`] bridge is installed.
/// Level defaults: `warn` when quiet, `debug` when debug, `info` otherwise;
/// `RUST_LOG` overrides all of them.
pub fn init_logging(quiet: bool, debug: bool, multi: Option<&MultiProgress>) {
    use std::io::Write;

    let default_level = if debug {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let env = env_logger::Env::default().default_filter_or(default_level);

    if let Some(multi) = multi {
        let logger = env_logger::Builder::from_env(env).build();
        let max_level = logger.filter();
        log::set_boxed_logger(Box::new(BarLogger::new(logger, multi.clone())))
            .expect("failed to init logger");
        log::set_max_level(max_level);
    } else {
        env_logger::Builder::from_env(env)
            .format(|buf, record| {
                writeln!(buf, "[{}] {}", level_label(record.level()), record.args())
            })
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_fixed_width() {
        for level in [
            log::Level::Error,
            log::Level::Warn,
            log::Level::Info,
            log::Level::Debug,
            log::Level::Trace,
        ] {
            assert_eq!(level_label(level).len(), 5);
        }
    }
}
