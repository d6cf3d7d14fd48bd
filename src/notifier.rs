//! Unified logging and progress UI.
//!
//! [`Notifier`] wraps `env_logger` (text logs) and `indicatif` (spinners) under a single
//! verbosity switch:
//! - [`VerbosityLevel::Quiet`]: no text logs below warn; shows a live spinner.
//! - [`VerbosityLevel::Info`]/[`VerbosityLevel::Debug`]/[`VerbosityLevel::Trace`]: standard logs.
//!
//! Creating a notifier also installs the global logger, so `log` records emitted by the
//! library honour the same level (and `RUST_LOG`).

use env_logger::Env;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{Level, LevelFilter, Log, Record};
use parking_lot::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerbosityLevel {
    Quiet = 0, // Spinner, warnings only
    Info = 1,
    Debug = 2,
    Trace = 3,
}

impl From<u8> for VerbosityLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => VerbosityLevel::Quiet,
            1 => VerbosityLevel::Info,
            2 => VerbosityLevel::Debug,
            _ => VerbosityLevel::Trace,
        }
    }
}

impl VerbosityLevel {
    fn to_log_level(self) -> LevelFilter {
        match self {
            VerbosityLevel::Quiet => LevelFilter::Warn,
            VerbosityLevel::Info => LevelFilter::Info,
            VerbosityLevel::Debug => LevelFilter::Debug,
            VerbosityLevel::Trace => LevelFilter::Trace,
        }
    }
}

pub struct Notifier {
    verbosity: VerbosityLevel,
    logger: env_logger::Logger,
    multi_progress: Option<MultiProgress>,
    active_spinner: Mutex<Option<ProgressBar>>,
}

impl Notifier {
    pub fn new(verbosity_level: u8) -> Self {
        let verbosity = VerbosityLevel::from(verbosity_level);

        // A second init (e.g. in tests) is harmless.
        let _ = env_logger::Builder::from_env(Env::default())
            .filter_level(verbosity.to_log_level())
            .try_init();

        let logger = env_logger::Builder::from_env(Env::default())
            .filter_level(verbosity.to_log_level())
            .build();

        let multi_progress = if verbosity == VerbosityLevel::Quiet {
            Some(MultiProgress::new())
        } else {
            None
        };

        Self {
            verbosity,
            logger,
            multi_progress,
            active_spinner: Mutex::new(None),
        }
    }

    fn log(&self, level: Level, message: &str) {
        self.logger.log(
            &Record::builder()
                .args(format_args!("{}", message))
                .level(level)
                .target(module_path!())
                .build(),
        );
    }

    pub fn info(&self, message: &str) {
        match &self.multi_progress {
            Some(multi_progress) => {
                let mut spinner = self.active_spinner.lock();
                let spinner = spinner.get_or_insert_with(|| {
                    let style = ProgressStyle::default_spinner()
                        .template("{spinner:.green} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner());
                    let bar = multi_progress.add(ProgressBar::new_spinner());
                    bar.set_style(style);
                    bar.enable_steady_tick(Duration::from_millis(100));
                    bar
                });
                spinner.set_message(message.to_string());
            }
            None => self.log(Level::Info, message),
        }
    }

    pub fn debug(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            self.log(Level::Debug, message);
        }
    }

    pub fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    /// Clears the spinner and prints a result line on stdout.
    pub fn success(&self, message: &str) {
        self.finish();
        println!("{}", message);
    }

    pub fn finish(&self) {
        if let Some(spinner) = self.active_spinner.lock().take() {
            spinner.finish_and_clear();
        }
    }

    pub fn verbosity_level(&self) -> VerbosityLevel {
        self.verbosity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_from_count() {
        assert_eq!(VerbosityLevel::from(0), VerbosityLevel::Quiet);
        assert_eq!(VerbosityLevel::from(2), VerbosityLevel::Debug);
        assert_eq!(VerbosityLevel::from(9), VerbosityLevel::Trace);
        assert_eq!(VerbosityLevel::Quiet.to_log_level(), LevelFilter::Warn);
    }

    #[test]
    fn test_quiet_mode_uses_spinner() {
        let quiet = Notifier::new(0);
        quiet.info("working");
        assert!(quiet.active_spinner.lock().is_some());
        quiet.finish();
        assert!(quiet.active_spinner.lock().is_none());

        let verbose = Notifier::new(1);
        verbose.info("working");
        assert!(verbose.active_spinner.lock().is_none());
    }
}
