use crate::error::{CommonError, CommonResult};
use crate::settings::LoggingSettings;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{subscriber::set_global_default, Level};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    filter::DynFilterFn,
    fmt::{self},
    layer::SubscriberExt,
    Layer, Registry,
};

/// Console + rolling-file logger with a level that can be changed at runtime.
pub struct Logger {
    level: Arc<Mutex<Level>>,
    directory: String,
    file_prefix: String,
    to_file: bool,
    _file_guard: Option<WorkerGuard>,
}

impl Logger {
    pub fn new(level: Option<Level>) -> Self {
        Logger {
            level: Arc::new(Mutex::new(level.unwrap_or(Level::INFO))),
            directory: "logs".into(),
            file_prefix: "plcwire.log".into(),
            to_file: true,
            _file_guard: None,
        }
    }

    pub fn from_settings(settings: &LoggingSettings) -> CommonResult<Self> {
        let level = settings
            .level
            .parse::<Level>()
            .map_err(|_| CommonError::InvalidLogLevel(settings.level.clone()))?;
        let mut logger = Logger::new(Some(level));
        logger.directory = settings.directory.clone();
        logger.file_prefix = settings.file_prefix.clone();
        logger.to_file = settings.to_file;
        Ok(logger)
    }

    /// Sets the new logging level. Takes effect for the next event.
    #[inline]
    pub fn set_level(&self, new_level: Level) {
        let mut level = self.level.lock().unwrap_or_else(PoisonError::into_inner);
        *level = new_level;
    }

    #[inline]
    pub fn get_level(&self) -> Level {
        *self.level.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs the global subscriber: stdout always, plus a daily rolling
    /// file when enabled. Must be called once per process.
    pub fn initialize(&mut self) -> CommonResult<()> {
        let console_filter = {
            let level = Arc::clone(&self.level);
            DynFilterFn::new(move |metadata, _| {
                metadata.level() <= &*level.lock().unwrap_or_else(PoisonError::into_inner)
            })
        };
        let file_filter = {
            let level = Arc::clone(&self.level);
            DynFilterFn::new(move |metadata, _| {
                metadata.level() <= &*level.lock().unwrap_or_else(PoisonError::into_inner)
            })
        };

        let console_layer = {
            #[cfg(debug_assertions)]
            let layer = fmt::layer()
                .pretty()
                .with_writer(std::io::stdout)
                .with_file(true)
                .with_line_number(true);

            #[cfg(not(debug_assertions))]
            let layer = fmt::layer()
                .with_writer(std::io::stdout)
                .with_file(false)
                .with_line_number(false);

            layer.with_filter(console_filter)
        };

        let file_layer = if self.to_file {
            let file_appender = rolling::daily(&self.directory, &self.file_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            self._file_guard = Some(guard);
            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true)
                    .with_filter(file_filter),
            )
        } else {
            None
        };

        let subscriber = Registry::default().with(console_layer).with(file_layer);
        set_global_default(subscriber).map_err(|e| CommonError::Logger(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_is_adjustable() {
        let logger = Logger::new(None);
        assert_eq!(logger.get_level(), Level::INFO);
        logger.set_level(Level::TRACE);
        assert_eq!(logger.get_level(), Level::TRACE);
    }

    #[test]
    fn rejects_unknown_level() {
        let settings = LoggingSettings {
            level: "loud".into(),
            ..Default::default()
        };
        assert!(matches!(
            Logger::from_settings(&settings),
            Err(CommonError::InvalidLogLevel(_))
        ));
    }
}
