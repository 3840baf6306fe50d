use crate::{Error, Result};
use log::{debug, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::{Config, Handle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

const LOG_FORMAT_CONSOLE: &str = "\x1B[37m{d(%Y-%m-%d %H:%M:%S%.3f)}\x1B[0m {h({l:>5.5})} \x1B[37m[{T:>15.15}]\x1B[0m \x1B[36m{t:<40.40}\x1B[0m \x1B[37m:\x1B[0m {m}{n}";
const LOG_FORMAT_FILE: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} {l:>5.5} [{T:>15.15}] {t:<40.40} : {m}{n}";
const CONSOLE_APPENDER: &str = "stdout";
const FILE_APPENDER: &str = "file";
const LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;
const LOG_FILE_WINDOW: u32 = 3;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// The process wide logger of the FX announce binaries.
/// Only one logger can be initialized during the lifetime of the process.
#[derive(Debug)]
pub struct FxLogger {
    handle: Handle,
}

impl FxLogger {
    pub fn builder() -> FxLoggerBuilder {
        FxLoggerBuilder::default()
    }

    /// Returns the root logging level of the logger.
    pub fn root_level(&self) -> LevelFilter {
        self.handle.max_log_level()
    }

    fn init(
        root_level: LevelFilter,
        log_file: Option<PathBuf>,
        loggers: Vec<(String, LevelFilter)>,
    ) -> Result<Self> {
        if INITIALIZED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyInitialized);
        }

        let config = Self::create_config(root_level, log_file.as_deref(), loggers)?;
        let handle =
            log4rs::init_config(config).map_err(|e| Error::InvalidConfig(e.to_string()))?;

        debug!("FX announce logger has been initialized");
        Ok(Self { handle })
    }

    fn create_config(
        root_level: LevelFilter,
        log_file: Option<&Path>,
        loggers: Vec<(String, LevelFilter)>,
    ) -> Result<Config> {
        let mut root = Root::builder().appender(CONSOLE_APPENDER);
        let mut builder = Config::builder().appender(Appender::builder().build(
            CONSOLE_APPENDER,
            Box::new(
                ConsoleAppender::builder()
                    .encoder(Box::new(PatternEncoder::new(LOG_FORMAT_CONSOLE)))
                    .build(),
            ),
        ));

        if let Some(path) = log_file {
            builder = builder.appender(Self::create_file_appender(path)?);
            root = root.appender(FILE_APPENDER);
        }

        builder = builder.loggers(
            loggers
                .into_iter()
                .map(|(target, level)| Logger::builder().build(target, level)),
        );

        builder
            .build(root.build(root_level))
            .map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    fn create_file_appender(path: &Path) -> Result<Appender> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let pattern = path.with_extension("{}.log");
        let roller = FixedWindowRoller::builder()
            .base(1)
            .build(pattern.to_string_lossy().as_ref(), LOG_FILE_WINDOW)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let policy = CompoundPolicy::new(
            Box::new(SizeTrigger::new(LOG_FILE_SIZE)),
            Box::new(roller),
        );
        let appender = RollingFileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_FORMAT_FILE)))
            .append(false)
            .build(path, Box::new(policy))?;

        Ok(Appender::builder().build(FILE_APPENDER, Box::new(appender)))
    }
}

#[derive(Debug, Default)]
pub struct FxLoggerBuilder {
    root_level: Option<LevelFilter>,
    log_file: Option<PathBuf>,
    loggers: Vec<(String, LevelFilter)>,
}

impl FxLoggerBuilder {
    /// Set the level of all targets without a specific filter.
    pub fn root_level(&mut self, level: LevelFilter) -> &mut Self {
        self.root_level = Some(level);
        self
    }

    /// Also write the log output to the given file, rolled over once it grows too large.
    pub fn log_file(&mut self, path: impl AsRef<Path>) -> &mut Self {
        self.log_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the level filter of the given log target.
    pub fn logger<S: AsRef<str>>(&mut self, target: S, level: LevelFilter) -> &mut Self {
        self.loggers.retain(|(e, _)| e != target.as_ref());
        self.loggers.push((target.as_ref().to_string(), level));
        self
    }

    /// Initialize the process wide logger.
    ///
    /// # Returns
    ///
    /// It returns [Error::AlreadyInitialized] when a logger has already been initialized.
    pub fn build(&mut self) -> Result<FxLogger> {
        let root_level = self.root_level.take().unwrap_or(LevelFilter::Info);
        let log_file = self.log_file.take();
        let loggers = std::mem::take(&mut self.loggers);

        FxLogger::init(root_level, log_file, loggers)
    }
}
