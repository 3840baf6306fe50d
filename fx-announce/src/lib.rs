/// The current version of the FX announce client.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod announce;

#[cfg(feature = "testing")]
pub mod testing {
    use log::LevelFilter;
    use log4rs::append::console::ConsoleAppender;
    use log4rs::config::{Appender, Logger, Root};
    use log4rs::encode::pattern::PatternEncoder;
    use log4rs::Config;
    use std::sync::Once;

    static INIT: Once = Once::new();

    /// Initializes the logger with the specified log level.
    #[macro_export]
    macro_rules! init_logger {
        ($level:expr) => {
            $crate::testing::init_logger_level($level)
        };
        () => {
            $crate::testing::init_logger_level(log::LevelFilter::Trace)
        };
    }

    /// Initializes the logger with the specified log level.
    pub fn init_logger_level(level: LevelFilter) {
        INIT.call_once(|| {
            log4rs::init_config(Config::builder()
                .appender(Appender::builder().build("stdout", Box::new(ConsoleAppender::builder()
                    .encoder(Box::new(PatternEncoder::new("\x1B[37m{d(%Y-%m-%d %H:%M:%S%.3f)}\x1B[0m {h({l:>5.5})} \x1B[35m{I:>6.6}\x1B[0m \x1B[37m---\x1B[0m \x1B[37m[{T:>15.15}]\x1B[0m \x1B[36m{t:<60.60}\x1B[0m \x1B[37m:\x1B[0m {m}{n}")))
                    .build())))
                .logger(Logger::builder().build("httpmock", LevelFilter::Info))
                .logger(Logger::builder().build("hyper", LevelFilter::Info))
                .logger(Logger::builder().build("hyper_util", LevelFilter::Info))
                .logger(Logger::builder().build("mio", LevelFilter::Info))
                .logger(Logger::builder().build("reqwest", LevelFilter::Info))
                .logger(Logger::builder().build("rustls", LevelFilter::Info))
                .logger(Logger::builder().build("tracing", LevelFilter::Info))
                .logger(Logger::builder().build("want", LevelFilter::Info))
                .build(Root::builder().appender("stdout").build(level))
                .unwrap())
                .unwrap();
        })
    }

    /// Await the given future, or panic if it doesn't complete within the given duration.
    #[macro_export]
    macro_rules! timeout {
        ($future:expr, $duration:expr) => {{
            $crate::timeout!(
                $future,
                $duration,
                format!(
                    "operation timed-out after {}.{:03}s",
                    ($duration).as_secs(),
                    ($duration).subsec_millis()
                )
            )
        }};
        ($future:expr, $duration:expr, $message:expr) => {{
            let future = $future;
            let duration = $duration;
            let message = $message;
            let __message: &str = ::core::convert::AsRef::<str>::as_ref(&message);

            tokio::time::timeout(duration, future).await.expect(__message)
        }};
    }
}
