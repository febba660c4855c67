use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Once;

static LOGGER: Logger = Logger;
static INIT: Once<()> = Once::new();

/// Installs the stderr logger. The level is taken from `LOG` at run time,
/// falling back to `LOG` at build time; logging is off otherwise.
///
/// Does nothing if this or another logger is already installed.
pub fn init() {
    INIT.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(level_filter());
        }
    });
}

fn level_filter() -> LevelFilter {
    let runtime = std::env::var("LOG").ok();
    match runtime.as_deref().or(option_env!("LOG")) {
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

struct Logger;
impl Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        eprintln!(
            "\x1b[{}m[{:>5}] {}\x1b[0m",
            level_to_color_code(record.level()),
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

fn level_to_color_code(level: Level) -> u8 {
    match level {
        Level::Error => 31, // Red
        Level::Warn => 93,  // BrightYellow
        Level::Info => 34,  // Blue
        Level::Debug => 32, // Green
        Level::Trace => 90, // BrightBlack
    }
}
