use iosched::common::logger::initialize_logger_with_level;
use log::LevelFilter;

/// Keeps integration runs to warnings unless `RUST_LOG` asks for more.
pub fn init_test_logger() {
    initialize_logger_with_level(LevelFilter::Warn);
}
