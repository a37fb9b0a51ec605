use std::sync::Once;

use env_logger::Builder;
use log::LevelFilter;

static INIT: Once = Once::new();

const SUBSYSTEMS: [&str; 3] = ["iosched::block", "iosched::elevator", "iosched::mq"];

/// Installs the `env_logger` backend at `Info` for this crate.
pub fn initialize_logger() {
    initialize_logger_with_level(LevelFilter::Info);
}

/// Installs the backend with every subsystem at `level`. `RUST_LOG` is parsed
/// last and overrides it. Only the first call in a process has any effect.
pub fn initialize_logger_with_level(level: LevelFilter) {
    INIT.call_once_force(|_| {
        let mut builder = Builder::new();
        builder.filter_level(LevelFilter::Warn);
        builder.filter_module("iosched", level);
        for module in SUBSYSTEMS {
            builder.filter_module(module, level);
        }
        builder.format_timestamp_millis().parse_default_env();

        // Another logger may already be installed by the embedding program.
        let _ = builder.try_init();
    });
}
