use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Initialize the stderr logger with elapsed-time formatting.
///
/// Verbose selects Info, otherwise Warn. Format: `[HH:MM:SS] LEVEL: message`.
pub fn init_logger(verbose: bool) {
    START_TIME.set(Instant::now()).ok();

    let level = if verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format(|buf, record| {
            let elapsed = START_TIME.get().unwrap().elapsed().as_secs();
            writeln!(
                buf,
                "[{:02}:{:02}:{:02}] {}: {}",
                elapsed / 3600,
                (elapsed % 3600) / 60,
                elapsed % 60,
                record.level(),
                record.args()
            )
        })
        .target(env_logger::Target::Stderr)
        .init();
}
