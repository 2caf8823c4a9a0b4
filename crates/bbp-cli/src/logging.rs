use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over `-v` when set.
pub fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
