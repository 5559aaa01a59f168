use tracing_subscriber::filter::{EnvFilter, LevelFilter};

/// Verbosity 0 only logs errors, 1 is the default operational log, 2 adds debug output, and 3 to 6 log everything.
pub fn level_for_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

// `RUST_LOG` directives still win over the verbosity level.
fn filter(verbosity: u8) -> EnvFilter {
    EnvFilter::builder().with_default_directive(level_for_verbosity(verbosity).into()).from_env_lossy()
}

pub fn init(verbosity: u8) -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(filter(verbosity)).try_init().map_err(|error| anyhow::anyhow!(error))?;
    tracing::info!(message_id = "Zo4ahvie", verbosity, "logging initialized");
    std::panic::set_hook(Box::new(|panic_info| {
        tracing::error!(message_id = "ooPh9ahc", "{panic_info}\n{:#}", std::backtrace::Backtrace::force_capture());
    }));
    Ok(())
}
