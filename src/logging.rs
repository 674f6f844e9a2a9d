use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging: a colorized compact console layer plus a plain
/// append-only file layer at `Skippy.log`.
///
/// The filter honors `RUST_LOG` when set, otherwise derives from the
/// configured level with the usual noisy HTTP internals turned down.
pub fn init(level: &str, log_file: &Path) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "skippy={level},\
             poise=info,\
             serenity=info,\
             reqwest=info,\
             rusqlite=info,\
             h2=warn,\
             hyper=warn,\
             hyper_util=warn,\
             rustls=warn",
        ))
    });

    let file = OpenOptions::new().create(true).append(true).open(log_file)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).compact())
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(Mutex::new(file)),
        )
        .init();

    Ok(())
}
