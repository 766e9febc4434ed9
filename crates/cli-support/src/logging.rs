use std::{
    env,
    fmt::Write,
    io::{self, LineWriter},
};

use anyhow::{anyhow, Result};
use tracing_subscriber::{prelude::*, EnvFilter};

pub const LOG_ENV_VAR: &str = "ODO_LOG";

const DEBUG_FILTER: &str = "info,odo=debug,odo_dev=debug,odo_platform=debug,odo_sync=debug,odo_session=debug";

const NOISY_LOGGERS: &[(&str, &str)] = &[
    ("hyper", "warn"),
    ("h2", "warn"),
    ("rustls", "warn"),
    ("tower", "warn"),
    ("kube_client", "info"),
];

/// Installs the stderr subscriber when `ODO_LOG` is set or `--debug` was passed
///
/// Without either, nothing is logged and the console is the only output.
pub fn init(debug: bool) -> Result<()> {
    let filter = match env::var(LOG_ENV_VAR) {
        Ok(filter) => Some(filter),
        Err(env::VarError::NotPresent) => debug.then(|| DEBUG_FILTER.to_owned()),
        Err(env::VarError::NotUnicode(_)) => return Err(anyhow!("{} environment variable is not valid unicode", LOG_ENV_VAR)),
    };
    let mut filter = match filter {
        Some(filter) => filter,
        None => return Ok(()),
    };

    for (name, default_level) in NOISY_LOGGERS {
        if !filter.contains(name) {
            let _ = write!(&mut filter, ",{}={}", name, default_level);
        }
    }
    let env_filter = EnvFilter::try_new(&filter)
        .map_err(|err| anyhow!("error in {} environment variable format: {}", LOG_ENV_VAR, err))?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        // Trace-level filters get full span events, anything else only span closes.
        .with_span_events(if filter.contains("trace") {
            tracing_subscriber::fmt::format::FmtSpan::FULL
        } else {
            tracing_subscriber::fmt::format::FmtSpan::CLOSE
        })
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .with_writer(|| LineWriter::new(io::stderr()))
        .with_filter(env_filter);

    tracing::subscriber::set_global_default(tracing_subscriber::registry().with(stderr_layer))
        .map_err(|err| anyhow!("failed to install logger: {}", err))?;
    Ok(())
}
