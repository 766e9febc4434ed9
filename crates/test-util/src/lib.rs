//! Helpers shared by the unit tests of the odo crates

pub mod fake;

pub use crate::fake::{Call, FakePlatform};

use std::{env, sync::Once};

use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

static INIT: Once = Once::new();

// The kube client and its HTTP stack log every request body at debug level.
const QUIET: &str = "hyper=info,h2=info,tower=info,kube_client=info";

/// Routes `tracing` output of the calling test through the test harness, filtered by `ODO_LOG` (default `debug`)
pub fn prep() {
    INIT.call_once(|| {
        let filter = format!("{},{}", env::var("ODO_LOG").unwrap_or_else(|_| "debug".to_owned()), QUIET);
        let filter = match EnvFilter::try_new(&filter) {
            Ok(filter) => filter,
            Err(err) => panic!("invalid ODO_LOG filter {:?}: {}", filter, err),
        };

        tracing_subscriber::fmt::fmt()
            .with_span_events(FmtSpan::CLOSE)
            .with_file(true)
            .with_line_number(true)
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}
