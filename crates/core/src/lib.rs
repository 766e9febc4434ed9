pub mod cancel;
pub mod env;
pub mod files;
pub mod labels;
pub mod process;
pub mod tracing;

#[cfg(unix)]
pub mod libc;

pub use crate::{
    cancel::{Cancellation, Interrupted},
    env::{PlatformKind, SessionEnv},
};
