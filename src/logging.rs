//! Tracing setup for the binary. Everything goes to stderr so stdout stays
//! free for hook output.

use std::env;
use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "REGRET_GUARD_DEBUG_LOG";

pub fn init() {
    let filter = if debug_enabled(env::var(DEBUG_ENV).ok().as_deref()) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn debug_enabled(value: Option<&str>) -> bool {
    value
        .map(|value| matches!(value, "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}
