// 📡 Telemetry - tracing subscriber setup for the binaries
// Library code only emits events; binaries call `init` once at startup.

use anyhow::Result;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Default filter when RUST_LOG is unset
pub const DEFAULT_FILTER: &str = "info";

/// Install a global fmt subscriber honouring RUST_LOG (default INFO).
///
/// `json_stdout` binaries log to stderr so stdout stays machine-readable.
pub fn init(json_stdout: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let builder = FmtSubscriber::builder().with_env_filter(filter).with_target(false);

    if json_stdout {
        tracing::subscriber::set_global_default(builder.with_writer(std::io::stderr).finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}
