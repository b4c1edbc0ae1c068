pub mod gateway;
pub mod manager_client;
pub mod process;
pub mod rpc;
pub mod supervisor;

use std::path::{Path, PathBuf};

/// Return the data directory holding `config.yaml`, logs and per-runtime
/// server configs.
///
/// `TOOLGATE_DATA_DIR` wins; otherwise the platform data directory
/// (`~/Library/Application Support/toolgate`, `%APPDATA%\toolgate`,
/// `$XDG_DATA_HOME/toolgate`), falling back to `~/.toolgate`.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("TOOLGATE_DATA_DIR").filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolgate");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolgate")
}

/// Number of previous logs kept next to the current one.
const KEEP_LOGS: u32 = 3;

/// Send tracing output to `<data dir>/<log_file_name>`.
///
/// Stdout carries the protocol in both roles, so logs never go there. The
/// previous logs are shifted to `.1` through `.3` first. `std::fs::File` is
/// unbuffered, so every event reaches disk before the next one is formatted.
/// When the file cannot be opened, logs go to stderr.
pub fn init_tracing(log_file_name: &str) {
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    let log_path = log_dir.join(log_file_name);
    let opened = std::fs::create_dir_all(&log_dir).and_then(|()| {
        rotate_logs(&log_path, KEEP_LOGS);
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
    });

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolgate=info,warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(true);

    match opened {
        Ok(file) => builder.with_writer(std::sync::Mutex::new(file)).init(),
        Err(e) => {
            builder.with_writer(std::io::stderr).init();
            tracing::warn!(path = %log_path.display(), error = %e, "cannot open log file, logging to stderr");
        }
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        pid = std::process::id(),
        "toolgate starting"
    );
}

/// `gateway.log` → `gateway.log.<n>`
fn numbered(base: &Path, n: u32) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Shift `base` to `base.1` and each `base.<n>` up by one, dropping whatever
/// would land past `keep`. Gaps in the chain are fine.
fn rotate_logs(base: &Path, keep: u32) {
    let _ = std::fs::remove_file(numbered(base, keep));
    for n in (1..keep).rev() {
        let _ = std::fs::rename(numbered(base, n), numbered(base, n + 1));
    }
    let _ = std::fs::rename(base, numbered(base, 1));
}
