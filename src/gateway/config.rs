//! Gateway configuration.
//!
//! Sources, lowest to highest precedence: built-in defaults, an optional
//! `config.yaml` in the data directory, then `TOOLGATE_*` environment
//! variables. YAML string values support `${VAR}` / `${VAR:-default}`
//! interpolation, and path settings expand a leading `~`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::errors::GatewayError;
use crate::supervisor::store::CONFIG_FILE_NAME;
use crate::supervisor::DEFAULT_RUNTIME;

// ─── Defaults ────────────────────────────────────────────────────────────────

pub const DEFAULT_API_URL: &str = "https://api.toolgate.dev";

/// Default bound on a plain manager request (list, config, uninstall).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Default bound on an install round trip (spawn + handshake + list).
pub const DEFAULT_INSTALL_TIMEOUT_MS: u64 = 120_000;

/// Default call watchdog handed to the manager.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 60_000;

/// Default bound on a catalog HTTP request.
pub const DEFAULT_CATALOG_TIMEOUT_MS: u64 = 30_000;

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub blocked_servers: Vec<String>,
    /// `None` allows everything not blocked.
    pub allowed_servers: Option<Vec<String>>,
    pub runtimes: Vec<String>,
    /// Root for per-runtime server configs; `None` leaves each manager on
    /// its default under the data directory.
    pub servers_dir: Option<PathBuf>,
    pub request_timeout: Duration,
    pub install_timeout: Duration,
    pub call_timeout: Duration,
    pub catalog_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            blocked_servers: Vec::new(),
            allowed_servers: None,
            runtimes: vec![DEFAULT_RUNTIME.to_string()],
            servers_dir: None,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            install_timeout: Duration::from_millis(DEFAULT_INSTALL_TIMEOUT_MS),
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            catalog_timeout: Duration::from_millis(DEFAULT_CATALOG_TIMEOUT_MS),
        }
    }
}

/// Shape of `config.yaml`; every key optional.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    api_url: Option<String>,
    api_key: Option<String>,
    #[serde(default)]
    blocked_servers: Option<Vec<String>>,
    #[serde(default)]
    allowed_servers: Option<Vec<String>>,
    #[serde(default)]
    runtimes: Option<Vec<String>>,
    servers_dir: Option<String>,
    request_timeout_ms: Option<u64>,
    install_timeout_ms: Option<u64>,
    call_timeout_ms: Option<u64>,
    catalog_timeout_ms: Option<u64>,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

impl GatewayConfig {
    /// Load from `<data dir>/config.yaml` (if present) and the process environment.
    pub fn load() -> Result<Self, GatewayError> {
        let path = crate::data_dir().join("config.yaml");
        Self::load_from(&path, |key| std::env::var(key).ok())
    }

    /// Load from an explicit file path and env lookup.
    pub fn load_from(
        path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, GatewayError> {
        let file = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|e| GatewayError::Config {
                reason: format!("failed to read {}: {e}", path.display()),
            })?;
            let parse_err = |e: serde_yaml::Error| GatewayError::Config {
                reason: format!("failed to parse {}: {e}", path.display()),
            };
            let mut tree: serde_yaml::Value = serde_yaml::from_str(&raw).map_err(parse_err)?;
            interpolate_strings(&mut tree, &env);
            let parsed: Option<FileConfig> = serde_yaml::from_value(tree).map_err(parse_err)?;
            tracing::debug!(path = %path.display(), "loaded gateway config file");
            parsed.unwrap_or_default()
        } else {
            FileConfig::default()
        };
        Self::resolve(file, env)
    }

    /// Server config file handed to the manager of `runtime`, if overridden.
    pub fn servers_file(&self, runtime: &str) -> Option<PathBuf> {
        self.servers_dir
            .as_ref()
            .map(|dir| dir.join(runtime).join(CONFIG_FILE_NAME))
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self, GatewayError> {
        let mut config = Self::default();

        if let Some(url) = file.api_url {
            config.api_url = url;
        }
        config.api_key = file.api_key.filter(|k| !k.is_empty());
        if let Some(list) = file.blocked_servers {
            config.blocked_servers = list;
        }
        config.allowed_servers = file.allowed_servers;
        if let Some(runtimes) = file.runtimes {
            config.runtimes = runtimes;
        }
        if let Some(dir) = file.servers_dir.filter(|d| !d.is_empty()) {
            config.servers_dir = Some(expand_home(&dir));
        }
        set_ms(&mut config.request_timeout, file.request_timeout_ms);
        set_ms(&mut config.install_timeout, file.install_timeout_ms);
        set_ms(&mut config.call_timeout, file.call_timeout_ms);
        set_ms(&mut config.catalog_timeout, file.catalog_timeout_ms);

        if let Some(url) = env("TOOLGATE_API_URL").filter(|v| !v.is_empty()) {
            config.api_url = url;
        }
        if let Some(key) = env("TOOLGATE_API_KEY").filter(|v| !v.is_empty()) {
            config.api_key = Some(key);
        }
        if let Some(list) = env("TOOLGATE_BLOCKED_SERVERS") {
            config.blocked_servers = split_list(&list);
        }
        if let Some(list) = env("TOOLGATE_ALLOWED_SERVERS") {
            let list = split_list(&list);
            config.allowed_servers = (!list.is_empty()).then_some(list);
        }
        if let Some(list) = env("TOOLGATE_RUNTIMES") {
            config.runtimes = split_list(&list);
        }
        if let Some(dir) = env("TOOLGATE_SERVERS_DIR").filter(|v| !v.is_empty()) {
            config.servers_dir = Some(expand_home(&dir));
        }

        config.api_url = config.api_url.trim_end_matches('/').to_string();
        if config.runtimes.is_empty() {
            return Err(GatewayError::Config {
                reason: "at least one runtime must be configured".into(),
            });
        }
        Ok(config)
    }
}

fn set_ms(target: &mut Duration, value: Option<u64>) {
    if let Some(ms) = value {
        *target = Duration::from_millis(ms);
    }
}

/// Comma-separated list, trimmed, empties dropped.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ─── Interpolation ───────────────────────────────────────────────────────────

/// Substitute env references inside every string scalar of a parsed YAML tree.
///
/// Substitution happens after parsing, so a value can never change the
/// document's structure.
fn interpolate_strings(node: &mut serde_yaml::Value, env: &impl Fn(&str) -> Option<String>) {
    match node {
        serde_yaml::Value::String(text) => {
            if !text.contains("${") {
                return;
            }
            *text = substitute(text, env);
        }
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                interpolate_strings(item, env);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (key, value) in map.iter_mut() {
                interpolate_strings(value, env);
                // Millisecond settings such as `call_timeout_ms: ${CALL_MS:-5000}`.
                let is_millis = key.as_str().is_some_and(|k| k.ends_with("_ms"));
                let millis = value.as_str().and_then(|v| v.trim().parse::<u64>().ok());
                if let (true, Some(ms)) = (is_millis, millis) {
                    *value = serde_yaml::Value::Number(ms.into());
                }
            }
        }
        _ => {}
    }
}

/// Replace `${VAR}` (empty when unset) and `${VAR:-fallback}`. An unclosed
/// `${` is kept as written.
fn substitute(text: &str, env: &impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let reference = &after[..close];
        let value = match reference.split_once(":-") {
            Some((name, fallback)) => env(name).unwrap_or_else(|| fallback.to_string()),
            None => env(reference).unwrap_or_default(),
        };
        out.push_str(&value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

/// `~` or `~/...` resolved against the home directory; other paths unchanged.
fn expand_home(path: &str) -> PathBuf {
    let relative = match path.strip_prefix('~') {
        Some("") => "",
        Some(rest) if rest.starts_with('/') || rest.starts_with('\\') => &rest[1..],
        _ => return PathBuf::from(path),
    };
    match dirs::home_dir() {
        Some(home) if relative.is_empty() => home,
        Some(home) => home.join(relative),
        None => PathBuf::from(path),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
