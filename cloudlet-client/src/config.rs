//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Client configuration. File: ~/.config/cloudlet/config.toml or
/// /etc/cloudlet/config.toml.
/// Env overrides: CLOUDLET_SERVER, CLOUDLET_OVERLAY_ROOT,
/// CLOUDLET_CONNECT_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Synthesis server address (host:port). No default; must come from the
    /// file, the environment, or the command line.
    #[serde(default)]
    pub server: Option<String>,
    /// Directory holding one overlay subdirectory per application.
    #[serde(default = "default_overlay_root")]
    pub overlay_root: PathBuf,
    /// Bound on connect and the session-create exchange (default 10).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_overlay_root() -> PathBuf {
    match std::env::var_os("HOME").map(PathBuf::from) {
        Some(home) => home.join(".cloudlet/overlays"),
        None => PathBuf::from("overlays"),
    }
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: None,
            overlay_root: default_overlay_root(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_else(Config::default);
    if let Ok(s) = std::env::var("CLOUDLET_SERVER") {
        if !s.is_empty() {
            c.server = Some(s);
        }
    }
    if let Ok(s) = std::env::var("CLOUDLET_OVERLAY_ROOT") {
        if !s.is_empty() {
            c.overlay_root = PathBuf::from(s);
        }
    }
    if let Ok(s) = std::env::var("CLOUDLET_CONNECT_TIMEOUT_SECS") {
        if let Ok(secs) = s.parse::<u64>() {
            c.connect_timeout_secs = secs;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/cloudlet/config.toml"));
    }
    out.push(PathBuf::from("/etc/cloudlet/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
