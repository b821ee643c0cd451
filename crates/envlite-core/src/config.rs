//! Environment-variable driven configuration.
//!
//! All knobs are `ENVLITE_*` variables; `load_dotenv` pulls a local `.env`
//! into the process environment without overwriting anything already set.

use std::env;
use std::path::PathBuf;

/// Load the current directory's `.env` into the environment (no overwrite).
pub fn load_dotenv() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let path = env::current_dir()
            .map(|d| d.join(".env"))
            .unwrap_or_else(|_| PathBuf::from(".env"));
        if let Ok(content) = std::fs::read_to_string(&path) {
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some(eq_pos) = line.find('=') {
                    let key = line[..eq_pos].trim();
                    let mut value = line[eq_pos + 1..].trim();
                    // Strip inline comment (# not inside quotes)
                    if let Some(hash_pos) = value.find('#') {
                        let before_hash = value[..hash_pos].trim_end();
                        if !before_hash.contains('"') && !before_hash.contains('\'') {
                            value = before_hash;
                        }
                    }
                    if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
                        || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
                    {
                        value = &value[1..value.len() - 1];
                    }
                    if !key.is_empty() && env::var(key).is_err() {
                        env::set_var(key, value);
                    }
                }
            }
        }
    });
}

/// Read an env var, treating empty values as unset.
pub fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|s| {
        let s = s.trim().to_string();
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    })
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_optional(key)
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

/// Root directory for all envlite data (registry, environments).
///
/// `ENVLITE_DATA_DIR` overrides; default is `~/.envlite/`.
pub fn data_dir() -> PathBuf {
    load_dotenv();
    env_optional("ENVLITE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".envlite")
        })
}

/// Path to the environment registry document.
pub fn registry_path() -> PathBuf {
    data_dir().join("environments.json")
}

/// Root directory environments are created under.
pub fn envs_root() -> PathBuf {
    data_dir().join("envs")
}

/// Logging configuration, read at process startup.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// ENVLITE_QUIET=1: only WARN and above
    pub quiet: bool,
    /// ENVLITE_LOG_LEVEL, e.g. "envlite=debug" (EnvFilter syntax)
    pub log_level: String,
    /// ENVLITE_LOG_JSON=1: JSON log lines
    pub log_json: bool,
}

impl ObservabilityConfig {
    pub fn from_env() -> Self {
        load_dotenv();
        Self {
            quiet: env_optional("ENVLITE_QUIET").is_some_and(|v| v == "1" || v == "true"),
            log_level: env_optional("ENVLITE_LOG_LEVEL")
                .unwrap_or_else(|| "envlite=info".to_string()),
            log_json: env_optional("ENVLITE_LOG_JSON").is_some_and(|v| v == "1" || v == "true"),
        }
    }
}

/// Session manager limits.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Maximum concurrent sessions (ENVLITE_MAX_SESSIONS, default 8)
    pub capacity: usize,
    /// Seconds to wait for a free slot before failing (ENVLITE_SESSION_ACQUIRE_TIMEOUT_SECS, default 5)
    pub acquire_timeout_secs: u64,
    /// Idle age after which a session is swept (ENVLITE_SESSION_IDLE_SECS, default 1800)
    pub idle_max_age_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        load_dotenv();
        Self {
            capacity: env_parse("ENVLITE_MAX_SESSIONS", 8usize).max(1),
            acquire_timeout_secs: env_parse("ENVLITE_SESSION_ACQUIRE_TIMEOUT_SECS", 5u64),
            idle_max_age_secs: env_parse("ENVLITE_SESSION_IDLE_SECS", 1800u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let cfg = SessionConfig::from_env();
        assert!(cfg.capacity >= 1);
        assert!(cfg.acquire_timeout_secs > 0);
    }

    #[test]
    fn test_data_dir_override() {
        env::set_var("ENVLITE_DATA_DIR", "/tmp/envlite-test-data");
        assert_eq!(data_dir(), PathBuf::from("/tmp/envlite-test-data"));
        assert_eq!(
            registry_path(),
            PathBuf::from("/tmp/envlite-test-data/environments.json")
        );
        env::remove_var("ENVLITE_DATA_DIR");
    }
}
