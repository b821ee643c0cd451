//! Durable environment registry.
//!
//! One JSON document mapping environment name → install state, persisted at
//! `<data_root>/environments.json`. Loaded once, rewritten on every mutation;
//! writes are infrequent so the full-rewrite strategy is acceptable. An
//! unreadable or unparseable document is treated as empty — correctness is
//! re-derived through re-verification.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::requirements::normalize_name;

/// Named capability tracked per environment (e.g. "base" = core package set).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureState {
    pub installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verified: Option<DateTime<Utc>>,
}

/// Per-package install record, keyed by normalized name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageState {
    pub version: String,
    pub installed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentEntry {
    pub path: PathBuf,
    #[serde(default)]
    pub features: HashMap<String, FeatureState>,
    #[serde(default)]
    pub installed_packages: HashMap<String, PackageState>,
}

/// Locate the interpreter inside an environment directory.
///
/// `None` means the directory does not hold a usable environment.
pub fn find_interpreter(env_dir: &Path) -> Option<PathBuf> {
    for candidate in [
        env_dir.join("bin").join("python"),
        env_dir.join("bin").join("python3"),
        env_dir.join("Scripts").join("python.exe"),
    ] {
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

/// Single source of truth for what has already been provisioned.
///
/// Interior mutex guards read-modify-write; every mutation rewrites the
/// backing document.
pub struct EnvironmentRegistry {
    path: PathBuf,
    entries: Mutex<HashMap<String, EnvironmentEntry>>,
}

impl EnvironmentRegistry {
    /// Open the registry at `path`, loading existing state. A missing or
    /// corrupt document yields an empty registry.
    pub fn open(path: PathBuf) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Registry unparseable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn save(&self, entries: &HashMap<String, EnvironmentEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Create registry dir {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Write registry {}", self.path.display()))?;
        Ok(())
    }

    /// Create (or re-point) the entry for `name`.
    pub fn register_environment(&self, name: &str, path: &Path) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(name.to_string()).or_default();
        entry.path = path.to_path_buf();
        self.save(&entries)
    }

    /// Registered path for `name`, if it still holds a valid interpreter.
    ///
    /// A registered path with no interpreter behind it is unregistered on the
    /// spot so callers fall through to re-provisioning instead of failing.
    pub fn registered_path(&self, name: &str) -> Option<PathBuf> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let path = entries.get(name)?.path.clone();
        if find_interpreter(&path).is_some() {
            return Some(path);
        }
        tracing::warn!(
            environment = name,
            path = %path.display(),
            "Registered environment has no interpreter, unregistering"
        );
        entries.remove(name);
        if let Err(e) = self.save(&entries) {
            tracing::error!(error = %e, "Failed to persist registry after self-heal");
        }
        None
    }

    pub fn is_feature_installed(&self, name: &str, feature: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(name)
            .and_then(|e| e.features.get(feature))
            .map(|f| f.installed)
            .unwrap_or(false)
    }

    pub fn mark_feature_installed(&self, name: &str, feature: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.get_mut(name) else {
            tracing::warn!(environment = name, feature, "Feature mark on unregistered environment");
            return Ok(());
        };
        entry.features.insert(
            feature.to_string(),
            FeatureState {
                installed: true,
                last_verified: Some(Utc::now()),
            },
        );
        self.save(&entries)
    }

    /// Whether `package` (any name variant) is tracked as installed.
    pub fn is_package_tracked(&self, name: &str, package: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(name)
            .map(|e| e.installed_packages.contains_key(&normalize_name(package)))
            .unwrap_or(false)
    }

    pub fn tracked_version(&self, name: &str, package: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(name)?
            .installed_packages
            .get(&normalize_name(package))
            .map(|p| p.version.clone())
    }

    pub fn mark_package_installed(&self, name: &str, package: &str, version: &str) -> Result<()> {
        self.mark_packages_installed(name, &[(package.to_string(), version.to_string())])
    }

    /// Record a batch of installed packages in one document rewrite.
    pub fn mark_packages_installed(&self, name: &str, packages: &[(String, String)]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.get_mut(name) else {
            tracing::warn!(environment = name, "Package mark on unregistered environment");
            return Ok(());
        };
        let now = Utc::now();
        for (package, version) in packages {
            entry.installed_packages.insert(
                normalize_name(package),
                PackageState {
                    version: version.clone(),
                    installed_at: now,
                },
            );
        }
        self.save(&entries)
    }

    /// Remove the entry for `name`. Returns whether anything was removed.
    pub fn unregister(&self, name: &str) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let removed = entries.remove(name).is_some();
        if removed {
            self.save(&entries)?;
        }
        Ok(removed)
    }

    pub fn environment_names(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of one entry, for status reporting.
    pub fn entry(&self, name: &str) -> Option<EnvironmentEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_env(dir: &Path) {
        std::fs::create_dir_all(dir.join("bin")).unwrap();
        std::fs::write(dir.join("bin").join("python"), "").unwrap();
    }

    #[test]
    fn test_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let reg = EnvironmentRegistry::open(tmp.path().join("environments.json"));
        assert!(reg.environment_names().is_empty());
        assert!(reg.registered_path("phi-cuda").is_none());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("environments.json");
        std::fs::write(&path, "{not json").unwrap();
        let reg = EnvironmentRegistry::open(path);
        assert!(reg.environment_names().is_empty());
    }

    #[test]
    fn test_package_roundtrip_name_variants() {
        let tmp = TempDir::new().unwrap();
        let env_dir = tmp.path().join("env");
        fake_env(&env_dir);
        let reg = EnvironmentRegistry::open(tmp.path().join("environments.json"));
        reg.register_environment("phi-cuda", &env_dir).unwrap();
        reg.mark_package_installed("phi-cuda", "Foo-Bar", "1.2.3").unwrap();

        assert!(reg.is_package_tracked("phi-cuda", "foo_bar"));
        assert!(reg.is_package_tracked("phi-cuda", "Foo-Bar"));
        assert!(reg.is_package_tracked("phi-cuda", "foo.bar"));
        assert_eq!(reg.tracked_version("phi-cuda", "foo_bar").as_deref(), Some("1.2.3"));

        // Reload from disk and confirm persistence
        let reg2 = EnvironmentRegistry::open(tmp.path().join("environments.json"));
        assert!(reg2.is_package_tracked("phi-cuda", "FOO_BAR"));
    }

    #[test]
    fn test_feature_mark_and_check() {
        let tmp = TempDir::new().unwrap();
        let env_dir = tmp.path().join("env");
        fake_env(&env_dir);
        let reg = EnvironmentRegistry::open(tmp.path().join("environments.json"));
        reg.register_environment("llama", &env_dir).unwrap();
        assert!(!reg.is_feature_installed("llama", "base"));
        reg.mark_feature_installed("llama", "base").unwrap();
        assert!(reg.is_feature_installed("llama", "base"));
        assert!(!reg.is_feature_installed("other", "base"));
    }

    #[test]
    fn test_stale_path_self_heals() {
        let tmp = TempDir::new().unwrap();
        let env_dir = tmp.path().join("env");
        fake_env(&env_dir);
        let reg = EnvironmentRegistry::open(tmp.path().join("environments.json"));
        reg.register_environment("mistral-cpu", &env_dir).unwrap();
        assert!(reg.registered_path("mistral-cpu").is_some());

        std::fs::remove_dir_all(&env_dir).unwrap();
        assert!(reg.registered_path("mistral-cpu").is_none());
        // Entry is gone, not just hidden
        assert!(reg.environment_names().is_empty());
    }

    #[test]
    fn test_unregister() {
        let tmp = TempDir::new().unwrap();
        let env_dir = tmp.path().join("env");
        fake_env(&env_dir);
        let reg = EnvironmentRegistry::open(tmp.path().join("environments.json"));
        reg.register_environment("phi-cuda", &env_dir).unwrap();
        assert!(reg.unregister("phi-cuda").unwrap());
        assert!(!reg.unregister("phi-cuda").unwrap());
    }
}
