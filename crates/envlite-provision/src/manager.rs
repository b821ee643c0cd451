//! Environment lifecycle: ensure a provider's environment exists and is Ready.
//!
//! `ensure_environment` is idempotent: the registry + completion-marker fast
//! path makes repeat calls near-free and never re-probes hardware for an
//! environment whose name already declares its backend. The
//! create → install → verify sequence for one identity is serialized by an
//! identity-scoped async mutex; different identities provision concurrently.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use envlite_core::registry::{find_interpreter, EnvironmentRegistry};
use envlite_core::requirements::PackageRequirement;

use crate::error::ProvisionError;
use crate::gpu::{self, GpuBackend};
use crate::identity::{base_identity, NamingStrategy};
use crate::installer::{dist_info_version, InstallReport, PackageInstaller};
use crate::process::run_sanitized;
use crate::providers;

const CREATE_TIMEOUT: Duration = Duration::from_secs(300);
/// Human-readable completion marker written inside a Ready environment.
pub const MARKER_FILENAME: &str = ".envlite-ready";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    Unprovisioned,
    Creating,
    Installing,
    Verifying,
    Ready,
    Failed,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unprovisioned => "unprovisioned",
            Self::Creating => "creating",
            Self::Installing => "installing",
            Self::Verifying => "verifying",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatusKind {
    Installed,
    Missing,
    NotProvisioned,
}

/// One row of the collaborator-facing package status report.
#[derive(Debug, Clone, Serialize)]
pub struct PackageStatus {
    pub name: String,
    pub version_constraint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_version: Option<String>,
    pub status: PackageStatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct EnvironmentManager {
    registry: Arc<EnvironmentRegistry>,
    installer: PackageInstaller,
    envs_root: PathBuf,
    strategy: NamingStrategy,
    identity_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EnvironmentManager {
    pub fn new(
        registry: Arc<EnvironmentRegistry>,
        envs_root: PathBuf,
        strategy: NamingStrategy,
    ) -> Self {
        let installer = PackageInstaller::new(registry.clone());
        Self {
            registry,
            installer,
            envs_root,
            strategy,
            identity_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure the environment for `provider` (+`model`) exists and is Ready.
    ///
    /// Returns the environment path, or `None` on failure (cause logged).
    /// Never leaves a partially-Ready registry entry behind.
    pub async fn ensure_environment(&self, provider: &str, model: Option<&str>) -> Option<PathBuf> {
        match self.ensure_inner(provider, model).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!(
                    provider,
                    model = model.unwrap_or(""),
                    state = %ProvisionState::Failed,
                    error = %e,
                    "Environment provisioning failed"
                );
                None
            }
        }
    }

    async fn ensure_inner(
        &self,
        provider: &str,
        model: Option<&str>,
    ) -> Result<PathBuf, ProvisionError> {
        let family = providers::resolve_family(provider);
        let base = base_identity(&family.key, model, self.strategy);

        // Fast path before touching hardware: the base name and every known
        // suffix variant. A hit means a valid interpreter already exists.
        if let Some(path) = self.fast_path(&base) {
            return Ok(path);
        }

        let identity = if family.hardware_sensitive {
            gpu::append_backend_suffix(&base).await
        } else {
            base
        };

        let lock = self.identity_lock(&identity).await;
        let _guard = lock.lock().await;

        // Another caller may have finished while we waited on the lock.
        if let Some(path) = self.fast_path(&identity) {
            return Ok(path);
        }

        let backend = if family.hardware_sensitive {
            gpu::detect_backend().await
        } else {
            GpuBackend::Cpu
        };
        let env_dir = self.envs_root.join(&identity);

        tracing::info!(environment = %identity, state = %ProvisionState::Creating, "Creating environment");
        self.create_isolated_env(&identity, &env_dir).await?;
        if let Err(e) = self.registry.register_environment(&identity, &env_dir) {
            tracing::error!(error = %e, "Failed to persist registry entry, continuing");
        }

        let requirements = providers::requirements_for(&family, backend);
        tracing::info!(
            environment = %identity,
            state = %ProvisionState::Installing,
            packages = requirements.len(),
            backend = %backend,
            "Installing packages"
        );
        let report = self
            .installer
            .install(&identity, &env_dir, backend, &requirements)
            .await?;
        if !report.success() {
            return Err(ProvisionError::Install {
                env: identity,
                packages: report.failed_required(),
            });
        }

        tracing::info!(environment = %identity, state = %ProvisionState::Verifying, "Finalizing environment");
        self.write_marker(&env_dir, &requirements, &report);
        if let Err(e) = self.registry.mark_feature_installed(&identity, "base") {
            tracing::error!(error = %e, "Failed to persist base feature mark");
        }

        tracing::info!(environment = %identity, state = %ProvisionState::Ready, "Environment ready");
        Ok(env_dir)
    }

    /// Registry (then on-disk marker) check for `name` and its backend-suffix
    /// variants. Hits never spawn a process.
    fn fast_path(&self, name: &str) -> Option<PathBuf> {
        for candidate in suffix_candidates(name) {
            if let Some(path) = self.registry.registered_path(&candidate) {
                tracing::debug!(environment = %candidate, "Registry fast path hit");
                return Some(path);
            }
            // Registry may have been lost; a completed environment directory
            // with a live interpreter re-registers itself.
            let env_dir = self.envs_root.join(&candidate);
            if env_dir.join(MARKER_FILENAME).exists() && find_interpreter(&env_dir).is_some() {
                tracing::info!(environment = %candidate, "Re-registering environment found on disk");
                if let Err(e) = self.registry.register_environment(&candidate, &env_dir) {
                    tracing::error!(error = %e, "Failed to re-register environment");
                }
                return Some(env_dir);
            }
        }
        None
    }

    /// Create the isolated environment, trying the portable tool first.
    ///
    /// virtualenv works from embeddable distributions that lack the standard
    /// venv machinery; `--always-copy` / `--copies` keep the environment
    /// self-contained rather than symlinked to the host interpreter.
    async fn create_isolated_env(&self, name: &str, env_dir: &Path) -> Result<(), ProvisionError> {
        if find_interpreter(env_dir).is_some() {
            return Ok(());
        }
        let host = host_interpreter()?;
        if let Some(parent) = env_dir.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return Err(ProvisionError::Creation {
                    name: name.to_string(),
                    detail: format!("create {}: {}", parent.display(), e),
                });
            }
        }
        let env_arg = env_dir.to_string_lossy().to_string();

        let detail = match run_sanitized(
            &host,
            ["-m", "virtualenv", "--always-copy", env_arg.as_str()],
            &self.envs_root,
            CREATE_TIMEOUT,
        )
        .await
        {
            Ok(out) if out.success && find_interpreter(env_dir).is_some() => return Ok(()),
            Ok(out) => out.stderr_tail(),
            Err(e) => e.to_string(),
        };
        tracing::warn!(environment = name, detail = %detail, "virtualenv creation failed, falling back to venv");

        match run_sanitized(
            &host,
            ["-m", "venv", "--copies", env_arg.as_str()],
            &self.envs_root,
            CREATE_TIMEOUT,
        )
        .await
        {
            Ok(out) if out.success && find_interpreter(env_dir).is_some() => Ok(()),
            Ok(out) => Err(ProvisionError::Creation {
                name: name.to_string(),
                detail: out.stderr_tail(),
            }),
            Err(e) => Err(ProvisionError::Creation {
                name: name.to_string(),
                detail: e.to_string(),
            }),
        }
    }

    fn write_marker(&self, env_dir: &Path, requirements: &[PackageRequirement], report: &InstallReport) {
        let mut content = format!(
            "envlite {}\nprovisioned-at: {}\npackages:\n",
            env!("CARGO_PKG_VERSION"),
            chrono::Utc::now().to_rfc3339(),
        );
        for req in requirements {
            let normalized = req.normalized_name();
            let version = dist_info_version(env_dir, &normalized)
                .or_else(|| {
                    report
                        .skipped
                        .iter()
                        .find(|s| **s == normalized)
                        .map(|_| "satisfied".to_string())
                })
                .unwrap_or_else(|| "absent".to_string());
            content.push_str(&format!("  {} {}\n", normalized, version));
        }
        if let Err(e) = std::fs::write(env_dir.join(MARKER_FILENAME), content) {
            tracing::warn!(error = %e, "Failed to write completion marker");
        }
    }

    async fn identity_lock(&self, identity: &str) -> Arc<Mutex<()>> {
        let mut locks = self.identity_locks.lock().await;
        locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Collaborator-facing package status for `provider`.
    ///
    /// Never triggers provisioning; reports against the registered
    /// environment if one exists, else marks everything not-provisioned.
    pub async fn provider_package_status(&self, provider: &str) -> Vec<PackageStatus> {
        let family = providers::resolve_family(provider);
        let base = base_identity(&family.key, None, self.strategy);

        let existing = suffix_candidates(&base)
            .into_iter()
            .find_map(|candidate| {
                self.registry
                    .registered_path(&candidate)
                    .map(|path| (candidate, path))
            });

        let backend = match &existing {
            Some((name, _)) => gpu::backend_from_name(name).unwrap_or(GpuBackend::Cpu),
            None => {
                if family.hardware_sensitive {
                    gpu::detect_backend().await
                } else {
                    GpuBackend::Cpu
                }
            }
        };

        let requirements = providers::requirements_for(&family, backend);
        requirements
            .into_iter()
            .map(|req| {
                let normalized = req.normalized_name();
                match &existing {
                    None => PackageStatus {
                        name: normalized,
                        version_constraint: req.version_constraint,
                        installed_version: None,
                        status: PackageStatusKind::NotProvisioned,
                        error: None,
                    },
                    Some((env_name, env_dir)) => {
                        let version = self
                            .registry
                            .tracked_version(env_name, &normalized)
                            .or_else(|| dist_info_version(env_dir, &normalized));
                        let status = if version.is_some() {
                            PackageStatusKind::Installed
                        } else {
                            PackageStatusKind::Missing
                        };
                        PackageStatus {
                            name: normalized,
                            version_constraint: req.version_constraint,
                            installed_version: version,
                            status,
                            error: None,
                        }
                    }
                }
            })
            .collect()
    }

    pub fn envs_root(&self) -> &Path {
        &self.envs_root
    }
}

fn host_interpreter() -> Result<PathBuf, ProvisionError> {
    which::which("python3")
        .or_else(|_| which::which("python"))
        .map_err(|_| ProvisionError::HostInterpreterMissing)
}

/// `name` plus its backend-suffix variants, without duplicates. An
/// already-suffixed name stands alone.
fn suffix_candidates(name: &str) -> Vec<String> {
    if gpu::backend_from_name(name).is_some() {
        return vec![name.to_string()];
    }
    let mut candidates = vec![name.to_string()];
    for backend in GpuBackend::all() {
        candidates.push(gpu::apply_suffix(name, backend));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_ready_env(dir: &Path) {
        std::fs::create_dir_all(dir.join("bin")).unwrap();
        std::fs::write(dir.join("bin").join("python"), "").unwrap();
        std::fs::write(dir.join(MARKER_FILENAME), "envlite test\n").unwrap();
    }

    fn manager(tmp: &TempDir) -> EnvironmentManager {
        let registry = Arc::new(EnvironmentRegistry::open(
            tmp.path().join("environments.json"),
        ));
        EnvironmentManager::new(registry, tmp.path().join("envs"), NamingStrategy::PerFamily)
    }

    #[tokio::test]
    async fn test_fast_path_via_registry() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let env_dir = tmp.path().join("envs").join("phi-cuda");
        fake_ready_env(&env_dir);
        mgr.registry.register_environment("phi-cuda", &env_dir).unwrap();

        // Suffixed variant resolves without any hardware probe or pip call.
        let path = mgr.ensure_environment("phi", Some("phi-3.5")).await;
        assert_eq!(path, Some(env_dir));
    }

    #[tokio::test]
    async fn test_fast_path_reregisters_from_marker() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        // Environment on disk, registry empty (e.g. registry file lost).
        let env_dir = tmp.path().join("envs").join("llama-cpu");
        fake_ready_env(&env_dir);

        let path = mgr.ensure_environment("meta-llama", None).await;
        assert_eq!(path, Some(env_dir));
        assert!(mgr.registry.registered_path("llama-cpu").is_some());
    }

    #[tokio::test]
    async fn test_status_unprovisioned() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let statuses = mgr.provider_package_status("cohere").await;
        assert!(!statuses.is_empty());
        assert!(statuses
            .iter()
            .all(|s| s.status == PackageStatusKind::NotProvisioned));
    }

    #[tokio::test]
    async fn test_status_reads_registry() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let env_dir = tmp.path().join("envs").join("cohere");
        fake_ready_env(&env_dir);
        mgr.registry.register_environment("cohere", &env_dir).unwrap();
        mgr.registry
            .mark_package_installed("cohere", "cohere", "5.5.0")
            .unwrap();

        let statuses = mgr.provider_package_status("cohere").await;
        let cohere = statuses.iter().find(|s| s.name == "cohere").unwrap();
        assert_eq!(cohere.status, PackageStatusKind::Installed);
        assert_eq!(cohere.installed_version.as_deref(), Some("5.5.0"));
    }

    #[test]
    fn test_suffix_candidates() {
        let candidates = suffix_candidates("phi");
        assert!(candidates.contains(&"phi".to_string()));
        assert!(candidates.contains(&"phi-cuda".to_string()));
        assert!(candidates.contains(&"phi-cpu".to_string()));
        assert_eq!(suffix_candidates("phi-cuda"), vec!["phi-cuda".to_string()]);
    }
}
