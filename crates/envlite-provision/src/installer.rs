//! GPU-aware, dependency-ordered package installation.
//!
//! Installs run strictly sequentially in a fixed order (build tooling →
//! tensor runtime → packages that import it at install time → the rest) so
//! import-time setup.py failures cannot happen from ordering. Hardware
//! packages route to the wheel index matching the detected backend.
//! Required failures fail the run; optional failures only warn.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use envlite_core::registry::{find_interpreter, EnvironmentRegistry};
use envlite_core::requirements::{normalize_name, PackageRequirement};

use crate::error::ProvisionError;
use crate::gpu::GpuBackend;
use crate::process::{run_sanitized, ProcessError};

const PIP_TIMEOUT: Duration = Duration::from_secs(1800);
const INSTALL_ATTEMPTS: u32 = 2;
const VERIFY_ATTEMPTS: u32 = 3;
const VERIFY_TIMEOUT: Duration = Duration::from_secs(60);
const VERIFY_BACKOFF_SECS: u64 = 2;

const CUDA_WHEEL_INDEX: &str = "https://download.pytorch.org/whl/cu121";
const ROCM_WHEEL_INDEX: &str = "https://download.pytorch.org/whl/rocm6.0";
const CPU_WHEEL_INDEX: &str = "https://download.pytorch.org/whl/cpu";

/// Known-compatible triple for CUDA on Windows, where the compiler matrix is
/// much narrower than on Linux.
const WINDOWS_CUDA_TORCH_PIN: &[(&str, &str)] = &[
    ("torch", "==2.3.1"),
    ("torchvision", "==0.18.1"),
    ("torchaudio", "==2.3.1"),
];

const BUILD_TOOLING: &[&str] = &["setuptools", "wheel", "packaging", "ninja", "cmake"];
const TORCH_FAMILY: &[&str] = &["torch", "torchvision", "torchaudio"];
/// Packages whose setup imports torch, so they must come after it.
const TORCH_DEPENDENT: &[&str] = &[
    "flash-attn",
    "xformers",
    "auto-gptq",
    "autoawq",
    "bitsandbytes",
    "deepspeed",
    "vllm",
];

/// Declared name → importable module, where they differ.
const IMPORT_NAME_OVERRIDES: &[(&str, &str)] = &[
    ("pyyaml", "yaml"),
    ("pillow", "PIL"),
    ("scikit-learn", "sklearn"),
    ("opencv-python", "cv2"),
    ("protobuf", "google.protobuf"),
    ("google-generativeai", "google.generativeai"),
];

/// Per-package result of one install run.
#[derive(Debug, Clone, Serialize)]
pub struct InstallOutcome {
    pub name: String,
    pub required: bool,
    pub success: bool,
    pub elapsed_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated result of one install run; never silently partial.
#[derive(Debug, Default, Serialize)]
pub struct InstallReport {
    pub outcomes: Vec<InstallOutcome>,
    /// Packages already satisfied before the run.
    pub skipped: Vec<String>,
}

impl InstallReport {
    /// Ready only if every required package succeeded.
    pub fn success(&self) -> bool {
        self.outcomes.iter().all(|o| o.success || !o.required)
    }

    pub fn failed_required(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| !o.success && o.required)
            .map(|o| o.name.clone())
            .collect()
    }
}

fn rank(normalized: &str) -> u8 {
    if normalized == "pip" || BUILD_TOOLING.contains(&normalized) {
        0
    } else if TORCH_FAMILY.contains(&normalized) {
        1
    } else if TORCH_DEPENDENT.contains(&normalized) {
        2
    } else {
        3
    }
}

/// Runs pip against a target environment.
pub struct PackageInstaller {
    registry: Arc<EnvironmentRegistry>,
}

impl PackageInstaller {
    pub fn new(registry: Arc<EnvironmentRegistry>) -> Self {
        Self { registry }
    }

    /// Fixed install order: build tooling, tensor runtime, its install-time
    /// importers, everything else. Stable within a rank.
    pub fn order_requirements(requirements: &[PackageRequirement]) -> Vec<PackageRequirement> {
        let mut ordered: Vec<PackageRequirement> = requirements.to_vec();
        ordered.sort_by_key(|r| rank(&r.normalized_name()));
        ordered
    }

    /// Install `requirements` into the environment at `env_dir`.
    ///
    /// Returns the structured report; `Err` is reserved for structural
    /// problems (missing interpreter), not package failures.
    pub async fn install(
        &self,
        env_name: &str,
        env_dir: &Path,
        backend: GpuBackend,
        requirements: &[PackageRequirement],
    ) -> Result<InstallReport, ProvisionError> {
        let python = find_interpreter(env_dir).ok_or_else(|| ProvisionError::InterpreterMissing {
            name: env_name.to_string(),
            path: env_dir.to_path_buf(),
        })?;

        let mut report = InstallReport::default();

        // Diff against the registry and the actually-installed probe; a
        // package found on disk but untracked heals the registry entry.
        let mut pending: Vec<PackageRequirement> = Vec::new();
        let mut heal: Vec<(String, String)> = Vec::new();
        for req in requirements {
            let normalized = req.normalized_name();
            if self.registry.is_package_tracked(env_name, &normalized) {
                report.skipped.push(normalized);
            } else if let Some(version) = dist_info_version(env_dir, &normalized) {
                heal.push((normalized.clone(), version));
                report.skipped.push(normalized);
            } else {
                pending.push(req.clone());
            }
        }
        if !heal.is_empty() {
            tracing::info!(
                environment = env_name,
                count = heal.len(),
                "Healing registry for installed-but-untracked packages"
            );
            if let Err(e) = self.registry.mark_packages_installed(env_name, &heal) {
                tracing::error!(error = %e, "Failed to persist registry heal");
            }
        }
        if pending.is_empty() {
            tracing::info!(environment = env_name, "All requested packages already satisfied");
            return Ok(report);
        }

        self.upgrade_pip(&python, env_dir).await;

        let ordered = Self::order_requirements(&pending);
        let mut installed: Vec<(String, String)> = Vec::new();
        for req in &ordered {
            let normalized = req.normalized_name();
            let start = Instant::now();
            let result = if TORCH_FAMILY.contains(&normalized.as_str()) {
                self.install_torch_package(&python, env_dir, req, backend).await
            } else {
                self.install_plain(&python, env_dir, req).await
            };

            let outcome = match result {
                Ok(()) => {
                    if self.verify_one(&python, env_dir, req).await {
                        let version = dist_info_version(env_dir, &normalized)
                            .unwrap_or_else(|| "unknown".to_string());
                        installed.push((normalized.clone(), version));
                        InstallOutcome {
                            name: normalized.clone(),
                            required: !req.optional,
                            success: true,
                            elapsed_secs: start.elapsed().as_secs_f64(),
                            error: None,
                        }
                    } else {
                        InstallOutcome {
                            name: normalized.clone(),
                            required: !req.optional,
                            success: false,
                            elapsed_secs: start.elapsed().as_secs_f64(),
                            error: Some("installed but failed verification".to_string()),
                        }
                    }
                }
                Err(detail) => InstallOutcome {
                    name: normalized.clone(),
                    required: !req.optional,
                    success: false,
                    elapsed_secs: start.elapsed().as_secs_f64(),
                    error: Some(detail),
                },
            };

            if !outcome.success {
                if req.optional {
                    tracing::warn!(
                        environment = env_name,
                        package = %normalized,
                        error = outcome.error.as_deref().unwrap_or(""),
                        "Optional package failed, continuing"
                    );
                } else {
                    tracing::error!(
                        environment = env_name,
                        package = %normalized,
                        error = outcome.error.as_deref().unwrap_or(""),
                        "Required package failed"
                    );
                }
            }
            report.outcomes.push(outcome);
        }

        // A later package can transitively pull a CPU-only torch wheel from
        // PyPI; force the CUDA build back without touching its dependents.
        if backend == GpuBackend::Cuda && installed.iter().any(|(n, _)| n == "torch") {
            self.reinstall_cuda_torch(&python, env_dir).await;
        }

        if let Err(e) = self.registry.mark_packages_installed(env_name, &installed) {
            tracing::error!(error = %e, "Failed to persist installed packages");
        }

        Ok(report)
    }

    /// Verify that `requirements` are present in the environment, using the
    /// cheapest strategy that answers: dist-info marker, then import probe,
    /// then pip metadata with bounded retry.
    pub async fn verify(
        &self,
        env_dir: &Path,
        requirements: &[PackageRequirement],
        label: &str,
    ) -> bool {
        let Some(python) = find_interpreter(env_dir) else {
            tracing::error!(label, path = %env_dir.display(), "No interpreter to verify against");
            return false;
        };
        let mut ok = true;
        for req in requirements {
            if self.verify_one(&python, env_dir, req).await {
                continue;
            }
            if req.optional {
                tracing::warn!(label, package = %req.name, "Optional package missing");
            } else {
                tracing::error!(label, package = %req.name, "Required package failed verification");
                ok = false;
            }
        }
        ok
    }

    async fn upgrade_pip(&self, python: &Path, env_dir: &Path) {
        let args = ["-m", "pip", "install", "--upgrade", "pip"];
        match run_sanitized(python, args, env_dir, PIP_TIMEOUT).await {
            Ok(out) if out.success => {}
            Ok(out) => {
                tracing::warn!(stderr = %out.stderr_tail(), "pip self-upgrade failed, continuing");
            }
            Err(e) => {
                tracing::warn!(error = %e, "pip self-upgrade did not run, continuing");
            }
        }
    }

    async fn pip_install(
        &self,
        python: &Path,
        env_dir: &Path,
        install_args: &[String],
        package: &str,
    ) -> Result<(), String> {
        let mut last_error = String::new();
        for attempt in 1..=INSTALL_ATTEMPTS {
            let mut args: Vec<String> = vec![
                "-m".to_string(),
                "pip".to_string(),
                "install".to_string(),
                "--no-input".to_string(),
            ];
            args.extend(install_args.iter().cloned());
            match run_sanitized(python, &args, env_dir, PIP_TIMEOUT).await {
                Ok(out) if out.success => return Ok(()),
                Ok(out) => {
                    last_error = out.stderr_tail();
                    tracing::warn!(
                        package,
                        attempt,
                        stderr = %last_error,
                        "pip install attempt failed"
                    );
                }
                Err(ProcessError::Spawn { program, source }) => {
                    // Structural: the interpreter itself is gone, retrying is pointless.
                    return Err(format!("failed to spawn {}: {}", program, source));
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(package, attempt, error = %last_error, "pip install attempt errored");
                }
            }
        }
        Err(last_error)
    }

    async fn install_plain(
        &self,
        python: &Path,
        env_dir: &Path,
        req: &PackageRequirement,
    ) -> Result<(), String> {
        self.pip_install(python, env_dir, &[req.spec_string()], &req.name)
            .await
    }

    /// Tensor-runtime packages come from the wheel index matching the
    /// backend, never from default PyPI.
    async fn install_torch_package(
        &self,
        python: &Path,
        env_dir: &Path,
        req: &PackageRequirement,
        backend: GpuBackend,
    ) -> Result<(), String> {
        let index = match backend {
            GpuBackend::Cuda => CUDA_WHEEL_INDEX,
            GpuBackend::Rocm => ROCM_WHEEL_INDEX,
            GpuBackend::Vulkan | GpuBackend::Cpu => CPU_WHEEL_INDEX,
        };

        let mut args: Vec<String> = Vec::new();
        if backend == GpuBackend::Cuda && cfg!(target_os = "windows") {
            for (name, constraint) in WINDOWS_CUDA_TORCH_PIN {
                args.push(format!("{}{}", name, constraint));
            }
        } else {
            args.push(req.spec_string());
        }
        args.push("--index-url".to_string());
        args.push(index.to_string());

        self.pip_install(python, env_dir, &args, &req.name).await
    }

    /// Corrective pass for CUDA environments: put the CUDA torch build back
    /// in place with `--no-deps` in case a transitive install displaced it.
    async fn reinstall_cuda_torch(&self, python: &Path, env_dir: &Path) {
        let args = vec![
            "torch".to_string(),
            "--force-reinstall".to_string(),
            "--no-deps".to_string(),
            "--index-url".to_string(),
            CUDA_WHEEL_INDEX.to_string(),
        ];
        if let Err(e) = self.pip_install(python, env_dir, &args, "torch").await {
            tracing::warn!(error = %e, "CUDA corrective reinstall of torch failed");
        }
    }

    async fn verify_one(&self, python: &Path, env_dir: &Path, req: &PackageRequirement) -> bool {
        let normalized = req.normalized_name();

        // Fastest: dist-info on disk, no process spawn.
        if dist_info_version(env_dir, &normalized).is_some() {
            return true;
        }

        // Import probe covers packages whose importable name differs from the
        // declared one and packages installed without metadata.
        let module = import_module_name(&normalized);
        let import_stmt = format!("import {}", module);
        if let Ok(out) = run_sanitized(
            python,
            ["-c", import_stmt.as_str()],
            env_dir,
            VERIFY_TIMEOUT,
        )
        .await
        {
            if out.success {
                return true;
            }
        }

        // pip metadata, with bounded retry for transient pip flakiness.
        for attempt in 1..=VERIFY_ATTEMPTS {
            match run_sanitized(
                python,
                ["-m", "pip", "show", normalized.as_str()],
                env_dir,
                VERIFY_TIMEOUT,
            )
            .await
            {
                Ok(out) if out.success => return true,
                Ok(_) => return false, // pip answered: not installed
                Err(e) => {
                    tracing::warn!(package = %normalized, attempt, error = %e, "pip show errored");
                    if attempt < VERIFY_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(VERIFY_BACKOFF_SECS * attempt as u64))
                            .await;
                    }
                }
            }
        }
        false
    }
}

fn import_module_name(normalized: &str) -> String {
    for (declared, module) in IMPORT_NAME_OVERRIDES {
        if *declared == normalized {
            return (*module).to_string();
        }
    }
    normalized.replace('-', "_")
}

/// Version recorded in the package's dist-info directory name, if present.
pub(crate) fn dist_info_version(env_dir: &Path, normalized: &str) -> Option<String> {
    let site_packages = site_packages_dir(env_dir)?;
    let entries = std::fs::read_dir(&site_packages).ok()?;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let Some(stem) = file_name.strip_suffix(".dist-info") else {
            continue;
        };
        let Some((name, version)) = stem.rsplit_once('-') else {
            continue;
        };
        if normalize_name(name) == normalized {
            return Some(version.to_string());
        }
    }
    None
}

fn site_packages_dir(env_dir: &Path) -> Option<PathBuf> {
    let windows = env_dir.join("Lib").join("site-packages");
    if windows.is_dir() {
        return Some(windows);
    }
    let lib = env_dir.join("lib");
    let entries = std::fs::read_dir(&lib).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with("python") {
            let candidate = entry.path().join("site-packages");
            if candidate.is_dir() {
                return Some(candidate);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn req(name: &str) -> PackageRequirement {
        PackageRequirement::required(name)
    }

    #[test]
    fn test_order_puts_torch_before_dependents() {
        let reqs = vec![req("flash-attn"), req("transformers"), req("torch"), req("ninja")];
        let ordered = PackageInstaller::order_requirements(&reqs);
        let pos = |name: &str| ordered.iter().position(|r| r.name == name).unwrap();
        assert!(pos("ninja") < pos("torch"));
        assert!(pos("torch") < pos("flash-attn"));
        assert!(pos("flash-attn") < pos("transformers"));
    }

    #[test]
    fn test_order_is_stable_within_rank() {
        let reqs = vec![req("numpy"), req("safetensors"), req("accelerate")];
        let ordered = PackageInstaller::order_requirements(&reqs);
        let names: Vec<&str> = ordered.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["numpy", "safetensors", "accelerate"]);
    }

    #[test]
    fn test_order_handles_name_variants() {
        let reqs = vec![req("Flash_Attn"), req("Torch")];
        let ordered = PackageInstaller::order_requirements(&reqs);
        assert_eq!(ordered[0].name, "Torch");
    }

    #[test]
    fn test_report_optional_failure_is_success() {
        let report = InstallReport {
            outcomes: vec![
                InstallOutcome {
                    name: "torch".into(),
                    required: true,
                    success: true,
                    elapsed_secs: 1.0,
                    error: None,
                },
                InstallOutcome {
                    name: "flash-attn".into(),
                    required: false,
                    success: false,
                    elapsed_secs: 1.0,
                    error: Some("no matching wheel".into()),
                },
            ],
            skipped: vec![],
        };
        assert!(report.success());
        assert!(report.failed_required().is_empty());
    }

    #[test]
    fn test_report_required_failure_names_package() {
        let report = InstallReport {
            outcomes: vec![
                InstallOutcome {
                    name: "torch".into(),
                    required: true,
                    success: true,
                    elapsed_secs: 1.0,
                    error: None,
                },
                InstallOutcome {
                    name: "transformers".into(),
                    required: true,
                    success: false,
                    elapsed_secs: 1.0,
                    error: Some("resolution failed".into()),
                },
            ],
            skipped: vec![],
        };
        assert!(!report.success());
        assert_eq!(report.failed_required(), vec!["transformers".to_string()]);
    }

    #[test]
    fn test_phi_cuda_scenario_order() {
        let family = crate::providers::resolve_family("phi");
        let reqs = crate::providers::requirements_for(&family, GpuBackend::Cuda);
        let ordered = PackageInstaller::order_requirements(&reqs);
        let pos = |name: &str| ordered.iter().position(|r| r.name == name).unwrap();
        assert!(pos("torch") < pos("transformers"));
        let transformers = ordered.iter().find(|r| r.name == "transformers").unwrap();
        assert_eq!(transformers.version_constraint, "==4.43.0");
    }

    #[test]
    fn test_import_module_name() {
        assert_eq!(import_module_name("pyyaml"), "yaml");
        assert_eq!(import_module_name("flash-attn"), "flash_attn");
        assert_eq!(import_module_name("numpy"), "numpy");
    }

    #[tokio::test]
    async fn test_verify_dist_info_fast_path() {
        use envlite_core::registry::EnvironmentRegistry;

        let tmp = TempDir::new().unwrap();
        let env_dir = tmp.path().join("env");
        std::fs::create_dir_all(env_dir.join("bin")).unwrap();
        std::fs::write(env_dir.join("bin").join("python"), "").unwrap();
        let site = env_dir.join("lib").join("python3.11").join("site-packages");
        std::fs::create_dir_all(site.join("numpy-1.26.4.dist-info")).unwrap();

        let registry = Arc::new(EnvironmentRegistry::open(tmp.path().join("reg.json")));
        let installer = PackageInstaller::new(registry);
        // dist-info answers without spawning a process
        assert!(installer.verify(&env_dir, &[req("numpy")], "base").await);
    }

    #[test]
    fn test_dist_info_version_probe() {
        let tmp = TempDir::new().unwrap();
        let site = tmp
            .path()
            .join("lib")
            .join("python3.11")
            .join("site-packages");
        std::fs::create_dir_all(site.join("Flash_Attn-2.5.8.dist-info")).unwrap();
        std::fs::create_dir_all(site.join("torch-2.3.1.dist-info")).unwrap();

        assert_eq!(
            dist_info_version(tmp.path(), "flash-attn").as_deref(),
            Some("2.5.8")
        );
        assert_eq!(dist_info_version(tmp.path(), "torch").as_deref(), Some("2.3.1"));
        assert!(dist_info_version(tmp.path(), "transformers").is_none());
    }
}
