//! Hardware acceleration backend detection.
//!
//! Detection spawns external diagnostic tools, so the result is memoized for
//! the lifetime of the process. Probe order: ROCm → CUDA → Vulkan → CPU;
//! first success wins. `ENVLITE_FORCE_BACKEND` overrides the probe entirely
//! (air-gapped hosts, tests).

use std::fmt;
use std::path::Path;
use std::time::Duration;

use tokio::sync::OnceCell;

use crate::process::run_sanitized;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Acceleration path chosen for an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuBackend {
    Cuda,
    Rocm,
    Vulkan,
    Cpu,
}

impl GpuBackend {
    /// Identity suffix, e.g. `cuda` in `phi-cuda`.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Rocm => "rocm",
            Self::Vulkan => "vulkan",
            Self::Cpu => "cpu",
        }
    }

    pub fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "cuda" => Some(Self::Cuda),
            "rocm" => Some(Self::Rocm),
            "vulkan" => Some(Self::Vulkan),
            "cpu" => Some(Self::Cpu),
            _ => None,
        }
    }

    pub fn all() -> [Self; 4] {
        [Self::Cuda, Self::Rocm, Self::Vulkan, Self::Cpu]
    }
}

impl fmt::Display for GpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Backend declared by an environment name's suffix, if any. Pure.
pub fn backend_from_name(name: &str) -> Option<GpuBackend> {
    let (_, suffix) = name.rsplit_once('-')?;
    GpuBackend::from_suffix(suffix)
}

/// Append `backend`'s suffix unless `name` already declares one. Pure.
pub fn apply_suffix(name: &str, backend: GpuBackend) -> String {
    if backend_from_name(name).is_some() {
        name.to_string()
    } else {
        format!("{}-{}", name, backend.suffix())
    }
}

/// Append the detected backend's suffix to `name`.
///
/// Already-suffixed names pass through unchanged without touching the
/// hardware, so identity computation stays idempotent.
pub async fn append_backend_suffix(name: &str) -> String {
    if backend_from_name(name).is_some() {
        return name.to_string();
    }
    apply_suffix(name, detect_backend().await)
}

static DETECTED: OnceCell<GpuBackend> = OnceCell::const_new();

/// Detect the host's acceleration backend, memoized per process.
pub async fn detect_backend() -> GpuBackend {
    *DETECTED.get_or_init(probe_host).await
}

async fn probe_host() -> GpuBackend {
    if let Some(forced) = envlite_core::config::env_optional("ENVLITE_FORCE_BACKEND") {
        match GpuBackend::from_suffix(forced.trim()) {
            Some(backend) => {
                tracing::info!(%backend, "Backend forced via ENVLITE_FORCE_BACKEND");
                return backend;
            }
            None => {
                tracing::warn!(value = %forced, "Unknown ENVLITE_FORCE_BACKEND, probing hardware");
            }
        }
    }

    // ROCm first: machines with both stacks installed usually carry a
    // vestigial nvidia-smi from the distro.
    let probes: [(&str, &[&str], GpuBackend); 4] = [
        ("rocm-smi", &["--showid"], GpuBackend::Rocm),
        ("rocminfo", &[], GpuBackend::Rocm),
        ("nvidia-smi", &["-L"], GpuBackend::Cuda),
        ("vulkaninfo", &["--summary"], GpuBackend::Vulkan),
    ];

    for (tool, args, backend) in probes {
        match run_sanitized(tool, args.iter().copied(), Path::new("/"), PROBE_TIMEOUT).await {
            Ok(out) if out.success => {
                tracing::info!(%backend, tool, "Hardware acceleration detected");
                return backend;
            }
            Ok(out) => {
                tracing::debug!(tool, exit_code = out.exit_code, "Probe reported no device");
            }
            Err(e) => {
                tracing::debug!(tool, error = %e, "Probe unavailable");
            }
        }
    }

    tracing::info!("No hardware acceleration found, using CPU backend");
    GpuBackend::Cpu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_name() {
        assert_eq!(backend_from_name("phi-cuda"), Some(GpuBackend::Cuda));
        assert_eq!(backend_from_name("llama-rocm"), Some(GpuBackend::Rocm));
        assert_eq!(backend_from_name("mistral-cpu"), Some(GpuBackend::Cpu));
        assert_eq!(backend_from_name("phi"), None);
        assert_eq!(backend_from_name("phi-3-mini"), None);
    }

    #[test]
    fn test_apply_suffix_idempotent() {
        assert_eq!(apply_suffix("phi", GpuBackend::Cuda), "phi-cuda");
        // Already-declared names are never re-suffixed
        assert_eq!(apply_suffix("phi-cuda", GpuBackend::Rocm), "phi-cuda");
        assert_eq!(apply_suffix("phi-cpu", GpuBackend::Cuda), "phi-cpu");
    }

    #[test]
    fn test_suffix_roundtrip() {
        for backend in GpuBackend::all() {
            assert_eq!(GpuBackend::from_suffix(backend.suffix()), Some(backend));
        }
    }
}
