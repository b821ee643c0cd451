//! Composition root.
//!
//! Owns the registry, environment manager, session manager and per-session
//! execution backends, and exposes the narrow contract provider glue is
//! allowed to call: ensure environment, create session, execute code,
//! package status. Glue never touches pip or the filesystem directly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use envlite_backend::http::HttpBackend;
use envlite_backend::pipe::PipeBackend;
use envlite_backend::rpc::RpcBackend;
use envlite_backend::ExecutionBackend;
use envlite_core::config::SessionConfig;
use envlite_core::registry::{find_interpreter, EnvironmentRegistry};
use envlite_provision::identity::NamingStrategy;
use envlite_provision::manager::{EnvironmentManager, PackageStatus};
use envlite_session::{Session, SessionManager, SessionMetrics};

/// Result of one code execution, as handed to collaborators.
#[derive(Debug, Serialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }
}

pub struct Orchestrator {
    registry: Arc<EnvironmentRegistry>,
    manager: EnvironmentManager,
    sessions: SessionManager,
    session_cfg: SessionConfig,
    backends: tokio::sync::Mutex<HashMap<String, Arc<dyn ExecutionBackend>>>,
}

impl Orchestrator {
    /// Orchestrator against the configured data root.
    pub fn new() -> Self {
        Self::with_paths(
            envlite_core::config::registry_path(),
            envlite_core::config::envs_root(),
            NamingStrategy::from_env(),
            SessionConfig::from_env(),
        )
    }

    pub fn with_paths(
        registry_path: PathBuf,
        envs_root: PathBuf,
        strategy: NamingStrategy,
        session_cfg: SessionConfig,
    ) -> Self {
        let registry = Arc::new(EnvironmentRegistry::open(registry_path));
        let manager = EnvironmentManager::new(registry.clone(), envs_root, strategy);
        let sessions = SessionManager::new(
            session_cfg.capacity,
            Duration::from_secs(session_cfg.acquire_timeout_secs),
        );
        Self {
            registry,
            manager,
            sessions,
            session_cfg,
            backends: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Ensure the environment for `provider` (+`model`); `None` on failure.
    pub async fn ensure_provider_environment(
        &self,
        provider: &str,
        model: Option<&str>,
    ) -> Option<PathBuf> {
        self.manager.ensure_environment(provider, model).await
    }

    /// Per-package status report for `provider`.
    pub async fn provider_package_status(&self, provider: &str) -> Vec<PackageStatus> {
        self.manager.provider_package_status(provider).await
    }

    /// Create a session for `user`, provisioning and binding the provider's
    /// environment when one is named.
    pub async fn create_session(
        &self,
        user: &str,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Result<Session> {
        let environment = match provider {
            Some(provider) => {
                let path = self
                    .manager
                    .ensure_environment(provider, model)
                    .await
                    .with_context(|| format!("environment for {} is not available", provider))?;
                Some(
                    path.file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default(),
                )
            }
            None => None,
        };
        let session = self
            .sessions
            .create_session(user, environment.as_deref())
            .await?;
        Ok(session)
    }

    /// Execute `code` in a session's environment.
    ///
    /// Without a session id, an ephemeral session is created for the call
    /// (the concurrency cap still applies) and terminated afterwards.
    pub async fn execute_code(&self, code: &str, session_id: Option<&str>) -> ExecutionOutcome {
        match session_id {
            Some(id) => self.execute_in_session(code, id).await,
            None => {
                let session = match self.sessions.create_session("anonymous", None).await {
                    Ok(session) => session,
                    Err(e) => return ExecutionOutcome::failure(e.to_string()),
                };
                let outcome = self.execute_in_session(code, &session.id).await;
                if let Err(e) = self.terminate_session(&session.id).await {
                    tracing::warn!(error = %e, "Failed to tear down ephemeral session");
                }
                outcome
            }
        }
    }

    async fn execute_in_session(&self, code: &str, session_id: &str) -> ExecutionOutcome {
        let Some(session) = self.sessions.get_session(session_id) else {
            return ExecutionOutcome::failure(format!("session not found: {}", session_id));
        };
        let _ = self.sessions.update_activity(session_id);

        let backend = match self.backend_for(&session).await {
            Ok(backend) => backend,
            Err(e) => return ExecutionOutcome::failure(e.to_string()),
        };

        match backend.evaluate(code, serde_json::Map::new()).await {
            Ok(value) => {
                let output = match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                for line in output.lines() {
                    let _ = self.sessions.append_output(session_id, line);
                }
                ExecutionOutcome {
                    success: true,
                    output,
                    error: None,
                }
            }
            Err(e) => ExecutionOutcome::failure(e.to_string()),
        }
    }

    /// Backend bound to the session, spawning its worker on first use.
    async fn backend_for(&self, session: &Session) -> Result<Arc<dyn ExecutionBackend>> {
        let mut backends = self.backends.lock().await;
        if let Some(backend) = backends.get(&session.id) {
            return Ok(backend.clone());
        }

        let python = match &session.bound_environment {
            Some(env_name) => {
                let path = self
                    .registry
                    .registered_path(env_name)
                    .with_context(|| format!("environment {} is no longer valid", env_name))?;
                find_interpreter(&path)
                    .with_context(|| format!("no interpreter in {}", path.display()))?
            }
            None => host_interpreter()?,
        };

        let backend = make_backend(python)?;
        backend
            .initialize()
            .await
            .context("failed to start execution worker")?;
        backends.insert(session.id.clone(), backend.clone());
        Ok(backend)
    }

    /// Terminate a session and shut down its worker.
    pub async fn terminate_session(&self, session_id: &str) -> Result<Session> {
        let backend = self.backends.lock().await.remove(session_id);
        if let Some(backend) = backend {
            if let Err(e) = backend.shutdown().await {
                tracing::warn!(session = session_id, error = %e, "Worker shutdown failed");
            }
        }
        Ok(self.sessions.terminate(session_id)?)
    }

    /// Sweep idle sessions and their workers.
    pub async fn sweep_idle(&self) -> usize {
        let swept = self
            .sessions
            .cleanup(Duration::from_secs(self.session_cfg.idle_max_age_secs));
        let mut backends = self.backends.lock().await;
        for id in &swept {
            if let Some(backend) = backends.remove(id) {
                tokio::spawn(async move {
                    let _ = backend.shutdown().await;
                });
            }
        }
        swept.len()
    }

    pub fn session_metrics(&self) -> SessionMetrics {
        self.sessions.metrics()
    }

    /// Registered environment names with their paths.
    pub fn list_environments(&self) -> Vec<(String, PathBuf)> {
        self.registry
            .environment_names()
            .into_iter()
            .filter_map(|name| {
                self.registry
                    .entry(&name)
                    .map(|entry| (name, entry.path))
            })
            .collect()
    }
}

fn host_interpreter() -> Result<PathBuf> {
    which::which("python3")
        .or_else(|_| which::which("python"))
        .context("no python interpreter found on PATH")
}

/// Transport selected by `ENVLITE_EXEC_BACKEND` (`pipe` default, `http`,
/// `rpc`, `embedded` with the feature). Remote transports host their own
/// interpreter, so `python` only drives the pipe worker.
fn make_backend(python: PathBuf) -> Result<Arc<dyn ExecutionBackend>> {
    match envlite_core::config::env_optional("ENVLITE_EXEC_BACKEND").as_deref() {
        None | Some("pipe") => Ok(Arc::new(PipeBackend::new(python))),
        Some("http") => {
            let url = envlite_core::config::env_optional("ENVLITE_WORKER_URL")
                .context("ENVLITE_WORKER_URL required for the http backend")?;
            Ok(Arc::new(HttpBackend::new(url)?))
        }
        Some("rpc") => {
            let addr = envlite_core::config::env_optional("ENVLITE_WORKER_ADDR")
                .context("ENVLITE_WORKER_ADDR required for the rpc backend")?;
            Ok(Arc::new(RpcBackend::new(addr)))
        }
        #[cfg(feature = "embedded")]
        Some("embedded") => Ok(Arc::new(envlite_backend::embedded::EmbeddedBackend::new())),
        Some(other) => anyhow::bail!("unknown execution backend: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envlite_provision::manager::PackageStatusKind;
    use tempfile::TempDir;

    fn orchestrator(tmp: &TempDir) -> Orchestrator {
        Orchestrator::with_paths(
            tmp.path().join("environments.json"),
            tmp.path().join("envs"),
            NamingStrategy::PerFamily,
            SessionConfig {
                capacity: 2,
                acquire_timeout_secs: 1,
                idle_max_age_secs: 60,
            },
        )
    }

    #[tokio::test]
    async fn test_status_without_environment() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(&tmp);
        let statuses = orch.provider_package_status("cohere").await;
        assert!(!statuses.is_empty());
        assert!(statuses
            .iter()
            .all(|s| s.status == PackageStatusKind::NotProvisioned));
    }

    #[tokio::test]
    async fn test_execute_unknown_session_fails() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(&tmp);
        let outcome = orch.execute_code("1 + 1", Some("no-such-session")).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("session not found"));
    }

    #[tokio::test]
    async fn test_session_without_provider() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(&tmp);
        let session = orch.create_session("alice", None, None).await.unwrap();
        assert!(session.bound_environment.is_none());
        orch.terminate_session(&session.id).await.unwrap();
        assert_eq!(orch.session_metrics().active, 0);
    }

    #[tokio::test]
    async fn test_list_environments_empty() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(&tmp);
        assert!(orch.list_environments().is_empty());
    }
}
