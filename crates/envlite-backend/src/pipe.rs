//! Local byte-stream transport: a Python worker child on stdin/stdout.
//!
//! The worker is a static program (`pipe_worker.py`) speaking one JSON
//! request line → one JSON response line. The child runs the target
//! environment's interpreter, is killed on shutdown, and `kill_on_drop`
//! covers abandoned futures.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::protocol::{WireRequest, WireResponse};
use crate::{BackendError, ExecutionBackend, Handle, HandleTable};

const WORKER_PROGRAM: &str = include_str!("pipe_worker.py");
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: tokio::io::Lines<BufReader<ChildStdout>>,
}

pub struct PipeBackend {
    python: PathBuf,
    call_timeout: Duration,
    worker: Mutex<Option<Worker>>,
    handles: HandleTable,
}

impl PipeBackend {
    /// Backend driving the interpreter at `python` (typically
    /// `<env>/bin/python`).
    pub fn new(python: PathBuf) -> Self {
        Self {
            python,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            worker: Mutex::new(None),
            handles: HandleTable::default(),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    async fn request(&self, request: &WireRequest) -> Result<WireResponse, BackendError> {
        let mut guard = self.worker.lock().await;
        let worker = guard.as_mut().ok_or(BackendError::NotInitialized)?;

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        worker
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BackendError::Transport(format!("worker stdin: {}", e)))?;

        let response = tokio::time::timeout(self.call_timeout, worker.stdout.next_line())
            .await
            .map_err(|_| BackendError::Timeout {
                secs: self.call_timeout.as_secs(),
            })?
            .map_err(|e| BackendError::Transport(format!("worker stdout: {}", e)))?
            .ok_or_else(|| BackendError::Transport("worker exited".to_string()))?;

        let response: WireResponse = serde_json::from_str(&response)?;
        if response.ok {
            Ok(response)
        } else {
            Err(BackendError::Python(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }
}

#[async_trait]
impl ExecutionBackend for PipeBackend {
    async fn initialize(&self) -> Result<(), BackendError> {
        {
            let mut guard = self.worker.lock().await;
            if guard.is_some() {
                return Ok(());
            }
            let mut child = Command::new(&self.python)
                .args(["-u", "-c", WORKER_PROGRAM])
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .env_remove("PYTHONHOME")
                .env_remove("PYTHONPATH")
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    BackendError::Transport(format!(
                        "spawn {}: {}",
                        self.python.display(),
                        e
                    ))
                })?;

            let stdin = child.stdin.take().ok_or_else(|| {
                BackendError::Transport("worker stdin unavailable".to_string())
            })?;
            let stdout = child.stdout.take().ok_or_else(|| {
                BackendError::Transport("worker stdout unavailable".to_string())
            })?;
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        tracing::debug!(target: "envlite::worker", "{}", line);
                    }
                });
            }

            *guard = Some(Worker {
                child,
                stdin,
                stdout: BufReader::new(stdout).lines(),
            });
        }

        let response = self.request(&WireRequest::Init).await?;
        if let Some(Value::String(version)) = response.value {
            tracing::debug!(python = %version.replace('\n', " "), "Pipe worker ready");
        }
        Ok(())
    }

    async fn import_module(&self, name: &str) -> Result<Handle, BackendError> {
        let response = self
            .request(&WireRequest::ImportModule {
                name: name.to_string(),
            })
            .await?;
        let descriptor = response
            .handle
            .ok_or_else(|| BackendError::Transport("missing handle in response".to_string()))?;
        let handle = Handle::from_descriptor(descriptor);
        self.handles.admit(&handle);
        Ok(handle)
    }

    async fn create_object(
        &self,
        module: &Handle,
        class: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Handle, BackendError> {
        self.handles.check(module)?;
        let response = self
            .request(&WireRequest::CreateObject {
                module: module.id().to_string(),
                class: class.to_string(),
                args,
                kwargs,
            })
            .await?;
        let descriptor = response
            .handle
            .ok_or_else(|| BackendError::Transport("missing handle in response".to_string()))?;
        let handle = Handle::from_descriptor(descriptor);
        self.handles.admit(&handle);
        Ok(handle)
    }

    async fn call_method(
        &self,
        handle: &Handle,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, BackendError> {
        self.handles.check(handle)?;
        let response = self
            .request(&WireRequest::CallMethod {
                handle: handle.id().to_string(),
                method: method.to_string(),
                args,
                kwargs,
            })
            .await?;
        Ok(response.value.unwrap_or(Value::Null))
    }

    async fn get_attribute(&self, handle: &Handle, name: &str) -> Result<Value, BackendError> {
        self.handles.check(handle)?;
        let response = self
            .request(&WireRequest::GetAttribute {
                handle: handle.id().to_string(),
                name: name.to_string(),
            })
            .await?;
        Ok(response.value.unwrap_or(Value::Null))
    }

    async fn set_attribute(
        &self,
        handle: &Handle,
        name: &str,
        value: Value,
    ) -> Result<(), BackendError> {
        self.handles.check(handle)?;
        self.request(&WireRequest::SetAttribute {
            handle: handle.id().to_string(),
            name: name.to_string(),
            value,
        })
        .await?;
        Ok(())
    }

    async fn evaluate(&self, expr: &str, locals: Map<String, Value>) -> Result<Value, BackendError> {
        let response = self
            .request(&WireRequest::Evaluate {
                expr: expr.to_string(),
                locals,
            })
            .await?;
        Ok(response.value.unwrap_or(Value::Null))
    }

    async fn dispose_handle(&self, handle: &Handle) -> Result<(), BackendError> {
        self.handles.check(handle)?;
        // Local bookkeeping first: even if the worker call fails the handle
        // must never be usable again.
        self.handles.retire(handle);
        self.request(&WireRequest::DisposeHandle {
            handle: handle.id().to_string(),
        })
        .await?;
        Ok(())
    }

    async fn is_module_available(&self, name: &str) -> Result<bool, BackendError> {
        let response = self
            .request(&WireRequest::IsModuleAvailable {
                name: name.to_string(),
            })
            .await?;
        Ok(matches!(response.value, Some(Value::Bool(true))))
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        let _ = self.request(&WireRequest::Shutdown).await;
        let mut guard = self.worker.lock().await;
        if let Some(mut worker) = guard.take() {
            let _ = worker.child.kill().await;
        }
        self.handles.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disposed_handle_rejected_before_transport() {
        let backend = PipeBackend::new(PathBuf::from("python3"));
        let handle = Handle::new("h-1".to_string(), "module".to_string());
        backend.handles.admit(&handle);
        backend.handles.retire(&handle);

        // Fails on the handle check, never reaches the (absent) worker.
        let err = backend
            .call_method(&handle, "generate", vec![], Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidHandle { .. }));
    }

    #[tokio::test]
    async fn test_uninitialized_backend_errors() {
        let backend = PipeBackend::new(PathBuf::from("python3"));
        let err = backend.evaluate("1 + 1", Map::new()).await.unwrap_err();
        assert!(matches!(err, BackendError::NotInitialized));
    }
}
