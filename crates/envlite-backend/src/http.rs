//! Request/response transport: the wire verbs POSTed to an HTTP worker.
//!
//! Stateless on this side apart from handle bookkeeping; the worker at
//! `base_url` keeps the interpreter and its object table across calls.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::protocol::{WireRequest, WireResponse};
use crate::{BackendError, ExecutionBackend, Handle, HandleTable};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
    handles: HandleTable,
}

impl HttpBackend {
    /// Backend POSTing to `<base_url>/execute`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_CALL_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Transport(format!("http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            handles: HandleTable::default(),
        })
    }

    async fn request(&self, request: &WireRequest) -> Result<WireResponse, BackendError> {
        let url = format!("{}/execute", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout {
                        secs: DEFAULT_CALL_TIMEOUT.as_secs(),
                    }
                } else {
                    BackendError::Transport(format!("POST {}: {}", url, e))
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Transport(format!(
                "POST {}: http {}",
                url, status
            )));
        }
        let response: WireResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Transport(format!("decode response: {}", e)))?;
        if response.ok {
            Ok(response)
        } else {
            Err(BackendError::Python(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }

    fn handle_from(&self, response: WireResponse) -> Result<Handle, BackendError> {
        let descriptor = response
            .handle
            .ok_or_else(|| BackendError::Transport("missing handle in response".to_string()))?;
        let handle = Handle::from_descriptor(descriptor);
        self.handles.admit(&handle);
        Ok(handle)
    }
}

#[async_trait]
impl ExecutionBackend for HttpBackend {
    async fn initialize(&self) -> Result<(), BackendError> {
        self.request(&WireRequest::Init).await?;
        Ok(())
    }

    async fn import_module(&self, name: &str) -> Result<Handle, BackendError> {
        let response = self
            .request(&WireRequest::ImportModule {
                name: name.to_string(),
            })
            .await?;
        self.handle_from(response)
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
        self.handle_from(response)
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
        self.handles.clear();
        Ok(())
    }
}
