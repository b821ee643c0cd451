//! RPC transport: the wire verbs as JSON-RPC 2.0 over a TCP stream.
//!
//! One request line → one response line, same framing as the stdio RPC
//! surface, pointed at a socket. The remote end hosts the interpreter and
//! owns the live objects; this side only ever sees handle ids.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::protocol::{WireRequest, WireResponse};
use crate::{BackendError, ExecutionBackend, Handle, HandleTable};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

struct Connection {
    reader: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

pub struct RpcBackend {
    addr: String,
    call_timeout: Duration,
    next_id: AtomicU64,
    connection: Mutex<Option<Connection>>,
    handles: HandleTable,
}

impl RpcBackend {
    /// Backend speaking to a worker at `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            next_id: AtomicU64::new(1),
            connection: Mutex::new(None),
            handles: HandleTable::default(),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    async fn request(&self, request: &WireRequest) -> Result<WireResponse, BackendError> {
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(BackendError::NotInitialized)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": request.method(),
            "params": request,
        });
        let mut line = envelope.to_string();
        line.push('\n');
        connection
            .writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BackendError::Transport(format!("rpc write: {}", e)))?;

        let response = tokio::time::timeout(self.call_timeout, connection.reader.next_line())
            .await
            .map_err(|_| BackendError::Timeout {
                secs: self.call_timeout.as_secs(),
            })?
            .map_err(|e| BackendError::Transport(format!("rpc read: {}", e)))?
            .ok_or_else(|| BackendError::Transport("connection closed".to_string()))?;

        let envelope: Value = serde_json::from_str(&response)?;
        if let Some(error) = envelope.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown rpc error");
            return Err(BackendError::Transport(message.to_string()));
        }
        let result = envelope
            .get("result")
            .cloned()
            .ok_or_else(|| BackendError::Transport("response missing result".to_string()))?;
        let response: WireResponse = serde_json::from_value(result)?;
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
impl ExecutionBackend for RpcBackend {
    async fn initialize(&self) -> Result<(), BackendError> {
        {
            let mut guard = self.connection.lock().await;
            if guard.is_none() {
                let stream = TcpStream::connect(&self.addr)
                    .await
                    .map_err(|e| BackendError::Transport(format!("connect {}: {}", self.addr, e)))?;
                let (read, write) = stream.into_split();
                *guard = Some(Connection {
                    reader: BufReader::new(read).lines(),
                    writer: write,
                });
            }
        }
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
        let mut guard = self.connection.lock().await;
        guard.take();
        self.handles.clear();
        Ok(())
    }
}
