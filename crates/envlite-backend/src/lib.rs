//! Uniform execution interface over interpreter transports.
//!
//! One contract, four implementations: an in-process embedding (feature
//! `embedded`) and three remote transports (pipe worker, TCP JSON-RPC,
//! HTTP). All verbs return values as JSON; interpreter-side objects are
//! referenced through opaque [`Handle`]s that only the owning backend can
//! resolve. Disposal is mandatory on every path — for remote transports a
//! leaked handle is a leaked remote resource.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

pub mod http;
pub mod pipe;
pub mod protocol;
pub mod rpc;

#[cfg(feature = "embedded")]
pub mod embedded;

use protocol::HandleDescriptor;

#[derive(Debug, Error)]
pub enum BackendError {
    /// Call against a disposed or foreign handle. Never a silent no-op.
    #[error("invalid handle: {id}")]
    InvalidHandle { id: String },

    #[error("backend not initialized")]
    NotInitialized,

    #[error("transport error: {0}")]
    Transport(String),

    /// The interpreter raised; message carries the remote traceback summary.
    #[error("python error: {0}")]
    Python(String),

    #[error("call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Opaque reference to an interpreter-side module or object.
///
/// Exclusively owned by the requesting caller until disposed; resolvable
/// only by the backend that minted it.
#[derive(Debug, Clone)]
pub struct Handle {
    id: String,
    type_name: String,
    valid: Arc<AtomicBool>,
}

impl Handle {
    pub(crate) fn new(id: String, type_name: String) -> Self {
        Self {
            id,
            type_name,
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn from_descriptor(descriptor: HandleDescriptor) -> Self {
        Self::new(descriptor.id, descriptor.type_name)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

/// Per-backend book-keeping of live handle ids.
#[derive(Default)]
pub(crate) struct HandleTable {
    ids: Mutex<HashSet<String>>,
}

impl HandleTable {
    pub(crate) fn admit(&self, handle: &Handle) {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.insert(handle.id.clone());
    }

    /// Error unless `handle` is valid and owned by this backend.
    pub(crate) fn check(&self, handle: &Handle) -> Result<(), BackendError> {
        let ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_valid() && ids.contains(&handle.id) {
            Ok(())
        } else {
            Err(BackendError::InvalidHandle {
                id: handle.id.clone(),
            })
        }
    }

    pub(crate) fn retire(&self, handle: &Handle) {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.remove(&handle.id);
        handle.invalidate();
    }

    pub(crate) fn clear(&self) {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.clear();
    }
}

/// The uniform contract every transport implements.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn initialize(&self) -> Result<(), BackendError>;

    async fn import_module(&self, name: &str) -> Result<Handle, BackendError>;

    async fn create_object(
        &self,
        module: &Handle,
        class: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Handle, BackendError>;

    async fn call_method(
        &self,
        handle: &Handle,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, BackendError>;

    async fn get_attribute(&self, handle: &Handle, name: &str) -> Result<Value, BackendError>;

    async fn set_attribute(
        &self,
        handle: &Handle,
        name: &str,
        value: Value,
    ) -> Result<(), BackendError>;

    /// Evaluate an expression (or run a statement block) with the given
    /// locals, returning its value or captured output.
    async fn evaluate(&self, expr: &str, locals: Map<String, Value>) -> Result<Value, BackendError>;

    async fn dispose_handle(&self, handle: &Handle) -> Result<(), BackendError>;

    async fn is_module_available(&self, name: &str) -> Result<bool, BackendError>;

    async fn shutdown(&self) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_table_lifecycle() {
        let table = HandleTable::default();
        let handle = Handle::new("h-1".to_string(), "module".to_string());
        table.admit(&handle);
        assert!(table.check(&handle).is_ok());

        table.retire(&handle);
        assert!(!handle.is_valid());
        let err = table.check(&handle).unwrap_err();
        assert!(matches!(err, BackendError::InvalidHandle { id } if id == "h-1"));
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let table = HandleTable::default();
        let foreign = Handle::new("h-elsewhere".to_string(), "object".to_string());
        assert!(table.check(&foreign).is_err());
    }

    #[test]
    fn test_clones_share_validity() {
        let table = HandleTable::default();
        let handle = Handle::new("h-2".to_string(), "object".to_string());
        table.admit(&handle);
        let clone = handle.clone();
        table.retire(&handle);
        assert!(!clone.is_valid());
    }
}
