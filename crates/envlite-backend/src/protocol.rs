//! Wire protocol shared by the remote transports.
//!
//! Requests are structured objects serialized at the transport boundary —
//! no interpolated source text ever crosses a transport. Handle ids are
//! plain strings minted by the side that owns the live object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WireRequest {
    Init,
    ImportModule {
        name: String,
    },
    CreateObject {
        module: String,
        class: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
    CallMethod {
        handle: String,
        method: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
    GetAttribute {
        handle: String,
        name: String,
    },
    SetAttribute {
        handle: String,
        name: String,
        value: Value,
    },
    Evaluate {
        expr: String,
        locals: Map<String, Value>,
    },
    DisposeHandle {
        handle: String,
    },
    IsModuleAvailable {
        name: String,
    },
    Shutdown,
}

impl WireRequest {
    /// Method name used by the RPC transport's envelope.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::ImportModule { .. } => "import_module",
            Self::CreateObject { .. } => "create_object",
            Self::CallMethod { .. } => "call_method",
            Self::GetAttribute { .. } => "get_attribute",
            Self::SetAttribute { .. } => "set_attribute",
            Self::Evaluate { .. } => "evaluate",
            Self::DisposeHandle { .. } => "dispose_handle",
            Self::IsModuleAvailable { .. } => "is_module_available",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Handle as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleDescriptor {
    pub id: String,
    pub type_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireResponse {
    pub ok: bool,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub handle: Option<HandleDescriptor>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip() {
        let req = WireRequest::CallMethod {
            handle: "h-1".to_string(),
            method: "generate".to_string(),
            args: vec![json!("prompt")],
            kwargs: Map::new(),
        };
        let text = serde_json::to_string(&req).unwrap();
        assert!(text.contains("\"op\":\"call_method\""));
        let back: WireRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back.method(), "call_method");
    }

    #[test]
    fn test_response_tolerates_null_fields() {
        let resp: WireResponse =
            serde_json::from_str(r#"{"ok":true,"value":null,"handle":null,"error":null}"#).unwrap();
        assert!(resp.ok);
        assert!(resp.value.is_none());
        assert!(resp.handle.is_none());
    }

    #[test]
    fn test_response_with_handle() {
        let resp: WireResponse = serde_json::from_str(
            r#"{"ok":true,"handle":{"id":"abc","type_name":"module"}}"#,
        )
        .unwrap();
        let handle = resp.handle.unwrap();
        assert_eq!(handle.id, "abc");
        assert_eq!(handle.type_name, "module");
    }
}
