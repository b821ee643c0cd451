//! In-process CPython embedding.
//!
//! Fastest transport: no serialization boundary, live `Py<PyAny>` objects in
//! the handle table. Every call runs inside `Python::with_gil` — the
//! interpreter-wide lock token is acquired scoped around each operation and
//! never held across an await point.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Mutex;

use async_trait::async_trait;
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyList, PyTuple};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{BackendError, ExecutionBackend, Handle, HandleTable};

pub struct EmbeddedBackend {
    objects: Mutex<HashMap<String, Py<PyAny>>>,
    handles: HandleTable,
}

impl Default for EmbeddedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddedBackend {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            handles: HandleTable::default(),
        }
    }

    fn admit(&self, object: Py<PyAny>, type_name: String) -> Handle {
        let handle = Handle::new(Uuid::new_v4().to_string(), type_name);
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.id().to_string(), object);
        self.handles.admit(&handle);
        handle
    }

    fn resolve(&self, handle: &Handle) -> Result<Py<PyAny>, BackendError> {
        self.handles.check(handle)?;
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects
            .get(handle.id())
            .map(|o| Python::with_gil(|py| o.clone_ref(py)))
            .ok_or_else(|| BackendError::InvalidHandle {
                id: handle.id().to_string(),
            })
    }
}

fn py_err(e: PyErr) -> BackendError {
    BackendError::Python(e.to_string())
}

fn json_to_py<'py>(py: Python<'py>, value: &Value) -> PyResult<Bound<'py, PyAny>> {
    Ok(match value {
        Value::Null => py.None().into_bound(py),
        Value::Bool(b) => PyBool::new(py, *b).to_owned().into_any(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into_pyobject(py)?.into_any()
            } else {
                n.as_f64().unwrap_or(f64::NAN).into_pyobject(py)?.into_any()
            }
        }
        Value::String(s) => s.into_pyobject(py)?.into_any(),
        Value::Array(items) => {
            let list = PyList::empty(py);
            for item in items {
                list.append(json_to_py(py, item)?)?;
            }
            list.into_any()
        }
        Value::Object(map) => {
            let dict = PyDict::new(py);
            for (key, item) in map {
                dict.set_item(key, json_to_py(py, item)?)?;
            }
            dict.into_any()
        }
    })
}

fn py_to_json(value: &Bound<'_, PyAny>) -> PyResult<Value> {
    if value.is_none() {
        return Ok(Value::Null);
    }
    if let Ok(b) = value.downcast::<PyBool>() {
        return Ok(Value::Bool(b.is_true()));
    }
    if let Ok(i) = value.extract::<i64>() {
        return Ok(Value::from(i));
    }
    if let Ok(f) = value.extract::<f64>() {
        return Ok(Value::from(f));
    }
    if let Ok(s) = value.extract::<String>() {
        return Ok(Value::String(s));
    }
    if let Ok(list) = value.downcast::<PyList>() {
        let mut items = Vec::with_capacity(list.len());
        for item in list.iter() {
            items.push(py_to_json(&item)?);
        }
        return Ok(Value::Array(items));
    }
    if let Ok(dict) = value.downcast::<PyDict>() {
        let mut map = Map::new();
        for (key, item) in dict.iter() {
            map.insert(key.str()?.to_string(), py_to_json(&item)?);
        }
        return Ok(Value::Object(map));
    }
    // Anything non-representable crosses the boundary as its repr.
    Ok(Value::String(value.str()?.to_string()))
}

fn args_tuple<'py>(py: Python<'py>, args: &[Value]) -> PyResult<Bound<'py, PyTuple>> {
    let converted: Vec<Bound<'py, PyAny>> = args
        .iter()
        .map(|a| json_to_py(py, a))
        .collect::<PyResult<_>>()?;
    PyTuple::new(py, converted)
}

fn kwargs_dict<'py>(py: Python<'py>, kwargs: &Map<String, Value>) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    for (key, value) in kwargs {
        dict.set_item(key, json_to_py(py, value)?)?;
    }
    Ok(dict)
}

#[async_trait]
impl ExecutionBackend for EmbeddedBackend {
    async fn initialize(&self) -> Result<(), BackendError> {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let version = py.version();
            tracing::debug!(python = version, "Embedded interpreter ready");
        });
        Ok(())
    }

    async fn import_module(&self, name: &str) -> Result<Handle, BackendError> {
        let module = Python::with_gil(|py| {
            py.import(name)
                .map(|m| m.into_any().unbind())
                .map_err(py_err)
        })?;
        Ok(self.admit(module, "module".to_string()))
    }

    async fn create_object(
        &self,
        module: &Handle,
        class: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Handle, BackendError> {
        let target = self.resolve(module)?;
        let (object, type_name) = Python::with_gil(|py| -> Result<_, BackendError> {
            let class_obj = target.bind(py).getattr(class).map_err(py_err)?;
            let args = args_tuple(py, &args).map_err(py_err)?;
            let kwargs = kwargs_dict(py, &kwargs).map_err(py_err)?;
            let object = class_obj.call(args, Some(&kwargs)).map_err(py_err)?;
            let type_name = object
                .get_type()
                .name()
                .map(|n| n.to_string())
                .unwrap_or_else(|_| "object".to_string());
            Ok((object.unbind(), type_name))
        })?;
        Ok(self.admit(object, type_name))
    }

    async fn call_method(
        &self,
        handle: &Handle,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, BackendError> {
        let target = self.resolve(handle)?;
        Python::with_gil(|py| -> Result<Value, BackendError> {
            let args = args_tuple(py, &args).map_err(py_err)?;
            let kwargs = kwargs_dict(py, &kwargs).map_err(py_err)?;
            let result = target
                .bind(py)
                .call_method(method, args, Some(&kwargs))
                .map_err(py_err)?;
            py_to_json(&result).map_err(py_err)
        })
    }

    async fn get_attribute(&self, handle: &Handle, name: &str) -> Result<Value, BackendError> {
        let target = self.resolve(handle)?;
        Python::with_gil(|py| {
            let value = target.bind(py).getattr(name).map_err(py_err)?;
            py_to_json(&value).map_err(py_err)
        })
    }

    async fn set_attribute(
        &self,
        handle: &Handle,
        name: &str,
        value: Value,
    ) -> Result<(), BackendError> {
        let target = self.resolve(handle)?;
        Python::with_gil(|py| {
            let value = json_to_py(py, &value).map_err(py_err)?;
            target.bind(py).setattr(name, value).map_err(py_err)
        })
    }

    async fn evaluate(&self, expr: &str, locals: Map<String, Value>) -> Result<Value, BackendError> {
        let code = CString::new(expr)
            .map_err(|_| BackendError::Python("expression contains NUL".to_string()))?;
        Python::with_gil(|py| -> Result<Value, BackendError> {
            let locals = kwargs_dict(py, &locals).map_err(py_err)?;
            match py.eval(code.as_c_str(), None, Some(&locals)) {
                Ok(result) => py_to_json(&result).map_err(py_err),
                Err(e) if e.is_instance_of::<pyo3::exceptions::PySyntaxError>(py) => {
                    // Statement block: run it and return captured stdout.
                    let io = py.import("io").map_err(py_err)?;
                    let buffer = io.call_method0("StringIO").map_err(py_err)?;
                    let contextlib = py.import("contextlib").map_err(py_err)?;
                    let redirect = contextlib
                        .call_method1("redirect_stdout", (&buffer,))
                        .map_err(py_err)?;
                    redirect.call_method0("__enter__").map_err(py_err)?;
                    let run_result = py.run(code.as_c_str(), None, Some(&locals));
                    redirect
                        .call_method1("__exit__", (py.None(), py.None(), py.None()))
                        .map_err(py_err)?;
                    run_result.map_err(py_err)?;
                    let captured: String = buffer
                        .call_method0("getvalue")
                        .and_then(|v| v.extract())
                        .map_err(py_err)?;
                    Ok(Value::String(captured))
                }
                Err(e) => Err(py_err(e)),
            }
        })
    }

    async fn dispose_handle(&self, handle: &Handle) -> Result<(), BackendError> {
        self.handles.check(handle)?;
        self.handles.retire(handle);
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(handle.id());
        Ok(())
    }

    async fn is_module_available(&self, name: &str) -> Result<bool, BackendError> {
        Python::with_gil(|py| {
            let util = py.import("importlib.util").map_err(py_err)?;
            let spec = util.call_method1("find_spec", (name,)).map_err(|_| {
                // find_spec raises for nonsense names; treat as unavailable
                BackendError::Python(format!("find_spec failed for {}", name))
            });
            match spec {
                Ok(spec) => Ok(!spec.is_none()),
                Err(_) => Ok(false),
            }
        })
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.handles.clear();
        Ok(())
    }
}
