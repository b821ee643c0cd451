//! Collaborator stdio RPC: JSON-RPC 2.0 over stdio.
//!
//! **Entry**: `envlite serve --stdio`
//!
//! One request per line, one response per line. Provider glue talks to the
//! orchestrator exclusively through this surface (or the library API); it
//! never touches pip or the environment directories itself.
//!
//! Request: `{"jsonrpc":"2.0","id":1,"method":"ensure"|"status"|...,"params":{...}}`
//! Response: `{"jsonrpc":"2.0","id":1,"result":{...}}` or `{"jsonrpc":"2.0","id":1,"error":{...}}`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::orchestrator::Orchestrator;

/// Maximum request size (10 MB) to prevent OOM on malformed input.
const MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Run the stdio RPC loop until stdin closes.
pub async fn serve_stdio(orchestrator: Arc<Orchestrator>) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(Value, Result<Value, String>)>();

    // Writer task: responses are serialized to stdout in completion order.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some((id, result)) = rx.recv().await {
            let response = match result {
                Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                Err(message) => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32603, "message": message}
                }),
            };
            let mut line = response.to_string();
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    // Background idle sweep reclaims abandoned session slots.
    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(IDLE_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let swept = orchestrator.sweep_idle().await;
                if swept > 0 {
                    tracing::info!(swept, "Idle session sweep");
                }
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("read stdin")? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line.len() > MAX_REQUEST_SIZE {
            let _ = tx.send((Value::Null, Err("request exceeds 10MB size limit".to_string())));
            continue;
        }

        let request: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.send((Value::Null, Err(format!("parse error: {}", e))));
                continue;
            }
        };

        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or("")
            .to_string();
        let params = request
            .get("params")
            .cloned()
            .unwrap_or(Value::Object(serde_json::Map::new()));

        let orchestrator = orchestrator.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = dispatch_request(&orchestrator, &method, &params)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send((id, result));
        });
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}

async fn dispatch_request(
    orchestrator: &Orchestrator,
    method: &str,
    params: &Value,
) -> Result<Value> {
    match method {
        "ensure" => handle_ensure(orchestrator, params).await,
        "status" => handle_status(orchestrator, params).await,
        "execute" => handle_execute(orchestrator, params).await,
        "session_create" => handle_session_create(orchestrator, params).await,
        "session_terminate" => handle_session_terminate(orchestrator, params).await,
        "detect" => handle_detect().await,
        "metrics" => Ok(serde_json::to_value(orchestrator.session_metrics())?),
        _ => anyhow::bail!("Method not found: {}", method),
    }
}

async fn handle_ensure(orchestrator: &Orchestrator, params: &Value) -> Result<Value> {
    let p = params.as_object().context("params must be object")?;
    let provider = p
        .get("provider")
        .and_then(|v| v.as_str())
        .context("provider required")?;
    let model = p.get("model").and_then(|v| v.as_str());

    let path = orchestrator.ensure_provider_environment(provider, model).await;
    Ok(json!({
        "ready": path.is_some(),
        "path": path.map(|p| p.to_string_lossy().to_string()),
    }))
}

async fn handle_status(orchestrator: &Orchestrator, params: &Value) -> Result<Value> {
    let p = params.as_object().context("params must be object")?;
    let provider = p
        .get("provider")
        .and_then(|v| v.as_str())
        .context("provider required")?;

    let statuses = orchestrator.provider_package_status(provider).await;
    Ok(serde_json::to_value(statuses)?)
}

async fn handle_execute(orchestrator: &Orchestrator, params: &Value) -> Result<Value> {
    let p = params.as_object().context("params must be object")?;
    let code = p.get("code").and_then(|v| v.as_str()).context("code required")?;
    let session = p.get("session").and_then(|v| v.as_str());

    let outcome = orchestrator.execute_code(code, session).await;
    Ok(serde_json::to_value(outcome)?)
}

async fn handle_session_create(orchestrator: &Orchestrator, params: &Value) -> Result<Value> {
    let p = params.as_object().context("params must be object")?;
    let user = p.get("user").and_then(|v| v.as_str()).context("user required")?;
    let provider = p.get("provider").and_then(|v| v.as_str());
    let model = p.get("model").and_then(|v| v.as_str());

    let session = orchestrator.create_session(user, provider, model).await?;
    Ok(serde_json::to_value(session)?)
}

async fn handle_session_terminate(orchestrator: &Orchestrator, params: &Value) -> Result<Value> {
    let p = params.as_object().context("params must be object")?;
    let session = p
        .get("session")
        .and_then(|v| v.as_str())
        .context("session required")?;

    orchestrator.terminate_session(session).await?;
    Ok(json!({"ok": true}))
}

async fn handle_detect() -> Result<Value> {
    let backend = envlite_provision::gpu::detect_backend().await;
    Ok(json!({"backend": backend.suffix()}))
}
