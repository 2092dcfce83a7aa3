//! # Tool Dispatcher
//!
//! Uniform local invocation surface for registered tools and model backends.
//! The dispatcher guarantees: inputs contain the registered required
//! parameters, exceptions (panics) are caught and translated to error
//! results, and every invocation is bounded by a per-call timeout.
//!
//! Model backends implement [`LlmBackend`] (`generate(prompt, options) ->
//! text`) and are registered under `llm:<model_id>` names.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Structured outcome of a tool invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolResult {
    Success { payload: Value },
    Error { kind: String, message: String },
}

impl ToolResult {
    pub fn success(payload: Value) -> Self {
        ToolResult::Success { payload }
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ToolResult::Error {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolResult::Success { .. })
    }
}

/// A locally registered tool
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool. Implementations return domain errors as `Err`
    /// strings; the dispatcher folds them into [`ToolResult::Error`].
    async fn call(&self, params: Value) -> Result<Value, String>;
}

/// A model backend invoked through the dispatcher
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn generate(&self, prompt: &str, options: &Value) -> Result<String, String>;
}

/// Adapter registering an [`LlmBackend`] as a tool
struct LlmTool {
    backend: Arc<dyn LlmBackend>,
}

#[async_trait]
impl ToolHandler for LlmTool {
    async fn call(&self, params: Value) -> Result<Value, String> {
        let prompt = params
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing 'prompt' parameter".to_string())?;
        let options = params.get("options").cloned().unwrap_or(Value::Null);
        let text = self.backend.generate(prompt, &options).await?;
        Ok(Value::String(text))
    }
}

struct Registration {
    handler: Arc<dyn ToolHandler>,
    required_params: Vec<String>,
}

/// Registry and invocation surface for local tools
pub struct ToolDispatcher {
    tools: RwLock<HashMap<String, Registration>>,
    timeout: Duration,
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .tools
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        f.debug_struct("ToolDispatcher")
            .field("tools", &names)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ToolDispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Register a tool with the parameter names it requires
    pub fn register_tool(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
        required_params: Vec<String>,
    ) {
        let name = name.into();
        debug!(tool = %name, "Tool registered");
        self.tools
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                name,
                Registration {
                    handler,
                    required_params,
                },
            );
    }

    /// Register a model backend under `llm:<model_id>`
    pub fn register_llm(&self, model_id: &str, backend: Arc<dyn LlmBackend>) {
        self.register_tool(
            format!("llm:{model_id}"),
            Arc::new(LlmTool { backend }),
            vec!["prompt".to_string()],
        );
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Invoke a registered tool.
    ///
    /// Never returns an `Err`: every failure mode (unknown tool, missing
    /// params, timeout, panic, tool error) folds into [`ToolResult::Error`].
    pub async fn invoke(&self, name: &str, params: Value) -> ToolResult {
        let (handler, required) = {
            let tools = self.tools.read().unwrap_or_else(|p| p.into_inner());
            match tools.get(name) {
                Some(reg) => (reg.handler.clone(), reg.required_params.clone()),
                None => {
                    return ToolResult::error("unknown_tool", format!("no tool named '{name}'"));
                }
            }
        };

        for param in &required {
            if params.get(param).is_none() {
                return ToolResult::error(
                    "invalid_params",
                    format!("tool '{name}' requires parameter '{param}'"),
                );
            }
        }

        // Run in a spawned task so a panicking tool is contained
        let call = tokio::spawn(async move { handler.call(params).await });

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(Ok(payload))) => ToolResult::success(payload),
            Ok(Ok(Err(message))) => {
                warn!(tool = %name, error = %message, "Tool returned error");
                ToolResult::error("tool_failure", message)
            }
            Ok(Err(join_error)) => {
                warn!(tool = %name, error = %join_error, "Tool panicked");
                ToolResult::error("panic", join_error.to_string())
            }
            Err(_) => {
                warn!(tool = %name, timeout_ms = self.timeout.as_millis() as u64, "Tool invocation timed out");
                ToolResult::error(
                    "timeout",
                    format!("invocation exceeded {}ms", self.timeout.as_millis()),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl ToolHandler for Upper {
        async fn call(&self, params: Value) -> Result<Value, String> {
            let text = params["text"].as_str().ok_or("text must be a string")?;
            Ok(Value::String(text.to_uppercase()))
        }
    }

    struct Failing;

    #[async_trait]
    impl ToolHandler for Failing {
        async fn call(&self, _params: Value) -> Result<Value, String> {
            Err("deliberate failure".to_string())
        }
    }

    struct Panicking;

    #[async_trait]
    impl ToolHandler for Panicking {
        async fn call(&self, _params: Value) -> Result<Value, String> {
            panic!("tool exploded");
        }
    }

    struct Slow;

    #[async_trait]
    impl ToolHandler for Slow {
        async fn call(&self, _params: Value) -> Result<Value, String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    struct EchoBackend;

    #[async_trait]
    impl LlmBackend for EchoBackend {
        async fn generate(&self, prompt: &str, _options: &Value) -> Result<String, String> {
            Ok(prompt.to_string())
        }
    }

    fn dispatcher() -> ToolDispatcher {
        ToolDispatcher::new(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let d = dispatcher();
        d.register_tool("upper", Arc::new(Upper), vec!["text".to_string()]);

        let result = d.invoke("upper", json!({"text": "hello"})).await;
        assert_eq!(result, ToolResult::success(json!("HELLO")));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let d = dispatcher();
        let result = d.invoke("missing", json!({})).await;
        assert!(matches!(result, ToolResult::Error { kind, .. } if kind == "unknown_tool"));
    }

    #[tokio::test]
    async fn test_missing_required_param() {
        let d = dispatcher();
        d.register_tool("upper", Arc::new(Upper), vec!["text".to_string()]);

        let result = d.invoke("upper", json!({"other": 1})).await;
        assert!(matches!(result, ToolResult::Error { kind, .. } if kind == "invalid_params"));
    }

    #[tokio::test]
    async fn test_tool_error_translated() {
        let d = dispatcher();
        d.register_tool("failing", Arc::new(Failing), vec![]);

        let result = d.invoke("failing", json!({})).await;
        assert!(
            matches!(result, ToolResult::Error { kind, message } if kind == "tool_failure" && message.contains("deliberate"))
        );
    }

    #[tokio::test]
    async fn test_panic_contained() {
        let d = dispatcher();
        d.register_tool("boom", Arc::new(Panicking), vec![]);

        let result = d.invoke("boom", json!({})).await;
        assert!(matches!(result, ToolResult::Error { kind, .. } if kind == "panic"));
    }

    #[tokio::test]
    async fn test_timeout_bounded() {
        let d = dispatcher();
        d.register_tool("slow", Arc::new(Slow), vec![]);

        let result = d.invoke("slow", json!({})).await;
        assert!(matches!(result, ToolResult::Error { kind, .. } if kind == "timeout"));
    }

    #[tokio::test]
    async fn test_llm_registration_and_invoke() {
        let d = dispatcher();
        d.register_llm("default", Arc::new(EchoBackend));
        assert!(d.has_tool("llm:default"));

        let result = d.invoke("llm:default", json!({"prompt": "say hi"})).await;
        assert_eq!(result, ToolResult::success(json!("say hi")));

        let missing = d.invoke("llm:default", json!({})).await;
        assert!(matches!(missing, ToolResult::Error { kind, .. } if kind == "invalid_params"));
    }

    #[test]
    fn test_tool_result_wire_shape() {
        let ok = serde_json::to_value(ToolResult::success(json!(42))).unwrap();
        assert_eq!(ok, json!({"status": "success", "payload": 42}));

        let err = serde_json::to_value(ToolResult::error("timeout", "too slow")).unwrap();
        assert_eq!(
            err,
            json!({"status": "error", "kind": "timeout", "message": "too slow"})
        );
    }
}
