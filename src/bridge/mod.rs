pub mod accumulator;
pub mod interpreter;
pub mod invoker;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, warn};

use crate::catalog::ToolDefinition;
use crate::config::BridgeConfig;

pub use interpreter::{ResultInterpreter, ToolResult};
pub use invoker::{InvokerLimits, ProcessInvoker};

pub const CALL_SUBCOMMAND: &str = "call";
pub const CONFIG_FLAG: &str = "--config";
pub const ARGS_FLAG: &str = "--args";

/// Tool contract the agent runtime invokes. `execute` always resolves.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;
    fn label(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> &Value;
    async fn execute(
        &self,
        call_id: &str,
        params: Value,
        cancel: Option<CancellationToken>,
    ) -> ToolResult;
}

#[derive(Debug)]
struct BridgeSettings {
    command: String,
    config_path: Option<PathBuf>,
    timeout_ms: u64,
    invoker: ProcessInvoker,
    interpreter: ResultInterpreter,
}

/// Adapts catalog tool definitions into subprocess-backed handlers.
#[derive(Debug, Clone)]
pub struct ToolBridge {
    settings: Arc<BridgeSettings>,
}

impl ToolBridge {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            settings: Arc::new(BridgeSettings {
                command: config.command.clone(),
                config_path: config.config_path.clone(),
                timeout_ms: config.timeout_ms,
                invoker: ProcessInvoker::new(InvokerLimits {
                    max_output_chars: config.max_output_chars,
                    keep_partial_stdout_on_timeout: config.keep_partial_stdout_on_timeout,
                }),
                interpreter: ResultInterpreter::new(config.partial_output_chars),
            }),
        }
    }

    pub fn handlers(&self, definitions: &[ToolDefinition]) -> Vec<Arc<dyn ToolHandler>> {
        definitions
            .iter()
            .map(|definition| Arc::new(self.bridge_tool(definition)) as Arc<dyn ToolHandler>)
            .collect()
    }

    pub fn handler(
        &self,
        definitions: &[ToolDefinition],
        name: &str,
    ) -> Option<Arc<dyn ToolHandler>> {
        definitions
            .iter()
            .find(|definition| definition.name == name)
            .map(|definition| Arc::new(self.bridge_tool(definition)) as Arc<dyn ToolHandler>)
    }

    pub fn bridge_tool(&self, definition: &ToolDefinition) -> BridgedTool {
        BridgedTool {
            label: humanize_tool_name(&definition.name),
            definition: definition.clone(),
            settings: self.settings.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgedTool {
    definition: ToolDefinition,
    label: String,
    settings: Arc<BridgeSettings>,
}

impl BridgedTool {
    pub fn argv(&self, params: &Map<String, Value>) -> Vec<String> {
        build_call_argv(
            self.settings.config_path.as_deref(),
            &self.definition.name,
            params,
        )
    }

    async fn run(
        settings: Arc<BridgeSettings>,
        argv: Vec<String>,
        cancel: Option<CancellationToken>,
    ) -> ToolResult {
        let outcome = settings
            .invoker
            .run(
                &settings.command,
                &argv,
                Some(settings.timeout_ms),
                cancel,
            )
            .await;
        debug!(
            "bridge call finished (termination={}, exit_code={:?}, duration_ms={}, stdout_truncated={}, stderr_truncated={})",
            outcome.termination.as_str(),
            outcome.exit_code,
            outcome.duration_ms,
            outcome.stdout_truncated,
            outcome.stderr_truncated
        );
        settings.interpreter.interpret(&outcome)
    }
}

#[async_trait]
impl ToolHandler for BridgedTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    fn parameters(&self) -> &Value {
        &self.definition.parameters
    }

    async fn execute(
        &self,
        call_id: &str,
        params: Value,
        cancel: Option<CancellationToken>,
    ) -> ToolResult {
        let params = coerce_params(params);
        let argv = self.argv(&params);
        debug!("bridge call {call_id} -> {}", self.definition.name);

        // a panic inside the invocation surfaces as a JoinError, never as an unwind here;
        // dropping this future aborts the task, which drops and kills the child
        let task = AbortOnDropHandle::new(tokio::spawn(Self::run(
            self.settings.clone(),
            argv,
            cancel,
        )));
        match task.await {
            Ok(result) => result,
            Err(err) => {
                warn!("bridge call {call_id} for {} aborted: {err}", self.definition.name);
                ToolResult::failure(err.to_string())
            }
        }
    }
}

/// Builds `[--config <path>]? call <tool> --args <json>`.
pub fn build_call_argv(
    config_path: Option<&std::path::Path>,
    tool_name: &str,
    params: &Map<String, Value>,
) -> Vec<String> {
    let mut argv = Vec::with_capacity(6);
    if let Some(path) = config_path {
        argv.push(CONFIG_FLAG.to_owned());
        argv.push(path.to_string_lossy().into_owned());
    }
    argv.push(CALL_SUBCOMMAND.to_owned());
    argv.push(tool_name.to_owned());
    argv.push(ARGS_FLAG.to_owned());
    argv.push(Value::Object(params.clone()).to_string());
    argv
}

/// Non-object params (arrays, primitives, null) become an empty object.
pub fn coerce_params(params: Value) -> Map<String, Value> {
    match params {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub fn humanize_tool_name(name: &str) -> String {
    name.split(['_', '-', '.', ' '])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
