use serde_json::{json, Value};

use super::invoker::ProcessOutcome;

pub const DEFAULT_PARTIAL_OUTPUT_CHARS: usize = 2_000;

/// The only value that crosses the bridge boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Success(Value),
    Failure {
        message: String,
        partial_output: Option<String>,
    },
}

impl ToolResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
            partial_output: None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Success(payload) => payload.clone(),
            Self::Failure {
                message,
                partial_output,
            } => {
                let mut out = json!({
                    "error": true,
                    "message": message,
                });
                if let Some(partial) = partial_output {
                    out["partialOutput"] = Value::String(partial.clone());
                }
                out
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResultInterpreter {
    partial_output_chars: usize,
}

impl Default for ResultInterpreter {
    fn default() -> Self {
        Self::new(DEFAULT_PARTIAL_OUTPUT_CHARS)
    }
}

impl ResultInterpreter {
    pub fn new(partial_output_chars: usize) -> Self {
        Self {
            partial_output_chars,
        }
    }

    pub fn interpret(&self, outcome: &ProcessOutcome) -> ToolResult {
        match outcome.exit_code {
            Some(0) => parse_stdout(&outcome.stdout),
            _ => self.failure_from(outcome),
        }
    }

    fn failure_from(&self, outcome: &ProcessOutcome) -> ToolResult {
        let stderr = outcome.stderr.trim();
        let message = if !stderr.is_empty() {
            stderr.to_owned()
        } else {
            match (outcome.exit_code, outcome.signal) {
                (Some(code), _) => format!("process exited with code {code}"),
                (None, Some(signal)) => format!("process terminated by signal {signal}"),
                (None, None) => "process exited without an exit code".to_owned(),
            }
        };
        let partial_output = if outcome.stdout.is_empty() {
            None
        } else {
            Some(
                outcome
                    .stdout
                    .chars()
                    .take(self.partial_output_chars)
                    .collect::<String>(),
            )
        };
        ToolResult::Failure {
            message,
            partial_output,
        }
    }
}

fn parse_stdout(stdout: &str) -> ToolResult {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return ToolResult::Success(json!({ "result": null, "raw": "" }));
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(parsed) => ToolResult::Success(parsed),
        Err(_) => ToolResult::Success(json!({ "result": trimmed, "raw": trimmed })),
    }
}
