// ABOUTME: defines the wire protocol shared by savaletd and its clients.
// ABOUTME: one newline-terminated json request in, one newline-terminated json response out.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Exit code reported when the child never produced one (not spawned, killed by a signal).
pub const NO_EXIT_CODE: i32 = -1;

pub const MAX_ARGS: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExecuteRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Seconds. Zero or negative selects the policy default.
    #[serde(default)]
    pub timeout: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    TimedOut,
    ValidationRejected,
    SpawnFailed,
    Saturated,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::TimedOut => "timed_out",
            Outcome::ValidationRejected => "validation_rejected",
            Outcome::SpawnFailed => "spawn_failed",
            Outcome::Saturated => "saturated",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExecuteResult {
    pub exit_code: i32,
    #[serde(with = "base64_bytes")]
    #[schemars(with = "String")]
    pub stdout: Vec<u8>,
    #[serde(with = "base64_bytes")]
    #[schemars(with = "String")]
    pub stderr: Vec<u8>,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ExecuteResult {
    fn without_output(outcome: Outcome, reason: String, stderr: Vec<u8>) -> Self {
        ExecuteResult {
            exit_code: NO_EXIT_CODE,
            stdout: Vec::new(),
            stderr,
            stdout_truncated: false,
            stderr_truncated: false,
            outcome,
            reason: Some(reason),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::without_output(Outcome::ValidationRejected, reason.into(), Vec::new())
    }

    /// The OS error is folded into stderr as well so callers that only look at output still see it.
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let stderr = reason.clone().into_bytes();
        Self::without_output(Outcome::SpawnFailed, reason, stderr)
    }

    pub fn saturated(reason: impl Into<String>) -> Self {
        Self::without_output(Outcome::Saturated, reason.into(), Vec::new())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ParseFailed,
    RequestTooLarge,
    InvalidRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RequestError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExecuteResponse {
    pub result: Option<ExecuteResult>,
    pub error: Option<RequestError>,
}

impl ExecuteResponse {
    pub fn from_result(result: ExecuteResult) -> Self {
        ExecuteResponse {
            result: Some(result),
            error: None,
        }
    }

    pub fn from_error(code: ErrorCode, message: impl Into<String>) -> Self {
        ExecuteResponse {
            result: None,
            error: Some(RequestError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

pub fn parse_execute_request(input: &[u8]) -> Result<ExecuteRequest, serde_json::Error> {
    serde_json::from_slice(input)
}

/// Structural checks only; whether the command is permitted is the daemon's allow-list decision.
pub fn validate_execute_request(request: &ExecuteRequest) -> Result<(), ValidationError> {
    if request.command.trim().is_empty() {
        return Err(ValidationError {
            message: "command must be non-empty".to_string(),
        });
    }
    if request.command.contains('\0') {
        return Err(ValidationError {
            message: "command must not contain nul bytes".to_string(),
        });
    }
    if request.args.len() > MAX_ARGS {
        return Err(ValidationError {
            message: format!("too many args ({} > {MAX_ARGS})", request.args.len()),
        });
    }
    if let Some(idx) = request.args.iter().position(|a| a.contains('\0')) {
        return Err(ValidationError {
            message: format!("args[{idx}] must not contain nul bytes"),
        });
    }
    Ok(())
}

/// Serializes a protocol message followed by the `\n` frame terminator.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
