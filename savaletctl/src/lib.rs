// ABOUTME: provides the protocol client used by the api tier and savaletctl to reach the mediator daemon.
// ABOUTME: keeps "the daemon answered" (an ExecuteResult) apart from "the daemon was unreachable" (TransportError).

use std::path::{Path, PathBuf};
use std::time::Duration;

use savalet_common::{
    encode_line, parse_execute_request, validate_execute_request, ErrorCode, ExecuteRequest,
    ExecuteResponse, ExecuteResult, Outcome, RequestError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/savalet.sock";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_RESPONSE_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {0} timed out")]
    ConnectTimeout(PathBuf),

    #[error("socket i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode response: {0}")]
    Decode(String),

    #[error("daemon refused request ({code:?}): {message}")]
    Protocol { code: ErrorCode, message: String },

    #[error("no response within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct Client {
    socket_path: PathBuf,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl Client {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Client {
            socket_path: socket_path.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Upper bound on the whole exchange, including the command's own run time.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn execute(
        &self,
        command: &str,
        args: &[String],
        timeout: i32,
    ) -> Result<ExecuteResult, TransportError> {
        let request = ExecuteRequest {
            command: command.to_string(),
            args: args.to_vec(),
            timeout,
        };
        self.send(&request).await
    }

    pub async fn send(&self, request: &ExecuteRequest) -> Result<ExecuteResult, TransportError> {
        let line = encode_line(request).map_err(|e| TransportError::Decode(e.to_string()))?;

        let mut stream = match tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.socket_path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransportError::Connect {
                    path: self.socket_path.clone(),
                    source,
                })
            }
            Err(_) => return Err(TransportError::ConnectTimeout(self.socket_path.clone())),
        };

        let exchange = async {
            // The write half stays open: closing it tells the daemon we gave up on the request.
            stream.write_all(&line).await?;
            let mut response = Vec::new();
            (&mut stream)
                .take(MAX_RESPONSE_BYTES + 1)
                .read_to_end(&mut response)
                .await?;
            Ok::<_, std::io::Error>(response)
        };
        let response = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(self.request_timeout))??;

        decode_response(&response)
    }
}

pub fn decode_response(bytes: &[u8]) -> Result<ExecuteResult, TransportError> {
    if bytes.len() as u64 > MAX_RESPONSE_BYTES {
        return Err(TransportError::Decode(format!("response exceeds {MAX_RESPONSE_BYTES} bytes")));
    }
    if bytes.is_empty() {
        return Err(TransportError::Decode("daemon closed the connection without a response".to_string()));
    }

    let response: ExecuteResponse =
        serde_json::from_slice(bytes).map_err(|e| TransportError::Decode(e.to_string()))?;
    match response {
        ExecuteResponse {
            error: Some(RequestError { code, message }),
            ..
        } => Err(TransportError::Protocol { code, message }),
        ExecuteResponse {
            result: Some(result),
            error: None,
        } => Ok(result),
        ExecuteResponse {
            result: None,
            error: None,
        } => Err(TransportError::Decode("response carries neither result nor error".to_string())),
    }
}

/// Builds and locally checks a request before it is sent.
pub fn build_request(command: &str, args: &[String], timeout: i32) -> anyhow::Result<ExecuteRequest> {
    let request = ExecuteRequest {
        command: command.to_string(),
        args: args.to_vec(),
        timeout,
    };
    validate_execute_request(&request).map_err(|e| anyhow::anyhow!(e.message))?;
    Ok(request)
}

pub fn parse_and_validate(input: &str) -> anyhow::Result<ExecuteRequest> {
    let request = parse_execute_request(input.trim_end().as_bytes())?;
    validate_execute_request(&request).map_err(|e| anyhow::anyhow!(e.message))?;
    Ok(request)
}

#[derive(Debug, serde::Serialize, PartialEq, Eq)]
pub struct ValidateVerdict {
    pub ok: bool,
    pub error: Option<RequestError>,
}

pub fn validate_verdict(input: &str) -> ValidateVerdict {
    match parse_execute_request(input.trim_end().as_bytes()) {
        Ok(request) => match validate_execute_request(&request) {
            Ok(()) => ValidateVerdict { ok: true, error: None },
            Err(err) => ValidateVerdict {
                ok: false,
                error: Some(RequestError {
                    code: ErrorCode::InvalidRequest,
                    message: err.message,
                }),
            },
        },
        Err(err) => ValidateVerdict {
            ok: false,
            error: Some(RequestError {
                code: ErrorCode::ParseFailed,
                message: err.to_string(),
            }),
        },
    }
}

/// Human-readable view of a result: output decoded lossily as utf-8.
#[derive(Debug, serde::Serialize)]
pub struct ResultView {
    pub outcome: Outcome,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub reason: Option<String>,
}

impl From<&ExecuteResult> for ResultView {
    fn from(result: &ExecuteResult) -> Self {
        ResultView {
            outcome: result.outcome,
            exit_code: result.exit_code,
            stdout: String::from_utf8_lossy(&result.stdout).to_string(),
            stderr: String::from_utf8_lossy(&result.stderr).to_string(),
            stdout_truncated: result.stdout_truncated,
            stderr_truncated: result.stderr_truncated,
            reason: result.reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::UnixListener;

    /// Accepts one connection, reads one request line and answers with `reply` (if any).
    async fn one_shot_server(
        listener: UnixListener,
        reply: Option<Vec<u8>>,
    ) -> tokio::task::JoinHandle<ExecuteRequest> {
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut line = String::new();
            tokio::io::BufReader::new(reader).read_line(&mut line).await.unwrap();
            let request: ExecuteRequest = serde_json::from_str(line.trim_end()).unwrap();
            match reply {
                Some(bytes) => {
                    writer.write_all(&bytes).await.unwrap();
                    writer.shutdown().await.unwrap();
                }
                None => tokio::time::sleep(Duration::from_secs(5)).await,
            }
            request
        })
    }

    #[tokio::test]
    async fn execute_returns_result_and_sends_request_line() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("d.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let result = ExecuteResult {
            exit_code: 0,
            stdout: vec![0xde, 0xad, b'\n'],
            stderr: vec![],
            stdout_truncated: false,
            stderr_truncated: false,
            outcome: Outcome::Completed,
            reason: None,
        };
        let reply = encode_line(&ExecuteResponse::from_result(result.clone())).unwrap();
        let server = one_shot_server(listener, Some(reply)).await;

        let got = Client::new(&socket_path)
            .execute("uptime", &["-p".to_string()], 3)
            .await
            .unwrap();
        assert_eq!(got, result);

        let seen = server.await.unwrap();
        assert_eq!(seen.command, "uptime");
        assert_eq!(seen.args, vec!["-p"]);
        assert_eq!(seen.timeout, 3);
    }

    #[tokio::test]
    async fn rejected_execution_is_a_result_not_a_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("d.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        let reply = encode_line(&ExecuteResponse::from_result(ExecuteResult::rejected("command not allowed"))).unwrap();
        let _server = one_shot_server(listener, Some(reply)).await;

        let got = Client::new(&socket_path).execute("rm", &[], 0).await.unwrap();
        assert_eq!(got.outcome, Outcome::ValidationRejected);
    }

    #[tokio::test]
    async fn protocol_error_maps_to_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("d.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        let reply = encode_line(&ExecuteResponse::from_error(ErrorCode::RequestTooLarge, "too big")).unwrap();
        let _server = one_shot_server(listener, Some(reply)).await;

        let err = Client::new(&socket_path).execute("uptime", &[], 0).await.unwrap_err();
        match err {
            TransportError::Protocol { code, message } => {
                assert_eq!(code, ErrorCode::RequestTooLarge);
                assert_eq!(message, "too big");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_socket_is_a_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Client::new(dir.path().join("absent.sock"))
            .execute("uptime", &[], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[tokio::test]
    async fn silent_daemon_hits_request_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("d.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        let _server = one_shot_server(listener, None).await;

        let err = Client::new(&socket_path)
            .with_request_timeout(Duration::from_millis(200))
            .execute("uptime", &[], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[test]
    fn garbage_response_is_a_decode_error() {
        assert!(matches!(decode_response(b"not json\n"), Err(TransportError::Decode(_))));
        assert!(matches!(decode_response(b""), Err(TransportError::Decode(_))));
        assert!(matches!(
            decode_response(b"{\"result\":null,\"error\":null}\n"),
            Err(TransportError::Decode(_))
        ));
    }

    #[test]
    fn verdict_reports_parse_failed_for_unknown_fields() {
        let v = validate_verdict(r#"{"command":"ls","args":[],"timeout":0,"unexpected":"x"}"#);
        assert!(!v.ok);
        assert_eq!(v.error.as_ref().unwrap().code, ErrorCode::ParseFailed);
    }

    #[test]
    fn verdict_reports_invalid_request_for_blank_command() {
        let v = validate_verdict(r#"{"command":"   "}"#);
        assert!(!v.ok);
        assert_eq!(v.error.as_ref().unwrap().code, ErrorCode::InvalidRequest);
    }

    #[test]
    fn build_request_rejects_nul_bytes_locally() {
        let err = build_request("echo", &["a\0b".to_string()], 0).unwrap_err();
        assert!(err.to_string().contains("nul"));
        assert!(parse_and_validate("{\"command\":\"echo\",\"args\":[\"ok\"]}\n").is_ok());
    }

    #[test]
    fn result_view_decodes_output_lossily() {
        let result = ExecuteResult {
            exit_code: 1,
            stdout: vec![b'o', b'k', 0xff],
            stderr: b"boom".to_vec(),
            stdout_truncated: true,
            stderr_truncated: false,
            outcome: Outcome::Completed,
            reason: None,
        };
        let view = ResultView::from(&result);
        assert_eq!(view.stdout, "ok\u{fffd}");
        assert_eq!(view.stderr, "boom");
        assert!(view.stdout_truncated);
    }
}
