// ABOUTME: writes append-only audit records for each execute request and how it concluded.
// ABOUTME: records sizes of captured output, never the output itself.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use savalet_common::{ExecuteRequest, ExecuteResult, Outcome, RequestError};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PeerCredentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, serde::Serialize)]
struct ResultSummary<'a> {
    outcome: Outcome,
    exit_code: i32,
    stdout_bytes: usize,
    stderr_bytes: usize,
    stdout_truncated: bool,
    stderr_truncated: bool,
    reason: Option<&'a str>,
}

#[derive(Debug, serde::Serialize)]
struct AuditRecord<'a> {
    ts_unix_ms: u64,
    duration_ms: u64,
    peer: Option<PeerCredentials>,
    request: Option<&'a ExecuteRequest>,
    result: Option<ResultSummary<'a>>,
    error: Option<&'a RequestError>,
    disconnected: bool,
}

/// What happened to one connection, as far as the audit log is concerned.
#[derive(Debug)]
pub enum Disposition<'a> {
    Finished(&'a ExecuteResult),
    Refused(&'a RequestError),
    Disconnected,
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub async fn append_record(
    audit_path: &Path,
    duration_ms: u64,
    peer: Option<PeerCredentials>,
    request: Option<&ExecuteRequest>,
    disposition: Disposition<'_>,
) -> anyhow::Result<()> {
    let (result, error, disconnected) = match disposition {
        Disposition::Finished(result) => (Some(summarize(result)), None, false),
        Disposition::Refused(error) => (None, Some(error), false),
        Disposition::Disconnected => (None, None, true),
    };

    let record = AuditRecord {
        ts_unix_ms: now_unix_ms(),
        duration_ms,
        peer,
        request,
        result,
        error,
        disconnected,
    };

    let mut line = serde_json::to_vec(&record)?;
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(audit_path)
        .await
        .with_context(|| format!("open audit log at {}", audit_path.display()))?;

    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

fn summarize(result: &ExecuteResult) -> ResultSummary<'_> {
    ResultSummary {
        outcome: result.outcome,
        exit_code: result.exit_code,
        stdout_bytes: result.stdout.len(),
        stderr_bytes: result.stderr.len(),
        stdout_truncated: result.stdout_truncated,
        stderr_truncated: result.stderr_truncated,
        reason: result.reason.as_deref(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_omits_output_and_keeps_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let request = ExecuteRequest {
            command: "cat".to_string(),
            args: vec!["/etc/hostname".to_string()],
            timeout: 0,
        };
        let result = ExecuteResult {
            exit_code: 0,
            stdout: b"secret-host\n".to_vec(),
            stderr: vec![],
            stdout_truncated: false,
            stderr_truncated: false,
            outcome: Outcome::Completed,
            reason: None,
        };
        let peer = PeerCredentials { pid: 42, uid: 1000, gid: 1000 };

        append_record(&path, 5, Some(peer), Some(&request), Disposition::Finished(&result))
            .await
            .unwrap();
        append_record(&path, 0, None, None, Disposition::Disconnected)
            .await
            .unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!text.contains("secret-host"));

        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["request"]["command"], "cat");
        assert_eq!(lines[0]["result"]["outcome"], "completed");
        assert_eq!(lines[0]["result"]["stdout_bytes"], 12);
        assert_eq!(lines[0]["peer"]["uid"], 1000);
        assert_eq!(lines[1]["disconnected"], true);
        assert!(lines[1]["request"].is_null());
    }
}
