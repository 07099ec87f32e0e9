// ABOUTME: hosts the unix socket server that decodes execute requests and returns structured results.
// ABOUTME: enforces bounded framing, kills the child if the caller hangs up, and audits every connection.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use savalet_common::{
    encode_line, parse_execute_request, validate_execute_request, ErrorCode, ExecuteRequest,
    ExecuteResponse, RequestError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::audit::{self, Disposition, PeerCredentials};
use crate::engine::Mediator;

pub const MAX_REQUEST_BYTES: usize = 64 * 1024;
#[cfg(test)]
const READ_IDLE_TIMEOUT: Duration = Duration::from_millis(50);
#[cfg(not(test))]
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(2);
/// Bound on receiving the whole request, however steadily the bytes trickle in.
#[cfg(test)]
const READ_DEADLINE: Duration = Duration::from_millis(400);
#[cfg(not(test))]
const READ_DEADLINE: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const HANGUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct ServerContext {
    pub mediator: Mediator,
    pub audit_path: Option<PathBuf>,
}

pub async fn bind(socket_path: &Path, socket_mode: u32) -> anyhow::Result<UnixListener> {
    if socket_path.exists() {
        tokio::fs::remove_file(socket_path)
            .await
            .with_context(|| format!("remove existing socket at {}", socket_path.display()))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("bind {}", socket_path.display()))?;
    tokio::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(socket_mode))
        .await
        .with_context(|| format!("chmod {:o} {}", socket_mode, socket_path.display()))?;
    Ok(listener)
}

pub async fn run(socket_path: &Path, socket_mode: u32, ctx: Arc<ServerContext>) -> anyhow::Result<()> {
    let listener = bind(socket_path, socket_mode).await?;
    info!(socket = %socket_path.display(), mode = %format!("{socket_mode:o}"), "listening");

    loop {
        let stream = match listener.accept().await {
            Ok((stream, _addr)) => stream,
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let peer = peer_credentials(&stream);
            let span = info_span!(
                "conn",
                peer_pid = peer.map(|p| p.pid),
                peer_uid = peer.map(|p| p.uid)
            );
            if let Err(err) = handle_client(stream, peer, &ctx).instrument(span).await {
                warn!(error = %err, "connection failed");
            }
        });
    }
}

enum Frame {
    /// `peer_writing` is false when the request ended with EOF, so a hang-up can no longer be observed.
    Request { payload: Vec<u8>, peer_writing: bool },
    TooLarge,
    Idle,
    /// The overall read deadline passed before a complete request arrived.
    Slow,
}

async fn read_frame(reader: &mut OwnedReadHalf) -> anyhow::Result<Frame> {
    let mut input = Vec::new();
    let mut buf = [0u8; 4096];
    let mut exceeded = false;
    loop {
        let n = match tokio::time::timeout(READ_IDLE_TIMEOUT, reader.read(&mut buf)).await {
            Ok(res) => res?,
            Err(_) => {
                if exceeded {
                    return Ok(Frame::TooLarge);
                }
                if input.is_empty() {
                    return Ok(Frame::Idle);
                }
                return Ok(Frame::Request {
                    payload: input,
                    peer_writing: true,
                });
            }
        };
        if n == 0 {
            break;
        }

        let chunk = &buf[..n];
        let newline = chunk.iter().position(|b| *b == b'\n');
        let body = &chunk[..newline.unwrap_or(n)];
        if !exceeded {
            if input.len() + body.len() > MAX_REQUEST_BYTES {
                exceeded = true;
            } else {
                input.extend_from_slice(body);
            }
        }
        if newline.is_some() {
            if exceeded {
                return Ok(Frame::TooLarge);
            }
            return Ok(Frame::Request {
                payload: input,
                peer_writing: true,
            });
        }
    }

    if exceeded {
        return Ok(Frame::TooLarge);
    }
    Ok(Frame::Request {
        payload: input,
        peer_writing: false,
    })
}

/// Resolves once the peer has closed the connection.
///
/// EOF alone only means the peer shut down its write side and may still be reading the
/// reply; after that the socket is polled until it reports POLLHUP.
async fn peer_hangup(reader: &mut OwnedReadHalf) {
    let mut buf = [0u8; 256];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(_) => continue,
            Err(_) => return,
        }
    }

    let fd = reader.as_ref().as_raw_fd();
    loop {
        if socket_hung_up(fd) {
            return;
        }
        tokio::time::sleep(HANGUP_POLL_INTERVAL).await;
    }
}

fn socket_hung_up(fd: std::os::unix::io::RawFd) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: 0,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    if rc < 0 {
        return true;
    }
    pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0
}

async fn handle_client(
    stream: UnixStream,
    peer: Option<PeerCredentials>,
    ctx: &ServerContext,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let (mut reader, mut writer) = stream.into_split();

    let frame = tokio::time::timeout(READ_DEADLINE, read_frame(&mut reader))
        .await
        .unwrap_or(Ok(Frame::Slow))?;
    let (payload, peer_writing) = match frame {
        Frame::Request { payload, peer_writing } => (payload, peer_writing),
        Frame::TooLarge => {
            let error = write_request_error(&mut writer, ErrorCode::RequestTooLarge, "request exceeds max bytes").await;
            record(ctx, started, peer, None, Disposition::Refused(&error)).await;
            return Ok(());
        }
        Frame::Idle => {
            let error = write_request_error(&mut writer, ErrorCode::ParseFailed, "read timed out").await;
            record(ctx, started, peer, None, Disposition::Refused(&error)).await;
            return Ok(());
        }
        Frame::Slow => {
            let error =
                write_request_error(&mut writer, ErrorCode::ParseFailed, "request not received in time").await;
            record(ctx, started, peer, None, Disposition::Refused(&error)).await;
            return Ok(());
        }
    };

    let request = match parse_execute_request(&payload) {
        Ok(request) => request,
        Err(err) => {
            let error =
                write_request_error(&mut writer, ErrorCode::ParseFailed, &format!("parse failed: {err}")).await;
            record(ctx, started, peer, None, Disposition::Refused(&error)).await;
            return Ok(());
        }
    };

    if let Err(err) = validate_execute_request(&request) {
        let error = write_request_error(
            &mut writer,
            ErrorCode::InvalidRequest,
            &format!("invalid request: {}", err.message),
        )
        .await;
        record(ctx, started, peer, Some(&request), Disposition::Refused(&error)).await;
        return Ok(());
    }

    debug!(command = %request.command, args = request.args.len(), timeout = request.timeout, "request decoded");

    let result = if peer_writing {
        tokio::select! {
            result = ctx.mediator.execute(&request) => Some(result),
            _ = peer_hangup(&mut reader) => None,
        }
    } else {
        Some(ctx.mediator.execute(&request).await)
    };

    let Some(result) = result else {
        warn!(command = %request.command, "peer disconnected before completion, execution abandoned");
        record(ctx, started, peer, Some(&request), Disposition::Disconnected).await;
        return Ok(());
    };

    let response = encode_line(&ExecuteResponse::from_result(result.clone()))?;
    let written = async {
        writer.write_all(&response).await?;
        writer.shutdown().await
    }
    .await;

    record(ctx, started, peer, Some(&request), Disposition::Finished(&result)).await;
    written.context("write response")?;
    Ok(())
}

async fn record(
    ctx: &ServerContext,
    started: Instant,
    peer: Option<PeerCredentials>,
    request: Option<&ExecuteRequest>,
    disposition: Disposition<'_>,
) {
    let Some(audit_path) = &ctx.audit_path else {
        return;
    };
    let duration_ms = started.elapsed().as_millis() as u64;
    if let Err(err) = audit::append_record(audit_path, duration_ms, peer, request, disposition).await {
        warn!(error = %err, "audit append failed");
    }
}

fn peer_credentials(stream: &UnixStream) -> Option<PeerCredentials> {
    let fd = stream.as_raw_fd();

    let mut ucred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut ucred as *mut libc::ucred).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    if len as usize != std::mem::size_of::<libc::ucred>() {
        return None;
    }

    Some(PeerCredentials {
        pid: ucred.pid,
        uid: ucred.uid,
        gid: ucred.gid,
    })
}

async fn write_request_error(writer: &mut OwnedWriteHalf, code: ErrorCode, message: &str) -> RequestError {
    info!(?code, detail = message, "request refused");
    let response = ExecuteResponse::from_error(code, message);
    match encode_line(&response) {
        Ok(line) => {
            let _ = writer.write_all(&line).await;
            let _ = writer.shutdown().await;
        }
        Err(err) => warn!(error = %err, "encode error response failed"),
    }
    RequestError {
        code,
        message: message.to_string(),
    }
}
