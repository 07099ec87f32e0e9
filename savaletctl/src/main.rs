// ABOUTME: provides a small cli for submitting execute requests to the savalet mediator daemon.
// ABOUTME: prints the daemon's result as json, or the child's raw output, and mirrors its exit code.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use savalet_common::{ExecuteResult, Outcome};
use tokio::io::AsyncReadExt;

use savaletctl::{build_request, parse_and_validate, validate_verdict, Client, ResultView, DEFAULT_SOCKET_PATH};

#[derive(Debug, Parser)]
#[command(name = "savaletctl", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run an allow-listed command through the daemon.
    Exec {
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,

        /// Seconds; 0 uses the command's configured default.
        #[arg(long, default_value_t = 0)]
        timeout: i32,

        /// Give up waiting for the daemon after this many seconds.
        #[arg(long, default_value_t = 60)]
        request_timeout: u64,

        /// Write the child's stdout/stderr verbatim instead of a json summary.
        #[arg(long)]
        raw: bool,

        command: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Send a request read from --file, --json or stdin.
    Send {
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,

        #[arg(long)]
        file: Option<PathBuf>,

        #[arg(long)]
        json: Option<String>,
    },
    /// Check a request locally without contacting the daemon.
    Validate {
        #[arg(long)]
        file: Option<PathBuf>,

        #[arg(long)]
        json: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    match args.command {
        Command::Exec {
            socket,
            timeout,
            request_timeout,
            raw,
            command,
            args,
        } => {
            let request = build_request(&command, &args, timeout)?;
            let result = Client::new(socket)
                .with_request_timeout(Duration::from_secs(request_timeout))
                .send(&request)
                .await?;
            if raw {
                let mut out = std::io::stdout().lock();
                out.write_all(&result.stdout)?;
                out.flush()?;
                let mut err = std::io::stderr().lock();
                err.write_all(&result.stderr)?;
                if let Some(reason) = &result.reason {
                    writeln!(err, "savaletctl: {}: {reason}", result.outcome)?;
                }
            } else {
                println!("{}", serde_json::to_string_pretty(&ResultView::from(&result))?);
            }
            Ok(exit_code_for(&result))
        }
        Command::Send { socket, file, json } => {
            let input = read_input(file.as_ref(), json.as_deref()).await?;
            let request = parse_and_validate(&input)?;
            let result = Client::new(socket).send(&request).await?;
            println!("{}", serde_json::to_string_pretty(&ResultView::from(&result))?);
            Ok(exit_code_for(&result))
        }
        Command::Validate { file, json } => {
            let input = read_input(file.as_ref(), json.as_deref()).await?;
            let verdict = validate_verdict(&input);
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            Ok(if verdict.ok { ExitCode::SUCCESS } else { ExitCode::from(2) })
        }
    }
}

fn exit_code_for(result: &ExecuteResult) -> ExitCode {
    match result.outcome {
        Outcome::Completed if (0..=255).contains(&result.exit_code) => ExitCode::from(result.exit_code as u8),
        Outcome::TimedOut => ExitCode::from(124),
        _ => ExitCode::FAILURE,
    }
}

async fn read_input(file: Option<&PathBuf>, json: Option<&str>) -> anyhow::Result<String> {
    if let Some(json) = json {
        return Ok(json.to_string());
    }

    if let Some(file) = file {
        return Ok(tokio::fs::read_to_string(file).await?);
    }

    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    Ok(input)
}
