use std::process::Stdio;

use anyhow::{bail, Context};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::CommandConfig;
use crate::template::expand;

#[derive(Debug, Error)]
#[error("command key `{key}` matches no configured command")]
pub struct BuildError {
    pub key: String,
}

// Render the command line for one job. With a command registry in play
// the template renders a key first and the registered template renders
// the actual line; one level of indirection only. An unmatched key
// falls back to the `default` entry or fails the build, before any
// process is spawned.
pub fn build(config: &CommandConfig, namespace: &Value) -> Result<String, BuildError> {
    let rendered = expand(&config.template, namespace, false);
    if config.options.is_empty() {
        return Ok(rendered);
    }
    if let Some(registered) = config.options.get(&rendered) {
        return Ok(expand(registered, namespace, false));
    }
    if let Some(fallback) = config.options.get("default") {
        return Ok(expand(fallback, namespace, false));
    }
    Err(BuildError { key: rendered })
}

async fn stream_output<R>(stream: R, stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if stderr {
                    warn!("| {line}");
                } else {
                    info!("| {line}");
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read command output: {e}.");
                break;
            }
        }
    }
}

// Run a shell command line to completion, streaming its output into the
// log as it appears. Only pass/fail comes back.
pub async fn run(line: &str) -> anyhow::Result<()> {
    info!("Executing `{}`.", line);
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(line)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn `{line}`"))?;

    let stdout = child
        .stdout
        .take()
        .context("child stdout was not captured")?;
    let stderr = child
        .stderr
        .take()
        .context("child stderr was not captured")?;
    let out_drain = tokio::spawn(stream_output(stdout, false));
    let err_drain = tokio::spawn(stream_output(stderr, true));

    let status = child.wait().await.context("failed to wait for the command")?;
    let _ = futures::join!(out_drain, err_drain);

    if !status.success() {
        bail!("command exited with {status}");
    }
    info!("Command finished successfully.");
    Ok(())
}
