//! Running target commands.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::model::Target;
use crate::platform::Platform;

use super::types::{CommandOutput, ExecuteError};

const DEFAULT_SHELL: &str = "sh";

/// Run `target.command` in its package directory and capture combined output.
///
/// The child is killed when `ctx` fires or the timeout (target value, else the
/// configured default) elapses.
pub async fn run_command(
  ctx: &CancellationToken,
  config: &EngineConfig,
  target: &Target,
  platform: &Platform,
) -> Result<CommandOutput, ExecuteError> {
  let shell = config.shell.as_deref().unwrap_or(DEFAULT_SHELL);
  let cwd = target.package_path(&config.workspace_root);
  let timeout = target.timeout.or_else(|| config.default_timeout());

  debug!(label = %target.label, cwd = %cwd.display(), command = %target.command, "running command");
  let started = Instant::now();

  let mut child = Command::new(shell)
    .arg("-c")
    .arg(&target.command)
    .current_dir(&cwd)
    .envs(&target.env)
    .env("GROG_PACKAGE", &target.label.package)
    .env("GROG_TARGET", target.label.to_string())
    .env("GROG_OS", platform.os.as_str())
    .env("GROG_ARCH", platform.arch.as_str())
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true)
    .spawn()
    .map_err(|source| ExecuteError::Spawn {
      label: target.label.clone(),
      source,
    })?;

  let captured = Arc::new(Mutex::new(Vec::new()));
  let stdout = child.stdout.take();
  let stderr = child.stderr.take();

  let run = async {
    tokio::join!(pump(stdout, &captured), pump(stderr, &captured));
    child.wait().await
  };

  let waited = tokio::select! {
    biased;
    _ = ctx.cancelled() => return Err(ExecuteError::Cancelled),
    waited = with_timeout(timeout, run) => waited,
  };

  let output = String::from_utf8_lossy(&captured.lock().unwrap_or_else(|e| e.into_inner())).into_owned();

  let status = match waited {
    Some(status) => status.map_err(|source| ExecuteError::Spawn {
      label: target.label.clone(),
      source,
    })?,
    None => {
      return Err(ExecuteError::Timeout {
        label: target.label.clone(),
        timeout: timeout.unwrap_or_default(),
        output,
      });
    }
  };

  if !status.success() {
    return Err(ExecuteError::CommandFailed {
      label: target.label.clone(),
      exit_code: status.code(),
      output,
    });
  }

  let duration = started.elapsed();
  info!(label = %target.label, elapsed_ms = duration.as_millis() as u64, "command succeeded");
  Ok(CommandOutput { output, duration })
}

async fn with_timeout<F: std::future::Future>(timeout: Option<Duration>, fut: F) -> Option<F::Output> {
  match timeout {
    Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
    None => Some(fut.await),
  }
}

/// Append everything `reader` yields to the shared buffer.
async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, captured: &Mutex<Vec<u8>>) {
  let Some(mut reader) = reader else {
    return;
  };
  let mut buf = [0u8; 8192];
  loop {
    match reader.read(&mut buf).await {
      Ok(0) | Err(_) => break,
      Ok(n) => captured
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .extend_from_slice(&buf[..n]),
    }
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::util::testutil::{make_target, test_config};
  use tempfile::TempDir;

  fn setup(command: &str) -> (TempDir, std::sync::Arc<EngineConfig>, Target) {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    std::fs::create_dir_all(config.workspace_root.join("pkg")).unwrap();
    let target = make_target("//pkg:t", command, &[]);
    (tmp, config, target)
  }

  #[tokio::test]
  async fn captures_stdout_and_stderr() {
    let (_tmp, config, target) = setup("echo out; echo err >&2");
    let result = run_command(&CancellationToken::new(), &config, &target, &Platform::host())
      .await
      .unwrap();
    assert!(result.output.contains("out"));
    assert!(result.output.contains("err"));
  }

  #[tokio::test]
  async fn runs_in_package_dir_with_grog_env() {
    let (_tmp, config, mut target) = setup("pwd; echo \"$GROG_TARGET $GROG_PACKAGE $CUSTOM\"");
    target.env.insert("CUSTOM".into(), "value".into());
    let result = run_command(&CancellationToken::new(), &config, &target, &Platform::host())
      .await
      .unwrap();
    assert!(result.output.contains("/pkg"));
    assert!(result.output.contains("//pkg:t pkg value"));
  }

  #[tokio::test]
  async fn nonzero_exit_carries_code_and_output() {
    let (_tmp, config, target) = setup("echo broken; exit 3");
    let err = run_command(&CancellationToken::new(), &config, &target, &Platform::host())
      .await
      .unwrap_err();
    assert_eq!(err.exit_code(), Some(3));
    assert!(err.output().unwrap().contains("broken"));
  }

  #[tokio::test]
  async fn timeout_kills_command() {
    let (_tmp, config, mut target) = setup("sleep 5");
    target.timeout = Some(Duration::from_millis(100));
    let started = Instant::now();
    let err = run_command(&CancellationToken::new(), &config, &target, &Platform::host())
      .await
      .unwrap_err();
    assert!(matches!(err, ExecuteError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(4));
  }

  #[tokio::test]
  async fn cancellation_is_distinct_from_failure() {
    let (_tmp, config, target) = setup("sleep 5");
    let ctx = CancellationToken::new();
    let trigger = ctx.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      trigger.cancel();
    });
    let err = run_command(&ctx, &config, &target, &Platform::host()).await.unwrap_err();
    assert!(err.is_cancelled());
  }
}
