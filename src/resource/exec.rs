//! Captured output of a command run inside a pod

use super::FixtureError;
use crate::client::{OutputStream, RemoteProcess};
use std::path::Path;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Exit code and captured output of a finished command
///
/// Output is kept in temporary files until [`ExecResult::close`] is called
/// (or the result is dropped).
#[derive(Debug)]
pub struct ExecResult {
    exit_code: i32,
    stdout: Option<TempPath>,
    stderr: Option<TempPath>,
}

impl ExecResult {
    /// Drain a remote process into temporary files and wait for it to exit
    ///
    /// Both streams are copied by their own task from the start, so a chatty
    /// process can never block on a full pipe.
    pub(crate) async fn capture(process: RemoteProcess) -> Result<Self, FixtureError> {
        let (stdout_file, stdout_path) = capture_file("stdout")?;
        let (stderr_file, stderr_path) = capture_file("stderr")?;

        let stdout_task = tokio::spawn(drain(process.stdout, stdout_file));
        let stderr_task = tokio::spawn(drain(process.stderr, stderr_file));

        let exit_code = match process.exit.await {
            Ok(code) => code,
            Err(e) => {
                stdout_task.abort();
                stderr_task.abort();
                return Err(FixtureError::Exec(e.to_string()));
            }
        };

        let (stdout_bytes, stderr_bytes) = tokio::join!(stdout_task, stderr_task);
        let stdout_bytes = stdout_bytes.map_err(|e| FixtureError::Exec(e.to_string()))??;
        let stderr_bytes = stderr_bytes.map_err(|e| FixtureError::Exec(e.to_string()))??;

        debug!(
            exit_code = exit_code,
            stdout_bytes = stdout_bytes,
            stderr_bytes = stderr_bytes,
            "Command finished"
        );

        Ok(Self {
            exit_code,
            stdout: Some(stdout_path),
            stderr: Some(stderr_path),
        })
    }

    /// Exit code of the command
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Whether the command exited with 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Captured standard output; empty once closed
    pub async fn stdout(&self) -> Result<String, FixtureError> {
        read_capture(self.stdout.as_deref()).await
    }

    /// Captured standard error; empty once closed
    pub async fn stderr(&self) -> Result<String, FixtureError> {
        read_capture(self.stderr.as_deref()).await
    }

    /// File holding standard output, until closed
    pub fn stdout_path(&self) -> Option<&Path> {
        self.stdout.as_deref()
    }

    /// File holding standard error, until closed
    pub fn stderr_path(&self) -> Option<&Path> {
        self.stderr.as_deref()
    }

    /// Delete the capture files
    pub fn close(&mut self) -> Result<(), FixtureError> {
        for path in [self.stdout.take(), self.stderr.take()].into_iter().flatten() {
            path.close()?;
        }
        Ok(())
    }
}

fn capture_file(stream: &str) -> Result<(tokio::fs::File, TempPath), FixtureError> {
    let (file, path) = tempfile::Builder::new()
        .prefix(&format!("kube-fixtures-{stream}-"))
        .suffix(".log")
        .tempfile()?
        .into_parts();
    Ok((tokio::fs::File::from_std(file), path))
}

async fn drain(stream: Option<OutputStream>, mut file: tokio::fs::File) -> std::io::Result<u64> {
    let Some(mut stream) = stream else {
        return Ok(0);
    };
    let copied = tokio::io::copy(&mut stream, &mut file).await?;
    file.flush().await?;
    Ok(copied)
}

async fn read_capture(path: Option<&Path>) -> Result<String, FixtureError> {
    match path {
        Some(path) => {
            let bytes = tokio::fs::read(path).await?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        None => Ok(String::new()),
    }
}
