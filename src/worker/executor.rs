use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::scheduler::job::{JobShard, StorageSpec};

/// Runs shards and answers storage questions for the scheduler. The scheduler
/// treats the execution itself as opaque; it only consumes the result files.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn is_installed(&self) -> bool;
    async fn has_storage_locally(&self, volume: &StorageSpec) -> Result<bool>;
    async fn get_volume_size(&self, volume: &StorageSpec) -> Result<u64>;
    /// Runs the shard and writes `exitCode`, `stdout` and `stderr` under
    /// `results_dir`. A non-zero exit code is reported as
    /// [`Error::NonZeroExitCode`] even though the runtime did not fail; the
    /// result files are written either way.
    async fn run_shard(&self, shard: &JobShard, results_dir: &Path) -> Result<()>;
}

/// Executes shard commands through `sh -c` on the host.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn is_installed(&self) -> bool {
        Command::new("sh")
            .arg("-c")
            .arg("true")
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn has_storage_locally(&self, volume: &StorageSpec) -> Result<bool> {
        Ok(tokio::fs::try_exists(&volume.path).await?)
    }

    async fn get_volume_size(&self, volume: &StorageSpec) -> Result<u64> {
        let meta = tokio::fs::metadata(&volume.path).await?;
        if meta.is_file() {
            return Ok(meta.len());
        }
        let mut size = 0;
        let mut entries = tokio::fs::read_dir(&volume.path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                size += meta.len();
            }
        }
        Ok(size)
    }

    async fn run_shard(&self, shard: &JobShard, results_dir: &Path) -> Result<()> {
        let spec = &shard.job.spec;
        tracing::info!(shard_id = %shard.id(), command = %spec.command, "executing shard");

        let mut command = Command::new("sh");
        command.arg("-c").arg(&spec.command);
        for pair in &spec.env {
            if let Some((key, value)) = pair.split_once('=') {
                command.env(key, value);
            }
        }
        command.env("SHARD_INDEX", shard.index.to_string());

        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::ExecutionFailed(e.to_string()))?;

        // Signal-terminated processes have no exit code.
        let exit_code = output.status.code().unwrap_or(-1);
        write_results(results_dir, exit_code, &output.stdout, &output.stderr).await?;

        tracing::info!(shard_id = %shard.id(), exit_code, "shard execution finished");
        if exit_code != 0 {
            return Err(Error::NonZeroExitCode(exit_code));
        }
        Ok(())
    }
}

/// Writes the three per-shard result files: exit code as decimal ASCII with
/// no trailing newline, stdout/stderr as raw bytes, all owner-rw world-read.
pub async fn write_results(
    results_dir: &Path,
    exit_code: i32,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<()> {
    write_result_file(&results_dir.join("exitCode"), exit_code.to_string().as_bytes()).await?;
    write_result_file(&results_dir.join("stdout"), stdout).await?;
    write_result_file(&results_dir.join("stderr"), stderr).await?;
    Ok(())
}

async fn write_result_file(path: &Path, contents: &[u8]) -> Result<()> {
    tokio::fs::write(path, contents).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).await?;
    Ok(())
}
