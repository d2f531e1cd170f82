// instancemanager/src/utils/process.rs
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::ProcessError;

/// Result of a finished external program.
#[derive(Debug)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    /// stdout followed by stderr, lossily decoded.
    pub output: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Runs `command` to completion and captures its combined output.
///
/// The child is killed when `cancel` fires; dropping the returned future
/// kills it as well, so no program outlives the stage that launched it.
pub async fn run_captured(
    mut command: Command,
    cancel: &CancellationToken,
) -> Result<CapturedOutput, ProcessError> {
    let program = command.as_std().get_program().to_string_lossy().to_string();

    if cancel.is_cancelled() {
        return Err(ProcessError::Cancelled { program });
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(program = %program, args = ?command.as_std().get_args().collect::<Vec<_>>(), "launching external program");

    let child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;

    let output = tokio::select! {
        output = child.wait_with_output() => output.map_err(|source| ProcessError::Wait {
            program: program.clone(),
            source,
        })?,
        _ = cancel.cancelled() => return Err(ProcessError::Cancelled { program }),
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(CapturedOutput {
        status: output.status,
        output: combined,
    })
}
