//! External profiler process lifecycle.
//!
//! Every sampler child is spawned in its own process group with a
//! parent-death signal installed, so an abrupt agent exit can never leak a
//! running sampler and a single group signal reaps sub-children too.
//!
//! Cancellation and timeouts escalate: SIGTERM to the group first, SIGKILL
//! after [`ESCALATION_TIMEOUT`]. No child is spawned once the cancellation
//! token has fired.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::domain::DriverError;

/// Grace between polite and forceful termination of a child group.
pub const ESCALATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Cap on captured stderr kept for error messages.
const STDERR_TAIL_LIMIT: usize = 1024;

/// Completed child output.
#[derive(Debug)]
pub struct ToolOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Locate a profiler executable: explicit paths are checked directly,
/// bare names are searched on `PATH`.
pub fn resolve_tool(tool: &str) -> Result<PathBuf, DriverError> {
    let missing = || DriverError::MissingExecutable { tool: tool.to_string() };

    if tool.contains('/') {
        let path = PathBuf::from(tool);
        return if path.is_file() { Ok(path) } else { Err(missing()) };
    }

    let path_var = std::env::var_os("PATH").ok_or_else(missing)?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
        .ok_or_else(missing)
}

/// Configure a command for sampler children: own process group plus
/// SIGKILL-on-parent-death, applied between fork and exec.
pub fn configure_child(cmd: &mut Command) {
    // SAFETY: both calls are async-signal-safe and touch only the child.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Same child setup for std (blocking) commands, used by streaming samplers
/// whose stdout is consumed on a dedicated reader thread.
pub fn configure_std_child(cmd: &mut std::process::Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: as in `configure_child`.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Signal a child's whole process group. A zero pid would address our own
/// group and is ignored.
pub fn signal_group(pid: u32, signal: i32) {
    if pid == 0 {
        return;
    }
    // SAFETY: plain kill(2); a stale pid at worst hits an empty group.
    unsafe {
        #[allow(clippy::cast_possible_wrap)]
        libc::kill(-(pid as i32), signal);
    }
}

async fn escalate_kill(child: &mut tokio::process::Child, pid: u32) {
    signal_group(pid, libc::SIGTERM);
    if tokio::time::timeout(ESCALATION_TIMEOUT, child.wait()).await.is_err() {
        log::warn!("child group {pid} ignored SIGTERM for {ESCALATION_TIMEOUT:?}, sending SIGKILL");
        signal_group(pid, libc::SIGKILL);
        let _ = child.wait().await;
    }
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() > STDERR_TAIL_LIMIT {
        trimmed[trimmed.len() - STDERR_TAIL_LIMIT..].to_string()
    } else {
        trimmed.to_string()
    }
}

/// Run an external tool to completion, bounded by `timeout` and `cancel`.
///
/// On timeout or cancellation the child group is terminated with
/// escalation before this returns. A nonzero exit becomes
/// [`DriverError::ChildFailed`] carrying a stderr tail.
pub async fn run_tool(
    program: &Path,
    args: &[String],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ToolOutput, DriverError> {
    if cancel.is_cancelled() {
        return Err(DriverError::Cancelled);
    }

    let tool = program.display().to_string();
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    configure_child(&mut cmd);

    let mut child = cmd.spawn()?;
    let pid = child.id().unwrap_or(0);

    // Drain pipes concurrently with the wait; a full pipe would otherwise
    // deadlock a chatty child.
    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let status = tokio::select! {
        status = child.wait() => status?,
        () = cancel.cancelled() => {
            escalate_kill(&mut child, pid).await;
            return Err(DriverError::Cancelled);
        }
        () = tokio::time::sleep(timeout) => {
            escalate_kill(&mut child, pid).await;
            return Err(DriverError::Timeout { tool, timeout });
        }
    };

    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

    let code = status.code().unwrap_or(-1);
    if !status.success() {
        return Err(DriverError::ChildFailed { tool, status: code, stderr_tail: tail(&stderr) });
    }

    Ok(ToolOutput { status: code, stdout, stderr })
}
