//! Process execution for the agent
//!
//! Handles:
//! - System tools (`ip`, `qemu-img`, `virsh`) with stderr captured into errors
//! - SSH commands into sandboxes and source VMs with a hard timeout

use crate::managers::{ManagerError, ManagerResult};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Captured output of a finished process
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Runs a system tool and returns its stdout. Non-zero exit is an error.
pub async fn run_tool(program: &str, args: &[&str]) -> ManagerResult<String> {
    debug!("exec: {} {}", program, args.join(" "));
    let output = AsyncCommand::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(ManagerError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Runs a process to completion within `timeout`; the child is killed on expiry.
pub async fn run_with_timeout(program: &str, args: &[String], timeout: Duration) -> ManagerResult<ExecutionResult> {
    let start_time = Instant::now();
    let child = AsyncCommand::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| ManagerError::Timeout(timeout))??;

    Ok(ExecutionResult {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
        duration_ms: start_time.elapsed().as_millis() as u64,
    })
}

/// Where and as whom an SSH command runs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub key_path: String,
    pub proxy_jump: String,
}

pub fn ssh_args(target: &SshTarget, command: &str) -> Vec<String> {
    let mut args = Vec::new();
    if !target.key_path.is_empty() {
        args.extend(["-i".to_string(), target.key_path.clone()]);
    }
    for opt in ["StrictHostKeyChecking=no", "UserKnownHostsFile=/dev/null", "ConnectTimeout=10"] {
        args.extend(["-o".to_string(), opt.to_string()]);
    }
    if !target.proxy_jump.is_empty() {
        args.extend(["-J".to_string(), target.proxy_jump.clone()]);
    }
    args.push(format!("{}@{}", target.user, target.host));
    args.push(command.to_string());
    args
}

pub async fn run_ssh(target: &SshTarget, command: &str, timeout: Duration) -> ManagerResult<ExecutionResult> {
    if target.host.is_empty() {
        return Err(ManagerError::Invalid("no IP address for SSH target".into()));
    }
    run_with_timeout("ssh", &ssh_args(target, command), timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_tool_captures_stdout_and_failures() {
        assert_eq!(run_tool("echo", &["hello"]).await.unwrap().trim(), "hello");
        match run_tool("sh", &["-c", "echo nope >&2; exit 3"]).await.unwrap_err() {
            ManagerError::CommandFailed { stderr, .. } => assert_eq!(stderr, "nope"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_with_timeout() {
        let args = vec!["-c".to_string(), "echo out; echo err >&2; exit 4".to_string()];
        let result = run_with_timeout("sh", &args, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert_eq!(result.exit_code, 4);

        let slow = vec!["10".to_string()];
        let err = run_with_timeout("sleep", &slow, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ManagerError::Timeout(_)));
    }

    #[test]
    fn test_ssh_args() {
        let target = SshTarget {
            user: "sandbox".into(),
            host: "10.0.0.5".into(),
            key_path: "/keys/id".into(),
            proxy_jump: "bastion".into(),
        };
        let args = ssh_args(&target, "uname -a");
        assert_eq!(&args[..2], &["-i", "/keys/id"]);
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"UserKnownHostsFile=/dev/null".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert!(args.windows(2).any(|w| w == ["-J", "bastion"]));
        assert_eq!(args[args.len() - 2], "sandbox@10.0.0.5");
        assert_eq!(args[args.len() - 1], "uname -a");
    }

    #[tokio::test]
    async fn test_ssh_requires_host() {
        let err = run_ssh(&SshTarget::default(), "true", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ManagerError::Invalid(_)));
    }
}
