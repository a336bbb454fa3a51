//! Subprocess execution with a hard deadline.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

#[cfg(windows)]
pub(crate) const PATH_SEPARATOR: char = ';';
#[cfg(not(windows))]
pub(crate) const PATH_SEPARATOR: char = ':';

/// Captured output of one subprocess invocation.
#[derive(Debug, Clone, Default)]
pub(crate) struct PassOutput {
    /// stdout and stderr, joined
    pub log: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Run `program` in `cwd` and wait at most `timeout` for it.
///
/// A spawn failure is reported in the log rather than as an error: the
/// missing artifact is what fails the compilation. On unix the child leads
/// its own process group, and the whole group is killed at the deadline.
pub(crate) async fn run(
    program: &str,
    args: &[String],
    cwd: &Path,
    envs: &[(&str, String)],
    timeout: Duration,
) -> PassOutput {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    debug!(program, ?args, cwd = %cwd.display(), "Spawning");
    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(program, error = %e, "Failed to execute");
            return PassOutput {
                log: format!("Failed to execute {program}: {e}"),
                exit_code: None,
                timed_out: false,
            };
        }
    };
    let pid = child.id();

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => PassOutput {
            log: combine_output(
                &String::from_utf8_lossy(&output.stdout),
                &String::from_utf8_lossy(&output.stderr),
            ),
            exit_code: output.status.code(),
            timed_out: false,
        },
        Ok(Err(e)) => {
            warn!(program, error = %e, "Failed to wait for process");
            PassOutput {
                log: format!("Failed to execute {program}: {e}"),
                exit_code: None,
                timed_out: false,
            }
        }
        Err(_) => {
            warn!(program, timeout_secs = timeout.as_secs(), "Deadline exceeded");
            if let Some(pid) = pid {
                kill_group(pid).await;
            }
            PassOutput {
                log: format!("{program} exceeded the {}s deadline", timeout.as_secs()),
                exit_code: None,
                timed_out: true,
            }
        }
    }
}

/// SIGKILL every process in the group led by `pid`. The direct child is
/// also killed on drop; this reaches the helpers it spawned.
#[cfg(unix)]
async fn kill_group(pid: u32) {
    let status = Command::new("sh")
        .arg("-c")
        .arg(format!("kill -9 -{pid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => debug!(pid, "Killed process group"),
        Ok(status) => debug!(pid, code = ?status.code(), "Process group already gone"),
        Err(e) => warn!(pid, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
async fn kill_group(_pid: u32) {}

/// Join stdout and stderr, skipping empty streams.
pub(crate) fn combine_output(stdout: &str, stderr: &str) -> String {
    [stdout, stderr]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// `a:b:` style search path; the trailing separator keeps the default paths.
pub(crate) fn search_path(dirs: &[&Path]) -> String {
    let mut out = String::new();
    for dir in dirs {
        out.push_str(&dir.to_string_lossy());
        out.push(PATH_SEPARATOR);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_output() {
        assert_eq!(combine_output("out", "err"), "out\nerr");
        assert_eq!(combine_output("", "err"), "err");
        assert_eq!(combine_output("out", ""), "out");
    }

    #[cfg(unix)]
    #[test]
    fn test_search_path() {
        let p = search_path(&[Path::new("."), Path::new("/src")]);
        assert_eq!(p, ".:/src:");
    }

    #[tokio::test]
    async fn test_missing_program_logged() {
        let dir = tempfile::tempdir().unwrap();
        let out = run(
            "texmend-no-such-program",
            &[],
            dir.path(),
            &[],
            Duration::from_secs(5),
        )
        .await;
        assert!(!out.timed_out);
        assert!(out.log.starts_with("Failed to execute texmend-no-such-program"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_deadline_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let out = run(
            "sleep",
            &["5".to_string()],
            dir.path(),
            &[],
            Duration::from_millis(100),
        )
        .await;
        assert!(out.timed_out);
    }

    /// True once `pid` is gone or only a zombie is left.
    #[cfg(target_os = "linux")]
    fn is_dead(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_deadline_kills_spawned_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("helper.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let out = run(
            "sh",
            &["-c".to_string(), script],
            dir.path(),
            &[],
            Duration::from_millis(500),
        )
        .await;
        assert!(out.timed_out);

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let pid = pid.trim();
        let mut dead = false;
        for _ in 0..40 {
            if is_dead(pid) {
                dead = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(dead, "helper process {pid} survived the deadline");
    }
}
