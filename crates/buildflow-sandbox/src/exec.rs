//! Shared process runner: spawn, limit, capture, deadline, terminate.

use buildflow_core::{
    Action, ActionResult, ActionStatus, CancellationToken, Digest, Error, ExecutionMetadata,
    ResourceUsage, Result,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// How the child left the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitKind {
    /// Normal exit with a code.
    Exited(i32),
    /// Killed by a signal; carries the signal number.
    Signaled(i32),
    /// Wall deadline expired; the termination sequence ran.
    TimedOut,
    /// The global cancellation signal fired.
    Cancelled,
}

/// Raw outcome before output collection.
#[derive(Debug)]
pub(crate) struct RawOutcome {
    pub kind: ExitKind,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub usage: ResourceUsage,
}

/// Fully-resolved description of the process to run.
pub(crate) struct ProcessSpec {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub limits: buildflow_core::ResourceLimits,
    pub network_hermetic: bool,
    pub drop_privileges: bool,
}

impl ProcessSpec {
    /// Resolve the environment an action sees: exactly the declared map,
    /// plus a minimal PATH when none was declared (the minimal system view).
    pub fn scrubbed_env(action: &Action, tmp_dir: &Path) -> BTreeMap<String, String> {
        let mut env = action.env.clone();
        env.entry("PATH".to_string())
            .or_insert_with(|| "/usr/local/bin:/usr/bin:/bin".to_string());
        env.insert("TMPDIR".to_string(), tmp_dir.to_string_lossy().into_owned());
        env
    }
}

/// Spawn and drive one process to completion under limits, deadline, and
/// cancellation. Streams are captured byte-exactly and concurrently so a
/// chatty child never deadlocks on a full pipe.
pub(crate) async fn run_process(
    spec: ProcessSpec,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<RawOutcome> {
    let program = spec
        .argv
        .first()
        .ok_or_else(|| Error::Config("action has empty argv".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(&spec.argv[1..])
        .current_dir(&spec.cwd)
        .env_clear()
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    apply_unix_isolation(&mut cmd, &spec);

    let cpu_before = children_cpu_ms();
    let started = Instant::now();

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Config(format!("failed to spawn {program}: {e}")))?;
    let pid = child.id();

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| Error::InvariantViolation("stdout pipe missing".to_string()))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| Error::InvariantViolation("stderr pipe missing".to_string()))?;

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

    // A zero wall timeout disables the deadline.
    let deadline = async {
        if spec.limits.wall_timeout_ms > 0 {
            tokio::time::sleep(Duration::from_millis(spec.limits.wall_timeout_ms)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(deadline);

    let kind = tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| Error::Io(e))?;
            exit_kind_of(status)
        }
        () = &mut deadline => {
            terminate_gracefully(pid, &mut child, grace).await;
            ExitKind::TimedOut
        }
        () = cancel.cancelled() => {
            terminate_gracefully(pid, &mut child, grace).await;
            ExitKind::Cancelled
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    let usage = ResourceUsage {
        peak_memory_bytes: children_max_rss_bytes(),
        cpu_time_ms: children_cpu_ms().saturating_sub(cpu_before),
        wall_time_ms: started.elapsed().as_millis() as u64,
    };

    Ok(RawOutcome {
        kind,
        stdout,
        stderr,
        usage,
    })
}

/// Fold a raw outcome and the collected outputs into the result type the
/// scheduler consumes. Exit-code conventions for abnormal ends follow the
/// shell: 128+signal for signal deaths, 124 for timeouts, 130 for
/// cancellation.
pub(crate) fn assemble_result(
    outcome: RawOutcome,
    outputs: BTreeMap<PathBuf, Digest>,
) -> ActionResult {
    let (status, exit_code) = match outcome.kind {
        ExitKind::Exited(0) => (ActionStatus::Success, 0),
        ExitKind::Exited(code) => (ActionStatus::Failure, code),
        ExitKind::Signaled(sig) => (ActionStatus::Failure, 128 + sig),
        ExitKind::TimedOut => (ActionStatus::Timeout, 124),
        ExitKind::Cancelled => (ActionStatus::Cancelled, 130),
    };
    ActionResult {
        status,
        exit_code,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        outputs,
        usage: outcome.usage,
        metadata: ExecutionMetadata::default(),
    }
}

fn exit_kind_of(status: std::process::ExitStatus) -> ExitKind {
    if let Some(code) = status.code() {
        return ExitKind::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return ExitKind::Signaled(sig);
        }
    }
    ExitKind::Exited(-1)
}

/// Polite signal, grace window, forced kill; applied to the action's whole
/// process group (the child called setsid, so group id == child pid).
async fn terminate_gracefully(pid: Option<u32>, child: &mut tokio::process::Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: signalling a process group we created; a stale pid at
        // worst signals nothing (ESRCH).
        #[allow(unsafe_code)]
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
        let graceful = tokio::time::timeout(grace, child.wait()).await;
        if graceful.is_ok() {
            return;
        }
        #[allow(unsafe_code)]
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(unix)]
fn apply_unix_isolation(cmd: &mut Command, spec: &ProcessSpec) {
    let limits = spec.limits;
    let network_hermetic = spec.network_hermetic;
    let drop_privileges = spec.drop_privileges;

    // SAFETY: pre_exec runs in the forked child before exec; only
    // async-signal-safe calls are made (setsid, setrlimit, unshare, setuid).
    #[allow(unsafe_code)]
    unsafe {
        cmd.pre_exec(move || {
            // Own session and process group, so the runner can signal the
            // whole tree. This is also the name-based isolation fallback.
            libc::setsid();

            if let Some(bytes) = limits.max_memory_bytes {
                set_rlimit(libc::RLIMIT_AS, bytes)?;
            }
            if let Some(cpu_ms) = limits.max_cpu_time_ms {
                // RLIMIT_CPU is seconds; round up so a sub-second limit
                // still limits.
                set_rlimit(libc::RLIMIT_CPU, cpu_ms.div_ceil(1000).max(1))?;
            }

            #[cfg(target_os = "linux")]
            if network_hermetic {
                // Best-effort: unprivileged namespace creation may be
                // denied; the fallback (detectable, weaker) is documented.
                let flags = libc::CLONE_NEWUSER | libc::CLONE_NEWNET;
                let _ = libc::unshare(flags);
            }

            if drop_privileges && libc::geteuid() == 0 {
                // nobody:nogroup
                let _ = libc::setgid(65534);
                let _ = libc::setuid(65534);
            }

            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_unix_isolation(_cmd: &mut Command, _spec: &ProcessSpec) {}

// glibc types the resource argument; other libcs use a plain int.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type RlimitResource = libc::c_int;

#[cfg(unix)]
fn set_rlimit(resource: RlimitResource, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    // SAFETY: plain syscall with a valid pointer.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// CPU milliseconds accumulated by reaped children of this process.
fn children_cpu_ms() -> u64 {
    #[cfg(unix)]
    {
        if let Some(usage) = getrusage_children() {
            let user = usage.ru_utime.tv_sec as u64 * 1000 + usage.ru_utime.tv_usec as u64 / 1000;
            let sys = usage.ru_stime.tv_sec as u64 * 1000 + usage.ru_stime.tv_usec as u64 / 1000;
            return user + sys;
        }
    }
    0
}

/// High-water resident set of reaped children, in bytes.
fn children_max_rss_bytes() -> u64 {
    #[cfg(unix)]
    {
        if let Some(usage) = getrusage_children() {
            // ru_maxrss is KiB on Linux, bytes on macOS.
            #[cfg(target_os = "macos")]
            return usage.ru_maxrss as u64;
            #[cfg(not(target_os = "macos"))]
            return usage.ru_maxrss as u64 * 1024;
        }
    }
    0
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn getrusage_children() -> Option<libc::rusage> {
    // SAFETY: zeroed rusage is a valid out-buffer for getrusage.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, &mut usage) };
    if rc == 0 {
        Some(usage)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildflow_core::ResourceLimits;

    fn spec(argv: &[&str], timeout_ms: u64) -> ProcessSpec {
        ProcessSpec {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            cwd: std::env::temp_dir(),
            env: BTreeMap::from([(
                "PATH".to_string(),
                "/usr/local/bin:/usr/bin:/bin".to_string(),
            )]),
            limits: ResourceLimits {
                max_memory_bytes: None,
                max_cpu_time_ms: None,
                wall_timeout_ms: timeout_ms,
            },
            network_hermetic: false,
            drop_privileges: false,
        }
    }

    #[tokio::test]
    async fn test_capture_and_exit_code() {
        let cancel = CancellationToken::new();
        let outcome = run_process(
            spec(&["sh", "-c", "echo out; echo err >&2; exit 3"], 10_000),
            &cancel,
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        assert_eq!(outcome.kind, ExitKind::Exited(3));
        assert_eq!(outcome.stdout, b"out\n");
        assert_eq!(outcome.stderr, b"err\n");
    }

    #[tokio::test]
    async fn test_wall_deadline_fires() {
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let outcome = run_process(
            spec(&["sh", "-c", "sleep 30"], 100),
            &cancel,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert_eq!(outcome.kind, ExitKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_zero_timeout_disables_deadline() {
        let cancel = CancellationToken::new();
        let outcome = run_process(
            spec(&["sh", "-c", "sleep 0.2; echo done"], 0),
            &cancel,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert_eq!(outcome.kind, ExitKind::Exited(0));
        assert_eq!(outcome.stdout, b"done\n");
    }

    #[tokio::test]
    async fn test_cancellation_terminates() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let outcome = run_process(
            spec(&["sh", "-c", "sleep 30"], 60_000),
            &cancel,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert_eq!(outcome.kind, ExitKind::Cancelled);
    }

    #[tokio::test]
    async fn test_empty_argv_rejected() {
        let cancel = CancellationToken::new();
        let err = run_process(spec(&[], 1000), &cancel, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_usage_reports_wall_time() {
        let cancel = CancellationToken::new();
        let outcome = run_process(
            spec(&["sh", "-c", "sleep 0.1"], 10_000),
            &cancel,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert!(outcome.usage.wall_time_ms >= 90);
    }
}
