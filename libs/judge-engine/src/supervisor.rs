/// Execution Supervisor - Running Untrusted Processes Under Limits
///
/// **Core Responsibility:**
/// Spawn one process per test case, feed it the test input, capture bounded
/// output, and stop it when any ceiling is hit.
///
/// **Critical Architectural Boundary:**
/// - Supervisor knows HOW to run and stop processes
/// - Supervisor does NOT decide verdicts
/// - Supervisor returns mechanical facts (flags, exit code, signal, timings)
///
/// **Isolation Model (process-level):**
/// - Own process group, so the whole tree can be signalled at once
/// - Cleared environment, HOME/TMPDIR pointed at the workspace
/// - rlimits applied between fork and exec (CPU, core, file size, optional address space)
/// - Wall clock enforced by racing the process against a timer
/// - Every stop is SIGTERM to the group, then SIGKILL after a grace period
/// - The group is SIGKILLed once more when supervision ends, while the exited
///   leader is still unreaped and its pid still pins the group id (Linux)
///
/// **Memory Accounting:**
/// Peak memory is the kernel's `VmHWM` for the supervised process, sampled
/// from `/proc` at a fixed interval. It is an approximation: descendants are
/// not summed, and on non-Linux hosts it is always 0.
///
/// Under the address-space cap a refused allocation never shows up in
/// `VmHWM`. A crash there counts as memory exhaustion when stderr carries an
/// allocator failure message, or when the program dies of a fault signal and
/// a single replay without the cap crosses the memory ceiling.
use crate::build::Artifact;
use crate::error::JudgeError;
use crate::registry::LanguageProfile;
use judge_common::config::JudgeConfig;
use judge_common::types::{ExecutionResult, LimitOverrides, TestCase};
use nix::errno::Errno;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
#[cfg(target_os = "linux")]
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::Pid;
use serde::Serialize;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const FILE_SIZE_LIMIT_BYTES: u64 = 64 * 1024 * 1024;
const READ_CHUNK_BYTES: usize = 8192;
/// How long to wait for pipe readers after the process group is gone
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
/// Lowercased stderr fragments that allocators print when a request is refused
const ALLOCATION_FAILURE_MARKERS: &[&str] = &[
    "bad_alloc",
    "memory allocation of",
    "cannot allocate memory",
    "out of memory",
];

/// Resource ceilings for one test run, resolved from profile defaults and job overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub wall_time: Duration,
    /// Enforced with RLIMIT_CPU, which counts whole seconds: the limit is
    /// rounded up to the next second (1500ms runs for up to 2s of CPU)
    pub cpu_time: Option<Duration>,
    pub memory_bytes: u64,
    pub limit_address_space: bool,
}

impl ExecutionLimits {
    pub fn resolve(profile: &LanguageProfile, overrides: &LimitOverrides) -> Self {
        let memory_mb = overrides.memory_limit_mb.unwrap_or(profile.memory_limit_mb);
        Self {
            wall_time: Duration::from_millis(
                overrides.time_limit_ms.unwrap_or(profile.run_timeout_ms),
            ),
            cpu_time: overrides
                .cpu_time_limit_ms
                .or(profile.cpu_time_limit_ms)
                .map(Duration::from_millis),
            memory_bytes: memory_mb.saturating_mul(1024 * 1024),
            limit_address_space: profile.limit_address_space,
        }
    }
}

/// Parameters of a single spawn
#[derive(Debug, Clone)]
struct RunSpec {
    wall_time: Duration,
    cpu_time: Option<Duration>,
    memory_bytes: Option<u64>,
    address_space_bytes: Option<u64>,
    stdout_limit: usize,
    stderr_limit: usize,
    /// Stop the process as soon as stdout exceeds its cap
    stop_on_overflow: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    WallTime,
    Memory,
    OutputLimit,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SupervisorStats {
    pub test_runs: u64,
    pub compilations: u64,
    pub timeouts: u64,
    pub memory_kills: u64,
}

pub struct ExecutionSupervisor {
    stdout_limit: usize,
    stderr_limit: usize,
    kill_grace: Duration,
    sample_interval: Duration,
    test_runs: AtomicU64,
    compilations: AtomicU64,
    timeouts: AtomicU64,
    memory_kills: AtomicU64,
}

impl ExecutionSupervisor {
    pub fn new(config: &JudgeConfig) -> Self {
        Self {
            stdout_limit: config.output_limit_bytes,
            stderr_limit: config.stderr_limit_bytes,
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            sample_interval: Duration::from_millis(config.memory_sample_interval_ms.max(1)),
            test_runs: AtomicU64::new(0),
            compilations: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            memory_kills: AtomicU64::new(0),
        }
    }

    /// Run the artifact against one test case
    pub async fn run(
        &self,
        artifact: &Artifact,
        test_case: &TestCase,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, JudgeError> {
        self.test_runs.fetch_add(1, Ordering::SeqCst);

        let spec = RunSpec {
            wall_time: limits.wall_time,
            cpu_time: limits.cpu_time,
            memory_bytes: Some(limits.memory_bytes),
            address_space_bytes: limits
                .limit_address_space
                .then(|| limits.memory_bytes.saturating_mul(2)),
            stdout_limit: self.stdout_limit,
            stderr_limit: self.stderr_limit,
            stop_on_overflow: true,
        };

        let mut result = self
            .run_command(
                &artifact.run_argv,
                &artifact.workdir,
                test_case.input.as_bytes(),
                &spec,
                cancel,
            )
            .await?;

        if spec.address_space_bytes.is_some() && !result.timed_out && !result.memory_exceeded {
            if let Some(peak_kb) = self
                .address_space_exhausted(artifact, test_case, &spec, &result, cancel)
                .await?
            {
                result.memory_exceeded = true;
                result.peak_memory_kb = result.peak_memory_kb.max(peak_kb);
            }
        }

        if result.timed_out {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
            warn!(
                execution_ms = result.duration_ms,
                limit_ms = limits.wall_time.as_millis() as u64,
                "Test execution timed out"
            );
        } else if result.memory_exceeded {
            self.memory_kills.fetch_add(1, Ordering::SeqCst);
            warn!(
                peak_memory_kb = result.peak_memory_kb,
                limit_bytes = limits.memory_bytes,
                "Test execution exceeded memory limit"
            );
        } else {
            debug!(
                execution_ms = result.duration_ms,
                exit_code = ?result.exit_code,
                signal = ?result.signal,
                output_truncated = result.output_truncated,
                "Test execution finished"
            );
        }

        Ok(result)
    }

    /// Decide whether a crash under the address-space cap was a refused
    /// allocation. Returns the peak to report when it was.
    async fn address_space_exhausted(
        &self,
        artifact: &Artifact,
        test_case: &TestCase,
        spec: &RunSpec,
        result: &ExecutionResult,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>, JudgeError> {
        if result.exited_cleanly() {
            return Ok(None);
        }
        if reports_allocation_failure(&result.stderr) {
            debug!("Allocator failure reported under address-space cap");
            return Ok(Some(result.peak_memory_kb));
        }
        if !result.signal.is_some_and(is_fault_signal) {
            return Ok(None);
        }

        debug!(signal = ?result.signal, "Replaying faulted run without address-space cap");
        let replay_spec = RunSpec {
            address_space_bytes: None,
            ..spec.clone()
        };
        let replay = self
            .run_command(
                &artifact.run_argv,
                &artifact.workdir,
                test_case.input.as_bytes(),
                &replay_spec,
                cancel,
            )
            .await?;

        let over_ceiling = spec
            .memory_bytes
            .is_some_and(|limit| replay.peak_memory_kb.saturating_mul(1024) > limit);
        Ok((replay.memory_exceeded || over_ceiling).then_some(replay.peak_memory_kb))
    }

    /// Run a compiler. No memory ceiling; output is capped but never stops the process.
    pub async fn compile(
        &self,
        argv: &[String],
        workdir: &Path,
        timeout: Duration,
        output_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, JudgeError> {
        self.compilations.fetch_add(1, Ordering::SeqCst);

        let spec = RunSpec {
            wall_time: timeout,
            cpu_time: None,
            memory_bytes: None,
            address_space_bytes: None,
            stdout_limit: output_limit,
            stderr_limit: output_limit,
            stop_on_overflow: false,
        };

        self.run_command(argv, workdir, &[], &spec, cancel).await
    }

    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            test_runs: self.test_runs.load(Ordering::SeqCst),
            compilations: self.compilations.load(Ordering::SeqCst),
            timeouts: self.timeouts.load(Ordering::SeqCst),
            memory_kills: self.memory_kills.load(Ordering::SeqCst),
        }
    }

    async fn run_command(
        &self,
        argv: &[String],
        workdir: &Path,
        input: &[u8],
        spec: &RunSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, JudgeError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| JudgeError::Spawn("empty command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", workdir)
            .env("TMPDIR", workdir)
            .env("LANG", "C.UTF-8")
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let rlimits = ProcessRlimits {
            cpu_seconds: spec.cpu_time.map(cpu_limit_seconds),
            address_space_bytes: spec.address_space_bytes,
        };
        // SAFETY: the closure only calls getrlimit/setrlimit, which are async-signal-safe
        unsafe {
            command.pre_exec(move || rlimits.apply());
        }

        let mut child = command
            .spawn()
            .map_err(|e| JudgeError::Spawn(format!("{}: {}", program, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| JudgeError::Spawn(format!("{}: no pid after spawn", program)))?;

        // From here on the whole group dies when supervision ends, however it ends
        let mut group_guard = ProcessGroupGuard::new(pid);
        let started = Instant::now();

        let stdin_task = child.stdin.take().map(|mut stdin| {
            let data = input.to_vec();
            tokio::spawn(async move {
                // The program may exit without reading; a broken pipe is not our error
                let _ = stdin.write_all(&data).await;
                let _ = stdin.shutdown().await;
            })
        });

        let overflow = CancellationToken::new();
        let stdout_task = tokio::spawn(read_bounded(
            child.stdout.take(),
            spec.stdout_limit,
            spec.stop_on_overflow.then(|| overflow.clone()),
        ));
        let stderr_task = tokio::spawn(read_bounded(child.stderr.take(), spec.stderr_limit, None));

        let deadline = tokio::time::sleep(spec.wall_time);
        tokio::pin!(deadline);

        let mut sampler = tokio::time::interval(self.sample_interval);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let group = Pid::from_raw(pid as i32);
        let mut stop: Option<StopReason> = None;
        let mut hard_killed = false;
        let mut peak_kb = 0u64;

        let exit_result = {
            let leader_gone = leader_exit(&mut child, pid);
            tokio::pin!(leader_gone);

            loop {
                tokio::select! {
                    exited = &mut leader_gone => break exited,
                    _ = &mut deadline, if !hard_killed => {
                        if stop.is_none() {
                            stop = Some(StopReason::WallTime);
                            begin_stop(group, deadline.as_mut(), self.kill_grace);
                        } else {
                            signal_group(group, Signal::SIGKILL);
                            hard_killed = true;
                        }
                    }
                    _ = sampler.tick() => {
                        if let Some(kb) = sample_peak_kb(pid) {
                            peak_kb = peak_kb.max(kb);
                        }
                        let over_limit = spec
                            .memory_bytes
                            .is_some_and(|limit| peak_kb.saturating_mul(1024) > limit);
                        if stop.is_none() && over_limit {
                            stop = Some(StopReason::Memory);
                            begin_stop(group, deadline.as_mut(), self.kill_grace);
                        }
                    }
                    _ = overflow.cancelled(), if stop.is_none() => {
                        stop = Some(StopReason::OutputLimit);
                        begin_stop(group, deadline.as_mut(), self.kill_grace);
                    }
                    _ = cancel.cancelled(), if stop.is_none() => {
                        stop = Some(StopReason::Cancelled);
                        begin_stop(group, deadline.as_mut(), self.kill_grace);
                    }
                }
            }
        };
        let duration = started.elapsed();

        // Descendants may still hold the pipes open. The leader is not reaped
        // yet, so the group id cannot have been recycled.
        signal_group(group, Signal::SIGKILL);
        let wait_result = match exit_result {
            Ok(()) => child.wait().await,
            Err(e) => Err(e),
        };
        if wait_result.is_ok() {
            group_guard.disarm();
        }

        if let Some(task) = stdin_task {
            task.abort();
        }
        let (stdout, output_truncated) = join_reader(stdout_task).await;
        let (stderr, stderr_truncated) = join_reader(stderr_task).await;

        let status = wait_result?;

        if stop == Some(StopReason::Cancelled) {
            debug!(pid = pid, "Process stopped by cancellation");
            return Err(JudgeError::Cancelled);
        }

        let signal = status.signal();
        let timed_out =
            stop == Some(StopReason::WallTime) || signal == Some(Signal::SIGXCPU as i32);

        Ok(ExecutionResult {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code(),
            signal,
            duration_ms: duration.as_millis() as u64,
            peak_memory_kb: peak_kb,
            timed_out,
            memory_exceeded: stop == Some(StopReason::Memory),
            output_truncated,
            stderr_truncated,
        })
    }
}

/// Kills the process group when dropped, so no path leaves descendants behind.
/// Disarmed once the leader has been reaped and the group id may be reused.
struct ProcessGroupGuard {
    group: Pid,
    armed: bool,
}

impl ProcessGroupGuard {
    fn new(pid: u32) -> Self {
        Self {
            group: Pid::from_raw(pid as i32),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if self.armed {
            signal_group(self.group, Signal::SIGKILL);
        }
    }
}

/// Resolve once the leader has exited, leaving it a zombie so its pid keeps
/// pinning the process group id until `Child::wait` reaps it
#[cfg(target_os = "linux")]
async fn leader_exit(_child: &mut Child, pid: u32) -> std::io::Result<()> {
    let leader = Pid::from_raw(pid as i32);
    let waited = tokio::task::spawn_blocking(move || loop {
        match waitid(Id::Pid(leader), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Err(Errno::EINTR) => continue,
            other => break other,
        }
    })
    .await
    .map_err(std::io::Error::other)?;

    match waited {
        // ECHILD: already reaped elsewhere, Child::wait still has the status
        Ok(_) | Err(Errno::ECHILD) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(target_os = "linux"))]
async fn leader_exit(child: &mut Child, _pid: u32) -> std::io::Result<()> {
    child.wait().await.map(|_| ())
}

/// Soft stop: SIGTERM now, the deadline becomes the hard-kill timer
fn begin_stop(group: Pid, deadline: Pin<&mut Sleep>, grace: Duration) {
    signal_group(group, Signal::SIGTERM);
    deadline.reset(tokio::time::Instant::now() + grace);
}

fn signal_group(group: Pid, signal: Signal) {
    match killpg(group, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(
            pgid = group.as_raw(),
            signal = ?signal,
            error = %e,
            "Failed to signal process group"
        ),
    }
}

/// RLIMIT_CPU granularity is one second; round up, never below one
fn cpu_limit_seconds(cpu: Duration) -> u64 {
    cpu.as_millis().div_ceil(1000).max(1) as u64
}

fn is_fault_signal(signal: i32) -> bool {
    [Signal::SIGSEGV, Signal::SIGBUS, Signal::SIGABRT]
        .iter()
        .any(|fault| *fault as i32 == signal)
}

fn reports_allocation_failure(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    ALLOCATION_FAILURE_MARKERS
        .iter()
        .any(|marker| stderr.contains(marker))
}

#[derive(Debug, Clone, Copy)]
struct ProcessRlimits {
    cpu_seconds: Option<u64>,
    address_space_bytes: Option<u64>,
}

impl ProcessRlimits {
    /// Runs in the forked child before exec
    fn apply(&self) -> std::io::Result<()> {
        lower_limit(Resource::RLIMIT_CORE, 0, 0)?;
        lower_limit(
            Resource::RLIMIT_FSIZE,
            FILE_SIZE_LIMIT_BYTES,
            FILE_SIZE_LIMIT_BYTES,
        )?;
        if let Some(seconds) = self.cpu_seconds {
            // SIGXCPU at the soft limit, SIGKILL one second later
            lower_limit(Resource::RLIMIT_CPU, seconds, seconds.saturating_add(1))?;
        }
        if let Some(bytes) = self.address_space_bytes {
            lower_limit(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        Ok(())
    }
}

/// setrlimit that never tries to raise the existing hard limit
fn lower_limit(resource: Resource, soft: u64, hard: u64) -> std::io::Result<()> {
    let (_, current_hard) = getrlimit(resource)?;
    let hard = hard.min(current_hard);
    setrlimit(resource, soft.min(hard), hard)?;
    Ok(())
}

/// Read until EOF keeping at most `limit` bytes.
///
/// With an overflow token the reader gives up at the cap and signals the
/// supervisor; without one it keeps draining and discards the excess.
async fn read_bounded<R>(
    reader: Option<R>,
    limit: usize,
    overflow: Option<CancellationToken>,
) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };

    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_BYTES];
    let mut truncated = false;

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if truncated {
            continue;
        }

        let remaining = limit.saturating_sub(buf.len());
        if n <= remaining {
            buf.extend_from_slice(&chunk[..n]);
        } else {
            buf.extend_from_slice(&chunk[..remaining]);
            truncated = true;
            if let Some(token) = &overflow {
                token.cancel();
                break;
            }
        }
    }

    (buf, truncated)
}

async fn join_reader(mut task: JoinHandle<(Vec<u8>, bool)>) -> (Vec<u8>, bool) {
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader task failed");
            (Vec::new(), false)
        }
        Err(_) => {
            warn!("Output pipe still open after process group was killed");
            task.abort();
            (Vec::new(), true)
        }
    }
}

#[cfg(target_os = "linux")]
fn sample_peak_kb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    parse_status_kb(&status, "VmHWM:")
}

#[cfg(not(target_os = "linux"))]
fn sample_peak_kb(_pid: u32) -> Option<u64> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_status_kb(status: &str, field: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(field))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// Clamp text to `limit` bytes on a char boundary, marking the cut
pub(crate) fn clamp_text(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... [truncated]", &text[..end])
}
