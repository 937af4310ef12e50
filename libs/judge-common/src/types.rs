use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A unit of judging work supplied by the submission collaborator.
///
/// `id` is caller-controlled and may collide across jobs; it is never used
/// verbatim to build filesystem paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub language: String,
    pub source_code: String,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub limits: LimitOverrides,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
}

/// Per-job overrides of the language profile defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time_limit_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
}

/// Final classification of a job. Exactly one per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    CompileError,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    UnsupportedLanguage,
    InternalError,
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Verdict::Accepted => "Accepted",
            Verdict::WrongAnswer => "Wrong Answer",
            Verdict::CompileError => "Compilation Error",
            Verdict::RuntimeError => "Runtime Error",
            Verdict::TimeLimitExceeded => "Time Limit Exceeded",
            Verdict::MemoryLimitExceeded => "Memory Limit Exceeded",
            Verdict::UnsupportedLanguage => "Unsupported Language",
            Verdict::InternalError => "Internal Error",
        };
        f.write_str(label)
    }
}

/// Raw outcome of running the artifact against one test case.
///
/// Produced by the execution supervisor, consumed by the verdict engine.
/// Carries only mechanical facts; no verdict is decided here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration_ms: u64,
    /// Best-effort peak resident set size of the supervised process
    pub peak_memory_kb: u64,
    pub timed_out: bool,
    pub memory_exceeded: bool,
    pub output_truncated: bool,
    pub stderr_truncated: bool,
}

impl ExecutionResult {
    /// True when the process exited on its own with status 0
    pub fn exited_cleanly(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }
}

/// Verdict-dependent detail attached to a job or test report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    Compile {
        output: String,
    },
    WrongAnswer {
        test_index: usize,
        input: String,
        expected: String,
        actual: String,
    },
    Runtime {
        test_index: usize,
        exit_code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
    },
    LimitExceeded {
        test_index: usize,
        message: String,
    },
    UnsupportedLanguage {
        language: String,
    },
    Internal {
        message: String,
    },
}

/// Outcome of one executed test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub index: usize,
    pub verdict: Verdict,
    pub duration_ms: u64,
    pub peak_memory_kb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
}

/// Final answer for a job, returned exactly once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub verdict: Verdict,
    /// Sum of durations of the test cases actually executed
    pub execution_time_ms: u64,
    /// Maximum peak memory across executed test cases
    pub peak_memory_kb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
    #[serde(default)]
    pub tests: Vec<TestReport>,
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

impl JobResult {
    /// A result that never reached test execution
    pub fn terminal(job_id: &str, verdict: Verdict, diagnostic: Option<Diagnostic>) -> Self {
        Self {
            job_id: job_id.to_string(),
            verdict,
            execution_time_ms: 0,
            peak_memory_kb: 0,
            diagnostic,
            tests: Vec::new(),
            attempts: 1,
            completed_at: Utc::now(),
        }
    }
}
