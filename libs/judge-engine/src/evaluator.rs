/// Verdict Engine - Language-Agnostic Judging Logic
///
/// **Core Responsibility:**
/// Turn raw execution results into per-test verdicts and one final verdict.
///
/// **Critical Properties:**
/// - Knows nothing about processes or rlimits
/// - Knows nothing about language runtimes
/// - Pure function: (execution results, expected outputs, policy) → verdict
///
/// **Per-Test Precedence (first match wins):**
/// 1. Time limit (wall clock or CPU)
/// 2. Memory limit
/// 3. Output truncated → Wrong Answer (truncated output is never accepted)
/// 4. Runtime error (non-zero exit or killed by a signal)
/// 5. Output mismatch → Wrong Answer
/// 6. Accepted
///
/// **Normalization Rules (Applied to All Languages):**
/// - Trim leading and trailing whitespace: YES
/// - Ignore newline differences (\n vs \r\n) at the ends: YES (via trim)
/// - Case sensitivity: YES (exact match required)
/// - Floating-point tolerance: NO
///
/// **Aggregation:**
/// - Overall verdict is the first failing test's verdict, Accepted otherwise
/// - Execution time is the sum over executed tests
/// - Peak memory is the maximum over executed tests
/// - Test numbering is 1-based
use crate::supervisor::clamp_text;
use judge_common::config::FailurePolicy;
use judge_common::types::{
    Diagnostic, ExecutionResult, Job, JobResult, TestCase, TestReport, Verdict,
};
use chrono::Utc;
use tracing::{debug, info};

/// Normalize output string for comparison
///
/// **Preserves:**
/// - Internal whitespace
/// - Case sensitivity
/// - Empty lines within content
pub fn normalize_output(output: &str) -> &str {
    output.trim()
}

/// Judge a single test case execution
pub fn evaluate_test(
    index: usize,
    test_case: &TestCase,
    result: &ExecutionResult,
    diagnostic_limit: usize,
) -> TestReport {
    let (verdict, diagnostic) = if result.timed_out {
        (
            Verdict::TimeLimitExceeded,
            Some(Diagnostic::LimitExceeded {
                test_index: index,
                message: format!("Time limit exceeded after {}ms", result.duration_ms),
            }),
        )
    } else if result.memory_exceeded {
        (
            Verdict::MemoryLimitExceeded,
            Some(Diagnostic::LimitExceeded {
                test_index: index,
                message: format!(
                    "Memory limit exceeded (peak {} KB)",
                    result.peak_memory_kb
                ),
            }),
        )
    } else if result.output_truncated {
        (
            Verdict::WrongAnswer,
            Some(wrong_answer(index, test_case, &result.stdout, diagnostic_limit, true)),
        )
    } else if !result.exited_cleanly() {
        (
            Verdict::RuntimeError,
            Some(Diagnostic::Runtime {
                test_index: index,
                exit_code: result.exit_code,
                signal: result.signal,
                stderr: clamp_text(result.stderr.trim(), diagnostic_limit),
            }),
        )
    } else if normalize_output(&result.stdout) != normalize_output(&test_case.expected_output) {
        (
            Verdict::WrongAnswer,
            Some(wrong_answer(index, test_case, &result.stdout, diagnostic_limit, false)),
        )
    } else {
        (Verdict::Accepted, None)
    };

    TestReport {
        index,
        verdict,
        duration_ms: result.duration_ms,
        peak_memory_kb: result.peak_memory_kb,
        diagnostic,
    }
}

fn wrong_answer(
    index: usize,
    test_case: &TestCase,
    actual: &str,
    limit: usize,
    truncated: bool,
) -> Diagnostic {
    let mut actual = clamp_text(normalize_output(actual), limit);
    if truncated && !actual.ends_with("[truncated]") {
        actual.push_str("\n... [truncated]");
    }
    Diagnostic::WrongAnswer {
        test_index: index,
        input: clamp_text(&test_case.input, limit),
        expected: clamp_text(normalize_output(&test_case.expected_output), limit),
        actual,
    }
}

/// Whether the executor should launch the next test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Continue,
    Halt,
}

/// Incremental accumulator over one job's test results
#[derive(Debug)]
pub struct Evaluation {
    job_id: String,
    policy: FailurePolicy,
    diagnostic_limit: usize,
    tests: Vec<TestReport>,
    first_failure: Option<usize>,
}

impl Evaluation {
    pub fn new(job_id: &str, policy: FailurePolicy, diagnostic_limit: usize) -> Self {
        Self {
            job_id: job_id.to_string(),
            policy,
            diagnostic_limit,
            tests: Vec::new(),
            first_failure: None,
        }
    }

    /// Record the next test's result, in order
    pub fn record(&mut self, test_case: &TestCase, result: &ExecutionResult) -> Progress {
        let index = self.tests.len() + 1;
        let report = evaluate_test(index, test_case, result, self.diagnostic_limit);

        debug!(
            job_id = %self.job_id,
            test = index,
            verdict = %report.verdict,
            execution_ms = report.duration_ms,
            "Test evaluated"
        );

        let failed = !report.verdict.is_accepted();
        if failed && self.first_failure.is_none() {
            self.first_failure = Some(self.tests.len());
        }
        self.tests.push(report);

        match (failed, self.policy) {
            (true, FailurePolicy::ShortCircuit) => Progress::Halt,
            _ => Progress::Continue,
        }
    }

    pub fn tests_recorded(&self) -> usize {
        self.tests.len()
    }

    pub fn finish(self, attempts: u32) -> JobResult {
        let execution_time_ms = self.tests.iter().map(|t| t.duration_ms).sum();
        let peak_memory_kb = self
            .tests
            .iter()
            .map(|t| t.peak_memory_kb)
            .max()
            .unwrap_or(0);

        let (verdict, diagnostic) = match self.first_failure {
            Some(i) => (self.tests[i].verdict, self.tests[i].diagnostic.clone()),
            None => (Verdict::Accepted, None),
        };

        info!(
            job_id = %self.job_id,
            verdict = %verdict,
            tests_run = self.tests.len(),
            execution_ms = execution_time_ms,
            peak_memory_kb = peak_memory_kb,
            "Evaluation complete"
        );

        JobResult {
            job_id: self.job_id,
            verdict,
            execution_time_ms,
            peak_memory_kb,
            diagnostic,
            tests: self.tests,
            attempts,
            completed_at: Utc::now(),
        }
    }
}

/// Evaluate a finished batch of results in test order.
///
/// Results beyond the point where the policy halts are ignored, so the
/// outcome is the same as recording them one at a time.
pub fn evaluate(
    job: &Job,
    results: &[ExecutionResult],
    policy: FailurePolicy,
    diagnostic_limit: usize,
) -> JobResult {
    let mut evaluation = Evaluation::new(&job.id, policy, diagnostic_limit);
    for (test_case, result) in job.test_cases.iter().zip(results) {
        if evaluation.record(test_case, result) == Progress::Halt {
            break;
        }
    }
    evaluation.finish(1)
}

/// Job-level result for a submission that failed to compile
pub fn compile_error(job_id: &str, output: String) -> JobResult {
    JobResult::terminal(job_id, Verdict::CompileError, Some(Diagnostic::Compile { output }))
}

pub fn unsupported_language(job_id: &str, language: &str) -> JobResult {
    JobResult::terminal(
        job_id,
        Verdict::UnsupportedLanguage,
        Some(Diagnostic::UnsupportedLanguage {
            language: language.to_string(),
        }),
    )
}

pub fn internal_error(job_id: &str, message: String) -> JobResult {
    JobResult::terminal(job_id, Verdict::InternalError, Some(Diagnostic::Internal { message }))
}
