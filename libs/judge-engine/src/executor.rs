/// Job Executor - High-Level Orchestration
///
/// **Responsibility:**
/// Take one job end-to-end: workspace → build → sequential test runs →
/// verdict → workspace teardown.
///
/// **Architecture:**
/// 1. LanguageRegistry resolves the profile (registry.rs)
/// 2. BuildStage compiles once per attempt (build.rs)
/// 3. ExecutionSupervisor runs each test case in order (supervisor.rs)
/// 4. Evaluation folds results and decides when to stop (evaluator.rs)
///
/// This module is the glue layer - it knows nothing about:
/// - How processes are limited (supervisor's job)
/// - How outputs are compared (evaluator's job)
///
/// **Retries:**
/// Judge-side failures (spawn, workspace I/O) are retried with exponential
/// backoff in a fresh workspace. Outcomes caused by the submission are final.
use crate::build::{BuildOutcome, BuildStage};
use crate::error::JudgeError;
use crate::evaluator::{self, Evaluation, Progress};
use crate::registry::{LanguageProfile, LanguageRegistry};
use crate::supervisor::{ExecutionLimits, ExecutionSupervisor, SupervisorStats};
use crate::workspace::{Workspace, WorkspaceManager};
use judge_common::config::JudgeConfig;
use judge_common::types::{Job, JobResult};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

pub struct JudgeEngine {
    config: JudgeConfig,
    registry: LanguageRegistry,
    workspaces: Arc<WorkspaceManager>,
    supervisor: ExecutionSupervisor,
    builder: BuildStage,
}

impl JudgeEngine {
    pub fn new(config: JudgeConfig, registry: LanguageRegistry) -> Result<Self, JudgeError> {
        config.validate().map_err(JudgeError::Config)?;

        let workspaces = WorkspaceManager::new(&config.workspace_root)?;
        let supervisor = ExecutionSupervisor::new(&config);
        let builder = BuildStage::new(config.diagnostic_limit_bytes);

        Ok(Self {
            config,
            registry,
            workspaces,
            supervisor,
            builder,
        })
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.workspaces
    }

    pub fn supervisor_stats(&self) -> SupervisorStats {
        self.supervisor.stats()
    }

    /// Reject jobs that exceed the configured size guards
    pub fn validate_job(&self, job: &Job) -> Result<(), JudgeError> {
        if job.source_code.len() > self.config.max_source_bytes {
            return Err(JudgeError::InvalidJob(format!(
                "source code is {} bytes, limit is {}",
                job.source_code.len(),
                self.config.max_source_bytes
            )));
        }

        if let Some((index, test)) = job
            .test_cases
            .iter()
            .enumerate()
            .find(|(_, test)| test.input.len() > self.config.max_input_bytes)
        {
            return Err(JudgeError::InvalidJob(format!(
                "input of test {} is {} bytes, limit is {}",
                index + 1,
                test.input.len(),
                self.config.max_input_bytes
            )));
        }

        let limits = &job.limits;
        let zero_limit = [
            limits.time_limit_ms,
            limits.cpu_time_limit_ms,
            limits.memory_limit_mb,
        ]
        .contains(&Some(0));
        if zero_limit {
            return Err(JudgeError::InvalidJob(
                "limit overrides must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Judge one job to a final result.
    ///
    /// Returns `Err` only for invalid jobs and cancellation; every other
    /// outcome, including judge-side failures, is a `JobResult`.
    #[instrument(skip_all, fields(job_id = %job.id, language = %job.language))]
    pub async fn judge(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<JobResult, JudgeError> {
        self.validate_job(job)?;

        let profile = match self.registry.resolve(&job.language) {
            Ok(profile) => profile,
            Err(JudgeError::UnsupportedLanguage(language)) => {
                warn!("Unsupported language");
                return Ok(evaluator::unsupported_language(&job.id, &language));
            }
            Err(e) => return Err(e),
        };
        let limits = ExecutionLimits::resolve(&profile, &job.limits);

        info!(
            test_count = job.test_cases.len(),
            time_limit_ms = limits.wall_time.as_millis() as u64,
            memory_limit_bytes = limits.memory_bytes,
            "Starting job execution"
        );

        let max_attempts = self.config.internal_retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            match self.attempt(job, &profile, &limits, attempt, cancel).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_internal() && attempt < max_attempts => {
                    let backoff = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        attempt = attempt,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Judge-side failure, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(JudgeError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) if e.is_internal() => {
                    error!(attempts = attempt, error = %e, "Judge-side failure, giving up");
                    let mut result = evaluator::internal_error(&job.id, e.to_string());
                    result.attempts = attempt;
                    return Ok(result);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt in a fresh workspace, released on every path
    async fn attempt(
        &self,
        job: &Job,
        profile: &LanguageProfile,
        limits: &ExecutionLimits,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<JobResult, JudgeError> {
        if cancel.is_cancelled() {
            return Err(JudgeError::Cancelled);
        }

        let workspace = self.workspaces.acquire(&job.id).await?;
        let outcome = self
            .run_in_workspace(&workspace, job, profile, limits, attempt, cancel)
            .await;

        if let Err(e) = workspace.release().await {
            warn!(error = %e, "Workspace cleanup failed");
        }

        outcome
    }

    async fn run_in_workspace(
        &self,
        workspace: &Workspace,
        job: &Job,
        profile: &LanguageProfile,
        limits: &ExecutionLimits,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<JobResult, JudgeError> {
        let artifact = match self
            .builder
            .build(&self.supervisor, workspace, profile, &job.source_code, cancel)
            .await?
        {
            BuildOutcome::Built(artifact) => artifact,
            BuildOutcome::CompileError(output) => {
                let mut result = evaluator::compile_error(&job.id, output);
                result.attempts = attempt;
                return Ok(result);
            }
        };

        let mut evaluation = Evaluation::new(
            &job.id,
            self.config.failure_policy,
            self.config.diagnostic_limit_bytes,
        );

        for test_case in &job.test_cases {
            if cancel.is_cancelled() {
                return Err(JudgeError::Cancelled);
            }
            let result = self
                .supervisor
                .run(&artifact, test_case, limits, cancel)
                .await?;
            if evaluation.record(test_case, &result) == Progress::Halt {
                break;
            }
        }

        Ok(evaluation.finish(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::sh_profile;
    use judge_common::types::{LimitOverrides, TestCase, Verdict};

    fn engine(root: &std::path::Path) -> JudgeEngine {
        let config = JudgeConfig {
            workspace_root: root.to_path_buf(),
            max_source_bytes: 64,
            max_input_bytes: 16,
            ..JudgeConfig::default()
        };
        let registry = LanguageRegistry::from_profiles(vec![sh_profile()]).unwrap();
        JudgeEngine::new(config, registry).unwrap()
    }

    fn job(source: &str, tests: Vec<TestCase>) -> Job {
        Job {
            id: "exec-test".to_string(),
            language: "sh".to_string(),
            source_code: source.to_string(),
            test_cases: tests,
            limits: LimitOverrides::default(),
        }
    }

    #[test]
    fn test_validate_job_guards() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());

        assert!(engine.validate_job(&job("echo ok", vec![])).is_ok());

        let oversized = job(&"x".repeat(65), vec![]);
        assert!(matches!(
            engine.validate_job(&oversized),
            Err(JudgeError::InvalidJob(_))
        ));

        let big_input = job(
            "cat",
            vec![TestCase {
                input: "y".repeat(17),
                expected_output: String::new(),
            }],
        );
        assert!(matches!(
            engine.validate_job(&big_input),
            Err(JudgeError::InvalidJob(_))
        ));

        let mut zero = job("cat", vec![]);
        zero.limits.time_limit_ms = Some(0);
        assert!(matches!(
            engine.validate_job(&zero),
            Err(JudgeError::InvalidJob(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = engine
            .judge(
                &job(
                    "cat",
                    vec![TestCase {
                        input: "1".to_string(),
                        expected_output: "1".to_string(),
                    }],
                ),
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(JudgeError::Cancelled)));
        assert_eq!(engine.workspaces().stats().live, 0);
    }

    #[tokio::test]
    async fn test_unsupported_language_result() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        let mut cobol = job("DISPLAY 'HI'", vec![]);
        cobol.language = "cobol".to_string();

        let result = engine.judge(&cobol, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.verdict, Verdict::UnsupportedLanguage);
        assert_eq!(engine.workspaces().stats().created, 0);
    }
}
