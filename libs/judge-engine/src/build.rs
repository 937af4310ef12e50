/// Build Stage - Source to Runnable Artifact
///
/// **Responsibility:**
/// Write the submission into the workspace and, for compiled languages, run
/// the compiler once. The artifact is shared read-only by every test run.
///
/// **Outcomes:**
/// - `Built(artifact)`: ready to run
/// - `CompileError(diagnostic)`: the submission's fault, bounded diagnostic
/// - `Err(JudgeError)`: the judge's fault (spawn failure, I/O), retryable
use crate::error::JudgeError;
use crate::registry::{expand_template, LanguageProfile, TemplatePaths};
use crate::supervisor::{clamp_text, ExecutionSupervisor};
use crate::workspace::Workspace;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Compiled output name inside the workspace
const ARTIFACT_NAME: &str = "main";

/// A runnable program inside a workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub workdir: PathBuf,
    /// The compiled binary, or the source file for interpreted languages
    pub path: PathBuf,
    /// Fully expanded run command
    pub run_argv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Built(Artifact),
    CompileError(String),
}

pub struct BuildStage {
    diagnostic_limit: usize,
}

impl BuildStage {
    pub fn new(diagnostic_limit: usize) -> Self {
        Self { diagnostic_limit }
    }

    pub async fn build(
        &self,
        supervisor: &ExecutionSupervisor,
        workspace: &Workspace,
        profile: &LanguageProfile,
        source_code: &str,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome, JudgeError> {
        let source = workspace
            .write(&profile.source_file_name(), source_code.as_bytes())
            .await?;

        let paths = TemplatePaths {
            source: source.clone(),
            artifact: workspace.path().join(ARTIFACT_NAME),
            workdir: workspace.path().to_path_buf(),
        };

        let compile_argv = match &profile.compile {
            Some(template) if !template.is_empty() => expand_template(template, &paths),
            _ => {
                debug!(language = %profile.name, "Interpreted language, skipping compilation");
                return Ok(BuildOutcome::Built(Artifact {
                    workdir: paths.workdir.clone(),
                    path: source,
                    run_argv: expand_template(&profile.run, &paths),
                }));
            }
        };

        info!(language = %profile.name, "Compiling submission");
        let timeout = Duration::from_millis(profile.compile_timeout_ms);
        let result = supervisor
            .compile(
                &compile_argv,
                &paths.workdir,
                timeout,
                self.diagnostic_limit,
                cancel,
            )
            .await?;

        if result.timed_out {
            warn!(limit_ms = profile.compile_timeout_ms, "Compilation timed out");
            return Ok(BuildOutcome::CompileError(format!(
                "Compilation timed out after {}ms",
                profile.compile_timeout_ms
            )));
        }

        if !result.exited_cleanly() {
            let diagnostic = compiler_diagnostic(&result.stderr, &result.stdout, result.exit_code);
            debug!(exit_code = ?result.exit_code, "Compilation failed");
            return Ok(BuildOutcome::CompileError(clamp_text(
                &diagnostic,
                self.diagnostic_limit,
            )));
        }

        // Languages whose compiler writes class files leave the source as the run target
        let artifact_path = if profile.run.iter().any(|arg| arg.contains("{artifact}")) {
            if !tokio::fs::try_exists(&paths.artifact).await? {
                return Ok(BuildOutcome::CompileError(
                    "Compiler exited successfully but produced no executable".to_string(),
                ));
            }
            paths.artifact.clone()
        } else {
            source
        };

        info!(language = %profile.name, "Compilation successful");
        Ok(BuildOutcome::Built(Artifact {
            workdir: paths.workdir.clone(),
            path: artifact_path,
            run_argv: expand_template(&profile.run, &paths),
        }))
    }
}

/// Compilers report on stderr; fall back to stdout, then to the exit status
fn compiler_diagnostic(stderr: &str, stdout: &str, exit_code: Option<i32>) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    match exit_code {
        Some(code) => format!("Compiler exited with code {}", code),
        None => "Compiler was terminated by a signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{checked_sh_profile, sh_profile};
    use crate::workspace::WorkspaceManager;
    use judge_common::config::JudgeConfig;

    fn supervisor() -> ExecutionSupervisor {
        ExecutionSupervisor::new(&JudgeConfig::default())
    }

    #[tokio::test]
    async fn test_interpreted_language_skips_compiler() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).unwrap();
        let workspace = manager.acquire("interp").await.unwrap();
        let supervisor = supervisor();

        let outcome = BuildStage::new(4096)
            .build(
                &supervisor,
                &workspace,
                &sh_profile(),
                "echo hi",
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        match outcome {
            BuildOutcome::Built(artifact) => {
                assert_eq!(artifact.path, workspace.path().join("main.sh"));
                assert_eq!(artifact.run_argv[0], "sh");
                assert_eq!(artifact.run_argv[1], artifact.path.to_string_lossy());
            }
            other => panic!("expected Built, got {:?}", other),
        }
        assert_eq!(supervisor.stats().compilations, 0);
    }

    #[tokio::test]
    async fn test_syntax_error_is_compile_error() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).unwrap();
        let workspace = manager.acquire("broken").await.unwrap();
        let supervisor = supervisor();

        let outcome = BuildStage::new(4096)
            .build(
                &supervisor,
                &workspace,
                &checked_sh_profile(),
                "if then fi (",
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        match outcome {
            BuildOutcome::CompileError(diagnostic) => assert!(!diagnostic.is_empty()),
            other => panic!("expected CompileError, got {:?}", other),
        }
        assert_eq!(supervisor.stats().compilations, 1);
        assert_eq!(supervisor.stats().test_runs, 0);
    }

    #[tokio::test]
    async fn test_diagnostic_is_bounded() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).unwrap();
        let workspace = manager.acquire("noisy").await.unwrap();

        let mut noisy = checked_sh_profile();
        noisy.compile = Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            "yes error | head -c 100000 >&2; exit 1".to_string(),
        ]);

        let outcome = BuildStage::new(256)
            .build(
                &supervisor(),
                &workspace,
                &noisy,
                "",
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        match outcome {
            BuildOutcome::CompileError(diagnostic) => {
                assert!(diagnostic.len() <= 256 + "\n... [truncated]".len());
                assert!(diagnostic.ends_with("[truncated]"));
            }
            other => panic!("expected CompileError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_artifact_is_compile_error() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).unwrap();
        let workspace = manager.acquire("noartifact").await.unwrap();

        let mut profile = checked_sh_profile();
        profile.compile = Some(vec!["true".to_string()]);
        profile.run = vec!["{artifact}".to_string()];

        let outcome = BuildStage::new(4096)
            .build(
                &supervisor(),
                &workspace,
                &profile,
                "",
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, BuildOutcome::CompileError(_)));
    }

    #[tokio::test]
    async fn test_compile_timeout() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).unwrap();
        let workspace = manager.acquire("slow").await.unwrap();

        let mut profile = checked_sh_profile();
        profile.compile = Some(vec!["sleep".to_string(), "30".to_string()]);
        profile.compile_timeout_ms = 200;

        let outcome = BuildStage::new(4096)
            .build(
                &supervisor(),
                &workspace,
                &profile,
                "",
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        match outcome {
            BuildOutcome::CompileError(diagnostic) => assert!(diagnostic.contains("timed out")),
            other => panic!("expected CompileError, got {:?}", other),
        }
    }

    #[test]
    fn test_compiler_diagnostic_fallbacks() {
        assert_eq!(compiler_diagnostic(" err \n", "out", Some(1)), "err");
        assert_eq!(compiler_diagnostic("", "out\n", Some(1)), "out");
        assert_eq!(compiler_diagnostic("", "", Some(2)), "Compiler exited with code 2");
    }
}
