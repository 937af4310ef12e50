// CLI commands for the judge
use anyhow::{bail, Context, Result};
use futures_util::future::join_all;
use judge_common::config::{FailurePolicy, JudgeConfig};
use judge_common::types::{Diagnostic, Job, JobResult};
use judge_engine::registry::{LanguagesFile, DEFAULT_LANGUAGES_PATH};
use judge_engine::workspace::WorkspaceManager;
use judge_engine::{JudgeEngine, JudgePool, LanguageProfile, LanguageRegistry};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Flags of `add-lang`, collected
#[derive(Debug, Clone)]
pub struct NewLanguage {
    pub name: String,
    pub ext: String,
    pub run: String,
    pub compile: Option<String>,
    pub source_file: String,
    pub aliases: Vec<String>,
    pub version: String,
    pub memory_mb: u64,
    pub time_ms: u64,
    pub compile_time_ms: u64,
    pub limit_address_space: bool,
}

/// Load the languages file for editing; a missing file starts from the built-in table
fn load_languages_config(path: &Path) -> Result<LanguagesFile> {
    if path.exists() {
        LanguagesFile::read(path)
    } else {
        LanguagesFile::builtin()
    }
}

/// Pick the languages file: explicit flag, then ./config/languages.json, then built-in
fn resolve_languages_path(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let default = PathBuf::from(DEFAULT_LANGUAGES_PATH);
            default.exists().then_some(default)
        }
    }
}

/// Split a command string into argv; quoting is not supported
fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

/// Judge job descriptor files through a local pool
pub async fn run_jobs(
    job_files: &[PathBuf],
    languages: Option<&Path>,
    policy: Option<FailurePolicy>,
    json: bool,
) -> Result<()> {
    let mut jobs = Vec::with_capacity(job_files.len());
    for path in job_files {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let job: Job = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse job descriptor {}", path.display()))?;
        jobs.push(job);
    }

    let mut config = JudgeConfig::from_env()
        .map_err(anyhow::Error::msg)
        .context("Invalid judge configuration")?;
    if let Some(policy) = policy {
        config.failure_policy = policy;
    }
    // Every file given on the command line must fit in the queue
    config.max_queue_depth = config.max_queue_depth.max(jobs.len());

    let languages_path = resolve_languages_path(languages.or(config.languages_path.as_deref()));
    let registry = LanguageRegistry::load_or_builtin(languages_path.as_deref())?;
    let engine = Arc::new(JudgeEngine::new(config, registry)?);
    let pool = JudgePool::start(engine);

    if !json {
        println!("🚀 Judging {} job(s)...\n", jobs.len());
    }

    let mut handles = Vec::new();
    for job in jobs {
        let job_id = job.id.clone();
        match pool.submit(job) {
            Ok(handle) => handles.push(handle),
            Err(e) => println!("❌ {:<20} rejected: {}", job_id, e),
        }
    }

    let outcomes = join_all(handles.into_iter().map(|handle| async move {
        let job_id = handle.id().to_string();
        (job_id, handle.result().await)
    }))
    .await;

    let mut accepted = 0;
    let total = outcomes.len();
    for (job_id, outcome) in outcomes {
        match outcome {
            Ok(result) => {
                if result.verdict.is_accepted() {
                    accepted += 1;
                }
                if json {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                } else {
                    print_summary(&result);
                }
            }
            Err(e) => println!("❌ {:<20} {}", job_id, e),
        }
    }

    pool.shutdown().await;

    if !json {
        println!("\n✅ Accepted: {} / {}", accepted, total);
    }
    Ok(())
}

fn print_summary(result: &JobResult) {
    let icon = if result.verdict.is_accepted() { "✅" } else { "❌" };
    println!(
        "{} {:<20} {:<22} {:>6} ms {:>8} KB  ({} test(s), {} attempt(s))",
        icon,
        result.job_id,
        result.verdict.to_string(),
        result.execution_time_ms,
        result.peak_memory_kb,
        result.tests.len(),
        result.attempts
    );
    if let Some(diagnostic) = &result.diagnostic {
        for line in describe_diagnostic(diagnostic).lines() {
            println!("     {}", line);
        }
    }
}

/// Human-readable rendering of a diagnostic
pub fn describe_diagnostic(diagnostic: &Diagnostic) -> String {
    match diagnostic {
        Diagnostic::Compile { output } => format!("Compiler output:\n{}", output),
        Diagnostic::WrongAnswer {
            test_index,
            input,
            expected,
            actual,
        } => format!(
            "Test {}: input \"{}\"\nExpected: \"{}\"\nGot:      \"{}\"",
            test_index, input, expected, actual
        ),
        Diagnostic::Runtime {
            test_index,
            exit_code,
            signal,
            stderr,
        } => {
            let status = match (exit_code, signal) {
                (_, Some(signal)) => format!("killed by signal {}", signal),
                (Some(code), None) => format!("exit code {}", code),
                (None, None) => "unknown exit status".to_string(),
            };
            format!("Test {}: {}\n{}", test_index, status, stderr)
        }
        Diagnostic::LimitExceeded {
            test_index,
            message,
        } => format!("Test {}: {}", test_index, message),
        Diagnostic::UnsupportedLanguage { language } => {
            format!("Language '{}' is not configured", language)
        }
        Diagnostic::Internal { message } => format!("Judge error: {}", message),
    }
}

/// List configured languages
pub fn list_languages(config_path: Option<&Path>) -> Result<()> {
    let path = resolve_languages_path(config_path);
    let registry = LanguageRegistry::load_or_builtin(path.as_deref())?;

    match &path {
        Some(path) => println!("📋 Configured Languages ({}):\n", path.display()),
        None => println!("📋 Configured Languages (built-in):\n"),
    }
    println!(
        "{:<12} {:<10} {:<18} {:<10} {:>9} {:>8}",
        "Name", "Version", "Aliases", "Compiled", "Time", "Memory"
    );
    println!("{}", "─".repeat(72));

    let profiles = registry.profiles();
    for profile in &profiles {
        println!(
            "{:<12} {:<10} {:<18} {:<10} {:>6} ms {:>5} MB",
            profile.name,
            profile.version,
            profile.aliases.join(","),
            if profile.has_compile_step() { "yes" } else { "no" },
            profile.run_timeout_ms,
            profile.memory_limit_mb
        );
    }

    println!("\n✅ Total: {} language(s)", profiles.len());
    Ok(())
}

/// Add a language profile to the languages file
pub fn add_language(config_path: &Path, lang: NewLanguage) -> Result<()> {
    println!("🚀 Adding language: {}", lang.name);

    let name = lang.name.trim().to_lowercase();
    let ext = lang.ext.trim().trim_start_matches('.').to_string();
    if name.is_empty() || ext.is_empty() {
        bail!("Language name and extension cannot be empty");
    }

    let run = split_command(&lang.run);
    if run.is_empty() {
        bail!("Run command cannot be empty");
    }
    let compile = lang
        .compile
        .as_deref()
        .map(split_command)
        .filter(|argv| !argv.is_empty());

    let mut languages_file = load_languages_config(config_path)?;
    if languages_file.languages.iter().any(|l| l.name == name) {
        bail!("Language '{}' already exists in config", name);
    }

    languages_file.languages.push(LanguageProfile {
        name: name.clone(),
        aliases: lang.aliases,
        version: lang.version,
        source_file: lang.source_file,
        file_extension: ext,
        compile,
        run,
        compile_timeout_ms: lang.compile_time_ms,
        run_timeout_ms: lang.time_ms,
        memory_limit_mb: lang.memory_mb,
        cpu_time_limit_ms: None,
        limit_address_space: lang.limit_address_space,
    });

    // Reject clashing aliases and invalid fields before touching the file
    LanguageRegistry::from_profiles(languages_file.languages.clone())
        .context("New language would make the config invalid")?;

    println!("📝 Updating {}...", config_path.display());
    languages_file.write(config_path)?;

    println!("✅ Language '{}' added successfully!", name);
    Ok(())
}

/// Remove a language profile from the languages file
pub fn remove_language(config_path: &Path, name: &str, yes: bool) -> Result<()> {
    println!("🗑️  Removing language: {}", name);

    let mut languages_file = load_languages_config(config_path)?;
    let lang_index = languages_file
        .languages
        .iter()
        .position(|l| l.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| anyhow::anyhow!("Language '{}' not found in config", name))?;

    if languages_file.languages.len() == 1 {
        bail!("Refusing to remove the last configured language");
    }

    // Confirm deletion
    if !yes {
        print!(
            "⚠️  This will remove '{}' from {}\n\nContinue? (y/N): ",
            languages_file.languages[lang_index].name,
            config_path.display()
        );
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("❌ Aborted");
            return Ok(());
        }
    }

    let removed = languages_file.languages.remove(lang_index);
    println!("📝 Updating {}...", config_path.display());
    languages_file.write(config_path)?;

    println!("✅ Language '{}' removed successfully!", removed.name);
    Ok(())
}

/// Remove orphaned workspace directories
pub async fn sweep_workspaces(root: Option<PathBuf>) -> Result<()> {
    let root = match root {
        Some(root) => root,
        None => {
            JudgeConfig::from_env()
                .map_err(anyhow::Error::msg)
                .context("Invalid judge configuration")?
                .workspace_root
        }
    };

    println!("🧹 Sweeping {}...", root.display());
    let manager = WorkspaceManager::new(&root)?;
    let removed = manager.sweep_orphans().await?;
    println!("✅ Removed {} orphaned workspace(s)", removed);
    Ok(())
}
