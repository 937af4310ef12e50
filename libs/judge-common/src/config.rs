// Judge configuration
// Defaults are tuned for a single host; every field can be overridden from the environment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// What the judge does after the first failing test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop at the first non-accepted test case
    #[default]
    ShortCircuit,
    /// Execute every test case and report each failure
    RunAll,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "short_circuit" | "short-circuit" | "first" => Ok(FailurePolicy::ShortCircuit),
            "run_all" | "run-all" | "all" => Ok(FailurePolicy::RunAll),
            other => Err(format!("Unknown failure policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Number of jobs executed concurrently
    pub pool_size: usize,
    /// Waiting jobs allowed before submissions are rejected
    pub max_queue_depth: usize,
    pub workspace_root: PathBuf,
    /// Optional languages.json; the built-in table is used when absent
    pub languages_path: Option<PathBuf>,
    pub output_limit_bytes: usize,
    pub stderr_limit_bytes: usize,
    pub diagnostic_limit_bytes: usize,
    /// Delay between SIGTERM and SIGKILL when stopping a process group
    pub kill_grace_ms: u64,
    pub memory_sample_interval_ms: u64,
    pub internal_retries: u32,
    pub failure_policy: FailurePolicy,
    pub max_source_bytes: usize,
    pub max_input_bytes: usize,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            max_queue_depth: 64,
            workspace_root: std::env::temp_dir().join("judge-workspaces"),
            languages_path: None,
            output_limit_bytes: 1024 * 1024,
            stderr_limit_bytes: 64 * 1024,
            diagnostic_limit_bytes: 4 * 1024,
            kill_grace_ms: 100,
            memory_sample_interval_ms: 10,
            internal_retries: 2,
            failure_policy: FailurePolicy::ShortCircuit,
            max_source_bytes: 1024 * 1024,
            max_input_bytes: 10 * 1024 * 1024,
        }
    }
}

impl JudgeConfig {
    /// Build configuration from `JUDGE_*` environment variables
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup (environment, tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            pool_size: parse_or(&lookup, "JUDGE_POOL_SIZE", defaults.pool_size)?,
            max_queue_depth: parse_or(&lookup, "JUDGE_MAX_QUEUE", defaults.max_queue_depth)?,
            workspace_root: lookup("JUDGE_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            languages_path: lookup("JUDGE_LANGUAGES").map(PathBuf::from),
            output_limit_bytes: parse_or(&lookup, "JUDGE_OUTPUT_LIMIT", defaults.output_limit_bytes)?,
            stderr_limit_bytes: parse_or(&lookup, "JUDGE_STDERR_LIMIT", defaults.stderr_limit_bytes)?,
            diagnostic_limit_bytes: parse_or(
                &lookup,
                "JUDGE_DIAGNOSTIC_LIMIT",
                defaults.diagnostic_limit_bytes,
            )?,
            kill_grace_ms: parse_or(&lookup, "JUDGE_KILL_GRACE_MS", defaults.kill_grace_ms)?,
            memory_sample_interval_ms: parse_or(
                &lookup,
                "JUDGE_SAMPLE_INTERVAL_MS",
                defaults.memory_sample_interval_ms,
            )?,
            internal_retries: parse_or(&lookup, "JUDGE_INTERNAL_RETRIES", defaults.internal_retries)?,
            failure_policy: parse_or(&lookup, "JUDGE_FAILURE_POLICY", defaults.failure_policy)?,
            max_source_bytes: parse_or(&lookup, "JUDGE_MAX_SOURCE_BYTES", defaults.max_source_bytes)?,
            max_input_bytes: parse_or(&lookup, "JUDGE_MAX_INPUT_BYTES", defaults.max_input_bytes)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("pool_size must be at least 1".to_string());
        }
        if self.output_limit_bytes == 0 || self.stderr_limit_bytes == 0 {
            return Err("output limits must be greater than zero".to_string());
        }
        if self.diagnostic_limit_bytes == 0 {
            return Err("diagnostic_limit_bytes must be greater than zero".to_string());
        }
        if self.memory_sample_interval_ms == 0 {
            return Err("memory_sample_interval_ms must be greater than zero".to_string());
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, String>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| format!("Invalid value for {}: {} ({})", key, raw, e)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = JudgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.failure_policy, FailurePolicy::ShortCircuit);
        assert_eq!(config.output_limit_bytes, 1024 * 1024);
    }

    #[test]
    fn test_overrides_from_lookup() {
        let config = JudgeConfig::from_lookup(lookup_from(&[
            ("JUDGE_POOL_SIZE", "4"),
            ("JUDGE_MAX_QUEUE", "8"),
            ("JUDGE_FAILURE_POLICY", "run_all"),
            ("JUDGE_WORKSPACE_ROOT", "/srv/judge"),
        ]))
        .unwrap();

        assert_eq!(config.pool_size, 4);
        assert_eq!(config.max_queue_depth, 8);
        assert_eq!(config.failure_policy, FailurePolicy::RunAll);
        assert_eq!(config.workspace_root, PathBuf::from("/srv/judge"));
        assert_eq!(config.kill_grace_ms, 100);
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let err = JudgeConfig::from_lookup(lookup_from(&[("JUDGE_POOL_SIZE", "many")]))
            .unwrap_err();
        assert!(err.contains("JUDGE_POOL_SIZE"));
    }

    #[test]
    fn test_zero_pool_rejected() {
        let err = JudgeConfig::from_lookup(lookup_from(&[("JUDGE_POOL_SIZE", "0")]))
            .unwrap_err();
        assert!(err.contains("pool_size"));
    }

    #[test]
    fn test_failure_policy_parsing() {
        assert_eq!("all".parse::<FailurePolicy>(), Ok(FailurePolicy::RunAll));
        assert_eq!(
            "Short-Circuit".parse::<FailurePolicy>(),
            Ok(FailurePolicy::ShortCircuit)
        );
        assert!("sometimes".parse::<FailurePolicy>().is_err());
    }
}
