// Language registry for the judge
// A capability table keyed by language id; nothing else in the engine branches on language identity.

use crate::error::JudgeError;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const BUILTIN_LANGUAGES: &str = include_str!("../../../config/languages.json");

/// Default location of the languages file, relative to the working directory
pub const DEFAULT_LANGUAGES_PATH: &str = "config/languages.json";

/// How to build and run one language. Pure configuration, no behavior.
///
/// Command templates are argv vectors; `{source}`, `{artifact}` and
/// `{workdir}` are substituted with absolute workspace paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub version: String,
    /// Source file name; `{ext}` expands to `file_extension`
    pub source_file: String,
    pub file_extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
    pub compile_timeout_ms: u64,
    pub run_timeout_ms: u64,
    pub memory_limit_mb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time_limit_ms: Option<u64>,
    /// Apply an RLIMIT_AS backstop; unsuitable for runtimes that reserve large virtual ranges
    #[serde(default)]
    pub limit_address_space: bool,
}

impl LanguageProfile {
    pub fn source_file_name(&self) -> String {
        self.source_file.replace("{ext}", &self.file_extension)
    }

    pub fn has_compile_step(&self) -> bool {
        self.compile.as_ref().is_some_and(|argv| !argv.is_empty())
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("Language name cannot be empty");
        }
        if self.run.is_empty() {
            bail!("Language '{}' has an empty run command", self.name);
        }
        let file_name = self.source_file_name();
        if file_name.is_empty() || file_name.contains('/') || file_name.contains("..") {
            bail!("Language '{}' has an invalid source file name: {}", self.name, file_name);
        }
        if self.run_timeout_ms == 0 || self.memory_limit_mb == 0 {
            bail!("Language '{}' must have non-zero run timeout and memory limit", self.name);
        }
        Ok(())
    }
}

/// Absolute paths substituted into command templates
#[derive(Debug, Clone)]
pub struct TemplatePaths {
    pub source: PathBuf,
    pub artifact: PathBuf,
    pub workdir: PathBuf,
}

/// Expand `{source}`, `{artifact}` and `{workdir}` in every argv element
pub fn expand_template(template: &[String], paths: &TemplatePaths) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{source}", &paths.source.to_string_lossy())
                .replace("{artifact}", &paths.artifact.to_string_lossy())
                .replace("{workdir}", &paths.workdir.to_string_lossy())
        })
        .collect()
}

/// On-disk shape of languages.json
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LanguagesFile {
    pub languages: Vec<LanguageProfile>,
}

impl LanguagesFile {
    /// The table shipped with the judge (config/languages.json at build time)
    pub fn builtin() -> Result<Self> {
        serde_json::from_str(BUILTIN_LANGUAGES).context("Failed to parse built-in language table")
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize languages")?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }
}

/// Process-wide, read-only table of language profiles
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<String, Arc<LanguageProfile>>,
    names: Vec<String>,
}

impl LanguageRegistry {
    /// Build a registry, rejecting invalid profiles and clashing names or aliases
    pub fn from_profiles(profiles: Vec<LanguageProfile>) -> Result<Self> {
        if profiles.is_empty() {
            bail!("No languages configured");
        }

        let mut table = HashMap::new();
        let mut names = Vec::new();

        for profile in profiles {
            profile.validate()?;
            let profile = Arc::new(profile);

            let keys = std::iter::once(&profile.name).chain(profile.aliases.iter());
            for key in keys {
                let key = key.trim().to_lowercase();
                if table.insert(key.clone(), Arc::clone(&profile)).is_some() {
                    bail!("Language id '{}' is defined more than once", key);
                }
            }
            names.push(profile.name.clone());
        }

        names.sort();
        Ok(Self {
            profiles: table,
            names,
        })
    }

    pub fn builtin() -> Result<Self> {
        Self::from_profiles(LanguagesFile::builtin()?.languages)
    }

    /// Load language profiles from a languages.json file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Language config file not found: {}", path.display());
        }
        let file = LanguagesFile::read(path)?;
        Self::from_profiles(file.languages)
            .with_context(|| format!("Invalid language config {}", path.display()))
    }

    /// Load from `path` when given, otherwise fall back to the built-in table
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Self::builtin(),
        }
    }

    /// Case-insensitive lookup by name or alias
    pub fn resolve(&self, language: &str) -> Result<Arc<LanguageProfile>, JudgeError> {
        self.profiles
            .get(&language.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| JudgeError::UnsupportedLanguage(language.to_string()))
    }

    /// Canonical language names, sorted
    pub fn list_languages(&self) -> Vec<String> {
        self.names.clone()
    }

    /// One entry per language (aliases collapsed), sorted by name
    pub fn profiles(&self) -> Vec<Arc<LanguageProfile>> {
        self.names
            .iter()
            .filter_map(|name| self.profiles.get(&name.to_lowercase()).cloned())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Interpreted profile backed by /bin/sh, available on every test host
    pub(crate) fn sh_profile() -> LanguageProfile {
        LanguageProfile {
            name: "sh".to_string(),
            aliases: vec!["shell".to_string()],
            version: String::new(),
            source_file: "main.{ext}".to_string(),
            file_extension: "sh".to_string(),
            compile: None,
            run: vec!["sh".to_string(), "{source}".to_string()],
            compile_timeout_ms: 5000,
            run_timeout_ms: 2000,
            memory_limit_mb: 256,
            cpu_time_limit_ms: None,
            limit_address_space: false,
        }
    }

    /// "Compiled" shell profile: `sh -n` is the syntax-checking build step
    pub(crate) fn checked_sh_profile() -> LanguageProfile {
        LanguageProfile {
            name: "checked-sh".to_string(),
            aliases: vec![],
            compile: Some(vec![
                "sh".to_string(),
                "-n".to_string(),
                "{source}".to_string(),
            ]),
            ..sh_profile()
        }
    }

    #[test]
    fn test_builtin_table_loads() {
        let registry = LanguageRegistry::builtin().unwrap();
        let languages = registry.list_languages();

        for expected in ["c", "c++", "java", "javascript", "python", "rust"] {
            assert!(languages.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let registry = LanguageRegistry::builtin().unwrap();

        assert_eq!(registry.resolve("Python").unwrap().name, "python");
        assert_eq!(registry.resolve("  JAVA ").unwrap().name, "java");
        assert_eq!(registry.resolve("CPP").unwrap().name, "c++");
        assert_eq!(registry.resolve("c++").unwrap().name, "c++");
    }

    #[test]
    fn test_unsupported_language() {
        let registry = LanguageRegistry::builtin().unwrap();
        match registry.resolve("cobol") {
            Err(JudgeError::UnsupportedLanguage(lang)) => assert_eq!(lang, "cobol"),
            other => panic!("expected UnsupportedLanguage, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let mut clash = checked_sh_profile();
        clash.aliases = vec!["SHELL".to_string()];

        let err = LanguageRegistry::from_profiles(vec![sh_profile(), clash]).unwrap_err();
        assert!(err.to_string().contains("shell"));
    }

    #[test]
    fn test_empty_run_command_rejected() {
        let mut broken = sh_profile();
        broken.run.clear();
        assert!(LanguageRegistry::from_profiles(vec![broken]).is_err());
    }

    #[test]
    fn test_source_file_name_cannot_escape() {
        let mut broken = sh_profile();
        broken.source_file = "../main.{ext}".to_string();
        assert!(LanguageRegistry::from_profiles(vec![broken]).is_err());
    }

    #[test]
    fn test_java_profile_uses_solution_class() {
        let registry = LanguageRegistry::builtin().unwrap();
        let java = registry.resolve("java").unwrap();

        assert_eq!(java.source_file_name(), "Solution.java");
        assert!(java.has_compile_step());
        assert_eq!(java.run.last().map(String::as_str), Some("Solution"));
    }

    #[test]
    fn test_expand_template() {
        let paths = TemplatePaths {
            source: PathBuf::from("/ws/main.cpp"),
            artifact: PathBuf::from("/ws/main"),
            workdir: PathBuf::from("/ws"),
        };
        let template = vec![
            "g++".to_string(),
            "-o".to_string(),
            "{artifact}".to_string(),
            "{source}".to_string(),
            "-I{workdir}".to_string(),
        ];

        assert_eq!(
            expand_template(&template, &paths),
            vec!["g++", "-o", "/ws/main", "/ws/main.cpp", "-I/ws"]
        );
    }

    #[test]
    fn test_languages_file_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("languages.json");

        let file = LanguagesFile {
            languages: vec![sh_profile()],
        };
        file.write(&path).unwrap();

        let registry = LanguageRegistry::load(&path).unwrap();
        assert_eq!(registry.list_languages(), vec!["sh".to_string()]);
        assert_eq!(registry.resolve("shell").unwrap().run[0], "sh");
    }

    #[test]
    fn test_load_missing_file() {
        let err = LanguageRegistry::load(Path::new("/nonexistent/languages.json")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
