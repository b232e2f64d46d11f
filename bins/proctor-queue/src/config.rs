// Language configuration management for the queue service
use anyhow::{bail, Context, Result};
use proctor_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config/languages.json";
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageExecution {
    /// File the source is written to inside the container, relative to /code.
    pub file_name: String,
    /// Shell command compiling the source; absent for interpreted languages.
    #[serde(default)]
    pub compile: Option<String>,
    /// Shell command running the program, reading the test input on stdin.
    pub run: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    pub name: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,
    #[serde(default)]
    pub deny: Vec<SecurityRule>,
}

fn default_max_source_bytes() -> usize {
    DEFAULT_MAX_SOURCE_BYTES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: Language,
    pub version: String,
    pub image: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    /// Limit for a single test case.
    pub test_timeout_ms: u64,
    /// Hard wall-clock limit for the whole job, compilation included.
    pub job_timeout_ms: u64,
    pub execution: LanguageExecution,
    /// When absent the built-in rule set for the language applies.
    #[serde(default)]
    pub security: Option<SecurityPolicy>,
}

impl LanguageConfig {
    /// Reasonable defaults for a language, used by tests and as a template
    /// for new entries.
    pub fn builtin(language: Language) -> Self {
        let (version, file_name, compile, run) = match language {
            Language::Python => ("3.11", "main.py", None, "python3 -u /code/main.py"),
            Language::Java => (
                "17",
                "Main.java",
                Some("javac /code/Main.java"),
                "java -cp /code Main",
            ),
            Language::Cpp => (
                "13",
                "main.cpp",
                Some("g++ -O2 -std=c++17 /code/main.cpp -o /code/main"),
                "/code/main",
            ),
            Language::Javascript => ("20", "main.js", None, "node /code/main.js"),
            Language::Rust => (
                "1.75",
                "main.rs",
                Some("rustc -O /code/main.rs -o /code/main"),
                "/code/main",
            ),
        };

        Self {
            name: language,
            version: version.to_string(),
            image: format!("proctor-{}:{}-v1", language, version),
            memory_limit_mb: 256,
            cpu_limit: 0.5,
            test_timeout_ms: 5_000,
            job_timeout_ms: 60_000,
            execution: LanguageExecution {
                file_name: file_name.to_string(),
                compile: compile.map(str::to_string),
                run: run.to_string(),
            },
            security: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path).context("Failed to read languages.json")?;
        Self::parse(&content)
    }

    /// Load from `LANGUAGES_CONFIG`, or config/languages.json when unset
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("LANGUAGES_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(Path::new(&path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse languages.json")?;
        Self::from_configs(languages_json.languages)
    }

    pub fn from_configs(languages: Vec<LanguageConfig>) -> Result<Self> {
        if languages.is_empty() {
            bail!("No languages configured");
        }

        let mut configs = HashMap::new();
        for lang in languages {
            if lang.test_timeout_ms == 0 || lang.job_timeout_ms == 0 {
                bail!("Language '{}' must have non-zero timeouts", lang.name);
            }
            if lang.job_timeout_ms < lang.test_timeout_ms {
                bail!(
                    "Language '{}': job_timeout_ms ({}) is shorter than test_timeout_ms ({})",
                    lang.name,
                    lang.job_timeout_ms,
                    lang.test_timeout_ms
                );
            }
            let name = lang.name;
            if configs.insert(name, lang).is_some() {
                bail!("Language '{}' is configured more than once", name);
            }
        }

        Ok(Self { configs })
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &Language) -> Result<&LanguageConfig> {
        self.configs
            .get(language)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", language))
    }

    pub fn is_enabled(&self, language: &Language) -> bool {
        self.configs.contains_key(language)
    }

    /// List all configured languages, sorted
    pub fn list_languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.configs.keys().copied().collect();
        languages.sort();
        languages
    }

    pub fn iter(&self) -> impl Iterator<Item = &LanguageConfig> {
        self.configs.values()
    }
}
