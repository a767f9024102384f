// Language registry for the code sandbox
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LanguageConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("language {0} is declared twice")]
    Duplicate(String),
}

/// How a source file is built and run inside the image. `{file}` in either
/// command is replaced by the path of the written source file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguageExecution {
    #[serde(default)]
    pub compile: Option<String>,
    pub run: String,
    #[serde(default = "default_file_name")]
    pub file_name: String,
    pub file_extension: String,
}

fn default_file_name() -> String {
    "main".to_string()
}

impl LanguageExecution {
    pub fn source_path(&self) -> String {
        format!("/tmp/{}.{}", self.file_name, self.file_extension)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguageConfig {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub version: String,
    pub image: String,
    pub execution: LanguageExecution,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Registered languages, resolvable by name or alias (case-insensitive).
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    configs: HashMap<String, LanguageConfig>,
    aliases: HashMap<String, String>,
}

impl LanguageRegistry {
    pub fn from_configs(languages: Vec<LanguageConfig>) -> Result<Self, LanguageConfigError> {
        let mut registry = Self::empty();
        for lang in languages {
            let name = lang.name.to_ascii_lowercase();
            if !registry.insert(lang) {
                return Err(LanguageConfigError::Duplicate(name));
            }
        }
        Ok(registry)
    }

    fn empty() -> Self {
        Self {
            configs: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Returns false when the name was already registered.
    fn insert(&mut self, lang: LanguageConfig) -> bool {
        let key = lang.name.to_ascii_lowercase();
        for alias in &lang.aliases {
            self.aliases.insert(alias.to_ascii_lowercase(), key.clone());
        }
        self.configs.insert(key, lang).is_none()
    }

    pub fn load(config_path: &Path) -> Result<Self, LanguageConfigError> {
        let path = config_path.display().to_string();
        let content = fs::read_to_string(config_path).map_err(|source| LanguageConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let parsed: LanguagesJson = serde_json::from_str(&content)
            .map_err(|source| LanguageConfigError::Parse { path, source })?;
        Self::from_configs(parsed.languages)
    }

    /// Load the file if present, otherwise fall back to the built-in set.
    /// A file that exists but does not parse is still an error.
    pub fn load_or_builtin(config_path: &Path) -> Result<Self, LanguageConfigError> {
        if config_path.exists() {
            let registry = Self::load(config_path)?;
            info!(path = %config_path.display(), languages = ?registry.list_languages(), "Loaded language registry");
            Ok(registry)
        } else {
            warn!(path = %config_path.display(), "Language config not found, using built-in languages");
            Ok(Self::builtin())
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for lang in builtin_languages() {
            registry.insert(lang);
        }
        registry
    }

    pub fn resolve(&self, language: &str) -> Option<&LanguageConfig> {
        let key = language.trim().to_ascii_lowercase();
        self.configs.get(&key).or_else(|| {
            self.aliases
                .get(&key)
                .and_then(|canonical| self.configs.get(canonical))
        })
    }

    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Pretty JSON in the `languages.json` layout, used by `assessor-cli init`.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let mut languages: Vec<LanguageConfig> = self.configs.values().cloned().collect();
        languages.sort_by(|a, b| a.name.cmp(&b.name));
        serde_json::to_string_pretty(&LanguagesJson { languages })
    }
}

fn builtin_languages() -> Vec<LanguageConfig> {
    vec![
        LanguageConfig {
            name: "python".into(),
            aliases: vec!["py".into(), "python3".into()],
            version: "3.12".into(),
            image: "python:3.12-slim".into(),
            execution: LanguageExecution {
                compile: None,
                run: "python3 -u {file}".into(),
                file_name: "main".into(),
                file_extension: "py".into(),
            },
            memory_limit_mb: 256,
            cpu_limit: 0.5,
        },
        LanguageConfig {
            name: "javascript".into(),
            aliases: vec!["js".into(), "node".into()],
            version: "20".into(),
            image: "node:20-slim".into(),
            execution: LanguageExecution {
                compile: None,
                run: "node {file}".into(),
                file_name: "main".into(),
                file_extension: "js".into(),
            },
            memory_limit_mb: 256,
            cpu_limit: 0.5,
        },
        LanguageConfig {
            name: "java".into(),
            aliases: vec![],
            version: "21".into(),
            image: "eclipse-temurin:21-jdk".into(),
            execution: LanguageExecution {
                compile: Some("javac -d /tmp {file}".into()),
                run: "java -cp /tmp Main".into(),
                file_name: "Main".into(),
                file_extension: "java".into(),
            },
            memory_limit_mb: 512,
            cpu_limit: 1.0,
        },
        LanguageConfig {
            name: "rust".into(),
            aliases: vec!["rs".into()],
            version: "1".into(),
            image: "rust:1-slim".into(),
            execution: LanguageExecution {
                compile: Some("rustc -O -o /tmp/main {file}".into()),
                run: "/tmp/main".into(),
                file_name: "main".into(),
                file_extension: "rs".into(),
            },
            memory_limit_mb: 512,
            cpu_limit: 1.0,
        },
    ]
}
