use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use speech_gen::{GeminiClient, GeminiConfig, DEFAULT_ENDPOINT, DEFAULT_MODEL};
use speech_tasks::PromptLibrary;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "speeches.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    pub data_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub generation: GenerationSettings,
    pub export: ExportSettings,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            prompts_dir: PathBuf::from("prompts"),
            generation: GenerationSettings::default(),
            export: ExportSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub request_delay_ms: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            timeout_seconds: 60,
            request_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportSettings {
    pub min_snippet_grade: i64,
    pub output: PathBuf,
    pub decoy_year_range: i32,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            min_snippet_grade: 3,
            output: PathBuf::from("game/data.json"),
            decoy_year_range: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    Production,
    /// The small hand-picked subset used while iterating on prompts.
    Test,
}

impl Dataset {
    pub fn from_test_flag(test: bool) -> Self {
        if test {
            Dataset::Test
        } else {
            Dataset::Production
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Dataset::Production => "production",
            Dataset::Test => "test",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetPaths {
    pub speeches: PathBuf,
    pub labels: PathBuf,
    pub merged: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub config: ProjectConfig,
}

/// Walks up from `start` to the first directory holding a project config;
/// falls back to `start` itself.
pub fn find_project_root(start: &Path) -> PathBuf {
    let mut cur = Some(start);
    while let Some(p) = cur {
        if p.join(CONFIG_FILE).is_file() {
            return p.to_path_buf();
        }
        cur = p.parent();
    }
    start.to_path_buf()
}

impl Project {
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        let config = if config_path.is_file() {
            let raw = fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            parse_config(&raw)
                .with_context(|| format!("invalid project config {}", config_path.display()))?
        } else {
            ProjectConfig::default()
        };
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve(&self.config.data_dir)
    }

    pub fn dataset_paths(&self, dataset: Dataset) -> DatasetPaths {
        let data = self.data_dir();
        match dataset {
            Dataset::Production => DatasetPaths {
                speeches: data.join("cleaned_speeches.csv"),
                labels: data.join("labels.csv"),
                merged: data.join("speeches_with_labels.csv"),
            },
            Dataset::Test => DatasetPaths {
                speeches: data.join("test_speeches.csv"),
                labels: data.join("test_labels.csv"),
                merged: data.join("test_speeches_with_labels.csv"),
            },
        }
    }

    pub fn prompts(&self) -> PromptLibrary {
        PromptLibrary::new(self.resolve(&self.config.prompts_dir))
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.config.generation.request_delay_ms)
    }

    pub fn export_output(&self) -> PathBuf {
        self.resolve(&self.config.export.output)
    }

    pub fn gemini_config(&self) -> GeminiConfig {
        let g = &self.config.generation;
        GeminiConfig {
            endpoint: g.endpoint.clone(),
            model: g.model.clone(),
            timeout: Duration::from_secs(g.timeout_seconds),
        }
    }

    /// Loads `<root>/.env` (if present) and reads the API key from the
    /// configured variable.
    pub fn api_key(&self) -> Result<String> {
        let env_path = self.root.join(".env");
        if env_path.is_file() {
            dotenvy::from_path(&env_path)
                .with_context(|| format!("failed to load dotenv file at {}", env_path.display()))?;
        }
        let var = &self.config.generation.api_key_env;
        match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(anyhow!(
                "{} not set. Add it to {}",
                var,
                env_path.display()
            )),
        }
    }

    /// One client per invocation.
    pub fn generator(&self) -> Result<GeminiClient> {
        let key = self.api_key()?;
        let client = GeminiClient::new(&self.gemini_config(), key)
            .context("failed to build generation client")?;
        tracing::info!(model = %client.model(), "generation client ready");
        Ok(client)
    }
}

fn parse_config(raw: &str) -> Result<ProjectConfig> {
    if raw.trim().is_empty() {
        return Ok(ProjectConfig::default());
    }
    let config: ProjectConfig = serde_yaml::from_str(raw)?;
    if config.export.min_snippet_grade < 1 || config.export.min_snippet_grade > 5 {
        return Err(anyhow!(
            "export.min_snippet_grade must be within 1..=5 (got {})",
            config.export.min_snippet_grade
        ));
    }
    Ok(config)
}
