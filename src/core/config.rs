use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::services::image::ImageConfig;
use crate::services::llm::LlmConfig;
use crate::services::safety::SafetyConfig;

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default)]
    pub unattended: bool,

    /// Shared key for the text and image endpoints. Falls back to `OPENAI_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Target script for generated Chinese text ("zh-TW", "zh-HK", "zh-CN"...). `None` keeps the model output as-is.
    #[serde(default = "default_chinese_variant")]
    pub chinese_variant: Option<String>,

    pub llm: LlmConfig,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(default)]
    pub defaults: RequestDefaults,
}

/// Values used when running unattended, and preselected in the interactive prompts.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RequestDefaults {
    #[serde(default = "default_character")]
    pub character: String,
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default = "default_page_count")]
    pub page_count: u32,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            character: default_character(),
            theme: default_theme(),
            page_count: default_page_count(),
        }
    }
}

fn default_output() -> String {
    "output".to_string()
}
fn default_chinese_variant() -> Option<String> {
    Some("zh-TW".to_string())
}
fn default_character() -> String {
    "貓咪".to_string()
}
fn default_theme() -> String {
    "友情".to_string()
}
fn default_page_count() -> u32 {
    8
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new("config.yml");
        if !path.exists() {
            anyhow::bail!("config.yml not found. Please create one.");
        }
        Self::load_from(path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder)?;
        Ok(())
    }

    /// Resolves the API key from the config file, then the environment.
    /// A missing key is fatal: nothing in the pipeline works without it.
    pub fn api_key(&self) -> Result<String> {
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            return Ok(key.trim().to_string());
        }
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            _ => anyhow::bail!(
                "No API key configured. Set `api_key` in config.yml or the {} environment variable.",
                API_KEY_ENV
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
llm:
  provider: openai
  openai:
    model: gpt-4o-mini
"#;

    #[test]
    fn test_minimal_config_fills_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");
        fs::write(&path, MINIMAL)?;

        let config = Config::load_from(&path)?;
        assert_eq!(config.output_folder, "output");
        assert!(!config.unattended);
        assert_eq!(config.chinese_variant.as_deref(), Some("zh-TW"));
        assert_eq!(config.defaults.page_count, 8);
        assert_eq!(config.image.max_retries, 3);
        assert_eq!(config.image.model, "dall-e-3");
        assert!(!config.safety.enabled);
        Ok(())
    }

    #[test]
    fn test_configured_api_key_wins() -> Result<()> {
        let mut config: Config = serde_yaml_ng::from_str(MINIMAL)?;
        config.api_key = Some("  sk-test  ".to_string());
        assert_eq!(config.api_key()?, "sk-test");
        Ok(())
    }

    #[test]
    fn test_blank_api_key_is_not_accepted() -> Result<()> {
        let mut config: Config = serde_yaml_ng::from_str(MINIMAL)?;
        config.api_key = Some("   ".to_string());
        // Only meaningful when the environment does not provide one.
        if std::env::var(API_KEY_ENV).is_err() {
            assert!(config.api_key().is_err());
        }
        Ok(())
    }
}
