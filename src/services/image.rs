use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;
use url::Url;

use crate::core::config::Config;
use crate::services::safety::SafetyFilter;
use crate::utils::retry::{retry_fixed, RetryError};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default = "default_quality")]
    pub quality: String,
    pub base_url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    /// Pause between consecutive page renders to stay under the API rate limit.
    #[serde(default = "default_pacing_delay")]
    pub pacing_delay_seconds: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            size: default_size(),
            quality: default_quality(),
            base_url: None,
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay(),
            pacing_delay_seconds: default_pacing_delay(),
        }
    }
}

fn default_model() -> String {
    "dall-e-3".to_string()
}
fn default_size() -> String {
    "1792x1024".to_string()
}
fn default_quality() -> String {
    "standard".to_string()
}
fn default_max_retries() -> usize {
    3
}
fn default_retry_delay() -> u64 {
    2
}
fn default_pacing_delay() -> u64 {
    5
}

#[async_trait]
pub trait ImageClient: Send + Sync + Debug {
    /// Generates one image and returns where it can be fetched from.
    async fn generate(&self, prompt: &str) -> Result<String>;

    async fn download(&self, url: &str) -> Result<Vec<u8>>;
}

pub fn create_image_client(config: &Config) -> Result<Box<dyn ImageClient>> {
    Ok(Box::new(OpenAIImageClient::new(
        &config.api_key()?,
        &config.image,
    )))
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIImageClient {
    api_key: String,
    model: String,
    size: String,
    quality: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIImageClient {
    fn new(api_key: &str, config: &ImageConfig) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: config.model.clone(),
            size: config.size.clone(),
            quality: config.quality.clone(),
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
    quality: &'a str,
    response_format: &'a str,
}

#[derive(Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    url: Option<String>,
    revised_prompt: Option<String>,
}

#[async_trait]
impl ImageClient for OpenAIImageClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/images/generations", self.base_url);

        let request_body = ImageRequest {
            model: &self.model,
            prompt,
            n: 1,
            size: &self.size,
            quality: &self.quality,
            response_format: "url",
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Image API error: {}", error_text));
        }

        let result: ImageResponse = resp.json().await?;
        let first = result
            .data
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Image API returned no images"))?;
        if let Some(revised) = &first.revised_prompt {
            debug!("Image model revised prompt: {}", revised);
        }
        first
            .url
            .ok_or_else(|| anyhow!("Image API response missing url"))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let parsed = Url::parse(url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("Refusing to download image from non-http url: {}", url);
        }
        let resp = self.client.get(parsed).send().await?;
        if !resp.status().is_success() {
            bail!("Image download failed with status {}", resp.status());
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Builds the instruction sent to the image model for one page.
pub fn compose_prompt(image_prompt: &str, style_base: &str, safety: Option<&SafetyFilter>) -> String {
    let (image_prompt, style_base) = match safety {
        Some(filter) => (filter.scrub(image_prompt), filter.scrub(style_base)),
        None => (image_prompt.trim().to_string(), style_base.trim().to_string()),
    };

    let mut prompt = format!(
        "Based on the image prompt: \"{}\" and the style base: \"{}\",\n\
         please create an image with the following characteristics:\n\
         - Color scheme and background details that match the story's atmosphere\n\
         - Specific style and scene details as described\n\
         - The main character should be prominently featured with the current color, shape, and features\n\
         - Apply at least 3 effect words (lighting effects, color tones, rendering effects, visual style)\n\
         - Use 1 or more composition techniques for visual interest\n\
         - Do not include any text in the image",
        image_prompt, style_base
    );

    if let Some(filter) = safety {
        if !filter.qualifier().is_empty() {
            prompt.push_str(&format!("\n- Keep the image {}", filter.qualifier()));
        }
    }
    prompt
}

/// Image client plus the per-page policy: prompt composition, safety scrub and retries.
#[derive(Debug)]
pub struct ImageRenderer {
    client: Box<dyn ImageClient>,
    safety: Option<SafetyFilter>,
    max_retries: usize,
    retry_delay: Duration,
}

impl ImageRenderer {
    pub fn new(
        client: Box<dyn ImageClient>,
        safety: Option<SafetyFilter>,
        max_retries: usize,
        retry_delay: Duration,
    ) -> Self {
        Self {
            client,
            safety,
            max_retries,
            retry_delay,
        }
    }

    pub fn from_config(client: Box<dyn ImageClient>, config: &Config) -> Result<Self> {
        let safety = if config.safety.enabled {
            Some(SafetyFilter::new(&config.safety)?)
        } else {
            None
        };
        Ok(Self::new(
            client,
            safety,
            config.image.max_retries,
            Duration::from_secs(config.image.retry_delay_seconds),
        ))
    }

    pub async fn render(&self, image_prompt: &str, style_base: &str) -> Result<String, RetryError> {
        let prompt = compose_prompt(image_prompt, style_base, self.safety.as_ref());
        let client = self.client.as_ref();
        let prompt = prompt.as_str();
        let url = retry_fixed(self.max_retries, self.retry_delay, move |attempt| {
            debug!("Image generation attempt {}", attempt);
            client.generate(prompt)
        })
        .await?;
        info!("Image generated: {}", url);
        Ok(url)
    }

    pub async fn download(&self, url: &str) -> Result<Vec<u8>> {
        self.client.download(url).await
    }
}
