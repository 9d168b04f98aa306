use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub const MIN_PAGES: u32 = 6;
pub const MAX_PAGES: u32 = 12;

pub const CHARACTER_OPTIONS: &[&str] = &["貓咪", "狗狗", "花花", "小鳥", "小石頭"];
pub const THEME_OPTIONS: &[&str] = &["親情", "友情", "冒險", "度假", "運動比賽"];

/// What the user asked for. Fixed for the rest of the cycle once built.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(try_from = "RequestFields")]
pub struct GenerationRequest {
    character: String,
    theme: String,
    page_count: u32,
}

/// Unchecked shape of a serialized request; goes through [`GenerationRequest::new`].
#[derive(Deserialize)]
struct RequestFields {
    character: String,
    theme: String,
    page_count: u32,
}

impl TryFrom<RequestFields> for GenerationRequest {
    type Error = anyhow::Error;

    fn try_from(fields: RequestFields) -> Result<Self> {
        Self::new(&fields.character, &fields.theme, fields.page_count)
    }
}

impl GenerationRequest {
    pub fn new(character: &str, theme: &str, page_count: u32) -> Result<Self> {
        let character = character.trim();
        let theme = theme.trim();
        if character.is_empty() {
            bail!("Character must not be empty");
        }
        if theme.is_empty() {
            bail!("Theme must not be empty");
        }
        if !(MIN_PAGES..=MAX_PAGES).contains(&page_count) {
            bail!(
                "Page count must be between {} and {}, got {}",
                MIN_PAGES,
                MAX_PAGES,
                page_count
            );
        }
        Ok(Self {
            character: character.to_string(),
            theme: theme.to_string(),
            page_count,
        })
    }

    pub fn character(&self) -> &str {
        &self.character
    }

    pub fn theme(&self) -> &str {
        &self.theme
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Page on which the prompts ask the chosen plot point to appear (third from last).
    pub fn plot_point_page(&self) -> u32 {
        self.page_count - 3
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PageRecord {
    pub index: usize,
    pub text: String,
    pub image_prompt: String,
}

/// Result of rendering one page block of the plan.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct RenderedPage {
    pub index: usize,
    pub record: Option<PageRecord>,
    pub image_url: Option<String>,
    pub failure: Option<String>,
}

impl RenderedPage {
    pub fn is_complete(&self) -> bool {
        self.record.is_some() && self.image_url.is_some()
    }
}
