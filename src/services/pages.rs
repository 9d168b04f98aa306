//! Splits the page planner's free-text answer into page records.
//!
//! The planner is asked to answer with blocks shaped like
//!
//! ```text
//! Page 1:
//! text: 小貓在森林裡醒來……
//! image_prompt: A small cat waking up in a sunlit forest
//! ```
//!
//! Parsing is marker based: the answer is cut on `"Page "`, anything before
//! the first marker is dropped, and each block must carry both field markers.
//! A broken block is reported on its own and does not affect its neighbours.

use crate::core::book::PageRecord;
use crate::core::state::PageOutcome;
use thiserror::Error;

pub const PAGE_MARKER: &str = "Page ";
pub const TEXT_MARKER: &str = "text: ";
pub const IMAGE_PROMPT_MARKER: &str = "image_prompt: ";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageParseError {
    #[error("第 {page} 頁缺少 `{marker}` 標記")]
    MissingMarker { page: usize, marker: &'static str },
    #[error("第 {page} 頁的 `{field}` 內容為空")]
    EmptyField { page: usize, field: &'static str },
}

impl PageParseError {
    pub fn page(&self) -> usize {
        match self {
            PageParseError::MissingMarker { page, .. } | PageParseError::EmptyField { page, .. } => {
                *page
            }
        }
    }
}

pub fn parse_pages(plan: &str) -> Vec<PageOutcome> {
    plan.split(PAGE_MARKER)
        .skip(1)
        .enumerate()
        .map(|(i, block)| parse_block(i + 1, block))
        .collect()
}

fn parse_block(page: usize, block: &str) -> Result<PageRecord, PageParseError> {
    let text_at = block.find(TEXT_MARKER).ok_or(PageParseError::MissingMarker {
        page,
        marker: TEXT_MARKER.trim_end(),
    })?;
    let prompt_at = block
        .find(IMAGE_PROMPT_MARKER)
        .ok_or(PageParseError::MissingMarker {
            page,
            marker: IMAGE_PROMPT_MARKER.trim_end(),
        })?;

    let text_start = text_at + TEXT_MARKER.len();
    let prompt_start = prompt_at + IMAGE_PROMPT_MARKER.len();

    // Each field runs until the other field's marker, or the end of the block.
    let text_end = if prompt_at > text_at { prompt_at } else { block.len() };
    let prompt_end = if text_at > prompt_at { text_at } else { block.len() };

    let text = block[text_start..text_end].trim();
    let image_prompt = block[prompt_start..prompt_end].trim();

    if text.is_empty() {
        return Err(PageParseError::EmptyField { page, field: "text" });
    }
    if image_prompt.is_empty() {
        return Err(PageParseError::EmptyField {
            page,
            field: "image_prompt",
        });
    }

    Ok(PageRecord {
        index: page,
        text: text.to_string(),
        image_prompt: image_prompt.to_string(),
    })
}
