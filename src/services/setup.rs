use crate::core::book::{GenerationRequest, CHARACTER_OPTIONS, MAX_PAGES, MIN_PAGES, THEME_OPTIONS};
use crate::core::config::RequestDefaults;
use anyhow::Result;
use inquire::validator::Validation;
use inquire::{Confirm, CustomUserError, Select, Text};
use std::fmt;

const CUSTOM_OPTION: &str = "自定義";

fn not_blank(input: &str) -> Result<Validation, CustomUserError> {
    if input.trim().is_empty() {
        Ok(Validation::Invalid("內容不可為空白".into()))
    } else {
        Ok(Validation::Valid)
    }
}

/// Preset list plus a free-text escape hatch.
fn select_or_custom(prompt: &str, custom_prompt: &str, presets: &[&str], default: &str) -> Result<String> {
    let mut options: Vec<String> = presets.iter().map(|s| s.to_string()).collect();
    if !options.iter().any(|o| o == default) && !default.trim().is_empty() {
        options.insert(0, default.to_string());
    }
    options.push(CUSTOM_OPTION.to_string());
    let cursor = options.iter().position(|o| o == default).unwrap_or(0);

    let selection = Select::new(prompt, options)
        .with_starting_cursor(cursor)
        .prompt()?;
    if selection == CUSTOM_OPTION {
        let custom = Text::new(custom_prompt).with_validator(not_blank).prompt()?;
        Ok(custom.trim().to_string())
    } else {
        Ok(selection)
    }
}

pub fn collect_request(defaults: &RequestDefaults) -> Result<GenerationRequest> {
    let character = select_or_custom("選擇繪本主角", "輸入自定義主角", CHARACTER_OPTIONS, &defaults.character)?;
    let theme = select_or_custom("選擇繪本主題", "輸入自定義主題", THEME_OPTIONS, &defaults.theme)?;

    let counts: Vec<u32> = (MIN_PAGES..=MAX_PAGES).collect();
    let cursor = counts
        .iter()
        .position(|&c| c == defaults.page_count)
        .unwrap_or(0);
    let page_count = Select::new("選擇繪本頁數", counts)
        .with_starting_cursor(cursor)
        .prompt()?;

    GenerationRequest::new(&character, &theme, page_count)
}

/// With no suggestions only the custom entry is offered.
pub fn choose_plot_point(points: &[String]) -> Result<String> {
    if points.is_empty() {
        println!("沒有可用的故事轉折點，請自行輸入。");
        let custom = Text::new("輸入自定義故事轉折點")
            .with_validator(not_blank)
            .prompt()?;
        return Ok(custom.trim().to_string());
    }
    let presets: Vec<&str> = points.iter().map(String::as_str).collect();
    select_or_custom("選擇故事轉折點", "輸入自定義故事轉折點", &presets, &points[0])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewAction {
    Confirm,
    Regenerate,
    Quit,
}

impl fmt::Display for PreviewAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PreviewAction::Confirm => "生成完整繪本",
            PreviewAction::Regenerate => "重新生成",
            PreviewAction::Quit => "離開",
        };
        f.write_str(label)
    }
}

pub fn preview_action() -> Result<PreviewAction> {
    let options = vec![
        PreviewAction::Confirm,
        PreviewAction::Regenerate,
        PreviewAction::Quit,
    ];
    Ok(Select::new("預覽完成，接下來要？", options).prompt()?)
}

pub fn ask_retry() -> Result<bool> {
    Ok(Confirm::new("要再試一次嗎？").with_default(true).prompt()?)
}

pub fn ask_start_over() -> Result<bool> {
    Ok(Confirm::new("重新開始製作另一本繪本？")
        .with_default(false)
        .prompt()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_blank_validator() {
        assert!(matches!(not_blank("小貓"), Ok(Validation::Valid)));
        assert!(matches!(not_blank("   "), Ok(Validation::Invalid(_))));
    }

    #[test]
    fn test_preview_action_labels() {
        assert_eq!(PreviewAction::Confirm.to_string(), "生成完整繪本");
        assert_eq!(PreviewAction::Regenerate.to_string(), "重新生成");
    }
}
