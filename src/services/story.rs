use anyhow::{bail, Result};
use log::{info, warn};
use regex::Regex;
use std::sync::LazyLock;

use crate::core::book::GenerationRequest;
use crate::core::config::Config;
use crate::services::llm::{ChatOptions, LlmClient};
use crate::utils::text::{strip_code_blocks, to_variant};

const PLOT_POINT_TOKENS: u32 = 150;
const STORY_TOKENS: u32 = 1000;
const PAGE_PLAN_TOKENS: u32 = 1000;
const STYLE_BASE_TOKENS: u32 = 100;

static ENUMERATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[-*•·+]\s*)?(?:\*\*)?[(（]?[0-9０-９一二三四五六七八九十]+[.．、)）:：]\s*(?:\*\*)?")
        .expect("enumeration pattern")
});

/// Turns a newline separated answer into plot-point candidates.
pub fn parse_plot_points(answer: &str) -> Vec<String> {
    answer
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(strip_enumeration)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn strip_enumeration(line: &str) -> &str {
    let line = line.trim_start_matches(['-', '*', '•', '·', '+']).trim_start();
    match ENUMERATION.find(line) {
        Some(m) => {
            let rest = line[m.end()..].trim();
            if m.as_str().contains("**") {
                rest.strip_suffix("**").map_or(rest, str::trim_end)
            } else {
                rest
            }
        }
        None => line.trim(),
    }
}

/// Prompts for the text side of the pipeline.
#[derive(Debug, Clone)]
pub struct StoryWriter {
    temperature: f32,
    chinese_variant: Option<String>,
}

impl StoryWriter {
    pub fn new(temperature: f32, chinese_variant: Option<String>) -> Self {
        Self {
            temperature,
            chinese_variant,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.llm.temperature, config.chinese_variant.clone())
    }

    fn options(&self, max_tokens: u32) -> ChatOptions {
        ChatOptions::new(max_tokens, self.temperature)
    }

    pub fn localize(&self, text: &str) -> String {
        to_variant(text, self.chinese_variant.as_deref())
    }

    pub async fn plot_points(
        &self,
        llm: &dyn LlmClient,
        request: &GenerationRequest,
    ) -> Result<Vec<String>> {
        let prompt = format!(
            "為一個關於{}的{}故事生成3-5個可能的轉折點，每行一個:",
            request.character(),
            request.theme()
        );
        let answer = llm
            .chat("你是一個創意的故事策劃者。", &prompt, self.options(PLOT_POINT_TOKENS))
            .await?;
        let points = parse_plot_points(&self.localize(&answer));
        if points.is_empty() {
            warn!("Plot point generator returned no usable lines");
        } else {
            info!("Received {} plot point candidates", points.len());
        }
        Ok(points)
    }

    pub async fn story(
        &self,
        llm: &dyn LlmClient,
        request: &GenerationRequest,
        plot_point: &str,
    ) -> Result<String> {
        let prompt = format!(
            "請你角色扮演成一個暢銷的童書繪本作家，你擅長以孩童的純真眼光看這世界，製作出許多溫暖人心的作品。\n\
             請以下列主題: {}發想故事，\n\
             在{}頁的篇幅內，\n\
             說明一個{}的故事，\n\
             並注意在倒數第三頁加入{}的元素，\n\
             最後的故事需要是溫馨、快樂的結局。",
            request.theme(),
            request.page_count(),
            request.character(),
            plot_point
        );
        let story = llm
            .chat("你是一個專業的兒童繪本作家。", &prompt, self.options(STORY_TOKENS))
            .await?;
        let story = self.localize(story.trim());
        if story.is_empty() {
            bail!("Story generator returned an empty outline");
        }
        Ok(story)
    }

    /// Asks for the per-page breakdown. The raw answer is returned; see `pages::parse_pages`.
    pub async fn page_plan(
        &self,
        llm: &dyn LlmClient,
        request: &GenerationRequest,
        story: &str,
        plot_point: &str,
    ) -> Result<String> {
        let prompt = format!(
            "將以下故事大綱細分至預計{pages}個跨頁的篇幅，每頁需要包括(text, image_prompt)，\n\
             第{twist}頁(倒數第三頁)才可以出現{plot_point}，\n\
             在這之前應該要讓{character}的{theme}世界發展故事更多元化。\n\
             請嚴格依照以下格式輸出每一頁，不要加入其他說明：\n\
             Page 1:\n\
             text: (該頁的故事文字，使用中文)\n\
             image_prompt: (該頁插圖的英文描述)\n\n\
             {story}",
            pages = request.page_count(),
            twist = request.plot_point_page(),
            plot_point = plot_point,
            character = request.character(),
            theme = request.theme(),
            story = story
        );
        let plan = llm
            .chat("你是一個專業的繪本編輯。", &prompt, self.options(PAGE_PLAN_TOKENS))
            .await?;
        Ok(strip_code_blocks(&plan))
    }

    pub async fn style_base(&self, llm: &dyn LlmClient, story: &str) -> Result<String> {
        let prompt = format!(
            "基於以下故事，請思考大方向上你想要呈現的視覺效果，這是你用來統一整體繪本風格的描述，請盡量精簡，使用英文撰寫:\n\n{}",
            story
        );
        let style = llm
            .chat("你是一個專業的視覺設計師。", &prompt, self.options(STYLE_BASE_TOKENS))
            .await?;
        Ok(style.trim().to_string())
    }
}
