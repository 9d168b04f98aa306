use crate::core::book::{GenerationRequest, PageRecord, RenderedPage};
use crate::core::config::Config;
use crate::core::io::Storage;
use crate::core::state::{PageOutcome, Session, Stage, StageEvent};
use crate::services::export::export_book;
use crate::services::image::ImageRenderer;
use crate::services::llm::LlmClient;
use crate::services::pages::parse_pages;
use crate::services::setup::{self, PreviewAction};
use crate::services::story::StoryWriter;
use anyhow::{anyhow, bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rand::seq::IndexedRandom;
use std::sync::Arc;
use std::time::Duration;

pub struct WorkflowManager {
    config: Config,
    llm: Box<dyn LlmClient>,
    renderer: ImageRenderer,
    writer: StoryWriter,
    storage: Arc<dyn Storage>,
    session: Session,
}

impl WorkflowManager {
    pub fn new(
        config: Config,
        llm: Box<dyn LlmClient>,
        renderer: ImageRenderer,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let writer = StoryWriter::from_config(&config);
        Self {
            config,
            llm,
            renderer,
            writer,
            storage,
            session: Session::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn stage(&self) -> Stage {
        self.session.stage()
    }

    fn expect_stage(&self, expected: Stage, action: &str) -> Result<()> {
        let current = self.session.stage();
        if current != expected {
            bail!(
                "{} is only available in the {} stage (current: {})",
                action,
                expected,
                current
            );
        }
        Ok(())
    }

    /// Asks the model for plot twists and stores the request they belong to.
    pub async fn suggest_plot_points(&mut self, request: GenerationRequest) -> Result<&[String]> {
        self.expect_stage(Stage::Input, "Plot point generation")?;
        let points = self.writer.plot_points(self.llm.as_ref(), &request).await?;
        self.session.request = Some(request);
        self.session.plot_points = points;
        Ok(&self.session.plot_points)
    }

    /// Story, page plan, style base and the artwork of the first page that parsed.
    /// Nothing is kept unless every step succeeds; only then does the session enter Preview.
    pub async fn build_preview(&mut self, plot_point: &str) -> Result<()> {
        self.expect_stage(Stage::Input, "Preview generation")?;
        let request = self
            .session
            .request
            .clone()
            .context("No generation request; collect the story settings first")?;
        let plot_point = plot_point.trim();
        if plot_point.is_empty() {
            bail!("Plot point must not be empty");
        }

        let llm = self.llm.as_ref();
        info!("Generating story for {:?} with plot point {}", request, plot_point);
        let story = self.writer.story(llm, &request, plot_point).await?;
        let page_plan = self
            .writer
            .page_plan(llm, &request, &story, plot_point)
            .await?;
        let pages: Vec<_> = parse_pages(&page_plan)
            .into_iter()
            .map(|outcome| {
                outcome.map(|record| PageRecord {
                    text: self.writer.localize(&record.text),
                    ..record
                })
            })
            .collect();
        for failure in pages.iter().filter_map(|p| p.as_ref().err()) {
            warn!("{}", failure);
        }
        if pages.len() != request.page_count() as usize {
            warn!(
                "Page planner produced {} pages, {} requested",
                pages.len(),
                request.page_count()
            );
        }

        let Some(first) = preview_record(&pages) else {
            bail!("Page planner returned no usable pages:\n{}", page_plan);
        };
        if first.index != 1 {
            info!("Page 1 is unusable, previewing page {} instead", first.index);
        }

        let style_base = self.writer.style_base(llm, &story).await?;
        let preview_image = self
            .renderer
            .render(&first.image_prompt, &style_base)
            .await
            .map_err(|e| anyhow!(e).context("Failed to generate the preview image"))?;

        self.session.plot_point = Some(plot_point.to_string());
        self.session.story = Some(story);
        self.session.page_plan = Some(page_plan);
        self.session.pages = pages;
        self.session.style_base = Some(style_base);
        self.session.preview_image = Some(preview_image);
        self.session.apply(StageEvent::PreviewReady)?;
        Ok(())
    }

    /// Renders the whole book. Broken pages and failed images are recorded and skipped.
    pub async fn confirm(&mut self) -> Result<()> {
        self.session.apply(StageEvent::Confirm)?;

        let style_base = self.session.style_base.clone().unwrap_or_default();
        let pacing = Duration::from_secs(self.config.image.pacing_delay_seconds);
        let pages = self.session.pages.clone();
        let preview_page = preview_record(&pages).map(|r| r.index);

        let pb = ProgressBar::new(pages.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
                .progress_chars("#>-"),
        );

        let mut rendered = Vec::with_capacity(pages.len());
        let mut called_api = false;
        for outcome in pages {
            let record = match outcome {
                Ok(record) => record,
                Err(e) => {
                    pb.println(format!("⚠ {}，略過插圖生成", e));
                    rendered.push(RenderedPage {
                        index: e.page(),
                        record: None,
                        image_url: None,
                        failure: Some(e.to_string()),
                    });
                    pb.inc(1);
                    continue;
                }
            };

            pb.println(format!("第 {} 頁\n{}", record.index, record.text));

            let reuse_preview =
                Some(record.index) == preview_page && self.session.preview_image.is_some();
            let mut page = RenderedPage {
                index: record.index,
                ..Default::default()
            };
            if reuse_preview {
                page.image_url = self.session.preview_image.clone();
            } else {
                if called_api && !pacing.is_zero() {
                    tokio::time::sleep(pacing).await;
                }
                called_api = true;
                match self.renderer.render(&record.image_prompt, &style_base).await {
                    Ok(url) => page.image_url = Some(url),
                    Err(e) => {
                        pb.println(format!("⚠ 生成第 {} 頁插圖時發生錯誤: {}", record.index, e));
                        page.failure = Some(e.to_string());
                    }
                }
            }
            page.record = Some(record);
            rendered.push(page);
            pb.inc(1);
        }
        pb.finish_with_message("Rendering complete");

        let complete = rendered.iter().filter(|p| p.is_complete()).count();
        info!("Rendered {}/{} pages", complete, rendered.len());
        self.session.rendered = rendered;
        Ok(())
    }

    pub fn regenerate(&mut self) -> Result<()> {
        self.session.apply(StageEvent::Regenerate)?;
        Ok(())
    }

    pub fn start_over(&mut self) -> Result<()> {
        self.session.apply(StageEvent::StartOver)?;
        Ok(())
    }

    pub async fn export(&self) -> Result<String> {
        self.expect_stage(Stage::Generate, "Export")?;
        export_book(
            &self.session,
            &self.renderer,
            self.storage.as_ref(),
            &self.config.output_folder,
        )
        .await
    }

    fn show_preview(&self) {
        if let Some(story) = &self.session.story {
            println!("故事大綱：\n{}\n", story);
        }
        println!("分頁內容：");
        for outcome in &self.session.pages {
            match outcome {
                Ok(record) => println!("第 {} 頁：{}", record.index, record.text),
                Err(e) => println!("⚠ {}", e),
            }
        }
        if let Some(style) = &self.session.style_base {
            println!("\n風格基礎：\n{}", style);
        }
        if let (Some(record), Some(url)) = (
            preview_record(&self.session.pages),
            &self.session.preview_image,
        ) {
            println!("\n第 {} 頁預覽：{}", record.index, url);
        }
    }

    /// Prints the failure and decides whether the cycle can continue.
    fn recover(&self, e: anyhow::Error) -> Result<bool> {
        println!("發生錯誤: {:#}", e);
        if self.config.unattended {
            return Err(e);
        }
        setup::ask_retry()
    }

    /// Input stage: settings, plot point and preview. Returns false when the user gives up.
    async fn run_input_stage(&mut self) -> Result<bool> {
        let unattended = self.config.unattended;

        if self.session.request.is_none() {
            let request = if unattended {
                let d = &self.config.defaults;
                GenerationRequest::new(&d.character, &d.theme, d.page_count)?
            } else {
                setup::collect_request(&self.config.defaults)?
            };
            println!("正在生成故事轉折點...");
            let suggested = self.suggest_plot_points(request).await.map(|_| ());
            if let Err(e) = suggested {
                return self.recover(e);
            }
        }

        let plot_point = if unattended {
            self.session
                .plot_points
                .choose(&mut rand::rng())
                .cloned()
                .context("The model suggested no plot points")?
        } else {
            setup::choose_plot_point(&self.session.plot_points)?
        };

        println!("正在生成故事與第一頁預覽圖...");
        if let Err(e) = self.build_preview(&plot_point).await {
            return self.recover(e);
        }
        Ok(true)
    }

    pub async fn run(&mut self) -> Result<()> {
        let unattended = self.config.unattended;
        loop {
            match self.session.stage() {
                Stage::Input => {
                    if !self.run_input_stage().await? {
                        println!("Stopping as requested.");
                        break;
                    }
                }
                Stage::Preview => {
                    self.show_preview();
                    let action = if unattended {
                        PreviewAction::Confirm
                    } else {
                        setup::preview_action()?
                    };
                    match action {
                        PreviewAction::Confirm => self.confirm().await?,
                        PreviewAction::Regenerate => self.regenerate()?,
                        PreviewAction::Quit => break,
                    }
                }
                Stage::Generate => {
                    let dir = self.export().await?;
                    println!("繪本已輸出至 {}", dir);
                    if unattended || !setup::ask_start_over()? {
                        break;
                    }
                    self.start_over()?;
                }
            }
        }
        Ok(())
    }
}

/// The page whose artwork doubles as the preview.
fn preview_record(pages: &[PageOutcome]) -> Option<&PageRecord> {
    pages.iter().find_map(|p| p.as_ref().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::services::image::ImageClient;
    use crate::services::llm::ChatOptions;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    // Mock LLM Client
    #[derive(Debug)]
    struct MockLlmClient {
        call_count: Arc<Mutex<usize>>,
        broken_pages: Vec<usize>,
    }

    impl MockLlmClient {
        fn new() -> Self {
            Self {
                call_count: Arc::new(Mutex::new(0)),
                broken_pages: Vec::new(),
            }
        }

        fn with_broken_pages(pages: &[usize]) -> Self {
            Self {
                broken_pages: pages.to_vec(),
                ..Self::new()
            }
        }

        fn page_plan(&self, pages: usize) -> String {
            let mut plan = String::from("好的，以下是分頁內容：\n");
            for i in 1..=pages {
                if self.broken_pages.contains(&i) {
                    plan.push_str(&format!("Page {}:\ntext: 這頁少了插圖描述。\n\n", i));
                } else {
                    plan.push_str(&format!(
                        "Page {}:\ntext: 小猫的第{}页。\nimage_prompt: kitten scene {}\n\n",
                        i, i, i
                    ));
                }
            }
            plan
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn chat(&self, _system: &str, user: &str, _options: ChatOptions) -> Result<String> {
            *self.call_count.lock().unwrap() += 1;

            if user.contains("細分至預計") {
                let pages = user
                    .split("細分至預計")
                    .nth(1)
                    .and_then(|rest| rest.split('個').next())
                    .and_then(|n| n.parse::<usize>().ok())
                    .unwrap_or(0);
                return Ok(self.page_plan(pages));
            } else if user.contains("視覺效果") {
                return Ok("Soft watercolor, warm pastel palette".to_string());
            } else if user.contains("暢銷的童書繪本作家") {
                return Ok("小貓和朋友們一起學會了友誼的可貴。".to_string());
            } else if user.contains("轉折點") {
                return Ok("1. 小貓迷路了\n2. 下起大雨\n3. 朋友出手相助".to_string());
            }

            Ok(String::new())
        }
    }

    #[derive(Debug)]
    struct MockImageClient {
        call_count: Arc<Mutex<usize>>,
        fail_when: Option<&'static str>,
    }

    impl MockImageClient {
        fn new(fail_when: Option<&'static str>) -> Self {
            Self {
                call_count: Arc::new(Mutex::new(0)),
                fail_when,
            }
        }
    }

    #[async_trait]
    impl ImageClient for MockImageClient {
        async fn generate(&self, prompt: &str) -> Result<String> {
            let mut count = self.call_count.lock().unwrap();
            *count += 1;
            if let Some(pattern) = self.fail_when {
                if prompt.contains(pattern) {
                    return Err(anyhow!("Mock image error"));
                }
            }
            Ok(format!("https://images.example.com/{}.png", *count))
        }

        async fn download(&self, _url: &str) -> Result<Vec<u8>> {
            Ok(vec![0u8; 10])
        }
    }

    fn test_config(output: &Path, unattended: bool) -> Config {
        let yaml = format!(
            r#"
output_folder: "{}"
unattended: {}
api_key: sk-test
llm:
  provider: mock
image:
  max_retries: 3
  retry_delay_seconds: 0
  pacing_delay_seconds: 0
defaults:
  character: 小貓
  theme: 友誼
  page_count: 8
"#,
            output.to_string_lossy(),
            unattended
        );
        serde_yaml_ng::from_str(&yaml).unwrap()
    }

    struct Harness {
        workflow: WorkflowManager,
        llm_calls: Arc<Mutex<usize>>,
        image_calls: Arc<Mutex<usize>>,
        _temp_dir: tempfile::TempDir,
    }

    fn harness(llm: MockLlmClient, image: MockImageClient, unattended: bool) -> Harness {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = test_config(temp_dir.path(), unattended);
        let llm_calls = llm.call_count.clone();
        let image_calls = image.call_count.clone();
        let renderer = ImageRenderer::from_config(Box::new(image), &config).unwrap();
        let storage = Arc::new(NativeStorage::new());
        Harness {
            workflow: WorkflowManager::new(config, Box::new(llm), renderer, storage),
            llm_calls,
            image_calls,
            _temp_dir: temp_dir,
        }
    }

    #[tokio::test]
    async fn test_end_to_end_eight_pages() -> Result<()> {
        let mut h = harness(MockLlmClient::new(), MockImageClient::new(None), false);
        let request = GenerationRequest::new("小貓", "友誼", 8)?;

        let points = h.workflow.suggest_plot_points(request).await?.to_vec();
        assert_eq!(points, vec!["小貓迷路了", "下起大雨", "朋友出手相助"]);

        h.workflow.build_preview(&points[0]).await?;
        assert_eq!(h.workflow.stage(), Stage::Preview);
        assert_eq!(*h.llm_calls.lock().unwrap(), 4, "plot points, story, pages, style");
        assert_eq!(*h.image_calls.lock().unwrap(), 1, "only the preview image");

        let session = h.workflow.session();
        assert!(session.story.as_deref().unwrap().contains("友誼"));
        assert_eq!(session.pages.len(), 8);
        let records: Vec<_> = session.parsed_pages().collect();
        assert_eq!(records.len(), 8);
        assert_eq!(records[0].index, 1);
        assert_eq!(records[4].image_prompt, "kitten scene 5");
        assert_eq!(records[2].text, "小貓的第3頁。", "page text is localized");

        h.workflow.confirm().await?;
        assert_eq!(h.workflow.stage(), Stage::Generate);
        assert_eq!(*h.image_calls.lock().unwrap(), 8, "page 1 reuses the preview");
        let rendered = &h.workflow.session().rendered;
        assert_eq!(rendered.len(), 8);
        assert!(rendered.iter().all(|p| p.is_complete()));
        assert_eq!(rendered[0].image_url, h.workflow.session().preview_image);

        let dir = h.workflow.export().await?;
        assert!(Path::new(&dir).join("story.md").exists());
        assert!(Path::new(&dir).join("page_08.png").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_broken_page_is_skipped_not_fatal() -> Result<()> {
        let mut h = harness(
            MockLlmClient::with_broken_pages(&[3]),
            MockImageClient::new(None),
            false,
        );
        h.workflow
            .suggest_plot_points(GenerationRequest::new("小貓", "友誼", 6)?)
            .await?;
        h.workflow.build_preview("小貓迷路了").await?;

        h.workflow.confirm().await?;
        let rendered = &h.workflow.session().rendered;
        assert_eq!(rendered.len(), 6);
        assert!(rendered[2].record.is_none());
        assert!(rendered[2].failure.as_deref().unwrap().contains("第 3 頁"));
        assert!(rendered[3].is_complete());
        // Preview plus pages 2, 4, 5, 6.
        assert_eq!(*h.image_calls.lock().unwrap(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_broken_first_page_previews_next_page() -> Result<()> {
        let mut h = harness(
            MockLlmClient::with_broken_pages(&[1]),
            MockImageClient::new(None),
            false,
        );
        h.workflow
            .suggest_plot_points(GenerationRequest::new("小貓", "友誼", 6)?)
            .await?;

        h.workflow.build_preview("小貓迷路了").await?;
        assert_eq!(h.workflow.stage(), Stage::Preview);
        assert_eq!(*h.image_calls.lock().unwrap(), 1);
        assert!(h.workflow.session().pages[0].is_err());

        h.workflow.confirm().await?;
        let session = h.workflow.session();
        assert!(session.rendered[0].record.is_none());
        assert!(session.rendered[0].failure.as_deref().unwrap().contains("第 1 頁"));
        assert_eq!(session.rendered[1].image_url, session.preview_image);
        // Preview (page 2) plus pages 3-6.
        assert_eq!(*h.image_calls.lock().unwrap(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_unattended_run_survives_broken_first_page() -> Result<()> {
        let mut h = harness(
            MockLlmClient::with_broken_pages(&[1]),
            MockImageClient::new(None),
            true,
        );
        h.workflow.run().await?;

        assert_eq!(h.workflow.stage(), Stage::Generate);
        let rendered = &h.workflow.session().rendered;
        assert_eq!(rendered.len(), 8);
        assert_eq!(rendered.iter().filter(|p| p.is_complete()).count(), 7);
        Ok(())
    }

    #[tokio::test]
    async fn test_plan_without_usable_pages_blocks_preview() -> Result<()> {
        let broken: Vec<usize> = (1..=6).collect();
        let mut h = harness(
            MockLlmClient::with_broken_pages(&broken),
            MockImageClient::new(None),
            false,
        );
        h.workflow
            .suggest_plot_points(GenerationRequest::new("小貓", "友誼", 6)?)
            .await?;

        let err = h.workflow.build_preview("小貓迷路了").await.unwrap_err();
        assert!(err.to_string().contains("no usable pages"));
        assert_eq!(h.workflow.stage(), Stage::Input);
        assert_eq!(*h.image_calls.lock().unwrap(), 0);
        // Plot points, story and page plan; no style base request.
        assert_eq!(*h.llm_calls.lock().unwrap(), 3);
        assert!(h.workflow.session().story.is_none());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_sleeps_only_between_image_calls() -> Result<()> {
        let mut h = harness(MockLlmClient::new(), MockImageClient::new(None), false);
        h.workflow.config.image.pacing_delay_seconds = 5;
        h.workflow
            .suggest_plot_points(GenerationRequest::new("小貓", "友誼", 8)?)
            .await?;
        h.workflow.build_preview("小貓迷路了").await?;

        let started = tokio::time::Instant::now();
        h.workflow.confirm().await?;
        // Page 1 reuses the preview, so pages 2-8 make seven calls and six pauses.
        assert_eq!(*h.image_calls.lock().unwrap(), 8);
        assert_eq!(started.elapsed(), Duration::from_secs(5 * 6));
        Ok(())
    }

    #[tokio::test]
    async fn test_preview_image_failure_keeps_input_stage() -> Result<()> {
        let mut h = harness(MockLlmClient::new(), MockImageClient::new(Some("kitten")), false);
        h.workflow
            .suggest_plot_points(GenerationRequest::new("小貓", "友誼", 8)?)
            .await?;

        assert!(h.workflow.build_preview("小貓迷路了").await.is_err());
        assert_eq!(h.workflow.stage(), Stage::Input);
        assert_eq!(*h.image_calls.lock().unwrap(), 3, "bounded by max_retries");
        assert!(h.workflow.session().story.is_none());
        assert!(h.workflow.session().preview_image.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_page_image_is_omitted() -> Result<()> {
        let mut h = harness(
            MockLlmClient::new(),
            MockImageClient::new(Some("kitten scene 4")),
            false,
        );
        h.workflow
            .suggest_plot_points(GenerationRequest::new("小貓", "友誼", 6)?)
            .await?;
        h.workflow.build_preview("下起大雨").await?;
        h.workflow.confirm().await?;

        let rendered = &h.workflow.session().rendered;
        assert!(rendered[3].record.is_some());
        assert!(rendered[3].image_url.is_none());
        assert!(rendered[3].failure.is_some());
        assert!(rendered[4].is_complete());
        // Preview, pages 2-3, three attempts on page 4, pages 5-6.
        assert_eq!(*h.image_calls.lock().unwrap(), 8);
        assert_eq!(h.workflow.stage(), Stage::Generate);
        Ok(())
    }

    #[tokio::test]
    async fn test_regenerate_returns_to_input_and_allows_new_preview() -> Result<()> {
        let mut h = harness(MockLlmClient::new(), MockImageClient::new(None), false);
        h.workflow
            .suggest_plot_points(GenerationRequest::new("小貓", "友誼", 8)?)
            .await?;
        h.workflow.build_preview("小貓迷路了").await?;

        h.workflow.regenerate()?;
        let session = h.workflow.session();
        assert_eq!(session.stage(), Stage::Input);
        assert!(session.story.is_none());
        assert!(session.pages.is_empty());
        assert!(session.preview_image.is_none());
        assert!(session.request.is_some());

        h.workflow.build_preview("下起大雨").await?;
        assert_eq!(h.workflow.stage(), Stage::Preview);
        assert_eq!(h.workflow.session().plot_point.as_deref(), Some("下起大雨"));
        Ok(())
    }

    #[tokio::test]
    async fn test_actions_outside_their_stage_are_rejected() -> Result<()> {
        let mut h = harness(MockLlmClient::new(), MockImageClient::new(None), false);

        assert!(h.workflow.build_preview("迷路").await.is_err(), "no request yet");
        assert!(h.workflow.confirm().await.is_err());
        assert!(h.workflow.regenerate().is_err());
        assert!(h.workflow.export().await.is_err());
        assert_eq!(h.workflow.stage(), Stage::Input);
        assert_eq!(*h.llm_calls.lock().unwrap(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_unattended_run_produces_a_book() -> Result<()> {
        let mut h = harness(MockLlmClient::new(), MockImageClient::new(None), true);
        h.workflow.run().await?;

        assert_eq!(h.workflow.stage(), Stage::Generate);
        assert_eq!(h.workflow.session().rendered.len(), 8);
        let output = Path::new(&h.workflow.config.output_folder).join("小貓_友誼_8p");
        assert!(output.join("story.md").exists());
        assert!(output.join("pages.json").exists());
        Ok(())
    }
}
