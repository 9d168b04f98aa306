use crate::core::book::{GenerationRequest, PageRecord, RenderedPage};
use crate::services::pages::PageParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Stage {
    #[default]
    Input,
    Preview,
    Generate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Input => "input",
            Stage::Preview => "preview",
            Stage::Generate => "generate",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageEvent {
    /// Story, page plan, style base and the first image are ready.
    PreviewReady,
    Confirm,
    Regenerate,
    StartOver,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot apply {event:?} in the {from} stage")]
pub struct TransitionError {
    pub from: Stage,
    pub event: StageEvent,
}

impl Stage {
    pub fn next(self, event: StageEvent) -> Result<Stage, TransitionError> {
        match (self, event) {
            (Stage::Input, StageEvent::PreviewReady) => Ok(Stage::Preview),
            (Stage::Preview, StageEvent::Confirm) => Ok(Stage::Generate),
            (Stage::Preview, StageEvent::Regenerate) => Ok(Stage::Input),
            (Stage::Generate, StageEvent::StartOver) => Ok(Stage::Input),
            (from, event) => Err(TransitionError { from, event }),
        }
    }
}

pub type PageOutcome = Result<PageRecord, PageParseError>;

/// Everything one generation cycle produces. Lives only as long as the process.
#[derive(Debug, Default)]
pub struct Session {
    stage: Stage,
    pub request: Option<GenerationRequest>,
    pub plot_points: Vec<String>,
    pub plot_point: Option<String>,
    pub story: Option<String>,
    pub page_plan: Option<String>,
    pub pages: Vec<PageOutcome>,
    pub style_base: Option<String>,
    pub preview_image: Option<String>,
    pub rendered: Vec<RenderedPage>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Applies a stage event. Reset events also drop the artifacts they invalidate.
    pub fn apply(&mut self, event: StageEvent) -> Result<Stage, TransitionError> {
        let next = self.stage.next(event)?;
        match event {
            StageEvent::Regenerate => self.clear_artifacts(),
            StageEvent::StartOver => *self = Session::default(),
            StageEvent::PreviewReady | StageEvent::Confirm => {}
        }
        self.stage = next;
        Ok(next)
    }

    /// Drops everything generated after the request and plot-point suggestions.
    fn clear_artifacts(&mut self) {
        self.plot_point = None;
        self.story = None;
        self.page_plan = None;
        self.pages.clear();
        self.style_base = None;
        self.preview_image = None;
        self.rendered.clear();
    }

    pub fn parsed_pages(&self) -> impl Iterator<Item = &PageRecord> {
        self.pages.iter().filter_map(|p| p.as_ref().ok())
    }
}
