pub mod export;
pub mod image;
pub mod llm;
pub mod pages;
pub mod safety;
pub mod setup;
pub mod story;
pub mod workflow;
