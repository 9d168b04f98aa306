use anyhow::Result;
use picturebook::core::config::Config;
use picturebook::core::io::NativeStorage;
use picturebook::services::image::{create_image_client, ImageRenderer};
use picturebook::services::llm::create_llm;
use picturebook::services::workflow::WorkflowManager;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    // 1. Load Config
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };

    // 2. The API key is required by both clients; stop here if it is missing.
    if let Err(e) = config.api_key() {
        eprintln!("{}", e);
        return Err(e);
    }

    config.ensure_directories()?;

    // 3. Initialize clients
    let llm = create_llm(&config)?;
    let renderer = ImageRenderer::from_config(create_image_client(&config)?, &config)?;
    let storage = Arc::new(NativeStorage::new());

    // 4. Run the storybook workflow
    println!("互動式繪本生成器");
    let mut manager = WorkflowManager::new(config, llm, renderer, storage);
    manager.run().await?;

    Ok(())
}
