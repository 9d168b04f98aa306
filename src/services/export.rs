use anyhow::{Context, Result};
use log::warn;
use serde::Serialize;
use std::fmt::{self, Write as _};
use std::path::Path;

use crate::core::book::{GenerationRequest, RenderedPage};
use crate::core::io::Storage;
use crate::core::state::Session;
use crate::services::image::ImageRenderer;

#[derive(Serialize)]
struct BookManifest<'a> {
    request: &'a GenerationRequest,
    plot_point: Option<&'a str>,
    style_base: Option<&'a str>,
    story: Option<&'a str>,
    pages: &'a [RenderedPage],
}

fn slugify(request: &GenerationRequest) -> String {
    format!("{}_{}_{}p", request.character(), request.theme(), request.page_count())
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

pub fn image_file_name(index: usize) -> String {
    format!("page_{:02}.png", index)
}

async fn pick_book_dir(output_folder: &str, slug: &str, storage: &dyn Storage) -> Result<String> {
    let mut candidate = Path::new(output_folder).join(slug);
    let mut n = 2;
    while storage
        .exists(&candidate.join("story.md").to_string_lossy())
        .await?
    {
        candidate = Path::new(output_folder).join(format!("{}_{}", slug, n));
        n += 1;
    }
    Ok(candidate.to_string_lossy().to_string())
}

fn render_markdown(
    session: &Session,
    request: &GenerationRequest,
    images: &[Option<String>],
) -> Result<String, fmt::Error> {
    let mut md = String::new();
    writeln!(md, "# {}的{}故事\n", request.character(), request.theme())?;
    if let Some(plot_point) = &session.plot_point {
        writeln!(md, "> 故事轉折點：{}\n", plot_point)?;
    }
    if let Some(story) = &session.story {
        writeln!(md, "## 故事大綱\n\n{}\n", story)?;
    }
    writeln!(md, "## 分頁內容\n")?;
    for (page, image) in session.rendered.iter().zip(images) {
        writeln!(md, "### 第 {} 頁\n", page.index)?;
        match &page.record {
            Some(record) => writeln!(md, "{}\n", record.text)?,
            None => writeln!(md, "_（此頁內容解析失敗）_\n")?,
        }
        match (image, &page.failure) {
            (Some(file), _) => writeln!(md, "![第 {} 頁插圖]({})\n", page.index, file)?,
            (None, Some(failure)) => writeln!(md, "_插圖未生成：{}_\n", failure)?,
            (None, None) => {}
        }
    }
    Ok(md)
}

/// Writes the finished book (outline, page manifest, artwork) and returns its directory.
pub async fn export_book(
    session: &Session,
    renderer: &ImageRenderer,
    storage: &dyn Storage,
    output_folder: &str,
) -> Result<String> {
    let request = session
        .request
        .as_ref()
        .context("Nothing to export: no generation request in session")?;

    let dir = pick_book_dir(output_folder, &slugify(request), storage).await?;

    let mut images = Vec::with_capacity(session.rendered.len());
    for page in &session.rendered {
        let Some(url) = &page.image_url else {
            images.push(None);
            continue;
        };
        let file = image_file_name(page.index);
        let path = Path::new(&dir).join(&file);
        match renderer.download(url).await {
            Ok(bytes) => {
                storage.write(&path.to_string_lossy(), &bytes).await?;
                images.push(Some(file));
            }
            Err(e) => {
                warn!("Failed to download image for page {}: {:#}", page.index, e);
                images.push(None);
            }
        }
    }

    let manifest = BookManifest {
        request,
        plot_point: session.plot_point.as_deref(),
        style_base: session.style_base.as_deref(),
        story: session.story.as_deref(),
        pages: &session.rendered,
    };
    let manifest_path = Path::new(&dir).join("pages.json");
    storage
        .write(
            &manifest_path.to_string_lossy(),
            serde_json::to_string_pretty(&manifest)?.as_bytes(),
        )
        .await?;

    let story_path = Path::new(&dir).join("story.md");
    storage
        .write(
            &story_path.to_string_lossy(),
            render_markdown(session, request, &images)?.as_bytes(),
        )
        .await?;

    Ok(dir)
}
