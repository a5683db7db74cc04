use std::path::{Path, PathBuf};

use anyhow::Context as _;
use url::Url;

use crate::browser;
use crate::config::BuildConfiguration;
use crate::formats::ScreenshotEvent;
use crate::fsutil;
use crate::naming::{OutputNaming, RunMode};
use crate::pipeline::StageContext;

/// Rewrites that let built pages load dev assets straight from disk.
const TEMP_REFERENCE_REWRITES: [(&str, &str); 2] = [("/shared/", "../"), ("/.tmp/", "../../.tmp/")];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewKind {
    Base,
    Event {
        event: String,
        element_id: Option<String>,
    },
    Overlay(String),
    Enlargement(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenshotView {
    pub key_message: String,
    pub dir: String,
    /// 1-based slide number.
    pub page: usize,
    pub kind: ViewKind,
    pub url: Url,
}

impl ScreenshotView {
    pub fn fragment(page: usize, kind: &ViewKind) -> String {
        match kind {
            ViewKind::Base => format!("page={page}&screenshot"),
            ViewKind::Event {
                event,
                element_id: Some(id),
            } => format!("page={page}&event={event}&element_id={id}&screenshot"),
            ViewKind::Event {
                event,
                element_id: None,
            } => format!("page={page}&event={event}&screenshot"),
            ViewKind::Overlay(file) | ViewKind::Enlargement(file) => {
                format!("page={page}&popup={file}&screenshot")
            }
        }
    }

    /// `<index>-<slug>.png`; the index keeps PDF order stable.
    pub fn file_name(&self, index: usize) -> String {
        let fragment = Self::fragment(self.page, &self.kind);
        format!("{index}-{}.png", slugify(&format!("{}-{fragment}", self.dir)))
    }
}

/// Lowercase ASCII alphanumerics, every other run collapsed to one `-`.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Views in proof order: key message, slide, then base, events, overlays and
/// enlargements. Key messages without a built primary document and popups
/// whose file is missing are skipped.
pub fn enumerate_views(
    config: &BuildConfiguration,
    naming: &OutputNaming,
    mode: RunMode,
) -> anyhow::Result<Vec<ScreenshotView>> {
    let dist_dir = config.dist_dir();
    let mut views = Vec::new();

    for km in &config.clm.key_messages {
        let dir = naming.output_dir_name(&km.key_message);
        let dir_path = dist_dir.join(&dir);
        let stem = naming.primary_document_stem(&dir, config.clm.crm.deploy_to, mode);
        let document = dir_path.join(format!("{stem}.html"));
        if !document.is_file() {
            tracing::warn!(key_message = %km.key_message, document = %document.display(), "not built; skipped");
            continue;
        }

        for (index, slide) in km.slides.iter().enumerate() {
            let page = index + 1;
            let mut kinds = vec![ViewKind::Base];
            kinds.extend(slide.screenshots.iter().map(|event| match event {
                ScreenshotEvent::Event(event) => ViewKind::Event {
                    event: event.clone(),
                    element_id: None,
                },
                ScreenshotEvent::EventOnElement { event, element_id } => ViewKind::Event {
                    event: event.clone(),
                    element_id: Some(element_id.clone()),
                },
            }));
            kinds.extend(
                slide
                    .overlays
                    .iter()
                    .filter(|popup| popup_exists(&dir_path, &popup.file))
                    .map(|popup| ViewKind::Overlay(popup.file.clone())),
            );
            kinds.extend(
                slide
                    .enlargements
                    .iter()
                    .filter(|popup| popup_exists(&dir_path, &popup.file))
                    .map(|popup| ViewKind::Enlargement(popup.file.clone())),
            );

            for kind in kinds {
                let url = browser::document_url(&document, &ScreenshotView::fragment(page, &kind))?;
                views.push(ScreenshotView {
                    key_message: km.key_message.clone(),
                    dir: dir.clone(),
                    page,
                    kind,
                    url,
                });
            }
        }
    }

    Ok(views)
}

fn popup_exists(dir: &Path, file: &str) -> bool {
    let exists = dir.join(file).is_file();
    if !exists {
        tracing::debug!(dir = %dir.display(), file, "popup not built; skipped");
    }
    exists
}

/// Capture every view and compose the PDF. Returns the PDF path, or `None`
/// when there was nothing to capture.
pub async fn run(ctx: &StageContext) -> anyhow::Result<Option<PathBuf>> {
    let config = &ctx.config;
    let out_dir = config.screenshots_dir();
    fsutil::remove_dir_if_exists(&out_dir)?;
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("create screenshots dir: {}", out_dir.display()))?;

    let dist_dir = config.dist_dir();
    if dist_dir.is_dir() {
        let changed =
            fsutil::replace_in_files(&dist_dir, &["html", "css", "js"], &TEMP_REFERENCE_REWRITES)?;
        tracing::debug!(files = changed, "rewrote temp references");
    }

    let views = enumerate_views(config, &ctx.naming, ctx.mode)?;
    if views.is_empty() {
        tracing::warn!("no views to capture; no pdf written");
        return Ok(None);
    }
    tracing::info!(views = views.len(), "capturing screenshots");

    let pages: Vec<PathBuf> = views
        .iter()
        .enumerate()
        .map(|(index, view)| out_dir.join(view.file_name(index)))
        .collect();

    let device = config.device();
    let browser = ctx
        .tools
        .browser
        .launch()
        .await
        .context("launch headless browser")?;
    let results = futures::future::join_all(
        views
            .iter()
            .zip(&pages)
            .map(|(view, out)| browser.capture(&view.url, &device, out)),
    )
    .await;
    let closed = browser.close().await;

    // A missing page would shift every later one; any failure aborts the PDF.
    let mut first_err = None;
    let mut failed = 0_usize;
    for (view, result) in views.iter().zip(results) {
        if let Err(err) = result {
            tracing::error!(url = %view.url, "capture failed: {err:#}");
            failed += 1;
            first_err.get_or_insert(err);
        }
    }
    closed.context("close headless browser")?;
    if let Some(err) = first_err {
        return Err(err.context(format!("{failed} of {} screenshot(s) failed", views.len())));
    }

    let pdf = out_dir.join(format!("{}.pdf", config.clm.job.pdf_file_stem()));
    ctx.tools
        .images
        .compose_pdf(&pages, &config.clm.pdf_document, &pdf)
        .await?;
    tracing::info!(pages = pages.len(), pdf = %pdf.display(), "wrote proof pdf");
    Ok(Some(pdf))
}
