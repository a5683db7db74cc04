use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::browser::{self, Browser};
use crate::error::PipelineError;
use crate::formats::{DeployTarget, DeviceProfile};
use crate::fsutil;
use crate::naming::{OutputNaming, RunMode};
use crate::pipeline::StageContext;

const FLYOUT_DIR: &str = "flyout-menu";
const THUMB_SUFFIX: &str = "-thumb.jpg";

pub async fn generate(ctx: &StageContext) -> anyhow::Result<()> {
    let dist_dir = ctx.config.dist_dir();
    if !dist_dir.is_dir() {
        tracing::warn!(dist = %dist_dir.display(), "nothing built; no thumbnails to take");
        return Ok(());
    }
    let dirs = fsutil::list_dirs(&dist_dir)?;
    let device = ctx.config.device();

    let browser = ctx
        .tools
        .browser
        .launch()
        .await
        .context("launch headless browser")?;

    let dir_paths: Vec<PathBuf> = dirs.iter().map(|dir| dist_dir.join(dir)).collect();
    let results = futures::future::join_all(
        dirs.iter()
            .zip(&dir_paths)
            .map(|(dir, dir_path)| thumbnail_dir(ctx, browser.as_ref(), &device, dir_path, dir)),
    )
    .await;

    let closed = browser.close().await;

    let mut generated = 0_usize;
    let mut failed = Vec::new();
    let mut first_err = None;
    for (dir, result) in dirs.iter().zip(results) {
        match result {
            Ok(true) => generated += 1,
            Ok(false) => {}
            Err(err) => {
                tracing::error!(dir = %dir, "thumbnail failed: {err:#}");
                failed.push(dir.as_str());
                first_err.get_or_insert(err);
            }
        }
    }
    closed.context("close headless browser")?;

    if let Some(err) = first_err {
        return Err(err.context(format!("thumbnails failed for: {}", failed.join(", "))));
    }
    tracing::info!(generated, skipped = dirs.len() - generated, "generated thumbnails");
    Ok(())
}

/// Vault packages only carry an `index` document when the product prefix
/// renamed it; the run mode does not matter here.
fn thumbnail_document(naming: &OutputNaming, dir: &str, target: DeployTarget) -> String {
    let stem = naming.primary_document_stem(dir, target, RunMode { deploying: true });
    format!("{stem}.html")
}

/// Returns `false` when the directory has no matching document.
async fn thumbnail_dir(
    ctx: &StageContext,
    browser: &dyn Browser,
    device: &DeviceProfile,
    dir_path: &Path,
    dir: &str,
) -> anyhow::Result<bool> {
    let document = thumbnail_document(&ctx.naming, dir, ctx.config.clm.crm.deploy_to);
    if !fsutil::list_file_names(dir_path)?.contains(&document) {
        tracing::debug!(dir = %dir, document = %document, "no document; skipped");
        return Ok(false);
    }

    let url = browser::document_url(&dir_path.join(&document), "screenshot")?;
    let png = dir_path.join(format!("{dir}.png"));
    browser.capture(&url, device, &png).await?;

    let sizes = &ctx.config.clm.thumbnail_sizes;
    for size in [&sizes.full, &sizes.thumb] {
        let out = dir_path.join(format!("{dir}-{}", size.name));
        ctx.tools.images.resize(&png, &out, size).await?;
    }

    tokio::fs::remove_file(&png)
        .await
        .map_err(|err| PipelineError::io(&png, err))?;
    tracing::info!(dir = %dir, "thumbnails");
    Ok(true)
}

/// Copy every `*-thumb.jpg` in the dist tree, flattened, into
/// `<shared>/img/flyout-menu`. Only when the CRM has a flyout menu.
pub fn publish_flyout(ctx: &StageContext) -> anyhow::Result<()> {
    let config = &ctx.config;
    if !config.clm.crm.has_flyout_menu {
        return Ok(());
    }

    let dist_dir = config.dist_dir();
    let thumbs: Vec<PathBuf> = fsutil::relative_files(&dist_dir)?
        .into_iter()
        .filter(|rel| {
            rel.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(THUMB_SUFFIX))
        })
        .filter(|rel| !rel.components().any(|c| c.as_os_str() == FLYOUT_DIR))
        .map(|rel| dist_dir.join(rel))
        .collect();

    let out = config.shared_assets_dir().join("img").join(FLYOUT_DIR);
    fsutil::flatten_into(&thumbs, &out)?;
    tracing::info!(thumbnails = thumbs.len(), out = %out.display(), "published flyout thumbnails");
    Ok(())
}
