use crate::fsutil;
use crate::pipeline::StageContext;

/// Copy `<dist>/<sharedAssets>` into every key message directory that wants
/// it. No-op unless the CRM advertises shared resources.
pub fn copy_shared_assets(ctx: &StageContext) -> anyhow::Result<()> {
    let config = &ctx.config;
    if !config.clm.crm.has_shared_resources {
        tracing::info!("hasSharedResources is off; shared assets stay in place");
        return Ok(());
    }

    let shared_dir = config.shared_assets_dir();
    let dist_dir = config.dist_dir();
    for km in &config.clm.key_messages {
        if km.shared_assets_ignore {
            tracing::debug!(key_message = %km.key_message, "shared assets ignored");
            continue;
        }
        let to = dist_dir
            .join(ctx.naming.output_dir_name(&km.key_message))
            .join(&config.paths.shared_assets);
        let files = fsutil::copy_tree(&shared_dir, &to)?;
        tracing::info!(key_message = %km.key_message, files, "copied shared assets");
    }
    Ok(())
}

/// Turn absolute `<root><sharedAssets>` references into `./<sharedAssets>`
/// across every HTML file in the dist tree.
pub fn rewrite_shared_urls(ctx: &StageContext) -> anyhow::Result<()> {
    let config = &ctx.config;
    let dist_dir = config.dist_dir();
    if !dist_dir.is_dir() {
        return Ok(());
    }

    let from = format!("{}{}", config.paths.root, config.paths.shared_assets);
    let to = format!("./{}", config.paths.shared_assets);
    let changed = fsutil::replace_in_files(&dist_dir, &["html"], &[(&from, &to)])?;
    tracing::info!(files = changed, %from, %to, "rewrote shared asset urls");
    Ok(())
}
