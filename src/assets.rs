use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::fsutil;
use crate::pipeline::StageContext;

/// Dev zepto builds are loaded separately by the dev server pages.
const DEV_VENDOR_EXCLUDES: [&str; 2] = ["zepto.min.js", "zepto.ghostclick.js"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Release,
    Dev,
}

impl Profile {
    fn css_replacements(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Profile::Release => &[("/shared", "../")],
            Profile::Dev => &[
                ("/shared", ".."),
                ("../../img", "/.tmp/img"),
                ("../img", "/.tmp/img"),
            ],
        }
    }
}

/// Compile every non-partial `.scss` entry under `assets/scss` into
/// `<shared>/css/<entry>.css`.
pub fn styles(ctx: &StageContext, profile: Profile) -> anyhow::Result<()> {
    let config = &ctx.config;
    let scss_dir = config.assets_dir().join("scss");
    let css_dir = config.shared_assets_dir().join("css");

    let style = match profile {
        Profile::Release => grass::OutputStyle::Compressed,
        Profile::Dev => grass::OutputStyle::Expanded,
    };
    let options = grass::Options::default().style(style);

    let mut written = 0_usize;
    for rel in fsutil::relative_files(&scss_dir)? {
        if !is_scss_entry(&rel) {
            continue;
        }
        let source = scss_dir.join(&rel);
        let css = grass::from_path(&source, &options)
            .map_err(|err| anyhow::anyhow!("compile {}: {err}", source.display()))?;
        let css = fsutil::apply_replacements(&css, profile.css_replacements());

        let out = css_dir.join(rel.with_extension("css"));
        fsutil::write_file(&out, &css)?;
        log_written(ctx, &out, css.len());
        written += 1;
    }

    tracing::info!(stylesheets = written, ?profile, "compiled styles");
    Ok(())
}

fn is_scss_entry(rel: &Path) -> bool {
    fsutil::has_extension(rel, &["scss"])
        && !rel
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('_'))
}

/// `main.js` from `js/scripts`, flattened copies of `js/standalone`, and
/// `vendor.js` from `js/vendor`.
pub fn scripts(ctx: &StageContext, profile: Profile) -> anyhow::Result<()> {
    let config = &ctx.config;
    let js_dir = config.assets_dir().join("js");
    let out_dir = config.shared_assets_dir().join("js");

    let main_sources = js_sources(&js_dir.join("scripts"), &[])?;
    if !main_sources.is_empty() {
        let bundle = concat(&main_sources)?;
        let bundle = match profile {
            Profile::Release => minify_js(&bundle),
            Profile::Dev => bundle,
        };
        write_bundle(ctx, &out_dir.join("main.js"), &bundle)?;
    }

    let standalone = js_sources(&js_dir.join("standalone"), &[])?;
    fsutil::flatten_into(&standalone, &out_dir)?;

    let vendor_excludes: &[&str] = match profile {
        Profile::Release => &[],
        Profile::Dev => &DEV_VENDOR_EXCLUDES,
    };
    let vendor_sources = js_sources(&js_dir.join("vendor"), vendor_excludes)?;
    if !vendor_sources.is_empty() {
        let bundle = minify_js(&concat(&vendor_sources)?);
        write_bundle(ctx, &out_dir.join("vendor.js"), &bundle)?;
    }

    tracing::info!(
        main = main_sources.len(),
        standalone = standalone.len(),
        vendor = vendor_sources.len(),
        ?profile,
        "bundled scripts"
    );
    Ok(())
}

fn js_sources(dir: &Path, excludes: &[&str]) -> anyhow::Result<Vec<PathBuf>> {
    Ok(fsutil::relative_files(dir)?
        .into_iter()
        .filter(|rel| fsutil::has_extension(rel, &["js"]))
        .filter(|rel| {
            !rel.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| excludes.contains(&n))
        })
        .map(|rel| dir.join(rel))
        .collect())
}

fn concat(sources: &[PathBuf]) -> anyhow::Result<String> {
    let mut parts = Vec::with_capacity(sources.len());
    for source in sources {
        parts.push(
            std::fs::read_to_string(source)
                .with_context(|| format!("read script: {}", source.display()))?,
        );
    }
    Ok(parts.join("\n"))
}

fn minify_js(source: &str) -> String {
    minifier::js::minify(source).to_string()
}

fn write_bundle(ctx: &StageContext, out: &Path, contents: &str) -> anyhow::Result<()> {
    fsutil::write_file(out, contents)?;
    log_written(ctx, out, contents.len());
    Ok(())
}

fn log_written(ctx: &StageContext, out: &Path, bytes: usize) {
    if ctx.config.verbose {
        tracing::info!(out = %out.display(), bytes, "wrote");
    } else {
        tracing::debug!(out = %out.display(), bytes, "wrote");
    }
}

/// Flatten page images into `<tmp>/img` for the dev stylesheets.
pub fn images_dev(ctx: &StageContext) -> anyhow::Result<()> {
    let pages_dir = ctx.config.pages_dir();
    let images: Vec<PathBuf> = fsutil::relative_files(&pages_dir)?
        .into_iter()
        .filter(|rel| fsutil::has_extension(rel, &["png", "jpg", "svg"]))
        .map(|rel| pages_dir.join(rel))
        .collect();

    fsutil::flatten_into(&images, &ctx.config.tmp_dir().join("img"))?;
    tracing::info!(images = images.len(), "copied dev images");
    Ok(())
}
