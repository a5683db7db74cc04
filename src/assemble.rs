use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use handlebars::Handlebars;

use crate::config::BuildConfiguration;
use crate::error::PipelineError;
use crate::fsutil;
use crate::naming::RunMode;
use crate::pipeline::StageContext;

const TEMPLATE_EXTENSION: &str = "hbs";
const APP_MANIFEST: &str = "app.json";

pub fn run(ctx: &StageContext) -> anyhow::Result<()> {
    let config = &ctx.config;
    let pages_dir = config.pages_dir();
    let dist_dir = config.dist_dir();

    let mut registry = Handlebars::new();
    register_partials(&mut registry, &config.includes_dir()).context("register includes")?;
    register_partials(&mut registry, &config.layouts_dir()).context("register layouts")?;

    let data = data_context(config, ctx.mode).context("load template data")?;
    let key_messages: HashSet<&str> = config
        .clm
        .key_messages
        .iter()
        .map(|km| km.key_message.as_str())
        .collect();

    let files = fsutil::relative_files(&pages_dir)?;
    if files.is_empty() {
        tracing::warn!(pages = %pages_dir.display(), "no pages to assemble");
    }

    let mut rendered = 0_usize;
    let mut copied = 0_usize;
    for rel in files {
        let source = pages_dir.join(&rel);
        let rel_dir = rel.parent().unwrap_or_else(|| Path::new(""));

        if !fsutil::has_extension(&rel, &[TEMPLATE_EXTENSION]) {
            let name = rel
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("page asset has no file name: {}", rel.display()))?;
            let out = dist_dir.join(ctx.naming.asset_dir(rel_dir)).join(name);
            fsutil::copy_file(&source, &out)?;
            copied += 1;
            continue;
        }

        let stem = rel
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow::anyhow!("template has no utf-8 stem: {}", rel.display()))?;
        let out_stem = ctx.naming.page_stem(
            stem,
            key_messages.contains(stem),
            config.clm.crm.deploy_to,
            ctx.mode,
        );
        let out = dist_dir
            .join(ctx.naming.page_dir(rel_dir))
            .join(format!("{out_stem}.html"));

        let html = render_page(&registry, &source, &data)?;
        fsutil::write_file(&out, html)?;
        if config.verbose {
            tracing::info!(template = %rel.display(), out = %out.display(), "rendered");
        }
        rendered += 1;
    }

    let manifest = serde_json::to_string(&config.clm.key_messages)
        .context("serialize key message manifest")?;
    fsutil::write_file(&config.shared_assets_dir().join(APP_MANIFEST), manifest)?;

    tracing::info!(rendered, copied, "assembled key message(s)");
    Ok(())
}

/// Partials are named by their path below `dir`, without extension.
fn register_partials(registry: &mut Handlebars<'_>, dir: &Path) -> anyhow::Result<()> {
    for rel in fsutil::relative_files(dir)? {
        if !fsutil::has_extension(&rel, &[TEMPLATE_EXTENSION]) {
            continue;
        }
        let path = dir.join(&rel);
        let contents =
            std::fs::read_to_string(&path).map_err(|err| PipelineError::io(&path, err))?;
        let name = fsutil::slash_path(&rel.with_extension(""));
        registry
            .register_partial(&name, contents)
            .map_err(|err| PipelineError::Render {
                template: path.clone(),
                message: err.to_string(),
            })?;
        tracing::debug!(partial = %name, "registered");
    }
    Ok(())
}

/// Global template data: one entry per YAML/JSON data file (keyed by file
/// stem) plus the injected `paths`, `deploy`, `layout` and `root` values.
pub fn data_context(
    config: &BuildConfiguration,
    mode: RunMode,
) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
    let data_dir = config.data_dir();
    let mut data = serde_json::Map::new();

    for rel in fsutil::relative_files(&data_dir)? {
        let path = data_dir.join(&rel);
        let Some(stem) = rel.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let value = if fsutil::has_extension(&rel, &["yml", "yaml"]) {
            let contents =
                std::fs::read_to_string(&path).map_err(|err| PipelineError::io(&path, err))?;
            serde_yaml::from_str::<serde_json::Value>(&contents)
                .map_err(|err| render_error(&path, err))?
        } else if fsutil::has_extension(&rel, &["json"]) {
            let contents =
                std::fs::read_to_string(&path).map_err(|err| PipelineError::io(&path, err))?;
            serde_json::from_str::<serde_json::Value>(&contents)
                .map_err(|err| render_error(&path, err))?
        } else {
            continue;
        };
        data.insert(stem.to_owned(), value);
    }

    data.insert(
        "paths".to_owned(),
        serde_json::to_value(&config.paths).context("serialize paths")?,
    );
    data.insert("deploy".to_owned(), serde_json::Value::Bool(mode.deploying));
    data.insert(
        "layout".to_owned(),
        serde_json::Value::String(config.module.workflow.assemble.default_layout.clone()),
    );
    let root = if mode.deploying {
        "../".to_owned()
    } else {
        config.paths.root.clone()
    };
    data.insert("root".to_owned(), serde_json::Value::String(root));

    Ok(data)
}

fn render_page(
    registry: &Handlebars<'_>,
    path: &Path,
    data: &serde_json::Map<String, serde_json::Value>,
) -> anyhow::Result<String> {
    let contents = std::fs::read_to_string(path).map_err(|err| PipelineError::io(path, err))?;
    let (front, body) = split_front_matter(&contents).map_err(|err| render_error(path, err))?;

    let mut page_data = data.clone();
    if let Some(serde_json::Value::Object(front)) = front {
        page_data.extend(front);
    }

    registry
        .render_template(body, &page_data)
        .map_err(|err| render_error(path, err).into())
}

/// Strip a leading `---` YAML block. Returns the parsed block, if any, and
/// the remaining template body.
fn split_front_matter(contents: &str) -> anyhow::Result<(Option<serde_json::Value>, &str)> {
    let Some(rest) = contents
        .strip_prefix("---\n")
        .or_else(|| contents.strip_prefix("---\r\n"))
    else {
        return Ok((None, contents));
    };

    let mut offset = 0_usize;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            let front: serde_json::Value =
                serde_yaml::from_str(yaml).context("deserialize front matter")?;
            let front = if front.is_null() { None } else { Some(front) };
            return Ok((front, body));
        }
        offset += line.len();
    }

    anyhow::bail!("front matter is not closed with '---'")
}

fn render_error(path: &Path, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Render {
        template: PathBuf::from(path),
        message: format!("{err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::RunMode;
    use crate::pipeline::testing::project;
    use crate::pipeline::{StageContext, Tools};

    #[test]
    fn front_matter_is_split_from_body() -> anyhow::Result<()> {
        let (front, body) = split_front_matter("---\ntitle: Intro\n---\n<h1>{{title}}</h1>\n")?;
        assert_eq!(front, Some(serde_json::json!({"title": "Intro"})));
        assert_eq!(body, "<h1>{{title}}</h1>\n");

        let (front, body) = split_front_matter("<p>plain</p>")?;
        assert!(front.is_none());
        assert_eq!(body, "<p>plain</p>");

        assert!(split_front_matter("---\ntitle: x\n<p>").is_err());
        Ok(())
    }

    #[test]
    fn single_key_message_renders_into_its_own_directory() -> anyhow::Result<()> {
        let (temp, config) = project(
            "clm:\n  key_messages:\n    - key_message: demo\n      slides: [{}]\n",
        )?;
        let app = temp.path().join("app/templates");
        fsutil::write_file(
            &app.join("layouts/default.hbs"),
            "<html><body>{{> @partial-block}}</body></html>",
        )?;
        fsutil::write_file(&app.join("includes/footer.hbs"), "<footer>{{site.owner}}</footer>")?;
        fsutil::write_file(&app.join("data/site.yml"), "owner: Pharma Co\n")?;
        fsutil::write_file(
            &app.join("pages/some/where/demo.hbs"),
            "---\ntitle: Demo\n---\n{{#> default}}<h1>{{title}}</h1>{{> footer}}<a href=\"{{root}}x\">{{layout}}</a>{{/default}}",
        )?;
        fsutil::write_file(&app.join("pages/some/where/img/bg.png"), "png")?;

        let ctx = StageContext::new(config, RunMode::default(), Tools::from_env());
        run(&ctx)?;

        let html = std::fs::read_to_string(temp.path().join("build/demo/demo.html"))?;
        assert_eq!(
            html,
            "<html><body><h1>Demo</h1><footer>Pharma Co</footer><a href=\"/x\">default</a></body></html>"
        );
        assert!(temp.path().join("build/some/where/img/bg.png").exists());

        let manifest = std::fs::read_to_string(temp.path().join("build/shared/app.json"))?;
        let manifest: serde_json::Value = serde_json::from_str(&manifest)?;
        assert_eq!(manifest[0]["key_message"], "demo");
        Ok(())
    }

    #[test]
    fn product_prefix_and_vault_index_rename() -> anyhow::Result<()> {
        let (temp, config) = project(
            "clm:\n  product:\n    name: Brand\n    suffix: _\n  crm:\n    deploy_to: vault\n  key_messages:\n    - key_message: intro\n    - key_message: dosing\n",
        )?;
        let pages = temp.path().join("app/templates/pages");
        fsutil::write_file(&pages.join("intro/intro.hbs"), "intro {{deploy}}")?;
        fsutil::write_file(&pages.join("intro/popup.hbs"), "popup")?;
        fsutil::write_file(&pages.join("dosing/dosing.hbs"), "dosing")?;

        let ctx = StageContext::new(config, RunMode { deploying: true }, Tools::from_env());
        run(&ctx)?;

        let dist = temp.path().join("build");
        assert_eq!(std::fs::read_to_string(dist.join("brand_intro/index.html"))?, "intro true");
        assert!(dist.join("brand_intro/popup.html").exists());
        assert!(dist.join("brand_dosing/index.html").exists());
        Ok(())
    }

    #[test]
    fn vault_deploy_without_product_keeps_key_message_file_names() -> anyhow::Result<()> {
        let (temp, config) = project(
            "clm:\n  crm:\n    deploy_to: vault\n  key_messages:\n    - key_message: intro\n    - key_message: dosing\n",
        )?;
        let pages = temp.path().join("app/templates/pages");
        fsutil::write_file(&pages.join("intro/intro.hbs"), "intro")?;

        let ctx = StageContext::new(config, RunMode { deploying: true }, Tools::from_env());
        run(&ctx)?;

        let dist = temp.path().join("build");
        assert_eq!(fsutil::list_file_names(&dist.join("intro"))?, ["intro.html"]);
        Ok(())
    }

    #[test]
    fn template_errors_fail_the_stage() -> anyhow::Result<()> {
        let (temp, config) = project("clm:\n  key_messages:\n    - key_message: a\n")?;
        fsutil::write_file(
            &temp.path().join("app/templates/pages/a.hbs"),
            "{{> missing_partial}}",
        )?;

        let ctx = StageContext::new(config, RunMode::default(), Tools::from_env());
        let err = run(&ctx).expect_err("missing partial must fail");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Render { .. })
        ));
        Ok(())
    }
}
