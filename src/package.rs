use std::fs::File;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::config::BuildConfiguration;
use crate::error::PipelineError;
use crate::formats::DeployTarget;
use crate::fsutil;
use crate::naming::RunMode;
use crate::pipeline::StageContext;

/// What one staged key message left in the deploy directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub name: String,
    pub archive: PathBuf,
    pub control_file: Option<PathBuf>,
    pub files: usize,
}

/// One unit to stage. `shared` has no key message behind it.
#[derive(Debug, Clone)]
struct Entry {
    display_name: String,
    dir_name: String,
    description: Option<String>,
    required: bool,
}

pub async fn run(ctx: &StageContext) -> anyhow::Result<Vec<StagedArtifact>> {
    let config = &ctx.config;
    let deploy_dir = config.deploy_dir();
    tokio::fs::create_dir_all(&deploy_dir)
        .await
        .map_err(|err| PipelineError::io(&deploy_dir, err))?;

    let excludes = Exclusions::new(config.clm.crm.deploy_to, ctx.mode)?;
    let entries = entries(ctx);

    let results = futures::future::join_all(
        entries
            .iter()
            .map(|entry| stage_entry(config, entry, &excludes)),
    )
    .await;

    let mut staged = Vec::new();
    let mut first_err = None;
    for (entry, result) in entries.iter().zip(results) {
        match result {
            Ok(Some(artifact)) => {
                tracing::info!(
                    key_message = %artifact.name,
                    files = artifact.files,
                    archive = %artifact.archive.display(),
                    "staged"
                );
                staged.push(artifact);
            }
            Ok(None) => tracing::debug!(key_message = %entry.display_name, "nothing to stage"),
            Err(err) => {
                tracing::error!(key_message = %entry.display_name, "staging failed: {err:#}");
                first_err.get_or_insert(err.context(format!("stage {}", entry.display_name)));
            }
        }
    }

    if let Some(err) = first_err {
        return Err(err);
    }
    Ok(staged)
}

fn entries(ctx: &StageContext) -> Vec<Entry> {
    let mut entries: Vec<Entry> = ctx
        .config
        .clm
        .key_messages
        .iter()
        .map(|km| Entry {
            display_name: ctx.naming.display_name(&km.key_message),
            dir_name: ctx.naming.output_dir_name(&km.key_message),
            description: km.description.clone(),
            required: true,
        })
        .collect();

    let shared = ctx.config.paths.shared_assets.clone();
    entries.push(Entry {
        display_name: shared.clone(),
        dir_name: shared,
        description: None,
        required: false,
    });
    entries
}

async fn stage_entry(
    config: &BuildConfiguration,
    entry: &Entry,
    excludes: &Exclusions,
) -> anyhow::Result<Option<StagedArtifact>> {
    let source = config.dist_dir().join(&entry.dir_name);
    if !source.is_dir() {
        if entry.required {
            anyhow::bail!("key message output missing: {}", source.display());
        }
        return Ok(None);
    }

    let deploy_dir = config.deploy_dir();
    let archive = deploy_dir.join(format!("{}.zip", entry.dir_name));

    let files: Vec<PathBuf> = fsutil::relative_files(&source)?
        .into_iter()
        .filter(|rel| !excludes.is_excluded(rel))
        .collect();
    let count = files.len();
    {
        let source = source.clone();
        let archive = archive.clone();
        tokio::task::spawn_blocking(move || write_zip_blocking(&source, &files, &archive))
            .await
            .context("join zip task")??;
    }
    if config.verbose {
        tracing::info!(key_message = %entry.display_name, files = count, "zipped");
    }

    let control_file = match config.clm.crm.deploy_to {
        DeployTarget::Vault => None,
        DeployTarget::Ftp => {
            let path = deploy_dir.join(format!("{}.ctl", entry.dir_name));
            let contents = control_file_contents(config, entry);
            tokio::fs::write(&path, contents)
                .await
                .map_err(|err| PipelineError::io(&path, err))?;
            Some(path)
        }
    };

    Ok(Some(StagedArtifact {
        name: entry.display_name.clone(),
        archive,
        control_file,
        files: count,
    }))
}

/// `KEY=VALUE` lines the CRM reads next to an uploaded archive.
fn control_file_contents(config: &BuildConfiguration, entry: &Entry) -> String {
    let ftp = &config.ftp;
    [
        format!("USER={}", ftp.user.as_deref().unwrap_or_default()),
        format!("PASSWORD={}", ftp.pass.as_deref().unwrap_or_default()),
        format!("EMAIL={}", ftp.email.as_deref().unwrap_or_default()),
        format!("NAME={}", entry.display_name),
        format!(
            "Description_vod__c={}",
            entry.description.as_deref().unwrap_or_default()
        ),
        format!("FILENAME={}.zip", entry.dir_name),
    ]
    .join("\n")
}

/// Top-level files left out of an archive.
struct Exclusions {
    set: GlobSet,
}

impl Exclusions {
    fn new(target: DeployTarget, mode: RunMode) -> anyhow::Result<Self> {
        let pattern = if mode.deploying && target == DeployTarget::Vault {
            "*.jpg"
        } else {
            "thumb.png"
        };
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .with_context(|| format!("compile exclude pattern: {pattern}"))?;
        let set = GlobSetBuilder::new()
            .add(glob)
            .build()
            .context("build exclude set")?;
        Ok(Self { set })
    }

    fn is_excluded(&self, rel: &Path) -> bool {
        self.set.is_match(fsutil::slash_path(rel))
    }
}

fn write_zip_blocking(source: &Path, files: &[PathBuf], archive: &Path) -> anyhow::Result<()> {
    let file =
        File::create(archive).with_context(|| format!("create zip: {}", archive.display()))?;
    let mut zip = zip::ZipWriter::new(file);

    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for rel in files {
        let name = fsutil::slash_path(rel);
        zip.start_file(name.as_str(), options)
            .with_context(|| format!("zip start_file: {name}"))?;
        let path = source.join(rel);
        let mut f = File::open(&path).map_err(|err| PipelineError::io(&path, err))?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)
            .with_context(|| format!("read: {}", path.display()))?;
        zip.write_all(&buf)
            .with_context(|| format!("zip write: {name}"))?;
    }

    zip.finish().context("zip finish")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Tools;
    use crate::pipeline::testing::project;

    fn zip_names(path: &Path) -> anyhow::Result<Vec<String>> {
        let archive = zip::ZipArchive::new(File::open(path)?)?;
        let mut names: Vec<String> = archive.file_names().map(str::to_owned).collect();
        names.sort();
        Ok(names)
    }

    #[tokio::test]
    async fn ftp_staging_writes_zip_and_control_file_per_key_message() -> anyhow::Result<()> {
        let (temp, config) = project(
            "ftp:\n  host: ftp.example.com\n  user: deployer\n  pass: secret\n  email: ops@example.com\nclm:\n  key_messages:\n    - key_message: intro\n      description: Opening\n    - key_message: dosing\n",
        )?;
        let dist = temp.path().join("build");
        fsutil::write_file(&dist.join("intro/intro.html"), "<html></html>")?;
        fsutil::write_file(&dist.join("intro/thumb.png"), "png")?;
        fsutil::write_file(&dist.join("intro/intro-thumb.jpg"), "jpg")?;
        fsutil::write_file(&dist.join("intro/img/bg.png"), "png")?;
        fsutil::write_file(&dist.join("dosing/dosing.html"), "<html></html>")?;
        fsutil::write_file(&dist.join("shared/css/main.css"), "a{}")?;

        let ctx = StageContext::new(config, RunMode { deploying: true }, Tools::from_env());
        let staged = run(&ctx).await?;

        assert_eq!(staged.len(), 3);
        let deploy = temp.path().join("deploy");
        assert_eq!(
            zip_names(&deploy.join("intro.zip"))?,
            ["img/bg.png", "intro-thumb.jpg", "intro.html"]
        );
        assert_eq!(zip_names(&deploy.join("shared.zip"))?, ["css/main.css"]);

        let ctl = std::fs::read_to_string(deploy.join("intro.ctl"))?;
        assert_eq!(
            ctl,
            "USER=deployer\nPASSWORD=secret\nEMAIL=ops@example.com\nNAME=intro\nDescription_vod__c=Opening\nFILENAME=intro.zip"
        );
        assert!(std::fs::read_to_string(deploy.join("dosing.ctl"))?.contains("Description_vod__c=\n"));
        Ok(())
    }

    #[tokio::test]
    async fn vault_staging_drops_top_level_jpgs_and_control_files() -> anyhow::Result<()> {
        let (temp, config) = project(
            "clm:\n  product:\n    name: Brand\n    suffix: _\n  crm:\n    deploy_to: vault\n  key_messages:\n    - key_message: Intro\n",
        )?;
        let dist = temp.path().join("build");
        fsutil::write_file(&dist.join("brand_intro/index.html"), "<html></html>")?;
        fsutil::write_file(&dist.join("brand_intro/brand_intro-full.jpg"), "jpg")?;
        fsutil::write_file(&dist.join("brand_intro/img/photo.jpg"), "jpg")?;

        let ctx = StageContext::new(config, RunMode { deploying: true }, Tools::from_env());
        let staged = run(&ctx).await?;

        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].name, "Brand_Intro");
        assert_eq!(staged[0].control_file, None);
        let deploy = temp.path().join("deploy");
        assert_eq!(
            zip_names(&deploy.join("brand_intro.zip"))?,
            ["img/photo.jpg", "index.html"]
        );
        assert!(!deploy.join("brand_intro.ctl").exists());
        Ok(())
    }

    #[tokio::test]
    async fn missing_key_message_output_fails_after_others_settle() -> anyhow::Result<()> {
        let (temp, config) = project(
            "clm:\n  key_messages:\n    - key_message: a\n    - key_message: b\n",
        )?;
        fsutil::write_file(&temp.path().join("build/a/a.html"), "x")?;

        let ctx = StageContext::new(config, RunMode::default(), Tools::from_env());
        let err = run(&ctx).await.expect_err("b was never built");
        assert!(format!("{err:#}").contains("stage b"));
        assert!(temp.path().join("deploy/a.zip").exists());
        Ok(())
    }
}
