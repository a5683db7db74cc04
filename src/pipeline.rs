use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;

use crate::assets::Profile;
use crate::browser::{BrowserLauncher, ChromeLauncher};
use crate::config::BuildConfiguration;
use crate::deploy::{FtpConnector, SuppaFtpConnector};
use crate::error::PipelineError;
use crate::formats::DeployTarget;
use crate::imaging::{ImageConverter, RasterImages};
use crate::naming::{OutputNaming, RunMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Step {
    Clean,
    Styles,
    Scripts,
    Assemble,
    Thumbnails,
    PublishFlyoutThumbnails,
    CopySharedAssets,
    RewriteSharedUrls,
    Package,
    UploadArchives,
    UploadControlFiles,
    VaultExport,
    StylesDev,
    ScriptsDev,
    ImagesDev,
    Screenshots,
}

impl Step {
    pub fn name(self) -> &'static str {
        match self {
            Step::Clean => "clean",
            Step::Styles => "styles",
            Step::Scripts => "scripts",
            Step::Assemble => "assemble",
            Step::Thumbnails => "thumbnails",
            Step::PublishFlyoutThumbnails => "publish-flyout-thumbnails",
            Step::CopySharedAssets => "copy-shared-assets",
            Step::RewriteSharedUrls => "rewrite-shared-urls",
            Step::Package => "package",
            Step::UploadArchives => "upload-archives",
            Step::UploadControlFiles => "upload-control-files",
            Step::VaultExport => "vault-export",
            Step::StylesDev => "sass:dev",
            Step::ScriptsDev => "scripts:dev",
            Step::ImagesDev => "images:dev",
            Step::Screenshots => "screenshots",
        }
    }
}

/// Steps with their declared dependencies. Insertion order is kept so that
/// layers list steps the way the target declared them.
#[derive(Debug, Clone, Default)]
pub struct StageGraph {
    nodes: Vec<(Step, Vec<Step>)>,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: Step, depends_on: &[Step]) -> Self {
        self.nodes.push((step, depends_on.to_vec()));
        self
    }

    pub fn steps(&self) -> impl Iterator<Item = Step> + '_ {
        self.nodes.iter().map(|(step, _)| *step)
    }

    /// Topological layers: every step appears after all of its dependencies,
    /// and steps sharing a layer do not depend on each other.
    pub fn layers(&self) -> anyhow::Result<Vec<Vec<Step>>> {
        let declared: BTreeSet<Step> = self.steps().collect();
        if declared.len() != self.nodes.len() {
            anyhow::bail!("stage graph declares a step twice");
        }

        let mut pending: BTreeMap<Step, BTreeSet<Step>> = BTreeMap::new();
        for (step, deps) in &self.nodes {
            for dep in deps {
                if !declared.contains(dep) {
                    anyhow::bail!(
                        "step {} depends on undeclared step {}",
                        step.name(),
                        dep.name()
                    );
                }
            }
            pending.insert(*step, deps.iter().copied().collect());
        }

        let mut layers = Vec::new();
        let mut done = BTreeSet::new();
        while done.len() < self.nodes.len() {
            let layer: Vec<Step> = self
                .steps()
                .filter(|step| !done.contains(step))
                .filter(|step| pending[step].iter().all(|dep| done.contains(dep)))
                .collect();
            if layer.is_empty() {
                let stuck: Vec<&str> = self
                    .steps()
                    .filter(|step| !done.contains(step))
                    .map(Step::name)
                    .collect();
                anyhow::bail!("stage graph has a cycle among: {}", stuck.join(", "));
            }
            done.extend(layer.iter().copied());
            layers.push(layer);
        }

        Ok(layers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Assemble,
    CopySharedAssets,
    Build,
    VeevaThumbs,
    Deploy,
    Stage,
    StageVault,
    Screenshots,
    SassDev,
    ScriptsDev,
    ImagesDev,
    Dev,
    Clean,
}

impl Target {
    pub fn name(self) -> &'static str {
        match self {
            Target::Assemble => "assemble",
            Target::CopySharedAssets => "copy-shared-assets",
            Target::Build => "build",
            Target::VeevaThumbs => "veeva-thumbs",
            Target::Deploy => "deploy",
            Target::Stage => "stage",
            Target::StageVault => "stage-vault",
            Target::Screenshots => "screenshots",
            Target::SassDev => "sass:dev",
            Target::ScriptsDev => "scripts:dev",
            Target::ImagesDev => "images:dev",
            Target::Dev => "dev",
            Target::Clean => "clean",
        }
    }

    pub fn mode(self) -> RunMode {
        RunMode {
            deploying: matches!(self, Target::Build | Target::Stage),
        }
    }

    pub fn graph(self) -> StageGraph {
        use Step::*;

        match self {
            Target::Assemble => StageGraph::new().step(Assemble, &[]),
            Target::CopySharedAssets => StageGraph::new().step(CopySharedAssets, &[]),
            Target::VeevaThumbs => StageGraph::new()
                .step(Thumbnails, &[])
                .step(PublishFlyoutThumbnails, &[Thumbnails]),
            Target::Build => build_graph(StageGraph::new(), &[]),
            Target::Stage => {
                let graph = StageGraph::new().step(Clean, &[]);
                build_graph(graph, &[Clean]).step(Package, &[RewriteSharedUrls])
            }
            Target::Deploy => StageGraph::new()
                .step(UploadArchives, &[])
                .step(UploadControlFiles, &[UploadArchives]),
            Target::StageVault => StageGraph::new().step(VaultExport, &[]),
            Target::Screenshots => dev_graph().step(
                Screenshots,
                &[Assemble, StylesDev, ScriptsDev, ImagesDev],
            ),
            Target::SassDev => StageGraph::new().step(StylesDev, &[]),
            Target::ScriptsDev => StageGraph::new().step(ScriptsDev, &[]),
            Target::ImagesDev => StageGraph::new().step(ImagesDev, &[]),
            Target::Dev => dev_graph(),
            Target::Clean => StageGraph::new().step(Clean, &[]),
        }
    }

    /// Target-specific configuration checks, run before any step starts.
    pub fn validate(self, config: &BuildConfiguration) -> Result<(), PipelineError> {
        match self {
            Target::Deploy => config.require_ftp(),
            Target::Stage if config.clm.crm.deploy_to == DeployTarget::Ftp => config.require_ftp(),
            _ => Ok(()),
        }
    }
}

fn build_graph(graph: StageGraph, roots_depend_on: &[Step]) -> StageGraph {
    use Step::*;

    graph
        .step(Styles, roots_depend_on)
        .step(Scripts, roots_depend_on)
        .step(Assemble, roots_depend_on)
        .step(Thumbnails, &[Assemble])
        .step(PublishFlyoutThumbnails, &[Thumbnails])
        .step(CopySharedAssets, &[Styles, Scripts, PublishFlyoutThumbnails])
        .step(RewriteSharedUrls, &[CopySharedAssets])
}

fn dev_graph() -> StageGraph {
    use Step::*;

    StageGraph::new()
        .step(Assemble, &[])
        .step(StylesDev, &[])
        .step(ScriptsDev, &[])
        .step(ImagesDev, &[])
}

/// External collaborators, injectable so tests can run without Chrome or an
/// FTP server.
#[derive(Clone)]
pub struct Tools {
    pub browser: Arc<dyn BrowserLauncher>,
    pub images: Arc<dyn ImageConverter>,
    pub ftp: Arc<dyn FtpConnector>,
}

impl Tools {
    pub fn from_env() -> Self {
        Self {
            browser: Arc::new(ChromeLauncher::from_env()),
            images: Arc::new(RasterImages),
            ftp: Arc::new(SuppaFtpConnector),
        }
    }
}

pub struct StageContext {
    pub config: BuildConfiguration,
    pub naming: OutputNaming,
    pub mode: RunMode,
    pub tools: Tools,
}

impl StageContext {
    pub fn new(config: BuildConfiguration, mode: RunMode, tools: Tools) -> Self {
        let naming = OutputNaming::resolve(&config.clm);
        Self {
            config,
            naming,
            mode,
            tools,
        }
    }
}

pub async fn run_target(
    target: Target,
    config: BuildConfiguration,
    tools: Tools,
) -> anyhow::Result<()> {
    target.validate(&config)?;
    let layers = target
        .graph()
        .layers()
        .with_context(|| format!("plan target {}", target.name()))?;

    let ctx = Arc::new(StageContext::new(config, target.mode(), tools));
    tracing::debug!(target = target.name(), naming = ?ctx.naming, mode = ?ctx.mode, "planned");

    for layer in layers {
        let results =
            futures::future::join_all(layer.iter().map(|step| run_step(*step, &ctx))).await;

        let mut first_err = None;
        for (step, result) in layer.iter().zip(results) {
            if let Err(err) = result {
                tracing::error!(step = step.name(), "step failed: {err:#}");
                if first_err.is_none() {
                    first_err = Some(err.context(format!("step {}", step.name())));
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }
    }

    Ok(())
}

async fn run_step(step: Step, ctx: &Arc<StageContext>) -> anyhow::Result<()> {
    let started = Instant::now();
    tracing::info!(step = step.name(), "start");

    match step {
        Step::Clean => blocking(ctx, clean).await?,
        Step::Styles => blocking(ctx, |ctx| crate::assets::styles(ctx, Profile::Release)).await?,
        Step::Scripts => blocking(ctx, |ctx| crate::assets::scripts(ctx, Profile::Release)).await?,
        Step::Assemble => blocking(ctx, crate::assemble::run).await?,
        Step::Thumbnails => crate::thumbs::generate(ctx).await?,
        Step::PublishFlyoutThumbnails => blocking(ctx, crate::thumbs::publish_flyout).await?,
        Step::CopySharedAssets => blocking(ctx, crate::shared::copy_shared_assets).await?,
        Step::RewriteSharedUrls => blocking(ctx, crate::shared::rewrite_shared_urls).await?,
        Step::Package => {
            crate::package::run(ctx).await?;
        }
        Step::UploadArchives => crate::deploy::upload_archives(ctx).await?,
        Step::UploadControlFiles => crate::deploy::upload_control_files(ctx).await?,
        Step::VaultExport => blocking(ctx, crate::vault::run).await?,
        Step::StylesDev => blocking(ctx, |ctx| crate::assets::styles(ctx, Profile::Dev)).await?,
        Step::ScriptsDev => blocking(ctx, |ctx| crate::assets::scripts(ctx, Profile::Dev)).await?,
        Step::ImagesDev => blocking(ctx, crate::assets::images_dev).await?,
        Step::Screenshots => {
            crate::screenshots::run(ctx).await?;
        }
    }

    tracing::info!(
        step = step.name(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "done"
    );
    Ok(())
}

async fn blocking<F>(ctx: &Arc<StageContext>, f: F) -> anyhow::Result<()>
where
    F: FnOnce(&StageContext) -> anyhow::Result<()> + Send + 'static,
{
    let ctx = Arc::clone(ctx);
    tokio::task::spawn_blocking(move || f(&ctx))
        .await
        .context("join blocking step")?
}

/// Directories that resolve outside the project are only removed with `--force`.
fn clean(ctx: &StageContext) -> anyhow::Result<()> {
    let project_dir = crate::fsutil::normalize_lexically(&ctx.config.project_dir);
    for dir in [ctx.config.deploy_dir(), ctx.config.dist_dir()] {
        let dir = crate::fsutil::normalize_lexically(&dir);
        if !ctx.config.force && (dir == project_dir || !dir.starts_with(&project_dir)) {
            return Err(PipelineError::config(format!(
                "refusing to remove {}: not below the project directory (use --force)",
                dir.display()
            ))
            .into());
        }
        tracing::debug!(dir = %dir.display(), "remove");
        crate::fsutil::remove_dir_if_exists(&dir)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use url::Url;

    use super::*;
    use crate::browser::Browser;
    use crate::config::Overrides;
    use crate::deploy::FtpSession;
    use crate::formats::{DeviceProfile, FtpSettings, PdfDocument, ThumbnailSize};

    pub fn project(configuration_yml: &str) -> anyhow::Result<(tempfile::TempDir, BuildConfiguration)> {
        let temp = tempfile::TempDir::new()?;
        std::fs::write(temp.path().join("configuration.yml"), configuration_yml)?;
        let config = BuildConfiguration::load(temp.path(), &Overrides::default())?;
        Ok((temp, config))
    }

    #[derive(Default)]
    pub struct FakeBrowser {
        pub launches: AtomicUsize,
        pub closes: Arc<AtomicUsize>,
        pub captured: Arc<Mutex<Vec<String>>>,
        pub fail_when_url_contains: Option<String>,
    }

    struct FakePage {
        closes: Arc<AtomicUsize>,
        captured: Arc<Mutex<Vec<String>>>,
        fail_when_url_contains: Option<String>,
    }

    #[async_trait]
    impl BrowserLauncher for FakeBrowser {
        async fn launch(&self) -> anyhow::Result<Box<dyn Browser>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakePage {
                closes: Arc::clone(&self.closes),
                captured: Arc::clone(&self.captured),
                fail_when_url_contains: self.fail_when_url_contains.clone(),
            }))
        }
    }

    #[async_trait]
    impl Browser for FakePage {
        async fn capture(&self, url: &Url, _device: &DeviceProfile, out: &Path) -> anyhow::Result<()> {
            if let Some(needle) = &self.fail_when_url_contains
                && url.as_str().contains(needle.as_str())
            {
                return Err(PipelineError::RenderCapture {
                    url: url.to_string(),
                    message: "navigation failed".to_owned(),
                }
                .into());
            }
            self.captured.lock().expect("lock").push(url.to_string());
            crate::fsutil::write_file(out, b"png")
        }

        async fn close(self: Box<Self>) -> anyhow::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeImages {
        pub pdf_pages: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl ImageConverter for FakeImages {
        async fn resize(&self, input: &Path, output: &Path, _size: &ThumbnailSize) -> anyhow::Result<()> {
            std::fs::copy(input, output)?;
            Ok(())
        }

        async fn compose_pdf(&self, pages: &[PathBuf], _document: &PdfDocument, output: &Path) -> anyhow::Result<()> {
            self.pdf_pages.lock().expect("lock").extend(pages.iter().cloned());
            crate::fsutil::write_file(output, b"%PDF")
        }
    }

    #[derive(Default)]
    pub struct RecordingFtp {
        pub uploads: Arc<Mutex<Vec<String>>>,
        pub sessions_closed: Arc<AtomicUsize>,
        pub fail_file: Option<String>,
    }

    struct RecordingSession {
        uploads: Arc<Mutex<Vec<String>>>,
        closed: Arc<AtomicUsize>,
        fail_file: Option<String>,
    }

    impl FtpConnector for RecordingFtp {
        fn connect(&self, _settings: &FtpSettings) -> anyhow::Result<Box<dyn FtpSession>> {
            Ok(Box::new(RecordingSession {
                uploads: Arc::clone(&self.uploads),
                closed: Arc::clone(&self.sessions_closed),
                fail_file: self.fail_file.clone(),
            }))
        }
    }

    impl FtpSession for RecordingSession {
        fn upload(&mut self, local: &Path, remote_path: &str, progress: &mut dyn FnMut(u64)) -> anyhow::Result<u64> {
            if self.fail_file.as_deref() == Some(remote_path) {
                anyhow::bail!("550 permission denied");
            }
            let len = std::fs::metadata(local)?.len();
            progress(len);
            self.uploads.lock().expect("lock").push(remote_path.to_owned());
            Ok(len)
        }

        fn close(self: Box<Self>) -> anyhow::Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub fn tools(browser: FakeBrowser, images: FakeImages, ftp: RecordingFtp) -> (Tools, Arc<FakeBrowser>, Arc<FakeImages>, Arc<RecordingFtp>) {
        let browser = Arc::new(browser);
        let images = Arc::new(images);
        let ftp = Arc::new(ftp);
        let tools = Tools {
            browser: browser.clone(),
            images: images.clone(),
            ftp: ftp.clone(),
        };
        (tools, browser, images, ftp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_layers_run_assets_and_assemble_together() -> anyhow::Result<()> {
        let layers = Target::Build.graph().layers()?;
        assert_eq!(
            layers,
            vec![
                vec![Step::Styles, Step::Scripts, Step::Assemble],
                vec![Step::Thumbnails],
                vec![Step::PublishFlyoutThumbnails],
                vec![Step::CopySharedAssets],
                vec![Step::RewriteSharedUrls],
            ]
        );
        Ok(())
    }

    #[test]
    fn stage_cleans_first_and_packages_last() -> anyhow::Result<()> {
        let layers = Target::Stage.graph().layers()?;
        assert_eq!(layers.first(), Some(&vec![Step::Clean]));
        assert_eq!(layers.last(), Some(&vec![Step::Package]));
        Ok(())
    }

    #[test]
    fn deploy_uploads_archives_before_control_files() -> anyhow::Result<()> {
        let layers = Target::Deploy.graph().layers()?;
        assert_eq!(
            layers,
            vec![vec![Step::UploadArchives], vec![Step::UploadControlFiles]]
        );
        Ok(())
    }

    #[test]
    fn cycles_and_unknown_dependencies_are_rejected() {
        let cyclic = StageGraph::new()
            .step(Step::Assemble, &[Step::Thumbnails])
            .step(Step::Thumbnails, &[Step::Assemble]);
        assert!(cyclic.layers().is_err());

        let dangling = StageGraph::new().step(Step::Package, &[Step::Clean]);
        assert!(dangling.layers().is_err());
    }

    #[test]
    fn only_build_and_stage_are_deploying() {
        assert!(Target::Build.mode().deploying);
        assert!(Target::Stage.mode().deploying);
        assert!(!Target::Screenshots.mode().deploying);
        assert!(!Target::Assemble.mode().deploying);
    }

    #[test]
    fn deploy_requires_ftp_host_before_running() -> anyhow::Result<()> {
        let (_temp, config) = testing::project("clm:\n  key_messages:\n    - key_message: a\n")?;
        let err = Target::Deploy.validate(&config).expect_err("ftp host missing");
        assert!(matches!(err, PipelineError::Configuration { .. }));
        assert!(Target::StageVault.validate(&config).is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn clean_removes_dist_and_deploy() -> anyhow::Result<()> {
        let (temp, config) = testing::project("clm:\n  key_messages:\n    - key_message: a\n")?;
        crate::fsutil::write_file(&temp.path().join("build/a/a.html"), "x")?;
        crate::fsutil::write_file(&temp.path().join("deploy/a.zip"), "x")?;

        run_target(Target::Clean, config, Tools::from_env()).await?;
        assert!(!temp.path().join("build").exists());
        assert!(!temp.path().join("deploy").exists());
        Ok(())
    }

    #[tokio::test]
    async fn clean_outside_the_project_needs_force() -> anyhow::Result<()> {
        let outer = tempfile::TempDir::new()?;
        let project_dir = outer.path().join("project");
        crate::fsutil::write_file(
            &project_dir.join("configuration.yml"),
            "paths:\n  dist: ../elsewhere\nclm:\n  key_messages:\n    - key_message: a\n",
        )?;
        crate::fsutil::write_file(&outer.path().join("elsewhere/a/a.html"), "x")?;

        let config = BuildConfiguration::load(&project_dir, &Default::default())?;
        let err = run_target(Target::Clean, config.clone(), Tools::from_env())
            .await
            .expect_err("dist lies outside the project");
        assert!(format!("{err:#}").contains("use --force"));
        assert!(outer.path().join("elsewhere/a/a.html").exists());

        let forced = BuildConfiguration {
            force: true,
            ..config
        };
        run_target(Target::Clean, forced, Tools::from_env()).await?;
        assert!(!outer.path().join("elsewhere").exists());
        Ok(())
    }
}
