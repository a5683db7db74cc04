use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::formats::{
    Crm, DeviceProfile, FtpSettings, Job, KeyMessage, PdfDocument, Product, ThumbnailSizes,
};

const LOCAL_CONFIG_FILE: &str = "configuration.yml";
const CLM_CONFIG_FILE: &str = "clm.yml";

const DEFAULT_CONFIG: &str = r#"
paths:
  src: app
  dist: build
  tmp: .tmp
  sharedAssets: shared
  deploy: deploy
  pages: templates/pages
  layouts: templates/layouts
  includes: templates/includes
  data: templates/data
  root: /
  screenshots: screenshots
module:
  workflow:
    assemble:
      defaultLayout: default
clm:
  key_messages: []
  thumbnail_sizes:
    full:
      width: 1024
      height: 768
      name: full.jpg
      quality: 75
    thumb:
      width: 1024
      height: 768
      name: thumb.jpg
      quality: 55
verbose: false
debug: false
force: false
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfiguration {
    /// Directory every relative path in `paths` is resolved against.
    #[serde(skip)]
    pub project_dir: PathBuf,
    pub paths: Paths,
    pub clm: Clm,
    #[serde(default)]
    pub ftp: FtpSettings,
    #[serde(default)]
    pub module: ModuleSettings,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paths {
    pub src: String,
    pub dist: String,
    pub tmp: String,
    #[serde(rename = "sharedAssets")]
    pub shared_assets: String,
    pub deploy: String,
    pub pages: String,
    pub layouts: String,
    pub includes: String,
    pub data: String,
    /// URL root the templates use for absolute shared-asset references.
    pub root: String,
    pub screenshots: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clm {
    pub key_messages: Vec<KeyMessage>,
    #[serde(default)]
    pub product: Product,
    #[serde(default)]
    pub crm: Crm,
    #[serde(default)]
    pub thumbnail_sizes: ThumbnailSizes,
    #[serde(default)]
    pub pdf_document: PdfDocument,
    #[serde(default)]
    pub job: Job,
    #[serde(default)]
    pub device: Option<DeviceProfile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleSettings {
    #[serde(default)]
    pub workflow: WorkflowSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default)]
    pub assemble: AssembleSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembleSettings {
    #[serde(rename = "defaultLayout")]
    pub default_layout: String,
}

impl Default for AssembleSettings {
    fn default() -> Self {
        Self {
            default_layout: "default".to_owned(),
        }
    }
}

/// Flags the command line layers over whatever the files say.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_file: Option<PathBuf>,
    pub verbose: bool,
    pub debug: bool,
    pub force: bool,
}

impl BuildConfiguration {
    /// Merge defaults, the project's `configuration.yml` and the CLM data file.
    pub fn load(project_dir: &Path, overrides: &Overrides) -> anyhow::Result<Self> {
        let project_dir = &std::path::absolute(project_dir)
            .with_context(|| format!("resolve project dir: {}", project_dir.display()))?;
        let mut merged: serde_yaml::Value =
            serde_yaml::from_str(DEFAULT_CONFIG).context("parse built-in defaults")?;

        let local_path = match &overrides.config_file {
            Some(path) => project_dir.join(path),
            None => project_dir.join(LOCAL_CONFIG_FILE),
        };
        match read_yaml(&local_path)? {
            Some(local) => merge_yaml(&mut merged, local),
            None if overrides.config_file.is_some() => {
                return Err(PipelineError::config(format!(
                    "config file not found: {}",
                    local_path.display()
                ))
                .into());
            }
            None => tracing::debug!(path = %local_path.display(), "no local configuration"),
        }

        let clm_path = clm_data_path(project_dir, &merged);
        if let Some(clm) = read_yaml(&clm_path)? {
            let mut wrapped = serde_yaml::Mapping::new();
            wrapped.insert(serde_yaml::Value::from("clm"), clm);
            merge_yaml(&mut merged, serde_yaml::Value::Mapping(wrapped));
        }

        let mut config: BuildConfiguration = serde_yaml::from_value(merged)
            .map_err(|err| PipelineError::config(format!("invalid configuration: {err}")))?;
        config.project_dir = project_dir.to_path_buf();
        config.verbose |= overrides.verbose;
        config.debug |= overrides.debug;
        config.force |= overrides.force;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.clm.key_messages.is_empty() {
            return Err(PipelineError::config(
                "clm.key_messages must list at least one key message",
            ));
        }

        let mut seen = HashSet::new();
        for km in &self.clm.key_messages {
            if km.key_message.trim().is_empty() {
                return Err(PipelineError::config("key_message slug must not be empty"));
            }
            if km.key_message.contains(['/', '\\']) {
                return Err(PipelineError::config(format!(
                    "key_message slug must not contain path separators: {}",
                    km.key_message
                )));
            }
            if !seen.insert(km.key_message.as_str()) {
                return Err(PipelineError::config(format!(
                    "duplicate key_message slug: {}",
                    km.key_message
                )));
            }
        }

        Ok(())
    }

    pub fn require_ftp(&self) -> Result<(), PipelineError> {
        if self.ftp.host.as_deref().is_none_or(str::is_empty) {
            return Err(PipelineError::config("ftp.host is required"));
        }
        if self.ftp.user.as_deref().is_none_or(str::is_empty) {
            return Err(PipelineError::config("ftp.user is required"));
        }
        Ok(())
    }

    pub fn src_dir(&self) -> PathBuf {
        self.project_dir.join(&self.paths.src)
    }

    pub fn dist_dir(&self) -> PathBuf {
        self.project_dir.join(&self.paths.dist)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.project_dir.join(&self.paths.tmp)
    }

    pub fn deploy_dir(&self) -> PathBuf {
        self.project_dir.join(&self.paths.deploy)
    }

    pub fn shared_assets_dir(&self) -> PathBuf {
        self.dist_dir().join(&self.paths.shared_assets)
    }

    pub fn pages_dir(&self) -> PathBuf {
        self.src_dir().join(&self.paths.pages)
    }

    pub fn layouts_dir(&self) -> PathBuf {
        self.src_dir().join(&self.paths.layouts)
    }

    pub fn includes_dir(&self) -> PathBuf {
        self.src_dir().join(&self.paths.includes)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.src_dir().join(&self.paths.data)
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.src_dir().join("assets")
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.project_dir.join(&self.paths.screenshots)
    }

    pub fn device(&self) -> DeviceProfile {
        self.clm
            .device
            .clone()
            .unwrap_or_else(DeviceProfile::ipad_landscape)
    }
}

fn clm_data_path(project_dir: &Path, merged: &serde_yaml::Value) -> PathBuf {
    let path_of = |key: &str, fallback: &str| {
        merged
            .get("paths")
            .and_then(|paths| paths.get(key))
            .and_then(serde_yaml::Value::as_str)
            .unwrap_or(fallback)
            .to_owned()
    };
    project_dir
        .join(path_of("src", "app"))
        .join(path_of("data", "templates/data"))
        .join(CLM_CONFIG_FILE)
}

fn read_yaml(path: &Path) -> anyhow::Result<Option<serde_yaml::Value>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(PipelineError::io(path, err).into()),
    };
    let value: serde_yaml::Value = serde_yaml::from_str(&contents).map_err(|err| {
        PipelineError::config(format!("parse {}: {err}", path.display()))
    })?;
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(value))
}

/// Mappings merge key by key; anything else in `overlay` replaces `base`.
pub fn merge_yaml(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::DeployTarget;

    fn write(path: &Path, contents: &str) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    #[test]
    fn merges_defaults_local_config_and_clm_file() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        write(
            &temp.path().join("configuration.yml"),
            "paths:\n  dist: out\nftp:\n  host: ftp.example.com\n  user: deployer\nclm:\n  product:\n    name: Prod\n",
        )?;
        write(
            &temp.path().join("app/templates/data/clm.yml"),
            "key_messages:\n  - key_message: intro\n    slides: [{}]\ncrm:\n  deploy_to: vault\n",
        )?;

        let config = BuildConfiguration::load(temp.path(), &Overrides::default())?;
        assert_eq!(config.paths.dist, "out");
        assert_eq!(config.paths.shared_assets, "shared");
        assert_eq!(config.clm.product.name.as_deref(), Some("Prod"));
        assert_eq!(config.clm.crm.deploy_to, DeployTarget::Vault);
        assert_eq!(config.clm.key_messages[0].key_message, "intro");
        assert_eq!(config.dist_dir(), temp.path().join("out"));
        assert_eq!(config.ftp.port(), 21);
        Ok(())
    }

    #[test]
    fn rejects_duplicate_key_messages() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        write(
            &temp.path().join("configuration.yml"),
            "clm:\n  key_messages:\n    - key_message: a\n    - key_message: a\n",
        )?;
        let err = BuildConfiguration::load(temp.path(), &Overrides::default())
            .expect_err("duplicate slugs must fail");
        assert!(format!("{err:#}").contains("duplicate key_message slug: a"));
        Ok(())
    }

    #[test]
    fn rejects_unknown_deploy_target() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        write(
            &temp.path().join("configuration.yml"),
            "clm:\n  key_messages:\n    - key_message: a\n  crm:\n    deploy_to: s3\n",
        )?;
        let err = BuildConfiguration::load(temp.path(), &Overrides::default())
            .expect_err("unknown target must fail");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Configuration { .. })
        ));
        Ok(())
    }

    #[test]
    fn overrides_win_over_file_flags() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        write(
            &temp.path().join("configuration.yml"),
            "verbose: false\nclm:\n  key_messages:\n    - key_message: a\n",
        )?;
        let overrides = Overrides {
            verbose: true,
            ..Overrides::default()
        };
        let config = BuildConfiguration::load(temp.path(), &overrides)?;
        assert!(config.verbose);
        assert!(config.require_ftp().is_err());
        Ok(())
    }

    #[test]
    fn partial_thumbnail_size_keeps_remaining_defaults() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        write(
            &temp.path().join("configuration.yml"),
            "clm:\n  key_messages:\n    - key_message: a\n",
        )?;
        write(
            &temp.path().join("app/templates/data/clm.yml"),
            "thumbnail_sizes:\n  thumb:\n    width: 200\n    height: 150\n",
        )?;

        let config = BuildConfiguration::load(temp.path(), &Overrides::default())?;
        let sizes = &config.clm.thumbnail_sizes;
        assert_eq!((sizes.thumb.width, sizes.thumb.height), (200, 150));
        assert_eq!(sizes.thumb.name, "thumb.jpg");
        assert_eq!(sizes.thumb.quality, 55);
        assert_eq!(sizes.full, crate::formats::ThumbnailSizes::default().full);
        Ok(())
    }

    #[test]
    fn merge_replaces_sequences_instead_of_concatenating() -> anyhow::Result<()> {
        let mut base: serde_yaml::Value = serde_yaml::from_str("a: [1, 2]\nb: {c: 1, d: 2}")?;
        merge_yaml(&mut base, serde_yaml::from_str("a: [3]\nb: {d: 5}")?);
        let expected: serde_yaml::Value = serde_yaml::from_str("a: [3]\nb: {c: 1, d: 5}")?;
        assert_eq!(base, expected);
        Ok(())
    }
}
