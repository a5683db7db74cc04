use std::path::{Path, PathBuf};

use crate::config::Clm;
use crate::formats::DeployTarget;
use crate::fsutil::slash_path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunMode {
    /// Set for the `build`/`stage` targets: output is meant for packaging.
    pub deploying: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputNaming {
    /// No product configured, several key messages: slugs are used as-is.
    PlainSlug,
    SingleKeyMessage { key_message: String },
    /// Directories and primary documents carry `product.name + suffix`.
    ProductPrefixed {
        prefix: String,
        single_key_message: Option<String>,
    },
}

impl OutputNaming {
    pub fn resolve(clm: &Clm) -> Self {
        let single = match clm.key_messages.as_slice() {
            [only] => Some(only.key_message.clone()),
            _ => None,
        };

        match (clm.product.prefix(), single) {
            (Some(prefix), single_key_message) => Self::ProductPrefixed {
                prefix,
                single_key_message,
            },
            (None, Some(key_message)) => Self::SingleKeyMessage { key_message },
            (None, None) => Self::PlainSlug,
        }
    }

    fn prefix(&self) -> Option<&str> {
        match self {
            Self::ProductPrefixed { prefix, .. } => Some(prefix),
            _ => None,
        }
    }

    fn single_key_message(&self) -> Option<&str> {
        match self {
            Self::SingleKeyMessage { key_message } => Some(key_message),
            Self::ProductPrefixed {
                single_key_message, ..
            } => single_key_message.as_deref(),
            Self::PlainSlug => None,
        }
    }

    /// `product.name + suffix + slug` in its configured case; the slug alone
    /// without a product.
    pub fn display_name(&self, key_message: &str) -> String {
        match self.prefix() {
            Some(prefix) => format!("{prefix}{key_message}"),
            None => key_message.to_owned(),
        }
    }

    pub fn output_dir_name(&self, key_message: &str) -> String {
        match self.prefix() {
            Some(prefix) => format!("{prefix}{key_message}").to_lowercase(),
            None => key_message.to_owned(),
        }
    }

    /// Output directory for a rendered page whose template lives in
    /// `template_dir` (relative to the pages root).
    pub fn page_dir(&self, template_dir: &Path) -> PathBuf {
        let dir = match self.single_key_message() {
            Some(key_message) => PathBuf::from(key_message),
            None => template_dir.to_path_buf(),
        };
        self.prefixed_dir(&dir)
    }

    pub fn asset_dir(&self, rel_dir: &Path) -> PathBuf {
        self.prefixed_dir(rel_dir)
    }

    fn prefixed_dir(&self, dir: &Path) -> PathBuf {
        match self.prefix() {
            Some(prefix) if !dir.as_os_str().is_empty() => {
                PathBuf::from(format!("{prefix}{}", slash_path(dir)).to_lowercase())
            }
            _ => dir.to_path_buf(),
        }
    }

    /// File stem for a rendered page. With a product configured, templates
    /// named after a key message become `index` for vault packaging or take
    /// the prefixed directory name; without one every stem is kept.
    pub fn page_stem(
        &self,
        stem: &str,
        is_key_message: bool,
        target: DeployTarget,
        mode: RunMode,
    ) -> String {
        if !is_key_message || self.prefix().is_none() {
            return stem.to_owned();
        }
        if renames_to_index(target, mode) {
            return "index".to_owned();
        }
        self.output_dir_name(stem)
    }

    pub fn primary_document_stem(&self, dir_name: &str, target: DeployTarget, mode: RunMode) -> String {
        if self.prefix().is_some() && renames_to_index(target, mode) {
            "index".to_owned()
        } else {
            dir_name.to_owned()
        }
    }
}

fn renames_to_index(target: DeployTarget, mode: RunMode) -> bool {
    mode.deploying && target == DeployTarget::Vault
}
