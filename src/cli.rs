use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::pipeline::Target;

#[derive(Debug, Parser)]
#[command(author, version, about = "Build, package and deploy CLM presentations")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Project directory; every configured path is relative to it.
    #[arg(long, global = true, default_value = ".")]
    pub cwd: PathBuf,

    /// Configuration file, relative to the project directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Per-file detail in the logs.
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Debug logging (unless RUST_LOG is set).
    #[arg(long, global = true)]
    pub debug: bool,

    /// Let `clean` remove directories outside the project.
    #[arg(long, global = true)]
    pub force: bool,
}

#[derive(Debug, Clone, Copy, Subcommand)]
pub enum Command {
    /// Render templates into one directory per key message.
    Assemble,
    /// Copy the shared assets into every key message.
    CopySharedAssets,
    /// Release build: styles, scripts, assemble, thumbnails, shared assets.
    Build,
    /// Screenshot every built key message into full/thumb images.
    VeevaThumbs,
    /// Upload staged archives, then control files, over FTP.
    Deploy,
    /// Clean, build and package every key message into the deploy directory.
    Stage,
    /// Write the Vault import sheet.
    StageVault,
    /// Render every slide state and compose the proof PDF.
    Screenshots,
    /// Compile stylesheets for local preview.
    #[command(alias = "sass:dev")]
    SassDev,
    /// Bundle scripts for local preview.
    #[command(alias = "scripts:dev")]
    ScriptsDev,
    /// Collect page images for local preview.
    #[command(alias = "images:dev")]
    ImagesDev,
    /// Assemble plus the three preview asset stages.
    Dev,
    /// Remove the dist and deploy directories.
    Clean,
}

impl Command {
    pub fn target(self) -> Target {
        match self {
            Command::Assemble => Target::Assemble,
            Command::CopySharedAssets => Target::CopySharedAssets,
            Command::Build => Target::Build,
            Command::VeevaThumbs => Target::VeevaThumbs,
            Command::Deploy => Target::Deploy,
            Command::Stage => Target::Stage,
            Command::StageVault => Target::StageVault,
            Command::Screenshots => Target::Screenshots,
            Command::SassDev => Target::SassDev,
            Command::ScriptsDev => Target::ScriptsDev,
            Command::ImagesDev => Target::ImagesDev,
            Command::Dev => Target::Dev,
            Command::Clean => Target::Clean,
        }
    }
}
