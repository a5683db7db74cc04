use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::error::{PipelineError, TransferFailure};
use crate::formats::FtpSettings;
use crate::fsutil;
use crate::pipeline::StageContext;

const CONTROL_FILE_DIR: &str = "ctlfile";

pub trait FtpConnector: Send + Sync {
    fn connect(&self, settings: &FtpSettings) -> anyhow::Result<Box<dyn FtpSession>>;
}

pub trait FtpSession: Send {
    /// Store `local` at `remote_path`, reporting cumulative bytes sent.
    fn upload(
        &mut self,
        local: &Path,
        remote_path: &str,
        progress: &mut dyn FnMut(u64),
    ) -> anyhow::Result<u64>;

    fn close(self: Box<Self>) -> anyhow::Result<()>;
}

/// Remote directory a batch of files lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDir {
    Root,
    ControlFiles,
}

impl RemoteDir {
    pub fn remote_path(self, file_name: &str) -> String {
        match self {
            RemoteDir::Root => file_name.to_owned(),
            RemoteDir::ControlFiles => format!("{CONTROL_FILE_DIR}/{file_name}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub uploaded: Vec<String>,
    pub bytes: u64,
}

/// Upload `files` sequentially over one session. Every file is attempted;
/// failures are collected and reported together after the session closed.
pub fn upload_files(
    connector: &dyn FtpConnector,
    settings: &FtpSettings,
    files: &[PathBuf],
    remote_dir: RemoteDir,
    verbose: bool,
) -> Result<TransferReport, PipelineError> {
    let mut session = connector.connect(settings).map_err(|err| {
        PipelineError::RemoteTransfer {
            failures: vec![TransferFailure {
                file: "<session>".to_owned(),
                message: format!("{err:#}"),
            }],
        }
    })?;

    let mut report = TransferReport::default();
    let mut failures = Vec::new();
    for local in files {
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| local.display().to_string());
        let remote = remote_dir.remote_path(&name);

        let mut progress = |sent: u64| {
            if verbose {
                tracing::info!(file = %name, bytes = sent, "transferred");
            } else {
                tracing::debug!(file = %name, bytes = sent, "transferred");
            }
        };
        match session.upload(local, &remote, &mut progress) {
            Ok(bytes) => {
                tracing::info!(file = %name, remote = %remote, bytes, "uploaded");
                report.bytes += bytes;
                report.uploaded.push(remote);
            }
            Err(err) => {
                tracing::error!(file = %name, "upload failed: {err:#}");
                failures.push(TransferFailure {
                    file: name,
                    message: format!("{err:#}"),
                });
            }
        }
    }

    if let Err(err) = session.close() {
        failures.push(TransferFailure {
            file: "<session>".to_owned(),
            message: format!("close: {err:#}"),
        });
    }

    if !failures.is_empty() {
        return Err(PipelineError::RemoteTransfer { failures });
    }
    Ok(report)
}

pub async fn upload_archives(ctx: &StageContext) -> anyhow::Result<()> {
    upload_with_extension(ctx, "zip", RemoteDir::Root).await
}

pub async fn upload_control_files(ctx: &StageContext) -> anyhow::Result<()> {
    upload_with_extension(ctx, "ctl", RemoteDir::ControlFiles).await
}

async fn upload_with_extension(
    ctx: &StageContext,
    extension: &str,
    remote_dir: RemoteDir,
) -> anyhow::Result<()> {
    let deploy_dir = ctx.config.deploy_dir();
    if !deploy_dir.is_dir() {
        return Err(PipelineError::config(format!(
            "nothing staged: {} does not exist (run `stage` first)",
            deploy_dir.display()
        ))
        .into());
    }

    let files: Vec<PathBuf> = fsutil::list_file_names(&deploy_dir)?
        .into_iter()
        .filter(|name| fsutil::has_extension(Path::new(name), &[extension]))
        .map(|name| deploy_dir.join(name))
        .collect();
    if files.is_empty() {
        tracing::warn!(extension, dir = %deploy_dir.display(), "no files to upload");
        return Ok(());
    }

    tracing::info!(files = files.len(), ?remote_dir, "deploying");
    let connector = ctx.tools.ftp.clone();
    let settings = ctx.config.ftp.clone();
    let verbose = ctx.config.verbose;
    let report = tokio::task::spawn_blocking(move || {
        upload_files(connector.as_ref(), &settings, &files, remote_dir, verbose)
    })
    .await
    .context("join upload task")??;

    tracing::info!(files = report.uploaded.len(), bytes = report.bytes, "deployed");
    Ok(())
}

/// FTP (optionally explicit TLS) through `suppaftp`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuppaFtpConnector;

impl FtpConnector for SuppaFtpConnector {
    fn connect(&self, settings: &FtpSettings) -> anyhow::Result<Box<dyn FtpSession>> {
        let host = settings
            .host
            .as_deref()
            .ok_or_else(|| PipelineError::config("ftp.host is required"))?;
        let addr = format!("{host}:{}", settings.port());
        tracing::debug!(%addr, secure = settings.secure, "connecting");

        let mut stream = suppaftp::NativeTlsFtpStream::connect(&addr)
            .with_context(|| format!("connect {addr}"))?;
        if settings.secure {
            // Self-signed server certificates are accepted.
            let tls = suppaftp::native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .context("build tls connector")?;
            stream = stream
                .into_secure(suppaftp::NativeTlsConnector::from(tls), host)
                .context("upgrade to tls")?;
        }

        stream
            .login(
                settings.user.as_deref().unwrap_or_default(),
                settings.pass.as_deref().unwrap_or_default(),
            )
            .context("login")?;
        stream
            .transfer_type(suppaftp::types::FileType::Binary)
            .context("set binary transfer")?;

        Ok(Box::new(SuppaFtpSession { stream }))
    }
}

struct SuppaFtpSession {
    stream: suppaftp::NativeTlsFtpStream,
}

impl FtpSession for SuppaFtpSession {
    fn upload(
        &mut self,
        local: &Path,
        remote_path: &str,
        progress: &mut dyn FnMut(u64),
    ) -> anyhow::Result<u64> {
        let file = File::open(local).map_err(|err| PipelineError::io(local, err))?;
        let mut reader = ProgressReader {
            inner: file,
            sent: 0,
            progress,
        };
        let bytes = self
            .stream
            .put_file(remote_path, &mut reader)
            .with_context(|| format!("put {remote_path}"))?;
        Ok(bytes)
    }

    fn close(mut self: Box<Self>) -> anyhow::Result<()> {
        self.stream.quit().context("quit")?;
        Ok(())
    }
}

struct ProgressReader<'a, R> {
    inner: R,
    sent: u64,
    progress: &'a mut dyn FnMut(u64),
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.sent += n as u64;
            (self.progress)(self.sent);
        }
        Ok(n)
    }
}
