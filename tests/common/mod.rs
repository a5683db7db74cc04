#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use clmkit::browser::{Browser, BrowserLauncher};
use clmkit::deploy::{FtpConnector, FtpSession};
use clmkit::formats::{DeviceProfile, FtpSettings, PdfDocument, ThumbnailSize};
use clmkit::imaging::ImageConverter;
use clmkit::pipeline::Tools;
use url::Url;

pub fn write(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

#[derive(Default)]
pub struct Recorder {
    pub captures: Mutex<Vec<String>>,
    pub browser_closes: AtomicUsize,
    pub resized: Mutex<Vec<PathBuf>>,
    pub pdf_pages: Mutex<Vec<PathBuf>>,
    pub uploads: Mutex<Vec<String>>,
    pub sessions_closed: AtomicUsize,
}

impl Recorder {
    pub fn tools(self: &Arc<Self>) -> Tools {
        Tools {
            browser: Arc::new(StubLauncher(Arc::clone(self))),
            images: Arc::new(StubImages(Arc::clone(self))),
            ftp: Arc::new(StubFtp(Arc::clone(self))),
        }
    }

    pub fn closes(&self) -> usize {
        self.browser_closes.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().expect("lock uploads").clone()
    }
}

struct StubLauncher(Arc<Recorder>);
struct StubBrowser(Arc<Recorder>);

#[async_trait]
impl BrowserLauncher for StubLauncher {
    async fn launch(&self) -> anyhow::Result<Box<dyn Browser>> {
        Ok(Box::new(StubBrowser(Arc::clone(&self.0))))
    }
}

#[async_trait]
impl Browser for StubBrowser {
    async fn capture(&self, url: &Url, _device: &DeviceProfile, out: &Path) -> anyhow::Result<()> {
        self.0
            .captures
            .lock()
            .expect("lock captures")
            .push(url.to_string());
        write(out, "png")
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        self.0.browser_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct StubImages(Arc<Recorder>);

#[async_trait]
impl ImageConverter for StubImages {
    async fn resize(&self, input: &Path, output: &Path, _size: &ThumbnailSize) -> anyhow::Result<()> {
        std::fs::copy(input, output)?;
        self.0
            .resized
            .lock()
            .expect("lock resized")
            .push(output.to_path_buf());
        Ok(())
    }

    async fn compose_pdf(
        &self,
        pages: &[PathBuf],
        _document: &PdfDocument,
        output: &Path,
    ) -> anyhow::Result<()> {
        self.0
            .pdf_pages
            .lock()
            .expect("lock pdf pages")
            .extend(pages.iter().cloned());
        write(output, "%PDF-1.4")
    }
}

struct StubFtp(Arc<Recorder>);
struct StubSession(Arc<Recorder>);

impl FtpConnector for StubFtp {
    fn connect(&self, settings: &FtpSettings) -> anyhow::Result<Box<dyn FtpSession>> {
        anyhow::ensure!(settings.host.is_some(), "no host");
        Ok(Box::new(StubSession(Arc::clone(&self.0))))
    }
}

impl FtpSession for StubSession {
    fn upload(
        &mut self,
        local: &Path,
        remote_path: &str,
        progress: &mut dyn FnMut(u64),
    ) -> anyhow::Result<u64> {
        let len = std::fs::metadata(local)?.len();
        progress(len);
        self.0
            .uploads
            .lock()
            .expect("lock uploads")
            .push(remote_path.to_owned());
        Ok(len)
    }

    fn close(self: Box<Self>) -> anyhow::Result<()> {
        self.0.sessions_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
