use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser as Chrome, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTouchEmulationEnabledParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, EventLifecycleEvent, GetLayoutMetricsParams,
    SetLifecycleEventsEnabledParams, Viewport as ClipRect,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::{Stream, StreamExt};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use url::Url;

use crate::error::PipelineError;
use crate::formats::{DeviceProfile, Viewport};

const NETWORK_IDLE: &str = "networkIdle";

/// Starts the one browser instance a stage shares across its pages.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> anyhow::Result<Box<dyn Browser>>;
}

#[async_trait]
pub trait Browser: Send + Sync {
    /// Open `url` in a fresh page emulating `device`, let the network settle
    /// and write a full-page PNG screenshot to `out`.
    async fn capture(&self, url: &Url, device: &DeviceProfile, out: &Path) -> anyhow::Result<()>;

    /// Consumes the browser; callers must let every capture settle first.
    async fn close(self: Box<Self>) -> anyhow::Result<()>;
}

/// `file://` URL for a built document with `fragment` attached.
pub fn document_url(path: &Path, fragment: &str) -> anyhow::Result<Url> {
    let mut url = Url::from_file_path(path)
        .map_err(|()| anyhow::anyhow!("not an absolute path: {}", path.display()))?;
    url.set_fragment(Some(fragment));
    Ok(url)
}

/// Headless Chrome driven over the DevTools protocol.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    /// Detected from the usual install locations when unset.
    pub bin: Option<PathBuf>,
    pub no_sandbox: bool,
    pub max_pages: usize,
    pub idle_timeout: Duration,
}

impl ChromeLauncher {
    pub fn from_env() -> Self {
        let max_pages = std::env::var("CLMKIT_BROWSER_PAGES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4);
        Self {
            bin: std::env::var_os("CLMKIT_CHROME_BIN").map(PathBuf::from),
            no_sandbox: std::env::var_os("CLMKIT_CHROME_NO_SANDBOX").is_some(),
            max_pages,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self) -> anyhow::Result<Box<dyn Browser>> {
        let profile = tempfile::Builder::new()
            .prefix("clmkit-browser-")
            .tempdir()
            .context("create browser profile dir")?;

        let mut builder = BrowserConfig::builder()
            .user_data_dir(profile.path())
            .arg("--allow-file-access-from-files")
            .arg("--hide-scrollbars");
        if let Some(bin) = &self.bin {
            builder = builder.chrome_executable(bin);
        }
        if self.no_sandbox {
            builder = builder.no_sandbox();
        }
        let config = builder
            .build()
            .map_err(|err| anyhow::anyhow!("configure headless chrome: {err}"))?;

        let (chrome, mut handler) = Chrome::launch(config)
            .await
            .context("start headless chrome; install Chromium or set CLMKIT_CHROME_BIN")?;
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    tracing::debug!("browser event: {err}");
                }
            }
        });
        tracing::debug!(max_pages = self.max_pages, "headless chrome started");

        Ok(Box::new(ChromeBrowser {
            chrome,
            events,
            profile,
            pages: Semaphore::new(self.max_pages.max(1)),
            idle_timeout: self.idle_timeout,
        }))
    }
}

pub struct ChromeBrowser {
    chrome: Chrome,
    events: JoinHandle<()>,
    profile: tempfile::TempDir,
    pages: Semaphore,
    idle_timeout: Duration,
}

impl ChromeBrowser {
    async fn render(
        &self,
        page: &Page,
        url: &Url,
        device: &DeviceProfile,
        out: &Path,
    ) -> anyhow::Result<()> {
        let viewport = &device.viewport;
        page.execute(SetDeviceMetricsOverrideParams::new(
            i64::from(viewport.width),
            i64::from(viewport.height),
            viewport.device_scale_factor,
            viewport.is_mobile,
        ))
        .await
        .context("emulate device metrics")?;
        page.execute(SetTouchEmulationEnabledParams::new(viewport.has_touch))
            .await
            .context("emulate touch")?;
        page.execute(SetUserAgentOverrideParams::new(device.user_agent.clone()))
            .await
            .context("set user agent")?;

        page.goto(url.as_str()).await.context("navigate")?;

        // Enabling lifecycle events replays the current document's state.
        let main_frame = page.mainframe().await.context("resolve main frame")?;
        let lifecycle = page
            .event_listener::<EventLifecycleEvent>()
            .await
            .context("listen for lifecycle events")?;
        page.execute(SetLifecycleEventsEnabledParams::new(true))
            .await
            .context("enable lifecycle events")?;
        let names = lifecycle.filter_map(move |event| {
            let name = main_frame
                .as_ref()
                .is_none_or(|frame| *frame == event.frame_id)
                .then(|| event.name.clone());
            futures::future::ready(name)
        });
        match tokio::time::timeout(self.idle_timeout, reached_network_idle(Box::pin(names))).await {
            Ok(true) => {}
            Ok(false) => anyhow::bail!("page went away before the network was idle"),
            Err(_) => tracing::warn!(url = %url, "network still busy; capturing anyway"),
        }

        let metrics = page
            .execute(GetLayoutMetricsParams::default())
            .await
            .context("read layout metrics")?;
        let content = &metrics.result.css_content_size;
        let clip = full_page_clip((content.width, content.height), viewport);

        let png = page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .clip(clip)
                    .capture_beyond_viewport(true)
                    .build(),
            )
            .await
            .context("take screenshot")?;
        tokio::fs::write(out, png)
            .await
            .map_err(|err| PipelineError::io(out, err))?;
        Ok(())
    }
}

async fn reached_network_idle<S>(mut names: S) -> bool
where
    S: Stream<Item = String> + Unpin,
{
    while let Some(name) = names.next().await {
        if name == NETWORK_IDLE {
            return true;
        }
    }
    false
}

/// Whole document, never smaller than the emulated viewport.
fn full_page_clip(content: (f64, f64), viewport: &Viewport) -> ClipRect {
    let (width, height) = content;
    ClipRect {
        x: 0.0,
        y: 0.0,
        width: width.max(f64::from(viewport.width)),
        height: height.max(f64::from(viewport.height)),
        scale: 1.0,
    }
}

#[async_trait]
impl Browser for ChromeBrowser {
    async fn capture(&self, url: &Url, device: &DeviceProfile, out: &Path) -> anyhow::Result<()> {
        let _permit = self
            .pages
            .acquire()
            .await
            .context("browser page semaphore is closed")?;
        tracing::debug!(url = %url, out = %out.display(), "capture");

        let page = self
            .chrome
            .new_page("about:blank")
            .await
            .context("open browser page")?;
        let rendered = self.render(&page, url, device, out).await;
        if let Err(err) = page.close().await {
            tracing::debug!(url = %url, "close page: {err}");
        }

        rendered.map_err(|err| {
            PipelineError::RenderCapture {
                url: url.to_string(),
                message: format!("{err:#}"),
            }
            .into()
        })
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        let ChromeBrowser {
            mut chrome,
            events,
            profile,
            ..
        } = *self;

        let closed = chrome.close().await;
        if let Err(err) = chrome.wait().await {
            tracing::debug!("wait for chrome: {err}");
        }
        events.abort();
        closed.context("close headless chrome")?;

        let dir = profile.path().to_path_buf();
        profile
            .close()
            .with_context(|| format!("remove browser profile: {}", dir.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_url_keeps_fragment_verbatim() -> anyhow::Result<()> {
        let url = document_url(Path::new("/tmp/a/a.html"), "page=1&event=open&screenshot")?;
        assert_eq!(url.as_str(), "file:///tmp/a/a.html#page=1&event=open&screenshot");
        assert!(document_url(Path::new("relative.html"), "x").is_err());
        Ok(())
    }

    #[test]
    fn clip_covers_content_taller_than_the_viewport() {
        let viewport = DeviceProfile::ipad_landscape().viewport;

        let clip = full_page_clip((1024.0, 2300.0), &viewport);
        assert_eq!((clip.width, clip.height), (1024.0, 2300.0));

        let clip = full_page_clip((300.0, 200.0), &viewport);
        assert_eq!((clip.width, clip.height), (1024.0, 768.0));
    }

    #[tokio::test]
    async fn network_idle_is_awaited_past_earlier_lifecycle_events() {
        let names = |list: &[&str]| {
            futures::stream::iter(list.iter().map(|n| (*n).to_owned()).collect::<Vec<_>>())
        };
        assert!(
            reached_network_idle(names(&["init", "load", "networkAlmostIdle", "networkIdle"]))
                .await
        );
        assert!(!reached_network_idle(names(&["init", "load"])).await);
    }
}
