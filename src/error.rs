use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Required configuration is missing or malformed.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Template, layout, partial or helper failure while assembling.
    #[error("render error in {template}: {message}")]
    Render { template: PathBuf, message: String },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// One or more FTP uploads (or the session itself) failed.
    #[error("remote transfer failed for {} file(s): {}", failures.len(), summarize(failures))]
    RemoteTransfer { failures: Vec<TransferFailure> },

    /// Headless browser navigation or screenshot failure.
    #[error("capture failed for {url}: {message}")]
    RenderCapture { url: String, message: String },

    #[error("image conversion failed for {}: {message}", input.display())]
    ImageConversion { input: PathBuf, message: String },
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    /// Local file name, or `<session>` when the connection itself failed.
    pub file: String,
    pub message: String,
}

fn summarize(failures: &[TransferFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.file, f.message))
        .collect::<Vec<_>>()
        .join(", ")
}
