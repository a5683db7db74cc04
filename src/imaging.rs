use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use printpdf::{Image, ImageTransform, Mm};

use crate::error::PipelineError;
use crate::formats::{PdfDocument, ThumbnailSize};

const POINTS_PER_INCH: f32 = 72.0;

#[async_trait]
pub trait ImageConverter: Send + Sync {
    async fn resize(&self, input: &Path, output: &Path, size: &ThumbnailSize) -> anyhow::Result<()>;

    /// One page per image, in the given order.
    async fn compose_pdf(
        &self,
        pages: &[PathBuf],
        document: &PdfDocument,
        output: &Path,
    ) -> anyhow::Result<()>;
}

/// In-process raster work, run on the blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterImages;

#[async_trait]
impl ImageConverter for RasterImages {
    async fn resize(&self, input: &Path, output: &Path, size: &ThumbnailSize) -> anyhow::Result<()> {
        tracing::debug!(input = %input.display(), output = %output.display(), "resize");
        let input = input.to_path_buf();
        let output = output.to_path_buf();
        let size = size.clone();
        tokio::task::spawn_blocking(move || resize_blocking(&input, &output, &size))
            .await
            .context("join resize task")?
    }

    async fn compose_pdf(
        &self,
        pages: &[PathBuf],
        document: &PdfDocument,
        output: &Path,
    ) -> anyhow::Result<()> {
        tracing::info!(pages = pages.len(), out = %output.display(), "compose pdf");
        let pages = pages.to_vec();
        let document = *document;
        let output = output.to_path_buf();
        tokio::task::spawn_blocking(move || compose_pdf_blocking(&pages, &document, &output))
            .await
            .context("join pdf task")?
    }
}

fn conversion_error(input: &Path, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::ImageConversion {
        input: input.to_path_buf(),
        message: err.to_string(),
    }
}

/// Fits the image inside `width x height`, keeping its aspect ratio.
fn resize_blocking(input: &Path, output: &Path, size: &ThumbnailSize) -> anyhow::Result<()> {
    let source = image::open(input).map_err(|err| conversion_error(input, err))?;
    let resized = source.resize(size.width, size.height, FilterType::Lanczos3);

    if matches!(ImageFormat::from_path(output), Ok(ImageFormat::Jpeg)) {
        let file = File::create(output).map_err(|err| PipelineError::io(output, err))?;
        let mut writer = BufWriter::new(file);
        JpegEncoder::new_with_quality(&mut writer, size.quality)
            .encode_image(&resized.to_rgb8())
            .map_err(|err| conversion_error(input, err))?;
    } else {
        resized
            .save(output)
            .map_err(|err| conversion_error(input, err))?;
    }
    Ok(())
}

/// Page units are points; each screenshot is fitted into the margin box and
/// pinned to its top-left corner.
fn compose_pdf_blocking(
    pages: &[PathBuf],
    document: &PdfDocument,
    output: &Path,
) -> anyhow::Result<()> {
    let (first, rest) = pages
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("pdf needs at least one page"))?;
    let (page_width, page_height) = document.page_size();
    let (page_width, page_height) = (page_width as f32, page_height as f32);
    let title = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("screenshots");

    let (doc, page, layer) =
        printpdf::PdfDocument::new(title, to_mm(page_width), to_mm(page_height), "screenshot");
    let mut targets = vec![(page, layer)];
    for _ in rest {
        targets.push(doc.add_page(to_mm(page_width), to_mm(page_height), "screenshot"));
    }

    for (path, (page, layer)) in pages.iter().zip(targets) {
        let screenshot = image::open(path).map_err(|err| conversion_error(path, err))?;
        let (width, height) = (screenshot.width() as f32, screenshot.height() as f32);
        let scale = fit_scale((width, height), document.image_box());
        let top = page_height - document.margins.top as f32 - height * scale;

        Image::from_dynamic_image(&DynamicImage::ImageRgb8(screenshot.to_rgb8())).add_to_layer(
            doc.get_page(page).get_layer(layer),
            ImageTransform {
                translate_x: Some(to_mm(document.margins.left as f32)),
                translate_y: Some(to_mm(top)),
                scale_x: Some(scale),
                scale_y: Some(scale),
                dpi: Some(POINTS_PER_INCH),
                ..ImageTransform::default()
            },
        );
        tracing::debug!(page = %path.display(), scale, "placed");
    }

    let file = File::create(output).map_err(|err| PipelineError::io(output, err))?;
    doc.save(&mut BufWriter::new(file))
        .map_err(|err| conversion_error(first, format!("write pdf: {err:?}")))?;
    Ok(())
}

fn to_mm(points: f32) -> Mm {
    Mm(points * 25.4 / POINTS_PER_INCH)
}

fn fit_scale(image: (f32, f32), bounds: (u32, u32)) -> f32 {
    let (width, height) = image;
    if width <= 0.0 || height <= 0.0 {
        return 1.0;
    }
    (bounds.0 as f32 / width).min(bounds.1 as f32 / height)
}
