//! Local PDF text extractor and page rasterizer (§1 external collaborator,
//! given a working implementation here on top of `pdfium-render`).
//!
//! Carried over from the donor crate's rendering pipeline: pdfium state is
//! not `Send` across await points, so every call runs inside
//! `tokio::task::spawn_blocking`, matching `pipeline::render::render_pages`
//! in the donor. This module additionally extracts per-page text (the donor
//! only rasterized; the distributed pipeline needs both the MuPDF fallback
//! text and the AI-dispatch image for every page).

pub mod docconv;

use crate::error::ServiceError;
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;
use pdfium_render::prelude::*;
use tracing::{debug, warn};

/// Per-page local-extractor output: the text pdfium could read directly from
/// the page's content stream.
#[derive(Debug, Clone)]
pub struct ExtractedPage {
    pub page_id: usize, // 1-based
    pub text: String,
}

/// Render one page to JPEG bytes, at `dpi`/`quality`, returning
/// `(jpeg_bytes, width, height)`.
pub struct RenderedPage {
    pub page_id: usize,
    pub jpeg_bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

fn bind_pdfium() -> Result<Pdfium, ServiceError> {
    pdfium_auto::bind_pdfium_silent().map_err(|e| ServiceError::PdfiumBindingFailed(e.to_string()))
}

/// Extract per-page text for every page in the document.
pub async fn extract_all_text(
    pdf_bytes: Vec<u8>,
    password: Option<String>,
) -> Result<Vec<ExtractedPage>, ServiceError> {
    tokio::task::spawn_blocking(move || extract_all_text_blocking(&pdf_bytes, password.as_deref()))
        .await
        .map_err(|e| ServiceError::Internal(format!("extraction task panicked: {e}")))?
}

fn extract_all_text_blocking(pdf_bytes: &[u8], password: Option<&str>) -> Result<Vec<ExtractedPage>, ServiceError> {
    let pdfium = bind_pdfium()?;
    let document = load_document(&pdfium, pdf_bytes, password)?;
    let pages = document.pages();
    let total = pages.len();
    debug!(total_pages = total, "extracting page text");

    let mut out = Vec::with_capacity(total as usize);
    for idx in 0..total {
        let page = pages.get(idx).map_err(|e| ServiceError::RasterisationFailed {
            key: "<in-memory>".to_string(),
            page: idx as usize + 1,
            detail: format!("{e:?}"),
        })?;
        let text = page.text().map(|t| t.all()).unwrap_or_default();
        out.push(ExtractedPage {
            page_id: idx as usize + 1,
            text,
        });
    }
    Ok(out)
}

/// Render the given 1-based page numbers to JPEG at `dpi`/`quality`.
pub async fn render_pages(
    pdf_bytes: Vec<u8>,
    password: Option<String>,
    page_ids: Vec<usize>,
    dpi: u32,
    quality: u8,
) -> Result<Vec<RenderedPage>, ServiceError> {
    tokio::task::spawn_blocking(move || {
        render_pages_blocking(&pdf_bytes, password.as_deref(), &page_ids, dpi, quality)
    })
    .await
    .map_err(|e| ServiceError::Internal(format!("render task panicked: {e}")))?
}

fn render_pages_blocking(
    pdf_bytes: &[u8],
    password: Option<&str>,
    page_ids: &[usize],
    dpi: u32,
    quality: u8,
) -> Result<Vec<RenderedPage>, ServiceError> {
    let pdfium = bind_pdfium()?;
    let document = load_document(&pdfium, pdf_bytes, password)?;
    let pages = document.pages();
    let total = pages.len();

    // Scale pixel dimensions from DPI assuming a standard 72 DPI PDF unit base.
    let scale = dpi as f32 / 72.0;
    let render_config = PdfRenderConfig::new().scale_page_by_factor(scale);

    let mut out = Vec::with_capacity(page_ids.len());
    for &page_id in page_ids {
        if page_id == 0 || page_id as u16 > total {
            warn!(page_id, total, "skipping out-of-range page during render");
            continue;
        }
        let idx = (page_id - 1) as u16;
        let page = pages.get(idx).map_err(|e| ServiceError::RasterisationFailed {
            key: "<in-memory>".to_string(),
            page: page_id,
            detail: format!("{e:?}"),
        })?;
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| ServiceError::RasterisationFailed {
                key: "<in-memory>".to_string(),
                page: page_id,
                detail: format!("{e:?}"),
            })?;
        let image = bitmap.as_image().to_rgb8();
        let (width, height) = (image.width(), image.height());

        let mut jpeg_bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg_bytes, quality)
            .encode(image.as_raw(), width, height, ColorType::Rgb8.into())
            .map_err(|e| ServiceError::RasterisationFailed {
                key: "<in-memory>".to_string(),
                page: page_id,
                detail: format!("jpeg encode failed: {e}"),
            })?;

        out.push(RenderedPage {
            page_id,
            jpeg_bytes,
            width,
            height,
        });
    }
    Ok(out)
}

fn load_document<'a>(
    pdfium: &'a Pdfium,
    pdf_bytes: &[u8],
    password: Option<&str>,
) -> Result<PdfDocument<'a>, ServiceError> {
    pdfium
        .load_pdf_from_byte_slice(pdf_bytes, password)
        .map_err(|e| {
            let err_str = format!("{e:?}");
            if err_str.contains("Password") || err_str.contains("password") {
                ServiceError::PasswordRequired {
                    key: "<in-memory>".to_string(),
                }
            } else {
                ServiceError::CorruptPdf {
                    key: "<in-memory>".to_string(),
                    detail: err_str,
                }
            }
        })
}

/// Compute a document-level extractable-text flag by sampling pages (first,
/// middle, last, plus 1-2 random if >= 6 pages; up to 5 total) and
/// thresholding on total whitespace-stripped character count (§4.4.1 phase 2).
pub fn has_extractable_text(pages: &[ExtractedPage], threshold: usize) -> bool {
    let total = pages.len();
    if total == 0 {
        return false;
    }
    let mut sample_indices: Vec<usize> = vec![0, total / 2, total - 1];
    if total >= 6 {
        // Deterministic "pseudo-random" picks based on position, keeping the
        // sampler reproducible for tests instead of pulling in an RNG here.
        sample_indices.push((total * 2 / 7).min(total - 1));
        sample_indices.push((total * 5 / 7).min(total - 1));
    }
    sample_indices.sort_unstable();
    sample_indices.dedup();
    sample_indices.truncate(5);

    let stripped_len: usize = sample_indices
        .iter()
        .filter_map(|&i| pages.get(i))
        .map(|p| p.text.chars().filter(|c| !c.is_whitespace()).count())
        .sum();

    stripped_len >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(text: &str) -> ExtractedPage {
        ExtractedPage { page_id: 1, text: text.to_string() }
    }

    #[test]
    fn extractable_text_below_threshold_is_false() {
        let pages = vec![page(""), page("  "), page("a")];
        assert!(!has_extractable_text(&pages, 300));
    }

    #[test]
    fn extractable_text_above_threshold_is_true() {
        let long = "x".repeat(400);
        let pages = vec![page(&long)];
        assert!(has_extractable_text(&pages, 300));
    }

    #[test]
    fn empty_document_is_not_extractable() {
        assert!(!has_extractable_text(&[], 300));
    }
}
