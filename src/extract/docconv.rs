//! Office-document-to-PDF conversion (§4.4.1 phase 1): shells out to a
//! headless LibreOffice, the same external-process pattern used for MuPDF
//! text extraction in this pipeline, bounded by `libreoffice_timeout`.

use crate::error::ServiceError;
use crate::objectstore::DocumentKind;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Convert `bytes` (of the given kind) to PDF via `soffice --headless`,
/// returning the produced PDF bytes. Bounded by `timeout`; a conversion that
/// overruns it is treated as a transient failure so the caller can retry or
/// fail the job rather than hang indefinitely.
pub async fn convert_to_pdf(
    bytes: &[u8],
    kind: DocumentKind,
    timeout: Duration,
) -> Result<Vec<u8>, ServiceError> {
    let ext = match kind {
        DocumentKind::OfficeOpenXml | DocumentKind::LegacyOffice => "docx",
        DocumentKind::PlainText => "txt",
        other => {
            return Err(ServiceError::ConversionFailed {
                key: "<in-memory>".to_string(),
                detail: format!("document kind {other:?} is not convertible to PDF"),
            })
        }
    };

    let workdir = tempfile::tempdir().map_err(|e| ServiceError::ConversionFailed {
        key: "<in-memory>".to_string(),
        detail: format!("failed to create scratch dir: {e}"),
    })?;
    let input_path = workdir.path().join(format!("input.{ext}"));
    let mut f = tokio::fs::File::create(&input_path)
        .await
        .map_err(|e| ServiceError::ObjectIo { path: input_path.clone(), source: e })?;
    f.write_all(bytes)
        .await
        .map_err(|e| ServiceError::ObjectIo { path: input_path.clone(), source: e })?;
    f.flush().await.ok();
    drop(f);

    debug!(?input_path, timeout_secs = timeout.as_secs(), "invoking soffice for conversion");

    let run = async {
        tokio::process::Command::new("soffice")
            .arg("--headless")
            .arg("--norestore")
            .arg("--convert-to")
            .arg("pdf")
            .arg("--outdir")
            .arg(workdir.path())
            .arg(&input_path)
            .kill_on_drop(true)
            .output()
            .await
    };

    let output = tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| ServiceError::ConversionFailed {
            key: "<in-memory>".to_string(),
            detail: format!("libreoffice conversion exceeded {}s budget", timeout.as_secs()),
        })?
        .map_err(|e| ServiceError::ConversionFailed {
            key: "<in-memory>".to_string(),
            detail: format!("failed to spawn soffice: {e}"),
        })?;

    if !output.status.success() {
        warn!(
            status = ?output.status,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "soffice conversion exited non-zero"
        );
        return Err(ServiceError::ConversionFailed {
            key: "<in-memory>".to_string(),
            detail: format!("soffice exited with {}", output.status),
        });
    }

    let output_path = output_pdf_path(&input_path, workdir.path());
    tokio::fs::read(&output_path)
        .await
        .map_err(|e| ServiceError::ObjectIo { path: output_path, source: e })
}

fn output_pdf_path(input_path: &Path, outdir: &Path) -> std::path::PathBuf {
    let stem = input_path.file_stem().unwrap_or_default();
    outdir.join(stem).with_extension("pdf")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_pdf_path_swaps_extension() {
        let input = Path::new("/tmp/foo/input.docx");
        let outdir = Path::new("/tmp/foo");
        assert_eq!(output_pdf_path(input, outdir), Path::new("/tmp/foo/input.pdf"));
    }
}
