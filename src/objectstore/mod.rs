//! Object-store client interface (§6): "out of scope" as deep functionality,
//! but given a working local-filesystem-backed stand-in so jobs can actually
//! flow download → convert → extract → upload end to end, behind a trait a
//! real S3/GCS client could later implement without touching the core.
//!
//! Layout for results: given original key `<base>_original`, write
//! `<base>_v1` (MuPDF text) and `<base>_v2` (AI text), then
//! copy-with-replace-metadata to `<base>` (latest).

pub mod crypto;

use crate::error::ServiceError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// A parsed `scheme://bucket/key` document reference (§3 Job).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocRef {
    pub scheme: String,
    pub bucket: String,
    pub key: String,
}

impl DocRef {
    /// Parse `scheme://bucket/key`, or normalize a bare key using `default_bucket`.
    pub fn parse(reference: &str, default_bucket: &str) -> Result<Self, ServiceError> {
        if let Some(rest) = reference.split_once("://") {
            let (scheme, tail) = rest;
            let (bucket, key) = tail.split_once('/').ok_or_else(|| ServiceError::InvalidReference {
                reference: reference.to_string(),
                reason: "missing bucket/key separator".to_string(),
            })?;
            if bucket.is_empty() || key.is_empty() {
                return Err(ServiceError::InvalidReference {
                    reference: reference.to_string(),
                    reason: "bucket and key must be non-empty".to_string(),
                });
            }
            Ok(DocRef {
                scheme: scheme.to_string(),
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
        } else {
            if reference.is_empty() {
                return Err(ServiceError::InvalidReference {
                    reference: reference.to_string(),
                    reason: "empty reference".to_string(),
                });
            }
            Ok(DocRef {
                scheme: "fs".to_string(),
                bucket: default_bucket.to_string(),
                key: reference.trim_start_matches('/').to_string(),
            })
        }
    }

    pub fn to_uri(&self) -> String {
        format!("{}://{}/{}", self.scheme, self.bucket, self.key)
    }

    /// The external file id: the last path segment with a trailing
    /// `_original` suffix stripped (§4.4 SubmitJob).
    pub fn file_id(&self) -> String {
        let last = self.key.rsplit('/').next().unwrap_or(&self.key);
        last.strip_suffix("_original").unwrap_or(last).to_string()
    }

    pub fn with_suffix(&self, suffix: &str) -> DocRef {
        DocRef {
            scheme: self.scheme.clone(),
            bucket: self.bucket.clone(),
            key: format!("{}{}", self.key, suffix),
        }
    }

    /// The base key with any `_original` suffix stripped.
    pub fn base(&self) -> DocRef {
        DocRef {
            scheme: self.scheme.clone(),
            bucket: self.bucket.clone(),
            key: self.key.strip_suffix("_original").unwrap_or(&self.key).to_string(),
        }
    }
}

/// The object-store contract used by the controller: get/put bytes, and a
/// copy-with-replace-metadata promotion used to publish the "latest" key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, doc: &DocRef) -> Result<Vec<u8>, ServiceError>;
    async fn put(&self, doc: &DocRef, bytes: &[u8]) -> Result<(), ServiceError>;
    async fn exists(&self, doc: &DocRef) -> Result<bool, ServiceError>;
    /// Copy `src` onto `dst`, replacing `dst`'s content and metadata — used to
    /// promote `<base>_v1`/`<base>_v2` onto `<base>` as the latest artifact.
    async fn promote(&self, src: &DocRef, dst: &DocRef) -> Result<(), ServiceError>;
}

/// Local-filesystem-backed object store. Buckets map to subdirectories of
/// `root`; keys map to relative paths (parent directories created on write).
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, doc: &DocRef) -> PathBuf {
        self.root.join(&doc.bucket).join(&doc.key)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, doc: &DocRef) -> Result<Vec<u8>, ServiceError> {
        let path = self.path_for(doc);
        tokio::fs::read(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ServiceError::ObjectNotFound { key: doc.to_uri() },
                _ => ServiceError::ObjectIo { path, source: e },
            })
    }

    async fn put(&self, doc: &DocRef, bytes: &[u8]) -> Result<(), ServiceError> {
        let path = self.path_for(doc);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServiceError::ObjectIo { path: parent.to_path_buf(), source: e })?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ServiceError::ObjectIo { path, source: e })
    }

    async fn exists(&self, doc: &DocRef) -> Result<bool, ServiceError> {
        Ok(tokio::fs::try_exists(self.path_for(doc)).await.unwrap_or(false))
    }

    async fn promote(&self, src: &DocRef, dst: &DocRef) -> Result<(), ServiceError> {
        let bytes = self.get(src).await?;
        self.put(dst, &bytes).await
    }
}

/// Detect a document's MIME family from magic bytes, disambiguating the ZIP
/// container used by OOXML formats and the OLE container used by legacy
/// Office formats (§4.4.1 phase 1).
pub fn sniff_mime(bytes: &[u8], hint_extension: Option<&str>) -> DocumentKind {
    if bytes.starts_with(b"%PDF") {
        return DocumentKind::Pdf;
    }
    if bytes.starts_with(&[0x50, 0x4B, 0x03, 0x04]) {
        // ZIP container: OOXML (.docx/.xlsx/.pptx) or a generic zip.
        return match hint_extension {
            Some(ext) if matches!(ext, "docx" | "xlsx" | "pptx") => DocumentKind::OfficeOpenXml,
            _ => DocumentKind::Zip,
        };
    }
    if bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]) {
        return DocumentKind::LegacyOffice;
    }
    if bytes.iter().take(2048).all(|&b| b == 9 || b == 10 || b == 13 || (0x20..=0x7e).contains(&b)) {
        return DocumentKind::PlainText;
    }
    DocumentKind::Unknown
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    PlainText,
    OfficeOpenXml,
    LegacyOffice,
    Zip,
    Unknown,
}

pub fn path_extension(key: &str) -> Option<&str> {
    Path::new(key).extension().and_then(|e| e.to_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_ref_parses_scheme() {
        let d = DocRef::parse("s3://mybucket/folder/doc_original", "documents").unwrap();
        assert_eq!(d.scheme, "s3");
        assert_eq!(d.bucket, "mybucket");
        assert_eq!(d.key, "folder/doc_original");
        assert_eq!(d.file_id(), "doc");
    }

    #[test]
    fn doc_ref_normalizes_bare_key() {
        let d = DocRef::parse("report.pdf", "documents").unwrap();
        assert_eq!(d.to_uri(), "fs://documents/report.pdf");
    }

    #[test]
    fn base_strips_original_suffix() {
        let d = DocRef::parse("fs://b/doc_original", "b").unwrap();
        assert_eq!(d.base().key, "doc");
        assert_eq!(d.with_suffix("_v1").key, "doc_original_v1");
    }

    #[test]
    fn sniff_mime_detects_pdf_and_zip() {
        assert_eq!(sniff_mime(b"%PDF-1.7", None), DocumentKind::Pdf);
        assert_eq!(
            sniff_mime(&[0x50, 0x4B, 0x03, 0x04, 0, 0], Some("docx")),
            DocumentKind::OfficeOpenXml
        );
    }
}
