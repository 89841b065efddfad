use std::io::{Cursor, Read, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::Error;

/// Main document body part.
pub const DOCUMENT_PART: &str = "word/document.xml";
/// Relationship list for the main document body.
pub const RELS_PART: &str = "word/_rels/document.xml.rels";
/// Package-level content-type declarations.
pub const CONTENT_TYPES_PART: &str = "[Content_Types].xml";
/// Directory new image parts are written under.
pub const MEDIA_DIR: &str = "word/media";

const REQUIRED_PARTS: &[&str] = &[DOCUMENT_PART, RELS_PART, CONTENT_TYPES_PART];

/// An in-memory DOCX package: every zip entry decompressed, in archive order,
/// with enough entry metadata to re-emit untouched parts unchanged.
#[derive(Debug)]
pub struct Package {
    parts: Vec<Part>,
}

#[derive(Debug)]
struct Part {
    name: String,
    data: Vec<u8>,
    compression: CompressionMethod,
    last_modified: zip::DateTime,
    unix_mode: Option<u32>,
    is_dir: bool,
}

impl Package {
    /// Reads a DOCX archive from raw bytes. Fails with `MalformedPackage` if
    /// the bytes are not a zip archive or any required part is missing.
    pub fn open(bytes: &[u8]) -> Result<Self, Error> {
        let mut zip = ZipArchive::new(Cursor::new(bytes))
            .map_err(|_| Error::MalformedPackage("file is not a ZIP archive".into()))?;

        let mut parts = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let mut file = zip
                .by_index(i)
                .map_err(|e| Error::MalformedPackage(format!("unreadable zip entry: {e}")))?;
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)?;
            parts.push(Part {
                name: file.name().to_string(),
                data,
                compression: file.compression(),
                last_modified: file.last_modified().unwrap_or_default(),
                unix_mode: file.unix_mode(),
                is_dir: file.is_dir(),
            });
        }

        let package = Package { parts };
        for required in REQUIRED_PARTS {
            if !package.contains(required) {
                return Err(Error::MalformedPackage(format!(
                    "missing {required} (is this a DOCX file?)"
                )));
            }
        }
        Ok(package)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parts.iter().any(|p| p.name == name)
    }

    /// Decoded text content of a part.
    pub fn read_part_text(&self, name: &str) -> Result<String, Error> {
        let part = self
            .parts
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::PartNotFound(name.to_string()))?;
        String::from_utf8(part.data.clone())
            .map_err(|_| Error::MalformedPackage(format!("{name} is not valid UTF-8")))
    }

    /// Replaces a part's content in place.
    pub fn write_part(&mut self, name: &str, text: String) -> Result<(), Error> {
        let part = self
            .parts
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::PartNotFound(name.to_string()))?;
        part.data = text.into_bytes();
        Ok(())
    }

    /// Filenames already present under the media directory, including parts
    /// no relationship entry points at.
    pub fn media_filenames(&self) -> Vec<String> {
        let prefix = format!("{MEDIA_DIR}/");
        self.parts
            .iter()
            .filter_map(|p| p.name.strip_prefix(&prefix))
            .map(str::to_string)
            .collect()
    }

    /// Appends a new binary part under the media directory.
    pub fn add_media(&mut self, filename: &str, bytes: Vec<u8>) {
        self.parts.push(Part {
            name: format!("{MEDIA_DIR}/{filename}"),
            data: bytes,
            compression: CompressionMethod::Deflated,
            last_modified: zip::DateTime::default(),
            unix_mode: None,
            is_dir: false,
        });
    }

    /// Re-encodes all parts into a new archive, preserving entry order,
    /// per-entry compression method and timestamps of the original.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let mut zout = ZipWriter::new(Cursor::new(Vec::new()));
        for part in &self.parts {
            let mut opts = SimpleFileOptions::default()
                .compression_method(part.compression)
                .last_modified_time(part.last_modified);
            if let Some(mode) = part.unix_mode {
                opts = opts.unix_permissions(mode);
            }
            if part.is_dir || part.name.ends_with('/') {
                zout.add_directory(&part.name, opts)
                    .map_err(|e| Error::MalformedPackage(format!("zip dir {}: {e}", part.name)))?;
            } else {
                zout.start_file(&part.name, opts).map_err(|e| {
                    Error::MalformedPackage(format!("zip entry {}: {e}", part.name))
                })?;
                zout.write_all(&part.data)?;
            }
        }
        let cursor = zout
            .finish()
            .map_err(|e| Error::MalformedPackage(format!("finish zip: {e}")))?;
        Ok(cursor.into_inner())
    }
}
