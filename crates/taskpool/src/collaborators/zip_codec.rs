//! Zip-based chapter archives (`.cbz`)

use std::io::{Cursor, Read, Write};

use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{ArchiveCodec, ArchiveEntry, CodecError};

/// Largest entry accepted when decompressing (256 MiB)
pub const DEFAULT_MAX_ENTRY_BYTES: u64 = 256 * 1024 * 1024;

/// Archive codec producing comic-book zip archives
#[derive(Debug, Clone, Copy)]
pub struct ZipArchiveCodec {
    method: CompressionMethod,
    max_entry_bytes: u64,
}

impl Default for ZipArchiveCodec {
    fn default() -> Self {
        Self {
            method: CompressionMethod::Deflated,
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
        }
    }
}

impl ZipArchiveCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store entries without compression; page images rarely shrink further
    pub fn stored() -> Self {
        Self {
            method: CompressionMethod::Stored,
            ..Self::default()
        }
    }

    /// Reject entries larger than `bytes` when decompressing
    pub fn with_max_entry_bytes(mut self, bytes: u64) -> Self {
        self.max_entry_bytes = bytes;
        self
    }
}

impl From<ZipError> for CodecError {
    fn from(err: ZipError) -> Self {
        match err {
            ZipError::Io(err) => CodecError::Io(err.to_string()),
            other => CodecError::Corrupt(other.to_string()),
        }
    }
}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        CodecError::Io(err.to_string())
    }
}

impl ArchiveCodec for ZipArchiveCodec {
    fn extension(&self) -> &str {
        "cbz"
    }

    fn compress(&self, entries: &[ArchiveEntry]) -> Result<Vec<u8>, CodecError> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(self.method);

        for entry in entries {
            zip.start_file(entry.name.as_str(), options)?;
            zip.write_all(&entry.data)?;
        }

        Ok(zip.finish()?.into_inner())
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<ArchiveEntry>, CodecError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let mut entries = Vec::with_capacity(archive.len());

        for index in 0..archive.len() {
            let mut file = archive.by_index(index)?;
            if file.is_dir() {
                continue;
            }
            // Sizes in the headers come from the remote side
            let limit = self.max_entry_bytes;
            if file.size() > limit {
                return Err(CodecError::Corrupt(format!(
                    "entry {} declares {} bytes, limit is {}",
                    file.name(),
                    file.size(),
                    limit
                )));
            }

            let name = file.name().to_string();
            let mut data = Vec::new();
            (&mut file).take(limit + 1).read_to_end(&mut data)?;
            if data.len() as u64 > limit {
                return Err(CodecError::Corrupt(format!(
                    "entry {} exceeds {} bytes",
                    name, limit
                )));
            }
            entries.push(ArchiveEntry::new(name, data));
        }

        Ok(entries)
    }
}
