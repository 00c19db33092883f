//! Store-path naming and streaming compression

use std::ffi::OsStr;
use std::io::{self, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

/// Extensions that are already compressed and are sent as-is.
const COMPRESSED_EXTENSIONS: &[&str] = &[
    "zip", "gz", "bz2", "xz", "zst", "tgz", "tbz2", "txz", "ioym", "br",
];

pub fn should_compress(path: &Path) -> bool {
    match path.extension().and_then(OsStr::to_str) {
        Some(ext) => !COMPRESSED_EXTENSIONS.contains(&ext),
        None => true,
    }
}

/// The logical path a file is stored under.
///
/// Paths under `base` become `./relative/path`; anything else is sent
/// verbatim. Compressed files get a `.gz` suffix.
pub fn store_path(path: &Path, base: Option<&Path>, compressed: bool) -> String {
    let logical = match base {
        Some(base) => path
            .strip_prefix(base)
            .map(|rel| Path::new(".").join(rel))
            .unwrap_or_else(|_| path.to_path_buf()),
        None => path.to_path_buf(),
    };
    let mut text = logical.to_string_lossy().into_owned();
    if compressed {
        text.push_str(".gz");
    }
    text
}

/// Turns file blocks into outgoing chunk payloads.
///
/// The gzip variant drains its output buffer after every block so memory
/// stays bounded by the block size rather than the file size.
pub enum ChunkEncoder {
    Plain,
    Gzip(GzEncoder<Vec<u8>>),
}

impl ChunkEncoder {
    pub fn new(compressed: bool, capacity: usize) -> Self {
        if compressed {
            ChunkEncoder::Gzip(GzEncoder::new(
                Vec::with_capacity(capacity),
                Compression::best(),
            ))
        } else {
            ChunkEncoder::Plain
        }
    }

    /// Encode one block; the returned slice may be empty.
    pub fn encode<'a>(&'a mut self, block: &'a [u8]) -> io::Result<&'a [u8]> {
        match self {
            ChunkEncoder::Plain => Ok(block),
            ChunkEncoder::Gzip(encoder) => {
                encoder.get_mut().clear();
                encoder.write_all(block)?;
                Ok(encoder.get_ref().as_slice())
            }
        }
    }

    /// Flush whatever the encoder still holds, including the gzip trailer.
    pub fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            ChunkEncoder::Plain => Ok(Vec::new()),
            ChunkEncoder::Gzip(mut encoder) => {
                encoder.get_mut().clear();
                encoder.finish()
            }
        }
    }
}
