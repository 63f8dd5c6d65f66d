//! Compression algorithm guessing from a file's path and first bytes.

use std::path::Path;

use crate::compression::{is_compressible, CompressionAlgorithm, DEFAULT_ZSTD_LEVEL};

/// Headers shorter than this are not worth compressing.
pub const MIN_SNIFF_SIZE: usize = 2048;

/// Magic prefixes of formats that are already compressed.
const COMPRESSED_MAGIC: &[&[u8]] = &[
    b"\x1f\x8b",                 // gzip
    b"PK\x03\x04",               // zip, docx, jar, apk
    b"\x28\xb5\x2f\xfd",         // zstd
    b"\xfd7zXZ\x00",             // xz
    b"BZh",                      // bzip2
    b"7z\xbc\xaf\x27\x1c",       // 7z
    b"\x04\x22\x4d\x18",         // lz4 frame
    b"Rar!\x1a\x07",             // rar
    b"\x89PNG\r\n\x1a\n",        // png
    b"\xff\xd8\xff",             // jpeg
    b"GIF87a",
    b"GIF89a",
    b"OggS",
    b"fLaC",
    b"ID3",                      // mp3
    b"\x1a\x45\xdf\xa3",         // matroska/webm
];

const COMPRESSED_EXT: &[&str] = &[
    "gz", "tgz", "zip", "zst", "xz", "txz", "bz2", "7z", "lz4", "rar", "png", "jpg", "jpeg",
    "gif", "webp", "heic", "avif", "mp3", "mp4", "m4a", "m4v", "mkv", "webm", "mov", "avi",
    "ogg", "opus", "flac", "docx", "xlsx", "pptx", "odt", "jar", "apk", "epub",
];

const TEXT_EXT: &[&str] = &[
    "txt", "md", "rst", "rs", "go", "py", "c", "h", "cc", "cpp", "hpp", "java", "js", "ts",
    "json", "xml", "html", "htm", "css", "csv", "tsv", "toml", "yaml", "yml", "ini", "cfg",
    "conf", "log", "sh", "sql", "svg", "tex",
];

fn extension(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn has_compressed_magic(header: &[u8]) -> bool {
    if COMPRESSED_MAGIC.iter().any(|m| header.starts_with(m)) {
        return true;
    }
    // ISO base media (mp4, mov, heic): "ftyp" at offset 4.
    if header.len() >= 8 && &header[4..8] == b"ftyp" {
        return true;
    }
    // RIFF containers holding WebP are compressed; WAV/AVI are left alone.
    header.len() >= 12 && &header[..4] == b"RIFF" && &header[8..12] == b"WEBP"
}

/// Heuristic text check: no NUL bytes and valid UTF-8, allowing the sample to
/// end in the middle of a multi-byte sequence.
fn looks_like_text(header: &[u8]) -> bool {
    if header.contains(&0) {
        return false;
    }
    match std::str::from_utf8(header) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none() && e.valid_up_to() + 4 > header.len(),
    }
}

/// Pick a compression algorithm for a file from its path and leading bytes.
///
/// Small headers and already-compressed content get [`CompressionAlgorithm::None`],
/// text gets Zstd for ratio, other binary data gets LZ4 for speed.
pub fn guess_algorithm(path: &str, header: &[u8]) -> CompressionAlgorithm {
    if header.len() < MIN_SNIFF_SIZE {
        return CompressionAlgorithm::None;
    }
    let ext = extension(path);
    let ext = ext.as_deref();

    if has_compressed_magic(header) || ext.is_some_and(|e| COMPRESSED_EXT.contains(&e)) {
        return CompressionAlgorithm::None;
    }
    if ext.is_some_and(|e| TEXT_EXT.contains(&e)) || looks_like_text(header) {
        return CompressionAlgorithm::Zstd {
            level: DEFAULT_ZSTD_LEVEL,
        };
    }
    if !is_compressible(header) {
        return CompressionAlgorithm::None;
    }
    CompressionAlgorithm::Lz4
}
