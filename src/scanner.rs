use crate::error::ExtractError;
use byteorder::{BigEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use flate2::read::ZlibDecoder;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

/// PNG file signature (first 8 bytes of any valid PNG)
const PNG_SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];
const PNG_READER_CAPACITY: usize = 128 * 1024;
const CRC_LEN: i64 = 4;

const PARAMETERS_KEYWORD: &[u8] = b"parameters";
const SOFTWARE_KEYWORD: &[u8] = b"Software";
const COMMENT_KEYWORD: &[u8] = b"Comment";
const NOVELAI_SOFTWARE: &[u8] = b"NovelAI";

/// Supported image extensions for scanning.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp"];

/// An image file found on disk together with its modification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    /// Modification time as unix milliseconds.
    pub modified_ms: i64,
}

impl ScannedFile {
    /// Directory half of the identity key.
    pub fn directory(&self) -> String {
        self.path
            .parent()
            .map(|parent| parent.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// File-name half of the identity key.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Extension including the leading dot, as written on disk.
    pub fn extension(&self) -> String {
        self.path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default()
    }
}

/// Text payload recovered from a PNG, tagged with the shape it came from so
/// the parser can pick the matching grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPayload {
    /// `parameters` text chunk written by Stable-Diffusion web UIs.
    Parameters(String),
    /// `Comment` JSON following a `Software=NovelAI` chunk.
    NovelAiComment(String),
}

impl RawPayload {
    pub fn text(&self) -> &str {
        match self {
            Self::Parameters(text) | Self::NovelAiComment(text) => text,
        }
    }
}

/// Extracts the embedded generation payload from an image file.
///
/// Only chunk headers and text chunks are read; every other chunk (pixel
/// data included) is skipped with a relative seek. Files that are not PNGs,
/// PNGs without a recognised payload, and truncated chunk streams all yield
/// `Ok(None)`. Only a missing or unreadable file is an error.
pub fn extract_payload(path: &Path) -> Result<Option<RawPayload>, ExtractError> {
    let file = File::open(path).map_err(|err| ExtractError::from_io(path, err))?;
    let mut reader = BufReader::with_capacity(PNG_READER_CAPACITY, file);
    scan_chunks(&mut reader).map_err(|err| ExtractError::from_io(path, err))
}

fn scan_chunks(reader: &mut BufReader<File>) -> std::io::Result<Option<RawPayload>> {
    let mut sig = [0u8; 8];
    match reader.read_exact(&mut sig) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    if sig != PNG_SIGNATURE {
        return Ok(None);
    }

    let mut novelai_seen = false;
    while let Some((length, chunk_type)) = read_chunk_header(reader)? {
        match &chunk_type {
            b"tEXt" | b"zTXt" | b"iTXt" => {
                let Some(data) = read_chunk_data(reader, length)? else {
                    log::debug!("Truncated {} chunk, stopping scan", chunk_label(&chunk_type));
                    break;
                };
                reader.seek_relative(CRC_LEN)?;

                let Some((keyword, body)) = split_keyword(&data) else {
                    continue;
                };

                if keyword == PARAMETERS_KEYWORD {
                    if let Some(text) = decode_parameters(&chunk_type, body) {
                        return Ok(Some(RawPayload::Parameters(text)));
                    }
                } else if &chunk_type == b"tEXt" && keyword == SOFTWARE_KEYWORD {
                    if body == NOVELAI_SOFTWARE {
                        novelai_seen = true;
                    }
                } else if &chunk_type == b"tEXt" && keyword == COMMENT_KEYWORD && novelai_seen {
                    return Ok(Some(RawPayload::NovelAiComment(
                        String::from_utf8_lossy(body).into_owned(),
                    )));
                }
            }
            b"IEND" => break,
            _ => {
                // Skip chunk data + CRC
                reader.seek_relative(i64::from(length) + CRC_LEN)?;
            }
        }
    }

    Ok(None)
}

/// Reads the 4-byte big-endian length and 4-byte type of the next chunk.
/// A short read means the stream ended (or was truncated).
fn read_chunk_header<R: Read>(reader: &mut R) -> std::io::Result<Option<(u32, [u8; 4])>> {
    let length = match reader.read_u32::<BigEndian>() {
        Ok(length) => length,
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };

    let mut chunk_type = [0u8; 4];
    match reader.read_exact(&mut chunk_type) {
        Ok(()) => Ok(Some((length, chunk_type))),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err),
    }
}

/// Reads exactly `length` bytes of chunk data without trusting the length for
/// preallocation. Returns `None` when the file ends first.
fn read_chunk_data<R: Read>(reader: &mut R, length: u32) -> std::io::Result<Option<Vec<u8>>> {
    let mut data = Vec::new();
    reader
        .by_ref()
        .take(u64::from(length))
        .read_to_end(&mut data)?;
    if data.len() == length as usize {
        Ok(Some(data))
    } else {
        Ok(None)
    }
}

fn split_keyword(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let null_pos = data.iter().position(|&b| b == 0)?;
    Some((&data[..null_pos], &data[null_pos + 1..]))
}

fn decode_parameters(chunk_type: &[u8; 4], body: &[u8]) -> Option<String> {
    let text = match chunk_type {
        b"tEXt" => decode_latin1(strip_leading_nuls(body)),
        b"zTXt" => decode_ztxt_body(body)?,
        b"iTXt" => decode_itxt_body(body)?,
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn strip_leading_nuls(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn decode_ztxt_body(body: &[u8]) -> Option<String> {
    let (&compression_method, compressed) = body.split_first()?;
    if compression_method != 0 {
        return None;
    }
    inflate_to_string(compressed)
}

/// iTXt body after the keyword: compression flag, compression method,
/// language tag, translated keyword, then the text itself.
fn decode_itxt_body(body: &[u8]) -> Option<String> {
    if let Some(text) = decode_structured_itxt(body) {
        return Some(text);
    }
    // Writers that pad the keyword with extra NULs instead of the proper
    // field layout: everything after the padding is the text.
    String::from_utf8(strip_leading_nuls(body).to_vec()).ok()
}

fn decode_structured_itxt(body: &[u8]) -> Option<String> {
    if body.len() < 2 {
        return None;
    }
    let compression_flag = body[0];
    let compression_method = body[1];
    let after_compression = &body[2..];
    let lang_end = after_compression.iter().position(|&b| b == 0)?;
    let after_lang = &after_compression[lang_end + 1..];
    let translated_end = after_lang.iter().position(|&b| b == 0)?;
    let text = &after_lang[translated_end + 1..];

    match (compression_flag, compression_method) {
        (0, _) => String::from_utf8(text.to_vec()).ok(),
        (1, 0) => inflate_to_string(text),
        _ => None,
    }
}

fn inflate_to_string(data: &[u8]) -> Option<String> {
    let mut decoder = ZlibDecoder::new(data);
    let mut output = String::new();
    decoder.read_to_string(&mut output).ok()?;
    Some(output)
}

fn chunk_label(chunk_type: &[u8; 4]) -> String {
    String::from_utf8_lossy(chunk_type).into_owned()
}

/// True when the path carries one of the scanned image extensions.
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Recursively scans a directory for supported image files.
///
/// Directory links are not descended into, so link cycles cannot make the
/// walk revisit a directory. Links to image files are listed under the
/// link's own path with the target's modification time. Entries whose
/// metadata cannot be read are logged and left out.
pub fn scan_directory(root: &Path) -> Vec<ScannedFile> {
    let root = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
    let mut files = Vec::new();

    for entry in walkdir::WalkDir::new(&root)
        .follow_links(false)
        .max_open(32)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("Skipping unreadable entry under {}: {}", root.display(), err);
                continue;
            }
        };
        if entry.file_type().is_dir() || !is_supported_image(entry.path()) {
            continue;
        }

        // fs::metadata resolves links; the walker's own metadata does not.
        let metadata = match std::fs::metadata(entry.path()) {
            Ok(metadata) => metadata,
            Err(err) => {
                log::warn!("Skipping {}: {}", entry.path().display(), err);
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }
        match metadata.modified() {
            Ok(modified) => files.push(ScannedFile {
                path: entry.into_path(),
                modified_ms: DateTime::<Utc>::from(modified).timestamp_millis(),
            }),
            Err(err) => {
                log::warn!(
                    "Skipping {}: modification time unavailable ({})",
                    entry.path().display(),
                    err
                );
            }
        }
    }

    files
}
