//! Minimal NIfTI header inspection.
//!
//! Only the fixed header and the extension blocks are read: enough to reject
//! uploads that are obviously not NIfTI and to recover the label table that
//! TotalSegmentator embeds in multilabel outputs. Voxel data is never decoded.

use crate::models::LabelMap;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::io::AsyncReadExt;

const NIFTI1_HEADER_SIZE: i32 = 348;
const NIFTI2_HEADER_SIZE: i32 = 540;
/// NIfTI-1 header plus the 4-byte extension flag.
const NIFTI1_PREFIX: usize = 352;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Upper bound on extension bytes we are willing to load.
const MAX_EXTENSION_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum NiftiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file is too short to be NIfTI ({0} bytes)")]
    Truncated(usize),

    #[error("gzip stream expected for .nii.gz upload")]
    NotGzip,

    #[error("invalid NIfTI header: {0}")]
    InvalidHeader(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NiftiFormat {
    Nifti,
    NiftiGz,
}

impl NiftiFormat {
    /// Classifies a client file name; anything but `.nii`/`.nii.gz` is `None`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        if name.ends_with(".nii.gz") && name.len() > ".nii.gz".len() {
            Some(NiftiFormat::NiftiGz)
        } else if name.ends_with(".nii") && name.len() > ".nii".len() {
            Some(NiftiFormat::Nifti)
        } else {
            None
        }
    }

    pub fn is_gzipped(&self) -> bool {
        matches!(self, NiftiFormat::NiftiGz)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

impl Endian {
    fn i32_at(self, buf: &[u8], offset: usize) -> i32 {
        let bytes = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        match self {
            Endian::Little => i32::from_le_bytes(bytes),
            Endian::Big => i32::from_be_bytes(bytes),
        }
    }

    fn f32_at(self, buf: &[u8], offset: usize) -> f32 {
        let bytes = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        match self {
            Endian::Little => f32::from_le_bytes(bytes),
            Endian::Big => f32::from_be_bytes(bytes),
        }
    }
}

/// Returns the byte order and `sizeof_hdr` if the first word is a known header size.
fn header_kind(buf: &[u8]) -> Option<(Endian, i32)> {
    if buf.len() < 4 {
        return None;
    }
    [Endian::Little, Endian::Big].into_iter().find_map(|endian| {
        let size = endian.i32_at(buf, 0);
        (size == NIFTI1_HEADER_SIZE || size == NIFTI2_HEADER_SIZE).then_some((endian, size))
    })
}

/// Cheap structural check of an upload before it reaches the external tool.
pub fn sniff(format: NiftiFormat, data: &[u8]) -> Result<(), NiftiError> {
    match format {
        NiftiFormat::NiftiGz => {
            if data.len() < GZIP_MAGIC.len() {
                return Err(NiftiError::Truncated(data.len()));
            }
            if data[..2] != GZIP_MAGIC {
                return Err(NiftiError::NotGzip);
            }
            Ok(())
        }
        NiftiFormat::Nifti => {
            if data.len() < NIFTI1_PREFIX {
                return Err(NiftiError::Truncated(data.len()));
            }
            match header_kind(data) {
                Some((_, NIFTI1_HEADER_SIZE)) => {
                    let magic = &data[344..348];
                    if magic == b"n+1\0" || magic == b"ni1\0" {
                        Ok(())
                    } else {
                        Err(NiftiError::InvalidHeader("missing NIfTI-1 magic".into()))
                    }
                }
                Some((_, _)) => {
                    if data[4..7] == *b"n+2" || data[4..7] == *b"ni2" {
                        Ok(())
                    } else {
                        Err(NiftiError::InvalidHeader("missing NIfTI-2 magic".into()))
                    }
                }
                None => Err(NiftiError::InvalidHeader(
                    "sizeof_hdr is neither 348 nor 540".into(),
                )),
            }
        }
    }
}

/// Reads the label table embedded in a NIfTI-1 file's header extensions.
///
/// Returns `Ok(None)` for compressed files, NIfTI-2 files, and files without a
/// recognizable label extension.
pub async fn read_label_map(path: &Path) -> Result<Option<LabelMap>, NiftiError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut prefix = [0u8; NIFTI1_PREFIX];
    let read = read_up_to(&mut file, &mut prefix).await?;

    if read >= 2 && prefix[..2] == GZIP_MAGIC {
        return Ok(None);
    }
    if read < NIFTI1_PREFIX {
        return Err(NiftiError::Truncated(read));
    }

    let endian = match header_kind(&prefix) {
        Some((endian, NIFTI1_HEADER_SIZE)) => endian,
        Some(_) => return Ok(None),
        None => {
            return Err(NiftiError::InvalidHeader(
                "sizeof_hdr is neither 348 nor 540".into(),
            ))
        }
    };

    // extension[0] != 0 signals that extensions follow the header
    if prefix[348] == 0 {
        return Ok(None);
    }

    let vox_offset = endian.f32_at(&prefix, 108);
    if !vox_offset.is_finite() || vox_offset < NIFTI1_PREFIX as f32 {
        return Ok(None);
    }
    let ext_len = (vox_offset as usize - NIFTI1_PREFIX).min(MAX_EXTENSION_BYTES);

    let mut extensions = vec![0u8; ext_len];
    let read = read_up_to(&mut file, &mut extensions).await?;
    extensions.truncate(read);

    for data in extension_blocks(&extensions, endian) {
        let text = String::from_utf8_lossy(data);
        let labels = parse_caret_labels(&text);
        if !labels.is_empty() {
            return Ok(Some(labels));
        }
    }

    Ok(None)
}

async fn read_up_to(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Splits the extension area into the payloads of its `(esize, ecode, data)` blocks.
fn extension_blocks(buf: &[u8], endian: Endian) -> Vec<&[u8]> {
    let mut blocks = Vec::new();
    let mut offset = 0;

    while offset + 8 <= buf.len() {
        let esize = endian.i32_at(buf, offset);
        if esize < 16 || esize % 16 != 0 {
            break;
        }
        let end = (offset + esize as usize).min(buf.len());
        blocks.push(&buf[offset + 8..end]);
        offset += esize as usize;
    }

    blocks
}

fn label_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?s)<Label\s+Key="(\d+)"[^>]*>\s*<!\[CDATA\[(.*?)\]\]>\s*</Label>"#)
            .expect("label pattern is a valid regex")
    })
}

/// Parses the Caret-style XML label table written by TotalSegmentator.
pub fn parse_caret_labels(xml: &str) -> LabelMap {
    label_pattern()
        .captures_iter(xml)
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().parse::<u32>().ok()?;
            let name = caps.get(2)?.as_str().trim().to_string();
            Some((key, name))
        })
        .collect()
}
