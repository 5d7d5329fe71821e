//! # flowpack-wire
//!
//! The canonical file header shared by every repository and incremental
//! output file, and the incremental file-pair naming contract (placeholder
//! + dot-prefixed working file).

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use flowpack_model::FlowRecord;

/// `b"FLWP"` — identifies a flowpack output file.
pub const MAGIC: [u8; 4] = *b"FLWP";

/// Current on-disk record layout version.
pub const RECORD_VERSION: u16 = 1;

/// Fixed header length in bytes. Every output file begins with exactly
/// this many bytes before the first record.
pub const HEADER_LEN: usize = 28;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bad magic bytes in header")]
    BadMagic,

    #[error("unsupported byte-order code {0}")]
    BadByteOrder(u8),

    #[error("unsupported compression code {0}")]
    BadCompression(u8),

    #[error("short read: expected {expected} header bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("header serialization error: {0}")]
    Encode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, WireError>;

/// Byte order a file's records were written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteOrder {
    /// Whatever order the writing host's CPU uses.
    Native,
    Little,
    Big,
    /// Copy bytes through unchanged, no reinterpretation (respool mode).
    AsIs,
}

impl ByteOrder {
    fn to_code(self) -> u8 {
        match self {
            ByteOrder::Native => 0,
            ByteOrder::Little => 1,
            ByteOrder::Big => 2,
            ByteOrder::AsIs => 3,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(ByteOrder::Native),
            1 => Ok(ByteOrder::Little),
            2 => Ok(ByteOrder::Big),
            3 => Ok(ByteOrder::AsIs),
            other => Err(WireError::BadByteOrder(other)),
        }
    }
}

/// Compression applied to the record stream following the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionMethod {
    None,
    Zlib,
}

impl CompressionMethod {
    fn to_code(self) -> u8 {
        match self {
            CompressionMethod::None => 0,
            CompressionMethod::Zlib => 1,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(CompressionMethod::None),
            1 => Ok(CompressionMethod::Zlib),
            other => Err(WireError::BadCompression(other)),
        }
    }
}

/// The packed-file directive: which `(flowtype, sensor, hour)` this file's
/// records belong to. Appenders trust this over re-parsing the basename
/// when it's present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedFileDirective {
    pub hour_ms: i64,
    pub flowtype_id: u16,
    pub sensor_id: u16,
}

/// Default basename for a `(flowtype, sensor, hour)` triple:
/// `ft<flowtype>-s<sensor>-H<hour_ms>`. Sites with their own layout
/// convention can ignore this and supply their own opener.
pub fn default_basename(key: flowpack_model::CacheKey) -> String {
    format!("ft{}-s{}-H{}", key.flowtype_id, key.sensor_id, key.hour_ms)
}

/// Default repository-relative path for a `(flowtype, sensor, hour)`
/// triple: `<flowtype>/<sensor>/<basename>`.
pub fn default_repository_relpath(key: flowpack_model::CacheKey) -> PathBuf {
    PathBuf::from(key.flowtype_id.to_string())
        .join(key.sensor_id.to_string())
        .join(default_basename(key))
}

/// A fixed-size struct mirroring the on-disk header byte-for-byte. Kept
/// private: all fields are fixed-width primitives so `bincode` produces a
/// deterministic `HEADER_LEN`-byte encoding with no length prefixes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawHeader {
    magic: [u8; 4],
    file_format_id: u16,
    record_version: u16,
    byte_order_code: u8,
    compression_code: u8,
    _reserved: u16,
    hour_ms: i64,
    flowtype_id: u16,
    sensor_id: u16,
    _pad: u32,
}

/// The canonical flow-record file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub file_format_id: u16,
    pub record_version: u16,
    pub byte_order: ByteOrder,
    pub compression: CompressionMethod,
    pub directive: PackedFileDirective,
}

impl FileHeader {
    pub fn new(
        file_format_id: u16,
        byte_order: ByteOrder,
        compression: CompressionMethod,
        directive: PackedFileDirective,
    ) -> Self {
        Self {
            file_format_id,
            record_version: RECORD_VERSION,
            byte_order,
            compression,
            directive,
        }
    }

    pub fn to_bytes(&self) -> Result<[u8; HEADER_LEN]> {
        let raw = RawHeader {
            magic: MAGIC,
            file_format_id: self.file_format_id,
            record_version: self.record_version,
            byte_order_code: self.byte_order.to_code(),
            compression_code: self.compression.to_code(),
            _reserved: 0,
            hour_ms: self.directive.hour_ms,
            flowtype_id: self.directive.flowtype_id,
            sensor_id: self.directive.sensor_id,
            _pad: 0,
        };
        let bytes = bincode::serialize(&raw)?;
        let mut out = [0u8; HEADER_LEN];
        if bytes.len() != HEADER_LEN {
            // Defensive: would only trip if bincode's primitive encoding
            // changed width, which it does not for fixed-width integers.
            return Err(WireError::ShortRead {
                expected: HEADER_LEN,
                got: bytes.len(),
            });
        }
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_LEN {
            return Err(WireError::ShortRead {
                expected: HEADER_LEN,
                got: bytes.len(),
            });
        }
        let raw: RawHeader = bincode::deserialize(bytes)?;
        if raw.magic != MAGIC {
            return Err(WireError::BadMagic);
        }
        Ok(Self {
            file_format_id: raw.file_format_id,
            record_version: raw.record_version,
            byte_order: ByteOrder::from_code(raw.byte_order_code)?,
            compression: CompressionMethod::from_code(raw.compression_code)?,
            directive: PackedFileDirective {
                hour_ms: raw.hour_ms,
                flowtype_id: raw.flowtype_id,
                sensor_id: raw.sensor_id,
            },
        })
    }

    /// Rewrite the header's packed-file directive, keeping every other
    /// field. Used by the appender when a destination file's byte-order
    /// or compression is overridden relative to its source incremental.
    pub fn with_overrides(
        &self,
        byte_order: Option<ByteOrder>,
        compression: Option<CompressionMethod>,
    ) -> Self {
        let mut h = *self;
        if let Some(bo) = byte_order {
            h.byte_order = bo;
        }
        if let Some(c) = compression {
            h.compression = c;
        }
        h
    }
}

/// An incremental file pair: a zero-byte placeholder and the dot-prefixed
/// working file records are actually written to.
#[derive(Debug, Clone)]
pub struct IncrementalPair {
    pub placeholder: PathBuf,
    pub working: PathBuf,
}

/// Derive the working-file path for a placeholder: insert a literal `.`
/// before the basename. The dot prefix is load-bearing — downstream
/// consumers of the incremental directory filter by it.
pub fn working_path_for(placeholder: &Path) -> PathBuf {
    let dir = placeholder.parent().unwrap_or_else(|| Path::new("."));
    let basename = placeholder
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.join(format!(".{basename}"))
}

/// Inverse of [`working_path_for`]: given a dot-prefixed working path,
/// the placeholder path it should be renamed onto at finalize time.
pub fn placeholder_path_for(working: &Path) -> PathBuf {
    let dir = working.parent().unwrap_or_else(|| Path::new("."));
    let basename = working
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.join(basename.strip_prefix('.').unwrap_or(&basename))
}

/// Create a new incremental file pair in `dir` under `basename`: an
/// exclusive-create placeholder named `basename.XXXXXX` (mkstemp-style,
/// zero bytes, then closed), and its dot-prefixed working file, also
/// created exclusively. On any failure after the placeholder is created,
/// both files are unlinked before the error is returned.
pub fn create_incremental_pair(dir: &Path, basename: &str) -> Result<IncrementalPair> {
    fs::create_dir_all(dir)?;
    let placeholder_file = tempfile::Builder::new()
        .prefix(&format!("{basename}."))
        .rand_bytes(6)
        .suffix("")
        .tempfile_in(dir)?;
    let (_file, placeholder) = placeholder_file.keep().map_err(|e| e.error)?;

    let working = working_path_for(&placeholder);
    match File::options()
        .write(true)
        .create_new(true)
        .open(&working)
    {
        Ok(_) => Ok(IncrementalPair {
            placeholder,
            working,
        }),
        Err(e) => {
            let _ = fs::remove_file(&placeholder);
            Err(WireError::Io(e))
        }
    }
}

/// Unlink both halves of a pair, e.g. after header-write failure.
pub fn cleanup_pair(pair: &IncrementalPair) {
    let _ = fs::remove_file(&pair.placeholder);
    let _ = fs::remove_file(&pair.working);
}

/// Native-binary record framing used by the incremental/repository files
/// and by the respool/fcfiles poll-dir sources that read them back: a
/// `u32` little-endian length prefix followed by a `bincode`-encoded
/// [`FlowRecord`].
pub fn encode_record(record: &FlowRecord) -> Result<Vec<u8>> {
    let body = bincode::serialize(record)?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn write_record(w: &mut impl Write, record: &FlowRecord) -> Result<()> {
    let bytes = encode_record(record)?;
    w.write_all(&bytes)?;
    Ok(())
}

/// Read one record. Returns `Ok(None)` on a clean end-of-stream (zero
/// bytes read before the length prefix); any other short read is an
/// error, since it means the file was truncated mid-record.
pub fn read_record(r: &mut impl Read) -> Result<Option<FlowRecord>> {
    let mut len_buf = [0u8; 4];
    let n = read_fully(r, &mut len_buf)?;
    if n == 0 {
        return Ok(None);
    }
    if n != 4 {
        return Err(WireError::ShortRead {
            expected: 4,
            got: n,
        });
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    let got = read_fully(r, &mut body)?;
    if got != len {
        return Err(WireError::ShortRead { expected: len, got });
    }
    Ok(Some(bincode::deserialize(&body)?))
}

fn read_fully(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = r.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}
