//! Replay log segment file and record format.
//!
//! Segments are named `log-NNNNNN.seg` where `NNNNNN` is a zero-padded
//! segment number starting at 1.
//!
//! # Segment Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Segment Header (32 bytes)          │
//! ├────────────────────────────────────┤
//! │ Record 1                           │
//! ├────────────────────────────────────┤
//! │ Record 2                           │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! # Record Layout
//!
//! ```text
//! ┌─────────────────┬────────────┬──────────────┬─────────────────────┬──────────┐
//! │ Length (4 bytes)│ Version (1)│ Position (8) │ Payload (variable)  │ CRC32 (4)│
//! └─────────────────┴────────────┴──────────────┴─────────────────────┴──────────┘
//! ```
//!
//! The length covers everything after itself (version, position, payload
//! and CRC). The CRC covers version, position and payload.

use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a replay log segment: "CRVD"
pub const SEGMENT_MAGIC: [u8; 4] = *b"CRVD";

/// Current segment format version
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Size of segment header in bytes
pub const SEGMENT_HEADER_SIZE: usize = 32;

/// Current record format version
pub const LOG_RECORD_FORMAT_VERSION: u8 = 1;

/// Bytes of framing around a payload: length + version + position + crc
pub const RECORD_OVERHEAD: usize = 4 + 1 + 8 + 4;

/// Segment header (32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Magic bytes: "CRVD"
    pub magic: [u8; 4],

    /// Format version for forward compatibility
    pub format_version: u32,

    /// Segment number (monotonically increasing)
    pub segment_number: u64,

    /// Log UUID, identical in every segment of one log
    pub log_uuid: [u8; 16],
}

impl SegmentHeader {
    /// Create a new segment header.
    pub fn new(segment_number: u64, log_uuid: [u8; 16]) -> Self {
        SegmentHeader {
            magic: SEGMENT_MAGIC,
            format_version: SEGMENT_FORMAT_VERSION,
            segment_number,
            log_uuid,
        }
    }

    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.segment_number.to_le_bytes());
        bytes[16..32].copy_from_slice(&self.log_uuid);
        bytes
    }

    /// Deserialize header from bytes.
    pub fn from_bytes(bytes: &[u8; SEGMENT_HEADER_SIZE]) -> Option<Self> {
        Some(SegmentHeader {
            magic: bytes[0..4].try_into().ok()?,
            format_version: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            segment_number: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
            log_uuid: bytes[16..32].try_into().ok()?,
        })
    }

    /// Validate magic bytes and format version.
    pub fn is_valid(&self) -> bool {
        self.magic == SEGMENT_MAGIC && self.format_version == SEGMENT_FORMAT_VERSION
    }
}

/// Read and validate the header of an open segment file.
fn read_header(file: &mut File, segment_number: u64) -> std::io::Result<SegmentHeader> {
    let mut header_bytes = [0u8; SEGMENT_HEADER_SIZE];
    file.read_exact(&mut header_bytes)?;

    let header = SegmentHeader::from_bytes(&header_bytes).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid segment header")
    })?;

    if !header.is_valid() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "invalid segment magic or version",
        ));
    }

    if header.segment_number != segment_number {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "segment number mismatch: expected {}, got {}",
                segment_number, header.segment_number
            ),
        ));
    }

    Ok(header)
}

/// Replay log segment file handle.
///
/// Only the active segment is written; older segments are immutable.
pub struct LogSegment {
    file: File,
    segment_number: u64,
    write_position: u64,
    path: PathBuf,
    log_uuid: [u8; 16],
}

impl LogSegment {
    /// Create a new segment file and write its header.
    pub fn create(dir: &Path, segment_number: u64, log_uuid: [u8; 16]) -> std::io::Result<Self> {
        let path = Self::segment_path(dir, segment_number);

        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&path)?;

        let header = SegmentHeader::new(segment_number, log_uuid);
        file.write_all(&header.to_bytes())?;

        Ok(LogSegment {
            file,
            segment_number,
            write_position: SEGMENT_HEADER_SIZE as u64,
            path,
            log_uuid,
        })
    }

    /// Open an existing segment for appending.
    pub fn open_append(dir: &Path, segment_number: u64) -> std::io::Result<Self> {
        let path = Self::segment_path(dir, segment_number);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let header = read_header(&mut file, segment_number)?;
        let write_position = file.seek(SeekFrom::End(0))?;

        Ok(LogSegment {
            file,
            segment_number,
            write_position,
            path,
            log_uuid: header.log_uuid,
        })
    }

    /// Read a whole segment: its header and every byte after it.
    pub fn read_all(dir: &Path, segment_number: u64) -> std::io::Result<(SegmentHeader, Vec<u8>)> {
        let path = Self::segment_path(dir, segment_number);
        let mut file = OpenOptions::new().read(true).open(&path)?;
        let header = read_header(&mut file, segment_number)?;
        let mut body = Vec::new();
        file.read_to_end(&mut body)?;
        Ok((header, body))
    }

    /// Segment file path: `log-NNNNNN.seg`.
    pub fn segment_path(dir: &Path, segment_number: u64) -> PathBuf {
        dir.join(format!("log-{:06}.seg", segment_number))
    }

    /// Parse a segment number out of a file name.
    pub fn parse_segment_name(name: &str) -> Option<u64> {
        name.strip_prefix("log-")?
            .strip_suffix(".seg")?
            .parse()
            .ok()
    }

    /// List segment numbers in a directory, ascending.
    pub fn list_segments(dir: &Path) -> std::io::Result<Vec<u64>> {
        let mut numbers = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(n) = entry
                .file_name()
                .to_str()
                .and_then(Self::parse_segment_name)
            {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Segment number.
    pub fn segment_number(&self) -> u64 {
        self.segment_number
    }

    /// Current segment size in bytes, header included.
    pub fn size(&self) -> u64 {
        self.write_position
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Log UUID from the header.
    pub fn log_uuid(&self) -> [u8; 16] {
        self.log_uuid
    }

    /// Append bytes at the end of the segment.
    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data)?;
        self.write_position += data.len() as u64;
        Ok(())
    }

    /// Sync segment data to disk.
    pub fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_data()
    }

    /// Truncate the segment at the given byte offset.
    ///
    /// Used when opening a log whose last write was torn.
    pub fn truncate(&mut self, position: u64) -> std::io::Result<()> {
        self.file.set_len(position)?;
        self.write_position = position;
        self.file.seek(SeekFrom::Start(position))?;
        self.file.sync_all()
    }
}

/// One framed entry of a replay log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Log position, contiguous from 1
    pub position: u64,

    /// Codec-encoded payload
    pub payload: Vec<u8>,
}

impl LogRecord {
    /// Create a new record.
    pub fn new(position: u64, payload: Vec<u8>) -> Self {
        LogRecord { position, payload }
    }

    /// Serialize record to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(9 + self.payload.len());
        body.push(LOG_RECORD_FORMAT_VERSION);
        body.extend_from_slice(&self.position.to_le_bytes());
        body.extend_from_slice(&self.payload);

        let crc = compute_crc(&body);

        let total_len = body.len() + 4;
        let mut record = Vec::with_capacity(4 + total_len);
        record.extend_from_slice(&(total_len as u32).to_le_bytes());
        record.extend_from_slice(&body);
        record.extend_from_slice(&crc.to_le_bytes());
        record
    }

    /// Deserialize a record from the front of `bytes`.
    ///
    /// Returns (record, bytes_consumed) on success.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), LogRecordError> {
        if bytes.len() < 4 {
            return Err(LogRecordError::InsufficientData);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[0..4]);
        let length = u32::from_le_bytes(len_bytes) as usize;

        // version + position + crc
        if length < 13 {
            return Err(LogRecordError::InvalidFormat);
        }

        if bytes.len() < 4 + length {
            return Err(LogRecordError::InsufficientData);
        }

        let body = &bytes[4..4 + length - 4];
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&bytes[4 + length - 4..4 + length]);
        let stored_crc = u32::from_le_bytes(crc_bytes);

        let computed_crc = compute_crc(body);
        if computed_crc != stored_crc {
            return Err(LogRecordError::ChecksumMismatch {
                expected: stored_crc,
                computed: computed_crc,
            });
        }

        let format_version = body[0];
        if format_version != LOG_RECORD_FORMAT_VERSION {
            return Err(LogRecordError::UnsupportedVersion(format_version));
        }

        let mut pos_bytes = [0u8; 8];
        pos_bytes.copy_from_slice(&body[1..9]);
        let position = u64::from_le_bytes(pos_bytes);

        Ok((
            LogRecord {
                position,
                payload: body[9..].to_vec(),
            },
            4 + length,
        ))
    }
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Record parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogRecordError {
    /// Not enough data to parse a record
    #[error("insufficient data to parse record")]
    InsufficientData,

    /// Record framing is invalid
    #[error("invalid record format")]
    InvalidFormat,

    /// Checksum verification failed
    #[error("checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the record
        expected: u32,
        /// Checksum computed over the bytes read
        computed: u32,
    },

    /// Unsupported record format version
    #[error("unsupported record format version: {0}")]
    UnsupportedVersion(u8),
}
