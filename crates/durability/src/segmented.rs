//! File-backed replay log.
//!
//! [`SegmentedReplayLog`] appends framed records to `log-NNNNNN.seg` files
//! in one directory, rotating to a new segment when the active one reaches
//! the configured size.
//!
//! # Recovery rules
//!
//! - A record cut short at the end of the last segment (length prefix
//!   points past EOF, or checksum fails on a record that ends exactly at
//!   EOF) is a torn write. Opening the log truncates it.
//! - Any other invalid record is corruption. Opening or reading halts with
//!   [`LogError::Corruption`]; nothing after the bad record is returned.
//! - Positions must be contiguous from 1 across all segments.

use crate::codec::{IdentityCodec, StorageCodec};
use crate::config::LogConfig;
use crate::format::{LogRecord, LogRecordError, LogSegment, SEGMENT_HEADER_SIZE};
use crate::log::{LogCounters, LogEntry, LogError, LogIter, ReplayLog};
use crate::mode::DurabilityMode;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Mutable writer state, guarded by one mutex so appends are serialized.
struct WriterState {
    segment: LogSegment,
    last_position: u64,
    writes_since_sync: usize,
    last_sync: Instant,
    has_unsynced: bool,
    counters: LogCounters,
}

/// Replay log stored as segment files.
pub struct SegmentedReplayLog {
    dir: PathBuf,
    config: LogConfig,
    durability: DurabilityMode,
    codec: Box<dyn StorageCodec>,
    state: Mutex<WriterState>,
    last_position: AtomicU64,
}

impl SegmentedReplayLog {
    /// Open (or create) a log in `dir` with the identity codec.
    pub fn open(
        dir: impl AsRef<Path>,
        durability: DurabilityMode,
        config: LogConfig,
    ) -> Result<Self, LogError> {
        Self::open_with_codec(dir, durability, config, Box::new(IdentityCodec))
    }

    /// Open (or create) a log in `dir`.
    ///
    /// Existing segments are scanned: a torn tail is truncated and the last
    /// position is recovered. Corruption anywhere else fails the open.
    pub fn open_with_codec(
        dir: impl AsRef<Path>,
        durability: DurabilityMode,
        config: LogConfig,
        codec: Box<dyn StorageCodec>,
    ) -> Result<Self, LogError> {
        config.validate()?;
        if !durability.requires_files() {
            return Err(LogError::UnsupportedMode(
                "cache durability keeps no log files; use MemoryReplayLog".to_string(),
            ));
        }

        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut segments = LogSegment::list_segments(&dir)?;
        discard_headerless_tail(&dir, &mut segments)?;

        let (segment, last_position) = if segments.is_empty() {
            let uuid = *Uuid::new_v4().as_bytes();
            (LogSegment::create(&dir, 1, uuid)?, 0)
        } else {
            recover_tail(&dir, &segments)?
        };

        info!(
            target: "corvid::log",
            dir = %dir.display(),
            segment = segment.segment_number(),
            last_position,
            codec = codec.codec_id(),
            "Opened replay log"
        );

        Ok(SegmentedReplayLog {
            dir,
            config,
            durability,
            codec,
            last_position: AtomicU64::new(last_position),
            state: Mutex::new(WriterState {
                segment,
                last_position,
                writes_since_sync: 0,
                last_sync: Instant::now(),
                has_unsynced: false,
                counters: LogCounters::default(),
            }),
        })
    }

    /// Directory holding the segments.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durability mode the log was opened with.
    pub fn durability(&self) -> DurabilityMode {
        self.durability
    }

    /// Number of the segment currently written.
    pub fn active_segment(&self) -> u64 {
        self.state.lock().segment.segment_number()
    }

    fn rotate(&self, state: &mut WriterState) -> Result<(), LogError> {
        state.segment.sync()?;
        let next = state.segment.segment_number() + 1;
        let uuid = state.segment.log_uuid();
        state.segment = LogSegment::create(&self.dir, next, uuid)?;
        state.counters.rotations += 1;
        state.counters.sync_calls += 1;
        state.writes_since_sync = 0;
        state.has_unsynced = false;
        state.last_sync = Instant::now();
        debug!(target: "corvid::log", segment = next, "Rotated replay log segment");
        Ok(())
    }

    fn sync_due(&self, state: &WriterState) -> bool {
        match self.durability {
            DurabilityMode::Always => true,
            DurabilityMode::Standard {
                interval_ms,
                batch_size,
            } => {
                state.writes_since_sync >= batch_size
                    || state.last_sync.elapsed() >= Duration::from_millis(interval_ms)
            }
            DurabilityMode::Cache => false,
        }
    }

    fn sync_locked(state: &mut WriterState) -> Result<(), LogError> {
        state.segment.sync()?;
        state.counters.sync_calls += 1;
        state.writes_since_sync = 0;
        state.has_unsynced = false;
        state.last_sync = Instant::now();
        Ok(())
    }
}

impl ReplayLog for SegmentedReplayLog {
    fn append(&self, payload: &[u8]) -> Result<u64, LogError> {
        if payload.len() as u64 > self.config.max_record_size {
            return Err(LogError::RecordTooLarge {
                size: payload.len() as u64,
                max: self.config.max_record_size,
            });
        }

        let mut state = self.state.lock();
        let position = state.last_position + 1;
        let bytes = LogRecord::new(position, self.codec.encode(payload)).to_bytes();

        if state.segment.size() > SEGMENT_HEADER_SIZE as u64
            && state.segment.size() + bytes.len() as u64 > self.config.segment_size
        {
            self.rotate(&mut state)?;
        }

        let before = state.segment.size();
        let mut result = state.segment.write(&bytes).map_err(LogError::from);
        if result.is_ok() {
            state.writes_since_sync += 1;
            state.has_unsynced = true;
            if self.sync_due(&state) {
                result = Self::sync_locked(&mut state);
            }
        }

        if let Err(e) = result {
            // An append that reports failure must not survive into replay.
            if let Err(truncate_err) = state.segment.truncate(before) {
                error!(
                    target: "corvid::log",
                    dir = %self.dir.display(),
                    error = %truncate_err,
                    "Failed to roll back partial append"
                );
            }
            return Err(e);
        }

        state.last_position = position;
        state.counters.appends += 1;
        state.counters.bytes_written += bytes.len() as u64;
        self.last_position.store(position, Ordering::Release);
        Ok(position)
    }

    fn read_from(&self, from: u64) -> Result<LogIter<'_>, LogError> {
        let segments = LogSegment::list_segments(&self.dir)?;
        let last_segment = segments.last().copied().unwrap_or(0);
        Ok(Box::new(SegmentReader {
            dir: &self.dir,
            codec: self.codec.as_ref(),
            segments: segments.into_iter(),
            last_segment,
            log_uuid: None,
            current: None,
            from,
            expected: 1,
            done: false,
        }))
    }

    fn last_position(&self) -> u64 {
        self.last_position.load(Ordering::Acquire)
    }

    fn flush(&self) -> Result<(), LogError> {
        let mut state = self.state.lock();
        if state.has_unsynced {
            Self::sync_locked(&mut state)?;
        }
        Ok(())
    }

    fn counters(&self) -> LogCounters {
        self.state.lock().counters.clone()
    }
}

impl Drop for SegmentedReplayLog {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(target: "corvid::log", dir = %self.dir.display(), error = %e, "Final log flush failed");
        }
    }
}

/// A segment whose header never made it to disk is a torn rotation.
fn discard_headerless_tail(dir: &Path, segments: &mut Vec<u64>) -> Result<(), LogError> {
    while let Some(&last) = segments.last() {
        let path = LogSegment::segment_path(dir, last);
        if std::fs::metadata(&path)?.len() >= SEGMENT_HEADER_SIZE as u64 {
            break;
        }
        warn!(target: "corvid::log", segment = last, "Removing segment with torn header");
        std::fs::remove_file(&path)?;
        segments.pop();
    }
    Ok(())
}

fn recover_tail(dir: &Path, segments: &[u64]) -> Result<(LogSegment, u64), LogError> {
    let Some((&last, earlier)) = segments.split_last() else {
        return Err(LogError::UnsupportedMode("no segments to recover".to_string()));
    };

    let mut segment = LogSegment::open_append(dir, last).map_err(|e| header_error(last, e))?;
    let (_, body) = LogSegment::read_all(dir, last)?;
    let scan = scan_body(last, &body, true)?;

    if scan.valid_len < body.len() {
        warn!(
            target: "corvid::log",
            segment = last,
            valid_bytes = scan.valid_len,
            torn_bytes = body.len() - scan.valid_len,
            "Truncating torn tail of replay log"
        );
        segment.truncate((SEGMENT_HEADER_SIZE + scan.valid_len) as u64)?;
    }

    let mut last_position = scan.last_position;
    for &n in earlier.iter().rev() {
        if last_position.is_some() {
            break;
        }
        let (_, body) = LogSegment::read_all(dir, n).map_err(|e| header_error(n, e))?;
        last_position = scan_body(n, &body, false)?.last_position;
    }

    Ok((segment, last_position.unwrap_or(0)))
}

struct ScanResult {
    valid_len: usize,
    last_position: Option<u64>,
}

fn scan_body(segment: u64, body: &[u8], is_last: bool) -> Result<ScanResult, LogError> {
    let mut offset = 0;
    let mut last_position = None;
    while offset < body.len() {
        match LogRecord::from_bytes(&body[offset..]) {
            Ok((record, consumed)) => {
                last_position = Some(record.position);
                offset += consumed;
            }
            Err(e) if is_last && is_torn(&e, &body[offset..]) => break,
            Err(e) => {
                return Err(LogError::Corruption {
                    segment,
                    offset: offset as u64,
                    detail: e.to_string(),
                })
            }
        }
    }
    Ok(ScanResult {
        valid_len: offset,
        last_position,
    })
}

/// True if a parse failure at `rest` looks like an interrupted final write.
fn is_torn(error: &LogRecordError, rest: &[u8]) -> bool {
    match error {
        LogRecordError::InsufficientData => true,
        LogRecordError::ChecksumMismatch { .. } => {
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&rest[0..4]);
            4 + u32::from_le_bytes(len_bytes) as usize == rest.len()
        }
        _ => false,
    }
}

fn header_error(segment: u64, e: std::io::Error) -> LogError {
    if e.kind() == std::io::ErrorKind::InvalidData {
        LogError::Corruption {
            segment,
            offset: 0,
            detail: e.to_string(),
        }
    } else {
        LogError::Io(e)
    }
}

/// Lazy reader: loads one segment at a time.
struct SegmentReader<'a> {
    dir: &'a Path,
    codec: &'a dyn StorageCodec,
    segments: std::vec::IntoIter<u64>,
    last_segment: u64,
    log_uuid: Option<[u8; 16]>,
    current: Option<(u64, Vec<u8>, usize)>,
    from: u64,
    expected: u64,
    done: bool,
}

impl SegmentReader<'_> {
    fn advance(&mut self) -> Result<Option<LogEntry>, LogError> {
        loop {
            let Some((segment, body, offset)) = self.current.as_mut() else {
                let Some(n) = self.segments.next() else {
                    return Ok(None);
                };
                let (header, body) = match LogSegment::read_all(self.dir, n) {
                    Ok(loaded) => loaded,
                    // Segment created by a concurrent rotation, header not yet complete.
                    Err(e)
                        if n == self.last_segment
                            && e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        return Ok(None)
                    }
                    Err(e) => return Err(header_error(n, e)),
                };
                match self.log_uuid {
                    None => self.log_uuid = Some(header.log_uuid),
                    Some(uuid) if uuid != header.log_uuid => {
                        return Err(LogError::Corruption {
                            segment: n,
                            offset: 0,
                            detail: "segment belongs to a different log".to_string(),
                        })
                    }
                    Some(_) => {}
                }
                self.current = Some((n, body, 0));
                continue;
            };

            if *offset >= body.len() {
                self.current = None;
                continue;
            }

            match LogRecord::from_bytes(&body[*offset..]) {
                Ok((record, consumed)) => {
                    *offset += consumed;
                    if record.position != self.expected {
                        return Err(LogError::PositionGap {
                            expected: self.expected,
                            found: record.position,
                        });
                    }
                    self.expected += 1;
                    if record.position < self.from {
                        continue;
                    }
                    let payload = self.codec.decode(&record.payload)?;
                    return Ok(Some(LogEntry {
                        position: record.position,
                        payload,
                    }));
                }
                Err(e) if *segment == self.last_segment && is_torn(&e, &body[*offset..]) => {
                    return Ok(None)
                }
                Err(e) => {
                    return Err(LogError::Corruption {
                        segment: *segment,
                        offset: *offset as u64,
                        detail: e.to_string(),
                    })
                }
            }
        }
    }
}

impl Iterator for SegmentReader<'_> {
    type Item = Result<LogEntry, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn open(dir: &Path) -> SegmentedReplayLog {
        SegmentedReplayLog::open(dir, DurabilityMode::Always, LogConfig::for_testing()).unwrap()
    }

    fn read_all(log: &SegmentedReplayLog, from: u64) -> Vec<LogEntry> {
        log.read_from(from)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    fn last_segment_path(dir: &Path) -> PathBuf {
        let segments = LogSegment::list_segments(dir).unwrap();
        LogSegment::segment_path(dir, *segments.last().unwrap())
    }

    #[test]
    fn test_positions_start_at_one() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        assert_eq!(log.last_position(), 0);
        assert_eq!(log.append(b"a").unwrap(), 1);
        assert_eq!(log.append(b"b").unwrap(), 2);
        assert_eq!(log.last_position(), 2);

        let entries = read_all(&log, 1);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].payload, b"a");
        assert_eq!(entries[1].position, 2);
    }

    #[test]
    fn test_read_from_middle() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        for i in 0..10u8 {
            log.append(&[i]).unwrap();
        }
        let entries = read_all(&log, 7);
        let positions: Vec<u64> = entries.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![7, 8, 9, 10]);
        assert_eq!(entries[0].payload, vec![6u8]);
        assert!(read_all(&log, 11).is_empty());
    }

    #[test]
    fn test_reopen_continues_positions() {
        let dir = tempdir().unwrap();
        {
            let log = open(dir.path());
            log.append(b"one").unwrap();
            log.append(b"two").unwrap();
        }
        let log = open(dir.path());
        assert_eq!(log.last_position(), 2);
        assert_eq!(log.append(b"three").unwrap(), 3);
        assert_eq!(read_all(&log, 1).len(), 3);
    }

    #[test]
    fn test_rotation_keeps_positions_contiguous() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        let payload = vec![0xAB; 700];
        for _ in 0..20 {
            log.append(&payload).unwrap();
        }
        assert!(log.active_segment() > 1);
        assert!(log.counters().rotations > 0);

        let entries = read_all(&log, 1);
        assert_eq!(entries.len(), 20);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.position, i as u64 + 1);
        }
    }

    #[test]
    fn test_reopen_after_rotation_into_empty_segment() {
        let dir = tempdir().unwrap();
        {
            let log = open(dir.path());
            log.append(&vec![1u8; 3000]).unwrap();
        }
        // Simulate a crash right after rotation created an empty segment.
        let uuid = LogSegment::open_append(dir.path(), 1).unwrap().log_uuid();
        LogSegment::create(dir.path(), 2, uuid).unwrap();

        let log = open(dir.path());
        assert_eq!(log.last_position(), 1);
        assert_eq!(log.append(b"next").unwrap(), 2);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        {
            let log = open(dir.path());
            log.append(b"first").unwrap();
            log.append(b"second").unwrap();
        }
        let partial = LogRecord::new(3, b"third".to_vec()).to_bytes();
        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(last_segment_path(dir.path()))
                .unwrap();
            file.write_all(&partial[..partial.len() / 2]).unwrap();
        }

        let log = open(dir.path());
        assert_eq!(log.last_position(), 2);
        assert_eq!(log.append(b"third").unwrap(), 3);
        let entries = read_all(&log, 1);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].payload, b"third");
    }

    #[test]
    fn test_torn_checksum_at_end_is_truncated() {
        let dir = tempdir().unwrap();
        {
            let log = open(dir.path());
            log.append(b"first").unwrap();
        }
        let mut bad = LogRecord::new(2, b"second".to_vec()).to_bytes();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(last_segment_path(dir.path()))
                .unwrap();
            file.write_all(&bad).unwrap();
        }

        let log = open(dir.path());
        assert_eq!(log.last_position(), 1);
    }

    #[test]
    fn test_corruption_before_tail_halts_open() {
        let dir = tempdir().unwrap();
        {
            let log = open(dir.path());
            log.append(b"first").unwrap();
            log.append(b"second").unwrap();
            log.append(b"third").unwrap();
        }
        let path = last_segment_path(dir.path());
        let mut bytes = std::fs::read(&path).unwrap();
        // Flip a payload byte of the first record.
        bytes[SEGMENT_HEADER_SIZE + 14] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = SegmentedReplayLog::open(
            dir.path(),
            DurabilityMode::Always,
            LogConfig::for_testing(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, LogError::Corruption { offset: 0, .. }));
    }

    #[test]
    fn test_corruption_in_sealed_segment_halts_reader() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        for _ in 0..10 {
            log.append(&vec![7u8; 700]).unwrap();
        }
        assert!(log.active_segment() > 1);

        let first = LogSegment::segment_path(dir.path(), 1);
        let mut bytes = std::fs::read(&first).unwrap();
        bytes[SEGMENT_HEADER_SIZE + 20] ^= 0xFF;
        std::fs::write(&first, &bytes).unwrap();

        let results: Vec<_> = log.read_from(1).unwrap().collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(LogError::Corruption { segment: 1, .. })));
    }

    #[test]
    fn test_cache_mode_rejected() {
        let dir = tempdir().unwrap();
        let result =
            SegmentedReplayLog::open(dir.path(), DurabilityMode::Cache, LogConfig::for_testing());
        assert!(matches!(result, Err(LogError::UnsupportedMode(_))));
    }

    #[test]
    fn test_record_too_large() {
        let dir = tempdir().unwrap();
        let config = LogConfig::for_testing().with_max_record_size(16);
        let log = SegmentedReplayLog::open(dir.path(), DurabilityMode::Always, config).unwrap();
        assert!(matches!(
            log.append(&[0u8; 17]),
            Err(LogError::RecordTooLarge { size: 17, max: 16 })
        ));
        assert_eq!(log.last_position(), 0);
    }

    #[test]
    fn test_standard_mode_batches_syncs() {
        let dir = tempdir().unwrap();
        let log = SegmentedReplayLog::open(
            dir.path(),
            DurabilityMode::Standard {
                interval_ms: 60_000,
                batch_size: 4,
            },
            LogConfig::for_testing(),
        )
        .unwrap();
        for _ in 0..8 {
            log.append(b"x").unwrap();
        }
        assert_eq!(log.counters().sync_calls, 2);
        log.append(b"x").unwrap();
        log.flush().unwrap();
        assert_eq!(log.counters().sync_calls, 3);
    }

    #[test]
    fn test_concurrent_appends_are_contiguous() {
        let dir = tempdir().unwrap();
        let log = Arc::new(open(dir.path()));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|i| log.append(format!("{}-{}", t, i).as_bytes()).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut positions: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        positions.sort_unstable();
        assert_eq!(positions, (1..=100).collect::<Vec<_>>());
        assert_eq!(read_all(&log, 1).len(), 100);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_reopen_reads_back_every_payload(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..600), 1..30)
        ) {
            let dir = tempdir().unwrap();
            {
                let log = open(dir.path());
                for p in &payloads {
                    log.append(p).unwrap();
                }
            }
            let log = open(dir.path());
            let entries = read_all(&log, 1);
            prop_assert_eq!(entries.len(), payloads.len());
            for (entry, payload) in entries.iter().zip(payloads.iter()) {
                prop_assert_eq!(&entry.payload, payload);
            }
        }
    }
}
