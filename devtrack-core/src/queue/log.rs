//! Append-only record file backing the queue
//!
//! Layout:
//!
//! ```text
//! header:  magic "DTQUEUE\0" (8) | version u32 LE (4) | reserved (4)
//! record:  seq u64 LE (8) | len u32 LE (4) | crc32 u32 LE (4) | payload (len)
//! ```
//!
//! The checksum covers `seq`, `len` and the payload, so a damaged length
//! field is caught like damaged payload bytes. Sequence numbers strictly
//! increase through the file. Gaps are normal after compaction.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub(crate) const LOG_FILE: &str = "queue.log";
pub(crate) const COMPACT_FILE: &str = "queue.log.compact";

const MAGIC: &[u8; 8] = b"DTQUEUE\0";
const VERSION: u32 = 2;
pub(crate) const HEADER_LEN: u64 = 16;
const RECORD_HEADER_LEN: usize = 8 + 4 + 4;

/// Location of one record in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slot {
    pub seq: u64,
    pub offset: u64,
    pub len: u32,
}

impl Slot {
    /// Bytes occupied on disk, header included
    pub fn disk_len(&self) -> u64 {
        RECORD_HEADER_LEN as u64 + u64::from(self.len)
    }
}

pub(crate) struct RecordLog {
    path: PathBuf,
    file: File,
    /// Offset where the next record is written
    end: u64,
}

impl RecordLog {
    /// Open or create the log, returning every intact record in file order.
    ///
    /// A torn tail (a partial or damaged record with nothing intact after
    /// it) is truncated. Damage followed by an intact record is reported as
    /// corruption.
    pub async fn open(path: &Path) -> Result<(Self, Vec<Slot>)> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .await?;

        let len = file.metadata().await?.len();
        if len < HEADER_LEN {
            if len > 0 {
                // Only a crash during creation leaves a short header behind.
                warn!(path = %path.display(), len, "Rewriting incomplete queue log header");
                file.set_len(0).await?;
            }
            write_header(&mut file).await?;
            return Ok((
                Self {
                    path: path.to_path_buf(),
                    file,
                    end: HEADER_LEN,
                },
                Vec::new(),
            ));
        }

        let mut buf = Vec::with_capacity(len as usize);
        file.seek(SeekFrom::Start(0)).await?;
        file.read_to_end(&mut buf).await?;

        validate_header(&buf)?;
        let (slots, end) = parse_records(&buf)?;

        if end < buf.len() as u64 {
            warn!(
                path = %path.display(),
                discarded_bytes = buf.len() as u64 - end,
                "Truncating torn record at end of queue log"
            );
            file.set_len(end).await?;
            file.sync_all().await?;
        }

        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                end,
            },
            slots,
        ))
    }

    /// Offset one past the last record
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Durably append one record
    pub async fn append(&mut self, seq: u64, payload: &[u8]) -> Result<Slot> {
        let record = encode_record(seq, payload)?;

        self.file.seek(SeekFrom::Start(self.end)).await?;
        self.file.write_all(&record).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;

        let slot = Slot {
            seq,
            offset: self.end,
            len: payload.len() as u32,
        };
        self.end += record.len() as u64;
        Ok(slot)
    }

    /// Read and verify the payload of a record
    pub async fn read(&mut self, slot: &Slot) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(slot.offset)).await?;

        let mut header = [0u8; RECORD_HEADER_LEN];
        self.file.read_exact(&mut header).await?;
        let (seq, len, crc) = decode_record_header(&header);

        if seq != slot.seq || len != slot.len {
            return Err(Error::QueueCorrupt(format!(
                "record at offset {} is seq {} len {}, expected seq {} len {}",
                slot.offset, seq, len, slot.seq, slot.len
            )));
        }

        let mut payload = vec![0u8; len as usize];
        self.file.read_exact(&mut payload).await?;

        if record_checksum(seq, len, &payload) != crc {
            return Err(Error::QueueCorrupt(format!(
                "checksum mismatch for seq {} at offset {}",
                seq, slot.offset
            )));
        }

        Ok(payload)
    }

    /// Drop every record, keeping only the header
    pub async fn truncate(&mut self) -> Result<()> {
        self.file.set_len(HEADER_LEN).await?;
        self.file.sync_all().await?;
        self.end = HEADER_LEN;
        Ok(())
    }

    /// Rewrite the log so it holds only `keep`, which must be sorted by seq.
    ///
    /// Records keep their sequence numbers. The new file is built next to
    /// the old one and renamed over it, so a crash leaves one or the other.
    pub async fn compact(&mut self, keep: &[Slot]) -> Result<Vec<Slot>> {
        let tmp_path = self.path.with_file_name(COMPACT_FILE);
        let mut out = File::create(&tmp_path).await?;
        write_header(&mut out).await?;

        let mut moved = Vec::with_capacity(keep.len());
        let mut offset = HEADER_LEN;
        for slot in keep {
            let payload = self.read(slot).await?;
            let record = encode_record(slot.seq, &payload)?;
            out.write_all(&record).await?;
            moved.push(Slot {
                seq: slot.seq,
                offset,
                len: slot.len,
            });
            offset += record.len() as u64;
        }
        out.flush().await?;
        out.sync_all().await?;
        drop(out);

        fs::rename(&tmp_path, &self.path).await?;
        if let Some(dir) = self.path.parent() {
            sync_dir(dir).await?;
        }

        self.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await?;

        debug!(
            path = %self.path.display(),
            before = self.end,
            after = offset,
            records = moved.len(),
            "Compacted queue log"
        );
        self.end = offset;
        Ok(moved)
    }
}

/// Make a rename inside `dir` durable
pub(crate) async fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(dir).await?.sync_all().await?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

async fn write_header(file: &mut File) -> Result<()> {
    let mut buf = [0u8; HEADER_LEN as usize];
    buf[..8].copy_from_slice(MAGIC);
    buf[8..12].copy_from_slice(&VERSION.to_le_bytes());
    file.seek(SeekFrom::Start(0)).await?;
    file.write_all(&buf).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

fn validate_header(buf: &[u8]) -> Result<()> {
    if &buf[..8] != MAGIC {
        return Err(Error::QueueCorrupt("invalid queue log magic".to_string()));
    }
    let version = read_u32(&buf[8..12]);
    if version != VERSION {
        return Err(Error::QueueCorrupt(format!(
            "unsupported queue log version: {version}"
        )));
    }
    Ok(())
}

/// Walk the records after the header. Returns the intact records and the
/// offset just past the last one.
fn parse_records(buf: &[u8]) -> Result<(Vec<Slot>, u64)> {
    let mut slots: Vec<Slot> = Vec::new();
    let mut offset = HEADER_LEN as usize;

    while offset < buf.len() {
        let prev_seq = slots.last().map(|slot| slot.seq);

        let Some(slot) = intact_record_at(buf, offset) else {
            // Only the final append can be torn. Anything intact past the
            // damage was committed after it.
            if let Some(later) = next_intact_record(buf, offset + 1, prev_seq) {
                return Err(Error::QueueCorrupt(format!(
                    "damaged record at offset {} precedes intact seq {} at offset {}",
                    offset, later.seq, later.offset
                )));
            }
            break;
        };

        if let Some(prev) = prev_seq {
            if slot.seq <= prev {
                return Err(Error::QueueCorrupt(format!(
                    "sequence {} at offset {} does not follow {}",
                    slot.seq, offset, prev
                )));
            }
        }

        offset += slot.disk_len() as usize;
        slots.push(slot);
    }

    Ok((slots, offset as u64))
}

/// The record starting at `offset`, if it is complete and its checksum holds
fn intact_record_at(buf: &[u8], offset: usize) -> Option<Slot> {
    let header_end = offset.checked_add(RECORD_HEADER_LEN)?;
    let header = buf.get(offset..header_end)?;
    let (seq, len, crc) = decode_record_header(header);

    let record_end = header_end.checked_add(len as usize)?;
    let payload = buf.get(header_end..record_end)?;
    if record_checksum(seq, len, payload) != crc {
        return None;
    }

    Some(Slot {
        seq,
        offset: offset as u64,
        len,
    })
}

/// First intact record at or after `from` whose seq could follow `prev_seq`
fn next_intact_record(buf: &[u8], from: usize, prev_seq: Option<u64>) -> Option<Slot> {
    let last_start = buf.len().checked_sub(RECORD_HEADER_LEN)?;
    (from..=last_start)
        .filter_map(|offset| intact_record_at(buf, offset))
        .find(|slot| prev_seq.map_or(true, |prev| slot.seq > prev))
}

fn record_checksum(seq: u64, len: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&seq.to_le_bytes());
    hasher.update(&len.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn encode_record(seq: u64, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("payload of {} bytes is too large", payload.len()),
        )
    })?;

    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    record.extend_from_slice(&seq.to_le_bytes());
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(&record_checksum(seq, len, payload).to_le_bytes());
    record.extend_from_slice(payload);
    Ok(record)
}

fn decode_record_header(header: &[u8]) -> (u64, u32, u32) {
    (
        read_u64(&header[..8]),
        read_u32(&header[8..12]),
        read_u32(&header[12..16]),
    )
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOG_FILE);

        let (mut log, slots) = RecordLog::open(&path).await.unwrap();
        assert!(slots.is_empty());
        assert_eq!(log.end(), HEADER_LEN);

        let a = log.append(1, b"alpha").await.unwrap();
        let b = log.append(2, b"beta").await.unwrap();
        assert_eq!(a.offset, HEADER_LEN);
        assert_eq!(b.offset, HEADER_LEN + a.disk_len());
        assert_eq!(log.read(&b).await.unwrap(), b"beta");
        drop(log);

        let (mut log, slots) = RecordLog::open(&path).await.unwrap();
        assert_eq!(slots, vec![a, b]);
        assert_eq!(log.read(&a).await.unwrap(), b"alpha");
    }

    #[tokio::test]
    async fn test_partial_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOG_FILE);

        let (mut log, _) = RecordLog::open(&path).await.unwrap();
        let a = log.append(1, b"kept").await.unwrap();
        let end = log.end();
        drop(log);

        // Simulate a kill halfway through the next append.
        let mut torn = encode_record(2, b"lost in flight").unwrap();
        torn.truncate(torn.len() - 3);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&torn);
        std::fs::write(&path, &bytes).unwrap();

        let (log, slots) = RecordLog::open(&path).await.unwrap();
        assert_eq!(slots, vec![a]);
        assert_eq!(log.end(), end);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), end);
    }

    #[tokio::test]
    async fn test_bad_checksum_on_last_record_is_torn() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOG_FILE);

        let (mut log, _) = RecordLog::open(&path).await.unwrap();
        let a = log.append(1, b"first").await.unwrap();
        log.append(2, b"second").await.unwrap();
        drop(log);

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let (_, slots) = RecordLog::open(&path).await.unwrap();
        assert_eq!(slots, vec![a]);
    }

    #[tokio::test]
    async fn test_interior_corruption_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOG_FILE);

        let (mut log, _) = RecordLog::open(&path).await.unwrap();
        let a = log.append(1, b"first").await.unwrap();
        log.append(2, b"second").await.unwrap();
        drop(log);

        let mut bytes = std::fs::read(&path).unwrap();
        let inside_first = (a.offset as usize) + RECORD_HEADER_LEN;
        bytes[inside_first] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            RecordLog::open(&path).await,
            Err(Error::QueueCorrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_damaged_interior_length_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOG_FILE);

        let (mut log, _) = RecordLog::open(&path).await.unwrap();
        let first = log.append(1, b"first").await.unwrap();
        log.append(2, b"second").await.unwrap();
        log.append(3, b"third").await.unwrap();
        drop(log);

        // Push the first record's length far past the end of the file.
        let mut bytes = std::fs::read(&path).unwrap();
        let len_high_byte = first.offset as usize + 8 + 3;
        bytes[len_high_byte] ^= 0x10;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            RecordLog::open(&path).await,
            Err(Error::QueueCorrupt(_))
        ));
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            bytes.len() as u64
        );
    }

    #[tokio::test]
    async fn test_damaged_sequence_number_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOG_FILE);

        let (mut log, _) = RecordLog::open(&path).await.unwrap();
        let first = log.append(1, b"first").await.unwrap();
        log.append(2, b"second").await.unwrap();
        drop(log);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[first.offset as usize] ^= 0x04;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            RecordLog::open(&path).await,
            Err(Error::QueueCorrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_magic_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOG_FILE);
        std::fs::write(&path, b"NOTAQUEUE-------").unwrap();

        assert!(matches!(
            RecordLog::open(&path).await,
            Err(Error::QueueCorrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_compact_preserves_sequences() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOG_FILE);

        let (mut log, _) = RecordLog::open(&path).await.unwrap();
        let mut slots = Vec::new();
        for seq in 1..=5u64 {
            slots.push(log.append(seq, format!("p{seq}").as_bytes()).await.unwrap());
        }

        let keep = vec![slots[1], slots[4]];
        let moved = log.compact(&keep).await.unwrap();
        assert_eq!(moved.len(), 2);
        assert_eq!(moved[0].seq, 2);
        assert_eq!(moved[0].offset, HEADER_LEN);
        assert_eq!(moved[1].seq, 5);
        assert_eq!(log.read(&moved[1]).await.unwrap(), b"p5");
        assert!(!dir.path().join(COMPACT_FILE).exists());

        let next = log.append(6, b"p6").await.unwrap();
        drop(log);

        let (_, reopened) = RecordLog::open(&path).await.unwrap();
        assert_eq!(reopened, vec![moved[0], moved[1], next]);
    }
}
