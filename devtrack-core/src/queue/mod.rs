//! Bounded, disk-backed FIFO queue of pending payloads
//!
//! The queue stores opaque byte payloads in an append-only record log
//! (`queue.log`) and tracks consumption in a small cursor file
//! (`queue.cursor`). Appends are fsynced before they are acknowledged, so
//! anything `push_back` returned for survives a process kill.
//!
//! ## Capacity
//!
//! The queue never holds more than `capacity` live entries. Pushing onto a
//! full queue discards the oldest entry first and hands it back to the
//! caller, so newer events win under sustained outages.
//!
//! ## Claims
//!
//! Drains take entries with [`PersistentQueue::claim_front`] instead of
//! [`PersistentQueue::pop_front`]. A claimed entry leaves the live set (it
//! cannot be evicted or claimed twice) but stays on disk until it is
//! [acknowledged](PersistentQueue::acknowledge) or
//! [requeued](PersistentQueue::requeue). If the process dies in between,
//! the entry is back at the front on the next open.
//!
//! ## Compaction
//!
//! Consumed records are reclaimed lazily: the log is truncated outright once
//! nothing is live, and otherwise rewritten when the dead space is both
//! larger than [`COMPACT_MIN_BYTES`] and larger than the live data.

mod cursor;
mod log;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use cursor::{Cursor, CURSOR_TMP_FILE};
use log::{RecordLog, Slot, COMPACT_FILE, HEADER_LEN, LOG_FILE};

/// Dead bytes tolerated in the log before a rewrite is considered
pub const COMPACT_MIN_BYTES: u64 = 256 * 1024;

/// An entry taken from the front of the queue, pending a delivery verdict.
///
/// Pass it back to [`PersistentQueue::acknowledge`] or
/// [`PersistentQueue::requeue`]. A claim that is simply dropped stays
/// reserved until the queue is reopened.
#[derive(Debug)]
pub struct Claim {
    seq: u64,
    payload: Vec<u8>,
}

impl Claim {
    /// Sequence number of the claimed record
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Disk-backed FIFO queue with a fixed entry capacity
pub struct PersistentQueue {
    dir: PathBuf,
    capacity: usize,
    inner: Mutex<QueueInner>,
}

struct QueueInner {
    dir: PathBuf,
    log: RecordLog,
    cursor: Cursor,
    /// Live entries, oldest first
    live: VecDeque<Slot>,
    /// Entries handed out by `claim_front`
    claimed: Vec<Slot>,
    next_seq: u64,
    /// Disk bytes of live and claimed records
    needed_bytes: u64,
}

impl PersistentQueue {
    /// Open the queue stored in `dir`, creating it if needed
    pub async fn open(dir: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config(
                "queue capacity must be at least 1".to_string(),
            ));
        }

        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        remove_if_exists(&dir.join(COMPACT_FILE)).await?;
        remove_if_exists(&dir.join(CURSOR_TMP_FILE)).await?;

        let mut cursor = cursor::load(&dir).await?;
        let (log, slots) = RecordLog::open(&dir.join(LOG_FILE)).await?;

        let next_seq = slots
            .last()
            .map(|slot| slot.seq + 1)
            .unwrap_or(1)
            .max(cursor.head)
            .max(1);

        // Entries claimed before a restart come first; their seqs are below head.
        let mut live: VecDeque<Slot> = slots
            .iter()
            .filter(|slot| slot.seq < cursor.head && cursor.is_retained(slot.seq))
            .copied()
            .collect();
        let restored = live.len();
        live.extend(slots.iter().filter(|slot| slot.seq >= cursor.head).copied());

        let mut cursor_dirty = false;
        if restored != cursor.retained.len() {
            warn!(
                expected = cursor.retained.len(),
                found = restored,
                "Dropping retained queue entries missing from the log"
            );
            let head = cursor.head;
            cursor
                .retained
                .retain(|seq| *seq < head && slots.iter().any(|slot| slot.seq == *seq));
            cursor_dirty = true;
        }

        let needed_bytes = live.iter().map(Slot::disk_len).sum();
        let mut inner = QueueInner {
            dir: dir.clone(),
            log,
            cursor,
            live,
            claimed: Vec::new(),
            next_seq,
            needed_bytes,
        };

        // Capacity may have been lowered since the queue was written.
        while inner.live.len() > capacity {
            if let Some((seq, _)) = inner.take_front().await? {
                warn!(seq, capacity, "Queue over capacity after restart, discarding oldest entry");
            }
            cursor_dirty = true;
        }
        if cursor_dirty {
            cursor::store(&inner.dir, &inner.cursor).await?;
        }
        inner.maybe_compact().await?;

        info!(
            dir = %dir.display(),
            pending = inner.live.len(),
            restored,
            capacity,
            "Opened persistent queue"
        );

        Ok(Self {
            dir,
            capacity,
            inner: Mutex::new(inner),
        })
    }

    /// Directory holding the queue files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Maximum number of live entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live entries (claimed entries are not counted)
    pub async fn len(&self) -> usize {
        self.inner.lock().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Append a payload at the tail.
    ///
    /// When the queue is full, the oldest entry is discarded first and
    /// returned.
    pub async fn push_back(&self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().await;
        inner.push(payload, self.capacity).await
    }

    /// Remove and return the oldest entry
    pub async fn pop_front(&self) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().await;
        let popped = inner.take_front().await?;
        if popped.is_some() {
            cursor::store(&inner.dir, &inner.cursor).await?;
            inner.maybe_compact().await?;
        }
        Ok(popped.map(|(_, payload)| payload))
    }

    /// Take the oldest entry out of the live set without discarding it
    pub async fn claim_front(&self) -> Result<Option<Claim>> {
        let mut inner = self.inner.lock().await;
        let Some(slot) = inner.live.front().copied() else {
            return Ok(None);
        };

        let payload = inner.log.read(&slot).await?;
        if !inner.cursor.is_retained(slot.seq) {
            inner.cursor.head = slot.seq + 1;
            inner.cursor.retain(slot.seq);
            cursor::store(&inner.dir, &inner.cursor).await?;
        }
        inner.live.pop_front();
        inner.claimed.push(slot);

        debug!(seq = slot.seq, "Claimed queue entry");
        Ok(Some(Claim {
            seq: slot.seq,
            payload,
        }))
    }

    /// Discard a claimed entry for good
    pub async fn acknowledge(&self, claim: Claim) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.release(claim.seq).await
    }

    /// Put a claimed entry back at the tail as a fresh record.
    ///
    /// Like `push_back`, this may discard the oldest live entry, which is
    /// returned.
    pub async fn requeue(&self, claim: Claim) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().await;
        let evicted = inner.push(&claim.payload, self.capacity).await?;
        inner.release(claim.seq).await?;
        Ok(evicted)
    }
}

impl QueueInner {
    async fn push(&mut self, payload: &[u8], capacity: usize) -> Result<Option<Vec<u8>>> {
        let mut evicted = None;
        if self.live.len() >= capacity {
            if let Some((seq, payload)) = self.take_front().await? {
                warn!(seq, capacity, "Queue full, evicting oldest entry");
                cursor::store(&self.dir, &self.cursor).await?;
                evicted = Some(payload);
            }
        }

        let seq = self.next_seq;
        let slot = self.log.append(seq, payload).await?;
        self.next_seq += 1;
        self.needed_bytes += slot.disk_len();
        self.live.push_back(slot);

        debug!(seq, pending = self.live.len(), "Appended queue entry");
        Ok(evicted)
    }

    /// Drop the front live entry from memory and the cursor (not yet stored)
    async fn take_front(&mut self) -> Result<Option<(u64, Vec<u8>)>> {
        let Some(slot) = self.live.front().copied() else {
            return Ok(None);
        };
        let payload = self.log.read(&slot).await?;

        self.cursor.discard(slot.seq);
        self.live.pop_front();
        self.needed_bytes -= slot.disk_len();
        Ok(Some((slot.seq, payload)))
    }

    async fn release(&mut self, seq: u64) -> Result<()> {
        let Some(pos) = self.claimed.iter().position(|slot| slot.seq == seq) else {
            warn!(seq, "Ignoring release of unknown queue claim");
            return Ok(());
        };
        let slot = self.claimed.remove(pos);
        self.needed_bytes -= slot.disk_len();
        self.cursor.release(seq);
        cursor::store(&self.dir, &self.cursor).await?;
        self.maybe_compact().await
    }

    async fn maybe_compact(&mut self) -> Result<()> {
        if self.live.is_empty() && self.claimed.is_empty() {
            if self.log.end() > HEADER_LEN {
                self.log.truncate().await?;
                debug!("Queue drained, truncated log");
            }
            return Ok(());
        }

        let dead = self.log.end() - HEADER_LEN - self.needed_bytes;
        if dead < COMPACT_MIN_BYTES || dead < self.needed_bytes {
            return Ok(());
        }

        let mut keep: Vec<Slot> = self
            .claimed
            .iter()
            .chain(self.live.iter())
            .copied()
            .collect();
        keep.sort_by_key(|slot| slot.seq);

        let moved: HashMap<u64, Slot> = self
            .log
            .compact(&keep)
            .await?
            .into_iter()
            .map(|slot| (slot.seq, slot))
            .collect();
        for slot in self.live.iter_mut().chain(self.claimed.iter_mut()) {
            if let Some(new_slot) = moved.get(&slot.seq) {
                *slot = *new_slot;
            }
        }
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
