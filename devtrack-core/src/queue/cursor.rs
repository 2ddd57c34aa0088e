//! Durable description of which log records are still owed delivery
//!
//! A record is live when `seq >= head` or its seq is listed in `retained`.
//! `retained` holds records below `head` that were claimed by a drain and
//! not yet acknowledged; after a crash they are delivered again.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::log::sync_dir;
use crate::error::{Error, Result};

pub(crate) const CURSOR_FILE: &str = "queue.cursor";
pub(crate) const CURSOR_TMP_FILE: &str = "queue.cursor.tmp";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Cursor {
    pub head: u64,
    #[serde(default)]
    pub retained: Vec<u64>,
}

impl Cursor {
    pub fn is_retained(&self, seq: u64) -> bool {
        self.retained.binary_search(&seq).is_ok()
    }

    /// Keep `seq` live below the head
    pub fn retain(&mut self, seq: u64) {
        if let Err(pos) = self.retained.binary_search(&seq) {
            self.retained.insert(pos, seq);
        }
    }

    pub fn release(&mut self, seq: u64) {
        if let Ok(pos) = self.retained.binary_search(&seq) {
            self.retained.remove(pos);
        }
    }

    /// Discard the live record `seq` from the durable set
    pub fn discard(&mut self, seq: u64) {
        if seq >= self.head {
            self.head = seq + 1;
        } else {
            self.release(seq);
        }
    }
}

/// Load the cursor, or a fresh one if none was written yet
pub(crate) async fn load(dir: &Path) -> Result<Cursor> {
    let path = dir.join(CURSOR_FILE);
    match fs::read(&path).await {
        Ok(bytes) => {
            let mut cursor: Cursor = serde_json::from_slice(&bytes).map_err(|e| {
                Error::QueueCorrupt(format!("unreadable cursor {}: {}", path.display(), e))
            })?;
            cursor.retained.sort_unstable();
            cursor.retained.dedup();
            Ok(cursor)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Cursor::default()),
        Err(e) => Err(e.into()),
    }
}

/// Atomically replace the cursor on disk
pub(crate) async fn store(dir: &Path, cursor: &Cursor) -> Result<()> {
    let tmp = dir.join(CURSOR_TMP_FILE);
    let bytes = serde_json::to_vec(cursor)?;

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, dir.join(CURSOR_FILE)).await?;
    sync_dir(dir).await
}
