//! Audit persistence.
//!
//! The ledger owns hashing and ordering; a store only keeps what it is given.
//! Two stores ship with the crate: an in-memory one for tests and embedded
//! use, and a JSON-lines store on the local filesystem.

use super::checkpoint::Checkpoint;
use super::event::AuditEvent;
use crate::error::GatewayError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// What a retention purge removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeSummary {
    pub purged: usize,
    /// Last purged sequence.
    pub through_sequence: u64,
    /// Chain hash of the last purged event; the next event links to it.
    pub chain_hash: String,
}

#[async_trait]
pub trait AuditStore: Send + Sync + std::fmt::Debug {
    /// Persist a batch in sequence order. Sequences already stored are
    /// skipped, so a retried batch is never duplicated.
    async fn append_batch(&self, events: &[AuditEvent]) -> Result<(), GatewayError>;

    /// Events with sequence in `range`, ascending.
    async fn load_range(&self, range: Range<u64>) -> Result<Vec<AuditEvent>, GatewayError>;

    /// Non-tombstoned events whose subject or actor is `subject_key`.
    async fn load_subject(&self, subject_key: &str) -> Result<Vec<AuditEvent>, GatewayError>;

    /// Replace the listed events with tombstones; returns how many changed.
    async fn tombstone(&self, sequences: &[u64]) -> Result<usize, GatewayError>;

    /// Remove the contiguous oldest run of events timestamped before `cutoff`.
    async fn purge_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<PurgeSummary>, GatewayError>;

    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), GatewayError>;

    /// All checkpoints, ascending by sequence.
    async fn checkpoints(&self) -> Result<Vec<Checkpoint>, GatewayError>;

    /// First and last stored sequence.
    async fn bounds(&self) -> Result<Option<(u64, u64)>, GatewayError>;

    async fn tail(&self) -> Result<Option<AuditEvent>, GatewayError> {
        match self.bounds().await? {
            Some((_, last)) => Ok(self.load_range(last..last + 1).await?.pop()),
            None => Ok(None),
        }
    }

    async fn load_sequences(&self, sequences: &[u64]) -> Result<Vec<AuditEvent>, GatewayError> {
        let mut events = Vec::with_capacity(sequences.len());
        for &sequence in sequences {
            events.extend(self.load_range(sequence..sequence + 1).await?);
        }
        Ok(events)
    }
}

/// Event and checkpoint index shared by both stores.
#[derive(Debug, Default)]
struct EventIndex {
    events: BTreeMap<u64, AuditEvent>,
    checkpoints: BTreeMap<u64, Checkpoint>,
}

impl EventIndex {
    fn next_unstored<'a>(&self, events: &'a [AuditEvent]) -> Vec<&'a AuditEvent> {
        let last = self.events.keys().next_back().copied();
        events
            .iter()
            .filter(|e| last.map_or(true, |l| e.sequence > l))
            .collect()
    }

    fn range(&self, range: Range<u64>) -> Vec<AuditEvent> {
        if range.start >= range.end {
            return Vec::new();
        }
        self.events.range(range).map(|(_, e)| e.clone()).collect()
    }

    fn subject(&self, subject_key: &str) -> Vec<AuditEvent> {
        self.events
            .values()
            .filter(|e| !e.tombstone && e.concerns(subject_key))
            .cloned()
            .collect()
    }

    fn tombstone(&mut self, sequences: &[u64]) -> usize {
        let mut changed = 0;
        for sequence in sequences {
            match self.events.remove(sequence) {
                Some(event) if !event.tombstone => {
                    self.events.insert(*sequence, event.into_tombstone());
                    changed += 1;
                }
                Some(event) => {
                    self.events.insert(*sequence, event);
                }
                None => {}
            }
        }
        changed
    }

    fn purge(&mut self, cutoff: DateTime<Utc>) -> Option<PurgeSummary> {
        let doomed: Vec<u64> = self
            .events
            .values()
            .take_while(|e| e.timestamp < cutoff)
            .map(|e| e.sequence)
            .collect();
        let through = *doomed.last()?;
        let chain_hash = self.events.get(&through)?.self_hash.clone();
        for sequence in &doomed {
            self.events.remove(sequence);
        }
        Some(PurgeSummary {
            purged: doomed.len(),
            through_sequence: through,
            chain_hash,
        })
    }

    fn bounds(&self) -> Option<(u64, u64)> {
        let first = *self.events.keys().next()?;
        let last = *self.events.keys().next_back()?;
        Some((first, last))
    }
}

/// Volatile store.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    inner: Mutex<EventIndex>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn tamper(&self, sequence: u64, edit: impl FnOnce(&mut AuditEvent)) {
        if let Some(event) = self.inner.lock().events.get_mut(&sequence) {
            edit(event);
        }
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append_batch(&self, events: &[AuditEvent]) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock();
        let fresh: Vec<AuditEvent> = inner.next_unstored(events).into_iter().cloned().collect();
        for event in fresh {
            inner.events.insert(event.sequence, event);
        }
        Ok(())
    }

    async fn load_range(&self, range: Range<u64>) -> Result<Vec<AuditEvent>, GatewayError> {
        Ok(self.inner.lock().range(range))
    }

    async fn load_subject(&self, subject_key: &str) -> Result<Vec<AuditEvent>, GatewayError> {
        Ok(self.inner.lock().subject(subject_key))
    }

    async fn tombstone(&self, sequences: &[u64]) -> Result<usize, GatewayError> {
        Ok(self.inner.lock().tombstone(sequences))
    }

    async fn purge_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<PurgeSummary>, GatewayError> {
        Ok(self.inner.lock().purge(cutoff))
    }

    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), GatewayError> {
        self.inner
            .lock()
            .checkpoints
            .insert(checkpoint.sequence, checkpoint.clone());
        Ok(())
    }

    async fn checkpoints(&self) -> Result<Vec<Checkpoint>, GatewayError> {
        Ok(self.inner.lock().checkpoints.values().cloned().collect())
    }

    async fn bounds(&self) -> Result<Option<(u64, u64)>, GatewayError> {
        Ok(self.inner.lock().bounds())
    }
}

const EVENTS_FILE: &str = "events.jsonl";
const CHECKPOINTS_FILE: &str = "checkpoints.jsonl";

/// JSON-lines store: one event per line in `events.jsonl`, one checkpoint per
/// line in `checkpoints.jsonl`.
///
/// Appends go to the end of the file. Erasure and purges rewrite the file
/// through a temporary sibling and an atomic rename. The whole log is
/// mirrored in memory after [`JsonlAuditStore::open`].
///
/// Every write runs on its own task, so a caller that stops waiting never
/// leaves a partial line behind or the mirror out of step with the file.
#[derive(Debug, Clone)]
pub struct JsonlAuditStore {
    shared: Arc<JsonlFiles>,
}

#[derive(Debug)]
struct JsonlFiles {
    dir: PathBuf,
    index: tokio::sync::Mutex<EventIndex>,
}

impl JsonlAuditStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut index = EventIndex::default();
        for event in read_lines::<AuditEvent>(&dir.join(EVENTS_FILE)).await? {
            index.events.insert(event.sequence, event);
        }
        for checkpoint in read_lines::<Checkpoint>(&dir.join(CHECKPOINTS_FILE)).await? {
            index.checkpoints.insert(checkpoint.sequence, checkpoint);
        }

        tracing::debug!(
            dir = %dir.display(),
            events = index.events.len(),
            checkpoints = index.checkpoints.len(),
            "opened JSONL audit store"
        );

        Ok(Self {
            shared: Arc::new(JsonlFiles {
                dir,
                index: tokio::sync::Mutex::new(index),
            }),
        })
    }

    pub fn events_path(&self) -> PathBuf {
        self.shared.events_path()
    }

    /// Run a write to completion on its own task.
    async fn detached<T, F, Fut>(&self, write: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<JsonlFiles>) -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        tokio::spawn(write(Arc::clone(&self.shared)))
            .await
            .map_err(|e| GatewayError::Storage(format!("audit writer task failed: {}", e)))?
    }
}

impl JsonlFiles {
    fn events_path(&self) -> PathBuf {
        self.dir.join(EVENTS_FILE)
    }

    async fn rewrite_events(&self, index: &EventIndex) -> Result<(), GatewayError> {
        let mut buf = Vec::new();
        for event in index.events.values() {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }
        let tmp = self.dir.join(format!("{}.tmp", EVENTS_FILE));
        tokio::fs::write(&tmp, &buf).await?;
        tokio::fs::rename(&tmp, self.events_path()).await?;
        Ok(())
    }

    async fn append_events(&self, events: Vec<AuditEvent>) -> Result<(), GatewayError> {
        let mut index = self.index.lock().await;
        let fresh: Vec<AuditEvent> = index.next_unstored(&events).into_iter().cloned().collect();
        if fresh.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for event in &fresh {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }
        append_lines(&self.events_path(), &buf).await?;
        for event in fresh {
            index.events.insert(event.sequence, event);
        }
        Ok(())
    }

    async fn tombstone(&self, sequences: Vec<u64>) -> Result<usize, GatewayError> {
        let mut index = self.index.lock().await;
        let mut staged = EventIndex {
            events: index.events.clone(),
            checkpoints: BTreeMap::new(),
        };
        let changed = staged.tombstone(&sequences);
        if changed > 0 {
            self.rewrite_events(&staged).await?;
            index.events = staged.events;
        }
        Ok(changed)
    }

    async fn purge(&self, cutoff: DateTime<Utc>) -> Result<Option<PurgeSummary>, GatewayError> {
        let mut index = self.index.lock().await;
        let mut staged = EventIndex {
            events: index.events.clone(),
            checkpoints: BTreeMap::new(),
        };
        let summary = staged.purge(cutoff);
        if summary.is_some() {
            self.rewrite_events(&staged).await?;
            index.events = staged.events;
        }
        Ok(summary)
    }

    async fn put_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), GatewayError> {
        let mut index = self.index.lock().await;
        let mut line = serde_json::to_vec(&checkpoint)?;
        line.push(b'\n');
        append_lines(&self.dir.join(CHECKPOINTS_FILE), &line).await?;
        index.checkpoints.insert(checkpoint.sequence, checkpoint);
        Ok(())
    }
}

async fn read_lines<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, GatewayError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| {
                GatewayError::Storage(format!("{}:{}: {}", path.display(), n + 1, e))
            })
        })
        .collect()
}

async fn append_lines(path: &Path, lines: &[u8]) -> Result<(), GatewayError> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(lines).await?;
    file.sync_data().await?;
    Ok(())
}

#[async_trait]
impl AuditStore for JsonlAuditStore {
    async fn append_batch(&self, events: &[AuditEvent]) -> Result<(), GatewayError> {
        let events = events.to_vec();
        self.detached(move |files| async move { files.append_events(events).await })
            .await
    }

    async fn load_range(&self, range: Range<u64>) -> Result<Vec<AuditEvent>, GatewayError> {
        Ok(self.shared.index.lock().await.range(range))
    }

    async fn load_subject(&self, subject_key: &str) -> Result<Vec<AuditEvent>, GatewayError> {
        Ok(self.shared.index.lock().await.subject(subject_key))
    }

    async fn tombstone(&self, sequences: &[u64]) -> Result<usize, GatewayError> {
        let sequences = sequences.to_vec();
        self.detached(move |files| async move { files.tombstone(sequences).await })
            .await
    }

    async fn purge_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<PurgeSummary>, GatewayError> {
        self.detached(move |files| async move { files.purge(cutoff).await })
            .await
    }

    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), GatewayError> {
        let checkpoint = checkpoint.clone();
        self.detached(move |files| async move { files.put_checkpoint(checkpoint).await })
            .await
    }

    async fn checkpoints(&self) -> Result<Vec<Checkpoint>, GatewayError> {
        Ok(self.shared.index.lock().await.checkpoints.values().cloned().collect())
    }

    async fn bounds(&self) -> Result<Option<(u64, u64)>, GatewayError> {
        Ok(self.shared.index.lock().await.bounds())
    }
}
