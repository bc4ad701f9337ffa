//! File-backed record store: one JSON object per line
//!
//! Sessions buffer records in memory and append them in a single write on
//! commit. Connection states are kept in memory only.

use super::{RecordSession, RecordStore, StoreError};
use crate::identity::ConnectionIdentity;
use crate::ingest::record::MessageRecord;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

struct Inner {
    path: PathBuf,
    // Serialises appends so lines from concurrent commits never interleave
    write_lock: Mutex<()>,
    states: DashMap<ConnectionIdentity, bool>,
}

#[derive(Clone)]
pub struct JsonLinesStore {
    inner: Arc<Inner>,
}

impl JsonLinesStore {
    /// Store appending to `path`; parent directories are created on first commit
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.into(),
                write_lock: Mutex::new(()),
                states: DashMap::new(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Last state recorded for `identity`
    pub fn connection_state(&self, identity: &str) -> Option<bool> {
        self.inner.states.get(identity).map(|state| *state)
    }

    /// Read back every committed record
    pub async fn read_all(&self) -> Result<Vec<MessageRecord>, StoreError> {
        let content = match tokio::fs::read_to_string(&self.inner.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl RecordStore for JsonLinesStore {
    async fn open_session(&self) -> Result<Box<dyn RecordSession>, StoreError> {
        Ok(Box::new(JsonLinesSession {
            inner: self.inner.clone(),
            buffer: String::new(),
            count: 0,
        }))
    }

    async fn update_connection_state(
        &self,
        identity: &ConnectionIdentity,
        connected: bool,
    ) -> Result<(), StoreError> {
        self.inner.states.insert(identity.clone(), connected);
        Ok(())
    }
}

struct JsonLinesSession {
    inner: Arc<Inner>,
    buffer: String,
    count: usize,
}

#[async_trait]
impl RecordSession for JsonLinesSession {
    async fn create_record(&mut self, record: &MessageRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        self.buffer.push_str(&line);
        self.buffer.push('\n');
        self.count += 1;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if self.count == 0 {
            return Ok(());
        }

        let _guard = self.inner.write_lock.lock().await;

        if let Some(parent) = self.inner.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)
            .await?;
        file.write_all(self.buffer.as_bytes()).await?;
        file.flush().await?;

        debug!(path = %self.inner.path.display(), records = self.count, "Committed records");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::InboundMessage;
    use bytes::Bytes;

    fn record(topic: &str) -> MessageRecord {
        MessageRecord::from_inbound(&InboundMessage::new(
            ConnectionIdentity::new("b1").unwrap(),
            topic,
            Bytes::from_static(b"23.5"),
        ))
    }

    #[tokio::test]
    async fn test_commit_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesStore::new(dir.path().join("nested/records.jsonl"));

        let mut session = store.open_session().await.unwrap();
        session.create_record(&record("a/1")).await.unwrap();
        session.create_record(&record("a/2")).await.unwrap();
        session.commit().await.unwrap();

        let mut session = store.open_session().await.unwrap();
        session.create_record(&record("a/3")).await.unwrap();
        session.commit().await.unwrap();

        let topics: Vec<String> = store
            .read_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.topic)
            .collect();
        assert_eq!(topics, vec!["a/1", "a/2", "a/3"]);
    }

    #[tokio::test]
    async fn test_dropped_session_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesStore::new(dir.path().join("records.jsonl"));

        {
            let mut session = store.open_session().await.unwrap();
            session.create_record(&record("a/1")).await.unwrap();
        }

        assert!(store.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connection_state() {
        let store = JsonLinesStore::new("unused.jsonl");
        let id = ConnectionIdentity::new("b1").unwrap();

        assert_eq!(store.connection_state("b1"), None);
        store.update_connection_state(&id, true).await.unwrap();
        assert_eq!(store.connection_state("b1"), Some(true));
        store.update_connection_state(&id, false).await.unwrap();
        assert_eq!(store.connection_state("b1"), Some(false));
    }
}
