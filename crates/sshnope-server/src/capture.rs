//! Captured credentials and the in-memory queue they wait in.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// One username/password pair submitted by a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    pub remote_address: String,
    pub username: String,
    pub password: String,
}

impl CredentialRecord {
    /// Stamp a record with the current wall-clock time.
    pub fn now(
        remote_address: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        Self {
            timestamp,
            remote_address: remote_address.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

#[derive(Debug, Default)]
struct BufferInner {
    records: Mutex<Vec<CredentialRecord>>,
    filled: Notify,
    threshold: Option<usize>,
}

/// Process-wide queue of captured records.
///
/// Sessions append from any task. The drain loop swaps the whole queue out
/// with [`CredentialBuffer::take`]; a record is always in exactly one of the
/// swapped-out batch or the fresh queue.
#[derive(Debug, Clone, Default)]
pub struct CredentialBuffer {
    inner: Arc<BufferInner>,
}

impl CredentialBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer that wakes [`CredentialBuffer::filled`] waiters once it holds
    /// `threshold` records.
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                threshold: Some(threshold.max(1)),
                ..Default::default()
            }),
        }
    }

    pub fn append(&self, record: CredentialRecord) {
        let len = {
            let mut records = self.inner.records.lock();
            records.push(record);
            records.len()
        };
        if self.inner.threshold.is_some_and(|t| len >= t) {
            self.inner.filled.notify_one();
        }
    }

    /// Snapshot and clear in one step.
    pub fn take(&self) -> Vec<CredentialRecord> {
        std::mem::take(&mut *self.inner.records.lock())
    }

    /// Put a batch that could not be persisted back in front of anything
    /// appended since it was taken.
    pub fn restore(&self, mut batch: Vec<CredentialRecord>) {
        if batch.is_empty() {
            return;
        }
        let mut records = self.inner.records.lock();
        batch.append(&mut records);
        *records = batch;
    }

    pub fn len(&self) -> usize {
        self.inner.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves when an append pushes the buffer to its threshold. Never
    /// resolves for a buffer built without one.
    pub async fn filled(&self) {
        if self.inner.threshold.is_none() {
            return std::future::pending().await;
        }
        self.inner.filled.notified().await;
    }
}
