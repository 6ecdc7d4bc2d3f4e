//! Mailbox storage: a bounded, thread-safe map of received messages
//! with FIFO eviction, in two variants sharing one contract. The
//! in-memory variant backs everything; the file-backed variant wraps
//! it and mirrors every mutation into a single JSON document.

use crate::message::{Message, Stats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Errors surfaced by mailbox storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("email not found")]
    NotFound,
    #[error("mailbox capacity is zero")]
    NoCapacity,
    #[error("mailbox file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("mailbox file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// The mailbox store contract consumed by SMTP sessions and the
/// management API.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stamps `received_at`, evicts the oldest message when the store
    /// is at capacity, inserts, and returns the stored copy.
    async fn save(&self, message: Message) -> Result<Message, StorageError>;
    async fn get(&self, id: &str) -> Result<Message, StorageError>;
    /// All messages, newest first.
    async fn list(&self) -> Result<Vec<Message>, StorageError>;
    async fn delete(&self, id: &str) -> Result<(), StorageError>;
    async fn clear(&self) -> Result<(), StorageError>;
    async fn stats(&self) -> Stats;
}

/// Map plus insertion-order sequence, guarded together by one lock so
/// they can never disagree about membership.
#[derive(Default)]
struct Mailbox {
    emails: HashMap<String, Message>,
    order: Vec<String>,
}

/// In-memory mailbox store.
pub struct MemoryStorage {
    inner: RwLock<Mailbox>,
    max_messages: usize,
    server_started: DateTime<Utc>,
}

impl MemoryStorage {
    pub fn new(max_messages: usize, server_started: DateTime<Utc>) -> Self {
        MemoryStorage {
            inner: RwLock::new(Mailbox::default()),
            max_messages,
            server_started,
        }
    }

    /// Reinserts previously persisted messages in insertion order,
    /// keeping their original `received_at` stamps.
    pub(crate) async fn restore(&self, oldest_first: Vec<Message>) {
        let mut inner = self.inner.write().await;
        for message in oldest_first {
            inner.order.push(message.id.clone());
            inner.emails.insert(message.id.clone(), message);
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save(&self, mut message: Message) -> Result<Message, StorageError> {
        if self.max_messages == 0 {
            return Err(StorageError::NoCapacity);
        }

        let mut inner = self.inner.write().await;

        // A duplicate id overwrites: drop the old entry from both
        // structures before the capacity check.
        if inner.emails.remove(&message.id).is_some() {
            let id = message.id.clone();
            inner.order.retain(|existing| existing != &id);
        }

        while inner.emails.len() >= self.max_messages {
            if inner.order.is_empty() {
                break;
            }
            let oldest = inner.order.remove(0);
            inner.emails.remove(&oldest);
            debug!(id = %oldest, "mailbox at capacity, evicted oldest email");
        }

        message.received_at = Utc::now();
        inner.order.push(message.id.clone());
        inner.emails.insert(message.id.clone(), message.clone());
        Ok(message)
    }

    async fn get(&self, id: &str) -> Result<Message, StorageError> {
        let inner = self.inner.read().await;
        inner.emails.get(id).cloned().ok_or(StorageError::NotFound)
    }

    async fn list(&self) -> Result<Vec<Message>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.emails.get(id).cloned())
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        if inner.emails.remove(id).is_none() {
            return Err(StorageError::NotFound);
        }
        inner.order.retain(|existing| existing != id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.emails.clear();
        inner.order.clear();
        Ok(())
    }

    async fn stats(&self) -> Stats {
        let inner = self.inner.read().await;
        let total_size_bytes = inner.emails.values().map(|email| email.size).sum();
        let last_email_at = inner.emails.values().map(|email| email.received_at).max();

        Stats {
            total_emails: inner.emails.len(),
            total_size_bytes,
            last_email_at,
            server_started: self.server_started,
        }
    }
}

/// File-backed mailbox store. Delegates all reads to the wrapped
/// `MemoryStorage` and rewrites the persistence file after every
/// mutation, synchronously on the mutation path.
pub struct FileStorage {
    memory: MemoryStorage,
    path: PathBuf,
}

impl FileStorage {
    /// Opens (or creates) a file-backed store. A missing file is not
    /// an error; an unreadable or unparsable one is.
    pub async fn open(
        path: impl Into<PathBuf>,
        max_messages: usize,
        server_started: DateTime<Utc>,
    ) -> Result<Self, StorageError> {
        let path = path.into();
        let memory = MemoryStorage::new(max_messages, server_started);

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                // The file holds the list newest-first; restore in
                // insertion order.
                let newest_first: Vec<Message> = serde_json::from_slice(&bytes)?;
                let count = newest_first.len();
                memory.restore(newest_first.into_iter().rev().collect()).await;
                info!(count, path = %path.display(), "loaded persisted mailbox");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(FileStorage { memory, path })
    }

    /// Serializes the full mailbox and atomically replaces the file.
    async fn persist(&self) -> Result<(), StorageError> {
        let emails = self.memory.list().await?;
        let json = serde_json::to_vec_pretty(&emails)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).await?;
        }
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn save(&self, message: Message) -> Result<Message, StorageError> {
        let stored = self.memory.save(message).await?;
        self.persist().await?;
        Ok(stored)
    }

    async fn get(&self, id: &str) -> Result<Message, StorageError> {
        self.memory.get(id).await
    }

    async fn list(&self) -> Result<Vec<Message>, StorageError> {
        self.memory.list().await
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.memory.delete(id).await?;
        self.persist().await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.memory.clear().await?;
        self.persist().await
    }

    async fn stats(&self) -> Stats {
        self.memory.stats().await
    }
}
