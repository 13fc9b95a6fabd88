//! Append-only ordered chat log.
//!
//! Appends are serialized through the sequencer lock so ids are strictly
//! increasing with no gaps. The visible entries live behind a separate
//! `RwLock` that writers hold only long enough to push, so `snapshot()`
//! never waits on a slow persistence backend.

use std::collections::VecDeque;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

use crate::error::ChatError;
use crate::messages::{Message, MessageKind};
use crate::presence::display_name_or_default;

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Where appended messages are written before they become visible.
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Everything previously persisted, in append order.
    async fn load(&self) -> Result<Vec<Message>, ChatError>;

    async fn persist(&self, message: &Message) -> Result<(), ChatError>;
}

/// Keeps nothing. History lives only as long as the process.
pub struct MemoryLog;

#[async_trait]
impl MessageLog for MemoryLog {
    async fn load(&self) -> Result<Vec<Message>, ChatError> {
        Ok(Vec::new())
    }

    async fn persist(&self, _message: &Message) -> Result<(), ChatError> {
        Ok(())
    }
}

/// One JSON-encoded message per line, appended and flushed per message.
/// A write that fails partway is cut back off, so every record starts on a
/// fresh line.
pub struct JsonLinesLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesLog {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ChatError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await?;

        // A crash mid-write can leave a torn last line.
        if file.metadata().await?.len() > 0 {
            file.seek(SeekFrom::End(-1)).await?;
            if file.read_u8().await? != b'\n' {
                warn!("Terminating partial last line in {}", path.display());
                file.write_all(b"\n").await?;
                file.flush().await?;
            }
        }

        Ok(JsonLinesLog {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MessageLog for JsonLinesLog {
    async fn load(&self) -> Result<Vec<Message>, ChatError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(
                    "Skipping malformed entry at {}:{}: {}",
                    self.path.display(),
                    line_no + 1,
                    e
                ),
            }
        }
        Ok(messages)
    }

    async fn persist(&self, message: &Message) -> Result<(), ChatError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut file = self.file.lock().await;
        let len = file.metadata().await?.len();
        if let Err(e) = write_line(&mut file, line.as_bytes()).await {
            if let Err(truncate) = file.set_len(len).await {
                error!(
                    "Failed to cut back partial write in {}: {}",
                    self.path.display(),
                    truncate
                );
            }
            return Err(e.into());
        }
        Ok(())
    }
}

async fn write_line(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await
}

struct Sequencer {
    next_id: u64,
    log: Box<dyn MessageLog>,
}

pub struct MessageStore {
    sequencer: Mutex<Sequencer>,
    entries: RwLock<VecDeque<Message>>,
    capacity: usize,
}

impl MessageStore {
    /// A store that forgets everything on restart.
    pub fn in_memory(capacity: usize) -> Self {
        MessageStore {
            sequencer: Mutex::new(Sequencer {
                next_id: 1,
                log: Box::new(MemoryLog),
            }),
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Replays `log` and resumes numbering after the highest id it contains.
    /// When an id appears twice the later record wins.
    pub async fn open(log: Box<dyn MessageLog>, capacity: usize) -> Result<Self, ChatError> {
        let capacity = capacity.max(1);
        let mut restored = log.load().await?;
        restored.sort_by_key(|m| m.id);
        restored.reverse();
        restored.dedup_by_key(|m| m.id);
        restored.reverse();

        let next_id = restored.last().map_or(1, |m| m.id + 1);
        let skip = restored.len().saturating_sub(capacity);
        let entries: VecDeque<Message> = restored.into_iter().skip(skip).collect();

        if !entries.is_empty() {
            info!(
                "Restored {} messages from log; next id is {}",
                entries.len(),
                next_id
            );
        }

        Ok(MessageStore {
            sequencer: Mutex::new(Sequencer { next_id, log }),
            entries: RwLock::new(entries),
            capacity,
        })
    }

    /// Appends a chat message. Blank text is rejected.
    pub async fn append(&self, username: &str, text: &str) -> Result<Message, ChatError> {
        let username = display_name_or_default(Some(username));
        self.push(Some(username), text, MessageKind::Chat).await
    }

    /// Appends a system-generated info message.
    pub async fn append_system_notice(&self, text: &str) -> Result<Message, ChatError> {
        self.push(None, text, MessageKind::Info).await
    }

    async fn push(
        &self,
        username: Option<String>,
        text: &str,
        kind: MessageKind,
    ) -> Result<Message, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::Validation("message text is empty".to_string()));
        }

        let mut sequencer = self.sequencer.lock().await;
        let message = Message {
            id: sequencer.next_id,
            username,
            text: text.to_string(),
            timestamp: Utc::now(),
            kind,
        };

        // A failed write leaves the id unused.
        sequencer.log.persist(&message).await?;
        sequencer.next_id += 1;

        let mut entries = self.entries.write().await;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(message.clone());
        Ok(message)
    }

    /// Point-in-time copy of the retained log, oldest first.
    pub async fn snapshot(&self) -> Vec<Message> {
        let entries = self.entries.read().await;
        entries.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
