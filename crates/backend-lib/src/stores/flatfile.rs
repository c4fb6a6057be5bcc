// ============================
// roomcast-backend-lib/src/stores/flatfile.rs
// ============================
//! Flat-file implementation of the message store: one JSON line per message,
//! one log per room.

use super::MessageStore;
use crate::error::AppError;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use roomcast_common::{Message, RoomId, UserRef};
use std::sync::Arc;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tokio::{fs as tokio_fs, io::AsyncWriteExt, sync::Mutex};
use uuid::Uuid;

pub struct FlatFileMessageStore {
    root: PathBuf,
    // per-room append locks so concurrent senders cannot interleave lines
    locks: DashMap<RoomId, Arc<Mutex<()>>>,
}

impl FlatFileMessageStore {
    pub fn new<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("rooms"))?;
        Ok(Self {
            root,
            locks: DashMap::new(),
        })
    }

    fn log_path(&self, room_id: RoomId) -> PathBuf {
        self.root
            .join("rooms")
            .join(room_id.to_string())
            .join("messages.log")
    }

    fn room_lock(&self, room_id: RoomId) -> Arc<Mutex<()>> {
        self.locks
            .entry(room_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl MessageStore for FlatFileMessageStore {
    async fn append(
        &self,
        room_id: RoomId,
        author: &UserRef,
        content: &str,
    ) -> Result<Message, AppError> {
        let message = Message {
            id: Uuid::now_v7(),
            room_id,
            author: author.clone(),
            content: content.to_owned(),
            created_at: Utc::now(),
        };
        let line = serde_json::to_string(&message)?;

        let lock = self.room_lock(room_id);
        let _guard = lock.lock().await;

        let path = self.log_path(room_id);
        if let Some(parent) = path.parent() {
            tokio_fs::create_dir_all(parent).await?;
        }
        let mut file = tokio_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;

        Ok(message)
    }

    async fn recent(
        &self,
        room_id: RoomId,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Message>, AppError> {
        let path = self.log_path(room_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = tokio_fs::read_to_string(&path).await?;
        let mut messages: Vec<Message> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(message) => Some(message),
                Err(err) => {
                    tracing::warn!(room_id, %err, "skipping unreadable message log line");
                    None
                },
            })
            .collect();

        messages.reverse();
        Ok(messages.into_iter().skip(skip).take(limit).collect())
    }
}
