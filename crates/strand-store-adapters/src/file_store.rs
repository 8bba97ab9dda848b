use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strand_contract::storage::{
    paginate_history, CheckpointSelector, CheckpointStore, HistoryPage, HistoryQuery, StoreError,
    ThreadListPage, ThreadListQuery,
};
use strand_contract::{
    gen_checkpoint_id, ChannelMap, Checkpoint, CheckpointId, CheckpointMeta, Thread,
};
use tokio::io::AsyncWriteExt;

/// Durable checkpoint store keeping one JSON document per thread.
///
/// Writes go through a unique temp file, fsync, and an atomic rename, so
/// a checkpoint becomes visible in full or not at all.
pub struct FileStore {
    base_path: PathBuf,
}

/// On-disk layout: the thread record plus its append-only checkpoint log.
#[derive(Serialize, Deserialize)]
struct ThreadDocument {
    thread: Thread,
    log: Vec<Checkpoint>,
}

impl FileStore {
    /// Create a file store rooted at the given directory.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn thread_path(&self, thread_id: &str) -> Result<PathBuf, StoreError> {
        Self::validate_thread_id(thread_id)?;
        Ok(self.base_path.join(format!("{thread_id}.json")))
    }

    /// Validate that a thread id is safe for use as a filename.
    /// Rejects path separators, `..`, and control characters.
    fn validate_thread_id(thread_id: &str) -> Result<(), StoreError> {
        if thread_id.is_empty() {
            return Err(StoreError::InvalidId("thread id cannot be empty".into()));
        }
        if thread_id.contains('/')
            || thread_id.contains('\\')
            || thread_id.contains("..")
            || thread_id.contains('\0')
        {
            return Err(StoreError::InvalidId(format!(
                "thread id contains invalid characters: {thread_id:?}"
            )));
        }
        if thread_id.chars().any(|c| c.is_control()) {
            return Err(StoreError::InvalidId(format!(
                "thread id contains control characters: {thread_id:?}"
            )));
        }
        Ok(())
    }

    async fn load_document(&self, thread_id: &str) -> Result<Option<ThreadDocument>, StoreError> {
        let path = self.thread_path(thread_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&path).await?;
        let doc: ThreadDocument = serde_json::from_str(&content)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(doc))
    }

    async fn save_document(&self, doc: &ThreadDocument) -> Result<(), StoreError> {
        if !self.base_path.exists() {
            tokio::fs::create_dir_all(&self.base_path).await?;
        }
        let path = self.thread_path(&doc.thread.id)?;
        let content = serde_json::to_string_pretty(doc)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let tmp_path = self.base_path.join(format!(
            ".{}.{}.tmp",
            doc.thread.id,
            uuid::Uuid::new_v4().simple()
        ));

        let write_result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            match tokio::fs::rename(&tmp_path, &path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    tokio::fs::remove_file(&path).await?;
                    tokio::fs::rename(&tmp_path, &path).await?;
                }
                Err(e) => return Err(e),
            }
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(e));
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileStore {
    async fn create_thread(&self, thread: &Thread) -> Result<(), StoreError> {
        let path = self.thread_path(&thread.id)?;
        if path.exists() {
            return Err(StoreError::AlreadyExists(thread.id.clone()));
        }
        self.save_document(&ThreadDocument {
            thread: thread.clone(),
            log: Vec::new(),
        })
        .await
    }

    async fn load_thread(&self, thread_id: &str) -> Result<Option<Thread>, StoreError> {
        Ok(self.load_document(thread_id).await?.map(|d| d.thread))
    }

    async fn put(
        &self,
        thread_id: &str,
        parent_id: Option<&CheckpointId>,
        channels: ChannelMap,
        meta: CheckpointMeta,
    ) -> Result<CheckpointId, StoreError> {
        let mut doc = self
            .load_document(thread_id)
            .await?
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;

        if doc.thread.latest.as_ref() != parent_id {
            return Err(StoreError::ParentConflict {
                thread_id: thread_id.to_string(),
                latest: doc.thread.latest.clone(),
                assumed: parent_id.cloned(),
            });
        }

        let id = gen_checkpoint_id();
        doc.log.push(Checkpoint {
            id: id.clone(),
            thread_id: thread_id.to_string(),
            parent_id: doc
                .thread
                .latest
                .clone()
                .or_else(|| doc.thread.forked_from.as_ref().map(|f| f.checkpoint_id.clone())),
            channels,
            meta,
        });
        doc.thread.latest = Some(id.clone());
        self.save_document(&doc).await?;
        Ok(id)
    }

    async fn get(
        &self,
        thread_id: &str,
        selector: &CheckpointSelector,
    ) -> Result<Checkpoint, StoreError> {
        let doc = self
            .load_document(thread_id)
            .await?
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;
        let found = match selector {
            CheckpointSelector::Latest => doc.log.last(),
            CheckpointSelector::Id(id) => doc.log.iter().find(|c| &c.id == id),
        };
        found.cloned().ok_or_else(|| StoreError::CheckpointNotFound {
            thread_id: thread_id.to_string(),
            checkpoint_id: match selector {
                CheckpointSelector::Latest => "latest".to_string(),
                CheckpointSelector::Id(id) => id.clone(),
            },
        })
    }

    async fn history(
        &self,
        thread_id: &str,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, StoreError> {
        let doc = self
            .load_document(thread_id)
            .await?
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;
        Ok(paginate_history(&doc.log, query))
    }

    async fn list_threads(&self, query: &ThreadListQuery) -> Result<ThreadListPage, StoreError> {
        let mut all = if !self.base_path.exists() {
            Vec::new()
        } else {
            let mut entries = tokio::fs::read_dir(&self.base_path).await?;
            let mut ids = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                        ids.push(id.to_string());
                    }
                }
            }
            ids
        };

        if let Some(ref parent) = query.parent_thread_id {
            let mut filtered = Vec::new();
            for id in &all {
                match self.load_thread(id).await {
                    Ok(Some(thread))
                        if thread.parent_thread_id.as_deref() == Some(parent.as_str()) =>
                    {
                        filtered.push(id.clone());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(thread_id = %id, error = %e, "skipping unreadable thread document");
                    }
                }
            }
            all = filtered;
        }

        all.sort();
        let total = all.len();
        let limit = query.limit.clamp(1, 200);
        let offset = query.offset.min(total);
        let end = (offset + limit + 1).min(total);
        let slice = &all[offset..end];
        let has_more = slice.len() > limit;
        let items: Vec<String> = slice.iter().take(limit).cloned().collect();
        Ok(ThreadListPage {
            items,
            total,
            has_more,
        })
    }
}
