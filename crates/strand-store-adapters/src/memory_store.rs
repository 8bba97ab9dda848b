use async_trait::async_trait;
use strand_contract::storage::{
    paginate_history, CheckpointSelector, CheckpointStore, HistoryPage, HistoryQuery, StoreError,
    ThreadListPage, ThreadListQuery,
};
use strand_contract::{
    gen_checkpoint_id, ChannelMap, Checkpoint, CheckpointId, CheckpointMeta, Thread,
};

struct MemoryEntry {
    thread: Thread,
    log: Vec<Checkpoint>,
}

/// In-memory checkpoint store for testing and local development.
///
/// Does not persist across process restarts; the compare-and-swap
/// semantics are identical to the durable backends.
#[derive(Default)]
pub struct MemoryStore {
    entries: tokio::sync::RwLock<std::collections::HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn create_thread(&self, thread: &Thread) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&thread.id) {
            return Err(StoreError::AlreadyExists(thread.id.clone()));
        }
        entries.insert(
            thread.id.clone(),
            MemoryEntry {
                thread: thread.clone(),
                log: Vec::new(),
            },
        );
        Ok(())
    }

    async fn load_thread(&self, thread_id: &str) -> Result<Option<Thread>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries.get(thread_id).map(|e| e.thread.clone()))
    }

    async fn put(
        &self,
        thread_id: &str,
        parent_id: Option<&CheckpointId>,
        channels: ChannelMap,
        meta: CheckpointMeta,
    ) -> Result<CheckpointId, StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;

        if entry.thread.latest.as_ref() != parent_id {
            return Err(StoreError::ParentConflict {
                thread_id: thread_id.to_string(),
                latest: entry.thread.latest.clone(),
                assumed: parent_id.cloned(),
            });
        }

        let id = gen_checkpoint_id();
        entry.log.push(Checkpoint {
            id: id.clone(),
            thread_id: thread_id.to_string(),
            parent_id: entry
                .thread
                .latest
                .clone()
                .or_else(|| entry.thread.forked_from.as_ref().map(|f| f.checkpoint_id.clone())),
            channels,
            meta,
        });
        entry.thread.latest = Some(id.clone());
        Ok(id)
    }

    async fn get(
        &self,
        thread_id: &str,
        selector: &CheckpointSelector,
    ) -> Result<Checkpoint, StoreError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;
        let found = match selector {
            CheckpointSelector::Latest => entry.log.last(),
            CheckpointSelector::Id(id) => entry.log.iter().find(|c| &c.id == id),
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
        let entries = self.entries.read().await;
        let entry = entries
            .get(thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;
        Ok(paginate_history(&entry.log, query))
    }

    async fn list_threads(&self, query: &ThreadListQuery) -> Result<ThreadListPage, StoreError> {
        let entries = self.entries.read().await;
        let mut ids: Vec<String> = entries
            .iter()
            .filter(|(_, e)| match &query.parent_thread_id {
                Some(pid) => e.thread.parent_thread_id.as_deref() == Some(pid.as_str()),
                None => true,
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        let total = ids.len();
        let limit = query.limit.clamp(1, 200);
        let offset = query.offset.min(total);
        let end = (offset + limit + 1).min(total);
        let slice = &ids[offset..end];
        let has_more = slice.len() > limit;
        let items: Vec<String> = slice.iter().take(limit).cloned().collect();
        Ok(ThreadListPage {
            items,
            total,
            has_more,
        })
    }
}
