use insura_core::ChatMessage;
use insura_storage::DynChatStore;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::RepositoryError;
use crate::cache::{ChatCache, CacheLayer, Coalescer, keys};

/// Chat transcripts. The cached transcript holds the tail of the session
/// as of the last load and grows by append while it stays cached.
pub struct ChatRepository {
    store: DynChatStore,
    cache: ChatCache,
    layer: CacheLayer,
    loads: Coalescer<Vec<ChatMessage>, RepositoryError>,
}

impl std::fmt::Debug for ChatRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRepository")
            .field("loads", &self.loads)
            .finish_non_exhaustive()
    }
}

impl ChatRepository {
    pub fn new(store: DynChatStore, layer: CacheLayer) -> Self {
        Self {
            store,
            cache: ChatCache::new(layer.clone()),
            layer,
            loads: Coalescer::new(),
        }
    }

    pub fn cache(&self) -> &ChatCache {
        &self.cache
    }

    #[instrument(skip(self, message), fields(session_id = %message.session_id))]
    pub async fn save(&self, message: &ChatMessage) -> Result<(), RepositoryError> {
        self.store.create(message).await?;
        let cache = self.cache.clone();
        let message = message.clone();
        self.layer.spawn("chat_append", async move {
            if let Err(e) = cache.append(&message).await {
                warn!(session_id = %message.session_id, error = %e, "chat append failed, dropping transcript");
                if let Err(e) = cache.delete(&message.session_id).await {
                    warn!(session_id = %message.session_id, error = %e, "failed to drop transcript");
                }
            }
        });
        Ok(())
    }

    /// The last `limit` messages of a session, oldest first.
    #[instrument(skip(self))]
    pub async fn get_history(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>, RepositoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        if let Some(messages) = self.cache.get_recent(session_id, limit).await {
            return Ok(messages);
        }
        debug!(session_id, limit, "chat transcript cache miss");
        let store = Arc::clone(&self.store);
        let cache = self.cache.clone();
        let layer = self.layer.clone();
        let session = session_id.to_string();
        self.loads
            .run(&format!("chat:get_history:{session_id}:{limit}"), move || async move {
                let messages = store.recent(&session, limit).await?;
                if !messages.is_empty() {
                    let key = keys::chat_session(&session);
                    let check = layer.clone();
                    let snapshot = messages.clone();
                    layer.repopulate(
                        "chat_repopulate",
                        keys::lock_for(&key),
                        async move { check.contains_list(&key).await },
                        async move { cache.replace(&session, &snapshot).await },
                    );
                }
                Ok(messages)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::layer::tests::test_layer;
    use insura_core::ChatRole;
    use insura_db_memory::InMemoryStore;

    fn message(id: i64, content: &str) -> ChatMessage {
        ChatMessage::new(id, "s1", 7, ChatRole::User, content)
    }

    #[tokio::test]
    async fn test_history_is_chronological_and_cached() {
        let layer = test_layer();
        let repo = ChatRepository::new(Arc::new(InMemoryStore::new()), layer.clone());
        for id in 1..=5 {
            repo.save(&message(id, &format!("m{id}"))).await.unwrap();
        }
        layer.writer().flush().await;
        assert!(repo.cache().get_recent("s1", 3).await.is_none());

        let history = repo.get_history("s1", 3).await.unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4", "m5"]);
        layer.writer().flush().await;

        // New messages extend the cached tail.
        repo.save(&message(6, "m6")).await.unwrap();
        layer.writer().flush().await;
        let cached = repo.cache().get_recent("s1", 2).await.unwrap();
        let contents: Vec<&str> = cached.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m5", "m6"]);
    }

    #[tokio::test]
    async fn test_empty_session_is_not_cached() {
        let layer = test_layer();
        let repo = ChatRepository::new(Arc::new(InMemoryStore::new()), layer.clone());
        assert!(repo.get_history("nobody", 10).await.unwrap().is_empty());
        assert!(repo.get_history("nobody", 0).await.unwrap().is_empty());
        layer.writer().flush().await;
        assert!(!layer.contains_list(&keys::chat_session("nobody")).await);
    }
}
