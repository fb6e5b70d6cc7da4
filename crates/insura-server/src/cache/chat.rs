use insura_core::ChatMessage;

use super::backend::CacheError;
use super::keys;
use super::layer::{CacheLayer, encode_json};

/// Chat transcripts, oldest message first.
#[derive(Debug, Clone)]
pub struct ChatCache {
    layer: CacheLayer,
}

fn decode_message(bytes: &[u8]) -> Result<ChatMessage, String> {
    serde_json::from_slice(bytes).map_err(|e| e.to_string())
}

impl ChatCache {
    pub fn new(layer: CacheLayer) -> Self {
        Self { layer }
    }

    /// The last `limit` cached messages, or `None` if the transcript is not cached.
    pub async fn get_recent(&self, session_id: &str, limit: usize) -> Option<Vec<ChatMessage>> {
        if limit == 0 {
            return None;
        }
        let start = -(limit.min(isize::MAX as usize) as isize);
        self.layer
            .read_list(&keys::chat_session(session_id), start, -1, decode_message)
            .await
    }

    /// Append to a cached transcript. Returns whether the transcript was cached.
    pub async fn append(&self, message: &ChatMessage) -> Result<bool, CacheError> {
        let bytes = encode_json(message)?;
        self.layer
            .backend()
            .list_append_if_exists(&keys::chat_session(&message.session_id), bytes)
            .await
    }

    /// Replace the transcript wholesale. An empty transcript removes the key.
    pub async fn replace(&self, session_id: &str, messages: &[ChatMessage]) -> Result<(), CacheError> {
        let values = messages
            .iter()
            .map(encode_json)
            .collect::<Result<Vec<_>, _>>()?;
        self.layer
            .backend()
            .list_replace(&keys::chat_session(session_id), values, self.layer.next_ttl())
            .await
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), CacheError> {
        self.layer.backend().delete(&keys::chat_session(session_id)).await
    }
}
