use insura_core::User;

use super::backend::CacheError;
use super::keys;
use super::layer::{CacheLayer, encode_json};

/// User snapshots, addressable by id and by username.
#[derive(Debug, Clone)]
pub struct UserCache {
    layer: CacheLayer,
}

impl UserCache {
    pub fn new(layer: CacheLayer) -> Self {
        Self { layer }
    }

    pub async fn get_by_id(&self, id: i64) -> Option<User> {
        self.layer.read_json(&keys::user_by_id(id)).await
    }

    pub async fn get_by_name(&self, username: &str) -> Option<User> {
        self.layer.read_json(&keys::user_by_username(username)).await
    }

    /// Write both keys in one atomic batch.
    pub async fn set(&self, user: &User) -> Result<(), CacheError> {
        let bytes = encode_json(user)?;
        self.layer
            .backend()
            .set_many(
                vec![
                    (keys::user_by_id(user.id), bytes.clone()),
                    (keys::user_by_username(&user.username), bytes),
                ],
                self.layer.next_ttl(),
            )
            .await
    }

    pub async fn delete(&self, user: &User) -> Result<(), CacheError> {
        self.layer
            .backend()
            .delete_many(&[keys::user_by_id(user.id), keys::user_by_username(&user.username)])
            .await
    }
}
