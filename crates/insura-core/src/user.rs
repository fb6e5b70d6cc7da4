use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A registered account.
///
/// This is the internal record: it carries `password_hash` so that cached
/// snapshots can serve credential checks. Outward-facing DTOs strip it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(with = "crate::id::as_string")]
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl User {
    pub fn new(
        id: i64,
        username: impl Into<String>,
        password_hash: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            username: username.into(),
            password_hash: password_hash.into(),
            email: email.into(),
            created_at: now,
            updated_at: now,
        }
    }
}
