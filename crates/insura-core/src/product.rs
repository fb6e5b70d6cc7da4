use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// An insurance product in the catalog.
///
/// Prices are integer cents; floating point never touches money.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(with = "crate::id::as_string")]
    pub id: i64,
    pub name: String,
    pub category: String,
    pub base_price_cents: i64,
    #[serde(default)]
    pub description: String,
    /// Free-form coverage attributes, stored as a JSON object.
    #[serde(default)]
    pub features: Map<String, Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Product {
    pub fn new(
        id: i64,
        name: impl Into<String>,
        category: impl Into<String>,
        base_price_cents: i64,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            name: name.into(),
            category: category.into(),
            base_price_cents,
            description: String::new(),
            features: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_feature(mut self, key: impl Into<String>, value: Value) -> Self {
        self.features.insert(key.into(), value);
        self
    }
}
