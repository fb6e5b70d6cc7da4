use serde::{Deserialize, Deserializer, Serialize};

/// Paging and filter parameters for catalog listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductQuery {
    pub offset: usize,
    pub limit: usize,
    /// Restrict to one category; `None` lists every category.
    #[serde(
        default,
        deserialize_with = "deserialize_category",
        skip_serializing_if = "Option::is_none"
    )]
    category: Option<String>,
}

/// An empty category filter means "every category".
pub fn category_filter(category: Option<&str>) -> Option<&str> {
    category.filter(|c| !c.is_empty())
}

fn deserialize_category<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let category = Option::<String>::deserialize(deserializer)?;
    Ok(category.filter(|c| !c.is_empty()))
}

impl ProductQuery {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit,
            category: None,
        }
    }

    /// Builds a query from a 1-based page number and page size.
    pub fn page(page: usize, size: usize) -> Self {
        Self::new(page.saturating_sub(1) * size, size)
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        let category = category.into();
        self.category = if category.is_empty() {
            None
        } else {
            Some(category)
        };
        self
    }

    pub fn category(&self) -> Option<&str> {
        category_filter(self.category.as_deref())
    }
}

/// One page of results plus the total number of matching records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64) -> Self {
        Self { items, total }
    }

    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }
}
