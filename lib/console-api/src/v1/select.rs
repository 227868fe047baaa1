use serde::{Deserialize, Serialize};

/// Filter and pagination parameters for list calls
///
/// `page` is 1-based. A non-positive `limit` or `page` selects nothing.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataSelectQuery {
    /// Case-sensitive substring the item name must contain; empty keeps everything
    #[serde(default)]
    pub filter_name: String,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub page: i64,
}

impl DataSelectQuery {
    pub fn new(filter_name: impl Into<String>, limit: i64, page: i64) -> Self {
        Self {
            filter_name: filter_name.into(),
            limit,
            page,
        }
    }
}

/// One page of a filtered, sorted list
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page<T> {
    pub limit: i64,
    pub page: i64,
    /// Number of items that matched the filter, before pagination
    pub total: usize,
    pub items: Vec<T>,
}

impl<T> Page<T> {
    /// Map the items while keeping the pagination metadata
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            limit: self.limit,
            page: self.page,
            total: self.total,
            items: self.items.into_iter().map(f).collect(),
        }
    }
}
