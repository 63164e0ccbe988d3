//! Request and response bodies of the HTTP surface.

use serde::{Deserialize, Serialize};

use crate::error::ServerError;
use crate::storage::{Change, StorageError};

pub const DEFAULT_PAGE_SIZE: i64 = 100;
pub const MAX_PAGE_SIZE: i64 = 1000;

/// Query string of `GET …/_trust/changefeed`.
#[derive(Debug, Default, Deserialize)]
pub struct ChangeFeedQuery {
    /// Cursor; empty or `0` is the start, `-1` the end.
    #[serde(default)]
    pub change_id: String,
    /// Page size; negative pages backwards from the cursor.
    #[serde(default)]
    pub records: String,
}

impl ChangeFeedQuery {
    /// The page size; empty or zero means the default. Clamped to ±[`MAX_PAGE_SIZE`].
    pub fn records(&self) -> Result<i64, ServerError> {
        if self.records.is_empty() {
            return Ok(DEFAULT_PAGE_SIZE);
        }
        let n: i64 = self.records.parse().map_err(|_| {
            ServerError::Storage(StorageError::BadQuery(format!(
                "records must be an integer, got {:?}",
                self.records
            )))
        })?;
        if n == 0 {
            return Ok(DEFAULT_PAGE_SIZE);
        }
        Ok(n.clamp(-MAX_PAGE_SIZE, MAX_PAGE_SIZE))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangeFeedResponse {
    pub count: usize,
    pub records: Vec<Change>,
}

impl From<Vec<Change>> for ChangeFeedResponse {
    fn from(records: Vec<Change>) -> Self {
        Self {
            count: records.len(),
            records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_defaults_and_clamps() {
        let q = ChangeFeedQuery::default();
        assert_eq!(q.records().unwrap(), DEFAULT_PAGE_SIZE);
        let q = ChangeFeedQuery {
            change_id: "-1".into(),
            records: "-5000".into(),
        };
        assert_eq!(q.records().unwrap(), -MAX_PAGE_SIZE);
        let q = ChangeFeedQuery {
            change_id: String::new(),
            records: "ten".into(),
        };
        assert!(q.records().is_err());
    }
}
