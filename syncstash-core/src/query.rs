//! Item selection: id restriction, timestamp and sortindex filters, TTL
//! expiry, ordering and limit.
//!
//! The same engine serves the in-memory backing store and the cached
//! collection managers, so both answer a given query identically.

use crate::error::{QueryError, StashResult, StorageError};
use crate::{Bso, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Ascending `modified`.
    Oldest,
    /// Descending `modified`.
    Newest,
    /// Ascending `sortindex`.
    Index,
}

impl SortOrder {
    /// `"oldest"` and `"newer"` are recognised; anything else sorts by index.
    pub fn parse(value: &str) -> Self {
        match value {
            "oldest" => SortOrder::Oldest,
            "newer" => SortOrder::Newest,
            _ => SortOrder::Index,
        }
    }
}

/// Filters for reading items out of a collection.
///
/// All comparisons are strict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemQuery {
    pub ids: Option<Vec<String>>,
    pub older: Option<Timestamp>,
    pub newer: Option<Timestamp>,
    pub index_above: Option<i64>,
    pub index_below: Option<i64>,
    pub limit: Option<usize>,
    pub sort: Option<SortOrder>,
}

impl ItemQuery {
    /// A query matching every live item.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_older(mut self, older: Timestamp) -> Self {
        self.older = Some(older);
        self
    }

    pub fn with_newer(mut self, newer: Timestamp) -> Self {
        self.newer = Some(newer);
        self
    }

    pub fn with_index_above(mut self, index: i64) -> Self {
        self.index_above = Some(index);
        self
    }

    pub fn with_index_below(mut self, index: i64) -> Self {
        self.index_below = Some(index);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_sort(mut self, sort: SortOrder) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Build a query from loosely typed key/value filters.
    ///
    /// Recognised keys: `ids` (comma separated), `older`, `newer`,
    /// `index_above`, `index_below`, `limit`, `sort`. Any other key is
    /// rejected rather than ignored.
    pub fn from_params<'a, I>(params: I) -> Result<Self, QueryError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut query = ItemQuery::new();
        for (name, value) in params {
            match name {
                "ids" => {
                    query.ids = Some(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|id| !id.is_empty())
                            .map(str::to_string)
                            .collect(),
                    )
                }
                "older" => query.older = Some(Timestamp::from_millis(parse_int(name, value)?)),
                "newer" => query.newer = Some(Timestamp::from_millis(parse_int(name, value)?)),
                "index_above" => query.index_above = Some(parse_int(name, value)?),
                "index_below" => query.index_below = Some(parse_int(name, value)?),
                "limit" => {
                    query.limit = Some(value.parse().map_err(|_| QueryError::InvalidFilterValue {
                        name: name.to_string(),
                        value: value.to_string(),
                    })?)
                }
                "sort" => query.sort = Some(SortOrder::parse(value)),
                unknown => {
                    return Err(QueryError::UnknownFilter {
                        name: unknown.to_string(),
                    })
                }
            }
        }
        Ok(query)
    }

    /// Whether an item passes the timestamp, sortindex and TTL filters.
    /// The id restriction, ordering and limit are not considered here.
    pub fn matches(&self, bso: &Bso, now_secs: i64) -> bool {
        if self.older.is_some_and(|older| bso.modified >= older) {
            return false;
        }
        if self.newer.is_some_and(|newer| bso.modified <= newer) {
            return false;
        }
        if let Some(above) = self.index_above {
            if !bso.sortindex.is_some_and(|index| index > above) {
                return false;
            }
        }
        if let Some(below) = self.index_below {
            if !bso.sortindex.is_some_and(|index| index < below) {
                return false;
            }
        }
        bso.is_live(now_secs)
    }

    /// Run the query against a collection's items.
    ///
    /// A requested id that does not exist is an `ItemNotFound` error for that
    /// id; it is not silently skipped.
    pub fn select(
        &self,
        collection: &str,
        items: &BTreeMap<String, Bso>,
        now_secs: i64,
    ) -> StashResult<Vec<Bso>> {
        let candidates: Vec<&Bso> = match &self.ids {
            Some(ids) => ids
                .iter()
                .map(|id| {
                    items
                        .get(id)
                        .ok_or_else(|| StorageError::item_not_found(collection, id.as_str()))
                })
                .collect::<Result<_, _>>()?,
            None => items.values().collect(),
        };

        let mut selected: Vec<Bso> = candidates
            .into_iter()
            .filter(|bso| self.matches(bso, now_secs))
            .cloned()
            .collect();

        match self.sort {
            Some(SortOrder::Oldest) => selected.sort_by_key(|bso| bso.modified),
            Some(SortOrder::Newest) => {
                selected.sort_by(|a, b| b.modified.cmp(&a.modified));
            }
            Some(SortOrder::Index) => selected.sort_by_key(|bso| bso.sortindex),
            None => {}
        }

        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        Ok(selected)
    }
}

fn parse_int(name: &str, value: &str) -> Result<i64, QueryError> {
    value.parse().map_err(|_| QueryError::InvalidFilterValue {
        name: name.to_string(),
        value: value.to_string(),
    })
}
