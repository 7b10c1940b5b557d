//! The store collaborator: the handful of primitives the unit of work is
//! built on, plus the default implementation over the official AWS SDK.
//!
//! The repository never talks to the SDK directly; everything goes through
//! [`StoreClient`] so the orchestration layer can be exercised against an
//! in-memory store in tests.

pub mod aws;

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;

use crate::error::OdmResult;
use crate::value::AttrMap;

pub use aws::AwsStoreClient;

/// One segment of a parallel scan.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Segment {
    /// Zero-based segment index.
    pub index: i32,
    /// Total number of segments the scan is split into.
    pub total: i32,
}

/// A single page request against a table or index.
///
/// The same shape serves both `query` (with a key condition) and `scan`
/// (without). `names` maps `#placeholder` tokens to stored attribute names,
/// `values` maps `:param` tokens to attribute values.
#[derive(Clone, Debug, Default)]
pub struct PageRequest {
    /// Fully prefixed table name.
    pub table: String,
    /// Key condition expression; required for queries, absent for scans.
    pub key_condition: Option<String>,
    /// Filter expression applied after key matching.
    pub filter: Option<String>,
    /// `#placeholder` to attribute-name substitutions.
    pub names: HashMap<String, String>,
    /// `:param` to value substitutions.
    pub values: HashMap<String, AttributeValue>,
    /// Secondary index to read, `None` for the primary index.
    pub index_name: Option<String>,
    /// Continuation token from the previous page.
    pub start_key: Option<AttrMap>,
    /// Maximum number of items evaluated for this page.
    pub limit: Option<i32>,
    /// Whether the read must be strongly consistent.
    pub consistent: bool,
    /// Sort-key order for queries; scans ignore this.
    pub ascending: bool,
    /// Parallel-scan segment assignment.
    pub segment: Option<Segment>,
    /// Projection expression limiting the attributes returned per row. The
    /// repository always reads full rows; this is for callers issuing raw
    /// page requests.
    pub projection: Option<String>,
    /// When set, the store returns counts only and `rows` stays empty.
    pub count_only: bool,
}

impl PageRequest {
    /// The same request pointed at the next page.
    pub fn continued_from(mut self, start_key: AttrMap) -> Self {
        self.start_key = Some(start_key);
        self
    }
}

/// One page of query or scan results.
#[derive(Clone, Debug, Default)]
pub struct Page {
    /// The matching rows, empty for count-only requests.
    pub rows: Vec<AttrMap>,
    /// Number of items matched by this page.
    pub count: i64,
    /// Continuation token; `None` when the result set is exhausted.
    pub last_key: Option<AttrMap>,
}

/// The store primitives the repository is written against.
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    /// Reads a single item by full primary key. `None` when absent.
    async fn get_item(
        &self,
        table: &str,
        key: AttrMap,
        consistent: bool,
    ) -> OdmResult<Option<AttrMap>>;

    /// Reads many items by full primary key. Keys with no matching item are
    /// simply absent from the result; order is not guaranteed.
    async fn batch_get(
        &self,
        table: &str,
        keys: Vec<AttrMap>,
        consistent: bool,
    ) -> OdmResult<Vec<AttrMap>>;

    /// Writes one item conditioned on `expected`: for each attribute, the
    /// stored value must equal the expected value, or be absent when the
    /// expected value is `None`. Returns `false` when the condition did not
    /// hold (the write was rejected), `true` when the write committed.
    async fn conditional_put(
        &self,
        table: &str,
        item: AttrMap,
        expected: HashMap<String, Option<AttributeValue>>,
    ) -> OdmResult<bool>;

    /// Writes many items unconditionally.
    async fn batch_put(&self, table: &str, items: Vec<AttrMap>) -> OdmResult<()>;

    /// Deletes many items by full primary key, unconditionally.
    async fn batch_delete(&self, table: &str, keys: Vec<AttrMap>) -> OdmResult<()>;

    /// Runs one page of a key-condition query.
    async fn query(&self, request: PageRequest) -> OdmResult<Page>;

    /// Runs one page of a (possibly segmented) scan.
    async fn scan(&self, request: PageRequest) -> OdmResult<Page>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::value;

    /// In-memory [`StoreClient`] for unit-of-work tests.
    ///
    /// Point reads and writes run against real stored rows with full
    /// conditional-put semantics, so CAS races behave as they would against
    /// the remote store. Query pages are scripted per test; scans fall back
    /// to serving the stored rows of segment 0 when nothing is scripted.
    /// Every request is recorded for assertions.
    #[derive(Clone, Default)]
    pub(crate) struct MemoryStore {
        inner: Arc<Mutex<MemoryStoreInner>>,
    }

    #[derive(Default)]
    struct MemoryStoreInner {
        key_attributes: HashMap<String, Vec<String>>,
        rows: HashMap<String, BTreeMap<String, AttrMap>>,
        query_pages: VecDeque<Page>,
        scan_pages: VecDeque<Page>,
        page_requests: Vec<PageRequest>,
        calls: Vec<String>,
        fail_next_batch_put: bool,
    }

    impl MemoryStoreInner {
        fn row_key(&self, table: &str, row: &AttrMap) -> String {
            let attributes = self
                .key_attributes
                .get(table)
                .unwrap_or_else(|| panic!("table {table} was not registered"));
            attributes
                .iter()
                .map(|attribute| {
                    row.get(attribute)
                        .map(value::canonical_string)
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>()
                .join("\u{1f}")
        }
    }

    impl MemoryStore {
        /// Registers a table with its primary key attribute names.
        pub(crate) fn with_table(self, table: &str, key_attributes: &[&str]) -> Self {
            self.inner.lock().key_attributes.insert(
                table.to_string(),
                key_attributes.iter().map(ToString::to_string).collect(),
            );
            self
        }

        /// Seeds a stored row.
        pub(crate) fn insert_row(&self, table: &str, row: AttrMap) {
            let mut inner = self.inner.lock();
            let key = inner.row_key(table, &row);
            inner.rows.entry(table.to_string()).or_default().insert(key, row);
        }

        /// Scripts the next query page.
        pub(crate) fn push_query_page(&self, page: Page) {
            self.inner.lock().query_pages.push_back(page);
        }

        /// Scripts the next scan page.
        pub(crate) fn push_scan_page(&self, page: Page) {
            self.inner.lock().scan_pages.push_back(page);
        }

        /// Makes the next `batch_put` fail with a store error.
        pub(crate) fn fail_next_batch_put(&self) {
            self.inner.lock().fail_next_batch_put = true;
        }

        /// Names of every store call made so far, in order.
        pub(crate) fn calls(&self) -> Vec<String> {
            self.inner.lock().calls.clone()
        }

        /// Every query/scan page request received so far, in order.
        pub(crate) fn page_requests(&self) -> Vec<PageRequest> {
            self.inner.lock().page_requests.clone()
        }

        /// Number of stored rows in a table.
        pub(crate) fn row_count(&self, table: &str) -> usize {
            self.inner
                .lock()
                .rows
                .get(table)
                .map(BTreeMap::len)
                .unwrap_or_default()
        }

        /// A stored row by its key attributes, if present.
        pub(crate) fn stored_row(&self, table: &str, key: &AttrMap) -> Option<AttrMap> {
            let inner = self.inner.lock();
            let row_key = inner.row_key(table, key);
            inner.rows.get(table).and_then(|rows| rows.get(&row_key)).cloned()
        }
    }

    #[async_trait]
    impl StoreClient for MemoryStore {
        async fn get_item(
            &self,
            table: &str,
            key: AttrMap,
            _consistent: bool,
        ) -> OdmResult<Option<AttrMap>> {
            let mut inner = self.inner.lock();
            inner.calls.push("GetItem".to_string());
            let row_key = inner.row_key(table, &key);
            Ok(inner.rows.get(table).and_then(|rows| rows.get(&row_key)).cloned())
        }

        async fn batch_get(
            &self,
            table: &str,
            keys: Vec<AttrMap>,
            _consistent: bool,
        ) -> OdmResult<Vec<AttrMap>> {
            let mut inner = self.inner.lock();
            inner.calls.push("BatchGetItem".to_string());
            let mut found = Vec::new();
            for key in keys {
                let row_key = inner.row_key(table, &key);
                if let Some(row) = inner.rows.get(table).and_then(|rows| rows.get(&row_key)) {
                    found.push(row.clone());
                }
            }
            Ok(found)
        }

        async fn conditional_put(
            &self,
            table: &str,
            item: AttrMap,
            expected: HashMap<String, Option<AttributeValue>>,
        ) -> OdmResult<bool> {
            let mut inner = self.inner.lock();
            inner.calls.push("PutItem".to_string());
            let row_key = inner.row_key(table, &item);
            let stored = inner.rows.get(table).and_then(|rows| rows.get(&row_key));
            let holds = expected.iter().all(|(attribute, expected_value)| {
                let current = stored.and_then(|row| row.get(attribute));
                value::deep_equal(current, expected_value.as_ref())
            });
            if !holds {
                return Ok(false);
            }
            inner
                .rows
                .entry(table.to_string())
                .or_default()
                .insert(row_key, item);
            Ok(true)
        }

        async fn batch_put(&self, table: &str, items: Vec<AttrMap>) -> OdmResult<()> {
            let mut inner = self.inner.lock();
            inner.calls.push("BatchWriteItem:Put".to_string());
            if inner.fail_next_batch_put {
                inner.fail_next_batch_put = false;
                return Err(crate::error::OdmError::store(
                    "BatchWriteItem",
                    std::io::Error::other("injected batch put failure"),
                ));
            }
            for item in items {
                let row_key = inner.row_key(table, &item);
                inner
                    .rows
                    .entry(table.to_string())
                    .or_default()
                    .insert(row_key, item);
            }
            Ok(())
        }

        async fn batch_delete(&self, table: &str, keys: Vec<AttrMap>) -> OdmResult<()> {
            let mut inner = self.inner.lock();
            inner.calls.push("BatchWriteItem:Delete".to_string());
            for key in keys {
                let row_key = inner.row_key(table, &key);
                if let Some(rows) = inner.rows.get_mut(table) {
                    rows.remove(&row_key);
                }
            }
            Ok(())
        }

        async fn query(&self, request: PageRequest) -> OdmResult<Page> {
            let mut inner = self.inner.lock();
            inner.calls.push("Query".to_string());
            inner.page_requests.push(request);
            Ok(inner.query_pages.pop_front().unwrap_or_default())
        }

        async fn scan(&self, request: PageRequest) -> OdmResult<Page> {
            let mut inner = self.inner.lock();
            inner.calls.push("Scan".to_string());
            let scripted = inner.scan_pages.pop_front();
            let page = match scripted {
                Some(page) => page,
                None => {
                    // unscripted fallback: segment 0 serves the whole table
                    let serves = request.segment.is_none_or(|segment| segment.index == 0);
                    let rows = if serves {
                        inner
                            .rows
                            .get(&request.table)
                            .map(|rows| rows.values().cloned().collect())
                            .unwrap_or_default()
                    } else {
                        Vec::new()
                    };
                    Page {
                        count: rows.len() as i64,
                        rows,
                        last_key: None,
                    }
                }
            };
            inner.page_requests.push(request);
            Ok(page)
        }
    }
}
