//! The unit of work: per-type identity map, change tracking, and flush
//! orchestration.
//!
//! A [`Repository`] serves one workflow. It is not reentrant: callers must
//! not issue a second operation while one is in flight, and cross-workflow
//! sharing requires external synchronization. Reads are merged into the
//! identity map so that every fetch of the same primary key observes the
//! same shared instance.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, LazyLock};

use aws_sdk_dynamodb::types::AttributeValue;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::RwLock;
use regex::Regex;

use crate::audit::{AuditConfig, AuditPolicy, AuditRecord};
use crate::error::{OdmError, OdmResult};
use crate::schema::{Item, KeyMap};
use crate::state::{ItemRef, ItemState, ManagedItemState};
use crate::store::{Page, PageRequest, Segment, StoreClient};
use crate::value::AttrMap;

/// Default page evaluation limit for queries and scans.
pub const DEFAULT_EVALUATION_LIMIT: i32 = 30;

/// Batch size of one mark-and-remove pass of [`Repository::remove_all`].
const REMOVE_ALL_BATCH: usize = 1000;

/// Scan segments used by [`Repository::remove_all`].
const REMOVE_ALL_PARALLEL: usize = 10;

static FIELD_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"#([A-Za-z_][A-Za-z0-9_]*)").expect("field token pattern compiles")
});

/// Arguments of a key-condition query.
#[derive(Clone, Debug)]
pub struct QueryArgs {
    /// Key condition expression with `#field` and `:param` tokens.
    pub key_condition: String,
    /// Values for the `:param` tokens.
    pub params: HashMap<String, AttributeValue>,
    /// Secondary index to query, `None` for the primary index.
    pub index_name: Option<String>,
    /// Filter expression applied after key matching; empty for none.
    pub filter: String,
    /// Page evaluation limit.
    pub limit: i32,
    /// Whether reads must be strongly consistent.
    pub consistent: bool,
    /// Sort-key order.
    pub ascending: bool,
}

impl Default for QueryArgs {
    fn default() -> Self {
        Self {
            key_condition: String::new(),
            params: HashMap::new(),
            index_name: None,
            filter: String::new(),
            limit: DEFAULT_EVALUATION_LIMIT,
            consistent: false,
            ascending: true,
        }
    }
}

/// Arguments of a table or index scan.
#[derive(Clone, Debug)]
pub struct ScanArgs {
    /// Filter expression with `#field` and `:param` tokens; empty for none.
    pub filter: String,
    /// Values for the `:param` tokens.
    pub params: HashMap<String, AttributeValue>,
    /// Secondary index to scan, `None` for the table itself.
    pub index_name: Option<String>,
    /// Page evaluation limit.
    pub limit: i32,
    /// Whether reads must be strongly consistent.
    pub consistent: bool,
}

impl Default for ScanArgs {
    fn default() -> Self {
        Self {
            filter: String::new(),
            params: HashMap::new(),
            index_name: None,
            limit: DEFAULT_EVALUATION_LIMIT,
            consistent: false,
        }
    }
}

/// Arguments of a fanned-out query over every partition of a partitioned
/// hash key.
#[derive(Clone, Debug)]
pub struct MultiQueryArgs {
    /// Logical name of the (usually partitioned) hash key field.
    pub hash_key: String,
    /// Base values of the hash key; each expands to all its partitions.
    pub hash_key_values: Vec<String>,
    /// Optional range key condition, appended to the key condition; empty
    /// for none.
    pub range_condition: String,
    /// Values for the `:param` tokens of the range condition and filter.
    pub params: HashMap<String, AttributeValue>,
    /// Secondary index to query, `None` for the primary index.
    pub index_name: Option<String>,
    /// Filter expression; empty for none.
    pub filter: String,
    /// Page evaluation limit per partition.
    pub limit: i32,
    /// Whether reads must be strongly consistent.
    pub consistent: bool,
    /// Sort-key order within each partition.
    pub ascending: bool,
    /// Maximum number of concurrently outstanding page requests.
    pub concurrency: usize,
}

impl Default for MultiQueryArgs {
    fn default() -> Self {
        Self {
            hash_key: String::new(),
            hash_key_values: Vec::new(),
            range_condition: String::new(),
            params: HashMap::new(),
            index_name: None,
            filter: String::new(),
            limit: DEFAULT_EVALUATION_LIMIT,
            consistent: false,
            ascending: true,
            concurrency: 10,
        }
    }
}

/// The unit of work for one item type.
pub struct Repository<T: Item, C: StoreClient> {
    store: C,
    table: String,
    items: HashMap<u64, ManagedItemState<T>>,
    skip_check_and_set: bool,
    audit: AuditConfig,
}

impl<T: Item, C: StoreClient> Repository<T, C> {
    /// Creates a repository reading and writing the schema's table.
    pub fn new(store: C) -> Self {
        Self::with_table_prefix(store, "")
    }

    /// Creates a repository with a table-name prefix, e.g. per environment.
    pub fn with_table_prefix(store: C, prefix: &str) -> Self {
        Self {
            store,
            table: format!("{prefix}{}", T::schema().table()),
            items: HashMap::new(),
            skip_check_and_set: false,
            audit: AuditConfig::default(),
        }
    }

    /// The fully prefixed table name this repository operates on.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Number of currently managed entries, pending removals included.
    pub fn managed_count(&self) -> usize {
        self.items.len()
    }

    /// When set, flushes bypass every check-and-set condition and use
    /// unconditional batch writes. Intended for bulk imports.
    pub fn set_skip_check_and_set(&mut self, skip: bool) {
        self.skip_check_and_set = skip;
    }

    /// Whether check-and-set suppression is active.
    pub fn should_skip_check_and_set(&self) -> bool {
        self.skip_check_and_set
    }

    /// Replaces the audit configuration.
    pub fn set_audit(&mut self, audit: AuditConfig) {
        self.audit = audit;
    }

    /// Fetches one item by its logical primary key values.
    ///
    /// Unless `consistent` is set, a key already present in the identity map
    /// is returned without touching the store. A consistent read always goes
    /// to the store and re-hydrates the managed instance in place.
    #[tracing::instrument(name = "odm.get", skip_all, fields(table = %self.table))]
    pub async fn get(&mut self, keys: &KeyMap, consistent: bool) -> OdmResult<Option<ItemRef<T>>> {
        let schema = T::schema();
        let key = Self::translate_keys(keys)?;
        if !consistent {
            let id = schema.primary_identifier_from_map(&key)?;
            if let Some(state) = self.items.get(&id) {
                return Ok(Some(state.item()));
            }
        }
        match self.store.get_item(&self.table, key, consistent).await? {
            Some(row) => Ok(Some(Self::merge_fetched(&mut self.items, row)?)),
            None => Ok(None),
        }
    }

    /// Fetches many items by logical primary key. Keys with no matching
    /// record are simply absent from the result.
    pub async fn batch_get(
        &mut self,
        group_of_keys: &[KeyMap],
        consistent: bool,
    ) -> OdmResult<Vec<ItemRef<T>>> {
        let mut translated = Vec::with_capacity(group_of_keys.len());
        for keys in group_of_keys {
            translated.push(Self::translate_keys(keys)?);
        }
        let rows = self
            .store
            .batch_get(&self.table, translated, consistent)
            .await?;
        rows.into_iter()
            .map(|row| Self::merge_fetched(&mut self.items, row))
            .collect()
    }

    /// Starts managing a locally created item. The write happens on the
    /// next flush. Persisting a key that is already managed is an error.
    pub fn persist(&mut self, item: T) -> OdmResult<ItemRef<T>> {
        let id = T::schema().primary_identifier(&item)?;
        if self.items.contains_key(&id) {
            return Err(OdmError::Misuse(
                "cannot persist an item that is already managed under the same primary keys"
                    .to_string(),
            ));
        }
        let item = Arc::new(RwLock::new(item));
        self.items
            .insert(id, ManagedItemState::new_pending(Arc::clone(&item)));
        Ok(item)
    }

    /// Schedules a managed item for deletion on the next flush.
    pub fn remove(&mut self, item: &ItemRef<T>) -> OdmResult<()> {
        let id = {
            let guard = item.read();
            T::schema().primary_identifier(&guard)?
        };
        match self.items.get_mut(&id) {
            Some(state) => {
                state.mark_removed();
                Ok(())
            }
            None => Err(OdmError::Misuse(
                "cannot remove an item that is not managed".to_string(),
            )),
        }
    }

    /// Consistently fetches an item by key and schedules it for deletion.
    /// A missing record is an error.
    pub async fn remove_by_id(&mut self, keys: &KeyMap) -> OdmResult<()> {
        let item = self.get(keys, true).await?.ok_or_else(|| {
            OdmError::Misuse(format!(
                "cannot remove nonexistent {} record",
                T::schema().item_type()
            ))
        })?;
        self.remove(&item)
    }

    /// Stops tracking an item without touching the store.
    pub fn detach(&mut self, item: &ItemRef<T>) -> OdmResult<()> {
        let id = {
            let guard = item.read();
            T::schema().primary_identifier(&guard)?
        };
        match self.items.remove(&id) {
            Some(_) => Ok(()),
            None => Err(OdmError::Misuse(
                "cannot detach an item that is not managed".to_string(),
            )),
        }
    }

    /// Re-reads a managed item from the store and hydrates the shared
    /// instance in place.
    ///
    /// With `persist_if_not_managed`, an unmanaged item is first registered
    /// as a pending insert; it stays pending when the store has no record
    /// for it yet.
    pub async fn refresh(
        &mut self,
        item: &ItemRef<T>,
        persist_if_not_managed: bool,
    ) -> OdmResult<Option<ItemRef<T>>> {
        let schema = T::schema();
        let (id, keys) = {
            let guard = item.read();
            (
                schema.primary_identifier(&guard)?,
                schema.primary_keys(&guard, false)?,
            )
        };
        if !self.items.contains_key(&id) {
            if !persist_if_not_managed {
                return Err(OdmError::Misuse(
                    "cannot refresh an item that is not managed".to_string(),
                ));
            }
            self.items
                .insert(id, ManagedItemState::new_pending(Arc::clone(item)));
        }
        self.get(&keys, true).await
    }

    /// Drops every managed entry, discarding pending changes.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Writes every pending change to the store.
    ///
    /// Audit records are emitted first for created and changed entries when
    /// the item type enables auditing. Removals are batched into one
    /// unconditional delete. Creates and updates take per-item conditional
    /// writes checked against the last-read CAS values, unless check-and-set
    /// is suppressed (globally or because the type declares no CAS fields),
    /// in which case they are batched into one unconditional put. A failed
    /// condition aborts the flush; writes already issued stay committed.
    #[tracing::instrument(name = "odm.flush", skip_all, fields(table = %self.table))]
    pub async fn flush(&mut self) -> OdmResult<()> {
        let schema = T::schema();
        let skip_cas = self.skip_check_and_set || !schema.has_cas_fields();
        let Self {
            store,
            items,
            audit,
            table,
            ..
        } = self;
        let store: &C = store;
        let table: &str = table;

        let mut removed_ids = Vec::new();
        let mut batch_removal_keys: Vec<AttrMap> = Vec::new();
        let mut batch_set_items: Vec<AttrMap> = Vec::new();
        let mut batch_touched = Vec::new();

        for (id, state) in items.iter_mut() {
            let dirty = state.has_dirty_data()?;

            if schema.audit_enabled() && (state.is_new() || dirty) {
                let record = AuditRecord::new(
                    table,
                    &audit.context,
                    state.original().clone(),
                    state.dehydrate()?,
                );
                if let Err(err) = audit.sink.insert_audit_record(record).await {
                    match audit.policy {
                        AuditPolicy::Strict => return Err(err),
                        AuditPolicy::BestEffort => tracing::warn!(
                            table,
                            error = %err,
                            "audit sink failed; continuing flush"
                        ),
                    }
                }
            }

            if state.is_removed() {
                let keys = {
                    let guard = state.item_read();
                    schema.primary_keys(&guard, true)?
                };
                batch_removal_keys.push(keys.into_iter().collect());
                removed_ids.push(*id);
            } else if state.is_new() || dirty {
                state.update_cas_timestamps(audit.context.utc_offset)?;
                state.update_partitioned_hash_keys(None)?;
                let item_data = state.dehydrate()?;
                if skip_cas {
                    batch_set_items.push(item_data);
                    batch_touched.push(*id);
                    continue;
                }
                let committed = store
                    .conditional_put(table, item_data, state.check_condition_data())
                    .await?;
                if !committed {
                    let reason = if state.is_new() {
                        "an item with the same primary keys already exists"
                    } else {
                        "the item was updated elsewhere since it was last read"
                    };
                    return Err(OdmError::DataConsistency {
                        item_type: schema.item_type(),
                        reason: reason.to_string(),
                    });
                }
                state.mark_managed();
                state.mark_updated()?;
            }
        }

        if !batch_removal_keys.is_empty() {
            store.batch_delete(table, batch_removal_keys).await?;
        }
        if !batch_set_items.is_empty() {
            store.batch_put(table, batch_set_items).await?;
        }
        for id in batch_touched {
            if let Some(state) = items.get_mut(&id) {
                state.mark_managed();
                state.mark_updated()?;
            }
        }
        for id in removed_ids {
            items.remove(&id);
        }
        Ok(())
    }

    /// Runs one page of a query and merges the rows into the identity map.
    /// `last_key` carries the continuation token across calls.
    pub async fn query(
        &mut self,
        args: &QueryArgs,
        last_key: &mut Option<AttrMap>,
    ) -> OdmResult<Vec<ItemRef<T>>> {
        let request = self.page_request_for_query(args, last_key.take())?;
        let page = self.store.query(request).await?;
        *last_key = page.last_key;
        page.rows
            .into_iter()
            .map(|row| Self::merge_fetched(&mut self.items, row))
            .collect()
    }

    /// Queries page by page, invoking `callback` per item until it returns
    /// `false` or the result set is exhausted.
    pub async fn query_and_run(
        &mut self,
        args: &QueryArgs,
        callback: impl FnMut(ItemRef<T>) -> bool,
    ) -> OdmResult<()> {
        let request = self.page_request_for_query(args, None)?;
        let Self { store, items, .. } = self;
        Self::run_page_requests(store, items, 1, vec![request], false, callback).await
    }

    /// Queries the full result set into a vector.
    pub async fn query_all(&mut self, args: &QueryArgs) -> OdmResult<Vec<ItemRef<T>>> {
        let mut results = Vec::new();
        self.query_and_run(args, |item| {
            results.push(item);
            true
        })
        .await?;
        Ok(results)
    }

    /// Counts the items a query matches without hydrating them.
    pub async fn query_count(&mut self, args: &QueryArgs) -> OdmResult<i64> {
        let mut request = self.page_request_for_query(args, None)?;
        request.count_only = true;
        Self::count_page_requests(&self.store, 1, vec![request], false).await
    }

    /// Runs one page of a scan and merges the rows into the identity map.
    pub async fn scan(
        &mut self,
        args: &ScanArgs,
        last_key: &mut Option<AttrMap>,
    ) -> OdmResult<Vec<ItemRef<T>>> {
        let request = self.page_request_for_scan(args, last_key.take())?;
        let page = self.store.scan(request).await?;
        *last_key = page.last_key;
        page.rows
            .into_iter()
            .map(|row| Self::merge_fetched(&mut self.items, row))
            .collect()
    }

    /// Scans with `parallel` segments, invoking `callback` per item until it
    /// returns `false` or every segment is exhausted.
    ///
    /// When the callback stops the run, no further page requests are issued;
    /// requests already in flight are drained and their rows discarded.
    pub async fn scan_and_run(
        &mut self,
        args: &ScanArgs,
        parallel: usize,
        callback: impl FnMut(ItemRef<T>) -> bool,
    ) -> OdmResult<()> {
        if parallel == 0 {
            return Err(OdmError::Misuse(
                "a scan requires at least one segment".to_string(),
            ));
        }
        let base = self.page_request_for_scan(args, None)?;
        let requests = Self::segmented(base, parallel);
        let Self { store, items, .. } = self;
        Self::run_page_requests(store, items, parallel, requests, true, callback).await
    }

    /// Scans the full table (or index) into a vector.
    pub async fn scan_all(
        &mut self,
        args: &ScanArgs,
        parallel: usize,
    ) -> OdmResult<Vec<ItemRef<T>>> {
        let mut results = Vec::new();
        self.scan_and_run(args, parallel, |item| {
            results.push(item);
            true
        })
        .await?;
        Ok(results)
    }

    /// Counts the items a scan matches without hydrating them.
    pub async fn scan_count(&mut self, args: &ScanArgs, parallel: usize) -> OdmResult<i64> {
        if parallel == 0 {
            return Err(OdmError::Misuse(
                "a scan requires at least one segment".to_string(),
            ));
        }
        let mut base = self.page_request_for_scan(args, None)?;
        base.count_only = true;
        let requests = Self::segmented(base, parallel);
        Self::count_page_requests(&self.store, parallel, requests, true).await
    }

    /// Queries every partition of a partitioned hash key concurrently,
    /// invoking `callback` per item until it returns `false` or every
    /// partition is exhausted. Early stop follows the same contract as
    /// [`Repository::scan_and_run`].
    #[tracing::instrument(name = "odm.multi_query", skip_all, fields(table = %self.table))]
    pub async fn multi_query_and_run(
        &mut self,
        args: &MultiQueryArgs,
        callback: impl FnMut(ItemRef<T>) -> bool,
    ) -> OdmResult<()> {
        let requests = self.partitioned_requests(args, false)?;
        let concurrency = args.concurrency.max(1);
        let Self { store, items, .. } = self;
        Self::run_page_requests(store, items, concurrency, requests, false, callback).await
    }

    /// Counts the items matched across every partition of a partitioned
    /// hash key, without hydrating them.
    pub async fn multi_query_count(&mut self, args: &MultiQueryArgs) -> OdmResult<i64> {
        let requests = self.partitioned_requests(args, true)?;
        let concurrency = args.concurrency.max(1);
        Self::count_page_requests(&self.store, concurrency, requests, false).await
    }

    /// Deletes every record of the table: repeatedly scans a bounded batch,
    /// marks it removed, and flushes with check-and-set suppressed, until a
    /// scan pass yields nothing. Pending local changes are discarded first.
    #[tracing::instrument(name = "odm.remove_all", skip_all, fields(table = %self.table))]
    pub async fn remove_all(&mut self) -> OdmResult<()> {
        loop {
            self.clear();
            let args = ScanArgs {
                consistent: true,
                ..ScanArgs::default()
            };
            let mut batch = Vec::new();
            self.scan_and_run(&args, REMOVE_ALL_PARALLEL, |item| {
                batch.push(item);
                batch.len() < REMOVE_ALL_BATCH
            })
            .await?;
            if batch.is_empty() {
                return Ok(());
            }
            for item in &batch {
                self.remove(item)?;
            }
            let saved = self.skip_check_and_set;
            self.skip_check_and_set = true;
            let result = self.flush().await;
            self.skip_check_and_set = saved;
            result?;
        }
    }

    fn translate_keys(keys: &KeyMap) -> OdmResult<AttrMap> {
        let schema = T::schema();
        let mut translated = AttrMap::with_capacity(keys.len());
        for (field, value) in keys {
            translated.insert(schema.field_to_attribute(field)?.to_string(), value.clone());
        }
        Ok(translated)
    }

    /// Merges one fetched row into the identity map: an unknown key starts
    /// a new managed entry, a managed key is re-hydrated in place with its
    /// snapshot replaced. A key that is locally new or removed cannot absorb
    /// remote data; that is a consistency error.
    fn merge_fetched(
        items: &mut HashMap<u64, ManagedItemState<T>>,
        row: AttrMap,
    ) -> OdmResult<ItemRef<T>> {
        let schema = T::schema();
        let id = schema.primary_identifier_from_map(&row)?;
        match items.entry(id) {
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                let reason = match state.state() {
                    ItemState::New => "fetched remote data collides with a locally persisted item",
                    ItemState::Removed => "fetched remote data collides with a locally removed item",
                    ItemState::Managed => {
                        {
                            let item = state.item();
                            let mut guard = item.write();
                            schema.hydrate_into(&row, &mut guard)?;
                        }
                        state.set_original(row);
                        return Ok(state.item());
                    }
                };
                Err(OdmError::DataConsistency {
                    item_type: schema.item_type(),
                    reason: reason.to_string(),
                })
            }
            Entry::Vacant(entry) => {
                let item = Arc::new(RwLock::new(schema.hydrate(&row)?));
                entry.insert(ManagedItemState::managed(Arc::clone(&item), row));
                Ok(item)
            }
        }
    }

    fn resolve_field_tokens(condition: &str, names: &mut HashMap<String, String>) -> OdmResult<()> {
        let schema = T::schema();
        for captures in FIELD_TOKEN.captures_iter(condition) {
            let field = &captures[1];
            let attribute = schema.field_to_attribute(field)?;
            names.insert(format!("#{field}"), attribute.to_string());
        }
        Ok(())
    }

    fn page_request_for_query(
        &self,
        args: &QueryArgs,
        start_key: Option<AttrMap>,
    ) -> OdmResult<PageRequest> {
        let mut names = HashMap::new();
        Self::resolve_field_tokens(&args.key_condition, &mut names)?;
        Self::resolve_field_tokens(&args.filter, &mut names)?;
        Ok(PageRequest {
            table: self.table.clone(),
            key_condition: non_empty(&args.key_condition),
            filter: non_empty(&args.filter),
            names,
            values: args.params.clone(),
            index_name: args.index_name.clone(),
            start_key,
            limit: Some(args.limit),
            consistent: args.consistent,
            ascending: args.ascending,
            segment: None,
            projection: None,
            count_only: false,
        })
    }

    fn page_request_for_scan(
        &self,
        args: &ScanArgs,
        start_key: Option<AttrMap>,
    ) -> OdmResult<PageRequest> {
        let mut names = HashMap::new();
        Self::resolve_field_tokens(&args.filter, &mut names)?;
        Ok(PageRequest {
            table: self.table.clone(),
            key_condition: None,
            filter: non_empty(&args.filter),
            names,
            values: args.params.clone(),
            index_name: args.index_name.clone(),
            start_key,
            limit: Some(args.limit),
            consistent: args.consistent,
            ascending: true,
            segment: None,
            projection: None,
            count_only: false,
        })
    }

    fn partitioned_requests(
        &self,
        args: &MultiQueryArgs,
        count_only: bool,
    ) -> OdmResult<Vec<PageRequest>> {
        let schema = T::schema();
        let mut key_condition = format!("#{hash} = :{hash}", hash = args.hash_key);
        if !args.range_condition.is_empty() {
            key_condition = format!("{key_condition} AND {}", args.range_condition);
        }
        let mut names = HashMap::new();
        Self::resolve_field_tokens(&key_condition, &mut names)?;
        Self::resolve_field_tokens(&args.filter, &mut names)?;

        let mut requests = Vec::new();
        for base in &args.hash_key_values {
            for partition_value in schema.all_partitioned_values(&args.hash_key, base) {
                let mut values = args.params.clone();
                values.insert(
                    format!(":{}", args.hash_key),
                    AttributeValue::S(partition_value),
                );
                requests.push(PageRequest {
                    table: self.table.clone(),
                    key_condition: Some(key_condition.clone()),
                    filter: non_empty(&args.filter),
                    names: names.clone(),
                    values,
                    index_name: args.index_name.clone(),
                    start_key: None,
                    limit: Some(args.limit),
                    consistent: args.consistent,
                    ascending: args.ascending,
                    segment: None,
                    projection: None,
                    count_only,
                });
            }
        }
        Ok(requests)
    }

    fn segmented(base: PageRequest, parallel: usize) -> Vec<PageRequest> {
        if parallel == 1 {
            return vec![base];
        }
        (0..parallel)
            .map(|index| {
                let mut request = base.clone();
                request.segment = Some(Segment {
                    index: index as i32,
                    total: parallel as i32,
                });
                request
            })
            .collect()
    }

    /// Bounded fan-out over a set of page requests. Each completed page is
    /// merged and fed to the callback; a page with a continuation token is
    /// re-queued. When the callback stops the run, the queue is abandoned
    /// and in-flight requests are drained without processing. The first
    /// error from any request fails the whole run.
    async fn run_page_requests(
        store: &C,
        items: &mut HashMap<u64, ManagedItemState<T>>,
        concurrency: usize,
        requests: Vec<PageRequest>,
        use_scan: bool,
        mut callback: impl FnMut(ItemRef<T>) -> bool,
    ) -> OdmResult<()> {
        let mut pending: VecDeque<PageRequest> = requests.into();
        let mut inflight = FuturesUnordered::new();
        let mut stopped = false;
        loop {
            while !stopped && inflight.len() < concurrency {
                let Some(request) = pending.pop_front() else {
                    break;
                };
                inflight.push(async move {
                    let page = if use_scan {
                        store.scan(request.clone()).await?
                    } else {
                        store.query(request.clone()).await?
                    };
                    Ok::<(PageRequest, Page), OdmError>((request, page))
                });
            }
            let Some(result) = inflight.next().await else {
                break;
            };
            let (request, page) = result?;
            if stopped {
                continue;
            }
            for row in page.rows {
                let item = Self::merge_fetched(items, row)?;
                if !callback(item) {
                    stopped = true;
                    break;
                }
            }
            if !stopped {
                if let Some(last_key) = page.last_key {
                    pending.push_back(request.continued_from(last_key));
                }
            }
        }
        Ok(())
    }

    async fn count_page_requests(
        store: &C,
        concurrency: usize,
        requests: Vec<PageRequest>,
        use_scan: bool,
    ) -> OdmResult<i64> {
        let mut pending: VecDeque<PageRequest> = requests.into();
        let mut inflight = FuturesUnordered::new();
        let mut total = 0_i64;
        loop {
            while inflight.len() < concurrency {
                let Some(request) = pending.pop_front() else {
                    break;
                };
                inflight.push(async move {
                    let page = if use_scan {
                        store.scan(request.clone()).await?
                    } else {
                        store.query(request.clone()).await?
                    };
                    Ok::<(PageRequest, Page), OdmError>((request, page))
                });
            }
            let Some(result) = inflight.next().await else {
                break;
            };
            let (request, page) = result?;
            total += page.count;
            if let Some(last_key) = page.last_key {
                pending.push_back(request.continued_from(last_key));
            }
        }
        Ok(total)
    }
}

fn non_empty(text: &str) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
