//! Change tracking for one managed item.

use std::collections::HashMap;
use std::sync::Arc;

use aws_sdk_dynamodb::types::AttributeValue;
use chrono::Utc;
use parking_lot::{RwLock, RwLockReadGuard};

use crate::error::OdmResult;
use crate::schema::{CasMode, Item};
use crate::value::{self, AttrMap};

/// Shared handle to a managed item. The repository and every caller observe
/// the same instance; mutations through any handle are picked up by the next
/// flush.
pub type ItemRef<T> = Arc<RwLock<T>>;

/// Lifecycle of a managed item within its repository.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ItemState {
    /// Persisted locally, never written to the store.
    New,
    /// Tracked against a last-read snapshot.
    Managed,
    /// Scheduled for deletion on the next flush.
    Removed,
}

/// One entry of the identity map: the shared item handle, the attribute
/// snapshot it was last read or written with, and its lifecycle state.
#[derive(Debug)]
pub struct ManagedItemState<T: Item> {
    item: ItemRef<T>,
    original: AttrMap,
    state: ItemState,
}

impl<T: Item> ManagedItemState<T> {
    /// Tracks a locally created item that has never been written.
    pub fn new_pending(item: ItemRef<T>) -> Self {
        Self {
            item,
            original: AttrMap::new(),
            state: ItemState::New,
        }
    }

    /// Tracks an item fetched from the store with its read snapshot.
    pub fn managed(item: ItemRef<T>, original: AttrMap) -> Self {
        Self {
            item,
            original,
            state: ItemState::Managed,
        }
    }

    /// A shared handle to the managed item.
    pub fn item(&self) -> ItemRef<T> {
        Arc::clone(&self.item)
    }

    /// Read access to the managed item.
    pub fn item_read(&self) -> RwLockReadGuard<'_, T> {
        self.item.read()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ItemState {
        self.state
    }

    /// Whether the item was created locally and never written.
    pub fn is_new(&self) -> bool {
        self.state == ItemState::New
    }

    /// Whether the item is scheduled for deletion.
    pub fn is_removed(&self) -> bool {
        self.state == ItemState::Removed
    }

    /// Schedules the item for deletion on the next flush.
    pub fn mark_removed(&mut self) {
        self.state = ItemState::Removed;
    }

    /// Transitions the item to tracked-against-snapshot.
    pub fn mark_managed(&mut self) {
        self.state = ItemState::Managed;
    }

    /// The attribute snapshot the item was last read or written with.
    pub fn original(&self) -> &AttrMap {
        &self.original
    }

    /// Replaces the snapshot, typically after a re-read from the store.
    pub fn set_original(&mut self, original: AttrMap) {
        self.original = original;
    }

    /// The item's current flat attribute map.
    pub fn dehydrate(&self) -> OdmResult<AttrMap> {
        T::schema().dehydrate(&self.item.read())
    }

    /// Whether a managed item's current data differs from its snapshot.
    ///
    /// New and removed entries are never dirty; they are classified by
    /// state, not by data. Comparison uses the store-aware deep-equality
    /// rules, so rewriting `""` over an absent attribute is not a change.
    pub fn has_dirty_data(&self) -> OdmResult<bool> {
        if self.state != ItemState::Managed {
            return Ok(false);
        }
        let current = self.dehydrate()?;
        let changed_or_added = current
            .iter()
            .any(|(attribute, value)| !value::deep_equal(Some(value), self.original.get(attribute)));
        // an attribute present in the snapshot but gone from the current
        // data is a change too, unless its old value was nil-equivalent
        let dropped = self.original.iter().any(|(attribute, value)| {
            !current.contains_key(attribute) && !value::deep_equal(Some(value), None)
        });
        Ok(changed_or_added || dropped)
    }

    /// Overwrites every timestamp-mode CAS field with now + `offset` seconds.
    pub fn update_cas_timestamps(&self, offset: i64) -> OdmResult<()> {
        let now = Utc::now().timestamp() + offset;
        let schema = T::schema();
        let mut item = self.item.write();
        for field in schema.cas_fields() {
            if field.cas_mode() == CasMode::Timestamp {
                field.write(&mut item, AttributeValue::N(now.to_string()))?;
            }
        }
        Ok(())
    }

    /// Recomputes every partitioned hash key field from its base and hash
    /// source fields. `hash_fn` substitutes the placement hash when given.
    pub fn update_partitioned_hash_keys(
        &self,
        hash_fn: Option<&dyn Fn(&str) -> u32>,
    ) -> OdmResult<()> {
        let schema = T::schema();
        let mut item = self.item.write();
        for spec in schema.partitioned_keys() {
            let base = value::canonical_string(&schema.field_spec(spec.base_field)?.read(&item)?);
            let source = value::canonical_string(&schema.field_spec(spec.hash_field)?.read(&item)?);
            let partitioned = value::partition_suffix(&base, &source, spec.size, hash_fn);
            schema
                .field_spec(spec.field)?
                .write(&mut item, AttributeValue::S(partitioned))?;
        }
        Ok(())
    }

    /// Expected values for the conditional write of this item: each CAS
    /// field's last-persisted value, or `None` when the item has never been
    /// persisted (the attribute must then be absent in the store).
    pub fn check_condition_data(&self) -> HashMap<String, Option<AttributeValue>> {
        T::schema()
            .cas_fields()
            .map(|field| {
                let attribute = field.attribute_name();
                (attribute.to_string(), self.original.get(attribute).cloned())
            })
            .collect()
    }

    /// Refreshes the snapshot from the item's current data after a
    /// successful write.
    pub fn mark_updated(&mut self) -> OdmResult<()> {
        self.original = self.dehydrate()?;
        Ok(())
    }
}
