//! Item metadata: immutable schema descriptors and typed field accessors.
//!
//! Every mapped type implements [`Item`], exposing one lazily-built
//! [`ItemSchema`] for the life of the process. The schema is the single
//! source of truth for table name, index layout, field-to-attribute naming,
//! optimistic-concurrency markers, and partitioned hash keys. All data
//! movement between objects and attribute maps goes through the accessor
//! table declared here.

use std::any;
use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;
use indexmap::IndexMap;

use crate::error::{OdmError, OdmResult};
use crate::value::{self, AttrMap};

/// A type that maps onto a store table.
///
/// Implementations typically build the schema once inside a
/// [`std::sync::LazyLock`] static:
///
/// ```ignore
/// impl Item for GameScore {
///     fn schema() -> &'static ItemSchema<Self> {
///         static SCHEMA: LazyLock<ItemSchema<GameScore>> = LazyLock::new(|| {
///             ItemSchema::builder("game_scores")
///                 .primary_index("game_code", Some("player"))
///                 .field(field_spec!(GameScore, game_code => "gameCode", String))
///                 .field(field_spec!(GameScore, player, String))
///                 .build()
///                 .expect("valid schema")
///         });
///         &SCHEMA
///     }
/// }
/// ```
pub trait Item: Default + Send + Sync + Sized + 'static {
    /// Returns the immutable schema for this item type.
    fn schema() -> &'static ItemSchema<Self>;
}

/// The stored representation of a field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttributeKind {
    /// A UTF-8 string. Stored `NULL`/absent values hydrate as `""`.
    String,
    /// An arbitrary-precision decimal number.
    Number,
    /// A byte blob.
    Binary,
    /// A boolean.
    Bool,
    /// The null marker.
    Null,
    /// An ordered list of attribute values.
    List,
    /// A string-keyed map of attribute values.
    Map,
}

/// Optimistic-concurrency participation of a field.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CasMode {
    /// The field is not checked on write.
    #[default]
    Disabled,
    /// Writes are conditioned on the field still holding its last-read value.
    Enabled,
    /// Like `Enabled`, and the mapper overwrites the field with the current
    /// epoch timestamp on every flush.
    Timestamp,
}

/// One index over the table, named by logical field names.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexDef {
    /// Index name, `None` for the primary index.
    pub name: Option<&'static str>,
    /// Logical name of the hash key field.
    pub hash: &'static str,
    /// Logical name of the range key field, if the index has one.
    pub range: Option<&'static str>,
}

impl IndexDef {
    /// Declares the primary index.
    pub fn primary(hash: &'static str, range: Option<&'static str>) -> Self {
        Self {
            name: None,
            hash,
            range,
        }
    }

    /// Declares a secondary index.
    pub fn secondary(
        name: &'static str,
        hash: &'static str,
        range: Option<&'static str>,
    ) -> Self {
        Self {
            name: Some(name),
            hash,
            range,
        }
    }

    /// The key fields of the index, hash first.
    pub fn key_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        std::iter::once(self.hash).chain(self.range)
    }
}

/// Reads a field of `T` as an attribute value.
pub type Getter<T> = fn(&T) -> OdmResult<AttributeValue>;

/// Writes an attribute value into a field of `T`.
pub type Setter<T> = fn(&mut T, AttributeValue) -> OdmResult<()>;

/// Declaration of one mapped field: naming, stored kind, concurrency mode,
/// and the typed accessors that move data in and out of the object.
pub struct FieldSpec<T> {
    field: &'static str,
    attribute: &'static str,
    kind: AttributeKind,
    cas: CasMode,
    get: Getter<T>,
    set: Setter<T>,
}

impl<T> FieldSpec<T> {
    /// Declares a field whose stored attribute name equals its logical name.
    pub fn new(field: &'static str, kind: AttributeKind, get: Getter<T>, set: Setter<T>) -> Self {
        Self {
            field,
            attribute: field,
            kind,
            cas: CasMode::Disabled,
            get,
            set,
        }
    }

    /// Overrides the stored attribute name.
    pub fn attribute(mut self, attribute: &'static str) -> Self {
        self.attribute = attribute;
        self
    }

    /// Sets the optimistic-concurrency mode.
    pub fn cas(mut self, mode: CasMode) -> Self {
        self.cas = mode;
        self
    }

    /// Logical field name.
    pub fn field(&self) -> &'static str {
        self.field
    }

    /// Stored attribute name.
    pub fn attribute_name(&self) -> &'static str {
        self.attribute
    }

    /// Stored kind of the field.
    pub fn kind(&self) -> AttributeKind {
        self.kind
    }

    /// Optimistic-concurrency mode of the field.
    pub fn cas_mode(&self) -> CasMode {
        self.cas
    }

    /// Reads the field from `item`.
    pub fn read(&self, item: &T) -> OdmResult<AttributeValue> {
        (self.get)(item)
    }

    /// Writes `value` into the field of `item`.
    pub fn write(&self, item: &mut T, value: AttributeValue) -> OdmResult<()> {
        (self.set)(item, value)
    }
}

impl<T> std::fmt::Debug for FieldSpec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldSpec")
            .field("field", &self.field)
            .field("attribute", &self.attribute)
            .field("kind", &self.kind)
            .field("cas", &self.cas)
            .finish_non_exhaustive()
    }
}

/// Declaration of a partitioned hash key: `field` is rewritten on every
/// flush to `<base>-<hex(hash(source) % size)>`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionedKeySpec {
    /// Logical name of the field that receives the partitioned value.
    pub field: &'static str,
    /// Logical name of the field providing the base value.
    pub base_field: &'static str,
    /// Logical name of the field hashed to pick the partition.
    pub hash_field: &'static str,
    /// Number of partitions.
    pub size: u32,
}

/// Immutable metadata for one item type.
pub struct ItemSchema<T> {
    table: &'static str,
    primary: IndexDef,
    secondary: Vec<IndexDef>,
    fields: Vec<FieldSpec<T>>,
    by_field: HashMap<&'static str, usize>,
    by_attribute: HashMap<&'static str, usize>,
    partitioned: Vec<PartitionedKeySpec>,
    reserved_attributes: Vec<&'static str>,
    audit_enabled: bool,
}

impl<T> ItemSchema<T> {
    /// Starts building a schema for the given table.
    pub fn builder(table: &'static str) -> SchemaBuilder<T> {
        SchemaBuilder {
            table,
            primary: None,
            secondary: Vec::new(),
            fields: Vec::new(),
            partitioned: Vec::new(),
            reserved_attributes: Vec::new(),
            audit_enabled: false,
        }
    }

    /// Short name of the mapped Rust type, used in error messages.
    pub fn item_type(&self) -> &'static str {
        any::type_name::<T>().rsplit("::").next().unwrap_or("item")
    }

    /// Unprefixed table name.
    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Whether flushes of this type emit audit records.
    pub fn audit_enabled(&self) -> bool {
        self.audit_enabled
    }

    /// All indexes, primary first, secondaries in declaration order.
    pub fn indexes(&self) -> impl Iterator<Item = &IndexDef> + '_ {
        std::iter::once(&self.primary).chain(self.secondary.iter())
    }

    /// The primary index.
    pub fn primary_index(&self) -> &IndexDef {
        &self.primary
    }

    /// All declared fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = &FieldSpec<T>> + '_ {
        self.fields.iter()
    }

    /// Fields participating in optimistic concurrency.
    pub fn cas_fields(&self) -> impl Iterator<Item = &FieldSpec<T>> + '_ {
        self.fields
            .iter()
            .filter(|field| field.cas_mode() != CasMode::Disabled)
    }

    /// Whether any field participates in optimistic concurrency.
    pub fn has_cas_fields(&self) -> bool {
        self.cas_fields().next().is_some()
    }

    /// Declared partitioned hash keys.
    pub fn partitioned_keys(&self) -> &[PartitionedKeySpec] {
        &self.partitioned
    }

    /// Looks up a field by logical name.
    pub fn field_spec(&self, field: &str) -> OdmResult<&FieldSpec<T>> {
        self.by_field
            .get(field)
            .map(|index| &self.fields[*index])
            .ok_or_else(|| {
                OdmError::Misuse(format!(
                    "{} has no field named {field}",
                    self.item_type()
                ))
            })
    }

    /// Maps a logical field name to its stored attribute name.
    pub fn field_to_attribute(&self, field: &str) -> OdmResult<&'static str> {
        Ok(self.field_spec(field)?.attribute_name())
    }

    /// All values a partitioned hash key can take for the given base value.
    ///
    /// Returns `[base]` unchanged when `field` is not partitioned.
    pub fn all_partitioned_values(&self, field: &str, base: &str) -> Vec<String> {
        match self.partitioned.iter().find(|spec| spec.field == field) {
            Some(spec) => (0..spec.size)
                .map(|slot| format!("{base}-{slot:x}"))
                .collect(),
            None => vec![base.to_string()],
        }
    }

    /// Converts an item into its flat attribute map.
    pub fn dehydrate(&self, item: &T) -> OdmResult<AttrMap> {
        let mut map = AttrMap::with_capacity(self.fields.len());
        for field in &self.fields {
            map.insert(field.attribute_name().to_string(), field.read(item)?);
        }
        Ok(map)
    }

    /// Populates `item` from a stored attribute map.
    ///
    /// Reserved attributes are skipped silently; attributes with no declared
    /// field are skipped with a warning. String-kind attributes stored as
    /// `NULL` hydrate as the empty string.
    pub fn hydrate_into(&self, map: &AttrMap, item: &mut T) -> OdmResult<()> {
        for (attribute, value) in map {
            if self.reserved_attributes.contains(&attribute.as_str()) {
                continue;
            }
            let Some(index) = self.by_attribute.get(attribute.as_str()) else {
                tracing::warn!(
                    item_type = self.item_type(),
                    attribute = attribute.as_str(),
                    "skipping unknown attribute during hydration"
                );
                continue;
            };
            let field = &self.fields[*index];
            let value = match (field.kind(), value) {
                (AttributeKind::String, AttributeValue::Null(_)) => {
                    AttributeValue::S(String::new())
                }
                _ => value.clone(),
            };
            field.write(item, value)?;
        }
        Ok(())
    }

    /// Builds a fresh item from a stored attribute map.
    pub fn hydrate(&self, map: &AttrMap) -> OdmResult<T>
    where
        T: Default,
    {
        let mut item = T::default();
        self.hydrate_into(map, &mut item)?;
        Ok(item)
    }

    /// Primary key values of `item`, in declared key order.
    ///
    /// Keys are named by stored attribute when `as_attribute_keys` is true,
    /// by logical field name otherwise.
    pub fn primary_keys(&self, item: &T, as_attribute_keys: bool) -> OdmResult<KeyMap> {
        let mut keys = KeyMap::new();
        for field_name in self.primary.key_fields() {
            let field = self.field_spec(field_name)?;
            let name = if as_attribute_keys {
                field.attribute_name()
            } else {
                field.field()
            };
            keys.insert(name.to_string(), field.read(item)?);
        }
        Ok(keys)
    }

    /// Primary key values extracted from a stored attribute map, keyed by
    /// attribute name, in declared key order.
    pub fn primary_keys_from_map(&self, map: &AttrMap) -> OdmResult<KeyMap> {
        let mut keys = KeyMap::new();
        for field_name in self.primary.key_fields() {
            let attribute = self.field_to_attribute(field_name)?;
            let value = map.get(attribute).ok_or_else(|| {
                OdmError::Misuse(format!(
                    "cannot identify incomplete {} record: attribute {attribute} is missing",
                    self.item_type()
                ))
            })?;
            keys.insert(attribute.to_string(), value.clone());
        }
        Ok(keys)
    }

    /// Stable identity hash of `item` within this repository, composed from
    /// its primary key values in declared key order.
    pub fn primary_identifier(&self, item: &T) -> OdmResult<u64> {
        Ok(Self::identifier_of(self.primary_keys(item, true)?))
    }

    /// Stable identity hash of a stored record.
    pub fn primary_identifier_from_map(&self, map: &AttrMap) -> OdmResult<u64> {
        Ok(Self::identifier_of(self.primary_keys_from_map(map)?))
    }

    fn identifier_of(keys: KeyMap) -> u64 {
        let mut hasher = crc32fast::Hasher::new();
        let mut composite = crc32fast::Hasher::new();
        for value in keys.values() {
            hasher.reset();
            hasher.update(value::canonical_string(value).as_bytes());
            composite.update(&hasher.clone().finalize().to_be_bytes());
        }
        let low = composite.finalize();
        // fold the key count in so `["a"]` and `["a", ""]` stay distinct
        u64::from(low) << 32 | keys.len() as u64
    }
}

impl<T> std::fmt::Debug for ItemSchema<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemSchema")
            .field("table", &self.table)
            .field("primary", &self.primary)
            .field("secondary", &self.secondary)
            .field("fields", &self.fields)
            .field("partitioned", &self.partitioned)
            .field("audit_enabled", &self.audit_enabled)
            .finish_non_exhaustive()
    }
}

/// Ordered logical-or-attribute key map, in declared key order.
pub type KeyMap = IndexMap<String, AttributeValue>;

/// Builder for [`ItemSchema`]. Validation happens in [`SchemaBuilder::build`].
pub struct SchemaBuilder<T> {
    table: &'static str,
    primary: Option<IndexDef>,
    secondary: Vec<IndexDef>,
    fields: Vec<FieldSpec<T>>,
    partitioned: Vec<PartitionedKeySpec>,
    reserved_attributes: Vec<&'static str>,
    audit_enabled: bool,
}

impl<T> SchemaBuilder<T> {
    /// Declares the primary index.
    pub fn primary_index(mut self, hash: &'static str, range: Option<&'static str>) -> Self {
        self.primary = Some(IndexDef::primary(hash, range));
        self
    }

    /// Declares a secondary index. Declaration order is the order the query
    /// planner considers indexes in.
    pub fn secondary_index(
        mut self,
        name: &'static str,
        hash: &'static str,
        range: Option<&'static str>,
    ) -> Self {
        self.secondary.push(IndexDef::secondary(name, hash, range));
        self
    }

    /// Declares a field.
    pub fn field(mut self, spec: FieldSpec<T>) -> Self {
        self.fields.push(spec);
        self
    }

    /// Declares a partitioned hash key.
    pub fn partitioned_key(mut self, spec: PartitionedKeySpec) -> Self {
        self.partitioned.push(spec);
        self
    }

    /// Marks an attribute name as reserved: it is never hydrated into items.
    pub fn reserved_attribute(mut self, attribute: &'static str) -> Self {
        self.reserved_attributes.push(attribute);
        self
    }

    /// Enables audit records for flushes of this type.
    pub fn audit(mut self, enabled: bool) -> Self {
        self.audit_enabled = enabled;
        self
    }

    /// Validates the declarations and produces the schema.
    pub fn build(self) -> OdmResult<ItemSchema<T>> {
        let item_type = any::type_name::<T>();
        let primary = self.primary.ok_or_else(|| {
            OdmError::Config(format!("{item_type} declares no primary index"))
        })?;

        let mut by_field = HashMap::with_capacity(self.fields.len());
        let mut by_attribute = HashMap::with_capacity(self.fields.len());
        for (index, field) in self.fields.iter().enumerate() {
            if by_field.insert(field.field(), index).is_some() {
                return Err(OdmError::Config(format!(
                    "{item_type} declares field {} twice",
                    field.field()
                )));
            }
            if by_attribute.insert(field.attribute_name(), index).is_some() {
                return Err(OdmError::Config(format!(
                    "{item_type} maps two fields onto attribute {}",
                    field.attribute_name()
                )));
            }
        }

        let indexes = std::iter::once(&primary).chain(self.secondary.iter());
        for index_def in indexes {
            for key_field in index_def.key_fields() {
                if !by_field.contains_key(key_field) {
                    return Err(OdmError::Config(format!(
                        "{item_type} index key {key_field} is not a declared field"
                    )));
                }
            }
        }
        for spec in &self.partitioned {
            for field in [spec.field, spec.base_field, spec.hash_field] {
                if !by_field.contains_key(field) {
                    return Err(OdmError::Config(format!(
                        "{item_type} partitioned key references undeclared field {field}"
                    )));
                }
            }
            if spec.size == 0 {
                return Err(OdmError::Config(format!(
                    "{item_type} partitioned key {} has zero partitions",
                    spec.field
                )));
            }
        }

        Ok(ItemSchema {
            table: self.table,
            primary,
            secondary: self.secondary,
            fields: self.fields,
            by_field,
            by_attribute,
            partitioned: self.partitioned,
            reserved_attributes: self.reserved_attributes,
            audit_enabled: self.audit_enabled,
        })
    }
}

/// Declares a [`FieldSpec`] for a struct field, deriving the accessors from
/// the field's `serde` representation.
///
/// `field_spec!(GameScore, score, Number)` maps the `score` field of
/// `GameScore` onto the `score` attribute;
/// `field_spec!(GameScore, game_code => "gameCode", String)` overrides the
/// stored attribute name. The item type is spelled out so the generated
/// accessors are fully typed on their own, independent of the surrounding
/// builder chain.
#[macro_export]
macro_rules! field_spec {
    ($item:ty, $property:ident => $attribute:literal, $kind:ident) => {
        $crate::field_spec!($item, $property, $kind).attribute($attribute)
    };
    ($item:ty, $property:ident, $kind:ident) => {
        $crate::schema::FieldSpec::<$item>::new(
            stringify!($property),
            $crate::schema::AttributeKind::$kind,
            |item: &$item| Ok($crate::export::to_attribute_value(&item.$property)?),
            |item: &mut $item, value| {
                item.$property = $crate::export::from_attribute_value(value)?;
                Ok(())
            },
        )
    };
}


#[cfg(test)]
mod tests {
    use super::fixtures::{Account, GameScore, sample_score};
    use super::*;
    use crate::field_spec;

    #[test]
    fn dehydrate_emits_every_declared_attribute() {
        let map = GameScore::schema().dehydrate(&sample_score()).unwrap();
        assert_eq!(map.len(), 8);
        assert_eq!(
            map.get("gameCode"),
            Some(&AttributeValue::S("NY".to_string()))
        );
        assert_eq!(map.get("score"), Some(&AttributeValue::N("100".to_string())));
        assert!(map.contains_key("updatedAt"));
    }

    #[test]
    fn hydrate_round_trips_including_empty_string() {
        let schema = GameScore::schema();
        let original = sample_score();
        let map = schema.dehydrate(&original).unwrap();
        let hydrated = schema.hydrate(&map).unwrap();
        assert_eq!(hydrated, original);
        assert_eq!(hydrated.comment, "");
    }

    #[test]
    fn hydrate_coerces_null_string_attributes_to_empty() {
        let schema = GameScore::schema();
        let mut map = schema.dehydrate(&sample_score()).unwrap();
        map.insert("comment".to_string(), AttributeValue::Null(true));
        let hydrated = schema.hydrate(&map).unwrap();
        assert_eq!(hydrated.comment, "");
    }

    #[test]
    fn hydrate_skips_unknown_and_reserved_attributes() {
        let schema = GameScore::schema();
        let mut map = schema.dehydrate(&sample_score()).unwrap();
        map.insert(
            "somethingElse".to_string(),
            AttributeValue::S("x".to_string()),
        );
        map.insert(
            "__internal".to_string(),
            AttributeValue::S("reserved".to_string()),
        );
        let hydrated = schema.hydrate(&map).unwrap();
        assert_eq!(hydrated, sample_score());
    }

    #[test]
    fn primary_keys_follow_declared_order_and_naming() {
        let schema = GameScore::schema();
        let by_attribute = schema.primary_keys(&sample_score(), true).unwrap();
        assert_eq!(
            by_attribute.keys().collect::<Vec<_>>(),
            vec!["gameCode", "player"]
        );
        let by_field = schema.primary_keys(&sample_score(), false).unwrap();
        assert_eq!(
            by_field.keys().collect::<Vec<_>>(),
            vec!["game_code", "player"]
        );
    }

    #[test]
    fn primary_identifier_is_stable_across_representations() {
        let schema = GameScore::schema();
        let item = sample_score();
        let map = schema.dehydrate(&item).unwrap();
        assert_eq!(
            schema.primary_identifier(&item).unwrap(),
            schema.primary_identifier_from_map(&map).unwrap()
        );
    }

    #[test]
    fn primary_identifier_differs_per_key() {
        let schema = GameScore::schema();
        let mut other = sample_score();
        other.player = "bob".to_string();
        assert_ne!(
            schema.primary_identifier(&sample_score()).unwrap(),
            schema.primary_identifier(&other).unwrap()
        );
    }

    #[test]
    fn identifier_from_partial_record_is_an_error() {
        let schema = GameScore::schema();
        let mut map = schema.dehydrate(&sample_score()).unwrap();
        map.remove("player");
        let err = schema.primary_identifier_from_map(&map).unwrap_err();
        assert!(matches!(err, OdmError::Misuse(_)));
    }

    #[test]
    fn all_partitioned_values_enumerates_every_slot() {
        let values = GameScore::schema().all_partitioned_values("shard", "NY");
        let expected: Vec<String> = (0..16).map(|slot| format!("NY-{slot:x}")).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn all_partitioned_values_passes_through_plain_fields() {
        let values = GameScore::schema().all_partitioned_values("game_code", "NY");
        assert_eq!(values, vec!["NY".to_string()]);
    }

    #[test]
    fn unknown_field_lookup_is_a_misuse_error() {
        let err = GameScore::schema().field_to_attribute("nope").unwrap_err();
        assert!(matches!(err, OdmError::Misuse(_)));
    }

    #[test]
    fn cas_fields_reflect_declared_modes() {
        let fields: Vec<_> = Account::schema()
            .cas_fields()
            .map(FieldSpec::field)
            .collect();
        assert_eq!(fields, vec!["version"]);
        assert!(GameScore::schema().has_cas_fields());
    }

    #[test]
    fn field_spec_macro_stands_alone_outside_a_builder_chain() {
        // a bare invocation must produce fully typed accessors
        let spec = field_spec!(Account, owner, String);
        let mut account = Account::default();
        spec.write(&mut account, AttributeValue::S("alice".to_string()))
            .unwrap();
        assert_eq!(account.owner, "alice");
        assert_eq!(
            spec.read(&account).unwrap(),
            AttributeValue::S("alice".to_string())
        );
    }

    #[test]
    fn builder_rejects_undeclared_index_fields() {
        let result = ItemSchema::<Account>::builder("broken")
            .primary_index("missing", None)
            .field(field_spec!(Account, id, String))
            .build();
        assert!(matches!(result, Err(OdmError::Config(_))));
    }

    #[test]
    fn builder_rejects_duplicate_attributes() {
        let result = ItemSchema::<Account>::builder("broken")
            .primary_index("id", None)
            .field(field_spec!(Account, id, String))
            .field(field_spec!(Account, owner => "id", String))
            .build();
        assert!(matches!(result, Err(OdmError::Config(_))));
    }
}
