#![deny(missing_docs)]

//! # DynamoDB ODM
//!
//! An object-document mapper for Amazon DynamoDB built around a unit of
//! work: fetched and persisted items are tracked in a per-repository
//! identity map, mutated freely through shared handles, and committed in a
//! single `flush` that writes only what actually changed.
//!
//! ## Overview
//!
//! - One in-memory instance per primary key: every fetch of the same key
//!   within a unit of work returns the same shared handle.
//! - Change tracking against the last-read attribute snapshot; clean items
//!   are never rewritten.
//! - Optimistic concurrency via check-and-set fields, with an opt-out bulk
//!   path that batches unconditional writes.
//! - A query builder that plans predicates onto the cheapest usable index
//!   and falls back to filtered scans.
//! - Partitioned hash keys fanned out across shards, with concurrent
//!   multi-partition queries.
//! - Optional before/after audit records emitted on every committing flush.
//!
//! ## Quick Example
//!
//! ```no_run
//! use aws_sdk_dynamodb::types::AttributeValue;
//! use dynamodb_odm::{field_spec, AwsStoreClient, Item, ItemManager, ItemSchema, KeyMap};
//! use std::sync::LazyLock;
//!
//! #[derive(Debug, Default)]
//! struct User {
//!     id: String,
//!     name: String,
//! }
//!
//! static USER_SCHEMA: LazyLock<ItemSchema<User>> = LazyLock::new(|| {
//!     ItemSchema::builder("users")
//!         .primary_index("id", None)
//!         .field(field_spec!(User, id, String))
//!         .field(field_spec!(User, name, String))
//!         .build()
//!         .expect("valid schema")
//! });
//!
//! impl Item for User {
//!     fn schema() -> &'static ItemSchema<Self> {
//!         &USER_SCHEMA
//!     }
//! }
//!
//! # async fn example() -> Result<(), dynamodb_odm::OdmError> {
//! # let client = aws_sdk_dynamodb::Client::from_conf(
//! #     aws_sdk_dynamodb::config::Config::builder().build(),
//! # );
//! let mut manager = ItemManager::new(AwsStoreClient::new(client));
//!
//! let keys = KeyMap::from([("id".to_string(), AttributeValue::S("u1".to_string()))]);
//! if let Some(user) = manager.get::<User>(&keys, false).await? {
//!     user.write().name = "Jane".to_string();
//! }
//! manager.flush().await?;
//! # Ok(())
//! # }
//! ```

/// Activity logging for flushed changes.
pub mod audit;

/// The crate's error taxonomy.
pub mod error;

/// The per-unit-of-work façade owning one repository per item type.
pub mod manager;

/// Predicate trees and index planning.
pub mod query;

/// The unit of work: identity map, change tracking, and flush.
pub mod repository;

/// Item schemas: tables, indexes, field accessors, and (de)hydration.
pub mod schema;

/// Lifecycle and snapshot tracking for managed items.
pub mod state;

/// The store abstraction and its AWS SDK implementation.
pub mod store;

/// Attribute-value equality, canonicalization, and partition hashing.
pub mod value;

pub use audit::{AuditConfig, AuditContext, AuditPolicy, AuditRecord, AuditSink, NullAuditSink};
pub use error::{OdmError, OdmResult};
pub use manager::ItemManager;
pub use query::{Expr, PlanOp, QueryBuilder, QueryPlan};
pub use repository::{MultiQueryArgs, QueryArgs, Repository, ScanArgs};
pub use schema::{
    AttributeKind, CasMode, FieldSpec, IndexDef, Item, ItemSchema, KeyMap, PartitionedKeySpec,
    SchemaBuilder,
};
pub use state::{ItemRef, ItemState, ManagedItemState};
pub use store::{AwsStoreClient, Page, PageRequest, Segment, StoreClient};
pub use value::AttrMap;

#[doc(hidden)]
pub mod export {
    pub use serde::{Deserialize, Serialize};
    pub use serde_dynamo::{from_attribute_value, to_attribute_value};
}
