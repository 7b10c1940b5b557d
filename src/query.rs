//! Predicate-to-index translation.
//!
//! [`QueryBuilder`] collects conditions plus parameter values, binds the
//! first condition an index can serve as a key condition (filtering on the
//! rest), and runs the resulting query (or falls back to a filtered scan)
//! through the owning repository.

mod expr;

use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;

use crate::error::OdmResult;
use crate::repository::{DEFAULT_EVALUATION_LIMIT, QueryArgs, Repository, ScanArgs};
use crate::schema::Item;
use crate::state::ItemRef;
use crate::store::StoreClient;

pub use expr::Expr;

/// How a prepared predicate will be executed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlanOp {
    /// A key-condition query against the planned index.
    Query,
    /// A full scan with the whole predicate as a filter.
    Scan,
}

/// The outcome of planning a predicate against an item type's indexes.
#[derive(Clone, Debug)]
pub struct QueryPlan {
    /// Chosen execution strategy.
    pub op: PlanOp,
    /// Rendered key condition; empty for scans.
    pub key_condition: String,
    /// Rendered filter condition; empty when the whole predicate is
    /// key-expressible.
    pub filter: String,
    /// Secondary index serving the key condition, `None` for the primary
    /// index (and always `None` for scans).
    pub index_name: Option<String>,
}

/// Collects conditions and parameters, then plans and runs them.
pub struct QueryBuilder<'r, T: Item, C: StoreClient> {
    repository: &'r mut Repository<T, C>,
    conditions: Vec<Expr>,
    params: HashMap<String, AttributeValue>,
    limit: i32,
    consistent: bool,
    ascending: bool,
}

impl<T: Item, C: StoreClient> Repository<T, C> {
    /// Starts building a predicate-driven query against this repository.
    pub fn query_builder(&mut self) -> QueryBuilder<'_, T, C> {
        QueryBuilder {
            repository: self,
            conditions: Vec::new(),
            params: HashMap::new(),
            limit: DEFAULT_EVALUATION_LIMIT,
            consistent: false,
            ascending: true,
        }
    }
}

impl<T: Item, C: StoreClient> QueryBuilder<'_, T, C> {
    /// Adds a condition; all added conditions are conjoined.
    pub fn where_expr(mut self, condition: Expr) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Binds a `:param` token to a value. A missing leading colon is added.
    pub fn param(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        let name = name.into();
        let name = if name.starts_with(':') {
            name
        } else {
            format!(":{name}")
        };
        self.params.insert(name, value);
        self
    }

    /// Sets the page evaluation limit.
    pub fn limit(mut self, limit: i32) -> Self {
        self.limit = limit;
        self
    }

    /// Requests strongly consistent reads.
    pub fn consistent(mut self, consistent: bool) -> Self {
        self.consistent = consistent;
        self
    }

    /// Sets the sort-key order for query execution.
    pub fn ascending(mut self, ascending: bool) -> Self {
        self.ascending = ascending;
        self
    }

    /// Plans the collected conditions against the item type's indexes.
    ///
    /// Each condition is matched on its own: an index can serve a condition
    /// when that condition uses the index's hash field as a plain equality
    /// and references no fields beyond the index's key fields. Indexes are
    /// considered in declaration order, primary first, and the first match
    /// wins; the matched condition becomes the key condition and every
    /// other condition joins the filter. With no match anywhere the whole
    /// conjunction runs as a scan filter.
    pub fn prepare(&self) -> QueryPlan {
        let schema = T::schema();
        for index in schema.indexes() {
            for (position, condition) in self.conditions.iter().enumerate() {
                let fields = condition.fields();
                if fields.get(index.hash).copied() != Some(true) {
                    continue;
                }
                let key_field_limit = match index.range {
                    Some(range) if fields.contains_key(range) => 2,
                    _ => 1,
                };
                if fields.len() > key_field_limit {
                    continue;
                }
                let filter = self
                    .conditions
                    .iter()
                    .enumerate()
                    .filter(|(other, _)| *other != position)
                    .map(|(_, remainder)| remainder.render())
                    .collect::<Vec<_>>()
                    .join(" AND ");
                return QueryPlan {
                    op: PlanOp::Query,
                    key_condition: condition.render(),
                    filter,
                    index_name: index.name.map(str::to_string),
                };
            }
        }
        QueryPlan {
            op: PlanOp::Scan,
            key_condition: String::new(),
            filter: self
                .conditions
                .iter()
                .map(Expr::render)
                .collect::<Vec<_>>()
                .join(" AND "),
            index_name: None,
        }
    }

    /// Plans and runs the predicate, draining pagination into a vector.
    pub async fn execute(self) -> OdmResult<Vec<ItemRef<T>>> {
        let plan = self.prepare();
        match plan.op {
            PlanOp::Query => {
                let args = QueryArgs {
                    key_condition: plan.key_condition,
                    params: self.params,
                    index_name: plan.index_name,
                    filter: plan.filter,
                    limit: self.limit,
                    consistent: self.consistent,
                    ascending: self.ascending,
                };
                self.repository.query_all(&args).await
            }
            PlanOp::Scan => {
                let args = ScanArgs {
                    filter: plan.filter,
                    params: self.params,
                    index_name: None,
                    limit: self.limit,
                    consistent: self.consistent,
                };
                self.repository.scan_all(&args, 1).await
            }
        }
    }
}
