//! Predicate tree for the query builder.
//!
//! Expressions render to store-native condition strings using `#field` and
//! `:param` placeholder tokens; the builder resolves `#field` tokens against
//! the schema and the caller supplies `:param` values.

use indexmap::IndexMap;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CompareOp {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }
}

#[derive(Clone, Debug)]
enum ExprKind {
    Compare {
        field: String,
        op: CompareOp,
        param: String,
    },
    Between {
        field: String,
        low: String,
        high: String,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    SizeOf(Box<Expr>),
}

/// One node of a predicate tree.
#[derive(Clone, Debug)]
pub struct Expr(ExprKind);

impl Expr {
    /// `field = :param`
    pub fn eq(field: impl Into<String>, param: impl Into<String>) -> Self {
        Self::compare(field, CompareOp::Eq, param)
    }

    /// `field > :param`
    pub fn gt(field: impl Into<String>, param: impl Into<String>) -> Self {
        Self::compare(field, CompareOp::Gt, param)
    }

    /// `field >= :param`
    pub fn gte(field: impl Into<String>, param: impl Into<String>) -> Self {
        Self::compare(field, CompareOp::Ge, param)
    }

    /// `field < :param`
    pub fn lt(field: impl Into<String>, param: impl Into<String>) -> Self {
        Self::compare(field, CompareOp::Lt, param)
    }

    /// `field <= :param`
    pub fn lte(field: impl Into<String>, param: impl Into<String>) -> Self {
        Self::compare(field, CompareOp::Le, param)
    }

    /// `field BETWEEN :low AND :high`
    pub fn between(
        field: impl Into<String>,
        low: impl Into<String>,
        high: impl Into<String>,
    ) -> Self {
        Self(ExprKind::Between {
            field: field.into(),
            low: param_token(low.into()),
            high: param_token(high.into()),
        })
    }

    /// Conjunction of `self` and `other`.
    #[allow(clippy::should_implement_trait)]
    pub fn and(self, other: Expr) -> Self {
        Self(ExprKind::And(Box::new(self), Box::new(other)))
    }

    /// Disjunction of `self` and `other`.
    pub fn or(self, other: Expr) -> Self {
        Self(ExprKind::Or(Box::new(self), Box::new(other)))
    }

    /// Wraps the inner expression's field reference in a size function, so
    /// the comparison applies to the attribute's size instead of its value.
    pub fn size_of(inner: Expr) -> Self {
        Self(ExprKind::SizeOf(Box::new(inner)))
    }

    fn compare(field: impl Into<String>, op: CompareOp, param: impl Into<String>) -> Self {
        Self(ExprKind::Compare {
            field: field.into(),
            op,
            param: param_token(param.into()),
        })
    }

    /// The fields this predicate references, each flagged with whether it is
    /// used as a plain equality (and is therefore usable as an index hash
    /// key).
    ///
    /// Merging the two operands of `and`/`or` lets the later operand
    /// overwrite the flag of a field the earlier one also references. That
    /// is a long-standing quirk callers rely on; see the planner notes.
    pub fn fields(&self) -> IndexMap<String, bool> {
        match &self.0 {
            ExprKind::Compare { field, op, .. } => {
                IndexMap::from([(field.clone(), *op == CompareOp::Eq)])
            }
            ExprKind::Between { field, .. } => IndexMap::from([(field.clone(), false)]),
            ExprKind::And(left, right) | ExprKind::Or(left, right) => {
                let mut merged = left.fields();
                merged.extend(right.fields());
                merged
            }
            ExprKind::SizeOf(inner) => {
                let mut fields = inner.fields();
                for flag in fields.values_mut() {
                    *flag = false;
                }
                fields
            }
        }
    }

    /// Renders the predicate as a condition string with placeholder tokens.
    pub fn render(&self) -> String {
        match &self.0 {
            ExprKind::Compare { field, op, param } => {
                format!("#{field} {} {param}", op.symbol())
            }
            ExprKind::Between { field, low, high } => {
                format!("#{field} BETWEEN {low} AND {high}")
            }
            ExprKind::And(left, right) => format!("{} AND {}", left.render(), right.render()),
            ExprKind::Or(left, right) => format!("{} OR {}", left.render(), right.render()),
            ExprKind::SizeOf(inner) => {
                let rendered = inner.render();
                match inner.fields().keys().next() {
                    Some(field) => {
                        rendered.replace(&format!("#{field}"), &format!("size(#{field})"))
                    }
                    None => rendered,
                }
            }
        }
    }
}

fn param_token(param: String) -> String {
    if param.starts_with(':') {
        param
    } else {
        format!(":{param}")
    }
}
