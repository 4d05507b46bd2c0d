//! Query expression graph and the fluent builder that produces it.
//!
//! The graph has a small closed set of node kinds. Query operators are
//! [`Expr::Call`] nodes whose `source` is the sequence they apply to, so a
//! chain like `filter(..).order_by(..)` nests inside out:
//!
//! ```text
//! Call(OrderBy, source: Call(Where, source: Source("Book"), [Quote(pred)]), [Quote(key)])
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Binary operators appearing in predicates and selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BinaryOp::And => "And",
            BinaryOp::Or => "Or",
            BinaryOp::Eq => "Equal",
            BinaryOp::Ne => "NotEqual",
            BinaryOp::Lt => "LessThan",
            BinaryOp::Le => "LessThanOrEqual",
            BinaryOp::Gt => "GreaterThan",
            BinaryOp::Ge => "GreaterThanOrEqual",
            BinaryOp::Add => "Add",
            BinaryOp::Subtract => "Subtract",
            BinaryOp::Multiply => "Multiply",
            BinaryOp::Divide => "Divide",
            BinaryOp::Modulo => "Modulo",
        };
        f.write_str(name)
    }
}

/// Sequence operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryOp {
    Where,
    FirstOrDefault,
    OrderBy,
    OrderByDescending,
    Select,
    Count,
    Any,
    All,
    Sum,
    Average,
    Max,
    Min,
    Take,
    Skip,
}

impl QueryOp {
    /// Returns `true` for operators that reduce a sequence to one value.
    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            QueryOp::Count
                | QueryOp::Any
                | QueryOp::All
                | QueryOp::Sum
                | QueryOp::Average
                | QueryOp::Max
                | QueryOp::Min
        )
    }
}

impl fmt::Display for QueryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One node of a query expression graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Constant(Value),
    /// Column access on the current row.
    Member(String),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        op: QueryOp,
        source: Box<Expr>,
        args: Vec<Expr>,
    },
    /// Lambda wrapper around a predicate or selector argument.
    Quote(Box<Expr>),
    /// Root entity sequence.
    Source(String),
}

/// Column reference.
pub fn col(name: impl Into<String>) -> Expr {
    Expr::Member(name.into())
}

/// Constant value.
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Constant(value.into())
}

macro_rules! binary_builders {
    ($($(#[$doc:meta])* $name:ident => $op:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $name(self, other: impl Into<Expr>) -> Expr {
                self.binary(BinaryOp::$op, other.into())
            }
        )*
    };
}

impl Expr {
    pub fn binary(self, op: BinaryOp, other: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    binary_builders! {
        and => And,
        or => Or,
        eq => Eq,
        ne => Ne,
        lt => Lt,
        le => Le,
        gt => Gt,
        ge => Ge,
        /// Arithmetic nodes can be built but have no SQL rendering.
        add => Add,
        subtract => Subtract,
        multiply => Multiply,
        divide => Divide,
        modulo => Modulo,
    }

    pub fn is_null(self) -> Expr {
        self.eq(Value::Null)
    }

    pub fn is_not_null(self) -> Expr {
        self.ne(Value::Null)
    }

    /// Wraps the node as a lambda argument.
    pub fn quote(self) -> Expr {
        Expr::Quote(Box::new(self))
    }

    /// Strips any number of [`Expr::Quote`] wrappers.
    pub fn unquote(&self) -> &Expr {
        match self {
            Expr::Quote(inner) => inner.unquote(),
            other => other,
        }
    }

    /// Entity name at the bottom of an operator chain.
    pub fn root_source(&self) -> Option<&str> {
        match self {
            Expr::Source(name) => Some(name),
            Expr::Call { source, .. } => source.root_source(),
            Expr::Quote(inner) => inner.root_source(),
            _ => None,
        }
    }
}

macro_rules! constant_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Expr {
                fn from(value: $ty) -> Self {
                    Expr::Constant(value.into())
                }
            }
        )*
    };
}

constant_from!(Value, i64, i32, f64, bool, String, &str, chrono::NaiveDateTime);

/// What a query produces when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryShape {
    /// Rows of the root entity.
    Entities,
    /// At most one row of the root entity.
    First,
    /// Projected values, one per row.
    Values,
    /// A single aggregate value.
    Scalar,
}

/// Fluent builder over a root entity.
///
/// ```
/// use relata_core::query::{Query, col};
///
/// let query = Query::source("Book")
///     .filter(col("Price").gt(0))
///     .order_by(col("Likes"));
/// assert_eq!(query.root(), "Book");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    root: String,
    expr: Expr,
}

impl Query {
    pub fn source(entity: impl Into<String>) -> Self {
        let root = entity.into();
        Self {
            expr: Expr::Source(root.clone()),
            root,
        }
    }

    fn call(self, op: QueryOp, args: Vec<Expr>) -> Self {
        Self {
            root: self.root,
            expr: Expr::Call {
                op,
                source: Box::new(self.expr),
                args,
            },
        }
    }

    pub fn filter(self, predicate: Expr) -> Self {
        self.call(QueryOp::Where, vec![predicate.quote()])
    }

    pub fn order_by(self, key: Expr) -> Self {
        self.call(QueryOp::OrderBy, vec![key.quote()])
    }

    pub fn order_by_descending(self, key: Expr) -> Self {
        self.call(QueryOp::OrderByDescending, vec![key.quote()])
    }

    /// Projects each row onto one or more expressions.
    pub fn select(self, projection: impl IntoIterator<Item = Expr>) -> Self {
        let args = projection.into_iter().map(Expr::quote).collect();
        self.call(QueryOp::Select, args)
    }

    pub fn take(self, count: i64) -> Self {
        self.call(QueryOp::Take, vec![lit(count)])
    }

    pub fn skip(self, count: i64) -> Self {
        self.call(QueryOp::Skip, vec![lit(count)])
    }

    pub fn first_or_default(self) -> Self {
        self.call(QueryOp::FirstOrDefault, vec![])
    }

    pub fn first_where(self, predicate: Expr) -> Self {
        self.call(QueryOp::FirstOrDefault, vec![predicate.quote()])
    }

    pub fn count(self) -> Self {
        self.call(QueryOp::Count, vec![])
    }

    pub fn count_where(self, predicate: Expr) -> Self {
        self.call(QueryOp::Count, vec![predicate.quote()])
    }

    pub fn any(self) -> Self {
        self.call(QueryOp::Any, vec![])
    }

    pub fn any_where(self, predicate: Expr) -> Self {
        self.call(QueryOp::Any, vec![predicate.quote()])
    }

    pub fn all(self, predicate: Expr) -> Self {
        self.call(QueryOp::All, vec![predicate.quote()])
    }

    pub fn sum(self, selector: Expr) -> Self {
        self.call(QueryOp::Sum, vec![selector.quote()])
    }

    pub fn average(self, selector: Expr) -> Self {
        self.call(QueryOp::Average, vec![selector.quote()])
    }

    pub fn max(self, selector: Expr) -> Self {
        self.call(QueryOp::Max, vec![selector.quote()])
    }

    pub fn min(self, selector: Expr) -> Self {
        self.call(QueryOp::Min, vec![selector.quote()])
    }

    /// Entity the query starts from.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn into_expr(self) -> Expr {
        self.expr
    }

    /// Result shape, decided by the outermost operator.
    ///
    /// Operators applied after a projection keep producing values.
    pub fn shape(&self) -> QueryShape {
        shape_of(&self.expr)
    }
}

fn shape_of(expr: &Expr) -> QueryShape {
    match expr {
        Expr::Call { op, .. } if op.is_scalar() => QueryShape::Scalar,
        Expr::Call {
            op: QueryOp::Select,
            ..
        } => QueryShape::Values,
        Expr::Call {
            op: QueryOp::FirstOrDefault,
            source,
            ..
        } => match shape_of(source) {
            QueryShape::Values => QueryShape::Values,
            _ => QueryShape::First,
        },
        Expr::Call { source, .. } => match shape_of(source) {
            QueryShape::Values => QueryShape::Values,
            _ => QueryShape::Entities,
        },
        _ => QueryShape::Entities,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_nests_inside_out() {
        let query = Query::source("Book")
            .filter(col("Price").gt(0))
            .order_by(col("Likes"));
        let Expr::Call { op, source, args } = query.expr() else {
            panic!("expected call");
        };
        assert_eq!(*op, QueryOp::OrderBy);
        assert_eq!(args[0].unquote(), &col("Likes"));
        assert!(matches!(**source, Expr::Call { op: QueryOp::Where, .. }));
        assert_eq!(query.expr().root_source(), Some("Book"));
    }

    #[test]
    fn test_is_null_builds_equality_with_null() {
        assert_eq!(
            col("Title").is_null(),
            Expr::Binary {
                op: BinaryOp::Eq,
                left: Box::new(col("Title")),
                right: Box::new(Expr::Constant(Value::Null)),
            }
        );
    }

    #[test]
    fn test_shape_follows_outermost_operator() {
        assert_eq!(Query::source("Book").shape(), QueryShape::Entities);
        assert_eq!(Query::source("Book").count().shape(), QueryShape::Scalar);
        assert_eq!(
            Query::source("Book").first_or_default().shape(),
            QueryShape::First
        );
        assert_eq!(
            Query::source("Book")
                .select([col("Title")])
                .take(3)
                .shape(),
            QueryShape::Values
        );
    }

    #[test]
    fn test_unquote_strips_nested_quotes() {
        let quoted = col("A").quote().quote();
        assert_eq!(quoted.unquote(), &col("A"));
    }
}
