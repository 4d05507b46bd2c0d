//! Query expressions and their translation to SQL.

mod expr;
mod translate;

pub use expr::{BinaryOp, Expr, Query, QueryOp, QueryShape, col, lit};
pub use translate::{QueryTranslator, Translation};
