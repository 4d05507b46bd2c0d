//! Expression graph to parameterized SQL.
//!
//! [`QueryTranslator`] is a visitor with one accumulating text buffer and one
//! ordered parameter list. Operator nodes translate their source first and
//! wrap it as `(<source>) AS T`, so each operator adds one nesting level.
//! Constant values never reach the SQL text; they become `@pN` parameters.

use tracing::debug;

use super::expr::{BinaryOp, Expr, QueryOp};
use crate::dialect::Dialect;
use crate::error::{OrmError, Result};
use crate::schema::SchemaModel;
use crate::value::Value;

/// Alias given to every derived table.
const ALIAS: &str = "T";

/// SQL text plus its ordered parameter values.
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub sql: String,
    /// Value for placeholder `i` at index `i`.
    pub parameters: Vec<Value>,
}

impl Translation {
    /// Parameters paired with the names the dialect binds them under.
    pub fn named_parameters(&self, dialect: &dyn Dialect) -> Vec<(String, Value)> {
        self.parameters
            .iter()
            .enumerate()
            .map(|(i, value)| (dialect.parameter_name(i), value.clone()))
            .collect()
    }
}

/// Translates query expressions for one dialect and schema.
pub struct QueryTranslator<'a> {
    dialect: &'a dyn Dialect,
    schema: &'a SchemaModel,
    sql: String,
    parameters: Vec<Value>,
}

impl<'a> QueryTranslator<'a> {
    pub fn new(dialect: &'a dyn Dialect, schema: &'a SchemaModel) -> Self {
        Self {
            dialect,
            schema,
            sql: String::new(),
            parameters: Vec::new(),
        }
    }

    /// Translates `expr` into SQL text and parameters.
    ///
    /// The translator can be reused; each call starts from an empty buffer.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::UnsupportedOperator`] for operators without a SQL
    /// rendering (arithmetic, misplaced sources, missing arguments) and
    /// [`OrmError::InvalidEntitySchema`] when the root entity has no table.
    pub fn translate(&mut self, expr: &Expr) -> Result<Translation> {
        self.sql.clear();
        self.parameters.clear();
        self.visit(expr)?;
        debug!(
            sql = %self.sql,
            parameters = self.parameters.len(),
            "translated query"
        );
        Ok(Translation {
            sql: std::mem::take(&mut self.sql),
            parameters: std::mem::take(&mut self.parameters),
        })
    }

    fn visit(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Quote(inner) => self.visit(inner),
            Expr::Source(entity) => self.visit_source(entity),
            Expr::Call { op, source, args } => self.visit_call(*op, source, args),
            Expr::Binary { op, left, right } => self.visit_binary(*op, left, right),
            Expr::Member(column) => {
                let quoted = self.dialect.quote_identifier(column);
                self.sql.push_str(&quoted);
                Ok(())
            }
            Expr::Constant(value) => {
                self.visit_constant(value);
                Ok(())
            }
        }
    }

    fn visit_source(&mut self, entity: &str) -> Result<()> {
        let table = self.schema.table(entity).ok_or_else(|| {
            OrmError::schema(format!("no table has been built for query source '{entity}'"))
        })?;
        let columns: Vec<String> = table
            .mapped_columns()
            .map(|c| self.dialect.quote_identifier(c.name()))
            .collect();
        self.sql.push_str("SELECT ");
        self.sql.push_str(&columns.join(","));
        self.sql.push_str(" FROM ");
        self.sql.push_str(&self.dialect.quote_identifier(table.name()));
        Ok(())
    }

    /// Appends `(<source>) AS T`.
    fn visit_derived(&mut self, source: &Expr) -> Result<()> {
        self.sql.push('(');
        self.visit(source)?;
        self.sql.push_str(") AS ");
        self.sql.push_str(ALIAS);
        Ok(())
    }

    fn visit_where(&mut self, predicate: Option<&Expr>) -> Result<()> {
        if let Some(predicate) = predicate {
            self.sql.push_str(" WHERE ");
            self.visit(predicate.unquote())?;
        }
        Ok(())
    }

    fn visit_call(&mut self, op: QueryOp, source: &Expr, args: &[Expr]) -> Result<()> {
        let first = args.first();
        let required = |arg: Option<&Expr>| -> Result<()> {
            if arg.is_none() {
                return Err(OrmError::UnsupportedOperator(format!(
                    "{op} requires an argument"
                )));
            }
            Ok(())
        };

        match op {
            QueryOp::Where => {
                required(first)?;
                self.sql.push_str("SELECT * FROM ");
                self.visit_derived(source)?;
                self.visit_where(first)?;
            }
            QueryOp::FirstOrDefault => {
                self.sql.push_str("SELECT * FROM ");
                self.visit_derived(source)?;
                self.visit_where(first)?;
                self.sql.push_str(" LIMIT 1");
            }
            QueryOp::OrderBy | QueryOp::OrderByDescending => {
                let key = first.ok_or_else(|| {
                    OrmError::UnsupportedOperator(format!("{op} requires a key selector"))
                })?;
                self.sql.push_str("SELECT * FROM ");
                self.visit_derived(source)?;
                self.sql.push_str(" ORDER BY ");
                self.visit(key.unquote())?;
                self.sql.push_str(if op == QueryOp::OrderBy {
                    " ASC"
                } else {
                    " DESC"
                });
            }
            QueryOp::Select => {
                required(first)?;
                self.sql.push_str("SELECT ");
                for (i, projection) in args.iter().enumerate() {
                    if i > 0 {
                        self.sql.push_str(", ");
                    }
                    self.visit(projection.unquote())?;
                }
                self.sql.push_str(" FROM ");
                self.visit_derived(source)?;
            }
            QueryOp::Count => {
                self.sql.push_str("SELECT COUNT(*) FROM ");
                self.visit_derived(source)?;
                self.visit_where(first)?;
            }
            QueryOp::Any => {
                self.sql.push_str("SELECT EXISTS(SELECT * FROM ");
                self.visit_derived(source)?;
                self.visit_where(first)?;
                self.sql.push(')');
            }
            QueryOp::All => {
                let predicate = first.ok_or_else(|| {
                    OrmError::UnsupportedOperator("All requires a predicate".to_string())
                })?;
                self.sql.push_str("SELECT NOT EXISTS(SELECT * FROM ");
                self.visit_derived(source)?;
                self.sql.push_str(" WHERE NOT (");
                self.visit(predicate.unquote())?;
                self.sql.push_str("))");
            }
            QueryOp::Sum | QueryOp::Average | QueryOp::Max | QueryOp::Min => {
                let selector = first.ok_or_else(|| {
                    OrmError::UnsupportedOperator(format!("{op} requires a selector"))
                })?;
                let function = match op {
                    QueryOp::Sum => "SUM",
                    QueryOp::Average => "AVG",
                    QueryOp::Max => "MAX",
                    _ => "MIN",
                };
                self.sql.push_str("SELECT ");
                self.sql.push_str(function);
                self.sql.push('(');
                self.visit(selector.unquote())?;
                self.sql.push_str(") FROM ");
                self.visit_derived(source)?;
            }
            QueryOp::Take | QueryOp::Skip => {
                let count = first.ok_or_else(|| {
                    OrmError::UnsupportedOperator(format!("{op} requires a count"))
                })?;
                self.sql.push_str("SELECT * FROM ");
                self.visit_derived(source)?;
                self.sql.push_str(if op == QueryOp::Take {
                    " LIMIT "
                } else {
                    " LIMIT -1 OFFSET "
                });
                self.visit(count.unquote())?;
            }
        }
        Ok(())
    }

    fn visit_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<()> {
        let token = match op {
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            other => {
                return Err(OrmError::UnsupportedOperator(format!(
                    "binary operator {other} is not supported"
                )));
            }
        };

        if matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
            let null_test = if op == BinaryOp::Eq {
                " IS NULL"
            } else {
                " IS NOT NULL"
            };
            if is_null_constant(right) {
                self.visit_operand(left)?;
                self.sql.push_str(null_test);
                return Ok(());
            }
            if is_null_constant(left) {
                self.visit_operand(right)?;
                self.sql.push_str(null_test);
                return Ok(());
            }
        }

        self.visit_operand(left)?;
        self.sql.push(' ');
        self.sql.push_str(token);
        self.sql.push(' ');
        self.visit_operand(right)
    }

    fn visit_operand(&mut self, operand: &Expr) -> Result<()> {
        match operand.unquote() {
            nested @ (Expr::Binary { .. } | Expr::Call { .. }) => {
                self.sql.push('(');
                self.visit(nested)?;
                self.sql.push(')');
                Ok(())
            }
            Expr::Source(entity) => Err(OrmError::UnsupportedOperator(format!(
                "entity source '{entity}' cannot be used as a value"
            ))),
            other => self.visit(other),
        }
    }

    fn visit_constant(&mut self, value: &Value) {
        match value {
            Value::Boolean(b) => self.sql.push_str(self.dialect.boolean_literal(*b)),
            other => {
                let index = self.parameters.len();
                self.parameters.push(other.clone());
                self.sql.push_str(&self.dialect.placeholder(index));
            }
        }
    }
}

fn is_null_constant(expr: &Expr) -> bool {
    matches!(expr.unquote(), Expr::Constant(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{EntityDescriptor, EntityRegistry, FieldDescriptor, ScalarType};
    use crate::dialect::AnsiDialect;
    use crate::query::{Query, col, lit};

    /// Dialect spelling booleans as numerals.
    struct NumericBooleans;

    impl Dialect for NumericBooleans {
        fn map_type(&self, _: &crate::value::DataType) -> Result<String> {
            Ok("ANY".to_string())
        }

        fn boolean_literal(&self, value: bool) -> &'static str {
            if value { "1" } else { "0" }
        }
    }

    fn schema() -> SchemaModel {
        let mut registry = EntityRegistry::new();
        registry.register(
            EntityDescriptor::new("Book")
                .with_field(FieldDescriptor::column("BookId", ScalarType::Int32).primary_key())
                .with_field(FieldDescriptor::column("Title", ScalarType::String))
                .with_field(FieldDescriptor::column("Price", ScalarType::Float64))
                .with_field(FieldDescriptor::column("Purchases", ScalarType::Int32))
                .with_field(FieldDescriptor::column("Likes", ScalarType::Int32))
                .with_field(FieldDescriptor::column("Draft", ScalarType::Bool))
                .with_field(FieldDescriptor::column("Notes", ScalarType::String).not_mapped()),
        );
        let mut model = SchemaModel::new(registry);
        model.build_all().unwrap();
        model
    }

    fn translate(query: &Query) -> Result<Translation> {
        let schema = schema();
        QueryTranslator::new(&NumericBooleans, &schema).translate(query.expr())
    }

    const BOOK: &str = r#"SELECT "BookId","Title","Price","Purchases","Likes","Draft" FROM "Book""#;

    #[test]
    fn test_where_then_order_by() {
        let query = Query::source("Book")
            .filter(col("Price").gt(0))
            .order_by(col("Likes"));
        let translation = translate(&query).unwrap();
        assert_eq!(
            translation.sql,
            format!(
                r#"SELECT * FROM (SELECT * FROM ({BOOK}) AS T WHERE "Price" > @p0) AS T ORDER BY "Likes" ASC"#
            )
        );
        assert_eq!(translation.parameters, vec![Value::Integer(0)]);
    }

    #[test]
    fn test_translation_is_deterministic() {
        let query = Query::source("Book")
            .filter(col("Price").gt(0))
            .order_by(col("Likes"));
        let schema = schema();
        let mut translator = QueryTranslator::new(&NumericBooleans, &schema);
        let first = translator.translate(query.expr()).unwrap();
        let second = translator.translate(query.expr()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_root_source_skips_unmapped_columns() {
        let translation = translate(&Query::source("Book")).unwrap();
        assert_eq!(translation.sql, BOOK);
        assert!(translation.parameters.is_empty());
    }

    #[test]
    fn test_nested_predicates_are_parenthesized() {
        let query = Query::source("Book")
            .filter(col("Price").ge(10).and(col("Title").ne("Draft").or(col("Likes").lt(3))));
        let translation = translate(&query).unwrap();
        assert_eq!(
            translation.sql,
            format!(
                r#"SELECT * FROM ({BOOK}) AS T WHERE ("Price" >= @p0) AND (("Title" <> @p1) OR ("Likes" < @p2))"#
            )
        );
        assert_eq!(
            translation.parameters,
            vec![Value::Integer(10), Value::Text("Draft".into()), Value::Integer(3)]
        );
    }

    #[test]
    fn test_string_constants_are_never_inlined() {
        let query = Query::source("Book").filter(col("Title").eq("x'; DROP TABLE Book; --"));
        let translation = translate(&query).unwrap();
        assert!(!translation.sql.contains("DROP"));
        assert_eq!(translation.parameters.len(), 1);
    }

    #[test]
    fn test_boolean_constants_use_dialect_literal() {
        let query = Query::source("Book").filter(col("Draft").eq(false));
        let translation = translate(&query).unwrap();
        assert!(translation.sql.ends_with(r#"WHERE "Draft" = 0"#));
        assert!(translation.parameters.is_empty());
    }

    #[test]
    fn test_null_comparisons() {
        let is_null = translate(&Query::source("Book").filter(col("Title").is_null())).unwrap();
        assert!(is_null.sql.ends_with(r#"WHERE "Title" IS NULL"#));
        let not_null =
            translate(&Query::source("Book").filter(lit(Value::Null).ne(col("Title")))).unwrap();
        assert!(not_null.sql.ends_with(r#"WHERE "Title" IS NOT NULL"#));
        assert!(not_null.parameters.is_empty());
    }

    #[test]
    fn test_arithmetic_is_unsupported() {
        let query = Query::source("Book").filter(col("Price").multiply(2).gt(10));
        assert!(matches!(
            translate(&query),
            Err(OrmError::UnsupportedOperator(msg)) if msg.contains("Multiply")
        ));
    }

    #[test]
    fn test_first_or_default_with_predicate() {
        let translation =
            translate(&Query::source("Book").first_where(col("BookId").eq(7))).unwrap();
        assert_eq!(
            translation.sql,
            format!(r#"SELECT * FROM ({BOOK}) AS T WHERE "BookId" = @p0 LIMIT 1"#)
        );
    }

    #[test]
    fn test_order_by_descending_then_take_and_skip() {
        let query = Query::source("Book")
            .order_by_descending(col("Purchases"))
            .skip(5)
            .take(10);
        let translation = translate(&query).unwrap();
        assert_eq!(
            translation.sql,
            format!(
                r#"SELECT * FROM (SELECT * FROM (SELECT * FROM ({BOOK}) AS T ORDER BY "Purchases" DESC) AS T LIMIT -1 OFFSET @p0) AS T LIMIT @p1"#
            )
        );
        assert_eq!(
            translation.parameters,
            vec![Value::Integer(5), Value::Integer(10)]
        );
    }

    #[test]
    fn test_select_projection() {
        let translation =
            translate(&Query::source("Book").select([col("Title"), col("Likes")])).unwrap();
        assert_eq!(
            translation.sql,
            format!(r#"SELECT "Title", "Likes" FROM ({BOOK}) AS T"#)
        );
    }

    #[test]
    fn test_count_any_all() {
        let count = translate(&Query::source("Book").count_where(col("Likes").gt(1))).unwrap();
        assert_eq!(
            count.sql,
            format!(r#"SELECT COUNT(*) FROM ({BOOK}) AS T WHERE "Likes" > @p0"#)
        );

        let any = translate(&Query::source("Book").any()).unwrap();
        assert_eq!(any.sql, format!("SELECT EXISTS(SELECT * FROM ({BOOK}) AS T)"));

        let all = translate(&Query::source("Book").all(col("Price").gt(0))).unwrap();
        assert_eq!(
            all.sql,
            format!(r#"SELECT NOT EXISTS(SELECT * FROM ({BOOK}) AS T WHERE NOT ("Price" > @p0))"#)
        );
    }

    #[test]
    fn test_aggregates() {
        let sum = translate(&Query::source("Book").sum(col("Purchases"))).unwrap();
        assert_eq!(sum.sql, format!(r#"SELECT SUM("Purchases") FROM ({BOOK}) AS T"#));
        let avg = translate(&Query::source("Book").average(col("Price"))).unwrap();
        assert!(avg.sql.starts_with(r#"SELECT AVG("Price")"#));
        let max = translate(&Query::source("Book").max(col("Likes"))).unwrap();
        assert!(max.sql.starts_with(r#"SELECT MAX("Likes")"#));
        let min = translate(&Query::source("Book").min(col("Likes"))).unwrap();
        assert!(min.sql.starts_with(r#"SELECT MIN("Likes")"#));
    }

    #[test]
    fn test_unknown_source_is_schema_error() {
        assert!(matches!(
            translate(&Query::source("Ghost")),
            Err(OrmError::InvalidEntitySchema(_))
        ));
    }

    #[test]
    fn test_default_dialect_booleans() {
        let schema = schema();
        let query = Query::source("Book").filter(col("Draft").eq(true));
        let translation = QueryTranslator::new(&AnsiDialect, &schema)
            .translate(query.expr())
            .unwrap();
        assert!(translation.sql.ends_with(r#""Draft" = TRUE"#));
    }

    #[test]
    fn test_named_parameters() {
        let translation =
            translate(&Query::source("Book").filter(col("Title").eq("Dune"))).unwrap();
        assert_eq!(
            translation.named_parameters(&AnsiDialect),
            vec![("@p0".to_string(), Value::Text("Dune".into()))]
        );
    }
}
