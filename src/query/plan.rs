use crate::catalog::types::Value;
use crate::query::error::QueryError;
use serde::{Deserialize, Serialize};

/// Maximum nesting depth for expressions to prevent stack overflow
const MAX_EXPR_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    Asc,
    Desc,
}

/// A column, optionally qualified by a table alias and optionally drilling
/// into a JSON document stored in the column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub column: String,
    pub json_path: Option<String>,
}

impl ColumnRef {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            qualifier: None,
            column: column.into(),
            json_path: None,
        }
    }

    pub fn qualified(qualifier: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            qualifier: Some(qualifier.into()),
            column: column.into(),
            json_path: None,
        }
    }

    pub fn json(column: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            qualifier: None,
            column: column.into(),
            json_path: Some(path.into()),
        }
    }

    /// Last segment of the JSON path, or the column itself.
    pub fn leaf(&self) -> &str {
        match &self.json_path {
            Some(path) => path.rsplit('.').next().unwrap_or(path),
            None => &self.column,
        }
    }

    pub fn eq(self, value: Value) -> Expr {
        Expr::Eq(self, value)
    }

    pub fn neq(self, value: Value) -> Expr {
        Expr::Ne(self, value)
    }

    pub fn gt(self, value: Value) -> Expr {
        Expr::Gt(self, value)
    }

    pub fn gte(self, value: Value) -> Expr {
        Expr::Gte(self, value)
    }

    pub fn lt(self, value: Value) -> Expr {
        Expr::Lt(self, value)
    }

    pub fn lte(self, value: Value) -> Expr {
        Expr::Lte(self, value)
    }

    pub fn between(self, low: Value, high: Value) -> Expr {
        Expr::Between(self, low, high)
    }

    pub fn in_(self, values: Vec<Value>) -> Expr {
        Expr::In(self, values)
    }

    pub fn is_null(self) -> Expr {
        Expr::IsNull(self)
    }

    pub fn is_not_null(self) -> Expr {
        Expr::IsNotNull(self)
    }
}

pub fn col(name: &str) -> ColumnRef {
    ColumnRef::new(name)
}

pub fn lit<T: Into<Value>>(value: T) -> Value {
    value.into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Eq(ColumnRef, Value),
    Ne(ColumnRef, Value),
    Lt(ColumnRef, Value),
    Lte(ColumnRef, Value),
    Gt(ColumnRef, Value),
    Gte(ColumnRef, Value),
    In(ColumnRef, Vec<Value>),
    NotIn(ColumnRef, Vec<Value>),
    Between(ColumnRef, Value, Value),
    IsNull(ColumnRef),
    IsNotNull(ColumnRef),
    /// Backend wildcard syntax (`%`, `_`), already escaped.
    Like(ColumnRef, String),
    NotLike(ColumnRef, String),
    Regexp(ColumnRef, String),
    NotRegexp(ColumnRef, String),
    /// JSON document containment of the candidate value.
    JsonContains(ColumnRef, Value),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    pub fn and(self, rhs: Expr) -> Expr {
        match self {
            Expr::And(mut parts) => {
                parts.push(rhs);
                Expr::And(parts)
            }
            lhs => Expr::And(vec![lhs, rhs]),
        }
    }

    pub fn or(self, rhs: Expr) -> Expr {
        match self {
            Expr::Or(mut parts) => {
                parts.push(rhs);
                Expr::Or(parts)
            }
            lhs => Expr::Or(vec![lhs, rhs]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    /// Collapses a conjunction: `None` for nothing, the expression itself for one.
    pub fn all(mut parts: Vec<Expr>) -> Option<Expr> {
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(Expr::And(parts)),
        }
    }

    pub fn any(mut parts: Vec<Expr>) -> Option<Expr> {
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(Expr::Or(parts)),
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            Expr::Not(inner) => 1 + inner.depth(),
            Expr::And(parts) | Expr::Or(parts) => {
                1 + parts.iter().map(Expr::depth).max().unwrap_or(0)
            }
            _ => 1,
        }
    }

    pub fn validate_depth(&self) -> Result<(), QueryError> {
        let depth = self.depth();
        if depth > MAX_EXPR_DEPTH {
            return Err(QueryError::ExpressionTooDeep {
                depth,
                max: MAX_EXPR_DEPTH,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Cross,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub table: String,
    pub alias: Option<String>,
    pub join_type: JoinType,
    pub left_column: Option<String>,
    pub right_column: Option<String>,
}

impl JoinSpec {
    pub fn inner(table: &str, left_column: &str, right_column: &str) -> Self {
        Self {
            table: table.to_string(),
            alias: None,
            join_type: JoinType::Inner,
            left_column: Some(left_column.to_string()),
            right_column: Some(right_column.to_string()),
        }
    }

    pub fn left(table: &str, left_column: &str, right_column: &str) -> Self {
        Self {
            join_type: JoinType::Left,
            ..Self::inner(table, left_column, right_column)
        }
    }

    pub fn right(table: &str, left_column: &str, right_column: &str) -> Self {
        Self {
            join_type: JoinType::Right,
            ..Self::inner(table, left_column, right_column)
        }
    }

    pub fn cross(table: &str) -> Self {
        Self {
            table: table.to_string(),
            alias: None,
            join_type: JoinType::Cross,
            left_column: None,
            right_column: None,
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    /// Name the joined table is referenced by in column qualifiers.
    pub fn reference_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Aggregate {
    Count,
    CountDistinct(ColumnRef),
    Sum(ColumnRef),
    Min(ColumnRef),
    Max(ColumnRef),
    Avg(ColumnRef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SelectItem {
    Column {
        column: ColumnRef,
        alias: Option<String>,
    },
    /// Caller-supplied SQL expression, emitted verbatim.
    Raw(String),
    Aggregate {
        aggregate: Aggregate,
        alias: String,
    },
}

impl SelectItem {
    pub fn column(column: ColumnRef) -> Self {
        SelectItem::Column {
            column,
            alias: None,
        }
    }

    /// Output key this item produces in a result row.
    pub fn output_name(&self) -> String {
        match self {
            SelectItem::Column {
                alias: Some(alias), ..
            } => alias.clone(),
            SelectItem::Column { column, .. } => column.leaf().to_string(),
            SelectItem::Raw(expr) => expr.clone(),
            SelectItem::Aggregate { alias, .. } => alias.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Empty means every column of the base table.
    pub select: Vec<SelectItem>,
    pub distinct: bool,
    pub table: String,
    pub table_alias: Option<String>,
    pub joins: Vec<JoinSpec>,
    pub predicate: Option<Expr>,
    pub group_by: Vec<ColumnRef>,
    pub order_by: Vec<(ColumnRef, Order)>,
    pub limit: Option<u64>,
    pub offset: u64,
}

impl Query {
    pub fn select(items: Vec<SelectItem>) -> Self {
        Self {
            select: items,
            distinct: false,
            table: String::new(),
            table_alias: None,
            joins: Vec::new(),
            predicate: None,
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: 0,
        }
    }

    pub fn select_all() -> Self {
        Self::select(Vec::new())
    }

    pub fn from(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.table_alias = Some(alias.to_string());
        self
    }

    pub fn join(mut self, join: JoinSpec) -> Self {
        self.joins.push(join);
        self
    }

    pub fn where_(mut self, expr: Expr) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn order_by(mut self, column: ColumnRef, order: Order) -> Self {
        self.order_by.push((column, order));
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.offset = n;
        self
    }

    pub fn group_by(mut self, columns: Vec<ColumnRef>) -> Self {
        self.group_by = columns;
        self
    }

    pub fn distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    /// Name columns of the base table are qualified with.
    pub fn reference_name(&self) -> &str {
        self.table_alias.as_deref().unwrap_or(&self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertStatement {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Columns overwritten from the incoming row when the key already exists.
    /// Empty means a plain insert.
    pub on_duplicate_update: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatement {
    pub table: String,
    pub assignments: Vec<(String, Value)>,
    pub predicate: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteStatement {
    pub table: String,
    pub predicate: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select(Query),
    /// Number of rows (or distinct groups) the query would return without
    /// ordering or paging.
    Count(Query),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
}

impl Statement {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Statement::Insert(_) | Statement::Update(_) | Statement::Delete(_)
        )
    }

    pub fn table(&self) -> &str {
        match self {
            Statement::Select(q) | Statement::Count(q) => &q.table,
            Statement::Insert(s) => &s.table,
            Statement::Update(s) => &s.table,
            Statement::Delete(s) => &s.table,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Select(_) => "select",
            Statement::Count(_) => "count",
            Statement::Insert(_) => "insert",
            Statement::Update(_) => "update",
            Statement::Delete(_) => "delete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnRef, Expr, col, lit};

    #[test]
    fn and_flattens_into_one_conjunction() {
        let expr = col("a").eq(lit(1)).and(col("b").eq(lit(2))).and(col("c").eq(lit(3)));
        match expr {
            Expr::And(parts) => assert_eq!(parts.len(), 3),
            other => panic!("expected conjunction, got {other:?}"),
        }
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut expr = col("a").is_null();
        for _ in 0..40 {
            expr = expr.not();
        }
        assert!(expr.validate_depth().is_err());
        assert!(col("a").is_null().validate_depth().is_ok());
    }

    #[test]
    fn json_leaf_is_last_path_segment() {
        assert_eq!(ColumnRef::json("price", "tiers.msrp").leaf(), "msrp");
        assert_eq!(col("sku").leaf(), "sku");
    }
}
