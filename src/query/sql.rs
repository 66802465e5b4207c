//! Renders relational statements to MySQL-dialect SQL with positional
//! parameters.

use crate::catalog::types::Value;
use crate::query::error::QueryError;
use crate::query::plan::{
    Aggregate, ColumnRef, DeleteStatement, Expr, InsertStatement, JoinType, Order, Query,
    SelectItem, Statement, UpdateStatement,
};

/// A rendered statement ready for a driver: SQL text plus bound parameters in
/// placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlStatement {
    /// SQL with parameters inlined as literals. For logs only.
    pub fn interpolated(&self) -> String {
        let mut out = String::with_capacity(self.sql.len() + self.params.len() * 8);
        let mut params = self.params.iter();
        for ch in self.sql.chars() {
            if ch == '?' {
                match params.next() {
                    Some(value) => out.push_str(&literal(value)),
                    None => out.push('?'),
                }
            } else {
                out.push(ch);
            }
        }
        out
    }
}

pub fn render(statement: &Statement) -> Result<SqlStatement, QueryError> {
    let mut w = SqlWriter::default();
    match statement {
        Statement::Select(query) => w.select(query)?,
        Statement::Count(query) => w.count(query)?,
        Statement::Insert(insert) => w.insert(insert)?,
        Statement::Update(update) => w.update(update)?,
        Statement::Delete(delete) => w.delete(delete)?,
    }
    Ok(SqlStatement {
        sql: w.sql,
        params: w.params,
    })
}

pub fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Boolean(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Json(v) => format!("'{}'", v.to_string().replace('\'', "''")),
    }
}

#[derive(Default)]
struct SqlWriter {
    sql: String,
    params: Vec<Value>,
}

impl SqlWriter {
    fn push(&mut self, s: &str) {
        self.sql.push_str(s);
    }

    fn bind(&mut self, value: Value) {
        self.sql.push('?');
        self.params.push(value);
    }

    fn column(&mut self, column: &ColumnRef) {
        let base = match &column.qualifier {
            Some(q) => format!("{}.{}", quote_ident(q), quote_ident(&column.column)),
            None => quote_ident(&column.column),
        };
        match &column.json_path {
            Some(path) => {
                self.push("JSON_UNQUOTE(JSON_EXTRACT(");
                self.push(&base);
                self.push(", ");
                self.bind(Value::Text(format!("$.{path}").into()));
                self.push("))");
            }
            None => self.push(&base),
        }
    }

    fn dotted(&mut self, reference: &str) {
        let rendered = reference
            .split('.')
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(".");
        self.push(&rendered);
    }

    fn value_list(&mut self, values: &[Value]) {
        self.push("(");
        for (i, v) in values.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.bind(v.clone());
        }
        self.push(")");
    }

    fn expr(&mut self, expr: &Expr, nested: bool) {
        match expr {
            Expr::Eq(c, v) => self.comparison(c, "=", v),
            Expr::Ne(c, v) => self.comparison(c, "!=", v),
            Expr::Lt(c, v) => self.comparison(c, "<", v),
            Expr::Lte(c, v) => self.comparison(c, "<=", v),
            Expr::Gt(c, v) => self.comparison(c, ">", v),
            Expr::Gte(c, v) => self.comparison(c, ">=", v),
            Expr::In(c, values) => {
                if values.is_empty() {
                    self.push("1 = 0");
                    return;
                }
                self.column(c);
                self.push(" IN ");
                self.value_list(values);
            }
            Expr::NotIn(c, values) => {
                if values.is_empty() {
                    self.push("1 = 1");
                    return;
                }
                self.column(c);
                self.push(" NOT IN ");
                self.value_list(values);
            }
            Expr::Between(c, lo, hi) => {
                self.column(c);
                self.push(" BETWEEN ");
                self.bind(lo.clone());
                self.push(" AND ");
                self.bind(hi.clone());
            }
            Expr::IsNull(c) => {
                self.column(c);
                self.push(" IS NULL");
            }
            Expr::IsNotNull(c) => {
                self.column(c);
                self.push(" IS NOT NULL");
            }
            Expr::Like(c, pattern) => {
                self.column(c);
                self.push(" LIKE ");
                self.bind(Value::Text(pattern.as_str().into()));
            }
            Expr::NotLike(c, pattern) => {
                self.column(c);
                self.push(" NOT LIKE ");
                self.bind(Value::Text(pattern.as_str().into()));
            }
            Expr::Regexp(c, pattern) => {
                self.column(c);
                self.push(" REGEXP ");
                self.bind(Value::Text(pattern.as_str().into()));
            }
            Expr::NotRegexp(c, pattern) => {
                self.column(c);
                self.push(" NOT REGEXP ");
                self.bind(Value::Text(pattern.as_str().into()));
            }
            Expr::JsonContains(c, candidate) => {
                let target = ColumnRef {
                    json_path: None,
                    ..c.clone()
                };
                self.push("JSON_CONTAINS(");
                self.column(&target);
                self.push(", ");
                self.bind(Value::Text(candidate.to_json().to_string().into()));
                if let Some(path) = &c.json_path {
                    self.push(", ");
                    self.bind(Value::Text(format!("$.{path}").into()));
                }
                self.push(")");
            }
            Expr::And(parts) => self.junction(parts, " AND ", nested),
            Expr::Or(parts) => self.junction(parts, " OR ", nested),
            Expr::Not(inner) => {
                self.push("NOT (");
                self.expr(inner, false);
                self.push(")");
            }
        }
    }

    fn comparison(&mut self, column: &ColumnRef, op: &str, value: &Value) {
        if value.is_null() {
            self.column(column);
            self.push(if op == "=" { " IS NULL" } else { " IS NOT NULL" });
            return;
        }
        self.column(column);
        self.push(" ");
        self.push(op);
        self.push(" ");
        self.bind(value.clone());
    }

    fn junction(&mut self, parts: &[Expr], sep: &str, nested: bool) {
        if parts.is_empty() {
            self.push(if sep == " AND " { "1 = 1" } else { "1 = 0" });
            return;
        }
        if nested && parts.len() > 1 {
            self.push("(");
        }
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                self.push(sep);
            }
            self.expr(part, true);
        }
        if nested && parts.len() > 1 {
            self.push(")");
        }
    }

    fn aggregate(&mut self, aggregate: &Aggregate) {
        match aggregate {
            Aggregate::Count => self.push("COUNT(*)"),
            Aggregate::CountDistinct(c) => {
                self.push("COUNT(DISTINCT ");
                self.column(c);
                self.push(")");
            }
            Aggregate::Sum(c) => self.wrapped("SUM(", c),
            Aggregate::Min(c) => self.wrapped("MIN(", c),
            Aggregate::Max(c) => self.wrapped("MAX(", c),
            Aggregate::Avg(c) => self.wrapped("AVG(", c),
        }
    }

    fn wrapped(&mut self, open: &str, column: &ColumnRef) {
        self.push(open);
        self.column(column);
        self.push(")");
    }

    fn from_clause(&mut self, query: &Query) -> Result<(), QueryError> {
        if query.table.is_empty() {
            return Err(QueryError::InvalidQuery {
                reason: "query has no table".into(),
            });
        }
        self.push(" FROM ");
        self.push(&quote_ident(&query.table));
        if let Some(alias) = &query.table_alias {
            self.push(" AS ");
            self.push(&quote_ident(alias));
        }
        for join in &query.joins {
            self.push(match join.join_type {
                JoinType::Inner => " INNER JOIN ",
                JoinType::Left => " LEFT JOIN ",
                JoinType::Right => " RIGHT JOIN ",
                JoinType::Cross => " CROSS JOIN ",
            });
            self.push(&quote_ident(&join.table));
            if let Some(alias) = &join.alias {
                self.push(" AS ");
                self.push(&quote_ident(alias));
            }
            if join.join_type != JoinType::Cross {
                let (Some(left), Some(right)) = (&join.left_column, &join.right_column) else {
                    return Err(QueryError::InvalidQuery {
                        reason: format!("join on '{}' needs both join columns", join.table),
                    });
                };
                self.push(" ON ");
                self.dotted(left);
                self.push(" = ");
                self.dotted(right);
            }
        }
        if let Some(predicate) = &query.predicate {
            predicate.validate_depth()?;
            self.push(" WHERE ");
            self.expr(predicate, false);
        }
        if !query.group_by.is_empty() {
            self.push(" GROUP BY ");
            for (i, c) in query.group_by.iter().enumerate() {
                if i > 0 {
                    self.push(", ");
                }
                self.column(c);
            }
        }
        Ok(())
    }

    fn select_list(&mut self, query: &Query) {
        self.push("SELECT ");
        if query.distinct {
            self.push("DISTINCT ");
        }
        if query.select.is_empty() {
            if query.joins.is_empty() {
                self.push("*");
            } else {
                self.push(&quote_ident(query.reference_name()));
                self.push(".*");
            }
            return;
        }
        for (i, item) in query.select.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            match item {
                SelectItem::Column { column, alias } => {
                    self.column(column);
                    let alias = alias
                        .clone()
                        .or_else(|| column.json_path.as_ref().map(|_| column.leaf().to_string()));
                    if let Some(alias) = alias {
                        self.push(" AS ");
                        self.push(&quote_ident(&alias));
                    }
                }
                SelectItem::Raw(expression) => self.push(expression),
                SelectItem::Aggregate { aggregate, alias } => {
                    self.aggregate(aggregate);
                    self.push(" AS ");
                    self.push(&quote_ident(alias));
                }
            }
        }
    }

    fn select(&mut self, query: &Query) -> Result<(), QueryError> {
        self.select_list(query);
        self.from_clause(query)?;
        if !query.order_by.is_empty() {
            self.push(" ORDER BY ");
            for (i, (c, order)) in query.order_by.iter().enumerate() {
                if i > 0 {
                    self.push(", ");
                }
                self.column(c);
                self.push(match order {
                    Order::Asc => " ASC",
                    Order::Desc => " DESC",
                });
            }
        }
        match (query.limit, query.offset) {
            (Some(limit), 0) => self.push(&format!(" LIMIT {limit}")),
            (Some(limit), offset) => self.push(&format!(" LIMIT {limit} OFFSET {offset}")),
            (None, 0) => {}
            // MySQL has no OFFSET without LIMIT.
            (None, offset) => self.push(&format!(" LIMIT {} OFFSET {offset}", u64::MAX)),
        }
        Ok(())
    }

    fn count(&mut self, query: &Query) -> Result<(), QueryError> {
        let mut unpaged = query.clone();
        unpaged.order_by.clear();
        unpaged.limit = None;
        unpaged.offset = 0;
        if unpaged.distinct || !unpaged.group_by.is_empty() {
            self.push("SELECT COUNT(*) AS `count` FROM (");
            self.select(&unpaged)?;
            self.push(") AS `counted`");
            return Ok(());
        }
        self.push("SELECT COUNT(*) AS `count`");
        self.from_clause(&unpaged)
    }

    fn insert(&mut self, insert: &InsertStatement) -> Result<(), QueryError> {
        if insert.columns.is_empty() || insert.rows.is_empty() {
            return Err(QueryError::InvalidQuery {
                reason: format!("insert into '{}' has no rows", insert.table),
            });
        }
        self.push("INSERT INTO ");
        self.push(&quote_ident(&insert.table));
        self.push(" (");
        let columns = insert
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        self.push(&columns);
        self.push(") VALUES ");
        for (i, row) in insert.rows.iter().enumerate() {
            if row.len() != insert.columns.len() {
                return Err(QueryError::InvalidQuery {
                    reason: format!(
                        "row {i} has {} values for {} columns",
                        row.len(),
                        insert.columns.len()
                    ),
                });
            }
            if i > 0 {
                self.push(", ");
            }
            self.value_list(row);
        }
        if !insert.on_duplicate_update.is_empty() {
            self.push(" ON DUPLICATE KEY UPDATE ");
            let assignments = insert
                .on_duplicate_update
                .iter()
                .map(|c| {
                    let q = quote_ident(c);
                    format!("{q} = VALUES({q})")
                })
                .collect::<Vec<_>>()
                .join(", ");
            self.push(&assignments);
        }
        Ok(())
    }

    fn update(&mut self, update: &UpdateStatement) -> Result<(), QueryError> {
        if update.assignments.is_empty() {
            return Err(QueryError::InvalidQuery {
                reason: format!("update of '{}' has no assignments", update.table),
            });
        }
        self.push("UPDATE ");
        self.push(&quote_ident(&update.table));
        self.push(" SET ");
        for (i, (column, value)) in update.assignments.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.push(&quote_ident(column));
            self.push(" = ");
            self.bind(value.clone());
        }
        self.push(" WHERE ");
        self.expr(&update.predicate, false);
        Ok(())
    }

    fn delete(&mut self, delete: &DeleteStatement) -> Result<(), QueryError> {
        delete.predicate.validate_depth()?;
        self.push("DELETE FROM ");
        self.push(&quote_ident(&delete.table));
        self.push(" WHERE ");
        self.expr(&delete.predicate, false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::render;
    use crate::catalog::types::Value;
    use crate::query::plan::{
        ColumnRef, Expr, InsertStatement, JoinSpec, Order, Query, SelectItem, Statement, col, lit,
    };

    #[test]
    fn renders_select_with_window() {
        let query = Query::select_all()
            .from("products")
            .where_(col("status").eq(lit("active")))
            .where_(col("price").between(lit(10), lit(20)))
            .order_by(col("id"), Order::Asc)
            .limit(10);
        let sql = render(&Statement::Select(query)).expect("render");
        assert_eq!(
            sql.sql,
            "SELECT * FROM `products` WHERE `status` = ? AND `price` BETWEEN ? AND ? ORDER BY `id` ASC LIMIT 10"
        );
        assert_eq!(
            sql.params,
            vec![Value::from("active"), Value::Integer(10), Value::Integer(20)]
        );
    }

    #[test]
    fn nested_junctions_are_parenthesised() {
        let expr = Expr::And(vec![
            col("a").eq(lit(1)),
            Expr::Or(vec![col("b").eq(lit(2)), col("c").eq(lit(3))]),
        ]);
        let sql = render(&Statement::Select(
            Query::select_all().from("t").where_(expr),
        ))
        .expect("render");
        assert_eq!(
            sql.sql,
            "SELECT * FROM `t` WHERE `a` = ? AND (`b` = ? OR `c` = ?)"
        );
    }

    #[test]
    fn json_projection_is_aliased_to_leaf() {
        let query = Query::select(vec![
            SelectItem::column(col("id")),
            SelectItem::column(ColumnRef::json("price", "msrp")),
        ])
        .from("products");
        let sql = render(&Statement::Select(query)).expect("render");
        assert_eq!(
            sql.sql,
            "SELECT `id`, JSON_UNQUOTE(JSON_EXTRACT(`price`, ?)) AS `msrp` FROM `products`"
        );
        assert_eq!(sql.params, vec![Value::from("$.msrp")]);
    }

    #[test]
    fn count_wraps_grouped_queries() {
        let query = Query::select(vec![SelectItem::column(col("brand"))])
            .from("products")
            .group_by(vec![col("brand")])
            .limit(5);
        let sql = render(&Statement::Count(query)).expect("render");
        assert_eq!(
            sql.sql,
            "SELECT COUNT(*) AS `count` FROM (SELECT `brand` FROM `products` GROUP BY `brand`) AS `counted`"
        );
    }

    #[test]
    fn upsert_renders_on_duplicate_key_update() {
        let insert = InsertStatement {
            table: "products".into(),
            columns: vec!["id".into(), "name".into()],
            rows: vec![
                vec![Value::Integer(1), Value::from("a")],
                vec![Value::Integer(2), Value::from("b")],
            ],
            on_duplicate_update: vec!["name".into()],
        };
        let sql = render(&Statement::Insert(insert)).expect("render");
        assert_eq!(
            sql.sql,
            "INSERT INTO `products` (`id`, `name`) VALUES (?, ?), (?, ?) ON DUPLICATE KEY UPDATE `name` = VALUES(`name`)"
        );
        assert_eq!(sql.params.len(), 4);
    }

    #[test]
    fn joins_and_interpolation() {
        let query = Query::select_all()
            .from("products")
            .alias("p")
            .join(JoinSpec::left("brands", "p.brand_id", "b.id").with_alias("b"))
            .where_(ColumnRef::qualified("b", "name").eq(lit("O'Neil")));
        let sql = render(&Statement::Select(query)).expect("render");
        assert_eq!(
            sql.interpolated(),
            "SELECT `p`.* FROM `products` AS `p` LEFT JOIN `brands` AS `b` ON `p`.`brand_id` = `b`.`id` WHERE `b`.`name` = 'O''Neil'"
        );
    }
}
