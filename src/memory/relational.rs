//! In-process relational engine. Evaluates structured statements directly
//! against tables held in memory, with MySQL-style key handling and
//! scriptable faults for exercising the retry path.

use crate::catalog::types::{ColumnType, ColumnTypes, Row, Value};
use crate::driver::{ConnectionRole, DriverError, RelationalDriver, StatementOutput};
use crate::query::operators::{aggregate, column_value, compare_values, eval};
use crate::query::plan::{
    ColumnRef, DeleteStatement, InsertStatement, JoinSpec, JoinType, Order, Query, SelectItem,
    Statement, UpdateStatement,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use tracing::debug;

const PRIMARY_KEY_NAME: &str = "PRIMARY";

/// Shape of one in-memory table.
#[derive(Debug, Clone)]
pub struct TableSpec {
    name: String,
    columns: ColumnTypes,
    primary_key: String,
    unique_keys: Vec<(String, Vec<String>)>,
}

impl TableSpec {
    /// The primary key auto-increments when an insert leaves it NULL.
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        let primary_key = primary_key.into();
        Self {
            name: name.into(),
            columns: ColumnTypes::new().with(primary_key.clone(), ColumnType::Integer),
            primary_key,
            unique_keys: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.insert(column, column_type);
        self
    }

    pub fn with_unique_key(mut self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.unique_keys
            .push((name.into(), columns.iter().map(|c| c.to_string()).collect()));
        self
    }
}

/// A fault returned instead of executing a statement.
#[derive(Debug, Clone)]
pub struct Fault {
    error: DriverError,
    /// `None` fails every matching statement until cleared.
    remaining: Option<u32>,
    writes_only: bool,
}

impl Fault {
    pub fn once(error: DriverError) -> Self {
        Self::times(error, 1)
    }

    pub fn times(error: DriverError, times: u32) -> Self {
        Self {
            error,
            remaining: Some(times),
            writes_only: false,
        }
    }

    pub fn always(error: DriverError) -> Self {
        Self {
            error,
            remaining: None,
            writes_only: false,
        }
    }

    /// Lets reads through and only fails inserts, updates and deletes.
    pub fn on_writes(mut self) -> Self {
        self.writes_only = true;
        self
    }

    fn applies_to(&self, statement: &Statement) -> bool {
        !self.writes_only || statement.is_write()
    }
}

/// One statement the engine was asked to run, whether or not it succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedStatement {
    pub role: ConnectionRole,
    pub kind: &'static str,
    pub table: String,
    pub failed: bool,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    spec: TableSpec,
    rows: Vec<Row>,
    next_id: i64,
}

impl MemoryTable {
    fn keys(&self) -> impl Iterator<Item = (&str, Vec<&str>)> {
        std::iter::once((PRIMARY_KEY_NAME, vec![self.spec.primary_key.as_str()])).chain(
            self.spec
                .unique_keys
                .iter()
                .map(|(name, cols)| (name.as_str(), cols.iter().map(String::as_str).collect())),
        )
    }

    /// First stored row sharing a key with `candidate`, skipping `skip`.
    fn conflict(
        &self,
        rows: &[Row],
        candidate: &Row,
        skip: Option<usize>,
    ) -> Option<(usize, String, String)> {
        for (key_name, columns) in self.keys() {
            let wanted: Vec<&Value> = columns
                .iter()
                .filter_map(|c| candidate.get(c).filter(|v| !v.is_null()))
                .collect();
            if wanted.len() != columns.len() {
                continue;
            }
            let hit = rows.iter().enumerate().find(|(idx, row)| {
                Some(*idx) != skip
                    && columns
                        .iter()
                        .zip(&wanted)
                        .all(|(c, w)| row.get(c).is_some_and(|v| same(v, w)))
            });
            if let Some((idx, _)) = hit {
                let shown: Vec<String> = wanted.iter().map(|v| v.to_key_string()).collect();
                return Some((idx, shown.join("-"), key_name.to_string()));
            }
        }
        None
    }

    fn check_column(&self, column: &str) -> Result<(), DriverError> {
        if self.spec.columns.contains(column) {
            Ok(())
        } else {
            Err(DriverError::new(format!("Unknown column '{column}' in 'field list'"))
                .with_code(1054)
                .with_sql_state("42S22"))
        }
    }
}

pub struct MemoryRelationalDriver {
    name: String,
    tables: RwLock<BTreeMap<String, MemoryTable>>,
    faults: Mutex<Vec<Fault>>,
    log: Mutex<Vec<ExecutedStatement>>,
    reconnects: AtomicU32,
    describes: AtomicU32,
}

impl Default for MemoryRelationalDriver {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryRelationalDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: RwLock::new(BTreeMap::new()),
            faults: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            reconnects: AtomicU32::new(0),
            describes: AtomicU32::new(0),
        }
    }

    pub fn create_table(&self, spec: TableSpec) {
        self.tables.write().insert(
            spec.name.clone(),
            MemoryTable {
                spec,
                rows: Vec::new(),
                next_id: 1,
            },
        );
    }

    /// Inserts JSON objects as rows, honouring keys. Columns declared as JSON
    /// keep their document value.
    pub fn seed(&self, table: &str, rows: Vec<JsonValue>) -> Result<u64, DriverError> {
        let mut tables = self.tables.write();
        let target = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let mut affected = 0;
        for row in rows {
            let Some(object) = row.as_object() else {
                return Err(DriverError::new(format!("seed row for '{table}' is not an object")));
            };
            let columns: Vec<String> = object.keys().cloned().collect();
            let values = object
                .iter()
                .map(|(column, value)| match value {
                    JsonValue::Null => Value::Null,
                    v if target.spec.columns.is_json(column) => Value::Json(v.clone()),
                    v => Value::from_json(v),
                })
                .collect();
            affected += insert(
                target,
                &InsertStatement {
                    table: table.to_string(),
                    columns,
                    rows: vec![values],
                    on_duplicate_update: Vec::new(),
                },
            )?;
        }
        Ok(affected)
    }

    /// Stored rows in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn inject(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.log.lock().clone()
    }

    pub fn executions_of(&self, kind: &str) -> usize {
        self.log.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(AtomicOrdering::SeqCst)
    }

    pub fn describe_count(&self) -> u32 {
        self.describes.load(AtomicOrdering::SeqCst)
    }

    fn take_fault(&self, statement: &Statement) -> Option<DriverError> {
        let mut faults = self.faults.lock();
        let idx = faults.iter().position(|f| f.applies_to(statement))?;
        let error = faults[idx].error.clone();
        if let Some(remaining) = faults[idx].remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                faults.remove(idx);
            }
        }
        Some(error)
    }

    fn run(&self, statement: &Statement) -> Result<StatementOutput, DriverError> {
        if let Some(error) = self.take_fault(statement) {
            return Err(error);
        }
        match statement {
            Statement::Select(query) => {
                let tables = self.tables.read();
                select(&tables, query).map(StatementOutput::Rows)
            }
            Statement::Count(query) => {
                let tables = self.tables.read();
                count(&tables, query).map(StatementOutput::Count)
            }
            Statement::Insert(stmt) => {
                let mut tables = self.tables.write();
                let table = tables
                    .get_mut(&stmt.table)
                    .ok_or_else(|| missing_table(&stmt.table))?;
                insert(table, stmt).map(StatementOutput::Affected)
            }
            Statement::Update(stmt) => {
                let mut tables = self.tables.write();
                let table = tables
                    .get_mut(&stmt.table)
                    .ok_or_else(|| missing_table(&stmt.table))?;
                update(table, stmt).map(StatementOutput::Affected)
            }
            Statement::Delete(stmt) => {
                let mut tables = self.tables.write();
                let table = tables
                    .get_mut(&stmt.table)
                    .ok_or_else(|| missing_table(&stmt.table))?;
                Ok(StatementOutput::Affected(delete(table, stmt)))
            }
        }
    }
}

impl RelationalDriver for MemoryRelationalDriver {
    fn connection_name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        role: ConnectionRole,
        statement: &Statement,
    ) -> Result<StatementOutput, DriverError> {
        let result = self.run(statement);
        debug!(
            connection = %self.name,
            role = role.as_str(),
            kind = statement.kind(),
            table = statement.table(),
            ok = result.is_ok(),
            "memory statement"
        );
        self.log.lock().push(ExecutedStatement {
            role,
            kind: statement.kind(),
            table: statement.table().to_string(),
            failed: result.is_err(),
        });
        result
    }

    async fn reconnect(&self, _role: ConnectionRole) -> Result<(), DriverError> {
        self.reconnects.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn describe(&self, table: &str) -> Result<ColumnTypes, DriverError> {
        self.describes.fetch_add(1, AtomicOrdering::SeqCst);
        self.tables
            .read()
            .get(table)
            .map(|t| t.spec.columns.clone())
            .ok_or_else(|| missing_table(table))
    }
}

fn missing_table(table: &str) -> DriverError {
    DriverError::new(format!("Table '{table}' doesn't exist"))
        .with_code(1146)
        .with_sql_state("42S02")
}

fn same(left: &Value, right: &Value) -> bool {
    compare_values(left, right).is_some_and(Ordering::is_eq)
}

fn order_values(left: &Value, right: &Value) -> Ordering {
    compare_values(left, right).unwrap_or_else(|| left.cmp(right))
}

fn insert(table: &mut MemoryTable, stmt: &InsertStatement) -> Result<u64, DriverError> {
    for column in &stmt.columns {
        table.check_column(column)?;
    }
    let primary_key = table.spec.primary_key.clone();
    let mut rows = table.rows.clone();
    let mut next_id = table.next_id;
    let mut affected = 0;
    for values in &stmt.rows {
        let mut incoming = Row::from_pairs(table.spec.columns.columns().map(|c| (c, Value::Null)));
        for (column, value) in stmt.columns.iter().zip(values) {
            incoming.set(column.clone(), value.clone());
        }
        match incoming.get(&primary_key) {
            None | Some(Value::Null) => {
                incoming.set(primary_key.clone(), Value::Integer(next_id));
                next_id += 1;
            }
            Some(Value::Integer(id)) => next_id = next_id.max(id + 1),
            Some(_) => {}
        }
        match table.conflict(&rows, &incoming, None) {
            Some((_, value, key)) if stmt.on_duplicate_update.is_empty() => {
                return Err(DriverError::duplicate_entry(&value, &key));
            }
            Some((idx, _, _)) => {
                let existing = &mut rows[idx];
                let mut changed = false;
                for column in &stmt.on_duplicate_update {
                    if let Some(value) = incoming.get(column) {
                        if existing.get(column) != Some(value) {
                            existing.set(column.clone(), value.clone());
                            changed = true;
                        }
                    }
                }
                if changed {
                    affected += 2;
                }
            }
            None => {
                rows.push(incoming);
                affected += 1;
            }
        }
    }
    table.rows = rows;
    table.next_id = next_id;
    Ok(affected)
}

fn update(table: &mut MemoryTable, stmt: &UpdateStatement) -> Result<u64, DriverError> {
    for (column, _) in &stmt.assignments {
        table.check_column(column)?;
    }
    let mut rows = table.rows.clone();
    let mut affected = 0;
    for idx in 0..rows.len() {
        if !eval(&stmt.predicate, &rows[idx]) {
            continue;
        }
        let mut changed = false;
        for (column, value) in &stmt.assignments {
            if rows[idx].get(column) != Some(value) {
                rows[idx].set(column.clone(), value.clone());
                changed = true;
            }
        }
        if changed {
            if let Some((_, value, key)) = table.conflict(&rows, &rows[idx], Some(idx)) {
                return Err(DriverError::duplicate_entry(&value, &key));
            }
            affected += 1;
        }
    }
    table.rows = rows;
    Ok(affected)
}

fn delete(table: &mut MemoryTable, stmt: &DeleteStatement) -> u64 {
    let before = table.rows.len();
    table.rows.retain(|row| !eval(&stmt.predicate, row));
    (before - table.rows.len()) as u64
}

/// Base rows with every join applied and the WHERE clause evaluated. Joined
/// rows carry `qualifier.column` keys next to the base table's bare ones.
fn source_rows(tables: &BTreeMap<String, MemoryTable>, query: &Query) -> Result<Vec<Row>, DriverError> {
    let base = tables
        .get(&query.table)
        .ok_or_else(|| missing_table(&query.table))?;
    let mut rows = base.rows.clone();
    if !query.joins.is_empty() {
        let qualifier = query.reference_name();
        rows = rows.iter().map(|row| qualify(row, qualifier, true)).collect();
        for join in &query.joins {
            let joined = tables
                .get(&join.table)
                .ok_or_else(|| missing_table(&join.table))?;
            let right: Vec<Row> = joined
                .rows
                .iter()
                .map(|row| qualify(row, join.reference_name(), false))
                .collect();
            rows = join_rows(rows, &right, join);
        }
    }
    if let Some(predicate) = &query.predicate {
        rows.retain(|row| eval(predicate, row));
    }
    Ok(rows)
}

fn qualify(row: &Row, qualifier: &str, keep_bare: bool) -> Row {
    let mut out = if keep_bare { row.clone() } else { Row::default() };
    for (column, value) in &row.values {
        out.set(format!("{qualifier}.{column}"), value.clone());
    }
    out
}

fn merge(left: &Row, right: &Row) -> Row {
    let mut out = left.clone();
    for (column, value) in &right.values {
        out.set(column.clone(), value.clone());
    }
    out
}

fn join_rows(left: Vec<Row>, right: &[Row], join: &JoinSpec) -> Vec<Row> {
    let on = |row: &Row| match (&join.left_column, &join.right_column) {
        (Some(l), Some(r)) => match (row.get(l), row.get(r)) {
            (Some(a), Some(b)) => same(a, b),
            _ => false,
        },
        _ => false,
    };
    let mut out = Vec::new();
    let mut right_matched = vec![false; right.len()];
    for l in &left {
        let mut matched = false;
        for (idx, r) in right.iter().enumerate() {
            let combined = merge(l, r);
            if join.join_type == JoinType::Cross || on(&combined) {
                out.push(combined);
                matched = true;
                right_matched[idx] = true;
            }
        }
        if !matched && join.join_type == JoinType::Left {
            out.push(l.clone());
        }
    }
    if join.join_type == JoinType::Right {
        out.extend(
            right
                .iter()
                .zip(&right_matched)
                .filter(|(_, matched)| !**matched)
                .map(|(r, _)| r.clone()),
        );
    }
    out
}

fn is_grouped(query: &Query) -> bool {
    !query.group_by.is_empty()
        || query
            .select
            .iter()
            .any(|item| matches!(item, SelectItem::Aggregate { .. }))
}

/// Rows partitioned by their GROUP BY key, in first-seen order. Without
/// GROUP BY every row falls into one group, which exists even when empty.
fn groups(query: &Query, rows: Vec<Row>) -> Vec<Vec<Row>> {
    if query.group_by.is_empty() {
        return vec![rows];
    }
    let mut index: BTreeMap<Vec<Value>, usize> = BTreeMap::new();
    let mut out: Vec<Vec<Row>> = Vec::new();
    for row in rows {
        let key: Vec<Value> = query
            .group_by
            .iter()
            .map(|c| column_value(&row, c).unwrap_or(Value::Null))
            .collect();
        match index.get(&key) {
            Some(&idx) => out[idx].push(row),
            None => {
                index.insert(key, out.len());
                out.push(vec![row]);
            }
        }
    }
    out
}

fn select(tables: &BTreeMap<String, MemoryTable>, query: &Query) -> Result<Vec<Row>, DriverError> {
    let rows = source_rows(tables, query)?;
    let mut output = if is_grouped(query) {
        let mut projected = Vec::new();
        for group in groups(query, rows) {
            let refs: Vec<&Row> = group.iter().collect();
            let first = group.first().cloned().unwrap_or_default();
            let mut out = Row::default();
            if query.select.is_empty() {
                out = first.clone();
            }
            for item in &query.select {
                match item {
                    SelectItem::Aggregate { aggregate: agg, alias } => {
                        out.set(alias.clone(), aggregate(agg, &refs));
                    }
                    other => project_item(query, other, &first, &mut out)?,
                }
            }
            projected.push((out, first));
        }
        projected.sort_by(|(a_out, a_first), (b_out, b_first)| {
            compare_by(&query.order_by, |column| {
                let lookup = |out: &Row, first: &Row| match out.get(&column.column) {
                    Some(v) if column.qualifier.is_none() && column.json_path.is_none() => {
                        v.clone()
                    }
                    _ => column_value(first, column).unwrap_or(Value::Null),
                };
                (lookup(a_out, a_first), lookup(b_out, b_first))
            })
        });
        projected.into_iter().map(|(out, _)| out).collect()
    } else {
        let mut rows = rows;
        rows.sort_by(|a, b| {
            compare_by(&query.order_by, |column| {
                (
                    column_value(a, column).unwrap_or(Value::Null),
                    column_value(b, column).unwrap_or(Value::Null),
                )
            })
        });
        rows.iter()
            .map(|row| project(query, row))
            .collect::<Result<Vec<_>, _>>()?
    };
    if query.distinct {
        output = dedup(output);
    }
    let offset = usize::try_from(query.offset).unwrap_or(usize::MAX);
    let limit = query
        .limit
        .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
        .unwrap_or(usize::MAX);
    Ok(output.into_iter().skip(offset).take(limit).collect())
}

fn count(tables: &BTreeMap<String, MemoryTable>, query: &Query) -> Result<u64, DriverError> {
    let rows = source_rows(tables, query)?;
    if !query.group_by.is_empty() {
        return Ok(groups(query, rows).len() as u64);
    }
    if query.distinct {
        let projected = rows
            .iter()
            .map(|row| project(query, row))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(dedup(projected).len() as u64);
    }
    Ok(rows.len() as u64)
}

fn compare_by<F>(order_by: &[(ColumnRef, Order)], mut values: F) -> Ordering
where
    F: FnMut(&ColumnRef) -> (Value, Value),
{
    for (column, order) in order_by {
        let (a, b) = values(column);
        let ordering = match order {
            Order::Asc => order_values(&a, &b),
            Order::Desc => order_values(&b, &a),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn dedup(rows: Vec<Row>) -> Vec<Row> {
    let mut seen: Vec<Row> = Vec::with_capacity(rows.len());
    for row in rows {
        if !seen.contains(&row) {
            seen.push(row);
        }
    }
    seen
}

fn project(query: &Query, row: &Row) -> Result<Row, DriverError> {
    if query.select.is_empty() {
        return Ok(bare_columns(row));
    }
    let mut out = Row::default();
    for item in &query.select {
        project_item(query, item, row, &mut out)?;
    }
    Ok(out)
}

fn bare_columns(row: &Row) -> Row {
    Row::from_pairs(
        row.values
            .iter()
            .filter(|(column, _)| !column.contains('.'))
            .map(|(column, value)| (column.clone(), value.clone())),
    )
}

fn project_item(query: &Query, item: &SelectItem, row: &Row, out: &mut Row) -> Result<(), DriverError> {
    match item {
        SelectItem::Column { column, .. } => {
            out.set(
                item.output_name(),
                column_value(row, column).unwrap_or(Value::Null),
            );
        }
        SelectItem::Raw(expression) => project_raw(query, expression, row, out)?,
        SelectItem::Aggregate { alias, .. } => {
            return Err(DriverError::new(format!(
                "aggregate '{alias}' outside of a grouped query"
            ))
            .with_code(1111));
        }
    }
    Ok(())
}

/// Raw select expressions the engine understands: `qualifier.*`, and a
/// column reference with an optional `AS alias`.
fn project_raw(query: &Query, expression: &str, row: &Row, out: &mut Row) -> Result<(), DriverError> {
    let expression = expression.trim();
    if let Some(qualifier) = expression.strip_suffix(".*") {
        let qualifier = unquote(qualifier);
        if qualifier == query.reference_name() {
            for (column, value) in bare_columns(row).values {
                out.set(column, value);
            }
        } else {
            let prefix = format!("{qualifier}.");
            for (column, value) in &row.values {
                if let Some(leaf) = column.strip_prefix(&prefix) {
                    out.set(leaf.to_string(), value.clone());
                }
            }
        }
        return Ok(());
    }
    let (source, alias) = match split_alias(expression) {
        Some((source, alias)) => (source, Some(unquote(alias))),
        None => (expression, None),
    };
    let unsupported = || {
        DriverError::new(format!("unsupported select expression '{expression}'"))
            .with_code(1064)
            .with_sql_state("42000")
    };
    if source.contains(['(', ' ', '\'']) {
        return Err(unsupported());
    }
    let parts: Vec<String> = source.split('.').map(unquote).collect();
    let column = match parts.as_slice() {
        [column] => ColumnRef::new(column.clone()),
        [qualifier, column] => ColumnRef::qualified(qualifier.clone(), column.clone()),
        _ => return Err(unsupported()),
    };
    let name = alias.unwrap_or_else(|| column.column.clone());
    out.set(name, column_value(row, &column).unwrap_or(Value::Null));
    Ok(())
}

fn split_alias(expression: &str) -> Option<(&str, &str)> {
    let lower = expression.to_ascii_lowercase();
    let at = lower.rfind(" as ")?;
    Some((expression[..at].trim(), expression[at + 4..].trim()))
}

fn unquote(ident: &str) -> String {
    ident.trim().trim_matches('`').to_string()
}

#[cfg(test)]
mod tests {
    use super::{Fault, MemoryRelationalDriver, TableSpec};
    use crate::catalog::types::{ColumnType, Value};
    use crate::driver::{ConnectionRole, DriverError, RelationalDriver, StatementOutput};
    use crate::query::plan::{
        Aggregate, ColumnRef, InsertStatement, JoinSpec, Order, Query, SelectItem, Statement, col,
        lit,
    };
    use serde_json::json;

    fn driver() -> MemoryRelationalDriver {
        let driver = MemoryRelationalDriver::default();
        driver.create_table(
            TableSpec::new("products", "id")
                .with_column("sku", ColumnType::Text)
                .with_column("brand_id", ColumnType::Integer)
                .with_column("price", ColumnType::Float)
                .with_unique_key("uniq_sku", &["sku"]),
        );
        driver.create_table(
            TableSpec::new("brands", "id").with_column("name", ColumnType::Text),
        );
        driver
            .seed(
                "products",
                vec![
                    json!({"id": 1, "sku": "A", "brand_id": 1, "price": 10.0}),
                    json!({"id": 2, "sku": "B", "brand_id": 2, "price": 20.0}),
                    json!({"id": 3, "sku": "C", "brand_id": 1, "price": 30.0}),
                ],
            )
            .expect("seed products");
        driver
            .seed("brands", vec![json!({"id": 1, "name": "acme"}), json!({"id": 2, "name": "zeta"})])
            .expect("seed brands");
        driver
    }

    async fn rows(driver: &MemoryRelationalDriver, query: Query) -> Vec<crate::catalog::types::Row> {
        driver
            .execute(ConnectionRole::Replica, &Statement::Select(query))
            .await
            .expect("select")
            .into_rows()
    }

    #[tokio::test]
    async fn filters_orders_and_pages() {
        let driver = driver();
        let query = Query::select_all()
            .from("products")
            .where_(col("price").gte(lit(15.0)))
            .order_by(col("price"), Order::Desc)
            .limit(1);
        let found = rows(&driver, query).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("sku"), Some(&Value::from("C")));
    }

    #[tokio::test]
    async fn groups_and_orders_by_alias() {
        let driver = driver();
        let query = Query::select(vec![
            SelectItem::Column {
                column: col("brand_id"),
                alias: Some("key".into()),
            },
            SelectItem::Aggregate {
                aggregate: Aggregate::Count,
                alias: "doc_count".into(),
            },
        ])
        .from("products")
        .group_by(vec![col("brand_id")])
        .order_by(ColumnRef::new("doc_count"), Order::Desc);
        let found = rows(&driver, query).await;
        assert_eq!(found[0].get("key"), Some(&Value::Integer(1)));
        assert_eq!(found[0].get("doc_count"), Some(&Value::Integer(2)));
    }

    #[tokio::test]
    async fn joins_expose_qualified_columns() {
        let driver = driver();
        let query = Query::select_all()
            .from("products")
            .join(JoinSpec::inner("brands", "products.brand_id", "brands.id"))
            .where_(ColumnRef::qualified("brands", "name").eq(lit("zeta")));
        let found = rows(&driver, query).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("sku"), Some(&Value::from("B")));
        assert!(found[0].get("brands.name").is_none());
    }

    #[tokio::test]
    async fn duplicate_keys_fail_unless_upserting() {
        let driver = driver();
        let insert = |on_duplicate_update: Vec<String>| {
            Statement::Insert(InsertStatement {
                table: "products".into(),
                columns: vec!["sku".into(), "price".into()],
                rows: vec![vec![Value::from("A"), Value::Float(99.0)]],
                on_duplicate_update,
            })
        };
        let err = driver
            .execute(ConnectionRole::Primary, &insert(Vec::new()))
            .await
            .expect_err("duplicate");
        assert_eq!(err.code, Some(1062));
        assert!(err.message.contains("uniq_sku"));

        let out = driver
            .execute(ConnectionRole::Primary, &insert(vec!["price".into()]))
            .await
            .expect("upsert");
        assert_eq!(out, StatementOutput::Affected(2));
        let stored = driver.rows("products");
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].get("price"), Some(&Value::Float(99.0)));
    }

    #[tokio::test]
    async fn auto_increment_continues_after_seeded_ids() {
        let driver = driver();
        driver
            .seed("products", vec![json!({"sku": "D"})])
            .expect("seed");
        let stored = driver.rows("products");
        assert_eq!(stored[3].get("id"), Some(&Value::Integer(4)));
        assert_eq!(stored[3].get("price"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn queued_faults_are_consumed_in_order() {
        let driver = driver();
        driver.inject(Fault::times(DriverError::deadlock(), 2).on_writes());
        let count = Statement::Count(Query::select_all().from("products"));
        assert_eq!(
            driver
                .execute(ConnectionRole::Replica, &count)
                .await
                .expect("reads pass")
                .count(),
            3
        );
        let delete = Statement::Delete(crate::query::plan::DeleteStatement {
            table: "products".into(),
            predicate: col("id").eq(lit(1)),
        });
        for _ in 0..2 {
            let err = driver
                .execute(ConnectionRole::Primary, &delete)
                .await
                .expect_err("fault");
            assert_eq!(err.code, Some(1213));
        }
        let out = driver
            .execute(ConnectionRole::Primary, &delete)
            .await
            .expect("delete");
        assert_eq!(out, StatementOutput::Affected(1));
        assert_eq!(driver.executions_of("delete"), 3);
    }

    #[tokio::test]
    async fn raw_selects_and_describe() {
        let driver = driver();
        let query = Query::select(vec![
            SelectItem::Raw("`products`.*".into()),
            SelectItem::Raw("b.name AS brand_name".into()),
        ])
        .from("products")
        .join(JoinSpec::left("brands", "products.brand_id", "b.id").with_alias("b"))
        .order_by(ColumnRef::qualified("products", "id"), Order::Asc);
        let found = rows(&driver, query).await;
        assert_eq!(found[0].get("brand_name"), Some(&Value::from("acme")));
        assert_eq!(found[0].get("sku"), Some(&Value::from("A")));

        let columns = driver.describe("products").await.expect("describe");
        assert_eq!(columns.get("sku"), Some(ColumnType::Text));
        assert_eq!(driver.describe_count(), 1);
        assert_eq!(driver.describe("missing").await.expect_err("missing").code, Some(1146));
    }
}
