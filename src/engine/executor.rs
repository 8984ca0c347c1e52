use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use super::value::Value;
use super::Database;
use crate::error::{DbError, Result};
use crate::sql::context::QueryContext;
use crate::sql::expr::Expr;
use crate::sql::param::Params;
use crate::sql::query::{Query, QueryKind, SelectItem};

/// Rows produced by a SELECT, with their column names.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueryResult {
    Rows(ResultSet),
    Inserted(usize),
}

impl QueryResult {
    /// The SELECT rows, or `None` for an INSERT.
    pub fn rows(&self) -> Option<&ResultSet> {
        match self {
            QueryResult::Rows(rs) => Some(rs),
            QueryResult::Inserted(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            QueryResult::Rows(rs) => json!({
                "columns": rs.columns,
                "rows": rs
                    .rows
                    .iter()
                    .map(|row| row.iter().map(Value::to_json).collect::<Vec<_>>())
                    .collect::<Vec<_>>(),
            }),
            QueryResult::Inserted(n) => json!({ "inserted": n }),
        }
    }
}

/// Executes a bound query.
///
/// ## Query Processing Pipeline
/// ```text
/// FROM items → join order → nested loop → WHERE filter → projection → rows
///                  ↑                           ↑              ↑
///             sub_cost of WHERE          UNKNOWN drops    or aggregate
///                                        the row          accumulation
/// ```
///
/// Each FROM table is scanned once up front; the nested loop then runs over
/// the materialized rows in join order. The database lock is held for read
/// for the whole execution so tables can't be dropped underneath it.
pub fn execute(db: &Database, query: &Query, params: &Params) -> Result<QueryResult> {
    let _guard = db.database_lock().lock_read(db.config().lock_timeout())?;
    execute_locked(db, query, params)
}

/// [`execute`] for a caller that already holds the database lock for read.
///
/// A query bound to a table that has since been dropped fails with
/// [`DbError::TableNotFound`], even if a table of the same name exists now.
pub(crate) fn execute_locked(db: &Database, query: &Query, params: &Params) -> Result<QueryResult> {
    for item in query.from_items() {
        let table = item.table();
        let registered = db.get_table(table.name());
        if !registered.is_some_and(|current| Arc::ptr_eq(&current, table)) {
            return Err(DbError::TableNotFound(table.name().to_string()));
        }
    }

    match query.kind() {
        QueryKind::Select { items, filter } => {
            let rows = execute_select(query, items, filter.as_ref(), params)?;
            debug!(sql = query.sql(), rows = rows.len(), "select executed");
            Ok(QueryResult::Rows(ResultSet {
                columns: query.column_names(),
                rows,
            }))
        }
        QueryKind::Insert { targets, rows, .. } => {
            let table = query.from_items()[0].table();
            let width = table.columns().len();
            let ctx = QueryContext::new(params, 0, 0);

            // evaluate every row before storing any
            let values = rows
                .iter()
                .map(|row| {
                    let mut values = vec![Value::Null; width];
                    for (target, expr) in targets.iter().zip(row) {
                        values[*target] = expr.eval_value(&ctx)?;
                    }
                    Ok(values)
                })
                .collect::<Result<Vec<_>>>()?;
            let inserted = table.insert_all(&values)?.len();
            debug!(table = table.name(), rows = inserted, "insert executed");
            Ok(QueryResult::Inserted(inserted))
        }
    }
}

fn execute_select(
    query: &Query,
    items: &[SelectItem],
    filter: Option<&Expr>,
    params: &Params,
) -> Result<Vec<Vec<Value>>> {
    let data = query
        .from_items()
        .iter()
        .map(|item| {
            item.table()
                .rows()
                .map(|rows| rows.into_iter().map(|(_, row)| row).collect::<Vec<_>>())
        })
        .collect::<Result<Vec<_>>>()?;

    let exprs: Vec<&Expr> = items
        .iter()
        .filter_map(|item| match item {
            SelectItem::Expr { expr, .. } => Some(expr),
            SelectItem::Wildcard { .. } => None,
        })
        .collect();

    let mut scan = Scan {
        filter,
        exprs: &exprs,
        aggregate: query.is_aggregate(),
        rows: Vec::new(),
    };
    let mut ctx = QueryContext::new(params, data.len(), query.aggregate_count());
    nested_loop(&query.join_order(), &data, &mut ctx, &mut scan)?;

    if scan.aggregate {
        let row = exprs
            .iter()
            .map(|e| e.eval_value(&ctx))
            .collect::<Result<Vec<_>>>()?;
        scan.rows.push(row);
    }
    Ok(scan.rows)
}

struct Scan<'q> {
    filter: Option<&'q Expr>,
    exprs: &'q [&'q Expr],
    aggregate: bool,
    rows: Vec<Vec<Value>>,
}

impl Scan<'_> {
    fn visit(&mut self, ctx: &mut QueryContext<'_>) -> Result<()> {
        if let Some(filter) = self.filter {
            if !filter.eval_truth(ctx)?.is_true() {
                return Ok(());
            }
        }
        if self.aggregate {
            for e in self.exprs {
                e.accumulate(ctx)?;
            }
        } else {
            let row = self
                .exprs
                .iter()
                .map(|e| e.eval_value(ctx))
                .collect::<Result<Vec<_>>>()?;
            self.rows.push(row);
        }
        Ok(())
    }
}

fn nested_loop<'a>(
    order: &[usize],
    data: &'a [Vec<Vec<Value>>],
    ctx: &mut QueryContext<'a>,
    scan: &mut Scan<'_>,
) -> Result<()> {
    let Some((&item, rest)) = order.split_first() else {
        return scan.visit(ctx);
    };
    for row in &data[item] {
        ctx.set_row(item, row);
        nested_loop(rest, data, ctx, scan)?;
    }
    ctx.clear_row(item);
    Ok(())
}
