use std::{collections::HashSet, mem, sync::Arc};
use tracing::debug;

use super::expr::Expr;
use super::param::Params;
use crate::engine::executor::{self, QueryResult};
use crate::engine::table::Table;
use crate::engine::value::Value;
use crate::engine::Database;
use crate::error::{DbError, Result};

/// A table named in a FROM clause, with the alias columns are qualified by.
#[derive(Clone, Debug)]
pub struct FromItem {
    table: Arc<Table>,
    alias: String,
}

impl FromItem {
    /// Without an alias, the table name doubles as one.
    pub fn new(table: Arc<Table>, alias: Option<String>) -> Self {
        let alias = alias.unwrap_or_else(|| table.name().to_string());
        Self { table, alias }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }
}

/// One entry of a select list.
#[derive(Clone, Debug, PartialEq)]
pub enum SelectItem {
    /// `*` or `alias.*`; replaced by its columns at bind
    Wildcard { qualifier: Option<String> },
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Clone, Debug)]
pub enum QueryKind {
    Select {
        items: Vec<SelectItem>,
        filter: Option<Expr>,
    },
    /// Inserts into `from_items[0]`. `targets` holds the column index each
    /// value lands in, filled at bind.
    Insert {
        columns: Option<Vec<String>>,
        targets: Vec<usize>,
        rows: Vec<Vec<Expr>>,
    },
}

/// A parsed statement.
///
/// A `Query` is created unbound by the parser; [`Query::bind`] resolves and
/// specializes its expressions. A bound query holds no execution state:
/// parameter values live in a [`Params`] supplied per execution, so one
/// bound query may be executed from several threads at once.
#[derive(Clone, Debug)]
pub struct Query {
    sql: String,
    from_items: Vec<FromItem>,
    kind: QueryKind,
    param_count: usize,
    aggregate_count: usize,
    bound: bool,
}

impl Query {
    pub(crate) fn new(
        sql: &str,
        from_items: Vec<FromItem>,
        kind: QueryKind,
        param_count: usize,
        aggregate_count: usize,
    ) -> Self {
        Self {
            sql: sql.to_string(),
            from_items,
            kind,
            param_count,
            aggregate_count,
            bound: false,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn from_items(&self) -> &[FromItem] {
        &self.from_items
    }

    pub fn kind(&self) -> &QueryKind {
        &self.kind
    }

    /// Highest parameter index used in the statement.
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    pub fn aggregate_count(&self) -> usize {
        self.aggregate_count
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Fresh, all-NULL parameter slots sized for this query.
    pub fn new_params(&self) -> Params {
        Params::new(self.param_count)
    }

    /// True for a SELECT whose list is computed over all rows at once.
    pub fn is_aggregate(&self) -> bool {
        match &self.kind {
            QueryKind::Select { items, .. } => items.iter().any(|item| match item {
                SelectItem::Expr { expr, .. } => expr.contains_aggregate(),
                SelectItem::Wildcard { .. } => false,
            }),
            QueryKind::Insert { .. } => false,
        }
    }

    /// Binds every expression. Calling it again is a no-op.
    pub fn bind(&mut self) -> Result<()> {
        if self.bound {
            return Ok(());
        }
        let from = &self.from_items;

        match &mut self.kind {
            QueryKind::Select { items, filter } => {
                let mut bound = Vec::with_capacity(items.len());
                for item in mem::take(items) {
                    match item {
                        SelectItem::Wildcard { qualifier } => {
                            bound.extend(expand_wildcard(qualifier.as_deref(), from)?)
                        }
                        SelectItem::Expr { expr, alias } => bound.push(SelectItem::Expr {
                            expr: expr.bind(from)?,
                            alias,
                        }),
                    }
                }
                *items = bound;

                if let Some(f) = filter.take() {
                    let f = f.bind(from)?;
                    if f.contains_aggregate() {
                        return Err(DbError::Bind(format!("aggregate in WHERE clause {f}")));
                    }
                    *filter = Some(f);
                }

                let exprs = items.iter().filter_map(|item| match item {
                    SelectItem::Expr { expr, .. } => Some(expr),
                    SelectItem::Wildcard { .. } => None,
                });
                let (mut aggregate, mut bare) = (false, false);
                for e in exprs {
                    aggregate |= e.contains_aggregate();
                    bare |= e.has_bare_column();
                }
                if aggregate && bare {
                    return Err(DbError::Bind(
                        "aggregate mixed with bare columns without GROUP BY".to_string(),
                    ));
                }
            }
            QueryKind::Insert { columns, targets, rows } => {
                let table = from
                    .first()
                    .map(FromItem::table)
                    .ok_or_else(|| DbError::Bind("INSERT without a table".to_string()))?;
                *targets = insert_targets(table, columns.as_deref())?;

                for row in rows.iter_mut() {
                    if row.len() != targets.len() {
                        return Err(DbError::Bind(format!(
                            "INSERT into {} has {} columns but {} values",
                            table.name(),
                            targets.len(),
                            row.len()
                        )));
                    }
                    for value in row.iter_mut() {
                        let e = mem::replace(value, Expr::Literal(Value::Null)).bind(&[])?;
                        if e.contains_aggregate() {
                            return Err(DbError::Bind(format!("aggregate in VALUES: {e}")));
                        }
                        *value = e;
                    }
                }
            }
        }

        self.bound = true;
        debug!(sql = %self.sql, "query bound");
        Ok(())
    }

    /// Order in which to nest the FROM items: greedily pick the item that
    /// adds the least WHERE cost given the items already chosen.
    pub fn join_order(&self) -> Vec<usize> {
        let filter = match &self.kind {
            QueryKind::Select { filter, .. } => filter.as_ref(),
            QueryKind::Insert { .. } => None,
        };
        let mut order: Vec<usize> = Vec::with_capacity(self.from_items.len());
        let mut remaining: Vec<usize> = (0..self.from_items.len()).collect();

        while !remaining.is_empty() {
            let mut best = 0;
            let mut best_cost = u64::MAX;
            for (i, item) in remaining.iter().enumerate() {
                order.push(*item);
                let cost = filter.map_or(0, |f| f.sub_cost(&order));
                order.pop();
                if cost < best_cost {
                    best = i;
                    best_cost = cost;
                }
            }
            order.push(remaining.remove(best));
        }
        order
    }

    /// Output column names of a SELECT.
    pub fn column_names(&self) -> Vec<String> {
        match &self.kind {
            QueryKind::Select { items, .. } => items
                .iter()
                .map(|item| match item {
                    SelectItem::Expr { alias: Some(a), .. } => a.clone(),
                    SelectItem::Expr { expr: Expr::Column { name, .. }, .. } => {
                        name.rsplit('.').next().unwrap_or(name).to_string()
                    }
                    SelectItem::Expr { expr, .. } => expr.to_string(),
                    SelectItem::Wildcard { qualifier: Some(q) } => format!("{q}.*"),
                    SelectItem::Wildcard { qualifier: None } => "*".to_string(),
                })
                .collect(),
            QueryKind::Insert { .. } => Vec::new(),
        }
    }

    /// Runs the bound query with the given parameter values.
    pub fn execute(&self, db: &Database, params: &Params) -> Result<QueryResult> {
        if !self.bound {
            return Err(DbError::Bind(format!("query is not bound: {}", self.sql)));
        }
        executor::execute(db, self, params)
    }
}

fn expand_wildcard(qualifier: Option<&str>, from: &[FromItem]) -> Result<Vec<SelectItem>> {
    let mut out = Vec::new();
    for (item, from_item) in from.iter().enumerate() {
        if let Some(q) = qualifier {
            if !from_item.alias().eq_ignore_ascii_case(q) {
                continue;
            }
        }
        for (column, col) in from_item.table().columns().iter().enumerate() {
            out.push(SelectItem::Expr {
                expr: Expr::Column {
                    item,
                    column,
                    ty: col.col_type.into(),
                    name: format!("{}.{}", from_item.alias(), col.name),
                },
                alias: Some(col.name.clone()),
            });
        }
    }
    if out.is_empty() {
        return Err(DbError::Bind(match qualifier {
            Some(q) => format!("unknown table '{q}' in {q}.*"),
            None => "SELECT * without FROM".to_string(),
        }));
    }
    Ok(out)
}

fn insert_targets(table: &Table, columns: Option<&[String]>) -> Result<Vec<usize>> {
    let Some(columns) = columns else {
        return Ok((0..table.columns().len()).collect());
    };
    let mut seen = HashSet::new();
    columns
        .iter()
        .map(|name| {
            let index = table
                .schema()
                .column_index(name)
                .ok_or_else(|| DbError::Bind(format!("unknown column '{name}' in {}", table.name())))?;
            if !seen.insert(index) {
                return Err(DbError::Bind(format!("column '{name}' listed twice")));
            }
            Ok(index)
        })
        .collect()
}
