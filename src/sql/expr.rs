use std::fmt;

use super::context::QueryContext;
use super::query::FromItem;
use crate::engine::catalog::ColumnType;
use crate::engine::value::{Truth, Value};
use crate::error::{DbError, Result};

/// Cost of a column whose table is not yet among the joined candidates.
pub const UNJOINED_COST: u64 = 1_000_000;

/// Static type of an expression, as far as bind can tell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExprType {
    /// Parameters and NULL literals; resolved only at execution
    Unknown,
    Boolean,
    Long,
    Double,
    String,
    Date,
}

impl From<ColumnType> for ExprType {
    fn from(ty: ColumnType) -> Self {
        match ty {
            ColumnType::Int | ColumnType::BigInt => ExprType::Long,
            ColumnType::Double => ExprType::Double,
            ColumnType::Varchar(_) => ExprType::String,
            ColumnType::Date => ExprType::Date,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithOp {
    fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        }
    }

    fn apply_long(self, l: i64, r: i64) -> Result<i64> {
        if r == 0 && matches!(self, ArithOp::Div | ArithOp::Mod) {
            return Err(DbError::Eval(format!("division by zero in {l} {} {r}", self.symbol())));
        }
        let v = match self {
            ArithOp::Add => l.checked_add(r),
            ArithOp::Sub => l.checked_sub(r),
            ArithOp::Mul => l.checked_mul(r),
            ArithOp::Div => l.checked_div(r),
            ArithOp::Mod => l.checked_rem(r),
        };
        v.ok_or_else(|| DbError::Eval(format!("integer overflow in {l} {} {r}", self.symbol())))
    }

    fn apply_double(self, l: f64, r: f64) -> f64 {
        match self {
            ArithOp::Add => l + r,
            ArithOp::Sub => l - r,
            ArithOp::Mul => l * r,
            ArithOp::Div => l / r,
            ArithOp::Mod => l % r,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }

    pub fn is_ordering(self) -> bool {
        !matches!(self, CmpOp::Eq | CmpOp::Ne)
    }

    fn test_double(self, l: f64, r: f64) -> bool {
        match self {
            CmpOp::Eq => l == r,
            CmpOp::Ne => l != r,
            CmpOp::Lt => l < r,
            CmpOp::Le => l <= r,
            CmpOp::Gt => l > r,
            CmpOp::Ge => l >= r,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggregateFunc {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggregateFunc::Count),
            "SUM" => Some(AggregateFunc::Sum),
            "MIN" => Some(AggregateFunc::Min),
            "MAX" => Some(AggregateFunc::Max),
            "AVG" => Some(AggregateFunc::Avg),
            _ => None,
        }
    }
}

impl fmt::Display for AggregateFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
            AggregateFunc::Avg => "AVG",
        };
        f.write_str(name)
    }
}

/// An SQL expression node.
///
/// The parser produces the generic forms (`Identifier`, `Binary`, `Cmp`).
/// [`Expr::bind`] resolves column references and replaces each generic
/// node with its type-specialized variant:
///
/// ```text
/// Binary(op)  ── both operands LONG ──▶ BinaryLong(op)
///             └─ otherwise ───────────▶ BinaryDouble(op)
/// Cmp(< <= > >=)                      ─▶ DoubleCmp
/// Cmp(= <>) ── either operand DOUBLE ─▶ DoubleCmp
///           └─ otherwise ─────────────▶ Cmp (compares string forms)
/// ```
///
/// Binding an already bound tree returns an equal tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Positional parameter, 1-based
    Param { index: usize },
    /// Unresolved column reference, `name` or `qualifier.name`
    Identifier {
        qualifier: Option<String>,
        name: String,
    },
    /// Column `column` of FROM item `item`
    Column {
        item: usize,
        column: usize,
        ty: ExprType,
        name: String,
    },
    Binary {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    BinaryLong {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    BinaryDouble {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Cmp {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    DoubleCmp {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    /// `arg` is `None` for `COUNT(*)`; `slot` indexes the accumulator
    Aggregate {
        func: AggregateFunc,
        arg: Option<Box<Expr>>,
        slot: usize,
    },
}

impl Expr {
    pub fn binary(op: ArithOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn cmp(op: CmpOp, left: Expr, right: Expr) -> Expr {
        Expr::Cmp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Resolves columns against `from` and specializes the tree.
    pub fn bind(self, from: &[FromItem]) -> Result<Expr> {
        Ok(match self {
            Expr::Literal(_) | Expr::Param { .. } | Expr::Column { .. } => self,
            Expr::Identifier { qualifier, name } => resolve_column(qualifier.as_deref(), &name, from)?,

            Expr::Binary { op, left, right }
            | Expr::BinaryLong { op, left, right }
            | Expr::BinaryDouble { op, left, right } => {
                let left = left.bind(from)?;
                let right = right.bind(from)?;
                let (lt, rt) = (left.expr_type(), right.expr_type());
                for ty in [lt, rt] {
                    if ty == ExprType::Boolean {
                        return Err(DbError::Bind(format!(
                            "boolean operand in ({left} {} {right})",
                            op.symbol()
                        )));
                    }
                }
                let (left, right) = (Box::new(left), Box::new(right));
                if lt == ExprType::Long && rt == ExprType::Long {
                    Expr::BinaryLong { op, left, right }
                } else {
                    Expr::BinaryDouble { op, left, right }
                }
            }

            Expr::Cmp { op, left, right } | Expr::DoubleCmp { op, left, right } => {
                let left = Box::new(left.bind(from)?);
                let right = Box::new(right.bind(from)?);
                let is_double =
                    left.expr_type() == ExprType::Double || right.expr_type() == ExprType::Double;
                if op.is_ordering() || is_double {
                    Expr::DoubleCmp { op, left, right }
                } else {
                    Expr::Cmp { op, left, right }
                }
            }

            Expr::And(l, r) => Expr::And(Box::new(l.bind(from)?), Box::new(r.bind(from)?)),
            Expr::Or(l, r) => Expr::Or(Box::new(l.bind(from)?), Box::new(r.bind(from)?)),
            Expr::Not(e) => Expr::Not(Box::new(e.bind(from)?)),
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: Box::new(expr.bind(from)?),
                negated,
            },
            Expr::Aggregate { func, arg, slot } => {
                let arg = match arg {
                    Some(a) => {
                        let a = a.bind(from)?;
                        if a.contains_aggregate() {
                            return Err(DbError::Bind(format!("nested aggregate in {func}({a})")));
                        }
                        Some(Box::new(a))
                    }
                    None => None,
                };
                Expr::Aggregate { func, arg, slot }
            }
        })
    }

    /// Static result type. `Unknown` for parameters, NULL and unbound nodes.
    pub fn expr_type(&self) -> ExprType {
        match self {
            Expr::Literal(v) => match v {
                Value::Null => ExprType::Unknown,
                Value::Boolean(_) => ExprType::Boolean,
                Value::Long(_) => ExprType::Long,
                Value::Double(_) => ExprType::Double,
                Value::Text(_) => ExprType::String,
                Value::Date(_) => ExprType::Date,
            },
            Expr::Param { .. } | Expr::Identifier { .. } | Expr::Binary { .. } => ExprType::Unknown,
            Expr::Column { ty, .. } => *ty,
            Expr::BinaryLong { .. } => ExprType::Long,
            Expr::BinaryDouble { .. } => ExprType::Double,
            Expr::Cmp { .. }
            | Expr::DoubleCmp { .. }
            | Expr::And(..)
            | Expr::Or(..)
            | Expr::Not(_)
            | Expr::IsNull { .. } => ExprType::Boolean,
            Expr::Aggregate { func, arg, .. } => match func {
                AggregateFunc::Count => ExprType::Long,
                AggregateFunc::Avg => ExprType::Double,
                AggregateFunc::Sum => match arg.as_deref().map(Expr::expr_type) {
                    Some(ExprType::Long) => ExprType::Long,
                    _ => ExprType::Double,
                },
                AggregateFunc::Min | AggregateFunc::Max => {
                    arg.as_deref().map(Expr::expr_type).unwrap_or(ExprType::Unknown)
                }
            },
        }
    }

    fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Literal(_) | Expr::Param { .. } | Expr::Identifier { .. } | Expr::Column { .. } => {
                vec![]
            }
            Expr::Binary { left, right, .. }
            | Expr::BinaryLong { left, right, .. }
            | Expr::BinaryDouble { left, right, .. }
            | Expr::Cmp { left, right, .. }
            | Expr::DoubleCmp { left, right, .. }
            | Expr::And(left, right)
            | Expr::Or(left, right) => vec![left.as_ref(), right.as_ref()],
            Expr::Not(e) | Expr::IsNull { expr: e, .. } => vec![e.as_ref()],
            Expr::Aggregate { arg, .. } => arg.iter().map(|a| a.as_ref()).collect(),
        }
    }

    /// Additive cost of evaluating this tree when only the FROM items in
    /// `joined` have a current row.
    pub fn sub_cost(&self, joined: &[usize]) -> u64 {
        match self {
            Expr::Column { item, .. } if !joined.contains(item) => UNJOINED_COST,
            Expr::Identifier { .. } => UNJOINED_COST,
            _ => self.children().iter().map(|c| c.sub_cost(joined)).sum(),
        }
    }

    pub fn contains_aggregate(&self) -> bool {
        matches!(self, Expr::Aggregate { .. })
            || self.children().iter().any(|c| c.contains_aggregate())
    }

    /// True if the tree reads a column outside of any aggregate.
    pub fn has_bare_column(&self) -> bool {
        match self {
            Expr::Column { .. } | Expr::Identifier { .. } => true,
            Expr::Aggregate { .. } => false,
            _ => self.children().iter().any(|c| c.has_bare_column()),
        }
    }

    fn not_bound(&self) -> DbError {
        DbError::Eval(format!("{self} is not bound"))
    }

    pub fn eval_value(&self, ctx: &QueryContext<'_>) -> Result<Value> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Param { index } => ctx.param(*index)?.to_value(),
            Expr::Column { item, column, .. } => ctx.column(*item, *column).cloned(),
            Expr::BinaryLong { .. } => Ok(self.eval_long(ctx)?.map_or(Value::Null, Value::Long)),
            Expr::BinaryDouble { .. } => {
                Ok(self.eval_double(ctx)?.map_or(Value::Null, Value::Double))
            }
            Expr::Aggregate { func, slot, .. } => ctx.aggregate(*slot, *func),
            Expr::Identifier { .. } | Expr::Binary { .. } => Err(self.not_bound()),
            Expr::Cmp { .. }
            | Expr::DoubleCmp { .. }
            | Expr::And(..)
            | Expr::Or(..)
            | Expr::Not(_)
            | Expr::IsNull { .. } => Ok(match self.eval_truth(ctx)? {
                Truth::True => Value::Boolean(true),
                Truth::False => Value::Boolean(false),
                Truth::Unknown => Value::Null,
            }),
        }
    }

    /// Integer value, `None` for NULL.
    pub fn eval_long(&self, ctx: &QueryContext<'_>) -> Result<Option<i64>> {
        match self {
            Expr::Param { index } => {
                let p = ctx.param(*index)?;
                if p.is_null() {
                    Ok(None)
                } else {
                    p.eval_long().map(Some)
                }
            }
            Expr::BinaryLong { op, left, right } => {
                match (left.eval_long(ctx)?, right.eval_long(ctx)?) {
                    (Some(l), Some(r)) => op.apply_long(l, r).map(Some),
                    _ => Ok(None),
                }
            }
            Expr::BinaryDouble { .. } => Ok(self.eval_double(ctx)?.map(|d| d as i64)),
            _ => self.eval_value(ctx)?.to_long(),
        }
    }

    /// Floating value, `None` for NULL.
    pub fn eval_double(&self, ctx: &QueryContext<'_>) -> Result<Option<f64>> {
        match self {
            Expr::Param { index } => {
                let p = ctx.param(*index)?;
                if p.is_null() {
                    Ok(None)
                } else {
                    p.eval_double().map(Some)
                }
            }
            Expr::BinaryDouble { op, left, right } => {
                match (left.eval_double(ctx)?, right.eval_double(ctx)?) {
                    (Some(l), Some(r)) => Ok(Some(op.apply_double(l, r))),
                    _ => Ok(None),
                }
            }
            Expr::BinaryLong { .. } => Ok(self.eval_long(ctx)?.map(|v| v as f64)),
            _ => self.eval_value(ctx)?.to_double(),
        }
    }

    /// String form, `None` for NULL.
    pub fn eval_string(&self, ctx: &QueryContext<'_>) -> Result<Option<String>> {
        match self {
            Expr::Param { index } => ctx.param(*index)?.eval_string(),
            _ => Ok(self.eval_value(ctx)?.to_text()),
        }
    }

    /// Three-valued boolean evaluation.
    pub fn eval_truth(&self, ctx: &QueryContext<'_>) -> Result<Truth> {
        match self {
            Expr::Cmp { op, left, right } => {
                if op.is_ordering() {
                    return Err(self.not_bound());
                }
                let (l, r) = (left.eval_string(ctx)?, right.eval_string(ctx)?);
                Ok(match (l, r) {
                    (Some(l), Some(r)) => Truth::from_bool((l == r) == (*op == CmpOp::Eq)),
                    _ => Truth::Unknown,
                })
            }
            Expr::DoubleCmp { op, left, right } => {
                Ok(match (left.eval_double(ctx)?, right.eval_double(ctx)?) {
                    (Some(l), Some(r)) => Truth::from_bool(op.test_double(l, r)),
                    _ => Truth::Unknown,
                })
            }
            Expr::And(l, r) => {
                let left = l.eval_truth(ctx)?;
                if left == Truth::False {
                    return Ok(Truth::False);
                }
                Ok(left.and(r.eval_truth(ctx)?))
            }
            Expr::Or(l, r) => {
                let left = l.eval_truth(ctx)?;
                if left == Truth::True {
                    return Ok(Truth::True);
                }
                Ok(left.or(r.eval_truth(ctx)?))
            }
            Expr::Not(e) => Ok(e.eval_truth(ctx)?.not()),
            Expr::IsNull { expr, negated } => {
                let is_null = match expr.as_ref() {
                    Expr::Param { index } => ctx.param(*index)?.is_null(),
                    other => other.eval_value(ctx)?.is_null(),
                };
                Ok(Truth::from_bool(is_null != *negated))
            }
            Expr::Param { index } => ctx.param(*index)?.eval_boolean(),
            _ => self.eval_value(ctx)?.to_truth(),
        }
    }

    /// Feeds the current row into every aggregate in the tree.
    pub fn accumulate(&self, ctx: &mut QueryContext<'_>) -> Result<()> {
        if let Expr::Aggregate { func, arg, slot } = self {
            let value = match arg {
                Some(a) => Some(a.eval_value(ctx)?),
                None => None,
            };
            return ctx.accumulate(*slot, *func, value);
        }
        for child in self.children() {
            child.accumulate(ctx)?;
        }
        Ok(())
    }
}

fn resolve_column(qualifier: Option<&str>, name: &str, from: &[FromItem]) -> Result<Expr> {
    let mut found = None;
    for (item, from_item) in from.iter().enumerate() {
        if let Some(q) = qualifier {
            if !from_item.alias().eq_ignore_ascii_case(q) {
                continue;
            }
        }
        let schema = from_item.table().schema();
        if let Some(column) = schema.column_index(name) {
            if found.is_some() {
                return Err(DbError::Bind(format!("ambiguous column '{name}'")));
            }
            let col = &schema.columns[column];
            found = Some(Expr::Column {
                item,
                column,
                ty: col.col_type.into(),
                name: format!("{}.{}", from_item.alias(), col.name),
            });
        }
    }
    found.ok_or_else(|| match qualifier {
        Some(q) => DbError::Bind(format!("unknown column '{q}.{name}'")),
        None => DbError::Bind(format!("unknown column '{name}'")),
    })
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Param { index } => write!(f, "?{index}"),
            Expr::Identifier { qualifier: Some(q), name } => write!(f, "{q}.{name}"),
            Expr::Identifier { qualifier: None, name } => write!(f, "{name}"),
            Expr::Column { name, .. } => write!(f, "{name}"),
            Expr::Binary { op, left, right }
            | Expr::BinaryLong { op, left, right }
            | Expr::BinaryDouble { op, left, right } => {
                write!(f, "({left} {} {right})", op.symbol())
            }
            Expr::Cmp { op, left, right } | Expr::DoubleCmp { op, left, right } => {
                write!(f, "({left} {} {right})", op.symbol())
            }
            Expr::And(l, r) => write!(f, "({l} AND {r})"),
            Expr::Or(l, r) => write!(f, "({l} OR {r})"),
            Expr::Not(e) => write!(f, "NOT {e}"),
            Expr::IsNull { expr, negated: false } => write!(f, "({expr} IS NULL)"),
            Expr::IsNull { expr, negated: true } => write!(f, "({expr} IS NOT NULL)"),
            Expr::Aggregate { func, arg: None, .. } => write!(f, "{func}(*)"),
            Expr::Aggregate { func, arg: Some(a), .. } => write!(f, "{func}({a})"),
        }
    }
}
