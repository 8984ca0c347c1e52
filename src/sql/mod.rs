//! SQL front end: tokenizing and parsing into a [`Query`], binding its
//! expressions against the FROM items, and the per-execution state
//! ([`Params`], [`QueryContext`]) expressions evaluate against.

pub mod context;
pub mod expr;
pub mod param;
pub mod parser;
pub mod query;

pub use context::QueryContext;
pub use expr::{AggregateFunc, ArithOp, CmpOp, Expr, ExprType, UNJOINED_COST};
pub use param::{Param, ParamStream, ParamValue, Params};
pub use parser::Parser;
pub use query::{FromItem, Query, QueryKind, SelectItem};
