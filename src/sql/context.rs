use super::expr::AggregateFunc;
use super::param::{Param, Params};
use crate::engine::value::{compare_values, Value};
use crate::error::{DbError, Result};

/// Running state of one aggregate over the rows of a query.
#[derive(Clone, Debug, Default)]
struct Accumulator {
    count: i64,
    long_sum: i64,
    double_sum: f64,
    saw_double: bool,
    best: Option<Value>,
}

impl Accumulator {
    /// `None` is a `COUNT(*)` row; NULL values are skipped by every
    /// aggregate.
    fn update(&mut self, func: AggregateFunc, value: Option<Value>) -> Result<()> {
        let value = match value {
            None => {
                self.count += 1;
                return Ok(());
            }
            Some(Value::Null) => return Ok(()),
            Some(v) => v,
        };
        self.count += 1;

        match func {
            AggregateFunc::Count => {}
            AggregateFunc::Sum | AggregateFunc::Avg => match value {
                Value::Long(v) => {
                    self.long_sum = self
                        .long_sum
                        .checked_add(v)
                        .ok_or_else(|| DbError::Eval(format!("{func} overflowed")))?;
                }
                other => {
                    self.double_sum += other.to_double()?.unwrap_or(0.0);
                    self.saw_double = true;
                }
            },
            AggregateFunc::Min | AggregateFunc::Max => {
                let replace = match &self.best {
                    None => true,
                    Some(best) => {
                        let ord = compare_values(&value, best);
                        if func == AggregateFunc::Min {
                            ord.is_lt()
                        } else {
                            ord.is_gt()
                        }
                    }
                };
                if replace {
                    self.best = Some(value);
                }
            }
        }
        Ok(())
    }

    fn result(&self, func: AggregateFunc) -> Value {
        match func {
            AggregateFunc::Count => Value::Long(self.count),
            _ if self.count == 0 => Value::Null,
            AggregateFunc::Sum if self.saw_double => {
                Value::Double(self.double_sum + self.long_sum as f64)
            }
            AggregateFunc::Sum => Value::Long(self.long_sum),
            AggregateFunc::Avg => {
                Value::Double((self.double_sum + self.long_sum as f64) / self.count as f64)
            }
            AggregateFunc::Min | AggregateFunc::Max => self.best.clone().unwrap_or(Value::Null),
        }
    }
}

/// Mutable state of one query execution: the parameter values, the row
/// currently selected from each FROM item, and aggregate accumulators.
///
/// Expressions never hold execution state themselves; every evaluation
/// call reads it from here.
pub struct QueryContext<'a> {
    params: &'a Params,
    tuple: Vec<Option<&'a [Value]>>,
    groups: Vec<Accumulator>,
}

impl<'a> QueryContext<'a> {
    pub fn new(params: &'a Params, items: usize, aggregates: usize) -> Self {
        Self {
            params,
            tuple: vec![None; items],
            groups: vec![Accumulator::default(); aggregates],
        }
    }

    pub fn params(&self) -> &Params {
        self.params
    }

    pub fn param(&self, index: usize) -> Result<&Param> {
        self.params.get(index)
    }

    /// Makes `row` the current row of FROM item `item`.
    pub fn set_row(&mut self, item: usize, row: &'a [Value]) {
        self.tuple[item] = Some(row);
    }

    pub fn clear_row(&mut self, item: usize) {
        self.tuple[item] = None;
    }

    /// Value of `column` in the current row of `item`.
    pub fn column(&self, item: usize, column: usize) -> Result<&Value> {
        self.tuple
            .get(item)
            .copied()
            .flatten()
            .and_then(|row| row.get(column))
            .ok_or_else(|| DbError::Eval(format!("no current row for column {item}.{column}")))
    }

    pub fn accumulate(&mut self, slot: usize, func: AggregateFunc, value: Option<Value>) -> Result<()> {
        self.groups
            .get_mut(slot)
            .ok_or_else(|| DbError::Eval(format!("aggregate slot {slot} out of range")))?
            .update(func, value)
    }

    pub fn aggregate(&self, slot: usize, func: AggregateFunc) -> Result<Value> {
        self.groups
            .get(slot)
            .map(|acc| acc.result(func))
            .ok_or_else(|| DbError::Eval(format!("aggregate slot {slot} out of range")))
    }
}
