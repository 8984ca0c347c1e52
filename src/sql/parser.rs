use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer, Word};
use tracing::debug;

use super::expr::{AggregateFunc, ArithOp, CmpOp, Expr};
use super::query::{FromItem, Query, QueryKind, SelectItem};
use crate::engine::value::Value;
use crate::engine::Database;
use crate::error::{DbError, Result};

/// Single-pass recursive-descent parser producing an unbound [`Query`].
///
/// ## Grammar
/// ```text
/// statement  := select | insert [';']
/// select     := SELECT item (',' item)* [FROM table [[AS] alias] (',' ...)*] [WHERE expr]
/// item       := '*' | name '.' '*' | expr [[AS] alias]
/// insert     := INSERT INTO table ['(' name (',' name)* ')'] VALUES row (',' row)*
/// row        := '(' expr (',' expr)* ')'
/// expr       := and (OR and)*
/// and        := not (AND not)*
/// not        := NOT not | cmp
/// cmp        := sum [cmp_op sum | IS [NOT] NULL]
/// sum        := product (('+' | '-') product)*
/// product    := unary (('*' | '/' | '%') unary)*
/// unary      := '-' unary | primary
/// primary    := number | 'string' | ?[N] | NULL | TRUE | FALSE
///             | '(' expr ')' | aggregate '(' ['*' | expr] ')' | name ['.' name]
/// ```
///
/// Tokens come from `sqlparser`'s tokenizer with the generic dialect;
/// whitespace and comments are dropped before parsing.
pub struct Parser<'a> {
    db: &'a Database,
    sql: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    next_param: usize,
    max_param: usize,
    aggregates: usize,
}

impl<'a> Parser<'a> {
    /// Parses `sql` against the tables of `db`.
    pub fn parse(db: &'a Database, sql: &'a str) -> Result<Query> {
        let dialect = GenericDialect {};
        let tokens = Tokenizer::new(&dialect, sql)
            .tokenize()?
            .into_iter()
            .filter(|t| !matches!(t, Token::Whitespace(_)))
            .collect();

        let mut parser = Parser {
            db,
            sql,
            tokens,
            pos: 0,
            next_param: 0,
            max_param: 0,
            aggregates: 0,
        };
        let query = parser.parse_statement()?;
        debug!(sql, params = query.param_count(), "query parsed");
        Ok(query)
    }

    fn parse_statement(&mut self) -> Result<Query> {
        let query = if self.parse_keyword(Keyword::SELECT) {
            self.parse_select()?
        } else if self.parse_keyword(Keyword::INSERT) {
            self.parse_insert()?
        } else {
            return Err(self.expected("SELECT or INSERT"));
        };

        self.consume(&Token::SemiColon);
        if let Some(t) = self.peek() {
            return Err(DbError::Parse(format!("unexpected '{t}' after end of statement")));
        }
        Ok(query)
    }

    fn parse_select(&mut self) -> Result<Query> {
        let mut items = Vec::new();
        loop {
            items.push(self.parse_select_item()?);
            if !self.consume(&Token::Comma) {
                break;
            }
        }

        let mut from_items = Vec::new();
        if self.parse_keyword(Keyword::FROM) {
            loop {
                from_items.push(self.parse_from_item()?);
                if !self.consume(&Token::Comma) {
                    break;
                }
            }
        }

        let filter = if self.parse_keyword(Keyword::WHERE) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        Ok(Query::new(
            self.sql,
            from_items,
            QueryKind::Select { items, filter },
            self.max_param,
            self.aggregates,
        ))
    }

    fn parse_select_item(&mut self) -> Result<SelectItem> {
        if self.consume(&Token::Mul) {
            return Ok(SelectItem::Wildcard { qualifier: None });
        }
        if let (Some(Token::Word(w)), Some(Token::Period), Some(Token::Mul)) =
            (self.peek_at(0), self.peek_at(1), self.peek_at(2))
        {
            let qualifier = w.value.clone();
            self.pos += 3;
            return Ok(SelectItem::Wildcard { qualifier: Some(qualifier) });
        }

        let expr = self.parse_expr()?;
        let alias = self.parse_alias()?;
        Ok(SelectItem::Expr { expr, alias })
    }

    fn parse_alias(&mut self) -> Result<Option<String>> {
        if self.parse_keyword(Keyword::AS) {
            return self.parse_identifier().map(Some);
        }
        match self.peek() {
            Some(Token::Word(w)) if w.keyword == Keyword::NoKeyword || w.quote_style.is_some() => {
                let alias = w.value.clone();
                self.pos += 1;
                Ok(Some(alias))
            }
            _ => Ok(None),
        }
    }

    fn parse_from_item(&mut self) -> Result<FromItem> {
        let name = self.parse_identifier()?;
        let table = self
            .db
            .get_table(&name)
            .ok_or_else(|| DbError::TableNotFound(name.clone()))?;
        let alias = self.parse_alias()?;
        Ok(FromItem::new(table, alias))
    }

    fn parse_insert(&mut self) -> Result<Query> {
        if !self.parse_keyword(Keyword::INTO) {
            return Err(self.expected("INTO"));
        }
        let name = self.parse_identifier()?;
        let table = self
            .db
            .get_table(&name)
            .ok_or_else(|| DbError::TableNotFound(name.clone()))?;

        let columns = if self.consume(&Token::LParen) {
            let mut columns = Vec::new();
            loop {
                columns.push(self.parse_identifier()?);
                if !self.consume(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
            Some(columns)
        } else {
            None
        };

        if !self.parse_keyword(Keyword::VALUES) {
            return Err(self.expected("VALUES"));
        }
        let mut rows = Vec::new();
        loop {
            self.expect(&Token::LParen)?;
            let mut row = Vec::new();
            loop {
                row.push(self.parse_expr()?);
                if !self.consume(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
            rows.push(row);
            if !self.consume(&Token::Comma) {
                break;
            }
        }

        Ok(Query::new(
            self.sql,
            vec![FromItem::new(table, None)],
            QueryKind::Insert {
                columns,
                targets: Vec::new(),
                rows,
            },
            self.max_param,
            self.aggregates,
        ))
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.parse_keyword(Keyword::OR) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.parse_keyword(Keyword::AND) {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.parse_keyword(Keyword::NOT) {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let left = self.parse_sum()?;

        if self.parse_keyword(Keyword::IS) {
            let negated = self.parse_keyword(Keyword::NOT);
            if !self.parse_keyword(Keyword::NULL) {
                return Err(self.expected("NULL"));
            }
            return Ok(Expr::IsNull {
                expr: Box::new(left),
                negated,
            });
        }

        let op = match self.peek() {
            Some(Token::Eq) | Some(Token::DoubleEq) => CmpOp::Eq,
            Some(Token::Neq) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::LtEq) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::GtEq) => CmpOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_sum()?;
        Ok(Expr::cmp(op, left, right))
    }

    fn parse_sum(&mut self) -> Result<Expr> {
        let mut left = self.parse_product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_product()?;
            left = Expr::binary(op, left, right);
        }
    }

    fn parse_product(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Mul) => ArithOp::Mul,
                Some(Token::Div) => ArithOp::Div,
                Some(Token::Mod) => ArithOp::Mod,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::binary(op, left, right);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.consume(&Token::Minus) {
            return Ok(match self.parse_unary()? {
                Expr::Literal(Value::Long(v)) => Expr::Literal(Value::Long(-v)),
                Expr::Literal(Value::Double(v)) => Expr::Literal(Value::Double(-v)),
                e => Expr::binary(ArithOp::Sub, Expr::Literal(Value::Long(0)), e),
            });
        }
        if self.consume(&Token::Plus) {
            return self.parse_unary();
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self.next_token().ok_or_else(|| self.expected("an expression"))?;
        match token {
            Token::Number(n, _) => parse_number(&n),
            Token::SingleQuotedString(s) => Ok(Expr::Literal(Value::Text(s))),
            Token::Placeholder(p) => self.parse_param(&p),
            Token::LParen => {
                let e = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(e)
            }
            Token::Word(w) => self.parse_word(w),
            other => Err(DbError::Parse(format!("unexpected '{other}' in expression"))),
        }
    }

    fn parse_word(&mut self, w: Word) -> Result<Expr> {
        if w.quote_style.is_none() {
            match w.keyword {
                Keyword::NULL => return Ok(Expr::Literal(Value::Null)),
                Keyword::TRUE => return Ok(Expr::Literal(Value::Boolean(true))),
                Keyword::FALSE => return Ok(Expr::Literal(Value::Boolean(false))),
                Keyword::SELECT
                | Keyword::FROM
                | Keyword::WHERE
                | Keyword::AND
                | Keyword::OR
                | Keyword::AS
                | Keyword::IS
                | Keyword::INSERT
                | Keyword::INTO
                | Keyword::VALUES => {
                    return Err(DbError::Parse(format!("unexpected keyword {} in expression", w.value)))
                }
                _ => {}
            }
            if let Some(func) = AggregateFunc::from_name(&w.value) {
                if self.consume(&Token::LParen) {
                    return self.parse_aggregate(func);
                }
            }
        }

        if self.consume(&Token::Period) {
            let name = self.parse_identifier()?;
            return Ok(Expr::Identifier {
                qualifier: Some(w.value),
                name,
            });
        }
        Ok(Expr::Identifier {
            qualifier: None,
            name: w.value,
        })
    }

    fn parse_aggregate(&mut self, func: AggregateFunc) -> Result<Expr> {
        let arg = if func == AggregateFunc::Count && self.consume(&Token::Mul) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        self.expect(&Token::RParen)?;

        let slot = self.aggregates;
        self.aggregates += 1;
        Ok(Expr::Aggregate { func, arg, slot })
    }

    /// `?` takes the next sequential index, `?N` names one explicitly.
    fn parse_param(&mut self, placeholder: &str) -> Result<Expr> {
        let digits = placeholder
            .strip_prefix('?')
            .ok_or_else(|| DbError::Parse(format!("unsupported placeholder '{placeholder}'")))?;
        let index = if digits.is_empty() {
            self.next_param + 1
        } else {
            digits
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| DbError::Parse(format!("bad parameter '{placeholder}'")))?
        };
        self.next_param = index;
        self.max_param = self.max_param.max(index);
        Ok(Expr::Param { index })
    }

    fn parse_identifier(&mut self) -> Result<String> {
        match self.next_token() {
            Some(Token::Word(w)) => Ok(w.value),
            Some(other) => Err(DbError::Parse(format!("expected an identifier, found '{other}'"))),
            None => Err(self.expected("an identifier")),
        }
    }

    fn parse_keyword(&mut self, keyword: Keyword) -> bool {
        match self.peek() {
            Some(Token::Word(w)) if w.keyword == keyword && w.quote_style.is_none() => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.peek_at(0)
    }

    fn peek_at(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n).filter(|t| **t != Token::EOF)
    }

    fn next_token(&mut self) -> Option<Token> {
        let token = self.peek().cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn consume(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<()> {
        if self.consume(token) {
            Ok(())
        } else {
            Err(self.expected(&format!("'{token}'")))
        }
    }

    fn expected(&self, what: &str) -> DbError {
        match self.peek() {
            Some(t) => DbError::Parse(format!("expected {what}, found '{t}'")),
            None => DbError::Parse(format!("expected {what}, found end of statement")),
        }
    }
}

fn parse_number(text: &str) -> Result<Expr> {
    if let Ok(v) = text.parse::<i64>() {
        return Ok(Expr::Literal(Value::Long(v)));
    }
    text.parse::<f64>()
        .map(|v| Expr::Literal(Value::Double(v)))
        .map_err(|_| DbError::Parse(format!("bad number '{text}'")))
}
