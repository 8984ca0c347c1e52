//! # rust_block_db - An embedded block-structured table store
//!
//! Tables live one per file under a database directory. Every file is a
//! sequence of fixed-size blocks cached by a shared, bounded LRU
//! [`BlockManager`](engine::BlockManager); a small SQL layer parses
//! SELECT/INSERT statements into bound expression trees and evaluates them
//! with three-valued logic.
//!
//! ## Architecture Overview
//!
//! 1. **Engine Layer** (`engine` module): block cache, block files,
//!    tables, timed locks, and the [`Database`](engine::Database) registry
//! 2. **SQL Layer** (`sql` module): parser, queries, expressions, parameters
//!
//! ## Usage Example
//!
//! ```text
//! let db = Database::open(DatabaseConfig::new("./dbdata"))?;
//! let mut factory = db.create_table_factory();
//! factory.start_table("users");
//! factory.add_column("id", ColumnType::BigInt)?;
//! factory.add_column("name", ColumnType::Varchar(32))?;
//! db.add_table(factory.create()?)?;
//!
//! db.execute("INSERT INTO users VALUES (?, ?)", &[1i64.into(), "Ada".into()])?;
//! let result = db.execute("SELECT name FROM users WHERE id = 1", &[])?;
//! ```

/// Database configuration loaded from JSON or built in code
pub mod config;

/// Storage engine: block cache, stores, tables, and the table registry
pub mod engine;

/// Error type shared by every layer
pub mod error;

/// SQL parsing, binding, and expression evaluation
pub mod sql;

pub use config::DatabaseConfig;
pub use engine::{Database, QueryResult, ResultSet, Value};
pub use error::{DbError, Result};
