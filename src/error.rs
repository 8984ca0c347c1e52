use sqlparser::tokenizer::TokenizerError;
use thiserror::Error;

/// Every failure the engine reports to its callers.
///
/// The variants follow the failure classes of the engine: storage I/O,
/// DDL mistakes, compile-time (parse/bind) errors, lock timeouts and
/// evaluation/conversion errors. Nothing in the engine retries on any of
/// them; retry policy belongs to the caller.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("header encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("config decode error: {0}")]
    Config(#[from] serde_json::Error),
    #[error("SQL tokenizer error: {0}")]
    Tokenize(#[from] TokenizerError),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("can't cope: {0}")]
    Bind(String),
    #[error("conversion error: {0}")]
    Conversion(String),
    #[error("evaluation error: {0}")]
    Eval(String),
    #[error("table '{0}' does not exist")]
    TableNotFound(String),
    #[error("table '{0}' already exists.  CREATE can not override an existing table.")]
    TableExists(String),
    #[error("{lock} timed out ({waited_ms}ms) waiting for {mode} lock")]
    LockTimeout {
        lock: String,
        mode: &'static str,
        waited_ms: u64,
    },
    #[error("store {0} is closed")]
    Closed(String),
    #[error("corrupt table file {0}: {1}")]
    Corrupt(String, String),
    #[error("{0} is full")]
    Full(String),
    #[error("invalid block {block} for store {store}")]
    InvalidBlock { store: String, block: u64 },
    #[error("schema error: {0}")]
    Schema(String),
    #[error("parameter ?{0} is out of range")]
    ParamIndex(usize),
    #[error("failed to load table '{table}': {source}")]
    Load {
        table: String,
        #[source]
        source: Box<DbError>,
    },
}

impl DbError {
    /// Lock timeouts leave the surrounding transaction in an unknown state.
    /// The caller has to mark it rollback-only instead of retrying.
    pub fn is_rollback_only(&self) -> bool {
        matches!(self, DbError::LockTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lock_timeouts_are_rollback_only() {
        let timeout = DbError::LockTimeout {
            lock: "Lock[database]".to_string(),
            mode: "write",
            waited_ms: 1000,
        };
        assert!(timeout.is_rollback_only());
        assert!(!DbError::TableNotFound("t".to_string()).is_rollback_only());
    }

    #[test]
    fn load_error_keeps_the_cause() {
        let err = DbError::Load {
            table: "users".to_string(),
            source: Box::new(DbError::Corrupt("users.db".into(), "bad magic".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("users"));
        assert!(msg.contains("bad magic"));
    }
}
