use sqlx::PgPool;
use std::str::FromStr;

use armada_core::{Error, Result};

/// Single source of truth for all core state. Cheap to clone; the pool is
/// reference-counted.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: PgPool,
}

impl Store {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &PgPool {
        &self.db
    }
}

/// Parse a TEXT state column into its enum, surfacing schema drift as an
/// internal error rather than a panic.
pub(crate) fn parse_state<T>(column: &str, s: &str) -> Result<T>
where
    T: FromStr<Err = String>,
{
    s.parse()
        .map_err(|e| Error::Internal(format!("invalid {column} in database: {e}")))
}

pub(crate) fn parse_state_opt<T>(column: &str, s: Option<&str>) -> Result<Option<T>>
where
    T: FromStr<Err = String>,
{
    s.map(|s| parse_state(column, s)).transpose()
}

/// The effective limit for a list query: `-1` selects all rows.
pub(crate) fn effective_limit(limit: i64) -> Option<i64> {
    if limit < 0 {
        None
    } else {
        Some(limit)
    }
}
