//! Prepared statements and the per-connection statement cache.
//!
//! Every pooled connection carries a [`StatementCache`] sized from the pool
//! configuration. A capacity of zero disables caching.

use std::collections::{HashMap, VecDeque};

/// A prepared statement for repeated execution.
///
/// Prepared statements are pre-compiled by the database. Drivers hand them
/// back to the pool so later borrowers of the same connection can reuse them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    /// Unique identifier for this prepared statement (driver-specific)
    id: u64,
    /// The original SQL text
    sql: String,
    /// Number of expected parameters
    param_count: usize,
}

impl PreparedStatement {
    /// Create a new prepared statement.
    ///
    /// This is typically called by the driver, not by users directly.
    #[must_use]
    pub fn new(id: u64, sql: impl Into<String>, param_count: usize) -> Self {
        Self {
            id,
            sql: sql.into(),
            param_count,
        }
    }

    /// Get the statement ID.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Get the original SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Get the expected number of parameters.
    #[must_use]
    pub const fn param_count(&self) -> usize {
        self.param_count
    }
}

/// Bounded cache of prepared statements keyed by SQL text.
///
/// Eviction is least-recently-used: `get` refreshes an entry, `insert` of a
/// new key beyond capacity drops the oldest one.
#[derive(Debug, Default)]
pub struct StatementCache {
    capacity: usize,
    entries: HashMap<String, PreparedStatement>,
    order: VecDeque<String>,
}

impl StatementCache {
    /// Create a cache holding at most `capacity` statements.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Maximum number of cached statements.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether caching is enabled at all.
    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a statement and mark it as recently used.
    pub fn get(&mut self, sql: &str) -> Option<&PreparedStatement> {
        if !self.entries.contains_key(sql) {
            return None;
        }
        self.touch(sql);
        self.entries.get(sql)
    }

    /// Cache a statement, returning the entry evicted to make room, if any.
    pub fn insert(&mut self, stmt: PreparedStatement) -> Option<PreparedStatement> {
        if !self.is_enabled() {
            return Some(stmt);
        }

        let key = stmt.sql().to_string();
        if self.entries.insert(key.clone(), stmt).is_some() {
            self.touch(&key);
            return None;
        }
        self.order.push_back(key);

        if self.order.len() > self.capacity {
            let oldest = self.order.pop_front()?;
            return self.entries.remove(&oldest);
        }
        None
    }

    /// Drop every cached statement.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn touch(&mut self, sql: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == sql) {
            if let Some(key) = self.order.remove(pos) {
                self.order.push_back(key);
            }
        }
    }
}
