//! Connection handles and the factory that dials them.

use std::time::{Duration, Instant};

use tidepool_core::{
    ConnectionError, ConnectionErrorKind, Error, PreparedStatement, Result, StatementCache,
};

use crate::config::{ConfigSource, Credentials};

/// Per-connection settings read from the pool configuration at dial time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleConfig {
    /// Prepared statements to cache on the new connection
    pub statements_cache_size: usize,
}

impl HandleConfig {
    /// Read the current settings from `source`.
    ///
    /// A failed read is reported as a `StatementCache` connection error
    /// wrapping the source's error.
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self> {
        let statements_cache_size = source.statements_cache_size().map_err(|e| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::StatementCache,
                message: format!("failed to read statement cache size: {e}"),
                source: Some(Box::new(e)),
            })
        })?;
        Ok(Self {
            statements_cache_size,
        })
    }
}

/// Builds driver connections for a pool.
///
/// Called from watcher threads without any partition lock held, so a slow
/// dial only delays the partition it belongs to.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The driver connection type.
    type Connection: Send + 'static;

    /// Open a new connection.
    fn connect(&self, credentials: &Credentials, config: &HandleConfig)
    -> Result<Self::Connection>;
}

impl<F, C> ConnectionFactory for F
where
    F: Fn(&Credentials, &HandleConfig) -> Result<C> + Send + Sync + 'static,
    C: Send + 'static,
{
    type Connection = C;

    fn connect(&self, credentials: &Credentials, config: &HandleConfig) -> Result<C> {
        self(credentials, config)
    }
}

/// A live connection owned by a partition.
#[derive(Debug)]
pub struct ConnectionHandle<C> {
    conn: C,
    statements: StatementCache,
    partition: usize,
    created_at: Instant,
}

impl<C> ConnectionHandle<C> {
    /// Dial a new connection and attach its statement cache.
    ///
    /// The configuration is read before dialing; a failed read fails the
    /// whole construction.
    pub fn open<F>(
        factory: &F,
        credentials: &Credentials,
        source: &dyn ConfigSource,
        partition: usize,
    ) -> Result<Self>
    where
        F: ConnectionFactory<Connection = C> + ?Sized,
    {
        let config = HandleConfig::from_source(source)?;
        let conn = factory.connect(credentials, &config)?;
        Ok(Self {
            conn,
            statements: StatementCache::new(config.statements_cache_size),
            partition,
            created_at: Instant::now(),
        })
    }

    /// Index of the partition this handle belongs to.
    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Time since the connection was opened.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    /// Look up a cached prepared statement.
    pub fn cached_statement(&mut self, sql: &str) -> Option<&PreparedStatement> {
        self.statements.get(sql)
    }

    /// Cache a prepared statement; returns whatever was evicted.
    pub fn cache_statement(&mut self, stmt: PreparedStatement) -> Option<PreparedStatement> {
        self.statements.insert(stmt)
    }

    pub fn statement_cache(&self) -> &StatementCache {
        &self.statements
    }

    /// Unwrap the driver connection, dropping the statement cache.
    pub fn into_inner(self) -> C {
        self.conn
    }
}
