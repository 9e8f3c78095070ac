//! Database configuration.

/// Default number of ancestors reported for a revision.
pub const DEFAULT_MAX_HISTORY: usize = 20;

/// Configuration for opening a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Database name. Used as the path component of URL endpoints.
    pub name: String,
    /// Maximum number of revisions returned by history queries.
    pub max_history: usize,
}

impl DatabaseConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    /// Sets the history depth.
    #[must_use]
    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::new("db")
    }
}
