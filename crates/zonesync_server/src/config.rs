//! Server configuration.

/// Configuration for the reference zone server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Largest save or delete batch the server accepts.
    pub max_batch_size: usize,
    /// Upper bound on the page size of a change-feed fetch.
    pub max_fetch_limit: u32,
}

impl ServerConfig {
    /// Creates a configuration with the default limits.
    pub fn new() -> Self {
        Self {
            max_batch_size: 400,
            max_fetch_limit: 1000,
        }
    }

    /// Sets the maximum batch size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Sets the maximum fetch page size.
    pub fn with_max_fetch_limit(mut self, limit: u32) -> Self {
        self.max_fetch_limit = limit;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
