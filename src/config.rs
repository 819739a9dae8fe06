/// Configuration for a standalone journal.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Size of the metadata row that accompanies each user page
    /// (default: 132). Independent of the underlying page size.
    pub meta_size: usize,

    /// Size of the cookie, a caller-owned payload checkpointed with every
    /// journal header (default: 4).
    pub cookie_size: usize,

    /// How many replacement blocks to try when a block fails or garbage
    /// is encountered before giving up (default: 8).
    pub max_retries: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            meta_size: 132,
            cookie_size: 4,
            max_retries: 8,
        }
    }
}

impl JournalConfig {
    /// Set the per-page metadata size.
    pub fn meta_size(mut self, size: usize) -> Self {
        self.meta_size = size;
        self
    }

    /// Set the cookie size.
    pub fn cookie_size(mut self, size: usize) -> Self {
        self.cookie_size = size;
        self
    }

    /// Set the retry budget.
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }
}

/// Configuration for a sector map.
#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Garbage collection ratio: collection steps per user write while
    /// the journal is at capacity (default: 4). Smaller values give
    /// faster, more predictable writes at the expense of capacity.
    /// Always open a given chip with the same ratio it was written with.
    pub gc_ratio: u8,

    /// Cookie size for the underlying journal (default: 4). The map
    /// keeps its sector count in the first four bytes, so values below
    /// four are rounded up.
    pub cookie_size: usize,

    /// Retry budget for the underlying journal (default: 8).
    pub max_retries: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            gc_ratio: 4,
            cookie_size: 4,
            max_retries: 8,
        }
    }
}

impl MapConfig {
    /// Set the garbage collection ratio. A ratio of zero is treated as one.
    pub fn gc_ratio(mut self, ratio: u8) -> Self {
        self.gc_ratio = ratio;
        self
    }

    /// Set the cookie size.
    pub fn cookie_size(mut self, size: usize) -> Self {
        self.cookie_size = size;
        self
    }

    /// Set the retry budget.
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_defaults() {
        let config = JournalConfig::default();
        assert_eq!(config.meta_size, 132);
        assert_eq!(config.cookie_size, 4);
        assert_eq!(config.max_retries, 8);
    }

    #[test]
    fn test_map_builder() {
        let config = MapConfig::default().gc_ratio(2).max_retries(4);
        assert_eq!(config.gc_ratio, 2);
        assert_eq!(config.cookie_size, 4);
        assert_eq!(config.max_retries, 4);
    }
}
