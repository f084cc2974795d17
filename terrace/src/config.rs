//! Production tuning knobs.

/// Sizing configuration for one production run
#[derive(Debug, Clone)]
pub struct ProductionConfig {
    /// Rows per serialized row group
    pub rows_per_group: usize,
    /// Row groups buffered in memory before an external sort batch spills
    pub groups_per_batch: usize,
}

impl Default for ProductionConfig {
    fn default() -> Self {
        Self {
            rows_per_group: 100_000,
            groups_per_batch: 20, // 2M rows per in-memory sort batch
        }
    }
}

impl ProductionConfig {
    /// In-memory capacity of one external-sort batch.
    pub fn batch_capacity(&self) -> usize {
        self.rows_per_group * self.groups_per_batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_batch_capacity() {
        let cfg = ProductionConfig::default();
        assert_eq!(cfg.batch_capacity(), 2_000_000);
    }
}
