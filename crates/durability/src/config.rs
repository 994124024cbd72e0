//! Transaction-log configuration.

/// How aggressively appended entries are made durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// fsync after every append.
    Strict,
    /// fsync when a batch fills or an interval elapses.
    Batched {
        /// Max milliseconds between fsyncs.
        interval_ms: u64,
        /// Max appends between fsyncs.
        batch_size: usize,
    },
    /// No fsync; durability is the OS's problem. For tests.
    None,
}

/// Tuning for a [`crate::FileTransLog`].
#[derive(Debug, Clone)]
pub struct TransLogConfig {
    /// Rotate to a new segment when the current one exceeds this size.
    pub segment_size: u64,
    /// Durability mode for appends.
    pub durability: DurabilityMode,
}

impl Default for TransLogConfig {
    fn default() -> Self {
        TransLogConfig {
            segment_size: 64 * 1024 * 1024,
            durability: DurabilityMode::Batched {
                interval_ms: 100,
                batch_size: 128,
            },
        }
    }
}

impl TransLogConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the segment size.
    pub fn with_segment_size(mut self, bytes: u64) -> Self {
        self.segment_size = bytes;
        self
    }

    /// Override the durability mode.
    pub fn with_durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    /// Small segments, no fsync: fast and file-backed for tests.
    pub fn for_testing() -> Self {
        TransLogConfig {
            segment_size: 4 * 1024,
            durability: DurabilityMode::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let config = TransLogConfig::new()
            .with_segment_size(1024)
            .with_durability(DurabilityMode::Strict);
        assert_eq!(config.segment_size, 1024);
        assert_eq!(config.durability, DurabilityMode::Strict);
    }
}
