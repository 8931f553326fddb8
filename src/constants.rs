/// Constants used by the rate allocator.
pub mod allocator {
    /// Default maximum sampling rate for any stratum.
    pub const DEFAULT_SAMPLE_CAP: f64 = 1.0;
    /// Default stopping tolerance as a fraction of the target total.
    pub const DEFAULT_TOLERANCE: f64 = 0.01;
    /// Default bound on redistribution rounds.
    pub const DEFAULT_MAX_ITERATIONS: usize = 5;
    /// Largest target total whose arithmetic stays exact in `f64`.
    pub const MAX_EXACT_TARGET: u64 = 1 << 53;
    /// Slack added before flooring accumulated captures to absorb float noise.
    pub const CAPTURE_EPSILON: f64 = 1e-9;
}

/// Constants used by stratum-table rendering.
pub mod report {
    /// Column gutter width.
    pub const COLUMN_SPACES: usize = 4;
    /// Rows shown at the head and again at the tail of a long table.
    pub const MAX_SHOW: usize = 10;
    /// Header label for the count column.
    pub const COUNT_HEADER: &str = "Count";
    /// Rendering format for date-valued keys.
    pub const DATE_FORMAT: &str = "%Y-%m-%d";
}

/// Constants used by persisted stratum tables.
pub mod store {
    /// Column name holding the stratum count.
    pub const COUNT_COLUMN: &str = "count";
    /// Column name holding the assigned sampling rate.
    pub const RATE_COLUMN: &str = "sampleRate";
    /// Key prefix for persisted stratum tables.
    pub const TABLE_PREFIX: &[u8] = b"stratum_table:";
    /// Version tag for persisted stratum-table records.
    pub const TABLE_RECORD_VERSION: u8 = 1;
    /// Prefix marker for bitcode-encoded payloads.
    pub const BITCODE_PREFIX: u8 = b'B';
    /// Default directory for persisted stratum-store files.
    pub const DEFAULT_STORE_DIR: &str = ".strata_store";
    /// Default filename for persisted stratum-store files.
    pub const DEFAULT_STORE_FILENAME: &str = "strata_store.bin";
}

/// Constants used by the built-in data sources.
pub mod source {
    /// Identifier reported by the in-memory source unless overridden.
    pub const IN_MEMORY_SOURCE_ID: &str = "memory";
    /// Default RNG seed for per-row sampling draws.
    pub const DEFAULT_SAMPLE_SEED: u64 = 1001;
}
